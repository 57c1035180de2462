//! The browser-side HMR runtime, embedded as a string and served at
//! [`CLIENT_PATH`].
//!
//! Build-time constants are injected by string replacement before serving:
//! base URL, WebSocket protocol/host/port, ping timeout, and the
//! overlay-enable flag.

use crate::config::DevConfig;

/// URL the client runtime is served from.
pub const CLIENT_PATH: &str = "/@skerry/client";

/// Render the client runtime for the given config.
#[must_use]
pub fn client_code(config: &DevConfig) -> String {
    let hmr = &config.hmr;
    CLIENT_RUNTIME
        .replace("__BASE__", &config.base)
        .replace("__HMR_PROTOCOL__", &hmr.protocol)
        .replace("__HMR_HOSTNAME__", &hmr.hostname)
        .replace("__HMR_PORT__", &hmr.port.to_string())
        .replace("__HMR_TIMEOUT__", &hmr.timeout_ms.to_string())
        .replace("__HMR_ENABLE_OVERLAY__", if hmr.overlay { "true" } else { "false" })
}

const CLIENT_RUNTIME: &str = r#"
// skerry client runtime
const base = '__BASE__' || '/';
const hmrProtocol = '__HMR_PROTOCOL__';
const hmrHostname = '__HMR_HOSTNAME__';
const hmrPort = '__HMR_PORT__';
const hmrTimeout = __HMR_TIMEOUT__;
const enableOverlay = __HMR_ENABLE_OVERLAY__;

const socketProtocol = hmrProtocol || (location.protocol === 'https:' ? 'wss' : 'ws');
const socketHost = `${hmrHostname || location.hostname}:${hmrPort}`;
const socket = new WebSocket(`${socketProtocol}://${socketHost}`, 'vite-hmr');

const hotModulesMap = new Map();
const disposeMap = new Map();
const pruneMap = new Map();
const dataMap = new Map();
const customListenersMap = new Map();
const ctxToListenersMap = new Map();

let isFirstUpdate = true;

socket.addEventListener('message', async ({ data }) => {
  handleMessage(JSON.parse(data));
});

let pingInterval;

async function handleMessage(payload) {
  switch (payload.type) {
    case 'connected':
      console.debug('[skerry] connected.');
      // Keep the connection alive through proxies that drop idle sockets
      pingInterval = setInterval(() => {
        if (socket.readyState === socket.OPEN) {
          socket.send('ping');
        }
      }, hmrTimeout);
      break;

    case 'update':
      notifyListeners('skerry:beforeUpdate', payload);
      // An error overlay standing since before the first update means the
      // page is running stale code: reload instead of patching
      if (isFirstUpdate && hasErrorOverlay()) {
        window.location.reload();
        return;
      }
      clearErrorOverlay();
      isFirstUpdate = false;
      for (const update of payload.updates) {
        if (update.type === 'js-update') {
          queueUpdate(fetchUpdate(update));
        } else {
          updateStyleLink(update);
        }
      }
      break;

    case 'full-reload':
      notifyListeners('skerry:beforeFullReload', payload);
      if (payload.path && payload.path.endsWith('.html')) {
        // Only reload pages actually showing that file
        const pagePath = decodeURI(location.pathname);
        const payloadPath = base + payload.path.slice(1);
        if (
          pagePath === payloadPath ||
          payload.path === '/index.html' ||
          (pagePath.endsWith('/') && pagePath + 'index.html' === payloadPath)
        ) {
          location.reload();
        }
      } else {
        location.reload();
      }
      break;

    case 'prune':
      notifyListeners('skerry:beforePrune', payload);
      for (const path of payload.paths) {
        const fn = pruneMap.get(path);
        if (fn) {
          fn(dataMap.get(path));
        }
      }
      break;

    case 'custom':
      notifyListeners(payload.event, payload.data);
      break;

    case 'error':
      notifyListeners('skerry:error', payload);
      if (enableOverlay) {
        createErrorOverlay(payload.err);
      } else {
        console.error(`[skerry] Internal Server Error\n${payload.err.message}\n${payload.err.stack}`);
      }
      break;
  }
}

function notifyListeners(event, data) {
  const cbs = customListenersMap.get(event);
  if (cbs) {
    cbs.forEach((cb) => cb(data));
  }
}

function updateStyleLink(update) {
  // Swap the matching <link> with a cache-busted href
  const searchUrl = cleanUrl(update.path);
  const el = Array.from(document.querySelectorAll('link')).find((l) =>
    cleanUrl(l.href).includes(searchUrl)
  );
  if (el) {
    const newPath = `${base}${searchUrl.slice(1)}${
      searchUrl.includes('?') ? '&' : '?'
    }t=${update.timestamp}`;
    el.href = new URL(newPath, el.href).href;
  }
  console.debug(`[skerry] css hot updated: ${searchUrl}`);
}

function cleanUrl(url) {
  const u = new URL(url, location.origin);
  u.searchParams.delete('direct');
  return u.pathname + u.search;
}

// Socket closed uncleanly: the server is restarting. Poll until it answers,
// then reload to resync.
async function waitForSuccessfulPing(ms = 1000) {
  while (true) {
    try {
      await fetch(`${base}__skerry_ping`);
      break;
    } catch (e) {
      await new Promise((resolve) => setTimeout(resolve, ms));
    }
  }
}

socket.addEventListener('close', async ({ wasClean }) => {
  if (wasClean) return;
  clearInterval(pingInterval);
  console.log(`[skerry] server connection lost. polling for restart...`);
  await waitForSuccessfulPing();
  location.reload();
});

// Buffer updates arriving in the same microtask, then run them in insertion
// order so callbacks fire in server-sent order regardless of how the network
// interleaved the module fetches.
let pending = false;
let queued = [];

async function queueUpdate(p) {
  queued.push(p);
  if (!pending) {
    pending = true;
    await Promise.resolve();
    pending = false;
    const loading = [...queued];
    queued = [];
    (await Promise.all(loading)).forEach((fn) => fn && fn());
  }
}

async function fetchUpdate({ path, acceptedPath, timestamp }) {
  const mod = hotModulesMap.get(path);
  if (!mod) {
    // Another boundary in the payload owns this path
    return;
  }

  const moduleMap = new Map();
  const isSelfUpdate = path === acceptedPath;

  // Self-updates re-import the module itself; dep updates re-import only
  // the accepted dep
  const modulesToUpdate = new Set();
  if (isSelfUpdate) {
    modulesToUpdate.add(path);
  } else {
    for (const { deps } of mod.callbacks) {
      deps.forEach((dep) => {
        if (acceptedPath === dep) {
          modulesToUpdate.add(dep);
        }
      });
    }
  }

  // Narrow to callbacks actually watching the accepted dep
  const qualifiedCallbacks = mod.callbacks.filter(({ deps }) =>
    deps.some((dep) => modulesToUpdate.has(dep))
  );

  await Promise.all(
    Array.from(modulesToUpdate).map(async (dep) => {
      const disposer = disposeMap.get(dep);
      if (disposer) await disposer(dataMap.get(dep));
      const [depPath, query] = dep.split(`?`);
      try {
        const newMod = await import(
          /* @vite-ignore */
          base +
            depPath.slice(1) +
            `?import&t=${timestamp}${query ? `&${query}` : ''}`
        );
        moduleMap.set(dep, newMod);
      } catch (e) {
        warnFailedFetch(e, dep);
      }
    })
  );

  return () => {
    for (const { deps, fn } of qualifiedCallbacks) {
      fn(deps.map((dep) => moduleMap.get(dep)));
    }
    const loggedPath = isSelfUpdate ? path : `${acceptedPath} via ${path}`;
    console.debug(`[skerry] hot updated: ${loggedPath}`);
  };
}

function warnFailedFetch(err, path) {
  if (!err.message.match('fetch')) {
    console.error(err);
  }
  console.error(
    `[skerry] Failed to reload ${path}. This could be due to syntax errors ` +
      `or importing non-existent modules. (see errors above)`
  );
}

// ---------------------------------------------------------------------------
// Error overlay
// ---------------------------------------------------------------------------

const OVERLAY_ID = 'skerry-error-overlay';

function createErrorOverlay(err) {
  clearErrorOverlay();
  const overlay = document.createElement('div');
  overlay.id = OVERLAY_ID;
  overlay.style.cssText =
    'position:fixed;inset:0;z-index:99999;background:rgba(0,0,0,0.88);' +
    'color:#ff5f5f;font-family:monospace;font-size:14px;padding:32px;' +
    'white-space:pre-wrap;overflow:auto;';
  const plugin = err.plugin ? `[plugin: ${err.plugin}] ` : '';
  const file = err.loc
    ? `\n\n${err.loc.file || err.id || ''}:${err.loc.line}:${err.loc.column}`
    : err.id
      ? `\n\n${err.id}`
      : '';
  overlay.textContent = `${plugin}${err.message}${file}${
    err.frame ? `\n\n${err.frame}` : ''
  }\n\n${err.stack}`;
  overlay.addEventListener('click', clearErrorOverlay);
  document.body.appendChild(overlay);
}

function hasErrorOverlay() {
  return document.getElementById(OVERLAY_ID) != null;
}

function clearErrorOverlay() {
  const overlay = document.getElementById(OVERLAY_ID);
  if (overlay) overlay.remove();
}

// ---------------------------------------------------------------------------
// import.meta.hot
// ---------------------------------------------------------------------------

export function createHotContext(ownerPath) {
  if (!dataMap.has(ownerPath)) {
    dataMap.set(ownerPath, {});
  }

  // A re-executed module starts from a clean slate: stale accept callbacks
  // and the module's previous custom listeners are dropped
  const mod = hotModulesMap.get(ownerPath);
  if (mod) {
    mod.callbacks = [];
  }
  const staleListeners = ctxToListenersMap.get(ownerPath);
  if (staleListeners) {
    for (const [event, staleFns] of staleListeners) {
      const listeners = customListenersMap.get(event);
      if (listeners) {
        customListenersMap.set(
          event,
          listeners.filter((l) => !staleFns.includes(l))
        );
      }
    }
  }
  const newListeners = new Map();
  ctxToListenersMap.set(ownerPath, newListeners);

  function acceptDeps(deps, callback = () => {}) {
    const mod = hotModulesMap.get(ownerPath) || {
      id: ownerPath,
      callbacks: [],
    };
    mod.callbacks.push({ deps, fn: callback });
    hotModulesMap.set(ownerPath, mod);
  }

  const hot = {
    get data() {
      return dataMap.get(ownerPath);
    },

    accept(deps, callback) {
      if (typeof deps === 'function' || !deps) {
        // self-accept: hot.accept() or hot.accept(cb)
        acceptDeps([ownerPath], ([mod]) => deps && deps(mod));
      } else if (typeof deps === 'string') {
        acceptDeps([deps], ([mod]) => callback && callback(mod));
      } else if (Array.isArray(deps)) {
        acceptDeps(deps, callback);
      } else {
        throw new Error(`invalid hot.accept() usage.`);
      }
    },

    dispose(cb) {
      disposeMap.set(ownerPath, cb);
    },

    prune(cb) {
      pruneMap.set(ownerPath, cb);
    },

    decline() {
      // declined modules force a full reload server-side; nothing to do here
    },

    invalidate() {
      // tell the importers to re-fetch; simplest correct behavior
      location.reload();
    },

    on(event, cb) {
      const addToMap = (map) => {
        const existing = map.get(event) || [];
        existing.push(cb);
        map.set(event, existing);
      };
      addToMap(customListenersMap);
      addToMap(newListeners);
    },
  };

  return hot;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_injected() {
        let mut config = DevConfig::new("/project");
        config.hmr.protocol = "wss".to_string();
        config.hmr.hostname = "dev.local".to_string();
        config.hmr.port = 4000;
        config.hmr.timeout_ms = 15_000;
        config.hmr.overlay = false;

        let code = client_code(&config);
        assert!(code.contains("const hmrProtocol = 'wss';"));
        assert!(code.contains("const hmrHostname = 'dev.local';"));
        assert!(code.contains("const hmrPort = '4000';"));
        assert!(code.contains("const hmrTimeout = 15000;"));
        assert!(code.contains("const enableOverlay = false;"));
        assert!(!code.contains("__HMR_"));
        assert!(!code.contains("__BASE__"));
    }

    #[test]
    fn test_runtime_surface() {
        let code = client_code(&DevConfig::new("/project"));
        assert!(code.contains("export function createHotContext"));
        assert!(code.contains("'vite-hmr'"));
        assert!(code.contains("queueUpdate"));
        assert!(code.contains("fetchUpdate"));
        assert!(code.contains("socket.send('ping')"));
    }
}
