//! Per-URL transform pipeline: resolve → load → transform with etag caching
//! and in-flight request deduplication.
//!
//! The pipeline is the only component holding shared mutable state across a
//! suspension point: the in-flight map. At most one computation per cache
//! key is active; concurrent callers attach to the same shared future, and
//! the entry is removed on completion regardless of outcome.

use crate::config::DevConfig;
use crate::error::CoreError;
use crate::graph::{self, ModuleGraph, ModuleId, ModuleKind};
use crate::hmr::{lexer, now_ms, HmrChannel, HmrPayload};
use crate::plugin::PluginContainer;
use crate::watch::WatchHandle;
use futures::future::{BoxFuture, FutureExt, Shared};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A finished transform: code, composed source map, and the weak etag of the
/// code. The etag is derived from the code at construction, so the
/// etag-integrity invariant holds for every stored result.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub code: String,
    pub map: Option<Value>,
    pub etag: String,
}

impl TransformOutput {
    #[must_use]
    pub fn new(code: String, map: Option<Value>) -> Self {
        let etag = skerry_util::weak_etag(&code);
        Self { code, map, etag }
    }
}

/// Request flavor, part of the dedup cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub ssr: bool,
    pub html: bool,
}

/// Everything a transform computation needs, cloned out of the server
/// context so the shared future owns its world.
#[derive(Clone)]
pub struct TransformEnv {
    pub graph: Arc<ModuleGraph>,
    pub plugins: Arc<PluginContainer>,
    pub config: Arc<DevConfig>,
    pub watcher: Arc<dyn WatchHandle>,
    pub channel: Arc<dyn HmrChannel>,
}

type SharedTransform = Shared<BoxFuture<'static, Result<Option<TransformOutput>, Arc<CoreError>>>>;

/// Deduplicated, cached transform pipeline.
#[derive(Default)]
pub struct TransformPipeline {
    pending: Mutex<FxHashMap<String, SharedTransform>>,
}

impl TransformPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform a URL for serving. `Ok(None)` means "not found" (the caller
    /// decides 404).
    pub async fn transform_request(
        &self,
        env: TransformEnv,
        url: &str,
        opts: TransformOptions,
    ) -> Result<Option<TransformOutput>, Arc<CoreError>> {
        // Keyed without the cache buster so concurrent `?t=` variants of the
        // same module attach to one computation
        let url = graph::remove_timestamp_query(url);
        let key = cache_key(&url, opts);

        let (fut, owner) = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(existing) = pending.get(&key) {
                (existing.clone(), false)
            } else {
                let url = url.to_string();
                let fut: SharedTransform = async move {
                    do_transform(env, &url, opts).await.map_err(Arc::new)
                }
                .boxed()
                .shared();
                pending.insert(key.clone(), fut.clone());
                (fut, true)
            }
        };

        let result = fut.await;
        if owner {
            self.pending.lock().unwrap().remove(&key);
        }
        result
    }

    /// All in-flight computations, for the restart drain.
    pub fn in_flight(&self) -> Vec<SharedTransform> {
        self.pending.lock().unwrap().values().cloned().collect()
    }

    /// Await every in-flight computation. Called before tearing down state
    /// on a server restart.
    pub async fn drain(&self) {
        let pending = self.in_flight();
        futures::future::join_all(pending).await;
    }
}

fn cache_key(url: &str, opts: TransformOptions) -> String {
    if opts.ssr {
        format!("ssr:{url}")
    } else if opts.html {
        format!("html:{url}")
    } else {
        url.to_string()
    }
}

async fn do_transform(
    env: TransformEnv,
    raw_url: &str,
    opts: TransformOptions,
) -> Result<Option<TransformOutput>, CoreError> {
    let started = Instant::now();
    let url = graph::remove_timestamp_query(raw_url);

    // Cached result on the node wins
    if let Some(id) = env.graph.get_by_url(&url, &env.plugins)? {
        if let Some(cached) = env.graph.cached_transform(id, opts.ssr) {
            tracing::debug!(url = %url, "transform cache hit");
            return Ok(Some(cached));
        }
    }

    let resolved = env.graph.resolve_url(&url, &env.plugins)?;
    let id_str = resolved.resolved_id.clone();

    // Load: plugins first, then the container's allowed-roots disk fallback
    let loaded = match env.plugins.load(&id_str) {
        Ok(result) => result,
        Err(e) => return Err(e.into()),
    };
    let (code, load_map) = match loaded {
        Some(load) => (load.code, load.map),
        None => {
            if is_public_file(&url, &env.config) {
                return Err(CoreError::PublicDirImport {
                    path: url.clone(),
                });
            }
            tracing::debug!(url = %url, id = %id_str, "no loader matched");
            return Ok(None);
        }
    };

    let module = env.graph.ensure_entry_resolved(&resolved);
    if let Some(file) = &resolved.file {
        env.watcher.watch_file(Path::new(file));
    }

    // Transform chain; untouched code passes through as-is
    let chain = env
        .plugins
        .transform(&code, &id_str)
        .map_err(CoreError::from)?;
    let mut code = chain.code;
    let mut map = compose_source_maps(load_map, chain.maps);

    // CSS default form is a JS injection module; `?direct` serves the sheet.
    // The wrapper self-accepts, so the node is self-accepting by construction.
    let wrap_css =
        env.graph.kind_of(module) == ModuleKind::Css && !has_direct_query(&resolved.url);

    // Import analysis: record graph edges and hot-accept declarations before
    // CSS wrapping rewrites the module body
    let accept_scan = lexer::scan_hot_accepts(&code)?;
    let imported = collect_import_edges(&env, &resolved.url, &code)?;
    let accepted = resolve_accept_urls(&env, &resolved.url, &accept_scan)?;
    let orphaned = env.graph.update_module_info(
        module,
        &imported,
        &accepted,
        accept_scan.self_accepts || wrap_css,
    );
    if !orphaned.is_empty() {
        emit_prune(&env, &orphaned);
    }

    if wrap_css {
        code = css_injection_module(&code, &resolved.url);
        map = None;
    }

    if let Some(map) = map.as_mut() {
        fill_sources_content(map, resolved.file.as_deref());
    }

    let output = TransformOutput::new(code, map);
    env.graph
        .store_transform_result(module, output.clone(), opts.ssr);

    tracing::debug!(
        url = %resolved.url,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transformed"
    );
    Ok(Some(output))
}

/// Compose the source maps produced along the pipeline.
///
/// Real composition (remapping positions through each step) is delegated to
/// the embedding server's source-map tooling; the core keeps the last map in
/// the chain, which is exact for the common zero-or-one-transform case.
fn compose_source_maps(load_map: Option<Value>, mut chain: Vec<Value>) -> Option<Value> {
    let total = usize::from(load_map.is_some()) + chain.len();
    if total > 1 {
        tracing::debug!(maps = total, "multiple source maps; keeping the last");
    }
    chain.pop().or(load_map)
}

/// Whether the URL names an existing file under the public directory.
fn is_public_file(url: &str, config: &DevConfig) -> bool {
    let path = graph::strip_query_and_hash(url);
    let Some(rel) = path.strip_prefix('/') else {
        return false;
    };
    !rel.is_empty() && config.public_dir.join(rel).is_file()
}

fn has_direct_query(url: &str) -> bool {
    url.split('?')
        .nth(1)
        .is_some_and(|q| q.split('&').any(|p| p == "direct" || p.starts_with("direct=")))
}

/// Resolve each import specifier found in the transformed code to a graph
/// node, creating nodes for not-yet-requested deps.
///
/// Bare specifiers are the optimizer's concern and carry no graph edge.
fn collect_import_edges(
    env: &TransformEnv,
    importer_url: &str,
    code: &str,
) -> Result<Vec<ModuleId>, CoreError> {
    let mut edges = Vec::new();
    for spec in extract_import_urls(code) {
        let Some(url) = specifier_to_url(&spec, importer_url) else {
            continue;
        };
        edges.push(env.graph.ensure_entry(&url, &env.plugins)?);
    }
    Ok(edges)
}

fn resolve_accept_urls(
    env: &TransformEnv,
    importer_url: &str,
    scan: &lexer::AcceptScan,
) -> Result<Vec<ModuleId>, CoreError> {
    let mut accepted = Vec::new();
    for dep in &scan.deps {
        let Some(url) = specifier_to_url(&dep.url, importer_url) else {
            continue;
        };
        accepted.push(env.graph.ensure_entry(&url, &env.plugins)?);
    }
    Ok(accepted)
}

/// Map an import specifier to a public URL: absolute URLs pass through,
/// relative ones resolve against the importer's URL directory, bare ones are
/// skipped.
fn specifier_to_url(spec: &str, importer_url: &str) -> Option<String> {
    if spec.starts_with('\0') {
        return None;
    }
    if spec.starts_with('/') {
        return Some(spec.to_string());
    }
    if spec.starts_with("./") || spec.starts_with("../") {
        let dir = importer_url.rsplit_once('/').map_or("", |(d, _)| d);
        let mut segments: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
        for part in spec.split('/') {
            match part {
                "." | "" => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }
        return Some(format!("/{}", segments.join("/")));
    }
    None
}

fn emit_prune(env: &TransformEnv, orphaned: &[ModuleId]) {
    let timestamp = now_ms();
    let paths: Vec<String> = orphaned
        .iter()
        .map(|&id| {
            env.graph.bump_hmr_timestamp(id, timestamp);
            env.graph.url_of(id)
        })
        .collect();
    tracing::debug!(?paths, "pruning no-longer-imported modules");
    env.channel.send(&HmrPayload::Prune { paths });
}

/// Wrap a stylesheet into a JS module that injects a `<style>` tag and keeps
/// itself hot via self-accept.
fn css_injection_module(css: &str, url: &str) -> String {
    let escaped = css
        .replace('\\', "\\\\")
        .replace('`', "\\`")
        .replace("${", "\\${");

    format!(
        r#"const css = `{escaped}`;
const style = document.createElement('style');
style.setAttribute('data-skerry-href', {url:?});
style.textContent = css;
document.head.appendChild(style);
if (import.meta.hot) {{
  import.meta.hot.accept();
  import.meta.hot.dispose(() => {{
    style.remove();
  }});
}}
export default css;
"#
    )
}

/// Fill `sourcesContent` from disk for a map that has mappings but no
/// embedded sources.
fn fill_sources_content(map: &mut Value, fallback_file: Option<&str>) {
    let Some(obj) = map.as_object_mut() else {
        return;
    };
    let has_mappings = obj
        .get("mappings")
        .and_then(Value::as_str)
        .is_some_and(|m| !m.is_empty());
    if !has_mappings || obj.contains_key("sourcesContent") {
        return;
    }

    let sources: Vec<String> = obj
        .get("sources")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    let contents: Vec<Value> = sources
        .iter()
        .map(|source| {
            let path = if Path::new(source).is_absolute() {
                Some(source.clone())
            } else {
                fallback_file.map(ToString::to_string)
            };
            path.and_then(|p| std::fs::read_to_string(p).ok())
                .map_or(Value::Null, Value::String)
        })
        .collect();

    if !contents.is_empty() {
        obj.insert("sourcesContent".to_string(), Value::Array(contents));
    }
}

// ============================================================================
// Import extraction
// ============================================================================

/// Extract import specifiers from transformed JavaScript.
///
/// Covers static imports, side-effect imports, `export ... from` re-exports,
/// and dynamic `import('...')` calls. Returns specifiers deduplicated in
/// first-appearance order.
#[must_use]
pub fn extract_import_urls(code: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut seen = rustc_hash::FxHashSet::default();

    for line in code.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with('*') || trimmed.starts_with("/*") {
            continue;
        }

        if is_import_line(trimmed) || is_export_from_line(trimmed) {
            if let Some(spec) = extract_from_specifier(trimmed)
                .or_else(|| extract_side_effect_import(trimmed))
            {
                if seen.insert(spec.clone()) {
                    urls.push(spec);
                }
            }
        }

        let mut remaining = trimmed;
        while let Some(idx) = remaining.find("import(") {
            let after = &remaining[idx + 7..];
            if let Some((spec, rest)) = extract_string_from_start(after) {
                if seen.insert(spec.clone()) {
                    urls.push(spec);
                }
                remaining = rest;
            } else {
                remaining = after;
            }
        }
    }

    urls
}

fn is_import_line(trimmed: &str) -> bool {
    trimmed.starts_with("import ")
        && (trimmed.contains(" from ") || trimmed.contains('\'') || trimmed.contains('"'))
}

fn is_export_from_line(trimmed: &str) -> bool {
    trimmed.starts_with("export ") && trimmed.contains(" from ")
}

fn extract_from_specifier(line: &str) -> Option<String> {
    let from_idx = line.find(" from ")?;
    let after = line[from_idx + 6..].trim_start();
    let (spec, _) = extract_string_from_start(after)?;
    Some(spec)
}

fn extract_side_effect_import(line: &str) -> Option<String> {
    let after = line.strip_prefix("import ")?.trim_start();
    let (spec, _) = extract_string_from_start(after)?;
    Some(spec)
}

fn extract_string_from_start(s: &str) -> Option<(String, &str)> {
    let trimmed = s.trim_start();
    let quote = trimmed.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = &trimmed[1..];
    let end = inner.find(quote)?;
    Some((inner[..end].to_string(), &inner[end + 1..]))
}
