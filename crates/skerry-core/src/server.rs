//! The process-wide server context.
//!
//! One [`DevContext`] owns the module graph, the plugin container, the
//! transform pipeline, optimizer metadata, the glob-importer registry, and
//! the seams to the external watcher / WebSocket layers. It is passed by
//! reference (usually inside an `Arc`) everywhere.

use crate::bundler::DepBundler;
use crate::client;
use crate::config::DevConfig;
use crate::error::CoreError;
use crate::graph::{ModuleGraph, ModuleId};
use crate::hmr::{now_ms, BufferedChannel, HmrChannel, HmrPayload};
use crate::optimizer::{self, DepMetadata};
use crate::plugin::PluginContainer;
use crate::transform::{TransformEnv, TransformOptions, TransformOutput, TransformPipeline};
use crate::watch::{NullWatchHandle, WatchHandle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// How long a transform request waits for an in-progress dependency
/// re-bundle before giving up with 408.
pub const PENDING_RELOAD_TIMEOUT: Duration = Duration::from_secs(1);

/// A recorded `import.meta.glob` pattern and the module that owns it.
struct GlobImport {
    base: PathBuf,
    pattern: glob::Pattern,
    importer: ModuleId,
}

/// Process-wide dev-server state.
pub struct DevContext {
    config: Arc<DevConfig>,
    graph: Arc<ModuleGraph>,
    plugins: Arc<PluginContainer>,
    pipeline: TransformPipeline,
    watcher: Arc<dyn WatchHandle>,
    channel: Arc<dyn HmrChannel>,
    glob_importers: RwLock<Vec<GlobImport>>,
    dep_metadata: Mutex<Option<DepMetadata>>,
    /// Published while the optimizer re-bundles; transform requests wait on
    /// the receiver side with a timeout.
    pending_reload: Mutex<Option<watch::Receiver<bool>>>,
}

impl DevContext {
    /// Start building a context for the given resolved config.
    #[must_use]
    pub fn builder(config: DevConfig) -> DevContextBuilder {
        DevContextBuilder {
            config,
            plugins: None,
            watcher: None,
            channel: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<DevConfig> {
        &self.config
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<ModuleGraph> {
        &self.graph
    }

    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginContainer> {
        &self.plugins
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn HmrChannel> {
        &self.channel
    }

    #[must_use]
    pub fn watcher(&self) -> &Arc<dyn WatchHandle> {
        &self.watcher
    }

    /// Broadcast a payload to connected clients.
    pub fn send(&self, payload: &HmrPayload) {
        self.channel.send(payload);
    }

    /// The environment a transform computation captures.
    #[must_use]
    pub fn transform_env(&self) -> TransformEnv {
        TransformEnv {
            graph: self.graph.clone(),
            plugins: self.plugins.clone(),
            config: self.config.clone(),
            watcher: self.watcher.clone(),
            channel: self.channel.clone(),
        }
    }

    /// Run the transform pipeline for a URL.
    ///
    /// Requests other than the client runtime wait for an in-progress
    /// dependency re-bundle (up to [`PENDING_RELOAD_TIMEOUT`]).
    pub async fn transform_request(
        &self,
        url: &str,
        opts: TransformOptions,
    ) -> Result<Option<TransformOutput>, Arc<CoreError>> {
        if url != client::CLIENT_PATH {
            self.wait_for_pending_reload().await.map_err(Arc::new)?;
        }
        self.pipeline.transform_request(self.transform_env(), url, opts).await
    }

    /// Await all in-flight transforms, then run plugin teardown. Called
    /// before a server restart discards this context.
    pub async fn drain(&self) {
        self.pipeline.drain().await;
        if let Err(e) = self.plugins.build_end() {
            tracing::warn!(error = %e, "plugin teardown failed");
        }
    }

    // ------------------------------------------------------------------
    // Prune
    // ------------------------------------------------------------------

    /// Tell clients the given modules are no longer imported, stamping them
    /// so a future re-import bypasses the browser cache.
    pub fn prune_modules(&self, orphaned: &[ModuleId]) {
        if orphaned.is_empty() {
            return;
        }
        let timestamp = now_ms();
        let paths: Vec<String> = orphaned
            .iter()
            .map(|&id| {
                self.graph.bump_hmr_timestamp(id, timestamp);
                self.graph.url_of(id)
            })
            .collect();
        self.send(&HmrPayload::Prune { paths });
    }

    // ------------------------------------------------------------------
    // Glob importers
    // ------------------------------------------------------------------

    /// Record that `importer` owns a glob import over `base`/`pattern`.
    pub fn register_glob_importer(
        &self,
        base: PathBuf,
        pattern: glob::Pattern,
        importer: ModuleId,
    ) {
        self.glob_importers.write().unwrap().push(GlobImport {
            base,
            pattern,
            importer,
        });
    }

    /// Modules whose glob imports match an added or removed file.
    ///
    /// Absolute patterns match the absolute path; unanchored patterns match
    /// relative to their base only.
    #[must_use]
    pub fn matching_glob_importers(&self, file: &Path) -> Vec<ModuleId> {
        let registry = self.glob_importers.read().unwrap();
        let mut matched = Vec::new();
        for entry in registry.iter() {
            let hit = if entry.pattern.as_str().starts_with('/') {
                entry.pattern.matches_path(file)
            } else {
                file.strip_prefix(&entry.base)
                    .map(|rel| entry.pattern.matches_path(rel))
                    .unwrap_or(false)
            };
            if hit && !matched.contains(&entry.importer) {
                matched.push(entry.importer);
            }
        }
        matched
    }

    // ------------------------------------------------------------------
    // Dependency optimizer state
    // ------------------------------------------------------------------

    #[must_use]
    pub fn dep_metadata(&self) -> Option<DepMetadata> {
        self.dep_metadata.lock().unwrap().clone()
    }

    pub fn set_dep_metadata(&self, metadata: DepMetadata) {
        *self.dep_metadata.lock().unwrap() = Some(metadata);
    }

    /// Re-bundle after dependencies were discovered at runtime.
    ///
    /// Publishes the pending-reload gate for the duration of the bundle so
    /// concurrent transforms hold off, then instructs clients to reload.
    /// On failure the previous metadata stays in place.
    pub async fn discover_new_deps(
        &self,
        new_deps: BTreeMap<String, PathBuf>,
        bundler: &dyn DepBundler,
    ) -> Result<(), CoreError> {
        let mut deps = self
            .dep_metadata()
            .map(|m| {
                m.optimized
                    .iter()
                    .map(|(id, dep)| (id.clone(), dep.src.clone()))
                    .collect::<BTreeMap<_, _>>()
            })
            .unwrap_or_default();
        deps.extend(new_deps);

        let gate = self.begin_pending_reload();
        let result = optimizer::optimize(
            &self.config,
            &self.plugins.plugin_names(),
            bundler,
            true,
            Some(deps),
        );
        self.finish_pending_reload(gate);

        match result {
            Ok(metadata) => {
                self.set_dep_metadata(metadata);
                self.send(&HmrPayload::FullReload { path: None });
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "runtime dependency optimization failed");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending-reload gate
    // ------------------------------------------------------------------

    /// Publish the gate. Dropping the returned sender without calling
    /// [`finish_pending_reload`](Self::finish_pending_reload) releases
    /// waiters too.
    #[must_use]
    pub fn begin_pending_reload(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.pending_reload.lock().unwrap() = Some(rx);
        tx
    }

    /// Resolve and clear the gate.
    pub fn finish_pending_reload(&self, tx: watch::Sender<bool>) {
        let _ = tx.send(true);
        *self.pending_reload.lock().unwrap() = None;
    }

    /// Wait for an in-progress re-bundle, if any.
    ///
    /// # Errors
    /// [`CoreError::PendingReloadTimeout`] after one second; the caller maps
    /// it to HTTP 408.
    pub async fn wait_for_pending_reload(&self) -> Result<(), CoreError> {
        let rx = self.pending_reload.lock().unwrap().clone();
        let Some(mut rx) = rx else {
            return Ok(());
        };
        if *rx.borrow() {
            return Ok(());
        }
        let result = match tokio::time::timeout(PENDING_RELOAD_TIMEOUT, rx.wait_for(|done| *done)).await {
            Ok(Ok(_)) => Ok(()),
            // Sender dropped: the gate dissolved, proceed
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(CoreError::PendingReloadTimeout),
        };
        result
    }
}

/// Builder for [`DevContext`].
pub struct DevContextBuilder {
    config: DevConfig,
    plugins: Option<PluginContainer>,
    watcher: Option<Arc<dyn WatchHandle>>,
    channel: Option<Arc<dyn HmrChannel>>,
}

impl DevContextBuilder {
    /// Use a pre-populated plugin container.
    #[must_use]
    pub fn plugins(mut self, plugins: PluginContainer) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Connect the external watcher.
    #[must_use]
    pub fn watcher(mut self, watcher: Arc<dyn WatchHandle>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Connect the external WebSocket layer.
    #[must_use]
    pub fn channel(mut self, channel: Arc<dyn HmrChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Finalize the context: plugin ordering is fixed, the container's
    /// filesystem policy is derived from the config, and `build_start` runs.
    #[must_use]
    pub fn build(self) -> DevContext {
        let config = Arc::new(self.config);

        let mut plugins = self
            .plugins
            .unwrap_or_else(|| PluginContainer::new(config.root.clone()));
        {
            let ctx = plugins.context_mut();
            ctx.root = config.root.clone();
            ctx.mode = config.mode.clone();
            ctx.allowed_roots = std::iter::once(config.root.clone())
                .chain(config.allowed_roots.iter().cloned())
                .collect();
        }
        plugins.finalize();
        let plugins = Arc::new(plugins);

        if let Err(e) = plugins.build_start() {
            tracing::warn!(error = %e, "plugin build_start failed");
        }

        let metadata = optimizer::load_metadata(&config.cache_dir);

        DevContext {
            graph: Arc::new(ModuleGraph::new()),
            plugins,
            pipeline: TransformPipeline::new(),
            watcher: self.watcher.unwrap_or_else(|| Arc::new(NullWatchHandle)),
            channel: self.channel.unwrap_or_else(|| Arc::new(BufferedChannel::new())),
            glob_importers: RwLock::new(Vec::new()),
            dep_metadata: Mutex::new(metadata),
            pending_reload: Mutex::new(None),
            config,
        }
    }
}
