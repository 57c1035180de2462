//! Plugin system driving the resolve / load / transform pipeline.
//!
//! A plugin is a record of optionally-implemented hooks. The container
//! dispatches hooks in enforce order (`Pre` → `Normal` → `Post`, stable
//! within each bucket):
//!
//! - `resolve_id`: first non-`None` result wins.
//! - `load`: first non-`None` wins; if no plugin loads the id and it exists
//!   on disk inside an allowed root, the container reads it as UTF-8.
//! - `transform`: chained; each plugin's output feeds the next.
//! - `handle_hot_update`: chained; each plugin's returned module list
//!   replaces the context's list for the next plugin.

use crate::error::CoreError;
use crate::graph::ModuleId;
use rustc_hash::FxHashMap as HashMap;
use std::path::{Path, PathBuf};

/// Result type for plugin hooks.
pub type HookResult<T> = Result<T, PluginError>;

/// Error from a plugin hook.
#[derive(Debug)]
pub struct PluginError {
    /// Plugin name that caused the error.
    pub plugin: String,
    /// Hook that failed.
    pub hook: &'static str,
    /// Error message.
    pub message: String,
}

impl PluginError {
    #[must_use]
    pub fn new(plugin: impl Into<String>, hook: &'static str, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            hook,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.plugin, self.hook, self.message)
    }
}

impl std::error::Error for PluginError {}

impl From<PluginError> for CoreError {
    fn from(e: PluginError) -> Self {
        CoreError::PluginHook {
            plugin: e.plugin,
            hook: e.hook,
            message: e.message,
        }
    }
}

/// Context passed to plugin hooks.
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Project root.
    pub root: PathBuf,
    /// Filesystem roots the load fallback may read from (root included).
    pub allowed_roots: Vec<PathBuf>,
    /// Resolved mode string.
    pub mode: String,
}

impl PluginContext {
    /// Create a new plugin context rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            allowed_roots: vec![root.clone()],
            mode: "development".to_string(),
            root,
        }
    }

    fn is_allowed(&self, path: &Path) -> bool {
        self.allowed_roots.iter().any(|r| path.starts_with(r))
    }
}

/// Result of the `resolve_id` hook.
#[derive(Debug, Clone)]
pub struct ResolvedId {
    /// Resolved module id (usually a file path, possibly with a query).
    pub id: String,
    /// Whether this module is external (don't serve or traverse it).
    pub external: bool,
}

impl ResolvedId {
    /// Create a resolved module result.
    pub fn resolved(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external: false,
        }
    }

    /// Create an external module result.
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external: true,
        }
    }
}

/// Result of the `load` hook.
#[derive(Debug, Clone)]
pub struct LoadResult {
    /// Module source code.
    pub code: String,
    /// Optional source map (opaque to the core).
    pub map: Option<serde_json::Value>,
}

impl LoadResult {
    /// Create a load result with code only.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
        }
    }
}

/// Result of the `transform` hook.
#[derive(Debug, Clone)]
pub struct TransformResult {
    /// Transformed code.
    pub code: String,
    /// Optional source map for this transform step.
    pub map: Option<serde_json::Value>,
}

impl TransformResult {
    /// Create a transform result with code only.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
        }
    }
}

/// Plugin enforcement ordering. Mirrors Vite's `enforce` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PluginEnforce {
    /// Runs before normal plugins (e.g. alias resolution).
    Pre,
    /// Default ordering.
    #[default]
    Normal,
    /// Runs after normal plugins.
    Post,
}

/// Context for hot-update events, passed to `handle_hot_update`.
///
/// `modules` starts as the set of graph modules backed by the changed file;
/// each plugin returning `Some` replaces the list seen by later plugins.
pub struct HotUpdateContext {
    /// The file that changed (absolute path).
    pub file: String,
    /// Timestamp of the update (monotonic milliseconds).
    pub timestamp: u64,
    /// Modules affected by this change.
    pub modules: Vec<ModuleId>,
    content: String,
}

impl HotUpdateContext {
    /// Build a context with the changed file's content pre-read.
    ///
    /// The propagator reads the file through the editor-race tolerant reader
    /// before invoking any plugin, so hooks get a stable view.
    #[must_use]
    pub fn new(file: String, timestamp: u64, modules: Vec<ModuleId>, content: String) -> Self {
        Self {
            file,
            timestamp,
            modules,
            content,
        }
    }

    /// The changed file's content at event time.
    #[must_use]
    pub fn read(&self) -> &str {
        &self.content
    }
}

/// The main plugin trait.
///
/// All hooks have default no-op implementations; implement only the ones the
/// plugin cares about.
pub trait Plugin: Send + Sync {
    /// Plugin name for debugging and error messages.
    fn name(&self) -> &str;

    /// Plugin ordering: `Pre`, `Normal` (default), or `Post`.
    fn enforce(&self) -> PluginEnforce {
        PluginEnforce::Normal
    }

    /// Called once when the server context is built.
    fn build_start(&self, _ctx: &PluginContext) -> HookResult<()> {
        Ok(())
    }

    /// Resolve a module specifier to an id.
    ///
    /// Return `Some` to handle this resolution, or `None` to let the next
    /// plugin (or the source fallback) handle it.
    fn resolve_id(
        &self,
        _specifier: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<Option<ResolvedId>> {
        Ok(None)
    }

    /// Load a module by id. First non-`None` wins.
    fn load(&self, _id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        Ok(None)
    }

    /// Transform module source code. Chained across plugins.
    fn transform(
        &self,
        _code: &str,
        _id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        Ok(None)
    }

    /// Filter or widen the module list affected by a file change.
    ///
    /// Return `Some(modules)` to replace the affected list for subsequent
    /// plugins and the propagator, or `None` to leave it unchanged.
    fn handle_hot_update(&self, _ctx: &HotUpdateContext) -> HookResult<Option<Vec<ModuleId>>> {
        Ok(None)
    }

    /// Called when the server drains and tears down.
    fn build_end(&self, _ctx: &PluginContext) -> HookResult<()> {
        Ok(())
    }
}

/// Container dispatching hooks across an enforce-ordered plugin list.
pub struct PluginContainer {
    plugins: Vec<Box<dyn Plugin>>,
    ctx: PluginContext,
    needs_sort: bool,
}

impl PluginContainer {
    /// Create a new plugin container rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            plugins: Vec::new(),
            ctx: PluginContext::new(root),
            needs_sort: false,
        }
    }

    /// Add a plugin. Plugins are sorted by enforce order before dispatch.
    pub fn add(&mut self, plugin: Box<dyn Plugin>) {
        if plugin.enforce() != PluginEnforce::Normal {
            self.needs_sort = true;
        }
        self.plugins.push(plugin);
    }

    /// Sort plugins by enforce order (Pre → Normal → Post). Stable, so
    /// insertion order is preserved within each bucket.
    pub fn finalize(&mut self) {
        if self.needs_sort {
            self.plugins.sort_by_key(|p| p.enforce());
            self.needs_sort = false;
        }
    }

    /// Get the context (for modification during setup).
    pub fn context_mut(&mut self) -> &mut PluginContext {
        &mut self.ctx
    }

    /// Get the context (read-only).
    #[must_use]
    pub fn context(&self) -> &PluginContext {
        &self.ctx
    }

    /// Call `build_start` on all plugins.
    pub fn build_start(&self) -> HookResult<()> {
        for plugin in &self.plugins {
            plugin.build_start(&self.ctx)?;
        }
        Ok(())
    }

    /// Try to resolve a specifier through plugins. `None` when no plugin
    /// handled it.
    pub fn resolve_id(
        &self,
        specifier: &str,
        importer: Option<&str>,
    ) -> HookResult<Option<ResolvedId>> {
        for plugin in &self.plugins {
            if let Some(result) = plugin.resolve_id(specifier, importer, &self.ctx)? {
                tracing::debug!(
                    plugin = plugin.name(),
                    specifier,
                    id = %result.id,
                    "resolved"
                );
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Resolve a specifier, falling back to the specifier itself when no
    /// plugin claims it.
    pub fn resolve(&self, specifier: &str, importer: Option<&str>) -> HookResult<ResolvedId> {
        Ok(self
            .resolve_id(specifier, importer)?
            .unwrap_or_else(|| ResolvedId::resolved(specifier)))
    }

    /// Try to load a module through plugins, falling back to a UTF-8 disk
    /// read when the id exists inside an allowed root.
    pub fn load(&self, id: &str) -> HookResult<Option<LoadResult>> {
        for plugin in &self.plugins {
            if let Some(result) = plugin.load(id, &self.ctx)? {
                return Ok(Some(result));
            }
        }

        // The backing file is the id with query and hash stripped
        let path = Path::new(crate::graph::strip_query_and_hash(id));
        if self.ctx.is_allowed(path) && path.is_file() {
            match skerry_util::read_to_string_lossy(path) {
                Ok(code) => return Ok(Some(LoadResult::code(code))),
                Err(e) => {
                    return Err(PluginError::new(
                        "fs-load",
                        "load",
                        format!("failed to read {id}: {e}"),
                    ))
                }
            }
        }
        Ok(None)
    }

    /// Transform code through all plugins. Each plugin's output becomes the
    /// next plugin's input; every step's source map is collected for
    /// composition by the caller.
    pub fn transform(&self, code: &str, id: &str) -> HookResult<TransformChain> {
        let mut current = code.to_string();
        let mut maps = Vec::new();
        let mut transformed = false;

        for plugin in &self.plugins {
            if let Some(result) = plugin.transform(&current, id, &self.ctx)? {
                current = result.code;
                transformed = true;
                if let Some(map) = result.map {
                    maps.push(map);
                }
            }
        }

        Ok(TransformChain {
            code: current,
            maps,
            transformed,
        })
    }

    /// Run `handle_hot_update` across plugins, chaining filtered lists: each
    /// plugin's `Some` return replaces `ctx.modules` for the next plugin.
    pub fn handle_hot_update(&self, ctx: &mut HotUpdateContext) -> HookResult<()> {
        for plugin in &self.plugins {
            if let Some(modules) = plugin.handle_hot_update(ctx)? {
                tracing::debug!(
                    plugin = plugin.name(),
                    file = %ctx.file,
                    count = modules.len(),
                    "hot update module list replaced"
                );
                ctx.modules = modules;
            }
        }
        Ok(())
    }

    /// Declared plugin names in dispatch order. Part of the optimizer's
    /// config hash, so adding or reordering plugins invalidates the dep
    /// cache.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Call `build_end` on all plugins.
    pub fn build_end(&self) -> HookResult<()> {
        for plugin in &self.plugins {
            plugin.build_end(&self.ctx)?;
        }
        Ok(())
    }
}

/// Output of the chained `transform` dispatch.
#[derive(Debug, Clone)]
pub struct TransformChain {
    /// Final code after all plugins ran.
    pub code: String,
    /// One map per plugin step that produced one, in application order.
    /// Composition is the caller's concern.
    pub maps: Vec<serde_json::Value>,
    /// Whether any plugin transformed the code.
    pub transformed: bool,
}

// ============================================================================
// Built-in plugins
// ============================================================================

/// Plugin that replaces global identifiers with configured values.
///
/// Backs the `define` config map (e.g. `process.env.NODE_ENV`).
pub struct DefinePlugin {
    replacements: HashMap<String, String>,
}

impl DefinePlugin {
    /// Build from a define map.
    #[must_use]
    pub fn new(replacements: HashMap<String, String>) -> Self {
        Self { replacements }
    }

    /// Add a replacement.
    #[must_use]
    pub fn replace(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replacements.insert(from.into(), to.into());
        self
    }
}

impl Default for DefinePlugin {
    fn default() -> Self {
        Self::new(HashMap::default())
    }
}

impl Plugin for DefinePlugin {
    fn name(&self) -> &str {
        "skerry:define"
    }

    fn transform(
        &self,
        code: &str,
        _id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if self.replacements.is_empty() {
            return Ok(None);
        }

        let mut result = code.to_string();
        let mut changed = false;
        for (from, to) in &self.replacements {
            if result.contains(from.as_str()) {
                result = result.replace(from, to);
                changed = true;
            }
        }

        if changed {
            Ok(Some(TransformResult::code(result)))
        } else {
            Ok(None)
        }
    }
}

/// Plugin serving in-memory virtual modules under `virtual:` ids.
pub struct VirtualPlugin {
    modules: HashMap<String, String>,
}

impl VirtualPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: HashMap::default(),
        }
    }

    /// Add a virtual module.
    #[must_use]
    pub fn module(mut self, id: impl Into<String>, code: impl Into<String>) -> Self {
        self.modules.insert(id.into(), code.into());
        self
    }
}

impl Default for VirtualPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for VirtualPlugin {
    fn name(&self) -> &str {
        "skerry:virtual"
    }

    fn resolve_id(
        &self,
        specifier: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<Option<ResolvedId>> {
        if let Some(id) = specifier.strip_prefix("virtual:") {
            if self.modules.contains_key(id) {
                return Ok(Some(ResolvedId::resolved(format!("\0virtual:{id}"))));
            }
        }
        if self.modules.contains_key(specifier) {
            return Ok(Some(ResolvedId::resolved(format!("\0virtual:{specifier}"))));
        }
        Ok(None)
    }

    fn load(&self, id: &str, _ctx: &PluginContext) -> HookResult<Option<LoadResult>> {
        if let Some(virtual_id) = id.strip_prefix("\0virtual:") {
            if let Some(code) = self.modules.get(virtual_id) {
                return Ok(Some(LoadResult::code(code)));
            }
        }
        Ok(None)
    }
}

/// Plugin resolving import aliases (`@/components` → `./src/components`).
///
/// Runs `Pre` so aliases win over every other resolver.
pub struct AliasPlugin {
    aliases: Vec<(String, String)>,
}

impl AliasPlugin {
    #[must_use]
    pub fn new() -> Self {
        Self {
            aliases: Vec::new(),
        }
    }

    /// Add an alias.
    #[must_use]
    pub fn alias(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.aliases.push((from.into(), to.into()));
        self
    }
}

impl Default for AliasPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for AliasPlugin {
    fn name(&self) -> &str {
        "skerry:alias"
    }

    fn enforce(&self) -> PluginEnforce {
        PluginEnforce::Pre
    }

    fn resolve_id(
        &self,
        specifier: &str,
        _importer: Option<&str>,
        _ctx: &PluginContext,
    ) -> HookResult<Option<ResolvedId>> {
        for (from, to) in &self.aliases {
            if specifier == from {
                return Ok(Some(ResolvedId::resolved(to)));
            }
            if let Some(rest) = specifier.strip_prefix(from.as_str()) {
                if rest.starts_with('/') {
                    return Ok(Some(ResolvedId::resolved(format!("{to}{rest}"))));
                }
            }
        }
        Ok(None)
    }
}

/// Plugin turning `.json` files into ES modules.
pub struct JsonPlugin;

impl Plugin for JsonPlugin {
    fn name(&self) -> &str {
        "skerry:json"
    }

    fn transform(
        &self,
        code: &str,
        id: &str,
        _ctx: &PluginContext,
    ) -> HookResult<Option<TransformResult>> {
        if !id.ends_with(".json") {
            return Ok(None);
        }
        Ok(Some(TransformResult::code(format!(
            "export default {};",
            code.trim()
        ))))
    }
}
