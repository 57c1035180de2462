//! The module graph: a directed multigraph over every served URL.
//!
//! Nodes live in an arena (`Vec<Option<ModuleNode>>`) with stable indices so
//! the cyclic `importers` relation never needs reference counting; edges are
//! id sets. Three indices point into the arena: by public URL, by resolved
//! id, and by file path (file → id set, since one file can back several URL
//! variants via queries like `?direct`).
//!
//! Locking: a single `RwLock` around the inner state, never held across an
//! await. Plugin resolution happens before the lock is taken.

use crate::plugin::PluginContainer;
use crate::transform::TransformOutput;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::Path;
use std::sync::RwLock;

/// Synthetic URL prefix for files referenced only by absolute path (e.g. a
/// preprocessor dependency pulled in via in-content `@import`).
pub const FS_PREFIX: &str = "/@fs";

/// Stable handle to a module node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

impl ModuleId {
    /// Build an id from a raw index. Only meaningful for ids previously
    /// handed out by the same graph; exposed for tests and serialization.
    #[must_use]
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw arena index.
    #[must_use]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// Module flavor, fixed at creation from the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Js,
    Css,
}

/// A node in the module graph.
#[derive(Debug)]
struct ModuleNode {
    /// Public path beginning with `/`, unique across the graph.
    url: String,
    /// Opaque id produced by plugin resolution; may equal `url`.
    resolved_id: String,
    /// Underlying filesystem path with query/hash stripped. Absent for
    /// virtual modules.
    file: Option<String>,
    kind: ModuleKind,
    importers: FxHashSet<ModuleId>,
    imported_modules: FxHashSet<ModuleId>,
    /// Subset of `imported_modules` declared via hot-accept.
    accepted_hmr_deps: FxHashSet<ModuleId>,
    is_self_accepting: bool,
    transform_result: Option<TransformOutput>,
    ssr_transform_result: Option<TransformOutput>,
    /// Monotonic milliseconds; 0 until first invalidation.
    last_hmr_timestamp: u64,
}

impl ModuleNode {
    fn new(url: String, resolved_id: String, file: Option<String>) -> Self {
        let kind = if is_css_request(&url) {
            ModuleKind::Css
        } else {
            ModuleKind::Js
        };
        Self {
            url,
            resolved_id,
            file,
            kind,
            importers: FxHashSet::default(),
            imported_modules: FxHashSet::default(),
            accepted_hmr_deps: FxHashSet::default(),
            is_self_accepting: false,
            transform_result: None,
            ssr_transform_result: None,
            last_hmr_timestamp: 0,
        }
    }
}

#[derive(Default)]
struct GraphInner {
    nodes: Vec<Option<ModuleNode>>,
    url_to_id: FxHashMap<String, ModuleId>,
    resolved_to_id: FxHashMap<String, ModuleId>,
    file_to_ids: FxHashMap<String, FxHashSet<ModuleId>>,
}

impl GraphInner {
    fn node(&self, id: ModuleId) -> &ModuleNode {
        self.nodes[id.0].as_ref().expect("stale ModuleId")
    }

    fn node_mut(&mut self, id: ModuleId) -> &mut ModuleNode {
        self.nodes[id.0].as_mut().expect("stale ModuleId")
    }
}

/// A URL resolved through the plugin container, ready for graph insertion.
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    /// Normalized public URL (timestamp/`?import` stripped, extension
    /// collapsed onto the resolved one).
    pub url: String,
    /// Plugin-resolved id.
    pub resolved_id: String,
    /// File path backing the id, if any.
    pub file: Option<String>,
}

/// In-memory directed multigraph keyed by URL / resolved id / file path.
pub struct ModuleGraph {
    inner: RwLock<GraphInner>,
}

impl ModuleGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
        }
    }

    /// Normalize and resolve a raw request URL.
    ///
    /// Strips the timestamp and `?import` queries, resolves through the
    /// plugin container (falling back to the URL itself), and appends the
    /// resolved extension when the URL lacked one so `/foo` and `/foo.js`
    /// collapse to the same key.
    pub fn resolve_url(
        &self,
        raw: &str,
        plugins: &PluginContainer,
    ) -> Result<ResolvedUrl, crate::CoreError> {
        let clean = normalize_url(raw);
        let resolved = plugins.resolve(&clean, None)?;
        let file = file_from_id(&resolved.id);

        let mut url = clean;
        if let Some(ext) = file.as_deref().and_then(extension_of) {
            let (path, query) = split_query(&url);
            if extension_of(path).is_none() {
                url = format!("{path}.{ext}{query}");
            }
        }

        Ok(ResolvedUrl {
            url,
            resolved_id: resolved.id,
            file,
        })
    }

    /// Look up a node by raw request URL.
    pub fn get_by_url(
        &self,
        raw: &str,
        plugins: &PluginContainer,
    ) -> Result<Option<ModuleId>, crate::CoreError> {
        let clean = normalize_url(raw);
        if let Some(&id) = self.inner.read().unwrap().url_to_id.get(&clean) {
            return Ok(Some(id));
        }
        let resolved = self.resolve_url(raw, plugins)?;
        Ok(self.inner.read().unwrap().url_to_id.get(&resolved.url).copied())
    }

    /// Look up a node by resolved id.
    #[must_use]
    pub fn get_by_id(&self, resolved_id: &str) -> Option<ModuleId> {
        self.inner
            .read()
            .unwrap()
            .resolved_to_id
            .get(resolved_id)
            .copied()
    }

    /// All nodes backed by `file`.
    #[must_use]
    pub fn get_by_file(&self, file: &str) -> Vec<ModuleId> {
        self.inner
            .read()
            .unwrap()
            .file_to_ids
            .get(file)
            .map(|set| {
                let mut ids: Vec<_> = set.iter().copied().collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Return the existing node for a raw URL or create one, resolving
    /// through the plugin container.
    pub fn ensure_entry(
        &self,
        raw: &str,
        plugins: &PluginContainer,
    ) -> Result<ModuleId, crate::CoreError> {
        let resolved = self.resolve_url(raw, plugins)?;
        Ok(self.ensure_entry_resolved(&resolved))
    }

    /// Return the existing node for an already-resolved URL or create one.
    /// On creation all three indices are populated under one lock.
    pub fn ensure_entry_resolved(&self, resolved: &ResolvedUrl) -> ModuleId {
        let mut inner = self.inner.write().unwrap();
        if let Some(&id) = inner.url_to_id.get(&resolved.url) {
            return id;
        }

        let id = ModuleId(inner.nodes.len());
        inner.nodes.push(Some(ModuleNode::new(
            resolved.url.clone(),
            resolved.resolved_id.clone(),
            resolved.file.clone(),
        )));
        inner.url_to_id.insert(resolved.url.clone(), id);
        inner
            .resolved_to_id
            .insert(resolved.resolved_id.clone(), id);
        if let Some(file) = &resolved.file {
            inner.file_to_ids.entry(file.clone()).or_default().insert(id);
        }
        id
    }

    /// Create (or fetch) the synthetic node for a file referenced only by
    /// absolute path, e.g. a preprocessor `@import` dependency.
    pub fn ensure_fs_entry(&self, file: &Path) -> ModuleId {
        let file_str = file.display().to_string();
        let url = format!("{FS_PREFIX}{file_str}");
        self.ensure_entry_resolved(&ResolvedUrl {
            resolved_id: url.clone(),
            file: Some(file_str),
            url,
        })
    }

    /// Atomically replace a module's import and accepted-dep sets after a
    /// transform produced its import list.
    ///
    /// Back-edges are diffed: removed importees lose this module from their
    /// `importers`. Returns every importee whose `importers` became empty,
    /// so the layer above can emit a prune signal.
    ///
    /// `accepted` entries outside `imported ∪ {self}` are dropped, keeping
    /// the accepted-deps subset invariant by construction.
    pub fn update_module_info(
        &self,
        id: ModuleId,
        imported: &[ModuleId],
        accepted: &[ModuleId],
        is_self_accepting: bool,
    ) -> Vec<ModuleId> {
        let mut inner = self.inner.write().unwrap();

        let new_imports: FxHashSet<ModuleId> = imported.iter().copied().collect();
        let prev_imports = std::mem::take(&mut inner.node_mut(id).imported_modules);

        for &dep in new_imports.difference(&prev_imports) {
            inner.node_mut(dep).importers.insert(id);
        }

        let mut orphaned = Vec::new();
        for &gone in prev_imports.difference(&new_imports) {
            let importee = inner.node_mut(gone);
            importee.importers.remove(&id);
            if importee.importers.is_empty() {
                orphaned.push(gone);
            }
        }
        orphaned.sort();

        let accepted_set: FxHashSet<ModuleId> = accepted
            .iter()
            .copied()
            .filter(|dep| *dep == id || new_imports.contains(dep))
            .collect();

        let node = inner.node_mut(id);
        node.imported_modules = new_imports;
        node.accepted_hmr_deps = accepted_set;
        node.is_self_accepting = is_self_accepting;

        orphaned
    }

    /// Clear a node's cached results and stamp it with the update time.
    pub fn invalidate(&self, id: ModuleId, timestamp: u64) {
        let mut inner = self.inner.write().unwrap();
        let node = inner.node_mut(id);
        node.transform_result = None;
        node.ssr_transform_result = None;
        node.last_hmr_timestamp = timestamp;
    }

    /// Invalidate every node backed by `file`.
    ///
    /// Direct nodes lose both cached results; their transitive importers
    /// lose only the SSR-side result (transform results along the importer
    /// chain are cleared by the HMR invalidation walk, which knows about
    /// accept boundaries).
    pub fn on_file_change(&self, file: &str) {
        let ids = self.get_by_file(file);
        let mut inner = self.inner.write().unwrap();
        let mut seen = FxHashSet::default();
        for id in ids {
            {
                let node = inner.node_mut(id);
                node.transform_result = None;
                node.ssr_transform_result = None;
            }
            seen.insert(id);
            let importers: Vec<ModuleId> = inner.node(id).importers.iter().copied().collect();
            let mut stack = importers;
            while let Some(next) = stack.pop() {
                if !seen.insert(next) {
                    continue;
                }
                let node = inner.node_mut(next);
                node.ssr_transform_result = None;
                stack.extend(inner.node(next).importers.iter().copied());
            }
        }
    }

    /// Clear every cached transform result without dropping nodes.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.write().unwrap();
        for node in inner.nodes.iter_mut().flatten() {
            node.transform_result = None;
            node.ssr_transform_result = None;
        }
    }

    /// Store a finished transform result on a node.
    pub fn store_transform_result(&self, id: ModuleId, result: TransformOutput, ssr: bool) {
        let mut inner = self.inner.write().unwrap();
        let node = inner.node_mut(id);
        if ssr {
            node.ssr_transform_result = Some(result);
        } else {
            node.transform_result = Some(result);
        }
    }

    /// A node's cached transform result, if still valid.
    #[must_use]
    pub fn cached_transform(&self, id: ModuleId, ssr: bool) -> Option<TransformOutput> {
        let inner = self.inner.read().unwrap();
        let node = inner.node(id);
        if ssr {
            node.ssr_transform_result.clone()
        } else {
            node.transform_result.clone()
        }
    }

    /// Stamp a node (used by prune so future re-imports bypass the browser
    /// cache) without touching its cached result.
    pub fn bump_hmr_timestamp(&self, id: ModuleId, timestamp: u64) {
        self.inner.write().unwrap().node_mut(id).last_hmr_timestamp = timestamp;
    }

    #[must_use]
    pub fn last_hmr_timestamp(&self, id: ModuleId) -> u64 {
        self.inner.read().unwrap().node(id).last_hmr_timestamp
    }

    #[must_use]
    pub fn url_of(&self, id: ModuleId) -> String {
        self.inner.read().unwrap().node(id).url.clone()
    }

    #[must_use]
    pub fn resolved_id_of(&self, id: ModuleId) -> String {
        self.inner.read().unwrap().node(id).resolved_id.clone()
    }

    #[must_use]
    pub fn file_of(&self, id: ModuleId) -> Option<String> {
        self.inner.read().unwrap().node(id).file.clone()
    }

    #[must_use]
    pub fn kind_of(&self, id: ModuleId) -> ModuleKind {
        self.inner.read().unwrap().node(id).kind
    }

    #[must_use]
    pub fn importers_of(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut ids: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .node(id)
            .importers
            .iter()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn imported_of(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut ids: Vec<_> = self
            .inner
            .read()
            .unwrap()
            .node(id)
            .imported_modules
            .iter()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Whether `importer` declared `dep` via hot-accept.
    #[must_use]
    pub fn accepts(&self, importer: ModuleId, dep: ModuleId) -> bool {
        self.inner
            .read()
            .unwrap()
            .node(importer)
            .accepted_hmr_deps
            .contains(&dep)
    }

    #[must_use]
    pub fn is_self_accepting(&self, id: ModuleId) -> bool {
        self.inner.read().unwrap().node(id).is_self_accepting
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .nodes
            .iter()
            .filter(|n| n.is_some())
            .count()
    }
}

impl Default for ModuleGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// URL helpers
// ============================================================================

const CSS_EXTENSIONS: &[&str] = &[
    "css", "less", "sass", "scss", "styl", "stylus", "pcss", "postcss",
];

/// Whether a URL names a CSS-family module (query ignored).
#[must_use]
pub fn is_css_request(url: &str) -> bool {
    let (path, _) = split_query(url);
    extension_of(path).is_some_and(|ext| CSS_EXTENSIONS.contains(&ext))
}

/// Strip a `t=<ms>` cache-buster from a URL's query.
#[must_use]
pub fn remove_timestamp_query(url: &str) -> String {
    remove_query_param(url, "t")
}

/// Strip the `import` marker query from a URL.
#[must_use]
pub fn remove_import_query(url: &str) -> String {
    remove_query_param(url, "import")
}

/// Strip both the timestamp and `?import` queries.
#[must_use]
pub fn normalize_url(url: &str) -> String {
    remove_import_query(&remove_timestamp_query(url))
}

/// Strip query and hash from a resolved id, yielding the backing file path.
#[must_use]
pub fn strip_query_and_hash(id: &str) -> &str {
    let end = id.find(['?', '#']).unwrap_or(id.len());
    &id[..end]
}

fn file_from_id(id: &str) -> Option<String> {
    if id.starts_with('\0') {
        return None;
    }
    Some(strip_query_and_hash(id).to_string())
}

fn split_query(url: &str) -> (&str, &str) {
    match url.find('?') {
        Some(idx) => (&url[..idx], &url[idx..]),
        None => (url, ""),
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next()?;
    let dot = file_name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    Some(&file_name[dot + 1..])
}

fn remove_query_param(url: &str, name: &str) -> String {
    let (path, query) = split_query(url);
    if query.is_empty() {
        return url.to_string();
    }
    let kept: Vec<&str> = query[1..]
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or(pair);
            key != name
        })
        .collect();
    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}
