//! Update propagation: from a changed file to the minimal set of hot-update
//! boundaries, or a full page reload when no boundary covers a path.
//!
//! Two walks run over the importer graph for every affected module:
//!
//! 1. The *invalidation walk* clears stale transform results. It stops at
//!    accept boundaries: a self-accepting module keeps its importers' caches
//!    warm (CSS importers excepted, since a sheet inlining the changed file
//!    re-emits), and a dep-accepting importer is refreshed but not recursed
//!    into.
//! 2. The *boundary walk* collects `{boundary, accepted_via}` pairs. A path
//!    with no boundary is a dead end; one dead end anywhere degrades the
//!    whole event to a full reload.

use crate::error::CoreError;
use crate::graph::{is_css_request, ModuleGraph, ModuleId, ModuleKind};
use crate::hmr::{now_ms, HmrPayload, HmrUpdate, UpdateKind};
use crate::plugin::HotUpdateContext;
use crate::server::DevContext;
use crate::watch::{read_modified_file, FileChangeEvent, FileChangeKind};
use rustc_hash::FxHashSet;
use std::path::Path;

/// What a file-change event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChangeOutcome {
    /// Config or env file changed: the embedding server restarts itself.
    Restart,
    /// A full-reload payload was broadcast.
    FullReload,
    /// An update payload with this many entries was broadcast.
    Updates(usize),
    /// The file maps to nothing the browser knows about.
    Ignored,
}

/// An update boundary together with the dep whose change it accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Boundary {
    boundary: ModuleId,
    accepted_via: ModuleId,
}

/// Process one file-system event end to end: gates, plugin filtering, the
/// two walks, and payload dispatch.
pub async fn handle_file_change(
    ctx: &DevContext,
    event: &FileChangeEvent,
) -> Result<FileChangeOutcome, CoreError> {
    let file = event.path.display().to_string();
    let config = ctx.config();

    // Gate 1: config / env changes invalidate the whole server process
    if config.is_config_dependency(&event.path)
        || (config.env_reload && config.is_env_file(&event.path))
    {
        tracing::info!(file = %file, "config dependency changed, restart required");
        return Ok(FileChangeOutcome::Restart);
    }

    // Gate 2: an edit to the client runtime itself invalidates every page
    if let Some(client_dir) = &config.client_dir {
        if event.path.starts_with(client_dir) {
            ctx.send(&HmrPayload::FullReload {
                path: Some("*".to_string()),
            });
            return Ok(FileChangeOutcome::FullReload);
        }
    }

    ctx.graph().on_file_change(&file);

    let mut modules = ctx.graph().get_by_file(&file);

    // Adds and removals can satisfy (or break) glob imports recorded by
    // modules like `import.meta.glob` users
    if event.kind != FileChangeKind::Modify {
        for importer in ctx.matching_glob_importers(&event.path) {
            if let Some(importer_file) = ctx.graph().file_of(importer) {
                ctx.graph().on_file_change(&importer_file);
            }
            if !modules.contains(&importer) {
                modules.push(importer);
            }
        }
    }

    // Gate 3: nothing maps to this file
    if modules.is_empty() {
        if file.ends_with(".html") {
            let path = url_path_of(&event.path, &config.root);
            tracing::debug!(file = %file, "html page changed, reloading");
            ctx.send(&HmrPayload::FullReload { path: Some(path) });
            return Ok(FileChangeOutcome::FullReload);
        }
        tracing::trace!(file = %file, "no modules matched, ignoring");
        return Ok(FileChangeOutcome::Ignored);
    }

    let timestamp = now_ms();

    // Let plugins narrow or widen the affected set. The file is pre-read
    // through the editor-race tolerant reader so every hook sees one view.
    let content = if event.kind == FileChangeKind::Unlink {
        String::new()
    } else {
        read_modified_file(&event.path).await.unwrap_or_default()
    };
    let mut hot_ctx = HotUpdateContext::new(file.clone(), timestamp, modules, content);
    ctx.plugins()
        .handle_hot_update(&mut hot_ctx)
        .map_err(CoreError::from)?;

    let graph = ctx.graph();
    let mut need_full_reload = false;
    let mut boundaries: Vec<Boundary> = Vec::new();
    let mut seen_boundaries = FxHashSet::default();
    let mut invalidated = FxHashSet::default();

    for &module in &hot_ctx.modules {
        invalidation_walk(graph, module, timestamp, &mut invalidated);

        if need_full_reload {
            continue;
        }
        let mut collected = Vec::new();
        let mut chain = vec![module];
        if boundary_walk(graph, module, &mut collected, &mut chain) {
            need_full_reload = true;
        } else {
            for b in collected {
                if seen_boundaries.insert(b) {
                    boundaries.push(b);
                }
            }
        }
    }

    if need_full_reload {
        tracing::debug!(file = %file, "no hot-update boundary, full reload");
        ctx.send(&HmrPayload::FullReload { path: None });
        return Ok(FileChangeOutcome::FullReload);
    }

    let updates: Vec<HmrUpdate> = boundaries
        .iter()
        .map(|b| HmrUpdate {
            kind: match graph.kind_of(b.boundary) {
                ModuleKind::Js => UpdateKind::Js,
                ModuleKind::Css => UpdateKind::Css,
            },
            timestamp,
            path: graph.url_of(b.boundary),
            accepted_path: graph.url_of(b.accepted_via),
        })
        .collect();

    let count = updates.len();
    tracing::debug!(file = %file, updates = count, "hot update");
    ctx.send(&HmrPayload::Update { updates });
    Ok(FileChangeOutcome::Updates(count))
}

/// Clear stale transform results along the unaccepting importer chain.
///
/// A self-accepting module is its own boundary: its importers' caches stay
/// warm, with one exception mirroring the boundary walk. A CSS importer may
/// inline this file through a preprocessor-recorded dep, so its cached
/// output embeds the pre-change content and is cleared too. A dep-accepting
/// importer is refreshed (its next fetch re-imports the dep with a new
/// timestamp) but the walk stops there.
fn invalidation_walk(
    graph: &ModuleGraph,
    id: ModuleId,
    timestamp: u64,
    seen: &mut FxHashSet<ModuleId>,
) {
    if !seen.insert(id) {
        return;
    }
    graph.invalidate(id, timestamp);

    if graph.is_self_accepting(id) {
        for importer in graph.importers_of(id) {
            if is_css_request(&graph.url_of(importer)) {
                invalidation_walk(graph, importer, timestamp, seen);
            }
        }
        return;
    }
    for importer in graph.importers_of(id) {
        if graph.accepts(importer, id) {
            if seen.insert(importer) {
                graph.invalidate(importer, timestamp);
            }
        } else {
            invalidation_walk(graph, importer, timestamp, seen);
        }
    }
}

/// Walk importers from a changed module collecting accept boundaries.
/// Returns `true` when any path dead-ends.
fn boundary_walk(
    graph: &ModuleGraph,
    node: ModuleId,
    boundaries: &mut Vec<Boundary>,
    chain: &mut Vec<ModuleId>,
) -> bool {
    let node_url = graph.url_of(node);

    if graph.is_self_accepting(node) {
        boundaries.push(Boundary {
            boundary: node,
            accepted_via: node,
        });

        // A stylesheet importing this file through a preprocessor dep still
        // needs re-emitting, so CSS importers are walked through rather than
        // treated as dead ends.
        for importer in graph.importers_of(node) {
            if is_css_request(&graph.url_of(importer)) && !chain.contains(&importer) {
                chain.push(importer);
                boundary_walk(graph, importer, boundaries, chain);
                chain.pop();
            }
        }
        return false;
    }

    let importers = graph.importers_of(node);
    if importers.is_empty() {
        return true;
    }

    // A JS file can't bubble through a CSS parent
    if !is_css_request(&node_url)
        && importers
            .iter()
            .all(|&i| is_css_request(&graph.url_of(i)))
    {
        return true;
    }

    for importer in importers {
        if graph.accepts(importer, node) {
            boundaries.push(Boundary {
                boundary: importer,
                accepted_via: node,
            });
            continue;
        }
        if chain.contains(&importer) {
            // Circular: no stable boundary exists on this path
            return true;
        }
        chain.push(importer);
        let dead_end = boundary_walk(graph, importer, boundaries, chain);
        chain.pop();
        if dead_end {
            return true;
        }
    }

    false
}

fn url_path_of(file: &Path, root: &Path) -> String {
    match file.strip_prefix(root) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => file.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevConfig;
    use crate::hmr::BufferedChannel;
    use crate::server::DevContext;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn context(root: &Path) -> (Arc<DevContext>, Arc<BufferedChannel>) {
        let channel = Arc::new(BufferedChannel::new());
        let ctx = DevContext::builder(DevConfig::new(root))
            .channel(channel.clone())
            .build();
        (Arc::new(ctx), channel)
    }

    /// Register a module whose url doubles as its backing file.
    fn module(ctx: &DevContext, url: &str) -> ModuleId {
        ctx.graph().ensure_entry(url, ctx.plugins()).unwrap()
    }

    fn change(path: &str) -> FileChangeEvent {
        FileChangeEvent {
            path: PathBuf::from(path),
            kind: FileChangeKind::Modify,
        }
    }

    #[tokio::test]
    async fn test_self_accepting_leaf() {
        let (ctx, channel) = context(Path::new("/project"));
        let a = module(&ctx, "/project/a.js");
        let b = module(&ctx, "/project/b.js");
        ctx.graph().update_module_info(a, &[b], &[], false);
        ctx.graph().update_module_info(b, &[], &[], true);
        ctx.graph()
            .store_transform_result(a, crate::transform::TransformOutput::new("a".into(), None), false);

        let outcome = handle_file_change(&ctx, &change("/project/b.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::Updates(1));

        let payloads = channel.drain();
        let HmrPayload::Update { updates } = &payloads[0] else {
            panic!("expected update payload");
        };
        assert_eq!(updates[0].path, "/project/b.js");
        assert_eq!(updates[0].accepted_path, "/project/b.js");
        assert_eq!(updates[0].kind, UpdateKind::Js);

        // B is its own boundary: A's cache stays warm
        assert!(ctx.graph().cached_transform(a, false).is_some());
        assert!(ctx.graph().last_hmr_timestamp(b) > 0);
    }

    #[tokio::test]
    async fn test_dep_accepting_parent() {
        let (ctx, channel) = context(Path::new("/project"));
        let a = module(&ctx, "/project/a.js");
        let b = module(&ctx, "/project/b.js");
        ctx.graph().update_module_info(a, &[b], &[b], false);
        for id in [a, b] {
            ctx.graph().store_transform_result(
                id,
                crate::transform::TransformOutput::new("x".into(), None),
                false,
            );
        }

        let outcome = handle_file_change(&ctx, &change("/project/b.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::Updates(1));

        let payloads = channel.drain();
        let HmrPayload::Update { updates } = &payloads[0] else {
            panic!("expected update payload");
        };
        assert_eq!(updates[0].path, "/project/a.js");
        assert_eq!(updates[0].accepted_path, "/project/b.js");

        // Both ends of the accept edge were refreshed
        assert!(ctx.graph().cached_transform(a, false).is_none());
        assert!(ctx.graph().cached_transform(b, false).is_none());
    }

    #[tokio::test]
    async fn test_dead_end_via_root_full_reload() {
        let (ctx, channel) = context(Path::new("/project"));
        let a = module(&ctx, "/project/a.js");
        let b = module(&ctx, "/project/b.js");
        ctx.graph().update_module_info(a, &[b], &[], false);

        let outcome = handle_file_change(&ctx, &change("/project/b.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::FullReload);
        assert_eq!(channel.drain(), vec![HmrPayload::FullReload { path: None }]);
    }

    #[tokio::test]
    async fn test_circular_import_full_reload() {
        let (ctx, channel) = context(Path::new("/project"));
        let a = module(&ctx, "/project/a.js");
        let b = module(&ctx, "/project/b.js");
        ctx.graph().update_module_info(a, &[b], &[], false);
        ctx.graph().update_module_info(b, &[a], &[], false);

        let outcome = handle_file_change(&ctx, &change("/project/a.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::FullReload);
        assert_eq!(channel.drain(), vec![HmrPayload::FullReload { path: None }]);
    }

    #[tokio::test]
    async fn test_css_bubble_through_preprocessor_importer() {
        let (ctx, channel) = context(Path::new("/project"));
        let main = module(&ctx, "/project/main.css");
        let tokens = module(&ctx, "/project/tokens.css");
        // Preprocessor-recorded edge: main.css imports tokens.css
        ctx.graph().update_module_info(main, &[tokens], &[], true);
        ctx.graph().update_module_info(tokens, &[], &[], true);
        for id in [main, tokens] {
            ctx.graph().store_transform_result(
                id,
                crate::transform::TransformOutput::new("x".into(), None),
                false,
            );
        }

        let outcome = handle_file_change(&ctx, &change("/project/tokens.css"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::Updates(2));

        let payloads = channel.drain();
        let HmrPayload::Update { updates } = &payloads[0] else {
            panic!("expected update payload");
        };
        let paths: Vec<&str> = updates.iter().map(|u| u.path.as_str()).collect();
        assert!(paths.contains(&"/project/tokens.css"));
        assert!(paths.contains(&"/project/main.css"));
        assert!(updates.iter().all(|u| u.kind == UpdateKind::Css));

        // The sheet inlines the changed file, so re-fetching it must not hit
        // the pre-change cache
        assert!(ctx.graph().cached_transform(tokens, false).is_none());
        assert!(ctx.graph().cached_transform(main, false).is_none());
    }

    #[tokio::test]
    async fn test_js_cannot_bubble_through_css_parent() {
        let (ctx, channel) = context(Path::new("/project"));
        let sheet = module(&ctx, "/project/theme.css?direct");
        let helper = module(&ctx, "/project/helper.js");
        // Only importer of the JS helper is a stylesheet
        ctx.graph().update_module_info(sheet, &[helper], &[], false);

        let outcome = handle_file_change(&ctx, &change("/project/helper.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::FullReload);
        channel.drain();
    }

    #[tokio::test]
    async fn test_mixed_css_js_importers() {
        let (ctx, channel) = context(Path::new("/project"));
        let helper = module(&ctx, "/project/helper.js");
        let sheet = module(&ctx, "/project/theme.css");
        let app = module(&ctx, "/project/app.js");
        // The stylesheet importer is a normal (self-accepting) CSS module
        ctx.graph().update_module_info(sheet, &[helper], &[], true);
        ctx.graph().update_module_info(app, &[helper], &[helper], false);

        // Mixed importers: each branch is walked independently. The CSS
        // branch terminates at the self-accepting sheet, the JS branch at
        // the dep-accepting app.
        let outcome = handle_file_change(&ctx, &change("/project/helper.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::Updates(2));

        let payloads = channel.drain();
        let HmrPayload::Update { updates } = &payloads[0] else {
            panic!("expected update payload");
        };
        let pairs: Vec<(&str, &str)> = updates
            .iter()
            .map(|u| (u.path.as_str(), u.accepted_path.as_str()))
            .collect();
        assert!(pairs.contains(&("/project/theme.css", "/project/theme.css")));
        assert!(pairs.contains(&("/project/app.js", "/project/helper.js")));
    }

    #[tokio::test]
    async fn test_unmapped_html_reloads_with_path() {
        let (ctx, channel) = context(Path::new("/project"));

        let outcome = handle_file_change(&ctx, &change("/project/admin/index.html"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::FullReload);
        assert_eq!(
            channel.drain(),
            vec![HmrPayload::FullReload {
                path: Some("/admin/index.html".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_unmapped_non_html_ignored() {
        let (ctx, channel) = context(Path::new("/project"));
        let outcome = handle_file_change(&ctx, &change("/project/README.md"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::Ignored);
        assert!(channel.drain().is_empty());
    }

    #[tokio::test]
    async fn test_config_change_requests_restart() {
        let channel = Arc::new(BufferedChannel::new());
        let mut config = DevConfig::new("/project");
        config.config_file = Some(PathBuf::from("/project/skerry.config.js"));
        let ctx = DevContext::builder(config).channel(channel.clone()).build();

        let outcome = handle_file_change(&ctx, &change("/project/skerry.config.js"))
            .await
            .unwrap();
        assert_eq!(outcome, FileChangeOutcome::Restart);
        assert!(channel.drain().is_empty());
    }

    #[tokio::test]
    async fn test_client_dir_change_reloads_everything() {
        let channel = Arc::new(BufferedChannel::new());
        let mut config = DevConfig::new("/project");
        config.client_dir = Some(PathBuf::from("/project/.skerry/client"));
        let ctx = DevContext::builder(config).channel(channel.clone()).build();

        let outcome =
            handle_file_change(&ctx, &change("/project/.skerry/client/runtime.js"))
                .await
                .unwrap();
        assert_eq!(outcome, FileChangeOutcome::FullReload);
        assert_eq!(
            channel.drain(),
            vec![HmrPayload::FullReload {
                path: Some("*".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_glob_importer_enqueued_on_add() {
        let (ctx, channel) = context(Path::new("/project"));
        let importer = module(&ctx, "/project/pages.js");
        ctx.graph().update_module_info(importer, &[], &[], true);
        ctx.register_glob_importer(
            PathBuf::from("/project/pages"),
            glob::Pattern::new("*.md").unwrap(),
            importer,
        );

        let event = FileChangeEvent {
            path: PathBuf::from("/project/pages/new-post.md"),
            kind: FileChangeKind::Add,
        };
        let outcome = handle_file_change(&ctx, &event).await.unwrap();
        assert_eq!(outcome, FileChangeOutcome::Updates(1));

        let payloads = channel.drain();
        let HmrPayload::Update { updates } = &payloads[0] else {
            panic!("expected update payload");
        };
        assert_eq!(updates[0].path, "/project/pages.js");
    }

    #[tokio::test]
    async fn test_prune_emitted_for_orphans() {
        let (ctx, channel) = context(Path::new("/project"));
        let a = module(&ctx, "/project/a.js");
        let b = module(&ctx, "/project/b.js");
        ctx.graph().update_module_info(a, &[b], &[], false);

        let orphans = ctx.graph().update_module_info(a, &[], &[], false);
        ctx.prune_modules(&orphans);

        let payloads = channel.drain();
        assert_eq!(
            payloads,
            vec![HmrPayload::Prune {
                paths: vec!["/project/b.js".to_string()]
            }]
        );
        assert!(ctx.graph().last_hmr_timestamp(b) > 0);
    }
}
