//! End-to-end hot-update scenarios: real files on disk, the real transform
//! pipeline, and the propagator, with only the WebSocket and bundler seams
//! faked.

use skerry_core::bundler::{BundleOutput, BundledEntry, BundleRequest, DepBundler};
use skerry_core::config::DevConfig;
use skerry_core::error::CoreError;
use skerry_core::graph::ModuleId;
use skerry_core::hmr::propagate::{handle_file_change, FileChangeOutcome};
use skerry_core::hmr::{BufferedChannel, HmrPayload, UpdateKind};
use skerry_core::server::DevContext;
use skerry_core::transform::TransformOptions;
use skerry_core::watch::{FileChangeEvent, FileChangeKind};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    ctx: Arc<DevContext>,
    channel: Arc<BufferedChannel>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let channel = Arc::new(BufferedChannel::new());
        let ctx = Arc::new(
            DevContext::builder(DevConfig::new(&root))
                .channel(channel.clone())
                .build(),
        );
        Self {
            _dir: dir,
            root,
            ctx,
            channel,
        }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn url(&self, name: &str) -> String {
        self.root.join(name).display().to_string()
    }

    async fn transform(&self, name: &str) {
        self.ctx
            .transform_request(&self.url(name), TransformOptions::default())
            .await
            .unwrap()
            .unwrap();
    }

    fn node(&self, name: &str) -> ModuleId {
        self.ctx
            .graph()
            .get_by_url(&self.url(name), self.ctx.plugins())
            .unwrap()
            .unwrap()
    }

    async fn change(&self, name: &str) -> FileChangeOutcome {
        let event = FileChangeEvent {
            path: self.root.join(name),
            kind: FileChangeKind::Modify,
        };
        handle_file_change(&self.ctx, &event).await.unwrap()
    }

    fn sole_update_payload(&self) -> Vec<skerry_core::hmr::HmrUpdate> {
        let payloads = self.channel.drain();
        assert_eq!(payloads.len(), 1, "expected exactly one payload");
        match payloads.into_iter().next().unwrap() {
            HmrPayload::Update { updates } => updates,
            other => panic!("expected update payload, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn self_accepting_leaf_updates_in_place() {
    let h = Harness::new();
    h.write("a.js", "import './b.js';\nexport const a = 1;\n");
    h.write(
        "b.js",
        "export const b = 1;\nimport.meta.hot.accept(() => {});\n",
    );
    h.transform("a.js").await;
    h.transform("b.js").await;

    let a = h.node("a.js");
    let b = h.node("b.js");
    assert_eq!(h.ctx.graph().imported_of(a), vec![b]);

    let outcome = h.change("b.js").await;
    assert_eq!(outcome, FileChangeOutcome::Updates(1));

    let updates = h.sole_update_payload();
    assert_eq!(updates[0].kind, UpdateKind::Js);
    assert_eq!(updates[0].path, h.url("b.js"));
    assert_eq!(updates[0].accepted_path, h.url("b.js"));

    // B is its own boundary: the importer's cached transform survives
    assert!(h.ctx.graph().cached_transform(a, false).is_some());
    assert!(h.ctx.graph().cached_transform(b, false).is_none());
    assert!(h.ctx.graph().last_hmr_timestamp(b) > 0);
}

#[tokio::test]
async fn dep_accepting_parent_is_the_boundary() {
    let h = Harness::new();
    h.write(
        "a.js",
        "import './b.js';\nimport.meta.hot.accept('./b.js', () => {});\n",
    );
    h.write("b.js", "export const b = 1;\n");
    h.transform("a.js").await;
    h.transform("b.js").await;

    let a = h.node("a.js");
    let b = h.node("b.js");

    let outcome = h.change("b.js").await;
    assert_eq!(outcome, FileChangeOutcome::Updates(1));

    let updates = h.sole_update_payload();
    assert_eq!(updates[0].path, h.url("a.js"));
    assert_eq!(updates[0].accepted_path, h.url("b.js"));

    // Both sides of the accept edge were invalidated
    assert!(h.ctx.graph().cached_transform(a, false).is_none());
    assert!(h.ctx.graph().cached_transform(b, false).is_none());
}

#[tokio::test]
async fn unaccepted_root_forces_full_reload() {
    let h = Harness::new();
    h.write("a.js", "import './b.js';\n");
    h.write("b.js", "export const b = 1;\n");
    h.transform("a.js").await;
    h.transform("b.js").await;

    let outcome = h.change("b.js").await;
    assert_eq!(outcome, FileChangeOutcome::FullReload);
    assert_eq!(
        h.channel.drain(),
        vec![HmrPayload::FullReload { path: None }]
    );
}

#[tokio::test]
async fn circular_imports_force_full_reload() {
    let h = Harness::new();
    h.write("a.js", "import './b.js';\nexport const a = 1;\n");
    h.write("b.js", "import './a.js';\nexport const b = 1;\n");
    h.transform("a.js").await;
    h.transform("b.js").await;

    let outcome = h.change("a.js").await;
    assert_eq!(outcome, FileChangeOutcome::FullReload);
}

#[tokio::test]
async fn css_chain_collects_both_boundaries() {
    let h = Harness::new();
    h.write("main.css", "@import './tokens.css';\nbody { margin: 0; }\n");
    h.write("tokens.css", ":root { --blue: #00f; }\n");
    h.transform("main.css").await;
    h.transform("tokens.css").await;

    // Preprocessor-recorded dependency edge: main.css imports tokens.css
    let main = h.node("main.css");
    let tokens = h.node("tokens.css");
    h.ctx
        .graph()
        .update_module_info(main, &[tokens], &[], true);

    let outcome = h.change("tokens.css").await;
    assert_eq!(outcome, FileChangeOutcome::Updates(2));

    let updates = h.sole_update_payload();
    let paths: Vec<&str> = updates.iter().map(|u| u.path.as_str()).collect();
    assert!(paths.contains(&h.url("tokens.css").as_str()));
    assert!(paths.contains(&h.url("main.css").as_str()));
    assert!(updates.iter().all(|u| u.kind == UpdateKind::Css));

    // Both re-fetches triggered by the payload must rebuild: the sheet
    // inlines the changed tokens, so its pre-change cache is stale too
    assert!(h.ctx.graph().cached_transform(tokens, false).is_none());
    assert!(h.ctx.graph().cached_transform(main, false).is_none());
}

#[tokio::test]
async fn edge_symmetry_holds_after_reimports() {
    let h = Harness::new();
    h.write("a.js", "import './b.js';\nimport './c.js';\n");
    h.write("b.js", "export const b = 1;\n");
    h.write("c.js", "export const c = 1;\n");
    h.transform("a.js").await;

    // Drop one import and re-transform
    h.write("a.js", "import './b.js';\n");
    let a = h.node("a.js");
    h.ctx.graph().invalidate(a, 1);
    h.channel.drain();
    h.transform("a.js").await;

    // The orphaned module was announced as prunable
    let payloads = h.channel.drain();
    assert!(payloads.iter().any(|p| matches!(
        p,
        HmrPayload::Prune { paths } if paths == &vec![h.url("c.js")]
    )));

    // Invariant: every edge has its back-edge
    let graph = h.ctx.graph();
    for raw in 0..graph.module_count() {
        let id = ModuleId::from_raw(raw);
        for dep in graph.imported_of(id) {
            assert!(graph.importers_of(dep).contains(&id));
        }
        for importer in graph.importers_of(id) {
            assert!(graph.imported_of(importer).contains(&id));
        }
    }
}

/// Bundler fake for the runtime-discovery path.
struct StaticBundler;

impl DepBundler for StaticBundler {
    fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, CoreError> {
        let mut output = BundleOutput::default();
        for entry in &request.entries {
            let file = request.out_dir.join(format!("{}.js", entry.flat_id));
            std::fs::write(&file, "export default {};").unwrap();
            output.entries.insert(
                entry.flat_id.clone(),
                BundledEntry {
                    file,
                    exports: vec!["default".to_string()],
                },
            );
        }
        Ok(output)
    }
}

#[tokio::test]
async fn runtime_discovered_dep_rebundles_and_reloads() {
    let h = Harness::new();
    let dep_src = h.root.join("node_modules/lodash-es/lodash.js");
    std::fs::create_dir_all(dep_src.parent().unwrap()).unwrap();
    std::fs::write(&dep_src, "export default {};").unwrap();

    let mut new_deps = BTreeMap::new();
    new_deps.insert("lodash-es".to_string(), dep_src.clone());

    h.ctx
        .discover_new_deps(new_deps, &StaticBundler)
        .await
        .unwrap();

    let metadata = h.ctx.dep_metadata().unwrap();
    assert_eq!(metadata.optimized["lodash-es"].src, dep_src);
    assert!(metadata.optimized["lodash-es"].file.exists());
    assert_eq!(metadata.browser_hash.len(), 8);

    // The page can't patch in a brand-new dependency: full reload
    assert_eq!(
        h.channel.drain(),
        vec![HmrPayload::FullReload { path: None }]
    );

    // The gate has been released: requests flow again
    h.ctx.wait_for_pending_reload().await.unwrap();
}

#[tokio::test]
async fn in_flight_requests_wait_for_rebundle_gate() {
    let h = Harness::new();
    h.write("main.js", "export const x = 1;\n");
    let url = h.url("main.js");

    let gate = h.ctx.begin_pending_reload();

    let ctx = h.ctx.clone();
    let waiter = tokio::spawn(async move {
        ctx.transform_request(&url, TransformOptions::default()).await
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    h.ctx.finish_pending_reload(gate);
    let result = waiter.await.unwrap();
    assert!(result.unwrap().is_some());
}

#[tokio::test]
async fn virtual_import_only_files_participate_via_fs_urls() {
    let h = Harness::new();
    let tokens = h.write("tokens.scss", "$blue: #00f;\n");

    // A preprocessor dependency with no URL of its own still gets a node so
    // file events can reach its importers
    let node = h.ctx.graph().ensure_fs_entry(&tokens);
    let url = h.ctx.graph().url_of(node);
    assert!(url.starts_with("/@fs/"));
    assert_eq!(
        h.ctx.graph().get_by_file(&tokens.display().to_string()),
        vec![node]
    );

    let main = h.ctx.graph().ensure_entry("/main.css", h.ctx.plugins()).unwrap();
    h.ctx.graph().update_module_info(main, &[node], &[], true);

    let event = FileChangeEvent {
        path: tokens.clone(),
        kind: FileChangeKind::Modify,
    };
    let outcome = handle_file_change(&h.ctx, &event).await.unwrap();
    // The scss node bubbles to its self-accepting CSS importer
    assert_eq!(outcome, FileChangeOutcome::Updates(1));
    let updates = h.sole_update_payload();
    assert_eq!(updates[0].path, "/main.css");
}

#[tokio::test]
async fn plugin_transform_failure_leaves_other_caches_intact() {
    use skerry_core::plugin::{
        HookResult, Plugin, PluginContainer, PluginContext, PluginError, TransformResult,
    };

    struct FailOn(&'static str);
    impl Plugin for FailOn {
        fn name(&self) -> &str {
            "test:fail-on"
        }
        fn transform(
            &self,
            _code: &str,
            id: &str,
            _ctx: &PluginContext,
        ) -> HookResult<Option<TransformResult>> {
            if id.ends_with(self.0) {
                return Err(PluginError::new("test:fail-on", "transform", "boom"));
            }
            Ok(None)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    std::fs::write(root.join("good.js"), "export const g = 1;").unwrap();
    std::fs::write(root.join("bad.js"), "export const b = 1;").unwrap();

    let mut plugins = PluginContainer::new(root.clone());
    plugins.add(Box::new(FailOn("bad.js")));
    let ctx = DevContext::builder(DevConfig::new(&root)).plugins(plugins).build();

    let good_url = root.join("good.js").display().to_string();
    let bad_url = root.join("bad.js").display().to_string();

    ctx.transform_request(&good_url, TransformOptions::default())
        .await
        .unwrap()
        .unwrap();

    let err = ctx
        .transform_request(&bad_url, TransformOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(*err, CoreError::PluginHook { .. }));

    // The failed module cached nothing; the good one kept its result
    let good = ctx.graph().get_by_url(&good_url, ctx.plugins()).unwrap().unwrap();
    assert!(ctx.graph().cached_transform(good, false).is_some());
    let bad = ctx.graph().get_by_url(&bad_url, ctx.plugins()).unwrap();
    assert!(bad.is_none() || ctx.graph().cached_transform(bad.unwrap(), false).is_none());
}

#[tokio::test]
async fn server_restart_drains_in_flight_requests() {
    let h = Harness::new();
    h.write("a.js", "export const a = 1;\n");
    h.transform("a.js").await;
    h.ctx.drain().await;
}

fn _assert_send_sync<T: Send + Sync>() {}

#[test]
fn context_is_shareable() {
    _assert_send_sync::<DevContext>();
    _assert_send_sync::<skerry_core::graph::ModuleGraph>();
}
