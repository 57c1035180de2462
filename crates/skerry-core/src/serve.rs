//! Transform-endpoint logic for the HTTP layer.
//!
//! The middleware chain itself is external; it hands every module request
//! here and maps the outcome onto HTTP. Query handling: `?import` marks
//! explicit import intent (stripped), `?t=<ms>` busts the browser cache
//! (stripped), `?direct` keeps CSS as a stylesheet. `If-None-Match` against
//! the cached etag short-circuits with 304. Source-map siblings (`.map`)
//! are served from the owning module's cached result.

use crate::client::{self, CLIENT_PATH};
use crate::error::CoreError;
use crate::graph::{is_css_request, remove_import_query};
use crate::hmr::{ErrorPayload, HmrPayload};
use crate::server::DevContext;
use crate::transform::TransformOptions;

/// Ping endpoint polled by the client while the server restarts.
pub const PING_PATH: &str = "/__skerry_ping";

/// A served module body.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedModule {
    pub code: String,
    pub content_type: &'static str,
    pub etag: Option<String>,
}

/// What the HTTP layer should answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ServeOutcome {
    /// 200 with the module body.
    Ok(ServedModule),
    /// 304, the client's cached copy matches.
    NotModified,
    /// 404.
    NotFound,
    /// 408 with an explanatory HTML body.
    PendingTimeout { html: String },
    /// 500; the error payload was also pushed to the client overlay.
    Failure { message: String },
}

/// Handle one `GET <url>` on the transform endpoint.
pub async fn serve_request(
    ctx: &DevContext,
    raw_url: &str,
    if_none_match: Option<&str>,
) -> ServeOutcome {
    let url = remove_import_query(raw_url);
    let path = url.split('?').next().unwrap_or(&url);

    if path == PING_PATH {
        return ServeOutcome::Ok(ServedModule {
            code: "pong".to_string(),
            content_type: "text/plain",
            etag: None,
        });
    }

    if path == CLIENT_PATH {
        return ServeOutcome::Ok(ServedModule {
            code: client::client_code(ctx.config()),
            content_type: "application/javascript",
            etag: None,
        });
    }

    if let Some(source_url) = path.strip_suffix(".map") {
        return serve_source_map(ctx, source_url);
    }

    let result = ctx.transform_request(&url, TransformOptions::default()).await;

    match result {
        Ok(Some(output)) => {
            if if_none_match.is_some_and(|tag| tag == output.etag) {
                return ServeOutcome::NotModified;
            }
            let content_type = if is_css_request(&url) && has_direct_query(&url) {
                "text/css"
            } else {
                "application/javascript"
            };
            ServeOutcome::Ok(ServedModule {
                code: output.code,
                content_type,
                etag: Some(output.etag),
            })
        }
        Ok(None) => ServeOutcome::NotFound,
        Err(e) => match &*e {
            CoreError::PendingReloadTimeout => ServeOutcome::PendingTimeout {
                html: PENDING_RELOAD_HTML.to_string(),
            },
            other => {
                let err = error_payload(other, &url);
                tracing::error!(url = %url, error = %other, "transform failed");
                ctx.send(&HmrPayload::Error { err });
                ServeOutcome::Failure {
                    message: other.to_string(),
                }
            }
        },
    }
}

fn serve_source_map(ctx: &DevContext, source_url: &str) -> ServeOutcome {
    let Ok(Some(id)) = ctx.graph().get_by_url(source_url, ctx.plugins()) else {
        return ServeOutcome::NotFound;
    };
    let Some(result) = ctx.graph().cached_transform(id, false) else {
        return ServeOutcome::NotFound;
    };
    match result.map {
        Some(map) => ServeOutcome::Ok(ServedModule {
            code: map.to_string(),
            content_type: "application/json",
            etag: None,
        }),
        None => ServeOutcome::NotFound,
    }
}

fn error_payload(err: &CoreError, url: &str) -> ErrorPayload {
    let plugin = match err {
        CoreError::PluginHook { plugin, .. } => Some(plugin.clone()),
        _ => None,
    };
    ErrorPayload {
        message: err.to_string(),
        stack: String::new(),
        id: Some(url.to_string()),
        frame: None,
        loc: None,
        plugin,
    }
}

fn has_direct_query(url: &str) -> bool {
    url.split('?')
        .nth(1)
        .is_some_and(|q| q.split('&').any(|p| p == "direct" || p.starts_with("direct=")))
}

const PENDING_RELOAD_HTML: &str = "\
<!doctype html>\n\
<title>408</title>\n\
<p>New dependencies were discovered and are being pre-bundled. \
This request waited too long for the bundle to finish; reload the page to retry.</p>\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevConfig;
    use crate::hmr::BufferedChannel;
    use std::path::Path;
    use std::sync::Arc;

    fn context(root: &Path) -> (DevContext, Arc<BufferedChannel>) {
        let channel = Arc::new(BufferedChannel::new());
        let ctx = DevContext::builder(DevConfig::new(root))
            .channel(channel.clone())
            .build();
        (ctx, channel)
    }

    #[tokio::test]
    async fn test_serves_module_with_etag() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.js");
        std::fs::write(&file, "export const x = 1;").unwrap();
        let (ctx, _) = context(dir.path());
        let url = file.display().to_string();

        let ServeOutcome::Ok(module) = serve_request(&ctx, &url, None).await else {
            panic!("expected 200");
        };
        assert_eq!(module.code, "export const x = 1;");
        assert_eq!(module.content_type, "application/javascript");
        let etag = module.etag.unwrap();

        // Conditional request with the matching etag: 304
        let outcome = serve_request(&ctx, &url, Some(&etag)).await;
        assert_eq!(outcome, ServeOutcome::NotModified);
    }

    #[tokio::test]
    async fn test_import_and_timestamp_queries_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dep.js");
        std::fs::write(&file, "export default 1;").unwrap();
        let (ctx, _) = context(dir.path());
        let url = format!("{}?import&t=12345", file.display());

        let ServeOutcome::Ok(module) = serve_request(&ctx, &url, None).await else {
            panic!("expected 200");
        };
        assert_eq!(module.code, "export default 1;");
        // One node, keyed without the ephemeral queries
        assert_eq!(ctx.graph().module_count(), 1);
    }

    #[tokio::test]
    async fn test_css_direct_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.css");
        std::fs::write(&file, "body { margin: 0; }").unwrap();
        let (ctx, _) = context(dir.path());

        let direct = format!("{}?direct", file.display());
        let ServeOutcome::Ok(module) = serve_request(&ctx, &direct, None).await else {
            panic!("expected 200");
        };
        assert_eq!(module.content_type, "text/css");
        assert_eq!(module.code, "body { margin: 0; }");

        let ServeOutcome::Ok(as_js) =
            serve_request(&ctx, &file.display().to_string(), None).await
        else {
            panic!("expected 200");
        };
        assert_eq!(as_js.content_type, "application/javascript");
    }

    #[tokio::test]
    async fn test_missing_module_404() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        let url = dir.path().join("ghost.js").display().to_string();
        assert_eq!(serve_request(&ctx, &url, None).await, ServeOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_client_runtime_served() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());

        let ServeOutcome::Ok(module) = serve_request(&ctx, CLIENT_PATH, None).await else {
            panic!("expected 200");
        };
        assert!(module.code.contains("createHotContext"));
        assert_eq!(module.content_type, "application/javascript");
    }

    #[tokio::test]
    async fn test_ping_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());
        let ServeOutcome::Ok(module) = serve_request(&ctx, PING_PATH, None).await else {
            panic!("expected 200");
        };
        assert_eq!(module.code, "pong");
    }

    #[tokio::test]
    async fn test_source_map_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(dir.path());

        let url = "/src/app.js";
        let id = ctx.graph().ensure_entry(url, ctx.plugins()).unwrap();
        ctx.graph().store_transform_result(
            id,
            crate::transform::TransformOutput::new(
                "code".to_string(),
                Some(serde_json::json!({ "version": 3, "mappings": "AAAA" })),
            ),
            false,
        );

        let ServeOutcome::Ok(map) = serve_request(&ctx, "/src/app.js.map", None).await else {
            panic!("expected 200");
        };
        assert_eq!(map.content_type, "application/json");
        assert!(map.code.contains("\"mappings\""));

        assert_eq!(
            serve_request(&ctx, "/src/other.js.map", None).await,
            ServeOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_transform_failure_pushes_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let public = dir.path().join("public");
        std::fs::create_dir_all(&public).unwrap();
        std::fs::write(public.join("data.json"), "{}").unwrap();
        let (ctx, channel) = context(dir.path());

        let outcome = serve_request(&ctx, "/data.json", None).await;
        assert!(matches!(outcome, ServeOutcome::Failure { .. }));

        let payloads = channel.drain();
        assert!(matches!(payloads[0], HmrPayload::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_reload_timeout_408() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.js");
        std::fs::write(&file, "export {};").unwrap();
        let (ctx, _) = context(dir.path());
        let _gate = ctx.begin_pending_reload();

        let outcome = serve_request(&ctx, &file.display().to_string(), None).await;
        assert!(matches!(outcome, ServeOutcome::PendingTimeout { .. }));

        // The client runtime bypasses the gate
        let outcome = serve_request(&ctx, CLIENT_PATH, None).await;
        assert!(matches!(outcome, ServeOutcome::Ok(_)));
    }
}
