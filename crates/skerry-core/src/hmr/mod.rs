//! Hot-module-replacement engine: wire payloads, the accept-dep lexer, and
//! the update propagator.
//!
//! The WebSocket itself is external; the core produces [`HmrPayload`] values
//! and pushes them through the [`HmrChannel`] seam. Payloads serialize to the
//! Vite-compatible JSON protocol (subprotocol [`HMR_SUBPROTOCOL`]).

pub mod lexer;
pub mod propagate;

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// WebSocket subprotocol spoken by the client runtime.
pub const HMR_SUBPROTOCOL: &str = "vite-hmr";

/// Server → client payload, union by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    /// Handshake acknowledgement; no body.
    Connected,
    /// Partial update: every entry names a boundary module and the accepted
    /// dep that reached it.
    Update { updates: Vec<HmrUpdate> },
    /// Full page reload. `path` restricts the reload to pages under an HTML
    /// file's path.
    FullReload {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Modules no longer imported; the client runs their dispose/prune hooks.
    Prune { paths: Vec<String> },
    /// Free-form plugin event.
    Custom {
        event: String,
        data: serde_json::Value,
    },
    /// Transform error, rendered by the client overlay.
    Error { err: ErrorPayload },
}

/// One update entry inside an [`HmrPayload::Update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmrUpdate {
    /// `js-update` or `css-update`, from the boundary module's kind.
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub timestamp: u64,
    /// URL of the boundary module.
    pub path: String,
    /// URL of the accepted dep that changed.
    #[serde(rename = "acceptedPath")]
    pub accepted_path: String,
}

/// Flavor of a hot update, following the boundary's module kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    #[serde(rename = "js-update")]
    Js,
    #[serde(rename = "css-update")]
    Css,
}

/// Error body shipped to the client overlay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub stack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loc: Option<ErrorLoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

/// Source position attached to an error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// Seam to the external WebSocket layer.
pub trait HmrChannel: Send + Sync {
    fn send(&self, payload: &HmrPayload);
}

/// Channel that buffers payloads in memory. Useful for tests and for
/// embedders that drain on their own schedule.
#[derive(Default)]
pub struct BufferedChannel {
    payloads: Mutex<Vec<HmrPayload>>,
}

impl BufferedChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent so far.
    pub fn drain(&self) -> Vec<HmrPayload> {
        std::mem::take(&mut *self.payloads.lock().unwrap())
    }
}

impl HmrChannel for BufferedChannel {
    fn send(&self, payload: &HmrPayload) {
        self.payloads.lock().unwrap().push(payload.clone());
    }
}

/// Milliseconds since the Unix epoch; the HMR timestamp clock.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_payload_wire_shape() {
        let payload = HmrPayload::Update {
            updates: vec![HmrUpdate {
                kind: UpdateKind::Js,
                timestamp: 123,
                path: "/src/App.tsx".to_string(),
                accepted_path: "/src/dep.ts".to_string(),
            }],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["updates"][0]["type"], "js-update");
        assert_eq!(json["updates"][0]["path"], "/src/App.tsx");
        assert_eq!(json["updates"][0]["acceptedPath"], "/src/dep.ts");
    }

    #[test]
    fn test_full_reload_omits_null_path() {
        let json = serde_json::to_string(&HmrPayload::FullReload { path: None }).unwrap();
        assert_eq!(json, r#"{"type":"full-reload"}"#);

        let json = serde_json::to_value(HmrPayload::FullReload {
            path: Some("/admin/index.html".to_string()),
        })
        .unwrap();
        assert_eq!(json["path"], "/admin/index.html");
    }

    #[test]
    fn test_error_payload_shape() {
        let payload = HmrPayload::Error {
            err: ErrorPayload {
                message: "boom".to_string(),
                stack: "at x".to_string(),
                plugin: Some("skerry:json".to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["err"]["message"], "boom");
        assert!(json["err"].get("loc").is_none());
    }

    #[test]
    fn test_buffered_channel_drains() {
        let channel = BufferedChannel::new();
        channel.send(&HmrPayload::Connected);
        channel.send(&HmrPayload::Prune {
            paths: vec!["/a.js".to_string()],
        });
        let drained = channel.drain();
        assert_eq!(drained.len(), 2);
        assert!(channel.drain().is_empty());
    }
}
