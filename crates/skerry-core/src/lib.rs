//! Core of the skerry unbundled dev server.
//!
//! Serves individual ES modules on demand instead of a single bundle. Each
//! request runs a plugin-driven resolve → load → transform pipeline over a
//! shared module graph; file changes propagate through the graph to compute
//! minimal hot-update boundaries or fall back to a full page reload.
//!
//! The crate deliberately stops at well-defined seams: the HTTP router,
//! WebSocket framing, the fs watcher, and the bundler used for dependency
//! pre-bundling are external collaborators (see [`hmr::HmrChannel`],
//! [`watch`], and [`bundler::DepBundler`]).

pub mod bundler;
pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod optimizer;
pub mod plugin;
pub mod serve;
pub mod server;
pub mod transform;
pub mod watch;

pub use config::DevConfig;
pub use error::CoreError;
pub use graph::{ModuleGraph, ModuleId, ModuleKind};
pub use hmr::{HmrChannel, HmrPayload};
pub use plugin::{Plugin, PluginContainer};
pub use server::DevContext;
pub use transform::{TransformOptions, TransformOutput};
