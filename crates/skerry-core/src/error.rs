use std::path::PathBuf;
use thiserror::Error;

/// Core error type for skerry operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unresolvable bare imports found while scanning. One error lists all
    /// offenders so the user fixes them in a single pass.
    #[error("The following dependencies could not be resolved:\n{}", format_missing(.missing))]
    MissingDeps { missing: Vec<(String, String)> },

    #[error("[{plugin}] {hook}: {message}")]
    PluginHook {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("hot-accept syntax error at offset {pos}: {message}")]
    AcceptLexer { pos: usize, message: String },

    #[error(
        "{path} is in the public directory and must be referenced by URL, \
         not imported from source code"
    )]
    PublicDirImport { path: String },

    #[error("timed out waiting for the dependency optimizer; reload the page to retry")]
    PendingReloadTimeout,

    #[error("dependency optimization failed: {0}")]
    Optimizer(String),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

fn format_missing(missing: &[(String, String)]) -> String {
    missing
        .iter()
        .map(|(id, importer)| format!("  {id} (imported by {importer})"))
        .collect::<Vec<_>>()
        .join("\n")
}
