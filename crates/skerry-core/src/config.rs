//! Resolved dev-server configuration.
//!
//! Config *loading* (config files, CLI flags, env cascades) happens in the
//! embedding server; the core consumes the already-resolved values below.
//! The optimizer hashes a stable subset of these fields so that a config
//! change invalidates the dependency cache.

use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolved dev-server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevConfig {
    /// Root directory of the project.
    pub root: PathBuf,
    /// Base public path.
    pub base: String,
    /// Mode string ("development", "production", ...).
    pub mode: String,
    /// Directory of files served verbatim at `/`. Files here must not be
    /// imported from source code.
    pub public_dir: PathBuf,
    /// Cache directory for pre-bundled dependencies.
    pub cache_dir: PathBuf,
    /// The config file backing this configuration, if any, plus every file it
    /// imported. A change to any of them restarts the server.
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub config_dependencies: Vec<PathBuf>,
    /// Directory the client runtime is served from, when it lives on disk.
    /// An edit there invalidates every open page at once.
    #[serde(default)]
    pub client_dir: Option<PathBuf>,
    /// `.env` files feeding `import.meta.env`. A change restarts the server
    /// when env handling is enabled.
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub env_reload: bool,
    /// Custom define replacements (like `process.env.NODE_ENV`).
    #[serde(default)]
    pub define: HashMap<String, String>,
    /// Additional filesystem roots the pipeline may read from besides `root`.
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,
    /// Resolve options.
    #[serde(default)]
    pub resolve: ResolveOptions,
    /// Dependency optimizer options.
    #[serde(default)]
    pub optimize: OptimizeOptions,
    /// HMR client settings, injected into the served client runtime.
    #[serde(default)]
    pub hmr: HmrOptions,
}

impl DevConfig {
    /// Create a config with defaults for the given project root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            base: "/".to_string(),
            mode: "development".to_string(),
            public_dir: root.join("public"),
            cache_dir: root.join(".skerry").join("deps"),
            client_dir: None,
            config_file: None,
            config_dependencies: Vec::new(),
            env_files: Vec::new(),
            env_reload: true,
            define: HashMap::default(),
            allowed_roots: Vec::new(),
            resolve: ResolveOptions::default(),
            optimize: OptimizeOptions::default(),
            hmr: HmrOptions::default(),
            root,
        }
    }

    /// Whether `path` may be read by the transform pipeline's disk fallback.
    #[must_use]
    pub fn is_file_serving_allowed(&self, path: &Path) -> bool {
        path.starts_with(&self.root) || self.allowed_roots.iter().any(|r| path.starts_with(r))
    }

    /// Whether `path` lies inside the public directory.
    #[must_use]
    pub fn is_in_public_dir(&self, path: &Path) -> bool {
        path.starts_with(&self.public_dir)
    }

    /// Whether `file` is the config file or one of its recorded dependencies.
    #[must_use]
    pub fn is_config_dependency(&self, file: &Path) -> bool {
        self.config_file.as_deref() == Some(file)
            || self.config_dependencies.iter().any(|d| d == file)
    }

    /// Whether `file` is a watched env file.
    #[must_use]
    pub fn is_env_file(&self, file: &Path) -> bool {
        self.env_files.iter().any(|f| f == file)
    }
}

/// Module resolution options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// Extensions probed when a specifier has none, in priority order.
    pub extensions: Vec<String>,
    /// Import aliases (e.g. `@` → `./src`).
    #[serde(default)]
    pub alias: HashMap<String, String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            extensions: ["ts", "tsx", "js", "jsx", "mjs", "json"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            alias: HashMap::default(),
        }
    }
}

/// Dependency optimizer options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizeOptions {
    /// Entry globs, relative to root. Highest precedence for scan entry
    /// discovery; falls back to bundler inputs, then `**/*.html`.
    #[serde(default)]
    pub entries: Vec<String>,
    /// Bundler input list (second precedence for entry discovery).
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// Bare ids always pre-bundled even when linked outside node_modules.
    #[serde(default)]
    pub include: Vec<String>,
    /// Bare ids never pre-bundled (treated as external).
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Re-bundle even when the metadata hash matches.
    #[serde(default)]
    pub force: bool,
}

/// HMR client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmrOptions {
    /// `ws` or `wss`; the client falls back to the page scheme when empty.
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub hostname: String,
    pub port: u16,
    /// Keepalive ping interval in milliseconds.
    pub timeout_ms: u64,
    pub overlay: bool,
}

impl Default for HmrOptions {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            hostname: String::new(),
            port: 3000,
            timeout_ms: 30_000,
            overlay: true,
        }
    }
}

fn default_true() -> bool {
    true
}
