//! Dependency optimizer: pre-bundles third-party dependencies into the
//! cache directory in one amortized pass.
//!
//! The pass is keyed by a content hash over the lockfile and the relevant
//! config subset; when nothing changed, the previous bundle is reused
//! outright. A second, shorter `browser_hash` folds the dep list in, so
//! newly discovered runtime deps invalidate browser-side URLs without
//! touching still-valid disk artifacts.

pub mod exports;
pub mod scan;

use crate::bundler::{flatten_id, BundleEntry, BundleRequest, DepBundler};
use crate::config::DevConfig;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Metadata file inside the cache directory.
pub const METADATA_FILE: &str = "_metadata.json";

/// Dep ids that always need interop wrapping regardless of what their
/// sources look like.
const KNOWN_INTEROP_IDS: &[&str] = &["react", "react-dom", "moment"];

/// Persisted record of one optimizer pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepMetadata {
    /// Hash of lockfile + config subset. Matching hash ⇒ pass skipped.
    pub hash: String,
    /// `hash(main_hash + deps)` prefix; embedded in browser-facing URLs.
    pub browser_hash: String,
    /// raw id → bundled artifact info.
    pub optimized: BTreeMap<String, OptimizedDep>,
}

/// One pre-bundled dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedDep {
    /// Bundled output file inside the cache directory.
    pub file: PathBuf,
    /// Resolved source entry the bundle was built from.
    pub src: PathBuf,
    /// Whether consumers need CJS interop wrapping.
    pub needs_interop: bool,
}

/// Load previously persisted metadata, if the cache directory has any.
#[must_use]
pub fn load_metadata(cache_dir: &Path) -> Option<DepMetadata> {
    let raw = std::fs::read_to_string(cache_dir.join(METADATA_FILE)).ok()?;
    match serde_json::from_str(&raw) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable optimizer metadata");
            None
        }
    }
}

/// Run the optimizer.
///
/// With `new_deps` (the runtime-discovery path) the scanner is skipped and
/// the given map is bundled as-is. Without `force`, a matching metadata hash
/// short-circuits the pass entirely.
///
/// # Errors
/// [`CoreError::MissingDeps`] when the scan hit unresolvable bare imports;
/// bundler and IO failures propagate. On error the previous cache directory
/// contents may be gone but the previous *metadata* object held by the
/// caller stays valid for serving.
pub fn optimize(
    config: &DevConfig,
    plugin_names: &[String],
    bundler: &dyn DepBundler,
    force: bool,
    new_deps: Option<BTreeMap<String, PathBuf>>,
) -> Result<DepMetadata, CoreError> {
    let main_hash = compute_main_hash(config, plugin_names);

    if !force {
        if let Some(previous) = load_metadata(&config.cache_dir) {
            if previous.hash == main_hash {
                tracing::debug!(hash = %main_hash, "dependency cache up to date");
                return Ok(previous);
            }
        }
    }

    let deps = match new_deps {
        Some(deps) => deps,
        None => {
            let result = scan::DepScanner::new(config).scan();
            if !result.missing.is_empty() {
                return Err(CoreError::MissingDeps {
                    missing: result.missing.into_iter().collect(),
                });
            }
            result.deps
        }
    };

    // Fresh cache directory with an ESM marker for everything inside it
    if config.cache_dir.exists() {
        std::fs::remove_dir_all(&config.cache_dir)?;
    }
    std::fs::create_dir_all(&config.cache_dir)?;
    skerry_util::atomic_write(
        &config.cache_dir.join("package.json"),
        b"{\n  \"type\": \"module\"\n}\n",
    )?;

    let browser_hash = compute_browser_hash(&main_hash, &deps);

    if deps.is_empty() {
        let metadata = DepMetadata {
            hash: main_hash,
            browser_hash,
            optimized: BTreeMap::new(),
        };
        persist(&config.cache_dir, &metadata)?;
        return Ok(metadata);
    }

    // Export surfaces drive the interop decision below
    let mut source_scans = BTreeMap::new();
    for (id, src) in &deps {
        let source = skerry_util::read_to_string_lossy(src).map_err(|e| CoreError::Load {
            path: src.clone(),
            source: e,
        })?;
        source_scans.insert(id.clone(), exports::scan_exports(&source));
    }

    let mut define = BTreeMap::new();
    define.insert(
        "process.env.NODE_ENV".to_string(),
        format!("\"{}\"", config.mode),
    );
    define.extend(
        config
            .define
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let request = BundleRequest {
        entries: deps
            .iter()
            .map(|(id, src)| BundleEntry {
                flat_id: flatten_id(id),
                src: src.clone(),
            })
            .collect(),
        out_dir: config.cache_dir.clone(),
        define,
        sourcemap: true,
        splitting: true,
    };

    tracing::info!(deps = deps.len(), "pre-bundling dependencies");
    let output = bundler.bundle(&request)?;

    let mut optimized = BTreeMap::new();
    for (id, src) in &deps {
        let flat = flatten_id(id);
        let bundled = output.entries.get(&flat).cloned().unwrap_or_default();
        let file = if bundled.file.as_os_str().is_empty() {
            config.cache_dir.join(format!("{flat}.js"))
        } else {
            bundled.file
        };
        let source_scan = &source_scans[id];
        let needs_interop = KNOWN_INTEROP_IDS.contains(&id.as_str())
            || source_scan.looks_like_cjs()
            || (bundled.exports == ["default"] && source_scan.exports != ["default"]);

        optimized.insert(
            id.clone(),
            OptimizedDep {
                file,
                src: src.clone(),
                needs_interop,
            },
        );
    }

    let metadata = DepMetadata {
        hash: main_hash,
        browser_hash,
        optimized,
    };
    persist(&config.cache_dir, &metadata)?;
    Ok(metadata)
}

fn persist(cache_dir: &Path, metadata: &DepMetadata) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| CoreError::Optimizer(e.to_string()))?;
    skerry_util::atomic_write(&cache_dir.join(METADATA_FILE), json.as_bytes())?;
    Ok(())
}

/// Lockfile names checked at the project root, in priority order.
const LOCKFILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
];

/// Hash of everything that invalidates the dependency bundle wholesale:
/// the lockfile plus the config subset the bundle depends on.
fn compute_main_hash(config: &DevConfig, plugin_names: &[String]) -> String {
    let mut hasher_input = String::new();

    for name in LOCKFILES {
        let path = config.root.join(name);
        if let Ok(content) = std::fs::read(&path) {
            hasher_input.push_str(&skerry_util::blake3_bytes(&content));
            break;
        }
    }

    let subset = serde_json::json!({
        "mode": config.mode,
        "root": config.root,
        "resolve": config.resolve,
        "define": config.define,
        "plugins": plugin_names,
        "include": config.optimize.include,
        "exclude": config.optimize.exclude,
    });
    hasher_input.push_str(&subset.to_string());

    skerry_util::blake3_bytes(hasher_input.as_bytes())
}

fn compute_browser_hash(main_hash: &str, deps: &BTreeMap<String, PathBuf>) -> String {
    let deps_json = serde_json::to_string(deps).unwrap_or_default();
    let digest = skerry_util::blake3_bytes(format!("{main_hash}{deps_json}").as_bytes());
    digest[..8].to_string()
}
