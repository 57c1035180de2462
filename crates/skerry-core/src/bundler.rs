//! Seam to the external bundler used for dependency pre-bundling.
//!
//! The core never bundles; it prepares a [`BundleRequest`] (flat entry ids,
//! define map, ESM + splitting + source maps) and consumes the metafile-like
//! [`BundleOutput`] the driver reports back. Production deployments back
//! this trait with a real bundler process; tests use an in-memory fake.

use crate::error::CoreError;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One dependency entry to bundle.
#[derive(Debug, Clone)]
pub struct BundleEntry {
    /// Filename-safe id (see [`flatten_id`]).
    pub flat_id: String,
    /// Resolved source file of the dependency.
    pub src: PathBuf,
}

/// A single pre-bundling pass over all discovered dependencies.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub entries: Vec<BundleEntry>,
    /// Output directory; the driver writes `<flat-id>.js`, `.js.map`, and
    /// shared chunks here.
    pub out_dir: PathBuf,
    /// Replacements applied during bundling. Always carries
    /// `process.env.NODE_ENV`; user defines are merged on top.
    pub define: BTreeMap<String, String>,
    pub sourcemap: bool,
    pub splitting: bool,
}

/// What the bundler reports for one entry, distilled from its metafile.
#[derive(Debug, Clone, Default)]
pub struct BundledEntry {
    /// Output file for this entry.
    pub file: PathBuf,
    /// Names exported by the bundled output.
    pub exports: Vec<String>,
}

/// Result of a bundling pass, keyed by flat id.
#[derive(Debug, Clone, Default)]
pub struct BundleOutput {
    pub entries: BTreeMap<String, BundledEntry>,
}

/// Driver for the external bundler.
pub trait DepBundler: Send + Sync {
    /// Bundle every entry in one invocation, ESM output with code splitting.
    fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, CoreError>;
}

/// Flatten a dependency id into a filename-safe form: `/` and `>` become
/// `_`, so `@scope/pkg` lands at `@scope_pkg.js` and nested-plugin ids like
/// `plugin > dep` stay unambiguous.
#[must_use]
pub fn flatten_id(id: &str) -> String {
    id.replace(['/', '>'], "_")
}
