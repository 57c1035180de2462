//! Dependency scanner: crawls entry HTML/JS to enumerate bare-module
//! imports for the optimizer.
//!
//! Entry precedence: explicit `optimize.entries` globs, then the bundler
//! input list, then every `*.html` under the root. The crawl follows
//! project source (including linked packages outside `node_modules`) and
//! records every bare import that lands in `node_modules` (or is explicitly
//! included) as a dependency to pre-bundle. Unresolvable bare imports are
//! collected in `missing` for one aggregate diagnostic.

use crate::config::DevConfig;
use crate::transform::extract_import_urls;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// What the crawl found.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// raw id → resolved entry file.
    pub deps: BTreeMap<String, PathBuf>,
    /// raw id → importer that referenced it.
    pub missing: BTreeMap<String, String>,
}

/// Seam to the external `import.meta.glob` transformer: files using glob
/// imports are rewritten to plain imports before the crawl reads them.
pub trait GlobRewriter: Send + Sync {
    fn rewrite(&self, code: &str, file: &Path) -> String;
}

/// Crawling dependency scanner.
pub struct DepScanner<'a> {
    config: &'a DevConfig,
    glob_rewriter: Option<&'a dyn GlobRewriter>,
}

impl<'a> DepScanner<'a> {
    #[must_use]
    pub fn new(config: &'a DevConfig) -> Self {
        Self {
            config,
            glob_rewriter: None,
        }
    }

    #[must_use]
    pub fn with_glob_rewriter(mut self, rewriter: &'a dyn GlobRewriter) -> Self {
        self.glob_rewriter = Some(rewriter);
        self
    }

    /// Discover crawl entry points.
    ///
    /// Precedence: explicit entry globs > bundler inputs > `**/*.html`.
    /// Only existing JS- or HTML-like files qualify.
    #[must_use]
    pub fn discover_entries(&self) -> Vec<PathBuf> {
        let root = &self.config.root;

        if !self.config.optimize.entries.is_empty() {
            let mut entries = Vec::new();
            for pattern in &self.config.optimize.entries {
                let full = root.join(pattern).display().to_string();
                let Ok(paths) = glob::glob(&full) else {
                    tracing::warn!(pattern = %pattern, "invalid entry glob");
                    continue;
                };
                for path in paths.flatten() {
                    if is_scannable(&path) {
                        entries.push(path);
                    }
                }
            }
            return entries;
        }

        if !self.config.optimize.inputs.is_empty() {
            return self
                .config
                .optimize
                .inputs
                .iter()
                .map(|p| if p.is_absolute() { p.clone() } else { root.join(p) })
                .filter(|p| is_scannable(p))
                .collect();
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || (name != "node_modules" && !name.starts_with('.'))
            })
            .flatten()
        {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "html") {
                entries.push(path.to_path_buf());
            }
        }
        entries.sort();
        entries
    }

    /// Crawl from the discovered entries.
    pub fn scan(&self) -> ScanResult {
        let mut result = ScanResult::default();
        let mut visited: FxHashSet<PathBuf> = FxHashSet::default();
        let mut queue = self.discover_entries();

        tracing::debug!(entries = queue.len(), "dependency scan starting");

        while let Some(file) = queue.pop() {
            if !visited.insert(file.clone()) {
                continue;
            }
            let Ok(raw) = skerry_util::read_to_string_lossy(&file) else {
                continue;
            };

            let source = if is_html_like(&file) {
                extract_scripts(&raw, &file)
            } else {
                raw
            };
            let source = match self.glob_rewriter {
                Some(rewriter) if source.contains("import.meta.glob") => {
                    rewriter.rewrite(&source, &file)
                }
                _ => source,
            };

            for spec in extract_import_urls(&source) {
                self.classify(&spec, &file, &mut result, &mut queue);
            }
        }

        tracing::debug!(
            deps = result.deps.len(),
            missing = result.missing.len(),
            "dependency scan finished"
        );
        result
    }

    fn classify(
        &self,
        spec: &str,
        importer: &Path,
        result: &mut ScanResult,
        queue: &mut Vec<PathBuf>,
    ) {
        // Never traversed: remote URLs, inlined data, styles, assets, and
        // query variants the server handles specially
        if is_external_url(spec) || is_css_like(spec) || is_asset(spec) || has_special_query(spec)
        {
            return;
        }

        if is_bare_specifier(spec) {
            if self.config.optimize.exclude.iter().any(|e| e == spec) {
                return;
            }
            match resolve_bare(spec, importer, &self.config.root) {
                Some(resolved) => {
                    let included = self.config.optimize.include.iter().any(|i| i == spec);
                    // Canonicalize so a linked package manifest pointing back
                    // into source (entry with `..` segments) is not mistaken
                    // for a node_modules path
                    let canonical = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
                    let in_node_modules = canonical
                        .components()
                        .any(|c| c.as_os_str() == "node_modules");
                    if included || in_node_modules {
                        result.deps.insert(spec.to_string(), resolved);
                    } else {
                        // Linked source: keep crawling through it
                        queue.push(canonical);
                    }
                }
                None => {
                    result
                        .missing
                        .entry(spec.to_string())
                        .or_insert_with(|| importer.display().to_string());
                }
            }
            return;
        }

        // Relative / root-absolute: follow into project source
        let base = if let Some(rel) = spec.strip_prefix('/') {
            self.config.root.join(rel)
        } else {
            importer
                .parent()
                .unwrap_or(Path::new("/"))
                .join(spec)
        };
        if let Some(resolved) = probe_file(&base, &self.config.resolve.extensions) {
            if is_scannable(&resolved) {
                queue.push(resolved);
            }
        }
    }
}

// ============================================================================
// Specifier classification
// ============================================================================

fn is_bare_specifier(spec: &str) -> bool {
    let mut chars = spec.chars();
    match chars.next() {
        Some('@') => true,
        Some(c) => c.is_alphanumeric() || c == '_',
        None => false,
    }
}

fn is_external_url(spec: &str) -> bool {
    // Any scheme-prefixed specifier: http(s), data, node builtins, virtual
    // plugin namespaces
    spec.starts_with("//")
        || spec
            .split('/')
            .next()
            .is_some_and(|head| head.contains(':'))
}

const CSS_LIKE: &[&str] = &[
    ".css", ".less", ".sass", ".scss", ".styl", ".stylus", ".pcss", ".postcss",
];

fn is_css_like(spec: &str) -> bool {
    let path = spec.split('?').next().unwrap_or(spec);
    CSS_LIKE.iter().any(|ext| path.ends_with(ext))
}

const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".avif", ".mp4", ".webm", ".ogg",
    ".mp3", ".wav", ".flac", ".aac", ".woff", ".woff2", ".eot", ".ttf", ".otf", ".wasm", ".pdf",
    ".json",
];

fn is_asset(spec: &str) -> bool {
    let path = spec.split('?').next().unwrap_or(spec).to_lowercase();
    ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn has_special_query(spec: &str) -> bool {
    let Some(query) = spec.split('?').nth(1) else {
        return false;
    };
    query
        .split('&')
        .any(|p| matches!(p.split('=').next(), Some("worker" | "raw" | "url")))
}

const SCANNABLE_JS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs", "mts", "cts"];
const HTML_LIKE: &[&str] = &["html", "vue", "svelte", "astro"];

fn is_html_like(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| HTML_LIKE.contains(&ext))
}

fn is_scannable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| SCANNABLE_JS.contains(&ext) || HTML_LIKE.contains(&ext))
}

// ============================================================================
// Script extraction from HTML-like files
// ============================================================================

/// Pull JavaScript out of an HTML-like file.
///
/// Plain HTML contributes `<script type="module">` bodies; SFC flavors
/// (vue/svelte/astro) contribute every `<script>` body. `src=` references
/// become side-effect imports. Inline scripts with a non-JS `type`
/// (e.g. `application/ld+json`) are skipped.
///
/// For SFC flavors, bindings the template markup references get a bare
/// `import "…";` appendix so a dead-code-eliminating crawl driver still
/// reaches their sources even when the script body never uses them.
fn extract_scripts(html: &str, file: &Path) -> String {
    let module_only = file.extension().is_some_and(|e| e == "html");
    let mut out = String::new();
    let mut template = String::new();
    let mut rest = html;

    while let Some(open) = find_case_insensitive(rest, "<script") {
        let after_open = &rest[open + 7..];
        let Some(tag_end) = after_open.find('>') else {
            break;
        };
        template.push_str(&rest[..open]);
        let attrs = &after_open[..tag_end];
        let body_and_rest = &after_open[tag_end + 1..];
        let (body, next) = match find_case_insensitive(body_and_rest, "</script") {
            Some(close) => (&body_and_rest[..close], &body_and_rest[close..]),
            None => (body_and_rest, ""),
        };

        let type_attr = attr_value(attrs, "type");
        let is_module = type_attr.as_deref() == Some("module");
        let is_js_type = match type_attr.as_deref() {
            None | Some("module" | "text/javascript" | "application/javascript") => true,
            Some(_) => false,
        };

        let wanted = is_js_type && (!module_only || is_module);
        if wanted {
            if let Some(src) = attr_value(attrs, "src") {
                out.push_str(&format!("import {src:?};\n"));
            } else {
                out.push_str(body);
                out.push('\n');
            }
        }

        rest = next;
    }
    template.push_str(rest);

    if !module_only {
        append_template_imports(&mut out, &template);
    }

    out
}

/// Append a bare `import "…";` for every script binding the template
/// references, so the binding's source survives even if the script body
/// looks dead to a bundling crawl driver.
fn append_template_imports(out: &mut String, template: &str) {
    let mut appendix = String::new();
    for (binding, source) in script_import_bindings(out) {
        if template_references(template, &binding) {
            appendix.push_str(&format!("import {source:?};\n"));
        }
    }
    out.push_str(&appendix);
}

/// Collect `(local binding, import source)` pairs from a script's static
/// import lines: default, namespace, and named (with renames) forms.
fn script_import_bindings(script: &str) -> Vec<(String, String)> {
    let mut bindings = Vec::new();

    for line in script.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("import ") else {
            continue;
        };
        if rest.starts_with("type ") {
            continue;
        }
        let Some(from_idx) = rest.find(" from ") else {
            continue;
        };
        let clause = &rest[..from_idx];
        let after = rest[from_idx + 6..].trim_start();
        let Some(quote) = after.chars().next() else {
            continue;
        };
        if quote != '\'' && quote != '"' {
            continue;
        }
        let inner = &after[1..];
        let Some(end) = inner.find(quote) else {
            continue;
        };
        let source = &inner[..end];

        for name in import_clause_bindings(clause) {
            bindings.push((name, source.to_string()));
        }
    }

    bindings
}

/// Local names bound by an import clause: `Default`, `* as ns`,
/// `{ a, b as c }`, and combinations.
fn import_clause_bindings(clause: &str) -> Vec<String> {
    let mut names = Vec::new();

    let mut head = clause;
    if let Some(open) = clause.find('{') {
        let inner = clause[open + 1..].split('}').next().unwrap_or("");
        for entry in inner.split(',') {
            let name = entry.rsplit(" as ").next().unwrap_or(entry).trim();
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
        head = &clause[..open];
    }

    for part in head.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(ns) = part.strip_prefix("* as ") {
            names.push(ns.trim().to_string());
        } else if part != "*" {
            names.push(part.to_string());
        }
    }

    names
}

/// Whether the template markup mentions `name` as a standalone identifier.
fn template_references(template: &str, name: &str) -> bool {
    let bytes = template.as_bytes();
    let mut start = 0;
    while let Some(rel) = template[start..].find(name) {
        let idx = start + rel;
        let before_ok = idx == 0 || !is_ident_byte(bytes[idx - 1]);
        let after = idx + name.len();
        let after_ok = after >= bytes.len() || !is_ident_byte(bytes[after]);
        if before_ok && after_ok {
            return true;
        }
        start = idx + name.len().max(1);
    }
    false
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let lower = haystack.to_lowercase();
    lower.find(&needle.to_lowercase())
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let idx = attrs.find(name)?;
    let after = attrs[idx + name.len()..].trim_start();
    let after = after.strip_prefix('=')?.trim_start();
    let quote = after.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let inner = &after[1..];
    let end = inner.find(quote)?;
    Some(inner[..end].to_string())
}

// ============================================================================
// Resolution
// ============================================================================

/// Probe a path the way the dev resolver does: exact, then extensions, then
/// directory index files.
fn probe_file(base: &Path, extensions: &[String]) -> Option<PathBuf> {
    if base.is_file() {
        return Some(base.to_path_buf());
    }
    for ext in extensions {
        let candidate = PathBuf::from(format!("{}.{ext}", base.display()));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    if base.is_dir() {
        for ext in extensions {
            let candidate = base.join(format!("index.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Resolve a bare specifier by walking `node_modules` directories upward
/// from the importer to the project root.
fn resolve_bare(spec: &str, importer: &Path, root: &Path) -> Option<PathBuf> {
    let (pkg, subpath) = split_package_specifier(spec);
    let extensions: Vec<String> = ["js", "mjs", "cjs", "ts"]
        .iter()
        .map(ToString::to_string)
        .collect();

    let mut dir = importer.parent();
    while let Some(current) = dir {
        let pkg_dir = current.join("node_modules").join(pkg);
        if pkg_dir.is_dir() {
            if let Some(sub) = subpath {
                return probe_file(&pkg_dir.join(sub), &extensions);
            }
            return resolve_package_entry(&pkg_dir, &extensions);
        }
        if current == root {
            break;
        }
        dir = current.parent();
    }
    None
}

/// Split `@scope/pkg/sub/path` into the package name and optional subpath.
fn split_package_specifier(spec: &str) -> (&str, Option<&str>) {
    let segments_in_name = if spec.starts_with('@') { 2 } else { 1 };
    let mut slash_count = 0;
    for (idx, ch) in spec.char_indices() {
        if ch == '/' {
            slash_count += 1;
            if slash_count == segments_in_name {
                return (&spec[..idx], Some(&spec[idx + 1..]));
            }
        }
    }
    (spec, None)
}

/// Pick a package's entry file: `module`, then `main`, then `index.*`.
fn resolve_package_entry(pkg_dir: &Path, extensions: &[String]) -> Option<PathBuf> {
    let manifest = pkg_dir.join("package.json");
    if let Ok(raw) = std::fs::read_to_string(&manifest) {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw) {
            for field in ["module", "main"] {
                if let Some(entry) = json.get(field).and_then(|v| v.as_str()) {
                    if let Some(found) = probe_file(&pkg_dir.join(entry), extensions) {
                        return Some(found);
                    }
                }
            }
        }
    }
    probe_file(&pkg_dir.join("index"), extensions)
}
