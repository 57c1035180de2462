//! Export-list lexer for dependency sources.
//!
//! Scans a module's text for its export surface without parsing. The
//! optimizer uses the result to decide whether a bundled dependency needs
//! CJS interop wrapping. JSX and TS syntax cannot trip the scan, so no
//! loader retry is needed.

/// Export surface of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportScan {
    /// Exported names in appearance order (`default` included literally).
    pub exports: Vec<String>,
    /// Whether an `export * from` re-export form is present.
    pub has_re_exports: bool,
    /// Whether any import statement is present.
    pub has_imports: bool,
}

impl ExportScan {
    /// True for sources exposing nothing through ESM syntax at all: the
    /// usual signature of CJS/UMD.
    #[must_use]
    pub fn looks_like_cjs(&self) -> bool {
        self.exports.is_empty() && !self.has_imports && !self.has_re_exports
    }
}

/// Scan source text for its ESM export surface.
#[must_use]
pub fn scan_exports(source: &str) -> ExportScan {
    let mut scan = ExportScan::default();

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") || trimmed.starts_with('*') || trimmed.starts_with("/*") {
            continue;
        }

        if trimmed.starts_with("import ") || trimmed.starts_with("import{") {
            scan.has_imports = true;
            continue;
        }

        let Some(rest) = trimmed.strip_prefix("export ") else {
            continue;
        };
        let rest = rest.trim_start();

        if rest.starts_with("default") {
            push_unique(&mut scan.exports, "default");
        } else if rest.starts_with('*') {
            scan.has_re_exports = true;
        } else if let Some(body) = rest.strip_prefix('{') {
            // export { a, b as c } [from '...']
            let inner = body.split('}').next().unwrap_or("");
            for entry in inner.split(',') {
                let name = entry
                    .rsplit(" as ")
                    .next()
                    .unwrap_or(entry)
                    .trim();
                if !name.is_empty() {
                    push_unique(&mut scan.exports, name);
                }
            }
        } else {
            // export const|let|var|function|class|async NAME ...
            let mut words = rest.split_whitespace();
            let decl = words.next().unwrap_or("");
            let name = match decl {
                "const" | "let" | "var" | "function" | "class" => words.next(),
                "async" => {
                    // export async function NAME
                    words.next();
                    words.next()
                }
                _ => None,
            };
            if let Some(name) = name {
                let clean: String = name
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                    .collect();
                if !clean.is_empty() {
                    push_unique(&mut scan.exports, &clean);
                }
            }
        }
    }

    scan
}

fn push_unique(exports: &mut Vec<String>, name: &str) {
    if !exports.iter().any(|e| e == name) {
        exports.push(name.to_string());
    }
}
