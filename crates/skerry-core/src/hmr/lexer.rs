//! Lexer for accepted-dep URL literals inside a `hot.accept(...)` call.
//!
//! Extracts the dep list without a full JS parser. The machine is exactly
//! two levels deep (call → array), so no stack is needed. Valid forms:
//!
//! - `accept()` / `accept(cb)`: self-accepting
//! - `accept("dep", cb)`: single dep
//! - `accept(["a", "b"], cb)`: dep array
//!
//! Dep URLs must be plain string literals; template interpolation is a
//! syntax error.

use crate::error::CoreError;

/// A dep literal found in an accept call, with its byte span in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedDep {
    pub url: String,
    /// Byte offset of the literal's first content byte.
    pub start: usize,
    /// Byte offset one past the literal's last content byte.
    pub end: usize,
}

/// Result of lexing one accept call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptScan {
    /// True for `accept()` / `accept(cb)` forms.
    pub self_accepts: bool,
    /// Dep literals in declaration order.
    pub deps: Vec<AcceptedDep>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outer {
    Call,
    Array,
}

/// Lex the arguments of a hot-accept call.
///
/// `start` must point just past the opening `(`.
///
/// # Errors
/// Returns [`CoreError::AcceptLexer`] for non-literal array entries,
/// template interpolation, or an unterminated argument list.
pub fn lex_accepted_deps(code: &str, start: usize) -> Result<AcceptScan, CoreError> {
    let bytes = code.as_bytes();
    let mut scan = AcceptScan::default();
    let mut i = start;

    // Outer machine: we are either directly inside the call parens or inside
    // a dep array. String states are handled inline by `lex_string_literal`.
    let mut outer = Outer::Call;

    while i < bytes.len() {
        let b = bytes[i];
        match outer {
            Outer::Call => match b {
                b if (b as char).is_whitespace() => i += 1,
                b'\'' | b'"' | b'`' => {
                    let (dep, _) = lex_string_literal(code, i, b)?;
                    scan.deps.push(dep);
                    // accept("x", cb): a single literal arg ends the scan
                    return Ok(scan);
                }
                b'[' => {
                    outer = Outer::Array;
                    i += 1;
                }
                // Anything else is a callback (or nothing): self-accepting
                _ => {
                    scan.self_accepts = true;
                    return Ok(scan);
                }
            },
            Outer::Array => match b {
                b if (b as char).is_whitespace() => i += 1,
                b',' => i += 1,
                b']' => return Ok(scan),
                b'\'' | b'"' | b'`' => {
                    let (dep, next) = lex_string_literal(code, i, b)?;
                    scan.deps.push(dep);
                    i = next;
                }
                _ => {
                    return Err(CoreError::AcceptLexer {
                        pos: i,
                        message: "dep array entries must be string literals".to_string(),
                    })
                }
            },
        }
    }

    Err(CoreError::AcceptLexer {
        pos: i,
        message: "unterminated accept() argument list".to_string(),
    })
}

/// Lex one string literal starting at the opening delimiter `delim` at byte
/// `open`. Returns the dep and the byte offset past the closing delimiter.
fn lex_string_literal(
    code: &str,
    open: usize,
    delim: u8,
) -> Result<(AcceptedDep, usize), CoreError> {
    let bytes = code.as_bytes();
    let content_start = open + 1;
    let mut i = content_start;

    while i < bytes.len() {
        let b = bytes[i];
        if b == delim {
            return Ok((
                AcceptedDep {
                    url: code[content_start..i].to_string(),
                    start: content_start,
                    end: i,
                },
                i + 1,
            ));
        }
        if delim == b'`' && b == b'$' && bytes.get(i + 1) == Some(&b'{') {
            return Err(CoreError::AcceptLexer {
                pos: i,
                message: "template interpolation is not allowed in accepted dep URLs".to_string(),
            });
        }
        i += 1;
    }

    Err(CoreError::AcceptLexer {
        pos: i,
        message: "unterminated string literal".to_string(),
    })
}

/// Scan transformed code for `hot.accept(` call sites and lex each one,
/// merging the results. Comment lines are skipped the same way the serve-time
/// heuristic in the import rewriter does.
pub fn scan_hot_accepts(code: &str) -> Result<AcceptScan, CoreError> {
    let mut merged = AcceptScan::default();

    for pattern in [".hot.accept(", ".hot?.accept("] {
        let mut search_from = 0;
        while let Some(rel) = code[search_from..].find(pattern) {
            let call = search_from + rel;
            search_from = call + pattern.len();

            if in_line_comment(code, call) {
                continue;
            }

            let scan = lex_accepted_deps(code, call + pattern.len())?;
            merged.self_accepts |= scan.self_accepts;
            merged.deps.extend(scan.deps);
        }
    }

    Ok(merged)
}

/// Whether the byte offset sits after `//` on its own line.
fn in_line_comment(code: &str, pos: usize) -> bool {
    let line_start = code[..pos].rfind('\n').map_or(0, |idx| idx + 1);
    code[line_start..pos].contains("//")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(call: &str) -> Result<AcceptScan, CoreError> {
        // Position just past the "(" of "accept("
        let start = call.find('(').unwrap() + 1;
        lex_accepted_deps(call, start)
    }

    #[test]
    fn test_empty_call_self_accepts() {
        let scan = lex("accept()").unwrap();
        assert!(scan.self_accepts);
        assert!(scan.deps.is_empty());
    }

    #[test]
    fn test_callback_self_accepts() {
        let scan = lex("accept((mod) => { use(mod); })").unwrap();
        assert!(scan.self_accepts);
        assert!(scan.deps.is_empty());
    }

    #[test]
    fn test_single_dep() {
        let scan = lex(r#"accept("./dep.js", (m) => {})"#).unwrap();
        assert!(!scan.self_accepts);
        assert_eq!(scan.deps.len(), 1);
        assert_eq!(scan.deps[0].url, "./dep.js");
        // span covers exactly the literal content
        assert_eq!(scan.deps[0].start, 8);
        assert_eq!(scan.deps[0].end, 16);
    }

    #[test]
    fn test_dep_array_in_order() {
        let scan = lex(r#"accept(["./a", './b', `./c`], cb)"#).unwrap();
        assert!(!scan.self_accepts);
        let urls: Vec<&str> = scan.deps.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["./a", "./b", "./c"]);
    }

    #[test]
    fn test_array_tolerates_whitespace() {
        let scan = lex("accept([ \"./a\" ,\n  \"./b\" ], cb)").unwrap();
        assert_eq!(scan.deps.len(), 2);
    }

    #[test]
    fn test_array_non_literal_is_error() {
        let err = lex("accept([depVar], cb)").unwrap_err();
        assert!(matches!(err, CoreError::AcceptLexer { .. }));
    }

    #[test]
    fn test_template_interpolation_is_error() {
        let err = lex("accept(`./${name}.js`, cb)").unwrap_err();
        let CoreError::AcceptLexer { pos, .. } = err else {
            panic!("expected lexer error");
        };
        assert_eq!(&"accept(`./${name}.js`, cb)"[pos..pos + 2], "${");
    }

    #[test]
    fn test_unterminated_is_error() {
        assert!(lex("accept([\"./a\"").is_err());
        assert!(lex("accept(\"./a").is_err());
    }

    #[test]
    fn test_scan_hot_accepts_self() {
        let scan = scan_hot_accepts("import.meta.hot.accept();").unwrap();
        assert!(scan.self_accepts);
    }

    #[test]
    fn test_scan_hot_accepts_optional_chain() {
        let scan = scan_hot_accepts("import.meta.hot?.accept('/dep.js', cb);").unwrap();
        assert!(!scan.self_accepts);
        assert_eq!(scan.deps[0].url, "/dep.js");
    }

    #[test]
    fn test_scan_skips_commented_call() {
        let scan = scan_hot_accepts("// import.meta.hot.accept();\nconst x = 1;").unwrap();
        assert!(!scan.self_accepts);
        assert!(scan.deps.is_empty());
    }

    #[test]
    fn test_scan_merges_multiple_calls() {
        let code = r#"
import.meta.hot.accept("./a.js", cbA);
import.meta.hot.accept(["./b.js"], cbB);
"#;
        let scan = scan_hot_accepts(code).unwrap();
        assert!(!scan.self_accepts);
        let urls: Vec<&str> = scan.deps.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["./a.js", "./b.js"]);
    }

    #[test]
    fn test_no_accept_calls() {
        let scan = scan_hot_accepts("export const x = 1;").unwrap();
        assert!(!scan.self_accepts);
        assert!(scan.deps.is_empty());
    }
}
