//! Architectural Enforcement Helpers
//!
//! Source scanning shared by the integration tests in `tests/`, which
//! enforce rules over the admission crates:
//! - No blocking sleeps, and async sleeps only where a timer is the point
//! - No panicking `unwrap()`/`expect()` in library code
//!
//! Scanning is line based. Everything from the first `#[cfg(test)]` line of
//! a file onwards is treated as test code, and comment lines are ignored.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Root of the admission crates, resolved from this crate's manifest
#[must_use]
pub fn admission_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("admission")
}

/// Source directories scanned as production code
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = admission_root();
    vec![root.join("core").join("src"), root.join("daemon").join("src")]
}

/// All `.rs` files below `dir`, sorted
#[must_use]
pub fn rust_sources(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Code before the test module, as `(line_number, code)` pairs
///
/// Comment lines are dropped and trailing `//` comments stripped.
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line)))
        .collect()
}

/// A rule violation at a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending code, trimmed
    pub code: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.code)
    }
}

/// Scan production code in `dirs` for lines matching `is_violation`
///
/// `is_violation` receives the file path and the comment-stripped line.
pub fn scan<F>(dirs: &[PathBuf], is_violation: F) -> Vec<Violation>
where
    F: Fn(&Path, &str) -> bool,
{
    let mut violations = Vec::new();
    for dir in dirs {
        for path in rust_sources(dir) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (line, code) in production_lines(&content) {
                if is_violation(&path, code) {
                    violations.push(Violation {
                        path: path.clone(),
                        line,
                        code: code.trim().to_string(),
                    });
                }
            }
        }
    }
    violations
}

/// Panic with a readable report when `violations` is non-empty
pub fn report(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n#[cfg(test)]\nmod tests { fn b() {} }\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }

    #[test]
    fn test_production_lines_strip_comments() {
        let source = "//! docs with x.unwrap()\nlet a = 1; // trailing\n/// more\nlet b = 2;\n";
        let lines = production_lines(source);
        assert_eq!(lines, vec![(2, "let a = 1; "), (4, "let b = 2;")]);
    }

    #[test]
    fn test_admission_sources_are_found() {
        let files: Vec<PathBuf> = production_dirs()
            .iter()
            .flat_map(|d| rust_sources(d))
            .collect();
        assert!(files.iter().any(|p| p.ends_with("core/src/scheduler.rs")));
        assert!(files.iter().any(|p| p.ends_with("daemon/src/main.rs")));
    }
}
