//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No blocking sleeps or blocking HTTP in the chat core
//! - No UI framework dependencies in the chat core
//!
//! These tests are designed to catch violations early in the development cycle.
//! The helpers below walk a source tree and yield production lines only:
//! comments and everything from a `#[cfg(test)]` attribute to the end of its
//! file are skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// One line of production source
#[derive(Debug)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// The line with any trailing `//` comment removed
    pub code: String,
}

/// Resolve a path relative to the workspace root
#[must_use]
pub fn workspace_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join(relative)
}

/// Production lines of every `.rs` file under `dir`
#[must_use]
pub fn production_lines(dir: &Path) -> Vec<SourceLine> {
    let mut lines = Vec::new();

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };

        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("#[cfg(test)]") {
                break;
            }
            if trimmed.starts_with("//") {
                continue;
            }
            let code = line.split("//").next().unwrap_or(line);
            lines.push(SourceLine {
                path: path.to_path_buf(),
                number: idx + 1,
                code: code.to_string(),
            });
        }
    }

    lines
}

/// Lines whose code contains any of `patterns`, formatted for a report
#[must_use]
pub fn find_violations(lines: &[SourceLine], patterns: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let hit = patterns.iter().find(|p| line.code.contains(**p))?;
            Some(format!(
                "{}:{}: `{}` in: {}",
                line.path.display(),
                line.number,
                hit,
                line.code.trim()
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_test_and_comments_are_skipped() {
        let dir = std::env::temp_dir().join(format!("arch-enforcement-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("sample.rs"),
            "// std::thread::sleep in a comment\n\
             fn real() { std::thread::sleep(d); }\n\
             #[cfg(test)]\n\
             mod tests { fn t() { std::thread::sleep(d); } }\n",
        )
        .unwrap();

        let lines = production_lines(&dir);
        let violations = find_violations(&lines, &["std::thread::sleep"]);
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("sample.rs:2"));
    }
}
