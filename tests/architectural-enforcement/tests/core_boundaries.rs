//! Integration Test: Chat Core Boundaries
//!
//! **Policy**: `chat/core` is headless and fully async.
//! - Nothing may block a runtime thread: no `std::thread::sleep`, no
//!   `reqwest::blocking`
//! - Nothing may pull in a UI framework: surfaces depend on the core, never
//!   the other way around

use architectural_enforcement::{find_violations, production_lines, workspace_path};

const BLOCKING: &[&str] = &["std::thread::sleep", "thread::sleep(", "reqwest::blocking"];

const UI_CRATES: &[&str] = &["ratatui", "crossterm", "gpui", "tauri", "egui", "iced"];

fn core_src() -> std::path::PathBuf {
    let dir = workspace_path("chat/core/src");
    assert!(dir.exists(), "chat core sources not found at {}", dir.display());
    dir
}

#[test]
fn test_no_blocking_calls_in_core() {
    let lines = production_lines(&core_src());
    assert!(!lines.is_empty());

    let violations = find_violations(&lines, BLOCKING);
    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        panic!(
            "\nFound {} blocking call(s) in chat core production code",
            violations.len()
        );
    }
}

#[test]
fn test_no_ui_frameworks_in_core() {
    let lines = production_lines(&core_src());
    let imports: Vec<_> = lines
        .into_iter()
        .filter(|line| {
            let code = line.code.trim_start();
            code.starts_with("use ") || code.starts_with("extern crate")
        })
        .collect();

    let violations = find_violations(&imports, UI_CRATES);
    assert!(
        violations.is_empty(),
        "UI framework imports in chat core:\n{}",
        violations.join("\n")
    );

    let manifest = std::fs::read_to_string(workspace_path("chat/core/Cargo.toml"))
        .expect("chat core manifest");
    for name in UI_CRATES {
        assert!(
            !manifest
                .lines()
                .any(|l| l.trim_start().starts_with(&format!("{name} "))
                    || l.trim_start().starts_with(&format!("{name}="))),
            "chat core depends on UI crate {name}"
        );
    }
}
