//! Build script for upline
//!
//! Stamps the commit and build time reported by `GET /version`.

use std::process::Command;

/// Trimmed stdout of a git command, or "unknown" outside a checkout
fn git(args: &[&str]) -> String {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    let stamps = [
        ("GIT_COMMIT_SHORT", git(&["rev-parse", "--short", "HEAD"])),
        ("GIT_COMMIT_FULL", git(&["rev-parse", "HEAD"])),
        (
            "BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        ),
    ];
    for (key, value) in stamps {
        println!("cargo:rustc-env={key}={value}");
    }

    for watched in [".git/HEAD", ".git/refs/heads/"] {
        println!("cargo:rerun-if-changed={watched}");
    }
}
