//! Build script for the keyshare server.
//!
//! Embeds `GIT_SHA` and `BUILD_TIME` for the `/build-info` endpoint.
//! Values set by CI win over the local git checkout and clock.

use chrono::{SecondsFormat, Utc};
use std::process::Command;

fn git_head() -> Option<String> {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    // Paths are relative to this crate, the repo root is two levels up
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/heads/");
    println!("cargo:rerun-if-env-changed=GIT_SHA");
    println!("cargo:rerun-if-env-changed=BUILD_TIME");

    let git_sha = std::env::var("GIT_SHA")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(git_head)
        .unwrap_or_else(|| "unknown".to_string());

    let build_time = std::env::var("BUILD_TIME")
        .unwrap_or_else(|_| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

    println!("cargo:rustc-env=GIT_SHA={git_sha}");
    println!("cargo:rustc-env=BUILD_TIME={build_time}");
}
