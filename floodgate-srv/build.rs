//! Build identification for floodgate-srv
//!
//! `main.rs` logs these at startup via `env!`. Values fall back to
//! `unknown` outside a git checkout.

use chrono::{SecondsFormat, Utc};
use std::env;
use std::process::Command;

const UNKNOWN: &str = "unknown";

/// `git describe` output, e.g. `3f9c2a1b-dirty`, or the bare hash when untagged
fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?;
    let revision = revision.trim();
    (!revision.is_empty()).then(|| revision.to_owned())
}

fn main() {
    let vars = [
        ("GIT_HASH", git_revision().unwrap_or_else(|| UNKNOWN.to_owned())),
        (
            "BUILD_TIMESTAMP",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        (
            "BUILD_PROFILE",
            env::var("PROFILE").unwrap_or_else(|_| UNKNOWN.to_owned()),
        ),
    ];

    for (key, value) in vars {
        println!("cargo:rustc-env={key}={value}");
    }
}
