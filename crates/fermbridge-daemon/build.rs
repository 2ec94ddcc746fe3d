//! Stamps `FERMBRIDGE_BUILD_ID` (`YYYY.MM.DD+g<short-sha>`) for `--version`

use chrono::Utc;
use std::path::PathBuf;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    // Packagers building outside a checkout can pin the id themselves
    println!("cargo:rerun-if-env-changed=FERMBRIDGE_BUILD_ID");
    if let Ok(pinned) = std::env::var("FERMBRIDGE_BUILD_ID") {
        if !pinned.trim().is_empty() {
            println!("cargo:rustc-env=FERMBRIDGE_BUILD_ID={}", pinned.trim());
            return;
        }
    }

    // The crate sits below the workspace root, so ask git where .git is
    if let Some(git_dir) = git(&["rev-parse", "--absolute-git-dir"]).map(PathBuf::from) {
        println!("cargo:rerun-if-changed={}", git_dir.join("HEAD").display());
        println!("cargo:rerun-if-changed={}", git_dir.join("refs/heads").display());
    }

    let date = Utc::now().format("%Y.%m.%d");
    let sha = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=FERMBRIDGE_BUILD_ID={date}+g{sha}");
}
