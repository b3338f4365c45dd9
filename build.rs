//! Build script to capture the git version at compile time

use std::process::Command;

fn main() {
    // Prefer the nearest tag, fall back to the short hash
    let output = Command::new("git").args(["describe", "--tags", "--always", "--dirty"]).output();

    let git_version = match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::from("unknown"),
    };

    println!("cargo:rustc-env=GIT_VERSION={}", git_version);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/tags");
}
