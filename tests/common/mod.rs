//! Shared helpers for driving the `offboard` binary.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A temp directory holding one config file.
pub struct ConfigDir {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl ConfigDir {
    pub fn with(value: &Value) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("offboard.json");
        std::fs::write(&path, serde_json::to_vec_pretty(value).expect("encode config"))
            .expect("write config");
        Self { dir, path }
    }

    pub fn raw(text: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("offboard.json");
        std::fs::write(&path, text).expect("write config");
        Self { dir, path }
    }
}

/// Minimal valid config whose logs stay inside `log_dir`.
pub fn base_config(log_dir: &Path) -> Value {
    serde_json::json!({
        "schema_version": 1,
        "company_name": "Acme",
        "minimum_os_major": 13,
        "enrollment_app": "/Applications/Company Portal.app",
        "log_dir": log_dir,
        "notifier": "log",
    })
}

/// Run the binary with a scrubbed environment.
pub fn offboard(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_offboard"));
    command
        .args(args)
        .env_remove("OFFBOARD_CONFIG")
        .env_remove("OFFBOARD_API_USERNAME")
        .env_remove("OFFBOARD_API_PASSWORD")
        .env("OFFBOARD_LOG", "warn");
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("run offboard")
}

pub fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}
