//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment with its own store.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn store_path(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  /// A `kiln` command bound to this environment's store, with no
  /// configuration inherited from the caller's environment.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd
      .arg("--store")
      .arg(self.store_path())
      .env_remove("KILN_STORE")
      .env_remove("KILN_SUBSTITUTERS")
      .env_remove("KILN_MAX_JOBS")
      .env_remove("KILN_BUILD_TIMEOUT");
    cmd
  }

  /// Write a file relative to the temp directory and return its path.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Run the command and parse its stdout as JSON. Panics if it fails.
  pub fn json(&self, args: &[&str]) -> serde_json::Value {
    let output = self.kiln_cmd().args(["-o", "json"]).args(args).output().unwrap();
    assert!(
      output.status.success(),
      "kiln {:?} failed: {}",
      args,
      String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
  }
}
