//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Get path to a fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Isolated test environment with its own output directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn path(&self, relative: &str) -> PathBuf {
    self.temp.path().join(relative)
  }

  pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
    let path = self.path(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  pub fn read_file(&self, relative: &str) -> String {
    std::fs::read_to_string(self.path(relative)).unwrap_or_else(|e| panic!("Failed to read {}: {}", relative, e))
  }

  /// A deckhand command with the fixture pipeline and parameters.
  pub fn cmd(&self, subcommand: &str) -> Command {
    let mut cmd = cargo_bin_cmd!("deckhand");
    cmd
      .current_dir(self.temp.path())
      .arg(subcommand)
      .arg(fixture_path("pipeline.toml"))
      .arg("--params")
      .arg(fixture_path("params.toml"));
    cmd
  }

  pub fn bare_cmd(&self) -> Command {
    let mut cmd = cargo_bin_cmd!("deckhand");
    cmd.current_dir(self.temp.path());
    cmd
  }
}
