//! Explicit configuration: the deploy context, feature flags and the
//! versioned pipeline file.

mod context;
mod file;

pub use context::*;
pub use file::*;

use std::path::PathBuf;

use thiserror::Error;

/// Highest pipeline file schema version understood.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse pipeline file: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("unsupported pipeline file version {0} (expected {SCHEMA_VERSION})")]
  UnsupportedVersion(u32),

  #[error("pipeline file declares no services")]
  NoServices,

  #[error("service '{0}' is declared more than once")]
  DuplicateService(String),
}
