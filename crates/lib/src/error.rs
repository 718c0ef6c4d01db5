//! Run-level error taxonomy.

use serde::{Deserialize, Serialize};

/// Classification every surfaced failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
  /// Missing or malformed pipeline input. Fails before anything runs.
  Configuration,
  /// A build or push step failed. No image set is promoted.
  Build,
  /// Git or pull request automation failed.
  DeployPreparation,
  /// The parameter store lookup failed. Not retryable.
  SecretResolution,
}

impl ErrorClass {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorClass::Configuration => "ConfigurationError",
      ErrorClass::Build => "BuildFailure",
      ErrorClass::DeployPreparation => "DeployPreparationFailure",
      ErrorClass::SecretResolution => "SecretResolutionError",
    }
  }
}

impl std::fmt::Display for ErrorClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
