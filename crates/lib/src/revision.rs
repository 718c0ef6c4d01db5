//! Source revisions, image tags, and deploy branch names.
//!
//! Every pipeline run is keyed by the source revision that triggered it. The
//! image tag and the deploy branch are pure functions of that revision, so a
//! re-run of the same commit always lands on the same tag and branch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of leading revision characters used as an image tag.
pub const SHORT_TAG_LEN: usize = 7;

/// Prefix of every deploy branch pushed to the operations repository.
pub const DEPLOY_BRANCH_PREFIX: &str = "deploy/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionError {
  #[error("revision '{0}' is shorter than {SHORT_TAG_LEN} characters")]
  TooShort(String),

  #[error("revision '{0}' is not a hexadecimal commit id")]
  NotHex(String),

  #[error("image tag '{0}' is not {SHORT_TAG_LEN} lowercase hexadecimal characters")]
  InvalidTag(String),
}

/// A resolved source control revision (full or abbreviated commit id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
  pub fn parse(value: &str) -> Result<Self, RevisionError> {
    let value = value.trim();
    if !value.chars().all(|c| c.is_ascii_hexdigit()) {
      return Err(RevisionError::NotHex(value.to_string()));
    }
    if value.len() < SHORT_TAG_LEN {
      return Err(RevisionError::TooShort(value.to_string()));
    }
    Ok(Self(value.to_ascii_lowercase()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The image tag derived from this revision.
  pub fn short_tag(&self) -> ImageTag {
    ImageTag(self.0[..SHORT_TAG_LEN].to_string())
  }
}

impl TryFrom<String> for Revision {
  type Error = RevisionError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Revision::parse(&value)
  }
}

impl From<Revision> for String {
  fn from(value: Revision) -> Self {
    value.0
  }
}

impl std::fmt::Display for Revision {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A short revision tag (first seven characters of a revision).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageTag(String);

impl ImageTag {
  pub fn parse(value: &str) -> Result<Self, RevisionError> {
    let valid = value.len() == SHORT_TAG_LEN && value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
    if !valid {
      return Err(RevisionError::InvalidTag(value.to_string()));
    }
    Ok(Self(value.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The deploy branch for this tag: `deploy/<tag>`.
  pub fn branch_name(&self) -> String {
    branch_name(&self.0)
  }
}

impl TryFrom<String> for ImageTag {
  type Error = RevisionError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    ImageTag::parse(&value)
  }
}

impl From<ImageTag> for String {
  fn from(value: ImageTag) -> Self {
    value.0
  }
}

impl std::fmt::Display for ImageTag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// `shortTag(revision) = revision[0:7]`.
pub fn short_tag(revision: &str) -> Result<ImageTag, RevisionError> {
  Ok(Revision::parse(revision)?.short_tag())
}

/// `branchName(tag) = "deploy/" + tag`.
pub fn branch_name(tag: &str) -> String {
  format!("{DEPLOY_BRANCH_PREFIX}{tag}")
}
