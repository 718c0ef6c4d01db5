//! Deployment descriptor (`imagedefinitions.json`).
//!
//! The descriptor is a JSON array mapping logical container names to fully
//! qualified image URIs, consumed by the downstream deploy actuator:
//!
//! ```json
//! [{"name":"app","imageUri":"123.dkr.ecr.us-east-1.amazonaws.com/app:1234567"}]
//! ```
//!
//! Tag rewrites are keyed by container name. Each bound entry only has its
//! tag component replaced, so two containers in one descriptor never affect
//! each other.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::deploy::ContainerBinding;

#[derive(Debug, Error)]
pub enum DescriptorError {
  #[error("invalid image uri '{uri}': {reason}")]
  InvalidUri { uri: String, reason: &'static str },

  #[error("invalid tag '{0}'")]
  InvalidTag(String),

  #[error("descriptor has duplicate container name '{0}'")]
  DuplicateName(String),

  #[error("failed to parse descriptor: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("io error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

/// One descriptor entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
  pub name: String,
  #[serde(rename = "imageUri")]
  pub image_uri: String,
}

impl ImageDefinition {
  pub fn new(name: impl Into<String>, image_uri: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      image_uri: image_uri.into(),
    }
  }
}

/// A parsed image reference: `[registry/]repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUri {
  /// Everything before the tag, including registry host and port.
  pub name: String,
  pub tag: Option<String>,
  pub digest: Option<String>,
}

impl ImageUri {
  pub fn parse(uri: &str) -> Result<Self, DescriptorError> {
    let invalid = |reason| DescriptorError::InvalidUri {
      uri: uri.to_string(),
      reason,
    };

    if uri.is_empty() || uri.chars().any(char::is_whitespace) {
      return Err(invalid("empty or contains whitespace"));
    }

    let (rest, digest) = match uri.split_once('@') {
      Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
      Some(_) => return Err(invalid("empty digest")),
      None => (uri, None),
    };

    // A ':' only starts a tag when it follows the last '/', otherwise it is
    // a registry port.
    let last_slash = rest.rfind('/');
    let (name, tag) = match rest.rfind(':') {
      Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
        let tag = &rest[colon + 1..];
        if tag.is_empty() {
          return Err(invalid("empty tag"));
        }
        (&rest[..colon], Some(tag.to_string()))
      }
      _ => (rest, None),
    };

    if name.is_empty() || name.ends_with('/') {
      return Err(invalid("empty repository"));
    }

    Ok(Self {
      name: name.to_string(),
      tag,
      digest,
    })
  }

  /// Replace the tag. A digest pins the old image, so it is dropped.
  pub fn with_tag(&self, tag: &str) -> Self {
    Self {
      name: self.name.clone(),
      tag: Some(tag.to_string()),
      digest: None,
    }
  }
}

impl std::fmt::Display for ImageUri {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name)?;
    if let Some(tag) = &self.tag {
      write!(f, ":{tag}")?;
    }
    if let Some(digest) = &self.digest {
      write!(f, "@{digest}")?;
    }
    Ok(())
  }
}

fn validate_tag(tag: &str) -> Result<(), DescriptorError> {
  let valid = !tag.is_empty()
    && tag.len() <= 128
    && !tag.starts_with(['.', '-'])
    && tag.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
  if valid {
    Ok(())
  } else {
    Err(DescriptorError::InvalidTag(tag.to_string()))
  }
}

/// Ordered list of image definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(pub Vec<ImageDefinition>);

impl Descriptor {
  pub fn parse(content: &str) -> Result<Self, DescriptorError> {
    let descriptor: Descriptor = serde_json::from_str(content)?;
    let mut seen = std::collections::HashSet::new();
    for entry in &descriptor.0 {
      if !seen.insert(entry.name.as_str()) {
        return Err(DescriptorError::DuplicateName(entry.name.clone()));
      }
    }
    Ok(descriptor)
  }

  /// Compact form: `[{"name":"..","imageUri":".."}]`.
  pub fn to_json(&self) -> Result<String, DescriptorError> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn get(&self, name: &str) -> Option<&ImageDefinition> {
    self.0.iter().find(|entry| entry.name == name)
  }

  /// Point every bound container at `tag`.
  ///
  /// Bound entries keep their registry and repository and only have the tag
  /// replaced. Bound containers missing from the descriptor are appended as
  /// `<registry>/<repository>:<tag>`. Unbound entries are left untouched.
  pub fn apply_tag(&mut self, bindings: &[ContainerBinding], registry: &str, tag: &str) -> Result<(), DescriptorError> {
    validate_tag(tag)?;

    for binding in bindings {
      match self.0.iter_mut().find(|entry| entry.name == binding.name) {
        Some(entry) => {
          let uri = ImageUri::parse(&entry.image_uri)?;
          entry.image_uri = uri.with_tag(tag).to_string();
          debug!(container = %binding.name, image = %entry.image_uri, "retagged container");
        }
        None => {
          let uri = format!("{}/{}:{}", registry.trim_end_matches('/'), binding.repository, tag);
          ImageUri::parse(&uri)?;
          debug!(container = %binding.name, image = %uri, "added container");
          self.0.push(ImageDefinition::new(&binding.name, uri));
        }
      }
    }

    Ok(())
  }
}

/// Rewrite a descriptor file in place, creating it when absent.
///
/// Returns whether the file content changed.
pub fn rewrite_file(
  path: &Path,
  bindings: &[ContainerBinding],
  registry: &str,
  tag: &str,
) -> Result<bool, DescriptorError> {
  let io = |source| DescriptorError::Io {
    path: path.display().to_string(),
    source,
  };

  let existing = match std::fs::read_to_string(path) {
    Ok(content) => Some(content),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
    Err(e) => return Err(io(e)),
  };

  let mut descriptor = match &existing {
    Some(content) if !content.trim().is_empty() => Descriptor::parse(content)?,
    _ => Descriptor::default(),
  };
  descriptor.apply_tag(bindings, registry, tag)?;
  let rendered = descriptor.to_json()?;

  if existing.as_deref().map(str::trim) == Some(rendered.as_str()) {
    debug!(path = %path.display(), "descriptor already up to date");
    return Ok(false);
  }

  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(io)?;
  }
  std::fs::write(path, &rendered).map_err(io)?;
  info!(path = %path.display(), tag = %tag, entries = descriptor.0.len(), "wrote deployment descriptor");
  Ok(true)
}
