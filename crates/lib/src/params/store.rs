//! Parameter store backends.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::types::{ParamError, SecretHandle, SecretValue, StoredParam};

/// External key-value lookup service holding configuration and secrets.
pub trait ParameterStore: Send + Sync {
  /// Look up a key. `Ok(None)` means the key does not exist.
  fn lookup(&self, key: &str) -> Result<Option<StoredParam>, ParamError>;

  /// Reveal a secret for the execution backend.
  ///
  /// When the handle names a JSON field, the stored value is parsed as a JSON
  /// object and the field is extracted.
  fn reveal(&self, handle: &SecretHandle) -> Result<SecretValue, ParamError> {
    let raw = match self.lookup(&handle.key)? {
      Some(StoredParam::Secure(value)) => value,
      Some(StoredParam::Plain(_)) => return Err(ParamError::NotSecret(handle.key.clone())),
      None => return Err(ParamError::NotFound(handle.key.clone())),
    };

    let Some(field) = &handle.field else {
      return Ok(SecretValue::new(raw));
    };

    let object: serde_json::Map<String, serde_json::Value> =
      serde_json::from_str(&raw).map_err(|_| ParamError::NotJson {
        key: handle.key.clone(),
        field: field.clone(),
      })?;

    match object.get(field) {
      Some(serde_json::Value::String(s)) => Ok(SecretValue::new(s.clone())),
      Some(other) => Ok(SecretValue::new(other.to_string())),
      None => Err(ParamError::MissingField {
        key: handle.key.clone(),
        field: field.clone(),
      }),
    }
  }
}

/// In-memory store, used by tests and embedders.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
  entries: BTreeMap<String, StoredParam>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_plain(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.entries.insert(key.into(), StoredParam::Plain(value.into()));
    self
  }

  pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.entries.insert(key.into(), StoredParam::Secure(value.into()));
    self
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl ParameterStore for MemoryStore {
  fn lookup(&self, key: &str) -> Result<Option<StoredParam>, ParamError> {
    Ok(self.entries.get(key).cloned())
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamsFile {
  #[serde(default)]
  params: BTreeMap<String, String>,
  #[serde(default)]
  secrets: BTreeMap<String, String>,
}

/// Store backed by a TOML file with `[params]` and `[secrets]` tables.
///
/// ```toml
/// [params]
/// "/LaravelApp/Prod/Cd/Git/Owner" = "example"
///
/// [secrets]
/// "/LaravelApp/Prod/Cd/Git/Token" = "{\"github-token\": \"...\"}"
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
  inner: MemoryStore,
}

impl FileStore {
  pub fn load(path: &Path) -> Result<Self, ParamError> {
    let content = std::fs::read_to_string(path)
      .map_err(|e| ParamError::Store(format!("failed to read {}: {e}", path.display())))?;
    let store = Self::from_toml_str(&content)?;
    debug!(path = %path.display(), entries = store.inner.len(), "loaded parameter file");
    Ok(store)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ParamError> {
    let file: ParamsFile = toml::from_str(content).map_err(|e| ParamError::Store(e.to_string()))?;
    let mut inner = MemoryStore::new();
    for (key, value) in file.params {
      inner = inner.with_plain(key, value);
    }
    for (key, value) in file.secrets {
      inner = inner.with_secret(key, value);
    }
    Ok(Self { inner })
  }
}

impl ParameterStore for FileStore {
  fn lookup(&self, key: &str) -> Result<Option<StoredParam>, ParamError> {
    self.inner.lookup(key)
  }
}
