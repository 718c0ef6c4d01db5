use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while resolving or revealing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
  #[error("parameter not found: {0}")]
  NotFound(String),

  #[error("parameter {0} is stored as plain text, not as a secret")]
  NotSecret(String),

  #[error("parameter {0} is secure and cannot be used as plain configuration")]
  Sensitive(String),

  #[error("invalid parameter key '{key}': {reason}")]
  InvalidKey { key: String, reason: String },

  #[error("secret {key} has no JSON field '{field}'")]
  MissingField { key: String, field: String },

  #[error("secret {key} is not a JSON object, cannot read field '{field}'")]
  NotJson { key: String, field: String },

  #[error("parameter store unavailable: {0}")]
  Store(String),
}

/// The `/<App>/<Env>` namespace every parameter key lives under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
  pub app: String,
  pub env: String,
}

impl Namespace {
  pub fn new(app: impl Into<String>, env: impl Into<String>) -> Self {
    Self {
      app: app.into(),
      env: env.into(),
    }
  }

  /// `/<PascalApp>/<PascalEnv>`, e.g. `/LaravelApp/Prod`.
  pub fn base(&self) -> String {
    format!("/{}/{}", pascal_case(&self.app), pascal_case(&self.env))
  }
}

/// Convert `laravel-app` / `laravel_app` / `laravel app` to `LaravelApp`.
pub fn pascal_case(value: &str) -> String {
  let mut out = String::new();
  for part in value.split(|c: char| !c.is_ascii_alphanumeric()) {
    let mut chars = part.chars();
    if let Some(first) = chars.next() {
      out.push(first.to_ascii_uppercase());
      out.extend(chars);
    }
  }
  out
}

/// A value as held by a parameter store.
#[derive(Clone, PartialEq, Eq)]
pub enum StoredParam {
  Plain(String),
  Secure(String),
}

impl std::fmt::Debug for StoredParam {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StoredParam::Plain(value) => f.debug_tuple("Plain").field(value).finish(),
      StoredParam::Secure(_) => f.write_str("Secure(<redacted>)"),
    }
  }
}

/// Opaque reference to a secret. Holds where the secret lives, never its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretHandle {
  pub key: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field: Option<String>,
}

impl SecretHandle {
  pub fn new(key: impl Into<String>) -> Self {
    Self {
      key: key.into(),
      field: None,
    }
  }

  pub fn with_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }

  /// `key` or `key:field`, the form secret-manager references use.
  pub fn reference(&self) -> String {
    match &self.field {
      Some(field) => format!("{}:{}", self.key, field),
      None => self.key.clone(),
    }
  }
}

impl std::fmt::Display for SecretHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "secret({})", self.reference())
  }
}

/// A revealed secret. Only the execution backend holds one, and only while a job runs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into())
  }

  pub fn expose(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Debug for SecretValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("SecretValue(<redacted>)")
  }
}

impl std::fmt::Display for SecretValue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("<redacted>")
  }
}

/// A resolved parameter: either plain configuration or a deferred secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
  Plain(String),
  Secret(SecretHandle),
}

impl ParamValue {
  pub fn as_plain(&self) -> Option<&str> {
    match self {
      ParamValue::Plain(value) => Some(value),
      ParamValue::Secret(_) => None,
    }
  }
}
