//! Parameter resolution.
//!
//! Pipeline definitions reference configuration (git owners, registry names)
//! and credentials (oauth tokens, SSH keys) by symbolic key. The resolver
//! turns a key template into either a plain value or an opaque
//! [`SecretHandle`] while a definition is being assembled. Secret values are
//! only revealed later, by the execution backend, through
//! [`ParameterStore::reveal`].
//!
//! # Key Templates
//!
//! - `{App}` / `{Env}` expand to the PascalCase namespace parts
//! - `/Cd/Git/Owner` (leading slash) is relative to `/<App>/<Env>`
//! - `github-sshkey` (no leading slash) is a global key used as-is

mod store;
mod types;

pub use store::*;
pub use types::*;

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// A parameter key after template expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamKey(String);

impl ParamKey {
  /// Expand a key template within a namespace.
  pub fn expand(template: &str, namespace: &Namespace) -> Result<Self, ParamError> {
    let invalid = |reason: &str| ParamError::InvalidKey {
      key: template.to_string(),
      reason: reason.to_string(),
    };

    if template.trim().is_empty() {
      return Err(invalid("key is empty"));
    }
    if template.chars().any(char::is_whitespace) {
      return Err(invalid("key contains whitespace"));
    }

    let has_tokens = template.contains('{');
    let expanded = template
      .replace("{App}", &pascal_case(&namespace.app))
      .replace("{Env}", &pascal_case(&namespace.env))
      .replace("{app}", &namespace.app)
      .replace("{env}", &namespace.env);

    if expanded.contains('{') || expanded.contains('}') {
      return Err(invalid("unknown template token"));
    }

    let base = namespace.base();
    let key = if has_tokens || !expanded.starts_with('/') || expanded.starts_with(&format!("{base}/")) {
      expanded
    } else {
      format!("{base}{expanded}")
    };

    if key.contains("//") {
      return Err(invalid("key contains an empty path segment"));
    }
    if key.len() > 1 && key.ends_with('/') {
      return Err(invalid("key ends with '/'"));
    }

    Ok(Self(key))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ParamKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Resolves key templates against a store, caching lookups for one
/// provisioning pass.
pub struct ParamResolver<'a> {
  store: &'a dyn ParameterStore,
  namespace: Namespace,
  cache: Mutex<HashMap<String, ParamValue>>,
}

impl<'a> ParamResolver<'a> {
  pub fn new(store: &'a dyn ParameterStore, namespace: Namespace) -> Self {
    Self {
      store,
      namespace,
      cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn namespace(&self) -> &Namespace {
    &self.namespace
  }

  /// Resolve a key template to a plain value or a secret handle.
  ///
  /// # Errors
  ///
  /// `NotFound` when the key does not exist in the store.
  pub fn resolve(&self, template: &str) -> Result<ParamValue, ParamError> {
    let key = ParamKey::expand(template, &self.namespace)?;

    if let Some(hit) = self.cache_get(key.as_str()) {
      return Ok(hit);
    }

    let value = match self.store.lookup(key.as_str())? {
      Some(StoredParam::Plain(value)) => ParamValue::Plain(value),
      Some(StoredParam::Secure(_)) => ParamValue::Secret(SecretHandle::new(key.as_str())),
      None => return Err(ParamError::NotFound(key.to_string())),
    };

    debug!(key = %key, secret = matches!(value, ParamValue::Secret(_)), "resolved parameter");
    self.cache_put(key.as_str(), value.clone());
    Ok(value)
  }

  /// Resolve a key that must hold plain configuration.
  pub fn plain(&self, template: &str) -> Result<String, ParamError> {
    match self.resolve(template)? {
      ParamValue::Plain(value) => Ok(value),
      ParamValue::Secret(handle) => Err(ParamError::Sensitive(handle.key)),
    }
  }

  /// Resolve a key that must hold a secret, returning only a handle to it.
  pub fn secret(&self, template: &str, field: Option<&str>) -> Result<SecretHandle, ParamError> {
    match self.resolve(template)? {
      ParamValue::Secret(handle) => Ok(match field {
        Some(field) => handle.with_field(field),
        None => handle,
      }),
      ParamValue::Plain(_) => Err(ParamError::NotSecret(
        ParamKey::expand(template, &self.namespace)?.to_string(),
      )),
    }
  }

  fn cache_get(&self, key: &str) -> Option<ParamValue> {
    self.cache.lock().ok().and_then(|cache| cache.get(key).cloned())
  }

  fn cache_put(&self, key: &str, value: ParamValue) {
    if let Ok(mut cache) = self.cache.lock() {
      cache.insert(key.to_string(), value);
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  fn ns() -> Namespace {
    Namespace::new("laravel-app", "prod")
  }

  #[test]
  fn relative_keys_join_the_namespace() {
    let key = ParamKey::expand("/Cd/Git/Owner", &ns()).unwrap();
    assert_eq!(key.as_str(), "/LaravelApp/Prod/Cd/Git/Owner");
  }

  #[test]
  fn template_tokens_expand() {
    let key = ParamKey::expand("/{App}/{Env}/Cd/Git/Owner", &ns()).unwrap();
    assert_eq!(key.as_str(), "/LaravelApp/Prod/Cd/Git/Owner");

    let raw = ParamKey::expand("/{app}/{env}", &ns()).unwrap();
    assert_eq!(raw.as_str(), "/laravel-app/prod");
  }

  #[test]
  fn absolute_namespaced_keys_are_not_doubled() {
    let key = ParamKey::expand("/LaravelApp/Prod/Cd/Git/Owner", &ns()).unwrap();
    assert_eq!(key.as_str(), "/LaravelApp/Prod/Cd/Git/Owner");
  }

  #[test]
  fn global_keys_are_used_as_is() {
    let key = ParamKey::expand("github-sshkey", &ns()).unwrap();
    assert_eq!(key.as_str(), "github-sshkey");
  }

  #[test]
  fn malformed_keys_are_rejected() {
    for bad in ["", "  ", "/a//b", "/a/b/", "/{Region}/x", "/a b"] {
      assert!(
        matches!(ParamKey::expand(bad, &ns()), Err(ParamError::InvalidKey { .. })),
        "expected {bad:?} to be rejected"
      );
    }
  }

  #[test]
  fn resolve_returns_plain_values() {
    let store = MemoryStore::new().with_plain("/LaravelApp/Prod/Cd/Git/Owner", "octo");
    let resolver = ParamResolver::new(&store, ns());
    assert_eq!(
      resolver.resolve("/Cd/Git/Owner").unwrap(),
      ParamValue::Plain("octo".to_string())
    );
  }

  #[test]
  fn resolve_never_returns_secret_values() {
    let store = MemoryStore::new().with_secret("/LaravelApp/Prod/Cd/Git/Token", "t0k3n");
    let resolver = ParamResolver::new(&store, ns());
    let value = resolver.resolve("/Cd/Git/Token").unwrap();
    assert_eq!(
      value,
      ParamValue::Secret(SecretHandle::new("/LaravelApp/Prod/Cd/Git/Token"))
    );
    assert!(!format!("{value:?}").contains("t0k3n"));
  }

  #[test]
  fn missing_keys_are_not_found() {
    let store = MemoryStore::new();
    let resolver = ParamResolver::new(&store, ns());
    assert_eq!(
      resolver.resolve("/Cd/Git/Owner").unwrap_err(),
      ParamError::NotFound("/LaravelApp/Prod/Cd/Git/Owner".to_string())
    );
  }

  #[test]
  fn plain_refuses_secure_parameters() {
    let store = MemoryStore::new().with_secret("/LaravelApp/Prod/Token", "x");
    let resolver = ParamResolver::new(&store, ns());
    assert!(matches!(resolver.plain("/Token"), Err(ParamError::Sensitive(_))));
  }

  #[test]
  fn secret_refuses_plain_parameters() {
    let store = MemoryStore::new().with_plain("/LaravelApp/Prod/Owner", "x");
    let resolver = ParamResolver::new(&store, ns());
    assert_eq!(
      resolver.secret("/Owner", None).unwrap_err(),
      ParamError::NotSecret("/LaravelApp/Prod/Owner".to_string())
    );
  }

  #[test]
  fn secret_attaches_json_field() {
    let store = MemoryStore::new().with_secret("/LaravelApp/Prod", r#"{"github-token":"x"}"#);
    let resolver = ParamResolver::new(&store, ns());
    let handle = resolver.secret("/{App}/{Env}", Some("github-token")).unwrap();
    assert_eq!(handle.field.as_deref(), Some("github-token"));
  }

  struct CountingStore {
    inner: MemoryStore,
    lookups: AtomicUsize,
  }

  impl ParameterStore for CountingStore {
    fn lookup(&self, key: &str) -> Result<Option<StoredParam>, ParamError> {
      self.lookups.fetch_add(1, Ordering::SeqCst);
      self.inner.lookup(key)
    }
  }

  #[test]
  fn lookups_are_cached_per_resolver() {
    let store = CountingStore {
      inner: MemoryStore::new().with_plain("/LaravelApp/Prod/Owner", "octo"),
      lookups: AtomicUsize::new(0),
    };
    let resolver = ParamResolver::new(&store, ns());

    resolver.plain("/Owner").unwrap();
    resolver.plain("/Owner").unwrap();
    resolver.plain("/LaravelApp/Prod/Owner").unwrap();

    assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
  }
}
