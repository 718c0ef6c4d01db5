//! Content fingerprints.
//!
//! A fingerprint is the SHA-256 of a value's JSON serialization. Two plans
//! with the same fingerprint render to the same backend documents.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the abbreviated fingerprint shown to users.
pub const SHORT_FINGERPRINT_LEN: usize = 12;

/// A full 64-character lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  pub fn short(&self) -> &str {
    &self.0[..SHORT_FINGERPRINT_LEN.min(self.0.len())]
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Fingerprintable: Serialize {
  fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
    let serialized = serde_json::to_string(self)?;
    Ok(Fingerprint(hash_bytes(serialized.as_bytes())))
  }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Serialize)]
  struct Sample {
    name: &'static str,
    count: u32,
  }

  impl Fingerprintable for Sample {}

  #[test]
  fn hash_bytes_is_sha256() {
    assert_eq!(
      hash_bytes(b""),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }

  #[test]
  fn fingerprint_is_deterministic() {
    let a = Sample { name: "x", count: 1 }.fingerprint().unwrap();
    let b = Sample { name: "x", count: 1 }.fingerprint().unwrap();
    let c = Sample { name: "x", count: 2 }.fingerprint().unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.0.len(), 64);
    assert_eq!(a.short().len(), SHORT_FINGERPRINT_LEN);
  }
}
