//! Field descriptors: the unit of observation.
//!
//! A descriptor is either a plain name ("bio") or a parameterized value
//! ({key: "scores", period: "day"}). Two descriptors address the same cache
//! entry iff their canonical serializations are equal; the canonical form is
//! deterministic and independent of parameter order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Identifies one piece of remote data to watch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldDescriptor {
  /// A plain field name, e.g. `"bio"`.
  Name(String),
  /// A parameterized field, e.g. `{key: "scores", period: "day"}`.
  Keyed {
    key: String,
    #[serde(flatten)]
    params: BTreeMap<String, Value>,
  },
}

impl FieldDescriptor {
  /// Plain named field.
  pub fn name(name: impl Into<String>) -> Self {
    Self::Name(name.into())
  }

  /// Parameterized field.
  pub fn keyed(key: impl Into<String>, params: BTreeMap<String, Value>) -> Self {
    Self::Keyed {
      key: key.into(),
      params,
    }
  }

  /// The short semantic label under which this field's value appears in a
  /// merged snapshot. Distinct descriptors may share a field key.
  pub fn field_key(&self) -> &str {
    match self {
      Self::Name(name) => name,
      Self::Keyed { key, .. } => key,
    }
  }

  /// Deterministic serialization. Parameters are emitted in sorted key
  /// order, so equivalent descriptors canonicalize identically.
  pub fn canonical(&self) -> String {
    match self {
      Self::Name(name) => Value::String(name.clone()).to_string(),
      Self::Keyed { key, params } => {
        // serde_json's Map sorts keys, which makes this order-independent.
        let mut map = serde_json::Map::new();
        map.insert("key".to_string(), Value::String(key.clone()));
        for (k, v) in params {
          map.insert(k.clone(), v.clone());
        }
        Value::Object(map).to_string()
      }
    }
  }

  /// SHA256 of the canonical form, hex encoded. Used as both the in-memory
  /// dedup key and the durable cache key; stable across process restarts.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&str> for FieldDescriptor {
  fn from(name: &str) -> Self {
    Self::Name(name.to_string())
  }
}

impl From<String> for FieldDescriptor {
  fn from(name: String) -> Self {
    Self::Name(name)
  }
}
