//! Merged snapshot view over an observed descriptor list.

use serde_json::Value;
use std::collections::HashMap;

/// The merged `{data, loading, error}` view delivered to one observer.
///
/// `data` is keyed by field key; a requested key is absent until its field
/// state resolves. `loading` is true while any constituent field is loading.
/// `error` joins the messages of all currently failing fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
  pub data: HashMap<String, Value>,
  pub loading: bool,
  pub error: Option<String>,
}

/// Join constituent error messages into one combined error.
pub(crate) fn combine_errors(errors: &[String]) -> Option<String> {
  if errors.is_empty() {
    None
  } else {
    Some(errors.join("; "))
  }
}
