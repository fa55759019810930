//! Semantic cache keys.
//!
//! A key names *what* was fetched: an entity type plus the filter parameters
//! that shaped the request, in insertion order. Prefix matching (same entity
//! type, parameter subset) drives bulk invalidation after mutations.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  entity_type: String,
  params: Vec<(String, String)>,
}

impl CacheKey {
  pub fn new(entity_type: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      params: Vec::new(),
    }
  }

  /// Append a filter parameter. Insertion order is preserved and significant
  /// for equality, so call sites must build their keys consistently.
  pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.params.push((name.into(), value.to_string()));
    self
  }

  pub fn entity_type(&self) -> &str {
    &self.entity_type
  }

  pub fn params(&self) -> &[(String, String)] {
    &self.params
  }

  /// True when `prefix` covers this key: same entity type and every prefix
  /// parameter present here with the same value. A bare entity-type prefix
  /// covers every variant of that entity.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.entity_type == prefix.entity_type
      && prefix
        .params
        .iter()
        .all(|param| self.params.contains(param))
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.entity_type)?;
    if !self.params.is_empty() {
      write!(f, "{{")?;
      for (i, (name, value)) in self.params.iter().enumerate() {
        if i > 0 {
          write!(f, ", ")?;
        }
        write!(f, "{}={}", name, value)?;
      }
      write!(f, "}}")?;
    }
    Ok(())
  }
}
