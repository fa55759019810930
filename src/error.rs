//! Error taxonomy for remote API failures.
//!
//! The transport surfaces raw status codes and bodies; `classify` is the
//! single point that turns them into the taxonomy the rest of the crate
//! works with. Validation errors carry per-field feedback and are never
//! shown as global notifications; every other kind maps to a fixed,
//! user-safe message.

use serde_json::Value;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
  pub field: String,
  pub message: String,
}

/// Classified failure from the remote API.
///
/// `Clone` is required so that single-flight awaiters (deduplicated fetches,
/// shared refresh attempts) can all observe the same outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
  /// 400 with structured field errors; routed to per-field form feedback.
  #[error("validation failed")]
  Validation {
    field_errors: Vec<FieldError>,
    form_error: Option<String>,
  },
  /// 403. Refreshing credentials does not restore permission, so this never
  /// triggers the refresh flow.
  #[error("permission denied")]
  Permission,
  /// 401 that survived the single refresh-and-retry.
  #[error("unauthorized")]
  Unauthorized,
  /// 409 with a normalized detail message.
  #[error("conflict: {0}")]
  Conflict(String),
  /// Anything else: 5xx, transport failures, undecodable bodies.
  #[error("{0}")]
  Unclassified(String),
}

impl ApiError {
  /// Fixed, user-safe text for the global notification channel.
  ///
  /// Validation errors are handled per-field and produce no global text.
  pub fn user_message(&self) -> String {
    match self {
      ApiError::Validation { .. } => "Please correct the highlighted fields".to_string(),
      ApiError::Permission => "You do not have permission to perform this action".to_string(),
      ApiError::Unauthorized => "Your session has expired, please log in again".to_string(),
      ApiError::Conflict(detail) => detail.clone(),
      ApiError::Unclassified(detail) => detail.clone(),
    }
  }

  pub fn is_validation(&self) -> bool {
    matches!(self, ApiError::Validation { .. })
  }
}

/// Map a non-success status code and response body onto the taxonomy.
///
/// This is the only place status codes are interpreted; callers never
/// branch on raw numbers.
pub fn classify(status: u16, body: &Value) -> ApiError {
  match status {
    400 => classify_validation(body),
    401 => ApiError::Unauthorized,
    403 => ApiError::Permission,
    409 => ApiError::Conflict(
      detail_message(body).unwrap_or_else(|| "The record was changed by someone else".to_string()),
    ),
    _ => ApiError::Unclassified(
      detail_message(body).unwrap_or_else(|| format!("Request failed with status {}", status)),
    ),
  }
}

fn classify_validation(body: &Value) -> ApiError {
  let mut field_errors = Vec::new();
  let mut form_error = None;

  if let Some(map) = body.as_object() {
    for (key, value) in map {
      let messages = collect_messages(value);
      if messages.is_empty() {
        continue;
      }
      if key == "detail" || key == "non_field_errors" || key == "message" {
        form_error = Some(messages.join(". "));
      } else {
        for message in messages {
          field_errors.push(FieldError {
            field: key.clone(),
            message,
          });
        }
      }
    }
  }

  if field_errors.is_empty() && form_error.is_none() {
    form_error = Some("Invalid input".to_string());
  }

  ApiError::Validation {
    field_errors,
    form_error,
  }
}

/// Pull a human-readable detail string out of a response body.
fn detail_message(body: &Value) -> Option<String> {
  for key in ["detail", "message", "error"] {
    if let Some(text) = body.get(key).and_then(Value::as_str) {
      return Some(normalize_message(text));
    }
  }
  body.as_str().map(normalize_message)
}

fn collect_messages(value: &Value) -> Vec<String> {
  match value {
    Value::String(s) => vec![normalize_message(s)],
    Value::Array(items) => items
      .iter()
      .filter_map(Value::as_str)
      .map(normalize_message)
      .collect(),
    _ => Vec::new(),
  }
}

/// Known backend validator phrasings, rewritten to user-friendly text.
const REWRITES: &[(&str, &str)] = &[
  ("this field is required.", "This field is required"),
  ("this field may not be blank.", "This field cannot be empty"),
  ("this field may not be null.", "This field cannot be empty"),
  ("this field must be unique.", "This value is already in use"),
  ("invalid token.", "Your session is no longer valid"),
  ("not found.", "The requested record was not found"),
];

/// Rewrite known validator phrasings; pass unrecognized text through
/// capitalized. Raw backend text is never shown without going through here.
pub fn normalize_message(raw: &str) -> String {
  let trimmed = raw.trim();
  let lowered = trimmed.to_lowercase();
  for (known, friendly) in REWRITES {
    if lowered == *known {
      return (*friendly).to_string();
    }
  }
  capitalize(trimmed)
}

fn capitalize(s: &str) -> String {
  let mut chars = s.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    None => String::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn classifies_field_errors_from_400() {
    let body = json!({
      "name": ["This field is required."],
      "price": ["this field may not be null."],
      "non_field_errors": ["duplicate entry"]
    });

    match classify(400, &body) {
      ApiError::Validation {
        field_errors,
        form_error,
      } => {
        assert_eq!(field_errors.len(), 2);
        assert!(field_errors
          .iter()
          .any(|e| e.field == "name" && e.message == "This field is required"));
        assert!(field_errors
          .iter()
          .any(|e| e.field == "price" && e.message == "This field cannot be empty"));
        assert_eq!(form_error.as_deref(), Some("Duplicate entry"));
      }
      other => panic!("expected validation error, got {:?}", other),
    }
  }

  #[test]
  fn classifies_empty_400_as_generic_validation() {
    match classify(400, &json!({})) {
      ApiError::Validation {
        field_errors,
        form_error,
      } => {
        assert!(field_errors.is_empty());
        assert_eq!(form_error.as_deref(), Some("Invalid input"));
      }
      other => panic!("expected validation error, got {:?}", other),
    }
  }

  #[test]
  fn classifies_auth_statuses() {
    assert_eq!(classify(401, &json!({})), ApiError::Unauthorized);
    assert_eq!(classify(403, &json!({})), ApiError::Permission);
  }

  #[test]
  fn classifies_conflict_with_detail() {
    let err = classify(409, &json!({"detail": "product code already taken"}));
    assert_eq!(
      err,
      ApiError::Conflict("Product code already taken".to_string())
    );
  }

  #[test]
  fn classifies_server_errors_as_unclassified() {
    let err = classify(500, &json!({}));
    assert_eq!(
      err,
      ApiError::Unclassified("Request failed with status 500".to_string())
    );
  }

  #[test]
  fn normalizes_known_phrasings_and_capitalizes_the_rest() {
    assert_eq!(
      normalize_message("This field must be unique."),
      "This value is already in use"
    );
    assert_eq!(
      normalize_message("stock level below reorder point"),
      "Stock level below reorder point"
    );
  }
}
