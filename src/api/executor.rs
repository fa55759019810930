//! Request execution: credential attachment, refresh-and-retry, and the
//! classification boundary.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::transport::{ApiResponse, RequestSpec, Transport};
use crate::auth::CredentialStore;
use crate::error::{classify, ApiError};

pub(crate) const AUTH_REFRESH_PATH: &str = "auth/refresh";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
  access_token: String,
  refresh_token: Option<String>,
}

/// Issues logical requests with the current credential attached.
///
/// On a 401 the executor renews credentials through the store's refresh
/// coordinator and retries the original request exactly once; a second 401
/// surfaces as [`ApiError::Unauthorized`] with no further attempts. 403
/// never triggers a refresh. Any number of executors may share one store;
/// they all serialize through that store's coordinator.
pub struct RequestExecutor {
  transport: Arc<dyn Transport>,
  credentials: Arc<CredentialStore>,
  refresh_threshold: Duration,
}

impl RequestExecutor {
  pub fn new(
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialStore>,
    refresh_threshold: Duration,
  ) -> Self {
    Self {
      transport,
      credentials,
      refresh_threshold,
    }
  }

  pub fn credentials(&self) -> &Arc<CredentialStore> {
    &self.credentials
  }

  /// Execute a request, returning the JSON body on success.
  pub async fn execute(&self, spec: &RequestSpec) -> Result<Value, ApiError> {
    // Renew ahead of expiry when possible; the 401 path below remains the
    // backstop, so a failed proactive renewal is not itself an error.
    if self.can_refresh() && self.credentials.is_expiring_soon(self.refresh_threshold) {
      let _ = self.refresh_credentials().await;
    }

    let response = self.send_with_current_token(spec).await?;

    if response.status == 401 && self.can_refresh() {
      if let Err(e) = self.refresh_credentials().await {
        debug!(path = %spec.path, "credential refresh failed: {}", e);
        return Err(ApiError::Unauthorized);
      }
      let retried = self.send_with_current_token(spec).await?;
      if retried.status == 401 {
        // Renewed credential was rejected too; give up rather than loop.
        return Err(ApiError::Unauthorized);
      }
      return into_result(retried);
    }

    into_result(response)
  }

  /// Execute a request and deserialize the success body.
  pub async fn execute_as<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T, ApiError> {
    let body = self.execute(spec).await?;
    serde_json::from_value(body)
      .map_err(|e| ApiError::Unclassified(format!("Malformed response body: {}", e)))
  }

  fn can_refresh(&self) -> bool {
    self.credentials.refresh_token().is_some()
  }

  async fn send_with_current_token(&self, spec: &RequestSpec) -> Result<ApiResponse, ApiError> {
    let token = self.credentials.access_token();
    self.transport.send(spec, token.as_deref()).await
  }

  /// Renew the credential pair. Concurrent callers, including ones from
  /// other executors over the same store, share one renewal through the
  /// store's coordinator; the refresh endpoint is hit at most once.
  async fn refresh_credentials(&self) -> Result<(), ApiError> {
    let transport = Arc::clone(&self.transport);
    let credentials = Arc::clone(&self.credentials);

    self
      .credentials
      .refresh_coordinator()
      .run(move || async move {
        let refresh_token = credentials.refresh_token().ok_or(ApiError::Unauthorized)?;
        let spec = RequestSpec::post(AUTH_REFRESH_PATH, json!({ "refreshToken": refresh_token }));

        let response = transport.send(&spec, None).await?;
        if !response.is_success() {
          return Err(classify(response.status, &response.body));
        }

        let pair: TokenPair = serde_json::from_value(response.body)
          .map_err(|e| ApiError::Unclassified(format!("Malformed refresh response: {}", e)))?;
        // Servers that do not rotate the refresh token omit it.
        let refresh_token = pair.refresh_token.or(Some(refresh_token));
        credentials.set(pair.access_token, refresh_token);
        Ok(())
      })
      .await
  }
}

fn into_result(response: ApiResponse) -> Result<Value, ApiError> {
  if response.is_success() {
    Ok(response.body)
  } else {
    Err(classify(response.status, &response.body))
  }
}
