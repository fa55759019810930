//! The process-wide session context.
//!
//! One `Session` is constructed at process start and handed to every
//! consumer; it owns the credential store, the entity cache, and the
//! request executor, so single-instance semantics hold without hidden
//! globals.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::api::{HttpTransport, RequestExecutor, RequestSpec, Transport};
use crate::auth::CredentialStore;
use crate::cache::{CacheKey, EntityCache};
use crate::config::Config;
use crate::error::ApiError;
use crate::mutation::MutationHandle;
use crate::permissions::{self, Identity};
use crate::query::QueryHandle;
use crate::vault::{CredentialVault, SqliteVault};

const AUTH_LOGIN_PATH: &str = "auth/login";
const AUTH_LOGOUT_PATH: &str = "auth/logout";
const AUTH_ME_PATH: &str = "auth/me";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginTokens {
  access_token: String,
  refresh_token: Option<String>,
}

pub struct Session {
  config: Config,
  credentials: Arc<CredentialStore>,
  cache: EntityCache,
  executor: Arc<RequestExecutor>,
}

impl Session {
  /// Wire a session from explicit collaborators.
  pub fn new(config: Config, vault: Arc<dyn CredentialVault>, transport: Arc<dyn Transport>) -> Self {
    let credentials = Arc::new(CredentialStore::new(vault));
    let executor = Arc::new(RequestExecutor::new(
      transport,
      Arc::clone(&credentials),
      config.refresh_threshold(),
    ));

    Self {
      config,
      credentials,
      cache: EntityCache::new(),
      executor,
    }
  }

  /// Open a session against the configured API with the default transport
  /// and the SQLite vault at its default location.
  pub fn open(config: Config) -> color_eyre::Result<Self> {
    let transport = Arc::new(HttpTransport::new(&config.api.base_url)?);
    let vault = Arc::new(SqliteVault::open()?);
    Ok(Self::new(config, vault, transport))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &EntityCache {
    &self.cache
  }

  pub fn executor(&self) -> &Arc<RequestExecutor> {
    &self.executor
  }

  pub fn credentials(&self) -> &Arc<CredentialStore> {
    &self.credentials
  }

  /// Load persisted credentials into the store. Called once at process
  /// start, before any UI renders; a failed or empty load just means the
  /// user signs in again.
  pub async fn bootstrap(&self) {
    let restored = self.credentials.restore_from_vault().await;
    debug!(restored, "session bootstrap complete");
  }

  /// Exchange a username and password for a credential pair.
  pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
    let spec = RequestSpec::post(
      AUTH_LOGIN_PATH,
      json!({ "username": username, "password": password }),
    );
    let body = self.executor.execute(&spec).await?;
    let tokens: LoginTokens = serde_json::from_value(body)
      .map_err(|e| ApiError::Unclassified(format!("Malformed login response: {}", e)))?;

    self.credentials.set(tokens.access_token, tokens.refresh_token);
    // A previous user's identity may still be cached in this process.
    self.cache.invalidate(&permissions::identity_key());
    Ok(())
  }

  /// Sign out: notify the server (best effort), clear the credential store
  /// and its persisted mirror, and evict the entire entity cache.
  pub async fn sign_out(&self) {
    let spec = RequestSpec::post(AUTH_LOGOUT_PATH, json!({}));
    if let Err(e) = self.executor.execute(&spec).await {
      debug!("logout request failed: {}", e);
    }

    self.credentials.clear();
    self.cache.evict_all();
  }

  /// Query handle for the signed-in identity record.
  pub fn identity_query(&self) -> QueryHandle<Identity> {
    let executor = Arc::clone(&self.executor);
    QueryHandle::new(self.cache.clone(), permissions::identity_key(), move |_key| {
      let executor = Arc::clone(&executor);
      async move { executor.execute_as(&RequestSpec::get(AUTH_ME_PATH)).await }
    })
  }

  /// Capability check against the currently cached identity.
  pub fn has_permission(&self, name: &str) -> bool {
    permissions::has_permission(&self.cache, name)
  }

  /// Build a read handle bound to this session's cache.
  pub fn query<T, F, Fut>(&self, key: CacheKey, fetcher: F) -> QueryHandle<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    QueryHandle::new(self.cache.clone(), key, fetcher)
  }

  /// Build a write handle bound to this session's cache.
  pub fn mutation<I, O, F, Fut>(&self, mutation: F) -> MutationHandle<I, O>
  where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ApiError>> + Send + 'static,
  {
    MutationHandle::new(self.cache.clone(), mutation)
  }
}
