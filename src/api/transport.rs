//! Opaque request specs and the transport seam.
//!
//! The remote ERP API is an external collaborator: everything is modeled as
//! `{method, path, body?}` returning JSON. The [`Transport`] trait is the
//! only place HTTP happens, which keeps the executor and cache testable
//! against an in-memory double.

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

/// A single logical request against the remote API.
#[derive(Debug, Clone)]
pub struct RequestSpec {
  pub method: Method,
  pub path: String,
  pub body: Option<Value>,
}

impl RequestSpec {
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      method: Method::Get,
      path: path.into(),
      body: None,
    }
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self {
      method: Method::Post,
      path: path.into(),
      body: Some(body),
    }
  }

  pub fn put(path: impl Into<String>, body: Value) -> Self {
    Self {
      method: Method::Put,
      path: path.into(),
      body: Some(body),
    }
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self {
      method: Method::Delete,
      path: path.into(),
      body: None,
    }
  }
}

/// Raw response from the transport; status interpretation happens in the
/// executor via [`classify`](crate::error::classify).
#[derive(Debug, Clone)]
pub struct ApiResponse {
  pub status: u16,
  pub body: Value,
}

impl ApiResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Issues one request. `bearer` is attached as the Authorization credential
/// when present. Transport-level failures (DNS, connect, timeout) surface
/// as `Unclassified`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, spec: &RequestSpec, bearer: Option<&str>) -> Result<ApiResponse, ApiError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str) -> color_eyre::Result<Self> {
    // A trailing slash keeps Url::join from eating the last path segment.
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base_url = Url::parse(&normalized)
      .map_err(|e| color_eyre::eyre::eyre!("Invalid API base URL {}: {}", base_url, e))?;

    Ok(Self {
      client: reqwest::Client::new(),
      base_url,
    })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, spec: &RequestSpec, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
    let url = self
      .base_url
      .join(spec.path.trim_start_matches('/'))
      .map_err(|e| ApiError::Unclassified(format!("Invalid request path {}: {}", spec.path, e)))?;

    let method = match spec.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut request = self.client.request(method, url);
    if let Some(token) = bearer {
      request = request.bearer_auth(token);
    }
    if let Some(body) = &spec.body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| ApiError::Unclassified(format!("Network error: {}", e)))?;

    let status = response.status().as_u16();
    // Empty and non-JSON bodies (204, proxies) decode to null.
    let body = response.json::<Value>().await.unwrap_or(Value::Null);

    Ok(ApiResponse { status, body })
  }
}
