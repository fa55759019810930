//! Client-side data layer for an ERP admin front-end.
//!
//! The UI above this crate is declarative composition; the parts with real
//! design content live here: a query/mutation cache keyed by semantic
//! identifiers with dependency-based invalidation, and a credential
//! lifecycle that serializes token renewal across concurrent requests.
//!
//! - [`cache`] - keyed result cache with single-flight fetching and
//!   prefix invalidation
//! - [`auth`] - credential store and refresh coordinator
//! - [`vault`] - durable, out-of-band credential persistence
//! - [`api`] - opaque request specs, the transport seam, and the
//!   refresh-and-retry request executor
//! - [`query`] / [`mutation`] - read and write handles for UI consumers
//! - [`permissions`] - capability checks over the cached identity
//! - [`session`] - the process-wide context object

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod mutation;
pub mod permissions;
pub mod query;
pub mod session;
pub mod vault;

pub use api::{HttpTransport, Method, RequestExecutor, RequestSpec, Transport};
pub use auth::{Credential, CredentialStore, RefreshCoordinator};
pub use cache::{CacheEntry, CacheKey, EntityCache, EntryState, UNTIL_INVALIDATED};
pub use config::Config;
pub use error::{ApiError, FieldError};
pub use mutation::MutationHandle;
pub use permissions::Identity;
pub use query::QueryHandle;
pub use session::Session;
pub use vault::{CredentialVault, MemoryVault, SqliteVault};
