//! Credential lifecycle: the in-memory store and the refresh coordinator.

mod credential;
mod refresh;

pub use credential::{Credential, CredentialStore};
pub use refresh::RefreshCoordinator;

#[cfg(test)]
pub(crate) use credential::jwt_expiring_at;
