//! Durable, out-of-band credential persistence.
//!
//! The vault survives process restarts so a reload does not force a fresh
//! login. Persisted rows carry explicit expirations; expired rows are
//! purged on load. The in-memory [`CredentialStore`](crate::auth::CredentialStore)
//! stays authoritative; every vault operation here is best-effort from its
//! point of view.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// How long a persisted access credential stays loadable.
const ACCESS_TTL_HOURS: i64 = 11;
/// How long a persisted refresh credential stays loadable.
const REFRESH_TTL_DAYS: i64 = 7;

/// Credential pair as recovered from durable storage. Either token may have
/// expired independently of the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedCredential {
  pub access_token: Option<String>,
  pub refresh_token: Option<String>,
}

/// Storage backend for credential persistence.
///
/// All operations are idempotent; persisting twice overwrites, clearing an
/// empty vault succeeds.
pub trait CredentialVault: Send + Sync {
  fn persist(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()>;
  fn load(&self) -> Result<Option<PersistedCredential>>;
  fn clear(&self) -> Result<()>;
}

/// In-process vault for tests and hosts without durable storage.
pub struct MemoryVault {
  slot: Mutex<Option<PersistedCredential>>,
}

impl Default for MemoryVault {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryVault {
  pub fn new() -> Self {
    Self {
      slot: Mutex::new(None),
    }
  }
}

impl CredentialVault for MemoryVault {
  fn persist(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
    let mut slot = self
      .slot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *slot = Some(PersistedCredential {
      access_token: Some(access_token.to_string()),
      refresh_token: refresh_token.map(String::from),
    });
    Ok(())
  }

  fn load(&self) -> Result<Option<PersistedCredential>> {
    let slot = self
      .slot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(slot.clone())
  }

  fn clear(&self) -> Result<()> {
    let mut slot = self
      .slot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *slot = None;
    Ok(())
  }
}

/// SQLite-backed vault under the user's data directory.
pub struct SqliteVault {
  conn: Mutex<Connection>,
}

/// Schema for the vault table. A single row holds the current pair.
const VAULT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vault (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    access_expires_at TEXT NOT NULL,
    refresh_expires_at TEXT,
    saved_at TEXT NOT NULL
);
"#;

impl SqliteVault {
  /// Open or create the vault at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the vault at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create vault directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open vault at {}: {}", path.display(), e))?;

    let vault = Self {
      conn: Mutex::new(conn),
    };
    vault.run_migrations()?;

    Ok(vault)
  }

  /// Get the default vault path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("erpq").join("vault.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(VAULT_SCHEMA)
      .map_err(|e| eyre!("Failed to run vault migrations: {}", e))?;

    Ok(())
  }

  fn persist_with_expirations(
    &self,
    access_token: &str,
    refresh_token: Option<&str>,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: Option<DateTime<Utc>>,
  ) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO vault (id, access_token, refresh_token, access_expires_at, refresh_expires_at, saved_at)
         VALUES (1, ?, ?, ?, ?, ?)",
        params![
          access_token,
          refresh_token,
          access_expires_at.to_rfc3339(),
          refresh_expires_at.map(|t| t.to_rfc3339()),
          Utc::now().to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to persist credentials: {}", e))?;

    Ok(())
  }
}

impl CredentialVault for SqliteVault {
  fn persist(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
    let now = Utc::now();
    self.persist_with_expirations(
      access_token,
      refresh_token,
      now + Duration::hours(ACCESS_TTL_HOURS),
      refresh_token.map(|_| now + Duration::days(REFRESH_TTL_DAYS)),
    )
  }

  fn load(&self) -> Result<Option<PersistedCredential>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(String, Option<String>, String, Option<String>)> = conn
      .query_row(
        "SELECT access_token, refresh_token, access_expires_at, refresh_expires_at FROM vault WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load credentials: {}", e))?;

    let (access_token, refresh_token, access_expires_at, refresh_expires_at) = match row {
      Some(row) => row,
      None => return Ok(None),
    };

    let now = Utc::now();
    let access_live = parse_rfc3339(&access_expires_at)?.map(|t| now <= t).unwrap_or(false);
    let refresh_live = match &refresh_expires_at {
      Some(t) => parse_rfc3339(t)?.map(|t| now <= t).unwrap_or(false),
      None => false,
    };

    if !access_live && !refresh_live {
      // Nothing usable left; drop the row so a reload starts clean.
      conn
        .execute("DELETE FROM vault WHERE id = 1", [])
        .map_err(|e| eyre!("Failed to purge expired credentials: {}", e))?;
      return Ok(None);
    }

    Ok(Some(PersistedCredential {
      access_token: access_live.then_some(access_token),
      refresh_token: if refresh_live { refresh_token } else { None },
    }))
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM vault", [])
      .map_err(|e| eyre!("Failed to clear vault: {}", e))?;

    Ok(())
  }
}

fn parse_rfc3339(s: &str) -> Result<Option<DateTime<Utc>>> {
  Ok(
    DateTime::parse_from_rfc3339(s)
      .ok()
      .map(|t| t.with_timezone(&Utc)),
  )
}
