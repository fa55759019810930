use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub auth: AuthConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the remote ERP API, e.g. "https://erp.example.com/api"
  pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
  /// Refresh the access token proactively when it expires within this window
  #[serde(default = "default_refresh_threshold_minutes")]
  pub refresh_threshold_minutes: u64,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      refresh_threshold_minutes: default_refresh_threshold_minutes(),
    }
  }
}

fn default_refresh_threshold_minutes() -> u64 {
  5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Staleness window for report queries; master data stays fresh until
  /// invalidated by a mutation
  #[serde(default = "default_report_stale_seconds")]
  pub report_stale_seconds: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      report_stale_seconds: default_report_stale_seconds(),
    }
  }
}

fn default_report_stale_seconds() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./erpq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/erpq/config.yaml
  /// 4. ~/.config/erpq/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/erpq/config.yaml"
      )),
    }
  }

  /// Build a config directly from a base URL, with all defaults.
  ///
  /// Embedding hosts often have no config file of their own.
  pub fn for_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig {
        base_url: base_url.into(),
      },
      ..Self::default()
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("erpq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("erpq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Proactive-refresh window for access credentials.
  pub fn refresh_threshold(&self) -> Duration {
    Duration::from_secs(self.auth.refresh_threshold_minutes * 60)
  }

  /// Staleness window for report queries.
  pub fn report_stale_after(&self) -> Duration {
    Duration::from_secs(self.cache.report_stale_seconds)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_apply_when_sections_are_omitted() {
    let config: Config = serde_yaml::from_str("api:\n  base_url: https://erp.test/api\n").unwrap();

    assert_eq!(config.api.base_url, "https://erp.test/api");
    assert_eq!(config.refresh_threshold(), Duration::from_secs(5 * 60));
    assert_eq!(config.report_stale_after(), Duration::from_secs(30));
  }

  #[test]
  fn explicit_values_override_defaults() {
    let yaml = "api:\n  base_url: https://erp.test/api\nauth:\n  refresh_threshold_minutes: 10\ncache:\n  report_stale_seconds: 5\n";
    let config: Config = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.refresh_threshold(), Duration::from_secs(600));
    assert_eq!(config.report_stale_after(), Duration::from_secs(5));
  }
}
