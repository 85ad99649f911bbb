use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CardVaultError, Result};

/// Service configuration, loaded from `cardvault.toml`.
///
/// Every field has a sensible default so CardVault starts without any
/// config file at all.  KEK share #2 lives here under `[key_settings]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database file (relative to the project directory).
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Default log filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// DEK pool limits.
    #[serde(default)]
    pub dek: DekSettings,

    /// Remote key-share service.
    #[serde(default)]
    pub key_keeper: KeyKeeperSettings,

    /// Local key items, e.g. `KEK_VER1_PART2 = "<hex>"`.
    #[serde(default)]
    pub key_settings: BTreeMap<String, String>,
}

/// Limits applied by the DEK pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DekSettings {
    /// How many values one DEK may encrypt.
    #[serde(default = "default_use_count")]
    pub use_count: i64,

    /// Minimum total remaining uses across active DEKs.
    #[serde(default = "default_min_active_limit")]
    pub min_active_limit: i64,

    /// How long a new DEK stays usable, in days.
    #[serde(default = "default_usage_period_days")]
    pub usage_period_days: i64,
}

/// Where to fetch KEK share #1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyKeeperSettings {
    /// Base URL of the key-share service (e.g. `http://10.0.0.5:8080/`).
    #[serde(default)]
    pub url: Option<String>,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_database_path() -> String {
    "cardvault.db".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_use_count() -> i64 {
    10_000
}

fn default_min_active_limit() -> i64 {
    1_000
}

fn default_usage_period_days() -> i64 {
    30
}

fn default_timeout_ms() -> u64 {
    5_000
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            dek: DekSettings::default(),
            key_keeper: KeyKeeperSettings::default(),
            key_settings: BTreeMap::new(),
        }
    }
}

impl Default for DekSettings {
    fn default() -> Self {
        Self {
            use_count: default_use_count(),
            min_active_limit: default_min_active_limit(),
            usage_period_days: default_usage_period_days(),
        }
    }
}

impl Default for KeyKeeperSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl DekSettings {
    /// Reject limits that would make the pool spin forever.
    pub fn validate(&self) -> Result<()> {
        if self.use_count < 1 {
            return Err(CardVaultError::ConfigError(format!(
                "dek.use_count must be at least 1 (got {})",
                self.use_count
            )));
        }
        if self.min_active_limit < 0 {
            return Err(CardVaultError::ConfigError(format!(
                "dek.min_active_limit must not be negative (got {})",
                self.min_active_limit
            )));
        }
        if self.usage_period_days < 1 {
            return Err(CardVaultError::ConfigError(format!(
                "dek.usage_period_days must be at least 1 (got {})",
                self.usage_period_days
            )));
        }
        Ok(())
    }
}

impl Settings {
    /// Name of the config file we look for in the project directory.
    pub const FILE_NAME: &'static str = "cardvault.toml";

    /// Load settings from `<project_dir>/cardvault.toml`.
    ///
    /// If the file does not exist, sensible defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            CardVaultError::ConfigError(format!("Failed to parse {}: {e}", config_path.display()))
        })?;
        settings.dek.validate()?;

        Ok(settings)
    }

    /// Write settings back to `<project_dir>/cardvault.toml`.
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CardVaultError::SerializationError(format!("settings: {e}")))?;
        let path = project_dir.join(Self::FILE_NAME);
        std::fs::write(&path, contents)?;

        // Owner-only: `[key_settings]` holds KEK share #2.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Full path to the database file.
    pub fn database_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.database_path)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_settings_are_sensible() {
        let s = Settings::default();
        assert_eq!(s.database_path, "cardvault.db");
        assert_eq!(s.dek.use_count, 10_000);
        assert_eq!(s.dek.min_active_limit, 1_000);
        assert_eq!(s.dek.usage_period_days, 30);
        assert_eq!(s.key_keeper.timeout_ms, 5_000);
        assert!(s.key_keeper.url.is_none());
        assert!(s.key_settings.is_empty());
    }

    #[test]
    fn load_returns_defaults_when_no_config_file() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load(tmp.path()).unwrap();
        assert_eq!(settings.log_level, "warn");
    }

    #[test]
    fn load_parses_toml_file() {
        let tmp = TempDir::new().unwrap();
        let config = r#"
database_path = "vault.sqlite"

[dek]
use_count = 50
min_active_limit = 200
usage_period_days = 7

[key_keeper]
url = "http://127.0.0.1:9000/"
timeout_ms = 1500

[key_settings]
KEK_VER1_PART2 = "abcd"
"#;
        fs::write(tmp.path().join(Settings::FILE_NAME), config).unwrap();

        let settings = Settings::load(tmp.path()).unwrap();
        assert_eq!(settings.database_path, "vault.sqlite");
        assert_eq!(settings.dek.use_count, 50);
        assert_eq!(settings.dek.min_active_limit, 200);
        assert_eq!(settings.dek.usage_period_days, 7);
        assert_eq!(settings.key_keeper.url.as_deref(), Some("http://127.0.0.1:9000/"));
        assert_eq!(settings.key_keeper.timeout_ms, 1500);
        assert_eq!(settings.key_settings["KEK_VER1_PART2"], "abcd");
    }

    #[test]
    fn load_uses_defaults_for_missing_fields() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(Settings::FILE_NAME), "[dek]\nuse_count = 3\n").unwrap();

        let settings = Settings::load(tmp.path()).unwrap();
        assert_eq!(settings.dek.use_count, 3);
        assert_eq!(settings.dek.min_active_limit, 1_000);
        assert_eq!(settings.database_path, "cardvault.db");
    }

    #[test]
    fn load_errors_on_invalid_toml() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(Settings::FILE_NAME), "not valid {{toml").unwrap();
        assert!(Settings::load(tmp.path()).is_err());
    }

    #[test]
    fn load_rejects_zero_use_count() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(Settings::FILE_NAME), "[dek]\nuse_count = 0\n").unwrap();
        assert!(matches!(
            Settings::load(tmp.path()),
            Err(CardVaultError::ConfigError(_))
        ));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut s = Settings::default();
        s.key_settings
            .insert("KEK_VER2_PART2".to_string(), "00ff".to_string());
        s.save(tmp.path()).unwrap();

        let loaded = Settings::load(tmp.path()).unwrap();
        assert_eq!(loaded.key_settings["KEK_VER2_PART2"], "00ff");
    }

    #[test]
    fn database_path_is_relative_to_project() {
        let s = Settings::default();
        assert_eq!(
            s.database_path(Path::new("/srv/vault")),
            PathBuf::from("/srv/vault/cardvault.db")
        );
    }
}
