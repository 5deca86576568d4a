//! Layered configuration: built-in defaults, then an optional TOML file,
//! then `DROPOUT__SECTION__KEY` environment variables.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::error::{AppError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_PATH_ENV: &str = "DROPOUT_CONFIG";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to the number of physical cores when unset.
    pub workers: Option<usize>,
    /// Upper bound for an uploaded sheet, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            workers: None,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://dropout_risk.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// JSON artifact holding the fitted scaler and classifier
    pub path: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "models/dropout_model.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Uploaded sheets are kept here under their stored name.
    pub upload_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: "uploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub session_ttl_hours: i64,
    pub admin_session_ttl_hours: i64,
    /// Second factor required by the admin panel login.
    pub admin_access_code: String,
    pub superadmin_username: String,
    pub superadmin_email: String,
    /// The superadmin account is only created when this is set.
    pub superadmin_password: Option<String>,
    pub allow_registration: bool,
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: 8,
            admin_session_ttl_hours: 12,
            admin_access_code: "EDUFORGE2025".to_string(),
            superadmin_username: "administrador".to_string(),
            superadmin_email: "admin@eduforge.local".to_string(),
            superadmin_password: None,
            allow_registration: true,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset
    pub level: String,
    /// "compact", "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `$DROPOUT_CONFIG`, or `config/default.toml` when unset.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("DROPOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(format!("failed to build configuration: {}", e)))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("failed to deserialize configuration: {}", e)))
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.server.host.clone(), self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.model.path, "models/dropout_model.json");
        assert_eq!(config.storage.upload_dir, "uploads");
        assert_eq!(config.auth.admin_access_code, "EDUFORGE2025");
        assert_eq!(config.auth.superadmin_username, "administrador");
        assert!(config.auth.superadmin_password.is_none());
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[server]\nport = 9100\n\n[auth]\nallow_registration = false\nbcrypt_cost = 4"
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.auth.allow_registration);
        assert_eq!(config.auth.bcrypt_cost, 4);
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.model.path, "models/dropout_model.json");
    }
}
