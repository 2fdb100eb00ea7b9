use common::storage::DirMode;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    /// Allowed origins. Empty allows any origin.
    #[serde(default)]
    pub allow_origins: Vec<String>,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: Vec::new(),
            max_age: 3600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin used when building file URLs, e.g. `https://cdn.example.com`.
    /// Falls back to the request's `Host` header when unset.
    #[serde(default)]
    pub public_url: Option<String>,
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for stored files. Relative paths are taken from the working directory.
    pub location: String,
    /// Mode applied to directories created under the root.
    #[serde(default)]
    pub dir_mode: DirMode,
    /// Largest accepted upload in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Check every record against the filesystem at startup.
    #[serde(default = "default_audit_on_startup")]
    pub audit_on_startup: bool,
}

fn default_max_upload_size() -> u64 {
    128 * 1024 * 1024
}

fn default_audit_on_startup() -> bool {
    true
}

impl StorageConfig {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            dir_mode: DirMode::default(),
            max_upload_size: default_max_upload_size(),
            audit_on_startup: default_audit_on_startup(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.cors.allow_origins", Vec::<String>::new())?
            .set_default("server.cors.max_age", 3600)?
            .set_default("database.url", "sqlite://refstore.db?mode=rwc")?
            // Load from config/config.toml
            .add_source(File::with_name("config/config").required(false))
            // Override from environment (e.g., REFSTORE__STORAGE__LOCATION)
            .add_source(Environment::with_prefix("REFSTORE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
