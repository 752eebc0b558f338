//! TOML-based configuration for Quiver.
//!
//! Supports a config file (quiver.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [compile]
//! default_connection = "duck"
//! row_limit = 1000
//!
//! [cache]
//! enabled = true
//!
//! [connections.duck]
//! dialect = "duckdb"
//! catalog = "${QUIVER_HOME}/schemas/duck.json"
//!
//! [connections.warehouse]
//! dialect = "postgres"
//! identity = "pg://analytics"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::BuildOptions;
use crate::compiler::CompileOptions;
use crate::runtime::{ConnectionMap, SchemaCatalog, StaticConnection};
use crate::sql::dialect::get_dialect;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Unknown dialect '{dialect}' for connection '{connection}'")]
    UnknownDialect { connection: String, dialect: String },

    #[error("Failed to load schema catalog {path}: {source}")]
    Catalog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub compile: CompileSettings,

    pub cache: CacheSettings,

    /// Named connections.
    pub connections: BTreeMap<String, ConnectionSettings>,
}

/// `[compile]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompileSettings {
    /// Connection used by sources that name none.
    pub default_connection: Option<String>,

    /// Limit applied to the outermost stage when a query sets none.
    pub row_limit: Option<u64>,
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Cache finished models in memory for the life of the process.
    pub enabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `[connections.<name>]` section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// Dialect name (duckdb, postgres, snowflake, ...).
    pub dialect: String,

    /// JSON schema catalog answering schema fetches offline
    /// (supports ${ENV_VAR} expansion).
    #[serde(default)]
    pub catalog: Option<String>,

    /// Identity folded into build digests. Defaults to `name:dialect`.
    #[serde(default)]
    pub identity: Option<String>,
}

impl ConnectionSettings {
    /// Get the catalog path with environment variables expanded.
    pub fn resolved_catalog(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.catalog
            .as_deref()
            .map(|c| expand_env_vars(c).map(PathBuf::from))
            .transpose()
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `QUIVER_CONFIG`
    /// 2. `./quiver.toml`
    /// 3. `~/.config/quiver/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("QUIVER_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("quiver.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("quiver").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Get a connection by name.
    pub fn get_connection(&self, name: &str) -> Result<&ConnectionSettings, SettingsError> {
        self.connections
            .get(name)
            .ok_or_else(|| SettingsError::ConnectionNotFound(name.to_string()))
    }

    /// Compile options from `[compile]`.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            dialect: None,
            default_row_limit: self.compile.row_limit,
        }
    }

    /// Build options carrying each connection's identity.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            compile: self.compile_options(),
            connection_identities: self
                .connections
                .iter()
                .filter_map(|(name, c)| c.identity.clone().map(|id| (name.clone(), id)))
                .collect(),
        }
    }

    /// Offline connections for every configured connection, answering schema
    /// fetches from their catalogs.
    pub fn connection_map(&self) -> Result<ConnectionMap, SettingsError> {
        let mut map = ConnectionMap::new();
        for (name, conn) in &self.connections {
            if get_dialect(&conn.dialect).is_none() {
                return Err(SettingsError::UnknownDialect {
                    connection: name.clone(),
                    dialect: conn.dialect.clone(),
                });
            }
            let mut connection = StaticConnection::new(name.as_str(), conn.dialect.as_str());
            if let Some(path) = conn.resolved_catalog()? {
                let catalog = SchemaCatalog::from_file(&path)
                    .map_err(|source| SettingsError::Catalog { path, source })?;
                connection = connection.with_catalog(&catalog);
            }
            map.insert(Arc::new(connection));
        }
        if let Some(default) = &self.compile.default_connection {
            self.get_connection(default)?;
            map = map.with_default(default.as_str());
        }
        Ok(map)
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        let var_name: String = if chars.peek() == Some(&'{') {
            chars.next();
            chars.by_ref().take_while(|&ch| ch != '}').collect()
        } else {
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // Lone $
                result.push('$');
                continue;
            }
            name
        };
        let value = env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
