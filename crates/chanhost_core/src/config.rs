//! Manager configuration.
//!
//! # Responsibility
//! - Load the JSON configuration of an extension manager host.
//! - Validate paths, log level and the host signer list before use.
//!
//! # Invariants
//! - A validated config always has a non-empty `packages_dir` and a
//!   supported `log_level`.
//! - Host signatures are hex-encoded in the file and decoded once.

use crate::extension::signature::{Signature, SignatureParseError};
use crate::logging::{default_log_level, normalize_level};
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Extension manager host configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Directory whose sub-directories are installed packages.
    pub packages_dir: PathBuf,
    /// SQLite database for trust and order decisions.
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    /// Signer set of the host application.
    pub host_signatures: Vec<Signature>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManagerConfig {
    packages_dir: PathBuf,
    database_path: PathBuf,
    #[serde(default)]
    log_dir: Option<PathBuf>,
    #[serde(default = "default_level")]
    log_level: String,
    #[serde(default)]
    host_signatures: Vec<String>,
}

fn default_level() -> String {
    default_log_level().to_string()
}

impl ManagerConfig {
    /// Reads and validates a JSON configuration file.
    ///
    /// Relative paths in the file resolve against the file's directory, which
    /// is made absolute first, so a loaded config only holds absolute paths.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&raw)?;
        let absolute = std::path::absolute(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = absolute.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let raw: RawManagerConfig = serde_json::from_str(raw).map_err(ConfigError::Parse)?;
        let host_signatures = raw
            .host_signatures
            .iter()
            .map(|value| Signature::from_hex(value))
            .collect::<Result<Vec<_>, SignatureParseError>>()
            .map_err(|err| ConfigError::Invalid(format!("host_signatures: {err}")))?;
        let config = Self {
            packages_dir: raw.packages_dir,
            database_path: raw.database_path,
            log_dir: raw.log_dir,
            log_level: raw.log_level,
            host_signatures,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packages_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("packages_dir cannot be empty".to_string()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database_path cannot be empty".to_string()));
        }
        normalize_level(&self.log_level).map_err(ConfigError::Invalid)?;
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.packages_dir);
        resolve(&mut self.database_path);
        if let Some(log_dir) = self.log_dir.as_mut() {
            resolve(log_dir);
        }
    }
}

/// Configuration load failure.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, .. } => write!(f, "cannot read config `{}`", path.display()),
            Self::Parse(err) => write!(f, "malformed config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}
