//! Governor configuration.
//!
//! ```rust,no_run
//! use cost_governor::config::{SettingsHandle, SettingsLoader};
//!
//! # fn example() -> Result<(), cost_governor::config::ConfigError> {
//! let settings = SettingsLoader::new()
//!     .path("governor.yaml")
//!     .load()?;
//! let handle = SettingsHandle::new(settings)?;
//! # Ok(())
//! # }
//! ```

mod loader;
mod reload;
mod settings;
pub mod validator;

pub use loader::{ENV_PREFIX, SettingsFormat, SettingsLoader};
pub use reload::SettingsHandle;
pub use settings::{
    BatchSettings, DedupSettings, GovernorSettings, MonitorSettings, UpstreamSettings,
};

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in configuration operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unsupported settings format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl ValidationErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "batch.max_size".to_string(),
            message: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for batch.max_size: must be at least 1"
        );

        let errors = ValidationErrors(vec![
            err,
            ConfigError::UnsupportedFormat {
                extension: "ini".into(),
            },
        ]);
        assert_eq!(errors.len(), 2);
        assert!(errors.to_string().starts_with("Validation failed: "));
        assert!(errors.to_string().contains("; Unsupported settings format: ini"));
    }
}
