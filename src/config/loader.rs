//! Settings loading from JSON/YAML files and `GOVERNOR_*` environment variables.
//!
//! Sources (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Settings file: an explicit path, or `governor.yaml` / `governor.json` in
//!    the platform config directory when present
//! 3. Environment overrides for scalar keys (`GOVERNOR_BATCH_MAX_SIZE=16`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use serde::de::DeserializeOwned;

use super::settings::GovernorSettings;
use super::{ConfigError, ConfigResult, validator};

pub const ENV_PREFIX: &str = "GOVERNOR_";

const DEFAULT_FILE_NAMES: &[&str] = &["governor.yaml", "governor.yml", "governor.json"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsFormat {
    Json,
    Yaml,
}

impl SettingsFormat {
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match extension.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(ConfigError::UnsupportedFormat { extension }),
        }
    }

    pub fn parse(&self, content: &str) -> ConfigResult<GovernorSettings> {
        match self {
            Self::Json => Ok(serde_json::from_str(content)?),
            Self::Yaml => Ok(serde_yaml_bw::from_str(content)?),
        }
    }
}

#[derive(Debug, Default)]
pub struct SettingsLoader {
    path: Option<PathBuf>,
    search_default: bool,
    env: Option<HashMap<String, String>>,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from this file. A missing file is an error.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Fall back to the platform config directory when no path is given.
    pub fn search_default_dir(mut self) -> Self {
        self.search_default = true;
        self
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.env_vars(std::env::vars())
    }

    /// Apply overrides from the given variables instead of the process environment.
    pub fn env_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vars = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        self.env = Some(vars);
        self
    }

    pub fn default_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "cost-governor", "cost-governor")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Parse, apply overrides and validate.
    pub fn load(&self) -> ConfigResult<GovernorSettings> {
        let mut settings = match self.resolve_path()? {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                let settings = SettingsFormat::from_path(&path)?.parse(&content)?;
                tracing::info!(path = %path.display(), rules = settings.rules.len(), "Settings loaded");
                settings
            }
            None => GovernorSettings::default(),
        };

        if let Some(vars) = &self.env {
            apply_env_overrides(&mut settings, vars)?;
        }

        validator::validate(&settings)?;
        Ok(settings)
    }

    /// Parse settings from a string in the given format and validate them.
    pub fn from_str(content: &str, format: SettingsFormat) -> ConfigResult<GovernorSettings> {
        let settings = format.parse(content)?;
        validator::validate(&settings)?;
        Ok(settings)
    }

    fn resolve_path(&self) -> ConfigResult<Option<PathBuf>> {
        if let Some(path) = &self.path {
            if !path.exists() {
                return Err(ConfigError::NotFound { path: path.clone() });
            }
            return Ok(Some(path.clone()));
        }
        if !self.search_default {
            return Ok(None);
        }
        Ok(Self::default_dir().and_then(|dir| {
            DEFAULT_FILE_NAMES
                .iter()
                .map(|name| dir.join(name))
                .find(|p| p.exists())
        }))
    }
}

fn apply_env_overrides(
    settings: &mut GovernorSettings,
    vars: &HashMap<String, String>,
) -> ConfigResult<()> {
    for (name, raw) in vars {
        let Some(key) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let value = raw.trim();
        match key {
            "BATCH_MAX_SIZE" => settings.batch.max_size = parse(name, value)?,
            "BATCH_MAX_WAIT" => settings.batch.max_wait = duration(name, value)?,
            "BATCH_MAX_CONCURRENT_DISPATCHES" => {
                settings.batch.max_concurrent_dispatches = parse(name, value)?
            }
            "DEDUP_TTL" => settings.dedup.ttl = duration(name, value)?,
            "DEDUP_MAX_ENTRIES" => settings.dedup.max_entries = parse(name, value)?,
            "DEDUP_AGGRESSIVE_TTL_MULTIPLIER" => {
                settings.dedup.aggressive_ttl_multiplier = parse(name, value)?
            }
            "DEDUP_SWEEP_INTERVAL" => settings.dedup.sweep_interval = duration(name, value)?,
            "MONITOR_INTERVAL" => settings.monitor.interval = duration(name, value)?,
            "MONITOR_STALL_THRESHOLD" => settings.monitor.stall_threshold = duration(name, value)?,
            "MONITOR_HISTORY_CAPACITY" => settings.monitor.history_capacity = parse(name, value)?,
            "MONITOR_RATE_WINDOW" => settings.monitor.rate_window = duration(name, value)?,
            "MONITOR_FIRING_POLICY" => settings.monitor.firing_policy = json_value(name, value)?,
            "UPSTREAM_DEFAULT_MODEL" => settings.upstream.default_model = value.to_string(),
            "UPSTREAM_STANDARD_MAX_TOKENS" => {
                settings.upstream.standard_max_tokens = parse(name, value)?
            }
            "UPSTREAM_DEGRADED_MAX_TOKENS" => {
                settings.upstream.degraded_max_tokens = parse(name, value)?
            }
            // GOVERNOR_PRICING_* is read by the pricing table.
            _ => {
                tracing::trace!(variable = %name, "Ignoring unrecognized environment override");
                continue;
            }
        }
        tracing::debug!(variable = %name, "Environment override applied");
    }
    Ok(())
}

fn parse<T: FromStr>(name: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: name.to_string(),
        message: e.to_string(),
    })
}

fn duration(name: &str, value: &str) -> ConfigResult<std::time::Duration> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| {
        ConfigError::InvalidValue {
            key: name.to_string(),
            message: e.to_string(),
        }
    })
}

fn json_value<T: DeserializeOwned>(name: &str, value: &str) -> ConfigResult<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(|e| {
        ConfigError::InvalidValue {
            key: name.to_string(),
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::budget::FiringPolicy;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            SettingsFormat::from_path(Path::new("a/governor.YML")).unwrap(),
            SettingsFormat::Yaml
        );
        assert_eq!(
            SettingsFormat::from_path(Path::new("governor.json")).unwrap(),
            SettingsFormat::Json
        );
        assert!(matches!(
            SettingsFormat::from_path(Path::new("governor.toml")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "batch:\n  max_size: 3\n  max_wait: 100ms\nrules:\n  - metric: total_cost\n    level: warning\n    threshold: 10\n    actions:\n      - type: log"
        )
        .unwrap();

        let settings = SettingsLoader::new().path(file.path()).load().unwrap();
        assert_eq!(settings.batch.max_size, 3);
        assert_eq!(settings.batch.max_wait, Duration::from_millis(100));
        assert_eq!(settings.rules.len(), 1);
    }

    #[test]
    fn test_missing_file() {
        let err = SettingsLoader::new()
            .path("/nonexistent/governor.yaml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let settings = SettingsLoader::new()
            .env_vars(vars(&[
                ("GOVERNOR_BATCH_MAX_SIZE", "16"),
                ("GOVERNOR_DEDUP_TTL", "2m"),
                ("GOVERNOR_MONITOR_FIRING_POLICY", "all_exceeded"),
                ("GOVERNOR_UPSTREAM_DEFAULT_MODEL", "small"),
                ("UNRELATED", "x"),
            ]))
            .load()
            .unwrap();
        assert_eq!(settings.batch.max_size, 16);
        assert_eq!(settings.dedup.ttl, Duration::from_secs(120));
        assert_eq!(settings.monitor.firing_policy, FiringPolicy::AllExceeded);
        assert_eq!(settings.upstream.default_model, "small");
    }

    #[test]
    fn test_bad_env_override() {
        let err = SettingsLoader::new()
            .env_vars(vars(&[("GOVERNOR_BATCH_MAX_SIZE", "many")]))
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("GOVERNOR_BATCH_MAX_SIZE"));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let err = SettingsLoader::from_str(r#"{"batch": {"max_size": 0}}"#, SettingsFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationErrors(_)));
    }
}
