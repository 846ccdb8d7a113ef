//! `terrace.toml` loading
//!
//! Lookup order: `--config`, `./terrace.toml`, then
//! `<config dir>/terrace/config.toml`. Missing files yield defaults; CLI flags
//! override whatever is loaded.

use anyhow::{Context, Result};
use converge::duration::parse_duration;
use converge::{ExecuteOptions, ProviderConfig, RetryConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "terrace.toml";
pub const DEFAULT_STATE_PATH: &str = ".terrace/state.json";

/// Config file as written on disk
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    state_path: Option<String>,
    jobs: Option<usize>,
    default_timeout: Option<String>,
    #[serde(default)]
    retry: RetryFile,
    #[serde(default)]
    provider: toml::Table,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryFile {
    max_attempts: Option<u32>,
    base_delay: Option<String>,
    backoff_factor: Option<f64>,
    max_delay: Option<String>,
}

/// Resolved settings for a run
#[derive(Debug, Clone)]
pub struct Settings {
    /// Where the config was read from, if anywhere
    pub source: Option<PathBuf>,
    pub state_path: PathBuf,
    pub jobs: usize,
    pub default_timeout: Duration,
    pub retry: RetryConfig,
    pub provider: ProviderConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = ExecuteOptions::default();
        Self {
            source: None,
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            jobs: defaults.jobs,
            default_timeout: defaults.default_timeout,
            retry: defaults.retry,
            provider: ProviderConfig::new(),
        }
    }
}

impl Settings {
    /// Load settings, honouring an explicit path first
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return Self::from_file(&local);
        }

        if let Some(user) = user_config_path()
            && user.is_file()
        {
            return Self::from_file(&user);
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        let mut settings = Self::parse(&content).with_context(|| format!("Invalid config in {}", path.display()))?;
        settings.source = Some(path.to_path_buf());
        log::debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut settings = Self::default();

        if let Some(path) = file.state_path {
            settings.state_path = expand_path(&path);
        }
        if let Some(jobs) = file.jobs {
            anyhow::ensure!(jobs > 0, "jobs must be at least 1");
            settings.jobs = jobs;
        }
        if let Some(timeout) = file.default_timeout {
            settings.default_timeout = duration(&timeout, "default_timeout")?;
        }

        let retry = file.retry;
        if let Some(n) = retry.max_attempts {
            settings.retry.max_attempts = n.max(1);
        }
        if let Some(d) = retry.base_delay {
            settings.retry.base_delay = duration(&d, "retry.base_delay")?;
        }
        if let Some(f) = retry.backoff_factor {
            anyhow::ensure!(f >= 1.0, "retry.backoff_factor must be >= 1.0");
            settings.retry.backoff_factor = f;
        }
        if let Some(d) = retry.max_delay {
            settings.retry.max_delay = duration(&d, "retry.max_delay")?;
        }

        if !file.provider.is_empty() {
            let value = serde_json::to_value(&file.provider).context("Invalid [provider] table")?;
            if let serde_json::Value::Object(map) = value {
                settings.provider = ProviderConfig::from(map);
            }
        }

        Ok(settings)
    }

    /// Executor options, with `jobs` overridden from the command line
    pub fn execute_options(&self, jobs: Option<usize>, dry_run: bool) -> ExecuteOptions {
        ExecuteOptions {
            dry_run,
            jobs: jobs.unwrap_or(self.jobs).max(1),
            default_timeout: self.default_timeout,
            retry: self.retry.clone(),
        }
    }
}

fn duration(value: &str, field: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| anyhow::anyhow!("{field}: {e}"))
}

/// Expand `~` and environment variables in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).map_or_else(|_| shellexpand::tilde(path), |p| p);
    PathBuf::from(expanded.as_ref())
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("terrace").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let settings = Settings::parse(
            r#"
state_path = "/var/lib/terrace/state.json"
jobs = 8
default_timeout = "30m"

[retry]
max_attempts = 5
base_delay = "1s"
backoff_factor = 3.0

[provider]
region = "eu-west-1"
tags = { team = "platform" }
"#,
        )
        .unwrap();

        assert_eq!(settings.state_path, PathBuf::from("/var/lib/terrace/state.json"));
        assert_eq!(settings.jobs, 8);
        assert_eq!(settings.default_timeout, Duration::from_secs(1800));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.base_delay, Duration::from_secs(1));
        assert!((settings.retry.backoff_factor - 3.0).abs() < f64::EPSILON);
        assert_eq!(settings.provider.get("region"), Some(&serde_json::json!("eu-west-1")));
        assert_eq!(
            settings.provider.get("tags"),
            Some(&serde_json::json!({"team": "platform"}))
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.state_path, PathBuf::from(DEFAULT_STATE_PATH));
        assert_eq!(settings.jobs, 4);
        assert!(settings.provider.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(Settings::parse("jobs = 0").is_err());
        assert!(Settings::parse(r#"default_timeout = "soon""#).is_err());
        assert!(Settings::parse("unknown_key = 1").is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let settings = Settings::parse(r#"state_path = "~/terrace/state.json""#).unwrap();
        assert!(!settings.state_path.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_from_file_records_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("terrace.toml");
        fs::write(&path, "jobs = 2\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.jobs, 2);
        assert_eq!(settings.source.as_deref(), Some(path.as_path()));

        assert!(Settings::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_execute_options_override() {
        let settings = Settings::default();
        let options = settings.execute_options(Some(1), true);
        assert_eq!(options.jobs, 1);
        assert!(options.dry_run);
        assert_eq!(settings.execute_options(None, false).jobs, 4);
    }
}
