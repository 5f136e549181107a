use std::env;
use std::time::Duration;

use anyhow::{bail, Result};
use couture_contracts::versions::DEFAULT_HISTORY_LIMIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Dryrun,
    Http,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dryrun" | "local" => Ok(Self::Dryrun),
            "http" | "remote" => Ok(Self::Http),
            other => bail!("unknown backend '{other}' (expected dryrun or http)"),
        }
    }
}

/// Runtime settings, read from `COUTURE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct StudioConfig {
    pub backend: BackendKind,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub request_timeout: Duration,
    pub history_limit: usize,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Dryrun,
            api_base: None,
            api_key: None,
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(60),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl StudioConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    /// Builds a config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        let backend = match get("COUTURE_BACKEND") {
            Some(raw) => BackendKind::parse(&raw)?,
            None => defaults.backend,
        };
        Ok(Self {
            backend,
            api_base: get("COUTURE_API_BASE").map(|value| value.trim_end_matches('/').to_string()),
            api_key: get("COUTURE_API_KEY"),
            poll_interval: seconds(get("COUTURE_POLL_INTERVAL"), defaults.poll_interval, 0.05, 30.0),
            poll_timeout: seconds(get("COUTURE_POLL_TIMEOUT"), defaults.poll_timeout, 1.0, 3600.0),
            request_timeout: seconds(
                get("COUTURE_HTTP_TIMEOUT"),
                defaults.request_timeout,
                1.0,
                600.0,
            ),
            history_limit: get("COUTURE_HISTORY_LIMIT")
                .and_then(|raw| raw.parse::<usize>().ok())
                .map(|limit| limit.max(2))
                .unwrap_or(defaults.history_limit),
        })
    }
}

fn seconds(raw: Option<String>, default: Duration, min: f64, max: f64) -> Duration {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .map(|value| Duration::from_secs_f64(value.clamp(min, max)))
        .unwrap_or(default)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() -> anyhow::Result<()> {
        let config = StudioConfig::from_lookup(lookup(&[]))?;
        assert_eq!(config, StudioConfig::default());
        Ok(())
    }

    #[test]
    fn values_are_parsed_and_clamped() -> anyhow::Result<()> {
        let config = StudioConfig::from_lookup(lookup(&[
            ("COUTURE_BACKEND", " HTTP "),
            ("COUTURE_API_BASE", "https://api.example.test/v1/"),
            ("COUTURE_API_KEY", "   "),
            ("COUTURE_POLL_INTERVAL", "0.001"),
            ("COUTURE_POLL_TIMEOUT", "99999"),
            ("COUTURE_HTTP_TIMEOUT", "nope"),
            ("COUTURE_HISTORY_LIMIT", "1"),
        ]))?;
        assert_eq!(config.backend, BackendKind::Http);
        assert_eq!(config.api_base.as_deref(), Some("https://api.example.test/v1"));
        assert!(config.api_key.is_none());
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.poll_timeout, Duration::from_secs(3600));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.history_limit, 2);
        Ok(())
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(StudioConfig::from_lookup(lookup(&[("COUTURE_BACKEND", "grpc")])).is_err());
    }
}
