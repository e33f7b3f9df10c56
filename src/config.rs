//! Optional `escript.json` next to the scripts.
//!
//! Command-line flags override anything set here.
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "escript.json";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Host variables copied into every script environment.
    #[serde(default)]
    pub passthrough_env: Option<Vec<String>>,
    /// Variables appended after the baseline environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// URL fetched once to decide the `[net]` condition.
    #[serde(default)]
    pub net_probe_url: Option<String>,
}

impl SuiteConfig {
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout_seconds.map(parse_timeout).transpose()
    }
}

/// Load `escript.json` from `dir`, or defaults when it does not exist.
pub fn load_suite_config(dir: &Path) -> Result<SuiteConfig> {
    let path = dir.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(SuiteConfig::default());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let config: SuiteConfig =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    for key in config.env.keys() {
        if key.is_empty() || key.contains('=') {
            return Err(anyhow!("{}: invalid env key {key:?}", path.display()));
        }
    }
    config.timeout()?;
    Ok(config)
}

/// Seconds as a positive, finite duration.
pub fn parse_timeout(seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(anyhow!("timeout must be a positive number of seconds, got {seconds}"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_suite_config(dir.path()).expect("load");
        assert!(config.passthrough_env.is_none());
        assert!(config.env.is_empty());
        assert!(config.timeout().expect("timeout").is_none());
    }

    #[test]
    fn parses_all_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "passthrough_env": ["DOCKER_HOST", "KUBECONFIG"],
                "env": {"FLEET_URL": "http://127.0.0.1:8080"},
                "timeout_seconds": 1.5,
                "net_probe_url": "http://example.invalid/"
            }"#,
        )
        .expect("write");
        let config = load_suite_config(dir.path()).expect("load");
        assert_eq!(
            config.passthrough_env.as_deref(),
            Some(&["DOCKER_HOST".to_string(), "KUBECONFIG".to_string()][..])
        );
        assert_eq!(config.env["FLEET_URL"], "http://127.0.0.1:8080");
        assert_eq!(
            config.timeout().expect("timeout"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.net_probe_url.as_deref(), Some("http://example.invalid/"));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);

        fs::write(&path, r#"{"timeout": 3}"#).expect("write");
        assert!(load_suite_config(dir.path()).is_err());

        fs::write(&path, r#"{"timeout_seconds": -1}"#).expect("write");
        assert!(load_suite_config(dir.path()).is_err());

        fs::write(&path, r#"{"env": {"A=B": "x"}}"#).expect("write");
        let err = load_suite_config(dir.path()).expect_err("bad key");
        assert!(err.to_string().contains("invalid env key"), "{err}");
    }
}
