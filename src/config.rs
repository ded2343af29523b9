use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// A named upstream-address source.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySource {
  pub name: String,
  #[serde(rename = "type", default)]
  pub source_type: String,
  #[serde(default, rename = "fetchURL")]
  pub fetch_url: Option<String>,
  #[serde(default, rename = "fixedAddr")]
  pub fixed_addr: Vec<String>,
  #[serde(with = "humantime_serde")]
  pub ttl: Duration,
}

/// Top-level configuration, immutable after load.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
  #[serde(default)]
  pub host: Vec<String>,
  #[serde(default, rename = "sources")]
  pub proxy_sources: Vec<ProxySource>,
}

/// Loads the configuration from `path`.
///
/// If the file does not exist, an empty file is created there and an
/// all-default (no rules, no sources) configuration is returned, matching
/// the reference implementation's "create a starting point" behavior. If
/// the file exists but fails to parse, this returns an error (the caller
/// treats this as a fatal startup failure, exit code 1).
pub fn load_config(path: &Path) -> Result<Config> {
  if !path.exists() {
    std::fs::write(path, b"").with_context(|| format!("failed to create config file at {}", path.display()))?;
    return Ok(Config::default());
  }

  let contents = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read config file at {}", path.display()))?;

  if contents.trim().is_empty() {
    return Ok(Config::default());
  }

  let config: Config =
    serde_yaml::from_str(&contents).with_context(|| "failed to parse config file as YAML")?;
  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_full_config() {
    let yaml = r#"
host:
  - "^api\\.example\\.com$"
sources:
  - name: primary
    type: fixed
    fixedAddr: ["127.0.0.1:8080"]
    ttl: 2s
  - name: fallback
    type: common
    fetchURL: "http://example.com/list.txt"
    ttl: 5m
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.host.len(), 1);
    assert_eq!(config.proxy_sources.len(), 2);
    assert_eq!(config.proxy_sources[0].source_type, "fixed");
    assert_eq!(config.proxy_sources[0].ttl, Duration::from_secs(2));
    assert_eq!(config.proxy_sources[1].ttl, Duration::from_secs(300));
    assert_eq!(
      config.proxy_sources[1].fetch_url.as_deref(),
      Some("http://example.com/list.txt")
    );
  }

  #[test]
  fn test_missing_file_creates_default() {
    let dir = std::env::temp_dir().join(format!("proxy-pool-gateway-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("conf.yaml");
    let config = load_config(&path).unwrap();
    assert!(path.exists());
    assert!(config.host.is_empty());
    assert!(config.proxy_sources.is_empty());
    std::fs::remove_dir_all(&dir).unwrap();
  }
}
