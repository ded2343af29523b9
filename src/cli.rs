use std::path::PathBuf;

use clap::Parser;

/// Conditional-routing forwarding HTTP proxy.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(about, long_about = None)]
pub struct CliArgs {
  /// The IP address to listen on.
  #[arg(long, default_value = "0.0.0.0")]
  pub host: String,

  /// The port to listen on.
  #[arg(long, default_value_t = 8001)]
  pub port: u16,

  /// Enable debug-level logging.
  #[arg(long)]
  pub debug: bool,

  /// Enable file logging (daily-rotating log files under --log-dir).
  #[arg(long)]
  pub log: bool,

  /// Directory to write daily-rotating log files to, when --log is set.
  #[arg(long = "log-dir", alias = "logDir", default_value = "log")]
  pub log_dir: PathBuf,

  /// Path to the YAML configuration file.
  #[arg(long, default_value = "conf.yaml")]
  pub config: PathBuf,

  /// Print the version and exit.
  #[arg(long)]
  pub version: bool,
}

impl CliArgs {
  /// Whether debug mode is active, accounting for the env var override.
  pub fn debug_enabled(&self) -> bool {
    self.debug || std::env::var("PROXY_SERVER_DEBUG").as_deref() == Ok("true")
  }
}

pub const VERSION: &str = "0.1.0";

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let args = CliArgs::parse_from(["proxy-pool-gateway"]);
    assert_eq!(args.host, "0.0.0.0");
    assert_eq!(args.port, 8001);
    assert!(!args.debug);
    assert!(!args.log);
    assert_eq!(args.log_dir, PathBuf::from("log"));
    assert_eq!(args.config, PathBuf::from("conf.yaml"));
    assert!(!args.version);
  }

  #[test]
  fn test_overrides() {
    let args = CliArgs::parse_from([
      "proxy-pool-gateway",
      "--host",
      "127.0.0.1",
      "--port",
      "9000",
      "--debug",
      "--log",
      "--log-dir",
      "/var/log/proxy",
      "--config",
      "/etc/proxy/conf.yaml",
    ]);
    assert_eq!(args.host, "127.0.0.1");
    assert_eq!(args.port, 9000);
    assert!(args.debug);
    assert!(args.log);
    assert_eq!(args.log_dir, PathBuf::from("/var/log/proxy"));
    assert_eq!(args.config, PathBuf::from("/etc/proxy/conf.yaml"));
  }

  #[test]
  fn test_version_flag() {
    let args = CliArgs::parse_from(["proxy-pool-gateway", "--version"]);
    assert!(args.version);
  }

  #[test]
  fn test_debug_env_override() {
    std::env::set_var("PROXY_SERVER_DEBUG", "true");
    let args = CliArgs::parse_from(["proxy-pool-gateway"]);
    assert!(args.debug_enabled());
    std::env::remove_var("PROXY_SERVER_DEBUG");
  }
}
