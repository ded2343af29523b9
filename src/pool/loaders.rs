use fancy_regex::Regex;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::OnceLock;

use crate::error::ProxyError;

fn address_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"^((25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?):[0-9]{1,5}$",
    )
    .expect("address regex is valid")
  })
}

/// True iff `addr` is a well-formed `IPv4:PORT` string.
pub fn is_valid_address(addr: &str) -> bool {
  address_regex().is_match(addr).unwrap_or(false)
}

/// Uniform source-loader interface: produce a batch of candidate addresses.
#[async_trait::async_trait]
pub trait Loader: Send + Sync {
  async fn get_addresses(&self) -> Result<Vec<String>, ProxyError>;
}

/// Returns the configured list verbatim; trusted input, no validation.
pub struct FixedLoader {
  addrs: Vec<String>,
}

impl FixedLoader {
  pub fn new(addrs: Vec<String>) -> Self {
    Self { addrs }
  }
}

#[async_trait::async_trait]
impl Loader for FixedLoader {
  async fn get_addresses(&self) -> Result<Vec<String>, ProxyError> {
    Ok(self.addrs.clone())
  }
}

/// Fetches a newline-separated address list from an HTTP endpoint.
pub struct CommonHttpLoader {
  fetch_url: String,
}

impl CommonHttpLoader {
  pub fn new(fetch_url: String) -> Self {
    Self { fetch_url }
  }
}

#[async_trait::async_trait]
impl Loader for CommonHttpLoader {
  async fn get_addresses(&self) -> Result<Vec<String>, ProxyError> {
    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri: hyper::Uri = self
      .fetch_url
      .parse()
      .map_err(|e| ProxyError::SourceFetchFailed(format!("invalid fetch URL: {e}")))?;

    let response = client
      .get(uri)
      .await
      .map_err(|e| ProxyError::SourceFetchFailed(e.to_string()))?;

    if response.status().as_u16() / 100 != 2 {
      return Err(ProxyError::SourceFetchFailed(format!(
        "unexpected status {}",
        response.status()
      )));
    }

    let body = response
      .into_body()
      .collect()
      .await
      .map_err(|e| ProxyError::SourceFetchFailed(e.to_string()))?
      .to_bytes();
    let text = String::from_utf8_lossy(&body);

    split_and_validate(&text)
  }
}

/// Normalizes line endings, trims, drops blanks, and validates every
/// remaining line. Rejects the whole batch on the first invalid line —
/// the fixed output is exactly the validated list, never the raw body.
fn split_and_validate(text: &str) -> Result<Vec<String>, ProxyError> {
  let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
  let mut addrs = Vec::new();
  for line in normalized.split('\n') {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }
    if !is_valid_address(line) {
      return Err(ProxyError::InvalidAddress(line.to_string()));
    }
    addrs.push(line.to_string());
  }
  Ok(addrs)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_valid_addresses() {
    assert!(is_valid_address("127.0.0.1:8080"));
    assert!(is_valid_address("255.255.255.255:65535"));
    assert!(!is_valid_address("not-an-ip"));
    assert!(!is_valid_address("127.0.0.1"));
    assert!(!is_valid_address("256.0.0.1:80"));
  }

  #[test]
  fn test_split_and_validate_happy_path() {
    let body = "1.2.3.4:80\r\n5.6.7.8:81\r\n";
    let addrs = split_and_validate(body).unwrap();
    assert_eq!(addrs, vec!["1.2.3.4:80", "5.6.7.8:81"]);
  }

  #[test]
  fn test_split_and_validate_rejects_whole_batch() {
    let body = "1.2.3.4:80\r\nnot-an-ip\r\n";
    let err = split_and_validate(body).unwrap_err();
    assert!(matches!(err, ProxyError::InvalidAddress(ref line) if line == "not-an-ip"));
  }

  #[test]
  fn test_split_and_validate_skips_blank_lines() {
    let body = "1.2.3.4:80\n\n\n5.6.7.8:81\n";
    let addrs = split_and_validate(body).unwrap();
    assert_eq!(addrs, vec!["1.2.3.4:80", "5.6.7.8:81"]);
  }

  #[tokio::test]
  async fn test_fixed_loader_returns_verbatim() {
    let loader = FixedLoader::new(vec!["not-validated-at-all".to_string()]);
    let addrs = loader.get_addresses().await.unwrap();
    assert_eq!(addrs, vec!["not-validated-at-all"]);
  }
}
