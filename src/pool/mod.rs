pub mod loaders;

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::{Config, ProxySource};
use crate::error::ProxyError;
use loaders::{CommonHttpLoader, FixedLoader, Loader};

const INITIAL_BACKOFF: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(120 * 60);

/// A `ProxySource` plus mutable health/back-off state.
struct DisableableSource {
  source: ProxySource,
  disabled_at: Option<Instant>,
  disabled_for: Duration,
}

impl DisableableSource {
  fn new(source: ProxySource) -> Self {
    Self {
      source,
      disabled_at: None,
      disabled_for: Duration::ZERO,
    }
  }

  fn is_disabled(&self) -> bool {
    match self.disabled_at {
      None => false,
      Some(at) => Instant::now() < at + self.disabled_for,
    }
  }

  fn disable(&mut self) {
    self.disabled_at = Some(Instant::now());
    self.disabled_for = if self.disabled_for.is_zero() {
      INITIAL_BACKOFF
    } else {
      (self.disabled_for * 2).min(MAX_BACKOFF)
    };
  }

  fn enable(&mut self) {
    self.disabled_at = None;
    self.disabled_for = Duration::ZERO;
  }

  fn loader(&self) -> Result<Box<dyn Loader>, ProxyError> {
    match self.source.source_type.as_str() {
      "fixed" => Ok(Box::new(FixedLoader::new(self.source.fixed_addr.clone()))),
      "common" | "" => {
        let url = self.source.fetch_url.clone().unwrap_or_default();
        Ok(Box::new(CommonHttpLoader::new(url)))
      }
      other => Err(ProxyError::UnknownSourceType(other.to_string())),
    }
  }
}

struct ExpiringAddr {
  addr: String,
  expiration: Instant,
}

struct PoolState {
  sources: Vec<DisableableSource>,
  addr_store: Vec<ExpiringAddr>,
}

/// The dynamically-refilled upstream address pool.
///
/// All operations hold a single mutex for their entire duration, including
/// the blocking HTTP fetch a source loader may perform. This is deliberate:
/// it prevents a refill stampede against a source at the cost of
/// serializing callers during a refill.
pub struct DynamicPool {
  state: Mutex<PoolState>,
}

impl DynamicPool {
  pub fn new(config: &Config) -> Self {
    let sources = config
      .proxy_sources
      .iter()
      .cloned()
      .map(DisableableSource::new)
      .collect();
    Self {
      state: Mutex::new(PoolState {
        sources,
        addr_store: Vec::new(),
      }),
    }
  }

  /// Returns one live cached address, refilling from the first non-disabled
  /// source if the cache is empty.
  pub async fn get_address(&self) -> Result<String, ProxyError> {
    let mut state = self.state.lock().await;

    if let Some(addr) = peek_addr(&mut state.addr_store) {
      return Ok(addr);
    }

    let source_index = state
      .sources
      .iter()
      .position(|s| !s.is_disabled())
      .ok_or(ProxyError::NoSourceAvailable)?;

    let ttl = state.sources[source_index].source.ttl;
    let loader = state.sources[source_index].loader();

    let loader = match loader {
      Ok(loader) => loader,
      Err(err) => {
        state.sources[source_index].disable();
        return Err(err);
      }
    };

    match loader.get_addresses().await {
      Ok(addrs) => {
        state.sources[source_index].enable();
        let now = Instant::now();
        for addr in &addrs {
          state.addr_store.push(ExpiringAddr {
            addr: addr.clone(),
            expiration: now + ttl,
          });
        }
        addrs.first().cloned().ok_or(ProxyError::NoSourceAvailable)
      }
      Err(err) => {
        state.sources[source_index].disable();
        Err(err)
      }
    }
  }

  /// Removes the first occurrence of `addr` from the cache. No-op if
  /// absent. Source health is untouched — a bad endpoint does not punish
  /// its source.
  pub async fn disable_address(&self, addr: &str) {
    let mut state = self.state.lock().await;
    if let Some(pos) = state.addr_store.iter().position(|a| a.addr == addr) {
      state.addr_store.remove(pos);
    }
  }
}

/// Scans in insertion order, dropping expired entries as it goes, and
/// returns the first still-live address. Empties the store if everything
/// has expired.
fn peek_addr(addr_store: &mut Vec<ExpiringAddr>) -> Option<String> {
  let now = Instant::now();
  while let Some(front) = addr_store.first() {
    if front.expiration > now {
      return Some(front.addr.clone());
    }
    addr_store.remove(0);
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ProxySource;
  use std::thread::sleep;

  fn fixed_source(name: &str, addrs: Vec<&str>, ttl: Duration) -> ProxySource {
    ProxySource {
      name: name.to_string(),
      source_type: "fixed".to_string(),
      fetch_url: None,
      fixed_addr: addrs.into_iter().map(String::from).collect(),
      ttl,
    }
  }

  #[tokio::test]
  async fn test_pool_caching_ttl() {
    let mut config = Config::default();
    config
      .proxy_sources
      .push(fixed_source("s1", vec!["127.0.0.1:8080"], Duration::from_secs(2)));
    let pool = DynamicPool::new(&config);

    let a1 = pool.get_address().await.unwrap();
    assert_eq!(a1, "127.0.0.1:8080");

    {
      let mut state = pool.state.lock().await;
      state.sources[0].source.fixed_addr = vec!["127.0.0.1:8081".to_string()];
    }

    sleep(Duration::from_secs(1));
    let a2 = pool.get_address().await.unwrap();
    assert_eq!(a2, a1, "cache should still be valid after 1s of a 2s ttl");

    sleep(Duration::from_secs(2));
    let a3 = pool.get_address().await.unwrap();
    assert_eq!(a3, "127.0.0.1:8081", "cache should have expired and refilled");
  }

  #[tokio::test]
  async fn test_disable_address_removes_from_cache() {
    let mut config = Config::default();
    config.proxy_sources.push(fixed_source(
      "s1",
      vec!["127.0.0.1:8080", "127.0.0.1:8081"],
      Duration::from_secs(30),
    ));
    let pool = DynamicPool::new(&config);

    let a1 = pool.get_address().await.unwrap();
    assert_eq!(a1, "127.0.0.1:8080");
    pool.disable_address(&a1).await;

    let a2 = pool.get_address().await.unwrap();
    assert_eq!(a2, "127.0.0.1:8081");
  }

  #[tokio::test]
  async fn test_no_source_available() {
    let config = Config::default();
    let pool = DynamicPool::new(&config);
    let err = pool.get_address().await.unwrap_err();
    assert!(matches!(err, ProxyError::NoSourceAvailable));
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let mut source = DisableableSource::new(fixed_source("s1", vec!["127.0.0.1:8080"], Duration::from_secs(1)));
    assert!(!source.is_disabled());

    source.disable();
    assert_eq!(source.disabled_for, Duration::from_secs(15));
    source.disable();
    assert_eq!(source.disabled_for, Duration::from_secs(30));
    source.disable();
    assert_eq!(source.disabled_for, Duration::from_secs(60));
    source.disable();
    assert_eq!(source.disabled_for, Duration::from_secs(120));

    for _ in 0..20 {
      source.disable();
    }
    assert_eq!(source.disabled_for, MAX_BACKOFF);

    source.enable();
    assert_eq!(source.disabled_for, Duration::ZERO);
    assert!(!source.is_disabled());
  }
}
