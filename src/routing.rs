use fancy_regex::Regex;

/// Precompiled host-matching rules, built once from config and shared
/// read-only for the life of the process.
pub struct HostRules {
  patterns: Vec<Regex>,
}

impl HostRules {
  pub fn new(patterns: &[String]) -> Self {
    let compiled = patterns
      .iter()
      .filter_map(|p| match Regex::new(p) {
        Ok(re) => Some(re),
        Err(err) => {
          eprintln!("invalid host rule pattern {p:?}: {err}");
          None
        }
      })
      .collect();
    Self { patterns: compiled }
  }

  /// Whether `host` should be routed through the proxy pool. Matches are
  /// partial (unanchored); the first matching pattern wins. An empty rule
  /// list never proxies.
  pub fn needs_proxy(&self, host: &str) -> bool {
    self.patterns.iter().any(|re| re.is_match(host).unwrap_or(false))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_needs_proxy_matches_partial() {
    let rules = HostRules::new(&[r"^api\.example\.com$".to_string()]);
    assert!(rules.needs_proxy("api.example.com"));
    assert!(!rules.needs_proxy("other.com"));
  }

  #[test]
  fn test_empty_rules_never_proxy() {
    let rules = HostRules::new(&[]);
    assert!(!rules.needs_proxy("anything.com"));
  }

  #[test]
  fn test_unanchored_partial_match() {
    let rules = HostRules::new(&["example".to_string()]);
    assert!(rules.needs_proxy("sub.example.org"));
  }

  #[test]
  fn test_first_match_wins_over_later_invalid_pattern_ignored() {
    let rules = HostRules::new(&["good".to_string(), "(".to_string()]);
    assert!(rules.needs_proxy("a-good-host"));
  }
}
