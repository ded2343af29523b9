use thiserror::Error;

/// Operational error kinds surfaced by the pool, loaders, and engines.
///
/// These are never fatal to the process: callers fall back (to direct
/// dialing, to a 502/500 response) rather than letting one of these
/// propagate to the top.
#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("no proxy source is currently available")]
  NoSourceAvailable,

  #[error("source fetch failed: {0}")]
  SourceFetchFailed(String),

  #[error("invalid address: {0}")]
  InvalidAddress(String),

  #[error("unknown source type: {0}")]
  UnknownSourceType(String),

  #[error("failed to dial upstream {addr}: {reason}")]
  UpstreamDialFailed { addr: String, reason: String },

  #[error("tunnel handshake failed: {0}")]
  TunnelHandshakeFailed(String),

  #[error("direct dial failed: {0}")]
  DirectDialFailed(String),
}
