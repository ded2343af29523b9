use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::logging::Logger;
use crate::pool::DynamicPool;
use crate::routing::HostRules;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// A CONNECT request's relevant parts, already parsed off the raw client
/// socket before this engine takes over (see `server.rs`).
pub struct ConnectRequest<'a> {
  pub host: &'a str,
  pub version: &'a str,
  pub headers: &'a [(String, String)],
  /// Bytes the caller already read past the header terminator in the same
  /// initial read (rare for CONNECT, but tolerated per spec).
  pub body_prefix: &'a [u8],
}

/// Runs the CONNECT tunnel engine on an already-hijacked client socket.
///
/// The caller must not have written anything to `client` yet — the `200
/// Connection established` line is written here, only after a usable peer
/// connection has been established, per the spec's `Accept` step ordering.
pub async fn handle_connect(
  req: &ConnectRequest<'_>,
  mut client: TcpStream,
  pool: &DynamicPool,
  rules: &HostRules,
  logger: &Logger,
  trace_id: &str,
) {
  let peer = dial_peer(req, pool, rules, logger, trace_id).await;

  let mut peer_stream = match peer {
    Ok(stream) => stream,
    Err(err) => {
      let reason = err.to_string();
      logger.error(
        "direct dial failed for CONNECT",
        &[("host", req.host), ("trace_id", trace_id), ("reason", &reason)],
      );
      let _ = client
        .write_all(
          format!(
            "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            reason.len(),
            reason
          )
          .as_bytes(),
        )
        .await;
      return;
    }
  };

  if client
    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
    .await
    .is_err()
  {
    return;
  }

  match tokio::io::copy_bidirectional(&mut client, &mut peer_stream).await {
    Ok(_) => {}
    Err(e) => logger.warn(
      "tunnel copy ended with an error",
      &[("host", req.host), ("trace_id", trace_id), ("error", &e.to_string())],
    ),
  }
}

/// Resolves the connection to splice the client into: either a tunnel
/// through a pool-selected upstream proxy, or a direct connection to the
/// original target. Returns an error only if both attempts fail.
async fn dial_peer(
  req: &ConnectRequest<'_>,
  pool: &DynamicPool,
  rules: &HostRules,
  logger: &Logger,
  trace_id: &str,
) -> Result<TcpStream, ProxyError> {
  if rules.needs_proxy(req.host) {
    match try_create_proxy_tunnel(req, pool, logger, trace_id).await {
      Ok(stream) => return Ok(stream),
      Err(err) => {
        logger.warn(
          "proxy tunnel attempt failed, falling back to direct",
          &[("host", req.host), ("trace_id", trace_id), ("reason", &err.to_string())],
        );
      }
    }
  }

  direct_dial(req.host, req.body_prefix).await
}

/// Exactly one `pool.get_address()` call per CONNECT attempt: the same
/// resolved address is used to dial and, on dial failure, to disable.
/// A later handshake-write or verify-tunnel failure does *not* disable the
/// address — only a failed `DialUpstream` does.
async fn try_create_proxy_tunnel(
  req: &ConnectRequest<'_>,
  pool: &DynamicPool,
  logger: &Logger,
  trace_id: &str,
) -> Result<TcpStream, ProxyError> {
  let addr = pool.get_address().await?;

  let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
    Ok(Ok(stream)) => stream,
    Ok(Err(e)) => {
      pool.disable_address(&addr).await;
      return Err(ProxyError::UpstreamDialFailed { addr, reason: e.to_string() });
    }
    Err(_) => {
      pool.disable_address(&addr).await;
      return Err(ProxyError::UpstreamDialFailed { addr, reason: "dial timed out".to_string() });
    }
  };

  configure_keep_alive(&stream);

  let connect_bytes = build_connect_request(req);
  if let Err(e) = stream.write_all(&connect_bytes).await {
    return Err(ProxyError::TunnelHandshakeFailed(format!("handshake write to {addr} failed: {e}")));
  }

  match verify_tunnel(&mut stream).await {
    Ok(()) => {
      logger.debug(
        "proxy tunnel established",
        &[("host", req.host), ("trace_id", trace_id), ("addr", &addr)],
      );
      Ok(stream)
    }
    Err(reason) => Err(ProxyError::TunnelHandshakeFailed(reason)),
  }
}

async fn direct_dial(host: &str, body_prefix: &[u8]) -> Result<TcpStream, ProxyError> {
  match timeout(CONNECT_TIMEOUT, TcpStream::connect(host)).await {
    Ok(Ok(mut stream)) => {
      configure_keep_alive(&stream);
      if !body_prefix.is_empty() {
        if let Err(e) = stream.write_all(body_prefix).await {
          return Err(ProxyError::DirectDialFailed(format!(
            "failed to forward buffered body bytes to {host}: {e}"
          )));
        }
      }
      Ok(stream)
    }
    Ok(Err(e)) => Err(ProxyError::DirectDialFailed(format!("direct dial to {host} failed: {e}"))),
    Err(_) => Err(ProxyError::DirectDialFailed(format!("direct dial to {host} timed out"))),
  }
}

fn configure_keep_alive(stream: &TcpStream) {
  let sock_ref = socket2::SockRef::from(stream);
  let _ = sock_ref.set_keepalive(true);
  let _ = sock_ref.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(KEEP_ALIVE));
}

/// Reconstructs the CONNECT handshake line-by-line for the upstream proxy,
/// preserving only the first value of each client header (case-insensitive,
/// intentional — multi-value headers are not carried across this hop). The
/// engine emits its own `Host` line, so a client-supplied `Host` header is
/// skipped rather than duplicated. Any bytes already read past the header
/// terminator in the same initial read are appended after the blank line.
fn build_connect_request(req: &ConnectRequest<'_>) -> Vec<u8> {
  let mut out = format!("CONNECT {} {}\r\nHost: {}\r\n", req.host, req.version, req.host);

  let mut seen: Vec<String> = Vec::with_capacity(req.headers.len());
  for (name, value) in req.headers {
    if name.eq_ignore_ascii_case("host") {
      continue;
    }
    if seen.iter().any(|seen_name| seen_name.eq_ignore_ascii_case(name)) {
      continue;
    }
    seen.push(name.clone());
    out.push_str(&format!("{name}: {value}\r\n"));
  }
  out.push_str("\r\n");

  let mut bytes = out.into_bytes();
  bytes.extend_from_slice(req.body_prefix);
  bytes
}

/// Reads up to 1024 bytes in a single read and accepts iff the prefix is
/// an HTTP/1.0 or HTTP/1.1 `200 Connection established` line. Any bytes
/// beyond the status line in that same read are intentionally discarded.
async fn verify_tunnel(stream: &mut TcpStream) -> Result<(), String> {
  let mut buf = [0u8; 1024];
  let n = stream
    .read(&mut buf)
    .await
    .map_err(|e| format!("failed to read tunnel handshake response: {e}"))?;
  let response = String::from_utf8_lossy(&buf[..n]);
  if response.starts_with("HTTP/1.1 200 Connection established")
    || response.starts_with("HTTP/1.0 200 Connection established")
  {
    Ok(())
  } else {
    Err(format!("unexpected tunnel handshake response: {}", response.trim()))
  }
}
