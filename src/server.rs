use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::connect::{self, ConnectRequest};
use crate::forward;
use crate::logging::Logger;
use crate::pool::DynamicPool;
use crate::routing::HostRules;

/// Maximum bytes read while looking for the end of a request head before
/// giving up on the connection.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// How long a connection may sit idle before a complete request head has
/// arrived.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the listener waits for in-flight connections to finish after a
/// shutdown signal before forcing an exit. Both spec.md and the reference
/// implementation agree on this value.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared, read-only state handed to every connection handler.
pub struct AppState {
  pub pool: DynamicPool,
  pub rules: HostRules,
  pub clients: forward::ForwardClients,
  pub logger: Logger,
}

/// Binds `host:port` and serves connections until a shutdown signal
/// arrives, then waits up to `SHUTDOWN_GRACE` for in-flight connections.
pub async fn run(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
  let listener = tokio::net::TcpListener::bind((host, port)).await?;
  state.logger.info("listening", &[("addr", &format!("{host}:{port}"))]);

  let shutdown = CancellationToken::new();
  let tracker = tokio_util::task::TaskTracker::new();

  let signal_token = shutdown.clone();
  tokio::spawn(async move {
    wait_for_shutdown_signal().await;
    signal_token.cancel();
  });

  loop {
    tokio::select! {
      accepted = listener.accept() => {
        let (stream, peer_addr) = match accepted {
          Ok(pair) => pair,
          Err(e) => {
            state.logger.warn("failed to accept connection", &[("error", &e.to_string())]);
            continue;
          }
        };
        let state = state.clone();
        tracker.spawn(handle_connection(stream, state));
        let _ = peer_addr;
      }
      _ = shutdown.cancelled() => {
        state.logger.info("shutdown signal received, no longer accepting connections", &[]);
        break;
      }
    }
  }

  tracker.close();
  if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
    state.logger.warn("shutdown grace period elapsed with connections still active", &[]);
  }
  state.logger.shutdown();
  Ok(())
}

async fn wait_for_shutdown_signal() {
  let ctrl_c = async {
    let _ = tokio::signal::ctrl_c().await;
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(_) => std::future::pending::<()>().await,
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {}
    _ = terminate => {}
  }
}

/// Reads just enough of a connection to see its first request line and
/// headers, then dispatches: a `CONNECT` request is handled entirely at
/// the raw-socket level (see `connect::handle_connect`); anything else is
/// replayed into a hyper HTTP/1 server connection. Recovers a handler
/// panic into a logged error rather than tearing down the whole listener.
async fn handle_connection(stream: TcpStream, state: Arc<AppState>) {
  let trace_id = uuid::Uuid::new_v4().to_string();

  let peeked = match tokio::time::timeout(HEAD_READ_TIMEOUT, peek_request_head(stream)).await {
    Ok(Ok(Some(peeked))) => peeked,
    Ok(Ok(None)) => return,
    Ok(Err((stream, e))) => {
      state.logger.warn(
        "failed to read request head",
        &[("trace_id", &trace_id), ("error", &e.to_string())],
      );
      drop(stream);
      return;
    }
    Err(_) => return,
  };

  if peeked.method.eq_ignore_ascii_case("CONNECT") {
    let req = ConnectRequest {
      host: &peeked.target,
      version: if peeked.version == 0 { "HTTP/1.0" } else { "HTTP/1.1" },
      headers: &peeked.headers,
      body_prefix: &peeked.body_prefix,
    };
    let result = std::panic::AssertUnwindSafe(connect::handle_connect(
      &req,
      peeked.stream,
      &state.pool,
      &state.rules,
      &state.logger,
      &trace_id,
    ))
    .catch_unwind()
    .await;
    if result.is_err() {
      state
        .logger
        .error("CONNECT handler panicked", &[("trace_id", &trace_id), ("host", &peeked.target)]);
    }
    return;
  }

  serve_forward_connection(peeked, state, trace_id).await;
}

async fn serve_forward_connection(peeked: PeekedHead, state: Arc<AppState>, trace_id: String) {
  let (read_half, write_half) = peeked.stream.into_split();
  let prefixed = Cursor::new(peeked.head_bytes).chain(read_half);
  let io = TokioIo::new(tokio::io::join(prefixed, write_half));

  let logger = state.logger.clone();
  let conn_trace_id = trace_id.clone();

  let service = service_fn(move |req: Request<Incoming>| {
    let state = state.clone();
    let trace_id = trace_id.clone();
    async move { Ok::<_, std::convert::Infallible>(dispatch_forward(req, state, trace_id).await) }
  });

  if let Err(e) = hyper::server::conn::http1::Builder::new()
    .serve_connection(io, service)
    .with_upgrades()
    .await
  {
    if !is_benign_conn_error(&e) {
      logger.warn(
        "connection ended with an error",
        &[("trace_id", &conn_trace_id), ("error", &e.to_string())],
      );
    }
  }
}

fn is_benign_conn_error(e: &hyper::Error) -> bool {
  e.is_incomplete_message() || e.is_closed()
}

async fn dispatch_forward(
  req: Request<Incoming>,
  state: Arc<AppState>,
  trace_id: String,
) -> hyper::Response<BoxBody<hyper::body::Bytes, hyper::Error>> {
  let host = extract_host(&req);
  let result = std::panic::AssertUnwindSafe(forward::handle_forward(
    req,
    &host,
    &state.pool,
    &state.rules,
    &state.clients,
    &state.logger,
    &trace_id,
  ))
  .catch_unwind()
  .await;

  match result {
    Ok(response) => response,
    Err(_) => {
      state
        .logger
        .error("forward handler panicked", &[("trace_id", &trace_id), ("host", &host)]);
      panic_response()
    }
  }
}

fn panic_response() -> hyper::Response<BoxBody<hyper::body::Bytes, hyper::Error>> {
  use http_body_util::{BodyExt, Full};
  let body = Full::new(hyper::body::Bytes::from_static(b"internal server error"))
    .map_err(|never| match never {})
    .boxed();
  hyper::Response::builder()
    .status(hyper::StatusCode::INTERNAL_SERVER_ERROR)
    .body(body)
    .unwrap_or_else(|_| hyper::Response::new(BoxBody::default()))
}

fn extract_host(req: &Request<Incoming>) -> String {
  if let Some(authority) = req.uri().authority() {
    return authority.as_str().to_string();
  }
  req
    .headers()
    .get(hyper::header::HOST)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .to_string()
}

struct PeekedHead {
  stream: TcpStream,
  head_bytes: Vec<u8>,
  method: String,
  target: String,
  version: u8,
  headers: Vec<(String, String)>,
  /// Bytes already read past the header terminator in the same initial
  /// read (the start of the body, or pipelined bytes). Replayed ahead of
  /// the live socket for the HTTP path via `head_bytes`; forwarded
  /// explicitly to the CONNECT engine, which never replays `head_bytes`.
  body_prefix: Vec<u8>,
}

/// Reads from `stream` until a complete request head (`\r\n\r\n`) has
/// arrived, parses the request line and headers with `httparse`, and hands
/// back both the parsed fields and the still-open stream (with the raw
/// head bytes, so a non-CONNECT caller can replay them ahead of the live
/// socket). Returns `Ok(None)` if the peer closed before sending a head.
async fn peek_request_head(mut stream: TcpStream) -> Result<Option<PeekedHead>, (TcpStream, std::io::Error)> {
  let mut buf = Vec::with_capacity(1024);
  loop {
    let mut chunk = [0u8; 1024];
    let n = match stream.read(&mut chunk).await {
      Ok(n) => n,
      Err(e) => return Err((stream, e)),
    };
    if n == 0 {
      return Ok(None);
    }
    buf.extend_from_slice(&chunk[..n]);

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    match parsed.parse(&buf) {
      Ok(httparse::Status::Complete(offset)) => {
        let method = parsed.method.unwrap_or("").to_string();
        let target = parsed.path.unwrap_or("").to_string();
        let version = parsed.version.unwrap_or(1);
        let headers = parsed
          .headers
          .iter()
          .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
          .collect();
        let body_prefix = buf[offset..].to_vec();
        return Ok(Some(PeekedHead {
          stream,
          head_bytes: buf,
          method,
          target,
          version,
          headers,
          body_prefix,
        }));
      }
      Ok(httparse::Status::Partial) => {
        if buf.len() >= MAX_HEAD_SIZE {
          return Err((
            stream,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large"),
          ));
        }
      }
      Err(e) => {
        return Err((stream, std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())));
      }
    }
  }
}
