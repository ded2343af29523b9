use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;

use crate::logging::Logger;
use crate::pool::DynamicPool;
use crate::routing::HostRules;
use crate::tls::insecure_client_config;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds and caches the two clients the forward engine needs: a plain-HTTP
/// client (used both for no-proxy requests and to speak to the upstream
/// proxy itself, since the proxy connection is plain HTTP even for an
/// `https://` target) and a TLS config that skips certificate validation,
/// used to build a one-off client for direct `https://` origin requests.
#[derive(Clone)]
pub struct ForwardClients {
  plain: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
  insecure_tls_config: Arc<ClientConfig>,
}

impl ForwardClients {
  pub fn new() -> Self {
    let plain = Client::builder(TokioExecutor::new()).build::<_, BoxBody<Bytes, hyper::Error>>(HttpConnector::new());
    Self {
      plain,
      insecure_tls_config: insecure_client_config(),
    }
  }
}

impl Default for ForwardClients {
  fn default() -> Self {
    Self::new()
  }
}

struct CapturedRequest {
  method: Method,
  uri: Uri,
  version: Version,
  headers: hyper::HeaderMap,
  body: Bytes,
}

impl CapturedRequest {
  fn to_request(&self, target: &Uri) -> Request<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Request::builder().method(self.method.clone()).uri(target.clone()).version(self.version);
    *builder.headers_mut().unwrap() = self.headers.clone();
    builder
      .body(Full::new(self.body.clone()).map_err(|never| match never {}).boxed())
      .expect("request built from captured parts is always valid")
  }
}

/// Handles a non-CONNECT request: decide proxy vs. direct, dispatch, fall
/// back on failure, and copy the upstream response back verbatim.
pub async fn handle_forward(
  req: Request<Incoming>,
  host: &str,
  pool: &DynamicPool,
  rules: &HostRules,
  clients: &ForwardClients,
  logger: &Logger,
  trace_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
  let (parts, body) = req.into_parts();
  let body_bytes = match body.collect().await {
    Ok(collected) => collected.to_bytes(),
    Err(e) => {
      return error_response(StatusCode::BAD_REQUEST, &format!("failed to read request body: {e}"));
    }
  };

  let captured = CapturedRequest {
    method: parts.method,
    uri: parts.uri.clone(),
    version: parts.version,
    headers: parts.headers,
    body: body_bytes,
  };

  let proxy_url = if rules.needs_proxy(host) {
    match pool.get_address().await {
      Ok(addr) => Uri::try_from(format!("http://{addr}")).ok(),
      Err(err) => {
        logger.warn(
          "no upstream available for forward request, falling back to direct",
          &[("host", host), ("trace_id", trace_id), ("reason", &err.to_string())],
        );
        None
      }
    }
  } else {
    None
  };

  if let Some(proxy_uri) = &proxy_url {
    let request = captured.to_request(&parts.uri);
    match dispatch_via_proxy(proxy_uri, request).await {
      Ok(response) => return copy_response(response).await,
      Err(reason) => {
        logger.warn(
          "forward via proxy failed, retrying direct",
          &[("host", host), ("trace_id", trace_id), ("reason", &reason)],
        );
      }
    }
  }

  let direct_request = captured.to_request(&parts.uri);
  match dispatch_direct(direct_request, clients).await {
    Ok(response) => copy_response(response).await,
    Err(reason) => {
      logger.error(
        "direct forward failed",
        &[("host", host), ("trace_id", trace_id), ("reason", &reason)],
      );
      error_response(StatusCode::INTERNAL_SERVER_ERROR, &reason)
    }
  }
}

/// Dials the upstream proxy's own address directly and speaks HTTP/1.1 to
/// it over that connection, sending `request` with its original
/// absolute-form URI untouched — the proxy is selected by *which TCP
/// address we dial*, not by rewriting the request's destination. Using the
/// pooled `hyper_util` client here would require overwriting the URI,
/// since that client's connector routes by URI host.
async fn dispatch_via_proxy(
  proxy_uri: &Uri,
  request: Request<BoxBody<Bytes, hyper::Error>>,
) -> Result<Response<Incoming>, String> {
  let authority = proxy_uri
    .authority()
    .ok_or_else(|| "upstream proxy address has no authority".to_string())?
    .clone();

  let stream = tokio::time::timeout(FORWARD_TIMEOUT, TcpStream::connect(authority.as_str()))
    .await
    .map_err(|_| format!("connect to upstream proxy {authority} timed out"))?
    .map_err(|e| format!("failed to connect to upstream proxy {authority}: {e}"))?;

  let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
    .await
    .map_err(|e| format!("handshake with upstream proxy {authority} failed: {e}"))?;

  tokio::spawn(async move {
    let _ = conn.await;
  });

  tokio::time::timeout(FORWARD_TIMEOUT, sender.send_request(request))
    .await
    .map_err(|_| "request to upstream proxy timed out".to_string())?
    .map_err(|e| e.to_string())
}

async fn dispatch_direct(
  request: Request<BoxBody<Bytes, hyper::Error>>,
  clients: &ForwardClients,
) -> Result<Response<Incoming>, String> {
  let scheme = request.uri().scheme_str().unwrap_or("http");
  if scheme == "https" {
    dispatch_direct_tls(request, clients).await
  } else {
    tokio::time::timeout(FORWARD_TIMEOUT, clients.plain.request(request))
      .await
      .map_err(|_| "direct request timed out".to_string())?
      .map_err(|e| e.to_string())
  }
}

async fn dispatch_direct_tls(
  request: Request<BoxBody<Bytes, hyper::Error>>,
  clients: &ForwardClients,
) -> Result<Response<Incoming>, String> {
  let https = hyper_rustls::HttpsConnectorBuilder::new()
    .with_tls_config((*clients.insecure_tls_config).clone())
    .https_or_http()
    .enable_http1()
    .build();
  let client = Client::builder(TokioExecutor::new()).build::<_, BoxBody<Bytes, hyper::Error>>(https);

  tokio::time::timeout(FORWARD_TIMEOUT, client.request(request))
    .await
    .map_err(|_| "direct TLS request timed out".to_string())?
    .map_err(|e| e.to_string())
}

async fn copy_response(response: Response<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
  let (parts, body) = response.into_parts();
  Response::from_parts(parts, body.boxed())
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
  let body = Full::new(Bytes::from(message.to_string())).map_err(|never| match never {}).boxed();
  Response::builder()
    .status(status)
    .header("Content-Type", "text/plain")
    .body(body)
    .unwrap_or_else(|_| Response::new(BoxBody::default()))
}
