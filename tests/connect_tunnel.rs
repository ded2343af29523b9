//! Drives the real client-facing listener over a loopback CONNECT request,
//! exercising the full accept -> route -> tunnel -> splice path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proxy_pool_gateway::config::{Config, ProxySource};
use proxy_pool_gateway::forward::ForwardClients;
use proxy_pool_gateway::logging::Logger;
use proxy_pool_gateway::pool::DynamicPool;
use proxy_pool_gateway::routing::HostRules;
use proxy_pool_gateway::server::{self, AppState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A loopback stand-in for an upstream proxy: accepts one connection,
/// replies to the CONNECT handshake with `200 Connection established`,
/// then echoes whatever bytes follow, byte for byte, until the peer closes.
async fn spawn_fake_upstream_proxy() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
      let n = sock.read(&mut chunk).await.unwrap();
      buf.extend_from_slice(&chunk[..n]);
      if buf.windows(4).any(|w| w == b"\r\n\r\n") {
        break;
      }
    }
    sock
      .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
      .await
      .unwrap();
    let mut echo_buf = [0u8; 1024];
    loop {
      match sock.read(&mut echo_buf).await {
        Ok(0) | Err(_) => break,
        Ok(n) => {
          if sock.write_all(&echo_buf[..n]).await.is_err() {
            break;
          }
        }
      }
    }
  });
  addr
}

async fn spawn_gateway(config: Config) -> SocketAddr {
  let pool = DynamicPool::new(&config);
  let rules = HostRules::new(&config.host);
  let clients = ForwardClients::new();
  let logger = Logger::stdout(false);
  let state = Arc::new(AppState { pool, rules, clients, logger });

  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let host = addr.ip().to_string();
  let port = addr.port();
  tokio::spawn(async move {
    let _ = server::run(&host, port, state).await;
  });
  tokio::time::sleep(Duration::from_millis(50)).await;
  addr
}

#[tokio::test]
async fn connect_request_is_tunneled_through_the_pooled_proxy_and_spliced_transparently() {
  let proxy_addr = spawn_fake_upstream_proxy().await;

  let mut config = Config::default();
  config.host.push(r"tunnel-target\.test".to_string());
  config.proxy_sources.push(ProxySource {
    name: "s1".to_string(),
    source_type: "fixed".to_string(),
    fetch_url: None,
    fixed_addr: vec![proxy_addr.to_string()],
    ttl: Duration::from_secs(60),
  });

  let gateway_addr = spawn_gateway(config).await;

  let mut client = TcpStream::connect(gateway_addr).await.unwrap();
  client
    .write_all(b"CONNECT tunnel-target.test:443 HTTP/1.1\r\nHost: tunnel-target.test:443\r\n\r\n")
    .await
    .unwrap();

  let mut response = [0u8; 1024];
  let n = client.read(&mut response).await.unwrap();
  let response_text = String::from_utf8_lossy(&response[..n]);
  assert_eq!(response_text, "HTTP/1.1 200 Connection established\r\n\r\n");

  client.write_all(b"ping-through-tunnel").await.unwrap();
  let mut echoed = [0u8; 1024];
  let n = client.read(&mut echoed).await.unwrap();
  assert_eq!(&echoed[..n], b"ping-through-tunnel");
}

#[tokio::test]
async fn connect_request_for_a_non_matching_host_dials_the_target_directly() {
  let direct_target = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let direct_addr = direct_target.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut sock, _) = direct_target.accept().await.unwrap();
    let mut chunk = [0u8; 64];
    let n = sock.read(&mut chunk).await.unwrap();
    sock.write_all(&chunk[..n]).await.unwrap();
  });

  // No host rule matches, so the routing decision never consults the pool.
  let config = Config::default();
  let gateway_addr = spawn_gateway(config).await;

  let mut client = TcpStream::connect(gateway_addr).await.unwrap();
  let target = direct_addr.to_string();
  client
    .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
    .await
    .unwrap();

  let mut response = [0u8; 1024];
  let n = client.read(&mut response).await.unwrap();
  assert_eq!(&response[..n], b"HTTP/1.1 200 Connection established\r\n\r\n");

  client.write_all(b"direct-echo").await.unwrap();
  let mut echoed = [0u8; 64];
  let n = client.read(&mut echoed).await.unwrap();
  assert_eq!(&echoed[..n], b"direct-echo");
}
