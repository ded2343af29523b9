use std::sync::Arc;

use clap::Parser;

use proxy_pool_gateway::cli::{self, CliArgs};
use proxy_pool_gateway::server::AppState;
use proxy_pool_gateway::{config, forward, logging, pool, routing, server};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
  let args = CliArgs::parse();

  if args.version {
    println!("proxy-pool-gateway {}", cli::VERSION);
    return;
  }

  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(rt) => rt,
    Err(e) => {
      eprintln!("FATAL ERROR: failed to start async runtime: {e}");
      std::process::exit(1);
    }
  };

  if let Err(err) = runtime.block_on(run(args)) {
    eprintln!("FATAL ERROR: {err:#}");
    std::process::exit(1);
  }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
  if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
    anyhow::bail!("a rustls crypto provider was already installed for this process");
  }

  let config = config::load_config(&args.config)?;

  let logger = if args.log {
    logging::Logger::to_file(&args.log_dir, args.debug_enabled()).await?
  } else {
    logging::Logger::stdout(args.debug_enabled())
  };

  logger.info(
    "starting",
    &[("host", &args.host), ("port", &args.port.to_string()), ("config", &args.config.display().to_string())],
  );

  let pool = pool::DynamicPool::new(&config);
  let rules = routing::HostRules::new(&config.host);
  let clients = forward::ForwardClients::new();

  let state = Arc::new(AppState { pool, rules, clients, logger });

  server::run(&args.host, args.port, state).await
}
