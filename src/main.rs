//! Forward HTTP/HTTPS proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                    FORWARD PROXY                     │
//!                     │                                                      │
//!   Client request    │  ┌─────────┐    ┌────────────┐    ┌─────────────┐    │
//!   ──────────────────┼─▶│  http   │───▶│ dispatcher │─┬─▶│  forwarder  │────┼──▶ Origin (HTTP)
//!                     │  │ server  │    │ +admission │ │  └─────────────┘    │
//!                     │  └─────────┘    └────────────┘ │  ┌─────────────┐    │
//!                     │                                └─▶│   tunnel    │────┼──▶ Origin (CONNECT)
//!                     │                                   │  + relay    │    │
//!                     │                                   └─────────────┘    │
//!                     │   ┌──────────┐  ┌───────────┐  ┌──────────────────┐  │
//!                     │   │  config  │  │ dns       │  │ lifecycle        │  │
//!                     │   │          │  │ selector  │  │ signals + drain  │  │
//!                     │   └──────────┘  └───────────┘  └──────────────────┘  │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use forward_proxy::config::loader::{finalize, read_config};
use forward_proxy::config::ProxyConfig;
use forward_proxy::lifecycle::signals;
use forward_proxy::observability::{logging, metrics};
use forward_proxy::{HttpServer, ProxyError, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "forward-proxy", version)]
#[command(about = "Forward HTTP proxy with CONNECT tunneling", long_about = None)]
struct Cli {
    /// Listen address.
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Maximum concurrent in-flight requests and tunnels.
    #[arg(short = 'c', long = "concurrency")]
    max_concurrent: Option<usize>,

    /// DNS nameservers, e.g. "8.8.8.8:53" or "1.1.1.1:53,8.8.8.8:53".
    #[arg(short = 'n', long = "nameservers", value_delimiter = ',')]
    nameservers: Option<Vec<String>>,

    /// Forwarded request timeout, e.g. 1m or 10s.
    #[arg(short = 't', long = "timeout", value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Tunnel dial timeout.
    #[arg(long = "connect-timeout", value_parser = parse_duration)]
    connect_timeout: Option<Duration>,

    /// Drain deadline on shutdown.
    #[arg(long = "drain-timeout", value_parser = parse_duration)]
    drain_timeout: Option<Duration>,

    /// TOML configuration file; flags override its values.
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<ProxyConfig, ProxyError> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(addr) = self.addr {
            config.listener.bind_address = normalize_addr(&addr);
        }
        if let Some(n) = self.max_concurrent {
            config.listener.max_concurrent = n;
        }
        if let Some(nameservers) = self.nameservers {
            config.resolvers.nameservers = nameservers
                .into_iter()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect();
        }
        if let Some(timeout) = self.timeout {
            config.timeouts.request_ms = millis(timeout);
        }
        if let Some(timeout) = self.connect_timeout {
            config.timeouts.connect_ms = millis(timeout);
        }
        if let Some(timeout) = self.drain_timeout {
            config.timeouts.drain_ms = millis(timeout);
        }

        Ok(finalize(config)?)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Accept the `:port` shorthand for all interfaces.
fn normalize_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

/// Parse `250ms`, `10s`, `1m`, `2h`; a bare number means seconds.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (value, unit) = input.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("`{input}` is not a duration"))?;

    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => return Err(format!("unknown duration unit `{other}`")),
    };
    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("`{input}` is too large"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("forward-proxy: {e}");
            std::process::exit(2);
        }
    };

    logging::init(&config.observability.log_level);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Proxy stopped with error");
        std::process::exit(1);
    }
    tracing::info!("Shutdown complete");
}

async fn run(config: ProxyConfig) -> Result<(), ProxyError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "forward-proxy starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config)?;

    tracing::info!(
        address = %listener.local_addr()?,
        max_concurrent = server.admission().capacity(),
        nameservers = ?server.nameservers(),
        request_timeout = ?server.config().timeouts.request(),
        connect_timeout = ?server.config().timeouts.connect(),
        "Configuration loaded"
    );

    let shutdown = Shutdown::new();
    signals::spawn_handler(shutdown.clone());

    server.run(listener, shutdown.subscribe()).await
}
