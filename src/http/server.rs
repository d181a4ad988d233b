//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Accept client connections until shutdown is triggered
//! - Serve each connection with HTTP/1.1 (upgrades enabled for CONNECT)
//! - Wire up request tracing around the dispatcher
//! - Register every connection with the graceful watcher
//! - Hand over to the drain controller once accepting stops

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::lifecycle::{DrainController, ShutdownSignal};
use crate::net::admission::AdmissionController;
use crate::net::connection::ConnectionId;
use crate::proxy::Dispatcher;

/// HTTP server for the forward proxy.
pub struct HttpServer {
    config: Arc<ProxyConfig>,
    dispatcher: Arc<Dispatcher>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(&config)?);
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
        })
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Admission controller shared by every dispatch.
    pub fn admission(&self) -> &AdmissionController {
        self.dispatcher.admission()
    }

    /// Nameservers in use for outbound resolution.
    pub fn nameservers(&self) -> Vec<SocketAddr> {
        self.dispatcher.selector().addrs()
    }

    /// Run the server until `shutdown` fires, then drain.
    pub async fn run(self, listener: TcpListener, mut shutdown: ShutdownSignal) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .preserve_header_case(true)
            .title_case_headers(true)
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.timeouts.request());

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let id = ConnectionId::new();
                    tracing::debug!(connection_id = %id, peer_addr = %peer_addr, "Connection accepted");

                    let dispatcher = Arc::clone(&self.dispatcher);
                    let service = ServiceBuilder::new()
                        .layer(TraceLayer::new_for_http())
                        .service_fn(move |request: Request<Incoming>| {
                            let dispatcher = Arc::clone(&dispatcher);
                            async move { Ok::<_, Infallible>(dispatcher.serve(request, id).await) }
                        });
                    let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                        service.clone().oneshot(request)
                    });

                    let connection = builder
                        .serve_connection_with_upgrades(TokioIo::new(stream), service)
                        .into_owned();
                    let connection = graceful.watch(connection);

                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            tracing::debug!(connection_id = %id, error = %e, "Connection ended with error");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown triggered, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        DrainController::new(
            graceful,
            self.dispatcher.admission().clone(),
            self.config.timeouts.drain(),
        )
        .drain()
        .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
