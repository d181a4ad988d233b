//! CONNECT tunnels.
//!
//! # Tunnel States
//! ```text
//! Dialing ──(dial ok)──▶ Hijacking ──(upgrade ok)──▶ Relaying ──(both directions done)──▶ Closed
//!    │                       │
//!    └──(dial failed: 503)───┴──(upgrade failed)──────────────────────────────────────▶ Closed
//! ```
//!
//! The origin is dialed before the client is answered, so a dial failure is
//! still reported with a status code. Requests the HTTP server cannot hand
//! over (hyper only arms the upgrade for an uppercase `CONNECT`) are refused
//! before dialing. After the `200` the inbound connection
//! is taken over from the HTTP server and never handed back.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinError;

use crate::error::{ProxyError, Result};
use crate::net::admission::AdmissionSlot;
use crate::net::connection::ConnectionId;
use crate::net::dns::ResolverSelector;
use crate::observability::metrics;
use crate::proxy::relay::{self, Direction, RelayOutcome};

/// Tunnel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Resolving and connecting to the origin.
    Dialing,
    /// Waiting for the server to release the raw client stream.
    Hijacking,
    /// Copying bytes in both directions.
    Relaying,
    /// Both connections are gone.
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-tunnel bookkeeping carried through the state machine.
#[derive(Debug)]
pub struct Tunnel {
    id: ConnectionId,
    target: String,
    state: TunnelState,
}

impl Tunnel {
    fn new(id: ConnectionId, target: String) -> Self {
        Self {
            id,
            target,
            state: TunnelState::Dialing,
        }
    }

    fn advance(&mut self, next: TunnelState) {
        tracing::trace!(
            connection_id = %self.id,
            dest = %self.target,
            from = %self.state,
            to = %next,
            "Tunnel state change"
        );
        self.state = next;
    }

    /// Relay until both directions have finished, then close both streams.
    ///
    /// Each direction runs in its own task. Both tasks are joined, so a
    /// direction that ends early (or faults) never leaks the other one.
    pub async fn relay<C>(mut self, client: C, origin: TcpStream) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.advance(TunnelState::Relaying);
        metrics::tunnel_opened();

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut origin_rd, mut origin_wr) = origin.into_split();

        let upstream = tokio::spawn(async move {
            relay::copy(&mut origin_wr, &mut client_rd, Direction::Upstream).await
        });
        let downstream = tokio::spawn(async move {
            relay::copy(&mut client_wr, &mut origin_rd, Direction::Downstream).await
        });

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let sent = self.settle(upstream, Direction::Upstream);
        let received = self.settle(downstream, Direction::Downstream);

        metrics::tunnel_closed(sent, received);
        self.advance(TunnelState::Closed);
        tracing::info!(
            connection_id = %self.id,
            dest = %self.target,
            sent,
            received,
            "Tunnel closed"
        );
        (sent, received)
    }

    fn settle(&self, joined: Result<RelayOutcome, JoinError>, direction: Direction) -> u64 {
        match joined {
            Ok(outcome) => {
                if let Some(e) = &outcome.fault {
                    tracing::debug!(
                        connection_id = %self.id,
                        dest = %self.target,
                        direction = %direction,
                        bytes = outcome.bytes,
                        error = %e,
                        "Relay direction closed with error"
                    );
                }
                outcome.bytes
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.id,
                    dest = %self.target,
                    direction = %direction,
                    error = %e,
                    "Relay task faulted"
                );
                0
            }
        }
    }
}

/// Handles CONNECT requests.
#[derive(Debug)]
pub struct TunnelEstablisher {
    selector: Arc<ResolverSelector>,
    connect_timeout: Duration,
}

impl TunnelEstablisher {
    pub fn new(selector: Arc<ResolverSelector>, connect_timeout: Duration) -> Self {
        Self {
            selector,
            connect_timeout,
        }
    }

    /// Resolve and connect to `host:port`, bounded by the connect timeout.
    ///
    /// Resolved addresses are tried in order.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        let target = format!("{host}:{port}");
        let attempt = async {
            let addrs = self.selector.resolve(host, port).await?;
            let mut last_error = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        return Ok(stream);
                    }
                    Err(e) => {
                        tracing::debug!(dest = %target, addr = %addr, error = %e, "Dial attempt failed");
                        last_error = Some(e);
                    }
                }
            }
            Err(ProxyError::Dial {
                target: target.clone(),
                source: last_error
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")),
            })
        };

        let outcome = tokio::time::timeout(self.connect_timeout, attempt).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ProxyError::DialTimeout {
                target,
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Answer a CONNECT request and, on success, spawn the tunnel.
    ///
    /// The admission slot moves into the tunnel task and is released when
    /// the tunnel reaches `Closed`.
    pub async fn establish<B>(
        &self,
        request: Request<B>,
        slot: AdmissionSlot,
        id: ConnectionId,
    ) -> Response<Body>
    where
        B: Send + 'static,
    {
        let Some(authority) = request.uri().authority().cloned() else {
            tracing::warn!(connection_id = %id, uri = %request.uri(), "CONNECT target is not host:port");
            return (StatusCode::BAD_REQUEST, "CONNECT must be to a host:port").into_response();
        };
        if request.extensions().get::<OnUpgrade>().is_none() {
            tracing::warn!(
                connection_id = %id,
                method = %request.method(),
                dest = %authority,
                "Connection cannot be taken over for tunneling"
            );
            return (StatusCode::BAD_REQUEST, "Tunnel requires an uppercase CONNECT").into_response();
        }
        let port = authority.port_u16().unwrap_or(443);
        let mut tunnel = Tunnel::new(id, authority.to_string());

        let origin = match self.dial(authority.host(), port).await {
            Ok(origin) => origin,
            Err(e) => {
                tracing::error!(connection_id = %id, dest = %authority, error = %e, "Dial failed");
                if e.is_dial_failure() {
                    metrics::record_dial_failure("tunnel");
                }
                tunnel.advance(TunnelState::Closed);
                return (StatusCode::SERVICE_UNAVAILABLE, "Origin unreachable").into_response();
            }
        };

        tunnel.advance(TunnelState::Hijacking);
        tokio::spawn(async move {
            let _slot = slot;
            match hyper::upgrade::on(request).await {
                Ok(upgraded) => {
                    tunnel.relay(TokioIo::new(upgraded), origin).await;
                }
                Err(e) => {
                    let e = ProxyError::Upgrade(e);
                    tracing::warn!(connection_id = %id, error = %e, "Hijack failed");
                    tunnel.advance(TunnelState::Closed);
                }
            }
        });

        Response::new(Body::empty())
    }
}
