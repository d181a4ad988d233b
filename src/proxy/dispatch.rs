//! Per-request entry point.
//!
//! Every request takes an admission slot, then goes to the tunnel
//! establisher (CONNECT) or the forwarder (everything else). The slot is
//! released when that path is done with it, including when it faults.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::BoxError;
use futures_util::FutureExt;
use hyper::body::Body as HttpBody;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::net::admission::AdmissionController;
use crate::net::connection::ConnectionId;
use crate::net::dns::ResolverSelector;
use crate::proxy::forward::Forwarder;
use crate::proxy::tunnel::TunnelEstablisher;

/// Case-insensitive CONNECT check.
pub fn is_connect(method: &Method) -> bool {
    method.as_str().eq_ignore_ascii_case(Method::CONNECT.as_str())
}

/// Destination named by a request, for logging.
fn destination<B>(request: &Request<B>) -> String {
    if let Some(authority) = request.uri().authority() {
        return authority.to_string();
    }
    request
        .headers()
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return *message;
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.as_str();
    }
    "non-string panic payload"
}

/// Routes admitted requests to the forwarder or the tunnel establisher.
#[derive(Debug)]
pub struct Dispatcher {
    admission: AdmissionController,
    selector: Arc<ResolverSelector>,
    forwarder: Forwarder,
    tunnels: TunnelEstablisher,
}

impl Dispatcher {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let selector = Arc::new(ResolverSelector::from_config(&config.resolvers.nameservers)?);
        Ok(Self {
            admission: AdmissionController::new(config.listener.max_concurrent),
            forwarder: Forwarder::new(Arc::clone(&selector), &config.timeouts),
            tunnels: TunnelEstablisher::new(Arc::clone(&selector), config.timeouts.connect()),
            selector,
        })
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn selector(&self) -> &ResolverSelector {
        &self.selector
    }

    /// Admit and route one request.
    pub async fn dispatch<B>(&self, request: Request<B>, id: ConnectionId) -> Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let slot = match self.admission.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!(connection_id = %id, error = %e, "Admission failed");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        };

        tracing::info!(
            connection_id = %id,
            method = %request.method(),
            host = %destination(&request),
            "Dispatching request"
        );

        if is_connect(request.method()) {
            self.tunnels.establish(request, slot, id).await
        } else {
            self.forwarder.forward(request, slot, id).await
        }
    }

    /// Run [`dispatch`](Self::dispatch), turning a panic into a 500.
    ///
    /// The dispatch runs inside this future, so it is cancelled together
    /// with it when the client goes away, even while still waiting for
    /// admission. A panic releases the slot by unwinding and the client gets
    /// a 500 with the connection marked for close.
    pub async fn serve<B>(self: Arc<Self>, request: Request<B>, id: ConnectionId) -> Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match AssertUnwindSafe(self.dispatch(request, id)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                tracing::error!(
                    connection_id = %id,
                    panic = panic_message(payload.as_ref()),
                    "Dispatch faulted"
                );
                let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn dispatcher(capacity: usize) -> Arc<Dispatcher> {
        let mut config = ProxyConfig::default();
        config.listener.max_concurrent = capacity;
        config.timeouts.connect_ms = 500;
        config.timeouts.request_ms = 500;
        Arc::new(Dispatcher::new(&config).unwrap())
    }

    #[test]
    fn connect_matches_any_case() {
        assert!(is_connect(&Method::CONNECT));
        assert!(is_connect(&Method::from_bytes(b"connect").unwrap()));
        assert!(is_connect(&Method::from_bytes(b"CoNnEcT").unwrap()));
        assert!(!is_connect(&Method::GET));
        assert!(!is_connect(&Method::from_bytes(b"CONNECTX").unwrap()));
    }

    #[test]
    fn destination_prefers_authority() {
        let absolute = Request::get("http://a.example:81/x")
            .header("host", "b.example")
            .body(())
            .unwrap();
        assert_eq!(destination(&absolute), "a.example:81");

        let origin_form = Request::get("/x").header("host", "b.example").body(()).unwrap();
        assert_eq!(destination(&origin_form), "b.example");
    }

    #[tokio::test]
    async fn slot_released_after_failed_forward() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dispatcher = dispatcher(1);
        let request = Request::get(format!("http://127.0.0.1:{port}/"))
            .body(Body::empty())
            .unwrap();

        let response = Arc::clone(&dispatcher)
            .serve(request, ConnectionId::new())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(dispatcher.admission().in_flight(), 0);
    }

    #[tokio::test]
    async fn bad_connect_target_releases_slot() {
        let dispatcher = dispatcher(1);
        let request = Request::builder()
            .method("connect")
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let response = tokio::time::timeout(
            Duration::from_secs(2),
            Arc::clone(&dispatcher).serve(request, ConnectionId::new()),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(dispatcher.admission().in_flight(), 0);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(literal.as_ref()), "boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("boom {}", 2));
        assert_eq!(panic_message(formatted.as_ref()), "boom 2");
    }

    #[tokio::test]
    async fn abandoned_request_never_reaches_origin() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                        .await;
                }
            });
        }

        let dispatcher = dispatcher(1);
        let held = dispatcher.admission().acquire().await.unwrap();

        let request = Request::get(format!("http://{origin}/side-effect"))
            .body(Body::empty())
            .unwrap();
        let waited = tokio::time::timeout(
            Duration::from_millis(200),
            Arc::clone(&dispatcher).serve(request, ConnectionId::new()),
        )
        .await;
        assert!(waited.is_err(), "request should still be waiting for admission");

        drop(held);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.admission().in_flight(), 0);
    }
}
