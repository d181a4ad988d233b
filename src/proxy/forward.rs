//! Plain HTTP forwarding.
//!
//! # Responsibilities
//! - Turn the proxied request into an absolute `http://` request
//! - Send it to the origin through the selecting resolver
//! - Bound the round trip with the request timeout
//! - Relay status, headers (repeated names and case included) and body
//!
//! # Design Decisions
//! - Dial and timeout failures become 503, not faults
//! - The admission slot rides inside the response body and is released
//!   when the body has been sent or dropped

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::uri::{PathAndQuery, Scheme};
use axum::http::{header, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::BoxError;
use http_body_util::BodyExt;
use hyper::body::Body as HttpBody;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::TimeoutConfig;
use crate::error::{ProxyError, Result};
use crate::net::admission::AdmissionSlot;
use crate::net::connection::ConnectionId;
use crate::net::dns::{ResolverSelector, SelectingResolver};
use crate::observability::metrics;

type OriginClient = Client<HttpConnector<SelectingResolver>, Body>;

/// Forwards non-CONNECT requests to their origin.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: OriginClient,
    request_timeout: Duration,
}

impl Forwarder {
    pub fn new(selector: Arc<ResolverSelector>, timeouts: &TimeoutConfig) -> Self {
        let mut connector = HttpConnector::new_with_resolver(SelectingResolver::new(selector));
        connector.set_connect_timeout(Some(timeouts.connect()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .build(connector);

        Self {
            client,
            request_timeout: timeouts.request(),
        }
    }

    /// Send `request` to its origin and relay the response.
    pub async fn forward<B>(
        &self,
        request: Request<B>,
        slot: AdmissionSlot,
        id: ConnectionId,
    ) -> Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let start = Instant::now();

        let request = match origin_request(request) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Rejecting request");
                metrics::record_request("forward", 400, start);
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        };
        let uri = request.uri().clone();

        let outcome = tokio::time::timeout(self.request_timeout, self.client.request(request)).await;
        let error = match outcome {
            Ok(Ok(response)) => {
                let status = response.status();
                tracing::debug!(connection_id = %id, uri = %uri, status = %status, "Origin responded");
                metrics::record_request("forward", status.as_u16(), start);

                return response.map(|body| {
                    Body::new(body.map_frame(move |frame| {
                        let _held = &slot;
                        frame
                    }))
                });
            }
            Ok(Err(e)) => ProxyError::Upstream(e),
            Err(_) => ProxyError::UpstreamTimeout(self.request_timeout),
        };

        tracing::error!(connection_id = %id, uri = %uri, error = %error, "Forwarding failed");
        if error.is_dial_failure() {
            metrics::record_dial_failure("forward");
        }
        metrics::record_request("forward", 503, start);
        (StatusCode::SERVICE_UNAVAILABLE, "Origin unavailable").into_response()
    }
}

/// Rewrite the request target into absolute `http://` form.
///
/// Proxy clients normally send absolute-form targets; origin-form targets
/// are completed from the `Host` header.
pub fn origin_request<B>(request: Request<B>) -> Result<Request<Body>>
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = request.into_parts();

    match parts.uri.scheme() {
        Some(scheme) if *scheme == Scheme::HTTP => {}
        Some(scheme) => {
            return Err(ProxyError::InvalidTarget(format!(
                "scheme `{scheme}` is not supported without CONNECT"
            )))
        }
        None => {
            let authority = match parts.uri.authority() {
                Some(authority) => authority.clone(),
                None => parts
                    .headers
                    .get(header::HOST)
                    .and_then(|host| host.to_str().ok())
                    .and_then(|host| host.parse().ok())
                    .ok_or_else(|| {
                        ProxyError::InvalidTarget(format!("`{}` names no host", parts.uri))
                    })?,
            };

            let mut uri = parts.uri.into_parts();
            uri.scheme = Some(Scheme::HTTP);
            uri.authority = Some(authority);
            if uri.path_and_query.is_none() {
                uri.path_and_query = Some(PathAndQuery::from_static("/"));
            }
            parts.uri = Uri::from_parts(uri)
                .map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;
        }
    }

    Ok(Request::from_parts(parts, Body::new(body)))
}
