//! Request dispatcher — rate limit, select, proxy.
//!
//! DESIGN
//! ======
//! Every non-admin request flows through `dispatch`: identify the client,
//! consult the rate limiter, pick one alive backend, forward, stream the
//! response back. A single request sees at most one token deduction, one
//! selection, and one upstream attempt; there is no retry.
//!
//! ERROR HANDLING
//! ==============
//! An upstream failure before any response byte is written surfaces as a
//! structured 502 and marks the selected backend dead by index. A failure
//! mid-stream can only truncate the body (the status line is already on
//! the wire), so the backend is marked dead for subsequent selections and
//! the connection is cut.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::TryStreamExt;
use reqwest::Url;
use tracing::{debug, warn};

use crate::response::error_response;
use crate::state::AppState;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Connection-level headers that must not travel across the proxy hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("invalid upstream response: {0}")]
    Response(#[from] axum::http::Error),
}

/// The fallback handler: everything that is not the admin surface.
pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let client_id = state.limiter.client_id(req.headers(), remote);
    debug!(
        method = %req.method(),
        path = %req.uri().path(),
        remote = %remote,
        client_id,
        "request received"
    );

    if !state.limiter.allow(&client_id).await {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
    }

    let (index, target) = match state.pool.select() {
        Ok((index, backend)) => (index, backend.url().clone()),
        Err(e) => {
            warn!(error = %e, client_id, policy = state.pool.policy().as_str(), "dropping request");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "All backend servers are unavailable",
            );
        }
    };

    debug!(client_id, backend = index, target = %target, "proxying request");

    match forward(&state, index, &target, remote, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                error = %e,
                client_id,
                backend = %target,
                "proxy error; marking backend dead"
            );
            state.pool.mark_dead(index);
            error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
        }
    }
}

/// Forward one request to the selected backend, streaming both bodies.
async fn forward(
    state: &AppState,
    index: usize,
    target: &Url,
    remote: SocketAddr,
    req: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = req.into_parts();

    // The rewrite target is fixed per backend: only path and query come
    // from the inbound request.
    let mut url = target.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut outbound = state
        .http
        .request(parts.method, url)
        .headers(outbound_headers(&parts.headers, remote));
    if !body.is_end_stream() {
        outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = outbound.send().await?;

    let mut builder = Response::builder().status(upstream.status());
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                response_headers.append(name, value.clone());
            }
        }
    }

    // Failures after this point arrive through the body stream: the
    // response has started, so all that remains is to cut the connection
    // and exclude the backend from subsequent selections.
    let pool = Arc::clone(&state.pool);
    let body_stream = upstream.bytes_stream().inspect_err(move |e| {
        warn!(error = %e, backend = index, "upstream failed mid-response; marking backend dead");
        pool.mark_dead(index);
    });

    Ok(builder.body(Body::from_stream(body_stream))?)
}

/// Copy inbound headers for the upstream request. `Host` is rewritten to
/// the target authority (by the client, from the URL), the original host
/// moves to `X-Forwarded-Host`, and any inbound `X-Forwarded-For` is
/// replaced with the address this balancer actually observed.
fn outbound_headers(inbound: &HeaderMap, remote: SocketAddr) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str())
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == X_FORWARDED_FOR
        {
            continue;
        }
        headers.append(name, value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&remote.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
