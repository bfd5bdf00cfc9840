//! HTTP reverse proxy
//!
//! Copies a terminated request to the tunnel's loopback port and streams the
//! response back. The upstream Host header is rewritten to the origin the
//! backend believes it is serving; the original Host travels in
//! X-Forwarded-Host. Redirects from the backend pass through untouched.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use portico_http_auth::BasicCredentials;
use portico_registry::Tunnel;
use tracing::debug;

use crate::router::raw_host;

/// Delay imposed on a failed credential guess.
const AUTH_FAILURE_DELAY: Duration = Duration::from_secs(2);

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Upstream client shared across all proxied requests. Redirects stay
/// disabled so the backend's 3xx responses reach the client verbatim.
pub fn build_proxy_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

pub async fn proxy_request(
    req: Request,
    tunnel: &Tunnel,
    client: &reqwest::Client,
) -> Response {
    if tunnel.requires_auth() {
        let credentials = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(BasicCredentials::from_header);

        match credentials {
            None => return unauthorized(),
            Some(creds) if !creds.matches(&tunnel.auth_username, &tunnel.auth_password) => {
                debug!(fqdn = %tunnel.fqdn, "rejected Basic credentials");
                tokio::time::sleep(AUTH_FAILURE_DELAY).await;
                return unauthorized();
            }
            Some(_) => {}
        }
    }

    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let upstream_url = format!("http://127.0.0.1:{}{}", tunnel.tunnel_port, request_uri);

    let original_host = raw_host(&req);
    let upstream_host = format!("{}:{}", tunnel.client_address, tunnel.client_port);

    let mut headers = req.headers().clone();
    // Length framing is recomputed for the streamed body.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::HOST);
    match HeaderValue::from_str(&upstream_host) {
        Ok(value) => headers.insert(header::HOST, value),
        Err(e) => return internal_error(e),
    };
    match HeaderValue::from_str(&original_host) {
        Ok(value) => headers.insert(X_FORWARDED_HOST, value),
        Err(e) => return internal_error(e),
    };

    let method = req.method().clone();
    let body = reqwest::Body::wrap_stream(req.into_body().into_data_stream());

    let upstream_res = match client
        .request(method, &upstream_url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %upstream_url, "backend request failed: {e}");
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let mut response = Response::builder().status(upstream_res.status());
    for (name, value) in upstream_res.headers() {
        // reqwest already de-chunked the body; hyper re-frames it.
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        response = response.header(name, value);
    }

    match response.body(Body::from_stream(upstream_res.bytes_stream())) {
        Ok(response) => response,
        Err(e) => internal_error(e),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic")],
        "",
    )
        .into_response()
}

fn internal_error(message: impl ToString) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
}
