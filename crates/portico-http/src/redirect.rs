//! Port-80 server
//!
//! Serves ACME HTTP-01 challenges unconditionally, then either routes plain
//! HTTP through the same virtual-host router as the HTTPS side or answers
//! every request with a 301 to the HTTPS port.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::debug;

use crate::router::{build_router, raw_host};
use crate::HttpState;

pub fn build_http_router(state: HttpState, allow_http: bool) -> Router {
    // The challenge route is interposed before the redirect: HTTP-01
    // validation must get a 200 even when plain HTTP is disabled.
    let challenges = Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(serve_acme_challenge),
        )
        .with_state(state.clone());

    let inner = if allow_http {
        build_router(state)
    } else {
        Router::new()
            .fallback(redirect_to_https)
            .with_state(state)
    };

    challenges.merge(inner)
}

async fn serve_acme_challenge(
    State(state): State<HttpState>,
    Path(token): Path<String>,
) -> Response {
    match state.certs.http01_response(&token).await {
        Some(key_authorization) => {
            debug!(token, "answering HTTP-01 challenge");
            key_authorization.into_response()
        }
        None => (StatusCode::NOT_FOUND, "no pending challenge").into_response(),
    }
}

async fn redirect_to_https(State(state): State<HttpState>, req: Request) -> Response {
    let host = raw_host(&req);
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{}:{}{}", host, state.https_port, request_uri);

    match HeaderValue::from_str(&location) {
        Ok(value) => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, value)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
