//! HTTPS virtual-host router
//!
//! Receives fully terminated requests and dispatches them: the DNS
//! provisioning endpoints are path-routed regardless of host, the admin
//! domain owns the API and web UI, and every other hostname is looked up in
//! the tunnel registry and reverse-proxied.

use std::collections::HashMap;

use axum::extract::{Query, Request, State};
use axum::http::uri::PathAndQuery;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use portico_dns::Record;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{proxy, webui, HttpState};

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/dnsapi/requests", get(get_dns_request))
        .route("/namedrop/auth-success", get(namedrop_auth_success))
        .route("/dnsapi/failure", get(dns_request_failure))
        .fallback(dispatch_by_host)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The Host as the client sent it, port included. HTTP/2 requests carry it
/// in the URI authority instead of a header.
pub(crate) fn raw_host(req: &Request) -> String {
    if let Some(value) = req.headers().get(header::HOST) {
        if let Ok(host) = value.to_str() {
            return host.to_string();
        }
    }
    req.uri()
        .authority()
        .map(|authority| authority.to_string())
        .unwrap_or_default()
}

/// Hostname with any `:port` suffix removed. Splitting on the first `:`
/// mangles bracketed IPv6 literals; IPv6 host parsing is out of scope.
pub(crate) fn host_only(req: &Request) -> String {
    let host = raw_host(req);
    host.split(':').next().unwrap_or("").to_string()
}

fn internal_error(message: impl ToString) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
}

/// `GET /dnsapi/requests?request-id=..`: serialise a pending provisioning
/// request for the DNS service to inspect.
async fn get_dns_request(
    State(state): State<HttpState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request_id = params.get("request-id").cloned().unwrap_or_default();

    let Some(dns_request) = state.store.get_dns_request(&request_id) else {
        return internal_error(format!("No such DNS request: {request_id}"));
    };

    match serde_json::to_string(&dns_request) {
        Ok(json) => json.into_response(),
        Err(e) => internal_error(e),
    }
}

/// OAuth redirect target. Pairs the `state` parameter with the stored
/// provisioning request, exchanges the code, creates the requested A record,
/// and finishes either the admin-domain bootstrap or a tunnel domain setup.
async fn namedrop_auth_success(
    State(state): State<HttpState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request_id = params.get("state").cloned().unwrap_or_default();
    let code = params.get("code").cloned().unwrap_or_default();

    let Some(dns_request) = state.store.get_dns_request(&request_id) else {
        return internal_error(format!("No such DNS request: {request_id}"));
    };
    if let Err(e) = state.store.delete_dns_request(&request_id) {
        return internal_error(e);
    }

    let access_token = match state.dns.exchange_code(&code).await {
        Ok(token) => token,
        Err(e) => return internal_error(e),
    };

    let token_data = match state.dns.token_data(&access_token).await {
        Ok(data) => data,
        Err(e) => return internal_error(e),
    };
    let Some(scope) = token_data.scopes.first() else {
        return internal_error("No scopes returned");
    };

    let record = Record {
        domain: scope.domain.clone(),
        host: scope.host.clone(),
        record_type: "A".to_string(),
        value: state.public_ip.clone(),
        ttl: 300,
    };
    if let Err(e) = state.dns.create_record(&record, &access_token).await {
        return internal_error(e);
    }

    let fqdn = format!("{}.{}", scope.host, scope.domain);

    if dns_request.is_admin_domain {
        if let Err(e) = state.store.set_admin_domain(&fqdn) {
            return internal_error(e);
        }
        if let Err(e) = state.certs.manage(std::slice::from_ref(&fqdn)).await {
            return internal_error(e);
        }
        info!(admin_domain = %fqdn, "admin domain configured through DNS flow");
        Redirect::to(&format!("https://{fqdn}")).into_response()
    } else {
        let admin_domain = state.store.admin_domain();
        Redirect::to(&format!(
            "https://{admin_domain}/edit-tunnel?domain={fqdn}"
        ))
        .into_response()
    }
}

/// Failure callback from the DNS service: drop the request and bounce the
/// operator to the alert page.
async fn dns_request_failure(
    State(state): State<HttpState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let request_id = params.get("request-id").cloned().unwrap_or_default();

    if state.store.get_dns_request(&request_id).is_none() {
        return internal_error(format!("No such DNS request: {request_id}"));
    }
    if let Err(e) = state.store.delete_dns_request(&request_id) {
        return internal_error(e);
    }

    Redirect::to("/alert?message=Domain request failed").into_response()
}

/// Fallback for everything that is not a DNS provisioning path: dispatch by
/// the Host header.
async fn dispatch_by_host(State(state): State<HttpState>, req: Request) -> Response {
    let host = host_only(&req);
    debug!(%host, path = %req.uri().path(), "dispatching by host");

    let admin_domain = state.store.admin_domain();
    if !admin_domain.is_empty() && host == admin_domain {
        if req.uri().path().starts_with("/api/") {
            return forward_to_api(state, req).await;
        }
        return webui::handle(&state, req).await;
    }

    match state.registry.get_tunnel(&host) {
        None => internal_error(format!("No tunnel attached to {host}")),
        Some(tunnel) => proxy::proxy_request(req, &tunnel, &state.http_client).await,
    }
}

/// Hand the request to the API collaborator with the `/api` prefix stripped.
async fn forward_to_api(state: HttpState, mut req: Request) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let stripped = path_and_query
        .strip_prefix("/api")
        .unwrap_or(&path_and_query);
    let stripped = if stripped.is_empty() || stripped.starts_with('?') {
        format!("/{stripped}")
    } else {
        stripped.to_string()
    };

    let path_and_query = match stripped.parse::<PathAndQuery>() {
        Ok(pq) => pq,
        Err(e) => return internal_error(e),
    };
    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    match Uri::from_parts(parts) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => return internal_error(e),
    }

    match state.api.clone().oneshot(req).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}
