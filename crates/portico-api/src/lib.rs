//! Administrative API
//!
//! CRUD over tunnels, users, and tokens, mounted under `/api` of the admin
//! host by the virtual-host router. Mutations require a bearer token,
//! supplied either as an `access_token` query parameter or an
//! `Authorization: Bearer` header. Provisioning a tunnel acquires its
//! certificate; deleting one releases the reservation.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use portico_cert::CertManager;
use portico_http_auth::extract_access_token;
use portico_registry::{TlsTermination, Tunnel, TunnelRegistry};
use portico_store::Store;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<Store>,
    pub registry: Arc<TunnelRegistry>,
    pub certs: Arc<CertManager>,
}

pub fn build_router(ctx: ApiContext) -> Router {
    Router::new()
        .route(
            "/tunnels",
            get(list_tunnels).post(create_tunnel).delete(delete_tunnel),
        )
        .route(
            "/users",
            get(list_users).post(create_user).delete(delete_user),
        )
        .route(
            "/tokens",
            get(list_tokens).post(create_token).delete(delete_token),
        )
        .with_state(ctx)
}

/// The caller behind a bearer token: owner name and admin flag.
struct Caller {
    user: String,
    is_admin: bool,
}

fn authenticate(
    ctx: &ApiContext,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Caller, Response> {
    let token = extract_access_token(
        params.get("access_token").map(String::as_str),
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    )
    .ok_or_else(|| (StatusCode::UNAUTHORIZED, "No token provided").into_response())?;

    let Some(token_data) = ctx.store.tokens().get(&token).cloned() else {
        return Err((StatusCode::FORBIDDEN, "Not authorized").into_response());
    };

    let is_admin = ctx
        .store
        .users()
        .get(&token_data.owner)
        .map(|user| user.is_admin)
        .unwrap_or(false);

    Ok(Caller {
        user: token_data.owner,
        is_admin,
    })
}

fn require_admin(caller: &Caller) -> Result<(), Response> {
    if caller.is_admin {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, "Not authorized").into_response())
    }
}

async fn list_tunnels(State(ctx): State<ApiContext>) -> Response {
    let tunnels: HashMap<String, Tunnel> = ctx
        .registry
        .list_tunnels()
        .into_iter()
        .map(|tunnel| (tunnel.fqdn.clone(), tunnel))
        .collect();
    Json(tunnels).into_response()
}

async fn create_tunnel(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let Some(domain) = params.get("domain").filter(|d| !d.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "Invalid domain parameter").into_response();
    };

    let tls_termination = match params.get("tls-termination").map(String::as_str) {
        None | Some("server") => TlsTermination::Server,
        Some("client") => TlsTermination::Client,
        Some("passthrough") => TlsTermination::Passthrough,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Invalid tls-termination: {other}"),
            )
                .into_response();
        }
    };

    let client_port = match params.get("client-port").map(|p| p.parse::<u16>()) {
        None => 443,
        Some(Ok(port)) => port,
        Some(Err(_)) => {
            return (StatusCode::BAD_REQUEST, "Invalid client-port parameter").into_response();
        }
    };

    let tunnel_port = match params.get("port").map(|p| p.parse::<u16>()) {
        Some(Ok(port)) => port,
        Some(Err(_)) => {
            return (StatusCode::BAD_REQUEST, "Invalid port parameter").into_response();
        }
        None => match allocate_loopback_port() {
            Ok(port) => port,
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        },
    };

    // Certificate first: a tunnel the proxy terminates must be servable the
    // moment it appears in the registry.
    if tls_termination == TlsTermination::Server {
        if let Err(e) = ctx.certs.manage(std::slice::from_ref(&domain)).await {
            debug!(domain, "certificate acquisition failed: {e}");
            return (
                StatusCode::BAD_REQUEST,
                "Failed to get cert. Ensure your domain is valid",
            )
                .into_response();
        }
    }

    let tunnel = Tunnel {
        fqdn: domain.clone(),
        tunnel_port,
        client_address: params
            .get("client-address")
            .cloned()
            .unwrap_or_else(|| domain.clone()),
        client_port,
        tls_termination,
        auth_username: params.get("username").cloned().unwrap_or_default(),
        auth_password: params.get("password").cloned().unwrap_or_default(),
        owner: caller.user,
    };

    if let Err(e) = ctx.registry.create(tunnel.clone()) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    info!(domain, port = tunnel.tunnel_port, "tunnel created");
    Json(tunnel).into_response()
}

async fn delete_tunnel(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let Some(domain) = params.get("domain").filter(|d| !d.is_empty()).cloned() else {
        return (StatusCode::BAD_REQUEST, "Invalid domain parameter").into_response();
    };

    if !caller.is_admin {
        match ctx.registry.get_tunnel(&domain) {
            Some(tunnel) if tunnel.owner == caller.user => {}
            Some(_) => return (StatusCode::FORBIDDEN, "Not authorized").into_response(),
            None => {}
        }
    }

    match ctx.registry.delete(&domain) {
        Ok(Some(tunnel)) => {
            ctx.certs.release(&tunnel.fqdn);
            info!(domain, "tunnel deleted");
            StatusCode::OK.into_response()
        }
        Ok(None) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete tunnel").into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_users(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = require_admin(&caller) {
        return response;
    }

    Json(ctx.store.users()).into_response()
}

async fn create_user(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = require_admin(&caller) {
        return response;
    }

    let Some(username) = params.get("username").filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Invalid username parameter").into_response();
    };
    let is_admin = matches!(
        params.get("is-admin").map(String::as_str),
        Some("true") | Some("1")
    );

    match ctx.store.add_user(username, is_admin) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn delete_user(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = require_admin(&caller) {
        return response;
    }

    let Some(username) = params.get("username").filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Invalid username parameter").into_response();
    };

    match ctx.store.delete_user(username) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_tokens(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };
    if let Err(response) = require_admin(&caller) {
        return response;
    }

    Json(ctx.store.tokens()).into_response()
}

async fn create_token(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let owner = params
        .get("owner")
        .cloned()
        .unwrap_or_else(|| caller.user.clone());
    if owner != caller.user && !caller.is_admin {
        return (StatusCode::FORBIDDEN, "Not authorized").into_response();
    }

    match ctx.store.add_token(&owner) {
        Ok(token) => token.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn delete_token(
    State(ctx): State<ApiContext>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&ctx, &params, &headers) {
        Ok(caller) => caller,
        Err(response) => return response,
    };

    let Some(token) = params.get("token").filter(|t| !t.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Invalid token parameter").into_response();
    };

    if !caller.is_admin {
        match ctx.store.tokens().get(token) {
            Some(data) if data.owner == caller.user => {}
            Some(_) => return (StatusCode::FORBIDDEN, "Not authorized").into_response(),
            None => {}
        }
    }

    match ctx.store.delete_token(token) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Pick a free loopback port for a new tunnel by binding port zero.
fn allocate_loopback_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
