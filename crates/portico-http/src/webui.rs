//! Minimal web UI for the admin host
//!
//! Just enough surface for the flows the router depends on: a login endpoint
//! that turns an access token into a cookie, a tunnel listing at the root,
//! and the alert page the DNS failure callback redirects to. The full
//! management UI is an external collaborator.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};

use crate::HttpState;

pub(crate) async fn handle(state: &HttpState, req: Request) -> Response {
    match req.uri().path() {
        "/" => tunnel_index(state, &req),
        "/login" => login(state, &req),
        "/alert" => alert(&req),
        _ => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// `/login?access_token=..`: validate the token and move it into a cookie.
fn login(state: &HttpState, req: &Request) -> Response {
    let Some(token) = query_param(req, "access_token") else {
        return (StatusCode::UNAUTHORIZED, "No token provided").into_response();
    };
    if !state.store.tokens().contains_key(&token) {
        return (StatusCode::UNAUTHORIZED, "Not authorized").into_response();
    }

    let cookie = format!("access_token={token}; Secure; HttpOnly; Path=/");
    match HeaderValue::from_str(&cookie) {
        Ok(value) => Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(header::SET_COOKIE, value)
            .header(header::LOCATION, "/")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Root page: the caller's tunnels.
fn tunnel_index(state: &HttpState, req: &Request) -> Response {
    let Some(owner) = authenticated_user(state, req) else {
        return (
            StatusCode::UNAUTHORIZED,
            "Not authorized. Log in at /login?access_token=<token>",
        )
            .into_response();
    };

    let is_admin = state
        .store
        .users()
        .get(&owner)
        .map(|user| user.is_admin)
        .unwrap_or(false);

    let mut tunnels = state.registry.list_tunnels();
    tunnels.retain(|tunnel| is_admin || tunnel.owner == owner);
    tunnels.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));

    let mut rows = String::new();
    for tunnel in &tunnels {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:?}</td></tr>",
            escape_html(&tunnel.fqdn),
            tunnel.tunnel_port,
            tunnel.tls_termination,
        ));
    }

    Html(format!(
        "<!doctype html><html><head><title>portico</title></head><body>\
         <h1>Tunnels</h1>\
         <table><tr><th>Domain</th><th>Port</th><th>TLS</th></tr>{rows}</table>\
         </body></html>"
    ))
    .into_response()
}

/// `/alert?message=..`: target of the DNS failure redirect.
fn alert(req: &Request) -> Response {
    let message = query_param(req, "message").unwrap_or_default();
    Html(format!(
        "<!doctype html><html><head><title>portico</title></head><body>\
         <h1>Alert</h1><p>{}</p><a href=\"/\">Back</a></body></html>",
        escape_html(&message)
    ))
    .into_response()
}

/// Owner of the access token presented in the cookie or query string.
fn authenticated_user(state: &HttpState, req: &Request) -> Option<String> {
    let token = cookie_value(req, "access_token")
        .or_else(|| query_param(req, "access_token"))?;
    state.store.tokens().get(&token).map(|t| t.owner.clone())
}

fn query_param(req: &Request, name: &str) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn cookie_value(req: &Request, name: &str) -> Option<String> {
    let cookies = req.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (key, value) = cookie.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
