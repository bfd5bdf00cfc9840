//! Admin API tests driven through the router.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use portico_api::{build_router, ApiContext};
use portico_cert::{AcmeConfig, CertManager};
use portico_registry::{TlsTermination, Tunnel, TunnelRegistry};
use portico_store::Store;
use tower::ServiceExt;

struct Harness {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    ctx: ApiContext,
    router: Router,
    admin_token: String,
}

fn make_harness() -> Harness {
    let store_dir = tempfile::tempdir().unwrap();
    let cert_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(Store::open(store_dir.path().join("db.json")).unwrap());
    store.add_user("admin", true).unwrap();
    let admin_token = store.add_token("admin").unwrap();

    let registry = Arc::new(TunnelRegistry::load(store.clone()));
    let certs =
        Arc::new(CertManager::new(cert_dir.path(), AcmeConfig::default()).unwrap());

    let ctx = ApiContext {
        store,
        registry,
        certs,
    };
    let router = build_router(ctx.clone());

    Harness {
        _dirs: (store_dir, cert_dir),
        ctx,
        router,
        admin_token,
    }
}

/// Drop a self-signed PEM pair into the cert dir so `manage` never orders.
fn seed_certificate(harness: &Harness, domain: &str) {
    let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let dir = harness._dirs.1.path();
    std::fs::write(dir.join(format!("{domain}.crt")), cert.pem()).unwrap();
    std::fs::write(dir.join(format!("{domain}.key")), key_pair.serialize_pem()).unwrap();
}

async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn create_requires_token() {
    let harness = make_harness();
    let (status, body) = send(&harness.router, "POST", "/tunnels?domain=a.example").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "No token provided");
}

#[tokio::test]
async fn unknown_token_is_forbidden() {
    let harness = make_harness();
    let (status, body) = send(
        &harness.router,
        "POST",
        "/tunnels?domain=a.example&access_token=bogus",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Not authorized");
}

#[tokio::test]
async fn create_list_delete_tunnel() {
    let harness = make_harness();
    let token = &harness.admin_token;

    let (status, body) = send(
        &harness.router,
        "POST",
        &format!(
            "/tunnels?domain=a.example&port=9001&tls-termination=passthrough&access_token={token}"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let created: Tunnel = serde_json::from_str(&body).unwrap();
    assert_eq!(created.fqdn, "a.example");
    assert_eq!(created.tunnel_port, 9001);
    assert_eq!(created.tls_termination, TlsTermination::Passthrough);
    assert_eq!(created.owner, "admin");

    let (status, body) = send(&harness.router, "GET", "/tunnels").await;
    assert_eq!(status, StatusCode::OK);
    let listed: HashMap<String, Tunnel> = serde_json::from_str(&body).unwrap();
    assert!(listed.contains_key("a.example"));

    let (status, _) = send(
        &harness.router,
        "DELETE",
        &format!("/tunnels?domain=a.example&access_token={token}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.ctx.registry.get_tunnel("a.example").is_none());
}

#[tokio::test]
async fn missing_domain_is_invalid() {
    let harness = make_harness();
    let token = &harness.admin_token;
    let (status, body) = send(
        &harness.router,
        "POST",
        &format!("/tunnels?access_token={token}"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, "Invalid domain parameter");
}

#[tokio::test]
async fn port_is_allocated_when_absent() {
    let harness = make_harness();
    let token = &harness.admin_token;
    let (status, body) = send(
        &harness.router,
        "POST",
        &format!("/tunnels?domain=a.example&tls-termination=client&access_token={token}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let created: Tunnel = serde_json::from_str(&body).unwrap();
    assert_ne!(created.tunnel_port, 0);
}

#[tokio::test]
async fn duplicate_domain_is_rejected() {
    let harness = make_harness();
    let token = &harness.admin_token;
    let uri = format!(
        "/tunnels?domain=a.example&port=9001&tls-termination=passthrough&access_token={token}"
    );
    let (status, _) = send(&harness.router, "POST", &uri).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&harness.router, "POST", &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_missing_tunnel_fails() {
    let harness = make_harness();
    let token = &harness.admin_token;
    let (status, body) = send(
        &harness.router,
        "DELETE",
        &format!("/tunnels?domain=ghost.example&access_token={token}"),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Failed to delete tunnel");
}

#[tokio::test]
async fn server_terminated_tunnel_acquires_and_releases_certificate() {
    let harness = make_harness();
    seed_certificate(&harness, "b.example");
    let token = &harness.admin_token;

    let (status, _) = send(
        &harness.router,
        "POST",
        &format!("/tunnels?domain=b.example&port=9002&access_token={token}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.ctx.certs.get_certificate("b.example").is_some());

    let (status, _) = send(
        &harness.router,
        "DELETE",
        &format!("/tunnels?domain=b.example&access_token={token}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.ctx.certs.get_certificate("b.example").is_none());
}

#[tokio::test]
async fn non_admin_cannot_touch_others_tunnels() {
    let harness = make_harness();
    harness.ctx.store.add_user("alice", false).unwrap();
    let alice_token = harness.ctx.store.add_token("alice").unwrap();
    let admin_token = &harness.admin_token;

    let (status, _) = send(
        &harness.router,
        "POST",
        &format!(
            "/tunnels?domain=a.example&port=9001&tls-termination=passthrough&access_token={admin_token}"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &harness.router,
        "DELETE",
        &format!("/tunnels?domain=a.example&access_token={alice_token}"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Not authorized");
}

#[tokio::test]
async fn user_and_token_management_is_admin_only() {
    let harness = make_harness();
    harness.ctx.store.add_user("alice", false).unwrap();
    let alice_token = harness.ctx.store.add_token("alice").unwrap();
    let admin_token = &harness.admin_token;

    let (status, _) = send(
        &harness.router,
        "GET",
        &format!("/users?access_token={alice_token}"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &harness.router,
        "POST",
        &format!("/users?username=bob&access_token={admin_token}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.ctx.store.users().contains_key("bob"));

    // Alice can mint a token for herself but not for bob.
    let (status, minted) = send(
        &harness.router,
        "POST",
        &format!("/tokens?access_token={alice_token}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(harness.ctx.store.tokens().get(&minted).unwrap().owner, "alice");

    let (status, _) = send(
        &harness.router,
        "POST",
        &format!("/tokens?owner=bob&access_token={alice_token}"),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
