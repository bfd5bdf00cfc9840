//! Virtual-host router and reverse-proxy tests against live loopback
//! backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use portico_cert::{AcmeConfig, CertManager};
use portico_dns::NamedropClient;
use portico_http::{build_http_router, build_router, HttpState};
use portico_registry::{TlsTermination, Tunnel, TunnelRegistry};
use portico_store::Store;
use tower::ServiceExt;

struct Harness {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    state: HttpState,
}

fn make_state(api: Router) -> Harness {
    make_state_with_dns(api, "http://127.0.0.1:9")
}

fn make_state_with_dns(api: Router, dns_url: &str) -> Harness {
    let store_dir = tempfile::tempdir().unwrap();
    let cert_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(Store::open(store_dir.path().join("db.json")).unwrap());
    let registry = Arc::new(TunnelRegistry::load(store.clone()));
    let certs =
        Arc::new(CertManager::new(cert_dir.path(), AcmeConfig::default()).unwrap());
    let dns = Arc::new(NamedropClient::new(dns_url, ""));

    let state = HttpState {
        store,
        registry,
        certs,
        dns,
        http_client: portico_http::proxy::build_proxy_client().unwrap(),
        api,
        public_ip: "1.2.3.4".to_string(),
        https_port: 443,
    };

    Harness {
        _dirs: (store_dir, cert_dir),
        state,
    }
}

fn tunnel(fqdn: &str, port: u16) -> Tunnel {
    Tunnel {
        fqdn: fqdn.to_string(),
        tunnel_port: port,
        client_address: fqdn.to_string(),
        client_port: 443,
        tls_termination: TlsTermination::Server,
        auth_username: String::new(),
        auth_password: String::new(),
        owner: "admin".to_string(),
    }
}

/// Loopback backend that reports the request headers it saw.
async fn spawn_echo_backend() -> u16 {
    async fn echo(headers: HeaderMap, req: Request) -> Json<HashMap<String, String>> {
        let mut seen = HashMap::new();
        seen.insert("path".to_string(), req.uri().path().to_string());
        for name in ["host", "x-forwarded-host"] {
            if let Some(value) = headers.get(name) {
                seen.insert(name.to_string(), value.to_str().unwrap().to_string());
            }
        }
        Json(seen)
    }

    let app = Router::new().fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    port
}

async fn body_json(response: axum::response::Response) -> HashMap<String, String> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn unknown_host_is_a_500_with_message() {
    let harness = make_state(Router::new());
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "z.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains("No tunnel attached to z.example"));
}

#[tokio::test]
async fn terminated_vhost_rewrites_host_headers() {
    let backend_port = spawn_echo_backend().await;

    let harness = make_state(Router::new());
    harness
        .state
        .registry
        .create(tunnel("b.example", backend_port))
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/x")
        .header(header::HOST, "b.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = body_json(response).await;
    assert_eq!(seen["path"], "/x");
    assert_eq!(seen["host"], "b.example:443");
    assert_eq!(seen["x-forwarded-host"], "b.example");
}

#[tokio::test]
async fn forwarded_host_keeps_client_port() {
    let backend_port = spawn_echo_backend().await;

    let harness = make_state(Router::new());
    harness
        .state
        .registry
        .create(tunnel("b.example", backend_port))
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/x")
        .header(header::HOST, "b.example:8443")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    let seen = body_json(response).await;
    assert_eq!(seen["x-forwarded-host"], "b.example:8443");
}

#[tokio::test]
async fn basic_auth_gate() {
    let backend_port = spawn_echo_backend().await;

    let harness = make_state(Router::new());
    let mut gated = tunnel("b.example", backend_port);
    gated.auth_username = "u".to_string();
    gated.auth_password = "p".to_string();
    harness.state.registry.create(gated).unwrap();
    let router = build_router(harness.state.clone());

    // Missing credentials: immediate 401 with the challenge header.
    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "b.example")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic"
    );

    // Correct credentials reach the backend.
    let good = base64::engine::general_purpose::STANDARD.encode("u:p");
    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "b.example")
        .header(header::AUTHORIZATION, format!("Basic {good}"))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Wrong credentials: 401 after the two-second brake.
    let bad = base64::engine::general_purpose::STANDARD.encode("u:wrong");
    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "b.example")
        .header(header::AUTHORIZATION, format!("Basic {bad}"))
        .body(Body::empty())
        .unwrap();
    let started = Instant::now();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(started.elapsed().as_millis() >= 2000);
}

#[tokio::test]
async fn backend_down_is_a_502() {
    // Nothing listens on the allocated port once the listener drops.
    let dead_port = {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let harness = make_state(Router::new());
    harness
        .state
        .registry
        .create(tunnel("b.example", dead_port))
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "b.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn admin_api_prefix_is_stripped() {
    async fn echo_path(req: Request) -> String {
        req.uri().path().to_string()
    }
    let api = Router::new().route("/x", get(echo_path));

    let harness = make_state(api);
    harness.state.store.set_admin_domain("admin.example").unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/api/x")
        .header(header::HOST, "admin.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "/x");
}

#[tokio::test]
async fn admin_host_serves_web_ui() {
    let harness = make_state(Router::new());
    harness.state.store.set_admin_domain("admin.example").unwrap();
    harness.state.store.add_user("admin", true).unwrap();
    let token = harness.state.store.add_token("admin").unwrap();
    let router = build_router(harness.state.clone());

    // Without a token the index refuses.
    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "admin.example")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // With the cookie it lists tunnels.
    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "admin.example")
        .header(header::COOKIE, format!("access_token={token}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn http_redirects_to_https_port() {
    let harness = make_state(Router::new());
    let router = build_http_router(harness.state.clone(), false);

    let req = Request::builder()
        .uri("/p?q=1")
        .header(header::HOST, "h")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://h:443/p?q=1"
    );
}

#[tokio::test]
async fn allow_http_serves_the_router() {
    let harness = make_state(Router::new());
    let router = build_http_router(harness.state.clone(), true);

    let req = Request::builder()
        .uri("/")
        .header(header::HOST, "z.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    // Routed, not redirected: the unknown-host 500 comes from the vhost
    // router.
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains("No tunnel attached to z.example"));
}

#[tokio::test]
async fn missing_dns_request_is_a_500() {
    let harness = make_state(Router::new());
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/dnsapi/requests?request-id=ghost")
        .header(header::HOST, "anything.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_string(response).await;
    assert!(body.contains("No such DNS request"));
}

#[tokio::test]
async fn pending_dns_request_serialises() {
    let harness = make_state(Router::new());
    harness
        .state
        .store
        .set_dns_request(
            "req1",
            portico_store::DnsRequest::new(
                true,
                vec![portico_store::DnsRecord {
                    record_type: "A".to_string(),
                    value: "1.2.3.4".to_string(),
                    ttl: 300,
                }],
            ),
        )
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/dnsapi/requests?request-id=req1")
        .header(header::HOST, "anything.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed["is_admin_domain"], true);
    assert_eq!(parsed["records"][0]["type"], "A");
}

#[tokio::test]
async fn dns_failure_deletes_and_redirects() {
    let harness = make_state(Router::new());
    harness
        .state
        .store
        .set_dns_request("req1", portico_store::DnsRequest::new(false, Vec::new()))
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/dnsapi/failure?request-id=req1")
        .header(header::HOST, "anything.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(harness.state.store.get_dns_request("req1").is_none());
}

/// Stub of the DNS provisioning service: token exchange, token data, and a
/// records endpoint that either accepts or refuses.
async fn spawn_namedrop_stub(records_ok: bool) -> u16 {
    use axum::routing::{post, put};

    let records_status = if records_ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };

    let app = Router::new()
        .route(
            "/namedrop/token",
            post(|| async { Json(serde_json::json!({"access_token": "stub-token"})) }),
        )
        .route(
            "/namedrop/token-data",
            get(|| async {
                Json(serde_json::json!({"scopes": [{"domain": "example", "host": "admin"}]}))
            }),
        )
        .route(
            "/namedrop/records",
            put(move || async move { (records_status, "") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    port
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

#[tokio::test]
async fn auth_success_completes_admin_bootstrap() {
    let stub_port = spawn_namedrop_stub(true).await;
    let harness = make_state_with_dns(
        Router::new(),
        &format!("http://127.0.0.1:{stub_port}"),
    );
    seed_certificate(&harness, "admin.example");
    harness
        .state
        .store
        .set_dns_request(
            "reqid",
            portico_store::DnsRequest::new(
                true,
                vec![portico_store::DnsRecord {
                    record_type: "A".to_string(),
                    value: "1.2.3.4".to_string(),
                    ttl: 300,
                }],
            ),
        )
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/namedrop/auth-success?state=reqid&code=authcode")
        .header(header::HOST, "boot.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://admin.example"
    );
    assert_eq!(harness.state.store.admin_domain(), "admin.example");
    assert!(harness
        .state
        .certs
        .get_certificate("admin.example")
        .is_some());
    assert!(harness.state.store.get_dns_request("reqid").is_none());
}

#[tokio::test]
async fn auth_success_for_tunnel_redirects_to_editor() {
    let stub_port = spawn_namedrop_stub(true).await;
    let harness = make_state_with_dns(
        Router::new(),
        &format!("http://127.0.0.1:{stub_port}"),
    );
    harness.state.store.set_admin_domain("portal.example").unwrap();
    harness
        .state
        .store
        .set_dns_request("reqid", portico_store::DnsRequest::new(false, Vec::new()))
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/namedrop/auth-success?state=reqid&code=authcode")
        .header(header::HOST, "boot.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "https://portal.example/edit-tunnel?domain=admin.example"
    );
    // The admin domain is untouched by a tunnel-domain flow.
    assert_eq!(harness.state.store.admin_domain(), "portal.example");
}

#[tokio::test]
async fn record_creation_failure_is_a_500() {
    let stub_port = spawn_namedrop_stub(false).await;
    let harness = make_state_with_dns(
        Router::new(),
        &format!("http://127.0.0.1:{stub_port}"),
    );
    harness
        .state
        .store
        .set_dns_request("reqid", portico_store::DnsRequest::new(true, Vec::new()))
        .unwrap();
    let router = build_router(harness.state.clone());

    let req = Request::builder()
        .uri("/namedrop/auth-success?state=reqid&code=authcode")
        .header(header::HOST, "boot.example")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "Invalid status code");
}

#[tokio::test]
async fn acme_challenge_miss_is_404_not_redirect() {
    let harness = make_state(Router::new());
    let router = build_http_router(harness.state.clone(), false);

    let req = Request::builder()
        .uri("/.well-known/acme-challenge/sometoken")
        .header(header::HOST, "h")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(req).await.unwrap();

    // The challenge handler answered (no pending challenge), not the
    // redirector.
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
