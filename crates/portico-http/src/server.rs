//! HTTPS serving over the passthrough listener
//!
//! The dispatcher owns the accept loop and feeds inspected connections
//! through the passthrough listener; this side owns decryption. Each
//! submitted connection gets its TLS handshake and HTTP serving in its own
//! task, so a slow handshake never stalls the queue.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use portico_cert::{CertResolver, ACME_TLS_ALPN_NAME};
use portico_edge::{EdgeConn, PassthroughListener};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info};

/// TLS configuration for the terminated side: certificates come from the
/// resolver's SNI callback, ALPN advertises `h2` and `acme-tls/1`.
pub fn tls_server_config(
    resolver: Arc<CertResolver>,
) -> Result<ServerConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), ACME_TLS_ALPN_NAME.to_vec()];
    Ok(config)
}

/// Serve the router over connections submitted by the dispatcher. Returns
/// once the passthrough listener is closed and drained.
pub async fn serve_https(
    mut listener: PassthroughListener<EdgeConn>,
    tls_config: Arc<ServerConfig>,
    router: Router,
) {
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                info!("HTTPS server stopping: {e}");
                return;
            }
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(conn).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer, "TLS handshake failed: {e}");
                    return;
                }
            };

            let service = TowerToHyperService::new(
                router.map_request(|req: Request<Incoming>| req.map(Body::new)),
            );
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(%peer, "HTTPS connection error: {e}");
            }
        });
    }
}
