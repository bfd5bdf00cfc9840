//! HTTP-layer serving
//!
//! The terminated side of the proxy: the virtual-host router dispatching by
//! Host header, the reverse proxy to loopback tunnel ports, the port-80
//! redirector, the TLS server loop fed by the passthrough listener, and a
//! minimal web UI for the admin host.

pub mod proxy;
pub mod redirect;
pub mod router;
pub mod server;
pub mod webui;

use std::sync::Arc;

use axum::Router;
use portico_cert::CertManager;
use portico_dns::NamedropClient;
use portico_registry::TunnelRegistry;
use portico_store::Store;

pub use redirect::build_http_router;
pub use router::build_router;
pub use server::{serve_https, tls_server_config};

/// State shared by every HTTP surface. Configured once at startup and passed
/// explicitly; nothing here is a process global.
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<Store>,
    pub registry: Arc<TunnelRegistry>,
    pub certs: Arc<CertManager>,
    pub dns: Arc<NamedropClient>,
    /// Shared upstream client; never follows redirects so 3xx responses pass
    /// through verbatim.
    pub http_client: reqwest::Client,
    /// The administrative API, mounted under `/api` of the admin host.
    pub api: Router,
    pub public_ip: String,
    pub https_port: u16,
}
