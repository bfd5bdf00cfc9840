//! Server startup and wiring
//!
//! Startup order matters: the public address is probed before any ACME
//! traffic, certificates before the listeners, and the edge dispatcher binds
//! the HTTPS port last. Startup errors are fatal; per-connection errors stay
//! inside their tasks.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use portico_api::ApiContext;
use portico_cert::{AcmeConfig, CertManager};
use portico_dns::NamedropClient;
use portico_edge::{check_public_address, EdgeDispatcher, PassthroughListener};
use portico_http::proxy::build_proxy_client;
use portico_http::{build_http_router, build_router, serve_https, tls_server_config, HttpState};
use portico_registry::TunnelRegistry;
use portico_store::Store;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use crate::bootstrap;
use crate::config::ServerArgs;

pub async fn run(args: ServerArgs) -> Result<()> {
    info!(
        http_port = args.http_port,
        https_port = args.https_port,
        ssh_server_port = args.ssh_server_port,
        "starting up"
    );

    let probe_client = NamedropClient::new(&args.dns_service_url, "");
    let public_ip = match &args.public_ip {
        Some(ip) => ip.clone(),
        None => probe_client
            .my_ip()
            .await
            .context("config_invalid: failed to discover the public IP")?,
    };
    info!(%public_ip, "advertised public address");

    // Prove the advertised address routes here before asking a CA to
    // validate anything on these ports.
    for port in [args.http_port, args.https_port] {
        check_public_address(&public_ip, port)
            .await
            .map_err(|e| anyhow!("public_unreachable: {e}"))?;
    }

    let store = Arc::new(
        Store::open(&args.db_path)
            .with_context(|| format!("config_invalid: failed to open store {}", args.db_path))?,
    );

    let certs = Arc::new(
        CertManager::new(
            &args.cert_dir,
            AcmeConfig {
                contact_email: args.acme_email.clone(),
                use_staging: args.acme_staging,
            },
        )
        .context("config_invalid: failed to initialise certificate storage")?,
    );

    if let Some(domain) = &args.admin_domain {
        store.set_admin_domain(domain)?;
    }

    let admin_domain = store.admin_domain();
    if admin_domain.is_empty() {
        bootstrap::set_admin_domain(&store, &certs, &probe_client, &public_ip).await?;
    } else {
        certs
            .manage(std::slice::from_ref(&admin_domain))
            .await
            .with_context(|| format!("cert_acquisition_failed for admin domain {admin_domain}"))?;
        info!(admin_domain, "acquired certificate for admin domain");
    }

    if store.users().is_empty() {
        store.add_user("admin", true)?;
        store
            .add_token("admin")
            .context("failed to initialize admin user")?;
        info!("created admin user");
    }

    if args.print_login {
        print_login_info(&store);
    }

    let registry = Arc::new(TunnelRegistry::load(store.clone()));

    // The registry may advertise hostnames whose certificates expired while
    // the process was down. Re-acquisition failures are logged, not fatal;
    // the renewal task retries.
    let server_terminated: Vec<String> = registry
        .list_tunnels()
        .into_iter()
        .filter(|tunnel| !tunnel.backend_terminates_tls())
        .map(|tunnel| tunnel.fqdn)
        .collect();
    if let Err(e) = certs.manage(&server_terminated).await {
        error!("certificate acquisition for tunnel domains failed: {e}");
    }
    certs.spawn_renewal();

    let admin_domain = store.admin_domain();
    let dns = Arc::new(NamedropClient::new(&args.dns_service_url, &admin_domain));

    let api = portico_api::build_router(ApiContext {
        store: store.clone(),
        registry: registry.clone(),
        certs: certs.clone(),
    });

    let state = HttpState {
        store,
        registry: registry.clone(),
        certs: certs.clone(),
        dns,
        http_client: build_proxy_client().context("failed to build upstream HTTP client")?,
        api,
        public_ip,
        https_port: args.https_port,
    };

    let http_listener = TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| {
            format!("config_invalid: failed to bind HTTP port {}", args.http_port)
        })?;
    let http_router = build_http_router(state.clone(), args.allow_http);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server error: {e}");
        }
    });

    let (passthrough, passthrough_handle) = PassthroughListener::new();
    let tls_config =
        Arc::new(tls_server_config(certs.resolver()).context("failed to build TLS config")?);
    let https_router = build_router(state);
    tokio::spawn(serve_https(passthrough, tls_config, https_router));

    let edge_listener = TcpListener::bind(("0.0.0.0", args.https_port))
        .await
        .with_context(|| {
            format!(
                "config_invalid: failed to bind HTTPS port {}",
                args.https_port
            )
        })?;
    let dispatcher = EdgeDispatcher::new(registry, passthrough_handle);

    info!("ready");

    tokio::select! {
        _ = dispatcher.run(edge_listener) => {}
        _ = signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}

fn print_login_info(store: &Store) {
    let admin_domain = store.admin_domain();
    for (token, data) in store.tokens() {
        if data.owner == "admin" {
            info!("admin token: {token}");
            info!("admin login link: https://{admin_domain}/login?access_token={token}");
            break;
        }
    }
}
