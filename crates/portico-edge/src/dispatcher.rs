//! Edge connection dispatcher
//!
//! The single accept loop on the HTTPS port. Each connection is classified
//! by SNI: tunnels whose backend terminates TLS get a raw bidirectional
//! splice to their loopback port; everything else, including connections
//! without an SNI, is submitted to the passthrough listener for local TLS
//! termination. A connection matching a passthrough tunnel is never
//! decrypted here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use portico_registry::TunnelRegistry;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::listener::PassthroughHandle;
use crate::peek::{peek_client_hello, PeekError, ReplayedStream};

/// What the dispatcher hands to the passthrough listener.
pub type EdgeConn = (ReplayedStream<TcpStream>, SocketAddr);

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("{0}")]
    Peek(#[from] PeekError),

    #[error("failed to reach backend on 127.0.0.1:{port}: {source}")]
    BackendUnreachable { port: u16, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub struct EdgeDispatcher {
    registry: Arc<TunnelRegistry>,
    passthrough: PassthroughHandle<EdgeConn>,
}

impl EdgeDispatcher {
    pub fn new(registry: Arc<TunnelRegistry>, passthrough: PassthroughHandle<EdgeConn>) -> Self {
        Self {
            registry,
            passthrough,
        }
    }

    /// Accept loop. Per-connection failures are logged and never tear the
    /// loop down.
    pub async fn run(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let registry = self.registry.clone();
                    let passthrough = self.passthrough.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(socket, peer, &registry, &passthrough).await
                        {
                            debug!(%peer, "edge connection failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("HTTPS listener accept error: {e}");
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    registry: &TunnelRegistry,
    passthrough: &PassthroughHandle<EdgeConn>,
) -> Result<(), EdgeError> {
    let (hello, client) = peek_client_hello(socket).await?;
    debug!(%peer, server_name = %hello.server_name, "inspected ClientHello");

    match registry.get_tunnel(&hello.server_name) {
        Some(tunnel) if tunnel.backend_terminates_tls() => {
            splice_to_backend(client, tunnel.tunnel_port, peer).await
        }
        _ => {
            // No tunnel, a server-terminated one, or no SNI at all: let the
            // in-process HTTPS server take it from byte zero.
            passthrough.submit((client, peer))?;
            Ok(())
        }
    }
}

/// Raw splice between the replayed client stream and the tunnel's loopback
/// port. Each side's EOF half-closes the other side's write end; the task
/// finishes when both directions are drained.
async fn splice_to_backend(
    mut client: ReplayedStream<TcpStream>,
    port: u16,
    peer: SocketAddr,
) -> Result<(), EdgeError> {
    let mut upstream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|source| EdgeError::BackendUnreachable { port, source })?;

    let (to_backend, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(%peer, port, to_backend, to_client, "passthrough connection drained");
    Ok(())
}
