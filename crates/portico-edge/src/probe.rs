//! Public-reachability probe
//!
//! Certificates must not be requested for an address that routes somewhere
//! else, so before touching ACME the proxy proves the advertised public IP
//! and port land on this process: bind the port, serve a random code to
//! every connection, dial the public address, and check the code comes back.
//! Catches NAT misconfiguration and DNS drift before the CA does.

use std::io;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_CODE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to bind probe listener on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("probe of {addr} timed out")]
    Timeout { addr: String },

    #[error("probe response from {addr} did not match the generated code")]
    MismatchedCode { addr: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Verify that dialing `host:port` reaches this process.
pub async fn check_public_address(host: &str, port: u16) -> Result<(), ProbeError> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| ProbeError::Bind { port, source })?;
    let local_port = listener.local_addr()?.port();

    let code: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PROBE_CODE_LEN)
        .map(char::from)
        .collect();

    let served = code.clone();
    let acceptor = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut conn, _)) => {
                    let _ = conn.write_all(served.as_bytes()).await;
                    // Dropping the socket sends the FIN the dialer waits for.
                }
                Err(_) => break,
            }
        }
    });

    let addr = format!("{host}:{local_port}");
    let result = dial_and_verify(&addr, &code).await;
    acceptor.abort();
    result
}

async fn dial_and_verify(addr: &str, expected: &str) -> Result<(), ProbeError> {
    debug!(addr, "probing public address");

    let mut conn = timeout(PROBE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::Timeout {
            addr: addr.to_string(),
        })??;

    let mut response = Vec::new();
    timeout(PROBE_TIMEOUT, conn.read_to_end(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout {
            addr: addr.to_string(),
        })??;

    if response != expected.as_bytes() {
        return Err(ProbeError::MismatchedCode {
            addr: addr.to_string(),
        });
    }
    Ok(())
}
