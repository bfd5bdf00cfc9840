//! Certificate management with ACME support
//!
//! Acquires and renews certificates on demand for the hostnames the tunnel
//! registry advertises, answers rustls SNI callbacks, and serves both HTTP-01
//! and TLS-ALPN-01 challenges. Certificates are stored as PEM files on disk
//! so restarts do not re-provision.

pub mod acme;
pub mod manager;
pub mod resolver;
pub mod storage;

pub use acme::{AcmeClient, AcmeConfig};
pub use manager::CertManager;
pub use resolver::{CertResolver, ACME_TLS_ALPN_NAME};
pub use storage::CertificateStore;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("No supported challenge offered for {0}")]
    NoSupportedChallenge(String),

    #[error("No stored certificate for {0}")]
    NotFound(String),

    #[error("Certificate parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Certificate chain with its private key.
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}
