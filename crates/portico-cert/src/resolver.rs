//! SNI certificate resolver
//!
//! Answers rustls callbacks on the TLS accept path. Backed by lock-free maps
//! so resolution never contends with the dispatcher or the manager's renewal
//! task. When the ClientHello advertises the `acme-tls/1` protocol the
//! resolver serves the TLS-ALPN-01 challenge certificate instead of the real
//! leaf.

use std::sync::Arc;

use dashmap::DashMap;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::{CertError, Certificate};

/// ALPN protocol name for the TLS-ALPN-01 ACME challenge (RFC 8737).
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

#[derive(Debug, Default)]
pub struct CertResolver {
    certs: DashMap<String, Arc<CertifiedKey>>,
    challenge_certs: DashMap<String, Arc<CertifiedKey>>,
}

impl CertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, domain: &str, key: Arc<CertifiedKey>) {
        self.certs.insert(domain.to_string(), key);
    }

    pub fn remove(&self, domain: &str) {
        self.certs.remove(domain);
    }

    pub fn get(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.get(domain).map(|entry| entry.value().clone())
    }

    pub fn insert_challenge(&self, domain: &str, key: Arc<CertifiedKey>) {
        self.challenge_certs.insert(domain.to_string(), key);
    }

    pub fn remove_challenge(&self, domain: &str) {
        self.challenge_certs.remove(domain);
    }

    pub fn get_challenge(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.challenge_certs
            .get(domain)
            .map(|entry| entry.value().clone())
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?.to_string();

        let acme_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);
        if acme_challenge {
            return self.get_challenge(&server_name);
        }

        self.get(&server_name)
    }
}

/// Turn a parsed certificate into the form rustls serves from.
pub fn certified_key(cert: Certificate) -> Result<Arc<CertifiedKey>, CertError> {
    let signing_key = any_supported_type(&cert.private_key)
        .map_err(|e| CertError::Parse(format!("unsupported private key: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(cert.cert_chain, signing_key)))
}
