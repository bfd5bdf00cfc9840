//! On-disk certificate storage
//!
//! One `<domain>.crt` / `<domain>.key` PEM pair per hostname under the
//! configured cert directory, plus `account.json` holding the ACME account
//! credentials.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;

use crate::{CertError, Certificate};

#[derive(Debug, Clone)]
pub struct CertificateStore {
    cert_dir: PathBuf,
}

impl CertificateStore {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{domain}.crt"))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{domain}.key"))
    }

    pub fn account_path(&self) -> PathBuf {
        self.cert_dir.join("account.json")
    }

    pub async fn exists(&self, domain: &str) -> bool {
        fs::metadata(self.cert_path(domain)).await.is_ok()
            && fs::metadata(self.key_path(domain)).await.is_ok()
    }

    pub async fn save(
        &self,
        domain: &str,
        cert_chain_pem: &str,
        private_key_pem: &str,
    ) -> Result<(), CertError> {
        fs::write(self.cert_path(domain), cert_chain_pem).await?;
        fs::write(self.key_path(domain), private_key_pem).await?;
        Ok(())
    }

    /// Load and parse the stored PEM pair for a domain.
    pub async fn load(&self, domain: &str) -> Result<Certificate, CertError> {
        let cert_path = self.cert_path(domain);
        if fs::metadata(&cert_path).await.is_err() {
            return Err(CertError::NotFound(domain.to_string()));
        }

        let cert_pem = fs::read(&cert_path).await?;
        let key_pem = fs::read(self.key_path(domain)).await?;

        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Parse(format!("failed to parse certificate: {e}")))?;
        if cert_chain.is_empty() {
            return Err(CertError::Parse(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let private_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| CertError::Parse(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| CertError::Parse("no private key found in file".to_string()))?;

        Ok(Certificate {
            cert_chain,
            private_key,
        })
    }

    /// Expiry of the stored leaf certificate, used to decide renewal.
    pub async fn leaf_expires_at(&self, domain: &str) -> Result<DateTime<Utc>, CertError> {
        let cert_pem = fs::read(self.cert_path(domain)).await?;

        let (_, pem) = x509_parser::pem::parse_x509_pem(&cert_pem)
            .map_err(|e| CertError::Parse(format!("failed to parse PEM: {e}")))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| CertError::Parse(format!("failed to parse X.509 leaf: {e}")))?;

        let timestamp = cert.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| CertError::Parse("leaf notAfter out of range".to_string()))
    }
}
