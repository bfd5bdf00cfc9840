//! Certificate manager
//!
//! The proxy-facing adapter: `manage` guarantees a served certificate for
//! every hostname handed to it, `release` drops the reservation when a tunnel
//! is deleted, and a background task renews anything expiring soon. The ACME
//! account is created lazily on the first order so a manager over an already
//! populated cert directory never touches the network.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rustls::sign::CertifiedKey;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::acme::{AcmeClient, AcmeConfig};
use crate::resolver::{certified_key, CertResolver};
use crate::storage::CertificateStore;
use crate::CertError;

/// Renew once a certificate is within this many days of expiry.
const RENEW_WITHIN_DAYS: i64 = 30;
/// How often the renewal task re-checks managed hostnames.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub struct CertManager {
    storage: CertificateStore,
    config: AcmeConfig,
    acme: OnceCell<AcmeClient>,
    resolver: Arc<CertResolver>,
    http01_responses: Arc<RwLock<HashMap<String, String>>>,
    managed: Mutex<HashSet<String>>,
}

impl CertManager {
    pub fn new(cert_dir: impl Into<PathBuf>, config: AcmeConfig) -> Result<Self, CertError> {
        let storage = CertificateStore::new(cert_dir);
        std::fs::create_dir_all(storage.cert_dir())?;

        Ok(Self {
            storage,
            config,
            acme: OnceCell::new(),
            resolver: Arc::new(CertResolver::new()),
            http01_responses: Arc::new(RwLock::new(HashMap::new())),
            managed: Mutex::new(HashSet::new()),
        })
    }

    /// The SNI resolver to hand to rustls.
    pub fn resolver(&self) -> Arc<CertResolver> {
        self.resolver.clone()
    }

    /// SNI callback used outside the TLS stack (tests, diagnostics).
    pub fn get_certificate(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
        self.resolver.get(sni)
    }

    /// Key authorization for a pending HTTP-01 token, served by the port-80
    /// handler at `/.well-known/acme-challenge/{token}`.
    pub async fn http01_response(&self, token: &str) -> Option<String> {
        self.http01_responses.read().await.get(token).cloned()
    }

    /// Ensure a valid, served, renewed certificate for each hostname.
    /// Idempotent; hostnames with certificates already on disk load without
    /// network traffic.
    pub async fn manage(&self, hostnames: &[String]) -> Result<(), CertError> {
        for hostname in hostnames {
            self.managed.lock().unwrap().insert(hostname.clone());
            self.ensure_certificate(hostname).await?;
        }
        Ok(())
    }

    /// Drop the management reservation for a hostname. The stored PEM files
    /// stay on disk; the certificate just stops being served and renewed.
    pub fn release(&self, hostname: &str) {
        self.managed.lock().unwrap().remove(hostname);
        self.resolver.remove(hostname);
        info!(hostname, "released certificate reservation");
    }

    pub fn managed_hostnames(&self) -> Vec<String> {
        self.managed.lock().unwrap().iter().cloned().collect()
    }

    async fn ensure_certificate(&self, domain: &str) -> Result<(), CertError> {
        if self.storage.exists(domain).await {
            match self.load_into_resolver(domain).await {
                Ok(expires_soon) if !expires_soon => return Ok(()),
                Ok(_) => info!(domain, "stored certificate is due for renewal"),
                Err(e) => warn!(domain, "stored certificate unusable: {e}"),
            }
        }

        let acme = self
            .acme
            .get_or_try_init(|| AcmeClient::init(&self.storage, &self.config))
            .await?;

        let (cert_chain_pem, private_key_pem) = acme
            .order_certificate(domain, &self.http01_responses, &self.resolver)
            .await?;
        self.storage
            .save(domain, &cert_chain_pem, &private_key_pem)
            .await?;
        self.load_into_resolver(domain).await?;

        info!(domain, "certificate acquired");
        Ok(())
    }

    /// Load the stored certificate into the resolver; returns whether it is
    /// inside the renewal window.
    async fn load_into_resolver(&self, domain: &str) -> Result<bool, CertError> {
        let cert = self.storage.load(domain).await?;
        self.resolver.insert(domain, certified_key(cert)?);

        let expires = self.storage.leaf_expires_at(domain).await?;
        Ok(expires - Utc::now() < chrono::Duration::days(RENEW_WITHIN_DAYS))
    }

    /// Background renewal loop. Acquisition failures here are logged, not
    /// fatal; the next tick retries.
    pub fn spawn_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;
                for hostname in manager.managed_hostnames() {
                    if let Err(e) = manager.ensure_certificate(&hostname).await {
                        error!(hostname, "certificate renewal failed: {e}");
                    }
                }
            }
        })
    }
}
