//! ACME client for automatic certificate provisioning via Let's Encrypt
//!
//! Orders run HTTP-01 when the CA offers it (the port-80 server answers from
//! the shared challenge map) and fall back to TLS-ALPN-01 (the resolver
//! serves a throwaway certificate carrying the ACME identifier extension).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::resolver::{certified_key, CertResolver};
use crate::storage::CertificateStore;
use crate::{CertError, Certificate};

/// ACME configuration
#[derive(Debug, Clone, Default)]
pub struct AcmeConfig {
    /// Optional contact email registered with the CA
    pub contact_email: Option<String>,
    /// Use the Let's Encrypt staging environment (for testing)
    pub use_staging: bool,
}

/// What to tear down once an order completes or fails.
enum ChallengeCleanup {
    None,
    Http01(String),
    TlsAlpn(String),
}

/// ACME client wrapping a single account. Credentials are persisted as
/// `account.json` next to the certificates so restarts reuse the account.
pub struct AcmeClient {
    account: Account,
}

impl AcmeClient {
    /// Load the stored account, or create and persist a new one.
    pub async fn init(
        storage: &CertificateStore,
        config: &AcmeConfig,
    ) -> Result<Self, CertError> {
        let account_path = storage.account_path();

        let account = if let Ok(creds_json) = fs::read_to_string(&account_path).await {
            let creds: AccountCredentials = serde_json::from_str(&creds_json).map_err(|e| {
                CertError::AccountCreationFailed(format!(
                    "failed to parse account credentials: {e}"
                ))
            })?;

            let account = Account::builder()
                .map_err(|e| CertError::AccountCreationFailed(e.to_string()))?
                .from_credentials(creds)
                .await
                .map_err(|e| CertError::AccountCreationFailed(e.to_string()))?;

            info!("ACME account loaded from {}", account_path.display());
            account
        } else {
            let directory_url = if config.use_staging {
                info!("using Let's Encrypt STAGING environment");
                LetsEncrypt::Staging.url().to_string()
            } else {
                LetsEncrypt::Production.url().to_string()
            };

            let contact = config
                .contact_email
                .as_ref()
                .map(|email| format!("mailto:{email}"));
            let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

            let (account, creds) = Account::builder()
                .map_err(|e| CertError::AccountCreationFailed(e.to_string()))?
                .create(
                    &NewAccount {
                        contact: &contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await
                .map_err(|e| CertError::AccountCreationFailed(e.to_string()))?;

            let creds_json = serde_json::to_string_pretty(&creds).map_err(|e| {
                CertError::AccountCreationFailed(format!(
                    "failed to serialize account credentials: {e}"
                ))
            })?;
            fs::write(&account_path, creds_json).await?;

            info!("ACME account created and saved to {}", account_path.display());
            account
        };

        Ok(Self { account })
    }

    /// Order a certificate for `domain`. Returns the certificate chain and
    /// private key as PEM.
    pub async fn order_certificate(
        &self,
        domain: &str,
        http01_responses: &RwLock<HashMap<String, String>>,
        resolver: &CertResolver,
    ) -> Result<(String, String), CertError> {
        let mut cleanup = ChallengeCleanup::None;
        let result = self
            .run_order(domain, http01_responses, resolver, &mut cleanup)
            .await;

        match cleanup {
            ChallengeCleanup::Http01(token) => {
                http01_responses.write().await.remove(&token);
            }
            ChallengeCleanup::TlsAlpn(domain) => resolver.remove_challenge(&domain),
            ChallengeCleanup::None => {}
        }

        result
    }

    async fn run_order(
        &self,
        domain: &str,
        http01_responses: &RwLock<HashMap<String, String>>,
        resolver: &CertResolver,
        cleanup: &mut ChallengeCleanup,
    ) -> Result<(String, String), CertError> {
        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);
        let mut order = self
            .account
            .new_order(&new_order)
            .await
            .map_err(|e| CertError::OrderCreationFailed(e.to_string()))?;

        {
            let mut authorizations = order.authorizations();
            let mut authz = authorizations
                .next()
                .await
                .ok_or_else(|| {
                    CertError::OrderCreationFailed(format!("no authorization for {domain}"))
                })?
                .map_err(|e| {
                    CertError::OrderCreationFailed(format!("failed to get authorization: {e}"))
                })?;

            match authz.status {
                AuthorizationStatus::Valid => {
                    info!("domain {domain} is already authorized");
                }
                AuthorizationStatus::Pending => {
                    let has_http01 = authz
                        .challenges
                        .iter()
                        .any(|c| c.r#type == ChallengeType::Http01);
                    let has_tls_alpn01 = authz
                        .challenges
                        .iter()
                        .any(|c| c.r#type == ChallengeType::TlsAlpn01);

                    if has_http01 {
                        let mut challenge = authz.challenge(ChallengeType::Http01).unwrap();
                        let key_auth = challenge.key_authorization();
                        let token = challenge.token.clone();
                        debug!(domain, token, "publishing HTTP-01 challenge response");
                        http01_responses
                            .write()
                            .await
                            .insert(token.clone(), key_auth.as_str().to_string());
                        *cleanup = ChallengeCleanup::Http01(token);

                        challenge.set_ready().await.map_err(|e| {
                            CertError::ChallengeFailed(format!(
                                "failed to set challenge ready: {e}"
                            ))
                        })?;
                    } else if has_tls_alpn01 {
                        let mut challenge = authz.challenge(ChallengeType::TlsAlpn01).unwrap();
                        let key_auth = challenge.key_authorization();
                        let cert = challenge_certificate(domain, key_auth.digest().as_ref())?;
                        debug!(domain, "publishing TLS-ALPN-01 challenge certificate");
                        resolver.insert_challenge(domain, cert);
                        *cleanup = ChallengeCleanup::TlsAlpn(domain.to_string());

                        challenge.set_ready().await.map_err(|e| {
                            CertError::ChallengeFailed(format!(
                                "failed to set challenge ready: {e}"
                            ))
                        })?;
                    } else {
                        return Err(CertError::NoSupportedChallenge(domain.to_string()));
                    }
                }
                other => {
                    return Err(CertError::ChallengeFailed(format!(
                        "authorization status is {other:?}"
                    )));
                }
            }
        }

        let retry_policy = RetryPolicy::new()
            .timeout(Duration::from_secs(120))
            .initial_delay(Duration::from_secs(2));

        let status = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|e| CertError::ChallengeFailed(format!("challenge verification failed: {e}")))?;

        match status {
            OrderStatus::Ready => debug!(domain, "order ready for finalization"),
            OrderStatus::Invalid => {
                return Err(CertError::ChallengeFailed(
                    "order became invalid during challenge verification".to_string(),
                ));
            }
            other => {
                return Err(CertError::ChallengeFailed(format!(
                    "unexpected order status: {other:?}"
                )));
            }
        }

        let private_key_pem = order
            .finalize()
            .await
            .map_err(|e| CertError::FinalizationFailed(format!("failed to finalize order: {e}")))?;

        let cert_chain_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| CertError::FinalizationFailed(format!("failed to get certificate: {e}")))?;

        Ok((cert_chain_pem, private_key_pem))
    }
}

/// Self-signed certificate carrying the ACME identifier extension, served for
/// `acme-tls/1` handshakes during a TLS-ALPN-01 challenge (RFC 8737).
fn challenge_certificate(domain: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, CertError> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CertError::ChallengeFailed(format!("invalid challenge SAN: {e}")))?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(digest)];

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| CertError::ChallengeFailed(format!("challenge key generation: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::ChallengeFailed(format!("challenge cert generation: {e}")))?;

    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    certified_key(Certificate::new(vec![cert.der().clone()], private_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_certificate_covers_domain() {
        let digest = [7u8; 32];
        let key = challenge_certificate("a.example", &digest).unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn acme_config_defaults() {
        let config = AcmeConfig::default();
        assert!(config.contact_email.is_none());
        assert!(!config.use_staging);
    }
}
