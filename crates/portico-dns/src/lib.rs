//! Client for the external DNS provisioning service
//!
//! The service hands out bootstrap hostnames, reports the caller's public IP,
//! and manages DNS records through an OAuth 2.0 authorization-code flow. The
//! proxy only ever asks for the `subdomain` scope; the operator's browser
//! drives the authorization leg and lands back on
//! `/namedrop/auth-success`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// OAuth scope requested from the service.
pub const OAUTH_SCOPE: &str = "subdomain";

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid status code")]
    RecordCreateFailed(u16),

    #[error("bootstrap domain request failed: {0}")]
    BootstrapFailed(String),
}

/// One scope grant attached to an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenScope {
    pub domain: String,
    pub host: String,
}

/// Response of the token-data endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub scopes: Vec<TokenScope>,
}

/// A DNS record as the records endpoint accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub domain: String,
    pub host: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct NamedropClient {
    base_url: String,
    /// OAuth client id; the service identifies proxies by their admin domain.
    client_id: String,
    redirect_url: String,
    http: reqwest::Client,
}

impl NamedropClient {
    pub fn new(base_url: impl Into<String>, admin_domain: &str) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            redirect_url: format!("{admin_domain}/namedrop/auth-success"),
            client_id: admin_domain.to_string(),
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The public IP the service observes for this host.
    pub async fn my_ip(&self) -> Result<String, DnsError> {
        let body = self
            .http
            .get(format!("{}/my-ip", self.base_url))
            .send()
            .await?
            .text()
            .await?;
        Ok(body.trim().to_string())
    }

    /// Request an allocated bootstrap FQDN.
    pub async fn bootstrap_domain(&self) -> Result<String, DnsError> {
        let response = self
            .http
            .get(format!("{}/dnsapi/bootstrap-domain", self.base_url))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DnsError::BootstrapFailed(body));
        }
        Ok(body.trim().to_string())
    }

    /// Link the operator opens to delegate a domain to this proxy.
    pub fn request_url(&self, requester: &str, request_id: &str) -> String {
        format!(
            "{}/dnsapi?requester={requester}&request-id={request_id}",
            self.base_url
        )
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<String, DnsError> {
        let response = self
            .http
            .post(format!("{}/namedrop/token", self.base_url))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", "fake-secret"),
                ("redirect_uri", &self.redirect_url),
            ])
            .send()
            .await?
            .error_for_status()?;

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    /// Scopes granted to an access token.
    pub async fn token_data(&self, access_token: &str) -> Result<TokenData, DnsError> {
        let data = self
            .http
            .get(format!(
                "{}/namedrop/token-data?access_token={access_token}",
                self.base_url
            ))
            .send()
            .await?
            .json()
            .await?;
        Ok(data)
    }

    /// Create a DNS record. Anything but a 200 is an error.
    pub async fn create_record(&self, record: &Record, access_token: &str) -> Result<(), DnsError> {
        let response = self
            .http
            .put(format!(
                "{}/namedrop/records?access_token={access_token}",
                self.base_url
            ))
            .json(record)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(%status, body, "records endpoint answered");

        if status.as_u16() != 200 {
            return Err(DnsError::RecordCreateFailed(status.as_u16()));
        }
        Ok(())
    }
}
