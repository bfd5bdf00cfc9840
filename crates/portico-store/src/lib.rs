//! Persisted keyed record store
//!
//! Holds everything the proxy needs to survive a restart: the admin domain,
//! users, access tokens, tunnel records, and in-flight DNS provisioning
//! requests. State lives in a single JSON file that is rewritten on every
//! mutation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// DNS provisioning requests older than this are treated as absent.
const DNS_REQUEST_LIFETIME_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse store file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No such user: {0}")]
    NoSuchUser(String),

    #[error("User already exists: {0}")]
    UserExists(String),
}

/// TLS handling policy for a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsTermination {
    /// The proxy terminates TLS and reverse-proxies HTTP to the backend.
    Server,
    /// The backend terminates TLS; the proxy forwards raw bytes.
    Client,
    /// The proxy is a byte pipe identified by SNI only.
    Passthrough,
}

impl Default for TlsTermination {
    fn default() -> Self {
        TlsTermination::Server
    }
}

/// A tunnel record: a public FQDN bound to a loopback TCP port where the
/// user's backend listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub fqdn: String,
    pub tunnel_port: u16,
    /// The origin host the backend believes it is serving; used for the
    /// upstream Host header in terminated mode.
    pub client_address: String,
    pub client_port: u16,
    #[serde(default)]
    pub tls_termination: TlsTermination,
    #[serde(default)]
    pub auth_username: String,
    #[serde(default)]
    pub auth_password: String,
    pub owner: String,
}

impl Tunnel {
    /// Whether requests through the terminated path must present Basic
    /// credentials.
    pub fn requires_auth(&self) -> bool {
        !self.auth_username.is_empty() || !self.auth_password.is_empty()
    }

    /// Whether TLS is terminated by the backend rather than the proxy.
    pub fn backend_terminates_tls(&self) -> bool {
        matches!(
            self.tls_termination,
            TlsTermination::Client | TlsTermination::Passthrough
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

/// Intent of an in-flight OAuth DNS-provisioning redirect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRequest {
    pub is_admin_domain: bool,
    pub records: Vec<DnsRecord>,
    pub created_at: DateTime<Utc>,
}

impl DnsRequest {
    pub fn new(is_admin_domain: bool, records: Vec<DnsRecord>) -> Self {
        Self {
            is_admin_domain,
            records,
            created_at: Utc::now(),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() - self.created_at > Duration::minutes(DNS_REQUEST_LIFETIME_MINUTES)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    admin_domain: String,
    #[serde(default)]
    users: HashMap<String, User>,
    #[serde(default)]
    tokens: HashMap<String, TokenData>,
    #[serde(default)]
    tunnels: HashMap<String, Tunnel>,
    #[serde(default)]
    dns_requests: HashMap<String, DnsRequest>,
}

/// JSON-file backed record store. All reads return clones; every mutation
/// rewrites the file before returning.
pub struct Store {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl Store {
    /// Load the store from `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            StoreData::default()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn admin_domain(&self) -> String {
        self.data.lock().unwrap().admin_domain.clone()
    }

    pub fn set_admin_domain(&self, domain: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.admin_domain = domain.to_string();
        self.persist(&data)
    }

    pub fn users(&self) -> HashMap<String, User> {
        self.data.lock().unwrap().users.clone()
    }

    pub fn add_user(&self, username: &str, is_admin: bool) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        if data.users.contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        data.users.insert(username.to_string(), User { is_admin });
        self.persist(&data)
    }

    pub fn delete_user(&self, username: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.users.remove(username);
        // Tokens owned by a deleted user stop authorising anything.
        data.tokens.retain(|_, token| token.owner != username);
        self.persist(&data)
    }

    pub fn tokens(&self) -> HashMap<String, TokenData> {
        self.data.lock().unwrap().tokens.clone()
    }

    /// Mint a new opaque token for `owner`. The owner must exist.
    pub fn add_token(&self, owner: &str) -> Result<String, StoreError> {
        let mut data = self.data.lock().unwrap();
        if !data.users.contains_key(owner) {
            return Err(StoreError::NoSuchUser(owner.to_string()));
        }
        let token = random_code(32);
        data.tokens.insert(
            token.clone(),
            TokenData {
                owner: owner.to_string(),
            },
        );
        self.persist(&data)?;
        Ok(token)
    }

    pub fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.tokens.remove(token);
        self.persist(&data)
    }

    pub fn tunnels(&self) -> HashMap<String, Tunnel> {
        self.data.lock().unwrap().tunnels.clone()
    }

    /// Replace the persisted tunnel set. The registry owns the in-memory view
    /// and calls this after every mutation.
    pub fn put_tunnels(&self, tunnels: HashMap<String, Tunnel>) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.tunnels = tunnels;
        self.persist(&data)
    }

    /// Fetch a DNS provisioning request. Expired entries are dropped and
    /// reported as absent.
    pub fn get_dns_request(&self, id: &str) -> Option<DnsRequest> {
        let mut data = self.data.lock().unwrap();
        match data.dns_requests.get(id) {
            Some(request) if request.is_expired() => {
                debug!(id, "dropping expired DNS request");
                data.dns_requests.remove(id);
                let _ = self.persist(&data);
                None
            }
            Some(request) => Some(request.clone()),
            None => None,
        }
    }

    pub fn set_dns_request(&self, id: &str, request: DnsRequest) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.dns_requests.insert(id.to_string(), request);
        self.persist(&data)
    }

    pub fn delete_dns_request(&self, id: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.dns_requests.remove(id);
        self.persist(&data)
    }
}

/// Random alphanumeric code, used for tokens and request ids.
pub fn random_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
