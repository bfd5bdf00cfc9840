//! Tunnel registry: the authoritative FQDN → tunnel mapping
//!
//! The dispatcher consults this on every accepted connection and the HTTP
//! router on every proxied request, so lookups go through a concurrent map
//! with no read locking. Mutations are serialised and written through to the
//! store before they return.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use portico_store::{Store, StoreError};
use thiserror::Error;
use tracing::debug;

pub use portico_store::{TlsTermination, Tunnel};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tunnel already exists for {0}")]
    DuplicateFqdn(String),

    #[error("Tunnel port {0} is already in use by {1}")]
    DuplicatePort(u16, String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct TunnelRegistry {
    tunnels: DashMap<String, Tunnel>,
    store: Arc<Store>,
    /// Serialises create/delete so the uniqueness checks and the store write
    /// observe a consistent snapshot.
    write_lock: Mutex<()>,
}

impl TunnelRegistry {
    /// Build the in-memory view from the store's persisted tunnel set.
    pub fn load(store: Arc<Store>) -> Self {
        let tunnels = DashMap::new();
        for (fqdn, tunnel) in store.tunnels() {
            tunnels.insert(fqdn, tunnel);
        }
        Self {
            tunnels,
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get_tunnel(&self, fqdn: &str) -> Option<Tunnel> {
        self.tunnels.get(fqdn).map(|entry| entry.value().clone())
    }

    pub fn list_tunnels(&self) -> Vec<Tunnel> {
        self.tunnels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Register a tunnel. Both the FQDN and the loopback port must be unique
    /// across the registry.
    pub fn create(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
        let _guard = self.write_lock.lock().unwrap();

        if self.tunnels.contains_key(&tunnel.fqdn) {
            return Err(RegistryError::DuplicateFqdn(tunnel.fqdn));
        }
        if let Some(existing) = self
            .tunnels
            .iter()
            .find(|entry| entry.value().tunnel_port == tunnel.tunnel_port)
        {
            return Err(RegistryError::DuplicatePort(
                tunnel.tunnel_port,
                existing.key().clone(),
            ));
        }

        debug!(fqdn = %tunnel.fqdn, port = tunnel.tunnel_port, "registering tunnel");
        self.tunnels.insert(tunnel.fqdn.clone(), tunnel);
        self.persist()?;
        Ok(())
    }

    /// Remove a tunnel, returning the record so the caller can release its
    /// certificate reservation.
    pub fn delete(&self, fqdn: &str) -> Result<Option<Tunnel>, RegistryError> {
        let _guard = self.write_lock.lock().unwrap();

        let removed = self.tunnels.remove(fqdn).map(|(_, tunnel)| tunnel);
        if removed.is_some() {
            debug!(fqdn, "removing tunnel");
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let snapshot: HashMap<String, Tunnel> = self
            .tunnels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.store.put_tunnels(snapshot)
    }
}
