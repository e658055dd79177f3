//! Address Resolver: the thread-safe authoritative endpoint set for one service (spec §4.B).

use std::collections::BTreeSet;
use std::sync::RwLock;

/// Owns the deduplicated, sorted `host:port` list for one service.
///
/// Readers take the read lock only for the duration of the copy; writers serialize
/// through the write lock. Concurrent readers observe either the pre-update or the
/// post-update list in full, never an intermediate state (spec §5).
#[derive(Debug)]
pub struct AddressResolver {
    service_name: String,
    addresses: RwLock<Vec<String>>,
}

impl AddressResolver {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), addresses: RwLock::new(Vec::new()) }
    }

    /// Install a new endpoint set: dedup (dropping empty strings) and sort before install.
    pub fn update_addresses(&self, endpoints: impl IntoIterator<Item = String>) {
        let deduped: BTreeSet<String> = endpoints.into_iter().filter(|e| !e.is_empty()).collect();
        let addresses: Vec<String> = deduped.into_iter().collect();

        let count = addresses.len();
        {
            let mut guard = self.addresses.write().expect("AddressResolver lock poisoned");
            *guard = addresses;
        }
        tracing::info!(service = %self.service_name, count, "resolver updated");
    }

    /// A fresh copy of the current endpoint set; callers never receive the internal slice.
    pub fn get_addresses(&self) -> Vec<String> {
        self.addresses.read().expect("AddressResolver lock poisoned").clone()
    }

    pub fn address_count(&self) -> usize {
        self.addresses.read().expect("AddressResolver lock poisoned").len()
    }

    pub fn has_addresses(&self) -> bool {
        self.address_count() > 0
    }

    pub fn get_service_name(&self) -> &str {
        &self.service_name
    }

    pub fn clear(&self) {
        {
            let mut guard = self.addresses.write().expect("AddressResolver lock poisoned");
            guard.clear();
        }
        tracing::info!(service = %self.service_name, "resolver cleared");
    }
}
