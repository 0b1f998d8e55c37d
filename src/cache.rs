//! Typed views over the key-value store: the TTL-bounded address cache and
//! the manual override. Both survive process restarts.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::peer::{DiscoverySource, PeerAddress};
use crate::storage::{keys, Store};

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub address: PeerAddress,
    pub source: DiscoverySource,
    /// Unix seconds at resolution time.
    pub resolved_at: u64,
}

/// Last-known peer address with a TTL. A stale or link-local entry is
/// cleared on load rather than surfaced.
pub struct AddressCache {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl AddressCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn load(&self) -> Option<CacheEntry> {
        self.load_at(unix_secs())
    }

    pub fn load_at(&self, now: u64) -> Option<CacheEntry> {
        let raw_addr = self.store.get(keys::CACHED_ADDRESS)?;
        let resolved_at: u64 = self.store.get(keys::CACHED_AT)?.parse().ok()?;

        if now.saturating_sub(resolved_at) >= self.ttl.as_secs() {
            tracing::debug!("cached address expired, clearing");
            self.clear();
            return None;
        }

        let address = match PeerAddress::parse(&raw_addr, 0) {
            Ok(a) => a,
            Err(_) => {
                tracing::warn!("cached address {} is unusable, clearing", raw_addr);
                self.clear();
                return None;
            }
        };

        let source = match self.store.get(keys::CACHED_SOURCE).as_deref() {
            Some("manual") => DiscoverySource::Manual,
            Some("local discovery") => DiscoverySource::Local,
            Some("fallback registry") => DiscoverySource::Fallback,
            _ => DiscoverySource::Cached,
        };

        Some(CacheEntry {
            address,
            source,
            resolved_at,
        })
    }

    pub fn save(&self, address: &PeerAddress, source: DiscoverySource) {
        self.save_at(address, source, unix_secs());
    }

    pub fn save_at(&self, address: &PeerAddress, source: DiscoverySource, now: u64) {
        self.store.set(keys::CACHED_ADDRESS, &address.to_string());
        self.store.set(keys::CACHED_SOURCE, source.label());
        self.store.set(keys::CACHED_AT, &now.to_string());
    }

    pub fn clear(&self) {
        self.store.delete(keys::CACHED_ADDRESS);
        self.store.delete(keys::CACHED_SOURCE);
        self.store.delete(keys::CACHED_AT);
    }
}

/// User-pinned peer address. Takes priority over every discovery strategy
/// and is only ever cleared by explicit user action.
pub struct ManualOverride {
    store: Arc<dyn Store>,
    default_port: u16,
}

impl ManualOverride {
    pub fn new(store: Arc<dyn Store>, default_port: u16) -> Self {
        Self {
            store,
            default_port,
        }
    }

    pub fn get(&self) -> Option<PeerAddress> {
        if self.store.get(keys::MANUAL_ENABLED).as_deref() != Some("true") {
            return None;
        }
        let raw = self.store.get(keys::MANUAL_ADDRESS)?;
        PeerAddress::parse(&raw, self.default_port).ok()
    }

    pub fn is_enabled(&self) -> bool {
        self.store.get(keys::MANUAL_ENABLED).as_deref() == Some("true")
    }

    pub fn set(&self, address: &PeerAddress) {
        self.store.set(keys::MANUAL_ADDRESS, &address.to_string());
        self.store.set(keys::MANUAL_ENABLED, "true");
    }

    pub fn clear(&self) {
        self.store.delete(keys::MANUAL_ADDRESS);
        self.store.set(keys::MANUAL_ENABLED, "false");
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn cache(ttl_secs: u64) -> AddressCache {
        AddressCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(ttl_secs))
    }

    #[test]
    fn entry_usable_inside_ttl_unusable_after() {
        let cache = cache(300);
        let addr = PeerAddress::new("10.0.0.5", 8888);
        cache.save_at(&addr, DiscoverySource::Local, 1_000);

        let hit = cache.load_at(1_000 + 299).expect("fresh entry");
        assert_eq!(hit.address, addr);
        assert_eq!(hit.source, DiscoverySource::Local);
        assert_eq!(hit.resolved_at, 1_000);

        // Same entry one tick past the TTL is gone, and stays gone.
        let cache2 = cache_with(&addr, 1_000);
        assert!(cache2.load_at(1_000 + 301).is_none());
        assert!(cache2.load_at(1_000 + 10).is_none());
    }

    fn cache_with(addr: &PeerAddress, at: u64) -> AddressCache {
        let c = cache(300);
        c.save_at(addr, DiscoverySource::Local, at);
        c
    }

    #[test]
    fn link_local_entry_is_cleared_on_load() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.set(keys::CACHED_ADDRESS, "169.254.7.7:8888");
        store.set(keys::CACHED_AT, "1000");
        let cache = AddressCache::new(store.clone(), Duration::from_secs(300));

        assert!(cache.load_at(1_001).is_none());
        assert_eq!(store.get(keys::CACHED_ADDRESS), None);
    }

    #[test]
    fn manual_override_roundtrip() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manual = ManualOverride::new(store, 8888);
        assert!(manual.get().is_none());

        manual.set(&PeerAddress::new("192.168.1.20", 8888));
        assert!(manual.is_enabled());
        assert_eq!(manual.get().unwrap().host, "192.168.1.20");

        manual.clear();
        assert!(!manual.is_enabled());
        assert!(manual.get().is_none());
    }
}
