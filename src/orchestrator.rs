//! Runs discovery strategies in priority order, short-circuiting on the
//! first success: manual override, cached address, local mDNS browse,
//! fallback registry. Every success write-through-refreshes the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{AddressCache, ManualOverride};
use crate::config::Config;
use crate::discovery::LocalDiscovery;
use crate::error::Error;
use crate::peer::{DiscoverySource, PeerAddress};
use crate::registry::FallbackRegistry;
use crate::storage::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub address: PeerAddress,
    pub source: DiscoverySource,
}

pub struct DiscoveryOrchestrator {
    cache: AddressCache,
    manual: ManualOverride,
    local: LocalDiscovery,
    registry: FallbackRegistry,
    /// Addresses and service names seen this session, for the status UI.
    discovered: Mutex<Vec<String>>,
    /// Serializes resolutions and holds the outcome of the last completed
    /// pass; a caller that waited for an in-flight pass shares its outcome
    /// instead of re-running the strategy chain. `None` means exhausted.
    gate: tokio::sync::Mutex<Option<Resolution>>,
    pass_seq: AtomicU64,
}

impl DiscoveryOrchestrator {
    pub fn new(config: &Config, store: Arc<dyn Store>, client_id: String) -> Self {
        Self {
            cache: AddressCache::new(store.clone(), config.cache_ttl),
            manual: ManualOverride::new(store, config.peer_port),
            local: LocalDiscovery::new(
                config.service_type.clone(),
                config.discovery_timeout,
                config.probe_timeout,
            ),
            registry: FallbackRegistry::new(
                config.registry_url.clone(),
                client_id,
                config.peer_port,
                config.registry_timeout,
            ),
            discovered: Mutex::new(Vec::new()),
            gate: tokio::sync::Mutex::new(None),
            pass_seq: AtomicU64::new(0),
        }
    }

    /// Resolves the peer address, or returns `DiscoveryExhausted` with a
    /// remediation hint once every strategy has come up empty. Concurrent
    /// calls coalesce: one pass runs, the rest get its outcome.
    pub async fn resolve(&self) -> Result<Resolution, Error> {
        let observed = self.pass_seq.load(Ordering::Acquire);
        let mut last = self.gate.lock().await;
        if self.pass_seq.load(Ordering::Acquire) != observed {
            return match last.clone() {
                Some(resolution) => Ok(resolution),
                None => Err(Error::DiscoveryExhausted),
            };
        }

        let result = self.run_strategies().await;
        *last = result.as_ref().ok().cloned();
        self.pass_seq.fetch_add(1, Ordering::Release);
        result
    }

    async fn run_strategies(&self) -> Result<Resolution, Error> {
        // Manual override beats everything, including a fresher cache entry.
        if let Some(address) = self.manual.get() {
            tracing::info!("using manual override {}", address);
            self.record(&address);
            return Ok(Resolution {
                address,
                source: DiscoverySource::Manual,
            });
        }

        if let Some(entry) = self.cache.load() {
            tracing::info!("using cached address {}", entry.address);
            return Ok(Resolution {
                address: entry.address,
                source: DiscoverySource::Cached,
            });
        }

        match self.local.discover().await {
            Ok(result) => {
                tracing::info!("local discovery found {}", result.address);
                if let Ok(mut seen) = self.discovered.lock() {
                    seen.extend(result.seen);
                }
                self.record(&result.address);
                self.cache.save(&result.address, DiscoverySource::Local);
                return Ok(Resolution {
                    address: result.address,
                    source: DiscoverySource::Local,
                });
            }
            Err(e) => tracing::debug!("local discovery yielded nothing: {}", e),
        }

        match self.registry.lookup().await {
            Ok(address) => {
                tracing::info!("fallback registry returned {}", address);
                self.record(&address);
                self.cache.save(&address, DiscoverySource::Fallback);
                Ok(Resolution {
                    address,
                    source: DiscoverySource::Fallback,
                })
            }
            Err(e) => {
                tracing::warn!("fallback registry lookup failed: {}", e);
                Err(Error::DiscoveryExhausted)
            }
        }
    }

    fn record(&self, address: &PeerAddress) {
        if let Ok(mut seen) = self.discovered.lock() {
            let s = address.to_string();
            if !seen.contains(&s) {
                seen.push(s);
            }
        }
    }

    pub fn discovered(&self) -> Vec<String> {
        self.discovered
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    pub fn clear_discovered(&self) {
        if let Ok(mut seen) = self.discovered.lock() {
            seen.clear();
        }
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_resolution(&self, resolution: &Resolution) {
        self.cache.save(&resolution.address, resolution.source);
    }

    pub fn manual_address(&self) -> Option<PeerAddress> {
        self.manual.get()
    }

    pub fn is_manual(&self) -> bool {
        self.manual.is_enabled()
    }

    pub fn set_manual(&self, address: &PeerAddress) {
        self.manual.set(address);
        // The cache only ever holds auto-discovered state from here on.
        self.cache.clear();
    }

    pub fn clear_manual(&self) {
        self.manual.clear();
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn orchestrator(store: Arc<dyn Store>) -> DiscoveryOrchestrator {
        let config = Config {
            // Keep unit tests off the real network.
            discovery_timeout: std::time::Duration::from_millis(10),
            registry_timeout: std::time::Duration::from_millis(10),
            registry_url: "http://127.0.0.1:1/unreachable".to_string(),
            ..Config::default()
        };
        DiscoveryOrchestrator::new(&config, store, "test-client".to_string())
    }

    #[tokio::test]
    async fn manual_override_wins_over_valid_cache() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = orchestrator(store.clone());

        orch.cache_resolution(&Resolution {
            address: PeerAddress::new("10.0.0.8", 8888),
            source: DiscoverySource::Local,
        });
        orch.set_manual(&PeerAddress::new("192.168.1.50", 8888));
        // set_manual clears the cache; re-seed it to force the conflict.
        orch.cache_resolution(&Resolution {
            address: PeerAddress::new("10.0.0.8", 8888),
            source: DiscoverySource::Local,
        });

        let res = orch.resolve().await.unwrap();
        assert_eq!(res.source, DiscoverySource::Manual);
        assert_eq!(res.address.host, "192.168.1.50");
    }

    #[tokio::test]
    async fn cache_hit_short_circuits() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = orchestrator(store);

        orch.cache_resolution(&Resolution {
            address: PeerAddress::new("10.0.0.8", 8888),
            source: DiscoverySource::Local,
        });

        let res = orch.resolve().await.unwrap();
        assert_eq!(res.source, DiscoverySource::Cached);
        assert_eq!(res.address.host, "10.0.0.8");
    }

    #[tokio::test]
    async fn exhausts_when_nothing_answers() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = orchestrator(store);

        match orch.resolve().await {
            Err(Error::DiscoveryExhausted) => {}
            other => panic!("expected DiscoveryExhausted, got {:?}", other.map(|r| r.address)),
        }
    }

    #[tokio::test]
    async fn concurrent_resolves_coalesce_onto_one_pass() {
        use std::sync::atomic::AtomicUsize;
        use tokio::io::AsyncWriteExt;

        // Counting fake registry: every resolution pass that reaches the
        // fallback tier costs exactly one connection here.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream
                    .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let config = Config {
            discovery_timeout: std::time::Duration::from_millis(10),
            registry_timeout: std::time::Duration::from_secs(1),
            registry_url: format!("http://127.0.0.1:{}", port),
            ..Config::default()
        };
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = DiscoveryOrchestrator::new(&config, store, "test-client".to_string());

        let (a, b) = tokio::join!(orch.resolve(), orch.resolve());
        assert!(matches!(a, Err(Error::DiscoveryExhausted)));
        assert!(matches!(b, Err(Error::DiscoveryExhausted)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_manual_clears_cached_auto_state() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = orchestrator(store);

        orch.cache_resolution(&Resolution {
            address: PeerAddress::new("10.0.0.8", 8888),
            source: DiscoverySource::Local,
        });
        orch.set_manual(&PeerAddress::new("192.168.1.50", 8888));
        orch.clear_manual();

        // With override and cache both gone, resolution exhausts.
        assert!(matches!(orch.resolve().await, Err(Error::DiscoveryExhausted)));
    }
}
