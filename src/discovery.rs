//! Local peer discovery: browse for the desktop peer's mDNS service and
//! resolve the first usable candidate to a concrete address by opening a
//! transient probe connection.

use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::Error;
use crate::peer::{ip_is_routable, PeerAddress};

pub struct LocalDiscovery {
    service_type: String,
    timeout: Duration,
    probe_timeout: Duration,
}

/// Outcome of one browse pass: the winning address plus every service seen,
/// kept for the observability list regardless of which source wins.
pub struct BrowseResult {
    pub address: PeerAddress,
    pub seen: Vec<String>,
}

impl LocalDiscovery {
    pub fn new(service_type: impl Into<String>, timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            service_type: service_type.into(),
            timeout,
            probe_timeout,
        }
    }

    /// Browses until the timeout elapses or a candidate probes successfully.
    /// Link-local candidates are discarded and the next one is tried; an
    /// unusable address is never surfaced.
    pub async fn discover(&self) -> Result<BrowseResult, Error> {
        let daemon = ServiceDaemon::new()?;
        let receiver = daemon.browse(&self.service_type)?;
        let deadline = Instant::now() + self.timeout;
        let mut seen = Vec::new();

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(Error::DiscoveryTimeout);
            }

            let event = match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => break Err(Error::DiscoveryTimeout),
                Err(_) => break Err(Error::DiscoveryTimeout),
            };

            if let ServiceEvent::ServiceResolved(info) = event {
                tracing::debug!("resolved service {}", info.get_fullname());
                seen.push(info.get_fullname().to_string());

                let port = info.get_port();
                let mut candidates: Vec<PeerAddress> = Vec::new();
                for ip in info.get_addresses() {
                    let ip = ip.to_ip_addr();
                    if ip_is_routable(ip) {
                        candidates.push(PeerAddress::new(ip.to_string(), port));
                    } else {
                        tracing::debug!("filtering link-local candidate {}", ip);
                    }
                }

                if let Some(address) = self.probe_sequentially(candidates).await {
                    break Ok(address);
                }
            }
        };

        let _ = daemon.stop_browse(&self.service_type);
        let _ = daemon.shutdown();

        outcome.map(|address| BrowseResult { address, seen })
    }

    /// Probes candidates one at a time; the first that accepts a TCP
    /// connection wins. The connected socket's remote address is the
    /// concrete resolution result.
    async fn probe_sequentially(&self, candidates: Vec<PeerAddress>) -> Option<PeerAddress> {
        for candidate in candidates {
            match self.probe(&candidate).await {
                Ok(resolved) => {
                    tracing::info!("probe succeeded: {} -> {}", candidate, resolved);
                    return Some(resolved);
                }
                Err(e) => {
                    tracing::debug!("probe of {} failed: {}, trying next", candidate, e);
                }
            }
        }
        None
    }

    async fn probe(&self, candidate: &PeerAddress) -> Result<PeerAddress, Error> {
        let connect = TcpStream::connect((candidate.host.as_str(), candidate.port));
        let stream = tokio::time::timeout(self.probe_timeout, connect)
            .await
            .map_err(|_| Error::ConnectionTimeout)??;

        let remote = stream.peer_addr()?;
        if !ip_is_routable(remote.ip()) {
            return Err(Error::InvalidAddress(remote.to_string()));
        }
        Ok(PeerAddress::new(remote.ip().to_string(), remote.port()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_resolves_against_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let discovery =
            LocalDiscovery::new("_test._tcp.local.", Duration::from_secs(1), Duration::from_secs(1));
        let candidate = PeerAddress::new("127.0.0.1", addr.port());
        let resolved = discovery.probe(&candidate).await.unwrap();
        assert_eq!(resolved, candidate);
    }

    #[tokio::test]
    async fn probe_fails_fast_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let discovery =
            LocalDiscovery::new("_test._tcp.local.", Duration::from_secs(1), Duration::from_secs(1));
        let candidate = PeerAddress::new("127.0.0.1", port);
        assert!(discovery.probe(&candidate).await.is_err());
    }

    #[tokio::test]
    async fn probe_sequentially_skips_dead_candidates() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = live.local_addr().unwrap().port();

        let discovery =
            LocalDiscovery::new("_test._tcp.local.", Duration::from_secs(1), Duration::from_secs(1));
        let resolved = discovery
            .probe_sequentially(vec![
                PeerAddress::new("127.0.0.1", dead_port),
                PeerAddress::new("127.0.0.1", live_port),
            ])
            .await
            .expect("second candidate should win");
        assert_eq!(resolved.port, live_port);
    }
}
