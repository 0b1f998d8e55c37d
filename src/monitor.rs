//! Watches the local network for change edges: a different network
//! identity, a different local address, or the link dropping/returning.
//! Snapshots are polled; the diff logic is pure and the first-ever
//! snapshot is never reported as a change.

use std::net::IpAddr;
use std::time::Duration;

use local_ip_address::{list_afinet_netifas, local_ip};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peer::ip_is_routable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChangeReason {
    /// Different network identity (roamed to another network/interface).
    IdentityChanged,
    /// Same network identity, different local address (e.g. DHCP renew).
    AddressChanged,
    LinkLost,
    LinkRestored,
}

#[derive(Debug, Clone)]
pub struct NetworkChangeEvent {
    pub reason: NetworkChangeReason,
    pub snapshot: NetworkSnapshot,
}

/// Local view of the network, used only to detect change edges, never as a
/// routable address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkSnapshot {
    pub local_ip: Option<IpAddr>,
    pub identity: Option<String>,
}

impl NetworkSnapshot {
    /// Captures the current local IP and a coarse network identity
    /// (interface name plus subnet), filtering link-local addresses.
    pub fn capture() -> Self {
        let ip = local_ip().ok().filter(|ip| ip_is_routable(*ip));
        let identity = ip.and_then(|ip| {
            let interfaces = list_afinet_netifas().ok()?;
            let name = interfaces
                .into_iter()
                .find(|(_, addr)| *addr == ip)
                .map(|(name, _)| name)?;
            Some(format!("{}/{}", name, subnet_of(ip)))
        });
        Self {
            local_ip: ip,
            identity,
        }
    }
}

/// Subnet-ish prefix used as part of the network identity, so that moving
/// to a different network changes identity even when the interface name
/// stays the same.
fn subnet_of(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}", s[0], s[1], s[2], s[3])
        }
    }
}

/// Compares two snapshots. Identity change takes precedence over an
/// address change when both fire at once.
pub fn diff(prev: &NetworkSnapshot, next: &NetworkSnapshot) -> Option<NetworkChangeReason> {
    if prev == next {
        return None;
    }
    match (prev.local_ip, next.local_ip) {
        (Some(_), None) => return Some(NetworkChangeReason::LinkLost),
        (None, Some(_)) => return Some(NetworkChangeReason::LinkRestored),
        (None, None) => return None,
        (Some(_), Some(_)) => {}
    }
    if prev.identity != next.identity {
        return Some(NetworkChangeReason::IdentityChanged);
    }
    if prev.local_ip != next.local_ip {
        return Some(NetworkChangeReason::AddressChanged);
    }
    None
}

/// Polls snapshots in the background and reports change edges through a
/// channel. Dropping the monitor stops the task.
pub struct NetworkChangeMonitor {
    task: JoinHandle<()>,
}

impl NetworkChangeMonitor {
    pub fn spawn(poll_interval: Duration, events: mpsc::Sender<NetworkChangeEvent>) -> Self {
        let task = tokio::spawn(async move {
            let mut previous = NetworkSnapshot::capture();
            tracing::debug!("initial network snapshot: {:?}", previous);
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let next = NetworkSnapshot::capture();
                if let Some(reason) = diff(&previous, &next) {
                    tracing::info!("network change detected: {:?} ({:?})", reason, next);
                    let event = NetworkChangeEvent {
                        reason,
                        snapshot: next.clone(),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                previous = next;
            }
        });
        Self { task }
    }
}

impl Drop for NetworkChangeMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
