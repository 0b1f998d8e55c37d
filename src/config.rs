use std::time::Duration;

/// mDNS service type the desktop peer advertises.
pub const SERVICE_TYPE: &str = "_crownlink._tcp.local.";

/// Well-known port the desktop peer listens on.
pub const PEER_PORT: u16 = 8888;

/// Backoff schedule for reconnection attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// All session tunables. One instance per session, injected at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub peer_port: u16,
    pub service_type: String,
    pub registry_url: String,
    /// How long a cached peer address stays usable.
    pub cache_ttl: Duration,
    /// Upper bound on one mDNS browse pass.
    pub discovery_timeout: Duration,
    /// Transient probe connect used to resolve a browse candidate.
    pub probe_timeout: Duration,
    pub registry_timeout: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Minimum interval between outbound sends (throttle window).
    pub send_window: Duration,
    /// Pause after a detected network change before resuming.
    pub settle_delay: Duration,
    /// Network snapshot polling cadence.
    pub network_poll_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_port: PEER_PORT,
            service_type: SERVICE_TYPE.to_string(),
            registry_url: "https://registry.crownlink.dev".to_string(),
            cache_ttl: Duration::from_secs(300),
            discovery_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            registry_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            send_window: Duration::from_millis(16),
            settle_delay: Duration::from_secs(3),
            network_poll_interval: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }
}
