use std::io;

/// Crate-wide error type. Discovery strategies treat most of these as
/// "no usable result" and fall through; only the terminal variants are
/// surfaced to the UI.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("local discovery timed out")]
    DiscoveryTimeout,

    #[error("peer not found: make sure the desktop receiver is running, on the same network, and not blocked by a firewall")]
    DiscoveryExhausted,

    #[error("connection attempt timed out")]
    ConnectionTimeout,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("frame contains an unescaped newline")]
    FrameContainsNewline,

    #[error("session closed")]
    SessionClosed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("mdns error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("registry lookup failed: {0}")]
    Registry(#[from] reqwest::Error),
}

/// Classification of a failed connection attempt, used to pick the
/// recovery path: refused/timeout back off against the same address,
/// unreachable escalates to rediscovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Refused,
    Unreachable,
    TimedOut,
    Other,
}

impl FailureKind {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => FailureKind::Refused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                FailureKind::Refused
            }
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                FailureKind::Unreachable
            }
            io::ErrorKind::NetworkDown => FailureKind::Unreachable,
            io::ErrorKind::TimedOut => FailureKind::TimedOut,
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_refused_and_unreachable() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(FailureKind::classify(&refused), FailureKind::Refused);

        let unreachable = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(FailureKind::classify(&unreachable), FailureKind::Unreachable);

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(FailureKind::classify(&timeout), FailureKind::TimedOut);
    }

    #[test]
    fn exhausted_message_carries_remediation_hint() {
        let msg = Error::DiscoveryExhausted.to_string();
        assert!(msg.contains("same network"));
        assert!(msg.contains("firewall"));
    }
}
