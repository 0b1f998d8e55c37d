//! Fallback registry lookup: a single HTTP GET keyed by the stable client
//! identifier, used when local discovery comes up empty.

use std::time::Duration;

use serde_json::Value;

use crate::error::Error;
use crate::peer::PeerAddress;

pub struct FallbackRegistry {
    base_url: String,
    client_id: String,
    default_port: u16,
    timeout: Duration,
}

impl FallbackRegistry {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        default_port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            default_port,
            timeout,
        }
    }

    pub async fn lookup(&self) -> Result<PeerAddress, Error> {
        let url = format!(
            "{}/get-ip?uuid={}",
            self.base_url.trim_end_matches('/'),
            self.client_id
        );
        tracing::debug!("registry lookup: {}", url);

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body: Value = client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        parse_registry_response(&body, self.default_port)
            .ok_or_else(|| Error::InvalidAddress(body.to_string()))
    }
}

/// The registry returns the peer address either at the top level or nested
/// under `data`; both shapes are accepted. An optional `port` field
/// overrides the well-known default.
pub(crate) fn parse_registry_response(body: &Value, default_port: u16) -> Option<PeerAddress> {
    let obj = body
        .get("data")
        .and_then(Value::as_object)
        .or_else(|| body.as_object())?;

    let ip = obj.get("ip").and_then(Value::as_str)?;
    let port = obj
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(default_port);

    PeerAddress::parse(ip, port).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_flat_response() {
        let body = json!({ "ip": "203.0.113.9" });
        let addr = parse_registry_response(&body, 8888).unwrap();
        assert_eq!(addr, PeerAddress::new("203.0.113.9", 8888));
    }

    #[test]
    fn accepts_nested_response() {
        let body = json!({ "data": { "ip": "203.0.113.9" } });
        let addr = parse_registry_response(&body, 8888).unwrap();
        assert_eq!(addr, PeerAddress::new("203.0.113.9", 8888));
    }

    #[test]
    fn nested_port_overrides_default() {
        let body = json!({ "data": { "ip": "203.0.113.9", "port": 9001 } });
        let addr = parse_registry_response(&body, 8888).unwrap();
        assert_eq!(addr.port, 9001);
    }

    #[test]
    fn rejects_missing_or_link_local_ip() {
        assert!(parse_registry_response(&json!({ "status": "ok" }), 8888).is_none());
        assert!(parse_registry_response(&json!({ "ip": "169.254.3.3" }), 8888).is_none());
        assert!(parse_registry_response(&json!(null), 8888).is_none());
    }
}
