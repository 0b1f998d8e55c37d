//! Wire frames: one compact JSON object per newline-terminated line.
//! Control schema is `{"a": <action code>, ...}`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::error::Error;

pub const ACTION_SCROLL: u8 = 1;
pub const ACTION_HEARTBEAT: u8 = 3;

/// A scroll sample from the wearable producer. Pixel deltas are floats at
/// the sampling site and rounded to integers at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollEvent {
    pub pixels: f64,
    pub timestamp: f64,
}

impl ScrollEvent {
    pub fn new(pixels: f64) -> Self {
        Self {
            pixels,
            timestamp: unix_now(),
        }
    }
}

/// Logical channel a message belongs to. The outbound queue keeps at most
/// one pending message per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Channel {
    Scroll,
    Control,
    Raw,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Scroll { pixels: i64 },
    Heartbeat { t: f64 },
    /// Generic passthrough from the wearable side, already JSON.
    Raw(Value),
}

impl OutboundMessage {
    pub fn scroll(pixels: f64) -> Self {
        OutboundMessage::Scroll {
            pixels: pixels.round() as i64,
        }
    }

    pub fn heartbeat() -> Self {
        OutboundMessage::Heartbeat { t: unix_now() }
    }

    pub fn channel(&self) -> Channel {
        match self {
            OutboundMessage::Scroll { .. } => Channel::Scroll,
            OutboundMessage::Heartbeat { .. } => Channel::Control,
            OutboundMessage::Raw(_) => Channel::Raw,
        }
    }

    /// Encodes to a newline-terminated frame. A frame must never contain an
    /// unescaped newline; serde_json escapes newlines inside strings, but
    /// raw passthrough payloads are still checked.
    pub fn encode(&self) -> Result<String, Error> {
        let value = match self {
            OutboundMessage::Scroll { pixels } => json!({ "a": ACTION_SCROLL, "p": pixels }),
            OutboundMessage::Heartbeat { t } => json!({ "a": ACTION_HEARTBEAT, "t": t }),
            OutboundMessage::Raw(v) => v.clone(),
        };
        let mut line = serde_json::to_string(&value)?;
        if line.contains('\n') {
            return Err(Error::FrameContainsNewline);
        }
        line.push('\n');
        Ok(line)
    }
}

/// Decodes one inbound line. Malformed frames are dropped by the caller;
/// a decode failure is never fatal to the connection.
pub fn decode_frame(line: &str) -> Result<Value, Error> {
    Ok(serde_json::from_str(line)?)
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_rounds_to_integer_pixels() {
        assert_eq!(OutboundMessage::scroll(42.7), OutboundMessage::Scroll { pixels: 43 });
        assert_eq!(OutboundMessage::scroll(-3.2), OutboundMessage::Scroll { pixels: -3 });
    }

    #[test]
    fn scroll_frame_shape() {
        let line = OutboundMessage::scroll(42.7).encode().unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v, json!({ "a": 1, "p": 43 }));
    }

    #[test]
    fn heartbeat_frame_shape() {
        let line = OutboundMessage::Heartbeat { t: 123.5 }.encode().unwrap();
        let v: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v, json!({ "a": 3, "t": 123.5 }));
    }

    #[test]
    fn raw_frame_with_embedded_newline_is_escaped_not_split() {
        let msg = OutboundMessage::Raw(json!({ "a": 9, "note": "two\nlines" }));
        let line = msg.encode().unwrap();
        // Exactly one terminator: the delimiter we appended.
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_frame("{not json").is_err());
        assert!(decode_frame(r#"{"action":"statusResponse"}"#).is_ok());
    }
}
