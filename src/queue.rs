//! Outbound coalescing/throttling queue. High-frequency channels are
//! last-write-wins: at most one pending message per logical channel, and a
//! minimum inter-send window governs how often a flush actually sends.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::protocol::{Channel, OutboundMessage};

/// What a flush attempt should do right now.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushDecision {
    /// Send these messages immediately (older same-channel entries already
    /// collapsed away).
    Send(Vec<OutboundMessage>),
    /// Inside the throttle window; arm a single trailing timer for this long.
    Defer(Duration),
    /// Nothing pending.
    Empty,
}

pub struct OutboundQueue {
    window: Duration,
    slots: BTreeMap<Channel, OutboundMessage>,
    last_send: Option<Instant>,
}

impl OutboundQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: BTreeMap::new(),
            last_send: None,
        }
    }

    /// Appends a message, dropping any older pending message on the same
    /// channel. Bounded staleness, bounded memory.
    pub fn enqueue(&mut self, message: OutboundMessage) {
        self.slots.insert(message.channel(), message);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Decides whether pending messages may go out at `now`. Draining marks
    /// the send time; a `Defer` leaves the queue untouched.
    pub fn flush(&mut self, now: Instant) -> FlushDecision {
        if self.slots.is_empty() {
            return FlushDecision::Empty;
        }
        if let Some(last) = self.last_send {
            let elapsed = now.duration_since(last);
            if elapsed < self.window {
                return FlushDecision::Defer(self.window - elapsed);
            }
        }
        self.last_send = Some(now);
        let drained = std::mem::take(&mut self.slots);
        FlushDecision::Send(drained.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> OutboundQueue {
        OutboundQueue::new(Duration::from_millis(16))
    }

    #[test]
    fn burst_collapses_to_last_payload() {
        let mut q = queue();
        for i in 0..20 {
            q.enqueue(OutboundMessage::scroll(f64::from(i)));
        }

        match q.flush(Instant::now()) {
            FlushDecision::Send(msgs) => {
                assert_eq!(msgs, vec![OutboundMessage::Scroll { pixels: 19 }]);
            }
            other => panic!("expected send, got {other:?}"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn second_flush_inside_window_defers_with_remainder() {
        let mut q = queue();
        let t0 = Instant::now();

        q.enqueue(OutboundMessage::scroll(1.0));
        assert!(matches!(q.flush(t0), FlushDecision::Send(_)));

        q.enqueue(OutboundMessage::scroll(2.0));
        let t1 = t0 + Duration::from_millis(10);
        match q.flush(t1) {
            FlushDecision::Defer(wait) => assert_eq!(wait, Duration::from_millis(6)),
            other => panic!("expected defer, got {other:?}"),
        }

        // Message is still pending and goes out once the window elapses.
        let t2 = t0 + Duration::from_millis(16);
        match q.flush(t2) {
            FlushDecision::Send(msgs) => {
                assert_eq!(msgs, vec![OutboundMessage::Scroll { pixels: 2 }]);
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn channels_do_not_collapse_into_each_other() {
        let mut q = queue();
        q.enqueue(OutboundMessage::scroll(5.0));
        q.enqueue(OutboundMessage::Heartbeat { t: 1.0 });
        q.enqueue(OutboundMessage::scroll(6.0));

        match q.flush(Instant::now()) {
            FlushDecision::Send(msgs) => {
                assert_eq!(msgs.len(), 2);
                assert!(msgs.contains(&OutboundMessage::Scroll { pixels: 6 }));
                assert!(msgs.contains(&OutboundMessage::Heartbeat { t: 1.0 }));
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn empty_queue_flushes_to_nothing() {
        let mut q = queue();
        assert_eq!(q.flush(Instant::now()), FlushDecision::Empty);
    }
}
