//! One persistent TCP connection to the resolved peer: connect/timeout/
//! retry state machine, heartbeat, and a newline-framed JSON receive loop.
//!
//! The manager itself never blocks; connects, reads and writes run as
//! spawned tasks whose completions come back through the session's event
//! channel tagged with an attempt epoch. Events from a cancelled attempt
//! carry a stale epoch and are discarded.

use std::cmp;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, RetryConfig};
use crate::error::FailureKind;
use crate::peer::PeerAddress;
use crate::protocol::{decode_frame, OutboundMessage};
use crate::queue::{FlushDecision, OutboundQueue};

const MAX_FRAME_LEN: usize = 64 * 1024;
const WRITER_BUFFER: usize = 64;

/// Two peer closes within this window count as flapping and take the
/// backoff path instead of another zero-delay reconnect.
const CLOSE_THROTTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Waiting,
    Failed,
    Cancelled,
}

/// Bounded exponential backoff: `min(base * 2^(attempts-1), cap)`.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    attempts: u32,
    config: RetryConfig,
}

impl RetryBudget {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            attempts: 0,
            config,
        }
    }

    /// Consumes one attempt; `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        let factor = 1u32 << (self.attempts - 1).min(31);
        Some(cmp::min(self.config.base_delay * factor, self.config.max_delay))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }
}

/// Completions marshaled back onto the session loop.
#[derive(Debug)]
pub enum ConnEvent {
    Ready { epoch: u64 },
    Failed { epoch: u64, kind: FailureKind, detail: String },
    ConnectTimeout { epoch: u64 },
    Closed { epoch: u64, error: Option<String> },
    Frame { epoch: u64, line: String },
    RetryFire { epoch: u64 },
    HeartbeatTick { epoch: u64 },
    FlushTick { epoch: u64 },
}

impl ConnEvent {
    fn epoch(&self) -> u64 {
        match self {
            ConnEvent::Ready { epoch }
            | ConnEvent::Failed { epoch, .. }
            | ConnEvent::ConnectTimeout { epoch }
            | ConnEvent::Closed { epoch, .. }
            | ConnEvent::Frame { epoch, .. }
            | ConnEvent::RetryFire { epoch }
            | ConnEvent::HeartbeatTick { epoch }
            | ConnEvent::FlushTick { epoch } => *epoch,
        }
    }
}

/// What the coordinator needs to know about a handled event.
#[derive(Debug)]
pub enum Signal {
    Connected(PeerAddress),
    /// Decoded inbound frame, to be forwarded to the wearable side.
    Frame(Value),
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    RetriesExhausted,
    /// Host unreachable / network down: the coordinator decides between
    /// rediscovery (auto mode) and local backoff (manual mode).
    Unreachable { detail: String },
    PeerClosed,
    Reconnecting { attempt: u32 },
}

pub struct ConnectionManager {
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    state: ConnectionState,
    address: Option<PeerAddress>,
    epoch: u64,
    events_tx: mpsc::Sender<ConnEvent>,
    writer_tx: Option<mpsc::Sender<String>>,
    queue: OutboundQueue,
    budget: RetryBudget,
    link_task: Option<JoinHandle<()>>,
    timeout_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    flush_task: Option<JoinHandle<()>>,
    last_receive: Option<Instant>,
    last_close: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(config: &Config, events_tx: mpsc::Sender<ConnEvent>) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            state: ConnectionState::Idle,
            address: None,
            epoch: 0,
            events_tx,
            writer_tx: None,
            queue: OutboundQueue::new(config.send_window),
            budget: RetryBudget::new(config.retry.clone()),
            link_task: None,
            timeout_task: None,
            retry_task: None,
            heartbeat_task: None,
            flush_task: None,
            last_receive: None,
            last_close: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn retry_attempts(&self) -> u32 {
        self.budget.attempts()
    }

    /// No receive for longer than `threshold` while nominally connected.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.state == ConnectionState::Connected
            && self
                .last_receive
                .map(|t| t.elapsed() > threshold)
                .unwrap_or(true)
    }

    /// Starts a connection attempt. No-op when already connected or
    /// connecting to the same address.
    pub fn connect(&mut self, address: PeerAddress) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) && self.address.as_ref() == Some(&address)
        {
            tracing::debug!("already {:?} to {}, ignoring connect", self.state, address);
            return;
        }

        self.finish_attempt();
        abort(&mut self.retry_task);
        self.address = Some(address.clone());
        self.state = ConnectionState::Connecting;
        tracing::info!("connecting to {}", address);

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_BUFFER);
        self.writer_tx = Some(writer_tx);

        let epoch = self.epoch;
        let events = self.events_tx.clone();
        self.link_task = Some(tokio::spawn(run_link(address, epoch, events, writer_rx)));

        let epoch = self.epoch;
        let events = self.events_tx.clone();
        let timeout = self.connect_timeout;
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(ConnEvent::ConnectTimeout { epoch }).await;
        }));
    }

    /// Cancels everything and returns to Idle. Safe to call from any state;
    /// calling it again while Idle has no further effect.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Idle && self.link_task.is_none() {
            return;
        }
        tracing::info!(
            "disconnecting from {}",
            self.address
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<none>".to_string())
        );
        self.finish_attempt();
        abort(&mut self.retry_task);
        self.address = None;
        self.state = ConnectionState::Idle;
        self.budget.reset();
        self.last_receive = None;
        self.last_close = None;
    }

    /// Tears down the current link and dials the same address again,
    /// bypassing the connected no-op check. Used for health-triggered
    /// reconnects and peer-initiated closes.
    pub fn reconnect_current(&mut self) {
        let Some(address) = self.address.clone() else {
            return;
        };
        self.finish_attempt();
        self.state = ConnectionState::Cancelled;
        self.connect(address);
    }

    /// Explicit reconnect / override change: the budget starts over.
    pub fn reset_budget(&mut self) {
        self.budget.reset();
    }

    /// Queues an outbound message; sends immediately (subject to the
    /// throttle window) when connected. The caller is responsible for
    /// opportunistically triggering reconnect when not connected.
    pub fn enqueue(&mut self, message: OutboundMessage) {
        self.queue.enqueue(message);
        if self.state == ConnectionState::Connected {
            self.flush();
        }
    }

    /// Arms the backoff timer for the next attempt against the current
    /// address. `None` means the budget is exhausted.
    pub fn schedule_retry(&mut self) -> Option<(u32, Duration)> {
        let Some(delay) = self.budget.next_delay() else {
            self.state = ConnectionState::Failed;
            tracing::warn!("retry budget exhausted");
            return None;
        };
        self.state = ConnectionState::Waiting;

        abort(&mut self.retry_task);
        let epoch = self.epoch;
        let events = self.events_tx.clone();
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ConnEvent::RetryFire { epoch }).await;
        }));

        let attempt = self.budget.attempts();
        tracing::info!(
            "scheduling retry {}/{} in {:?}",
            attempt,
            self.budget.max_attempts(),
            delay
        );
        Some((attempt, delay))
    }

    /// Applies one completion event. Stale-epoch events are discarded.
    pub fn handle(&mut self, event: ConnEvent) -> Option<Signal> {
        if event.epoch() != self.epoch {
            tracing::trace!("dropping stale event {:?}", event);
            return None;
        }

        match event {
            ConnEvent::Ready { .. } => {
                if self.state != ConnectionState::Connecting {
                    return None;
                }
                abort(&mut self.timeout_task);
                self.state = ConnectionState::Connected;
                self.budget.reset();
                self.last_receive = Some(Instant::now());
                self.start_heartbeat();
                self.flush();
                let address = self.address.clone()?;
                tracing::info!("connected to {}", address);
                Some(Signal::Connected(address))
            }

            ConnEvent::Failed { kind, detail, .. } => {
                tracing::warn!("connection failed ({:?}): {}", kind, detail);
                self.finish_attempt();
                self.state = ConnectionState::Failed;
                match kind {
                    FailureKind::Unreachable => Some(Signal::Unreachable { detail }),
                    _ => self.retry_signal(),
                }
            }

            ConnEvent::ConnectTimeout { .. } => {
                if self.state != ConnectionState::Connecting {
                    return None;
                }
                tracing::warn!("connection attempt timed out");
                self.finish_attempt();
                self.state = ConnectionState::Failed;
                self.retry_signal()
            }

            ConnEvent::Closed { error, .. } => {
                if self.state != ConnectionState::Connected {
                    return None;
                }
                match &error {
                    Some(e) => tracing::warn!("connection closed: {}", e),
                    None => tracing::info!("peer closed the connection"),
                }
                self.finish_attempt();
                self.state = ConnectionState::Failed;
                let flapping = self
                    .last_close
                    .map(|t| t.elapsed() < CLOSE_THROTTLE)
                    .unwrap_or(false);
                self.last_close = Some(Instant::now());
                if flapping {
                    // A peer that accepts and drops in a tight loop would
                    // otherwise reconnect with zero delay forever.
                    return self.retry_signal();
                }
                // Peer-initiated close is expected server behavior, not a
                // fault: one immediate reconnect, no backoff.
                if let Some(address) = self.address.clone() {
                    self.connect(address);
                }
                Some(Signal::PeerClosed)
            }

            ConnEvent::Frame { line, .. } => {
                if self.state != ConnectionState::Connected {
                    return None;
                }
                self.last_receive = Some(Instant::now());
                match decode_frame(&line) {
                    Ok(value) => Some(Signal::Frame(value)),
                    Err(e) => {
                        // Malformed frame: drop it, keep the loop alive.
                        tracing::warn!("dropping undecodable frame: {}", e);
                        None
                    }
                }
            }

            ConnEvent::RetryFire { .. } => {
                if self.state != ConnectionState::Waiting {
                    return None;
                }
                let address = self.address.clone()?;
                let attempt = self.budget.attempts();
                self.connect(address);
                Some(Signal::Reconnecting { attempt })
            }

            ConnEvent::HeartbeatTick { .. } => {
                if self.state == ConnectionState::Connected {
                    self.enqueue(OutboundMessage::heartbeat());
                }
                None
            }

            ConnEvent::FlushTick { .. } => {
                if self.state == ConnectionState::Connected {
                    self.flush();
                }
                None
            }
        }
    }

    fn retry_signal(&mut self) -> Option<Signal> {
        match self.schedule_retry() {
            Some((attempt, delay)) => Some(Signal::Retrying {
                attempt,
                max_attempts: self.budget.max_attempts(),
                delay,
            }),
            None => Some(Signal::RetriesExhausted),
        }
    }

    fn flush(&mut self) {
        match self.queue.flush(Instant::now().into_std()) {
            FlushDecision::Send(messages) => {
                for message in messages {
                    let line = match message.encode() {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!("failed to encode outbound message: {}", e);
                            continue;
                        }
                    };
                    if let Some(writer) = &self.writer_tx {
                        // Best effort: a full writer buffer means the link is
                        // backed up, and newer data supersedes this anyway.
                        if let Err(e) = writer.try_send(line) {
                            tracing::warn!("dropping outbound frame: {}", e);
                        }
                    }
                }
            }
            FlushDecision::Defer(wait) => {
                abort(&mut self.flush_task);
                let epoch = self.epoch;
                let events = self.events_tx.clone();
                self.flush_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = events.send(ConnEvent::FlushTick { epoch }).await;
                }));
            }
            FlushDecision::Empty => {}
        }
    }

    fn start_heartbeat(&mut self) {
        abort(&mut self.heartbeat_task);
        let epoch = self.epoch;
        let events = self.events_tx.clone();
        let interval = self.heartbeat_interval;
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if events.send(ConnEvent::HeartbeatTick { epoch }).await.is_err() {
                    return;
                }
            }
        }));
    }

    /// Tears down the in-flight attempt/link and invalidates its epoch.
    /// Does not touch the retry timer; that belongs to the next attempt.
    fn finish_attempt(&mut self) {
        abort(&mut self.link_task);
        abort(&mut self.timeout_task);
        abort(&mut self.heartbeat_task);
        abort(&mut self.flush_task);
        self.writer_tx = None;
        self.epoch += 1;
    }

}

/// Cancels a named timer/task slot before it is rearmed.
fn abort(slot: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Dials the peer, then owns the receive loop for the life of the link.
/// The write half runs as a sibling task fed by `writer_rx`.
async fn run_link(
    address: PeerAddress,
    epoch: u64,
    events: mpsc::Sender<ConnEvent>,
    writer_rx: mpsc::Receiver<String>,
) {
    match TcpStream::connect((address.host.as_str(), address.port)).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            tokio::spawn(write_loop(write_half, writer_rx, events.clone(), epoch));
            if events.send(ConnEvent::Ready { epoch }).await.is_err() {
                return;
            }
            read_loop(read_half, events, epoch).await;
        }
        Err(e) => {
            let kind = FailureKind::classify(&e);
            let _ = events
                .send(ConnEvent::Failed {
                    epoch,
                    kind,
                    detail: e.to_string(),
                })
                .await;
        }
    }
}

async fn read_loop(read_half: OwnedReadHalf, events: mpsc::Sender<ConnEvent>, epoch: u64) {
    let codec = tokio_util::codec::LinesCodec::new_with_max_length(MAX_FRAME_LEN);
    let mut frames = tokio_util::codec::FramedRead::new(read_half, codec);
    while let Some(item) = frames.next().await {
        match item {
            Ok(line) => {
                if events.send(ConnEvent::Frame { epoch, line }).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events
                    .send(ConnEvent::Closed {
                        epoch,
                        error: Some(e.to_string()),
                    })
                    .await;
                return;
            }
        }
    }
    // End of stream: the peer hung up.
    let _ = events.send(ConnEvent::Closed { epoch, error: None }).await;
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<ConnEvent>,
    epoch: u64,
) {
    while let Some(line) = writer_rx.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            let _ = events
                .send(ConnEvent::Closed {
                    epoch,
                    error: Some(e.to_string()),
                })
                .await;
            return;
        }
    }
}
