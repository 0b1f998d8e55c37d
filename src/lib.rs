//! CrownLink connection core: discovers the desktop receiver on the local
//! network, keeps a resilient TCP session to it, and relays throttled scroll
//! deltas from a wearable producer.

pub mod cache;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod session;
pub mod storage;

pub use config::Config;
pub use error::Error;
pub use peer::{DiscoverySource, PeerAddress};
pub use protocol::ScrollEvent;
pub use session::{SessionCoordinator, SessionHandle, SessionStatus};
pub use storage::{FileStore, MemoryStore, Store};
