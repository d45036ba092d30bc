//! Cross-node notification keys and payload codec.
//!
//! Gossip is best-effort, unordered, and lossy; every notification is
//! backstopped by the poller re-reading the catalog.

use std::time::Duration;

use thiserror::Error;

use crate::request::RequestId;

/// Prefix shared by all statement diagnostics gossip keys. Callbacks are
/// registered against the prefix; unknown keys underneath it are ignored
/// so newer versions can add keys without breaking older nodes.
pub const GOSSIP_KEY_PREFIX: &str = "stmt-diag";

/// A new request was inserted somewhere in the cluster.
pub const GOSSIP_REQUEST_KEY: &str = "stmt-diag-request";

/// A request was cancelled somewhere in the cluster.
pub const GOSSIP_CANCEL_KEY: &str = "stmt-diag-cancel";

pub type GossipCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Best-effort cluster pub/sub for small keyed payloads.
pub trait Gossip: Send + Sync {
    /// Registers `callback` for every key under `prefix`. The callback runs
    /// on the transport's thread and must never block.
    fn register_callback(&self, prefix: &'static str, callback: GossipCallback);

    /// Broadcasts `payload` under `key`. A zero `ttl` means
    /// broadcast-and-expire: deliver once, retain nothing.
    fn broadcast(&self, key: &'static str, payload: &[u8], ttl: Duration)
        -> Result<(), GossipError>;
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum GossipError {
    #[error("gossip transport unavailable: {message}")]
    Unavailable { message: String },
}

/// Encodes a request id as the 8-byte little-endian gossip payload.
pub fn encode_request_id(id: RequestId) -> [u8; 8] {
    (id.0 as u64).to_le_bytes()
}

/// Decodes a gossip payload; `None` unless it is exactly 8 bytes.
pub fn decode_request_id(payload: &[u8]) -> Option<RequestId> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(RequestId(u64::from_le_bytes(bytes) as i64))
}
