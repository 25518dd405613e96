//! Error types for the transport core.

use thiserror::Error;

/// Errors surfaced by the per-peer datapath and its collaborators.
///
/// Authentication and replay failures are silent on the wire (no response
/// datagram is ever produced); they are visible only here and through the
/// peer's counters.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Datagram failed MAC verification
    #[error("datagram failed authentication")]
    Unauth,
    /// Nonce already present in the replay window
    #[error("duplicate nonce {0}")]
    Duplicate(u64),
    /// Datagram shorter than the fixed framing, or inconsistent with it
    #[error("malformed datagram ({0} bytes)")]
    Malformed(usize),
    /// Per-key traffic budget spent; the host must rekey
    #[error("key traffic budget exhausted")]
    KeyExhausted,
    /// No authenticated inbound traffic within the liveness window
    #[error("peer timed out")]
    Timeout,
    /// Socket or TAP I/O failure; never retried internally
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}
