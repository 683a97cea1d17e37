//! Error kinds surfaced by the connection fabric.
//!
//! Transport, timeout, and cluster-mismatch errors are normally absorbed
//! into a [`crate::health::HealthVerdict`] rather than propagated (see
//! `heartbeat_loop`); they appear here so callers that *do* observe them
//! directly (e.g. `Dial` failing outright) get a stable, matchable type.

/// Errors produced by this crate's public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TLS handshake or TCP connect failed during `Dial`.
    #[error("dial {addr}: transport error: {source}")]
    Transport {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    /// A `Ping` call did not complete within `heartbeat_timeout`.
    #[error("ping {addr}: timed out after {elapsed_ms}ms")]
    Timeout { addr: String, elapsed_ms: u64 },

    /// The peer rejected our cluster ID (or we rejected theirs).
    #[error("cluster ID mismatch with {addr}: local={local} remote={remote}")]
    ClusterMismatch {
        addr: String,
        local: String,
        remote: String,
    },

    /// `VerifyClockOffset` found a majority of live peer samples outside
    /// `MaxOffset` — the caller is expected to treat this as fatal.
    #[error("clock offset exceeds MaxOffset relative to {offending}/{live} live peers")]
    OffsetAnomaly { offending: usize, live: usize },

    /// The process-wide quiesce signal fired while an operation was in
    /// flight.
    #[error("cancelled")]
    Cancelled,

    /// A compressed payload failed to decode.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// `ConnHealth`/`Dial` queried an address never passed to `Dial`.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Dialled, but no heartbeat has completed yet.
    #[error("not yet heartbeated: {0}")]
    NotHeartbeated(String),

    /// The most recent heartbeat to this address failed.
    #[error("heartbeat failed for {addr}: {cause}")]
    FailedHeartbeat { addr: String, cause: String },
}

/// Errors from the Snappy-framed compressor/decompressor.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("snappy encode failed: {0}")]
    Encode(#[source] std::io::Error),
    #[error("snappy decode failed: {0}")]
    Decode(#[source] std::io::Error),
    #[error("peer does not support compression but rpc_compression is enabled locally")]
    PeerUnsupported,
}
