//! Recognised configuration for the fabric (spec §6). A plain struct,
//! not a CLI surface: this crate is a library consumed by a larger
//! process, so config construction is the embedder's job.
//!
//! Grounded on the teacher's `Config` field set and defaults, stripped
//! of the `clap`/TOML-file loading surface that only made sense for a
//! standalone binary.

use std::time::Duration;

/// Tunables recognised by the connection fabric.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base period between heartbeats on one connection. Default ≈3s
    /// in production; tests typically use microseconds.
    pub heartbeat_interval: Duration,
    /// Per-ping deadline. `Duration::ZERO` means infinite (test-only).
    pub heartbeat_timeout: Duration,
    /// Lifetime of an offset sample in the remote-clock monitor.
    pub offset_ttl: Duration,
    /// A measured RTT above `mult × MaxOffset` disqualifies the sample.
    pub maximum_ping_duration_mult: u32,
    /// Enable Snappy compression on this endpoint. Must match the
    /// remote peer's setting or dialling fails (spec §4.1). Consulted by
    /// [`crate::Fabric::with_tcp_transport`] when building this crate's
    /// own transport; a caller supplying its own `RpcTransport` via
    /// [`crate::Fabric::new`] must honor this field itself.
    pub rpc_compression: bool,
    /// Opaque cluster identity carried on every `Ping` for
    /// defence-in-depth against cross-cluster talk.
    pub cluster_id: String,
    /// This node's own advertised address, sent to peers so their
    /// passive clock monitor can key samples back to us.
    pub local_node_addr: String,
}

impl Config {
    /// Production-shaped defaults; `cluster_id` and `local_node_addr`
    /// have no sane default and must always be set by the caller.
    pub fn new(cluster_id: impl Into<String>, local_node_addr: impl Into<String>) -> Self {
        let heartbeat_interval = Duration::from_secs(3);
        Self {
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * 2,
            offset_ttl: heartbeat_interval * 10,
            maximum_ping_duration_mult: 2,
            rpc_compression: true,
            cluster_id: cluster_id.into(),
            local_node_addr: local_node_addr.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_documented_ratios() {
        let config = Config::new("cluster-a", "node-a:9000");
        assert_eq!(config.heartbeat_timeout, config.heartbeat_interval * 2);
        assert_eq!(config.offset_ttl, config.heartbeat_interval * 10);
        assert_eq!(config.maximum_ping_duration_mult, 2);
        assert!(config.rpc_compression);
    }
}
