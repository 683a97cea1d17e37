//! Inter-node RPC connection fabric: authenticated, long-lived RPC
//! connections between peer nodes, continuously heartbeated for
//! liveness, with heartbeats doubling as a side channel for measuring
//! relative clock offsets and gating on a cluster-wide quorum.
//!
//! Five pieces, leaves first: [`compress`] (a pluggable symmetric
//! codec), [`heartbeat_service`] (the server-side `Ping` handler),
//! [`remote_clock`] (per-peer offset samples plus the quorum gate),
//! [`registry`] (de-duplicated, cached peer connections), and
//! [`heartbeat_loop`] (the per-connection ping driver tying the other
//! four together). [`wire`], [`tls`], [`transport`] and [`server`] are
//! a concrete RPC substrate this crate ships so the above can be
//! exercised end-to-end; a deployment with its own RPC framework can
//! implement [`transport::RpcTransport`]/[`transport::RpcConnection`]
//! directly and skip them.

pub mod clock;
pub mod compress;
pub mod config;
pub mod error;
pub mod health;
pub mod heartbeat_loop;
pub mod heartbeat_service;
pub mod registry;
pub mod remote_clock;
pub mod server;
pub mod tls;
pub mod transport;
pub mod wire;

use std::sync::Arc;

use tokio::sync::watch;
use tokio_rustls::TlsConnector;

pub use clock::Clock;
pub use config::Config;
pub use error::Error;
pub use health::HealthVerdict;
pub use heartbeat_loop::HeartbeatCb;

use heartbeat_service::DefaultPingService;
use registry::{ConnectionDiagnostics, ConnectionRegistry, RegistryConfig};
use remote_clock::RemoteClockMonitor;
use transport::{RpcTransport, TcpRpcTransport};

/// The fully assembled fabric: a connection registry and the remote
/// clock monitor it feeds, wired from one [`Config`].
///
/// This is the crate's top-level entry point; most callers only need
/// [`Fabric::dial`], [`Fabric::conn_health`], and
/// [`Fabric::verify_clock_offset`].
pub struct Fabric {
    registry: ConnectionRegistry,
    monitor: Arc<RemoteClockMonitor>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl Fabric {
    /// Assemble a fabric over `transport` (the dial-side RPC
    /// collaborator) using `clock` as the hybrid-logical clock
    /// collaborator. `shutdown` is the process-wide quiesce signal
    /// every heartbeat loop observes between ticks.
    ///
    /// `transport` is taken pre-built, so a caller supplying their own
    /// `RpcTransport` is responsible for honoring `config.rpc_compression`
    /// themselves; callers who want this crate's own TCP+mTLS transport
    /// wired to `rpc_compression` automatically should use
    /// [`Fabric::with_tcp_transport`] instead.
    pub fn new(
        config: Config,
        transport: Arc<dyn RpcTransport>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let monitor = Arc::new(RemoteClockMonitor::new(config.offset_ttl));
        let registry_config = RegistryConfig {
            cluster_id: config.cluster_id.clone(),
            local_node_addr: config.local_node_addr.clone(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            maximum_ping_duration_mult: config.maximum_ping_duration_mult,
        };
        let registry = ConnectionRegistry::new(
            transport,
            Arc::clone(&clock),
            Arc::clone(&monitor),
            registry_config,
            shutdown,
        );
        Self {
            registry,
            monitor,
            clock,
            config,
        }
    }

    /// Assemble a fabric over this crate's own TCP+mTLS transport
    /// (`TcpRpcTransport`), wiring `config.rpc_compression` into it so
    /// the recognised option actually governs whether this fabric's
    /// outbound connections advertise and use Snappy compression (spec
    /// §4.1, §6).
    pub fn with_tcp_transport(
        config: Config,
        connector: TlsConnector,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let transport: Arc<dyn RpcTransport> =
            Arc::new(TcpRpcTransport::new(connector, config.rpc_compression));
        Self::new(config, transport, clock, shutdown)
    }

    /// Build the server-side `Ping` handler for this fabric's cluster
    /// ID, advertised address, and clock, sharing this fabric's monitor
    /// so passive samples from inbound pings land in the same place as
    /// the active ones this fabric's own heartbeat loops record.
    pub fn ping_service(&self) -> Arc<DefaultPingService> {
        Arc::new(DefaultPingService::new(
            self.config.cluster_id.clone(),
            self.config.local_node_addr.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.monitor),
            self.config.maximum_ping_duration_mult,
        ))
    }

    /// Idempotent dial (spec §4.3). See [`ConnectionRegistry::dial`].
    pub async fn dial(&self, addr: &str, heartbeat_cb: Option<HeartbeatCb>) -> Result<(), Error> {
        self.registry.dial(addr, heartbeat_cb).await
    }

    /// Never blocks. See [`ConnectionRegistry::conn_health`].
    pub fn conn_health(&self, addr: &str) -> HealthVerdict {
        self.registry.conn_health(addr)
    }

    /// Diagnostic-only connection metadata (SPEC_FULL.md §3 supplement).
    /// Never blocks. See [`ConnectionRegistry::connection_diagnostics`].
    pub fn connection_diagnostics(&self, addr: &str) -> Option<ConnectionDiagnostics> {
        self.registry.connection_diagnostics(addr)
    }

    /// Fallible counterpart to [`Fabric::conn_health`]. Never blocks. See
    /// [`ConnectionRegistry::require_healthy`].
    pub fn require_healthy(&self, addr: &str) -> Result<(), Error> {
        self.registry.require_healthy(addr)
    }

    /// The cluster-wide offset quorum gate (spec §4.6). `Err` is fatal:
    /// callers are expected to treat it as grounds to crash the node.
    pub fn verify_clock_offset(&self) -> Result<(), Error> {
        self.monitor.verify_clock_offset(self.clock.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::wire::{PingRequest, PingResponse};
    use async_trait::async_trait;
    use std::time::Duration;

    struct LoopbackConnection;

    #[async_trait]
    impl transport::RpcConnection for LoopbackConnection {
        async fn ping(&self, req: PingRequest, _timeout: Duration) -> Result<PingResponse, Error> {
            Ok(PingResponse {
                pong: req.ping,
                server_time_nanos: req.offset_nanos,
                responder_addr: "peer:1".into(),
            })
        }
    }

    struct LoopbackTransport;

    #[async_trait]
    impl RpcTransport for LoopbackTransport {
        async fn dial(&self, _addr: &str) -> Result<Arc<dyn transport::RpcConnection>, Error> {
            Ok(Arc::new(LoopbackConnection))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dial_reaches_healthy_and_surfaces_diagnostics() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let mut config = Config::new("cluster-a", "self:1");
        config.heartbeat_interval = Duration::from_millis(1);
        let interval = config.heartbeat_interval;
        let clock: Arc<dyn Clock> = FakeClock::new(0, Duration::from_millis(500));
        let (_tx, shutdown) = watch::channel(false);
        let fabric = Fabric::new(config, Arc::new(LoopbackTransport), clock, shutdown);

        assert!(matches!(
            fabric.conn_health("peer:1"),
            HealthVerdict::NotConnected
        ));

        fabric.dial("peer:1", None).await.unwrap();

        // Drive virtual time instead of sleeping on the wall clock
        // (SPEC_FULL.md's ambient test-tooling section).
        for _ in 0..20 {
            tokio::time::advance(interval).await;
            tokio::task::yield_now().await;
            if fabric.conn_health("peer:1").is_healthy() {
                break;
            }
        }
        assert!(fabric.conn_health("peer:1").is_healthy());

        let diagnostics = fabric
            .connection_diagnostics("peer:1")
            .expect("dialled connection has diagnostics");
        assert_eq!(diagnostics.remote_node_addr.as_deref(), Some("peer:1"));
        assert_eq!(diagnostics.reconnect_attempts, 0);

        assert!(fabric.verify_clock_offset().is_ok());
    }
}
