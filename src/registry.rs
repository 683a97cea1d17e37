//! Connection registry (component D): de-duplicates and caches live RPC
//! connections keyed by peer address, and owns the heartbeat loop bound
//! to each one (spec §3, §4.3).
//!
//! Grounded on the teacher's `state::ServerContext` (a `DashMap`-backed
//! shared table, one entry born per key, read and written across
//! tasks) and `tunnel::mod::run`'s pattern of spawning one long-lived
//! task per accepted/dialled connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::{watch, OnceCell};
use tracing::info;

use crate::clock::Clock;
use crate::error::Error;
use crate::health::HealthVerdict;
use crate::heartbeat_loop::{self, HeartbeatCb, HeartbeatLoopConfig};
use crate::remote_clock::RemoteClockMonitor;
use crate::transport::RpcTransport;

/// Fixed configuration shared by every connection this registry dials.
pub struct RegistryConfig {
    pub cluster_id: String,
    pub local_node_addr: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub maximum_ping_duration_mult: u32,
}

/// Diagnostic-only connection state (SPEC_FULL.md §3 supplement), mirroring
/// the teacher's `ServerContext` bundle of `node_id`/`reconnect_attempts`.
/// Never consulted for health or quorum decisions — purely for callers
/// that want to log or expose it.
#[derive(Default)]
pub struct ConnectionMetadata {
    /// The peer's self-reported advertised address, learned from its
    /// first successful `PingResponse`. `None` until that first success.
    pub remote_node_addr: ArcSwap<Option<String>>,
    /// Consecutive heartbeat failures since the last success; reset to
    /// zero on every successful heartbeat.
    pub reconnect_attempts: AtomicU32,
}

/// A point-in-time snapshot of a connection's diagnostic metadata.
#[derive(Debug, Clone)]
pub struct ConnectionDiagnostics {
    pub remote_node_addr: Option<String>,
    pub reconnect_attempts: u32,
}

struct ConnectionRecord {
    health: Arc<ArcSwap<HealthVerdict>>,
    metadata: Arc<ConnectionMetadata>,
    _heartbeat_task: tokio::task::JoinHandle<()>,
}

/// De-duplicated, process-lifetime-scoped table of peer connections
/// (spec invariant 2: "at most one connection record exists at any
/// instant" per address).
pub struct ConnectionRegistry {
    transport: Arc<dyn RpcTransport>,
    clock: Arc<dyn Clock>,
    monitor: Arc<RemoteClockMonitor>,
    config: RegistryConfig,
    shutdown: watch::Receiver<bool>,
    records: DashMap<String, Arc<OnceCell<Arc<ConnectionRecord>>>>,
}

impl ConnectionRegistry {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        clock: Arc<dyn Clock>,
        monitor: Arc<RemoteClockMonitor>,
        config: RegistryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            clock,
            monitor,
            config,
            shutdown,
            records: DashMap::new(),
        }
    }

    /// Idempotent dial (spec §4.3). The first caller for `addr` performs
    /// the handshake and spawns the heartbeat loop; concurrent and
    /// later callers join the same slot and observe the same outcome —
    /// `tokio::sync::OnceCell::get_or_try_init` collapses the race
    /// without a duplicate connection ever being created.
    ///
    /// If the process-wide quiesce signal fires while this call is in
    /// flight, only this caller is cancelled (`Error::Cancelled`) —
    /// `get_or_try_init`'s future is cancellation-safe, so a concurrent
    /// or later `dial` for the same address still completes the
    /// handshake normally.
    pub async fn dial(&self, addr: &str, heartbeat_cb: Option<HeartbeatCb>) -> Result<(), Error> {
        let slot = self
            .records
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            result = slot.get_or_try_init(|| self.establish(addr, heartbeat_cb)) => {
                result?;
                Ok(())
            }
            _ = shutdown.changed() => Err(Error::Cancelled),
        }
    }

    async fn establish(
        &self,
        addr: &str,
        heartbeat_cb: Option<HeartbeatCb>,
    ) -> Result<Arc<ConnectionRecord>, Error> {
        let connection = self.transport.dial(addr).await?;
        info!(addr, "dialled peer, spawning heartbeat loop");

        let loop_config = HeartbeatLoopConfig {
            heartbeat_interval: self.config.heartbeat_interval,
            heartbeat_timeout: self.config.heartbeat_timeout,
            maximum_ping_duration_mult: self.config.maximum_ping_duration_mult,
            cluster_id: self.config.cluster_id.clone(),
            local_node_addr: self.config.local_node_addr.clone(),
        };

        let metadata = Arc::new(ConnectionMetadata::default());

        let (health, task) = heartbeat_loop::spawn(
            addr.to_string(),
            connection,
            Arc::clone(&self.clock),
            Arc::clone(&self.monitor),
            Arc::clone(&metadata),
            loop_config,
            heartbeat_cb,
            self.shutdown.clone(),
        );

        Ok(Arc::new(ConnectionRecord {
            health,
            metadata,
            _heartbeat_task: task,
        }))
    }

    /// Never blocks (spec §4.3, §5). Returns `NotConnected` for
    /// addresses never passed to `dial`, `NotYetHeartbeated` for those
    /// whose dial either hasn't finished or whose first heartbeat
    /// hasn't completed, and the most recent heartbeat outcome
    /// thereafter.
    pub fn conn_health(&self, addr: &str) -> HealthVerdict {
        let Some(slot) = self.records.get(addr) else {
            return HealthVerdict::NotConnected;
        };
        match slot.get() {
            Some(record) => (**record.health.load()).clone(),
            None => HealthVerdict::NotYetHeartbeated,
        }
    }

    /// Fallible counterpart to [`ConnectionRegistry::conn_health`] for
    /// callers that want `?`-propagation instead of matching on
    /// [`HealthVerdict`] themselves (spec §6's externally-surfaced
    /// `NotConnected`/`NotHeartbeated` errors). Never blocks.
    pub fn require_healthy(&self, addr: &str) -> Result<(), Error> {
        match self.conn_health(addr) {
            HealthVerdict::Healthy => Ok(()),
            HealthVerdict::NotConnected => Err(Error::NotConnected(addr.to_string())),
            HealthVerdict::NotYetHeartbeated => Err(Error::NotHeartbeated(addr.to_string())),
            HealthVerdict::Unhealthy { cause } => Err(Error::FailedHeartbeat {
                addr: addr.to_string(),
                cause,
            }),
        }
    }

    /// Diagnostic-only snapshot of a connection's metadata (SPEC_FULL.md
    /// §3 supplement); `None` for addresses never dialled, or whose dial
    /// hasn't finished yet. Never blocks.
    pub fn connection_diagnostics(&self, addr: &str) -> Option<ConnectionDiagnostics> {
        let slot = self.records.get(addr)?;
        let record = slot.get()?;
        Some(ConnectionDiagnostics {
            remote_node_addr: (**record.metadata.remote_node_addr.load()).clone(),
            reconnect_attempts: record.metadata.reconnect_attempts.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::wire::{PingRequest, PingResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingTransport {
        dial_count: AtomicUsize,
    }

    struct NoopConnection;

    #[async_trait]
    impl crate::transport::RpcConnection for NoopConnection {
        async fn ping(&self, req: PingRequest, _timeout: Duration) -> Result<PingResponse, Error> {
            Ok(PingResponse {
                pong: req.ping,
                server_time_nanos: 0,
                responder_addr: "peer:1".into(),
            })
        }
    }

    #[async_trait]
    impl RpcTransport for CountingTransport {
        async fn dial(&self, _addr: &str) -> Result<Arc<dyn crate::transport::RpcConnection>, Error> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopConnection))
        }
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            cluster_id: "cluster-a".into(),
            local_node_addr: "self:1".into(),
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(5),
            maximum_ping_duration_mult: 2,
        }
    }

    #[tokio::test]
    async fn never_dialled_address_reports_not_connected() {
        let transport = Arc::new(CountingTransport {
            dial_count: AtomicUsize::new(0),
        });
        let clock: Arc<dyn Clock> = FakeClock::new(0, Duration::from_millis(500));
        let monitor = Arc::new(RemoteClockMonitor::new(Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);
        let registry = ConnectionRegistry::new(transport, clock, monitor, config(), rx);

        assert!(matches!(
            registry.conn_health("never-dialled:1"),
            HealthVerdict::NotConnected
        ));
    }

    #[tokio::test]
    async fn require_healthy_maps_every_verdict_to_a_matchable_error() {
        let transport = Arc::new(CountingTransport {
            dial_count: AtomicUsize::new(0),
        });
        let clock: Arc<dyn Clock> = FakeClock::new(0, Duration::from_millis(500));
        let monitor = Arc::new(RemoteClockMonitor::new(Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);
        let registry = ConnectionRegistry::new(transport, clock, monitor, config(), rx);

        assert!(matches!(
            registry.require_healthy("never-dialled:1").unwrap_err(),
            Error::NotConnected(addr) if addr == "never-dialled:1"
        ));

        registry.dial("peer:1", None).await.unwrap();
        assert!(matches!(
            registry.require_healthy("peer:1").unwrap_err(),
            Error::NotHeartbeated(addr) if addr == "peer:1"
        ));
    }

    /// A transport whose `dial` never resolves, so cancellation via
    /// quiesce is the only way a `dial()` call against it can complete.
    struct HangingTransport;

    #[async_trait]
    impl RpcTransport for HangingTransport {
        async fn dial(&self, _addr: &str) -> Result<Arc<dyn crate::transport::RpcConnection>, Error> {
            std::future::pending::<()>().await;
            unreachable!("never resolves")
        }
    }

    #[tokio::test]
    async fn dial_is_cancelled_by_quiesce_without_poisoning_the_slot() {
        let transport = Arc::new(HangingTransport);
        let clock: Arc<dyn Clock> = FakeClock::new(0, Duration::from_millis(500));
        let monitor = Arc::new(RemoteClockMonitor::new(Duration::from_secs(60)));
        let (tx, rx) = watch::channel(false);
        let registry = Arc::new(ConnectionRegistry::new(transport, clock, monitor, config(), rx));

        let registry_task = Arc::clone(&registry);
        let handle = tokio::spawn(async move { registry_task.dial("peer:1", None).await });

        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn dial_is_idempotent_and_concurrent_callers_share_one_handshake() {
        let transport = Arc::new(CountingTransport {
            dial_count: AtomicUsize::new(0),
        });
        let dial_count_handle = Arc::clone(&transport);
        let clock: Arc<dyn Clock> = FakeClock::new(0, Duration::from_millis(500));
        let monitor = Arc::new(RemoteClockMonitor::new(Duration::from_secs(60)));
        let (_tx, rx) = watch::channel(false);
        let registry = Arc::new(ConnectionRegistry::new(transport, clock, monitor, config(), rx));

        let r1 = Arc::clone(&registry);
        let r2 = Arc::clone(&registry);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.dial("peer:1", None).await }),
            tokio::spawn(async move { r2.dial("peer:1", None).await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        assert_eq!(dial_count_handle.dial_count.load(Ordering::SeqCst), 1);
        assert!(!matches!(
            registry.conn_health("peer:1"),
            HealthVerdict::NotConnected
        ));
    }
}
