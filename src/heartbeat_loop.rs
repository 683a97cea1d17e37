//! Heartbeat loop (component E): one task per connection, driving
//! `Ping` on a fixed interval, feeding Cristian's algorithm into the
//! remote-clock monitor, and publishing a health verdict (spec §4.4,
//! §4.5).
//!
//! Grounded on the teacher's `tunnel::heartbeat::spawn` (interval tick
//! racing a shutdown `watch::Receiver` inside `tokio::select!`, with an
//! inner value re-read each tick so runtime config changes take effect
//! without restarting the task).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::health::HealthVerdict;
use crate::registry::ConnectionMetadata;
use crate::remote_clock::{OffsetSample, RemoteClockMonitor};
use crate::transport::RpcConnection;
use crate::wire::PingRequest;

/// One-shot callback invoked the first time a connection's heartbeat
/// ever succeeds (spec §4.4: "used by callers to await the connection
/// being actually usable").
pub type HeartbeatCb = Box<dyn FnOnce() + Send>;

/// Parameters a heartbeat loop needs beyond the connection itself.
pub struct HeartbeatLoopConfig {
    pub heartbeat_interval: Duration,
    /// `0` (i.e. `Duration::ZERO`) means infinite — test-only per spec §6.
    pub heartbeat_timeout: Duration,
    pub maximum_ping_duration_mult: u32,
    pub cluster_id: String,
    pub local_node_addr: String,
}

/// Spawn the heartbeat loop for `addr`/`connection`. Returns the shared
/// health cell the registry reads from and the task's `JoinHandle`,
/// which the registry keeps alive for the life of the connection record
/// (spec invariant 1: "exactly one heartbeat loop exists and runs until
/// the process quiesces").
pub fn spawn(
    addr: String,
    connection: Arc<dyn RpcConnection>,
    clock: Arc<dyn Clock>,
    monitor: Arc<RemoteClockMonitor>,
    metadata: Arc<ConnectionMetadata>,
    config: HeartbeatLoopConfig,
    heartbeat_cb: Option<HeartbeatCb>,
    shutdown: watch::Receiver<bool>,
) -> (Arc<ArcSwap<HealthVerdict>>, tokio::task::JoinHandle<()>) {
    let health = Arc::new(ArcSwap::new(Arc::new(HealthVerdict::NotYetHeartbeated)));
    let health_for_task = Arc::clone(&health);

    let handle = tokio::spawn(run(
        addr,
        connection,
        clock,
        monitor,
        metadata,
        config,
        heartbeat_cb,
        health_for_task,
        shutdown,
    ));

    (health, handle)
}

async fn run(
    addr: String,
    connection: Arc<dyn RpcConnection>,
    clock: Arc<dyn Clock>,
    monitor: Arc<RemoteClockMonitor>,
    metadata: Arc<ConnectionMetadata>,
    config: HeartbeatLoopConfig,
    heartbeat_cb: Option<HeartbeatCb>,
    health: Arc<ArcSwap<HealthVerdict>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut heartbeat_cb = heartbeat_cb;
    let first_success = AtomicBool::new(false);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.heartbeat_interval) => {}
            _ = shutdown.changed() => {
                debug!(addr, "heartbeat loop quiescing");
                return;
            }
        }

        match tick(&addr, &connection, clock.as_ref(), &monitor, &metadata, &config).await {
            Ok(()) => {
                health.store(Arc::new(HealthVerdict::Healthy));
                metadata.reconnect_attempts.store(0, Ordering::SeqCst);
                if !first_success.swap(true, Ordering::SeqCst) {
                    if let Some(cb) = heartbeat_cb.take() {
                        cb();
                    }
                }
            }
            Err(cause) => {
                warn!(addr, %cause, "heartbeat failed");
                metadata.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                health.store(Arc::new(HealthVerdict::Unhealthy { cause }));
            }
        }
    }
}

/// One heartbeat tick: ping, compute offset via Cristian's algorithm,
/// record it, and report success/failure for health purposes.
async fn tick(
    addr: &str,
    connection: &Arc<dyn RpcConnection>,
    clock: &dyn Clock,
    monitor: &RemoteClockMonitor,
    metadata: &ConnectionMetadata,
    config: &HeartbeatLoopConfig,
) -> Result<(), String> {
    let send_time_local = clock.now_nanos();

    let request = PingRequest {
        ping: "ping".into(),
        offset_nanos: send_time_local,
        cluster_id: config.cluster_id.clone(),
        node_addr: config.local_node_addr.clone(),
    };

    let response = connection
        .ping(request, config.heartbeat_timeout)
        .await
        .map_err(|e| e.to_string())?;

    let recv_time_local = clock.now_nanos();
    let round_trip = recv_time_local - send_time_local;

    let max_allowed =
        clock.max_offset().as_nanos() as i64 * config.maximum_ping_duration_mult as i64;
    if round_trip > max_allowed {
        return Err(format!(
            "round trip {round_trip}ns exceeds {max_allowed}ns bound; sample discarded"
        ));
    }

    let offset = response.server_time_nanos - (send_time_local + round_trip / 2);
    let uncertainty = round_trip / 2;

    monitor.record(
        addr,
        OffsetSample {
            offset_nanos: offset,
            uncertainty_nanos: uncertainty,
            measured_at_nanos: recv_time_local,
        },
    );
    if !response.responder_addr.is_empty() {
        metadata
            .remote_node_addr
            .store(Arc::new(Some(response.responder_addr)));
    }
    info!(addr, offset, uncertainty, "heartbeat succeeded");
    Ok(())
}
