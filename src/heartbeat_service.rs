//! Heartbeat service (component B): the server-side handler for the
//! single `Ping` RPC (spec §4.2).
//!
//! Grounded on the teacher's `tunnel::heartbeat::HeartbeatHandle`
//! channel seam — generalised from "forward an ACK payload" to
//! "produce a `PingResponse`", and on `registration::heartbeat::run`'s
//! pattern of absorbing failure into a counter rather than propagating.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::clock::Clock;
use crate::error::Error;
use crate::remote_clock::{OffsetSample, RemoteClockMonitor};
use crate::wire::{PingRequest, PingResponse};

/// Server-side handler for `Ping` requests.
#[async_trait]
pub trait PingService: Send + Sync {
    async fn ping(&self, request: PingRequest) -> Result<PingResponse, Error>;
}

/// Production `PingService`: validates the caller's cluster ID, samples
/// the local clock as late as possible, and passively updates this
/// node's own remote-clock monitor entry for the caller (spec §4.2:
/// "every node also passively learns about every peer that pings it").
pub struct DefaultPingService {
    cluster_id: String,
    local_node_addr: String,
    clock: Arc<dyn Clock>,
    passive_monitor: Arc<RemoteClockMonitor>,
    maximum_ping_duration_mult: u32,
}

impl DefaultPingService {
    pub fn new(
        cluster_id: impl Into<String>,
        local_node_addr: impl Into<String>,
        clock: Arc<dyn Clock>,
        passive_monitor: Arc<RemoteClockMonitor>,
        maximum_ping_duration_mult: u32,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            local_node_addr: local_node_addr.into(),
            clock,
            passive_monitor,
            maximum_ping_duration_mult,
        }
    }

    /// Passive server-side counterpart to the client-side algorithm in
    /// `heartbeat_loop` (spec §4.4). A server only ever sees one leg of
    /// the round trip directly — the client's send timestamp, carried in
    /// `request.offset_nanos` despite its name (see
    /// [`crate::wire::PingRequest::offset_nanos`]) — so it approximates
    /// the round trip as twice the one-way gap it can observe
    /// (`recv_time - client_send_time`) and reuses Cristian's algorithm
    /// on that estimate. This has no analogue in the spec's text, which
    /// only walks through the client side; it is this crate's own
    /// resolution of "the same round-trip logic" left unspecified for
    /// the server leg.
    fn record_passive_sample(&self, caller_addr: &str, client_send_nanos: i64, recv_nanos: i64) {
        let one_way_nanos = recv_nanos.saturating_sub(client_send_nanos);
        let round_trip_est_nanos = one_way_nanos.saturating_mul(2);

        let max_allowed =
            self.clock.max_offset().as_nanos() as i64 * self.maximum_ping_duration_mult as i64;
        if round_trip_est_nanos > max_allowed {
            return;
        }

        let offset_nanos = recv_nanos - (client_send_nanos + round_trip_est_nanos / 2);
        self.passive_monitor.record(
            caller_addr,
            OffsetSample {
                offset_nanos,
                uncertainty_nanos: round_trip_est_nanos / 2,
                measured_at_nanos: recv_nanos,
            },
        );
    }
}

#[async_trait]
impl PingService for DefaultPingService {
    async fn ping(&self, request: PingRequest) -> Result<PingResponse, Error> {
        if request.cluster_id != self.cluster_id {
            return Err(Error::ClusterMismatch {
                addr: request.node_addr,
                local: self.cluster_id.clone(),
                remote: request.cluster_id,
            });
        }

        let recv_nanos = self.clock.now_nanos();
        self.record_passive_sample(&request.node_addr, request.offset_nanos, recv_nanos);

        // Sample again immediately before returning, as late as possible
        // (spec §6: "server_time MUST be sampled as late as possible").
        let server_time_nanos = self.clock.now_nanos();
        Ok(PingResponse {
            pong: request.ping,
            server_time_nanos,
            responder_addr: self.local_node_addr.clone(),
        })
    }
}

/// Test-only seam (spec §4.2, §9): replaces the timing source with an
/// externally fed channel of responses so tests can script failures,
/// pauses, and slow networks deterministically.
pub struct ManualHeartbeatService {
    responses: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Result<PingResponse, String>>>,
}

impl ManualHeartbeatService {
    pub fn new() -> (Self, tokio::sync::mpsc::Sender<Result<PingResponse, String>>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        (
            Self {
                responses: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }
}

#[async_trait]
impl PingService for ManualHeartbeatService {
    async fn ping(&self, request: PingRequest) -> Result<PingResponse, Error> {
        let mut rx = self.responses.lock().await;
        match rx.recv().await {
            Some(Ok(mut resp)) => {
                resp.pong = request.ping;
                Ok(resp)
            }
            Some(Err(cause)) => Err(Error::FailedHeartbeat {
                addr: request.node_addr,
                cause,
            }),
            None => {
                warn!("ManualHeartbeatService channel closed; treating as failure");
                Err(Error::FailedHeartbeat {
                    addr: request.node_addr,
                    cause: "no response scripted".into(),
                })
            }
        }
    }
}
