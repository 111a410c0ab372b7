//! Connection lifecycle and the socket↔mesh pump.
//!
//! One task per tunneled connection owns the socket, the stream link, and
//! the lifecycle state machine, and is the only writer of that state.
//! Concurrency lives in a single `select!` loop, so there is no state shared
//! between a reader task and a writer task and no lock on the hot path.
//!
//! Backpressure is structural: the pump only reads its socket while the flow
//! window has credit, and while it is blocked writing to a slow socket it is
//! not draining the link, so settlements stall and the far side's window
//! empties. The kernel's TCP receive window does the rest.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Control, Delivery, Encapsulation, Settlement};
use crate::error::Error;
use crate::mesh::{Frame, MeshRouter, Settle, StreamLink};
use crate::metrics;
use crate::stats::EndpointStats;
use crate::window::{FlowWindow, SettlementBatch, DEFAULT_WINDOW_BYTES};

/// Largest single read from a local socket. One read becomes one delivery.
pub const READ_CHUNK: usize = 16 * 1024;

/// Connection lifecycle states. Closed and Reset are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// End-to-end path not yet confirmed; no payload may flow.
    Opening,
    Established,
    /// We sent our half-close; the other direction keeps flowing.
    HalfClosedLocal,
    /// The peer sent its half-close; our direction keeps flowing.
    HalfClosedRemote,
    /// Orderly close, both directions drained.
    Closed,
    /// Abrupt termination.
    Reset,
}

/// Pure lifecycle state machine, owned and mutated by exactly one pump task.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnState::Opening,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Opening → Established. Returns false from any other state.
    pub fn establish(&mut self) -> bool {
        if self.state == ConnState::Opening {
            self.state = ConnState::Established;
            true
        } else {
            false
        }
    }

    /// Our outbound direction finished (local EOF). Two half-closes meeting
    /// make an orderly Closed.
    pub fn local_half_closed(&mut self) -> ConnState {
        self.state = match self.state {
            ConnState::Established => ConnState::HalfClosedLocal,
            ConnState::HalfClosedRemote => ConnState::Closed,
            other => other,
        };
        self.state
    }

    /// The peer's direction finished (CloseWrite received).
    pub fn remote_half_closed(&mut self) -> ConnState {
        self.state = match self.state {
            ConnState::Established => ConnState::HalfClosedRemote,
            ConnState::HalfClosedLocal => ConnState::Closed,
            other => other,
        };
        self.state
    }

    /// Orderly full close from any live state.
    pub fn close(&mut self) {
        if !self.is_terminal() {
            self.state = ConnState::Closed;
        }
    }

    /// Abrupt termination from any state, including Opening. Returns false
    /// if the connection was already terminal.
    pub fn reset(&mut self) -> bool {
        if self.is_terminal() {
            false
        } else {
            self.state = ConnState::Reset;
            true
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnState::Closed | ConnState::Reset)
    }

    pub fn was_reset(&self) -> bool {
        self.state == ConnState::Reset
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-entity knobs shared by every connection the entity spawns.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Entity name, for log fields and metric labels.
    pub entity: Arc<str>,
    pub encapsulation: Encapsulation,
    /// Per-direction flow window in bytes.
    pub window_bytes: u64,
}

impl TunnelConfig {
    pub fn new(entity: &str, encapsulation: Encapsulation) -> Self {
        Self {
            entity: Arc::from(entity),
            encapsulation,
            window_bytes: DEFAULT_WINDOW_BYTES,
        }
    }
}

/// Pump a connected socket against an established stream link until the
/// connection terminates, then unregister everything it owns.
///
/// The caller has already confirmed the end-to-end path (the stream was
/// dispatched, the backend dialed), so establishment is counted here and
/// closure is guaranteed to be counted on every exit path.
pub async fn drive(
    mut socket: TcpStream,
    mut link: StreamLink,
    mesh: MeshRouter,
    stats: Arc<EndpointStats>,
    cfg: TunnelConfig,
    cancel: CancellationToken,
    conn_id: u64,
) {
    let mut lifecycle = Lifecycle::new();
    lifecycle.establish();
    stats.inc_opened();
    metrics::tunnel_opened(&cfg.entity);
    debug!(
        entity = %cfg.entity,
        conn_id,
        stream_id = link.stream_id,
        "tunnel established"
    );

    let mut window = FlowWindow::new(cfg.window_bytes);
    let mut batch = SettlementBatch::new(window.low_watermark());
    let mut next_out_seq: u64 = 0;
    let mut expected_in_seq: u64 = 0;
    // Cleared at local EOF so we stop polling a dead read half.
    let mut ingress_open = true;

    let (mut rd, mut wr) = socket.split();

    while !lifecycle.is_terminal() {
        // The read buffer is sized to the remaining credit so one read can
        // never overrun the flow window.
        let budget = (window.available().min(READ_CHUNK as u64)) as usize;
        let mut read_buf = vec![0u8; budget];

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(entity = %cfg.entity, conn_id, "tunnel force-closed");
                let reset = Delivery::control(next_out_seq, Control::Reset);
                let _ = link.tx.send(Frame::Delivery(cfg.encapsulation.encode(&reset)));
                lifecycle.reset();
            }

            frame = link.rx.recv() => match frame {
                Some(Frame::Delivery(body)) => {
                    match decode_in_order(&cfg.encapsulation, &body, expected_in_seq) {
                        Ok(delivery) => {
                            expected_in_seq += 1;
                            handle_delivery(
                                delivery,
                                next_out_seq,
                                &mut wr,
                                &link.tx,
                                &mut batch,
                                &mut lifecycle,
                                &stats,
                                &cfg,
                            )
                            .await;
                        }
                        Err(err) => {
                            warn!(
                                entity = %cfg.entity,
                                conn_id,
                                error = %err,
                                "protocol violation, resetting connection"
                            );
                            let reset = Delivery::control(next_out_seq, Control::Reset);
                            let _ = link.tx.send(
                                Frame::Delivery(cfg.encapsulation.encode(&reset)),
                            );
                            lifecycle.reset();
                        }
                    }
                }
                Some(Frame::Settle(settle)) => {
                    if settle.outcome == Settlement::Accepted {
                        window.replenish(settle.bytes);
                    }
                    trace!(
                        entity = %cfg.entity,
                        conn_id,
                        up_to = settle.up_to,
                        bytes = settle.bytes,
                        available = window.available(),
                        "settlement received"
                    );
                }
                None => {
                    // Peer endpoint vanished without an orderly close.
                    debug!(entity = %cfg.entity, conn_id, "mesh stream dropped by peer");
                    lifecycle.reset();
                }
            },

            read = rd.read(&mut read_buf), if ingress_open && budget > 0 => match read {
                Ok(0) => {
                    let close = Delivery::control(next_out_seq, Control::CloseWrite);
                    next_out_seq += 1;
                    let _ = link.tx.send(Frame::Delivery(cfg.encapsulation.encode(&close)));
                    ingress_open = false;
                    let state = lifecycle.local_half_closed();
                    debug!(entity = %cfg.entity, conn_id, ?state, "local half-close");
                }
                Ok(n) => {
                    // The read cap guarantees credit is available.
                    window.consume(n as u64);
                    read_buf.truncate(n);
                    let payload = Bytes::from(std::mem::take(&mut read_buf));
                    let delivery = Delivery::payload(next_out_seq, payload);
                    next_out_seq += 1;
                    if link.tx.send(Frame::Delivery(cfg.encapsulation.encode(&delivery))).is_err() {
                        lifecycle.reset();
                    } else {
                        stats.add_bytes_in(n as u64);
                        metrics::tunnel_bytes_in(&cfg.entity, n);
                    }
                }
                Err(err) => {
                    debug!(entity = %cfg.entity, conn_id, error = %err, "socket read failed");
                    let reset = Delivery::control(next_out_seq, Control::Reset);
                    let _ = link.tx.send(Frame::Delivery(cfg.encapsulation.encode(&reset)));
                    lifecycle.reset();
                }
            },
        }
    }

    // Make the sender's window whole before the link goes away. On Reset the
    // pending bytes were consumed but must not be credited.
    if let Some((up_to, bytes)) = batch.take() {
        let outcome = if lifecycle.was_reset() {
            Settlement::Released
        } else {
            Settlement::Accepted
        };
        let _ = link.tx.send(Frame::Settle(Settle {
            up_to,
            bytes,
            outcome,
        }));
    }

    mesh.release_stream(link.stream_id);
    mesh.remove_connection(conn_id);
    stats.inc_closed();
    metrics::tunnel_closed(&cfg.entity, lifecycle.was_reset());
    debug!(
        entity = %cfg.entity,
        conn_id,
        state = ?lifecycle.state(),
        "tunnel finished"
    );
}

/// Decode one inbound frame and enforce per-stream sequencing. Gaps and
/// duplicates both surface as violations; the mesh link is ordered, so any
/// mismatch means a buggy or hostile peer.
fn decode_in_order(
    encapsulation: &Encapsulation,
    body: &[u8],
    expected_seq: u64,
) -> Result<Delivery, Error> {
    let delivery = encapsulation.decode(body)?;
    if delivery.seq != expected_seq {
        return Err(Error::ProtocolViolation(format!(
            "sequence {} where {} was expected",
            delivery.seq, expected_seq
        )));
    }
    Ok(delivery)
}

#[allow(clippy::too_many_arguments)]
async fn handle_delivery(
    delivery: Delivery,
    next_out_seq: u64,
    wr: &mut tokio::net::tcp::WriteHalf<'_>,
    tx: &tokio::sync::mpsc::UnboundedSender<Frame>,
    batch: &mut SettlementBatch,
    lifecycle: &mut Lifecycle,
    stats: &EndpointStats,
    cfg: &TunnelConfig,
) {
    match delivery.control {
        Control::Payload => {
            let n = delivery.payload.len();
            if let Err(err) = wr.write_all(&delivery.payload).await {
                debug!(entity = %cfg.entity, error = %err, "socket write failed");
                let reset = Delivery::control(next_out_seq, Control::Reset);
                let _ = tx.send(Frame::Delivery(cfg.encapsulation.encode(&reset)));
                lifecycle.reset();
                return;
            }
            stats.add_bytes_out(n as u64);
            metrics::tunnel_bytes_out(&cfg.entity, n);
            batch.record(delivery.seq, n as u64);
            if let Some((up_to, bytes)) = batch.take_if_due() {
                let _ = tx.send(Frame::Settle(Settle {
                    up_to,
                    bytes,
                    outcome: Settlement::Accepted,
                }));
            }
        }
        Control::CloseWrite => {
            flush_accepted(tx, batch);
            // Propagate the peer's EOF to our socket's write side.
            let _ = wr.shutdown().await;
            let state = lifecycle.remote_half_closed();
            debug!(entity = %cfg.entity, ?state, "remote half-close");
        }
        Control::Close => {
            flush_accepted(tx, batch);
            let _ = wr.shutdown().await;
            lifecycle.close();
        }
        Control::Reset => {
            if let Some((up_to, bytes)) = batch.take() {
                let _ = tx.send(Frame::Settle(Settle {
                    up_to,
                    bytes,
                    outcome: Settlement::Released,
                }));
            }
            lifecycle.reset();
        }
    }
}

fn flush_accepted(tx: &tokio::sync::mpsc::UnboundedSender<Frame>, batch: &mut SettlementBatch) {
    if let Some((up_to, bytes)) = batch.take() {
        let _ = tx.send(Frame::Settle(Settle {
            up_to,
            bytes,
            outcome: Settlement::Accepted,
        }));
    }
}
