//! In-process mesh delivery substrate.
//!
//! The adaptor core consumes the mesh through three narrow capabilities:
//! ordered delivery streams (`open_stream` / per-connector dispatch),
//! address-reachability change notifications (a `watch` cell carrying the
//! live connector count), and a stream registry the generic stuck-delivery
//! monitor scans. `MeshRouter` implements exactly that surface in-process;
//! multi-hop forwarding lives behind it and is not this crate's concern.
//!
//! ## Balancing
//!
//! When several connectors register the same logical address, inbound
//! stream requests rotate round-robin across them. A connector whose
//! dispatch backlog is full is skipped for that request rather than
//! blocking the opener.
//!
//! ## Connection registry
//!
//! Every connection parks a cancellation token here so management can force
//! it to Reset by id. The registry holds non-owning back-references only;
//! lifecycle authority stays with the connection task. A connector's
//! dispatcher placeholder is registered protected and refuses direct
//! administrative deletion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::Settlement;
use crate::error::Error;

/// Dispatch backlog per connector. A full backlog means the connector is
/// saturated; the balancer skips it for that request.
const DISPATCH_BACKLOG: usize = 64;

/// Cumulative settlement for one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settle {
    /// Highest sequence number covered by this settlement.
    pub up_to: u64,
    /// Payload bytes newly settled. Accepted settlements return this much
    /// credit to the sender's flow window.
    pub bytes: u64,
    pub outcome: Settlement,
}

/// One unit traversing a stream link: an encoded delivery going one way, or
/// a settlement coming back. Links are ordered and lossless, so per
/// sub-stream delivery order equals send order.
#[derive(Debug)]
pub enum Frame {
    /// A delivery, encoded with the sending endpoint's encapsulation.
    Delivery(Bytes),
    Settle(Settle),
}

/// One endpoint's half of a bidirectional mesh stream.
///
/// The channels are unbounded: in-flight payload is already bounded by the
/// flow window, so memory stays bounded without risking a send/receive
/// deadlock between two mutually backpressured pumps.
#[derive(Debug)]
pub struct StreamLink {
    pub stream_id: u64,
    pub tx: mpsc::UnboundedSender<Frame>,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

/// A new inbound stream routed to a connector's dispatcher.
#[derive(Debug)]
pub struct InboundStream {
    pub link: StreamLink,
}

/// Handle returned by [`MeshRouter::register_connector`].
pub struct ConnectorRegistration {
    pub connector_id: u64,
    /// New-stream notifications for this connector's address.
    pub streams: mpsc::Receiver<InboundStream>,
}

struct ConnectorSlot {
    id: u64,
    dispatch: mpsc::Sender<InboundStream>,
}

struct AddressEntry {
    connectors: Vec<ConnectorSlot>,
    /// Round-robin cursor over `connectors`.
    cursor: usize,
    reachable: watch::Sender<usize>,
}

impl AddressEntry {
    fn new() -> Self {
        let (reachable, _) = watch::channel(0);
        Self {
            connectors: Vec::new(),
            cursor: 0,
            reachable,
        }
    }

    fn notify_reachability(&self) {
        // send_replace, not send: the count must be stored even while no
        // receiver is subscribed, or a connector registered before the
        // first subscriber leaves the cell stuck at 0.
        self.reachable.send_replace(self.connectors.len());
    }
}

struct StreamMeta {
    opened_at: Instant,
    liveness_exempt: bool,
}

struct ConnEntry {
    token: CancellationToken,
    protected: bool,
}

#[derive(Default)]
struct Registry {
    addresses: HashMap<String, AddressEntry>,
    streams: HashMap<u64, StreamMeta>,
    connections: HashMap<u64, ConnEntry>,
    next_stream_id: u64,
    next_connector_id: u64,
    next_conn_id: u64,
}

impl Registry {
    fn entry_mut(&mut self, address: &str) -> &mut AddressEntry {
        self.addresses
            .entry(address.to_owned())
            .or_insert_with(AddressEntry::new)
    }
}

/// Shared handle to the mesh substrate. Cheap to clone.
#[derive(Clone, Default)]
pub struct MeshRouter {
    registry: Arc<Mutex<Registry>>,
}

impl MeshRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the live connector count for an address. `oper_status`
    /// of an endpoint is a pure function of this cell, recomputed on every
    /// change — never polled.
    pub fn reachability(&self, address: &str) -> watch::Receiver<usize> {
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        reg.entry_mut(address).reachable.subscribe()
    }

    /// Register a connector for an address, making it a dispatch target and
    /// bumping the reachability count.
    pub fn register_connector(&self, address: &str) -> ConnectorRegistration {
        let (dispatch, streams) = mpsc::channel(DISPATCH_BACKLOG);
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        reg.next_connector_id += 1;
        let connector_id = reg.next_connector_id;
        let entry = reg.entry_mut(address);
        entry.connectors.push(ConnectorSlot {
            id: connector_id,
            dispatch,
        });
        entry.notify_reachability();
        debug!(address, connector_id, "mesh: connector registered");
        ConnectorRegistration {
            connector_id,
            streams,
        }
    }

    /// Remove a connector from the dispatch rotation. Streams it already
    /// accepted keep running; only new assignments stop.
    pub fn deregister_connector(&self, address: &str, connector_id: u64) {
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        if let Some(entry) = reg.addresses.get_mut(address) {
            entry.connectors.retain(|slot| slot.id != connector_id);
            entry.cursor = 0;
            entry.notify_reachability();
            debug!(address, connector_id, "mesh: connector deregistered");
        }
    }

    /// Open a stream to an address, waiting up to `wait` for a connector to
    /// become reachable. Fails with [`Error::AddressUnreachable`] at the
    /// deadline — a bounded wait, never an indefinite hang.
    pub async fn open_stream(
        &self,
        address: &str,
        wait: Duration,
        liveness_exempt: bool,
    ) -> Result<StreamLink, Error> {
        let mut reachable = self.reachability(address);
        let deadline = Instant::now() + wait;
        loop {
            if let Some(link) = self.try_dispatch(address, liveness_exempt) {
                return Ok(link);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::AddressUnreachable(address.to_owned()));
            }
            match tokio::time::timeout(remaining, reachable.changed()).await {
                Ok(Ok(())) => continue,
                // Timeout, or the address entry vanished.
                _ => return Err(Error::AddressUnreachable(address.to_owned())),
            }
        }
    }

    /// One balanced dispatch attempt. Rotates the round-robin cursor,
    /// skipping connectors with a saturated or closed backlog.
    fn try_dispatch(&self, address: &str, liveness_exempt: bool) -> Option<StreamLink> {
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        reg.next_stream_id += 1;
        let stream_id = reg.next_stream_id;

        let mut dispatched = None;
        if let Some(entry) = reg.addresses.get_mut(address) {
            let n = entry.connectors.len();
            for _ in 0..n {
                entry.cursor = (entry.cursor + 1) % n;
                let slot = &entry.connectors[entry.cursor];

                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (back_tx, back_rx) = mpsc::unbounded_channel();
                let inbound = InboundStream {
                    link: StreamLink {
                        stream_id,
                        tx: back_tx,
                        rx: out_rx,
                    },
                };
                match slot.dispatch.try_send(inbound) {
                    Ok(()) => {
                        dispatched = Some(StreamLink {
                            stream_id,
                            tx: out_tx,
                            rx: back_rx,
                        });
                        break;
                    }
                    Err(_) => continue, // saturated or gone; try the next slot
                }
            }
        }

        if dispatched.is_some() {
            reg.streams.insert(
                stream_id,
                StreamMeta {
                    opened_at: Instant::now(),
                    liveness_exempt,
                },
            );
        }
        dispatched
    }

    /// Drop a stream from the liveness registry once both sides are done.
    pub fn release_stream(&self, stream_id: u64) {
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        reg.streams.remove(&stream_id);
    }

    /// Streams older than `max_age` that did NOT opt out of the generic
    /// stuck-delivery check. Tunneled TCP streams are long-lived by design
    /// and always register exempt, so they never show up here.
    pub fn stuck_streams(&self, max_age: Duration) -> Vec<u64> {
        let reg = self.registry.lock().expect("mesh registry poisoned");
        let now = Instant::now();
        reg.streams
            .iter()
            .filter(|(_, meta)| {
                !meta.liveness_exempt && now.duration_since(meta.opened_at) > max_age
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Current live connector count for an address.
    pub fn connector_count(&self, address: &str) -> usize {
        let reg = self.registry.lock().expect("mesh registry poisoned");
        reg.addresses
            .get(address)
            .map(|e| e.connectors.len())
            .unwrap_or(0)
    }

    // ── connection registry ──────────────────────────────────────────

    /// Park a connection's cancellation token for administrative access.
    /// Protected entries (the dispatcher placeholder) refuse forced closure.
    pub fn register_connection(&self, token: CancellationToken, protected: bool) -> u64 {
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        reg.next_conn_id += 1;
        let id = reg.next_conn_id;
        reg.connections.insert(id, ConnEntry { token, protected });
        id
    }

    pub fn remove_connection(&self, id: u64) {
        let mut reg = self.registry.lock().expect("mesh registry poisoned");
        reg.connections.remove(&id);
    }

    /// Administratively force a connection to Reset, immediately and
    /// unilaterally. The dispatcher placeholder is protected: it only goes
    /// away when its connector entity is deleted.
    pub fn force_close_connection(&self, id: u64) -> Result<(), Error> {
        let reg = self.registry.lock().expect("mesh registry poisoned");
        let entry = reg
            .connections
            .get(&id)
            .ok_or_else(|| Error::NoSuchEntity(format!("connection {id}")))?;
        if entry.protected {
            return Err(Error::AdminForbidden(format!(
                "connection {id} is a connector dispatcher and cannot be deleted directly"
            )));
        }
        entry.token.cancel();
        Ok(())
    }

    /// Ids of all registered connections, dispatchers included.
    pub fn connection_ids(&self) -> Vec<u64> {
        let reg = self.registry.lock().expect("mesh registry poisoned");
        reg.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reachability_tracks_registration() {
        let mesh = MeshRouter::new();
        let rx = mesh.reachability("svc");
        assert_eq!(*rx.borrow(), 0);

        let reg_a = mesh.register_connector("svc");
        assert_eq!(*rx.borrow(), 1);
        let reg_b = mesh.register_connector("svc");
        assert_eq!(*rx.borrow(), 2);

        mesh.deregister_connector("svc", reg_a.connector_id);
        assert_eq!(*rx.borrow(), 1);
        mesh.deregister_connector("svc", reg_b.connector_id);
        assert_eq!(*rx.borrow(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_sees_existing_connectors() {
        // The registration order in a real deployment: connectors come up
        // first, endpoints subscribe afterwards. The count must be stored
        // in the cell even while nobody is subscribed.
        let mesh = MeshRouter::new();
        let reg = mesh.register_connector("svc");
        let rx = mesh.reachability("svc");
        assert_eq!(*rx.borrow(), 1);

        mesh.deregister_connector("svc", reg.connector_id);
        drop(rx);
        assert_eq!(*mesh.reachability("svc").borrow(), 0);
    }

    #[tokio::test]
    async fn open_stream_without_connector_is_bounded() {
        let mesh = MeshRouter::new();
        let start = Instant::now();
        let err = mesh
            .open_stream("nowhere", Duration::from_millis(50), true)
            .await;
        assert!(matches!(err, Err(Error::AddressUnreachable(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn open_stream_waits_for_late_connector() {
        let mesh = MeshRouter::new();
        let opener = {
            let mesh = mesh.clone();
            tokio::spawn(async move {
                mesh.open_stream("late", Duration::from_secs(5), true).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut reg = mesh.register_connector("late");
        let link = opener.await.unwrap().unwrap();
        let inbound = reg.streams.recv().await.unwrap();
        assert_eq!(link.stream_id, inbound.link.stream_id);
    }

    #[tokio::test]
    async fn round_robin_spreads_streams() {
        let mesh = MeshRouter::new();
        let mut regs: Vec<ConnectorRegistration> =
            (0..3).map(|_| mesh.register_connector("balanced")).collect();

        for _ in 0..9 {
            mesh.open_stream("balanced", Duration::from_millis(100), true)
                .await
                .unwrap();
        }

        for reg in &mut regs {
            let mut assigned = 0;
            while reg.streams.try_recv().is_ok() {
                assigned += 1;
            }
            assert_eq!(assigned, 3, "round robin must spread evenly");
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let mesh = MeshRouter::new();
        let mut reg = mesh.register_connector("pipe");
        let mut a = mesh
            .open_stream("pipe", Duration::from_millis(100), true)
            .await
            .unwrap();
        let mut b = reg.streams.recv().await.unwrap().link;

        a.tx.send(Frame::Delivery(Bytes::from_static(b"ping")))
            .unwrap();
        match b.rx.recv().await.unwrap() {
            Frame::Delivery(body) => assert_eq!(&body[..], b"ping"),
            other => panic!("expected delivery, got {other:?}"),
        }

        b.tx.send(Frame::Settle(Settle {
            up_to: 0,
            bytes: 4,
            outcome: Settlement::Accepted,
        }))
        .unwrap();
        match a.rx.recv().await.unwrap() {
            Frame::Settle(settle) => {
                assert_eq!(settle.bytes, 4);
                assert_eq!(settle.outcome, Settlement::Accepted);
            }
            other => panic!("expected settle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stuck_monitor_skips_exempt_streams() {
        let mesh = MeshRouter::new();
        let _reg = mesh.register_connector("svc");
        let exempt = mesh
            .open_stream("svc", Duration::from_millis(100), true)
            .await
            .unwrap();
        let plain = mesh
            .open_stream("svc", Duration::from_millis(100), false)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let stuck = mesh.stuck_streams(Duration::from_millis(10));
        assert!(!stuck.contains(&exempt.stream_id));
        assert_eq!(stuck, vec![plain.stream_id]);

        mesh.release_stream(plain.stream_id);
        assert!(mesh.stuck_streams(Duration::from_millis(10)).is_empty());
    }

    #[tokio::test]
    async fn protected_connection_refuses_forced_close() {
        let mesh = MeshRouter::new();
        let dispatcher = mesh.register_connection(CancellationToken::new(), true);
        let token = CancellationToken::new();
        let plain = mesh.register_connection(token.clone(), false);

        assert!(matches!(
            mesh.force_close_connection(dispatcher),
            Err(Error::AdminForbidden(_))
        ));
        mesh.force_close_connection(plain).unwrap();
        assert!(token.is_cancelled());

        assert!(matches!(
            mesh.force_close_connection(9999),
            Err(Error::NoSuchEntity(_))
        ));
    }
}
