//! Connecting endpoint: receives mesh streams and dials the backend server.
//!
//! A connector owns one long-lived dispatcher placeholder registered in the
//! mesh's connection registry. The placeholder counts exactly one opened
//! connection at creation and one closed at deletion, is protected from
//! administrative force-close, and anchors the connector in counter
//! arithmetic: a connector that served N tunnels reports N+1 opened.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Control, Delivery, Encapsulation};
use crate::conn::{self, TunnelConfig};
use crate::error::Error;
use crate::mesh::{Frame, InboundStream, MeshRouter};
use crate::stats::{EndpointStats, OperStatus};

/// How long a backend dial may take before the stream is released.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of one connecting endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub name: String,
    /// Logical mesh address this connector serves.
    pub address: String,
    /// Backend server to dial for each inbound stream.
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub encapsulation: Encapsulation,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub ssl_profile: Option<String>,
    #[serde(default)]
    pub authenticate_peer: bool,
}

/// Live connector entity.
pub struct ConnectorHandle {
    config: ConnectorConfig,
    stats: Arc<EndpointStats>,
    reachable: watch::Receiver<usize>,
    cancel: CancellationToken,
    connector_id: u64,
    dispatcher_conn_id: u64,
    mesh: MeshRouter,
}

impl ConnectorHandle {
    /// Register with the mesh and start the dispatch loop. Registration is
    /// immediate: the address becomes reachable before this returns.
    pub fn spawn(config: ConnectorConfig, mesh: MeshRouter) -> Self {
        let registration = mesh.register_connector(&config.address);
        let cancel = CancellationToken::new();
        let dispatcher_conn_id = mesh.register_connection(cancel.clone(), true);
        let stats = Arc::new(EndpointStats::default());
        // The dispatcher placeholder is the connector's one standing
        // "connection" toward the mesh.
        stats.inc_opened();
        let reachable = mesh.reachability(&config.address);
        info!(
            name = %config.name,
            address = %config.address,
            backend = format!("{}:{}", config.host, config.port),
            encapsulation = %config.encapsulation,
            "connector up"
        );

        tokio::spawn(dispatch_loop(
            registration.streams,
            config.clone(),
            mesh.clone(),
            Arc::clone(&stats),
            cancel.clone(),
        ));

        Self {
            config,
            stats,
            reachable,
            cancel,
            connector_id: registration.connector_id,
            dispatcher_conn_id,
            mesh,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn set_site_id(&mut self, site_id: Option<String>) {
        self.config.site_id = site_id;
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn oper_status(&self) -> OperStatus {
        OperStatus::from_connector_count(*self.reachable.borrow())
    }

    /// Leave the dispatch rotation and retire the dispatcher placeholder.
    /// Tunnels already running keep going. Idempotent.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.mesh
            .deregister_connector(&self.config.address, self.connector_id);
        self.mesh.remove_connection(self.dispatcher_conn_id);
        self.stats.inc_closed();
        info!(name = %self.config.name, "connector shut down");
    }
}

async fn dispatch_loop(
    mut streams: mpsc::Receiver<InboundStream>,
    config: ConnectorConfig,
    mesh: MeshRouter,
    stats: Arc<EndpointStats>,
    cancel: CancellationToken,
) {
    let tunnel_cfg = TunnelConfig::new(&config.name, config.encapsulation);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = streams.recv() => match inbound {
                Some(inbound) => {
                    tokio::spawn(backend_tunnel(
                        inbound,
                        config.clone(),
                        mesh.clone(),
                        Arc::clone(&stats),
                        tunnel_cfg.clone(),
                    ));
                }
                None => break,
            },
        }
    }
}

/// Dial the backend for one inbound stream. A failed dial releases the
/// stream with a Reset so the listener-side socket fails fast instead of
/// hanging on a half-built path.
async fn backend_tunnel(
    inbound: InboundStream,
    config: ConnectorConfig,
    mesh: MeshRouter,
    stats: Arc<EndpointStats>,
    cfg: TunnelConfig,
) {
    let link = inbound.link;
    let backend = format!("{}:{}", config.host, config.port);
    let dial = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&backend)).await;
    let socket = match dial {
        Ok(Ok(socket)) => socket,
        Ok(Err(source)) => {
            let err = Error::BackendDial { backend, source };
            warn!(entity = %cfg.entity, error = %err, "backend dial failed");
            release_stream(link, &mesh, &cfg);
            return;
        }
        Err(_) => {
            warn!(entity = %cfg.entity, %backend, "backend dial timed out");
            release_stream(link, &mesh, &cfg);
            return;
        }
    };

    debug!(entity = %cfg.entity, %backend, stream_id = link.stream_id, "backend dialed");
    let token = CancellationToken::new();
    let conn_id = mesh.register_connection(token.clone(), false);
    conn::drive(socket, link, mesh, stats, cfg, token, conn_id).await;
}

fn release_stream(link: crate::mesh::StreamLink, mesh: &MeshRouter, cfg: &TunnelConfig) {
    let reset = Delivery::control(0, Control::Reset);
    let _ = link.tx.send(Frame::Delivery(cfg.encapsulation.encode(&reset)));
    mesh.release_stream(link.stream_id);
}
