//! Listening endpoint: accepts TCP connections and opens mesh streams.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Encapsulation;
use crate::conn::{self, TunnelConfig};
use crate::error::Error;
use crate::mesh::MeshRouter;
use crate::metrics;
use crate::stats::{EndpointStats, OperStatus};

/// How long an accepted connection may wait for a connector to become
/// reachable before the socket is refused.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of one listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    /// Logical mesh address this listener tunnels toward.
    pub address: String,
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

/// Live listener entity. Dropping the handle does not stop the endpoint;
/// call [`ListenerHandle::shutdown`].
pub struct ListenerHandle {
    config: ListenerConfig,
    stats: Arc<EndpointStats>,
    reachable: watch::Receiver<usize>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// Bind the socket and start the accept loop.
    ///
    /// Binding happens before this returns, so `local_addr` is the real
    /// bound address even when the configured port is 0.
    pub async fn spawn(config: ListenerConfig, mesh: MeshRouter) -> Result<Self, Error> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let stats = Arc::new(EndpointStats::default());
        let reachable = mesh.reachability(&config.address);
        let cancel = CancellationToken::new();
        info!(
            name = %config.name,
            address = %config.address,
            local = %local_addr,
            encapsulation = %config.encapsulation,
            "listener up"
        );

        tokio::spawn(accept_loop(
            listener,
            config.clone(),
            mesh,
            Arc::clone(&stats),
            reachable.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            config,
            stats,
            reachable,
            cancel,
            local_addr,
        })
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn set_site_id(&mut self, site_id: Option<String>) {
        self.config.site_id = site_id;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    /// `Up` iff at least one connector for this listener's address is
    /// reachable, recomputed from the mesh's watch cell on demand.
    pub fn oper_status(&self) -> OperStatus {
        OperStatus::from_connector_count(*self.reachable.borrow())
    }

    /// Stop accepting. Established tunnels keep running to completion; only
    /// administrative force-close ends them early.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        info!(name = %self.config.name, "listener shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ListenerConfig,
    mesh: MeshRouter,
    stats: Arc<EndpointStats>,
    reachable: watch::Receiver<usize>,
    cancel: CancellationToken,
) {
    let tunnel_cfg = TunnelConfig::new(&config.name, config.encapsulation);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    // Fail fast while the backend address is dark: dropping
                    // the socket here beats parking clients on a dead path.
                    if *reachable.borrow() == 0 {
                        debug!(
                            name = %config.name,
                            %peer,
                            "refusing connection, address unreachable"
                        );
                        metrics::tunnel_refused(&config.name);
                        drop(socket);
                        continue;
                    }
                    tokio::spawn(serve_socket(
                        socket,
                        peer,
                        config.address.clone(),
                        mesh.clone(),
                        Arc::clone(&stats),
                        tunnel_cfg.clone(),
                    ));
                }
                Err(err) => {
                    warn!(name = %config.name, error = %err, "accept failed");
                }
            },
        }
    }
}

async fn serve_socket(
    socket: TcpStream,
    peer: SocketAddr,
    address: String,
    mesh: MeshRouter,
    stats: Arc<EndpointStats>,
    cfg: TunnelConfig,
) {
    let token = CancellationToken::new();
    let conn_id = mesh.register_connection(token.clone(), false);

    // Administrative force-close must take effect immediately even while
    // the connection is still waiting for a stream assignment, so the wait
    // races the cancellation token. Tunneled streams are long-lived by
    // design and opt out of the generic stuck-delivery scan.
    let opened = tokio::select! {
        _ = token.cancelled() => {
            debug!(entity = %cfg.entity, %peer, conn_id, "force-closed while opening");
            mesh.remove_connection(conn_id);
            return;
        }
        opened = mesh.open_stream(&address, OPEN_TIMEOUT, true) => opened,
    };

    match opened {
        Ok(link) => {
            debug!(entity = %cfg.entity, %peer, conn_id, "accepted tunnel client");
            conn::drive(socket, link, mesh, stats, cfg, token, conn_id).await;
        }
        Err(err) => {
            warn!(
                entity = %cfg.entity,
                %peer,
                error = %err,
                "refusing connection, no stream available"
            );
            metrics::tunnel_refused(&cfg.entity);
            mesh.remove_connection(conn_id);
            // Dropping the socket resets the client.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_config(name: &str, address: &str) -> ListenerConfig {
        ListenerConfig {
            name: name.into(),
            address: address.into(),
            host: "127.0.0.1".into(),
            port: 0,
            encapsulation: Encapsulation::Lite,
            site_id: None,
            ssl_profile: None,
            authenticate_peer: false,
        }
    }

    #[tokio::test]
    async fn down_listener_refuses_clients() {
        let mesh = MeshRouter::new();
        let handle = ListenerHandle::spawn(test_config("dark", "no-backend"), mesh)
            .await
            .unwrap();
        assert_eq!(handle.oper_status(), OperStatus::Down);

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut buf = Vec::new();
        // The accepted socket must be dropped immediately, which the client
        // observes as EOF (or a reset) without any payload.
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await;
        match n {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("expected no payload, got {n} bytes"),
            Ok(Err(_)) => {} // connection reset is also a refusal
            Err(_) => panic!("refusal must be prompt, not a hang"),
        }
        assert_eq!(handle.stats().snapshot().connections_opened, 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn listener_created_after_connector_is_up() {
        // Deployment order in the field: the connector side comes up first.
        let mesh = MeshRouter::new();
        let _reg = mesh.register_connector("svc");
        let handle = ListenerHandle::spawn(test_config("l", "svc"), mesh)
            .await
            .unwrap();
        assert_eq!(handle.oper_status(), OperStatus::Up);
        handle.shutdown();
    }

    #[tokio::test]
    async fn force_close_interrupts_an_opening_connection() {
        let mesh = MeshRouter::new();
        // A connector that never drains its dispatch backlog: fill it so
        // further opens park in the bounded reachability wait.
        let _reg = mesh.register_connector("svc");
        let mut parked = Vec::new();
        while let Ok(link) = mesh
            .open_stream("svc", Duration::from_millis(50), true)
            .await
        {
            parked.push(link);
        }

        let handle = ListenerHandle::spawn(test_config("l", "svc"), mesh.clone())
            .await
            .unwrap();
        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();

        // Wait for the accepted socket to register its connection, then
        // force it closed while it is still waiting for a stream.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let ids = mesh.connection_ids();
            if !ids.is_empty() {
                for id in ids {
                    mesh.force_close_connection(id).unwrap();
                }
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "connection never registered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The close must land well before the 5 s opening timeout.
        let mut buf = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf)).await;
        match read {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => panic!("force-closed client must not receive data, got {n} bytes"),
            Err(_) => panic!("force-close while opening must be immediate"),
        }
        handle.shutdown();
    }

    #[tokio::test]
    async fn oper_status_follows_connector_registration() {
        let mesh = MeshRouter::new();
        let handle = ListenerHandle::spawn(test_config("l", "svc"), mesh.clone())
            .await
            .unwrap();
        assert_eq!(handle.oper_status(), OperStatus::Down);

        let reg = mesh.register_connector("svc");
        assert_eq!(handle.oper_status(), OperStatus::Up);
        mesh.deregister_connector("svc", reg.connector_id);
        assert_eq!(handle.oper_status(), OperStatus::Down);
        handle.shutdown();
    }
}
