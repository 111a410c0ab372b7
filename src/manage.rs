//! Management surface: entity CRUD, status snapshots, and environment
//! bootstrap.
//!
//! Entities are named listeners and connectors. Creation brings the
//! endpoint up before returning; deletion shuts the endpoint down but lets
//! established tunnels run to completion. Snapshots are point-in-time and
//! serializable, suitable for a status endpoint or CLI dump.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::codec::Encapsulation;
use crate::connector::{ConnectorConfig, ConnectorHandle};
use crate::error::Error;
use crate::listener::{ListenerConfig, ListenerHandle};
use crate::mesh::MeshRouter;
use crate::stats::{OperStatus, StatsSnapshot};

/// Comma-separated listener entries, `name=address@host:port` each.
pub const ENV_LISTENERS: &str = "CULVERT_LISTENERS";
/// Comma-separated connector entries, same format.
pub const ENV_CONNECTORS: &str = "CULVERT_CONNECTORS";
/// Wire encapsulation for all endpoints, `lite` (default) or `legacy`.
pub const ENV_ENCAPSULATION: &str = "CULVERT_ENCAP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Listener,
    Connector,
}

/// Point-in-time view of one entity: configuration, derived status, and
/// counters.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySnapshot {
    pub name: String,
    pub kind: EntityKind,
    pub address: String,
    pub host: String,
    /// For listeners this is the actually bound port, which differs from
    /// the configured one when that was 0.
    pub port: u16,
    pub encapsulation: Encapsulation,
    pub site_id: Option<String>,
    pub ssl_profile: Option<String>,
    pub authenticate_peer: bool,
    pub oper_status: OperStatus,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

enum Entity {
    Listener(ListenerHandle),
    Connector(ConnectorHandle),
}

impl Entity {
    fn snapshot(&self, name: &str) -> EntitySnapshot {
        match self {
            Entity::Listener(h) => {
                let cfg = h.config();
                EntitySnapshot {
                    name: name.to_owned(),
                    kind: EntityKind::Listener,
                    address: cfg.address.clone(),
                    host: cfg.host.clone(),
                    port: h.local_addr().port(),
                    encapsulation: cfg.encapsulation,
                    site_id: cfg.site_id.clone(),
                    ssl_profile: cfg.ssl_profile.clone(),
                    authenticate_peer: cfg.authenticate_peer,
                    oper_status: h.oper_status(),
                    stats: h.stats().snapshot(),
                }
            }
            Entity::Connector(h) => {
                let cfg = h.config();
                EntitySnapshot {
                    name: name.to_owned(),
                    kind: EntityKind::Connector,
                    address: cfg.address.clone(),
                    host: cfg.host.clone(),
                    port: cfg.port,
                    encapsulation: cfg.encapsulation,
                    site_id: cfg.site_id.clone(),
                    ssl_profile: cfg.ssl_profile.clone(),
                    authenticate_peer: cfg.authenticate_peer,
                    oper_status: h.oper_status(),
                    stats: h.stats().snapshot(),
                }
            }
        }
    }

    fn shutdown(&self) {
        match self {
            Entity::Listener(h) => h.shutdown(),
            Entity::Connector(h) => h.shutdown(),
        }
    }
}

/// The management root. Cheap to clone.
#[derive(Clone)]
pub struct Management {
    mesh: MeshRouter,
    entities: Arc<RwLock<HashMap<String, Entity>>>,
}

impl Management {
    pub fn new(mesh: MeshRouter) -> Self {
        Self {
            mesh,
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn mesh(&self) -> &MeshRouter {
        &self.mesh
    }

    /// Create a listener entity. The socket is bound before this returns.
    pub async fn create_listener(&self, config: ListenerConfig) -> Result<(), Error> {
        let name = config.name.clone();
        if self.entities.read().await.contains_key(&name) {
            return Err(Error::EntityExists(name));
        }
        let handle = ListenerHandle::spawn(config, self.mesh.clone()).await?;
        self.insert(name, Entity::Listener(handle)).await
    }

    /// Create a connector entity. Its address becomes reachable before this
    /// returns.
    pub async fn create_connector(&self, config: ConnectorConfig) -> Result<(), Error> {
        let name = config.name.clone();
        if self.entities.read().await.contains_key(&name) {
            return Err(Error::EntityExists(name));
        }
        let handle = ConnectorHandle::spawn(config, self.mesh.clone());
        self.insert(name, Entity::Connector(handle)).await
    }

    async fn insert(&self, name: String, entity: Entity) -> Result<(), Error> {
        let mut entities = self.entities.write().await;
        // Re-check under the write lock: a racing create for the same name
        // may have landed while the endpoint was coming up.
        if entities.contains_key(&name) {
            entity.shutdown();
            return Err(Error::EntityExists(name));
        }
        entities.insert(name, entity);
        Ok(())
    }

    /// Delete an entity, shutting its endpoint down. Established tunnels run
    /// to completion.
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        let mut entities = self.entities.write().await;
        let entity = entities
            .remove(name)
            .ok_or_else(|| Error::NoSuchEntity(name.to_owned()))?;
        entity.shutdown();
        Ok(())
    }

    pub async fn read(&self, name: &str) -> Result<EntitySnapshot, Error> {
        let entities = self.entities.read().await;
        entities
            .get(name)
            .map(|e| e.snapshot(name))
            .ok_or_else(|| Error::NoSuchEntity(name.to_owned()))
    }

    /// Snapshots of every entity, sorted by name for stable output.
    pub async fn list(&self) -> Vec<EntitySnapshot> {
        let entities = self.entities.read().await;
        let mut out: Vec<_> = entities
            .iter()
            .map(|(name, e)| e.snapshot(name))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// The one mutable attribute: retag an entity's site affiliation.
    pub async fn set_site_id(&self, name: &str, site_id: Option<String>) -> Result<(), Error> {
        let mut entities = self.entities.write().await;
        match entities.get_mut(name) {
            Some(Entity::Listener(h)) => {
                h.set_site_id(site_id);
                Ok(())
            }
            Some(Entity::Connector(h)) => {
                h.set_site_id(site_id);
                Ok(())
            }
            None => Err(Error::NoSuchEntity(name.to_owned())),
        }
    }

    /// Administratively reset a single tunneled connection by id. Connector
    /// dispatcher placeholders refuse this.
    pub fn force_close_connection(&self, id: u64) -> Result<(), Error> {
        self.mesh.force_close_connection(id)
    }

    /// Create every endpoint named in the environment. Returns how many
    /// entities came up.
    pub async fn apply_env(&self) -> Result<usize, Error> {
        let encapsulation = encapsulation_from_env()?;
        let mut created = 0;
        for spec in entries_from_env(ENV_LISTENERS)? {
            self.create_listener(ListenerConfig {
                name: spec.name,
                address: spec.address,
                host: spec.host,
                port: spec.port,
                encapsulation,
                site_id: None,
                ssl_profile: None,
                authenticate_peer: false,
            })
            .await?;
            created += 1;
        }
        for spec in entries_from_env(ENV_CONNECTORS)? {
            self.create_connector(ConnectorConfig {
                name: spec.name,
                address: spec.address,
                host: spec.host,
                port: spec.port,
                encapsulation,
                site_id: None,
                ssl_profile: None,
                authenticate_peer: false,
            })
            .await?;
            created += 1;
        }
        Ok(created)
    }
}

/// One parsed `name=address@host:port` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub name: String,
    pub address: String,
    pub host: String,
    pub port: u16,
}

pub fn parse_endpoint_entry(entry: &str) -> Result<EndpointSpec, Error> {
    let (name, rest) = entry
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("missing '=' in endpoint entry {entry:?}")))?;
    let (address, hostport) = rest
        .split_once('@')
        .ok_or_else(|| Error::Config(format!("missing '@' in endpoint entry {entry:?}")))?;
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("missing port in endpoint entry {entry:?}")))?;
    if name.is_empty() || address.is_empty() || host.is_empty() {
        return Err(Error::Config(format!("empty field in endpoint entry {entry:?}")));
    }
    let port = port
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in endpoint entry {entry:?}")))?;
    Ok(EndpointSpec {
        name: name.to_owned(),
        address: address.to_owned(),
        host: host.to_owned(),
        port,
    })
}

fn entries_from_env(var: &str) -> Result<Vec<EndpointSpec>, Error> {
    match env::var(var) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_endpoint_entry)
            .collect(),
        Err(_) => Ok(Vec::new()),
    }
}

pub fn encapsulation_from_env() -> Result<Encapsulation, Error> {
    match env::var(ENV_ENCAPSULATION) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid {ENV_ENCAPSULATION} value {raw:?}"))),
        Err(_) => Ok(Encapsulation::default()),
    }
}
