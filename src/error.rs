use std::io;

/// Error taxonomy for the adaptor.
///
/// Every variant is connection-local: a failing connection is driven to
/// `Reset` and the process keeps serving sibling connections. Management
/// calls surface these as structured error responses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no connector reachable for address {0}")]
    AddressUnreachable(String),

    #[error("backend dial failed for {backend}: {source}")]
    BackendDial {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("forbidden: {0}")]
    AdminForbidden(String),

    #[error("no such entity: {0}")]
    NoSuchEntity(String),

    #[error("entity already exists: {0}")]
    EntityExists(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
