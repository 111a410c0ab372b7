//! Culvert — TCP byte-stream tunneling over a logical-address message mesh.
//!
//! A listener accepts ordinary TCP connections and chops the byte stream
//! into sequenced deliveries; a connector on the far side reassembles them
//! and dials the real backend. In between sits a many-to-many mesh that
//! routes by logical address and balances across every connector that
//! registered it. The adaptor provides:
//!
//! 1. **Stream multiplexing** — each TCP connection becomes one mesh
//!    sub-stream with strict per-stream ordering ([`codec`]).
//!
//! 2. **Credit flow control** — a per-direction byte window bounds what one
//!    stalled consumer can pin in mesh memory; settlements return credit in
//!    half-window batches ([`window`]).
//!
//! 3. **Lifecycle fidelity** — half-close, orderly close, and reset all
//!    propagate end to end through a six-state machine ([`conn`]).
//!
//! 4. **Management** — named entity CRUD, derived operational status, and
//!    per-entity counters ([`manage`]).

pub mod codec;
pub mod conn;
pub mod connector;
pub mod error;
pub mod listener;
pub mod manage;
pub mod mesh;
pub mod metrics;
pub mod stats;
pub mod window;

pub use codec::{Control, Delivery, Encapsulation, Settlement};
pub use connector::{ConnectorConfig, ConnectorHandle};
pub use error::Error;
pub use listener::{ListenerConfig, ListenerHandle};
pub use manage::{EntitySnapshot, Management};
pub use mesh::MeshRouter;
pub use stats::{OperStatus, StatsSnapshot};
