//! Metric name constants and recording helpers.
//!
//! All metric names live here. Call sites use these constants rather than
//! raw strings to prevent typos and keep renaming centralized. The entity
//! name is attached as a label so multiple listeners/connectors can be told
//! apart on one exporter.

use metrics::{counter, gauge};

/// Total payload bytes read from local sockets into the mesh.
pub const TUNNEL_BYTES_IN: &str = "culvert_tunnel_bytes_in_total";
/// Total payload bytes written from the mesh to local sockets.
pub const TUNNEL_BYTES_OUT: &str = "culvert_tunnel_bytes_out_total";
/// Total connections that reached Established.
pub const TUNNEL_CONNS_OPENED: &str = "culvert_tunnel_connections_opened_total";
/// Total connections that reached Closed or Reset.
pub const TUNNEL_CONNS_CLOSED: &str = "culvert_tunnel_connections_closed_total";
/// Total connections terminated by Reset (socket error, protocol violation,
/// administrative deletion).
pub const TUNNEL_RESETS: &str = "culvert_tunnel_resets_total";
/// Accepted sockets refused because the address had no reachable connector.
pub const TUNNEL_REFUSED: &str = "culvert_tunnel_refused_total";
/// Current number of live mesh streams (gauge).
pub const MESH_STREAMS_ACTIVE: &str = "culvert_mesh_streams_active";

/// Record payload bytes flowing socket → mesh for an entity.
#[inline]
pub fn tunnel_bytes_in(entity: &str, n: usize) {
    let labels = [("entity", entity.to_owned())];
    counter!(TUNNEL_BYTES_IN, &labels).increment(n as u64);
}

/// Record payload bytes flowing mesh → socket for an entity.
#[inline]
pub fn tunnel_bytes_out(entity: &str, n: usize) {
    let labels = [("entity", entity.to_owned())];
    counter!(TUNNEL_BYTES_OUT, &labels).increment(n as u64);
}

/// Record a connection reaching Established.
#[inline]
pub fn tunnel_opened(entity: &str) {
    let labels = [("entity", entity.to_owned())];
    counter!(TUNNEL_CONNS_OPENED, &labels).increment(1);
    gauge!(MESH_STREAMS_ACTIVE).increment(1.0);
}

/// Record a connection reaching Closed or Reset.
#[inline]
pub fn tunnel_closed(entity: &str, was_reset: bool) {
    let labels = [("entity", entity.to_owned())];
    counter!(TUNNEL_CONNS_CLOSED, &labels).increment(1);
    if was_reset {
        counter!(TUNNEL_RESETS, &labels).increment(1);
    }
    gauge!(MESH_STREAMS_ACTIVE).decrement(1.0);
}

/// Record an accepted socket refused while the listener was down.
#[inline]
pub fn tunnel_refused(entity: &str) {
    let labels = [("entity", entity.to_owned())];
    counter!(TUNNEL_REFUSED, &labels).increment(1);
}
