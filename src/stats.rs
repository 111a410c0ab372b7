//! Per-entity counters, exposed read-only through the management API.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Derived operational state of an endpoint: `Up` iff at least one reachable
/// connector exists for its address anywhere in the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperStatus {
    Up,
    Down,
}

impl OperStatus {
    pub fn from_connector_count(count: usize) -> Self {
        if count > 0 {
            Self::Up
        } else {
            Self::Down
        }
    }
}

impl std::fmt::Display for OperStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => f.write_str("up"),
            Self::Down => f.write_str("down"),
        }
    }
}

/// Byte and connection counters owned by a listener or connector entity.
///
/// `bytes_in` counts payload read from local sockets into the mesh;
/// `bytes_out` counts payload written from the mesh to local sockets. In an
/// echo scenario the two match in aggregate.
#[derive(Debug, Default)]
pub struct EndpointStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

impl EndpointStats {
    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of an entity's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EndpointStats::default();
        stats.add_bytes_in(100);
        stats.add_bytes_in(50);
        stats.add_bytes_out(150);
        stats.inc_opened();
        stats.inc_opened();
        stats.inc_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 150);
        assert_eq!(snap.bytes_out, 150);
        assert_eq!(snap.connections_opened, 2);
        assert_eq!(snap.connections_closed, 1);
    }

    #[test]
    fn oper_status_from_count() {
        assert_eq!(OperStatus::from_connector_count(0), OperStatus::Down);
        assert_eq!(OperStatus::from_connector_count(1), OperStatus::Up);
        assert_eq!(OperStatus::from_connector_count(5), OperStatus::Up);
        assert_eq!(OperStatus::Down.to_string(), "down");
    }
}
