//! Per-direction credit windows.
//!
//! Each direction of a tunneled connection carries a `FlowWindow` on the
//! sending side and a `SettlementBatch` on the receiving side. The window
//! bounds the bytes in flight and unsettled on the mesh; the batch
//! accumulates accepted bytes and flushes a cumulative settlement once half
//! a window is pending, amortizing the per-delivery round trip.
//!
//! The structs are pure and synchronous. The async suspension lives in the
//! connection pumps: when `available()` hits zero the pump simply stops
//! reading its socket, the kernel's TCP receive window fills, and the
//! remote writer blocks. Backpressure, not data loss.

use tracing::warn;

/// Default maximum unsettled bytes in flight per direction. This is the
/// backpressure knob: one stalled consumer can hold at most this much of
/// the mesh's memory per connection.
pub const DEFAULT_WINDOW_BYTES: u64 = 128 * 1024;

/// Credit-based admission control for one direction of one connection.
#[derive(Debug, Clone)]
pub struct FlowWindow {
    capacity: u64,
    granted: u64,
    consumed: u64,
}

impl FlowWindow {
    /// A window with the full capacity granted up front.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            granted: capacity,
            consumed: 0,
        }
    }

    /// Bytes that may be sent before blocking.
    pub fn available(&self) -> u64 {
        self.granted - self.consumed
    }

    /// Consume credit for `n` bytes about to be sent. Returns false (and
    /// consumes nothing) if `n` exceeds availability — the caller must stop
    /// reading until settlements replenish the window.
    pub fn consume(&mut self, n: u64) -> bool {
        if n > self.available() {
            return false;
        }
        self.consumed += n;
        true
    }

    /// Return `n` bytes of credit after the peer accepted them.
    ///
    /// Replenishment is monotonic and never pushes the outstanding grant
    /// beyond capacity; an overshoot indicates a peer settling bytes it was
    /// never sent and is clamped.
    pub fn replenish(&mut self, n: u64) {
        let headroom = self.capacity - self.available();
        if n > headroom {
            warn!(
                n,
                headroom,
                "flow window replenishment exceeds outstanding bytes, clamping"
            );
            self.granted += headroom;
        } else {
            self.granted += n;
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Replenishment threshold for the receiving side: settle once this many
    /// bytes are pending.
    pub fn low_watermark(&self) -> u64 {
        (self.capacity / 2).max(1)
    }
}

/// Receiver-side accumulator for accepted-but-unsettled bytes.
#[derive(Debug, Clone)]
pub struct SettlementBatch {
    threshold: u64,
    pending_bytes: u64,
    highest_seq: u64,
}

impl SettlementBatch {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            pending_bytes: 0,
            highest_seq: 0,
        }
    }

    /// Record `bytes` accepted up to (and including) `seq`.
    pub fn record(&mut self, seq: u64, bytes: u64) {
        self.pending_bytes += bytes;
        self.highest_seq = self.highest_seq.max(seq);
    }

    /// Take the pending settlement if the batch threshold is reached.
    /// Returns `(up_to_seq, bytes)`.
    pub fn take_if_due(&mut self) -> Option<(u64, u64)> {
        if self.pending_bytes >= self.threshold {
            self.take()
        } else {
            None
        }
    }

    /// Take whatever is pending, due or not. Used at half-close and close so
    /// the sender's window is made whole before the stream winds down.
    pub fn take(&mut self) -> Option<(u64, u64)> {
        if self.pending_bytes == 0 {
            return None;
        }
        let out = (self.highest_seq, self.pending_bytes);
        self.pending_bytes = 0;
        Some(out)
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }
}
