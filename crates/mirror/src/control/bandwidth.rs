//! Upstream rate limiting. A token bucket per connection, refilled from a
//! shared upstream budget that is split by each peer's requested quality.
//! The split is approximate on purpose; fairness over seconds, not per tick.

use std::time::Duration;

use super::packet::MAX_PACKET_SIZE;

/// Assumed demand for peers that never sent a rate request.
const DEFAULT_BPS: u32 = 16 * 1024;

/// Burst headroom as a fraction of the per-second rate.
const BURST_FRACTION: f32 = 0.25;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BandwidthLimiter {
    /// Total outgoing bytes/sec across all connections; 0 = unlimited.
    pub total_bps: u32,
    /// Hard cap per connection; 0 = unlimited.
    pub per_conn_bps: u32,
}

impl BandwidthLimiter {
    /// Bytes/sec granted to the connection with demand `desired` given the
    /// summed demand of all live connections.
    pub fn grant(&self, desired: u32, total_desired: u32) -> u32 {
        let mut grant = if self.total_bps == 0 {
            desired
        } else if total_desired <= self.total_bps {
            desired
        } else {
            // Oversubscribed: ration proportionally to demand.
            ((desired as u64 * self.total_bps as u64) / total_desired.max(1) as u64) as u32
        };
        if self.per_conn_bps != 0 {
            grant = grant.min(self.per_conn_bps);
        }
        grant.max(MAX_PACKET_SIZE as u32)
    }
}

/// Per-connection spending state.
#[derive(Debug)]
pub(crate) struct ConnBudget {
    bytes: f32,
    /// Peer's requested packet rate / packet size, from a rate request item.
    pub requested_pps: u16,
    pub requested_bpp: u16,
    since_packet: Duration,
}

impl ConnBudget {
    pub fn new() -> Self {
        Self {
            bytes: MAX_PACKET_SIZE as f32,
            requested_pps: 0,
            requested_bpp: 0,
            since_packet: Duration::from_secs(1),
        }
    }

    pub fn desired_bps(&self) -> u32 {
        if self.requested_pps == 0 || self.requested_bpp == 0 {
            DEFAULT_BPS
        } else {
            self.requested_pps as u32 * self.requested_bpp as u32
        }
    }

    pub fn refill(&mut self, granted_bps: u32, elapsed: Duration) {
        self.since_packet += elapsed;
        let rate = granted_bps as f32;
        self.bytes = (self.bytes + rate * elapsed.as_secs_f32())
            .min((rate * BURST_FRACTION).max(MAX_PACKET_SIZE as f32));
    }

    /// Whether packet pacing allows a send right now.
    pub fn packet_due(&self) -> bool {
        if self.requested_pps == 0 {
            return true;
        }
        self.since_packet >= Duration::from_secs(1) / self.requested_pps as u32
    }

    /// Bytes currently in the bucket.
    pub fn available(&self) -> usize {
        self.bytes as usize
    }

    /// Spend `bytes` from the bucket; false leaves the bucket untouched and
    /// the data queued for a later cycle.
    pub fn try_spend(&mut self, bytes: usize) -> bool {
        if self.bytes < bytes as f32 {
            return false;
        }
        self.bytes -= bytes as f32;
        self.since_packet = Duration::ZERO;
        true
    }

    /// Preferred packet payload size for this peer.
    pub fn packet_size(&self) -> usize {
        if self.requested_bpp == 0 {
            MAX_PACKET_SIZE
        } else {
            (self.requested_bpp as usize).clamp(64, MAX_PACKET_SIZE)
        }
    }
}
