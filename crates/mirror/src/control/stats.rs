//! Per-connection traffic statistics and the debug loss/lag simulation.

/// Snapshot returned by `Control::connection_stats`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
}

/// Debug-only outgoing impairment. Applied before the socket, so the peer
/// sees genuine loss and delay.
#[derive(Debug, Clone, Default)]
pub struct LossSimulation {
    pub loss: f32,
    pub lag_ms: u32,
}

impl LossSimulation {
    pub fn should_drop(&self) -> bool {
        self.loss > 0.0 && rand_percent() < self.loss
    }
}

pub fn rand_percent() -> f32 {
    (rand_u64() % 10_000) as f32 / 10_000.0
}

/// Hash-of-clock randomness; good enough for salts and jitter, not for
/// anything security relevant.
pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish()
}
