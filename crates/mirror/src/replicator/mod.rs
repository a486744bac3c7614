//! Replication strategies. A node owns an ordered list of replicators; the
//! position in that list is the field identifier shared with the peer, so
//! both ends must register identical lists in identical order.

mod interpolate;
mod movement;
mod numeric;

pub use interpolate::InterpolateReplicator;
pub use movement::{
    ErrorThreshold, MoveHistoryEntry, MoveListener, MovementConfig, MovementReplicator,
};
pub use numeric::{BlockReplicator, ElementKind, StringReplicator, ValueReplicator};

use std::any::Any;

use bitflags::bitflags;

use crate::bitstream::BitStream;
use crate::control::ConnId;
use crate::node::NodeRole;

bitflags! {
    /// Per-field replication behavior. Orthogonal; combine freely except
    /// where documented.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RepFlags: u8 {
        /// Lost updates are not retransmitted (a newer one will follow).
        const UNRELIABLE     = 1 << 0;
        /// Reliable, but a lost update is replaced by the current value
        /// instead of the stale one.
        const MOST_RECENT    = 1 << 1;
        /// Grouped behind a single presence bit; near-zero overhead while
        /// untouched.
        const RARELY_CHANGED = 1 << 2;
        /// Sent once per link, then never again. Implies rarely-changed;
        /// excludes `START_CLEAN`.
        const ONLY_ONCE      = 1 << 3;
        /// Updates pass through the node's replication interceptor.
        const INTERCEPT      = 1 << 4;
        /// The initial value is considered already known to new links.
        const START_CLEAN    = 1 << 5;
    }
}

bitflags! {
    /// Which role pairs a field travels between.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RepRules: u8 {
        const AUTH_TO_PROXY = 1 << 0;
        const AUTH_TO_OWNER = 1 << 1;
        const OWNER_TO_AUTH = 1 << 2;
        const AUTH_TO_ALL   = Self::AUTH_TO_PROXY.bits() | Self::AUTH_TO_OWNER.bits();
    }
}

impl RepRules {
    /// Whether a field with these rules flows from `local` to `remote`.
    pub fn sends_between(&self, local: NodeRole, remote: NodeRole) -> bool {
        match (local, remote) {
            (NodeRole::Authority, NodeRole::Proxy) => self.contains(RepRules::AUTH_TO_PROXY),
            (NodeRole::Authority, NodeRole::Owner) => self.contains(RepRules::AUTH_TO_OWNER),
            (NodeRole::Owner, NodeRole::Authority) => self.contains(RepRules::OWNER_TO_AUTH),
            _ => false,
        }
    }
}

/// Shared per-field configuration.
#[derive(Debug, Clone)]
pub struct ReplicatorSetup {
    pub flags: RepFlags,
    pub rules: RepRules,
    /// Routes intercepted updates to the matching interceptor registration.
    pub intercept_id: u8,
    /// Advisory floor between two updates of this field, in ms.
    pub min_delay: Option<u16>,
    /// Advisory ceiling; the field is resent even if clean once exceeded.
    pub max_delay: Option<u16>,
}

impl ReplicatorSetup {
    pub fn new(flags: RepFlags, rules: RepRules) -> Self {
        Self {
            flags,
            rules,
            intercept_id: 0,
            min_delay: None,
            max_delay: None,
        }
    }

    pub fn with_delays(mut self, min: Option<u16>, max: Option<u16>) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn with_intercept(mut self, id: u8) -> Self {
        self.flags |= RepFlags::INTERCEPT;
        self.intercept_id = id;
        self
    }

    /// ONLY_ONCE implies the rarely-changed grouping.
    pub fn is_rarely_changed(&self) -> bool {
        self.flags
            .intersects(RepFlags::RARELY_CHANGED | RepFlags::ONLY_ONCE)
    }
}

/// Owned snapshot of an upcoming field value, produced by `peek` without
/// consuming the stream. Interceptors use this to inspect vetoed updates.
#[derive(Debug, Clone, PartialEq)]
pub enum PeekValue {
    None,
    Int(i64),
    Float(f32),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

/// Common surface of every replicator.
pub trait Replicator {
    fn setup(&self) -> &ReplicatorSetup;

    /// Per-tick work (interpolation blending, extrapolation). Driven by
    /// `Control::process_replicators`.
    fn process(&mut self, _role: NodeRole, _sim_time_ms: u32) {}

    /// Decode the upcoming update from `stream` without consuming it
    /// (cursor is restored before returning).
    fn peek(&self, stream: &mut BitStream) -> PeekValue;

    /// Typed access for applications holding `&mut dyn` replicators.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shadow-compared field: the control polls `check_state` once per output
/// cycle and fans the dirty result out to every relevant link.
pub trait ReplicatorBasic: Replicator {
    /// True if the value changed since the last poll.
    fn check_state(&mut self) -> bool;

    /// Append the current value.
    fn pack(&mut self, stream: &mut BitStream);

    /// Read one update. Must consume exactly the bits `pack` wrote even
    /// when `store` is false (interceptor veto); anything else
    /// desynchronizes the link.
    fn unpack(&mut self, stream: &mut BitStream, store: bool, time_sent: u32);
}

/// Delivery class for self-timed replicator sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancedMode {
    ReliableUnordered,
    Unreliable,
    /// Unreliable, but delivery or loss is reported back through
    /// `on_data_acked` / `on_data_lost` with the reference id.
    UnreliableNotify,
}

#[derive(Debug)]
pub struct AdvancedSend {
    pub mode: AdvancedMode,
    pub payload: BitStream,
    pub reference_id: Option<u32>,
}

/// Collects sends issued from inside `on_pre_send`; drained by the control
/// into the outgoing packet.
#[derive(Debug, Default)]
pub struct SendContext {
    sends: Vec<AdvancedSend>,
}

impl SendContext {
    pub fn send_data(&mut self, mode: AdvancedMode, payload: BitStream) {
        let reference_id = None;
        self.sends.push(AdvancedSend {
            mode,
            payload,
            reference_id,
        });
    }

    pub fn send_data_notify(&mut self, payload: BitStream, reference_id: u32) {
        self.sends.push(AdvancedSend {
            mode: AdvancedMode::UnreliableNotify,
            payload,
            reference_id: Some(reference_id),
        });
    }

    pub(crate) fn drain(&mut self) -> Vec<AdvancedSend> {
        std::mem::take(&mut self.sends)
    }
}

/// Self-timed replicator: decides itself when and what to send, and hears
/// about delivery, losses, link churn and role changes.
pub trait ReplicatorAdvanced: Replicator {
    /// Called once per packed node per connection during output. The
    /// replicator does its own min/max-delay bookkeeping through the
    /// `last_update` timestamp cell (per link, owned by the control).
    fn on_pre_send(
        &mut self,
        ctx: &mut SendContext,
        conn: ConnId,
        remote_role: NodeRole,
        last_update: &mut u32,
        now_ms: u32,
    );

    /// One payload previously issued through a `SendContext` arrived. Must
    /// consume the whole payload even when `store` is false.
    fn on_data_received(
        &mut self,
        conn: ConnId,
        remote_role: NodeRole,
        payload: &mut BitStream,
        store: bool,
        time_sent: u32,
    );

    fn on_data_acked(&mut self, _conn: ConnId, _reference_id: u32, _payload: BitStream) {}

    fn on_data_lost(&mut self, _conn: ConnId, _reference_id: u32, _payload: BitStream) {}

    /// Any packet arrived on this connection (ack piggyback opportunity).
    fn on_packet_received(&mut self, _conn: ConnId) {}

    fn on_connection_added(&mut self, _conn: ConnId, _remote_role: NodeRole) {}

    fn on_connection_removed(&mut self, _conn: ConnId, _remote_role: NodeRole) {}

    fn on_local_role_changed(&mut self, _old: NodeRole, _new: NodeRole) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_direction_matrix() {
        let auth_all = RepRules::AUTH_TO_ALL;
        assert!(auth_all.sends_between(NodeRole::Authority, NodeRole::Proxy));
        assert!(auth_all.sends_between(NodeRole::Authority, NodeRole::Owner));
        assert!(!auth_all.sends_between(NodeRole::Owner, NodeRole::Authority));

        let owner = RepRules::OWNER_TO_AUTH;
        assert!(owner.sends_between(NodeRole::Owner, NodeRole::Authority));
        assert!(!owner.sends_between(NodeRole::Authority, NodeRole::Proxy));
        assert!(!owner.sends_between(NodeRole::Proxy, NodeRole::Authority));
    }

    #[test]
    fn only_once_counts_as_rarely_changed() {
        let setup = ReplicatorSetup::new(RepFlags::ONLY_ONCE, RepRules::AUTH_TO_ALL);
        assert!(setup.is_rarely_changed());
        let plain = ReplicatorSetup::new(RepFlags::empty(), RepRules::AUTH_TO_ALL);
        assert!(!plain.is_rarely_changed());
    }

    #[test]
    fn send_context_collects() {
        let mut ctx = SendContext::default();
        ctx.send_data(AdvancedMode::Unreliable, BitStream::new());
        ctx.send_data_notify(BitStream::new(), 9);
        let sends = ctx.drain();
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].reference_id, Some(9));
        assert!(ctx.drain().is_empty());
    }
}
