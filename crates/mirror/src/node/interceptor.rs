//! Optional per-node hooks. Event interceptors choose push vs. pull
//! delivery per event kind; replication interceptors gate and observe
//! update traffic field by field.

use crate::bitstream::BitStream;
use crate::control::ConnId;
use crate::replicator::ReplicatorBasic;

use super::NodeRole;

/// Sees events before they land in the node's pollable queue. Returning
/// `true` keeps the event queued; `false` consumes it here.
pub trait EventInterceptor {
    fn on_init(&mut self, _conn: ConnId, _remote_role: NodeRole) -> bool {
        true
    }

    fn on_removed(&mut self, _conn: ConnId, _remote_role: NodeRole) -> bool {
        true
    }

    fn on_sync_request(&mut self, _conn: ConnId) -> bool {
        true
    }

    fn on_user_event(
        &mut self,
        _conn: ConnId,
        _remote_role: NodeRole,
        _payload: &mut BitStream,
        _estimated_time_sent: u32,
    ) -> bool {
        true
    }

    fn on_file_incoming(&mut self, _conn: ConnId, _id: u32, _request: &mut BitStream) -> bool {
        true
    }

    fn on_file_data(&mut self, _conn: ConnId, _id: u32) -> bool {
        true
    }

    fn on_file_complete(&mut self, _conn: ConnId, _id: u32) -> bool {
        true
    }

    fn on_file_aborted(&mut self, _conn: ConnId, _id: u32) -> bool {
        true
    }
}

/// Gates replication traffic. Outgoing vetoes suppress data before it is
/// packed; incoming vetoes flip the matching `unpack` to `store = false`,
/// which still consumes the exact field bits and keeps the stream aligned.
pub trait ReplicationInterceptor {
    /// About to announce this node to a connection. `false` skips the link.
    fn out_pre_replicate_node(&mut self, _conn: ConnId, _remote_role: NodeRole) -> bool {
        true
    }

    fn out_pre_dereplicate_node(&mut self, _conn: ConnId, _remote_role: NodeRole) -> bool {
        true
    }

    /// Node-level gate before packing any field for a connection.
    fn out_pre_update(&mut self, _conn: ConnId, _remote_role: NodeRole) -> bool {
        true
    }

    /// Per-field gate. The replicator is handed over for `peek` access.
    fn out_pre_update_item(
        &mut self,
        _conn: ConnId,
        _remote_role: NodeRole,
        _intercept_id: u8,
        _replicator: &mut dyn ReplicatorBasic,
    ) -> bool {
        true
    }

    /// Bit accounting after a node update was packed.
    fn out_post_update(
        &mut self,
        _conn: ConnId,
        _remote_role: NodeRole,
        _rep_bits: u64,
        _event_bits: u64,
        _meta_bits: u64,
    ) {
    }

    fn in_pre_update(&mut self, _conn: ConnId, _remote_role: NodeRole, _time_sent: u32) -> bool {
        true
    }

    /// Per-field store decision on receive. `replicator.peek(stream)` shows
    /// the pending value without consuming it.
    fn in_pre_update_item(
        &mut self,
        _conn: ConnId,
        _remote_role: NodeRole,
        _time_sent: u32,
        _intercept_id: u8,
        _replicator: &mut dyn ReplicatorBasic,
        _stream: &mut BitStream,
    ) -> bool {
        true
    }

    fn in_post_update(&mut self, _conn: ConnId, _remote_role: NodeRole, _time_sent: u32) {}
}
