//! Pollable per-node event queue.

use std::collections::VecDeque;

use crate::bitstream::BitStream;
use crate::control::ConnId;

use super::NodeRole;

#[derive(Debug)]
pub enum NodeEventKind {
    /// The node was linked to a new connection.
    Init,
    /// The node was unlinked (peer removed it or the connection closed).
    Removed,
    /// Authority only: a zoid transition waits for this node's
    /// `set_sync_result` for the given connection.
    SyncRequest,
    /// Application event sent by the peer node.
    User(BitStream),
    /// The peer offers a file; answer with `accept_file`.
    FileIncoming { id: u32, request: BitStream },
    /// A chunk of an accepted transfer arrived.
    FileData { id: u32 },
    FileComplete { id: u32 },
    FileAborted { id: u32 },
}

#[derive(Debug)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    /// Connection the event originated from; `None` for purely local ones.
    pub source: Option<ConnId>,
    /// The remote node's role on that connection.
    pub remote_role: Option<NodeRole>,
    /// Sender-clock estimate of when the triggering packet left, in ms.
    pub estimated_time_sent: u32,
}

impl NodeEvent {
    pub(crate) fn local(kind: NodeEventKind, conn: Option<ConnId>) -> Self {
        Self {
            kind,
            source: conn,
            remote_role: None,
            estimated_time_sent: 0,
        }
    }
}

const MAX_PENDING_EVENTS: usize = 256;

#[derive(Debug, Default)]
pub(crate) struct NodeEventQueue {
    pending: VecDeque<NodeEvent>,
}

impl NodeEventQueue {
    pub fn push(&mut self, event: NodeEvent) {
        if self.pending.len() >= MAX_PENDING_EVENTS {
            self.pending.pop_front();
        }
        self.pending.push_back(event);
    }

    pub fn has_waiting(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn next(&mut self) -> Option<NodeEvent> {
        self.pending.pop_front()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
