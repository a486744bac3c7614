//! Zoid transition bookkeeping for one connection. Both ends run their own
//! must-sync barrier over their own nodes and exchange a single result;
//! the transition completes only when both results are in and positive.

use std::collections::HashSet;

use crate::bitstream::BitStream;
use crate::node::NodeHandle;

#[derive(Debug)]
pub(crate) struct ZoidTransition {
    pub target_level: u32,
    pub previous_level: u32,
    /// Must-sync nodes grouped by ascending order; one group syncs at a
    /// time, nodes inside a group concurrently.
    groups: Vec<Vec<NodeHandle>>,
    next_group: usize,
    pending: HashSet<NodeHandle>,
    pub local_done: bool,
    pub local_success: bool,
    pub fail_reason: BitStream,
    /// Local result already queued for the peer.
    pub result_sent: bool,
    pub remote_result: Option<(bool, BitStream)>,
    /// Nodes announced during this transition, removed again on failure.
    pub announced_during: Vec<NodeHandle>,
}

impl ZoidTransition {
    /// `sync_nodes` is (barrier order, handle) of every must-sync node
    /// applying for the target level.
    pub fn new(target_level: u32, previous_level: u32, mut sync_nodes: Vec<(u32, NodeHandle)>) -> Self {
        sync_nodes.sort_by_key(|(order, _)| *order);
        let mut groups: Vec<Vec<NodeHandle>> = Vec::new();
        let mut last_order = None;
        for (order, handle) in sync_nodes {
            if last_order == Some(order) {
                groups.last_mut().unwrap().push(handle);
            } else {
                groups.push(vec![handle]);
                last_order = Some(order);
            }
        }
        Self {
            target_level,
            previous_level,
            groups,
            next_group: 0,
            pending: HashSet::new(),
            local_done: false,
            local_success: true,
            fail_reason: BitStream::new(),
            result_sent: false,
            remote_result: None,
            announced_during: Vec::new(),
        }
    }

    /// Open the next barrier group. `None` once every group ran, which
    /// marks the local side done.
    pub fn open_next_group(&mut self) -> Option<Vec<NodeHandle>> {
        debug_assert!(self.pending.is_empty());
        if self.next_group >= self.groups.len() {
            self.local_done = true;
            return None;
        }
        let group = self.groups[self.next_group].clone();
        self.next_group += 1;
        self.pending = group.iter().copied().collect();
        Some(group)
    }

    pub fn awaiting(&self, node: NodeHandle) -> bool {
        self.pending.contains(&node)
    }

    /// Some node of the current group has not reported yet.
    pub fn waiting(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Abort the local barrier without sending a result, after the peer
    /// already reported failure.
    pub fn force_done(&mut self) {
        self.pending.clear();
        self.local_done = true;
        self.result_sent = true;
    }

    /// One node reported its sync result. Returns true when the current
    /// group is complete (or the whole barrier just failed).
    pub fn report(&mut self, node: NodeHandle, success: bool, reason: BitStream) -> bool {
        if !self.pending.remove(&node) {
            return false;
        }
        if !success {
            self.local_done = true;
            self.local_success = false;
            self.fail_reason = reason;
            self.pending.clear();
            return true;
        }
        self.pending.is_empty()
    }

    pub fn record_remote(&mut self, success: bool, reason: BitStream) {
        self.remote_result = Some((success, reason));
    }

    /// Overall outcome once both sides reported; `None` while still in
    /// flight.
    pub fn outcome(&self) -> Option<bool> {
        if !self.local_done || !self.result_sent {
            return None;
        }
        self.remote_result
            .as_ref()
            .map(|(remote_ok, _)| self.local_success && *remote_ok)
    }

    /// Failure reason to surface locally, preferring the local one.
    pub fn failure_reason(&self) -> BitStream {
        if !self.local_success {
            self.fail_reason.clone()
        } else {
            self.remote_result
                .as_ref()
                .map(|(_, reason)| reason.clone())
                .unwrap_or_default()
        }
    }
}
