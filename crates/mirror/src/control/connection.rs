//! Per-connection state: handshake progress, item reliability queues,
//! packet assembly, node/class translation tables and the impairment
//! simulation.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::bitstream::BitStream;
use crate::node::{ClassId, NodeHandle};

use super::bandwidth::ConnBudget;
use super::packet::{Envelope, Item, PacketHeader};
use super::stats::{ConnectionStats, LossSimulation};
use super::tracking::{AckTracker, ReceiveTracker, sequence_greater_than};
use super::zoid::ZoidTransition;
use super::{ConnId, SendMode};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const CONNECT_RESEND: Duration = Duration::from_millis(500);
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period for flushing the disconnect reason before the entry dies.
pub(crate) const DISCONNECT_LINGER: Duration = Duration::from_millis(500);

const ITEM_ID_WINDOW: usize = 1024;
const MAX_IN_FLIGHT: usize = 4096;

#[derive(Debug)]
pub(crate) enum ConnState {
    /// Outgoing: request sent, waiting for the challenge.
    RequestSent,
    /// Outgoing: challenge answered, waiting for accept/deny.
    ResponseSent,
    /// Incoming: challenge sent, waiting for the response. The connect
    /// request stream is held until the salt checks out.
    ChallengeSent { request: BitStream },
    Connected,
    /// Reason queued; entry lingers until flushed or timed out.
    Disconnecting { since: Instant },
    Closed,
}

/// Loss handling attached to one queued item.
pub(crate) struct NotifyRef {
    pub node: NodeHandle,
    pub slot: usize,
    pub reference_id: u32,
    /// Copy of the payload handed back through the ack/loss callback.
    pub payload: BitStream,
}

pub(crate) struct QueuedItem {
    pub item: Item,
    pub mode: SendMode,
    pub item_id: Option<u32>,
    pub order_seq: Option<u32>,
    pub notify: Option<NotifyRef>,
    /// Most-recent fields to re-dirty when the carrying packet is lost.
    pub redirty: Option<(NodeHandle, Vec<usize>)>,
}

struct InFlight {
    packet_seq: u32,
    item: QueuedItem,
}

pub(crate) struct Connection {
    pub id: ConnId,
    pub endpoint: crate::address::Endpoint,
    pub remote_control_id: u8,
    pub state: ConnState,
    pub local_salt: u32,
    pub remote_salt: u32,
    pub incoming: bool,
    /// Connect request payload kept for resends (outgoing side).
    pub connect_request: BitStream,
    pub connect_started: Instant,
    pub last_handshake_send: Instant,
    pub last_recv: Instant,
    pub last_send: Instant,

    ack_tracker: AckTracker,
    recv_tracker: ReceiveTracker,
    send_sequence: u32,
    next_item_id: u32,
    next_order_seq: u32,
    expected_order: u32,
    held_ordered: BTreeMap<u32, Item>,
    seen_item_ids: HashSet<u32>,
    seen_item_order: VecDeque<u32>,
    out_queue: VecDeque<QueuedItem>,
    /// Raw-data items bypass replication scheduling but still FIFO ahead
    /// of it inside the packet.
    raw_queue: VecDeque<QueuedItem>,
    in_flight: Vec<InFlight>,

    pub budget: ConnBudget,
    pub simulate: LossSimulation,
    delayed: VecDeque<(Instant, Vec<u8>)>,

    /// Remote class id -> local class, from the class-table exchange.
    pub remote_classes: HashMap<u16, ClassId>,
    pub nodes_by_net: HashMap<u32, NodeHandle>,
    pub net_of_node: HashMap<NodeHandle, u32>,
    pub announced: HashSet<NodeHandle>,

    pub zoid_level: u32,
    /// Level of an outgoing zoid request still waiting for the echo.
    pub pending_zoid: Option<u32>,
    pub transition: Option<ZoidTransition>,

    pub user_data: Option<Box<dyn Any>>,

    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    packets_lost: u64,
}

impl Connection {
    pub fn new(
        id: ConnId,
        endpoint: crate::address::Endpoint,
        remote_control_id: u8,
        state: ConnState,
        local_salt: u32,
        incoming: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            remote_control_id,
            state,
            local_salt,
            remote_salt: 0,
            incoming,
            connect_request: BitStream::new(),
            connect_started: now,
            last_handshake_send: now,
            last_recv: now,
            last_send: now,
            ack_tracker: AckTracker::new(MAX_IN_FLIGHT),
            recv_tracker: ReceiveTracker::new(),
            send_sequence: 0,
            next_item_id: 0,
            next_order_seq: 0,
            expected_order: 0,
            held_ordered: BTreeMap::new(),
            seen_item_ids: HashSet::new(),
            seen_item_order: VecDeque::new(),
            out_queue: VecDeque::new(),
            raw_queue: VecDeque::new(),
            in_flight: Vec::new(),
            budget: ConnBudget::new(),
            simulate: LossSimulation::default(),
            delayed: VecDeque::new(),
            remote_classes: HashMap::new(),
            nodes_by_net: HashMap::new(),
            net_of_node: HashMap::new(),
            announced: HashSet::new(),
            zoid_level: 0,
            pending_zoid: None,
            transition: None,
            user_data: None,
            packets_sent: 0,
            packets_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            packets_lost: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /* outgoing items */

    pub fn queue(&mut self, item: Item, mode: SendMode) {
        self.queue_full(item, mode, None, None);
    }

    pub fn queue_full(
        &mut self,
        item: Item,
        mode: SendMode,
        notify: Option<NotifyRef>,
        redirty: Option<(NodeHandle, Vec<usize>)>,
    ) {
        let queued = self.tag(item, mode, notify, redirty);
        self.out_queue.push_back(queued);
    }

    /// Raw sends jump the replication scheduler but stay FIFO among
    /// themselves.
    pub fn queue_raw(&mut self, item: Item, mode: SendMode) {
        let queued = self.tag(item, mode, None, None);
        self.raw_queue.push_back(queued);
    }

    fn tag(
        &mut self,
        item: Item,
        mode: SendMode,
        notify: Option<NotifyRef>,
        redirty: Option<(NodeHandle, Vec<usize>)>,
    ) -> QueuedItem {
        let item_id = matches!(
            mode,
            SendMode::ReliableOrdered | SendMode::ReliableUnordered | SendMode::UnreliableNotify
        )
        .then(|| {
            self.next_item_id = self.next_item_id.wrapping_add(1);
            self.next_item_id
        });
        let order_seq = matches!(mode, SendMode::ReliableOrdered).then(|| {
            let seq = self.next_order_seq;
            self.next_order_seq = self.next_order_seq.wrapping_add(1);
            seq
        });
        QueuedItem {
            item,
            mode,
            item_id,
            order_seq,
            notify,
            redirty,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.out_queue.is_empty() || !self.raw_queue.is_empty()
    }

    /// Assemble the next packet, raw FIFO first, up to `max_bytes`.
    /// `None` when nothing is queued.
    pub fn build_packet(&mut self, now_ms: u32, max_bytes: usize) -> Option<Vec<u8>> {
        if !self.has_pending() {
            return None;
        }
        self.send_sequence = self.send_sequence.wrapping_add(1);
        let sequence = self.send_sequence;
        let (ack, ack_bitfield) = self.recv_tracker.ack_data();

        let mut stream = BitStream::with_capacity(max_bytes);
        PacketHeader {
            sequence,
            ack,
            ack_bitfield,
            time_sent: now_ms,
        }
        .write(&mut stream);

        let budget_bits = (max_bytes as u64) * 8;
        let mut packed = 0usize;
        for queue_is_raw in [true, false] {
            loop {
                let queue = if queue_is_raw {
                    &mut self.raw_queue
                } else {
                    &mut self.out_queue
                };
                let Some(queued) = queue.pop_front() else {
                    break;
                };
                let envelope = Envelope {
                    item: queued.item,
                    item_id: queued.item_id,
                    order_seq: queued.order_seq,
                };
                // +7 keeps room for the end-marker padding.
                if stream.bit_count() + envelope.encoded_bits() + 7 > budget_bits {
                    if packed == 0 && stream.bit_count() + envelope.encoded_bits() + 7
                        > (super::packet::MAX_PACKET_SIZE as u64) * 8
                    {
                        // Oversized single item can never fit; dropping it
                        // beats wedging the queue.
                        log::error!("{}: dropping oversized outgoing item", self.id);
                        continue;
                    }
                    let queue = if queue_is_raw {
                        &mut self.raw_queue
                    } else {
                        &mut self.out_queue
                    };
                    queue.push_front(QueuedItem {
                        item: envelope.item,
                        item_id: envelope.item_id,
                        order_seq: envelope.order_seq,
                        mode: queued.mode,
                        notify: queued.notify,
                        redirty: queued.redirty,
                    });
                    break;
                }
                envelope.write(&mut stream);
                packed += 1;
                let tracked = QueuedItem {
                    item: envelope.item,
                    item_id: envelope.item_id,
                    order_seq: envelope.order_seq,
                    mode: queued.mode,
                    notify: queued.notify,
                    redirty: queued.redirty,
                };
                if tracked.item_id.is_some()
                    || tracked.notify.is_some()
                    || tracked.redirty.is_some()
                {
                    if self.in_flight.len() >= MAX_IN_FLIGHT {
                        self.in_flight.remove(0);
                    }
                    self.in_flight.push(InFlight {
                        packet_seq: sequence,
                        item: tracked,
                    });
                }
            }
        }
        if packed == 0 {
            // Everything deferred to a later packet; roll the sequence back.
            self.send_sequence = self.send_sequence.wrapping_sub(1);
            return None;
        }
        self.ack_tracker.track_packet(sequence);
        let bytes = stream.serialize();
        self.packets_sent += 1;
        self.bytes_sent += bytes.len() as u64;
        self.last_send = Instant::now();
        Some(bytes)
    }

    /* incoming packets */

    /// Stats + dedup for a parsed header. False for duplicate packets.
    pub fn register_packet(&mut self, header: &PacketHeader, wire_len: usize) -> bool {
        self.packets_received += 1;
        self.bytes_received += wire_len as u64;
        self.last_recv = Instant::now();
        self.recv_tracker.record_received(header.sequence)
    }

    /// Items whose carrying packets were acked and that want an ack
    /// callback.
    pub fn collect_acks(&mut self, ack: u32, ack_bitfield: u32) -> Vec<QueuedItem> {
        let acked = self.ack_tracker.process_ack(ack, ack_bitfield);
        if acked.is_empty() {
            return Vec::new();
        }
        let mut notified = Vec::new();
        let mut keep = Vec::new();
        for entry in self.in_flight.drain(..) {
            if acked.contains(&entry.packet_seq) {
                if entry.item.notify.is_some() {
                    notified.push(entry.item);
                }
            } else {
                keep.push(entry);
            }
        }
        self.in_flight = keep;
        notified
    }

    /// RTO-expired items. Reliable ones are silently requeued; the rest
    /// (notify payloads, most-recent field markers) are returned for the
    /// control to dispatch.
    pub fn collect_losses(&mut self) -> Vec<QueuedItem> {
        let lost = self.ack_tracker.take_lost();
        if lost.is_empty() {
            return Vec::new();
        }
        self.packets_lost += lost.len() as u64;
        let mut requeue = Vec::new();
        let mut out = Vec::new();
        let mut keep = Vec::new();
        for entry in self.in_flight.drain(..) {
            if !lost.contains(&entry.packet_seq) {
                keep.push(entry);
                continue;
            }
            match entry.item.mode {
                SendMode::ReliableOrdered | SendMode::ReliableUnordered => {
                    requeue.push(entry.item)
                }
                _ => out.push(entry.item),
            }
        }
        self.in_flight = keep;
        // Front-of-queue in original send order.
        for item in requeue.into_iter().rev() {
            self.out_queue.push_front(item);
        }
        out
    }

    /// Item-level dedup plus ordered hold-back. Returns the items now
    /// deliverable, in order.
    pub fn order_incoming(&mut self, envelope: Envelope) -> Vec<Item> {
        if let Some(id) = envelope.item_id {
            if self.seen_item_ids.contains(&id) {
                return Vec::new();
            }
            if self.seen_item_order.len() >= ITEM_ID_WINDOW {
                if let Some(old) = self.seen_item_order.pop_front() {
                    self.seen_item_ids.remove(&old);
                }
            }
            self.seen_item_ids.insert(id);
            self.seen_item_order.push_back(id);
        }
        let Some(seq) = envelope.order_seq else {
            return vec![envelope.item];
        };
        if seq == self.expected_order {
            let mut ready = vec![envelope.item];
            self.expected_order = self.expected_order.wrapping_add(1);
            while let Some(item) = self.held_ordered.remove(&self.expected_order) {
                ready.push(item);
                self.expected_order = self.expected_order.wrapping_add(1);
            }
            ready
        } else if sequence_greater_than(seq, self.expected_order) {
            self.held_ordered.insert(seq, envelope.item);
            Vec::new()
        } else {
            // Stale resend of something already delivered.
            Vec::new()
        }
    }

    /* impairment + pacing */

    /// Run the outgoing frame through the loss/lag simulation. `None`
    /// means dropped or delayed.
    pub fn stage_outgoing(&mut self, frame: Vec<u8>) -> Option<Vec<u8>> {
        if self.simulate.should_drop() {
            return None;
        }
        if self.simulate.lag_ms > 0 {
            let due = Instant::now() + Duration::from_millis(self.simulate.lag_ms as u64);
            self.delayed.push_back((due, frame));
            return None;
        }
        Some(frame)
    }

    pub fn due_frames(&mut self) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut out = Vec::new();
        while self.delayed.front().is_some_and(|(due, _)| *due <= now) {
            out.push(self.delayed.pop_front().unwrap().1);
        }
        out
    }

    /* stats */

    pub fn srtt(&self) -> f32 {
        self.ack_tracker.srtt()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            rtt_ms: self.ack_tracker.srtt(),
            rtt_variance: self.ack_tracker.rtt_var(),
            packet_loss_percent: if self.packets_sent == 0 {
                0.0
            } else {
                self.packets_lost as f32 / self.packets_sent as f32 * 100.0
            },
        }
    }
}
