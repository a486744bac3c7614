//! The endpoint. A `Control` owns the transport, the class registry, the
//! node and connection tables and the zoid state machine, and is driven by
//! the application through `process_input` / `process_replicators` /
//! `process_output`. Single threaded; every callback runs synchronously on
//! the calling thread and may re-enter the control.

mod bandwidth;
mod connection;
mod packet;
mod stats;
mod tracking;
mod transport;
mod zoid;

pub use stats::{ConnectionStats, LossSimulation};

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::address::{Address, Endpoint};
use crate::bitstream::BitStream;
use crate::error::{Error, Result};
use crate::group::{GroupId, GroupManager};
use crate::node::{
    ClassFlags, ClassId, Node, NodeEvent, NodeEventKind, NodeHandle, NodeRole, NodeVariant,
    ReplicationInterceptor, TransferState,
};
use crate::replicator::{AdvancedMode, RepFlags, SendContext};

use bandwidth::BandwidthLimiter;
use connection::{
    CONNECT_RESEND, CONNECT_TIMEOUT, CONNECTION_TIMEOUT, ConnState, Connection,
    DISCONNECT_LINGER, KEEPALIVE_INTERVAL, NotifyRef,
};
use packet::{CreateVariant, Envelope, Item, PacketHeader};
use transport::Transport;
use zoid::ZoidTransition;

/// Handle to one connection of a control. Host-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u32);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

/// Delivery class of one outgoing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    ReliableOrdered,
    ReliableUnordered,
    Unreliable,
    /// Unreliable, delivery or loss reported back to the issuing advanced
    /// replicator.
    UnreliableNotify,
}

/// Whether `process_input` may wait for traffic.
#[derive(Debug, Clone, Copy)]
pub enum BlockMode {
    Poll,
    Block(Duration),
}

/// Terminal outcome of a `connect` call.
#[derive(Debug)]
pub enum ConnectResult {
    Accepted(BitStream),
    Denied(BitStream),
    Timeout,
}

#[derive(Debug)]
pub enum CloseReason {
    /// Cooperative disconnect; carries the peer's (or our own) reason.
    Disconnected(BitStream),
    Timeout,
    /// The local control shut down.
    Shutdown,
}

/// Outcome of a zoid transition, delivered on both ends.
#[derive(Debug)]
pub enum ZoidResult {
    Success { level: u32 },
    Failure { level: u32, reason: BitStream },
}

#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub udp_port: Option<u16>,
    /// In-process channel port, mainly for tests and listen servers with a
    /// local client.
    pub local_port: Option<u16>,
    pub control_id: u8,
    /// Width of the leading control-id field shared by all controls on a
    /// port; 0 disables multiplexing.
    pub control_id_bits: u8,
}

impl BindOptions {
    pub fn udp(port: u16) -> Self {
        Self {
            udp_port: Some(port),
            ..Default::default()
        }
    }

    pub fn local(port: u16) -> Self {
        Self {
            local_port: Some(port),
            ..Default::default()
        }
    }
}

/// Scoped registrar handed to `on_node_request_dynamic`. The handler must
/// supply a structurally matching node before returning.
pub struct NodeRequest {
    handle: NodeHandle,
    node: Option<Node>,
}

impl NodeRequest {
    /// Handle the node will be registered under.
    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn register(&mut self, node: Node) {
        self.node = Some(node);
    }
}

/// Application callbacks. All methods have default bodies; implement what
/// you need.
#[allow(unused_variables)]
pub trait ControlHandler {
    fn on_connect_result(&mut self, control: &mut Control, conn: ConnId, result: ConnectResult) {}

    /// Incoming connection gate. Fill `reply` either way; it travels with
    /// the accept or the deny.
    fn on_connection_request(
        &mut self,
        control: &mut Control,
        from: Endpoint,
        request: &mut BitStream,
        reply: &mut BitStream,
    ) -> bool {
        false
    }

    /// An incoming connection completed the handshake and was accepted.
    fn on_connection_spawned(&mut self, control: &mut Control, conn: ConnId) {}

    fn on_connection_closed(&mut self, control: &mut Control, conn: ConnId, reason: CloseReason) {}

    /// Gate for an incoming zoid request. Fill `deny_reason` when refusing.
    fn on_zoid_request(
        &mut self,
        control: &mut Control,
        conn: ConnId,
        level: u32,
        deny_reason: &mut BitStream,
    ) -> bool {
        true
    }

    fn on_zoid_result(&mut self, control: &mut Control, conn: ConnId, result: ZoidResult) {}

    /// Stream sent by the peer through `send_data` / `send_data_to_group`.
    fn on_data_received(&mut self, control: &mut Control, conn: ConnId, data: BitStream) {}

    /// Frame that did not parse as protocol traffic (`send_data_raw`).
    fn on_data_raw(&mut self, control: &mut Control, from: Endpoint, data: &[u8]) {}

    fn on_discover_request(
        &mut self,
        control: &mut Control,
        from: Endpoint,
        request: &mut BitStream,
        reply: &mut BitStream,
    ) -> bool {
        false
    }

    fn on_discovered(&mut self, control: &mut Control, from: Endpoint, reply: BitStream) {}

    /// A peer announced a dynamic node. Register a structurally matching
    /// node through `request` before returning, or the connection
    /// desynchronizes.
    fn on_node_request_dynamic(
        &mut self,
        control: &mut Control,
        conn: ConnId,
        class: ClassId,
        announce: Option<&mut BitStream>,
        role: NodeRole,
        request: &mut NodeRequest,
    ) {
    }
}

/// Callback that has to run outside the borrow it arose under.
enum Deferred {
    Connect(ConnId, ConnectResult),
    Closed(ConnId, CloseReason),
    Zoid(ConnId, ZoidResult),
}

pub struct Control {
    transport: Transport,
    local_control_id: u8,
    /// Index + 1 is the local class id.
    classes: Vec<(String, ClassFlags)>,
    nodes: HashMap<NodeHandle, Node>,
    next_node: u32,
    next_network_id: u32,
    conns: HashMap<ConnId, Connection>,
    endpoint_index: HashMap<Endpoint, ConnId>,
    next_conn: u32,
    groups: GroupManager,
    limiter: BandwidthLimiter,
    discover_enabled: bool,
    deferred: Vec<Deferred>,
    epoch: Instant,
    last_output: Instant,
}

fn handshake_frame(now_ms: u32, item: Item) -> Vec<u8> {
    let mut s = BitStream::new();
    PacketHeader {
        sequence: 0,
        ack: 0,
        ack_bitfield: 0,
        time_sent: now_ms,
    }
    .write(&mut s);
    Envelope {
        item,
        item_id: None,
        order_seq: None,
    }
    .write(&mut s);
    s.serialize()
}

/// On the wire the low bit of a node id means "announced by the sender";
/// flipping it on receive turns it into the local "announced by us" form,
/// so both ends index the same link without the raw ids clashing.
fn canonical_from_wire(wire: u32) -> u32 {
    wire ^ 1
}

impl Control {
    pub fn bind(options: BindOptions) -> Result<Self> {
        let transport = Transport::bind(
            options.udp_port,
            options.local_port,
            options.control_id_bits,
            options.control_id,
        )?;
        info!(
            "control up (udp {:?}, local {:?}, id {})",
            transport.udp_addr(),
            transport.local_port(),
            options.control_id
        );
        let now = Instant::now();
        Ok(Self {
            transport,
            local_control_id: options.control_id,
            classes: Vec::new(),
            nodes: HashMap::new(),
            next_node: 1,
            next_network_id: 1,
            conns: HashMap::new(),
            endpoint_index: HashMap::new(),
            next_conn: 1,
            groups: GroupManager::new(),
            limiter: BandwidthLimiter::default(),
            discover_enabled: false,
            deferred: Vec::new(),
            epoch: now,
            last_output: now,
        })
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /* classes & nodes */

    /// Class ids are host-local; peers match classes by name through the
    /// table exchanged at connect time. Re-registering a name returns the
    /// existing id.
    pub fn register_class(&mut self, name: &str, flags: ClassFlags) -> ClassId {
        if let Some(pos) = self.classes.iter().position(|(n, _)| n == name) {
            return ClassId((pos + 1) as u16);
        }
        self.classes.push((name.to_owned(), flags));
        ClassId(self.classes.len() as u16)
    }

    pub fn register_node_unique(&mut self, node: Node) -> Result<NodeHandle> {
        self.register_node(node, NodeVariant::Unique)
    }

    pub fn register_node_tagged(&mut self, node: Node, tag: u32) -> Result<NodeHandle> {
        self.register_node(node, NodeVariant::Tagged(tag))
    }

    pub fn register_node_dynamic(&mut self, node: Node) -> Result<NodeHandle> {
        self.register_node(node, NodeVariant::Dynamic)
    }

    fn register_node(&mut self, mut node: Node, variant: NodeVariant) -> Result<NodeHandle> {
        if !node.setup_done() {
            return Err(Error::SetupOrder(
                "register_node before end_replication_setup",
            ));
        }
        if node.class_id().0 == 0 || node.class_id().0 as usize > self.classes.len() {
            return Err(Error::UnknownClass(node.class_id().0));
        }
        node.variant = variant;
        if node.role() == NodeRole::Authority {
            node.network_id = Some(crate::node::NetworkId(self.next_network_id));
            self.next_network_id += 1;
        }
        let handle = NodeHandle(self.next_node);
        self.next_node += 1;
        debug!("registered {handle} ({:?}, {variant:?})", node.role());
        self.nodes.insert(handle, node);
        Ok(handle)
    }

    /// Tell every linked peer to drop the node, then hand it back.
    pub fn unregister_node(&mut self, handle: NodeHandle) -> Result<Node> {
        let conn_ids: Vec<ConnId> = self
            .nodes
            .get(&handle)
            .ok_or(Error::UnknownNode)?
            .links
            .keys()
            .copied()
            .collect();
        for id in conn_ids {
            self.unlink_node(id, handle, true, false);
        }
        Ok(self.nodes.remove(&handle).unwrap())
    }

    pub fn node(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(&handle)
    }

    pub fn node_ref(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(&handle)
    }

    /// Authority only: make `conn` an owner of the node (or a plain proxy
    /// again), updating the live link if one exists.
    pub fn set_owner(&mut self, handle: NodeHandle, conn: ConnId, owner: bool) -> Result<()> {
        let node = self.nodes.get_mut(&handle).ok_or(Error::UnknownNode)?;
        if node.role() != NodeRole::Authority {
            return Err(Error::WrongRole {
                required: NodeRole::Authority,
                actual: node.role(),
            });
        }
        if owner {
            node.owners.insert(conn);
        } else {
            node.owners.remove(&conn);
        }
        let role = node.owner_role_for(conn);
        if let Some(link) = node.links.get_mut(&conn) {
            link.remote_role = role;
            if let Some(c) = self.conns.get_mut(&conn) {
                if let Some(&wire) = c.net_of_node.get(&handle) {
                    c.queue(
                        Item::RoleChange {
                            network_id: wire,
                            role,
                        },
                        SendMode::ReliableOrdered,
                    );
                }
            }
        }
        Ok(())
    }

    pub fn set_relevance(&mut self, handle: NodeHandle, conn: ConnId, relevance: f32) -> Result<()> {
        let node = self.nodes.get_mut(&handle).ok_or(Error::UnknownNode)?;
        node.relevance_override
            .insert(conn, relevance.clamp(0.0, 1.0));
        Ok(())
    }

    pub fn group_manager(&mut self) -> &mut GroupManager {
        &mut self.groups
    }

    /* connections */

    pub fn connect(&mut self, mut address: Address, request: BitStream) -> Result<ConnId> {
        let endpoint = match address.endpoint() {
            Some(e) => e,
            None => address.resolve(CONNECT_TIMEOUT)?,
        };
        if self.endpoint_index.contains_key(&endpoint) {
            return Err(Error::InvalidAddress(format!(
                "already connected to {endpoint:?}"
            )));
        }
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        let salt = stats::rand_u64() as u32;
        let mut conn = Connection::new(
            id,
            endpoint,
            address.control_id(),
            ConnState::RequestSent,
            salt,
            false,
        );
        conn.connect_request = request.clone();
        self.endpoint_index.insert(endpoint, id);
        self.conns.insert(id, conn);
        debug!("{id}: connecting to {endpoint:?}");
        let frame = handshake_frame(
            self.now_ms(),
            Item::ConnectRequest {
                control_id: self.local_control_id,
                salt,
                request,
            },
        );
        self.transport.send(endpoint, address.control_id(), &frame)?;
        Ok(id)
    }

    pub fn disconnect(&mut self, conn: ConnId, reason: BitStream) -> Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn.0))?;
        if !c.is_connected() {
            return Ok(());
        }
        c.queue(
            Item::Disconnect {
                reason: reason.clone(),
            },
            SendMode::ReliableUnordered,
        );
        c.state = ConnState::Disconnecting {
            since: Instant::now(),
        };
        info!("{conn}: disconnecting");
        let handles: Vec<NodeHandle> = c.nodes_by_net.values().copied().collect();
        for handle in handles {
            self.unlink_node(conn, handle, false, true);
        }
        self.deferred
            .push(Deferred::Closed(conn, CloseReason::Disconnected(reason)));
        Ok(())
    }

    pub fn disconnect_all(&mut self, reason: BitStream) {
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            let _ = self.disconnect(id, reason.clone());
        }
    }

    /// Flush a best-effort disconnect notice to every peer and drop all
    /// connections immediately.
    pub fn shutdown(&mut self) {
        let now = self.now_ms();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            let was_connected = self.conns.get(&id).is_some_and(Connection::is_connected);
            if was_connected {
                if let Some(c) = self.conns.get_mut(&id) {
                    c.queue(
                        Item::Disconnect {
                            reason: BitStream::new(),
                        },
                        SendMode::ReliableUnordered,
                    );
                }
            }
            loop {
                let Some(c) = self.conns.get_mut(&id) else { break };
                let Some(bytes) = c.build_packet(now, packet::MAX_PACKET_SIZE) else {
                    break;
                };
                let endpoint = c.endpoint;
                let rid = c.remote_control_id;
                let _ = self.transport.send(endpoint, rid, &bytes);
            }
            let handles: Vec<NodeHandle> = self
                .conns
                .get(&id)
                .map(|c| c.nodes_by_net.values().copied().collect())
                .unwrap_or_default();
            for handle in handles {
                self.unlink_node(id, handle, false, true);
            }
            if let Some(c) = self.conns.get_mut(&id) {
                c.state = ConnState::Closed;
            }
            if was_connected {
                self.deferred
                    .push(Deferred::Closed(id, CloseReason::Shutdown));
            }
        }
    }

    pub fn peer(&self, conn: ConnId) -> Result<Endpoint> {
        self.conns
            .get(&conn)
            .map(|c| c.endpoint)
            .ok_or(Error::UnknownConnection(conn.0))
    }

    pub fn connection_stats(&self, conn: ConnId) -> Result<ConnectionStats> {
        self.conns
            .get(&conn)
            .map(Connection::stats)
            .ok_or(Error::UnknownConnection(conn.0))
    }

    pub fn zoid_level(&self, conn: ConnId) -> Result<u32> {
        self.conns
            .get(&conn)
            .map(|c| c.zoid_level)
            .ok_or(Error::UnknownConnection(conn.0))
    }

    /// Ids of all fully established connections.
    pub fn connections(&self) -> Vec<ConnId> {
        self.conns
            .iter()
            .filter(|(_, c)| c.is_connected())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn set_conn_user_data<T: std::any::Any>(&mut self, conn: ConnId, data: T) -> Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn.0))?;
        c.user_data = Some(Box::new(data));
        Ok(())
    }

    pub fn conn_user_data<T: std::any::Any>(&mut self, conn: ConnId) -> Option<&mut T> {
        self.conns.get_mut(&conn)?.user_data.as_mut()?.downcast_mut()
    }

    /* debugging & rate limits */

    pub fn simulate_lag(&mut self, conn: ConnId, ms: u32) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.simulate.lag_ms = ms;
        }
    }

    pub fn simulate_loss(&mut self, conn: ConnId, loss: f32) {
        if let Some(c) = self.conns.get_mut(&conn) {
            c.simulate.loss = loss.clamp(0.0, 1.0);
        }
    }

    pub fn set_upstream_limit(&mut self, total_bps: u32, per_conn_bps: u32) {
        self.limiter.total_bps = total_bps;
        self.limiter.per_conn_bps = per_conn_bps;
    }

    /// Ask the peer to pace its traffic towards us.
    pub fn request_downstream_limit(&mut self, conn: ConnId, pps: u16, bpp: u16) -> Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn.0))?;
        c.queue(Item::RateRequest { pps, bpp }, SendMode::ReliableUnordered);
        Ok(())
    }

    /* raw data & discovery */

    /// Opaque stream to one peer, interleaved with replication traffic.
    pub fn send_data(&mut self, conn: ConnId, stream: BitStream, mode: SendMode) -> Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn.0))?;
        c.queue_raw(Item::RawData { payload: stream }, mode);
        Ok(())
    }

    pub fn send_data_to_group(
        &mut self,
        group: GroupId,
        stream: BitStream,
        mode: SendMode,
    ) -> Result<()> {
        for conn in self.groups.members(group) {
            if self.conns.get(&conn).is_some_and(Connection::is_connected) {
                self.send_data(conn, stream.clone(), mode)?;
            }
        }
        Ok(())
    }

    /// Bytes straight onto the wire, outside the protocol. The receiver
    /// sees them through `on_data_raw`.
    pub fn send_data_raw(&mut self, address: &Address, bytes: &[u8]) -> Result<()> {
        let endpoint = address.endpoint().ok_or(Error::Unresolved)?;
        self.transport.send(endpoint, address.control_id(), bytes)
    }

    pub fn set_discover_listener(&mut self, enabled: bool) {
        self.discover_enabled = enabled;
    }

    /// Connectionless broadcast probe on `port`; replies arrive through
    /// `on_discovered`.
    pub fn discover(&mut self, port: u16, request: BitStream) -> Result<()> {
        let frame = handshake_frame(
            self.now_ms(),
            Item::Discover {
                control_id: self.local_control_id,
                request,
            },
        );
        self.transport.broadcast(port, &frame)
    }

    /* zoid */

    pub fn request_zoid_mode(&mut self, conn: ConnId, level: u32) -> Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn.0))?;
        if !c.is_connected() {
            return Err(Error::UnknownConnection(conn.0));
        }
        c.pending_zoid = Some(level);
        c.queue(Item::ZoidRequest { level }, SendMode::ReliableOrdered);
        Ok(())
    }

    /// Answer a `SyncRequest` event raised during a zoid transition.
    pub fn set_sync_result(
        &mut self,
        conn: ConnId,
        node: NodeHandle,
        success: bool,
        reason: BitStream,
    ) -> Result<()> {
        let c = self
            .conns
            .get_mut(&conn)
            .ok_or(Error::UnknownConnection(conn.0))?;
        let Some(t) = c.transition.as_mut() else {
            return Ok(());
        };
        if t.report(node, success, reason) {
            self.advance_barrier(conn);
        }
        Ok(())
    }

    /* drive */

    pub fn process_input(&mut self, handler: &mut dyn ControlHandler, block: BlockMode) {
        self.drain_deferred(handler);
        let mut first = true;
        loop {
            let frame = if first {
                match block {
                    BlockMode::Poll => self.transport.recv(),
                    BlockMode::Block(timeout) => self.transport.recv_wait(timeout),
                }
            } else {
                self.transport.recv()
            };
            first = false;
            let Some((from, data)) = frame else { break };
            self.handle_frame(handler, from, data);
            self.drain_deferred(handler);
        }
        self.maintain();
        self.drain_deferred(handler);
    }

    /// Tick every replicator (interpolation blending, extrapolation).
    pub fn process_replicators(&mut self, sim_time_ms: u32) {
        for node in self.nodes.values_mut() {
            let role = node.role();
            for slot in &mut node.slots {
                slot.as_replicator_mut().process(role, sim_time_ms);
            }
        }
    }

    pub fn process_output(&mut self) {
        let now = self.now_ms();
        let elapsed = self.last_output.elapsed();
        self.last_output = Instant::now();

        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for &id in &conn_ids {
            self.handle_losses(id);
        }

        // One dirty poll per node per cycle, fanned out to every link.
        for node in self.nodes.values_mut() {
            if !node.setup_done() || node.links.is_empty() {
                continue;
            }
            let mut changed = Vec::new();
            for (i, slot) in node.slots.iter_mut().enumerate() {
                if let crate::node::Slot::Basic(r) = slot {
                    if r.check_state() {
                        changed.push(i);
                    }
                }
            }
            for link in node.links.values_mut() {
                for &i in &changed {
                    link.dirty[i] = true;
                }
            }
        }

        self.flush_node_events();
        self.flush_file_transfers();

        for &id in &conn_ids {
            let (connected, in_transition, level) = match self.conns.get(&id) {
                Some(c) => (c.is_connected(), c.transition.is_some(), c.zoid_level),
                None => continue,
            };
            if !connected || level == 0 {
                continue;
            }
            if !in_transition {
                self.announce_eligible(id);
            }
            self.pack_node_traffic(id, now);
        }

        // Keepalive, budget refill and the actual sends.
        let total_desired: u32 = self
            .conns
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.budget.desired_bps())
            .sum();
        let Control {
            conns,
            transport,
            limiter,
            ..
        } = self;
        for conn in conns.values_mut() {
            let active =
                conn.is_connected() || matches!(conn.state, ConnState::Disconnecting { .. });
            if !active {
                continue;
            }
            if conn.is_connected()
                && !conn.has_pending()
                && conn.last_send.elapsed() >= KEEPALIVE_INTERVAL
            {
                conn.queue(Item::KeepAlive, SendMode::Unreliable);
            }
            let grant = limiter.grant(conn.budget.desired_bps(), total_desired);
            conn.budget.refill(grant, elapsed);
            let endpoint = conn.endpoint;
            let rid = conn.remote_control_id;
            for frame in conn.due_frames() {
                let _ = transport.send(endpoint, rid, &frame);
            }
            while conn.has_pending() && conn.budget.packet_due() {
                let size = conn.budget.packet_size().min(conn.budget.available());
                if size < 64 {
                    break;
                }
                let Some(bytes) = conn.build_packet(now, size) else {
                    break;
                };
                conn.budget.try_spend(bytes.len());
                if let Some(frame) = conn.stage_outgoing(bytes) {
                    let _ = transport.send(endpoint, rid, &frame);
                }
            }
        }
    }

    /* -------- input internals -------- */

    fn drain_deferred(&mut self, handler: &mut dyn ControlHandler) {
        while !self.deferred.is_empty() {
            for deferred in std::mem::take(&mut self.deferred) {
                match deferred {
                    Deferred::Connect(id, result) => handler.on_connect_result(self, id, result),
                    Deferred::Closed(id, reason) => handler.on_connection_closed(self, id, reason),
                    Deferred::Zoid(id, result) => handler.on_zoid_result(self, id, result),
                }
            }
        }
    }

    fn handle_frame(&mut self, handler: &mut dyn ControlHandler, from: Endpoint, data: Vec<u8>) {
        let mut stream = BitStream::deserialize(&data);
        let Some(header) = PacketHeader::read(&mut stream) else {
            handler.on_data_raw(self, from, &data);
            return;
        };
        match self.endpoint_index.get(&from).copied() {
            None => self.handle_connectionless(handler, from, stream),
            Some(id) => {
                let handshaking = self.conns.get(&id).is_some_and(|c| {
                    matches!(
                        c.state,
                        ConnState::RequestSent
                            | ConnState::ResponseSent
                            | ConnState::ChallengeSent { .. }
                    )
                });
                if handshaking {
                    self.handle_handshake_packet(handler, id, stream);
                } else {
                    self.handle_packet(handler, id, header, stream, data.len());
                }
            }
        }
    }

    fn handle_connectionless(
        &mut self,
        handler: &mut dyn ControlHandler,
        from: Endpoint,
        mut stream: BitStream,
    ) {
        loop {
            let envelope = match Envelope::read(&mut stream) {
                Ok(Some(env)) => env,
                _ => return,
            };
            match envelope.item {
                Item::ConnectRequest {
                    control_id,
                    salt,
                    request,
                } => {
                    let id = ConnId(self.next_conn);
                    self.next_conn += 1;
                    let server_salt = stats::rand_u64() as u32;
                    let mut conn = Connection::new(
                        id,
                        from,
                        control_id,
                        ConnState::ChallengeSent { request },
                        server_salt,
                        true,
                    );
                    conn.remote_salt = salt;
                    debug!("{id}: incoming handshake from {from:?}");
                    self.endpoint_index.insert(from, id);
                    self.conns.insert(id, conn);
                    let frame = handshake_frame(
                        self.now_ms(),
                        Item::ConnectChallenge { salt: server_salt },
                    );
                    let _ = self.transport.send(from, control_id, &frame);
                }
                Item::Discover {
                    control_id,
                    mut request,
                } => {
                    if !self.discover_enabled {
                        continue;
                    }
                    let mut reply = BitStream::new();
                    if handler.on_discover_request(self, from, &mut request, &mut reply) {
                        let frame = handshake_frame(self.now_ms(), Item::DiscoverReply { reply });
                        let _ = self.transport.send(from, control_id, &frame);
                    }
                }
                Item::DiscoverReply { reply } => handler.on_discovered(self, from, reply),
                _ => {}
            }
        }
    }

    fn handle_handshake_packet(
        &mut self,
        handler: &mut dyn ControlHandler,
        id: ConnId,
        mut stream: BitStream,
    ) {
        loop {
            let envelope = match Envelope::read(&mut stream) {
                Ok(Some(env)) => env,
                _ => return,
            };
            let Some(conn) = self.conns.get_mut(&id) else { return };
            match (&conn.state, envelope.item) {
                (ConnState::RequestSent, Item::ConnectChallenge { salt }) => {
                    conn.remote_salt = salt;
                    conn.state = ConnState::ResponseSent;
                    conn.last_handshake_send = Instant::now();
                    let combined = conn.local_salt ^ salt;
                    let endpoint = conn.endpoint;
                    let rid = conn.remote_control_id;
                    let frame =
                        handshake_frame(self.now_ms(), Item::ChallengeResponse { combined });
                    let _ = self.transport.send(endpoint, rid, &frame);
                }
                (
                    ConnState::RequestSent | ConnState::ResponseSent,
                    Item::ConnectDeny { reply },
                ) => {
                    conn.state = ConnState::Closed;
                    self.deferred
                        .push(Deferred::Connect(id, ConnectResult::Denied(reply)));
                }
                (ConnState::ResponseSent, Item::ConnectAccept { reply }) => {
                    conn.state = ConnState::Connected;
                    info!("{id}: connected");
                    self.queue_class_table(id);
                    self.groups.connection_opened(id);
                    self.deferred
                        .push(Deferred::Connect(id, ConnectResult::Accepted(reply)));
                }
                (ConnState::ChallengeSent { .. }, Item::ChallengeResponse { combined }) => {
                    if combined != conn.local_salt ^ conn.remote_salt {
                        warn!("{id}: bad challenge response ignored");
                        continue;
                    }
                    let old = std::mem::replace(&mut conn.state, ConnState::Connected);
                    let ConnState::ChallengeSent { mut request } = old else {
                        unreachable!()
                    };
                    let from = conn.endpoint;
                    let mut reply = BitStream::new();
                    let accept =
                        handler.on_connection_request(self, from, &mut request, &mut reply);
                    let Some(conn) = self.conns.get_mut(&id) else { return };
                    let endpoint = conn.endpoint;
                    let rid = conn.remote_control_id;
                    if accept {
                        // Reply stashed for accept resends.
                        conn.connect_request = reply.clone();
                        conn.last_handshake_send = Instant::now();
                        info!("{id}: accepted connection from {endpoint:?}");
                        let frame = handshake_frame(self.now_ms(), Item::ConnectAccept { reply });
                        let _ = self.transport.send(endpoint, rid, &frame);
                        self.queue_class_table(id);
                        self.groups.connection_opened(id);
                        handler.on_connection_spawned(self, id);
                    } else {
                        conn.state = ConnState::Closed;
                        debug!("{id}: denied connection from {endpoint:?}");
                        let frame = handshake_frame(self.now_ms(), Item::ConnectDeny { reply });
                        let _ = self.transport.send(endpoint, rid, &frame);
                    }
                }
                (ConnState::ChallengeSent { .. }, Item::ConnectRequest { .. }) => {
                    // Request resend; repeat the challenge.
                    let salt = conn.local_salt;
                    let endpoint = conn.endpoint;
                    let rid = conn.remote_control_id;
                    conn.last_handshake_send = Instant::now();
                    let frame = handshake_frame(self.now_ms(), Item::ConnectChallenge { salt });
                    let _ = self.transport.send(endpoint, rid, &frame);
                }
                _ => {}
            }
        }
    }

    fn queue_class_table(&mut self, id: ConnId) {
        let entries: Vec<(u16, String)> = self
            .classes
            .iter()
            .enumerate()
            .map(|(i, (name, _))| ((i + 1) as u16, name.clone()))
            .collect();
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.queue(Item::ClassTable { entries }, SendMode::ReliableOrdered);
        }
    }

    fn handle_packet(
        &mut self,
        handler: &mut dyn ControlHandler,
        id: ConnId,
        header: PacketHeader,
        mut stream: BitStream,
        wire_len: usize,
    ) {
        {
            let Some(conn) = self.conns.get_mut(&id) else { return };
            if !conn.register_packet(&header, wire_len) {
                return;
            }
            let acked = conn.collect_acks(header.ack, header.ack_bitfield);
            let nodes = &mut self.nodes;
            for item in acked {
                let Some(notify) = item.notify else { continue };
                if let Some(node) = nodes.get_mut(&notify.node) {
                    if let Some(crate::node::Slot::Advanced(r)) = node.slots.get_mut(notify.slot) {
                        r.on_data_acked(id, notify.reference_id, notify.payload);
                    }
                }
            }
        }
        loop {
            if !self.conns.contains_key(&id) {
                return;
            }
            let envelope = match Envelope::read(&mut stream) {
                Ok(Some(env)) => env,
                Ok(None) => break,
                Err(e) => {
                    self.desync(id, &e.to_string());
                    return;
                }
            };
            let ready = {
                let Some(conn) = self.conns.get_mut(&id) else { return };
                conn.order_incoming(envelope)
            };
            for item in ready {
                self.dispatch_item(handler, id, item, header.time_sent);
            }
        }
        // Each delivered packet is an ack opportunity for self-timed
        // replicators.
        let handles: Vec<NodeHandle> = match self.conns.get(&id) {
            Some(conn) => conn.nodes_by_net.values().copied().collect(),
            None => return,
        };
        for handle in handles {
            if let Some(node) = self.nodes.get_mut(&handle) {
                for slot in &mut node.slots {
                    if let crate::node::Slot::Advanced(r) = slot {
                        r.on_packet_received(id);
                    }
                }
            }
        }
    }

    fn linked_handle(&self, id: ConnId, wire_id: u32) -> Option<NodeHandle> {
        let canonical = canonical_from_wire(wire_id);
        self.conns.get(&id)?.nodes_by_net.get(&canonical).copied()
    }

    fn dispatch_item(
        &mut self,
        handler: &mut dyn ControlHandler,
        id: ConnId,
        item: Item,
        time_sent: u32,
    ) {
        match item {
            Item::KeepAlive
            | Item::ConnectRequest { .. }
            | Item::ConnectChallenge { .. }
            | Item::ConnectAccept { .. }
            | Item::ConnectDeny { .. }
            | Item::Discover { .. }
            | Item::DiscoverReply { .. } => {}
            Item::ChallengeResponse { .. } => {
                // Our accept was lost; repeat it.
                let Some(conn) = self.conns.get_mut(&id) else { return };
                if conn.incoming && conn.is_connected() {
                    let endpoint = conn.endpoint;
                    let rid = conn.remote_control_id;
                    let reply = conn.connect_request.clone();
                    let frame = handshake_frame(self.now_ms(), Item::ConnectAccept { reply });
                    let _ = self.transport.send(endpoint, rid, &frame);
                }
            }
            Item::Disconnect { reason } => {
                self.close_connection(id, CloseReason::Disconnected(reason));
            }
            Item::RawData { payload } => handler.on_data_received(self, id, payload),
            Item::RateRequest { pps, bpp } => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.budget.requested_pps = pps;
                    conn.budget.requested_bpp = bpp;
                }
            }
            Item::ClassTable { entries } => {
                let mut translated = HashMap::new();
                for (remote_id, name) in entries {
                    match self.classes.iter().position(|(n, _)| *n == name) {
                        Some(pos) => {
                            translated.insert(remote_id, ClassId((pos + 1) as u16));
                        }
                        None => warn!("{id}: peer class {name:?} not registered here"),
                    }
                }
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_classes = translated;
                }
            }
            Item::ZoidRequest { level } => self.on_zoid_request_item(handler, id, level),
            Item::ZoidDeny { level, reason } => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.pending_zoid = None;
                }
                self.deferred
                    .push(Deferred::Zoid(id, ZoidResult::Failure { level, reason }));
            }
            Item::ZoidResult {
                success,
                level: _,
                reason,
            } => {
                let Some(conn) = self.conns.get_mut(&id) else { return };
                let Some(t) = conn.transition.as_mut() else { return };
                t.record_remote(success, reason);
                if !success {
                    // Peer already failed; no point finishing our barrier.
                    t.force_done();
                }
                self.try_finish_transition(id);
            }
            Item::NodeCreate {
                network_id,
                class,
                variant,
                role,
                announce,
            } => self.on_node_create(handler, id, network_id, class, variant, role, announce),
            Item::NodeRemove { network_id } => {
                if let Some(handle) = self.linked_handle(id, network_id) {
                    self.unlink_node(id, handle, false, true);
                }
            }
            Item::RoleChange { network_id, role } => {
                let Some(handle) = self.linked_handle(id, network_id) else { return };
                let Some(node) = self.nodes.get_mut(&handle) else { return };
                let old = node.role();
                node.set_role(role);
                debug!("{id}: {handle} role {old:?} -> {role:?}");
                for slot in &mut node.slots {
                    if let crate::node::Slot::Advanced(r) = slot {
                        r.on_local_role_changed(old, role);
                    }
                }
            }
            Item::NodeUpdate {
                network_id,
                mut payload,
            } => {
                let Some(handle) = self.linked_handle(id, network_id) else {
                    self.desync(id, "update for unknown node");
                    return;
                };
                let now = self.now_ms();
                let result = match self.nodes.get_mut(&handle) {
                    Some(node) => unpack_update(node, id, &mut payload, time_sent, now),
                    None => Ok(()),
                };
                if let Err(e) = result {
                    self.desync(id, &e.to_string());
                }
            }
            Item::RepData {
                network_id,
                slot,
                mut payload,
            } => {
                let Some(handle) = self.linked_handle(id, network_id) else {
                    self.desync(id, "replicator data for unknown node");
                    return;
                };
                let Some(node) = self.nodes.get_mut(&handle) else { return };
                let remote_role = remote_role_of(node, id);
                match node.slots.get_mut(slot as usize) {
                    Some(crate::node::Slot::Advanced(r)) => {
                        r.on_data_received(id, remote_role, &mut payload, true, time_sent);
                    }
                    _ => self.desync(id, "replicator data for non-advanced slot"),
                }
            }
            Item::NodeEvent {
                network_id,
                payload,
            } => {
                let Some(handle) = self.linked_handle(id, network_id) else { return };
                let Some(node) = self.nodes.get_mut(&handle) else { return };
                let remote_role = remote_role_of(node, id);
                node.deliver_event(NodeEvent {
                    kind: NodeEventKind::User(payload),
                    source: Some(id),
                    remote_role: Some(remote_role),
                    estimated_time_sent: time_sent,
                });
            }
            Item::FileStart {
                network_id,
                id: fid,
                size,
                name,
                request,
            } => {
                let Some(handle) = self.linked_handle(id, network_id) else { return };
                let Some(node) = self.nodes.get_mut(&handle) else { return };
                let remote_role = remote_role_of(node, id);
                node.transfers_in.insert(
                    (id, fid),
                    crate::node::filetransfer::IncomingTransfer {
                        id: fid,
                        remote_name: name,
                        size,
                        save_path: None,
                        data: Vec::with_capacity(size as usize),
                        received: 0,
                        state: TransferState::Offered,
                    },
                );
                node.deliver_event(NodeEvent {
                    kind: NodeEventKind::FileIncoming { id: fid, request },
                    source: Some(id),
                    remote_role: Some(remote_role),
                    estimated_time_sent: time_sent,
                });
            }
            Item::FileAccept {
                network_id,
                id: fid,
            } => {
                self.with_linked_node(id, network_id, |node, conn_id| {
                    if let Some(t) = node.transfers_out.get_mut(&(conn_id, fid)) {
                        if t.state == TransferState::Offered {
                            t.state = TransferState::Active;
                        }
                    }
                });
            }
            Item::FileDeny {
                network_id,
                id: fid,
            } => {
                self.with_linked_node(id, network_id, |node, conn_id| {
                    if let Some(t) = node.transfers_out.get_mut(&(conn_id, fid)) {
                        t.state = TransferState::Aborted;
                    }
                    node.deliver_event(NodeEvent::local(
                        NodeEventKind::FileAborted { id: fid },
                        Some(conn_id),
                    ));
                });
            }
            Item::FileChunk {
                network_id,
                id: fid,
                index: _,
                data,
            } => {
                self.with_linked_node(id, network_id, |node, conn_id| {
                    let Some(t) = node.transfers_in.get_mut(&(conn_id, fid)) else {
                        return;
                    };
                    if t.state != TransferState::Active {
                        return;
                    }
                    t.received += data.len() as u32;
                    t.data.extend_from_slice(&data);
                    node.deliver_event(NodeEvent::local(
                        NodeEventKind::FileData { id: fid },
                        Some(conn_id),
                    ));
                });
            }
            Item::FileFinish {
                network_id,
                id: fid,
            } => {
                self.with_linked_node(id, network_id, |node, conn_id| {
                    let Some(t) = node.transfers_in.get_mut(&(conn_id, fid)) else {
                        return;
                    };
                    t.state = TransferState::Complete;
                    if let Some(path) = &t.save_path {
                        if let Err(e) = std::fs::write(path, &t.data) {
                            log::error!("transfer {fid}: writing {path:?} failed: {e}");
                        }
                    }
                    node.deliver_event(NodeEvent::local(
                        NodeEventKind::FileComplete { id: fid },
                        Some(conn_id),
                    ));
                });
            }
            Item::FileAbort {
                network_id,
                id: fid,
            } => {
                self.with_linked_node(id, network_id, |node, conn_id| {
                    if let Some(t) = node.transfers_in.get_mut(&(conn_id, fid)) {
                        t.state = TransferState::Aborted;
                    }
                    if let Some(t) = node.transfers_out.get_mut(&(conn_id, fid)) {
                        t.state = TransferState::Aborted;
                    }
                    node.deliver_event(NodeEvent::local(
                        NodeEventKind::FileAborted { id: fid },
                        Some(conn_id),
                    ));
                });
            }
        }
    }

    fn with_linked_node(&mut self, id: ConnId, wire_id: u32, f: impl FnOnce(&mut Node, ConnId)) {
        let Some(handle) = self.linked_handle(id, wire_id) else { return };
        if let Some(node) = self.nodes.get_mut(&handle) {
            f(node, id);
        }
    }

    /// Protocol violation on a connection: the only safe reaction is to
    /// drop it.
    fn desync(&mut self, id: ConnId, what: &str) {
        warn!("{id}: stream desync ({what}), disconnecting");
        let _ = self.disconnect(id, BitStream::new());
    }

    fn close_connection(&mut self, id: ConnId, reason: CloseReason) {
        let Some(c) = self.conns.get_mut(&id) else { return };
        if c.is_closed() {
            return;
        }
        // disconnect() already notified when we initiated the teardown.
        let notified = matches!(c.state, ConnState::Disconnecting { .. });
        let was_connected = c.is_connected();
        c.state = ConnState::Closed;
        info!("{id}: closed");
        let handles: Vec<NodeHandle> = c.nodes_by_net.values().copied().collect();
        for handle in handles {
            self.unlink_node(id, handle, false, true);
        }
        if was_connected && !notified {
            self.deferred.push(Deferred::Closed(id, reason));
        }
    }

    /// Handshake resends, timeouts and dead-entry cleanup.
    fn maintain(&mut self) {
        enum Action {
            None,
            Resend,
            ConnectTimeout,
            SilentClose,
            IdleTimeout,
            LingerDone,
        }
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            let action = {
                let Some(c) = self.conns.get(&id) else { continue };
                match &c.state {
                    ConnState::RequestSent | ConnState::ResponseSent => {
                        if c.connect_started.elapsed() >= CONNECT_TIMEOUT {
                            Action::ConnectTimeout
                        } else if c.last_handshake_send.elapsed() >= CONNECT_RESEND {
                            Action::Resend
                        } else {
                            Action::None
                        }
                    }
                    ConnState::ChallengeSent { .. } => {
                        if c.connect_started.elapsed() >= CONNECT_TIMEOUT {
                            Action::SilentClose
                        } else if c.last_handshake_send.elapsed() >= CONNECT_RESEND {
                            Action::Resend
                        } else {
                            Action::None
                        }
                    }
                    ConnState::Connected => {
                        if c.last_recv.elapsed() >= CONNECTION_TIMEOUT {
                            Action::IdleTimeout
                        } else {
                            Action::None
                        }
                    }
                    ConnState::Disconnecting { since } => {
                        if since.elapsed() >= DISCONNECT_LINGER {
                            Action::LingerDone
                        } else {
                            Action::None
                        }
                    }
                    ConnState::Closed => Action::None,
                }
            };
            match action {
                Action::None => {}
                Action::Resend => self.resend_handshake(id),
                Action::ConnectTimeout => {
                    warn!("{id}: connect timed out");
                    if let Some(c) = self.conns.get_mut(&id) {
                        c.state = ConnState::Closed;
                    }
                    self.deferred
                        .push(Deferred::Connect(id, ConnectResult::Timeout));
                }
                Action::SilentClose | Action::LingerDone => {
                    if let Some(c) = self.conns.get_mut(&id) {
                        c.state = ConnState::Closed;
                    }
                }
                Action::IdleTimeout => self.close_connection(id, CloseReason::Timeout),
            }
        }
        let dead: Vec<(ConnId, Endpoint)> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_closed())
            .map(|(id, c)| (*id, c.endpoint))
            .collect();
        for (id, endpoint) in dead {
            self.conns.remove(&id);
            self.endpoint_index.remove(&endpoint);
            self.groups.connection_closed(id);
        }
    }

    fn resend_handshake(&mut self, id: ConnId) {
        let now = self.now_ms();
        let local_control_id = self.local_control_id;
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let item = match &conn.state {
            ConnState::RequestSent => Item::ConnectRequest {
                control_id: local_control_id,
                salt: conn.local_salt,
                request: conn.connect_request.clone(),
            },
            ConnState::ResponseSent => Item::ChallengeResponse {
                combined: conn.local_salt ^ conn.remote_salt,
            },
            ConnState::ChallengeSent { .. } => Item::ConnectChallenge {
                salt: conn.local_salt,
            },
            _ => return,
        };
        conn.last_handshake_send = Instant::now();
        let endpoint = conn.endpoint;
        let rid = conn.remote_control_id;
        let frame = handshake_frame(now, item);
        let _ = self.transport.send(endpoint, rid, &frame);
    }

    /* -------- zoid internals -------- */

    fn on_zoid_request_item(&mut self, handler: &mut dyn ControlHandler, id: ConnId, level: u32) {
        let pending = self.conns.get(&id).and_then(|c| c.pending_zoid);
        if pending == Some(level) {
            // Echo of our own request (or a simultaneous identical one).
            self.begin_transition(id, level);
            return;
        }
        let mut deny = BitStream::new();
        let accept = handler.on_zoid_request(self, id, level, &mut deny);
        let Some(conn) = self.conns.get_mut(&id) else { return };
        if accept {
            conn.queue(Item::ZoidRequest { level }, SendMode::ReliableOrdered);
            self.begin_transition(id, level);
        } else {
            conn.queue(
                Item::ZoidDeny {
                    level,
                    reason: deny,
                },
                SendMode::ReliableOrdered,
            );
        }
    }

    fn begin_transition(&mut self, id: ConnId, level: u32) {
        let sync_nodes: Vec<(u32, NodeHandle)> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.setup_done() && level > 0 && n.zoid_levels.contains(&level))
            .filter_map(|(h, n)| n.must_sync.map(|order| (order, *h)))
            .collect();
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let prev = conn.zoid_level;
        conn.pending_zoid = None;
        info!("{id}: zoid transition {prev} -> {level}");
        conn.transition = Some(ZoidTransition::new(level, prev, sync_nodes));
        self.advance_barrier(id);
    }

    fn advance_barrier(&mut self, id: ConnId) {
        loop {
            let (waiting, local_done) =
                match self.conns.get(&id).and_then(|c| c.transition.as_ref()) {
                    Some(t) => (t.waiting(), t.local_done),
                    None => return,
                };
            if local_done {
                break;
            }
            if waiting {
                return;
            }
            let group = {
                let t = self
                    .conns
                    .get_mut(&id)
                    .and_then(|c| c.transition.as_mut())
                    .unwrap();
                t.open_next_group()
            };
            let Some(group) = group else { continue };
            for handle in group {
                if self.node_eligible_for(id, handle) && self.announce_node(id, handle) {
                    if let Some(t) = self.conns.get_mut(&id).and_then(|c| c.transition.as_mut())
                    {
                        t.announced_during.push(handle);
                    }
                }
                let auto = self
                    .nodes
                    .get(&handle)
                    .is_some_and(|n| n.sync_auto_success);
                if auto {
                    if let Some(t) = self.conns.get_mut(&id).and_then(|c| c.transition.as_mut())
                    {
                        t.report(handle, true, BitStream::new());
                    }
                } else if let Some(node) = self.nodes.get_mut(&handle) {
                    node.deliver_event(NodeEvent::local(NodeEventKind::SyncRequest, Some(id)));
                }
            }
        }
        // Local side finished; queue our result exactly once.
        let Some(conn) = self.conns.get_mut(&id) else { return };
        let Some(t) = conn.transition.as_mut() else { return };
        if !t.result_sent {
            t.result_sent = true;
            let success = t.local_success;
            let level = t.target_level;
            let reason = t.fail_reason.clone();
            conn.queue(
                Item::ZoidResult {
                    success,
                    level,
                    reason,
                },
                SendMode::ReliableOrdered,
            );
        }
        self.try_finish_transition(id);
    }

    fn try_finish_transition(&mut self, id: ConnId) {
        let outcome = match self.conns.get(&id).and_then(|c| c.transition.as_ref()) {
            Some(t) => t.outcome(),
            None => return,
        };
        let Some(success) = outcome else { return };
        let t = self.conns.get_mut(&id).unwrap().transition.take().unwrap();
        if success {
            let level = t.target_level;
            self.conns.get_mut(&id).unwrap().zoid_level = level;
            info!("{id}: entered zoid level {level}");
            // Announced nodes of ours that do not apply for the new level
            // leave the connection.
            let stale: Vec<NodeHandle> = self
                .conns
                .get(&id)
                .map(|c| {
                    c.announced
                        .iter()
                        .copied()
                        .filter(|h| {
                            self.nodes
                                .get(h)
                                .is_none_or(|n| !n.zoid_levels.contains(&level))
                        })
                        .collect()
                })
                .unwrap_or_default();
            for handle in stale {
                self.unlink_node(id, handle, true, true);
            }
            self.deferred
                .push(Deferred::Zoid(id, ZoidResult::Success { level }));
        } else {
            let reason = t.failure_reason();
            info!("{id}: zoid transition to {} failed", t.target_level);
            for handle in t.announced_during {
                self.unlink_node(id, handle, true, true);
            }
            self.deferred.push(Deferred::Zoid(
                id,
                ZoidResult::Failure {
                    level: t.target_level,
                    reason,
                },
            ));
        }
    }

    /* -------- node linking -------- */

    fn node_eligible_for(&self, id: ConnId, handle: NodeHandle) -> bool {
        let Some(node) = self.nodes.get(&handle) else {
            return false;
        };
        let Some(conn) = self.conns.get(&id) else {
            return false;
        };
        node.setup_done()
            && node.role() == NodeRole::Authority
            && node.network_id.is_some()
            && !conn.announced.contains(&handle)
            && node.relevance_for(id) > 0.0
            && (!node.is_private() || node.owners.contains(&id))
            && node
                .dependencies
                .iter()
                .all(|dep| conn.announced.contains(dep))
    }

    /// Announce every eligible authority node for the connection's current
    /// level, dependency chains resolved within the cycle, highest priority
    /// first.
    fn announce_eligible(&mut self, id: ConnId) {
        let level = match self.conns.get(&id) {
            Some(c) => c.zoid_level,
            None => return,
        };
        let mut vetoed: HashSet<NodeHandle> = HashSet::new();
        loop {
            let mut candidates: Vec<(u16, NodeHandle)> = self
                .nodes
                .iter()
                .filter(|(h, n)| {
                    n.zoid_levels.contains(&level)
                        && !vetoed.contains(*h)
                        && self.node_eligible_for(id, **h)
                })
                .map(|(h, n)| (n.update_priority, *h))
                .collect();
            if candidates.is_empty() {
                return;
            }
            candidates.sort_by(|a, b| b.0.cmp(&a.0));
            let mut progressed = false;
            for (_, handle) in candidates {
                if self.announce_node(id, handle) {
                    progressed = true;
                } else {
                    vetoed.insert(handle);
                }
            }
            if !progressed {
                return;
            }
        }
    }

    /// Link `handle` to the connection and queue the announcement. False
    /// when the node's interceptor vetoed the link.
    fn announce_node(&mut self, id: ConnId, handle: NodeHandle) -> bool {
        let now = self.now_ms();
        let Control {
            conns,
            nodes,
            classes,
            ..
        } = self;
        let Some(conn) = conns.get_mut(&id) else { return false };
        let Some(node) = nodes.get_mut(&handle) else { return false };
        let Some(net) = node.network_id else { return false };

        let role = node.owner_role_for(id);
        if let Some(mut ic) = node.rep_interceptor.take() {
            let keep = ic.out_pre_replicate_node(id, role);
            node.rep_interceptor = Some(ic);
            if !keep {
                return false;
            }
        }

        let canonical = (net.0 << 1) | 1;
        conn.net_of_node.insert(handle, canonical);
        conn.nodes_by_net.insert(canonical, handle);
        conn.announced.insert(handle);
        node.links
            .insert(id, crate::node::LinkState::new(role, &node.slots, now));

        let announce = if classes
            .get(node.class_id().0 as usize - 1)
            .is_some_and(|(_, f)| f.contains(ClassFlags::ANNOUNCE_DATA))
        {
            node.announce_data.clone()
        } else {
            None
        };
        let variant = match node.variant {
            NodeVariant::Unique => CreateVariant::Unique,
            NodeVariant::Tagged(t) => CreateVariant::Tagged(t),
            NodeVariant::Dynamic => CreateVariant::Dynamic,
        };
        debug!("{id}: announcing {handle} as {canonical:#x} ({role:?})");
        conn.queue(
            Item::NodeCreate {
                network_id: canonical,
                class: node.class_id().0,
                variant,
                role,
                announce,
            },
            SendMode::ReliableOrdered,
        );
        for slot in &mut node.slots {
            if let crate::node::Slot::Advanced(r) = slot {
                r.on_connection_added(id, role);
            }
        }
        node.deliver_event(NodeEvent {
            kind: NodeEventKind::Init,
            source: Some(id),
            remote_role: Some(role),
            estimated_time_sent: 0,
        });
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn on_node_create(
        &mut self,
        handler: &mut dyn ControlHandler,
        id: ConnId,
        wire_id: u32,
        class: u16,
        variant: CreateVariant,
        role: NodeRole,
        mut announce: Option<BitStream>,
    ) {
        let canonical = canonical_from_wire(wire_id);
        let Some(local_class) = self
            .conns
            .get(&id)
            .and_then(|c| c.remote_classes.get(&class).copied())
        else {
            self.desync(id, "announcement with untranslatable class");
            return;
        };
        let handle = match variant {
            CreateVariant::Unique => self.find_replica(id, local_class, None),
            CreateVariant::Tagged(tag) => self.find_replica(id, local_class, Some(tag)),
            CreateVariant::Dynamic => {
                let mut request = NodeRequest {
                    handle: NodeHandle(self.next_node),
                    node: None,
                };
                handler.on_node_request_dynamic(
                    self,
                    id,
                    local_class,
                    announce.as_mut(),
                    role,
                    &mut request,
                );
                match request.node {
                    Some(node) if node.setup_done() => {
                        let handle = request.handle;
                        self.next_node = self.next_node.max(handle.0) + 1;
                        self.nodes.insert(handle, node);
                        Some(handle)
                    }
                    _ => None,
                }
            }
        };
        let Some(handle) = handle else {
            self.desync(id, "announcement without a matching local node");
            return;
        };
        let now = self.now_ms();
        let Control { conns, nodes, .. } = self;
        let (Some(conn), Some(node)) = (conns.get_mut(&id), nodes.get_mut(&handle)) else {
            return;
        };
        node.set_role(role);
        if let Some(data) = announce {
            node.announce_data = Some(data);
        }
        conn.nodes_by_net.insert(canonical, handle);
        conn.net_of_node.insert(handle, canonical);
        node.links.insert(
            id,
            crate::node::LinkState::new(NodeRole::Authority, &node.slots, now),
        );
        debug!("{id}: linked {handle} as {canonical:#x} ({role:?})");
        for slot in &mut node.slots {
            if let crate::node::Slot::Advanced(r) = slot {
                r.on_connection_added(id, NodeRole::Authority);
            }
        }
        node.deliver_event(NodeEvent {
            kind: NodeEventKind::Init,
            source: Some(id),
            remote_role: Some(NodeRole::Authority),
            estimated_time_sent: 0,
        });
    }

    fn find_replica(&self, id: ConnId, class: ClassId, tag: Option<u32>) -> Option<NodeHandle> {
        self.nodes
            .iter()
            .find(|(_, n)| {
                n.setup_done()
                    && n.class_id() == class
                    && n.role() != NodeRole::Authority
                    && !n.links.contains_key(&id)
                    && match tag {
                        Some(t) => n.tag() == Some(t),
                        None => matches!(n.variant, NodeVariant::Unique),
                    }
            })
            .map(|(h, _)| *h)
    }

    fn unlink_node(&mut self, id: ConnId, handle: NodeHandle, notify_peer: bool, event: bool) {
        let Control { conns, nodes, .. } = self;
        let Some(conn) = conns.get_mut(&id) else { return };
        let Some(node) = nodes.get_mut(&handle) else { return };
        let Some(link) = node.links.remove(&id) else { return };
        if let Some(canonical) = conn.net_of_node.remove(&handle) {
            conn.nodes_by_net.remove(&canonical);
            if notify_peer {
                conn.queue(
                    Item::NodeRemove {
                        network_id: canonical,
                    },
                    SendMode::ReliableOrdered,
                );
            }
        }
        conn.announced.remove(&handle);
        for slot in &mut node.slots {
            if let crate::node::Slot::Advanced(r) = slot {
                r.on_connection_removed(id, link.remote_role);
            }
        }
        if event {
            node.deliver_event(NodeEvent {
                kind: NodeEventKind::Removed,
                source: Some(id),
                remote_role: Some(link.remote_role),
                estimated_time_sent: 0,
            });
        }
    }

    /* -------- output internals -------- */

    fn handle_losses(&mut self, id: ConnId) {
        let Control { conns, nodes, .. } = self;
        let Some(conn) = conns.get_mut(&id) else { return };
        for item in conn.collect_losses() {
            if let Some(notify) = item.notify {
                if let Some(node) = nodes.get_mut(&notify.node) {
                    if let Some(crate::node::Slot::Advanced(r)) = node.slots.get_mut(notify.slot) {
                        r.on_data_lost(id, notify.reference_id, notify.payload);
                    }
                }
            }
            if let Some((handle, fields)) = item.redirty {
                // Most-recent fields: mark dirty again so the next cycle
                // resends the current value instead of the lost one.
                if let Some(link) = nodes.get_mut(&handle).and_then(|n| n.links.get_mut(&id)) {
                    for f in fields {
                        if f < link.dirty.len() {
                            link.dirty[f] = true;
                        }
                    }
                }
            }
        }
    }

    fn flush_node_events(&mut self) {
        let Control {
            conns,
            nodes,
            groups,
            ..
        } = self;
        for (handle, node) in nodes.iter_mut() {
            if node.out_events.is_empty() {
                continue;
            }
            let local_role = node.role();
            for ev in std::mem::take(&mut node.out_events) {
                let targets: Vec<ConnId> = match ev.dest {
                    crate::node::EventDest::Rules(rules) => node
                        .links
                        .iter()
                        .filter(|(_, l)| rules.sends_between(local_role, l.remote_role))
                        .map(|(c, _)| *c)
                        .collect(),
                    crate::node::EventDest::Direct(c) => {
                        if node.links.contains_key(&c) {
                            vec![c]
                        } else {
                            Vec::new()
                        }
                    }
                    crate::node::EventDest::Group(g) => groups
                        .members(g)
                        .into_iter()
                        .filter(|c| node.links.contains_key(c))
                        .collect(),
                };
                for target in targets {
                    let Some(conn) = conns.get_mut(&target) else { continue };
                    let Some(&wire) = conn.net_of_node.get(handle) else { continue };
                    conn.queue(
                        Item::NodeEvent {
                            network_id: wire,
                            payload: ev.payload.clone(),
                        },
                        ev.mode,
                    );
                }
            }
        }
    }

    fn flush_file_transfers(&mut self) {
        use crate::node::filetransfer::FTRANS_CHUNK_SIZE;
        let Control { conns, nodes, .. } = self;
        for (handle, node) in nodes.iter_mut() {
            for (conn_id, fid, request) in node.take_pending_offers() {
                let Some(conn) = conns.get_mut(&conn_id) else { continue };
                let Some(&wire) = conn.net_of_node.get(handle) else { continue };
                let Some(t) = node.transfers_out.get(&(conn_id, fid)) else {
                    continue;
                };
                conn.queue(
                    Item::FileStart {
                        network_id: wire,
                        id: fid,
                        size: t.data.len() as u32,
                        name: t.remote_name.clone(),
                        request,
                    },
                    SendMode::ReliableOrdered,
                );
            }
            for (conn_id, fid, accepted) in std::mem::take(&mut node.file_replies) {
                let Some(conn) = conns.get_mut(&conn_id) else { continue };
                let Some(&wire) = conn.net_of_node.get(handle) else { continue };
                let item = if accepted {
                    Item::FileAccept {
                        network_id: wire,
                        id: fid,
                    }
                } else {
                    Item::FileDeny {
                        network_id: wire,
                        id: fid,
                    }
                };
                conn.queue(item, SendMode::ReliableOrdered);
            }
            let mut completions: Vec<(ConnId, u32)> = Vec::new();
            for (&(conn_id, fid), t) in node.transfers_out.iter_mut() {
                if t.state != TransferState::Active {
                    continue;
                }
                let Some(conn) = conns.get_mut(&conn_id) else { continue };
                let Some(&wire) = conn.net_of_node.get(handle) else { continue };
                for _ in 0..t.chunks_per_cycle {
                    if t.offset >= t.data.len() {
                        t.state = TransferState::Complete;
                        conn.queue(
                            Item::FileFinish {
                                network_id: wire,
                                id: fid,
                            },
                            SendMode::ReliableOrdered,
                        );
                        completions.push((conn_id, fid));
                        break;
                    }
                    let end = (t.offset + FTRANS_CHUNK_SIZE).min(t.data.len());
                    conn.queue(
                        Item::FileChunk {
                            network_id: wire,
                            id: fid,
                            index: (t.offset / FTRANS_CHUNK_SIZE) as u16,
                            data: t.data[t.offset..end].to_vec(),
                        },
                        SendMode::ReliableOrdered,
                    );
                    t.offset = end;
                }
            }
            for (conn_id, fid) in completions {
                node.deliver_event(NodeEvent::local(
                    NodeEventKind::FileComplete { id: fid },
                    Some(conn_id),
                ));
            }
        }
    }

    /// Queue the per-node replication traffic for one connection, highest
    /// accumulated priority first.
    fn pack_node_traffic(&mut self, id: ConnId, now: u32) {
        let Control { conns, nodes, .. } = self;
        let Some(conn) = conns.get_mut(&id) else { return };

        let mut order: Vec<(f32, NodeHandle)> = Vec::new();
        for (&handle, node) in nodes.iter_mut() {
            let relevance = node.relevance_for(id);
            let Some(link) = node.links.get_mut(&id) else { continue };
            if relevance <= 0.0 {
                continue;
            }
            link.accum_priority += node.update_priority as f32 * relevance;
            order.push((link.accum_priority, handle));
        }
        order.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (_, handle) in order {
            let Some(node) = nodes.get_mut(&handle) else { continue };
            let Some(&wire) = conn.net_of_node.get(&handle) else { continue };

            if let Some((payload, redirty)) = pack_update(node, id, now) {
                // Field updates travel unreliable; losses re-dirty through
                // the redirty list instead of resending stale values.
                conn.queue_full(
                    Item::NodeUpdate {
                        network_id: wire,
                        payload,
                    },
                    SendMode::Unreliable,
                    None,
                    Some((handle, redirty)),
                );
                if let Some(link) = node.links.get_mut(&id) {
                    link.accum_priority = 0.0;
                }
            }

            // Self-timed replicators issue their own payloads.
            let Some(remote_role) = node.links.get(&id).map(|l| l.remote_role) else {
                continue;
            };
            let (slots, links) = (&mut node.slots, &mut node.links);
            let link = links.get_mut(&id).unwrap();
            for (i, slot) in slots.iter_mut().enumerate() {
                let crate::node::Slot::Advanced(r) = slot else {
                    continue;
                };
                let mut ctx = SendContext::default();
                r.on_pre_send(&mut ctx, id, remote_role, &mut link.adv_last_update[i], now);
                for send in ctx.drain() {
                    let (mode, notify) = match send.mode {
                        AdvancedMode::ReliableUnordered => (SendMode::ReliableUnordered, None),
                        AdvancedMode::Unreliable => (SendMode::Unreliable, None),
                        AdvancedMode::UnreliableNotify => (
                            SendMode::UnreliableNotify,
                            Some(NotifyRef {
                                node: handle,
                                slot: i,
                                reference_id: send.reference_id.unwrap_or(0),
                                payload: send.payload.clone(),
                            }),
                        ),
                    };
                    conn.queue_full(
                        Item::RepData {
                            network_id: wire,
                            slot: i as u8,
                            payload: send.payload,
                        },
                        mode,
                        notify,
                        None,
                    );
                }
            }
        }
    }
}

fn remote_role_of(node: &Node, conn: ConnId) -> NodeRole {
    node.links
        .get(&conn)
        .map(|l| l.remote_role)
        .unwrap_or(NodeRole::Proxy)
}

/// Role the peer sends with: either it is the authority, or it sends from
/// its owner/proxy seat back to our authority.
fn incoming_sender_role(node: &Node, conn: ConnId) -> NodeRole {
    if node.role() == NodeRole::Authority {
        remote_role_of(node, conn)
    } else {
        NodeRole::Authority
    }
}

/// Assemble one `NodeUpdate` payload. Plain fields carry a continuation
/// bit each; rarely-changed fields hide behind a single group bit. Returns
/// the payload plus the packed fields that must re-dirty on loss.
fn pack_update(node: &mut Node, conn: ConnId, now: u32) -> Option<(BitStream, Vec<usize>)> {
    let link = node.links.get(&conn)?;
    let remote_role = link.remote_role;
    let fields = node.field_set(node.role(), remote_role);
    if fields.is_empty() {
        return None;
    }

    let mut due = vec![false; node.slots.len()];
    {
        let link = node.links.get(&conn)?;
        for &i in &fields {
            let setup = node.slots[i].setup();
            let mut is_due = link.dirty[i];
            if let Some(max) = setup.max_delay {
                if now.saturating_sub(link.slot_last_send[i]) >= max as u32 {
                    is_due = true;
                }
            }
            if setup.flags.contains(RepFlags::ONLY_ONCE) && link.sent_once[i] {
                is_due = false;
            }
            if let Some(min) = setup.min_delay {
                if link.sent_once[i] && now.saturating_sub(link.slot_last_send[i]) < min as u32 {
                    is_due = false;
                }
            }
            due[i] = is_due;
        }
    }
    if !due.iter().any(|d| *d) {
        return None;
    }

    let mut interceptor = node.rep_interceptor.take();
    if let Some(ic) = interceptor.as_mut() {
        if !ic.out_pre_update(conn, remote_role) {
            node.rep_interceptor = interceptor;
            return None;
        }
        for &i in &fields {
            if !due[i] || !node.slots[i].setup().flags.contains(RepFlags::INTERCEPT) {
                continue;
            }
            let crate::node::Slot::Basic(r) = &mut node.slots[i] else {
                continue;
            };
            let intercept_id = r.setup().intercept_id;
            if !ic.out_pre_update_item(conn, remote_role, intercept_id, r.as_mut()) {
                due[i] = false;
            }
        }
    }

    let mut payload = BitStream::new();
    let mut packed = Vec::new();
    let rarely: Vec<usize> = fields
        .iter()
        .copied()
        .filter(|&i| node.slots[i].setup().is_rarely_changed())
        .collect();
    for &i in &fields {
        if node.slots[i].setup().is_rarely_changed() {
            continue;
        }
        payload.add_bool(due[i]);
        if due[i] {
            if let crate::node::Slot::Basic(r) = &mut node.slots[i] {
                r.pack(&mut payload);
            }
            packed.push(i);
        }
    }
    if !rarely.is_empty() {
        let any = rarely.iter().any(|&i| due[i]);
        payload.add_bool(any);
        if any {
            for &i in &rarely {
                payload.add_bool(due[i]);
                if due[i] {
                    if let crate::node::Slot::Basic(r) = &mut node.slots[i] {
                        r.pack(&mut payload);
                    }
                    packed.push(i);
                }
            }
        }
    }

    if let Some(ic) = interceptor.as_mut() {
        ic.out_post_update(conn, remote_role, payload.bit_count(), 0, 0);
    }
    node.rep_interceptor = interceptor;

    if packed.is_empty() {
        return None;
    }
    let link = node.links.get_mut(&conn).unwrap();
    for &i in &packed {
        link.dirty[i] = false;
        link.sent_once[i] = true;
        link.slot_last_send[i] = now;
    }
    let redirty: Vec<usize> = packed
        .iter()
        .copied()
        .filter(|&i| !node.slots[i].setup().flags.contains(RepFlags::UNRELIABLE))
        .collect();
    Some((payload, redirty))
}

/// Mirror of `pack_update`. Both ends derive the same field subset, so the
/// stream parses without per-field identifiers; any leftover bits mean the
/// lists diverged and the connection must drop.
fn unpack_update(
    node: &mut Node,
    conn: ConnId,
    payload: &mut BitStream,
    time_sent: u32,
    now: u32,
) -> Result<()> {
    let sender = incoming_sender_role(node, conn);
    let fields = node.field_set(sender, node.role());
    if fields.is_empty() {
        return Err(Error::StreamDesync("update for a field-less link".into()));
    }
    let remote_role = remote_role_of(node, conn);

    let mut interceptor = node.rep_interceptor.take();
    let node_store = match interceptor.as_mut() {
        Some(ic) => ic.in_pre_update(conn, remote_role, time_sent),
        None => true,
    };

    let rarely: Vec<usize> = fields
        .iter()
        .copied()
        .filter(|&i| node.slots[i].setup().is_rarely_changed())
        .collect();
    let mut unpack_one = |slots: &mut Vec<crate::node::Slot>,
                          ic: &mut Option<Box<dyn ReplicationInterceptor>>,
                          i: usize,
                          payload: &mut BitStream| {
        let crate::node::Slot::Basic(r) = &mut slots[i] else {
            return;
        };
        let mut store = node_store;
        if store && r.setup().flags.contains(RepFlags::INTERCEPT) {
            if let Some(ic) = ic.as_mut() {
                let intercept_id = r.setup().intercept_id;
                store = ic.in_pre_update_item(
                    conn,
                    remote_role,
                    time_sent,
                    intercept_id,
                    r.as_mut(),
                    payload,
                );
            }
        }
        r.unpack(payload, store, time_sent);
    };

    for &i in &fields {
        if node.slots[i].setup().is_rarely_changed() {
            continue;
        }
        if payload.get_bool() {
            unpack_one(&mut node.slots, &mut interceptor, i, payload);
        }
    }
    if !rarely.is_empty() && payload.get_bool() {
        for &i in &rarely {
            if payload.get_bool() {
                unpack_one(&mut node.slots, &mut interceptor, i, payload);
            }
        }
    }

    if let Some(ic) = interceptor.as_mut() {
        ic.in_post_update(conn, remote_role, time_sent);
    }
    node.rep_interceptor = interceptor;

    if payload.overrun() || payload.bits_remaining() != 0 {
        return Err(Error::StreamDesync("node update field mismatch".into()));
    }
    node.last_update_recv = Some(now);
    Ok(())
}
