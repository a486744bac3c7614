//! Replicable objects. A node pairs an application object with an ordered
//! replicator list; the list position is the field identifier on the wire,
//! so every host must register structurally identical nodes in identical
//! order.

mod event;
pub(crate) mod filetransfer;
mod interceptor;

pub use event::{NodeEvent, NodeEventKind};
pub use filetransfer::{TransferInfo, TransferState};
pub use interceptor::{EventInterceptor, ReplicationInterceptor};

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use log::debug;

use event::NodeEventQueue;
use filetransfer::{IncomingTransfer, OutgoingTransfer, chunks_per_cycle};

use crate::bitstream::BitStream;
use crate::control::{ConnId, SendMode};
use crate::error::{Error, Result};
use crate::group::GroupId;
use crate::replicator::{
    ElementKind, InterpolateReplicator, MoveListener, MovementConfig, MovementReplicator,
    RepRules, Replicator, ReplicatorAdvanced, ReplicatorBasic, ReplicatorSetup,
    StringReplicator, ValueReplicator,
};

/// This host's relationship to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns the true state and fans updates out.
    Authority,
    /// Read-only replica.
    Proxy,
    /// Replica with an input channel back to the authority.
    Owner,
}

/// Handle into a control's node table. Host-local, never on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub u32);

impl std::fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Authority-allocated id identifying a node across one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkId(pub u32);

/// Host-local class id. Peers translate through the class-table exchange;
/// embedding one in application payloads is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u16);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u8 {
        /// Node announcements of this class carry the announce-data stream.
        const ANNOUNCE_DATA = 1 << 0;
    }
}

/// How peers find the matching node for an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeVariant {
    /// At most one instance per class; linked by class alone.
    Unique,
    /// Linked by class + tag.
    Tagged(u32),
    /// Created on demand through the node-request callback.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyOp {
    Add,
    Remove,
}

/// One entry of a node's replicator list.
pub(crate) enum Slot {
    Basic(Box<dyn ReplicatorBasic>),
    Advanced(Box<dyn ReplicatorAdvanced>),
}

impl Slot {
    pub(crate) fn setup(&self) -> &ReplicatorSetup {
        match self {
            Slot::Basic(r) => r.setup(),
            Slot::Advanced(r) => r.setup(),
        }
    }

    pub(crate) fn as_replicator_mut(&mut self) -> &mut dyn Replicator {
        match self {
            Slot::Basic(r) => {
                let r: &mut dyn ReplicatorBasic = r.as_mut();
                r as &mut dyn Replicator
            }
            Slot::Advanced(r) => {
                let r: &mut dyn ReplicatorAdvanced = r.as_mut();
                r as &mut dyn Replicator
            }
        }
    }
}

/// Per-connection replication state of one node.
#[derive(Debug)]
pub(crate) struct LinkState {
    pub remote_role: NodeRole,
    /// Per-slot pending-update bits (unused for advanced slots).
    pub dirty: Vec<bool>,
    /// ONLY_ONCE bookkeeping.
    pub sent_once: Vec<bool>,
    /// Priority accumulated across skipped output cycles.
    pub accum_priority: f32,
    /// Per-slot last send time, for the min/max delay window.
    pub slot_last_send: Vec<u32>,
    /// Timestamp cells handed to advanced replicators.
    pub adv_last_update: Vec<u32>,
}

impl LinkState {
    pub(crate) fn new(remote_role: NodeRole, slots: &[Slot], now_ms: u32) -> Self {
        let dirty = slots
            .iter()
            .map(|s| {
                matches!(s, Slot::Basic(_))
                    && !s.setup().flags.contains(crate::replicator::RepFlags::START_CLEAN)
            })
            .collect();
        Self {
            remote_role,
            dirty,
            sent_once: vec![false; slots.len()],
            accum_priority: 0.0,
            slot_last_send: vec![0; slots.len()],
            adv_last_update: vec![now_ms; slots.len()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupState {
    Idle,
    Open,
    Done,
}

/// Where a queued node event goes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum EventDest {
    /// Every link whose direction matches the rules.
    Rules(RepRules),
    Direct(ConnId),
    Group(GroupId),
}

pub(crate) struct OutgoingEvent {
    pub dest: EventDest,
    pub mode: SendMode,
    pub payload: BitStream,
}

static NEXT_FILE_ID: AtomicU32 = AtomicU32::new(1);

/// A replicable object registered (or about to be registered) with a
/// `Control`.
pub struct Node {
    class: ClassId,
    role: NodeRole,
    pub(crate) variant: NodeVariant,
    pub(crate) network_id: Option<NetworkId>,
    pub(crate) slots: Vec<Slot>,
    setup_state: SetupState,
    current_intercept: u8,
    pub(crate) update_priority: u16,
    pub(crate) default_relevance: f32,
    pub(crate) relevance_override: HashMap<ConnId, f32>,
    pub(crate) private_node: bool,
    pub(crate) zoid_levels: BTreeSet<u32>,
    /// `Some(order)` when the node participates in the must-sync barrier.
    pub(crate) must_sync: Option<u32>,
    pub(crate) sync_auto_success: bool,
    pub(crate) dependencies: Vec<NodeHandle>,
    pub(crate) owners: HashSet<ConnId>,
    pub(crate) announce_data: Option<BitStream>,
    notify_init: bool,
    notify_remove: bool,
    pub(crate) events: NodeEventQueue,
    pub(crate) event_interceptor: Option<Box<dyn EventInterceptor>>,
    pub(crate) rep_interceptor: Option<Box<dyn ReplicationInterceptor>>,
    pub(crate) links: HashMap<ConnId, LinkState>,
    pub(crate) out_events: Vec<OutgoingEvent>,
    pub(crate) transfers_out: HashMap<(ConnId, u32), OutgoingTransfer>,
    pub(crate) transfers_in: HashMap<(ConnId, u32), IncomingTransfer>,
    /// Pending accept/deny answers to flush (conn, id, accepted).
    pub(crate) file_replies: Vec<(ConnId, u32, bool)>,
    /// Offers waiting for the control to put them on the wire.
    pub(crate) pending_offer_requests: Vec<(ConnId, u32, BitStream)>,
    user_data: Option<Box<dyn Any>>,
    pub(crate) last_update_recv: Option<u32>,
}

impl Node {
    pub fn new(class: ClassId, role: NodeRole) -> Self {
        Self {
            class,
            role,
            variant: NodeVariant::Unique,
            network_id: None,
            slots: Vec::new(),
            setup_state: SetupState::Idle,
            current_intercept: 0,
            update_priority: 1,
            default_relevance: 1.0,
            relevance_override: HashMap::new(),
            private_node: false,
            zoid_levels: BTreeSet::from([1]),
            must_sync: None,
            sync_auto_success: false,
            dependencies: Vec::new(),
            owners: HashSet::new(),
            announce_data: None,
            notify_init: false,
            notify_remove: false,
            events: NodeEventQueue::default(),
            event_interceptor: None,
            rep_interceptor: None,
            links: HashMap::new(),
            out_events: Vec::new(),
            transfers_out: HashMap::new(),
            transfers_in: HashMap::new(),
            file_replies: Vec::new(),
            pending_offer_requests: Vec::new(),
            user_data: None,
            last_update_recv: None,
        }
    }

    /* read accessors */

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: NodeRole) {
        self.role = role;
    }

    pub fn class_id(&self) -> ClassId {
        self.class
    }

    pub fn network_id(&self) -> Option<NetworkId> {
        self.network_id
    }

    pub fn tag(&self) -> Option<u32> {
        match self.variant {
            NodeVariant::Tagged(t) => Some(t),
            _ => None,
        }
    }

    /// ms since the last stored update arrived, if any.
    pub fn update_delta(&self, now_ms: u32) -> Option<u32> {
        self.last_update_recv.map(|t| now_ms.saturating_sub(t))
    }

    /* replication setup */

    /// Open the replicator list for registration. Field order from here to
    /// `end_replication_setup` is the cross-host contract.
    pub fn begin_replication_setup(&mut self, hint: usize) -> Result<()> {
        if self.setup_state != SetupState::Idle {
            return Err(Error::SetupOrder("begin_replication_setup called twice"));
        }
        self.slots.reserve(hint);
        self.setup_state = SetupState::Open;
        Ok(())
    }

    /// Applies to every subsequently added replicator; 0 clears.
    pub fn set_intercept_id(&mut self, id: u8) {
        self.current_intercept = id;
    }

    pub fn end_replication_setup(&mut self) -> Result<()> {
        if self.setup_state != SetupState::Open {
            return Err(Error::SetupOrder(
                "end_replication_setup without matching begin",
            ));
        }
        self.setup_state = SetupState::Done;
        Ok(())
    }

    pub(crate) fn setup_done(&self) -> bool {
        self.setup_state == SetupState::Done
    }

    fn effective_setup(&self, mut setup: ReplicatorSetup) -> ReplicatorSetup {
        if self.current_intercept != 0 {
            setup = setup.with_intercept(self.current_intercept);
        }
        setup
    }

    fn push_slot(&mut self, slot: Slot) -> Result<usize> {
        if self.setup_state != SetupState::Open {
            return Err(Error::SetupOrder(
                "add_replication_* outside begin/end_replication_setup",
            ));
        }
        self.slots.push(slot);
        Ok(self.slots.len() - 1)
    }

    pub fn add_replicator_basic(&mut self, rep: Box<dyn ReplicatorBasic>) -> Result<usize> {
        self.push_slot(Slot::Basic(rep))
    }

    pub fn add_replicator_advanced(&mut self, rep: Box<dyn ReplicatorAdvanced>) -> Result<usize> {
        self.push_slot(Slot::Advanced(rep))
    }

    pub fn add_replication_int(
        &mut self,
        setup: ReplicatorSetup,
        bits: u8,
        signed: bool,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(ValueReplicator::new(
            setup,
            ElementKind::Int { bits, signed },
            1,
        )))
    }

    pub fn add_replication_bool(&mut self, setup: ReplicatorSetup) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(ValueReplicator::new(setup, ElementKind::Bool, 1)))
    }

    pub fn add_replication_float(
        &mut self,
        setup: ReplicatorSetup,
        mantissa_bits: u8,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(ValueReplicator::new(
            setup,
            ElementKind::Float { mantissa_bits },
            1,
        )))
    }

    pub fn add_replication_string(
        &mut self,
        setup: ReplicatorSetup,
        max_len: usize,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(StringReplicator::new(setup, max_len)))
    }

    pub fn add_replication_block(&mut self, setup: ReplicatorSetup, size: usize) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(crate::replicator::BlockReplicator::new(
            setup, size,
        )))
    }

    pub fn add_replication_int_vector(
        &mut self,
        setup: ReplicatorSetup,
        bits: u8,
        signed: bool,
        count: usize,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(ValueReplicator::new(
            setup,
            ElementKind::Int { bits, signed },
            count,
        )))
    }

    pub fn add_replication_float_vector(
        &mut self,
        setup: ReplicatorSetup,
        mantissa_bits: u8,
        count: usize,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(ValueReplicator::new(
            setup,
            ElementKind::Float { mantissa_bits },
            count,
        )))
    }

    pub fn add_interpolation_float(
        &mut self,
        setup: ReplicatorSetup,
        mantissa_bits: u8,
        factor: f32,
        threshold: f32,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_basic(Box::new(InterpolateReplicator::new(
            setup,
            mantissa_bits,
            factor,
            threshold,
        )))
    }

    pub fn add_interpolation_int(
        &mut self,
        setup: ReplicatorSetup,
        factor: f32,
        threshold: f32,
    ) -> Result<usize> {
        // Integer fields blend through the same float path; read back with
        // `InterpolateReplicator::get_int`.
        self.add_interpolation_float(setup, 23, factor, threshold)
    }

    pub fn add_movement<const N: usize>(
        &mut self,
        setup: ReplicatorSetup,
        cfg: MovementConfig,
        listener: Box<dyn MoveListener>,
    ) -> Result<usize> {
        let setup = self.effective_setup(setup);
        self.add_replicator_advanced(Box::new(MovementReplicator::<N>::new(
            setup, cfg, listener,
        )))
    }

    /// Typed access to a registered replicator by its field index.
    pub fn replicator_as<T: Any>(&mut self, index: usize) -> Option<&mut T> {
        self.slots
            .get_mut(index)?
            .as_replicator_mut()
            .as_any_mut()
            .downcast_mut::<T>()
    }

    pub fn replicator_count(&self) -> usize {
        self.slots.len()
    }

    /* replication policy */

    /// Higher priority nodes win packet space; priority accumulates while a
    /// node waits.
    pub fn set_update_priority(&mut self, priority: u16) {
        self.update_priority = priority.max(1);
    }

    pub fn set_default_relevance(&mut self, relevance: f32) {
        self.default_relevance = relevance.clamp(0.0, 1.0);
    }

    pub(crate) fn relevance_for(&self, conn: ConnId) -> f32 {
        self.relevance_override
            .get(&conn)
            .copied()
            .unwrap_or(self.default_relevance)
    }

    /// Connections this node currently replicates to.
    pub fn relevant_connections(&self) -> Vec<ConnId> {
        self.links
            .keys()
            .copied()
            .filter(|c| self.relevance_for(*c) > 0.0)
            .collect()
    }

    /// `other` replicates to a peer before this node does. Cycles are a
    /// caller error and stall both nodes.
    pub fn depends_on(&mut self, other: NodeHandle, op: DependencyOp) {
        match op {
            DependencyOp::Add => {
                if !self.dependencies.contains(&other) {
                    self.dependencies.push(other);
                }
            }
            DependencyOp::Remove => self.dependencies.retain(|h| *h != other),
        }
    }

    /// Private nodes replicate only to connections owning them.
    pub fn set_private(&mut self, private: bool) {
        self.private_node = private;
    }

    pub fn is_private(&self) -> bool {
        self.private_node
    }

    /* zoidlevels */

    pub fn apply_for_zoid_level(&mut self, level: u32) {
        self.zoid_levels.insert(level);
    }

    pub fn remove_from_zoid_level(&mut self, level: u32) {
        self.zoid_levels.remove(&level);
    }

    pub fn zoid_levels(&self) -> impl Iterator<Item = u32> + '_ {
        self.zoid_levels.iter().copied()
    }

    /// Participate in the must-sync barrier of zoid transitions. Lower
    /// orders announce first; equal orders announce concurrently.
    pub fn set_must_sync(&mut self, enabled: bool, order: u32) {
        self.must_sync = enabled.then_some(order);
    }

    /// Skip the `SyncRequest` event and report success immediately.
    pub fn set_sync_result_auto_success(&mut self, auto: bool) {
        self.sync_auto_success = auto;
    }

    /* announce data & notifications */

    pub fn set_announce_data(&mut self, data: BitStream) {
        self.announce_data = Some(data);
    }

    /// On non-authority nodes this is the stream the announcement carried.
    pub fn announce_data(&self) -> Option<&BitStream> {
        self.announce_data.as_ref()
    }

    /// Enable `Init` / `Removed` entries in the pollable queue.
    pub fn set_event_notification(&mut self, on_init: bool, on_remove: bool) {
        self.notify_init = on_init;
        self.notify_remove = on_remove;
    }

    pub fn set_event_interceptor(&mut self, interceptor: Option<Box<dyn EventInterceptor>>) {
        self.event_interceptor = interceptor;
    }

    pub fn set_replication_interceptor(
        &mut self,
        interceptor: Option<Box<dyn ReplicationInterceptor>>,
    ) {
        self.rep_interceptor = interceptor;
    }

    /* events */

    fn queue_event(&mut self, dest: EventDest, mode: SendMode, payload: BitStream) -> Result<()> {
        if self.setup_state != SetupState::Done {
            return Err(Error::SetupOrder("send_event before end_replication_setup"));
        }
        self.out_events.push(OutgoingEvent {
            dest,
            mode,
            payload,
        });
        Ok(())
    }

    /// Queue an event to every link matching `rules`; flushed with the next
    /// output cycle once priority allows.
    pub fn send_event(&mut self, mode: SendMode, rules: RepRules, payload: BitStream) -> Result<()> {
        self.queue_event(EventDest::Rules(rules), mode, payload)
    }

    pub fn send_event_direct(
        &mut self,
        mode: SendMode,
        conn: ConnId,
        payload: BitStream,
    ) -> Result<()> {
        self.queue_event(EventDest::Direct(conn), mode, payload)
    }

    pub fn send_event_to_group(
        &mut self,
        mode: SendMode,
        group: GroupId,
        payload: BitStream,
    ) -> Result<()> {
        self.queue_event(EventDest::Group(group), mode, payload)
    }

    pub fn check_event_waiting(&self) -> bool {
        self.events.has_waiting()
    }

    pub fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.next()
    }

    /// Run the event interceptor (push vs. pull decision) and queue the
    /// event if it survives.
    pub(crate) fn deliver_event(&mut self, mut ev: NodeEvent) {
        match &ev.kind {
            NodeEventKind::Init if !self.notify_init => return,
            NodeEventKind::Removed if !self.notify_remove => return,
            _ => {}
        }
        if let Some(mut ic) = self.event_interceptor.take() {
            let conn = ev.source.unwrap_or(ConnId(0));
            let role = ev.remote_role.unwrap_or(NodeRole::Proxy);
            let keep = match &mut ev.kind {
                NodeEventKind::Init => ic.on_init(conn, role),
                NodeEventKind::Removed => ic.on_removed(conn, role),
                NodeEventKind::SyncRequest => ic.on_sync_request(conn),
                NodeEventKind::User(payload) => {
                    ic.on_user_event(conn, role, payload, ev.estimated_time_sent)
                }
                NodeEventKind::FileIncoming { id, request } => {
                    ic.on_file_incoming(conn, *id, request)
                }
                NodeEventKind::FileData { id } => ic.on_file_data(conn, *id),
                NodeEventKind::FileComplete { id } => ic.on_file_complete(conn, *id),
                NodeEventKind::FileAborted { id } => ic.on_file_aborted(conn, *id),
            };
            self.event_interceptor = Some(ic);
            if !keep {
                return;
            }
        }
        self.events.push(ev);
    }

    /* file transfer */

    /// Offer a file to the peer on `conn`. `remote_name` is the name shown
    /// to the peer (defaults to the local file name); `request` is an
    /// opaque stream delivered with the `FileIncoming` event.
    pub fn send_file(
        &mut self,
        conn: ConnId,
        path: &Path,
        remote_name: Option<&str>,
        request: BitStream,
        aggressiveness: f32,
    ) -> Result<u32> {
        if !self.links.contains_key(&conn) {
            return Err(Error::UnknownConnection(conn.0));
        }
        let data = std::fs::read(path)?;
        let id = NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed);
        let remote_name = remote_name
            .map(str::to_owned)
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| format!("file-{id}"));
        debug!(
            "offering file {remote_name:?} ({} bytes) as transfer {id} to {conn}",
            data.len()
        );
        self.transfers_out.insert(
            (conn, id),
            OutgoingTransfer {
                id,
                path: path.to_path_buf(),
                remote_name,
                data,
                offset: 0,
                state: TransferState::Offered,
                chunks_per_cycle: chunks_per_cycle(aggressiveness),
            },
        );
        // The offer itself is flushed by the control; stash the request
        // stream alongside.
        self.pending_offer_requests.push((conn, id, request));
        Ok(id)
    }

    /// Answer a `FileIncoming` event. `save_path == None` keeps the data in
    /// memory only (readable through `file_info` completion events).
    pub fn accept_file(
        &mut self,
        conn: ConnId,
        id: u32,
        save_path: Option<PathBuf>,
        accept: bool,
    ) -> Result<()> {
        let transfer = self
            .transfers_in
            .get_mut(&(conn, id))
            .ok_or(Error::TransferUnknown(id))?;
        if accept {
            transfer.state = TransferState::Active;
            transfer.save_path = save_path;
        } else {
            transfer.state = TransferState::Aborted;
        }
        self.file_replies.push((conn, id, accept));
        Ok(())
    }

    pub fn file_info(&self, conn: ConnId, id: u32) -> Option<TransferInfo> {
        self.transfers_out
            .get(&(conn, id))
            .map(OutgoingTransfer::info)
            .or_else(|| self.transfers_in.get(&(conn, id)).map(IncomingTransfer::info))
    }

    /* user data */

    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    pub fn user_data<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut::<T>()
    }

    /* control-side helpers */

    /// Basic-slot indices flowing from `sender` to `receiver`, in field
    /// order. Both ends compute the same subset, which keeps the update
    /// stream parsable without per-field ids.
    pub(crate) fn field_set(&self, sender: NodeRole, receiver: NodeRole) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(s, Slot::Basic(_)) && s.setup().rules.sends_between(sender, receiver)
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub(crate) fn owner_role_for(&self, conn: ConnId) -> NodeRole {
        if self.owners.contains(&conn) {
            NodeRole::Owner
        } else {
            NodeRole::Proxy
        }
    }
}

// send_file stashes the request stream until the control flushes the offer.
impl Node {
    pub(crate) fn take_pending_offers(&mut self) -> Vec<(ConnId, u32, BitStream)> {
        std::mem::take(&mut self.pending_offer_requests)
    }
}
