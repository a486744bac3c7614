//! Authority-driven object replication over unreliable datagrams.
//!
//! A [`Control`] is one endpoint of a session. Applications register node
//! classes, attach replicated fields to [`Node`]s, and pump the control
//! from their main loop; the library keeps the linked replicas on every
//! peer in sync, handles connection management, priorities, bandwidth
//! budgets, events and file transfers.

mod address;
mod bitstream;
mod control;
mod error;
mod group;
mod node;
mod replicator;

pub use address::{Address, Endpoint};
pub use bitstream::{BitPos, BitStream};
pub use control::{
    BindOptions, BlockMode, CloseReason, ConnId, ConnectResult, ConnectionStats, Control,
    ControlHandler, LossSimulation, NodeRequest, SendMode, ZoidResult,
};
pub use error::{Error, Result};
pub use group::{GROUP_ALL, GroupId, GroupManager};
pub use node::{
    ClassFlags, ClassId, DependencyOp, EventInterceptor, NetworkId, Node, NodeEvent,
    NodeEventKind, NodeHandle, NodeRole, NodeVariant, ReplicationInterceptor, TransferInfo,
    TransferState,
};
pub use replicator::{
    AdvancedMode, AdvancedSend, BlockReplicator, ElementKind, ErrorThreshold,
    InterpolateReplicator, MoveHistoryEntry, MoveListener, MovementConfig, MovementReplicator,
    PeekValue, RepFlags, RepRules, Replicator, ReplicatorAdvanced, ReplicatorBasic,
    ReplicatorSetup, SendContext, StringReplicator, ValueReplicator,
};
