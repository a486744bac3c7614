use thiserror::Error;

use crate::node::NodeRole;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of library calls. Protocol negotiation outcomes (connection
/// denied, zoid failure, sync failure) are not errors; they arrive through
/// the result callbacks with reason payloads.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address not resolved")]
    Unresolved,

    #[error("operation timed out")]
    Timeout,

    #[error("replication setup call out of order: {0}")]
    SetupOrder(&'static str),

    #[error("unknown class id {0}")]
    UnknownClass(u16),

    #[error("unknown connection {0}")]
    UnknownConnection(u32),

    #[error("unknown node")]
    UnknownNode,

    #[error("operation requires role {required:?}, node is {actual:?}")]
    WrongRole { required: NodeRole, actual: NodeRole },

    #[error("replication stream desynchronized: {0}")]
    StreamDesync(String),

    #[error("stream budget exceeded")]
    StreamBudget,

    #[error("unknown file transfer {0}")]
    TransferUnknown(u32),

    #[error("local channel port {0} already in use")]
    PortInUse(u16),
}
