//! Chunked background file transfer riding on a node's link.

use std::path::PathBuf;

/// Wire widths of the transfer sub-protocol.
pub(crate) const FTRANS_ID_BITS: u8 = 32;
pub(crate) const FTRANS_SIZE_BITS: u8 = 32;
pub(crate) const FTRANS_CHUNK_BITS: u8 = 16;

/// Payload bytes per chunk. Small enough that several chunks plus regular
/// replication data fit one packet.
pub(crate) const FTRANS_CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Offered, waiting for the peer's accept/deny.
    Offered,
    Active,
    Complete,
    Aborted,
}

/// Progress record returned by `Node::file_info`.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: u32,
    /// Local path (source for outgoing, destination for incoming).
    pub path: PathBuf,
    pub size: u32,
    pub transferred: u32,
    pub state: TransferState,
    pub incoming: bool,
}

#[derive(Debug)]
pub(crate) struct OutgoingTransfer {
    pub id: u32,
    pub path: PathBuf,
    /// Name presented to the peer; may differ from the local path.
    pub remote_name: String,
    pub data: Vec<u8>,
    pub offset: usize,
    pub state: TransferState,
    /// Chunks pushed per output cycle, derived from the aggressiveness
    /// given to `send_file` (0.0 trickle .. 1.0 flood).
    pub chunks_per_cycle: usize,
}

impl OutgoingTransfer {
    pub fn info(&self) -> TransferInfo {
        TransferInfo {
            id: self.id,
            path: self.path.clone(),
            size: self.data.len() as u32,
            transferred: self.offset as u32,
            state: self.state,
            incoming: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct IncomingTransfer {
    pub id: u32,
    pub remote_name: String,
    pub size: u32,
    pub save_path: Option<PathBuf>,
    pub data: Vec<u8>,
    pub received: u32,
    pub state: TransferState,
}

impl IncomingTransfer {
    pub fn info(&self) -> TransferInfo {
        TransferInfo {
            id: self.id,
            path: self
                .save_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(&self.remote_name)),
            size: self.size,
            transferred: self.received,
            state: self.state,
            incoming: true,
        }
    }
}

pub(crate) fn chunks_per_cycle(aggressiveness: f32) -> usize {
    1 + (aggressiveness.clamp(0.0, 1.0) * 7.0) as usize
}
