//! Wire framing. A packet is one header plus a run of items; items are the
//! unit of retransmission and ordering, packets only carry acks.

use crate::bitstream::BitStream;
use crate::error::{Error, Result};
use crate::node::NodeRole;

pub const MAX_PACKET_SIZE: usize = 1200;

const MAGIC: u32 = 0x4D52;
const VERSION: u32 = 1;

/// End-of-items marker; trailing zero padding decodes to it naturally.
const KIND_END: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PacketHeader {
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    /// Sender clock at send time, ms.
    pub time_sent: u32,
}

impl PacketHeader {
    pub fn write(&self, s: &mut BitStream) {
        s.add_int(MAGIC, 16);
        s.add_int(VERSION, 4);
        s.add_int(self.sequence, 32);
        s.add_int(self.ack, 32);
        s.add_int(self.ack_bitfield, 32);
        s.add_int(self.time_sent, 32);
    }

    /// `None` for foreign or incompatible traffic; such packets are
    /// silently dropped.
    pub fn read(s: &mut BitStream) -> Option<Self> {
        if s.get_int(16) != MAGIC || s.get_int(4) != VERSION {
            return None;
        }
        let header = Self {
            sequence: s.get_int(32),
            ack: s.get_int(32),
            ack_bitfield: s.get_int(32),
            time_sent: s.get_int(32),
        };
        (!s.overrun()).then_some(header)
    }
}

/// Wire variant tag of a node announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateVariant {
    Unique,
    Tagged(u32),
    Dynamic,
}

/// Everything that travels between two controls.
#[derive(Debug, Clone)]
pub(crate) enum Item {
    ConnectRequest {
        control_id: u8,
        salt: u32,
        request: BitStream,
    },
    ConnectChallenge {
        salt: u32,
    },
    ChallengeResponse {
        combined: u32,
    },
    ConnectAccept {
        reply: BitStream,
    },
    ConnectDeny {
        reply: BitStream,
    },
    Disconnect {
        reason: BitStream,
    },
    KeepAlive,
    Discover {
        control_id: u8,
        request: BitStream,
    },
    DiscoverReply {
        reply: BitStream,
    },
    RawData {
        payload: BitStream,
    },
    ClassTable {
        entries: Vec<(u16, String)>,
    },
    ZoidRequest {
        level: u32,
    },
    ZoidDeny {
        level: u32,
        reason: BitStream,
    },
    ZoidResult {
        success: bool,
        level: u32,
        reason: BitStream,
    },
    NodeCreate {
        network_id: u32,
        class: u16,
        variant: CreateVariant,
        /// Role the receiver takes for this node.
        role: NodeRole,
        announce: Option<BitStream>,
    },
    NodeRemove {
        network_id: u32,
    },
    RoleChange {
        network_id: u32,
        role: NodeRole,
    },
    NodeUpdate {
        network_id: u32,
        payload: BitStream,
    },
    /// Advanced-replicator payload for one slot.
    RepData {
        network_id: u32,
        slot: u8,
        payload: BitStream,
    },
    NodeEvent {
        network_id: u32,
        payload: BitStream,
    },
    FileStart {
        network_id: u32,
        id: u32,
        size: u32,
        name: String,
        request: BitStream,
    },
    FileAccept {
        network_id: u32,
        id: u32,
    },
    FileDeny {
        network_id: u32,
        id: u32,
    },
    FileChunk {
        network_id: u32,
        id: u32,
        index: u16,
        data: Vec<u8>,
    },
    FileFinish {
        network_id: u32,
        id: u32,
    },
    FileAbort {
        network_id: u32,
        id: u32,
    },
    RateRequest {
        pps: u16,
        bpp: u16,
    },
}

fn write_prefixed(s: &mut BitStream, payload: &BitStream) {
    s.add_int(payload.bit_count() as u32, 16);
    s.add_stream(payload);
}

fn read_prefixed(s: &mut BitStream) -> BitStream {
    let bits = s.get_int(16) as u64;
    s.get_stream(bits)
}

fn write_role(s: &mut BitStream, role: NodeRole) {
    let v = match role {
        NodeRole::Proxy => 0,
        NodeRole::Owner => 1,
        NodeRole::Authority => 2,
    };
    s.add_int(v, 2);
}

fn read_role(s: &mut BitStream) -> NodeRole {
    match s.get_int(2) {
        1 => NodeRole::Owner,
        2 => NodeRole::Authority,
        _ => NodeRole::Proxy,
    }
}

impl Item {
    fn kind(&self) -> u32 {
        match self {
            Item::ConnectRequest { .. } => 1,
            Item::ConnectChallenge { .. } => 2,
            Item::ChallengeResponse { .. } => 3,
            Item::ConnectAccept { .. } => 4,
            Item::ConnectDeny { .. } => 5,
            Item::Disconnect { .. } => 6,
            Item::KeepAlive => 7,
            Item::Discover { .. } => 8,
            Item::DiscoverReply { .. } => 9,
            Item::RawData { .. } => 10,
            Item::ClassTable { .. } => 11,
            Item::ZoidRequest { .. } => 12,
            Item::ZoidDeny { .. } => 13,
            Item::ZoidResult { .. } => 14,
            Item::NodeCreate { .. } => 15,
            Item::NodeRemove { .. } => 16,
            Item::RoleChange { .. } => 17,
            Item::NodeUpdate { .. } => 18,
            Item::RepData { .. } => 19,
            Item::NodeEvent { .. } => 20,
            Item::FileStart { .. } => 21,
            Item::FileAccept { .. } => 22,
            Item::FileDeny { .. } => 23,
            Item::FileChunk { .. } => 24,
            Item::FileFinish { .. } => 25,
            Item::FileAbort { .. } => 26,
            Item::RateRequest { .. } => 27,
        }
    }

    fn write_body(&self, s: &mut BitStream) {
        match self {
            Item::ConnectRequest {
                control_id,
                salt,
                request,
            } => {
                s.add_int(*control_id as u32, 8);
                s.add_int(*salt, 32);
                write_prefixed(s, request);
            }
            Item::ConnectChallenge { salt } => s.add_int(*salt, 32),
            Item::ChallengeResponse { combined } => s.add_int(*combined, 32),
            Item::ConnectAccept { reply } => write_prefixed(s, reply),
            Item::ConnectDeny { reply } => write_prefixed(s, reply),
            Item::Disconnect { reason } => write_prefixed(s, reason),
            Item::KeepAlive => {}
            Item::Discover {
                control_id,
                request,
            } => {
                s.add_int(*control_id as u32, 8);
                write_prefixed(s, request);
            }
            Item::DiscoverReply { reply } => write_prefixed(s, reply),
            Item::RawData { payload } => write_prefixed(s, payload),
            Item::ClassTable { entries } => {
                s.add_int(entries.len() as u32, 16);
                for (id, name) in entries {
                    s.add_int(*id as u32, 16);
                    s.add_string(name);
                }
            }
            Item::ZoidRequest { level } => s.add_int(*level, 32),
            Item::ZoidDeny { level, reason } => {
                s.add_int(*level, 32);
                write_prefixed(s, reason);
            }
            Item::ZoidResult {
                success,
                level,
                reason,
            } => {
                s.add_bool(*success);
                s.add_int(*level, 32);
                write_prefixed(s, reason);
            }
            Item::NodeCreate {
                network_id,
                class,
                variant,
                role,
                announce,
            } => {
                s.add_int(*network_id, 32);
                s.add_int(*class as u32, 16);
                match variant {
                    CreateVariant::Unique => s.add_int(0, 2),
                    CreateVariant::Tagged(tag) => {
                        s.add_int(1, 2);
                        s.add_int(*tag, 32);
                    }
                    CreateVariant::Dynamic => s.add_int(2, 2),
                }
                write_role(s, *role);
                s.add_bool(announce.is_some());
                if let Some(announce) = announce {
                    write_prefixed(s, announce);
                }
            }
            Item::NodeRemove { network_id } => s.add_int(*network_id, 32),
            Item::RoleChange { network_id, role } => {
                s.add_int(*network_id, 32);
                write_role(s, *role);
            }
            Item::NodeUpdate {
                network_id,
                payload,
            } => {
                s.add_int(*network_id, 32);
                write_prefixed(s, payload);
            }
            Item::RepData {
                network_id,
                slot,
                payload,
            } => {
                s.add_int(*network_id, 32);
                s.add_int(*slot as u32, 8);
                write_prefixed(s, payload);
            }
            Item::NodeEvent {
                network_id,
                payload,
            } => {
                s.add_int(*network_id, 32);
                write_prefixed(s, payload);
            }
            Item::FileStart {
                network_id,
                id,
                size,
                name,
                request,
            } => {
                s.add_int(*network_id, 32);
                s.add_int(*id, crate::node::filetransfer::FTRANS_ID_BITS);
                s.add_int(*size, crate::node::filetransfer::FTRANS_SIZE_BITS);
                s.add_string(name);
                write_prefixed(s, request);
            }
            Item::FileAccept { network_id, id }
            | Item::FileDeny { network_id, id }
            | Item::FileFinish { network_id, id }
            | Item::FileAbort { network_id, id } => {
                s.add_int(*network_id, 32);
                s.add_int(*id, 32);
            }
            Item::FileChunk {
                network_id,
                id,
                index,
                data,
            } => {
                s.add_int(*network_id, 32);
                s.add_int(*id, 32);
                s.add_int(*index as u32, crate::node::filetransfer::FTRANS_CHUNK_BITS);
                s.add_buffer(data);
            }
            Item::RateRequest { pps, bpp } => {
                s.add_int(*pps as u32, 16);
                s.add_int(*bpp as u32, 16);
            }
        }
    }

    fn read_body(kind: u32, s: &mut BitStream) -> Result<Item> {
        let item = match kind {
            1 => Item::ConnectRequest {
                control_id: s.get_int(8) as u8,
                salt: s.get_int(32),
                request: read_prefixed(s),
            },
            2 => Item::ConnectChallenge { salt: s.get_int(32) },
            3 => Item::ChallengeResponse { combined: s.get_int(32) },
            4 => Item::ConnectAccept { reply: read_prefixed(s) },
            5 => Item::ConnectDeny { reply: read_prefixed(s) },
            6 => Item::Disconnect { reason: read_prefixed(s) },
            7 => Item::KeepAlive,
            8 => Item::Discover {
                control_id: s.get_int(8) as u8,
                request: read_prefixed(s),
            },
            9 => Item::DiscoverReply { reply: read_prefixed(s) },
            10 => Item::RawData { payload: read_prefixed(s) },
            11 => {
                let count = s.get_int(16) as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let id = s.get_int(16) as u16;
                    let name = s.get_string();
                    if s.overrun() {
                        break;
                    }
                    entries.push((id, name));
                }
                Item::ClassTable { entries }
            }
            12 => Item::ZoidRequest { level: s.get_int(32) },
            13 => Item::ZoidDeny {
                level: s.get_int(32),
                reason: read_prefixed(s),
            },
            14 => Item::ZoidResult {
                success: s.get_bool(),
                level: s.get_int(32),
                reason: read_prefixed(s),
            },
            15 => {
                let network_id = s.get_int(32);
                let class = s.get_int(16) as u16;
                let variant = match s.get_int(2) {
                    0 => CreateVariant::Unique,
                    1 => CreateVariant::Tagged(s.get_int(32)),
                    _ => CreateVariant::Dynamic,
                };
                let role = read_role(s);
                let announce = s.get_bool().then(|| read_prefixed(s));
                Item::NodeCreate {
                    network_id,
                    class,
                    variant,
                    role,
                    announce,
                }
            }
            16 => Item::NodeRemove { network_id: s.get_int(32) },
            17 => Item::RoleChange {
                network_id: s.get_int(32),
                role: read_role(s),
            },
            18 => Item::NodeUpdate {
                network_id: s.get_int(32),
                payload: read_prefixed(s),
            },
            19 => Item::RepData {
                network_id: s.get_int(32),
                slot: s.get_int(8) as u8,
                payload: read_prefixed(s),
            },
            20 => Item::NodeEvent {
                network_id: s.get_int(32),
                payload: read_prefixed(s),
            },
            21 => Item::FileStart {
                network_id: s.get_int(32),
                id: s.get_int(crate::node::filetransfer::FTRANS_ID_BITS),
                size: s.get_int(crate::node::filetransfer::FTRANS_SIZE_BITS),
                name: s.get_string(),
                request: read_prefixed(s),
            },
            22 => Item::FileAccept {
                network_id: s.get_int(32),
                id: s.get_int(32),
            },
            23 => Item::FileDeny {
                network_id: s.get_int(32),
                id: s.get_int(32),
            },
            24 => Item::FileChunk {
                network_id: s.get_int(32),
                id: s.get_int(32),
                index: s.get_int(crate::node::filetransfer::FTRANS_CHUNK_BITS) as u16,
                data: s.get_buffer(),
            },
            25 => Item::FileFinish {
                network_id: s.get_int(32),
                id: s.get_int(32),
            },
            26 => Item::FileAbort {
                network_id: s.get_int(32),
                id: s.get_int(32),
            },
            27 => Item::RateRequest {
                pps: s.get_int(16) as u16,
                bpp: s.get_int(16) as u16,
            },
            other => {
                return Err(Error::StreamDesync(format!("unknown item kind {other}")));
            }
        };
        Ok(item)
    }
}

/// Item plus its reliability envelope.
#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub item: Item,
    /// Present on reliable and notify items; stable across resends, used
    /// for receive-side dedup.
    pub item_id: Option<u32>,
    /// Present on reliable-ordered items.
    pub order_seq: Option<u32>,
}

impl Envelope {
    pub fn write(&self, s: &mut BitStream) {
        s.add_int(self.item.kind(), 5);
        s.add_bool(self.item_id.is_some());
        s.add_bool(self.order_seq.is_some());
        if let Some(id) = self.item_id {
            s.add_int(id, 32);
        }
        if let Some(seq) = self.order_seq {
            s.add_int(seq, 32);
        }
        self.item.write_body(s);
    }

    /// Bits this envelope will occupy.
    pub fn encoded_bits(&self) -> u64 {
        let mut probe = BitStream::with_capacity(64);
        self.write(&mut probe);
        probe.bit_count()
    }

    /// `Ok(None)` at the end marker / padding.
    pub fn read(s: &mut BitStream) -> Result<Option<Envelope>> {
        if s.bits_remaining() < 7 {
            return Ok(None);
        }
        let kind = s.get_int(5);
        if kind == KIND_END {
            return Ok(None);
        }
        let has_item_id = s.get_bool();
        let has_order = s.get_bool();
        let item_id = has_item_id.then(|| s.get_int(32));
        let order_seq = has_order.then(|| s.get_int(32));
        let item = Item::read_body(kind, s)?;
        if s.overrun() {
            return Err(Error::StreamDesync("truncated item".into()));
        }
        Ok(Some(Envelope {
            item,
            item_id,
            order_seq,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(envelope: Envelope) -> Envelope {
        let mut s = BitStream::new();
        envelope.write(&mut s);
        Envelope::read(&mut s).unwrap().unwrap()
    }

    #[test]
    fn header_round_trip_and_magic() {
        let header = PacketHeader {
            sequence: 7,
            ack: 3,
            ack_bitfield: 0b101,
            time_sent: 1234,
        };
        let mut s = BitStream::new();
        header.write(&mut s);
        assert_eq!(PacketHeader::read(&mut s), Some(header));

        let mut garbage = BitStream::new();
        garbage.add_int(0xFFFF, 16);
        garbage.add_int(0, 4);
        garbage.add_int(0, 32);
        assert_eq!(PacketHeader::read(&mut garbage), None);
    }

    #[test]
    fn envelope_flags_round_trip() {
        let mut payload = BitStream::new();
        payload.add_int(0xAB, 8);
        let out = round_trip(Envelope {
            item: Item::NodeUpdate {
                network_id: 42,
                payload,
            },
            item_id: Some(17),
            order_seq: Some(3),
        });
        assert_eq!(out.item_id, Some(17));
        assert_eq!(out.order_seq, Some(3));
        match out.item {
            Item::NodeUpdate {
                network_id,
                mut payload,
            } => {
                assert_eq!(network_id, 42);
                assert_eq!(payload.get_int(8), 0xAB);
            }
            other => panic!("wrong item {other:?}"),
        }
    }

    #[test]
    fn node_create_variants() {
        for variant in [
            CreateVariant::Unique,
            CreateVariant::Tagged(77),
            CreateVariant::Dynamic,
        ] {
            let out = round_trip(Envelope {
                item: Item::NodeCreate {
                    network_id: 9,
                    class: 4,
                    variant,
                    role: NodeRole::Owner,
                    announce: None,
                },
                item_id: Some(1),
                order_seq: Some(1),
            });
            match out.item {
                Item::NodeCreate {
                    variant: got, role, ..
                } => {
                    assert_eq!(got, variant);
                    assert_eq!(role, NodeRole::Owner);
                }
                other => panic!("wrong item {other:?}"),
            }
        }
    }

    #[test]
    fn class_table_round_trip() {
        let out = round_trip(Envelope {
            item: Item::ClassTable {
                entries: vec![(1, "player".into()), (2, "projectile".into())],
            },
            item_id: Some(2),
            order_seq: Some(0),
        });
        match out.item {
            Item::ClassTable { entries } => {
                assert_eq!(entries, vec![(1, "player".into()), (2, "projectile".into())]);
            }
            other => panic!("wrong item {other:?}"),
        }
    }

    #[test]
    fn multiple_items_then_padding() {
        let mut s = BitStream::new();
        Envelope {
            item: Item::KeepAlive,
            item_id: None,
            order_seq: None,
        }
        .write(&mut s);
        Envelope {
            item: Item::ZoidRequest { level: 2 },
            item_id: Some(5),
            order_seq: Some(0),
        }
        .write(&mut s);
        // Simulate byte-boundary padding after serialize/deserialize.
        let bytes = s.serialize();
        let mut back = BitStream::deserialize(&bytes);

        assert!(matches!(
            Envelope::read(&mut back).unwrap().unwrap().item,
            Item::KeepAlive
        ));
        assert!(matches!(
            Envelope::read(&mut back).unwrap().unwrap().item,
            Item::ZoidRequest { level: 2 }
        ));
        assert!(Envelope::read(&mut back).unwrap().is_none());
    }

    #[test]
    fn file_chunk_round_trip() {
        let out = round_trip(Envelope {
            item: Item::FileChunk {
                network_id: 1,
                id: 99,
                index: 5,
                data: vec![1, 2, 3, 4],
            },
            item_id: Some(9),
            order_seq: None,
        });
        match out.item {
            Item::FileChunk { id, index, data, .. } => {
                assert_eq!((id, index), (99, 5));
                assert_eq!(data, vec![1, 2, 3, 4]);
            }
            other => panic!("wrong item {other:?}"),
        }
    }
}
