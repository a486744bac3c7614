//! The generic fixed-width replicators: numeric vectors, strings and raw
//! blocks. Dirty detection is shadow-compare: the last packed value is kept
//! and `check_state` reports any difference.

use std::any::Any;

use crate::bitstream::BitStream;

use super::{PeekValue, RepFlags, Replicator, ReplicatorBasic, ReplicatorSetup};

/// Wire shape of one vector element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElementKind {
    Int { bits: u8, signed: bool },
    Float { mantissa_bits: u8 },
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Int(i64),
    Float(f32),
    Bool(bool),
}

impl ElementKind {
    fn zero(&self) -> Slot {
        match self {
            ElementKind::Int { .. } => Slot::Int(0),
            ElementKind::Float { .. } => Slot::Float(0.0),
            ElementKind::Bool => Slot::Bool(false),
        }
    }
}

/// Fixed-width value vector, the workhorse field replicator. One element
/// kind times an element count fixed at setup time.
pub struct ValueReplicator {
    setup: ReplicatorSetup,
    kind: ElementKind,
    values: Vec<Slot>,
    shadow: Vec<Slot>,
    forced: bool,
}

impl ValueReplicator {
    pub fn new(setup: ReplicatorSetup, kind: ElementKind, count: usize) -> Self {
        assert!(count >= 1, "element count must be at least 1");
        if let ElementKind::Int { bits, .. } = kind {
            assert!(bits >= 1 && bits <= 32);
        }
        if let ElementKind::Float { mantissa_bits } = kind {
            assert!(mantissa_bits >= 1 && mantissa_bits <= 23);
        }
        let values = vec![kind.zero(); count];
        let shadow = if setup.flags.contains(RepFlags::START_CLEAN) {
            values.clone()
        } else {
            // Differ from the initial value so the first poll reports dirty.
            vec![
                match kind {
                    ElementKind::Int { .. } => Slot::Int(i64::MIN),
                    ElementKind::Float { .. } => Slot::Float(f32::NAN),
                    ElementKind::Bool => Slot::Bool(true),
                };
                count
            ]
        };
        Self {
            setup,
            kind,
            values,
            shadow,
            forced: false,
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn set_int(&mut self, index: usize, value: i64) {
        self.values[index] = Slot::Int(value);
    }

    pub fn int(&self, index: usize) -> i64 {
        match self.values[index] {
            Slot::Int(v) => v,
            _ => 0,
        }
    }

    pub fn set_float(&mut self, index: usize, value: f32) {
        self.values[index] = Slot::Float(value);
    }

    pub fn float(&self, index: usize) -> f32 {
        match self.values[index] {
            Slot::Float(v) => v,
            _ => 0.0,
        }
    }

    pub fn set_bool(&mut self, index: usize, value: bool) {
        self.values[index] = Slot::Bool(value);
    }

    pub fn bool_at(&self, index: usize) -> bool {
        matches!(self.values[index], Slot::Bool(true))
    }

    /// Force a resend even if the value is unchanged.
    pub fn mark_dirty(&mut self) {
        self.forced = true;
    }

    fn read_slot(&self, stream: &mut BitStream) -> Slot {
        match self.kind {
            ElementKind::Int { bits, signed: true } => {
                Slot::Int(stream.get_signed_int(bits) as i64)
            }
            ElementKind::Int {
                bits,
                signed: false,
            } => Slot::Int(stream.get_int(bits) as i64),
            ElementKind::Float { mantissa_bits } => Slot::Float(stream.get_float(mantissa_bits)),
            ElementKind::Bool => Slot::Bool(stream.get_bool()),
        }
    }
}

impl Replicator for ValueReplicator {
    fn setup(&self) -> &ReplicatorSetup {
        &self.setup
    }

    fn peek(&self, stream: &mut BitStream) -> PeekValue {
        let save = stream.save_read_state();
        let out = match self.kind {
            ElementKind::Int { .. } => {
                let mut vals = Vec::with_capacity(self.values.len());
                for _ in 0..self.values.len() {
                    match self.read_slot(stream) {
                        Slot::Int(v) => vals.push(v),
                        _ => unreachable!(),
                    }
                }
                if vals.len() == 1 {
                    PeekValue::Int(vals[0])
                } else {
                    PeekValue::Ints(vals)
                }
            }
            ElementKind::Float { .. } => {
                let mut vals = Vec::with_capacity(self.values.len());
                for _ in 0..self.values.len() {
                    match self.read_slot(stream) {
                        Slot::Float(v) => vals.push(v),
                        _ => unreachable!(),
                    }
                }
                if vals.len() == 1 {
                    PeekValue::Float(vals[0])
                } else {
                    PeekValue::Floats(vals)
                }
            }
            ElementKind::Bool => PeekValue::Bool(matches!(self.read_slot(stream), Slot::Bool(true))),
        };
        stream.restore_read_state(save);
        out
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatorBasic for ValueReplicator {
    fn check_state(&mut self) -> bool {
        if self.forced || self.values != self.shadow {
            self.forced = false;
            self.shadow.clone_from(&self.values);
            return true;
        }
        false
    }

    fn pack(&mut self, stream: &mut BitStream) {
        for value in &self.values {
            match (*value, self.kind) {
                (Slot::Int(v), ElementKind::Int { bits, signed: true }) => {
                    stream.add_signed_int(v as i32, bits)
                }
                (
                    Slot::Int(v),
                    ElementKind::Int {
                        bits,
                        signed: false,
                    },
                ) => stream.add_int(v as u32, bits),
                (Slot::Float(v), ElementKind::Float { mantissa_bits }) => {
                    stream.add_float(v, mantissa_bits)
                }
                (Slot::Bool(v), ElementKind::Bool) => stream.add_bool(v),
                _ => unreachable!("slot shape matches element kind by construction"),
            }
        }
    }

    fn unpack(&mut self, stream: &mut BitStream, store: bool, _time_sent: u32) {
        for index in 0..self.values.len() {
            let value = self.read_slot(stream);
            if store {
                self.values[index] = value;
                self.shadow[index] = value;
            }
        }
    }
}

/// Length-limited string field.
pub struct StringReplicator {
    setup: ReplicatorSetup,
    max_len: usize,
    value: String,
    shadow: Option<String>,
    forced: bool,
}

impl StringReplicator {
    pub fn new(setup: ReplicatorSetup, max_len: usize) -> Self {
        let start_clean = setup.flags.contains(RepFlags::START_CLEAN);
        Self {
            setup,
            max_len,
            value: String::new(),
            shadow: start_clean.then(String::new),
            forced: false,
        }
    }

    pub fn set(&mut self, value: &str) {
        self.value.clear();
        self.value.push_str(truncated(value, self.max_len));
    }

    pub fn get(&self) -> &str {
        &self.value
    }

    pub fn mark_dirty(&mut self) {
        self.forced = true;
    }
}

fn truncated(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl Replicator for StringReplicator {
    fn setup(&self) -> &ReplicatorSetup {
        &self.setup
    }

    fn peek(&self, stream: &mut BitStream) -> PeekValue {
        let save = stream.save_read_state();
        let value = stream.get_string();
        stream.restore_read_state(save);
        PeekValue::String(value)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatorBasic for StringReplicator {
    fn check_state(&mut self) -> bool {
        if self.forced || self.shadow.as_deref() != Some(self.value.as_str()) {
            self.forced = false;
            self.shadow = Some(self.value.clone());
            return true;
        }
        false
    }

    fn pack(&mut self, stream: &mut BitStream) {
        stream.add_string(&self.value);
    }

    fn unpack(&mut self, stream: &mut BitStream, store: bool, _time_sent: u32) {
        let value = stream.get_string();
        if store {
            self.value = value;
            self.shadow = Some(self.value.clone());
        }
    }
}

/// Fixed-size opaque byte block. The size is part of the cross-host
/// contract; no length travels on the wire.
pub struct BlockReplicator {
    setup: ReplicatorSetup,
    data: Vec<u8>,
    shadow: Option<Vec<u8>>,
    forced: bool,
}

impl BlockReplicator {
    pub fn new(setup: ReplicatorSetup, size: usize) -> Self {
        assert!(size >= 1);
        let start_clean = setup.flags.contains(RepFlags::START_CLEAN);
        let data = vec![0u8; size];
        Self {
            shadow: start_clean.then(|| data.clone()),
            setup,
            data,
            forced: false,
        }
    }

    pub fn set(&mut self, data: &[u8]) {
        let n = data.len().min(self.data.len());
        self.data[..n].copy_from_slice(&data[..n]);
    }

    pub fn get(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn mark_dirty(&mut self) {
        self.forced = true;
    }
}

impl Replicator for BlockReplicator {
    fn setup(&self) -> &ReplicatorSetup {
        &self.setup
    }

    fn peek(&self, stream: &mut BitStream) -> PeekValue {
        let save = stream.save_read_state();
        let mut bytes = Vec::with_capacity(self.data.len());
        for _ in 0..self.data.len() {
            bytes.push(stream.get_int(8) as u8);
        }
        stream.restore_read_state(save);
        PeekValue::Bytes(bytes)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatorBasic for BlockReplicator {
    fn check_state(&mut self) -> bool {
        if self.forced || self.shadow.as_deref() != Some(self.data.as_slice()) {
            self.forced = false;
            self.shadow = Some(self.data.clone());
            return true;
        }
        false
    }

    fn pack(&mut self, stream: &mut BitStream) {
        for &b in &self.data {
            stream.add_int(b as u32, 8);
        }
    }

    fn unpack(&mut self, stream: &mut BitStream, store: bool, _time_sent: u32) {
        for index in 0..self.data.len() {
            let b = stream.get_int(8) as u8;
            if store {
                self.data[index] = b;
            }
        }
        if store {
            self.shadow = Some(self.data.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::RepRules;

    fn plain_setup() -> ReplicatorSetup {
        ReplicatorSetup::new(RepFlags::empty(), RepRules::AUTH_TO_ALL)
    }

    fn clean_setup() -> ReplicatorSetup {
        ReplicatorSetup::new(RepFlags::START_CLEAN, RepRules::AUTH_TO_ALL)
    }

    #[test]
    fn initial_dirty_unless_start_clean() {
        let mut dirty = ValueReplicator::new(
            plain_setup(),
            ElementKind::Int {
                bits: 8,
                signed: false,
            },
            1,
        );
        assert!(dirty.check_state());
        assert!(!dirty.check_state());

        let mut clean = ValueReplicator::new(
            clean_setup(),
            ElementKind::Int {
                bits: 8,
                signed: false,
            },
            1,
        );
        assert!(!clean.check_state());
        clean.set_int(0, 3);
        assert!(clean.check_state());
    }

    #[test]
    fn value_pack_unpack_vector() {
        let kind = ElementKind::Int {
            bits: 12,
            signed: true,
        };
        let mut sender = ValueReplicator::new(plain_setup(), kind, 3);
        sender.set_int(0, -100);
        sender.set_int(1, 0);
        sender.set_int(2, 2047);

        let mut stream = BitStream::new();
        sender.pack(&mut stream);

        let mut receiver = ValueReplicator::new(plain_setup(), kind, 3);
        receiver.unpack(&mut stream, true, 0);
        assert_eq!(receiver.int(0), -100);
        assert_eq!(receiver.int(1), 0);
        assert_eq!(receiver.int(2), 2047);
        assert!(stream.end_of_stream());
    }

    #[test]
    fn unpack_without_store_consumes_exact_bits() {
        let kind = ElementKind::Float { mantissa_bits: 10 };
        let mut sender = ValueReplicator::new(plain_setup(), kind, 2);
        sender.set_float(0, 1.5);
        sender.set_float(1, -2.25);

        let mut stream = BitStream::new();
        sender.pack(&mut stream);
        stream.add_int(0x2A, 8); // trailing data must stay readable

        let mut receiver = ValueReplicator::new(plain_setup(), kind, 2);
        receiver.unpack(&mut stream, false, 0);
        assert_eq!(receiver.float(0), 0.0);
        assert_eq!(stream.get_int(8), 0x2A);
    }

    #[test]
    fn peek_restores_cursor() {
        let kind = ElementKind::Int {
            bits: 16,
            signed: false,
        };
        let mut sender = ValueReplicator::new(plain_setup(), kind, 1);
        sender.set_int(0, 500);
        let mut stream = BitStream::new();
        sender.pack(&mut stream);

        let receiver = ValueReplicator::new(plain_setup(), kind, 1);
        assert_eq!(receiver.peek(&mut stream), PeekValue::Int(500));
        // Cursor untouched, a normal unpack still works.
        let mut receiver = receiver;
        receiver.unpack(&mut stream, true, 0);
        assert_eq!(receiver.int(0), 500);
    }

    #[test]
    fn string_truncates_to_max_len() {
        let mut rep = StringReplicator::new(plain_setup(), 4);
        rep.set("overlong");
        assert_eq!(rep.get(), "over");
    }

    #[test]
    fn string_round_trip_and_dirty() {
        let mut sender = StringReplicator::new(clean_setup(), 32);
        assert!(!sender.check_state());
        sender.set("state");
        assert!(sender.check_state());

        let mut stream = BitStream::new();
        sender.pack(&mut stream);
        let mut receiver = StringReplicator::new(clean_setup(), 32);
        receiver.unpack(&mut stream, true, 0);
        assert_eq!(receiver.get(), "state");
        // Stored value does not re-dirty the receiver.
        assert!(!receiver.check_state());
    }

    #[test]
    fn block_fixed_size_round_trip() {
        let mut sender = BlockReplicator::new(plain_setup(), 4);
        sender.set(&[9, 8, 7, 6]);
        let mut stream = BitStream::new();
        sender.pack(&mut stream);
        assert_eq!(stream.bit_count(), 32);

        let mut receiver = BlockReplicator::new(plain_setup(), 4);
        receiver.unpack(&mut stream, true, 0);
        assert_eq!(receiver.get(), &[9, 8, 7, 6]);
    }

    #[test]
    fn mark_dirty_forces_resend() {
        let mut rep = ValueReplicator::new(clean_setup(), ElementKind::Bool, 1);
        assert!(!rep.check_state());
        rep.mark_dirty();
        assert!(rep.check_state());
        assert!(!rep.check_state());
    }
}
