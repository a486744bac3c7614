//! Bit-addressable buffer used as the universal serialization unit.
//!
//! Every value that crosses the wire goes through a [`BitStream`]: integers
//! with arbitrary bit widths, floats with truncated mantissas, strings,
//! buffers and whole sub-streams. Write and read cursors are independent and
//! can be checkpointed, which is what the interceptor peek machinery relies
//! on.

/// Saved cursor position, restorable via `restore_read_state` /
/// `restore_write_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitPos {
    bits: u64,
}

const DEFAULT_MAX_FILL: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct BitStream {
    data: Vec<u8>,
    /// Bits written so far.
    write: u64,
    /// Bits consumed so far.
    read: u64,
    /// Soft byte budget checked by `check_max`/`check_full`.
    max_fill: usize,
    /// Set once a get/skip ran past the written data.
    overrun: bool,
}

impl BitStream {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// `capacity_hint` is the expected payload size in bytes; exceeding it
    /// later only costs a reallocation, exceeding `max_fill` trips
    /// `check_full`.
    pub fn with_capacity(capacity_hint: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity_hint),
            write: 0,
            read: 0,
            max_fill: DEFAULT_MAX_FILL,
            overrun: false,
        }
    }

    pub fn set_max_fill(&mut self, bytes: usize) {
        self.max_fill = bytes;
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.write = 0;
        self.read = 0;
        self.overrun = false;
    }

    /* cursor state */

    pub fn save_write_state(&self) -> BitPos {
        BitPos { bits: self.write }
    }

    /// Undoes all `add_*` calls since the matching `save_write_state`.
    pub fn restore_write_state(&mut self, pos: BitPos) {
        self.write = pos.bits;
    }

    pub fn save_read_state(&self) -> BitPos {
        BitPos { bits: self.read }
    }

    /// Undoes all `get_*`/`skip_*` calls since the matching `save_read_state`.
    pub fn restore_read_state(&mut self, pos: BitPos) {
        self.read = pos.bits;
        self.overrun = false;
    }

    pub fn reset_read_state(&mut self) {
        self.read = 0;
        self.overrun = false;
    }

    /* size checks */

    /// True if `bits` more bits still fit under the soft budget.
    pub fn check_max(&self, bits: u64) -> bool {
        (self.write + bits) <= (self.max_fill as u64) * 8
    }

    /// True if the soft budget has already been exceeded.
    pub fn check_full(&self) -> bool {
        self.write / 8 > self.max_fill as u64
    }

    /// True once the read cursor has consumed all written data.
    pub fn end_of_stream(&self) -> bool {
        self.read >= self.write
    }

    /// True if a read ran past the end of the written data.
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    pub fn bit_count(&self) -> u64 {
        self.write
    }

    pub fn bits_remaining(&self) -> u64 {
        self.write.saturating_sub(self.read)
    }

    /* raw bit access */

    fn write_bit(&mut self, bit: bool) {
        let byte = (self.write / 8) as usize;
        let shift = (self.write % 8) as u8;
        if byte >= self.data.len() {
            self.data.resize(byte + 1, 0);
        }
        if bit {
            self.data[byte] |= 1 << shift;
        } else {
            self.data[byte] &= !(1 << shift);
        }
        self.write += 1;
    }

    fn read_bit(&mut self) -> bool {
        if self.read >= self.write {
            self.overrun = true;
            self.read += 1;
            return false;
        }
        let byte = (self.read / 8) as usize;
        let shift = (self.read % 8) as u8;
        self.read += 1;
        (self.data[byte] >> shift) & 1 == 1
    }

    fn write_bits(&mut self, value: u64, bits: u8) {
        for i in 0..bits {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn read_bits(&mut self, bits: u8) -> u64 {
        let mut value = 0u64;
        for i in 0..bits {
            if self.read_bit() {
                value |= 1 << i;
            }
        }
        value
    }

    /* typed operations */

    /// Append the low `bits` bits of `data`. The sign of a 32 bit value is
    /// only carried when all 32 bits are stored; use `add_signed_int` for
    /// narrower signed data.
    pub fn add_int(&mut self, data: u32, bits: u8) {
        debug_assert!(bits >= 1 && bits <= 32);
        self.write_bits(data as u64, bits);
    }

    pub fn get_int(&mut self, bits: u8) -> u32 {
        debug_assert!(bits >= 1 && bits <= 32);
        self.read_bits(bits) as u32
    }

    pub fn skip_int(&mut self, bits: u8) {
        self.skip_bits(bits as u64);
    }

    /// Append a signed int; one extra bit carries the sign.
    pub fn add_signed_int(&mut self, data: i32, bits: u8) {
        self.write_bit(data < 0);
        self.write_bits(data.unsigned_abs() as u64, bits);
    }

    pub fn get_signed_int(&mut self, bits: u8) -> i32 {
        let negative = self.read_bit();
        let magnitude = self.read_bits(bits) as u32;
        if negative {
            -(magnitude as i64) as i32
        } else {
            magnitude as i32
        }
    }

    pub fn skip_signed_int(&mut self, bits: u8) {
        self.skip_bits(bits as u64 + 1);
    }

    pub fn add_bool(&mut self, b: bool) {
        self.write_bit(b);
    }

    pub fn get_bool(&mut self) -> bool {
        self.read_bit()
    }

    pub fn skip_bool(&mut self) {
        self.skip_bits(1);
    }

    /// Append a float keeping sign and full exponent but only the top
    /// `mant_bits` bits of the 23-bit mantissa. `mant_bits == 23` is exact.
    ///
    /// Truncation, not rounding: 20.7236 stored with 10 mantissa bits reads
    /// back as 20.719 (see the unit tests for the full table).
    pub fn add_float(&mut self, f: f32, mant_bits: u8) {
        debug_assert!(mant_bits >= 1 && mant_bits <= 23);
        let raw = f.to_bits();
        let sign = raw >> 31;
        let exponent = (raw >> 23) & 0xff;
        let mantissa = raw & 0x7f_ffff;
        self.write_bit(sign == 1);
        self.write_bits(exponent as u64, 8);
        self.write_bits((mantissa >> (23 - mant_bits)) as u64, mant_bits);
    }

    pub fn get_float(&mut self, mant_bits: u8) -> f32 {
        debug_assert!(mant_bits >= 1 && mant_bits <= 23);
        let sign = self.read_bit() as u32;
        let exponent = self.read_bits(8) as u32;
        let mantissa = (self.read_bits(mant_bits) as u32) << (23 - mant_bits);
        f32::from_bits((sign << 31) | (exponent << 23) | mantissa)
    }

    pub fn skip_float(&mut self, mant_bits: u8) {
        self.skip_bits(9 + mant_bits as u64);
    }

    /// Append a length-prefixed UTF-8 string (length in bytes, 16 bits).
    pub fn add_string(&mut self, s: &str) {
        let bytes = s.as_bytes();
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.write_bits(bytes.len() as u64, 16);
        for &b in bytes {
            self.write_bits(b as u64, 8);
        }
    }

    /// Byte length of the upcoming string without consuming it.
    pub fn string_size(&mut self) -> u16 {
        let save = self.save_read_state();
        let size = self.read_bits(16) as u16;
        self.restore_read_state(save);
        size
    }

    pub fn get_string(&mut self) -> String {
        let len = self.read_bits(16) as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_bits(8) as u8);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn skip_string(&mut self) {
        let len = self.read_bits(16) as u64;
        self.skip_bits(len * 8);
    }

    /// Append a length-prefixed byte buffer (length 16 bits).
    pub fn add_buffer(&mut self, buf: &[u8]) {
        debug_assert!(buf.len() <= u16::MAX as usize);
        self.write_bits(buf.len() as u64, 16);
        for &b in buf {
            self.write_bits(b as u64, 8);
        }
    }

    pub fn get_buffer(&mut self) -> Vec<u8> {
        let len = self.read_bits(16) as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_bits(8) as u8);
        }
        bytes
    }

    pub fn skip_buffer(&mut self) {
        let len = self.read_bits(16) as u64;
        self.skip_bits(len * 8);
    }

    /// Splice another stream's written bits onto this one, unprefixed. The
    /// reader must know the bit count (pair with `get_stream`).
    pub fn add_stream(&mut self, other: &BitStream) {
        let mut src = other.clone();
        src.reset_read_state();
        for _ in 0..other.write {
            let bit = src.read_bit();
            self.write_bit(bit);
        }
    }

    /// Extract `bits` bits as a fresh stream with its read cursor at zero.
    pub fn get_stream(&mut self, bits: u64) -> BitStream {
        let mut out = BitStream::with_capacity(bits.div_ceil(8) as usize);
        for _ in 0..bits {
            let bit = self.read_bit();
            out.write_bit(bit);
        }
        out
    }

    pub fn skip_bits(&mut self, amount: u64) {
        self.read += amount;
        if self.read > self.write {
            self.overrun = true;
        }
    }

    /* wire crossing */

    /// Flatten to bytes. The only place stream contents meet the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let len = self.write.div_ceil(8) as usize;
        self.data[..len].to_vec()
    }

    /// Rebuild from bytes; the write cursor lands on the final byte boundary,
    /// so up to 7 padding bits may trail the original payload.
    pub fn deserialize(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            write: bytes.len() as u64 * 8,
            read: 0,
            max_fill: DEFAULT_MAX_FILL.max(bytes.len()),
            overrun: false,
        }
    }

    /// Content equality over the written bits only.
    pub fn is_equal(&self, other: &BitStream) -> bool {
        if self.write != other.write {
            return false;
        }
        let full = (self.write / 8) as usize;
        if self.data[..full] != other.data[..full] {
            return false;
        }
        let rem = (self.write % 8) as u8;
        if rem == 0 {
            return true;
        }
        let mask = (1u8 << rem) - 1;
        (self.data[full] & mask) == (other.data[full] & mask)
    }
}
