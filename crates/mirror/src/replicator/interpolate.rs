//! Interpolated scalar field. The authority replicates a target value; the
//! receiving side blends its live value toward the target by a fixed factor
//! per tick, snapping when the gap exceeds a threshold.

use std::any::Any;

use crate::bitstream::BitStream;
use crate::node::NodeRole;

use super::{PeekValue, RepFlags, Replicator, ReplicatorBasic, ReplicatorSetup};

pub struct InterpolateReplicator {
    setup: ReplicatorSetup,
    mantissa_bits: u8,
    /// Fraction of the remaining delta closed per `process` call.
    factor: f32,
    /// Deltas larger than this snap instead of blending.
    threshold: f32,
    value: f32,
    target: f32,
    shadow: f32,
    forced: bool,
}

impl InterpolateReplicator {
    /// The original middleware documents 0.4 as the default blend factor.
    pub const DEFAULT_FACTOR: f32 = 0.4;

    pub fn new(setup: ReplicatorSetup, mantissa_bits: u8, factor: f32, threshold: f32) -> Self {
        assert!(mantissa_bits >= 1 && mantissa_bits <= 23);
        assert!(factor > 0.0 && factor <= 1.0);
        let start_clean = setup.flags.contains(RepFlags::START_CLEAN);
        Self {
            setup,
            mantissa_bits,
            factor,
            threshold,
            value: 0.0,
            target: 0.0,
            shadow: if start_clean { 0.0 } else { f32::NAN },
            forced: false,
        }
    }

    /// Authority-side write. On receivers the live value moves on its own;
    /// writing there is overwritten by the next blend step.
    pub fn set(&mut self, value: f32) {
        self.value = value;
        self.target = value;
    }

    /// The live (blended) value.
    pub fn get(&self) -> f32 {
        self.value
    }

    /// The live value rounded to the nearest integer, for integer fields
    /// replicated through the same blending.
    pub fn get_int(&self) -> i64 {
        self.value.round() as i64
    }

    pub fn set_int(&mut self, value: i64) {
        self.set(value as f32);
    }

    /// The most recently received target.
    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn set_factor(&mut self, factor: f32) {
        self.factor = factor.clamp(f32::EPSILON, 1.0);
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn mark_dirty(&mut self) {
        self.forced = true;
    }
}

impl Replicator for InterpolateReplicator {
    fn setup(&self) -> &ReplicatorSetup {
        &self.setup
    }

    fn process(&mut self, role: NodeRole, _sim_time_ms: u32) {
        if role == NodeRole::Authority {
            return;
        }
        let delta = self.target - self.value;
        if delta == 0.0 {
            return;
        }
        if delta.abs() > self.threshold {
            self.value = self.target;
        } else {
            self.value += delta * self.factor;
        }
    }

    fn peek(&self, stream: &mut BitStream) -> PeekValue {
        let save = stream.save_read_state();
        let value = stream.get_float(self.mantissa_bits);
        stream.restore_read_state(save);
        PeekValue::Float(value)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl ReplicatorBasic for InterpolateReplicator {
    fn check_state(&mut self) -> bool {
        // Authority-side dirty tracking compares the set value, not the
        // blended one (they coincide on the authority).
        if self.forced || self.target != self.shadow || self.shadow.is_nan() {
            self.forced = false;
            self.shadow = self.target;
            return true;
        }
        false
    }

    fn pack(&mut self, stream: &mut BitStream) {
        stream.add_float(self.target, self.mantissa_bits);
    }

    fn unpack(&mut self, stream: &mut BitStream, store: bool, _time_sent: u32) {
        let target = stream.get_float(self.mantissa_bits);
        if store {
            self.target = target;
        }
    }
}
