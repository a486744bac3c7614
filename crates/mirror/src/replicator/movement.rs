//! Client-authoritative movement with server corrections.
//!
//! One field, three logical channels:
//! - authority -> proxy: position/velocity/acceleration snapshots, smoothed
//!   on the proxy with a cubic Hermite blend toward the extrapolated target;
//! - owner -> authority: the raw input stream plus the position the owner
//!   claims to be at;
//! - authority -> owner: corrections when the claimed position diverges,
//!   replayed by the owner against its kept input history.

use std::any::Any;
use std::collections::VecDeque;

use log::trace;

use crate::bitstream::BitStream;
use crate::control::ConnId;
use crate::node::NodeRole;

use super::{
    AdvancedMode, PeekValue, Replicator, ReplicatorAdvanced, ReplicatorSetup, SendContext,
};

const CHANNEL_STATE: u32 = 0;
const CHANNEL_INPUT: u32 = 1;
const CHANNEL_CORRECTION: u32 = 2;

const MAX_INPUT_HISTORY: usize = 128;

/// Divergence test between the owner's claimed position and the authority's
/// simulated one. Only the constant squared-distance threshold is
/// implemented; the enum leaves room for a callback-shaped variant without
/// touching the wire format.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum ErrorThreshold {
    /// Maximum tolerated euclidean distance.
    Constant(f32),
}

impl ErrorThreshold {
    fn exceeded(&self, claimed: &[f32], actual: &[f32]) -> bool {
        match self {
            ErrorThreshold::Constant(max) => {
                let sq: f32 = claimed
                    .iter()
                    .zip(actual)
                    .map(|(c, a)| (c - a) * (c - a))
                    .sum();
                sq > max * max
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MovementConfig {
    /// Float mantissa bits used for every pos/vel/acc component.
    pub mantissa_bits: u8,
    /// Proxy smoothing window in ms.
    pub interpolation_time_ms: u32,
    pub error_threshold: ErrorThreshold,
    /// Advisory resend floor for state snapshots, in ms.
    pub min_delay: Option<u16>,
    /// Snapshots are resent even when unchanged once this many ms passed.
    pub max_delay: Option<u16>,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            mantissa_bits: 23,
            interpolation_time_ms: 100,
            error_threshold: ErrorThreshold::Constant(25.0),
            min_delay: None,
            max_delay: Some(250),
        }
    }
}

/// Receives the movement callbacks the application must react to.
pub trait MoveListener {
    /// Authority: an owner input arrived; apply it to the simulation.
    fn input_updated(
        &mut self,
        _input: &mut BitStream,
        _changed: bool,
        _client_time: u32,
        _estimated_time_sent: u32,
    ) {
    }

    /// Owner: an input was flushed to the wire.
    fn input_sent(&mut self, _input: &mut BitStream) {}

    /// Owner: the authority rejected our claimed position.
    fn correction_received(
        &mut self,
        _pos: &[f32],
        _vel: &[f32],
        _acc: &[f32],
        _teleport: bool,
        _estimated_time_sent: u32,
    ) {
    }

    /// Proxy: a fresh state snapshot arrived.
    fn update_received(
        &mut self,
        _pos: &[f32],
        _vel: &[f32],
        _acc: &[f32],
        _teleport: bool,
        _estimated_time_sent: u32,
    ) {
    }
}

/// One owner input kept for replay after a correction.
#[derive(Debug, Clone)]
pub struct MoveHistoryEntry {
    pub input: BitStream,
    pub client_time: u32,
}

/// Cubic Hermite segment from the shown state toward the extrapolated
/// target, parameterized over wall-clock ms.
#[derive(Debug, Clone)]
struct Spline<const N: usize> {
    t0: f32,
    t1: f32,
    p0: [f32; N],
    v0: [f32; N],
    p1: [f32; N],
    v1: [f32; N],
}

impl<const N: usize> Spline<N> {
    fn sample(&self, t: f32) -> ([f32; N], [f32; N]) {
        let span = (self.t1 - self.t0).max(1.0);
        let s = ((t - self.t0) / span).clamp(0.0, 1.0);
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        // Derivatives of the basis, for the velocity sample.
        let d00 = 6.0 * s2 - 6.0 * s;
        let d10 = 3.0 * s2 - 4.0 * s + 1.0;
        let d01 = -6.0 * s2 + 6.0 * s;
        let d11 = 3.0 * s2 - 2.0 * s;

        let mut pos = [0.0; N];
        let mut vel = [0.0; N];
        for i in 0..N {
            let m0 = self.v0[i] * span;
            let m1 = self.v1[i] * span;
            pos[i] = h00 * self.p0[i] + h10 * m0 + h01 * self.p1[i] + h11 * m1;
            vel[i] = (d00 * self.p0[i] + d10 * m0 + d01 * self.p1[i] + d11 * m1) / span;
        }
        (pos, vel)
    }

    fn done(&self, t: f32) -> bool {
        t >= self.t1
    }
}

/// Advanced movement replicator over `N` spatial dimensions.
pub struct MovementReplicator<const N: usize> {
    setup: ReplicatorSetup,
    cfg: MovementConfig,
    listener: Box<dyn MoveListener>,
    time_scale: f32,

    // Authoritative (and owner-predicted) state.
    pos: [f32; N],
    vel: [f32; N],
    acc: [f32; N],
    /// Serial at the latest teleport; links behind it get a snap flag.
    teleport_serial: u32,
    state_serial: u32,
    sent_serial: std::collections::HashMap<ConnId, u32>,
    pending_corrections: std::collections::HashMap<ConnId, u32>,

    // Owner side.
    pending_input: Option<(BitStream, bool, u32)>,
    input_history: VecDeque<MoveHistoryEntry>,
    replay: VecDeque<MoveHistoryEntry>,

    // Proxy side.
    recv_pos: [f32; N],
    recv_vel: [f32; N],
    recv_acc: [f32; N],
    recv_time: u32,
    shown_pos: [f32; N],
    shown_vel: [f32; N],
    spline: Option<Spline<N>>,
    have_update: bool,
    last_process_ms: u32,
}

impl<const N: usize> MovementReplicator<N> {
    pub fn new(setup: ReplicatorSetup, cfg: MovementConfig, listener: Box<dyn MoveListener>) -> Self {
        assert!(cfg.mantissa_bits >= 1 && cfg.mantissa_bits <= 23);
        Self {
            setup,
            cfg,
            listener,
            time_scale: 1.0,
            pos: [0.0; N],
            vel: [0.0; N],
            acc: [0.0; N],
            teleport_serial: 0,
            state_serial: 0,
            sent_serial: Default::default(),
            pending_corrections: Default::default(),
            pending_input: None,
            input_history: VecDeque::new(),
            replay: VecDeque::new(),
            recv_pos: [0.0; N],
            recv_vel: [0.0; N],
            recv_acc: [0.0; N],
            recv_time: 0,
            shown_pos: [0.0; N],
            shown_vel: [0.0; N],
            spline: None,
            have_update: false,
            last_process_ms: 0,
        }
    }

    /// Authority (or owner prediction): publish the simulated state. Marks
    /// a snapshot for every proxy link.
    pub fn update_state(&mut self, pos: [f32; N], vel: [f32; N], acc: [f32; N]) {
        self.pos = pos;
        self.vel = vel;
        self.acc = acc;
        self.state_serial = self.state_serial.wrapping_add(1);
    }

    /// Like `update_state`, but proxies snap instead of blending.
    pub fn teleport(&mut self, pos: [f32; N]) {
        self.pos = pos;
        self.vel = [0.0; N];
        self.acc = [0.0; N];
        self.state_serial = self.state_serial.wrapping_add(1);
        self.teleport_serial = self.state_serial;
    }

    /// Owner: queue an input frame together with the position the local
    /// prediction arrived at. Flushed on the next output cycle.
    pub fn update_input(&mut self, input: BitStream, changed: bool, client_time: u32) {
        self.input_history.push_back(MoveHistoryEntry {
            input: input.clone(),
            client_time,
        });
        while self.input_history.len() > MAX_INPUT_HISTORY {
            self.input_history.pop_front();
        }
        self.pending_input = Some((input, changed, client_time));
    }

    /// Owner: after a correction, inputs newer than the corrected time are
    /// queued for replay. Pops the next one.
    pub fn next_history_entry(&mut self) -> Option<MoveHistoryEntry> {
        self.replay.pop_front()
    }

    /// Current best position: the smoothed view on proxies, the simulated
    /// state elsewhere.
    pub fn position(&self, role: NodeRole) -> [f32; N] {
        match role {
            NodeRole::Proxy => self.shown_pos,
            _ => self.pos,
        }
    }

    pub fn velocity(&self, role: NodeRole) -> [f32; N] {
        match role {
            NodeRole::Proxy => self.shown_vel,
            _ => self.vel,
        }
    }

    pub fn acceleration(&self) -> [f32; N] {
        self.acc
    }

    /// Scales extrapolation speed on proxies (slow motion etc.).
    pub fn set_time_scale(&mut self, scale: f32) {
        self.time_scale = scale.max(0.0);
    }

    pub fn set_interpolation_time(&mut self, ms: u32) {
        self.cfg.interpolation_time_ms = ms;
    }

    /// The raw extrapolated target at `now_ms`, before smoothing.
    pub fn extrapolated_position(&self, now_ms: u32) -> [f32; N] {
        let dt = now_ms.saturating_sub(self.recv_time) as f32 / 1000.0 * self.time_scale;
        let mut out = [0.0; N];
        for i in 0..N {
            out[i] = self.recv_pos[i] + self.recv_vel[i] * dt + 0.5 * self.recv_acc[i] * dt * dt;
        }
        out
    }

    fn extrapolated_velocity(&self, now_ms: u32) -> [f32; N] {
        let dt = now_ms.saturating_sub(self.recv_time) as f32 / 1000.0 * self.time_scale;
        let mut out = [0.0; N];
        for i in 0..N {
            out[i] = self.recv_vel[i] + self.recv_acc[i] * dt;
        }
        out
    }

    fn write_vectors(&self, s: &mut BitStream, pos: &[f32; N], vel: &[f32; N], acc: &[f32; N]) {
        let mb = self.cfg.mantissa_bits;
        for v in pos {
            s.add_float(*v, mb);
        }
        for v in vel {
            s.add_float(*v, mb);
        }
        for v in acc {
            s.add_float(*v, mb);
        }
    }

    fn read_vectors(&self, s: &mut BitStream) -> ([f32; N], [f32; N], [f32; N]) {
        let mb = self.cfg.mantissa_bits;
        let mut pos = [0.0; N];
        let mut vel = [0.0; N];
        let mut acc = [0.0; N];
        for v in &mut pos {
            *v = s.get_float(mb);
        }
        for v in &mut vel {
            *v = s.get_float(mb);
        }
        for v in &mut acc {
            *v = s.get_float(mb);
        }
        (pos, vel, acc)
    }

    fn apply_snapshot(
        &mut self,
        pos: [f32; N],
        vel: [f32; N],
        acc: [f32; N],
        teleport: bool,
        time_sent: u32,
        now_ms: u32,
    ) {
        self.recv_pos = pos;
        self.recv_vel = vel;
        self.recv_acc = acc;
        self.recv_time = time_sent;
        if teleport || !self.have_update {
            self.shown_pos = pos;
            self.shown_vel = vel;
            self.spline = None;
        } else {
            // Blend from the currently shown state to where the fresh data
            // says the object will be one interpolation window from now.
            let t1 = now_ms + self.cfg.interpolation_time_ms;
            self.spline = Some(Spline {
                t0: now_ms as f32,
                t1: t1 as f32,
                p0: self.shown_pos,
                v0: self.shown_vel,
                p1: self.extrapolated_position(t1),
                v1: self.extrapolated_velocity(t1),
            });
        }
        self.have_update = true;
    }
}

impl<const N: usize> Replicator for MovementReplicator<N> {
    fn setup(&self) -> &ReplicatorSetup {
        &self.setup
    }

    fn process(&mut self, role: NodeRole, sim_time_ms: u32) {
        self.last_process_ms = sim_time_ms;
        if role != NodeRole::Proxy || !self.have_update {
            return;
        }
        let t = sim_time_ms as f32;
        match &self.spline {
            Some(spline) if !spline.done(t) => {
                let (pos, vel) = spline.sample(t);
                self.shown_pos = pos;
                self.shown_vel = vel;
            }
            _ => {
                self.spline = None;
                self.shown_pos = self.extrapolated_position(sim_time_ms);
                self.shown_vel = self.extrapolated_velocity(sim_time_ms);
            }
        }
    }

    fn peek(&self, _stream: &mut BitStream) -> PeekValue {
        // Advanced payloads are not field updates; expose the current
        // position instead.
        PeekValue::Floats(self.pos.to_vec())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<const N: usize> ReplicatorAdvanced for MovementReplicator<N> {
    fn on_pre_send(
        &mut self,
        ctx: &mut SendContext,
        conn: ConnId,
        remote_role: NodeRole,
        last_update: &mut u32,
        now_ms: u32,
    ) {
        match remote_role {
            NodeRole::Proxy => {
                let sent = self.sent_serial.get(&conn).copied().unwrap_or(0);
                let stale_ok = self
                    .cfg
                    .max_delay
                    .is_some_and(|d| now_ms.saturating_sub(*last_update) >= d as u32);
                let fresh = sent != self.state_serial;
                if !fresh && !stale_ok {
                    return;
                }
                if let Some(min) = self.cfg.min_delay {
                    if now_ms.saturating_sub(*last_update) < min as u32 {
                        return;
                    }
                }
                let mut payload = BitStream::new();
                payload.add_int(CHANNEL_STATE, 2);
                payload.add_bool(sent < self.teleport_serial);
                let (pos, vel, acc) = (self.pos, self.vel, self.acc);
                self.write_vectors(&mut payload, &pos, &vel, &acc);
                ctx.send_data(AdvancedMode::Unreliable, payload);
                self.sent_serial.insert(conn, self.state_serial);
                *last_update = now_ms;
            }
            NodeRole::Owner => {
                if let Some(client_time) = self.pending_corrections.remove(&conn) {
                    let sent = self.sent_serial.get(&conn).copied().unwrap_or(0);
                    let mut payload = BitStream::new();
                    payload.add_int(CHANNEL_CORRECTION, 2);
                    payload.add_bool(sent < self.teleport_serial);
                    payload.add_int(client_time, 32);
                    let (pos, vel, acc) = (self.pos, self.vel, self.acc);
                    self.write_vectors(&mut payload, &pos, &vel, &acc);
                    ctx.send_data(AdvancedMode::ReliableUnordered, payload);
                    *last_update = now_ms;
                    trace!("movement: correction queued for {conn}");
                }
            }
            NodeRole::Authority => {
                if let Some((mut input, changed, client_time)) = self.pending_input.take() {
                    let mut payload = BitStream::new();
                    payload.add_int(CHANNEL_INPUT, 2);
                    payload.add_int(client_time, 32);
                    payload.add_bool(changed);
                    let mb = self.cfg.mantissa_bits;
                    for v in &self.pos {
                        payload.add_float(*v, mb);
                    }
                    payload.add_int(input.bit_count() as u32, 16);
                    payload.add_stream(&input);
                    ctx.send_data(AdvancedMode::Unreliable, payload);
                    self.listener.input_sent(&mut input);
                    *last_update = now_ms;
                }
            }
        }
    }

    fn on_data_received(
        &mut self,
        conn: ConnId,
        _remote_role: NodeRole,
        payload: &mut BitStream,
        store: bool,
        time_sent: u32,
    ) {
        let channel = payload.get_int(2);
        match channel {
            CHANNEL_STATE => {
                let teleport = payload.get_bool();
                let (pos, vel, acc) = self.read_vectors(payload);
                if store {
                    let now = self.last_process_ms.max(time_sent);
                    self.apply_snapshot(pos, vel, acc, teleport, time_sent, now);
                    self.listener
                        .update_received(&pos, &vel, &acc, teleport, time_sent);
                }
            }
            CHANNEL_INPUT => {
                let client_time = payload.get_int(32);
                let changed = payload.get_bool();
                let mb = self.cfg.mantissa_bits;
                let mut claimed = [0.0f32; N];
                for v in &mut claimed {
                    *v = payload.get_float(mb);
                }
                let bits = payload.get_int(16) as u64;
                let mut input = payload.get_stream(bits);
                if store {
                    self.listener
                        .input_updated(&mut input, changed, client_time, time_sent);
                    if self
                        .cfg
                        .error_threshold
                        .exceeded(&claimed, &self.pos)
                    {
                        trace!("movement: divergence on {conn}, correcting");
                        self.pending_corrections.insert(conn, client_time);
                    }
                }
            }
            CHANNEL_CORRECTION => {
                let teleport = payload.get_bool();
                let client_time = payload.get_int(32);
                let (pos, vel, acc) = self.read_vectors(payload);
                if store {
                    // Adopt the corrected state as the replay base and line
                    // up every newer input for re-simulation.
                    self.pos = pos;
                    self.vel = vel;
                    self.acc = acc;
                    self.input_history
                        .retain(|e| e.client_time > client_time);
                    self.replay = self.input_history.clone();
                    self.listener
                        .correction_received(&pos, &vel, &acc, teleport, time_sent);
                }
            }
            other => {
                trace!("movement: unknown channel {other}, payload dropped");
                let remaining = payload.bits_remaining();
                payload.skip_bits(remaining);
            }
        }
    }

    fn on_connection_removed(&mut self, conn: ConnId, _remote_role: NodeRole) {
        self.sent_serial.remove(&conn);
        self.pending_corrections.remove(&conn);
    }

    fn on_local_role_changed(&mut self, _old: NodeRole, new: NodeRole) {
        if new != NodeRole::Owner {
            self.input_history.clear();
            self.replay.clear();
            self.pending_input = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::{RepFlags, RepRules};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        inputs: Vec<u32>,
        corrections: Vec<[f32; 2]>,
        updates: usize,
    }

    struct RecListener(Rc<RefCell<Recorder>>);

    impl MoveListener for RecListener {
        fn input_updated(
            &mut self,
            _input: &mut BitStream,
            _changed: bool,
            client_time: u32,
            _est: u32,
        ) {
            self.0.borrow_mut().inputs.push(client_time);
        }

        fn correction_received(
            &mut self,
            pos: &[f32],
            _vel: &[f32],
            _acc: &[f32],
            _teleport: bool,
            _est: u32,
        ) {
            self.0.borrow_mut().corrections.push([pos[0], pos[1]]);
        }

        fn update_received(
            &mut self,
            _pos: &[f32],
            _vel: &[f32],
            _acc: &[f32],
            _teleport: bool,
            _est: u32,
        ) {
            self.0.borrow_mut().updates += 1;
        }
    }

    fn setup() -> ReplicatorSetup {
        ReplicatorSetup::new(RepFlags::empty(), RepRules::AUTH_TO_ALL | RepRules::OWNER_TO_AUTH)
    }

    fn pair() -> (MovementReplicator<2>, MovementReplicator<2>, Rc<RefCell<Recorder>>) {
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let a = MovementReplicator::new(
            setup(),
            MovementConfig::default(),
            Box::new(RecListener(rec.clone())),
        );
        let b = MovementReplicator::new(
            setup(),
            MovementConfig::default(),
            Box::new(RecListener(rec.clone())),
        );
        (a, b, rec)
    }

    #[test]
    fn state_snapshot_reaches_proxy() {
        let (mut auth, mut proxy, rec) = pair();
        auth.update_state([10.0, 5.0], [1.0, 0.0], [0.0, 0.0]);

        let mut ctx = SendContext::default();
        let mut last = 0u32;
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 100);
        let mut sends = ctx.drain();
        assert_eq!(sends.len(), 1);

        proxy.on_data_received(ConnId(1), NodeRole::Authority, &mut sends[0].payload, true, 100);
        assert!(sends[0].payload.end_of_stream());
        assert_eq!(rec.borrow().updates, 1);
        // First update snaps.
        assert_eq!(proxy.position(NodeRole::Proxy), [10.0, 5.0]);
    }

    #[test]
    fn unchanged_state_is_not_resent_before_max_delay() {
        let (mut auth, _, _) = pair();
        auth.update_state([1.0, 1.0], [0.0, 0.0], [0.0, 0.0]);

        let mut ctx = SendContext::default();
        let mut last = 0u32;
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 10);
        assert_eq!(ctx.drain().len(), 1);
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 20);
        assert!(ctx.drain().is_empty());
        // max_delay (250ms default) forces a keep-fresh resend.
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 400);
        assert_eq!(ctx.drain().len(), 1);
    }

    #[test]
    fn proxy_extrapolates_between_updates() {
        let (mut auth, mut proxy, _) = pair();
        auth.update_state([0.0, 0.0], [10.0, 0.0], [0.0, 0.0]);

        let mut ctx = SendContext::default();
        let mut last = 0u32;
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 1000);
        let mut sends = ctx.drain();
        proxy.on_data_received(ConnId(1), NodeRole::Authority, &mut sends[0].payload, true, 1000);

        // One second later the object should have moved ~10 units in x.
        proxy.process(NodeRole::Proxy, 2000);
        let pos = proxy.position(NodeRole::Proxy);
        assert!((pos[0] - 10.0).abs() < 0.5, "x = {}", pos[0]);
        assert!(pos[1].abs() < 0.01);
    }

    #[test]
    fn divergent_input_triggers_correction_and_replay() {
        let (mut owner, mut auth, rec) = pair();
        auth.update_state([0.0, 0.0], [0.0, 0.0], [0.0, 0.0]);

        // Owner claims a position far from the authority's.
        owner.update_state([100.0, 0.0], [0.0, 0.0], [0.0, 0.0]);
        let mut input = BitStream::new();
        input.add_int(3, 4);
        owner.update_input(input.clone(), true, 500);
        owner.update_input(input, true, 600);

        let mut ctx = SendContext::default();
        let mut last = 0u32;
        // Flushes only the latest queued input.
        owner.on_pre_send(&mut ctx, ConnId(1), NodeRole::Authority, &mut last, 600);
        let mut sends = ctx.drain();
        assert_eq!(sends.len(), 1);

        auth.on_data_received(ConnId(1), NodeRole::Owner, &mut sends[0].payload, true, 600);
        assert!(sends[0].payload.end_of_stream());
        assert_eq!(rec.borrow().inputs, vec![600]);

        // Authority now emits a correction for that owner.
        let mut ctx = SendContext::default();
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Owner, &mut last, 700);
        let mut sends = ctx.drain();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].mode, AdvancedMode::ReliableUnordered);

        owner.on_data_received(ConnId(1), NodeRole::Authority, &mut sends[0].payload, true, 700);
        assert_eq!(rec.borrow().corrections, vec![[0.0, 0.0]]);
        // Corrected at client_time 600; nothing newer remains to replay.
        assert!(owner.next_history_entry().is_none());
        // Owner adopted the corrected state.
        assert_eq!(owner.position(NodeRole::Owner), [0.0, 0.0]);
    }

    #[test]
    fn close_input_produces_no_correction() {
        let (mut owner, mut auth, _) = pair();
        auth.update_state([1.0, 1.0], [0.0, 0.0], [0.0, 0.0]);
        owner.update_state([1.5, 1.0], [0.0, 0.0], [0.0, 0.0]);
        owner.update_input(BitStream::new(), false, 100);

        let mut ctx = SendContext::default();
        let mut last = 0u32;
        owner.on_pre_send(&mut ctx, ConnId(1), NodeRole::Authority, &mut last, 100);
        let mut sends = ctx.drain();
        auth.on_data_received(ConnId(1), NodeRole::Owner, &mut sends[0].payload, true, 100);

        let mut ctx = SendContext::default();
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Owner, &mut last, 150);
        assert!(ctx.drain().is_empty());
    }

    #[test]
    fn skipped_payload_consumes_exact_bits() {
        let (mut auth, mut proxy, rec) = pair();
        auth.update_state([4.0, 4.0], [0.0, 0.0], [0.0, 0.0]);

        let mut ctx = SendContext::default();
        let mut last = 0u32;
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 50);
        let mut sends = ctx.drain();
        sends[0].payload.add_int(0x3, 2); // trailing sentinel

        proxy.on_data_received(ConnId(1), NodeRole::Authority, &mut sends[0].payload, false, 50);
        assert_eq!(rec.borrow().updates, 0);
        assert_eq!(sends[0].payload.get_int(2), 0x3);
    }

    #[test]
    fn teleport_snaps_proxy() {
        let (mut auth, mut proxy, _) = pair();
        auth.update_state([0.0, 0.0], [5.0, 0.0], [0.0, 0.0]);
        let mut ctx = SendContext::default();
        let mut last = 0u32;
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 100);
        let mut sends = ctx.drain();
        proxy.on_data_received(ConnId(1), NodeRole::Authority, &mut sends[0].payload, true, 100);
        proxy.process(NodeRole::Proxy, 150);

        auth.teleport([500.0, 500.0]);
        let mut ctx = SendContext::default();
        auth.on_pre_send(&mut ctx, ConnId(1), NodeRole::Proxy, &mut last, 200);
        let mut sends = ctx.drain();
        proxy.on_data_received(ConnId(1), NodeRole::Authority, &mut sends[0].payload, true, 200);
        assert_eq!(proxy.position(NodeRole::Proxy), [500.0, 500.0]);
    }
}
