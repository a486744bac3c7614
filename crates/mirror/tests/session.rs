//! End-to-end sessions between two controls over the in-process transport.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use mirror::{
    Address, BitStream, BindOptions, BlockMode, ClassFlags, ClassId, CloseReason, ConnId,
    ConnectResult, Control, ControlHandler, Endpoint, GROUP_ALL, Node, NodeEventKind, NodeHandle,
    NodeRole, NodeRequest, RepFlags, RepRules, ReplicationInterceptor, ReplicatorSetup, SendMode,
    StringReplicator, ValueReplicator, ZoidResult,
};

static NEXT_PORT: AtomicU16 = AtomicU16::new(9500);

fn port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

/// Handler that records everything the control reports.
#[derive(Default)]
struct Recorder {
    accept: bool,
    accept_reply: String,
    deny_zoid: bool,
    request_seen: Option<String>,
    /// Ok(reply) on accept, Err(Some(reason)) on deny, Err(None) on timeout.
    connect_result: Option<Result<String, Option<String>>>,
    spawned: Vec<ConnId>,
    /// Reason string for cooperative closes, None otherwise.
    closed: Vec<(ConnId, Option<String>)>,
    /// Ok(level) or Err((level, reason)).
    zoid: Vec<Result<u32, (u32, String)>>,
    data: Vec<String>,
    raw_frames: Vec<Vec<u8>>,
    discover_reply: Option<String>,
    discovered: Vec<String>,
    dynamic_class: Option<ClassId>,
    dynamic_created: Vec<NodeHandle>,
}

impl ControlHandler for Recorder {
    fn on_connect_result(&mut self, _control: &mut Control, _conn: ConnId, result: ConnectResult) {
        self.connect_result = Some(match result {
            ConnectResult::Accepted(mut reply) => Ok(reply.get_string()),
            ConnectResult::Denied(mut reply) => Err(Some(reply.get_string())),
            ConnectResult::Timeout => Err(None),
        });
    }

    fn on_connection_request(
        &mut self,
        _control: &mut Control,
        _from: Endpoint,
        request: &mut BitStream,
        reply: &mut BitStream,
    ) -> bool {
        self.request_seen = Some(request.get_string());
        reply.add_string(&self.accept_reply);
        self.accept
    }

    fn on_connection_spawned(&mut self, _control: &mut Control, conn: ConnId) {
        self.spawned.push(conn);
    }

    fn on_connection_closed(&mut self, _control: &mut Control, conn: ConnId, reason: CloseReason) {
        let reason = match reason {
            CloseReason::Disconnected(mut stream) => Some(stream.get_string()),
            _ => None,
        };
        self.closed.push((conn, reason));
    }

    fn on_zoid_request(
        &mut self,
        _control: &mut Control,
        _conn: ConnId,
        _level: u32,
        deny_reason: &mut BitStream,
    ) -> bool {
        if self.deny_zoid {
            deny_reason.add_string("not now");
            return false;
        }
        true
    }

    fn on_zoid_result(&mut self, _control: &mut Control, _conn: ConnId, result: ZoidResult) {
        self.zoid.push(match result {
            ZoidResult::Success { level } => Ok(level),
            ZoidResult::Failure { level, mut reason } => Err((level, reason.get_string())),
        });
    }

    fn on_data_received(&mut self, _control: &mut Control, _conn: ConnId, mut data: BitStream) {
        self.data.push(data.get_string());
    }

    fn on_data_raw(&mut self, _control: &mut Control, _from: Endpoint, data: &[u8]) {
        self.raw_frames.push(data.to_vec());
    }

    fn on_discover_request(
        &mut self,
        _control: &mut Control,
        _from: Endpoint,
        _request: &mut BitStream,
        reply: &mut BitStream,
    ) -> bool {
        match &self.discover_reply {
            Some(text) => {
                reply.add_string(text);
                true
            }
            None => false,
        }
    }

    fn on_discovered(&mut self, _control: &mut Control, _from: Endpoint, mut reply: BitStream) {
        self.discovered.push(reply.get_string());
    }

    fn on_node_request_dynamic(
        &mut self,
        _control: &mut Control,
        _conn: ConnId,
        class: ClassId,
        _announce: Option<&mut BitStream>,
        role: NodeRole,
        request: &mut NodeRequest,
    ) {
        if self.dynamic_class == Some(class) {
            self.dynamic_created.push(request.handle());
            request.register(player_node(class, role));
        }
    }
}

/// Two ints and a rarely-changed string, authority to everyone.
fn player_node(class: ClassId, role: NodeRole) -> Node {
    let mut node = Node::new(class, role);
    node.begin_replication_setup(2).unwrap();
    node.add_replication_int(
        ReplicatorSetup::new(RepFlags::empty(), RepRules::AUTH_TO_ALL),
        16,
        false,
    )
    .unwrap();
    node.add_replication_string(
        ReplicatorSetup::new(RepFlags::RARELY_CHANGED, RepRules::AUTH_TO_ALL),
        64,
    )
    .unwrap();
    node.end_replication_setup().unwrap();
    node.set_event_notification(true, true);
    node
}

fn pump_once(a: &mut Control, ra: &mut Recorder, b: &mut Control, rb: &mut Recorder) {
    a.process_input(ra, BlockMode::Poll);
    b.process_input(rb, BlockMode::Poll);
    a.process_output();
    b.process_output();
    std::thread::sleep(Duration::from_millis(2));
}

fn pump_until(
    a: &mut Control,
    ra: &mut Recorder,
    b: &mut Control,
    rb: &mut Recorder,
    timeout: Duration,
    mut done: impl FnMut(&mut Control, &mut Recorder, &mut Control, &mut Recorder) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        pump_once(a, ra, b, rb);
        if done(a, ra, b, rb) {
            return true;
        }
    }
    false
}

/// Connect `client` to `server` and return (client conn, server conn).
fn establish(
    client: &mut Control,
    rc: &mut Recorder,
    server: &mut Control,
    rs: &mut Recorder,
    server_port: u16,
) -> (ConnId, ConnId) {
    rs.accept = true;
    let mut request = BitStream::new();
    request.add_string("hello");
    let conn = client.connect(Address::local(server_port), request).unwrap();
    assert!(
        pump_until(client, rc, server, rs, Duration::from_secs(3), |_, rc, _, rs| {
            rc.connect_result.is_some() && !rs.spawned.is_empty()
        }),
        "handshake did not complete"
    );
    assert!(rc.connect_result.as_ref().unwrap().is_ok());
    (conn, rs.spawned[0])
}

/// Drive both ends into zoid level `level`.
fn enter_level(
    client: &mut Control,
    rc: &mut Recorder,
    server: &mut Control,
    rs: &mut Recorder,
    client_conn: ConnId,
    level: u32,
) {
    client.request_zoid_mode(client_conn, level).unwrap();
    assert!(
        pump_until(client, rc, server, rs, Duration::from_secs(3), |_, rc, _, rs| {
            rc.zoid.contains(&Ok(level)) && rs.zoid.contains(&Ok(level))
        }),
        "zoid transition to {level} did not complete"
    );
}

#[test]
fn connect_carries_request_and_reply() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder {
        accept: true,
        accept_reply: "welcome".into(),
        ..Default::default()
    };
    let mut rc = Recorder::default();

    let mut request = BitStream::new();
    request.add_string("hello");
    let conn = client.connect(Address::local(pa), request).unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, rs| rc.connect_result.is_some() && !rs.spawned.is_empty(),
    ));

    assert_eq!(rs.request_seen.as_deref(), Some("hello"));
    assert_eq!(rc.connect_result, Some(Ok("welcome".into())));
    assert_eq!(client.connections(), vec![conn]);
    assert_eq!(server.connections(), vec![rs.spawned[0]]);
    assert_eq!(client.zoid_level(conn).unwrap(), 0);
}

#[test]
fn connect_denied_with_reason() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder {
        accept: false,
        accept_reply: "full".into(),
        ..Default::default()
    };
    let mut rc = Recorder::default();

    client
        .connect(Address::local(pa), BitStream::new())
        .unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, _| rc.connect_result.is_some(),
    ));
    assert_eq!(rc.connect_result, Some(Err(Some("full".into()))));
    assert!(client.connections().is_empty());
    assert!(server.connections().is_empty());
}

#[test]
fn connect_times_out_against_silent_peer() {
    let (pa, pb) = (port(), port());
    // Bound but never pumped: requests land in its queue and rot there.
    let _silent = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rc = Recorder::default();
    let mut unused = Control::bind(BindOptions::local(port())).unwrap();
    let mut ru = Recorder::default();

    client
        .connect(Address::local(pa), BitStream::new())
        .unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut unused,
        &mut ru,
        Duration::from_secs(7),
        |_, rc, _, _| rc.connect_result.is_some(),
    ));
    assert_eq!(rc.connect_result, Some(Err(None)));
}

#[test]
fn disconnect_reaches_both_handlers() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();
    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);

    let mut reason = BitStream::new();
    reason.add_string("bye");
    client.disconnect(client_conn, reason).unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, rs| !rc.closed.is_empty() && !rs.closed.is_empty(),
    ));
    assert_eq!(rc.closed[0], (client_conn, Some("bye".into())));
    assert_eq!(rs.closed[0], (server_conn, Some("bye".into())));
    assert!(server.connections().is_empty());
}

#[test]
fn replication_syncs_fields_and_roles() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("player", ClassFlags::empty());
    let cc = client.register_class("player", ClassFlags::empty());
    let auth = server
        .register_node_unique(player_node(sc, NodeRole::Authority))
        .unwrap();
    let replica = client
        .register_node_unique(player_node(cc, NodeRole::Proxy))
        .unwrap();

    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    enter_level(&mut client, &mut rc, &mut server, &mut rs, client_conn, 1);

    server
        .node(auth)
        .unwrap()
        .replicator_as::<ValueReplicator>(0)
        .unwrap()
        .set_int(0, 4242);
    server
        .node(auth)
        .unwrap()
        .replicator_as::<StringReplicator>(1)
        .unwrap()
        .set("ada");

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, _, _, _| {
            let node = client.node(replica).unwrap();
            node.replicator_as::<ValueReplicator>(0).unwrap().int(0) == 4242
                && node.replicator_as::<StringReplicator>(1).unwrap().get() == "ada"
        },
    ));

    // Promote the peer to owner; the replica learns its new role.
    server.set_owner(auth, server_conn, true).unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, _, _, _| client.node_ref(replica).unwrap().role() == NodeRole::Owner,
    ));
}

#[test]
fn user_events_reach_the_replica() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("chat", ClassFlags::empty());
    let cc = client.register_class("chat", ClassFlags::empty());
    let auth = server
        .register_node_unique(player_node(sc, NodeRole::Authority))
        .unwrap();
    let replica = client
        .register_node_unique(player_node(cc, NodeRole::Proxy))
        .unwrap();

    let (client_conn, _) = establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    enter_level(&mut client, &mut rc, &mut server, &mut rs, client_conn, 1);

    // Wait for the link, then push one event authority -> proxies.
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, _, _, _| client.node_ref(replica).unwrap().check_event_waiting(),
    ));
    let mut payload = BitStream::new();
    payload.add_string("boom");
    server
        .node(auth)
        .unwrap()
        .send_event(SendMode::ReliableOrdered, RepRules::AUTH_TO_ALL, payload)
        .unwrap();

    let mut text = None;
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, _, _, _| {
            while let Some(ev) = client.node(replica).unwrap().next_event() {
                if let NodeEventKind::User(mut stream) = ev.kind {
                    text = Some(stream.get_string());
                }
            }
            text.is_some()
        },
    ));
    assert_eq!(text.as_deref(), Some("boom"));
}

#[test]
fn raw_streams_and_group_sends() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();
    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);

    let mut stream = BitStream::new();
    stream.add_string("direct");
    client
        .send_data(client_conn, stream, SendMode::ReliableOrdered)
        .unwrap();
    let mut stream = BitStream::new();
    stream.add_string("fanout");
    server
        .send_data_to_group(GROUP_ALL, stream, SendMode::ReliableOrdered)
        .unwrap();

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, rs| !rc.data.is_empty() && !rs.data.is_empty(),
    ));
    assert_eq!(rs.data, vec!["direct".to_string()]);
    assert_eq!(rc.data, vec!["fanout".to_string()]);

    // A custom group stops delivering once the member is removed.
    let lobby = server.group_manager().create_group();
    server.group_manager().add(lobby, server_conn);
    let mut stream = BitStream::new();
    stream.add_string("lobby");
    server
        .send_data_to_group(lobby, stream, SendMode::ReliableOrdered)
        .unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, _| rc.data.len() == 2,
    ));
    assert_eq!(rc.data[1], "lobby");

    server.group_manager().remove(lobby, server_conn);
    let mut stream = BitStream::new();
    stream.add_string("gone");
    server
        .send_data_to_group(lobby, stream, SendMode::ReliableOrdered)
        .unwrap();
    for _ in 0..50 {
        pump_once(&mut client, &mut rc, &mut server, &mut rs);
    }
    assert_eq!(rc.data.len(), 2);
}

#[test]
fn zero_relevance_withholds_a_node() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("secret", ClassFlags::empty());
    let cc = client.register_class("secret", ClassFlags::empty());
    let mut hidden = player_node(sc, NodeRole::Authority);
    hidden.set_default_relevance(0.0);
    let hidden = server.register_node_unique(hidden).unwrap();
    let replica = client
        .register_node_unique(player_node(cc, NodeRole::Proxy))
        .unwrap();

    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    enter_level(&mut client, &mut rc, &mut server, &mut rs, client_conn, 1);

    for _ in 0..50 {
        pump_once(&mut client, &mut rc, &mut server, &mut rs);
    }
    assert!(!client.node_ref(replica).unwrap().check_event_waiting());

    // Raising the relevance for this connection announces it.
    server.set_relevance(hidden, server_conn, 1.0).unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, _, _, _| client.node_ref(replica).unwrap().check_event_waiting(),
    ));
}

#[test]
fn unparsable_frames_surface_as_raw_data() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    client
        .send_data_raw(&Address::local(pa), b"not a packet")
        .unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(2),
        |_, _, _, rs| !rs.raw_frames.is_empty(),
    ));
    assert_eq!(rs.raw_frames[0], b"not a packet");
}

#[test]
fn discovery_round_trip() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder {
        discover_reply: Some("here".into()),
        ..Default::default()
    };
    let mut rc = Recorder::default();

    server.set_discover_listener(true);
    let mut request = BitStream::new();
    request.add_string("anyone?");
    client.discover(0, request).unwrap();

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(2),
        |_, rc, _, _| !rc.discovered.is_empty(),
    ));
    assert_eq!(rc.discovered[0], "here");
}

#[test]
fn must_sync_barrier_respects_order() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("stage", ClassFlags::empty());
    let cc = client.register_class("stage", ClassFlags::empty());
    let mut first_a = player_node(sc, NodeRole::Authority);
    first_a.set_must_sync(true, 1);
    let mut first_b = player_node(sc, NodeRole::Authority);
    first_b.set_must_sync(true, 1);
    let mut second = player_node(sc, NodeRole::Authority);
    second.set_must_sync(true, 2);
    let a = server.register_node_tagged(first_a, 1).unwrap();
    let b = server.register_node_tagged(first_b, 2).unwrap();
    let c = server.register_node_tagged(second, 3).unwrap();
    for tag in 1..=3 {
        client
            .register_node_tagged(player_node(cc, NodeRole::Proxy), tag)
            .unwrap();
    }

    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    client.request_zoid_mode(client_conn, 1).unwrap();

    // Both order-1 nodes get their sync request; the order-2 node waits.
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, _, server, _| {
            server.node_ref(a).unwrap().check_event_waiting()
                && server.node_ref(b).unwrap().check_event_waiting()
        },
    ));
    assert!(!server.node_ref(c).unwrap().check_event_waiting());

    server.node(a).unwrap().next_event();
    server.node(b).unwrap().next_event();
    server
        .set_sync_result(server_conn, a, true, BitStream::new())
        .unwrap();
    assert!(!server.node_ref(c).unwrap().check_event_waiting());
    server
        .set_sync_result(server_conn, b, true, BitStream::new())
        .unwrap();
    assert!(server.node_ref(c).unwrap().check_event_waiting());

    server.node(c).unwrap().next_event();
    server
        .set_sync_result(server_conn, c, true, BitStream::new())
        .unwrap();
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, rs| rc.zoid.contains(&Ok(1)) && rs.zoid.contains(&Ok(1)),
    ));
    assert_eq!(server.zoid_level(server_conn).unwrap(), 1);
    assert_eq!(client.zoid_level(client_conn).unwrap(), 1);
}

#[test]
fn failed_sync_fails_the_transition_on_both_ends() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("stage", ClassFlags::empty());
    let cc = client.register_class("stage", ClassFlags::empty());
    let mut gate = player_node(sc, NodeRole::Authority);
    gate.set_must_sync(true, 1);
    let gate = server.register_node_unique(gate).unwrap();
    client
        .register_node_unique(player_node(cc, NodeRole::Proxy))
        .unwrap();

    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    client.request_zoid_mode(client_conn, 1).unwrap();

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, _, server, _| server.node_ref(gate).unwrap().check_event_waiting(),
    ));
    server.node(gate).unwrap().next_event();
    let mut reason = BitStream::new();
    reason.add_string("missing assets");
    server
        .set_sync_result(server_conn, gate, false, reason)
        .unwrap();

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |_, rc, _, rs| !rc.zoid.is_empty() && !rs.zoid.is_empty(),
    ));
    assert_eq!(rs.zoid[0], Err((1, "missing assets".into())));
    assert_eq!(rc.zoid[0], Err((1, "missing assets".into())));
    assert_eq!(server.zoid_level(server_conn).unwrap(), 0);
    assert_eq!(client.zoid_level(client_conn).unwrap(), 0);
}

#[test]
fn reliable_ordered_survives_loss() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();
    let (client_conn, _) = establish(&mut client, &mut rc, &mut server, &mut rs, pa);

    client.simulate_loss(client_conn, 0.35);
    for i in 0..15 {
        let mut stream = BitStream::new();
        stream.add_string(&format!("msg-{i}"));
        client
            .send_data(client_conn, stream, SendMode::ReliableOrdered)
            .unwrap();
    }

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(10),
        |_, _, _, rs| rs.data.len() == 15,
    ));
    let expected: Vec<String> = (0..15).map(|i| format!("msg-{i}")).collect();
    assert_eq!(rs.data, expected);
}

#[test]
fn file_transfer_end_to_end() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("vault", ClassFlags::empty());
    let cc = client.register_class("vault", ClassFlags::empty());
    let auth = server
        .register_node_unique(player_node(sc, NodeRole::Authority))
        .unwrap();
    let replica = client
        .register_node_unique(player_node(cc, NodeRole::Proxy))
        .unwrap();

    let (client_conn, server_conn) =
        establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    enter_level(&mut client, &mut rc, &mut server, &mut rs, client_conn, 1);
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, _, _, _| client.node_ref(replica).unwrap().check_event_waiting(),
    ));

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let src = std::env::temp_dir().join(format!("mirror-ft-src-{pa}.bin"));
    let dst = std::env::temp_dir().join(format!("mirror-ft-dst-{pb}.bin"));
    std::fs::write(&src, &payload).unwrap();
    let _ = std::fs::remove_file(&dst);

    server
        .node(auth)
        .unwrap()
        .send_file(server_conn, &src, Some("level.bin"), BitStream::new(), 0.5)
        .unwrap();

    // Accept the offer when it shows up, then wait for completion.
    let mut accepted = false;
    let mut complete = false;
    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(10),
        |client, _, _, _| {
            let dst = dst.clone();
            let node = client.node(replica).unwrap();
            while let Some(ev) = node.next_event() {
                match ev.kind {
                    NodeEventKind::FileIncoming { id, .. } => {
                        node.accept_file(ev.source.unwrap(), id, Some(dst.clone()), true)
                            .unwrap();
                        accepted = true;
                    }
                    NodeEventKind::FileComplete { .. } => complete = true,
                    _ => {}
                }
            }
            accepted && complete
        },
    ));
    assert_eq!(std::fs::read(&dst).unwrap(), payload);
    let _ = std::fs::remove_file(&src);
    let _ = std::fs::remove_file(&dst);
}

#[test]
fn dynamic_nodes_are_created_on_demand() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("spawnling", ClassFlags::empty());
    let cc = client.register_class("spawnling", ClassFlags::empty());
    rc.dynamic_class = Some(cc);
    let auth = server
        .register_node_dynamic(player_node(sc, NodeRole::Authority))
        .unwrap();
    server
        .node(auth)
        .unwrap()
        .replicator_as::<ValueReplicator>(0)
        .unwrap()
        .set_int(0, 99);

    let (client_conn, _) = establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    enter_level(&mut client, &mut rc, &mut server, &mut rs, client_conn, 1);

    assert!(pump_until(
        &mut client,
        &mut rc,
        &mut server,
        &mut rs,
        Duration::from_secs(3),
        |client, rc, _, _| {
            rc.dynamic_created.first().is_some_and(|&h| {
                client
                    .node(h)
                    .and_then(|n| n.replicator_as::<ValueReplicator>(0).map(|r| r.int(0)))
                    == Some(99)
            })
        },
    ));
}

struct VetoAll;

impl ReplicationInterceptor for VetoAll {
    fn out_pre_replicate_node(&mut self, _conn: ConnId, _remote_role: NodeRole) -> bool {
        false
    }
}

#[test]
fn interceptor_veto_blocks_announcement() {
    let (pa, pb) = (port(), port());
    let mut server = Control::bind(BindOptions::local(pa)).unwrap();
    let mut client = Control::bind(BindOptions::local(pb)).unwrap();
    let mut rs = Recorder::default();
    let mut rc = Recorder::default();

    let sc = server.register_class("hidden", ClassFlags::empty());
    let cc = client.register_class("hidden", ClassFlags::empty());
    let auth = server
        .register_node_unique(player_node(sc, NodeRole::Authority))
        .unwrap();
    server
        .node(auth)
        .unwrap()
        .set_replication_interceptor(Some(Box::new(VetoAll)));
    let replica = client
        .register_node_unique(player_node(cc, NodeRole::Proxy))
        .unwrap();

    let (client_conn, _) = establish(&mut client, &mut rc, &mut server, &mut rs, pa);
    enter_level(&mut client, &mut rc, &mut server, &mut rs, client_conn, 1);

    // Give the announcement every chance; it must never arrive.
    for _ in 0..100 {
        pump_once(&mut client, &mut rc, &mut server, &mut rs);
    }
    assert!(!client.node_ref(replica).unwrap().check_event_waiting());
}
