//! Scenario tests driving [`HubCore`] through channel-backed peers.

use std::net::SocketAddr;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::process::fake::FakeHost;
use crate::protocol::message::{AvailableModule, Parameter, Port, PortKind, PortLink, Spawn, SpawnReference};
use crate::state::MemoryState;
use crate::supervisor::bus::HubBus;
use crate::supervisor::control::{ControlHandle, SupervisorControl};

struct Peer {
    conn: ConnId,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Peer {
    fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Outbound::Message(m) = item {
                out.push(m);
            }
        }
        out
    }

    /// Drain, reporting whether the writer was asked to close.
    fn closed(&mut self) -> (Vec<Message>, bool) {
        let mut out = Vec::new();
        let mut closed = false;
        while let Ok(item) = self.rx.try_recv() {
            match item {
                Outbound::Message(m) => out.push(m),
                Outbound::Close => closed = true,
            }
        }
        (out, closed)
    }
}

struct Harness {
    core: HubCore,
    host: FakeHost,
    key: SessionKey,
    next: u64,
    _dir: TempDir,
}

fn harness(role: Role) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = Config::test_default(dir.path());
    let key = SessionKey::generate();
    let session = Session {
        role,
        key: key.clone(),
        master: (role == Role::Slave).then(|| ("head.local".to_string(), 31093)),
    };
    let host = FakeHost::new();
    let core = HubCore::new(
        config,
        &session,
        Box::new(MemoryState::new()),
        Box::new(host.clone()),
        "node1",
    );
    Harness {
        core,
        host,
        key,
        next: 0,
        _dir: dir,
    }
}

fn msg(body: Body, sender: PeerId, dest: PeerId) -> Message {
    Message::new(body).from_peer(sender).to_peer(dest)
}

fn of_kind(msgs: &[Message], kind: MessageKind) -> Vec<Message> {
    msgs.iter().filter(|m| m.kind() == kind).cloned().collect()
}

/// Spawn requests (not notifications) in `msgs`.
fn spawn_requests(msgs: &[Message]) -> Vec<Spawn> {
    msgs.iter()
        .filter(|m| !m.notification)
        .filter_map(|m| match &m.body {
            Body::Spawn(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

fn spawn_notes(msgs: &[Message]) -> Vec<Spawn> {
    msgs.iter()
        .filter(|m| m.notification)
        .filter_map(|m| match &m.body {
            Body::Spawn(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

impl Harness {
    fn open(&mut self) -> Peer {
        self.next += 1;
        let conn = ConnId(self.next);
        let (tx, rx) = mpsc::unbounded_channel();
        let peer: SocketAddr = "10.0.0.7:40000".parse().unwrap();
        self.core
            .handle_event(HubEvent::Accepted { conn, peer, tx })
            .unwrap();
        Peer { conn, rx }
    }

    /// Connect and pass the handshake as `identity`.
    fn identify(&mut self, identity: Identity, name: &str) -> Peer {
        let mut peer = self.open();
        let challenge = peer
            .drain()
            .into_iter()
            .find_map(|m| match m.body {
                Body::Identify { nonce, .. } => Some(nonce),
                _ => None,
            })
            .expect("identify challenge");
        let reply = Body::Identify {
            identity,
            name: name.into(),
            nonce: String::new(),
            mac: self.key.mac(&challenge, identity),
        };
        self.send(&peer, Message::new(reply));
        peer
    }

    fn send(&mut self, peer: &Peer, message: Message) {
        self.try_send(peer, message).unwrap();
    }

    fn try_send(&mut self, peer: &Peer, message: Message) -> Result<(), HubError> {
        self.core.handle_event(HubEvent::Inbound {
            conn: peer.conn,
            message,
        })
    }

    /// Open the link to the master and pass the mutual challenge.
    fn dial_master(&mut self) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        self.core
            .register_outbound(ConnId(100), Identity::Hub, DialPurpose::Master, tx);
        let mut master = Peer {
            conn: ConnId(100),
            rx,
        };
        let challenge = Body::Identify {
            identity: Identity::Request,
            name: "head".into(),
            nonce: session::nonce(),
            mac: String::new(),
        };
        self.send(&master, msg(challenge, id::MASTER_HUB, id::INVALID));
        let ours = master
            .drain()
            .into_iter()
            .find_map(|m| match m.body {
                Body::Identify { nonce, .. } => Some(nonce),
                _ => None,
            })
            .expect("slave challenge");
        let proof = Body::Identify {
            identity: Identity::Hub,
            name: "head".into(),
            nonce: String::new(),
            mac: self.key.mac(&ours, Identity::Hub),
        };
        self.send(&master, msg(proof, id::MASTER_HUB, id::INVALID));
        master
    }

    /// Join a slave hub and complete its AddHub.
    fn join_slave(&mut self, name: &str, has_ui: bool) -> (Peer, PeerId) {
        let mut peer = self.identify(Identity::SlaveHub, name);
        let id = peer
            .drain()
            .into_iter()
            .find_map(|m| match m.body {
                Body::SetId { id } => Some(id),
                _ => None,
            })
            .expect("slave id");
        let info = HubInfo {
            id,
            name: name.into(),
            host: format!("{name}.local"),
            port: 31093,
            has_ui,
        };
        self.send(&peer, msg(Body::AddHub(info), id, id::BROADCAST).notify());
        peer.drain();
        (peer, id)
    }

    fn ui_spawn(&mut self, ui: &Peer, spawn: Spawn) {
        self.send(ui, msg(Body::Spawn(spawn), id::INVALID, id::MASTER_HUB));
    }

    fn from_manager(&mut self, manager: &Peer, body: Body, sender: PeerId) {
        self.send(manager, msg(body, sender, id::INVALID));
    }
}

fn ready_master() -> (Harness, Peer) {
    let mut h = harness(Role::Master);
    let mut manager = h.identify(Identity::Manager, "manager");
    assert!(h.core.is_ready());
    manager.drain();
    (h, manager)
}

fn spawn_with_id(name: &str, module: PeerId) -> Spawn {
    let mut s = Spawn::new(id::MASTER_HUB, name);
    s.spawn_id = module;
    s
}

// ── handshake ─────────────────────────────────────────────────────────────────

#[test]
fn manager_on_master_gets_id_snapshot_and_readiness() {
    let mut h = harness(Role::Master);
    let mut manager = h.identify(Identity::Manager, "manager");
    let got = manager.drain();
    assert_eq!(got[0].body, Body::SetId { id: id::MASTER_HUB });
    let hubs = of_kind(&got, MessageKind::AddHub);
    assert_eq!(hubs.len(), 1, "snapshot carries the master itself");
    assert!(h.core.is_ready());
}

#[test]
fn bad_mac_is_refused_and_dropped() {
    let mut h = harness(Role::Master);
    let mut peer = h.open();
    peer.drain();
    let forged = Body::Identify {
        identity: Identity::Manager,
        name: "mgr".into(),
        nonce: String::new(),
        mac: "00".repeat(32),
    };
    h.send(&peer, Message::new(forged));
    let (got, closed) = peer.closed();
    assert!(closed);
    assert_eq!(
        got[0].body,
        Body::CloseConnection {
            reason: "message authentication failed".into()
        }
    );
    assert_eq!(h.core.status().connections, 0);
    assert!(!h.core.is_ready());
}

#[test]
fn master_refuses_another_master() {
    let (mut h, _manager) = ready_master();
    let mut other = h.identify(Identity::Hub, "rogue");
    let (got, closed) = other.closed();
    assert!(closed);
    assert!(got.iter().any(|m| m.body
        == Body::CloseConnection {
            reason: "refusing connection from other master hub".into()
        }));
}

#[test]
fn slave_refuses_slave_and_answers_master_challenge() {
    let mut h = harness(Role::Slave);
    let (tx, rx) = mpsc::unbounded_channel();
    h.core
        .handle_event(HubEvent::Connected {
            conn: ConnId(100),
            identity: Identity::Hub,
            purpose: DialPurpose::Master,
            tx,
        })
        .unwrap();
    let mut master = Peer {
        conn: ConnId(100),
        rx,
    };

    let challenge = Body::Identify {
        identity: Identity::Request,
        name: "head".into(),
        nonce: "feedface".into(),
        mac: String::new(),
    };
    h.send(&master, msg(challenge, id::MASTER_HUB, id::INVALID));
    let reply = master.drain();
    let Body::Identify {
        identity,
        mac,
        nonce,
        ..
    } = &reply[0].body
    else {
        panic!("expected identify reply");
    };
    assert_eq!(*identity, Identity::SlaveHub);
    assert_eq!(*mac, h.key.mac("feedface", Identity::SlaveHub));
    assert!(!nonce.is_empty(), "slave challenges the master back");

    let mut other = h.identify(Identity::SlaveHub, "peer");
    let (got, closed) = other.closed();
    assert!(closed);
    assert!(got.iter().any(|m| m.body
        == Body::CloseConnection {
            reason: "refusing connection from other slave hub".into()
        }));
}

#[test]
fn hubs_do_not_answer_challenges_from_accepted_peers() {
    for role in [Role::Slave, Role::Master] {
        let mut h = harness(role);
        let mut stranger = h.open();
        stranger.drain();
        let challenge = Body::Identify {
            identity: Identity::Request,
            name: "stranger".into(),
            nonce: "c0ffee".into(),
            mac: String::new(),
        };
        h.send(&stranger, Message::new(challenge));
        let (got, closed) = stranger.closed();
        assert!(closed);
        assert!(got.iter().all(|m| !matches!(
            &m.body,
            Body::Identify { mac, .. } if !mac.is_empty()
        )));
    }
}

#[test]
fn relayed_master_challenge_cannot_join_a_master() {
    // A master challenge replayed to a slave yields nothing that the
    // master would accept.
    let (mut master_hub, _manager) = ready_master();
    let mut intruder = master_hub.open();
    let challenge = intruder
        .drain()
        .into_iter()
        .find_map(|m| match m.body {
            Body::Identify { nonce, .. } => Some(nonce),
            _ => None,
        })
        .unwrap();

    let mut slave_hub = harness(Role::Slave);
    slave_hub.key = master_hub.key.clone();
    slave_hub.core.key = master_hub.key.clone();
    let mut relay = slave_hub.open();
    relay.drain();
    let forward = Body::Identify {
        identity: Identity::Request,
        name: "intruder".into(),
        nonce: challenge,
        mac: String::new(),
    };
    slave_hub.send(&relay, Message::new(forward));
    let mac = relay.drain().into_iter().find_map(|m| match m.body {
        Body::Identify { mac, .. } if !mac.is_empty() => Some(mac),
        _ => None,
    });
    assert_eq!(mac, None);

    let claim = Body::Identify {
        identity: Identity::SlaveHub,
        name: "intruder".into(),
        nonce: String::new(),
        mac: String::new(),
    };
    master_hub.send(&intruder, Message::new(claim));
    assert!(intruder.closed().1);
    assert!(master_hub.core.slaves().is_empty());
}

#[test]
fn master_must_prove_the_key_before_it_is_obeyed() {
    let mut h = harness(Role::Slave);
    let (tx, rx) = mpsc::unbounded_channel();
    h.core
        .register_outbound(ConnId(100), Identity::Hub, DialPurpose::Master, tx);
    let mut master = Peer {
        conn: ConnId(100),
        rx,
    };
    let challenge = Body::Identify {
        identity: Identity::Request,
        name: "head".into(),
        nonce: "feedface".into(),
        mac: String::new(),
    };
    h.send(&master, msg(challenge, id::MASTER_HUB, id::INVALID));
    master.drain();

    h.send(&master, msg(Body::SetId { id: -9 }, id::MASTER_HUB, -9));
    assert_eq!(h.core.hub_id(), id::INVALID, "unproven master is ignored");

    let forged = Body::Identify {
        identity: Identity::Hub,
        name: "head".into(),
        nonce: String::new(),
        mac: SessionKey::generate().mac("feedface", Identity::Hub),
    };
    h.send(&master, msg(forged, id::MASTER_HUB, id::INVALID));
    assert!(master.closed().1);
    assert!(h.core.is_emergency());
}

#[test]
fn master_proves_the_key_to_joining_slaves() {
    let (mut h, _manager) = ready_master();
    let mut slave = h.open();
    let challenge = slave
        .drain()
        .into_iter()
        .find_map(|m| match m.body {
            Body::Identify { nonce, .. } => Some(nonce),
            _ => None,
        })
        .unwrap();
    let reply = Body::Identify {
        identity: Identity::SlaveHub,
        name: "n1".into(),
        nonce: "abad1dea".into(),
        mac: h.key.mac(&challenge, Identity::SlaveHub),
    };
    h.send(&slave, Message::new(reply));
    let got = slave.drain();
    let Body::Identify { identity, mac, .. } = &got[0].body else {
        panic!("expected the master's proof first");
    };
    assert_eq!(*identity, Identity::Hub);
    assert!(h.key.verify("abad1dea", Identity::Hub, mac));
    assert_eq!(got[1].body, Body::SetId { id: -9 });
}

#[test]
fn slave_becomes_ready_after_set_id_and_manager() {
    let mut h = harness(Role::Slave);
    let mut master = h.dial_master();

    let mut manager = h.identify(Identity::Manager, "manager");
    assert!(manager.drain().is_empty(), "no id yet, nothing to tell");
    assert!(!h.core.is_ready());

    h.send(&master, msg(Body::SetId { id: -9 }, id::MASTER_HUB, -9));
    assert_eq!(h.core.hub_id(), -9);
    assert!(h.core.is_ready());
    assert_eq!(manager.drain()[0].body, Body::SetId { id: -9 });
    let up = master.drain();
    let adds = of_kind(&up, MessageKind::AddHub);
    assert_eq!(adds.len(), 1);
    let Body::AddHub(info) = &adds[0].body else {
        unreachable!()
    };
    assert_eq!(info.id, -9);
    assert_eq!(info.host, "node1");
}

#[test]
fn slave_ids_wait_until_master_is_ready() {
    let mut h = harness(Role::Master);
    let mut slave = h.identify(Identity::SlaveHub, "n1");
    assert!(of_kind(&slave.drain(), MessageKind::SetId).is_empty());
    let _manager = h.identify(Identity::Manager, "manager");
    let got = slave.drain();
    assert_eq!(got[0].body, Body::SetId { id: -9 });
}

#[test]
fn messages_before_identification_are_dropped() {
    let (mut h, mut manager) = ready_master();
    let stranger = h.open();
    h.send(
        &stranger,
        msg(Body::Spawn(Spawn::new(id::MASTER_HUB, "Gendat")), id::INVALID, id::MASTER_HUB),
    );
    assert!(manager.drain().is_empty());
    assert!(h.core.state().running_modules().is_empty());
}

#[test]
fn ui_input_is_held_until_hub_is_ready() {
    let mut h = harness(Role::Master);
    let mut ui = h.identify(Identity::Ui, "ui");
    ui.drain();
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "Gendat"));
    assert!(h.core.state().running_modules().is_empty());

    let mut manager = h.identify(Identity::Manager, "manager");
    let requests = spawn_requests(&manager.drain());
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].spawn_id, 1);
}

// ── routing ───────────────────────────────────────────────────────────────────

#[test]
fn broadcast_reaches_every_other_participant_once() {
    let (mut h, mut manager) = ready_master();
    let mut ui = h.identify(Identity::Ui, "ui");
    let (mut s1, id1) = h.join_slave("n1", false);
    let (mut s2, _) = h.join_slave("n2", false);
    for p in [&mut ui, &mut s1, &mut s2, &mut manager] {
        p.drain();
    }

    let status = msg(Body::UpdateStatus { text: "busy".into() }, id1, id::BROADCAST);
    let uuid = status.uuid;
    h.send(&s1, status);

    let count = |p: &mut Peer| p.drain().iter().filter(|m| m.uuid == uuid).count();
    assert_eq!(count(&mut s2), 1);
    assert_eq!(count(&mut ui), 1);
    assert_eq!(count(&mut manager), 1);
    assert_eq!(count(&mut s1), 0);
}

#[test]
fn for_broadcast_returns_to_sender() {
    let (mut h, mut manager) = ready_master();
    let (mut s1, id1) = h.join_slave("n1", false);
    let (mut s2, _) = h.join_slave("n2", false);
    manager.drain();
    s1.drain();

    let status = msg(Body::UpdateStatus { text: "hi".into() }, id1, id::FOR_BROADCAST);
    let uuid = status.uuid;
    h.send(&s1, status);
    let back = s1.drain();
    assert_eq!(back.iter().filter(|m| m.uuid == uuid).count(), 1);
    assert_eq!(back[0].dest_id, id::BROADCAST);
    assert_eq!(s2.drain().iter().filter(|m| m.uuid == uuid).count(), 1);
}

// ── module ids and spawning ───────────────────────────────────────────────────

#[test]
fn module_ids_are_never_reused() {
    let (mut h, mut manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    for _ in 0..3 {
        h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "Gendat"));
    }
    h.from_manager(&manager, Body::ModuleExit, 2);
    let mut migrate = Spawn::new(id::MASTER_HUB, "Gendat");
    migrate.reference = SpawnReference::Migrate { from: 1 };
    h.ui_spawn(&ui, migrate);
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "Gendat"));

    let mut ids: Vec<PeerId> = spawn_notes(&manager.drain()).iter().map(|s| s.spawn_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 5]);
    h.from_manager(&manager, Body::ModuleExit, 1);
    ids.extend(spawn_notes(&manager.drain()).iter().map(|s| s.spawn_id));
    assert_eq!(ids, vec![1, 2, 3, 5, 4], "migration replacement keeps its reserved id");
}

#[test]
fn spawn_on_unknown_hub_is_rejected() {
    let (mut h, mut manager) = ready_master();
    let mut ui = h.identify(Identity::Ui, "ui");
    ui.drain();
    h.ui_spawn(&ui, Spawn::new(-42, "Gendat"));
    let got = ui.drain();
    let failed = spawn_notes(&got);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].spawn_id, id::INVALID);
    assert!(spawn_requests(&manager.drain()).is_empty());
}

#[test]
fn prepared_spawn_launches_module_with_shm_name_and_id() {
    let (mut h, manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    let available = AvailableModule {
        hub_id: id::MASTER_HUB,
        name: "Gendat".into(),
        path: "/opt/mods/gendat".into(),
        description: String::new(),
        submodules: Vec::new(),
        links: Vec::new(),
        exports: Vec::new(),
    };
    h.from_manager(&manager, Body::ModuleAvailable(available), id::MASTER_HUB);
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "Gendat"));

    let prepared = msg(
        Body::SpawnPrepared(spawn_with_id("Gendat", 1)),
        id::MASTER_HUB,
        id::LOCAL_HUB,
    );
    h.send(&manager, prepared);
    let launched = h.host.launched();
    let module = launched.last().unwrap();
    assert_eq!(module.role, ProcessRole::Module(1));
    assert_eq!(module.program, std::path::PathBuf::from("/opt/mods/gendat"));
    assert_eq!(
        module.args,
        vec![h.core.config().shm_name("node1"), "Gendat".to_string(), "1".to_string()]
    );
}

#[test]
fn unrequested_spawn_prepared_is_a_protocol_error() {
    let (mut h, manager) = ready_master();
    let prepared = msg(
        Body::SpawnPrepared(spawn_with_id("Gendat", 7)),
        id::MASTER_HUB,
        id::LOCAL_HUB,
    );
    let err = h.try_send(&manager, prepared).unwrap_err();
    assert!(matches!(err, HubError::Protocol(_)));
    assert!(err.is_fatal());
}

#[test]
fn module_dying_without_notice_is_reported_to_manager() {
    let (mut h, mut manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    let available = AvailableModule {
        hub_id: id::MASTER_HUB,
        name: "Gendat".into(),
        path: "/opt/mods/gendat".into(),
        description: String::new(),
        submodules: Vec::new(),
        links: Vec::new(),
        exports: Vec::new(),
    };
    h.from_manager(&manager, Body::ModuleAvailable(available), id::MASTER_HUB);
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "Gendat"));
    h.send(
        &manager,
        msg(Body::SpawnPrepared(spawn_with_id("Gendat", 1)), id::MASTER_HUB, id::LOCAL_HUB),
    );
    manager.drain();

    h.host.exit(ProcessRole::Module(1));
    h.core.reap_processes();
    let exits = of_kind(&manager.drain(), MessageKind::ModuleExit);
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].sender_id, 1);
}

// ── migration ─────────────────────────────────────────────────────────────────

#[test]
fn migrated_module_gets_parameters_then_links_after_start() {
    let (mut h, mut manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    h.ui_spawn(&ui, spawn_with_id("A", 10));
    h.ui_spawn(&ui, spawn_with_id("B", 11));
    h.from_manager(
        &manager,
        Body::AddPort(Port { module: 11, name: "out".into(), kind: PortKind::Output }),
        11,
    );
    h.from_manager(
        &manager,
        Body::AddPort(Port { module: 10, name: "in".into(), kind: PortKind::Input }),
        10,
    );
    h.from_manager(
        &manager,
        Body::AddParameter(Parameter { module: 10, name: "p1".into(), value: json!("x") }),
        10,
    );
    h.send(&ui, message::connect(PortLink::new(11, "out", 10, "in")));
    assert_eq!(h.core.state().input_links(10).len(), 1);
    manager.drain();

    let mut migrate = Spawn::new(id::MASTER_HUB, "A");
    migrate.reference = SpawnReference::Migrate { from: 10 };
    h.ui_spawn(&ui, migrate);
    let got = manager.drain();
    assert!(got.iter().any(|m| m.body == Body::Kill { module: 10 }));
    assert!(spawn_requests(&got).is_empty(), "replacement waits for the exit");

    h.from_manager(&manager, Body::ModuleExit, 10);
    let got = manager.drain();
    assert_eq!(of_kind(&got, MessageKind::Disconnect).len(), 1);
    let replacement = spawn_requests(&got);
    assert_eq!(replacement.len(), 1);
    let new_id = replacement[0].spawn_id;
    assert_eq!(new_id, 12);

    h.from_manager(
        &manager,
        Body::AddPort(Port { module: new_id, name: "in".into(), kind: PortKind::Input }),
        new_id,
    );
    h.from_manager(
        &manager,
        Body::AddParameter(Parameter { module: new_id, name: "p1".into(), value: json!("default") }),
        new_id,
    );
    manager.drain();
    h.from_manager(&manager, Body::Started { name: "A".into() }, new_id);

    let replay = manager.drain();
    assert_eq!(replay.len(), 2);
    assert_eq!(
        replay[0].body,
        Body::SetParameter(Parameter { module: new_id, name: "p1".into(), value: json!("x") })
    );
    assert_eq!(replay[1].body, Body::Connect(PortLink::new(11, "out", new_id, "in")));
    assert_eq!(h.core.state().input_links(new_id).len(), 1);
    assert_eq!(h.core.state().parameters(new_id)[0].value, json!("x"));
    let mut late_ui = h.identify(Identity::Ui, "late");
    let restored = late_ui.drain().into_iter().any(|m| {
        m.body == Body::SetParameter(Parameter { module: new_id, name: "p1".into(), value: json!("x") })
    });
    assert!(restored, "a new UI sees the migrated value");
}

// ── mirrors ───────────────────────────────────────────────────────────────────

#[test]
fn cover_gets_one_mirror_per_other_ui_hub() {
    let (mut h, _manager) = ready_master();
    let (mut s1, id1) = h.join_slave("n1", false);
    let (mut s2, id2) = h.join_slave("n2", true);

    h.send(
        &s1,
        msg(Body::Spawn(Spawn::new(id1, "COVER")), id1, id::MASTER_HUB),
    );

    let on_s1 = s1.drain();
    let primary = spawn_requests(&on_s1);
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].hub_id, id1);
    assert_eq!(primary[0].mirroring_id, primary[0].spawn_id);

    let on_s2 = spawn_requests(&s2.drain());
    assert_eq!(on_s2.len(), 1);
    assert_eq!(on_s2[0].hub_id, id2);
    assert_eq!(on_s2[0].mirroring_id, primary[0].spawn_id);
    assert_ne!(on_s2[0].spawn_id, primary[0].spawn_id);
    assert_eq!(h.core.state().mirrors(primary[0].spawn_id).len(), 2);
}

#[test]
fn late_ui_hub_receives_existing_mirrors() {
    let (mut h, _manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "COVER"));

    let mut s1 = h.identify(Identity::SlaveHub, "n1");
    s1.drain();
    let info = HubInfo {
        id: -9,
        name: "n1".into(),
        host: "n1.local".into(),
        port: 31093,
        has_ui: true,
    };
    h.send(&s1, msg(Body::AddHub(info), -9, id::BROADCAST).notify());
    let mirrors = spawn_requests(&s1.drain());
    assert_eq!(mirrors.len(), 1);
    assert_eq!(mirrors[0].mirroring_id, 1);
    assert_eq!(mirrors[0].hub_id, -9);
}

#[test]
fn cover_payloads_wait_for_the_aux_link() {
    let (mut h, manager) = ready_master();
    h.core.handle_event(HubEvent::AuxPort(4711)).unwrap();
    let cover = || Body::Cover {
        mirror_id: 1,
        payload: json!({"frame": 3}),
    };
    h.from_manager(&manager, cover(), 1);
    h.from_manager(&manager, cover(), 1);

    let dials = h.core.take_dial_requests();
    assert_eq!(
        dials,
        vec![DialRequest {
            purpose: DialPurpose::AuxRelay { module: 1 },
            host: "127.0.0.1".into(),
            port: 4711,
        }]
    );

    let (tx, rx) = mpsc::unbounded_channel();
    h.core.handle_event(HubEvent::Connected {
        conn: ConnId(50),
        identity: Identity::AuxService,
        purpose: DialPurpose::AuxRelay { module: 1 },
        tx,
    })
    .unwrap();
    let mut link = Peer { conn: ConnId(50), rx };
    assert_eq!(of_kind(&link.drain(), MessageKind::Cover).len(), 2);
}

// ── barriers ──────────────────────────────────────────────────────────────────

#[test]
fn barrier_releases_only_after_every_participant() {
    let (mut h, mut manager) = ready_master();
    let mut ui = h.identify(Identity::Ui, "ui");
    let (mut s1, id1) = h.join_slave("n1", false);
    ui.drain();
    manager.drain();

    let barrier = msg(Body::Barrier, id::INVALID, id::NEXT_HOP);
    let uuid = barrier.uuid;
    h.send(&ui, barrier);
    assert_eq!(of_kind(&manager.drain(), MessageKind::Barrier).len(), 1);
    assert_eq!(of_kind(&s1.drain(), MessageKind::Barrier).len(), 1);

    h.send(
        &manager,
        msg(Body::BarrierReached { barrier: uuid }, id::MASTER_HUB, id::NEXT_HOP),
    );
    assert!(of_kind(&ui.drain(), MessageKind::BarrierReached).is_empty());
    assert_eq!(h.core.status().barrier, Some(uuid));

    h.send(
        &s1,
        msg(Body::BarrierReached { barrier: uuid }, id1, id::NEXT_HOP),
    );
    assert_eq!(of_kind(&ui.drain(), MessageKind::BarrierReached).len(), 1);
    assert_eq!(of_kind(&s1.drain(), MessageKind::BarrierReached).len(), 1);
    assert_eq!(of_kind(&manager.drain(), MessageKind::BarrierReached).len(), 1);
    assert_eq!(h.core.status().barrier, None);
}

#[test]
fn overlapping_barrier_is_rejected() {
    let (mut h, _manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    h.send(&ui, msg(Body::Barrier, id::INVALID, id::NEXT_HOP));
    let err = h
        .try_send(&ui, msg(Body::Barrier, id::INVALID, id::NEXT_HOP))
        .unwrap_err();
    assert!(matches!(err, HubError::Protocol(_)));
}

#[test]
fn lost_slave_no_longer_blocks_barrier() {
    let (mut h, manager) = ready_master();
    let mut ui = h.identify(Identity::Ui, "ui");
    let (s1, _) = h.join_slave("n1", false);
    let barrier = msg(Body::Barrier, id::INVALID, id::NEXT_HOP);
    let uuid = barrier.uuid;
    h.send(&ui, barrier);
    h.send(
        &manager,
        msg(Body::BarrierReached { barrier: uuid }, id::MASTER_HUB, id::NEXT_HOP),
    );
    ui.drain();

    h.core
        .handle_event(HubEvent::Closed {
            conn: s1.conn,
            reason: "peer closed".into(),
        })
        .unwrap();
    assert_eq!(of_kind(&ui.drain(), MessageKind::BarrierReached).len(), 1);
}

#[test]
fn slave_relays_barrier_to_manager_and_back() {
    let mut h = harness(Role::Slave);
    let mut master = h.dial_master();
    let mut manager = h.identify(Identity::Manager, "manager");
    h.send(&master, msg(Body::SetId { id: -9 }, id::MASTER_HUB, -9));
    manager.drain();
    master.drain();

    let barrier = msg(Body::Barrier, id::MASTER_HUB, id::NEXT_HOP);
    let uuid = barrier.uuid;
    h.send(&master, barrier);
    assert_eq!(of_kind(&manager.drain(), MessageKind::Barrier).len(), 1);

    h.send(
        &manager,
        msg(Body::BarrierReached { barrier: uuid }, -9, id::NEXT_HOP),
    );
    let up = of_kind(&master.drain(), MessageKind::BarrierReached);
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].sender_id, -9);

    h.send(
        &master,
        msg(Body::BarrierReached { barrier: uuid }, id::MASTER_HUB, id::NEXT_HOP),
    );
    assert_eq!(of_kind(&manager.drain(), MessageKind::BarrierReached).len(), 1);
}

// ── pending links ─────────────────────────────────────────────────────────────

#[test]
fn pending_links_apply_in_submission_order() {
    let (mut h, manager) = ready_master();
    let mut ui = h.identify(Identity::Ui, "ui");
    for name in ["A", "B", "C"] {
        h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, name));
    }
    h.send(&ui, message::connect(PortLink::new(1, "out", 2, "in")));
    h.send(&ui, message::connect(PortLink::new(1, "out", 3, "in")));
    assert_eq!(h.core.status().pending_links, 2);
    ui.drain();

    for (module, name, kind) in [(2, "in", PortKind::Input), (3, "in", PortKind::Input), (1, "out", PortKind::Output)] {
        h.from_manager(
            &manager,
            Body::AddPort(Port { module, name: name.into(), kind }),
            module,
        );
    }
    assert_eq!(h.core.status().pending_links, 0);
    let links: Vec<Body> = of_kind(&ui.drain(), MessageKind::Connect)
        .into_iter()
        .map(|m| m.body)
        .collect();
    assert_eq!(
        links,
        vec![
            Body::Connect(PortLink::new(1, "out", 2, "in")),
            Body::Connect(PortLink::new(1, "out", 3, "in")),
        ]
    );
}

#[test]
fn exit_forgets_pending_links_of_the_module() {
    let (mut h, manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "A"));
    h.ui_spawn(&ui, Spawn::new(id::MASTER_HUB, "B"));
    h.send(&ui, message::connect(PortLink::new(1, "out", 2, "in")));
    h.from_manager(&manager, Body::ModuleExit, 2);
    assert_eq!(h.core.status().pending_links, 0);
}

// ── hub removal and shutdown ──────────────────────────────────────────────────

#[test]
fn hub_removal_is_announced_once() {
    let (mut h, mut manager) = ready_master();
    let mut ui = h.identify(Identity::Ui, "ui");
    let (s1, id1) = h.join_slave("n1", false);
    let (mut s2, _) = h.join_slave("n2", false);
    ui.drain();
    manager.drain();
    s2.drain();

    for _ in 0..2 {
        h.core
            .handle_event(HubEvent::Closed {
                conn: s1.conn,
                reason: "peer closed".into(),
            })
            .unwrap();
    }
    let warnings = of_kind(&ui.drain(), MessageKind::SendText);
    assert_eq!(warnings.len(), 1);
    assert!(h.core.status().connections > 0);

    for _ in 0..2 {
        h.send(&ui, msg(Body::RemoveHub { id: id1 }, id::INVALID, id::MASTER_HUB));
    }
    assert_eq!(of_kind(&ui.drain(), MessageKind::RemoveHub).len(), 1);
    assert_eq!(of_kind(&s2.drain(), MessageKind::RemoveHub).len(), 1);
    assert_eq!(of_kind(&manager.drain(), MessageKind::RemoveHub).len(), 1);
    assert!(h.core.slaves().iter().all(|s| s.id != id1));
}

#[test]
fn removing_a_connected_slave_asks_it_to_quit() {
    let (mut h, _manager) = ready_master();
    let ui = h.identify(Identity::Ui, "ui");
    let (mut s1, id1) = h.join_slave("n1", false);
    h.send(&ui, msg(Body::RemoveHub { id: id1 }, id::INVALID, id::MASTER_HUB));
    let quits = of_kind(&s1.drain(), MessageKind::Quit);
    assert_eq!(quits.len(), 1);
    assert_eq!(quits[0].body, Body::Quit { id: id1 });

    h.send(&s1, msg(Body::RemoveHub { id: id1 }, id1, id::MASTER_HUB));
    assert!(h.core.slaves().is_empty());
}

#[test]
fn ui_quit_shuts_down_cleanly() {
    let (mut h, mut manager) = ready_master();
    h.core.launch_manager().unwrap();
    let ui = h.identify(Identity::Ui, "ui");
    h.send(&ui, message::quit(id::BROADCAST));
    assert!(h.core.is_quitting());
    assert_eq!(of_kind(&manager.drain(), MessageKind::Quit).len(), 1);
    assert_eq!(h.core.exit_status(), None);

    h.host.exit(ProcessRole::Manager);
    h.core.reap_processes();
    assert_eq!(h.core.exit_status(), Some(0));
    assert!(!h.core.is_emergency());
}

struct Supervised {
    run: JoinHandle<i32>,
    host: FakeHost,
    _control: ControlHandle,
    _dir: TempDir,
}

/// Run the router task over `h`, as main does.
fn supervise(h: Harness, shutdown: CancellationToken) -> Supervised {
    let bus = HubBus::new(16);
    let control = SupervisorControl::new(4);
    let Harness { core, host, _dir, .. } = h;
    let run = tokio::spawn(crate::supervisor::run(
        core,
        bus.rx,
        bus.handle,
        control.rx,
        shutdown,
    ));
    Supervised {
        run,
        host,
        _control: control.handle,
        _dir,
    }
}

#[tokio::test(start_paused = true)]
async fn orderly_quit_waits_for_a_slow_manager() {
    let (mut h, mut manager) = ready_master();
    h.core.launch_manager().unwrap();
    let ui = h.identify(Identity::Ui, "ui");
    h.send(&ui, message::quit(id::BROADCAST));
    assert_eq!(of_kind(&manager.drain(), MessageKind::Quit).len(), 1);

    let grace = h.core.grace();
    let Supervised { run, host, _control, _dir } = supervise(h, CancellationToken::new());
    tokio::time::sleep(grace * 5).await;
    assert!(!run.is_finished());
    assert!(host.killed().is_empty());

    host.exit(ProcessRole::Manager);
    let code = tokio::time::timeout(grace, run).await.unwrap().unwrap();
    assert_eq!(code, 0);
    assert!(host.killed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupt_escalates_when_children_outlast_grace() {
    let (mut h, _manager) = ready_master();
    h.core.launch_manager().unwrap();
    let grace = h.core.grace();
    let shutdown = CancellationToken::new();
    let Supervised { run, host, _control, _dir } = supervise(h, shutdown.clone());

    shutdown.cancel();
    let code = tokio::time::timeout(grace * 5, run).await.unwrap().unwrap();
    assert_eq!(code, 1);
    assert_eq!(host.killed(), vec![ProcessRole::Manager]);
    assert_eq!(host.launched().last().unwrap().role, ProcessRole::Cleaner);
}

#[test]
fn manager_death_triggers_emergency_cleanup() {
    let (mut h, _manager) = ready_master();
    h.core.launch_manager().unwrap();
    let launched = h.host.launched();
    assert_eq!(
        launched[0].args,
        vec![
            h.core.config().shm_name("node1"),
            "31093".to_string(),
            "31094".to_string()
        ]
    );

    h.host.exit(ProcessRole::Manager);
    h.core.reap_processes();
    assert!(h.core.is_emergency());
    let cleaner = h.host.launched().pop().unwrap();
    assert_eq!(cleaner.role, ProcessRole::Cleaner);
    assert_eq!(cleaner.args, vec![h.core.config().shm_name("node1")]);
    assert_eq!(h.core.exit_status(), None);

    h.host.exit(ProcessRole::Cleaner);
    h.core.reap_processes();
    assert_eq!(h.core.exit_status(), Some(1));
}

#[test]
fn interrupt_tells_slaves_and_manager_to_quit() {
    let (mut h, mut manager) = ready_master();
    let (mut s1, _) = h.join_slave("n1", false);
    h.core.interrupt();
    let got = s1.drain();
    assert_eq!(of_kind(&got, MessageKind::Quit).len(), 1);
    assert_eq!(of_kind(&got, MessageKind::CloseConnection).len(), 1);
    assert_eq!(of_kind(&manager.drain(), MessageKind::Quit).len(), 1);
    assert!(h.core.is_interrupted());
    assert!(h.core.is_quitting());
}

#[test]
fn losing_master_connection_is_an_emergency() {
    let mut h = harness(Role::Slave);
    let (tx, _rx) = mpsc::unbounded_channel();
    h.core
        .register_outbound(ConnId(100), Identity::Hub, DialPurpose::Master, tx);
    h.core
        .handle_event(HubEvent::Closed {
            conn: ConnId(100),
            reason: "peer closed".into(),
        })
        .unwrap();
    assert!(h.core.is_emergency());
    assert!(h.core.is_quitting());
}
