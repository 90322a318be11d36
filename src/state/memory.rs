//! In-memory [`StateTracker`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::protocol::{
    Body, Message, PeerId,
    id::{self, BROADCAST},
    message::{AvailableModule, HubInfo, Parameter, Port, PortKind, PortLink, Spawn},
};

use super::{ModuleState, StateTracker};

#[derive(Debug, Clone)]
struct HubRecord {
    info: HubInfo,
    quitting: bool,
}

#[derive(Debug, Clone)]
struct ModuleRecord {
    hub: PeerId,
    name: String,
    mirror_of: PeerId,
    state: ModuleState,
    ports: Vec<Port>,
    params: Vec<Parameter>,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    hubs: Vec<HubRecord>,
    available: Vec<AvailableModule>,
    modules: BTreeMap<PeerId, ModuleRecord>,
    links: Vec<PortLink>,
    workflow: Option<Message>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub_mut(&mut self, id: PeerId) -> Option<&mut HubRecord> {
        self.hubs.iter_mut().find(|h| h.info.id == id)
    }

    fn has_port(&self, module: PeerId, name: &str) -> bool {
        self.port_kind(module, name).is_some()
    }

    fn add_hub(&mut self, info: &HubInfo) {
        match self.hub_mut(info.id) {
            Some(rec) => rec.info = info.clone(),
            None => self.hubs.push(HubRecord {
                info: info.clone(),
                quitting: false,
            }),
        }
    }

    fn remove_hub(&mut self, hub: PeerId) -> bool {
        let before = self.hubs.len();
        self.hubs.retain(|h| h.info.id != hub);
        self.available.retain(|a| a.hub_id != hub);
        let gone: Vec<PeerId> = self
            .modules
            .iter()
            .filter(|(_, m)| m.hub == hub)
            .map(|(id, _)| *id)
            .collect();
        for module in gone {
            self.remove_module(module);
        }
        self.hubs.len() != before
    }

    fn add_spawn(&mut self, spawn: &Spawn) -> bool {
        if !id::is_module(spawn.spawn_id) {
            return false;
        }
        let mirror_of = if id::is_module(spawn.mirroring_id) {
            spawn.mirroring_id
        } else {
            spawn.spawn_id
        };
        self.modules.entry(spawn.spawn_id).or_insert_with(|| ModuleRecord {
            hub: spawn.hub_id,
            name: spawn.name.clone(),
            mirror_of,
            state: ModuleState::Spawning,
            ports: Vec::new(),
            params: Vec::new(),
        });
        true
    }

    fn remove_module(&mut self, module: PeerId) -> bool {
        self.links.retain(|l| !l.touches(module));
        self.modules.remove(&module).is_some()
    }

    fn add_port(&mut self, port: &Port) -> bool {
        let Some(m) = self.modules.get_mut(&port.module) else {
            return false;
        };
        if !m.ports.iter().any(|p| p.name == port.name) {
            m.ports.push(port.clone());
        }
        true
    }

    fn remove_port(&mut self, port: &Port) -> bool {
        let Some(m) = self.modules.get_mut(&port.module) else {
            return false;
        };
        m.ports.retain(|p| p.name != port.name);
        self.links.retain(|l| {
            !((l.module_a == port.module && l.port_a == port.name)
                || (l.module_b == port.module && l.port_b == port.name))
        });
        true
    }

    fn add_parameter(&mut self, param: &Parameter) -> bool {
        let Some(m) = self.modules.get_mut(&param.module) else {
            return false;
        };
        if !m.params.iter().any(|p| p.name == param.name) {
            m.params.push(param.clone());
        }
        if !m.ports.iter().any(|p| p.name == param.name) {
            m.ports.push(Port {
                module: param.module,
                name: param.name.clone(),
                kind: PortKind::Parameter,
            });
        }
        true
    }

    fn set_parameter(&mut self, param: &Parameter) -> bool {
        let Some(m) = self.modules.get_mut(&param.module) else {
            return false;
        };
        match m.params.iter_mut().find(|p| p.name == param.name) {
            Some(p) => {
                p.value = param.value.clone();
                true
            }
            None => false,
        }
    }
}

fn announce(body: Body, sender: PeerId) -> Message {
    Message::new(body).from_peer(sender).to_peer(BROADCAST).notify()
}

impl StateTracker for MemoryState {
    fn handle(&mut self, msg: &Message, track: bool) -> bool {
        if !track {
            return false;
        }
        let applied = match &msg.body {
            Body::AddHub(info) => {
                self.add_hub(info);
                true
            }
            Body::RemoveHub { id } => self.remove_hub(*id),
            Body::Quit { id: hub } if id::is_hub(*hub) => match self.hub_mut(*hub) {
                Some(rec) => {
                    rec.quitting = true;
                    true
                }
                None => false,
            },
            Body::ModuleAvailable(av) => {
                self.available
                    .retain(|a| !(a.hub_id == av.hub_id && a.name == av.name));
                self.available.push(av.clone());
                true
            }
            Body::Spawn(spawn) => self.add_spawn(spawn),
            Body::Started { .. } => match self.modules.get_mut(&msg.sender_id) {
                Some(m) => {
                    m.state = ModuleState::Running;
                    true
                }
                None => false,
            },
            Body::ModuleExit => self.remove_module(msg.sender_id),
            Body::AddPort(port) => self.add_port(port),
            Body::RemovePort(port) => self.remove_port(port),
            Body::AddParameter(param) => self.add_parameter(param),
            Body::SetParameter(param) => self.set_parameter(param),
            Body::Connect(_) | Body::Disconnect(_) => self.handle_connect_or_disconnect(msg),
            Body::LoadWorkflow { .. } => {
                self.workflow = Some(msg.clone());
                true
            }
            _ => false,
        };
        if applied {
            debug!(kind = ?msg.kind(), sender = msg.sender_id, "state updated");
        }
        applied
    }

    fn handle_connect_or_disconnect(&mut self, msg: &Message) -> bool {
        match &msg.body {
            Body::Connect(link) => {
                if !self.has_port(link.module_a, &link.port_a) || !self.has_port(link.module_b, &link.port_b) {
                    return false;
                }
                if !self.links.contains(link) {
                    self.links.push(link.clone());
                }
                true
            }
            Body::Disconnect(link) => {
                if !self.has_port(link.module_a, &link.port_a) || !self.has_port(link.module_b, &link.port_b) {
                    return false;
                }
                self.links.retain(|l| l != link);
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> Vec<Message> {
        let mut out = Vec::new();
        for hub in &self.hubs {
            out.push(announce(Body::AddHub(hub.info.clone()), hub.info.id));
        }
        for av in &self.available {
            out.push(announce(Body::ModuleAvailable(av.clone()), av.hub_id));
        }
        for (&module, m) in &self.modules {
            let mut spawn = Spawn::new(m.hub, m.name.clone());
            spawn.spawn_id = module;
            if m.mirror_of != module {
                spawn.mirroring_id = m.mirror_of;
            }
            out.push(announce(Body::Spawn(spawn), id::MASTER_HUB));
            if m.state == ModuleState::Running {
                out.push(announce(Body::Started { name: m.name.clone() }, module));
            }
            for port in m.ports.iter().filter(|p| p.kind != PortKind::Parameter) {
                out.push(announce(Body::AddPort(port.clone()), module));
            }
            for param in &m.params {
                out.push(announce(Body::AddParameter(param.clone()), module));
            }
            for param in &m.params {
                out.push(announce(Body::SetParameter(param.clone()), module));
            }
        }
        for link in &self.links {
            out.push(announce(Body::Connect(link.clone()), id::MASTER_HUB));
        }
        if let Some(workflow) = &self.workflow {
            out.push(workflow.clone());
        }
        out
    }

    fn hub_of(&self, id: PeerId) -> PeerId {
        if id::is_module(id) {
            return self.modules.get(&id).map_or(id::INVALID, |m| m.hub);
        }
        if self.hubs.iter().any(|h| h.info.id == id) {
            return id;
        }
        id::INVALID
    }

    fn hubs(&self) -> Vec<PeerId> {
        self.hubs.iter().map(|h| h.info.id).collect()
    }

    fn hub_info(&self, id: PeerId) -> Option<HubInfo> {
        self.hubs.iter().find(|h| h.info.id == id).map(|h| h.info.clone())
    }

    fn is_hub_quitting(&self, id: PeerId) -> bool {
        self.hubs.iter().any(|h| h.info.id == id && h.quitting)
    }

    fn mirror_of(&self, id: PeerId) -> PeerId {
        self.modules.get(&id).map_or(id, |m| m.mirror_of)
    }

    fn mirrors(&self, id: PeerId) -> Vec<PeerId> {
        let Some(primary) = self.modules.get(&id).map(|m| m.mirror_of) else {
            return Vec::new();
        };
        self.modules
            .iter()
            .filter(|(_, m)| m.mirror_of == primary)
            .map(|(id, _)| *id)
            .collect()
    }

    fn module_state(&self, id: PeerId) -> ModuleState {
        self.modules.get(&id).map_or(ModuleState::Unknown, |m| m.state)
    }

    fn module_name(&self, id: PeerId) -> Option<String> {
        self.modules.get(&id).map(|m| m.name.clone())
    }

    fn running_modules(&self) -> Vec<PeerId> {
        self.modules.keys().copied().collect()
    }

    fn parameters(&self, module: PeerId) -> Vec<Parameter> {
        self.modules.get(&module).map(|m| m.params.clone()).unwrap_or_default()
    }

    fn port_kind(&self, module: PeerId, name: &str) -> Option<PortKind> {
        self.modules
            .get(&module)?
            .ports
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.kind)
    }

    fn ports(&self, module: PeerId) -> Vec<Port> {
        self.modules.get(&module).map(|m| m.ports.clone()).unwrap_or_default()
    }

    fn input_links(&self, module: PeerId) -> Vec<PortLink> {
        self.links
            .iter()
            .filter(|l| {
                l.module_b == module && self.port_kind(module, &l.port_b) == Some(PortKind::Input)
            })
            .cloned()
            .collect()
    }

    fn output_links(&self, module: PeerId) -> Vec<PortLink> {
        self.links
            .iter()
            .filter(|l| {
                l.module_a == module && self.port_kind(module, &l.port_a) == Some(PortKind::Output)
            })
            .cloned()
            .collect()
    }

    fn available(&self, hub: PeerId, name: &str) -> Option<AvailableModule> {
        self.available
            .iter()
            .find(|a| a.hub_id == hub && a.name == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::id::MASTER_HUB;
    use serde_json::json;

    fn tracked(state: &mut MemoryState, body: Body, sender: PeerId) -> bool {
        state.handle(&Message::new(body).from_peer(sender), true)
    }

    fn spawned(state: &mut MemoryState, hub: PeerId, name: &str, id: PeerId) {
        let mut spawn = Spawn::new(hub, name);
        spawn.spawn_id = id;
        assert!(tracked(state, Body::Spawn(spawn), MASTER_HUB));
    }

    fn port(state: &mut MemoryState, module: PeerId, name: &str, kind: PortKind) {
        assert!(tracked(
            state,
            Body::AddPort(Port { module, name: name.into(), kind }),
            module
        ));
    }

    fn hub(id: PeerId, name: &str) -> HubInfo {
        HubInfo { id, name: name.into(), host: String::new(), port: 0, has_ui: false }
    }

    #[test]
    fn untracked_messages_are_ignored() {
        let mut state = MemoryState::new();
        let msg = Message::new(Body::AddHub(hub(MASTER_HUB, "head")));
        assert!(!state.handle(&msg, false));
        assert!(state.hubs().is_empty());
    }

    #[test]
    fn spawn_without_id_is_not_a_module() {
        let mut state = MemoryState::new();
        assert!(!tracked(&mut state, Body::Spawn(Spawn::new(MASTER_HUB, "Gendat")), MASTER_HUB));
        assert!(state.running_modules().is_empty());
    }

    #[test]
    fn hub_of_resolves_modules_and_hubs() {
        let mut state = MemoryState::new();
        tracked(&mut state, Body::AddHub(hub(-9, "node1")), -9);
        spawned(&mut state, -9, "Gendat", 3);
        assert_eq!(state.hub_of(3), -9);
        assert_eq!(state.hub_of(-9), -9);
        assert_eq!(state.hub_of(4), id::INVALID);
        assert_eq!(state.hub_of(-10), id::INVALID);
    }

    #[test]
    fn connect_needs_both_ports() {
        let mut state = MemoryState::new();
        spawned(&mut state, MASTER_HUB, "A", 1);
        spawned(&mut state, MASTER_HUB, "B", 2);
        port(&mut state, 1, "out", PortKind::Output);
        let conn = Message::new(Body::Connect(PortLink::new(1, "out", 2, "in")));
        assert!(!state.handle_connect_or_disconnect(&conn));
        port(&mut state, 2, "in", PortKind::Input);
        assert!(state.handle_connect_or_disconnect(&conn));
        assert_eq!(state.input_links(2), vec![PortLink::new(1, "out", 2, "in")]);
        assert_eq!(state.output_links(1).len(), 1);

        let disc = Message::new(Body::Disconnect(PortLink::new(1, "out", 2, "in")));
        assert!(state.handle_connect_or_disconnect(&disc));
        assert!(state.input_links(2).is_empty());
    }

    #[test]
    fn module_exit_drops_links_and_ports() {
        let mut state = MemoryState::new();
        spawned(&mut state, MASTER_HUB, "A", 1);
        spawned(&mut state, MASTER_HUB, "B", 2);
        port(&mut state, 1, "out", PortKind::Output);
        port(&mut state, 2, "in", PortKind::Input);
        state.handle_connect_or_disconnect(&Message::new(Body::Connect(PortLink::new(1, "out", 2, "in"))));
        assert!(tracked(&mut state, Body::ModuleExit, 1));
        assert_eq!(state.module_state(1), ModuleState::Unknown);
        assert!(state.input_links(2).is_empty());
    }

    #[test]
    fn parameters_keep_order_and_update() {
        let mut state = MemoryState::new();
        spawned(&mut state, MASTER_HUB, "A", 5);
        for (name, value) in [("p1", json!("x")), ("p2", json!(3))] {
            tracked(
                &mut state,
                Body::AddParameter(Parameter { module: 5, name: name.into(), value }),
                5,
            );
        }
        assert!(tracked(
            &mut state,
            Body::SetParameter(Parameter { module: 5, name: "p2".into(), value: json!(7) }),
            5
        ));
        let params = state.parameters(5);
        assert_eq!(params[0].name, "p1");
        assert_eq!(params[1].value, json!(7));
        assert_eq!(state.port_kind(5, "p1"), Some(PortKind::Parameter));
        assert!(!tracked(
            &mut state,
            Body::SetParameter(Parameter { module: 5, name: "nope".into(), value: json!(1) }),
            5
        ));
    }

    #[test]
    fn mirror_groups() {
        let mut state = MemoryState::new();
        spawned(&mut state, -9, "COVER", 3);
        let mut mirror = Spawn::new(-10, "COVER");
        mirror.spawn_id = 4;
        mirror.mirroring_id = 3;
        tracked(&mut state, Body::Spawn(mirror), MASTER_HUB);
        assert_eq!(state.mirror_of(4), 3);
        assert_eq!(state.mirrors(3), vec![3, 4]);
        assert_eq!(state.mirrors(4), vec![3, 4]);
        assert!(state.mirrors(99).is_empty());
    }

    #[test]
    fn started_marks_running_and_respawn_keeps_state() {
        let mut state = MemoryState::new();
        spawned(&mut state, MASTER_HUB, "A", 1);
        assert_eq!(state.module_state(1), ModuleState::Spawning);
        tracked(&mut state, Body::Started { name: "A".into() }, 1);
        assert_eq!(state.module_state(1), ModuleState::Running);
        spawned(&mut state, MASTER_HUB, "A", 1);
        assert_eq!(state.module_state(1), ModuleState::Running);
    }

    #[test]
    fn remove_hub_drops_its_modules() {
        let mut state = MemoryState::new();
        tracked(&mut state, Body::AddHub(hub(-9, "node1")), -9);
        spawned(&mut state, -9, "A", 1);
        assert!(tracked(&mut state, Body::RemoveHub { id: -9 }, -9));
        assert!(state.hubs().is_empty());
        assert_eq!(state.module_state(1), ModuleState::Unknown);
        assert!(!tracked(&mut state, Body::RemoveHub { id: -9 }, -9));
    }

    #[test]
    fn snapshot_orders_dependencies() {
        let mut state = MemoryState::new();
        tracked(&mut state, Body::AddHub(hub(MASTER_HUB, "head")), MASTER_HUB);
        spawned(&mut state, MASTER_HUB, "A", 1);
        spawned(&mut state, MASTER_HUB, "B", 2);
        port(&mut state, 1, "out", PortKind::Output);
        port(&mut state, 2, "in", PortKind::Input);
        state.handle_connect_or_disconnect(&Message::new(Body::Connect(PortLink::new(1, "out", 2, "in"))));

        let kinds: Vec<_> = state.snapshot().iter().map(|m| m.kind()).collect();
        use crate::protocol::MessageKind as K;
        assert_eq!(
            kinds,
            vec![K::AddHub, K::Spawn, K::AddPort, K::Spawn, K::AddPort, K::Connect]
        );

        // Replaying the snapshot into a fresh tracker rebuilds the same links.
        let mut replica = MemoryState::new();
        for msg in state.snapshot() {
            replica.handle(&msg, true);
        }
        assert_eq!(replica.input_links(2), state.input_links(2));
    }
}
