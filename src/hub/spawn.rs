//! Module lifecycle: spawn, migrate, clone, mirror, exit, and the links
//! between module ports.

use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::process::{LaunchSpec, ProcessRole};
use crate::protocol::message::{
    self, AvailableModule, Body, PortKind, PortLink, Spawn, SpawnReference, TextLevel,
};
use crate::protocol::{Identity, Message, MessageKind, PeerId, id};

use super::HubCore;
use super::dispatch::Inbound;

fn link_of(msg: &Message) -> Option<&PortLink> {
    match &msg.body {
        Body::Connect(link) | Body::Disconnect(link) => Some(link),
        _ => None,
    }
}

/// Same message kind, different endpoints.
fn with_link(msg: &Message, link: PortLink) -> Body {
    match msg.body {
        Body::Disconnect(_) => Body::Disconnect(link),
        _ => Body::Connect(link),
    }
}

impl HubCore {
    // ── spawn ─────────────────────────────────────────────────────────────

    pub(super) fn on_spawn(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::Spawn(spawn) = &msg.body else {
            return Ok(());
        };
        if self.is_master() {
            self.spawn_on_master(msg, spawn.clone());
        } else {
            self.spawn_on_slave(inbound, msg, spawn);
        }
        Ok(())
    }

    fn spawn_on_slave(&mut self, inbound: &Inbound, msg: &Message, spawn: &Spawn) {
        if !id::is_module(spawn.spawn_id) || inbound.identity != Identity::Hub {
            self.send_master(msg);
            return;
        }
        if msg.notification {
            self.state.handle(msg, true);
            self.send_ui(msg, None);
            self.send_manager(msg);
        } else if spawn.hub_id == self.hub_id() {
            self.requested.insert(spawn.spawn_id);
            self.send_manager(msg);
        } else {
            warn!(module = spawn.spawn_id, hub = spawn.hub_id, "spawn request for other hub ignored");
        }
    }

    fn spawn_on_master(&mut self, msg: &Message, mut spawn: Spawn) {
        if msg.notification {
            debug!(module = spawn.spawn_id, "spawn notification on master ignored");
            return;
        }
        let target = self.resolve(spawn.hub_id);
        if target == id::INVALID {
            self.spawn_rejected(spawn, "unknown hub");
            return;
        }
        spawn.hub_id = target;

        if id::is_module(spawn.spawn_id) {
            // Replayed migrate/clone carry the id assigned before.
            if spawn.reference == SpawnReference::None {
                if self.state.module_state(spawn.spawn_id).is_alive() {
                    self.spawn_rejected(spawn, "module id already in use");
                    return;
                }
                self.module_count = self.module_count.max(spawn.spawn_id - id::MODULE_BASE + 1);
            }
            self.do_spawn(spawn);
            return;
        }

        match spawn.reference {
            SpawnReference::Migrate { from } => self.migrate(spawn, from),
            SpawnReference::Clone { from } => {
                spawn.spawn_id = self.allocate_ids(1);
                self.cache_module_values(from, spawn.spawn_id, false);
                self.do_spawn(spawn);
            }
            SpawnReference::None => self.spawn_new(spawn),
        }
    }

    fn spawn_rejected(&mut self, mut spawn: Spawn, reason: &str) {
        self.send_text(
            TextLevel::Error,
            format!("cannot spawn {} on hub {}: {reason}", spawn.name, spawn.hub_id),
        );
        spawn.spawn_id = id::INVALID;
        let failed = Message::new(Body::Spawn(spawn))
            .from_peer(self.hub_id())
            .to_peer(id::UI)
            .notify();
        self.send_ui(&failed, None);
    }

    fn allocate_ids(&mut self, count: PeerId) -> PeerId {
        let first = id::MODULE_BASE + self.module_count;
        self.module_count += count;
        first
    }

    fn spawn_new(&mut self, mut spawn: Spawn) {
        if let Some(compound) = self
            .state
            .available(spawn.hub_id, &spawn.name)
            .filter(AvailableModule::is_compound)
        {
            self.spawn_compound(spawn, compound);
            return;
        }

        spawn.spawn_id = self.allocate_ids(1);
        let mirrored = spawn.mirror || self.config.mirrored_modules.contains(&spawn.name);
        if mirrored {
            spawn.mirroring_id = spawn.spawn_id;
        }
        self.do_spawn(spawn.clone());
        if mirrored {
            self.mirror_everywhere(&spawn);
        }
    }

    /// Announce to everyone, then ask the owning manager to start it.
    fn do_spawn(&mut self, spawn: Spawn) {
        let hub_id = self.hub_id();
        let note = Message::new(Body::Spawn(spawn.clone()))
            .from_peer(hub_id)
            .to_peer(id::BROADCAST)
            .notify();
        self.state.handle(&note, true);
        self.send_all(&note);

        if spawn.hub_id == hub_id {
            self.requested.insert(spawn.spawn_id);
        }
        info!(module = spawn.spawn_id, name = %spawn.name, hub = spawn.hub_id, "spawn dispatched");
        let target = spawn.hub_id;
        let request = Message::new(Body::Spawn(spawn))
            .from_peer(hub_id)
            .to_peer(target);
        self.send_hub(target, &request);
    }

    /// Reserve one id for the compound and one per sub-module. The compound
    /// itself is only announced; its sub-modules are real spawns.
    fn spawn_compound(&mut self, mut spawn: Spawn, compound: AvailableModule) {
        let subs = compound.submodules.len() as PeerId;
        let base = self.allocate_ids(1 + subs);
        spawn.spawn_id = base;
        let hub_id = self.hub_id();
        let note = Message::new(Body::Spawn(spawn.clone()))
            .from_peer(hub_id)
            .to_peer(id::BROADCAST)
            .notify();
        self.state.handle(&note, true);
        self.send_all(&note);
        info!(module = base, name = %spawn.name, submodules = subs, "compound spawn");

        for (index, name) in compound.submodules.iter().enumerate() {
            let mut sub = Spawn::new(spawn.hub_id, name.clone());
            sub.spawn_id = base + 1 + index as PeerId;
            self.do_spawn(sub);
        }
        for link in &compound.links {
            let inner = PortLink::new(
                base + 1 + link.from as PeerId,
                link.from_port.clone(),
                base + 1 + link.to as PeerId,
                link.to_port.clone(),
            );
            self.submit_link(message::connect(inner).from_peer(hub_id));
        }
    }

    /// Restart `from` under a new id, carrying parameters and links over.
    fn migrate(&mut self, mut spawn: Spawn, from: PeerId) {
        spawn.spawn_id = self.allocate_ids(1);
        if !self.cache_module_values(from, spawn.spawn_id, true) {
            self.send_text(
                TextLevel::Error,
                format!("cannot migrate module {from}: not running, spawning fresh"),
            );
            spawn.reference = SpawnReference::None;
            self.do_spawn(spawn);
            return;
        }
        info!(module = from, replacement = spawn.spawn_id, "migrating module");
        self.kill_module(from);
        let hub_id = self.hub_id();
        let replay = Message::new(Body::Spawn(spawn)).from_peer(hub_id).to_peer(hub_id);
        self.send_after_exit.entry(from).or_default().push(replay);
    }

    /// Queue the state of `from` for replay once `to` has started.
    fn cache_module_values(&mut self, from: PeerId, to: PeerId, with_links: bool) -> bool {
        if !self.state.module_state(from).is_alive() {
            return false;
        }
        let hub_id = self.hub_id();
        let mut queue = Vec::new();
        for mut param in self.state.parameters(from) {
            param.module = to;
            queue.push(
                Message::new(Body::SetParameter(param))
                    .from_peer(hub_id)
                    .to_peer(to),
            );
        }
        if with_links {
            for link in self.state.input_links(from) {
                let moved = PortLink::new(link.module_a, link.port_a, to, link.port_b);
                queue.push(message::connect(moved).from_peer(hub_id));
            }
            for link in self.state.output_links(from) {
                let moved = PortLink::new(to, link.port_a, link.module_b, link.port_b);
                queue.push(message::connect(moved).from_peer(hub_id));
            }
        }
        debug!(from, to, replay = queue.len(), "module values cached");
        self.send_after_spawn.entry(to).or_default().extend(queue);
        true
    }

    pub(super) fn kill_module(&mut self, module: PeerId) {
        let kill = message::kill(module).from_peer(self.hub_id());
        self.send_module(module, &kill);
    }

    // ── mirrors ───────────────────────────────────────────────────────────

    /// One mirror of `primary` on every other hub with a UI.
    fn mirror_everywhere(&mut self, primary: &Spawn) {
        for hub in self.state.hubs() {
            if hub == primary.hub_id {
                continue;
            }
            if self.state.hub_info(hub).is_some_and(|h| h.has_ui) {
                self.spawn_mirror(hub, primary.spawn_id);
            }
        }
    }

    /// A hub with a UI joined: give it a mirror of every mirrored primary.
    pub(super) fn mirror_onto(&mut self, hub: PeerId) {
        for module in self.state.running_modules() {
            if self.state.mirror_of(module) != module || self.state.hub_of(module) == hub {
                continue;
            }
            let mirrored = self
                .state
                .module_name(module)
                .is_some_and(|name| self.config.mirrored_modules.contains(&name));
            if mirrored {
                self.spawn_mirror(hub, module);
            }
        }
    }

    fn spawn_mirror(&mut self, hub: PeerId, primary: PeerId) {
        let Some(name) = self.state.module_name(primary) else {
            warn!(module = primary, "cannot mirror unknown module");
            return;
        };
        let mut mirror = Spawn::new(hub, name);
        mirror.spawn_id = self.allocate_ids(1);
        mirror.mirroring_id = primary;
        let mirror_id = mirror.spawn_id;
        info!(module = primary, mirror = mirror_id, hub, "spawning mirror");
        self.do_spawn(mirror);
        self.cache_module_values(primary, mirror_id, false);
    }

    // ── acknowledgements ──────────────────────────────────────────────────

    pub(super) fn on_spawn_prepared(&mut self, _inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::SpawnPrepared(spawn) = &msg.body else {
            return Ok(());
        };
        if msg.notification {
            return Ok(());
        }
        if spawn.hub_id != self.hub_id() {
            warn!(module = spawn.spawn_id, hub = spawn.hub_id, "SpawnPrepared for other hub ignored");
            return Ok(());
        }
        if !self.requested.remove(&spawn.spawn_id) {
            return Err(HubError::Protocol(format!(
                "spawn of module {} acknowledged but never requested",
                spawn.spawn_id
            )));
        }
        self.launch_module(spawn);
        Ok(())
    }

    fn launch_module(&mut self, spawn: &Spawn) {
        let path = self
            .state
            .available(spawn.hub_id, &spawn.name)
            .map(|a| a.path)
            .filter(|p| !p.is_empty());
        let Some(path) = path else {
            self.spawn_failed(spawn, "no executable registered");
            return;
        };
        let program = self.config.processes.executable(&path);
        let args = vec![self.shm_name(), spawn.name.clone(), spawn.spawn_id.to_string()];
        match self.processes.launch(LaunchSpec::new(
            ProcessRole::Module(spawn.spawn_id),
            program,
            args,
        )) {
            Ok(pid) => info!(module = spawn.spawn_id, name = %spawn.name, ?pid, "module started"),
            Err(e) => self.spawn_failed(spawn, &e.to_string()),
        }
    }

    fn spawn_failed(&mut self, spawn: &Spawn, reason: &str) {
        self.send_text(
            TextLevel::Error,
            format!("failed to spawn {} ({}): {reason}", spawn.name, spawn.spawn_id),
        );
        let exit = message::module_exit(spawn.spawn_id).to_peer(self.hub_id());
        self.send_manager(&exit);
    }

    /// Replay what a migrated or mirrored module needs now that it runs.
    pub(super) fn on_started(&mut self, _inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        if !self.is_master() {
            return Ok(());
        }
        let Some(queue) = self.send_after_spawn.remove(&msg.sender_id) else {
            return Ok(());
        };
        debug!(module = msg.sender_id, replay = queue.len(), "replaying cached values");
        for replay in queue {
            if replay.kind() == MessageKind::SetParameter {
                self.state.handle(&replay, true);
            }
            self.handle_message(None, replay)?;
        }
        Ok(())
    }

    /// Tie a mirror's parameters to its primary.
    pub(super) fn on_add_parameter(&mut self, _inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::AddParameter(param) = &msg.body else {
            return Ok(());
        };
        if !self.is_master() {
            return Ok(());
        }
        let primary = self.state.mirror_of(param.module);
        if primary == param.module
            || self.state.port_kind(primary, &param.name) != Some(PortKind::Parameter)
        {
            return Ok(());
        }
        let link = PortLink::new(primary, param.name.clone(), param.module, param.name.clone());
        self.submit_link(message::connect(link).from_peer(self.hub_id()));
        Ok(())
    }

    // ── exit ──────────────────────────────────────────────────────────────

    pub(super) fn on_module_exit(&mut self, _inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let module = msg.sender_id;
        if !id::is_module(module) {
            return Ok(());
        }
        let hub_id = self.hub_id();
        let master = self.is_master();

        let mirrors: Vec<PeerId> = if master {
            self.state
                .mirrors(module)
                .into_iter()
                .filter(|m| *m != module)
                .collect()
        } else {
            Vec::new()
        };
        if master {
            let mut links = self.state.input_links(module);
            links.extend(self.state.output_links(module));
            for link in links {
                self.submit_link(message::disconnect(link).from_peer(hub_id));
            }
        }

        if let Some(queue) = self.send_after_exit.remove(&module) {
            for replay in queue {
                self.handle_message(None, replay)?;
            }
        }
        if let Some(link) = self.aux.links.remove(&module) {
            if let Some(conn) = link.conn {
                self.conns.close(conn);
            }
        }
        let dropped = self.pending.forget_module(module);
        if dropped > 0 {
            debug!(module, dropped, "pending links of exited module dropped");
        }
        self.requested.remove(&module);
        self.send_after_spawn.remove(&module);

        if master && !self.quitting {
            for mirror in mirrors {
                let owner = self.state.hub_of(mirror);
                if !self.state.is_hub_quitting(owner) {
                    self.kill_module(mirror);
                }
            }
        }
        Ok(())
    }

    // ── links ─────────────────────────────────────────────────────────────

    pub(super) fn on_connect(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        if !self.is_master() {
            if msg.notification && inbound.identity == Identity::Hub {
                self.state.handle(msg, true);
                self.send_manager(msg);
                self.send_ui(msg, None);
            } else {
                self.send_master(msg);
            }
            return Ok(());
        }
        self.submit_link(msg.clone());
        Ok(())
    }

    /// Apply a link on the master or park it until its ports exist.
    fn submit_link(&mut self, msg: Message) {
        let Some(link) = link_of(&msg).cloned() else {
            return;
        };
        let link = self.expand_exports(link);
        let mut note = msg;
        note.body = with_link(&note, link);
        note.dest_id = id::BROADCAST;
        note.notification = true;

        if self.state.handle_connect_or_disconnect(&note) {
            self.announce_link(note);
        } else {
            debug!(kind = ?note.kind(), "link waits for its ports");
            self.pending.push(note);
        }
    }

    /// Rewrite compound export ports to the sub-module ports behind them.
    fn expand_exports(&self, mut link: PortLink) -> PortLink {
        if let Some((module, port)) = self.exported_port(link.module_a, &link.port_a) {
            link.module_a = module;
            link.port_a = port;
        }
        if let Some((module, port)) = self.exported_port(link.module_b, &link.port_b) {
            link.module_b = module;
            link.port_b = port;
        }
        link
    }

    fn exported_port(&self, module: PeerId, port: &str) -> Option<(PeerId, String)> {
        let compound = self.state.module_descriptor(module)?;
        if !compound.is_compound() {
            return None;
        }
        let export = compound.exports.iter().find(|e| e.port == port)?;
        Some((module + 1 + export.submodule as PeerId, export.inner_port.clone()))
    }

    fn is_parameter(&self, module: PeerId, port: &str) -> bool {
        self.state.port_kind(module, port) == Some(PortKind::Parameter)
    }

    /// Broadcast an applied link, plus one copy per mirror of either end.
    pub(super) fn announce_link(&mut self, note: Message) {
        self.send_all(&note);
        let Some(link) = link_of(&note).cloned() else {
            return;
        };
        if self.is_parameter(link.module_a, &link.port_a) || self.is_parameter(link.module_b, &link.port_b) {
            return;
        }

        let mut copies = Vec::new();
        for mirror in self.state.mirrors(link.module_a) {
            if mirror != link.module_a {
                let mut l = link.clone();
                l.module_a = mirror;
                copies.push(l);
            }
        }
        for mirror in self.state.mirrors(link.module_b) {
            if mirror != link.module_b {
                let mut l = link.clone();
                l.module_b = mirror;
                copies.push(l);
            }
        }
        for l in copies {
            let copy = Message::new(with_link(&note, l))
                .from_peer(note.sender_id)
                .to_peer(id::BROADCAST)
                .notify();
            self.state.handle_connect_or_disconnect(&copy);
            self.send_all(&copy);
        }
    }
}
