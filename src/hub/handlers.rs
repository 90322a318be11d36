//! Dispatch registration plus the smaller per-kind handlers.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::process::{LaunchSpec, ProcessRole};
use crate::protocol::message::{Body, TextLevel};
use crate::protocol::{Identity, Message, MessageKind, PeerId, id};
use crate::supervisor::bus::DialPurpose;

use super::barrier::Progress;
use super::connections::ConnId;
use super::dispatch::{DispatchTable, Inbound, Phase};
use super::{DialRequest, HubCore};

/// Build the handler table.
///
/// # Panics
///
/// Panics if a kind is registered twice.
pub(super) fn table() -> DispatchTable {
    let mut t = DispatchTable::new();

    t.register(MessageKind::Identify, Phase::Replace, HubCore::on_identify);
    t.register(MessageKind::SetId, Phase::Replace, HubCore::on_set_id);
    t.register(MessageKind::CloseConnection, Phase::Replace, HubCore::on_close_connection);
    t.register(MessageKind::AddHub, Phase::Replace, HubCore::on_add_hub);
    t.register(MessageKind::RemoveHub, Phase::Replace, HubCore::on_remove_hub);
    t.register(MessageKind::Quit, Phase::Replace, HubCore::on_quit);
    t.register(MessageKind::Spawn, Phase::Replace, HubCore::on_spawn);
    t.register(MessageKind::Connect, Phase::Replace, HubCore::on_connect);
    t.register(MessageKind::Disconnect, Phase::Replace, HubCore::on_connect);
    t.register(MessageKind::Cover, Phase::Replace, HubCore::on_cover);
    t.register(MessageKind::Execute, Phase::Replace, HubCore::on_execute);
    t.register(MessageKind::LockUi, Phase::Replace, HubCore::on_lock_ui);

    t.register(MessageKind::ModuleExit, Phase::Before, HubCore::on_module_exit);

    t.register(MessageKind::SpawnPrepared, Phase::After, HubCore::on_spawn_prepared);
    t.register(MessageKind::Started, Phase::After, HubCore::on_started);
    t.register(MessageKind::AddParameter, Phase::After, HubCore::on_add_parameter);
    t.register(MessageKind::Barrier, Phase::After, HubCore::on_barrier);
    t.register(MessageKind::BarrierReached, Phase::After, HubCore::on_barrier_reached);
    t.register(MessageKind::Debug, Phase::After, HubCore::on_debug);

    t
}

impl HubCore {
    // ── barriers ──────────────────────────────────────────────────────────

    fn on_barrier(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let hub_id = self.hub_id();
        if self.is_master() {
            let slaves = self.topology.ready_slaves();
            self.barrier.begin(msg.uuid, slaves.len() + 1)?;
            info!(barrier = %msg.uuid, participants = slaves.len() + 1, "barrier started");
            let fwd = msg.clone().from_peer(hub_id).to_peer(id::NEXT_HOP);
            for (_, conn) in slaves {
                self.send_conn(conn, &fwd);
            }
            self.send_manager(&fwd);
        } else if inbound.identity == Identity::Hub {
            self.barrier.begin(msg.uuid, 1)?;
            debug!(barrier = %msg.uuid, "barrier relayed to manager");
            self.send_manager(msg);
        } else {
            warn!(from = %inbound.identity, "barrier request on slave ignored");
        }
        Ok(())
    }

    fn on_barrier_reached(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::BarrierReached { barrier } = msg.body else {
            return Ok(());
        };
        let hub_id = self.hub_id();

        if self.is_master() {
            let who = if inbound.identity == Identity::Manager {
                hub_id
            } else {
                inbound.sender_hub
            };
            match self.barrier.reach(barrier, who)? {
                Progress::Released => self.release_barrier(barrier),
                Progress::Waiting => {
                    debug!(%barrier, who, reached = self.barrier.reached_count(), "barrier reached");
                }
                Progress::Ignored => debug!(%barrier, who, "duplicate barrier reached ignored"),
            }
            return Ok(());
        }

        match inbound.identity {
            Identity::Manager => {
                let up = msg.clone().from_peer(hub_id).to_peer(id::NEXT_HOP);
                self.send_master(&up);
            }
            Identity::Hub => {
                self.barrier.reset();
                self.send_ui(msg, None);
                self.send_manager(msg);
            }
            other => warn!(from = %other, "barrier reached from unexpected peer ignored"),
        }
        Ok(())
    }

    fn release_barrier(&mut self, barrier: Uuid) {
        info!(%barrier, "barrier released");
        let release = Message::new(Body::BarrierReached { barrier })
            .from_peer(id::MASTER_HUB)
            .to_peer(id::NEXT_HOP);
        self.state.handle(&release, true);
        self.send_ui(&release, None);
        self.send_slaves(&release, None);
        self.send_manager(&release);
    }

    /// Stop waiting for a participant that went away.
    pub(super) fn barrier_participant_left(&mut self, who: PeerId) {
        let active = self.barrier.uuid();
        if let (Some(barrier), Progress::Released) = (active, self.barrier.participant_left(who)) {
            self.release_barrier(barrier);
        }
    }

    // ── cover relay ───────────────────────────────────────────────────────

    fn on_cover(&mut self, _inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        if !self.is_master() {
            self.send_master(msg);
            return Ok(());
        }
        let sender = msg.sender_id;
        for mirror in self.state.mirrors(sender) {
            if mirror != sender {
                self.send_module(mirror, &msg.clone().to_peer(mirror));
            }
        }
        self.relay_to_aux(sender, msg);
        Ok(())
    }

    /// Forward to the module's relay link, opening it on first use.
    fn relay_to_aux(&mut self, module: PeerId, msg: &Message) {
        let Some(port) = self.aux.port else {
            debug!(module, "no aux relay running, cover not relayed");
            return;
        };
        if !self.aux.links.contains_key(&module) {
            self.dial_requests.push(DialRequest {
                purpose: DialPurpose::AuxRelay { module },
                host: "127.0.0.1".into(),
                port,
            });
        }
        let link = self.aux.links.entry(module).or_default();
        match link.conn {
            Some(conn) => {
                self.conns.send(conn, msg);
            }
            None => link.backlog.push(msg.clone()),
        }
    }

    /// Relay traffic back to the module its link belongs to.
    pub(super) fn relay_from_aux(&mut self, conn: ConnId, msg: Message) {
        let module = self
            .aux
            .links
            .iter()
            .find(|(_, link)| link.conn == Some(conn))
            .map(|(module, _)| *module);
        match (module, &msg.body) {
            (Some(module), Body::Cover { .. }) => {
                self.send_module(module, &msg.to_peer(module));
            }
            _ => debug!(%conn, kind = ?msg.kind(), "aux relay message ignored"),
        }
    }

    // ── debugger ──────────────────────────────────────────────────────────

    fn on_debug(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::Debug { module } = msg.body else {
            return Ok(());
        };
        let hub_id = self.hub_id();
        let owner = if id::is_module(module) {
            self.state.hub_of(module)
        } else {
            hub_id
        };
        if owner == id::INVALID {
            self.send_text(TextLevel::Error, format!("cannot debug {module}: unknown module"));
            return Ok(());
        }
        if owner != hub_id {
            if self.is_master() || !inbound.identity.is_hub() {
                self.send_hub(owner, &msg.clone().to_peer(owner));
            }
            return Ok(());
        }

        let role = if id::is_module(module) {
            ProcessRole::Module(module)
        } else {
            ProcessRole::Manager
        };
        let Some(pid) = self.processes.pid_of(role) else {
            self.send_text(TextLevel::Error, format!("no process to debug for {role}"));
            return Ok(());
        };
        let program = self.config.processes.executable(&self.config.processes.debugger);
        let spec = LaunchSpec::new(ProcessRole::Debugger, program, vec![format!("--attach={pid}")]);
        match self.processes.launch(spec) {
            Ok(_) => self.send_text(
                TextLevel::Info,
                format!("attached debugger to {role} (pid {pid})"),
            ),
            Err(e) => self.send_text(
                TextLevel::Error,
                format!("failed to attach debugger to {role}: {e}"),
            ),
        }
        Ok(())
    }

    // ── execute ───────────────────────────────────────────────────────────

    fn on_execute(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::Execute { module } = msg.body else {
            return Ok(());
        };
        if !self.is_master() {
            if msg.notification && inbound.identity == Identity::Hub {
                self.send_manager(msg);
                self.send_ui(msg, None);
            } else {
                self.send_master(msg);
            }
            return Ok(());
        }
        if msg.notification {
            return Ok(());
        }
        let targets = if id::is_module(module) {
            vec![module]
        } else {
            self.state.running_modules()
        };
        for target in targets {
            let note = Message::new(Body::Execute { module: target })
                .from_peer(msg.sender_id)
                .to_peer(id::BROADCAST)
                .notify();
            self.state.handle(&note, true);
            self.send_all(&note);
        }
        Ok(())
    }

    // ── ui lock ───────────────────────────────────────────────────────────

    fn on_lock_ui(&mut self, _inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::LockUi { locked } = msg.body else {
            return Ok(());
        };
        if locked {
            self.ui.lock();
        } else {
            for (conn, held) in self.ui.unlock() {
                self.handle_message(Some(conn), held)?;
            }
        }
        debug!(locked, "ui lock changed");
        self.send_ui(msg, None);
        Ok(())
    }
}
