//! Hub core: the single owner of every control-plane table.
//!
//! [`HubCore`] is driven by one router task. Connection actors, the listener,
//! dialers and the process host feed it [`HubEvent`]s; it answers with
//! fire-and-forget sends on per-connection queues. Because nothing else ever
//! touches these tables, no lock guards them.
//!
//! Message handling is split by concern:
//!
//! | Module        | Concern                                               |
//! |---------------|-------------------------------------------------------|
//! | `route`       | generic fan-out and the send helpers                  |
//! | `handshake`   | identity, hub ids, slave join/leave, quit             |
//! | `spawn`       | spawn, migrate, mirror, module exit, links            |
//! | `handlers`    | dispatch registration, barriers, cover relay, misc    |

mod barrier;
pub mod connections;
mod dispatch;
mod handlers;
mod handshake;
mod pending;
mod route;
mod spawn;
pub mod topology;
mod ui;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::HubError;
use crate::process::{LaunchSpec, ProcessHost, ProcessRole, ProcessTable};
use crate::protocol::message::{self, Body, HubInfo};
use crate::protocol::routing::{Router, RouteFlags, flags};
use crate::protocol::{Identity, Message, MessageKind, PeerId, id};
use crate::session::{self, Role, Session, SessionKey};
use crate::state::StateTracker;
use crate::supervisor::bus::{DialPurpose, HubEvent};

pub use connections::{ConnId, ConnTx, Outbound};
pub use topology::Slave;

use barrier::Barrier;
use connections::Connections;
use dispatch::{DispatchTable, Inbound, Phase};
use pending::PendingQueue;
use topology::Topology;
use ui::UiGate;

/// An outbound connection the router wants opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialRequest {
    pub purpose: DialPurpose,
    pub host: String,
    pub port: u16,
}

/// Snapshot of the hub for the management socket.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub hub_id: PeerId,
    pub name: String,
    pub master: bool,
    pub ready: bool,
    pub quitting: bool,
    pub connections: usize,
    pub slaves: usize,
    pub modules: usize,
    pub pending_links: usize,
    pub barrier: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub role: String,
    pub pid: Option<u32>,
}

/// Front end started next to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frontend {
    Gui,
    Shell,
}

#[derive(Debug, Default)]
struct AuxLink {
    conn: Option<ConnId>,
    /// Cover payloads waiting for the link to open.
    backlog: Vec<Message>,
}

#[derive(Debug, Default)]
struct AuxRelay {
    /// Port the relay printed on startup.
    port: Option<u16>,
    links: HashMap<PeerId, AuxLink>,
}

#[derive(Debug, Clone)]
struct Workflow {
    path: String,
    execute: bool,
}

pub struct HubCore {
    config: Config,
    key: SessionKey,
    router: Router,
    host: String,
    master_addr: Option<(String, u16)>,

    conns: Connections,
    topology: Topology,
    state: Box<dyn StateTracker>,
    processes: ProcessTable,
    barrier: Barrier,
    pending: PendingQueue,
    ui: UiGate,
    dispatch: DispatchTable,

    module_count: PeerId,
    /// Spawns this hub's manager was asked to prepare.
    requested: HashSet<PeerId>,
    send_after_spawn: HashMap<PeerId, Vec<Message>>,
    send_after_exit: HashMap<PeerId, Vec<Message>>,
    dial_requests: Vec<DialRequest>,

    manager: Option<ConnId>,
    master: Option<ConnId>,
    /// The master answered our challenge.
    master_verified: bool,
    aux: AuxRelay,
    workflow: Option<Workflow>,

    ready: bool,
    quitting: bool,
    emergency: bool,
    interrupted: bool,
    has_ui: bool,
}

impl HubCore {
    pub fn new(
        config: Config,
        session: &Session,
        state: Box<dyn StateTracker>,
        host: Box<dyn ProcessHost>,
        hostname: impl Into<String>,
    ) -> Self {
        let is_master = session.role == Role::Master;
        let hub_id = if is_master { id::MASTER_HUB } else { id::INVALID };
        Self {
            config,
            key: session.key.clone(),
            router: Router::new(hub_id, is_master),
            host: hostname.into(),
            master_addr: session.master.clone(),
            conns: Connections::new(),
            topology: Topology::new(),
            state,
            processes: ProcessTable::new(host),
            barrier: Barrier::new(),
            pending: PendingQueue::new(),
            ui: UiGate::new(),
            dispatch: handlers::table(),
            module_count: 0,
            requested: HashSet::new(),
            send_after_spawn: HashMap::new(),
            send_after_exit: HashMap::new(),
            dial_requests: Vec::new(),
            manager: None,
            master: None,
            master_verified: false,
            aux: AuxRelay::default(),
            workflow: None,
            ready: false,
            quitting: false,
            emergency: false,
            interrupted: false,
            has_ui: false,
        }
    }

    /// Advertise a UI on this hub; mirrored modules get a copy here.
    pub fn with_ui(mut self, has_ui: bool) -> Self {
        self.has_ui = has_ui;
        self
    }

    /// Workflow announced to UI clients once the hub is ready.
    pub fn with_workflow(mut self, path: impl Into<String>, execute: bool) -> Self {
        self.workflow = Some(Workflow {
            path: path.into(),
            execute,
        });
        self
    }

    // ── accessors ─────────────────────────────────────────────────────────

    pub fn hub_id(&self) -> PeerId {
        self.router.hub_id()
    }

    pub fn is_master(&self) -> bool {
        self.router.is_master()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &dyn StateTracker {
        self.state.as_ref()
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.config.reap_interval_ms.max(1))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_grace_ms)
    }

    pub fn slaves(&self) -> Vec<Slave> {
        self.topology.list()
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.processes
            .list()
            .into_iter()
            .map(|(role, pid)| ProcessInfo {
                role: role.to_string(),
                pid,
            })
            .collect()
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            hub_id: self.hub_id(),
            name: self.config.hub_name.clone(),
            master: self.is_master(),
            ready: self.ready,
            quitting: self.quitting,
            connections: self.conns.len(),
            slaves: self.topology.list().len(),
            modules: self.state.running_modules().len(),
            pending_links: self.pending.len(),
            barrier: self.barrier.uuid(),
        }
    }

    /// Outbound connections requested since the last call.
    pub fn take_dial_requests(&mut self) -> Vec<DialRequest> {
        std::mem::take(&mut self.dial_requests)
    }

    /// `Some(code)` once shutdown was requested and no child we wait for
    /// is left.
    pub fn exit_status(&self) -> Option<i32> {
        if !self.quitting || self.processes.has_children(true) {
            return None;
        }
        Some(if self.emergency { 1 } else { 0 })
    }

    fn shm_name(&self) -> String {
        self.config.shm_name(&self.host)
    }

    fn self_info(&self) -> HubInfo {
        HubInfo {
            id: self.hub_id(),
            name: self.config.hub_name.clone(),
            host: self.host.clone(),
            port: self.config.control_port,
            has_ui: self.has_ui,
        }
    }

    fn resolve(&self, target: PeerId) -> PeerId {
        self.topology.resolve(target, self.hub_id(), self.state.as_ref())
    }

    // ── launching ─────────────────────────────────────────────────────────

    pub fn launch_manager(&mut self) -> Result<(), HubError> {
        let program = self.config.processes.executable(&self.config.processes.manager);
        let args = vec![
            self.shm_name(),
            self.config.control_port.to_string(),
            self.config.data_port.to_string(),
        ];
        self.processes
            .launch(LaunchSpec::new(ProcessRole::Manager, program, args))?;
        Ok(())
    }

    /// Start a front end pointed at the master.
    pub fn launch_frontend(&mut self, frontend: Frontend) -> Result<(), HubError> {
        let name = match frontend {
            Frontend::Gui => &self.config.processes.gui,
            Frontend::Shell => &self.config.processes.shell,
        };
        let program = self.config.processes.executable(name);
        let (host, port) = match &self.master_addr {
            Some((host, port)) => (host.clone(), *port),
            None => (self.host.clone(), self.config.control_port),
        };
        self.processes.launch(LaunchSpec::new(
            ProcessRole::GuiFrontend,
            program,
            vec![host, port.to_string()],
        ))?;
        self.has_ui = true;
        Ok(())
    }

    pub fn launch_aux_relay(&mut self) -> Result<(), HubError> {
        let program = self.config.processes.executable(&self.config.processes.aux_relay);
        let mut spec = LaunchSpec::new(ProcessRole::AuxService, program, Vec::new());
        spec.report_port = true;
        self.processes.launch(spec)?;
        Ok(())
    }

    // ── events ────────────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: HubEvent) -> Result<(), HubError> {
        match event {
            HubEvent::Accepted { conn, peer, tx } => {
                self.accept(conn, peer, tx);
                Ok(())
            }
            HubEvent::Connected {
                conn,
                identity,
                purpose,
                tx,
            } => {
                self.register_outbound(conn, identity, purpose, tx);
                Ok(())
            }
            HubEvent::DialFailed { purpose, error } => {
                self.dial_failed(purpose, &error);
                Ok(())
            }
            HubEvent::Inbound { conn, message } => self.handle_inbound(conn, message),
            HubEvent::Closed { conn, reason } => {
                self.remove_connection(conn, &reason);
                Ok(())
            }
            HubEvent::AuxPort(port) => {
                info!(port, "aux relay listening");
                self.aux.port = Some(port);
                Ok(())
            }
        }
    }

    /// New inbound connection: challenge it to identify.
    fn accept(&mut self, conn: ConnId, peer: SocketAddr, tx: ConnTx) {
        let challenge = session::nonce();
        self.conns.insert(conn, Identity::Unknown, Some(peer), tx);
        self.conns.set_nonce(conn, challenge.clone());
        let identify = Message::new(Body::Identify {
            identity: Identity::Request,
            name: self.config.hub_name.clone(),
            nonce: challenge,
            mac: String::new(),
        })
        .from_peer(self.hub_id());
        self.conns.send(conn, &identify);
        info!(%conn, %peer, "connection accepted");
    }

    /// A connection we dialed is up. Its identity is known from the purpose.
    pub fn register_outbound(&mut self, conn: ConnId, identity: Identity, purpose: DialPurpose, tx: ConnTx) {
        self.conns.insert(conn, identity, None, tx);
        match purpose {
            DialPurpose::Master => {
                info!(%conn, "connected to master hub");
                self.master = Some(conn);
            }
            DialPurpose::AuxRelay { module } => {
                debug!(%conn, module, "aux relay link open");
                let link = self.aux.links.entry(module).or_default();
                link.conn = Some(conn);
                for msg in link.backlog.drain(..) {
                    self.conns.send(conn, &msg);
                }
            }
        }
    }

    fn dial_failed(&mut self, purpose: DialPurpose, error: &str) {
        match purpose {
            DialPurpose::Master => {
                error!(error, "cannot reach master hub");
                self.emergency_quit("cannot reach master hub");
            }
            DialPurpose::AuxRelay { module } => {
                warn!(module, error, "aux relay link failed");
                self.aux.links.remove(&module);
            }
        }
    }

    fn handle_inbound(&mut self, conn: ConnId, msg: Message) -> Result<(), HubError> {
        let Some(identity) = self.conns.identity(conn) else {
            debug!(%conn, kind = ?msg.kind(), "message from removed connection dropped");
            return Ok(());
        };
        if !identity.is_classified() && msg.kind() != MessageKind::Identify {
            warn!(%conn, kind = ?msg.kind(), "message before identification dropped");
            return Ok(());
        }
        if self.master == Some(conn) && !self.master_verified && msg.kind() != MessageKind::Identify {
            warn!(%conn, kind = ?msg.kind(), "message from unauthenticated master dropped");
            return Ok(());
        }
        match identity {
            Identity::LocalBulkData | Identity::RemoteBulkData => {
                debug!(%conn, kind = ?msg.kind(), "bulk data connection message ignored");
                Ok(())
            }
            Identity::Ui if self.ui.is_locked() && msg.kind() != MessageKind::LockUi => {
                debug!(%conn, kind = ?msg.kind(), "ui locked, message held");
                self.ui.hold(conn, msg);
                Ok(())
            }
            Identity::AuxService => {
                self.relay_from_aux(conn, msg);
                Ok(())
            }
            _ => self.handle_message(Some(conn), msg),
        }
    }

    /// Route one message. `conn` is `None` for messages the hub generated.
    pub fn handle_message(&mut self, conn: Option<ConnId>, mut msg: Message) -> Result<(), HubError> {
        let identity = conn
            .and_then(|c| self.conns.identity(c))
            .unwrap_or(Identity::Unknown);
        if identity == Identity::Ui {
            msg.sender_id = self.hub_id();
        }

        let mut return_to_sender = false;
        if msg.dest_id == id::FOR_BROADCAST {
            if self.is_master() {
                msg.dest_id = id::BROADCAST;
                return_to_sender = true;
            } else {
                self.send_master(&msg);
                return Ok(());
            }
        }

        let inbound = Inbound {
            conn,
            identity,
            sender_hub: self.resolve(msg.sender_id),
            dest_hub: self.resolve(msg.dest_id),
            return_to_sender,
        };
        let kind = msg.kind();
        debug!(
            conn = ?conn,
            %identity,
            ?kind,
            sender = msg.sender_id,
            dest = msg.dest_id,
            "handling message"
        );

        match self.dispatch.get(kind) {
            Some((Phase::Replace, handler)) => handler(self, &inbound, &msg)?,
            Some((Phase::Before, handler)) => {
                handler(self, &inbound, &msg)?;
                self.route(&inbound, &msg);
            }
            Some((Phase::After, handler)) => {
                self.route(&inbound, &msg);
                if self.router.to_handler(&msg) {
                    handler(self, &inbound, &msg)?;
                }
            }
            None => self.route(&inbound, &msg),
        }

        if self.is_master() && flags(kind).contains(RouteFlags::TRIGGER_QUEUE) {
            self.drain_pending();
        }
        Ok(())
    }

    /// Forget a connection and everything that points at it. Idempotent.
    pub fn remove_connection(&mut self, conn: ConnId, reason: &str) {
        let Some(identity) = self.conns.remove(conn) else {
            return;
        };
        info!(%conn, %identity, reason, "connection removed");
        match identity {
            Identity::SlaveHub => {
                if let Some(hub) = self.topology.detach(conn) {
                    self.barrier_participant_left(hub);
                    self.send_text(
                        message::TextLevel::Warning,
                        format!("lost connection to hub {hub}: {reason}"),
                    );
                }
            }
            Identity::Hub if self.master == Some(conn) => {
                self.master = None;
                self.master_verified = false;
                if !self.quitting {
                    self.emergency_quit("lost connection to master hub");
                }
            }
            Identity::Manager if self.manager == Some(conn) => {
                self.manager = None;
                if !self.quitting {
                    self.emergency_quit("lost connection to manager");
                }
            }
            Identity::AuxService => {
                self.aux.links.retain(|_, link| link.conn != Some(conn));
            }
            Identity::Ui => self.ui.forget(conn),
            _ => {}
        }
    }

    // ── processes and shutdown ────────────────────────────────────────────

    /// Reap exited children and react per role.
    pub fn reap_processes(&mut self) {
        for role in self.processes.reap() {
            match role {
                ProcessRole::Manager if !self.quitting => {
                    error!("manager process died");
                    self.emergency_quit("manager died");
                }
                ProcessRole::Manager => info!("manager exited"),
                ProcessRole::Module(module) => {
                    if self.state.module_state(module).is_alive() {
                        warn!(module, "module exited without notice");
                        let exit = message::module_exit(module).to_peer(self.hub_id());
                        self.send_manager(&exit);
                    } else {
                        debug!(module, "module process reaped");
                    }
                }
                ProcessRole::AuxService => {
                    info!("aux relay exited");
                    self.aux.port = None;
                }
                other => debug!(role = %other, "child process exited"),
            }
        }
    }

    /// User interrupt: ask everyone to quit.
    pub fn interrupt(&mut self) {
        if self.interrupted {
            return;
        }
        self.interrupted = true;
        info!("interrupt received, shutting down");
        let hub_id = self.hub_id();
        if self.is_master() {
            let quit = message::quit(id::BROADCAST).from_peer(hub_id);
            self.send_slaves(&quit, None);
            let close = message::close_connection("user interrupt").from_peer(hub_id);
            self.send_slaves(&close, None);
        }
        self.send_manager(&message::quit(id::BROADCAST).from_peer(hub_id));
        self.quitting = true;
    }

    /// Kill what is left and hand the shared segment to the cleaner.
    pub fn emergency_quit(&mut self, reason: &str) {
        if self.emergency {
            return;
        }
        error!(reason, "emergency shutdown");
        self.emergency = true;
        self.quitting = true;
        self.processes.kill_all(false);
        let cleaner = self.config.processes.executable(&self.config.processes.cleaner);
        let spec = LaunchSpec::new(ProcessRole::Cleaner, cleaner, vec![self.shm_name()]);
        if let Err(e) = self.processes.launch(spec) {
            warn!(error = %e, "cleaner could not be started");
        }
    }
}
