//! Generic fan-out and the send helpers every handler builds on.
//!
//! All sends are fire-and-forget: a closed writer shows up later as a
//! `Closed` event and goes through `remove_connection`.

use tracing::{debug, error, info, warn};

use crate::protocol::message::{self, TextLevel};
use crate::protocol::{Identity, Message, PeerId, id};

use super::HubCore;
use super::connections::ConnId;
use super::dispatch::Inbound;

impl HubCore {
    /// Apply the routing predicates to `msg` and perform the sends.
    pub(super) fn route(&mut self, inbound: &Inbound, msg: &Message) {
        let hub_id = self.hub_id();
        if self.router.to_tracker(msg, inbound.identity) {
            self.state.handle(msg, true);
        }

        let dest = msg.dest_id;
        if id::is_module(dest) {
            match inbound.dest_hub {
                id::INVALID => {
                    warn!(module = dest, kind = ?msg.kind(), "destination module unknown, message dropped");
                }
                hub if hub == hub_id => {
                    if inbound.identity != Identity::Manager {
                        self.send_manager(msg);
                    }
                }
                hub if self.is_master() => {
                    self.send_hub(hub, msg);
                }
                _ => {
                    if !inbound.identity.is_hub() {
                        self.send_master(msg);
                    }
                }
            }
            return;
        }

        if self.router.to_ui(msg) {
            self.send_ui(msg, inbound.origin());
        }
        let from_manager = inbound.origin().is_some() && inbound.origin() == self.manager;
        if !from_manager && self.router.to_manager(msg, inbound.identity, inbound.sender_hub) {
            self.send_manager(msg);
        }
        let mut sent_master = false;
        if self.router.to_master_hub(msg, inbound.identity, inbound.sender_hub) {
            sent_master = self.send_master(msg);
        }
        let mut sent_slaves = false;
        if self.router.to_slave_hub(msg) {
            let except = if inbound.return_to_sender {
                None
            } else {
                Some(inbound.sender_hub)
            };
            self.send_slaves(msg, except);
            sent_slaves = true;
        }

        if id::is_hub(dest) && inbound.dest_hub != hub_id {
            if inbound.dest_hub == id::INVALID {
                warn!(hub = dest, kind = ?msg.kind(), "destination hub unknown, message dropped");
            } else if self.is_master() {
                if !sent_slaves {
                    self.send_hub(inbound.dest_hub, msg);
                }
            } else if !inbound.identity.is_hub() && !sent_master {
                self.send_master(msg);
            }
        }
    }

    pub(super) fn send_conn(&self, conn: ConnId, msg: &Message) -> bool {
        let sent = self.conns.send(conn, msg);
        if !sent {
            debug!(%conn, kind = ?msg.kind(), "send to closed connection skipped");
        }
        sent
    }

    pub(super) fn send_manager(&self, msg: &Message) -> bool {
        match self.manager {
            Some(conn) => self.send_conn(conn, msg),
            None => {
                debug!(kind = ?msg.kind(), "no manager connected, message dropped");
                false
            }
        }
    }

    pub(super) fn send_master(&self, msg: &Message) -> bool {
        if self.is_master() {
            return false;
        }
        match self.master {
            Some(conn) => self.send_conn(conn, msg),
            None => {
                warn!(kind = ?msg.kind(), "not connected to master, message dropped");
                false
            }
        }
    }

    /// Send to every ready slave except `except`.
    pub(super) fn send_slaves(&self, msg: &Message, except: Option<PeerId>) {
        if !self.is_master() {
            return;
        }
        for (slave, conn) in self.topology.ready_slaves() {
            if Some(slave) != except {
                self.send_conn(conn, msg);
            }
        }
    }

    /// Deliver to hub `hub`; this hub's own traffic goes to its manager.
    pub(super) fn send_hub(&self, hub: PeerId, msg: &Message) -> bool {
        if hub == self.hub_id() {
            return self.send_manager(msg);
        }
        if !self.is_master() {
            return self.send_master(msg);
        }
        match self.topology.conn_of(hub) {
            Some(conn) => self.send_conn(conn, msg),
            None => {
                warn!(hub, kind = ?msg.kind(), "hub not connected, message dropped");
                false
            }
        }
    }

    pub(super) fn send_ui(&self, msg: &Message, except: Option<ConnId>) {
        for conn in self.conns.with_identity(Identity::Ui) {
            if Some(conn) != except {
                self.send_conn(conn, msg);
            }
        }
    }

    /// Deliver to the manager of the hub that runs `module`.
    pub(super) fn send_module(&self, module: PeerId, msg: &Message) -> bool {
        match self.state.hub_of(module) {
            id::INVALID => {
                warn!(module, kind = ?msg.kind(), "no hub for module, message dropped");
                false
            }
            hub => self.send_hub(hub, msg),
        }
    }

    /// Everyone: local UI and manager plus all slaves on the master, the
    /// master otherwise.
    pub(super) fn send_all(&self, msg: &Message) {
        if self.is_master() {
            self.send_ui(msg, None);
            self.send_manager(msg);
            self.send_slaves(msg, None);
        } else {
            self.send_master(msg);
        }
    }

    /// Log `text` and show it to UI clients.
    pub(super) fn send_text(&self, level: TextLevel, text: impl Into<String>) {
        let text = text.into();
        match level {
            TextLevel::Info => info!(%text, "ui notice"),
            TextLevel::Warning => warn!(%text, "ui notice"),
            TextLevel::Error => error!(%text, "ui notice"),
        }
        let msg = message::text(level, text)
            .from_peer(self.hub_id())
            .to_peer(id::UI);
        self.send_ui(&msg, None);
        if !self.is_master() {
            self.send_master(&msg);
        }
    }
}
