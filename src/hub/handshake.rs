//! Identity handshake, hub ids and the hub lifecycle messages.

use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::protocol::message::{self, Body};
use crate::protocol::{Identity, Message, PeerId, id};
use crate::session;

use super::HubCore;
use super::connections::ConnId;
use super::dispatch::Inbound;

impl HubCore {
    pub(super) fn on_identify(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Some(conn) = inbound.conn else {
            return Ok(());
        };
        let Body::Identify {
            identity,
            name,
            nonce,
            mac,
        } = &msg.body
        else {
            return Ok(());
        };

        // Only the master we dialed may challenge us.
        if *identity == Identity::Request {
            if self.master != Some(conn) {
                self.refuse(conn, "unexpected identity challenge");
                return Ok(());
            }
            let challenge = session::nonce();
            self.conns.set_nonce(conn, challenge.clone());
            let reply = Message::new(Body::Identify {
                identity: Identity::SlaveHub,
                name: self.config.hub_name.clone(),
                nonce: challenge,
                mac: self.key.mac(nonce, Identity::SlaveHub),
            })
            .from_peer(self.hub_id());
            self.send_conn(conn, &reply);
            return Ok(());
        }

        // The master's answer to our own challenge.
        if self.master == Some(conn) {
            let verified = *identity == Identity::Hub
                && self
                    .conns
                    .take_nonce(conn)
                    .is_some_and(|challenge| self.key.verify(&challenge, Identity::Hub, mac));
            if verified {
                info!(%conn, "master hub authenticated");
                self.master_verified = true;
            } else {
                warn!(%conn, claimed = %identity, "master hub failed authentication");
                self.refuse(conn, "message authentication failed");
            }
            return Ok(());
        }

        if inbound.identity.is_classified() {
            warn!(%conn, current = %inbound.identity, claimed = %identity, "repeated identify ignored");
            return Ok(());
        }

        let verified = self
            .conns
            .take_nonce(conn)
            .is_some_and(|challenge| self.key.verify(&challenge, *identity, mac));
        if !verified {
            warn!(%conn, claimed = %identity, "identify failed authentication");
            self.refuse(conn, "message authentication failed");
            return Ok(());
        }

        match identity {
            Identity::Manager => self.manager_connected(conn)?,
            Identity::Ui => self.ui_connected(conn),
            Identity::Hub => self.refuse(conn, "refusing connection from other master hub"),
            Identity::SlaveHub if !self.is_master() => {
                self.refuse(conn, "refusing connection from other slave hub")
            }
            Identity::SlaveHub => {
                if !nonce.is_empty() {
                    let proof = Message::new(Body::Identify {
                        identity: Identity::Hub,
                        name: self.config.hub_name.clone(),
                        nonce: String::new(),
                        mac: self.key.mac(nonce, Identity::Hub),
                    })
                    .from_peer(self.hub_id());
                    self.send_conn(conn, &proof);
                }
                self.slave_connected(conn, name)
            }
            Identity::LocalBulkData | Identity::RemoteBulkData | Identity::AuxService => {
                self.conns.classify(conn, *identity);
                debug!(%conn, %identity, "connection classified");
            }
            Identity::Unknown | Identity::Request => self.refuse(conn, "invalid identity"),
        }
        Ok(())
    }

    /// Tell the peer why, then drop it.
    fn refuse(&mut self, conn: ConnId, reason: &str) {
        warn!(%conn, reason, "refusing connection");
        self.send_conn(conn, &message::close_connection(reason).from_peer(self.hub_id()));
        self.conns.close(conn);
        self.remove_connection(conn, reason);
    }

    fn manager_connected(&mut self, conn: ConnId) -> Result<(), HubError> {
        if self.manager.is_some() {
            self.refuse(conn, "manager already connected");
            return Ok(());
        }
        self.conns.classify(conn, Identity::Manager);
        self.manager = Some(conn);
        info!(%conn, "manager connected");

        if self.is_master() {
            self.announce_self();
        }
        let hub_id = self.hub_id();
        if hub_id != id::INVALID {
            self.send_conn(conn, &message::set_id(hub_id).from_peer(hub_id));
            for m in self.state.snapshot() {
                self.send_conn(conn, &m);
            }
            self.hub_ready()?;
        }
        Ok(())
    }

    fn ui_connected(&mut self, conn: ConnId) {
        self.conns.classify(conn, Identity::Ui);
        self.has_ui = true;
        for m in self.state.snapshot() {
            self.send_conn(conn, &m);
        }
        info!(%conn, "ui client connected");
    }

    fn slave_connected(&mut self, conn: ConnId, name: &str) {
        let name = if name.is_empty() {
            self.conns
                .peer(conn)
                .map_or_else(|| conn.to_string(), |p| p.ip().to_string())
        } else {
            name.to_string()
        };
        self.conns.classify(conn, Identity::SlaveHub);
        let slave = self.topology.add_slave(name.as_str(), conn);
        info!(hub = slave, %conn, %name, "slave hub connected");
        if self.ready {
            self.send_conn(conn, &message::set_id(slave).from_peer(self.hub_id()));
        } else {
            self.topology.defer(slave);
        }
    }

    /// The master's AddHub for itself, tracked and shown to the UI.
    fn announce_self(&mut self) {
        let hub_id = self.hub_id();
        let add = Message::new(Body::AddHub(self.self_info()))
            .from_peer(hub_id)
            .to_peer(id::BROADCAST)
            .notify();
        self.state.handle(&add, true);
        self.send_ui(&add, None);
    }

    pub(super) fn on_set_id(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::SetId { id: new_id } = msg.body else {
            return Ok(());
        };
        if self.is_master() || inbound.identity != Identity::Hub {
            warn!(from = %inbound.identity, new_id, "unexpected SetId ignored");
            return Ok(());
        }
        self.router.set_hub_id(new_id);
        info!(hub = new_id, "hub id assigned by master");
        if let Some(manager) = self.manager {
            self.send_conn(manager, &message::set_id(new_id).from_peer(new_id));
            self.hub_ready()?;
        }
        Ok(())
    }

    /// Manager connected and hub id known: open up for business.
    fn hub_ready(&mut self) -> Result<(), HubError> {
        if self.ready {
            return Ok(());
        }
        let hub_id = self.hub_id();
        if self.is_master() {
            self.ready = true;
            for slave in self.topology.take_deferred() {
                if let Some(conn) = self.topology.conn_of(slave) {
                    self.send_conn(conn, &message::set_id(slave).from_peer(hub_id));
                }
            }
            if let Some(workflow) = self.workflow.clone() {
                let load = Message::new(Body::LoadWorkflow {
                    path: workflow.path,
                    execute: workflow.execute,
                })
                .from_peer(hub_id)
                .to_peer(id::UI)
                .notify();
                self.state.handle(&load, true);
                self.send_ui(&load, None);
            }
        } else {
            let add = Message::new(Body::AddHub(self.self_info()))
                .from_peer(hub_id)
                .to_peer(id::BROADCAST)
                .notify();
            self.state.handle(&add, true);
            self.send_ui(&add, None);
            self.send_master(&add);
            self.ready = true;
        }
        info!(hub = hub_id, "hub ready");
        for (conn, held) in self.ui.unlock() {
            self.handle_message(Some(conn), held)?;
        }
        Ok(())
    }

    pub(super) fn on_add_hub(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::AddHub(info) = &msg.body else {
            return Ok(());
        };

        if !self.is_master() {
            if inbound.identity == Identity::Hub {
                self.state.handle(msg, true);
                self.send_ui(msg, None);
                self.send_manager(msg);
            } else {
                debug!(hub = info.id, "AddHub from local peer ignored");
            }
            return Ok(());
        }

        let slave = match inbound.conn {
            Some(conn) if inbound.identity == Identity::SlaveHub => self.topology.slave_by_conn(conn),
            _ => None,
        };
        let Some(slave) = slave else {
            warn!(hub = info.id, from = %inbound.identity, "AddHub from unknown peer ignored");
            return Ok(());
        };
        if slave != info.id {
            warn!(hub = info.id, expected = slave, "AddHub for foreign id ignored");
            return Ok(());
        }

        let snapshot = self.state.snapshot();
        let conns = &self.conns;
        let joined = self.topology.mark_ready(slave, |conn| {
            for m in &snapshot {
                conns.send(conn, m);
            }
        });
        if !joined {
            debug!(hub = slave, "AddHub for ready slave ignored");
            return Ok(());
        }

        self.state.handle(msg, true);
        self.send_ui(msg, None);
        self.send_manager(msg);
        self.send_slaves(msg, Some(slave));
        info!(hub = slave, name = %info.name, has_ui = info.has_ui, "slave hub ready");

        if info.has_ui {
            self.mirror_onto(slave);
        }
        Ok(())
    }

    pub(super) fn on_remove_hub(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::RemoveHub { id: hub } = msg.body else {
            return Ok(());
        };

        if !self.is_master() {
            if inbound.identity == Identity::Hub {
                self.state.handle(msg, true);
                self.send_ui(msg, None);
                self.send_manager(msg);
            } else {
                self.send_master(msg);
            }
            return Ok(());
        }

        if !id::is_hub(hub) || hub == id::MASTER_HUB {
            warn!(hub, "RemoveHub for invalid hub ignored");
            return Ok(());
        }
        let Some(record) = self.topology.slave(hub) else {
            debug!(hub, "hub already removed");
            return Ok(());
        };
        let from_itself = inbound.sender_hub == hub && inbound.identity == Identity::SlaveHub;
        if from_itself || record.conn.is_none() {
            self.remove_slave(hub);
        } else {
            let quit = message::quit(hub).from_peer(self.hub_id()).to_peer(hub);
            self.send_hub(hub, &quit);
        }
        Ok(())
    }

    /// Drop a slave and tell everyone, once.
    fn remove_slave(&mut self, hub: PeerId) {
        let Some(slave) = self.topology.remove(hub) else {
            return;
        };
        info!(hub, name = %slave.name, "slave hub removed");
        self.barrier_participant_left(hub);
        let removed = Message::new(Body::RemoveHub { id: hub })
            .from_peer(self.hub_id())
            .to_peer(id::BROADCAST)
            .notify();
        self.state.handle(&removed, true);
        self.send_ui(&removed, None);
        self.send_manager(&removed);
        self.send_slaves(&removed, None);
    }

    pub(super) fn on_quit(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Body::Quit { id: target } = msg.body else {
            return Ok(());
        };
        if self.router.to_tracker(msg, inbound.identity) {
            self.state.handle(msg, true);
        }
        let hub_id = self.hub_id();
        let master = self.is_master();

        if target == id::BROADCAST {
            info!(requested_by = %inbound.identity, "quit requested");
            self.send_ui(msg, inbound.conn);
            match inbound.identity {
                Identity::Unknown => {
                    self.send_slaves(msg, None);
                    self.send_manager(msg);
                    self.quitting = true;
                }
                Identity::Manager => {
                    self.send_slaves(msg, None);
                    self.quitting = true;
                }
                Identity::Hub => {
                    self.send_manager(msg);
                    self.quitting = true;
                }
                Identity::Ui => {
                    if master {
                        self.send_slaves(msg, None);
                    } else {
                        self.send_master(msg);
                    }
                    self.send_manager(msg);
                    self.quitting = true;
                }
                _ => {
                    self.send_slaves(msg, None);
                    self.send_manager(msg);
                }
            }
        } else if target == hub_id {
            if master {
                warn!("ignoring request to remove master hub");
            } else {
                info!(requested_by = %inbound.identity, "removal of this hub requested");
                if inbound.identity != Identity::Manager {
                    self.send_manager(msg);
                }
                self.leave_session();
            }
        } else if id::is_hub(target) {
            self.send_hub(target, msg);
        } else {
            warn!(target, "quit for non-hub target ignored");
        }
        Ok(())
    }

    /// Orderly departure of a slave: say goodbye upstream once.
    fn leave_session(&mut self) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        let hub_id = self.hub_id();
        let bye = Message::new(Body::RemoveHub { id: hub_id })
            .from_peer(hub_id)
            .to_peer(id::MASTER_HUB);
        self.send_master(&bye);
    }

    pub(super) fn on_close_connection(&mut self, inbound: &Inbound, msg: &Message) -> Result<(), HubError> {
        let Some(conn) = inbound.conn else {
            return Ok(());
        };
        let reason = match &msg.body {
            Body::CloseConnection { reason } => reason.as_str(),
            _ => "",
        };
        info!(%conn, from = %inbound.identity, reason, "peer asked to close connection");
        let escalate = matches!(inbound.identity, Identity::Hub | Identity::Manager);
        self.conns.close(conn);
        if escalate {
            self.emergency_quit(&format!("{} closed the connection: {reason}", inbound.identity));
        }
        self.remove_connection(conn, reason);
        Ok(())
    }
}
