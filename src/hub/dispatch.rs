//! Per-kind handler table.
//!
//! Each message kind has at most one handler, registered with the phase in
//! which it runs relative to generic routing.

use std::collections::HashMap;

use crate::error::HubError;
use crate::protocol::{Identity, Message, MessageKind, PeerId};

use super::HubCore;
use super::connections::ConnId;

/// Where a handler runs relative to generic routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Instead of generic routing; the handler does all sends itself.
    Replace,
    /// Before generic routing, while the tracker still has the old state.
    Before,
    /// After generic routing, when the message is addressed to this hub.
    After,
}

/// Routing facts about the message being handled.
#[derive(Debug, Clone, Copy)]
pub struct Inbound {
    /// `None` for messages the hub generated itself.
    pub conn: Option<ConnId>,
    pub identity: Identity,
    pub sender_hub: PeerId,
    pub dest_hub: PeerId,
    /// The master rewrote `FOR_BROADCAST`; the origin gets a copy too.
    pub return_to_sender: bool,
}

impl Inbound {
    /// Connection that must not get its own message back.
    pub fn origin(&self) -> Option<ConnId> {
        if self.return_to_sender { None } else { self.conn }
    }
}

pub type Handler = fn(&mut HubCore, &Inbound, &Message) -> Result<(), HubError>;

#[derive(Default)]
pub struct DispatchTable {
    entries: HashMap<MessageKind, (Phase, Handler)>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    ///
    /// Panics if `kind` already has a handler.
    pub fn register(&mut self, kind: MessageKind, phase: Phase, handler: Handler) {
        if self.entries.insert(kind, (phase, handler)).is_some() {
            panic!("duplicate handler registered for {kind:?}");
        }
    }

    pub fn get(&self, kind: MessageKind) -> Option<(Phase, Handler)> {
        self.entries.get(&kind).copied()
    }
}
