//! Per-kind routing flags and the fan-out predicates built on them.
//!
//! The predicates are pure: they only look at the message, the identity of
//! the connection it arrived on, the resolved sender hub, and which hub we
//! are. [`crate::hub`] performs the sends they ask for.

use std::ops::BitOr;

use super::id::{self, Identity, PeerId};
use super::message::{Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteFlags(u32);

impl RouteFlags {
    pub const NONE: RouteFlags = RouteFlags(0);
    pub const BROADCAST: RouteFlags = RouteFlags(1 << 0);
    pub const TRACK: RouteFlags = RouteFlags(1 << 1);
    pub const DEST_UI: RouteFlags = RouteFlags(1 << 2);
    pub const DEST_MANAGER: RouteFlags = RouteFlags(1 << 3);
    pub const DEST_MODULES: RouteFlags = RouteFlags(1 << 4);
    pub const DEST_MASTER_HUB: RouteFlags = RouteFlags(1 << 5);
    pub const DEST_SLAVE_HUB: RouteFlags = RouteFlags(1 << 6);
    pub const DEST_LOCAL_HUB: RouteFlags = RouteFlags(1 << 7);
    pub const HANDLE_ON_MASTER: RouteFlags = RouteFlags(1 << 8);
    pub const HANDLE_ON_HUB: RouteFlags = RouteFlags(1 << 9);
    pub const HANDLE_ON_DEST: RouteFlags = RouteFlags(1 << 10);
    pub const TRIGGER_QUEUE: RouteFlags = RouteFlags(1 << 11);
    pub const SPECIAL: RouteFlags = RouteFlags(1 << 12);
    pub const CLEAN_QUEUE: RouteFlags = RouteFlags(1 << 13);
    pub const QUEUE_IF_UNHANDLED: RouteFlags = RouteFlags(1 << 14);

    pub const DEST_HUB: RouteFlags =
        RouteFlags(Self::DEST_MASTER_HUB.0 | Self::DEST_SLAVE_HUB.0);

    pub const fn contains(self, other: RouteFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    const fn with(self, other: RouteFlags) -> RouteFlags {
        RouteFlags(self.0 | other.0)
    }
}

impl BitOr for RouteFlags {
    type Output = RouteFlags;

    fn bitor(self, rhs: RouteFlags) -> RouteFlags {
        self.with(rhs)
    }
}

/// Routing table entry for a message kind.
pub fn flags(kind: MessageKind) -> RouteFlags {
    use RouteFlags as F;
    match kind {
        MessageKind::Identify | MessageKind::SetId => F::SPECIAL,
        MessageKind::AddHub | MessageKind::RemoveHub => F::BROADCAST
            .with(F::TRACK)
            .with(F::DEST_UI)
            .with(F::TRIGGER_QUEUE),
        MessageKind::Spawn => F::TRACK.with(F::HANDLE_ON_MASTER),
        MessageKind::SpawnPrepared => F::DEST_LOCAL_HUB.with(F::HANDLE_ON_HUB),
        MessageKind::Started => F::TRACK
            .with(F::DEST_UI)
            .with(F::DEST_MANAGER)
            .with(F::DEST_MODULES)
            .with(F::HANDLE_ON_MASTER)
            .with(F::TRIGGER_QUEUE),
        MessageKind::ModuleExit => F::TRACK
            .with(F::DEST_UI)
            .with(F::DEST_MANAGER)
            .with(F::DEST_MODULES)
            .with(F::CLEAN_QUEUE),
        MessageKind::Kill => F::DEST_MODULES.with(F::HANDLE_ON_DEST),
        MessageKind::ModuleAvailable => F::TRACK
            .with(F::DEST_HUB)
            .with(F::DEST_UI)
            .with(F::HANDLE_ON_HUB),
        MessageKind::AddPort => F::TRACK
            .with(F::DEST_UI)
            .with(F::DEST_MANAGER)
            .with(F::DEST_MODULES)
            .with(F::TRIGGER_QUEUE)
            .with(F::HANDLE_ON_MASTER),
        MessageKind::RemovePort => F::TRACK
            .with(F::DEST_UI)
            .with(F::DEST_MANAGER)
            .with(F::DEST_MODULES),
        MessageKind::AddParameter => F::TRACK
            .with(F::DEST_UI)
            .with(F::DEST_MANAGER)
            .with(F::DEST_MODULES)
            .with(F::TRIGGER_QUEUE)
            .with(F::HANDLE_ON_MASTER),
        MessageKind::SetParameter => F::TRACK
            .with(F::QUEUE_IF_UNHANDLED)
            .with(F::DEST_MANAGER)
            .with(F::DEST_UI)
            .with(F::DEST_MODULES),
        MessageKind::Connect | MessageKind::Disconnect => F::SPECIAL,
        MessageKind::Barrier | MessageKind::BarrierReached => F::HANDLE_ON_DEST,
        MessageKind::Quit => F::TRACK.with(F::SPECIAL),
        MessageKind::CloseConnection => F::TRACK.with(F::SPECIAL),
        MessageKind::SendText => F::DEST_UI.with(F::DEST_MASTER_HUB),
        MessageKind::UpdateStatus => F::TRACK.with(F::DEST_UI).with(F::DEST_MASTER_HUB),
        MessageKind::Debug => F::TRACK.with(F::HANDLE_ON_HUB),
        MessageKind::Cover => F::SPECIAL,
        MessageKind::Execute => F::SPECIAL
            .with(F::HANDLE_ON_MASTER)
            .with(F::TRACK)
            .with(F::DEST_UI),
        MessageKind::LockUi => F::DEST_UI,
        MessageKind::LoadWorkflow => F::TRACK.with(F::DEST_UI),
    }
}

/// Fan-out decisions for one hub.
#[derive(Debug, Clone, Copy)]
pub struct Router {
    hub_id: PeerId,
    is_master: bool,
}

impl Router {
    pub fn new(hub_id: PeerId, is_master: bool) -> Self {
        Self { hub_id, is_master }
    }

    pub fn set_hub_id(&mut self, hub_id: PeerId) {
        self.hub_id = hub_id;
    }

    pub fn hub_id(&self) -> PeerId {
        self.hub_id
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn to_ui(&self, msg: &Message) -> bool {
        let dest = msg.dest_id;
        if dest == id::FOR_BROADCAST || id::is_module(dest) {
            return false;
        }
        if dest == id::BROADCAST || dest == id::UI {
            return true;
        }
        let f = flags(msg.kind());
        f.contains(RouteFlags::DEST_UI) || f.contains(RouteFlags::BROADCAST)
    }

    pub fn to_master_hub(&self, msg: &Message, sender: Identity, sender_hub: PeerId) -> bool {
        if self.is_master || sender == Identity::Hub {
            return false;
        }
        if msg.dest_id == id::FOR_BROADCAST || msg.dest_id == id::BROADCAST {
            return true;
        }
        let f = flags(msg.kind());
        if f.contains(RouteFlags::DEST_MASTER_HUB) || f.contains(RouteFlags::DEST_SLAVE_HUB) {
            return true;
        }
        f.contains(RouteFlags::BROADCAST)
            && (msg.sender_id == self.hub_id || sender_hub == self.hub_id)
    }

    pub fn to_slave_hub(&self, msg: &Message) -> bool {
        if !self.is_master || msg.dest_id == id::FOR_BROADCAST {
            return false;
        }
        if msg.dest_id == id::BROADCAST {
            return true;
        }
        let f = flags(msg.kind());
        f.contains(RouteFlags::DEST_SLAVE_HUB) || f.contains(RouteFlags::BROADCAST)
    }

    pub fn to_manager(&self, msg: &Message, sender: Identity, sender_hub: PeerId) -> bool {
        let dest = msg.dest_id;
        if dest == id::FOR_BROADCAST {
            return false;
        }
        if dest == id::BROADCAST {
            return true;
        }
        let f = flags(msg.kind());
        if id::is_hub(dest) {
            return dest == self.hub_id && f.contains(RouteFlags::DEST_MANAGER);
        }
        if sender != Identity::Manager || sender_hub != self.hub_id {
            return f.contains(RouteFlags::DEST_MANAGER)
                || f.contains(RouteFlags::DEST_MODULES)
                || f.contains(RouteFlags::BROADCAST);
        }
        false
    }

    pub fn to_tracker(&self, msg: &Message, sender: Identity) -> bool {
        if msg.dest_id == id::FOR_BROADCAST || !flags(msg.kind()).contains(RouteFlags::TRACK) {
            return false;
        }
        let peer_hub = if self.is_master {
            Identity::SlaveHub
        } else {
            Identity::Hub
        };
        sender == peer_hub || sender == Identity::Manager || sender == Identity::Ui
    }

    pub fn to_handler(&self, msg: &Message) -> bool {
        let dest = msg.dest_id;
        if dest == id::NEXT_HOP || dest == id::BROADCAST || dest == self.hub_id {
            return true;
        }
        let f = flags(msg.kind());
        if self.is_master
            && (f.contains(RouteFlags::HANDLE_ON_MASTER) || f.contains(RouteFlags::DEST_MASTER_HUB))
        {
            return true;
        }
        if f.contains(RouteFlags::HANDLE_ON_HUB) || f.contains(RouteFlags::DEST_LOCAL_HUB) {
            return true;
        }
        !self.is_master && f.contains(RouteFlags::DEST_SLAVE_HUB)
    }
}
