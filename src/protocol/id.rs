//! Participant address space.
//!
//! Modules get positive ids handed out by the master starting at
//! [`MODULE_BASE`]. Hubs live below [`MASTER_HUB`]: the master itself is
//! `MASTER_HUB`, every slave gets the next lower value. Everything in between
//! is a pseudo-address that routing resolves against the local hub.

use serde::{Deserialize, Serialize};

/// Integer address of a hub, module, or pseudo-destination.
pub type PeerId = i32;

pub const MODULE_BASE: PeerId = 1;
pub const INVALID: PeerId = 0;
/// Deliver to every participant.
pub const BROADCAST: PeerId = -2;
/// Deliver to every participant once the message reaches the master.
pub const FOR_BROADCAST: PeerId = -3;
/// Deliver one hop toward the master (barriers).
pub const NEXT_HOP: PeerId = -4;
pub const UI: PeerId = -5;
pub const LOCAL_MANAGER: PeerId = -6;
pub const LOCAL_HUB: PeerId = -7;
pub const MASTER_HUB: PeerId = -8;

pub fn is_module(id: PeerId) -> bool {
    id >= MODULE_BASE
}

pub fn is_hub(id: PeerId) -> bool {
    id <= MASTER_HUB
}

/// Role a connection claims during the identity handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identity {
    Unknown,
    Request,
    Hub,
    SlaveHub,
    Manager,
    Ui,
    LocalBulkData,
    RemoteBulkData,
    AuxService,
}

impl Identity {
    /// Stable name mixed into the authentication tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Identity::Unknown => "unknown",
            Identity::Request => "request",
            Identity::Hub => "hub",
            Identity::SlaveHub => "slave_hub",
            Identity::Manager => "manager",
            Identity::Ui => "ui",
            Identity::LocalBulkData => "local_bulk_data",
            Identity::RemoteBulkData => "remote_bulk_data",
            Identity::AuxService => "aux_service",
        }
    }

    /// `true` once the handshake has settled the role.
    pub fn is_classified(self) -> bool {
        !matches!(self, Identity::Unknown | Identity::Request)
    }

    /// Peers whose traffic counts as hub-to-hub for routing.
    pub fn is_hub(self) -> bool {
        matches!(self, Identity::Hub | Identity::SlaveHub)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
