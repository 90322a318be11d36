//! Addressed control messages exchanged between hubs, managers and UIs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::id::{self, Identity, PeerId};

/// A routed control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub sender_id: PeerId,
    pub dest_id: PeerId,
    /// Announcement of something that already happened, as opposed to a request.
    #[serde(default)]
    pub notification: bool,
    pub body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            sender_id: id::INVALID,
            dest_id: id::INVALID,
            notification: false,
            body,
        }
    }

    pub fn from_peer(mut self, sender: PeerId) -> Self {
        self.sender_id = sender;
        self
    }

    pub fn to_peer(mut self, dest: PeerId) -> Self {
        self.dest_id = dest;
        self
    }

    pub fn notify(mut self) -> Self {
        self.notification = true;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextLevel {
    Info,
    Warning,
    Error,
}

/// How a spawn relates to an existing module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum SpawnReference {
    #[default]
    None,
    /// Restart `from` in place, keeping parameters and connections.
    Migrate { from: PeerId },
    /// New instance seeded with the parameter values of `from`.
    Clone { from: PeerId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spawn {
    pub hub_id: PeerId,
    pub name: String,
    /// `INVALID` until the master assigns one.
    #[serde(default)]
    pub spawn_id: PeerId,
    /// Primary module this instance mirrors, `INVALID` for primaries.
    #[serde(default)]
    pub mirroring_id: PeerId,
    /// Ask for one mirror on every other hub with a UI attached.
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub reference: SpawnReference,
}

impl Spawn {
    pub fn new(hub_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            hub_id,
            name: name.into(),
            spawn_id: id::INVALID,
            mirroring_id: id::INVALID,
            mirror: false,
            reference: SpawnReference::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubInfo {
    pub id: PeerId,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub has_ui: bool,
}

/// Internal link of a compound module, by sub-module index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundLink {
    pub from: usize,
    pub from_port: String,
    pub to: usize,
    pub to_port: String,
}

/// Port of a compound module that forwards to a sub-module port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedPort {
    pub port: String,
    pub submodule: usize,
    pub inner_port: String,
}

/// Spawn descriptor a manager announces for a module it can start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableModule {
    pub hub_id: PeerId,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub submodules: Vec<String>,
    #[serde(default)]
    pub links: Vec<CompoundLink>,
    #[serde(default)]
    pub exports: Vec<ExportedPort>,
}

impl AvailableModule {
    pub fn is_compound(&self) -> bool {
        !self.submodules.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Input,
    Output,
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub module: PeerId,
    pub name: String,
    pub kind: PortKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub module: PeerId,
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

/// Directed link from `module_a:port_a` to `module_b:port_b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortLink {
    pub module_a: PeerId,
    pub port_a: String,
    pub module_b: PeerId,
    pub port_b: String,
}

impl PortLink {
    pub fn new(
        module_a: PeerId,
        port_a: impl Into<String>,
        module_b: PeerId,
        port_b: impl Into<String>,
    ) -> Self {
        Self {
            module_a,
            port_a: port_a.into(),
            module_b,
            port_b: port_b.into(),
        }
    }

    pub fn touches(&self, module: PeerId) -> bool {
        self.module_a == module || self.module_b == module
    }
}

/// Message payloads, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    Identify {
        identity: Identity,
        #[serde(default)]
        name: String,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        mac: String,
    },
    SetId { id: PeerId },
    AddHub(HubInfo),
    RemoveHub { id: PeerId },
    Spawn(Spawn),
    SpawnPrepared(Spawn),
    Started { name: String },
    ModuleExit,
    Kill { module: PeerId },
    ModuleAvailable(AvailableModule),
    AddPort(Port),
    RemovePort(Port),
    AddParameter(Parameter),
    SetParameter(Parameter),
    Connect(PortLink),
    Disconnect(PortLink),
    Barrier,
    BarrierReached { barrier: Uuid },
    Quit { id: PeerId },
    CloseConnection { reason: String },
    SendText { level: TextLevel, text: String },
    UpdateStatus { text: String },
    Debug { module: PeerId },
    Cover {
        mirror_id: PeerId,
        #[serde(default)]
        payload: Value,
    },
    Execute { module: PeerId },
    LockUi { locked: bool },
    LoadWorkflow { path: String, execute: bool },
}

/// Payload-free tag of a [`Body`], used to key routing and handler tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Identify,
    SetId,
    AddHub,
    RemoveHub,
    Spawn,
    SpawnPrepared,
    Started,
    ModuleExit,
    Kill,
    ModuleAvailable,
    AddPort,
    RemovePort,
    AddParameter,
    SetParameter,
    Connect,
    Disconnect,
    Barrier,
    BarrierReached,
    Quit,
    CloseConnection,
    SendText,
    UpdateStatus,
    Debug,
    Cover,
    Execute,
    LockUi,
    LoadWorkflow,
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Identify { .. } => MessageKind::Identify,
            Body::SetId { .. } => MessageKind::SetId,
            Body::AddHub(_) => MessageKind::AddHub,
            Body::RemoveHub { .. } => MessageKind::RemoveHub,
            Body::Spawn(_) => MessageKind::Spawn,
            Body::SpawnPrepared(_) => MessageKind::SpawnPrepared,
            Body::Started { .. } => MessageKind::Started,
            Body::ModuleExit => MessageKind::ModuleExit,
            Body::Kill { .. } => MessageKind::Kill,
            Body::ModuleAvailable(_) => MessageKind::ModuleAvailable,
            Body::AddPort(_) => MessageKind::AddPort,
            Body::RemovePort(_) => MessageKind::RemovePort,
            Body::AddParameter(_) => MessageKind::AddParameter,
            Body::SetParameter(_) => MessageKind::SetParameter,
            Body::Connect(_) => MessageKind::Connect,
            Body::Disconnect(_) => MessageKind::Disconnect,
            Body::Barrier => MessageKind::Barrier,
            Body::BarrierReached { .. } => MessageKind::BarrierReached,
            Body::Quit { .. } => MessageKind::Quit,
            Body::CloseConnection { .. } => MessageKind::CloseConnection,
            Body::SendText { .. } => MessageKind::SendText,
            Body::UpdateStatus { .. } => MessageKind::UpdateStatus,
            Body::Debug { .. } => MessageKind::Debug,
            Body::Cover { .. } => MessageKind::Cover,
            Body::Execute { .. } => MessageKind::Execute,
            Body::LockUi { .. } => MessageKind::LockUi,
            Body::LoadWorkflow { .. } => MessageKind::LoadWorkflow,
        }
    }
}

impl MessageKind {
    pub const ALL: [MessageKind; 27] = [
        MessageKind::Identify,
        MessageKind::SetId,
        MessageKind::AddHub,
        MessageKind::RemoveHub,
        MessageKind::Spawn,
        MessageKind::SpawnPrepared,
        MessageKind::Started,
        MessageKind::ModuleExit,
        MessageKind::Kill,
        MessageKind::ModuleAvailable,
        MessageKind::AddPort,
        MessageKind::RemovePort,
        MessageKind::AddParameter,
        MessageKind::SetParameter,
        MessageKind::Connect,
        MessageKind::Disconnect,
        MessageKind::Barrier,
        MessageKind::BarrierReached,
        MessageKind::Quit,
        MessageKind::CloseConnection,
        MessageKind::SendText,
        MessageKind::UpdateStatus,
        MessageKind::Debug,
        MessageKind::Cover,
        MessageKind::Execute,
        MessageKind::LockUi,
        MessageKind::LoadWorkflow,
    ];
}

// ── constructors ──────────────────────────────────────────────────────────────

pub fn set_id(id: PeerId) -> Message {
    Message::new(Body::SetId { id })
}

pub fn close_connection(reason: impl Into<String>) -> Message {
    Message::new(Body::CloseConnection {
        reason: reason.into(),
    })
}

pub fn text(level: TextLevel, text: impl Into<String>) -> Message {
    Message::new(Body::SendText {
        level,
        text: text.into(),
    })
}

pub fn kill(module: PeerId) -> Message {
    Message::new(Body::Kill { module }).to_peer(module)
}

pub fn quit(id: PeerId) -> Message {
    Message::new(Body::Quit { id })
}

pub fn module_exit(module: PeerId) -> Message {
    Message::new(Body::ModuleExit).from_peer(module)
}

pub fn connect(link: PortLink) -> Message {
    Message::new(Body::Connect(link))
}

pub fn disconnect(link: PortLink) -> Message {
    Message::new(Body::Disconnect(link))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_tag_is_snake_case_kind() {
        let msg = Message::new(Body::SetId { id: -9 });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"]["kind"], "set_id");
        assert_eq!(json["body"]["id"], -9);
    }

    #[test]
    fn spawn_defaults_fill_missing_fields() {
        let json = r#"{"uuid":"6f1c0f1e-4c52-4a0b-9d0f-2d5d7c1f0a11","sender_id":-5,"dest_id":-8,
            "body":{"kind":"spawn","hub_id":-8,"name":"Gendat"}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        let Body::Spawn(spawn) = msg.body else {
            panic!("expected spawn");
        };
        assert_eq!(spawn.spawn_id, id::INVALID);
        assert_eq!(spawn.mirroring_id, id::INVALID);
        assert_eq!(spawn.reference, SpawnReference::None);
        assert!(!msg.notification);
    }

    #[test]
    fn migrate_reference_carries_source() {
        let mut spawn = Spawn::new(-9, "Color");
        spawn.reference = SpawnReference::Migrate { from: 10 };
        let json = serde_json::to_string(&Body::Spawn(spawn.clone())).unwrap();
        let back: Body = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Body::Spawn(spawn));
    }

    #[test]
    fn unit_variants_parse() {
        let body: Body = serde_json::from_str(r#"{"kind":"module_exit"}"#).unwrap();
        assert_eq!(body.kind(), MessageKind::ModuleExit);
        let body: Body = serde_json::from_str(r#"{"kind":"barrier"}"#).unwrap();
        assert_eq!(body.kind(), MessageKind::Barrier);
    }

    #[test]
    fn kill_addresses_the_module() {
        let msg = kill(12);
        assert_eq!(msg.dest_id, 12);
        assert_eq!(msg.kind(), MessageKind::Kill);
    }

    #[test]
    fn port_link_touches_both_ends() {
        let link = PortLink::new(3, "out", 4, "in");
        assert!(link.touches(3));
        assert!(link.touches(4));
        assert!(!link.touches(5));
    }
}
