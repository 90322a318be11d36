//! Workflow state as seen by the hub.
//!
//! The hub never owns the authoritative workflow model; it feeds routed
//! messages into a [`StateTracker`] and asks it questions (which hub owns a
//! module, which ports exist, what to replay to a newcomer). [`MemoryState`]
//! is the in-process implementation used by the binary and the tests.

mod memory;

pub use memory::MemoryState;

use crate::protocol::{
    Message, PeerId,
    message::{AvailableModule, HubInfo, Parameter, Port, PortKind, PortLink},
};

/// Lifecycle of a module as far as the tracker knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Never announced, or already gone.
    Unknown,
    /// Announced by a spawn notification, not yet reported ready.
    Spawning,
    Running,
}

impl ModuleState {
    pub fn is_alive(self) -> bool {
        !matches!(self, ModuleState::Unknown)
    }
}

pub trait StateTracker: Send {
    /// Apply a routed message. Returns `true` if it changed or confirmed state.
    /// With `track == false` the message is only observed and nothing is recorded.
    fn handle(&mut self, msg: &Message, track: bool) -> bool;

    /// Apply a Connect/Disconnect if both endpoints exist.
    fn handle_connect_or_disconnect(&mut self, msg: &Message) -> bool;

    /// Messages that rebuild the current state on a fresh peer, in order.
    fn snapshot(&self) -> Vec<Message>;

    /// Owning hub of a module, a known hub itself, or `INVALID`.
    fn hub_of(&self, id: PeerId) -> PeerId;

    fn hubs(&self) -> Vec<PeerId>;

    fn hub_info(&self, id: PeerId) -> Option<HubInfo>;

    fn is_hub_quitting(&self, id: PeerId) -> bool;

    /// Primary of the mirror group `id` belongs to, `id` itself for primaries.
    fn mirror_of(&self, id: PeerId) -> PeerId;

    /// Every member of the mirror group of `id`, primary included.
    fn mirrors(&self, id: PeerId) -> Vec<PeerId>;

    fn module_state(&self, id: PeerId) -> ModuleState;

    fn module_name(&self, id: PeerId) -> Option<String>;

    fn running_modules(&self) -> Vec<PeerId>;

    /// Current parameter values of a module, in declaration order.
    fn parameters(&self, module: PeerId) -> Vec<Parameter>;

    fn port_kind(&self, module: PeerId, name: &str) -> Option<PortKind>;

    fn ports(&self, module: PeerId) -> Vec<Port>;

    /// Links ending at the module's inputs, in creation order.
    fn input_links(&self, module: PeerId) -> Vec<PortLink>;

    /// Links leaving the module's outputs, in creation order.
    fn output_links(&self, module: PeerId) -> Vec<PortLink>;

    fn available(&self, hub: PeerId, name: &str) -> Option<AvailableModule>;

    /// Static descriptor of a spawned module, looked up by its name and hub.
    fn module_descriptor(&self, id: PeerId) -> Option<AvailableModule> {
        let name = self.module_name(id)?;
        self.available(self.hub_of(id), &name)
    }
}
