//! Child-process bookkeeping.
//!
//! Every process the hub starts is tracked with its [`ProcessRole`]. The
//! router task polls [`ProcessTable::reap`] on a fixed tick; exit status is
//! only ever observed as "still running or not".

mod launcher;

pub use launcher::TokioProcessHost;

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::HubError;
use crate::protocol::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Manager,
    Cleaner,
    GuiFrontend,
    Debugger,
    AuxService,
    Module(PeerId),
}

impl ProcessRole {
    /// Detached viewers the hub may exit without.
    pub fn is_detachable(self) -> bool {
        matches!(self, ProcessRole::GuiFrontend | ProcessRole::AuxService)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Manager => f.write_str("manager"),
            ProcessRole::Cleaner => f.write_str("cleaner"),
            ProcessRole::GuiFrontend => f.write_str("gui"),
            ProcessRole::Debugger => f.write_str("debugger"),
            ProcessRole::AuxService => f.write_str("aux-relay"),
            ProcessRole::Module(id) => write!(f, "module:{id}"),
        }
    }
}

/// What to start and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub role: ProcessRole,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Read the first stdout line as the port the process listens on.
    pub report_port: bool,
}

impl LaunchSpec {
    pub fn new(role: ProcessRole, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            role,
            program: program.into(),
            args,
            report_port: false,
        }
    }
}

pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn is_running(&mut self) -> bool;
    fn kill(&mut self);
}

pub trait ProcessHost: Send {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, HubError>;
}

struct Tracked {
    role: ProcessRole,
    handle: Box<dyn ProcessHandle>,
}

/// Owns every launched child. Never exposes the handles themselves.
pub struct ProcessTable {
    host: Box<dyn ProcessHost>,
    children: Vec<Tracked>,
}

impl ProcessTable {
    pub fn new(host: Box<dyn ProcessHost>) -> Self {
        Self {
            host,
            children: Vec::new(),
        }
    }

    /// Start a process and track it under its role.
    pub fn launch(&mut self, spec: LaunchSpec) -> Result<Option<u32>, HubError> {
        let handle = self.host.launch(&spec)?;
        let pid = handle.pid();
        debug!(role = %spec.role, program = %spec.program.display(), ?pid, "process launched");
        self.children.push(Tracked {
            role: spec.role,
            handle,
        });
        Ok(pid)
    }

    /// Drop exited children and return their roles in launch order.
    pub fn reap(&mut self) -> Vec<ProcessRole> {
        let mut exited = Vec::new();
        self.children.retain_mut(|child| {
            if child.handle.is_running() {
                true
            } else {
                exited.push(child.role);
                false
            }
        });
        exited
    }

    pub fn has_children(&self, ignore_detachable: bool) -> bool {
        self.children
            .iter()
            .any(|c| !ignore_detachable || !c.role.is_detachable())
    }

    pub fn pid_of(&self, role: ProcessRole) -> Option<u32> {
        self.children
            .iter()
            .find(|c| c.role == role)
            .and_then(|c| c.handle.pid())
    }

    pub fn is_tracked(&self, role: ProcessRole) -> bool {
        self.children.iter().any(|c| c.role == role)
    }

    pub fn kill(&mut self, role: ProcessRole) {
        for child in self.children.iter_mut().filter(|c| c.role == role) {
            child.handle.kill();
        }
    }

    pub fn kill_all(&mut self, include_detachable: bool) {
        for child in &mut self.children {
            if include_detachable || !child.role.is_detachable() {
                warn!(role = %child.role, pid = ?child.handle.pid(), "killing child process");
                child.handle.kill();
            }
        }
    }

    pub fn list(&self) -> Vec<(ProcessRole, Option<u32>)> {
        self.children.iter().map(|c| (c.role, c.handle.pid())).collect()
    }
}

// ── fake host ─────────────────────────────────────────────────────────────────

pub mod fake {
    //! Scriptable [`ProcessHost`] for tests: nothing is executed.

    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Shared {
        launched: Vec<LaunchSpec>,
        dead: Vec<ProcessRole>,
        killed: Vec<ProcessRole>,
        refuse: Vec<ProcessRole>,
    }

    /// Records launches; processes run until [`FakeHost::exit`] is called.
    #[derive(Clone, Default)]
    pub struct FakeHost {
        shared: Arc<Mutex<Shared>>,
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn launched(&self) -> Vec<LaunchSpec> {
            self.shared.lock().map(|s| s.launched.clone()).unwrap_or_default()
        }

        pub fn killed(&self) -> Vec<ProcessRole> {
            self.shared.lock().map(|s| s.killed.clone()).unwrap_or_default()
        }

        /// Make every process with `role` report as exited.
        pub fn exit(&self, role: ProcessRole) {
            if let Ok(mut s) = self.shared.lock() {
                s.dead.push(role);
            }
        }

        /// Fail future launches of `role`.
        pub fn refuse(&self, role: ProcessRole) {
            if let Ok(mut s) = self.shared.lock() {
                s.refuse.push(role);
            }
        }
    }

    struct FakeHandle {
        role: ProcessRole,
        pid: u32,
        shared: Arc<Mutex<Shared>>,
    }

    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn is_running(&mut self) -> bool {
            self.shared
                .lock()
                .map(|s| !s.dead.contains(&self.role))
                .unwrap_or(false)
        }

        fn kill(&mut self) {
            if let Ok(mut s) = self.shared.lock() {
                s.killed.push(self.role);
                s.dead.push(self.role);
            }
        }
    }

    impl ProcessHost for FakeHost {
        fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, HubError> {
            let mut s = self
                .shared
                .lock()
                .map_err(|_| HubError::Process("fake host poisoned".into()))?;
            if s.refuse.contains(&spec.role) {
                return Err(HubError::Process(format!("refused to launch {}", spec.role)));
            }
            s.dead.retain(|r| *r != spec.role);
            s.launched.push(spec.clone());
            let pid = 1000 + s.launched.len() as u32;
            Ok(Box::new(FakeHandle {
                role: spec.role,
                pid,
                shared: self.shared.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeHost;
    use super::*;

    fn table() -> (ProcessTable, FakeHost) {
        let host = FakeHost::new();
        (ProcessTable::new(Box::new(host.clone())), host)
    }

    #[test]
    fn reap_returns_exited_roles_once() {
        let (mut table, host) = table();
        table.launch(LaunchSpec::new(ProcessRole::Manager, "mgr", vec![])).unwrap();
        table.launch(LaunchSpec::new(ProcessRole::Module(3), "mod", vec![])).unwrap();
        assert!(table.reap().is_empty());

        host.exit(ProcessRole::Module(3));
        assert_eq!(table.reap(), vec![ProcessRole::Module(3)]);
        assert!(table.reap().is_empty());
        assert!(table.is_tracked(ProcessRole::Manager));
    }

    #[test]
    fn detachable_children_can_be_ignored() {
        let (mut table, _host) = table();
        table.launch(LaunchSpec::new(ProcessRole::GuiFrontend, "gui", vec![])).unwrap();
        table.launch(LaunchSpec::new(ProcessRole::AuxService, "relay", vec![])).unwrap();
        assert!(table.has_children(false));
        assert!(!table.has_children(true));
    }

    #[test]
    fn launch_failure_is_not_tracked() {
        let (mut table, host) = table();
        host.refuse(ProcessRole::Debugger);
        assert!(table.launch(LaunchSpec::new(ProcessRole::Debugger, "gdb", vec![])).is_err());
        assert!(!table.has_children(false));
    }

    #[test]
    fn kill_all_spares_detachable_unless_asked() {
        let (mut table, host) = table();
        table.launch(LaunchSpec::new(ProcessRole::Manager, "mgr", vec![])).unwrap();
        table.launch(LaunchSpec::new(ProcessRole::GuiFrontend, "gui", vec![])).unwrap();
        table.kill_all(false);
        assert_eq!(host.killed(), vec![ProcessRole::Manager]);
        assert_eq!(table.reap(), vec![ProcessRole::Manager]);
    }

    #[test]
    fn pid_lookup_by_role() {
        let (mut table, _host) = table();
        let pid = table.launch(LaunchSpec::new(ProcessRole::Module(7), "mod", vec![])).unwrap();
        assert_eq!(table.pid_of(ProcessRole::Module(7)), pid);
        assert_eq!(table.pid_of(ProcessRole::Module(8)), None);
    }
}
