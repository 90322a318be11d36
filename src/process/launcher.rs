//! [`ProcessHost`] backed by `tokio::process`.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::HubError;
use crate::supervisor::bus::{BusHandle, HubEvent};

use super::{LaunchSpec, ProcessHandle, ProcessHost};

/// Starts real executables. Port reports go to the router through `events`.
pub struct TokioProcessHost {
    events: BusHandle,
}

impl TokioProcessHost {
    pub fn new(events: BusHandle) -> Self {
        Self { events }
    }
}

struct TokioChild {
    child: Child,
    pid: Option<u32>,
}

impl ProcessHandle for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(pid = ?self.pid, error = %e, "kill failed");
        }
    }
}

impl ProcessHost for TokioProcessHost {
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, HubError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        if spec.report_port {
            cmd.stdout(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            HubError::Process(format!("cannot start {} ({}): {e}", spec.role, spec.program.display()))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            let role = spec.role;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                match lines.next_line().await {
                    Ok(Some(line)) => match line.trim().parse::<u16>() {
                        Ok(port) => {
                            info!(%role, port, "child reported its port");
                            events.send(HubEvent::AuxPort(port)).await;
                        }
                        Err(_) => warn!(%role, %line, "child did not print a port"),
                    },
                    Ok(None) => warn!(%role, "child closed stdout before reporting a port"),
                    Err(e) => warn!(%role, error = %e, "reading child stdout failed"),
                }
                // Keep draining so the child never blocks on a full pipe.
                while let Ok(Some(_)) = lines.next_line().await {}
            });
        }

        Ok(Box::new(TokioChild { child, pid }))
    }
}
