//! Management transport adapters.
//!
//! Adapters translate an external I/O protocol into [`ControlHandle`] calls.

pub mod uds;

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::supervisor::control::ControlHandle;

/// Start every enabled management adapter.
pub fn start(control: ControlHandle, socket_path: PathBuf, shutdown: CancellationToken) {
    uds::start(control, socket_path, shutdown);
}
