//! Management control plane.
//!
//! Kept apart from the event bus: transport adapters (the Unix socket) send
//! [`ControlCommand`]s through a [`ControlHandle`] and the router task answers
//! between events, so status reads always see a consistent hub.

use std::{error::Error, fmt};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::hub::{HubStatus, ProcessInfo, Slave};

/// Commands understood by the management socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    Status,
    Slaves,
    Processes,
    /// Same as an interrupt: orderly shutdown of the whole pipeline.
    Quit,
}

#[derive(Debug, Clone, Serialize)]
pub enum ControlResponse {
    Status {
        uptime_ms: u64,
        #[serde(flatten)]
        hub: HubStatus,
    },
    Slaves { slaves: Vec<Slave> },
    Processes { processes: Vec<ProcessInfo> },
    Ack { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlError {
    Invalid { message: String },
    Unavailable { message: String },
}

pub type ControlResult = Result<ControlResponse, ControlError>;

#[derive(Debug)]
pub enum ControlMessage {
    Request {
        command: ControlCommand,
        reply_tx: oneshot::Sender<ControlResult>,
    },
    Notification {
        command: ControlCommand,
    },
}

/// Client-facing handle for the control plane.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { tx }
    }

    pub async fn request(&self, command: ControlCommand) -> Result<ControlResult, ControlCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlMessage::Request { command, reply_tx })
            .await
            .map_err(|_| ControlCallError::Send)?;

        reply_rx.await.map_err(|_| ControlCallError::Recv)
    }

    pub fn notify(&self, command: ControlCommand) -> Result<(), ControlCallError> {
        self.tx
            .try_send(ControlMessage::Notification { command })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ControlCallError::Full,
                mpsc::error::TrySendError::Closed(_) => ControlCallError::Send,
            })
    }
}

/// Owns the router-side control receiver.
pub struct SupervisorControl {
    pub rx: mpsc::Receiver<ControlMessage>,
    pub handle: ControlHandle,
}

impl SupervisorControl {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            rx,
            handle: ControlHandle::new(tx),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ControlCallError {
    Send,
    Recv,
    Full,
}

impl fmt::Display for ControlCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCallError::Send => write!(f, "control send failed: hub is not running"),
            ControlCallError::Recv => write!(f, "control recv failed: hub dropped reply sender"),
            ControlCallError::Full => write!(f, "control queue full"),
        }
    }
}

impl Error for ControlCallError {}

/// Wire-format response envelope for socket transports.
///
/// Serialises as `{"ok": <response>}` or `{"err": <error>}`.
#[derive(Debug, Serialize)]
pub enum WireResponse {
    #[serde(rename = "ok")]
    Ok(ControlResponse),
    #[serde(rename = "err")]
    Err(ControlError),
}

impl From<ControlResult> for WireResponse {
    fn from(r: ControlResult) -> Self {
        match r {
            Ok(resp) => WireResponse::Ok(resp),
            Err(err) => WireResponse::Err(err),
        }
    }
}
