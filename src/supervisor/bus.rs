//! Inbound event bus: everything the router task reacts to.
//!
//! Connection actors, the listener, dialers and the process host all post
//! [`HubEvent`]s here. The router task is the only consumer, so events from
//! one connection are seen in the order that connection produced them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::hub::connections::{ConnId, ConnTx};
use crate::protocol::{Identity, Message, PeerId};

/// Why an outbound connection was dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPurpose {
    /// Slave joining its master.
    Master,
    /// Per-module link to the collaborative-viewer relay.
    AuxRelay { module: PeerId },
}

#[derive(Debug)]
pub enum HubEvent {
    Accepted {
        conn: ConnId,
        peer: SocketAddr,
        tx: ConnTx,
    },
    Connected {
        conn: ConnId,
        identity: Identity,
        purpose: DialPurpose,
        tx: ConnTx,
    },
    DialFailed {
        purpose: DialPurpose,
        error: String,
    },
    Inbound {
        conn: ConnId,
        message: Message,
    },
    Closed {
        conn: ConnId,
        reason: String,
    },
    /// The relay process printed the port it listens on.
    AuxPort(u16),
}

/// Cloneable sender side of the bus.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<HubEvent>,
    next_conn: Arc<AtomicU64>,
}

impl BusHandle {
    pub async fn send(&self, event: HubEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn try_send(&self, event: HubEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }
}

/// Owns the router-side receiver.
pub struct HubBus {
    pub rx: mpsc::Receiver<HubEvent>,
    pub handle: BusHandle,
}

impl HubBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            rx,
            handle: BusHandle {
                tx,
                next_conn: Arc::new(AtomicU64::new(1)),
            },
        }
    }
}
