//! Connection table.
//!
//! Every live transport endpoint is known here by its [`ConnId`] together with
//! the identity the handshake settled on. The table only holds the sender
//! half of each connection's write queue; the socket itself lives in the
//! connection's reader and writer tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::protocol::{Identity, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a connection's writer task is asked to do.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    /// Flush what is queued, then shut the socket down.
    Close,
}

pub type ConnTx = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
struct Connection {
    identity: Identity,
    peer: Option<SocketAddr>,
    /// Challenge we sent on accept, consumed by the reply.
    nonce: Option<String>,
    tx: ConnTx,
}

#[derive(Debug, Default)]
pub struct Connections {
    map: BTreeMap<ConnId, Connection>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: ConnId, identity: Identity, peer: Option<SocketAddr>, tx: ConnTx) {
        self.map.insert(
            conn,
            Connection {
                identity,
                peer,
                nonce: None,
                tx,
            },
        );
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.map.contains_key(&conn)
    }

    pub fn identity(&self, conn: ConnId) -> Option<Identity> {
        self.map.get(&conn).map(|c| c.identity)
    }

    pub fn peer(&self, conn: ConnId) -> Option<SocketAddr> {
        self.map.get(&conn).and_then(|c| c.peer)
    }

    /// Settle the identity of an unclassified connection. Returns `false` if
    /// the connection is unknown or already classified.
    pub fn classify(&mut self, conn: ConnId, identity: Identity) -> bool {
        match self.map.get_mut(&conn) {
            Some(c) if !c.identity.is_classified() => {
                c.identity = identity;
                true
            }
            _ => false,
        }
    }

    pub fn set_nonce(&mut self, conn: ConnId, nonce: String) {
        if let Some(c) = self.map.get_mut(&conn) {
            c.nonce = Some(nonce);
        }
    }

    pub fn take_nonce(&mut self, conn: ConnId) -> Option<String> {
        self.map.get_mut(&conn).and_then(|c| c.nonce.take())
    }

    /// Queue `msg` for `conn`. Never blocks; a dead writer shows up later as
    /// a close event for the connection.
    pub fn send(&self, conn: ConnId, msg: &Message) -> bool {
        match self.map.get(&conn) {
            Some(c) => c.tx.send(Outbound::Message(msg.clone())).is_ok(),
            None => false,
        }
    }

    pub fn close(&self, conn: ConnId) {
        if let Some(c) = self.map.get(&conn) {
            let _ = c.tx.send(Outbound::Close);
        }
    }

    /// Forget a connection. A second call for the same id returns `None`.
    pub fn remove(&mut self, conn: ConnId) -> Option<Identity> {
        self.map.remove(&conn).map(|c| c.identity)
    }

    pub fn with_identity(&self, identity: Identity) -> Vec<ConnId> {
        self.map
            .iter()
            .filter(|(_, c)| c.identity == identity)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message;

    fn conn(table: &mut Connections, id: u64, identity: Identity) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        table.insert(ConnId(id), identity, None, tx);
        rx
    }

    #[test]
    fn identity_is_set_once() {
        let mut table = Connections::new();
        let _rx = conn(&mut table, 1, Identity::Unknown);
        assert!(table.classify(ConnId(1), Identity::Ui));
        assert!(!table.classify(ConnId(1), Identity::Manager));
        assert_eq!(table.identity(ConnId(1)), Some(Identity::Ui));
        assert!(!table.classify(ConnId(9), Identity::Ui));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = Connections::new();
        let _rx = conn(&mut table, 1, Identity::Manager);
        assert_eq!(table.remove(ConnId(1)), Some(Identity::Manager));
        assert_eq!(table.remove(ConnId(1)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn send_queues_and_close_follows() {
        let mut table = Connections::new();
        let mut rx = conn(&mut table, 1, Identity::Ui);
        assert!(table.send(ConnId(1), &message::set_id(-9)));
        table.close(ConnId(1));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Message(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(!table.send(ConnId(2), &message::set_id(-9)));
    }

    #[test]
    fn nonce_is_consumed() {
        let mut table = Connections::new();
        let _rx = conn(&mut table, 1, Identity::Unknown);
        table.set_nonce(ConnId(1), "abc".into());
        assert_eq!(table.take_nonce(ConnId(1)).as_deref(), Some("abc"));
        assert_eq!(table.take_nonce(ConnId(1)), None);
    }

    #[test]
    fn lookup_by_identity() {
        let mut table = Connections::new();
        let _a = conn(&mut table, 1, Identity::Ui);
        let _b = conn(&mut table, 2, Identity::Manager);
        let _c = conn(&mut table, 3, Identity::Ui);
        assert_eq!(table.with_identity(Identity::Ui), vec![ConnId(1), ConnId(3)]);
    }
}
