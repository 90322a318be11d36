//! UI input gate: while locked, messages from UI clients are held back.

use std::collections::VecDeque;

use crate::protocol::Message;

use super::connections::ConnId;

#[derive(Debug)]
pub struct UiGate {
    locked: bool,
    held: VecDeque<(ConnId, Message)>,
}

impl UiGate {
    /// Gates start locked; the hub unlocks once it is ready.
    pub fn new() -> Self {
        Self {
            locked: true,
            held: VecDeque::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Unlock and hand back everything held, oldest first.
    pub fn unlock(&mut self) -> Vec<(ConnId, Message)> {
        self.locked = false;
        self.held.drain(..).collect()
    }

    pub fn hold(&mut self, conn: ConnId, msg: Message) {
        self.held.push_back((conn, msg));
    }

    /// Discard held input from a client that went away.
    pub fn forget(&mut self, conn: ConnId) {
        self.held.retain(|(c, _)| *c != conn);
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }
}

impl Default for UiGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message;

    #[test]
    fn unlock_flushes_in_order() {
        let mut gate = UiGate::new();
        assert!(gate.is_locked());
        gate.hold(ConnId(1), message::set_id(1));
        gate.hold(ConnId(2), message::set_id(2));
        gate.hold(ConnId(1), message::set_id(3));
        gate.forget(ConnId(2));
        let flushed = gate.unlock();
        assert!(!gate.is_locked());
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[1].1.body, message::set_id(3).body);
        assert_eq!(gate.held(), 0);
    }
}
