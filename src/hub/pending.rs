//! Connect/Disconnect requests waiting for their ports.

use std::collections::VecDeque;

use tracing::debug;

use crate::protocol::{Body, Message, PeerId};

use super::HubCore;

/// FIFO of link requests whose ports the tracker does not know yet.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<Message>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn take(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.queue)
    }

    /// Drop every entry that references `module`. Returns how many went.
    pub fn forget_module(&mut self, module: PeerId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| match &m.body {
            Body::Connect(link) | Body::Disconnect(link) => !link.touches(module),
            _ => true,
        });
        before - self.queue.len()
    }
}

impl HubCore {
    /// Sweep the pending queue until a full pass applies nothing.
    pub(super) fn drain_pending(&mut self) {
        loop {
            let batch = self.pending.take();
            if batch.is_empty() {
                return;
            }
            let mut progress = false;
            for msg in batch {
                if self.state.handle_connect_or_disconnect(&msg) {
                    progress = true;
                    debug!(kind = ?msg.kind(), "pending link applied");
                    self.announce_link(msg);
                } else {
                    self.pending.push(msg);
                }
            }
            if !progress {
                return;
            }
        }
    }
}
