//! Cluster-wide barrier bookkeeping.
//!
//! At most one barrier is active per hub. Participants are counted when the
//! barrier starts; a participant that disappears before reaching it is no
//! longer waited for.

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::HubError;
use crate::protocol::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Waiting,
    Released,
    /// Duplicate or unknown participant; nothing changed.
    Ignored,
}

#[derive(Debug)]
struct Active {
    uuid: Uuid,
    expected: usize,
    reached: HashSet<PeerId>,
    left: HashSet<PeerId>,
}

#[derive(Debug, Default)]
pub struct Barrier {
    active: Option<Active>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.uuid)
    }

    pub fn reached_count(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.reached.len())
    }

    pub fn begin(&mut self, uuid: Uuid, participants: usize) -> Result<(), HubError> {
        if let Some(active) = &self.active {
            return Err(HubError::Protocol(format!(
                "barrier {uuid} requested while barrier {} is active",
                active.uuid
            )));
        }
        self.active = Some(Active {
            uuid,
            expected: participants,
            reached: HashSet::new(),
            left: HashSet::new(),
        });
        Ok(())
    }

    pub fn reach(&mut self, uuid: Uuid, who: PeerId) -> Result<Progress, HubError> {
        let Some(active) = self.active.as_mut() else {
            return Err(HubError::Protocol(format!("barrier {uuid} reached but none is active")));
        };
        if active.uuid != uuid {
            return Err(HubError::Protocol(format!(
                "barrier {uuid} reached while barrier {} is active",
                active.uuid
            )));
        }
        if !active.reached.insert(who) {
            return Ok(Progress::Ignored);
        }
        Ok(self.check())
    }

    /// A participant went away. Stop waiting for it unless it already reached.
    pub fn participant_left(&mut self, who: PeerId) -> Progress {
        let Some(active) = self.active.as_mut() else {
            return Progress::Ignored;
        };
        if active.reached.contains(&who) || !active.left.insert(who) {
            return Progress::Ignored;
        }
        active.expected = active.expected.saturating_sub(1);
        self.check()
    }

    pub fn reset(&mut self) {
        self.active = None;
    }

    fn check(&mut self) -> Progress {
        match &self.active {
            Some(a) if a.reached.len() >= a.expected => {
                self.active = None;
                Progress::Released
            }
            Some(_) => Progress::Waiting,
            None => Progress::Ignored,
        }
    }
}
