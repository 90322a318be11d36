//! Slave table and address resolution.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::protocol::{PeerId, id};
use crate::state::StateTracker;

use super::connections::ConnId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slave {
    pub id: PeerId,
    pub name: String,
    /// `None` once the connection dropped; the record stays until removed.
    #[serde(skip)]
    pub conn: Option<ConnId>,
    pub ready: bool,
}

/// Slave hubs known to a master. Ids only ever go down from `MASTER_HUB`.
#[derive(Debug, Default)]
pub struct Topology {
    slaves: BTreeMap<PeerId, Slave>,
    count: PeerId,
    /// Slaves that still wait for their id because we are not ready yet.
    deferred: Vec<PeerId>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new, not yet ready slave and return its id.
    pub fn add_slave(&mut self, name: impl Into<String>, conn: ConnId) -> PeerId {
        self.count += 1;
        let id = id::MASTER_HUB - self.count;
        self.slaves.insert(
            id,
            Slave {
                id,
                name: name.into(),
                conn: Some(conn),
                ready: false,
            },
        );
        id
    }

    pub fn defer(&mut self, id: PeerId) {
        self.deferred.push(id);
    }

    pub fn take_deferred(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.deferred)
    }

    pub fn slave(&self, id: PeerId) -> Option<&Slave> {
        self.slaves.get(&id)
    }

    pub fn conn_of(&self, id: PeerId) -> Option<ConnId> {
        self.slaves.get(&id).and_then(|s| s.conn)
    }

    pub fn slave_by_conn(&self, conn: ConnId) -> Option<PeerId> {
        self.slaves
            .values()
            .find(|s| s.conn == Some(conn))
            .map(|s| s.id)
    }

    /// Connections of every ready, connected slave, by id.
    pub fn ready_slaves(&self) -> Vec<(PeerId, ConnId)> {
        self.slaves
            .values()
            .filter(|s| s.ready)
            .filter_map(|s| s.conn.map(|c| (s.id, c)))
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.ready_slaves().len()
    }

    /// Replay state to a slave, then let it take part in broadcasts.
    ///
    /// `replay` runs before the flag flips so nothing broadcast in between
    /// can overtake the snapshot. Returns `false` for unknown, detached or
    /// already ready slaves.
    pub fn mark_ready(&mut self, id: PeerId, replay: impl FnOnce(ConnId)) -> bool {
        let Some(slave) = self.slaves.get_mut(&id) else {
            return false;
        };
        let Some(conn) = slave.conn else {
            return false;
        };
        if slave.ready {
            return false;
        }
        replay(conn);
        slave.ready = true;
        true
    }

    /// Connection lost: keep the slave as an address-only record.
    pub fn detach(&mut self, conn: ConnId) -> Option<PeerId> {
        let slave = self.slaves.values_mut().find(|s| s.conn == Some(conn))?;
        slave.conn = None;
        slave.ready = false;
        Some(slave.id)
    }

    /// Drop a slave record. A second call for the same id returns `None`.
    pub fn remove(&mut self, id: PeerId) -> Option<Slave> {
        self.deferred.retain(|d| *d != id);
        self.slaves.remove(&id)
    }

    pub fn list(&self) -> Vec<Slave> {
        self.slaves.values().cloned().collect()
    }

    /// Map any address to the hub that owns it, or `INVALID`.
    pub fn resolve(&self, target: PeerId, hub_id: PeerId, state: &dyn StateTracker) -> PeerId {
        if id::is_module(target) {
            return state.hub_of(target);
        }
        if target == id::LOCAL_HUB || target == id::LOCAL_MANAGER {
            return hub_id;
        }
        if !id::is_hub(target) {
            return id::INVALID;
        }
        if target == hub_id || target == id::MASTER_HUB || self.slaves.contains_key(&target) {
            return target;
        }
        state.hub_of(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Body, Message, Spawn};
    use crate::state::MemoryState;

    #[test]
    fn slave_ids_strictly_decrease() {
        let mut topo = Topology::new();
        let ids: Vec<_> = (0..4).map(|i| topo.add_slave(format!("n{i}"), ConnId(i))).collect();
        assert_eq!(ids, vec![-9, -10, -11, -12]);
        topo.remove(-10);
        assert_eq!(topo.add_slave("n5", ConnId(5)), -13);
    }

    #[test]
    fn unready_slaves_are_excluded() {
        let mut topo = Topology::new();
        let a = topo.add_slave("a", ConnId(1));
        let _b = topo.add_slave("b", ConnId(2));
        assert!(topo.ready_slaves().is_empty());

        let mut replayed = None;
        assert!(topo.mark_ready(a, |c| replayed = Some(c)));
        assert_eq!(replayed, Some(ConnId(1)));
        assert_eq!(topo.ready_slaves(), vec![(a, ConnId(1))]);
        assert!(!topo.mark_ready(a, |_| panic!("replayed twice")));
    }

    #[test]
    fn detached_slave_keeps_its_record() {
        let mut topo = Topology::new();
        let a = topo.add_slave("a", ConnId(1));
        topo.mark_ready(a, |_| {});
        assert_eq!(topo.detach(ConnId(1)), Some(a));
        assert_eq!(topo.detach(ConnId(1)), None);
        assert!(topo.slave(a).is_some());
        assert_eq!(topo.ready_count(), 0);
        assert!(topo.remove(a).is_some());
        assert!(topo.remove(a).is_none());
    }

    #[test]
    fn resolve_never_fails() {
        let mut topo = Topology::new();
        let mut state = MemoryState::new();
        let s = topo.add_slave("a", ConnId(1));
        let mut spawn = Spawn::new(s, "Gendat");
        spawn.spawn_id = 4;
        state.handle(&Message::new(Body::Spawn(spawn)), true);

        let hub = id::MASTER_HUB;
        assert_eq!(topo.resolve(4, hub, &state), s);
        assert_eq!(topo.resolve(5, hub, &state), id::INVALID);
        assert_eq!(topo.resolve(id::LOCAL_MANAGER, hub, &state), hub);
        assert_eq!(topo.resolve(s, hub, &state), s);
        assert_eq!(topo.resolve(-42, hub, &state), id::INVALID);
        assert_eq!(topo.resolve(id::BROADCAST, hub, &state), id::INVALID);
    }
}
