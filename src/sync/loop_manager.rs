//! Loop bookkeeping.
//!
//! Tracks every loop recorder of a session by node id and which of them is
//! the master loop. The master slot itself is the [`MasterLoop`] shared with
//! every loop processor and the sync playhead.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::{commands::NodeId, graph::GraphError};
use crate::modules::loop_state::{LoopShared, LoopTrigger, MasterLoop};

/// Registry of a session's loops.
pub struct LoopManager {
    loops: BTreeMap<NodeId, Arc<LoopShared>>,
    master: Arc<MasterLoop>,
}

impl LoopManager {
    pub fn new(master: Arc<MasterLoop>) -> Self {
        Self {
            loops: BTreeMap::new(),
            master,
        }
    }

    /// The master slot shared with processors and the playhead.
    pub fn master_slot(&self) -> &Arc<MasterLoop> {
        &self.master
    }

    pub fn register(&mut self, id: NodeId, shared: Arc<LoopShared>) {
        self.loops.insert(id, shared);
    }

    /// Forgets a loop. Clears the master slot if the loop was the master.
    pub fn unregister(&mut self, id: NodeId) -> Option<Arc<LoopShared>> {
        let shared = self.loops.remove(&id)?;
        if self.master.is(&shared) {
            self.master.set(None);
            tracing::info!(node = id, "master loop removed");
        }
        Some(shared)
    }

    pub fn clear(&mut self) {
        self.loops.clear();
        self.master.set(None);
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<LoopShared>> {
        self.loops.get(&id)
    }

    /// Registered loop ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.loops.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Makes the loop `id` the master, or clears the master with `None`.
    pub fn set_master(&mut self, id: Option<NodeId>) -> Result<(), GraphError> {
        match id {
            Some(id) => {
                let shared = self.loops.get(&id).ok_or(GraphError::NotALoop(id))?;
                self.master.set(Some(Arc::clone(shared)));
                tracing::info!(node = id, "master loop set");
            }
            None => self.master.set(None),
        }
        Ok(())
    }

    /// Node id of the current master loop.
    pub fn master_id(&self) -> Option<NodeId> {
        self.loops
            .iter()
            .find(|(_, shared)| self.master.is(shared))
            .map(|(&id, _)| id)
    }

    /// Posts `trigger` to every registered loop.
    pub fn trigger_all(&self, trigger: LoopTrigger) {
        for shared in self.loops.values() {
            shared.request(trigger);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LoopManager {
        LoopManager::new(Arc::new(MasterLoop::new()))
    }

    #[test]
    fn test_set_master() {
        let mut loops = manager();
        let shared = Arc::new(LoopShared::new());
        loops.register(4, Arc::clone(&shared));

        loops.set_master(Some(4)).unwrap();
        assert_eq!(loops.master_id(), Some(4));
        assert!(loops.master_slot().is(&shared));

        loops.set_master(None).unwrap();
        assert_eq!(loops.master_id(), None);
    }

    #[test]
    fn test_set_master_unknown_loop() {
        let mut loops = manager();
        assert!(matches!(
            loops.set_master(Some(9)),
            Err(GraphError::NotALoop(9))
        ));
    }

    #[test]
    fn test_unregister_master_clears_slot() {
        let mut loops = manager();
        loops.register(1, Arc::new(LoopShared::new()));
        loops.register(2, Arc::new(LoopShared::new()));
        loops.set_master(Some(2)).unwrap();

        assert!(loops.unregister(1).is_some());
        assert_eq!(loops.master_id(), Some(2));

        assert!(loops.unregister(2).is_some());
        assert!(loops.master_slot().get().is_none());
        assert!(loops.unregister(2).is_none());
        assert_eq!(loops.ids().collect::<Vec<_>>(), Vec::<NodeId>::new());
    }

    #[test]
    fn test_trigger_all() {
        let mut loops = manager();
        let a = Arc::new(LoopShared::new());
        let b = Arc::new(LoopShared::new());
        loops.register(1, Arc::clone(&a));
        loops.register(2, Arc::clone(&b));

        loops.trigger_all(LoopTrigger::Clear);
        assert_eq!(a.take_request(), Some(LoopTrigger::Clear));
        assert_eq!(b.take_request(), Some(LoopTrigger::Clear));
    }
}
