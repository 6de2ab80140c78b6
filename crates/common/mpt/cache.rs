use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

use crate::error::MptError;
use crate::ids::NodeId;
use crate::node::Node;
use crate::shared::Shared;

const NIL: usize = usize::MAX;

/// A bounded cache mapping node ids to shared node wrappers with
/// least-recently-used eviction.
///
/// `get_or_set` is atomic per id: concurrent callers observe exactly one
/// factory invocation, losers wait on a condition variable for the winner's
/// slot to fill. The factory runs outside the cache lock; an in-flight load
/// is visible as a pending slot that eviction skips.
///
/// Evictions are reported through a callback invoked while the cache lock is
/// still held, which is the synchronization point for handing dirty victims
/// to the write buffer (enlist under this lock, submit after it).
pub struct NodeCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    filled: Condvar,
}

struct CacheInner {
    map: HashMap<NodeId, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Most recently used entry.
    head: usize,
    /// Least recently used entry, the eviction candidate.
    tail: usize,
    ready: usize,
}

struct Slot {
    id: NodeId,
    state: SlotState,
    prev: usize,
    next: usize,
}

enum SlotState {
    /// A factory is running for this id; the slot is not in the LRU list.
    Pending,
    Ready(Shared<Node>),
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        NodeCache {
            capacity,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                ready: 0,
            }),
            filled: Condvar::new(),
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner.lock().ready
    }

    /// Looks up an id, waiting out a concurrent load of the same id.
    pub fn get(&self, id: NodeId) -> Option<Shared<Node>> {
        let mut inner = self.inner.lock();
        loop {
            match inner.probe(id) {
                Probe::Missing => return None,
                Probe::Ready(node, idx) => {
                    inner.promote(idx);
                    return Some(node);
                }
                Probe::Pending => self.filled.wait(&mut inner),
            }
        }
    }

    /// Returns the cached node for `id`, invoking `load` to produce it on a
    /// miss. The boolean reports whether the entry already existed. Evicted
    /// entries are passed to `on_evict` (victim id, node, dirty flag) while
    /// the cache lock is held.
    pub fn get_or_set<L, E>(
        &self,
        id: NodeId,
        load: L,
        mut on_evict: E,
    ) -> Result<(Shared<Node>, bool), MptError>
    where
        L: FnOnce() -> Result<Shared<Node>, MptError>,
        E: FnMut(NodeId, Shared<Node>, bool),
    {
        let idx;
        {
            let mut inner = self.inner.lock();
            loop {
                match inner.probe(id) {
                    Probe::Missing => break,
                    Probe::Ready(node, idx) => {
                        inner.promote(idx);
                        return Ok((node, true));
                    }
                    Probe::Pending => self.filled.wait(&mut inner),
                }
            }
            idx = inner.alloc_slot(id, SlotState::Pending);
            inner.map.insert(id, idx);
        }

        let node = match load() {
            Ok(node) => node,
            Err(err) => {
                let mut inner = self.inner.lock();
                inner.map.remove(&id);
                inner.release_slot(idx);
                self.filled.notify_all();
                return Err(err);
            }
        };

        let mut inner = self.inner.lock();
        inner.slots[idx].state = SlotState::Ready(node.clone());
        inner.push_front(idx);
        inner.ready += 1;
        while inner.ready > self.capacity {
            let victim = inner.tail;
            if victim == NIL || victim == idx {
                break;
            }
            let victim_id = inner.slots[victim].id;
            inner.detach(victim);
            inner.map.remove(&victim_id);
            let state = std::mem::replace(&mut inner.slots[victim].state, SlotState::Pending);
            inner.release_slot(victim);
            inner.ready -= 1;
            if let SlotState::Ready(victim_node) = state {
                let dirty = victim_node.is_dirty();
                on_evict(victim_id, victim_node, dirty);
            }
        }
        self.filled.notify_all();
        drop(inner);
        Ok((node, false))
    }

    /// Refreshes the LRU position of `id` without touching node handles.
    #[allow(dead_code)]
    pub fn touch(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.map.get(&id).copied() {
            if matches!(inner.slots[idx].state, SlotState::Ready(_)) {
                inner.promote(idx);
            }
        }
    }

    /// Removes an entry, returning its node. Pending loads are left alone.
    pub fn remove(&self, id: NodeId) -> Option<Shared<Node>> {
        let mut inner = self.inner.lock();
        let idx = inner.map.get(&id).copied()?;
        if !matches!(inner.slots[idx].state, SlotState::Ready(_)) {
            return None;
        }
        inner.map.remove(&id);
        inner.detach(idx);
        let state = std::mem::replace(&mut inner.slots[idx].state, SlotState::Pending);
        inner.release_slot(idx);
        inner.ready -= 1;
        match state {
            SlotState::Ready(node) => Some(node),
            SlotState::Pending => None,
        }
    }

    /// A point-in-time copy of all resident entries, for flushing.
    pub fn snapshot(&self) -> Vec<(NodeId, Shared<Node>)> {
        let inner = self.inner.lock();
        inner
            .map
            .iter()
            .filter_map(|(id, &idx)| match &inner.slots[idx].state {
                SlotState::Ready(node) => Some((*id, node.clone())),
                SlotState::Pending => None,
            })
            .collect()
    }
}

enum Probe {
    Missing,
    Ready(Shared<Node>, usize),
    Pending,
}

impl CacheInner {
    fn probe(&self, id: NodeId) -> Probe {
        match self.map.get(&id).copied() {
            None => Probe::Missing,
            Some(idx) => match &self.slots[idx].state {
                SlotState::Ready(node) => Probe::Ready(node.clone(), idx),
                SlotState::Pending => Probe::Pending,
            },
        }
    }

    fn alloc_slot(&mut self, id: NodeId, state: SlotState) -> usize {
        let slot = Slot {
            id,
            state,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn release_slot(&mut self, idx: usize) {
        self.slots[idx].state = SlotState::Pending;
        self.free.push(idx);
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn promote(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }
}
