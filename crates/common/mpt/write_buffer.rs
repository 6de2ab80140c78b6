use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::MptError;
use crate::ids::NodeId;
use crate::node::Node;
use crate::shared::Shared;

/// The consumer side of the write buffer: persists one encoded node.
pub trait WriteSink: Send + Sync + 'static {
    fn write(&self, id: NodeId, node: &Node) -> Result<(), MptError>;
}

/// An asynchronous queue of dirty nodes evicted from the cache, on their way
/// to the stocks.
///
/// A node enters through [`WriteBuffer::enlist`] (called while the cache
/// lock is held, making the cache→buffer transition atomic) followed by
/// [`WriteBuffer::submit`] (a possibly blocking channel send, after the lock
/// is dropped). While enlisted, the buffer owns the node's persistence
/// responsibility; [`WriteBuffer::cancel`] reclaims it for the cache-miss
/// recovery path.
///
/// The background worker only ever try-acquires node hash handles and
/// retries locked entries, so a mutator holding a write handle while the
/// channel is full cannot deadlock the pipeline.
pub struct WriteBuffer {
    state: Arc<BufferState>,
    tx: Mutex<Option<Sender<NodeId>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct BufferState {
    pending: Mutex<HashMap<NodeId, Shared<Node>>>,
    errors: Mutex<Vec<MptError>>,
    sink: Arc<dyn WriteSink>,
}

impl WriteBuffer {
    pub fn new(sink: Arc<dyn WriteSink>, channel_size: usize) -> Self {
        let state = Arc::new(BufferState {
            pending: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            sink,
        });
        let (tx, rx) = bounded(channel_size.max(1));
        let worker_state = Arc::clone(&state);
        let worker = std::thread::Builder::new()
            .name("mpt-write-buffer".into())
            .spawn(move || worker_loop(worker_state, rx))
            .expect("cannot spawn write buffer worker");
        WriteBuffer {
            state,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Registers a node as owned by the buffer. Safe to call under the cache
    /// lock: only the buffer's entry lock is taken, nothing blocks.
    pub fn enlist(&self, id: NodeId, node: Shared<Node>) {
        self.state.pending.lock().insert(id, node);
    }

    /// Queues an enlisted id for the background worker, blocking while the
    /// channel is full. Must not be called with the cache lock held.
    pub fn submit(&self, id: NodeId) {
        let tx = self.tx.lock().as_ref().cloned();
        match tx {
            Some(tx) => {
                if tx.send(id).is_err() {
                    // buffer already shut down; write synchronously
                    self.state.process(id);
                }
            }
            None => {
                self.state.process(id);
            }
        }
    }

    pub fn add(&self, id: NodeId, node: Shared<Node>) {
        self.enlist(id, node);
        self.submit(id);
    }

    /// Atomically reclaims a node that was evicted but not yet written.
    /// Returns `None` when the id is not (or no longer) owned by the buffer.
    pub fn cancel(&self, id: NodeId) -> Option<Shared<Node>> {
        self.state.pending.lock().remove(&id)
    }

    /// Synchronously writes out everything currently enlisted.
    pub fn flush(&self) {
        loop {
            let ids: Vec<NodeId> = self.state.pending.lock().keys().copied().collect();
            if ids.is_empty() {
                return;
            }
            for id in ids {
                while !self.state.process(id) {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Drains the queue, stops the worker, and flushes any leftovers.
    pub fn close(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                self.state
                    .errors
                    .lock()
                    .push(MptError::Shutdown("write buffer worker panicked".into()));
            }
        }
        self.flush();
    }

    /// Errors collected by the background worker since the last call.
    pub fn collect_worker_errors(&self) -> Vec<MptError> {
        std::mem::take(&mut *self.state.errors.lock())
    }
}

impl BufferState {
    /// Attempts to persist one enlisted node. Returns false when the node's
    /// hash handle is currently unavailable and the caller should retry.
    fn process(&self, id: NodeId) -> bool {
        let node = match self.pending.lock().get(&id) {
            Some(node) => node.clone(),
            // cancelled or already written
            None => return true,
        };
        let Some(guard) = node.try_hash() else {
            return false;
        };
        let result = self.sink.write(id, &guard);
        if result.is_ok() {
            node.mark_clean();
        }
        drop(guard);
        match result {
            Ok(()) => {
                let mut pending = self.pending.lock();
                if let Some(current) = pending.get(&id) {
                    // Only un-enlist the exact entry that was written and
                    // only while it is still clean; a re-evicted or
                    // re-dirtied node keeps its entry for the next pass.
                    if Shared::ptr_eq(current, &node) && !node.is_dirty() {
                        pending.remove(&id);
                    }
                }
            }
            Err(err) => {
                error!(%id, %err, "write buffer failed to persist node");
                self.pending.lock().remove(&id);
                self.errors.lock().push(err);
            }
        }
        true
    }
}

fn worker_loop(state: Arc<BufferState>, rx: Receiver<NodeId>) {
    debug!("write buffer worker started");
    let mut retry: VecDeque<NodeId> = VecDeque::new();
    loop {
        for _ in 0..retry.len() {
            let id = retry.pop_front().expect("non-empty retry queue");
            if !state.process(id) {
                retry.push_back(id);
            }
        }
        let received = if retry.is_empty() {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(Duration::from_millis(1))
        };
        match received {
            Ok(id) => {
                if !state.process(id) {
                    retry.push_back(id);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // drain whatever is still queued for retry
    while let Some(id) = retry.pop_front() {
        if !state.process(id) {
            retry.push_back(id);
            std::thread::yield_now();
        }
    }
    debug!("write buffer worker stopped");
}
