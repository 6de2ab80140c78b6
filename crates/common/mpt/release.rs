use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::MptError;
use crate::ids::NodeRef;
use crate::node::Node;
use crate::store::NodeStore;

/// Capacity of the release queue; producers are mutation paths, the single
/// consumer is the worker below.
const RELEASE_QUEUE_SIZE: usize = 1 << 12;

pub enum ReleaseCommand {
    /// Recursively release a whole subtree.
    Subtree(NodeRef),
    /// Release a single node whose children were re-attached elsewhere.
    Single(NodeRef),
    /// Rendezvous: reply once every previously queued command is done.
    Sync(Sender<()>),
}

/// The background worker deleting unreachable nodes.
///
/// Commands are processed in order, so a `Sync` rendezvous after a mutation
/// guarantees all its scheduled deletions have reached the stocks.
pub struct ReleaseWorker {
    tx: Mutex<Option<Sender<ReleaseCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    errors: Arc<Mutex<Vec<MptError>>>,
}

impl ReleaseWorker {
    pub fn spawn(store: Arc<NodeStore>) -> Self {
        let (tx, rx) = bounded(RELEASE_QUEUE_SIZE);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let worker_errors = Arc::clone(&errors);
        let worker = std::thread::Builder::new()
            .name("mpt-release".into())
            .spawn(move || worker_loop(store, rx, worker_errors))
            .expect("cannot spawn release worker");
        ReleaseWorker {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            errors,
        }
    }

    pub fn sender(&self) -> Option<Sender<ReleaseCommand>> {
        self.tx.lock().as_ref().cloned()
    }

    /// Waits until every command queued so far has been processed.
    pub fn sync(&self) {
        let tx = self.tx.lock().as_ref().cloned();
        if let Some(tx) = tx {
            let (ack_tx, ack_rx) = bounded(1);
            if tx.send(ReleaseCommand::Sync(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }
    }

    /// Stops the worker after draining the queue.
    pub fn close(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                self.errors
                    .lock()
                    .push(MptError::Shutdown("release worker panicked".into()));
            }
        }
    }

    pub fn collect_release_worker_errors(&self) -> Vec<MptError> {
        std::mem::take(&mut *self.errors.lock())
    }
}

fn worker_loop(store: Arc<NodeStore>, rx: Receiver<ReleaseCommand>, errors: Arc<Mutex<Vec<MptError>>>) {
    debug!("release worker started");
    while let Ok(command) = rx.recv() {
        let result = match command {
            ReleaseCommand::Subtree(node) => release_subtree_now(&store, node),
            ReleaseCommand::Single(node) => store.drop_node(node),
            ReleaseCommand::Sync(ack) => {
                let _ = ack.send(());
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(%err, "release worker failed");
            errors.lock().push(err);
        }
    }
    debug!("release worker stopped");
}

/// Deletes a subtree bottom-up: children first, then the node itself.
pub(crate) fn release_subtree_now(store: &NodeStore, node_ref: NodeRef) -> Result<(), MptError> {
    if node_ref.is_empty() {
        return Err(MptError::Consistency(
            "attempt to release the empty node".into(),
        ));
    }
    let node = store.get_node(node_ref)?;
    let children: Vec<NodeRef> = {
        let guard = node.read();
        if guard.is_frozen() {
            return Err(MptError::Consistency(format!(
                "attempt to release frozen node {}",
                node_ref.id()
            )));
        }
        match &*guard {
            Node::Empty => Vec::new(),
            Node::Branch(branch) => branch
                .children
                .iter()
                .filter(|child| !child.is_empty())
                .copied()
                .collect(),
            Node::Extension(ext) => vec![ext.next],
            Node::Account(account) => {
                if account.storage.is_empty() {
                    Vec::new()
                } else {
                    vec![account.storage]
                }
            }
            Node::Value(_) => Vec::new(),
        }
    };
    for child in children {
        release_subtree_now(store, child)?;
    }
    store.drop_node(node_ref)
}
