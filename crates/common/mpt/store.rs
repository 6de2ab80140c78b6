use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::NodeCache;
use crate::config::{ForestConfig, Mode, MptConfig};
use crate::error::MptError;
use crate::ids::{NodeId, NodeKind, NodeRef};
use crate::node::{AccountNode, BranchNode, ExtensionNode, Node, ValueNode};
use crate::release::ReleaseCommand;
use crate::shared::Shared;
use crate::stock::Stock;
use crate::write_buffer::{WriteBuffer, WriteSink};

use crossbeam::channel::Sender;

/// The four per-kind object pools backing a forest.
pub struct StockSet {
    pub branches: Box<dyn Stock<BranchNode>>,
    pub extensions: Box<dyn Stock<ExtensionNode>>,
    pub accounts: Box<dyn Stock<AccountNode>>,
    pub values: Box<dyn Stock<ValueNode>>,
}

impl StockSet {
    pub fn load_node(&self, id: NodeId) -> Result<Node, MptError> {
        let index = id.index();
        match id.kind() {
            NodeKind::Empty => Ok(Node::Empty),
            NodeKind::Branch => Ok(Node::Branch(self.branches.get(index)?)),
            NodeKind::Extension => Ok(Node::Extension(self.extensions.get(index)?)),
            NodeKind::Account => Ok(Node::Account(self.accounts.get(index)?)),
            NodeKind::Value => Ok(Node::Value(self.values.get(index)?)),
        }
    }

    pub fn write_node(&self, id: NodeId, node: &Node) -> Result<(), MptError> {
        let index = id.index();
        match (id.kind(), node) {
            (NodeKind::Branch, Node::Branch(n)) => self.branches.set(index, n),
            (NodeKind::Extension, Node::Extension(n)) => self.extensions.set(index, n),
            (NodeKind::Account, Node::Account(n)) => self.accounts.set(index, n),
            (NodeKind::Value, Node::Value(n)) => self.values.set(index, n),
            (kind, node) => Err(MptError::Consistency(format!(
                "id of kind {kind} does not match {} node",
                node.kind()
            ))),
        }
    }

    pub fn delete_node(&self, id: NodeId) -> Result<(), MptError> {
        let index = id.index();
        match id.kind() {
            NodeKind::Empty => Err(MptError::Consistency(
                "attempt to delete the empty node".into(),
            )),
            NodeKind::Branch => self.branches.delete(index),
            NodeKind::Extension => self.extensions.delete(index),
            NodeKind::Account => self.accounts.delete(index),
            NodeKind::Value => self.values.delete(index),
        }
    }

    /// Flushes the pools in their fixed order.
    pub fn flush_each(&self) -> Vec<MptError> {
        [
            self.branches.flush(),
            self.extensions.flush(),
            self.accounts.flush(),
            self.values.flush(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect()
    }

    /// Closes the pools in their fixed order: branches, extensions,
    /// accounts, values.
    pub fn close_each(&self) -> Vec<MptError> {
        [
            self.branches.close(),
            self.extensions.close(),
            self.accounts.close(),
            self.values.close(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect()
    }
}

impl WriteSink for StockSet {
    fn write(&self, id: NodeId, node: &Node) -> Result<(), MptError> {
        self.write_node(id, node)
    }
}

/// The node manager: stocks, cache, and write buffer behind a single node
/// resolution and allocation interface.
pub struct NodeStore {
    pub config: MptConfig,
    pub mode: Mode,
    stocks: Arc<StockSet>,
    cache: NodeCache,
    buffer: WriteBuffer,
    release_tx: Mutex<Option<Sender<ReleaseCommand>>>,
    empty: Shared<Node>,
}

impl NodeStore {
    pub fn new(
        config: MptConfig,
        forest_config: &ForestConfig,
        stocks: Arc<StockSet>,
    ) -> Arc<NodeStore> {
        let buffer = WriteBuffer::new(
            Arc::clone(&stocks) as Arc<dyn WriteSink>,
            forest_config.write_buffer_channel_size,
        );
        Arc::new(NodeStore {
            config,
            mode: forest_config.mode,
            stocks,
            cache: NodeCache::new(forest_config.cache_capacity),
            buffer,
            release_tx: Mutex::new(None),
            empty: Shared::new(Node::Empty),
        })
    }

    pub fn set_release_sender(&self, tx: Sender<ReleaseCommand>) {
        *self.release_tx.lock() = Some(tx);
    }

    /// Drops the store's handle on the release queue so the worker's channel
    /// can disconnect; later releases run synchronously.
    pub fn clear_release_sender(&self) {
        *self.release_tx.lock() = None;
    }

    /// Resolves a node reference to its shared in-memory representation.
    ///
    /// Misses recover in-flight nodes from the write buffer before falling
    /// back to the stocks; the cache's pending-slot protocol serializes
    /// concurrent lookups of the same id, and an eviction caused by the
    /// insert is handed to the write buffer atomically (enlisted under the
    /// cache lock, submitted after it).
    pub fn get_node(&self, node_ref: NodeRef) -> Result<Shared<Node>, MptError> {
        if node_ref.is_empty() {
            return Ok(self.empty.clone());
        }
        let id = node_ref.id();
        if let Some(node) = self.cache.get(id) {
            return Ok(node);
        }
        let mut evicted = Vec::new();
        let (node, _present) = self.cache.get_or_set(
            id,
            || {
                if let Some(node) = self.buffer.cancel(id) {
                    return Ok(node);
                }
                Ok(Shared::new(self.stocks.load_node(id)?))
            },
            |victim_id, victim, dirty| {
                if dirty {
                    self.buffer.enlist(victim_id, victim);
                    evicted.push(victim_id);
                }
            },
        )?;
        for victim_id in evicted {
            self.buffer.submit(victim_id);
        }
        Ok(node)
    }

    /// Allocates an id for the node and makes it resident.
    pub fn create(&self, node: Node) -> Result<NodeRef, MptError> {
        let id = match &node {
            Node::Empty => {
                return Err(MptError::Consistency(
                    "the empty node cannot be allocated".into(),
                ))
            }
            Node::Branch(_) => NodeId::new(NodeKind::Branch, self.stocks.branches.reserve()?),
            Node::Extension(_) => {
                NodeId::new(NodeKind::Extension, self.stocks.extensions.reserve()?)
            }
            Node::Account(_) => NodeId::new(NodeKind::Account, self.stocks.accounts.reserve()?),
            Node::Value(_) => NodeId::new(NodeKind::Value, self.stocks.values.reserve()?),
        };
        let shared = Shared::new(node);
        shared.mark_dirty();
        let mut evicted = Vec::new();
        let (_, present) = self.cache.get_or_set(
            id,
            || Ok(shared),
            |victim_id, victim, dirty| {
                if dirty {
                    self.buffer.enlist(victim_id, victim);
                    evicted.push(victim_id);
                }
            },
        )?;
        debug_assert!(!present, "freshly reserved id {id} was already cached");
        for victim_id in evicted {
            self.buffer.submit(victim_id);
        }
        Ok(NodeRef::new(id))
    }

    /// Removes a node from cache, buffer, and stock. The node must already
    /// be unreachable from any root.
    pub fn drop_node(&self, node_ref: NodeRef) -> Result<(), MptError> {
        if node_ref.is_empty() {
            return Err(MptError::Consistency(
                "attempt to release the empty node".into(),
            ));
        }
        let id = node_ref.id();
        self.cache.remove(id);
        self.buffer.cancel(id);
        self.stocks.delete_node(id)
    }

    /// Queues a whole subtree for deletion. Only live forests release;
    /// archive forests keep every frozen version.
    pub fn schedule_release_subtree(&self, node_ref: NodeRef) -> Result<(), MptError> {
        self.schedule(ReleaseCommand::Subtree(node_ref), node_ref)
    }

    /// Queues a single bypassed node for deletion, leaving its children to
    /// their new parent.
    pub fn schedule_release_single(&self, node_ref: NodeRef) -> Result<(), MptError> {
        self.schedule(ReleaseCommand::Single(node_ref), node_ref)
    }

    fn schedule(&self, command: ReleaseCommand, node_ref: NodeRef) -> Result<(), MptError> {
        if self.mode != Mode::Mutable {
            return Ok(());
        }
        if node_ref.is_empty() {
            return Err(MptError::Consistency(
                "attempt to release the empty node".into(),
            ));
        }
        let tx = self.release_tx.lock().as_ref().cloned();
        match tx {
            Some(tx) => tx
                .send(command)
                .map_err(|_| MptError::Shutdown("release worker is gone".into())),
            None => match command {
                ReleaseCommand::Subtree(node) => crate::release::release_subtree_now(self, node),
                ReleaseCommand::Single(node) => self.drop_node(node),
                ReleaseCommand::Sync(_) => Ok(()),
            },
        }
    }

    /// Marks a subtree immutable, bottom-up. Frozen subtrees are skipped,
    /// keeping repeated freezes cheap.
    pub fn freeze(&self, node_ref: NodeRef) -> Result<(), MptError> {
        if node_ref.is_empty() {
            return Ok(());
        }
        let node = self.get_node(node_ref)?;
        let mut guard = node.write();
        if guard.is_frozen() {
            return Ok(());
        }
        let children: Vec<NodeRef> = match &*guard {
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
        };
        for child in children {
            self.freeze(child)?;
        }
        match &mut *guard {
            Node::Branch(branch) => {
                branch.base.freeze();
                branch.mark_all_children_frozen();
            }
            other => other.freeze(),
        }
        drop(guard);
        node.mark_dirty();
        Ok(())
    }

    /// Persists every dirty resident node, drains the write buffer, and
    /// flushes the stocks. Collected errors are returned, not swallowed.
    pub fn flush(&self) -> Vec<MptError> {
        let mut errors = Vec::new();
        for (id, node) in self.cache.snapshot() {
            if !node.is_dirty() {
                continue;
            }
            loop {
                match node.try_hash() {
                    Some(guard) => {
                        match self.stocks.write_node(id, &guard) {
                            Ok(()) => node.mark_clean(),
                            Err(err) => errors.push(err),
                        }
                        break;
                    }
                    None => std::thread::yield_now(),
                }
            }
        }
        self.buffer.flush();
        errors.extend(self.buffer.collect_worker_errors());
        errors.extend(self.stocks.flush_each());
        errors
    }

    /// Shuts the write buffer down and closes the stocks in order.
    pub fn close(&self) -> Vec<MptError> {
        let mut errors = self.flush();
        self.buffer.close();
        errors.extend(self.buffer.collect_worker_errors());
        errors.extend(self.stocks.close_each());
        errors
    }
}
