pub mod account;
pub mod branch;
pub mod extension;
pub mod value;

use parking_lot::Mutex;

pub use account::AccountNode;
pub use branch::BranchNode;
pub use extension::ExtensionNode;
pub use value::ValueNode;

use crate::ids::NodeKind;
use crate::types::Hash;

/// Validity of a node's cached hash.
///
/// `Unknown` marks a node whose hash was never computed (for example one
/// loaded through an encoding variant that does not carry hashes); for the
/// hashing pipeline it behaves like `Dirty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashStatus {
    Clean,
    Dirty,
    Unknown,
}

#[derive(Clone, Copy)]
struct CachedHash {
    status: HashStatus,
    hash: Hash,
}

/// A node's cached hash with interior mutability.
///
/// Hash handles update the cell while view handles may concurrently read it;
/// the cell's own lock makes each access atomic, the hash handle's exclusivity
/// keeps whole recomputation passes from interleaving.
pub struct HashCell {
    inner: Mutex<CachedHash>,
}

impl HashCell {
    pub fn with_status(status: HashStatus) -> Self {
        HashCell {
            inner: Mutex::new(CachedHash {
                status,
                hash: Hash::zero(),
            }),
        }
    }

    pub fn clean(hash: Hash) -> Self {
        HashCell {
            inner: Mutex::new(CachedHash {
                status: HashStatus::Clean,
                hash,
            }),
        }
    }

    pub fn get(&self) -> (HashStatus, Hash) {
        let cell = self.inner.lock();
        (cell.status, cell.hash)
    }

    pub fn status(&self) -> HashStatus {
        self.inner.lock().status
    }

    pub fn set_clean(&self, hash: Hash) {
        let mut cell = self.inner.lock();
        cell.status = HashStatus::Clean;
        cell.hash = hash;
    }

    pub fn mark_dirty(&self) {
        self.inner.lock().status = HashStatus::Dirty;
    }
}

impl PartialEq for HashCell {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl std::fmt::Debug for HashCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (status, hash) = self.get();
        write!(f, "{status:?}({hash:?})")
    }
}

/// State shared by all concrete node variants.
#[derive(Debug)]
pub struct NodeBase {
    frozen: bool,
    hash: HashCell,
}

impl NodeBase {
    /// A freshly created node: not frozen, hash not yet computed.
    pub fn new() -> Self {
        NodeBase {
            frozen: false,
            hash: HashCell::with_status(HashStatus::Dirty),
        }
    }

    pub fn with_hash(frozen: bool, hash: HashCell) -> Self {
        NodeBase { frozen, hash }
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    /// Marks the node immutable. The transition is one-way.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn hash_cell(&self) -> &HashCell {
        &self.hash
    }
}

impl Default for NodeBase {
    fn default() -> Self {
        NodeBase::new()
    }
}

impl PartialEq for NodeBase {
    fn eq(&self, other: &Self) -> bool {
        self.frozen == other.frozen && self.hash == other.hash
    }
}

/// A trie node. The empty node is a singleton with the reserved zero id; the
/// other four variants live in their per-kind stocks.
#[derive(Debug, PartialEq)]
pub enum Node {
    Empty,
    Branch(BranchNode),
    Extension(ExtensionNode),
    Account(AccountNode),
    Value(ValueNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Empty => NodeKind::Empty,
            Node::Branch(_) => NodeKind::Branch,
            Node::Extension(_) => NodeKind::Extension,
            Node::Account(_) => NodeKind::Account,
            Node::Value(_) => NodeKind::Value,
        }
    }

    pub fn base(&self) -> Option<&NodeBase> {
        match self {
            Node::Empty => None,
            Node::Branch(n) => Some(&n.base),
            Node::Extension(n) => Some(&n.base),
            Node::Account(n) => Some(&n.base),
            Node::Value(n) => Some(&n.base),
        }
    }

    fn base_mut(&mut self) -> Option<&mut NodeBase> {
        match self {
            Node::Empty => None,
            Node::Branch(n) => Some(&mut n.base),
            Node::Extension(n) => Some(&mut n.base),
            Node::Account(n) => Some(&mut n.base),
            Node::Value(n) => Some(&mut n.base),
        }
    }

    /// The empty node counts as frozen: it is structurally immutable and
    /// shared by construction.
    pub fn is_frozen(&self) -> bool {
        self.base().map_or(true, NodeBase::frozen)
    }

    pub fn freeze(&mut self) {
        if let Some(base) = self.base_mut() {
            base.freeze();
        }
    }

    pub fn mark_hash_dirty(&self) {
        if let Some(base) = self.base() {
            base.hash_cell().mark_dirty();
        }
    }

    /// The cached hash of the node, `None` for the empty node whose hash is a
    /// scheme-dependent constant.
    pub fn cached_hash(&self) -> Option<(HashStatus, Hash)> {
        self.base().map(|base| base.hash_cell().get())
    }

    pub fn set_hash_clean(&self, hash: Hash) {
        if let Some(base) = self.base() {
            base.hash_cell().set_clean(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_node_is_always_frozen() {
        let node = Node::Empty;
        assert!(node.is_frozen());
        assert_eq!(node.kind(), NodeKind::Empty);
        assert!(node.cached_hash().is_none());
    }

    #[test]
    fn freeze_is_one_way() {
        let mut node = Node::Value(ValueNode::new(
            crate::types::Key::zero(),
            crate::types::Value::repeat_byte(1),
            64,
        ));
        assert!(!node.is_frozen());
        node.freeze();
        assert!(node.is_frozen());
    }

    #[test]
    fn hash_cell_transitions() {
        let cell = HashCell::with_status(HashStatus::Unknown);
        assert_eq!(cell.status(), HashStatus::Unknown);
        cell.set_clean(Hash::repeat_byte(7));
        assert_eq!(cell.get(), (HashStatus::Clean, Hash::repeat_byte(7)));
        cell.mark_dirty();
        assert_eq!(cell.status(), HashStatus::Dirty);
        // the last clean hash is retained as scratch
        assert_eq!(cell.get().1, Hash::repeat_byte(7));
    }
}
