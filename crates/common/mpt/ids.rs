use std::fmt;

/// The kind tag of a node, also the discriminant of its on-disk pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    Empty = 0,
    Branch = 1,
    Extension = 2,
    Account = 3,
    Value = 4,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Empty => "empty",
            NodeKind::Branch => "branch",
            NodeKind::Extension => "extension",
            NodeKind::Account => "account",
            NodeKind::Value => "value",
        };
        f.write_str(name)
    }
}

const INDEX_BITS: u32 = 56;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// A forest-wide node identifier packing the kind tag into the top byte and
/// a pool-dense 56-bit index into the rest. The empty node owns the reserved
/// all-zero id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub const EMPTY: NodeId = NodeId(0);

    pub fn new(kind: NodeKind, index: u64) -> Self {
        debug_assert!(index <= INDEX_MASK);
        NodeId((kind as u64) << INDEX_BITS | (index & INDEX_MASK))
    }

    pub fn kind(&self) -> NodeKind {
        match self.0 >> INDEX_BITS {
            0 => NodeKind::Empty,
            1 => NodeKind::Branch,
            2 => NodeKind::Extension,
            3 => NodeKind::Account,
            _ => NodeKind::Value,
        }
    }

    pub fn index(&self) -> u64 {
        self.0 & INDEX_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.kind() == NodeKind::Empty
    }

    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        NodeId(bits)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind() {
            NodeKind::Empty => "E",
            NodeKind::Branch => "B",
            NodeKind::Extension => "X",
            NodeKind::Account => "A",
            NodeKind::Value => "V",
        };
        write!(f, "{tag}-{}", self.index())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A weak logical reference to a node: naming, not ownership. Ownership of
/// node payloads lives with the forest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NodeRef {
    id: NodeId,
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::EMPTY
    }
}

impl NodeRef {
    pub const EMPTY: NodeRef = NodeRef { id: NodeId::EMPTY };

    pub fn new(id: NodeId) -> Self {
        NodeRef { id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.id.kind()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
