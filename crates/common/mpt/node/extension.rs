use parking_lot::Mutex;

use super::NodeBase;
use crate::ids::NodeRef;
use crate::nibbles::Nibbles;
use crate::types::Hash;

#[derive(Clone, Copy, Debug)]
pub struct NextHash {
    pub hash: Hash,
    pub dirty: bool,
    /// The successor's encoding is inlined into this node (Ethereum hashing).
    pub embedded: bool,
}

/// A shared path prefix of at least one nibble; the successor is always a
/// branch.
#[derive(Debug)]
pub struct ExtensionNode {
    pub base: NodeBase,
    pub path: Nibbles,
    pub next: NodeRef,
    next_hash: Mutex<NextHash>,
}

impl ExtensionNode {
    pub fn new(path: Nibbles, next: NodeRef) -> Self {
        debug_assert!(!path.is_empty());
        ExtensionNode {
            base: NodeBase::new(),
            path,
            next,
            next_hash: Mutex::new(NextHash {
                hash: Hash::zero(),
                dirty: true,
                embedded: false,
            }),
        }
    }

    pub fn from_parts(path: Nibbles, next: NodeRef, base: NodeBase) -> Self {
        ExtensionNode {
            base,
            path,
            next,
            next_hash: Mutex::new(NextHash {
                hash: Hash::zero(),
                dirty: true,
                embedded: false,
            }),
        }
    }

    pub fn set_next(&mut self, next: NodeRef) {
        self.next = next;
        self.next_hash.get_mut().dirty = true;
    }

    pub fn mark_next_hash_dirty(&self) {
        self.next_hash.lock().dirty = true;
    }

    pub fn next_hash(&self) -> &Mutex<NextHash> {
        &self.next_hash
    }
}

impl PartialEq for ExtensionNode {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.path == other.path && self.next == other.next
    }
}
