use parking_lot::Mutex;

use super::NodeBase;
use crate::ids::NodeRef;
use crate::types::{AccountInfo, Address, Hash};

#[derive(Clone, Copy, Debug)]
pub struct StorageHash {
    pub hash: Hash,
    pub dirty: bool,
}

/// The leaf for an account, optionally rooting a storage sub-trie.
#[derive(Debug)]
pub struct AccountNode {
    pub base: NodeBase,
    pub address: Address,
    pub info: AccountInfo,
    pub storage: NodeRef,
    /// The number of nibbles remaining below the account's position; only
    /// meaningful under suffix-length tracking.
    pub path_length: u8,
    storage_hash: Mutex<StorageHash>,
}

impl AccountNode {
    pub fn new(address: Address, info: AccountInfo, storage: NodeRef, path_length: u8) -> Self {
        AccountNode {
            base: NodeBase::new(),
            address,
            info,
            storage,
            path_length,
            storage_hash: Mutex::new(StorageHash {
                hash: Hash::zero(),
                dirty: true,
            }),
        }
    }

    pub fn from_parts(
        address: Address,
        info: AccountInfo,
        storage: NodeRef,
        path_length: u8,
        base: NodeBase,
    ) -> Self {
        AccountNode {
            base,
            address,
            info,
            storage,
            path_length,
            storage_hash: Mutex::new(StorageHash {
                hash: Hash::zero(),
                dirty: true,
            }),
        }
    }

    /// A mutable copy sharing the storage sub-trie, used when rewriting a
    /// frozen account.
    pub fn cow_with(&self, info: AccountInfo, storage: NodeRef, path_length: u8) -> AccountNode {
        AccountNode::new(self.address, info, storage, path_length)
    }

    pub fn set_storage(&mut self, storage: NodeRef) {
        self.storage = storage;
        self.storage_hash.get_mut().dirty = true;
    }

    pub fn mark_storage_hash_dirty(&self) {
        self.storage_hash.lock().dirty = true;
    }

    pub fn storage_hash(&self) -> &Mutex<StorageHash> {
        &self.storage_hash
    }
}

impl PartialEq for AccountNode {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
            && self.address == other.address
            && self.info == other.info
            && self.storage == other.storage
            && self.path_length == other.path_length
    }
}
