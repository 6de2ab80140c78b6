use arbor_rlp::constants::RLP_NULL;
use arbor_rlp::encode::RLPEncode;
use arbor_rlp::structs::Encoder;
use ethereum_types::U256;
use lazy_static::lazy_static;
use sha3::{Digest, Keccak256};

use crate::config::Hashing;
use crate::error::MptError;
use crate::ids::{NodeId, NodeRef};
use crate::node::{HashStatus, Node};
use crate::store::NodeStore;
use crate::types::Hash;

lazy_static! {
    /// Hash of an empty trie under Ethereum hashing, keccak(RLP("")).
    pub static ref EMPTY_TRIE_HASH: Hash = keccak256(&[RLP_NULL]);
}

pub(crate) fn keccak256(data: &[u8]) -> Hash {
    Hash::from_slice(Keccak256::new().chain_update(data).finalize().as_slice())
}

/// The hash of an empty subtree under the given scheme.
pub(crate) fn empty_hash(hashing: Hashing) -> Hash {
    match hashing {
        Hashing::DirectHashing => Hash::zero(),
        Hashing::EthereumLikeHashing => *EMPTY_TRIE_HASH,
    }
}

/// Recomputes every dirty hash below `root` in post order and returns the
/// root hash along with the `(id, hash)` pairs that were refreshed. The hint
/// list is what an archive needs to restore hashes without recomputation.
pub(crate) fn update_hashes(
    store: &NodeStore,
    root: NodeRef,
) -> Result<(Hash, Vec<(NodeId, Hash)>), MptError> {
    let mut hints = Vec::new();
    let hash = match store.config.hashing {
        Hashing::DirectHashing => direct_update(store, root, &mut hints)?,
        Hashing::EthereumLikeHashing => eth_node(store, root, &mut hints)?.0,
    };
    Ok((hash, hints))
}

/// Returns the hash of `node_ref`, recomputing only when the cached value is
/// not clean.
pub(crate) fn get_hash(store: &NodeStore, node_ref: NodeRef) -> Result<Hash, MptError> {
    if node_ref.is_empty() {
        return Ok(empty_hash(store.config.hashing));
    }
    {
        let node = store.get_node(node_ref)?;
        let guard = node.view();
        if let Some((HashStatus::Clean, hash)) = guard.cached_hash() {
            return Ok(hash);
        }
    }
    Ok(update_hashes(store, node_ref)?.0)
}

/// Installs precomputed hashes, marking the nodes clean. Used to restore an
/// archive without re-hashing it.
pub(crate) fn set_hashes(store: &NodeStore, hashes: &[(NodeId, Hash)]) -> Result<(), MptError> {
    for (id, hash) in hashes {
        let node = store.get_node(crate::ids::NodeRef::new(*id))?;
        let guard = node.hash();
        guard.set_hash_clean(*hash);
        drop(guard);
        node.mark_dirty();
    }
    Ok(())
}

// --- direct hashing ---------------------------------------------------------

const TAG_BRANCH: u8 = 1;
const TAG_EXTENSION: u8 = 2;
const TAG_ACCOUNT: u8 = 3;
const TAG_VALUE: u8 = 4;

fn direct_update(
    store: &NodeStore,
    node_ref: NodeRef,
    hints: &mut Vec<(NodeId, Hash)>,
) -> Result<Hash, MptError> {
    if node_ref.is_empty() {
        return Ok(Hash::zero());
    }
    let node = store.get_node(node_ref)?;
    let guard = node.hash();
    if let Some((HashStatus::Clean, hash)) = guard.cached_hash() {
        return Ok(hash);
    }
    let hash = match &*guard {
        Node::Empty => return Ok(Hash::zero()),
        Node::Branch(branch) => {
            let dirty = branch.hashes().lock().dirty;
            let mut refreshed = Vec::new();
            for i in 0..16usize {
                if dirty & (1 << i) != 0 {
                    refreshed.push((i, direct_update(store, branch.child(i), hints)?));
                }
            }
            let mut cells = branch.hashes().lock();
            for (i, child_hash) in refreshed {
                cells.child_hashes[i] = child_hash;
                cells.dirty &= !(1 << i);
            }
            let mut buf = Vec::with_capacity(1 + 16 * 32);
            buf.push(TAG_BRANCH);
            for i in 0..16usize {
                if branch.child(i).is_empty() {
                    buf.extend_from_slice(Hash::zero().as_bytes());
                } else {
                    buf.extend_from_slice(cells.child_hashes[i].as_bytes());
                }
            }
            keccak256(&buf)
        }
        Node::Extension(ext) => {
            let next_hash = {
                let cell = ext.next_hash().lock();
                if cell.dirty {
                    None
                } else {
                    Some(cell.hash)
                }
            };
            let next_hash = match next_hash {
                Some(hash) => hash,
                None => {
                    let hash = direct_update(store, ext.next, hints)?;
                    let mut cell = ext.next_hash().lock();
                    cell.hash = hash;
                    cell.dirty = false;
                    hash
                }
            };
            let mut buf = Vec::with_capacity(2 + 64 + 32);
            buf.push(TAG_EXTENSION);
            buf.push(ext.path.len() as u8);
            buf.extend_from_slice(ext.path.as_slice());
            buf.extend_from_slice(next_hash.as_bytes());
            keccak256(&buf)
        }
        Node::Account(account) => {
            let storage_root = {
                let cell = account.storage_hash().lock();
                if cell.dirty {
                    None
                } else {
                    Some(cell.hash)
                }
            };
            let storage_root = match storage_root {
                Some(hash) => hash,
                None => {
                    let hash = direct_update(store, account.storage, hints)?;
                    let mut cell = account.storage_hash().lock();
                    cell.hash = hash;
                    cell.dirty = false;
                    hash
                }
            };
            let mut buf = Vec::with_capacity(1 + 20 + 8 + 16 + 32 + 32);
            buf.push(TAG_ACCOUNT);
            buf.extend_from_slice(account.address.as_bytes());
            buf.extend_from_slice(&account.info.nonce.to_be_bytes());
            buf.extend_from_slice(&account.info.balance.to_be_bytes());
            buf.extend_from_slice(account.info.code_hash.as_bytes());
            buf.extend_from_slice(storage_root.as_bytes());
            keccak256(&buf)
        }
        Node::Value(value) => {
            let mut buf = Vec::with_capacity(1 + 32 + 32);
            buf.push(TAG_VALUE);
            buf.extend_from_slice(value.key.as_bytes());
            buf.extend_from_slice(value.value.as_bytes());
            keccak256(&buf)
        }
    };
    guard.set_hash_clean(hash);
    hints.push((node_ref.id(), hash));
    Ok(hash)
}

// --- Ethereum-like hashing --------------------------------------------------

/// Returns the node's hash and RLP encoding, refreshing stale hash state on
/// the way. Children whose encoding is shorter than 32 bytes are inlined into
/// their parent; the parent's embedded bitmap records them.
fn eth_node(
    store: &NodeStore,
    node_ref: NodeRef,
    hints: &mut Vec<(NodeId, Hash)>,
) -> Result<(Hash, Vec<u8>), MptError> {
    if node_ref.is_empty() {
        return Ok((*EMPTY_TRIE_HASH, vec![RLP_NULL]));
    }
    let node = store.get_node(node_ref)?;
    let guard = node.hash();
    let was_clean = matches!(guard.cached_hash(), Some((HashStatus::Clean, _)));
    let encoding = match &*guard {
        Node::Empty => return Ok((*EMPTY_TRIE_HASH, vec![RLP_NULL])),
        Node::Branch(branch) => {
            let (dirty, embedded) = {
                let cells = branch.hashes().lock();
                (cells.dirty, cells.embedded)
            };
            let mut inline: [Option<Vec<u8>>; 16] = Default::default();
            let mut refreshed: Vec<(usize, Hash, bool)> = Vec::new();
            for i in 0..16usize {
                let child = branch.child(i);
                if child.is_empty() {
                    continue;
                }
                if dirty & (1 << i) != 0 {
                    let (child_hash, child_enc) = eth_node(store, child, hints)?;
                    let is_embedded = child_enc.len() < 32;
                    if is_embedded {
                        inline[i] = Some(child_enc);
                    }
                    refreshed.push((i, child_hash, is_embedded));
                } else if embedded & (1 << i) != 0 {
                    let (_, child_enc) = eth_node(store, child, hints)?;
                    inline[i] = Some(child_enc);
                }
            }
            let mut cells = branch.hashes().lock();
            for (i, child_hash, is_embedded) in refreshed {
                cells.child_hashes[i] = child_hash;
                cells.dirty &= !(1 << i);
                if is_embedded {
                    cells.embedded |= 1 << i;
                } else {
                    cells.embedded &= !(1 << i);
                }
            }
            let mut buf = Vec::new();
            let mut encoder = Encoder::new(&mut buf);
            for i in 0..16usize {
                if branch.child(i).is_empty() {
                    encoder = encoder.encode_field::<[u8]>(&[]);
                } else if let Some(child_enc) = &inline[i] {
                    encoder = encoder.encode_raw(child_enc);
                } else {
                    encoder = encoder.encode_field(&cells.child_hashes[i]);
                }
            }
            // branches never carry a value in a fixed-width-path trie
            encoder.encode_field::<[u8]>(&[]).finish();
            drop(cells);
            buf
        }
        Node::Extension(ext) => {
            let needs_child = {
                let cell = ext.next_hash().lock();
                cell.dirty || cell.embedded
            };
            let mut inline = None;
            if needs_child {
                let dirty = ext.next_hash().lock().dirty;
                let (child_hash, child_enc) = eth_node(store, ext.next, hints)?;
                let is_embedded = child_enc.len() < 32;
                if is_embedded {
                    inline = Some(child_enc);
                }
                if dirty {
                    let mut cell = ext.next_hash().lock();
                    cell.hash = child_hash;
                    cell.dirty = false;
                    cell.embedded = is_embedded;
                }
            }
            let next_hash = ext.next_hash().lock().hash;
            let mut buf = Vec::new();
            let encoder = Encoder::new(&mut buf)
                .encode_field(&ext.path.encode_compact(false));
            match &inline {
                Some(child_enc) => encoder.encode_raw(child_enc).finish(),
                None => encoder.encode_field(&next_hash).finish(),
            }
            buf
        }
        Node::Account(account) => {
            let storage_root = {
                let cell = account.storage_hash().lock();
                if cell.dirty {
                    None
                } else {
                    Some(cell.hash)
                }
            };
            let storage_root = match storage_root {
                Some(hash) => hash,
                None => {
                    // sub-trie roots are always referenced by hash
                    let hash = eth_node(store, account.storage, hints)?.0;
                    let mut cell = account.storage_hash().lock();
                    cell.hash = hash;
                    cell.dirty = false;
                    hash
                }
            };
            let mut body = Vec::new();
            Encoder::new(&mut body)
                .encode_field(&account.info.nonce)
                .encode_field(&account.info.balance)
                .encode_field(&storage_root)
                .encode_field(&account.info.code_hash)
                .finish();
            let path = leaf_path(
                &store.config.address_path(&account.address),
                account.path_length,
            );
            let mut buf = Vec::new();
            Encoder::new(&mut buf)
                .encode_field(&path.encode_compact(true))
                .encode_field::<[u8]>(&body)
                .finish();
            buf
        }
        Node::Value(value) => {
            let trimmed = U256::from_big_endian(value.value.as_bytes());
            let inner = trimmed.encode_to_vec();
            let path = leaf_path(&store.config.key_path(&value.key), value.path_length);
            let mut buf = Vec::new();
            Encoder::new(&mut buf)
                .encode_field(&path.encode_compact(true))
                .encode_field::<[u8]>(&inner)
                .finish();
            buf
        }
    };
    let hash = if was_clean {
        guard.cached_hash().expect("clean node has a hash").1
    } else {
        let hash = keccak256(&encoding);
        guard.set_hash_clean(hash);
        hints.push((node_ref.id(), hash));
        hash
    };
    Ok((hash, encoding))
}

/// The remaining path of a leaf, derived from its full path and tracked
/// suffix length.
fn leaf_path(full: &crate::nibbles::Nibbles, path_length: u8) -> crate::nibbles::Nibbles {
    full.offset(full.len() - path_length as usize)
}
