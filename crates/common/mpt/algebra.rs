//! The trie rewrite rules: navigation, insertion, deletion, prefix
//! splitting and fusing, and freeze-aware copy-on-write.
//!
//! All mutations return `(new_root, changed)`. A frozen node is never
//! modified; the rewrite allocates a fresh parent chain and reuses every
//! untouched frozen descendant. Release of bypassed nodes is queued only
//! after the local rewrite committed and all handles are dropped.

use crate::error::MptError;
use crate::ids::{NodeKind, NodeRef};
use crate::nibbles::{common_prefix_len, Nibbles};
use crate::node::{AccountNode, BranchNode, ExtensionNode, Node, ValueNode};
use crate::store::NodeStore;
use crate::types::{AccountInfo, Address, Key, Value};

/// Deferred release work, scheduled after the current node's handle is gone.
enum Release {
    Subtree(NodeRef),
    Single(NodeRef),
}

fn run_releases(store: &NodeStore, releases: Vec<Release>) -> Result<(), MptError> {
    for release in releases {
        match release {
            Release::Subtree(node) => store.schedule_release_subtree(node)?,
            Release::Single(node) => store.schedule_release_single(node)?,
        }
    }
    Ok(())
}

// --- lookups ----------------------------------------------------------------

pub(crate) fn get_account_info(
    store: &NodeStore,
    root: NodeRef,
    address: &Address,
) -> Result<Option<AccountInfo>, MptError> {
    let path = store.config.address_path(address);
    match find_account(store, root, address, &path)? {
        Some((info, _)) => Ok(Some(info)),
        None => Ok(None),
    }
}

pub(crate) fn get_value(
    store: &NodeStore,
    root: NodeRef,
    address: &Address,
    key: &Key,
) -> Result<Value, MptError> {
    let path = store.config.address_path(address);
    let Some((_, storage)) = find_account(store, root, address, &path)? else {
        return Ok(Value::zero());
    };
    let key_path = store.config.key_path(key);
    let mut current = storage;
    let mut depth = 0usize;
    loop {
        if current.is_empty() {
            return Ok(Value::zero());
        }
        let node = store.get_node(current)?;
        let guard = node.read();
        match &*guard {
            Node::Empty => return Ok(Value::zero()),
            Node::Branch(branch) => {
                let next = branch.child(key_path.at(depth) as usize);
                depth += 1;
                drop(guard);
                current = next;
            }
            Node::Extension(ext) => {
                let remaining = &key_path.as_slice()[depth..];
                if common_prefix_len(ext.path.as_slice(), remaining) < ext.path.len() {
                    return Ok(Value::zero());
                }
                depth += ext.path.len();
                let next = ext.next;
                drop(guard);
                current = next;
            }
            Node::Value(value) => {
                return Ok(if value.key == *key {
                    value.value
                } else {
                    Value::zero()
                });
            }
            Node::Account(_) => {
                return Err(MptError::UnexpectedNode {
                    expected: "value",
                    found: NodeKind::Account,
                });
            }
        }
    }
}

/// Walks the account-phase trie and returns the info and storage root of the
/// addressed account, if present.
fn find_account(
    store: &NodeStore,
    root: NodeRef,
    address: &Address,
    path: &Nibbles,
) -> Result<Option<(AccountInfo, NodeRef)>, MptError> {
    let mut current = root;
    let mut depth = 0usize;
    loop {
        if current.is_empty() {
            return Ok(None);
        }
        let node = store.get_node(current)?;
        let guard = node.read();
        match &*guard {
            Node::Empty => return Ok(None),
            Node::Branch(branch) => {
                let next = branch.child(path.at(depth) as usize);
                depth += 1;
                drop(guard);
                current = next;
            }
            Node::Extension(ext) => {
                let remaining = &path.as_slice()[depth..];
                if common_prefix_len(ext.path.as_slice(), remaining) < ext.path.len() {
                    return Ok(None);
                }
                depth += ext.path.len();
                let next = ext.next;
                drop(guard);
                current = next;
            }
            Node::Account(account) => {
                return Ok(if account.address == *address {
                    Some((account.info, account.storage))
                } else {
                    None
                });
            }
            Node::Value(_) => {
                return Err(MptError::UnexpectedNode {
                    expected: "account",
                    found: NodeKind::Value,
                });
            }
        }
    }
}

// --- account updates --------------------------------------------------------

pub(crate) fn set_account_info(
    store: &NodeStore,
    root: NodeRef,
    address: &Address,
    info: &AccountInfo,
) -> Result<(NodeRef, bool), MptError> {
    let path = store.config.address_path(address);
    set_account(store, root, address, &path, 0, info)
}

fn set_account(
    store: &NodeStore,
    node_ref: NodeRef,
    address: &Address,
    path: &Nibbles,
    depth: usize,
    info: &AccountInfo,
) -> Result<(NodeRef, bool), MptError> {
    if node_ref.is_empty() {
        if info.is_empty() {
            return Ok((NodeRef::EMPTY, false));
        }
        let remaining = (path.len() - depth) as u8;
        let leaf = store.create(Node::Account(AccountNode::new(
            *address,
            *info,
            NodeRef::EMPTY,
            remaining,
        )))?;
        return Ok((leaf, true));
    }

    let node = store.get_node(node_ref)?;
    let mut releases: Vec<Release> = Vec::new();
    let result = {
        let mut guard = node.write();
        match &mut *guard {
            Node::Empty => unreachable!("non-empty reference resolved to the empty node"),
            Node::Account(account) => {
                if account.address == *address {
                    if info.is_empty() {
                        if !account.base.frozen() {
                            releases.push(Release::Subtree(node_ref));
                        }
                        (NodeRef::EMPTY, true)
                    } else if account.info == *info {
                        (node_ref, false)
                    } else if account.base.frozen() {
                        let copy =
                            account.cow_with(*info, account.storage, account.path_length);
                        (store.create(Node::Account(copy))?, true)
                    } else {
                        account.info = *info;
                        account.base.hash_cell().mark_dirty();
                        node.mark_dirty();
                        (node_ref, true)
                    }
                } else if info.is_empty() {
                    (node_ref, false)
                } else {
                    split_account_leaf(store, node_ref, &node, account, address, path, depth, info)?
                }
            }
            Node::Branch(branch) => {
                let idx = path.at(depth) as usize;
                let child = branch.child(idx);
                let (new_child, changed) =
                    set_account(store, child, address, path, depth + 1, info)?;
                if !changed {
                    (node_ref, false)
                } else if new_child == child {
                    branch.mark_child_hash_dirty(idx);
                    branch.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    (node_ref, true)
                } else if new_child.is_empty() && branch.child_count() == 2 {
                    // the branch collapses around its remaining child
                    let (nibble, remaining) = branch
                        .children
                        .iter()
                        .enumerate()
                        .find(|(i, c)| *i != idx && !c.is_empty())
                        .map(|(i, c)| (i as u8, *c))
                        .expect("a branch holds at least two children");
                    let replacement = collapse_branch(store, nibble, remaining)?;
                    if !branch.base.frozen() {
                        releases.push(Release::Single(node_ref));
                    }
                    (replacement, true)
                } else if branch.base.frozen() {
                    let copy = branch.cow_replace_child(idx, new_child);
                    (store.create(Node::Branch(copy))?, true)
                } else {
                    branch.set_child(idx, new_child);
                    branch.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    (node_ref, true)
                }
            }
            Node::Extension(ext) => {
                let remaining = &path.as_slice()[depth..];
                let cp = common_prefix_len(ext.path.as_slice(), remaining);
                if cp == ext.path.len() {
                    let child = ext.next;
                    let (new_child, changed) =
                        set_account(store, child, address, path, depth + cp, info)?;
                    if !changed {
                        (node_ref, false)
                    } else {
                        absorb_extension_child(
                            store, node_ref, &node, ext, new_child, child, &mut releases,
                        )?
                    }
                } else if info.is_empty() {
                    // deleting along a diverging path touches nothing
                    (node_ref, false)
                } else {
                    let remaining_len = (path.len() - depth - cp - 1) as u8;
                    let leaf = store.create(Node::Account(AccountNode::new(
                        *address,
                        *info,
                        NodeRef::EMPTY,
                        remaining_len,
                    )))?;
                    split_extension(store, node_ref, &node, ext, remaining, cp, leaf, &mut releases)?
                }
            }
            Node::Value(_) => {
                return Err(MptError::UnexpectedNode {
                    expected: "account",
                    found: NodeKind::Value,
                });
            }
        }
    };
    run_releases(store, releases)?;
    Ok(result)
}

/// Splits an account leaf whose path diverges from the inserted address:
/// a branch over the two leaves, under an extension for any shared prefix.
#[allow(clippy::too_many_arguments)]
fn split_account_leaf(
    store: &NodeStore,
    node_ref: NodeRef,
    node: &crate::shared::Shared<Node>,
    account: &mut AccountNode,
    address: &Address,
    path: &Nibbles,
    depth: usize,
    info: &AccountInfo,
) -> Result<(NodeRef, bool), MptError> {
    let current_full = store.config.address_path(&account.address);
    let current_rem = &current_full.as_slice()[depth..];
    let new_rem = &path.as_slice()[depth..];
    let cp = common_prefix_len(current_rem, new_rem);
    debug_assert!(cp < current_rem.len() && cp < new_rem.len());

    let leaf_len = (new_rem.len() - cp - 1) as u8;
    let new_leaf = store.create(Node::Account(AccountNode::new(
        *address,
        *info,
        NodeRef::EMPTY,
        leaf_len,
    )))?;

    let sibling_frozen = account.base.frozen();
    let sibling = if store.config.track_suffix_lengths && account.path_length != leaf_len {
        if sibling_frozen {
            let copy = account.cow_with(account.info, account.storage, leaf_len);
            store.create(Node::Account(copy))?
        } else {
            account.path_length = leaf_len;
            account.base.hash_cell().mark_dirty();
            node.mark_dirty();
            node_ref
        }
    } else {
        node_ref
    };

    let mut children = [NodeRef::EMPTY; 16];
    children[current_rem[cp] as usize] = sibling;
    children[new_rem[cp] as usize] = new_leaf;
    let mut branch = BranchNode::new(children);
    if sibling_frozen && sibling == node_ref {
        branch.set_child_frozen(current_rem[cp] as usize);
    }
    let branch_ref = store.create(Node::Branch(branch))?;

    if cp > 0 {
        let ext = ExtensionNode::new(Nibbles::from_hex(new_rem[..cp].to_vec()), branch_ref);
        Ok((store.create(Node::Extension(ext))?, true))
    } else {
        Ok((branch_ref, true))
    }
}

/// Integrates the result of a mutation below an extension: plain branch
/// successors are re-linked, collapsed successors are fused or replace the
/// extension altogether.
fn absorb_extension_child(
    store: &NodeStore,
    node_ref: NodeRef,
    node: &crate::shared::Shared<Node>,
    ext: &mut ExtensionNode,
    new_child: NodeRef,
    old_child: NodeRef,
    releases: &mut Vec<Release>,
) -> Result<(NodeRef, bool), MptError> {
    let frozen = ext.base.frozen();
    if new_child == old_child {
        debug_assert!(!frozen, "a frozen extension's successor cannot change in place");
        ext.mark_next_hash_dirty();
        ext.base.hash_cell().mark_dirty();
        node.mark_dirty();
        return Ok((node_ref, true));
    }
    match new_child.kind() {
        NodeKind::Branch => {
            if frozen {
                let copy = ExtensionNode::new(ext.path.clone(), new_child);
                Ok((store.create(Node::Extension(copy))?, true))
            } else {
                ext.set_next(new_child);
                ext.base.hash_cell().mark_dirty();
                node.mark_dirty();
                Ok((node_ref, true))
            }
        }
        NodeKind::Extension => {
            // the successor collapsed into an extension: fuse the paths
            let (tail_path, tail_next) = {
                let tail = store.get_node(new_child)?;
                let tail_guard = tail.read();
                match &*tail_guard {
                    Node::Extension(tail_ext) => (tail_ext.path.clone(), tail_ext.next),
                    other => {
                        return Err(MptError::Consistency(format!(
                            "extension successor reported as extension but is {}",
                            other.kind()
                        )))
                    }
                }
            };
            releases.push(Release::Single(new_child));
            if frozen {
                let mut fused_path = tail_path;
                fused_path.prepend_path(ext.path.as_slice());
                let copy = ExtensionNode::new(fused_path, tail_next);
                Ok((store.create(Node::Extension(copy))?, true))
            } else {
                ext.path = {
                    let mut fused = tail_path;
                    fused.prepend_path(ext.path.as_slice());
                    fused
                };
                ext.set_next(tail_next);
                ext.base.hash_cell().mark_dirty();
                node.mark_dirty();
                Ok((node_ref, true))
            }
        }
        NodeKind::Account | NodeKind::Value => {
            // the successor collapsed into a leaf which replaces this
            // extension, its suffix growing by the extension's path
            let leaf = grow_leaf_path(store, new_child, ext.path.len())?;
            if !frozen {
                releases.push(Release::Single(node_ref));
            }
            Ok((leaf, true))
        }
        NodeKind::Empty => {
            if !frozen {
                releases.push(Release::Single(node_ref));
            }
            Ok((NodeRef::EMPTY, true))
        }
    }
}

/// Splits an extension at a path divergence: the shared prefix stays above a
/// new branch holding the shortened extension remainder and a new leaf.
#[allow(clippy::too_many_arguments)]
fn split_extension(
    store: &NodeStore,
    node_ref: NodeRef,
    node: &crate::shared::Shared<Node>,
    ext: &mut ExtensionNode,
    remaining: &[u8],
    cp: usize,
    leaf: NodeRef,
    releases: &mut Vec<Release>,
) -> Result<(NodeRef, bool), MptError> {
    let frozen = ext.base.frozen();
    let old_slot = ext.path.at(cp) as usize;
    let shortened_len = ext.path.len() - cp - 1;

    let old_side = if shortened_len == 0 {
        // the old extension disappears; its successor moves into the branch
        let next = ext.next;
        if !frozen {
            releases.push(Release::Single(node_ref));
        }
        next
    } else if frozen {
        let shortened = ext.path.slice(cp + 1, ext.path.len());
        store.create(Node::Extension(ExtensionNode::new(shortened, ext.next)))?
    } else {
        // reuse this node as the shortened lower extension
        ext.path = ext.path.slice(cp + 1, ext.path.len());
        ext.base.hash_cell().mark_dirty();
        node.mark_dirty();
        node_ref
    };

    let old_side_frozen = if frozen {
        // a frozen extension's successor is frozen as well
        shortened_len == 0
    } else {
        false
    };

    let mut children = [NodeRef::EMPTY; 16];
    children[old_slot] = old_side;
    children[remaining[cp] as usize] = leaf;
    let mut branch = BranchNode::new(children);
    if old_side_frozen {
        branch.set_child_frozen(old_slot);
    }
    let branch_ref = store.create(Node::Branch(branch))?;

    if cp > 0 {
        let prefix = Nibbles::from_hex(remaining[..cp].to_vec());
        Ok((
            store.create(Node::Extension(ExtensionNode::new(prefix, branch_ref)))?,
            true,
        ))
    } else {
        Ok((branch_ref, true))
    }
}

/// Replaces a collapsing branch by its single remaining child, reachable via
/// `nibble`. Leaves absorb the nibble into their tracked suffix, extensions
/// prepend it, branches get a one-nibble extension on top.
fn collapse_branch(store: &NodeStore, nibble: u8, child_ref: NodeRef) -> Result<NodeRef, MptError> {
    let node = store.get_node(child_ref)?;
    // Frozen children are replaced by adjusted copies; mutable ones absorb
    // the change in place. The copy is created after the handle is dropped.
    let replacement: Option<Node> = {
        let mut guard = node.write();
        match &mut *guard {
            Node::Empty => {
                return Err(MptError::Consistency(
                    "branch collapse onto an empty child".into(),
                ))
            }
            Node::Account(account) => {
                if !store.config.track_suffix_lengths {
                    None
                } else if account.base.frozen() {
                    Some(Node::Account(account.cow_with(
                        account.info,
                        account.storage,
                        account.path_length + 1,
                    )))
                } else {
                    account.path_length += 1;
                    account.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    None
                }
            }
            Node::Value(value) => {
                if !store.config.track_suffix_lengths {
                    None
                } else if value.base.frozen() {
                    Some(Node::Value(ValueNode::new(
                        value.key,
                        value.value,
                        value.path_length + 1,
                    )))
                } else {
                    value.path_length += 1;
                    value.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    None
                }
            }
            Node::Extension(ext) => {
                if ext.base.frozen() {
                    let mut path = ext.path.clone();
                    path.prepend(nibble);
                    Some(Node::Extension(ExtensionNode::new(path, ext.next)))
                } else {
                    ext.path.prepend(nibble);
                    ext.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    None
                }
            }
            Node::Branch(_) => Some(Node::Extension(ExtensionNode::new(
                Nibbles::from_hex(vec![nibble]),
                child_ref,
            ))),
        }
    };
    match replacement {
        Some(copy) => store.create(copy),
        None => Ok(child_ref),
    }
}

/// Extends a leaf's tracked suffix by `extra` nibbles when it replaces an
/// extension above it.
fn grow_leaf_path(store: &NodeStore, leaf_ref: NodeRef, extra: usize) -> Result<NodeRef, MptError> {
    if !store.config.track_suffix_lengths || extra == 0 {
        return Ok(leaf_ref);
    }
    let node = store.get_node(leaf_ref)?;
    let replacement: Option<Node> = {
        let mut guard = node.write();
        match &mut *guard {
            Node::Account(account) => {
                if account.base.frozen() {
                    Some(Node::Account(account.cow_with(
                        account.info,
                        account.storage,
                        account.path_length + extra as u8,
                    )))
                } else {
                    account.path_length += extra as u8;
                    account.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    None
                }
            }
            Node::Value(value) => {
                if value.base.frozen() {
                    Some(Node::Value(ValueNode::new(
                        value.key,
                        value.value,
                        value.path_length + extra as u8,
                    )))
                } else {
                    value.path_length += extra as u8;
                    value.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    None
                }
            }
            other => {
                return Err(MptError::Consistency(format!(
                    "cannot grow the path of a {} node",
                    other.kind()
                )))
            }
        }
    };
    match replacement {
        Some(copy) => store.create(copy),
        None => Ok(leaf_ref),
    }
}

// --- storage-slot updates ---------------------------------------------------

#[derive(Clone, Copy)]
enum StorageOp<'a> {
    Set { key: &'a Key, value: &'a Value },
    Clear,
}

pub(crate) fn set_value(
    store: &NodeStore,
    root: NodeRef,
    address: &Address,
    key: &Key,
    value: &Value,
) -> Result<(NodeRef, bool), MptError> {
    let path = store.config.address_path(address);
    update_storage(store, root, address, &path, 0, &StorageOp::Set { key, value })
}

pub(crate) fn clear_storage(
    store: &NodeStore,
    root: NodeRef,
    address: &Address,
) -> Result<(NodeRef, bool), MptError> {
    let path = store.config.address_path(address);
    update_storage(store, root, address, &path, 0, &StorageOp::Clear)
}

/// Navigates the account phase of the trie and applies a storage operation
/// to the addressed account. Missing accounts make every storage operation a
/// no-op; the account-phase structure itself never changes shape here.
fn update_storage(
    store: &NodeStore,
    node_ref: NodeRef,
    address: &Address,
    path: &Nibbles,
    depth: usize,
    op: &StorageOp<'_>,
) -> Result<(NodeRef, bool), MptError> {
    if node_ref.is_empty() {
        return Ok((node_ref, false));
    }
    let node = store.get_node(node_ref)?;
    let mut releases: Vec<Release> = Vec::new();
    let result = {
        let mut guard = node.write();
        match &mut *guard {
            Node::Empty => (node_ref, false),
            Node::Account(account) => {
                if account.address != *address {
                    (node_ref, false)
                } else {
                    match *op {
                        StorageOp::Set { key, value } => {
                            let key_path = store.config.key_path(key);
                            let (new_storage, changed) =
                                set_slot(store, account.storage, key, &key_path, 0, value)?;
                            if !changed {
                                (node_ref, false)
                            } else if account.base.frozen() {
                                let copy = account.cow_with(
                                    account.info,
                                    new_storage,
                                    account.path_length,
                                );
                                (store.create(Node::Account(copy))?, true)
                            } else {
                                if new_storage != account.storage {
                                    account.set_storage(new_storage);
                                } else {
                                    account.mark_storage_hash_dirty();
                                }
                                account.base.hash_cell().mark_dirty();
                                node.mark_dirty();
                                (node_ref, true)
                            }
                        }
                        StorageOp::Clear => {
                            if account.storage.is_empty() {
                                (node_ref, false)
                            } else if account.base.frozen() {
                                let copy = account.cow_with(
                                    account.info,
                                    NodeRef::EMPTY,
                                    account.path_length,
                                );
                                (store.create(Node::Account(copy))?, true)
                            } else {
                                let old = account.storage;
                                account.set_storage(NodeRef::EMPTY);
                                account.base.hash_cell().mark_dirty();
                                node.mark_dirty();
                                releases.push(Release::Subtree(old));
                                (node_ref, true)
                            }
                        }
                    }
                }
            }
            Node::Branch(branch) => {
                let idx = path.at(depth) as usize;
                let child = branch.child(idx);
                let (new_child, changed) =
                    update_storage(store, child, address, path, depth + 1, op)?;
                if !changed {
                    (node_ref, false)
                } else if new_child == child {
                    branch.mark_child_hash_dirty(idx);
                    branch.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    (node_ref, true)
                } else if branch.base.frozen() {
                    let copy = branch.cow_replace_child(idx, new_child);
                    (store.create(Node::Branch(copy))?, true)
                } else {
                    branch.set_child(idx, new_child);
                    branch.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    (node_ref, true)
                }
            }
            Node::Extension(ext) => {
                let remaining = &path.as_slice()[depth..];
                let cp = common_prefix_len(ext.path.as_slice(), remaining);
                if cp < ext.path.len() {
                    (node_ref, false)
                } else {
                    let child = ext.next;
                    let (new_child, changed) =
                        update_storage(store, child, address, path, depth + cp, op)?;
                    if !changed {
                        (node_ref, false)
                    } else {
                        absorb_extension_child(
                            store, node_ref, &node, ext, new_child, child, &mut releases,
                        )?
                    }
                }
            }
            Node::Value(_) => {
                return Err(MptError::UnexpectedNode {
                    expected: "account",
                    found: NodeKind::Value,
                });
            }
        }
    };
    run_releases(store, releases)?;
    Ok(result)
}

fn set_slot(
    store: &NodeStore,
    node_ref: NodeRef,
    key: &Key,
    path: &Nibbles,
    depth: usize,
    value: &Value,
) -> Result<(NodeRef, bool), MptError> {
    if node_ref.is_empty() {
        if value.is_zero() {
            return Ok((NodeRef::EMPTY, false));
        }
        let remaining = (path.len() - depth) as u8;
        let leaf = store.create(Node::Value(ValueNode::new(*key, *value, remaining)))?;
        return Ok((leaf, true));
    }

    let node = store.get_node(node_ref)?;
    let mut releases: Vec<Release> = Vec::new();
    let result = {
        let mut guard = node.write();
        match &mut *guard {
            Node::Empty => unreachable!("non-empty reference resolved to the empty node"),
            Node::Value(slot) => {
                if slot.key == *key {
                    if value.is_zero() {
                        if !slot.base.frozen() {
                            releases.push(Release::Subtree(node_ref));
                        }
                        (NodeRef::EMPTY, true)
                    } else if slot.value == *value {
                        (node_ref, false)
                    } else if slot.base.frozen() {
                        let copy = ValueNode::new(*key, *value, slot.path_length);
                        (store.create(Node::Value(copy))?, true)
                    } else {
                        slot.value = *value;
                        slot.base.hash_cell().mark_dirty();
                        node.mark_dirty();
                        (node_ref, true)
                    }
                } else if value.is_zero() {
                    (node_ref, false)
                } else {
                    split_value_leaf(store, node_ref, &node, slot, key, path, depth, value)?
                }
            }
            Node::Branch(branch) => {
                let idx = path.at(depth) as usize;
                let child = branch.child(idx);
                let (new_child, changed) = set_slot(store, child, key, path, depth + 1, value)?;
                if !changed {
                    (node_ref, false)
                } else if new_child == child {
                    branch.mark_child_hash_dirty(idx);
                    branch.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    (node_ref, true)
                } else if new_child.is_empty() && branch.child_count() == 2 {
                    let (nibble, remaining) = branch
                        .children
                        .iter()
                        .enumerate()
                        .find(|(i, c)| *i != idx && !c.is_empty())
                        .map(|(i, c)| (i as u8, *c))
                        .expect("a branch holds at least two children");
                    let replacement = collapse_branch(store, nibble, remaining)?;
                    if !branch.base.frozen() {
                        releases.push(Release::Single(node_ref));
                    }
                    (replacement, true)
                } else if branch.base.frozen() {
                    let copy = branch.cow_replace_child(idx, new_child);
                    (store.create(Node::Branch(copy))?, true)
                } else {
                    branch.set_child(idx, new_child);
                    branch.base.hash_cell().mark_dirty();
                    node.mark_dirty();
                    (node_ref, true)
                }
            }
            Node::Extension(ext) => {
                let remaining = &path.as_slice()[depth..];
                let cp = common_prefix_len(ext.path.as_slice(), remaining);
                if cp == ext.path.len() {
                    let child = ext.next;
                    let (new_child, changed) =
                        set_slot(store, child, key, path, depth + cp, value)?;
                    if !changed {
                        (node_ref, false)
                    } else {
                        absorb_extension_child(
                            store, node_ref, &node, ext, new_child, child, &mut releases,
                        )?
                    }
                } else if value.is_zero() {
                    (node_ref, false)
                } else {
                    let remaining_len = (path.len() - depth - cp - 1) as u8;
                    let leaf =
                        store.create(Node::Value(ValueNode::new(*key, *value, remaining_len)))?;
                    split_extension(store, node_ref, &node, ext, remaining, cp, leaf, &mut releases)?
                }
            }
            Node::Account(_) => {
                return Err(MptError::UnexpectedNode {
                    expected: "value",
                    found: NodeKind::Account,
                });
            }
        }
    };
    run_releases(store, releases)?;
    Ok(result)
}

/// Splits a value leaf whose path diverges from the inserted key.
#[allow(clippy::too_many_arguments)]
fn split_value_leaf(
    store: &NodeStore,
    node_ref: NodeRef,
    node: &crate::shared::Shared<Node>,
    slot: &mut ValueNode,
    key: &Key,
    path: &Nibbles,
    depth: usize,
    value: &Value,
) -> Result<(NodeRef, bool), MptError> {
    let current_full = store.config.key_path(&slot.key);
    let current_rem = &current_full.as_slice()[depth..];
    let new_rem = &path.as_slice()[depth..];
    let cp = common_prefix_len(current_rem, new_rem);
    debug_assert!(cp < current_rem.len() && cp < new_rem.len());

    let leaf_len = (new_rem.len() - cp - 1) as u8;
    let new_leaf = store.create(Node::Value(ValueNode::new(*key, *value, leaf_len)))?;

    let sibling_frozen = slot.base.frozen();
    let sibling = if store.config.track_suffix_lengths && slot.path_length != leaf_len {
        if sibling_frozen {
            let copy = ValueNode::new(slot.key, slot.value, leaf_len);
            store.create(Node::Value(copy))?
        } else {
            slot.path_length = leaf_len;
            slot.base.hash_cell().mark_dirty();
            node.mark_dirty();
            node_ref
        }
    } else {
        node_ref
    };

    let mut children = [NodeRef::EMPTY; 16];
    children[current_rem[cp] as usize] = sibling;
    children[new_rem[cp] as usize] = new_leaf;
    let mut branch = BranchNode::new(children);
    if sibling_frozen && sibling == node_ref {
        branch.set_child_frozen(current_rem[cp] as usize);
    }
    let branch_ref = store.create(Node::Branch(branch))?;

    if cp > 0 {
        let ext = ExtensionNode::new(Nibbles::from_hex(new_rem[..cp].to_vec()), branch_ref);
        Ok((store.create(Node::Extension(ext))?, true))
    } else {
        Ok((branch_ref, true))
    }
}
