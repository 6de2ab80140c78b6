use std::collections::{HashMap, HashSet};

use crate::error::MptError;
use crate::ids::{NodeId, NodeKind, NodeRef};
use crate::node::Node;
use crate::store::NodeStore;

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Accounts,
    Storage,
}

/// Verifies the structural invariants of the trie rooted at `root`:
/// branch arity, extension shape, non-zero values, path consistency,
/// tracked suffix lengths, and freeze transitivity.
pub(crate) fn check_trie(store: &NodeStore, root: NodeRef) -> Result<(), MptError> {
    if root.is_empty() {
        return Ok(());
    }
    let mut prefix = Vec::new();
    check_node(store, root, Phase::Accounts, &mut prefix, false)
}

fn check_node(
    store: &NodeStore,
    node_ref: NodeRef,
    phase: Phase,
    prefix: &mut Vec<u8>,
    must_be_frozen: bool,
) -> Result<(), MptError> {
    let node = store.get_node(node_ref)?;
    let guard = node.read();
    if must_be_frozen && !guard.is_frozen() {
        return Err(MptError::Consistency(format!(
            "node {} is reachable from a frozen parent but is not frozen",
            node_ref.id()
        )));
    }
    let frozen = guard.is_frozen();
    match &*guard {
        Node::Empty => Ok(()),
        Node::Branch(branch) => {
            if branch.child_count() < 2 {
                return Err(MptError::Consistency(format!(
                    "branch {} holds {} children, expected at least two",
                    node_ref.id(),
                    branch.child_count()
                )));
            }
            for i in 0..16usize {
                let child = branch.child(i);
                if branch.is_child_frozen(i) {
                    if child.is_empty() {
                        return Err(MptError::Consistency(format!(
                            "branch {} marks empty slot {i} as frozen",
                            node_ref.id()
                        )));
                    }
                    let child_node = store.get_node(child)?;
                    if !child_node.read().is_frozen() {
                        return Err(MptError::Consistency(format!(
                            "branch {} marks child {i} as frozen but it is not",
                            node_ref.id()
                        )));
                    }
                }
                if !child.is_empty() {
                    prefix.push(i as u8);
                    check_node(store, child, phase, prefix, frozen)?;
                    prefix.pop();
                }
            }
            Ok(())
        }
        Node::Extension(ext) => {
            if ext.path.is_empty() {
                return Err(MptError::Consistency(format!(
                    "extension {} has an empty path",
                    node_ref.id()
                )));
            }
            if ext.next.kind() != NodeKind::Branch {
                return Err(MptError::Consistency(format!(
                    "extension {} points to a {} node instead of a branch",
                    node_ref.id(),
                    ext.next.kind()
                )));
            }
            prefix.extend_from_slice(ext.path.as_slice());
            let result = check_node(store, ext.next, phase, prefix, frozen);
            prefix.truncate(prefix.len() - ext.path.len());
            result
        }
        Node::Account(account) => {
            if phase != Phase::Accounts {
                return Err(MptError::Consistency(format!(
                    "account {} inside a storage sub-trie",
                    node_ref.id()
                )));
            }
            let full = store.config.address_path(&account.address);
            if prefix.len() > full.len() || &full.as_slice()[..prefix.len()] != prefix.as_slice() {
                return Err(MptError::Consistency(format!(
                    "account {} is stored under a path that does not match its address",
                    node_ref.id()
                )));
            }
            if store.config.track_suffix_lengths {
                let expected = (full.len() - prefix.len()) as u8;
                if account.path_length != expected {
                    return Err(MptError::Consistency(format!(
                        "account {} tracks suffix length {} but is at depth {}, expected {}",
                        node_ref.id(),
                        account.path_length,
                        prefix.len(),
                        expected
                    )));
                }
            }
            if !account.storage.is_empty() {
                let mut storage_prefix = Vec::new();
                check_node(store, account.storage, Phase::Storage, &mut storage_prefix, frozen)?;
            }
            Ok(())
        }
        Node::Value(value) => {
            if phase != Phase::Storage {
                return Err(MptError::Consistency(format!(
                    "value {} outside a storage sub-trie",
                    node_ref.id()
                )));
            }
            if value.value.is_zero() {
                return Err(MptError::Consistency(format!(
                    "value {} stores the zero value",
                    node_ref.id()
                )));
            }
            let full = store.config.key_path(&value.key);
            if prefix.len() > full.len() || &full.as_slice()[..prefix.len()] != prefix.as_slice() {
                return Err(MptError::Consistency(format!(
                    "value {} is stored under a path that does not match its key",
                    node_ref.id()
                )));
            }
            if store.config.track_suffix_lengths {
                let expected = (full.len() - prefix.len()) as u8;
                if value.path_length != expected {
                    return Err(MptError::Consistency(format!(
                        "value {} tracks suffix length {} but is at depth {}, expected {}",
                        node_ref.id(),
                        value.path_length,
                        prefix.len(),
                        expected
                    )));
                }
            }
            Ok(())
        }
    }
}

/// Checks several roots at once and additionally rejects invalid aliasing:
/// frozen structure may be shared between roots, mutable nodes must be
/// reachable from at most one root.
pub(crate) fn check_forest(store: &NodeStore, roots: &[NodeRef]) -> Result<(), MptError> {
    for root in roots {
        check_trie(store, *root)?;
    }
    let mut seen_in: HashMap<NodeId, u32> = HashMap::new();
    for root in roots {
        let mut reachable = HashSet::new();
        collect(store, *root, &mut reachable)?;
        for id in reachable {
            *seen_in.entry(id).or_insert(0) += 1;
        }
    }
    for (id, count) in seen_in {
        if count > 1 {
            let node = store.get_node(NodeRef::new(id))?;
            if !node.read().is_frozen() {
                return Err(MptError::Consistency(format!(
                    "mutable node {id} is reachable from {count} roots"
                )));
            }
        }
    }
    Ok(())
}

fn collect(
    store: &NodeStore,
    node_ref: NodeRef,
    reachable: &mut HashSet<NodeId>,
) -> Result<(), MptError> {
    if node_ref.is_empty() || !reachable.insert(node_ref.id()) {
        return Ok(());
    }
    let node = store.get_node(node_ref)?;
    let children: Vec<NodeRef> = {
        let guard = node.read();
        match &*guard {
            Node::Empty => Vec::new(),
            Node::Branch(branch) => branch
                .children
                .iter()
                .filter(|c| !c.is_empty())
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
        collect(store, child, reachable)?;
    }
    Ok(())
}
