use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::MptError;
use crate::ids::{NodeId, NodeRef};
use crate::node::Node;
use crate::store::NodeStore;

/// Cooperative cancellation for long-running traversals. Cloning shares the
/// underlying flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Position of a node during a trie visit.
#[derive(Clone, Copy, Debug)]
pub struct VisitInfo {
    pub id: NodeId,
    pub depth: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitResponse {
    Continue,
    /// Skip the children of the current node.
    Prune,
    Abort,
}

pub trait NodeVisitor {
    fn visit(&mut self, node: &Node, info: VisitInfo) -> VisitResponse;
}

/// Adapts a closure into a [`NodeVisitor`].
pub fn visitor_fn<F>(f: F) -> FnVisitor<F>
where
    F: FnMut(&Node, VisitInfo) -> VisitResponse,
{
    FnVisitor(f)
}

pub struct FnVisitor<F>(F);

impl<F> NodeVisitor for FnVisitor<F>
where
    F: FnMut(&Node, VisitInfo) -> VisitResponse,
{
    fn visit(&mut self, node: &Node, info: VisitInfo) -> VisitResponse {
        (self.0)(node, info)
    }
}

/// Number of visited nodes between cancellation checks; comfortably below
/// the 128-node bound the cancellation contract requires.
const CANCEL_CHECK_MASK: u64 = 0x3f;

/// Depth-first pre-order traversal. Returns whether the visitor aborted.
pub(crate) fn visit_trie(
    store: &NodeStore,
    root: NodeRef,
    visitor: &mut dyn NodeVisitor,
    cancel: &CancelToken,
) -> Result<bool, MptError> {
    let mut stack: Vec<(NodeRef, usize)> = Vec::new();
    if !root.is_empty() {
        stack.push((root, 0));
    }
    let mut visited = 0u64;
    while let Some((node_ref, depth)) = stack.pop() {
        if visited & CANCEL_CHECK_MASK == 0 && cancel.is_canceled() {
            return Err(MptError::Canceled);
        }
        visited += 1;
        let node = store.get_node(node_ref)?;
        let guard = node.read();
        let response = visitor.visit(
            &guard,
            VisitInfo {
                id: node_ref.id(),
                depth,
            },
        );
        match response {
            VisitResponse::Abort => return Ok(true),
            VisitResponse::Prune => continue,
            VisitResponse::Continue => {}
        }
        match &*guard {
            Node::Empty | Node::Value(_) => {}
            Node::Branch(branch) => {
                for child in branch.children.iter().rev() {
                    if !child.is_empty() {
                        stack.push((*child, depth + 1));
                    }
                }
            }
            Node::Extension(ext) => {
                stack.push((ext.next, depth + ext.path.len()));
            }
            Node::Account(account) => {
                if !account.storage.is_empty() {
                    stack.push((account.storage, depth + 1));
                }
            }
        }
    }
    Ok(false)
}

/// Renders a subtree as an indented textual outline, for debugging.
pub(crate) fn dump(store: &NodeStore, root: NodeRef) -> Result<String, MptError> {
    let mut out = String::new();
    if root.is_empty() {
        out.push_str("(empty)\n");
        return Ok(out);
    }
    let cancel = CancelToken::new();
    visit_trie(
        store,
        root,
        &mut visitor_fn(|node: &Node, info: VisitInfo| {
            for _ in 0..info.depth {
                out.push_str("  ");
            }
            match node {
                Node::Empty => out.push_str("(empty)\n"),
                Node::Branch(branch) => {
                    let _ = writeln!(
                        out,
                        "{}: branch, {} children",
                        info.id,
                        branch.child_count()
                    );
                }
                Node::Extension(ext) => {
                    let _ = writeln!(out, "{}: extension {:?}", info.id, ext.path);
                }
                Node::Account(account) => {
                    let _ = writeln!(
                        out,
                        "{}: account {:?} nonce={} balance={}",
                        info.id, account.address, account.info.nonce, account.info.balance
                    );
                }
                Node::Value(value) => {
                    let _ = writeln!(out, "{}: value {:?} = {:?}", info.id, value.key, value.value);
                }
            }
            VisitResponse::Continue
        }),
        &cancel,
    )?;
    Ok(out)
}
