//! A persistent forest of Ethereum-compatible Merkle Patricia Tries.
//!
//! The forest stores the world state (accounts plus per-account storage) as
//! id-addressed trie nodes kept in four on-disk object pools, fronted by a
//! bounded in-memory node cache and an asynchronous write buffer. Roots are
//! plain node references held by the caller: in live mode updates rewrite the
//! tree in place, in archive mode every update yields a new root that shares
//! all untouched frozen structure with its predecessors.

mod algebra;
mod cache;
mod check;
mod codec;
pub mod config;
mod dirlock;
pub mod error;
mod file_stock;
mod hasher;
mod ids;
mod nibbles;
mod node;
mod release;
mod shadow;
mod shared;
mod stock;
mod store;
mod types;
mod visit;
mod write_buffer;

mod forest;

pub use self::config::{
    ForestConfig, Hashing, Mode, MptConfig, S4_ARCHIVE_CONFIG, S4_LIVE_CONFIG, S5_ARCHIVE_CONFIG,
    S5_LIVE_CONFIG,
};
pub use self::dirlock::DirLock;
pub use self::error::MptError;
pub use self::file_stock::FileStock;
pub use self::forest::Forest;
pub use self::hasher::EMPTY_TRIE_HASH;
pub use self::ids::{NodeId, NodeKind, NodeRef};
pub use self::nibbles::Nibbles;
pub use self::node::Node;
pub use self::shadow::ShadowStock;
pub use self::shared::{HashHandle, ReadHandle, Shared, ViewHandle, WriteHandle};
pub use self::stock::{Codec, MemoryStock, Stock};
pub use self::types::{AccountInfo, Address, Hash, Key, Value};
pub use self::visit::{visitor_fn, CancelToken, FnVisitor, NodeVisitor, VisitInfo, VisitResponse};
