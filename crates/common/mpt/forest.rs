use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::algebra;
use crate::check;
use crate::codec::{AccountCodec, BranchCodec, CodecOptions, ExtensionCodec, ValueCodec};
use crate::config::{ForestConfig, ForestMeta, Hashing, Mode, MptConfig};
use crate::dirlock::DirLock;
use crate::error::MptError;
use crate::file_stock::FileStock;
use crate::hasher;
use crate::ids::{NodeId, NodeRef};
use crate::release::ReleaseWorker;
use crate::stock::MemoryStock;
use crate::store::{NodeStore, StockSet};
use crate::types::{AccountInfo, Address, Hash, Key, Value};
use crate::visit::{CancelToken, NodeVisitor};

const FOREST_META_FILE: &str = "forest.json";

/// A forest of Merkle Patricia Tries over shared, id-addressed nodes.
///
/// Roots are plain [`NodeRef`]s held by the caller. Mutations return the new
/// root; in live (mutable) mode the returned root usually equals the old one
/// and history is overwritten, in archive (immutable) mode mutating a frozen
/// root yields a fresh root sharing all untouched structure.
///
/// The forest is safe for concurrent use. Distinct roots can be mutated in
/// parallel; writes to the same root serialize on the root's node lock and
/// readers of a fixed frozen root observe a consistent snapshot.
pub struct Forest {
    store: Arc<NodeStore>,
    release: ReleaseWorker,
    issues: Mutex<Vec<MptError>>,
    _lock: Option<DirLock>,
    closed: AtomicBool,
}

impl Forest {
    /// Opens (or initializes) a forest directory, taking its exclusive lock.
    pub fn open(
        directory: &Path,
        config: MptConfig,
        forest_config: ForestConfig,
    ) -> Result<Forest, MptError> {
        config.validate()?;
        let lock = DirLock::acquire(directory)?;
        check_or_write_meta(directory, &config, forest_config.mode)?;
        let stocks = file_stock_set(directory, &config, forest_config.mode)?;
        info!(directory = %directory.display(), configuration = config.name, "opened forest");
        Ok(Forest::with_stocks(stocks, config, forest_config, Some(lock)))
    }

    /// An ephemeral forest backed by in-memory stocks.
    pub fn open_in_memory(
        config: MptConfig,
        forest_config: ForestConfig,
    ) -> Result<Forest, MptError> {
        config.validate()?;
        Ok(Forest::with_stocks(
            memory_stock_set(&config, forest_config.mode),
            config,
            forest_config,
            None,
        ))
    }

    pub(crate) fn with_stocks(
        stocks: Arc<StockSet>,
        config: MptConfig,
        forest_config: ForestConfig,
        lock: Option<DirLock>,
    ) -> Forest {
        let store = NodeStore::new(config, &forest_config, stocks);
        let release = ReleaseWorker::spawn(Arc::clone(&store));
        store.set_release_sender(release.sender().expect("fresh release worker has a sender"));
        Forest {
            store,
            release,
            issues: Mutex::new(Vec::new()),
            _lock: lock,
            closed: AtomicBool::new(false),
        }
    }

    // --- account and storage access -----------------------------------------

    /// Updates the account, returning the new root. Setting the all-zero
    /// info deletes the account together with its storage.
    pub fn set_account_info(
        &self,
        root: NodeRef,
        address: Address,
        info: AccountInfo,
    ) -> Result<NodeRef, MptError> {
        self.record(
            algebra::set_account_info(&self.store, root, &address, &info)
                .map(|(new_root, _)| new_root),
        )
    }

    /// Looks up an account; the boolean reports whether it exists.
    pub fn get_account_info(
        &self,
        root: NodeRef,
        address: Address,
    ) -> Result<(AccountInfo, bool), MptError> {
        self.record(
            algebra::get_account_info(&self.store, root, &address)
                .map(|found| (found.unwrap_or_default(), found.is_some())),
        )
    }

    /// Updates a storage slot of an existing account, returning the new
    /// root. Writing to a non-existing account is a no-op; writing the zero
    /// value deletes the slot.
    pub fn set_value(
        &self,
        root: NodeRef,
        address: Address,
        key: Key,
        value: Value,
    ) -> Result<NodeRef, MptError> {
        self.record(
            algebra::set_value(&self.store, root, &address, &key, &value)
                .map(|(new_root, _)| new_root),
        )
    }

    /// Reads a storage slot; absent slots read as zero.
    pub fn get_value(&self, root: NodeRef, address: Address, key: Key) -> Result<Value, MptError> {
        self.record(algebra::get_value(&self.store, root, &address, &key))
    }

    /// Drops the whole storage of an account, returning the new root.
    pub fn clear_storage(&self, root: NodeRef, address: Address) -> Result<NodeRef, MptError> {
        self.record(
            algebra::clear_storage(&self.store, root, &address).map(|(new_root, _)| new_root),
        )
    }

    /// Marks the subtree immutable; further updates copy instead of mutate.
    pub fn freeze(&self, root: NodeRef) -> Result<(), MptError> {
        self.record(self.store.freeze(root))
    }

    // --- hashing -------------------------------------------------------------

    /// Recomputes all dirty hashes under `root` and returns the root hash
    /// plus the refreshed `(id, hash)` pairs.
    pub fn update_hashes_for(
        &self,
        root: NodeRef,
    ) -> Result<(Hash, Vec<(NodeId, Hash)>), MptError> {
        self.record(hasher::update_hashes(&self.store, root))
    }

    /// Installs precomputed hashes below `root`, e.g. when restoring an
    /// archive.
    pub fn set_hashes_for(
        &self,
        _root: NodeRef,
        hashes: &[(NodeId, Hash)],
    ) -> Result<(), MptError> {
        self.record(hasher::set_hashes(&self.store, hashes))
    }

    /// The hash of a node, served from cache when clean.
    pub fn get_hash_for(&self, node_ref: NodeRef) -> Result<Hash, MptError> {
        self.record(hasher::get_hash(&self.store, node_ref))
    }

    // --- inspection ----------------------------------------------------------

    /// Pre-order traversal with cooperative cancellation. Returns whether
    /// the visitor aborted.
    pub fn visit_trie(
        &self,
        root: NodeRef,
        visitor: &mut dyn NodeVisitor,
        cancel: &CancelToken,
    ) -> Result<bool, MptError> {
        self.record(crate::visit::visit_trie(&self.store, root, visitor, cancel))
    }

    /// A textual outline of the subtree, for debugging.
    pub fn dump(&self, root: NodeRef) -> Result<String, MptError> {
        self.record(crate::visit::dump(&self.store, root))
    }

    /// Verifies the structural invariants of a single trie.
    pub fn check(&self, root: NodeRef) -> Result<(), MptError> {
        self.record(check::check_trie(&self.store, root))
    }

    /// Verifies several roots and the cross-root aliasing rule: shared
    /// nodes must be frozen.
    pub fn check_forest(&self, roots: &[NodeRef]) -> Result<(), MptError> {
        self.record(check::check_forest(&self.store, roots))
    }

    // --- lifecycle -----------------------------------------------------------

    /// Makes all writes performed so far durable. Scheduled releases are
    /// drained first, then dirty nodes and the write buffer, then the
    /// stocks. Returns the join of every issue encountered so far.
    pub fn flush(&self) -> Result<(), MptError> {
        self.release.sync();
        let mut issues = self.issues.lock();
        issues.extend(self.release.collect_release_worker_errors());
        issues.extend(self.store.flush());
        let all = issues.clone();
        drop(issues);
        MptError::join(all).map_or(Ok(()), Err)
    }

    /// Flushes, stops the background workers, and closes the stocks in
    /// their fixed order. Returns the join of all issues and teardown
    /// errors.
    pub fn close(self) -> Result<(), MptError> {
        let errors = self.shutdown();
        let mut issues = self.issues.lock();
        issues.extend(errors);
        let all = issues.clone();
        drop(issues);
        MptError::join(all).map_or(Ok(()), Err)
    }

    /// Errors recorded by any operation or worker since opening, in order.
    pub fn get_encountered_issues(&self) -> Vec<MptError> {
        self.issues.lock().clone()
    }

    fn shutdown(&self) -> Vec<MptError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut errors = Vec::new();
        // the worker's channel only disconnects once the store lets go of
        // its sender
        self.store.clear_release_sender();
        self.release.close();
        errors.extend(self.release.collect_release_worker_errors());
        errors.extend(self.store.close());
        errors
    }

    fn record<T>(&self, result: Result<T, MptError>) -> Result<T, MptError> {
        if let Err(err) = &result {
            self.issues.lock().push(err.clone());
        }
        result
    }
}

impl Drop for Forest {
    fn drop(&mut self) {
        let errors = self.shutdown();
        for err in errors {
            warn!(%err, "error while dropping forest");
        }
    }
}

fn check_or_write_meta(
    directory: &Path,
    config: &MptConfig,
    mode: Mode,
) -> Result<(), MptError> {
    let path = directory.join(FOREST_META_FILE);
    let meta = ForestMeta {
        configuration: config.name.to_string(),
        mutable: mode == Mode::Mutable,
    };
    if path.exists() {
        let raw = fs::read(&path).map_err(MptError::from_io)?;
        let existing: ForestMeta = serde_json::from_slice(&raw).map_err(|err| {
            MptError::IncompatibleMetadata(format!(
                "corrupted forest metadata in {}: {err}",
                path.display()
            ))
        })?;
        if existing != meta {
            return Err(MptError::IncompatibleMetadata(format!(
                "directory {} holds a {} forest (mutable: {}), requested {} (mutable: {})",
                directory.display(),
                existing.configuration,
                existing.mutable,
                meta.configuration,
                meta.mutable,
            )));
        }
    } else {
        let raw = serde_json::to_vec_pretty(&meta)
            .map_err(|err| MptError::Shutdown(format!("cannot serialize forest metadata: {err}")))?;
        fs::write(&path, raw).map_err(MptError::from_io)?;
    }
    Ok(())
}

pub(crate) fn codec_options(config: &MptConfig, mode: Mode) -> CodecOptions {
    CodecOptions {
        with_hash: config.hashing == Hashing::EthereumLikeHashing,
        frozen_on_load: mode == Mode::Immutable,
    }
}

pub(crate) fn memory_stock_set(config: &MptConfig, mode: Mode) -> Arc<StockSet> {
    let opts = codec_options(config, mode);
    Arc::new(StockSet {
        branches: Box::new(MemoryStock::new(Box::new(BranchCodec::new(opts)))),
        extensions: Box::new(MemoryStock::new(Box::new(ExtensionCodec::new(opts)))),
        accounts: Box::new(MemoryStock::new(Box::new(AccountCodec::new(opts)))),
        values: Box::new(MemoryStock::new(Box::new(ValueCodec::new(opts)))),
    })
}

pub(crate) fn file_stock_set(
    directory: &Path,
    config: &MptConfig,
    mode: Mode,
) -> Result<Arc<StockSet>, MptError> {
    let opts = codec_options(config, mode);
    Ok(Arc::new(StockSet {
        branches: Box::new(FileStock::open(
            &directory.join("branches"),
            "branches",
            Box::new(BranchCodec::new(opts)),
        )?),
        extensions: Box::new(FileStock::open(
            &directory.join("extensions"),
            "extensions",
            Box::new(ExtensionCodec::new(opts)),
        )?),
        accounts: Box::new(FileStock::open(
            &directory.join("accounts"),
            "accounts",
            Box::new(AccountCodec::new(opts)),
        )?),
        values: Box::new(FileStock::open(
            &directory.join("values"),
            "values",
            Box::new(ValueCodec::new(opts)),
        )?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{S4_LIVE_CONFIG, S5_LIVE_CONFIG};
    use crate::hasher::EMPTY_TRIE_HASH;
    use crate::node::{BranchNode, Node};
    use crate::stock::Stock;
    use crate::visit::{visitor_fn, VisitInfo, VisitResponse};
    use arbor_rlp::encode::RLPEncode;
    use arbor_rlp::structs::Encoder;
    use ethereum_types::U256;

    /// A raw-path flavor with deterministic trie shapes, handy for tests
    /// that assert structure.
    const RAW_CONFIG: MptConfig = MptConfig {
        name: "Raw-Test",
        hashing: Hashing::DirectHashing,
        use_hashed_paths: false,
        track_suffix_lengths: false,
    };

    fn addr(first: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        Address::from(bytes)
    }

    fn key(first: u8) -> Key {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        Key::from(bytes)
    }

    fn val(byte: u8) -> Value {
        Value::repeat_byte(byte)
    }

    fn info(nonce: u64) -> AccountInfo {
        AccountInfo {
            nonce,
            ..Default::default()
        }
    }

    fn live(config: MptConfig) -> Forest {
        Forest::open_in_memory(
            config,
            ForestConfig {
                mode: Mode::Mutable,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn archive(config: MptConfig) -> Forest {
        Forest::open_in_memory(
            config,
            ForestConfig {
                mode: Mode::Immutable,
                ..Default::default()
            },
        )
        .unwrap()
    }

    // --- basic account handling ---------------------------------------------

    #[test]
    fn set_and_get_single_account() {
        let forest = live(S4_LIVE_CONFIG);
        let root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(12))
            .unwrap();
        assert!(!root.is_empty());
        let (found, exists) = forest.get_account_info(root, addr(1)).unwrap();
        assert!(exists);
        assert_eq!(found.nonce, 12);
        let (_, exists) = forest.get_account_info(root, addr(2)).unwrap();
        assert!(!exists);
        forest.check(root).unwrap();
    }

    #[test]
    fn many_accounts_round_trip() {
        let forest = live(S4_LIVE_CONFIG);
        let mut root = NodeRef::EMPTY;
        for i in 1..=40u8 {
            root = forest.set_account_info(root, addr(i), info(i as u64)).unwrap();
        }
        forest.check(root).unwrap();
        for i in 1..=40u8 {
            let (found, exists) = forest.get_account_info(root, addr(i)).unwrap();
            assert!(exists, "account {i} vanished");
            assert_eq!(found.nonce, i as u64);
        }
    }

    #[test]
    fn setting_zero_info_on_missing_account_is_a_noop() {
        let forest = live(S4_LIVE_CONFIG);
        let root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), AccountInfo::default())
            .unwrap();
        assert!(root.is_empty());
    }

    #[test]
    fn account_update_is_idempotent() {
        let forest = live(S4_LIVE_CONFIG);
        let (root, changed) =
            algebra::set_account_info(&forest.store, NodeRef::EMPTY, &addr(1), &info(5)).unwrap();
        assert!(changed);
        let (root2, changed2) =
            algebra::set_account_info(&forest.store, root, &addr(1), &info(5)).unwrap();
        assert!(!changed2);
        assert_eq!(root, root2);
    }

    #[test]
    fn deleting_one_of_two_accounts_collapses_the_branch() {
        let forest = live(RAW_CONFIG);
        let mut root = NodeRef::EMPTY;
        root = forest.set_account_info(root, addr(0x10), info(1)).unwrap();
        root = forest.set_account_info(root, addr(0x20), info(2)).unwrap();
        forest.check(root).unwrap();
        root = forest
            .set_account_info(root, addr(0x20), AccountInfo::default())
            .unwrap();
        forest.check(root).unwrap();
        let (found, exists) = forest.get_account_info(root, addr(0x10)).unwrap();
        assert!(exists);
        assert_eq!(found.nonce, 1);
        let (_, exists) = forest.get_account_info(root, addr(0x20)).unwrap();
        assert!(!exists);
    }

    #[test]
    fn accounts_with_shared_prefix_build_and_unbuild_extensions() {
        let forest = live(RAW_CONFIG);
        let mut root = NodeRef::EMPTY;
        // 0x11 and 0x12 share the first nibble, 0x40 does not
        root = forest.set_account_info(root, addr(0x11), info(1)).unwrap();
        root = forest.set_account_info(root, addr(0x12), info(2)).unwrap();
        root = forest.set_account_info(root, addr(0x40), info(3)).unwrap();
        forest.check(root).unwrap();
        for (a, n) in [(0x11u8, 1u64), (0x12, 2), (0x40, 3)] {
            let (found, exists) = forest.get_account_info(root, addr(a)).unwrap();
            assert!(exists);
            assert_eq!(found.nonce, n);
        }
        // removing 0x12 collapses the inner branch into the leaf again
        root = forest
            .set_account_info(root, addr(0x12), AccountInfo::default())
            .unwrap();
        forest.check(root).unwrap();
        let (found, exists) = forest.get_account_info(root, addr(0x11)).unwrap();
        assert!(exists);
        assert_eq!(found.nonce, 1);
    }

    // --- storage slots ------------------------------------------------------

    #[test]
    fn set_and_get_storage_values() {
        let forest = live(S4_LIVE_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        root = forest.set_value(root, addr(1), key(1), val(7)).unwrap();
        root = forest.set_value(root, addr(1), key(2), val(8)).unwrap();
        forest.check(root).unwrap();
        assert_eq!(forest.get_value(root, addr(1), key(1)).unwrap(), val(7));
        assert_eq!(forest.get_value(root, addr(1), key(2)).unwrap(), val(8));
        assert_eq!(
            forest.get_value(root, addr(1), key(3)).unwrap(),
            Value::zero()
        );
        // absent account reads as zero as well
        assert_eq!(
            forest.get_value(root, addr(9), key(1)).unwrap(),
            Value::zero()
        );
    }

    #[test]
    fn writing_a_slot_of_a_missing_account_is_a_noop() {
        let forest = live(S4_LIVE_CONFIG);
        let root = forest
            .set_value(NodeRef::EMPTY, addr(1), key(1), val(1))
            .unwrap();
        assert!(root.is_empty());
        assert_eq!(
            forest.get_value(root, addr(1), key(1)).unwrap(),
            Value::zero()
        );
    }

    #[test]
    fn zero_write_deletes_a_slot_and_collapses_storage() {
        let forest = live(RAW_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        // keys 0x11 and 0x12 share a nibble, forcing an extension + branch
        root = forest.set_value(root, addr(1), key(0x11), val(1)).unwrap();
        root = forest.set_value(root, addr(1), key(0x12), val(2)).unwrap();
        forest.check(root).unwrap();
        root = forest
            .set_value(root, addr(1), key(0x12), Value::zero())
            .unwrap();
        forest.check(root).unwrap();
        assert_eq!(forest.get_value(root, addr(1), key(0x11)).unwrap(), val(1));
        assert_eq!(
            forest.get_value(root, addr(1), key(0x12)).unwrap(),
            Value::zero()
        );
        // deleting a slot that never existed changes nothing
        let same = forest
            .set_value(root, addr(1), key(0x77), Value::zero())
            .unwrap();
        assert_eq!(same, root);
    }

    #[test]
    fn clear_storage_empties_an_account() {
        let forest = live(S4_LIVE_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        for i in 1..=8u8 {
            root = forest.set_value(root, addr(1), key(i), val(i)).unwrap();
        }
        root = forest.clear_storage(root, addr(1)).unwrap();
        forest.check(root).unwrap();
        for i in 1..=8u8 {
            assert_eq!(
                forest.get_value(root, addr(1), key(i)).unwrap(),
                Value::zero()
            );
        }
        let (found, exists) = forest.get_account_info(root, addr(1)).unwrap();
        assert!(exists);
        assert_eq!(found.nonce, 1);
    }

    #[test]
    fn s5_config_maintains_suffix_lengths_through_churn() {
        let forest = live(S5_LIVE_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        for i in 1..=16u8 {
            root = forest.set_value(root, addr(1), key(i), val(i)).unwrap();
        }
        for i in (1..=16u8).step_by(2) {
            root = forest
                .set_value(root, addr(1), key(i), Value::zero())
                .unwrap();
        }
        for i in 2..=12u8 {
            root = forest.set_account_info(root, addr(i), info(i as u64)).unwrap();
        }
        // check() verifies the tracked lengths against actual depths
        forest.check(root).unwrap();
        for i in (2..=16u8).step_by(2) {
            assert_eq!(forest.get_value(root, addr(1), key(i)).unwrap(), val(i));
        }
    }

    // --- persistence: set, hash, close, reopen, get --------------------------

    #[test]
    fn basic_set_get_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (root, first_hash) = {
            let forest =
                Forest::open(dir.path(), S4_LIVE_CONFIG, ForestConfig::default()).unwrap();
            let root = forest
                .set_account_info(NodeRef::EMPTY, addr(1), info(0x0c))
                .unwrap();
            let (hash, _) = forest.update_hashes_for(root).unwrap();
            forest.close().unwrap();
            (root, hash)
        };
        let forest = Forest::open(dir.path(), S4_LIVE_CONFIG, ForestConfig::default()).unwrap();
        let (found, exists) = forest.get_account_info(root, addr(1)).unwrap();
        assert!(exists);
        assert_eq!(found.nonce, 0x0c);
        forest.check(root).unwrap();
        assert_eq!(forest.get_hash_for(root).unwrap(), first_hash);
        forest.close().unwrap();
    }

    #[test]
    fn reopening_with_another_flavor_fails() {
        let dir = tempfile::tempdir().unwrap();
        Forest::open(dir.path(), S4_LIVE_CONFIG, ForestConfig::default())
            .unwrap()
            .close()
            .unwrap();
        let result = Forest::open(dir.path(), S5_LIVE_CONFIG, ForestConfig::default());
        assert!(matches!(result, Err(MptError::IncompatibleMetadata(_))));
        let result = Forest::open(
            dir.path(),
            S4_LIVE_CONFIG,
            ForestConfig {
                mode: Mode::Immutable,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(MptError::IncompatibleMetadata(_))));
    }

    #[test]
    fn directory_is_exclusively_locked() {
        let dir = tempfile::tempdir().unwrap();
        let forest = Forest::open(dir.path(), S4_LIVE_CONFIG, ForestConfig::default()).unwrap();
        assert!(matches!(
            Forest::open(dir.path(), S4_LIVE_CONFIG, ForestConfig::default()),
            Err(MptError::Locked(_))
        ));
        forest.close().unwrap();
        Forest::open(dir.path(), S4_LIVE_CONFIG, ForestConfig::default())
            .unwrap()
            .close()
            .unwrap();
    }

    // --- account deletion releases its storage exactly once ------------------

    struct CountingStock<V> {
        inner: Box<dyn Stock<V>>,
        deletes: Arc<Mutex<Vec<u64>>>,
    }

    impl<V> Stock<V> for CountingStock<V> {
        fn reserve(&self) -> Result<u64, MptError> {
            self.inner.reserve()
        }
        fn get(&self, index: u64) -> Result<V, MptError> {
            self.inner.get(index)
        }
        fn set(&self, index: u64, value: &V) -> Result<(), MptError> {
            self.inner.set(index, value)
        }
        fn delete(&self, index: u64) -> Result<(), MptError> {
            self.deletes.lock().push(index);
            self.inner.delete(index)
        }
        fn flush(&self) -> Result<(), MptError> {
            self.inner.flush()
        }
        fn close(&self) -> Result<(), MptError> {
            self.inner.close()
        }
    }

    #[test]
    fn deleting_an_account_deletes_its_storage_exactly_once() {
        let config = RAW_CONFIG;
        let opts = codec_options(&config, Mode::Mutable);
        let account_deletes = Arc::new(Mutex::new(Vec::new()));
        let value_deletes = Arc::new(Mutex::new(Vec::new()));
        let stocks = Arc::new(StockSet {
            branches: Box::new(MemoryStock::new(Box::new(BranchCodec::new(opts)))),
            extensions: Box::new(MemoryStock::new(Box::new(ExtensionCodec::new(opts)))),
            accounts: Box::new(CountingStock {
                inner: Box::new(MemoryStock::new(Box::new(AccountCodec::new(opts)))),
                deletes: Arc::clone(&account_deletes),
            }),
            values: Box::new(CountingStock {
                inner: Box::new(MemoryStock::new(Box::new(ValueCodec::new(opts)))),
                deletes: Arc::clone(&value_deletes),
            }),
        });
        let forest = Forest::with_stocks(
            stocks,
            config,
            ForestConfig {
                mode: Mode::Mutable,
                ..Default::default()
            },
            None,
        );
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(0), info(1))
            .unwrap();
        root = forest
            .set_value(root, addr(0), key(0), val(1))
            .unwrap();
        root = forest
            .set_account_info(root, addr(0), AccountInfo::default())
            .unwrap();
        assert!(root.is_empty());
        forest.flush().unwrap();
        assert_eq!(account_deletes.lock().as_slice(), &[0]);
        assert_eq!(value_deletes.lock().as_slice(), &[0]);
        forest.close().unwrap();
    }

    // --- archive mode preserves history --------------------------------------

    #[test]
    fn archive_preserves_history_across_updates() {
        let forest = archive(S4_LIVE_CONFIG);
        let root0 = NodeRef::EMPTY;
        forest.freeze(root0).unwrap();
        let root1 = forest.set_account_info(root0, addr(1), info(12)).unwrap();
        forest.freeze(root1).unwrap();
        let root2 = forest.set_account_info(root1, addr(1), info(14)).unwrap();
        forest.freeze(root2).unwrap();
        assert_ne!(root1, root2);
        let (found, _) = forest.get_account_info(root1, addr(1)).unwrap();
        assert_eq!(found.nonce, 12);
        let (found, _) = forest.get_account_info(root2, addr(1)).unwrap();
        assert_eq!(found.nonce, 14);
        forest.check_forest(&[root0, root1, root2]).unwrap();
    }

    #[test]
    fn archive_shares_untouched_storage_between_versions() {
        let forest = archive(S4_LIVE_CONFIG);
        let mut root1 = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        root1 = forest.set_value(root1, addr(1), key(1), val(7)).unwrap();
        root1 = forest.set_value(root1, addr(1), key(2), val(9)).unwrap();
        forest.freeze(root1).unwrap();
        let root2 = forest.set_value(root1, addr(1), key(1), val(8)).unwrap();
        assert_ne!(root1, root2);
        assert_eq!(forest.get_value(root1, addr(1), key(1)).unwrap(), val(7));
        assert_eq!(forest.get_value(root2, addr(1), key(1)).unwrap(), val(8));
        assert_eq!(forest.get_value(root2, addr(1), key(2)).unwrap(), val(9));
        forest.check_forest(&[root1, root2]).unwrap();
    }

    #[test]
    fn frozen_deletion_leaves_the_old_version_intact() {
        let forest = archive(S4_LIVE_CONFIG);
        let mut root1 = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        root1 = forest.set_account_info(root1, addr(2), info(2)).unwrap();
        forest.freeze(root1).unwrap();
        let root2 = forest
            .set_account_info(root1, addr(2), AccountInfo::default())
            .unwrap();
        let (_, exists) = forest.get_account_info(root2, addr(2)).unwrap();
        assert!(!exists);
        let (found, exists) = forest.get_account_info(root1, addr(2)).unwrap();
        assert!(exists);
        assert_eq!(found.nonce, 2);
        forest.check_forest(&[root1, root2]).unwrap();
    }

    // --- live mode overwrites history ----------------------------------------

    #[test]
    fn live_mode_overwrites_history_in_place() {
        let forest = live(S4_LIVE_CONFIG);
        let root1 = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(12))
            .unwrap();
        let root2 = forest.set_account_info(root1, addr(1), info(14)).unwrap();
        assert_eq!(root1, root2);
        let (found, _) = forest.get_account_info(root1, addr(1)).unwrap();
        assert_eq!(found.nonce, 14);
    }

    // --- minimal cache and buffer under contention ---------------------------

    #[test]
    fn stress_with_minimal_cache_and_write_buffer() {
        let forest = Forest::with_stocks(
            memory_stock_set(&S4_LIVE_CONFIG, Mode::Mutable),
            S4_LIVE_CONFIG,
            ForestConfig {
                mode: Mode::Mutable,
                cache_capacity: 1,
                write_buffer_channel_size: 1,
            },
            None,
        );
        let root_a = Mutex::new(NodeRef::EMPTY);
        let root_b = Mutex::new(NodeRef::EMPTY);
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for i in 0..250u64 {
                        for (root, base) in [(&root_a, 0x10u8), (&root_b, 0x80u8)] {
                            let mut guard = root.lock();
                            let address = addr(base + (i % 8) as u8);
                            *guard = forest
                                .set_account_info(*guard, address, info(i + 1))
                                .unwrap();
                        }
                    }
                });
            }
        });
        let (root_a, root_b) = (*root_a.lock(), *root_b.lock());
        forest.check_forest(&[root_a, root_b]).unwrap();
        for base in [0x10u8, 0x80] {
            for offset in 0..8u8 {
                let root = if base == 0x10 { root_a } else { root_b };
                let (_, exists) = forest.get_account_info(root, addr(base + offset)).unwrap();
                assert!(exists);
            }
        }
        forest.flush().unwrap();
        forest.close().unwrap();
    }

    #[test]
    fn concurrent_readers_on_a_frozen_root_see_a_stable_snapshot() {
        let forest = archive(S4_LIVE_CONFIG);
        let mut root = NodeRef::EMPTY;
        for i in 1..=8u8 {
            root = forest.set_account_info(root, addr(i), info(i as u64)).unwrap();
        }
        for i in 1..=8u8 {
            root = forest.set_value(root, addr(i), key(i), val(i)).unwrap();
        }
        forest.freeze(root).unwrap();
        let frozen = root;
        std::thread::scope(|scope| {
            // a writer keeps deriving new versions while readers pin the
            // frozen one
            let writer = scope.spawn(|| {
                let mut head = frozen;
                for n in 100..140u64 {
                    head = forest.set_account_info(head, addr(1), info(n)).unwrap();
                    forest.freeze(head).unwrap();
                }
                head
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        for i in 1..=8u8 {
                            let (found, exists) =
                                forest.get_account_info(frozen, addr(i)).unwrap();
                            assert!(exists);
                            assert_eq!(found.nonce, i as u64);
                            assert_eq!(
                                forest.get_value(frozen, addr(i), key(i)).unwrap(),
                                val(i)
                            );
                        }
                    }
                });
            }
            let head = writer.join().unwrap();
            let (found, _) = forest.get_account_info(head, addr(1)).unwrap();
            assert_eq!(found.nonce, 139);
        });
    }

    // --- injected stock failures surface everywhere --------------------------

    struct FailingStock<V> {
        inner: Box<dyn Stock<V>>,
        armed: Arc<AtomicBool>,
        error: MptError,
    }

    impl<V> Stock<V> for FailingStock<V> {
        fn reserve(&self) -> Result<u64, MptError> {
            self.inner.reserve()
        }
        fn get(&self, index: u64) -> Result<V, MptError> {
            if self.armed.load(Ordering::SeqCst) {
                return Err(self.error.clone());
            }
            self.inner.get(index)
        }
        fn set(&self, index: u64, value: &V) -> Result<(), MptError> {
            self.inner.set(index, value)
        }
        fn delete(&self, index: u64) -> Result<(), MptError> {
            self.inner.delete(index)
        }
        fn flush(&self) -> Result<(), MptError> {
            self.inner.flush()
        }
        fn close(&self) -> Result<(), MptError> {
            self.inner.close()
        }
    }

    #[test]
    fn injected_branch_read_failure_surfaces_in_call_issues_flush_and_close() {
        let injected = MptError::from_io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected disk failure",
        ));
        let config = RAW_CONFIG;
        let opts = codec_options(&config, Mode::Mutable);
        let armed = Arc::new(AtomicBool::new(false));
        let stocks = Arc::new(StockSet {
            branches: Box::new(FailingStock {
                inner: Box::new(MemoryStock::new(Box::new(BranchCodec::new(opts)))),
                armed: Arc::clone(&armed),
                error: injected.clone(),
            }),
            extensions: Box::new(MemoryStock::new(Box::new(ExtensionCodec::new(opts)))),
            accounts: Box::new(MemoryStock::new(Box::new(AccountCodec::new(opts)))),
            values: Box::new(MemoryStock::new(Box::new(ValueCodec::new(opts)))),
        });
        let forest = Forest::with_stocks(
            stocks,
            config,
            ForestConfig {
                mode: Mode::Mutable,
                cache_capacity: 1,
                write_buffer_channel_size: 4,
            },
            None,
        );
        // two diverging accounts put a branch at the root
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(0x10), info(1))
            .unwrap();
        root = forest.set_account_info(root, addr(0x20), info(2)).unwrap();
        forest.flush().unwrap();
        // navigate once so the root branch is evicted from the 1-entry cache
        forest.get_account_info(root, addr(0x20)).unwrap();

        armed.store(true, Ordering::SeqCst);
        let err = forest.get_account_info(root, addr(0x10)).unwrap_err();
        assert_eq!(err, injected);
        assert!(forest
            .get_encountered_issues()
            .iter()
            .any(|issue| *issue == injected));
        let flush_err = forest.flush().unwrap_err();
        assert!(flush_err.contains(&injected));
        let close_err = forest.close().unwrap_err();
        assert!(close_err.contains(&injected));
    }

    // --- hashing -------------------------------------------------------------

    #[test]
    fn empty_root_hashes_to_scheme_constant() {
        let direct = live(S4_LIVE_CONFIG);
        let (hash, hints) = direct.update_hashes_for(NodeRef::EMPTY).unwrap();
        assert_eq!(hash, Hash::zero());
        assert!(hints.is_empty());

        let ethereum = live(S5_LIVE_CONFIG);
        let (hash, _) = ethereum.update_hashes_for(NodeRef::EMPTY).unwrap();
        assert_eq!(hash, *EMPTY_TRIE_HASH);
    }

    #[test]
    fn hashing_is_deterministic_and_tracks_mutations() {
        let forest = live(S4_LIVE_CONFIG);
        let mut root = NodeRef::EMPTY;
        for i in 1..=10u8 {
            root = forest.set_account_info(root, addr(i), info(i as u64)).unwrap();
        }
        let (h1, hints) = forest.update_hashes_for(root).unwrap();
        assert!(!hints.is_empty());
        let (h2, hints2) = forest.update_hashes_for(root).unwrap();
        assert_eq!(h1, h2);
        // a second pass over a clean tree recomputes nothing
        assert!(hints2.is_empty());
        root = forest.set_account_info(root, addr(5), info(55)).unwrap();
        let (h3, _) = forest.update_hashes_for(root).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn ethereum_hash_of_single_account_matches_manual_encoding() {
        let forest = live(S5_LIVE_CONFIG);
        let account = AccountInfo {
            nonce: 12,
            balance: 1_000,
            code_hash: Hash::zero(),
        };
        let root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), account)
            .unwrap();
        let (hash, _) = forest.update_hashes_for(root).unwrap();

        let mut body = Vec::new();
        Encoder::new(&mut body)
            .encode_field(&12u64)
            .encode_field(&1_000u128)
            .encode_field(&*EMPTY_TRIE_HASH)
            .encode_field(&Hash::zero())
            .finish();
        let path = S5_LIVE_CONFIG.address_path(&addr(1));
        let mut leaf = Vec::new();
        Encoder::new(&mut leaf)
            .encode_field(&path.encode_compact(true))
            .encode_field::<[u8]>(&body)
            .finish();
        assert_eq!(hash, crate::hasher::keccak256(&leaf));
    }

    #[test]
    fn ethereum_hash_covers_storage_roots() {
        let forest = live(S5_LIVE_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        root = forest.set_value(root, addr(1), key(1), val(7)).unwrap();
        let (hash, _) = forest.update_hashes_for(root).unwrap();

        let mut slot = Vec::new();
        Encoder::new(&mut slot)
            .encode_field(&S5_LIVE_CONFIG.key_path(&key(1)).encode_compact(true))
            .encode_field::<[u8]>(&U256::from_big_endian(val(7).as_bytes()).encode_to_vec())
            .finish();
        let storage_root = crate::hasher::keccak256(&slot);

        let mut body = Vec::new();
        Encoder::new(&mut body)
            .encode_field(&1u64)
            .encode_field(&0u128)
            .encode_field(&storage_root)
            .encode_field(&Hash::zero())
            .finish();
        let mut leaf = Vec::new();
        Encoder::new(&mut leaf)
            .encode_field(&S5_LIVE_CONFIG.address_path(&addr(1)).encode_compact(true))
            .encode_field::<[u8]>(&body)
            .finish();
        assert_eq!(hash, crate::hasher::keccak256(&leaf));
    }

    #[test]
    fn installed_hashes_are_served_without_recomputation() {
        let forest = live(S4_LIVE_CONFIG);
        let root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        let fake = Hash::repeat_byte(0xfe);
        forest
            .set_hashes_for(root, &[(root.id(), fake)])
            .unwrap();
        assert_eq!(forest.get_hash_for(root).unwrap(), fake);
    }

    #[test]
    fn update_hashes_returns_hints_for_restoration() {
        let forest = live(S4_LIVE_CONFIG);
        let mut root = NodeRef::EMPTY;
        for i in 1..=4u8 {
            root = forest.set_account_info(root, addr(i), info(i as u64)).unwrap();
        }
        let (hash, hints) = forest.update_hashes_for(root).unwrap();
        assert!(hints.iter().any(|(id, _)| *id == root.id()));
        let root_hint = hints.iter().find(|(id, _)| *id == root.id()).unwrap();
        assert_eq!(root_hint.1, hash);
    }

    // --- visiting and dumping ------------------------------------------------

    #[test]
    fn visit_walks_accounts_and_storage() {
        let forest = live(RAW_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(0x10), info(1))
            .unwrap();
        root = forest.set_account_info(root, addr(0x20), info(2)).unwrap();
        root = forest.set_value(root, addr(0x10), key(1), val(1)).unwrap();
        let mut accounts = 0;
        let mut values = 0;
        let mut branches = 0;
        let aborted = forest
            .visit_trie(
                root,
                &mut visitor_fn(|node: &Node, _info: VisitInfo| {
                    match node {
                        Node::Account(_) => accounts += 1,
                        Node::Value(_) => values += 1,
                        Node::Branch(_) => branches += 1,
                        _ => {}
                    }
                    VisitResponse::Continue
                }),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(!aborted);
        assert_eq!(accounts, 2);
        assert_eq!(values, 1);
        assert!(branches >= 1);
    }

    #[test]
    fn visit_supports_pruning_and_aborting() {
        let forest = live(RAW_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(0x10), info(1))
            .unwrap();
        root = forest.set_value(root, addr(0x10), key(1), val(1)).unwrap();
        let mut values = 0;
        forest
            .visit_trie(
                root,
                &mut visitor_fn(|node: &Node, _: VisitInfo| match node {
                    Node::Account(_) => VisitResponse::Prune,
                    Node::Value(_) => {
                        values += 1;
                        VisitResponse::Continue
                    }
                    _ => VisitResponse::Continue,
                }),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(values, 0);

        let mut seen = 0;
        let aborted = forest
            .visit_trie(
                root,
                &mut visitor_fn(|_: &Node, _: VisitInfo| {
                    seen += 1;
                    VisitResponse::Abort
                }),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(aborted);
        assert_eq!(seen, 1);
    }

    #[test]
    fn canceled_visit_returns_the_canceled_error() {
        let forest = live(S4_LIVE_CONFIG);
        let root = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = forest.visit_trie(
            root,
            &mut visitor_fn(|_: &Node, _: VisitInfo| VisitResponse::Continue),
            &cancel,
        );
        assert!(matches!(result, Err(MptError::Canceled)));
    }

    #[test]
    fn dump_renders_an_outline() {
        let forest = live(RAW_CONFIG);
        let mut root = forest
            .set_account_info(NodeRef::EMPTY, addr(0x10), info(1))
            .unwrap();
        root = forest.set_account_info(root, addr(0x20), info(2)).unwrap();
        let dump = forest.dump(root).unwrap();
        assert!(dump.contains("branch"));
        assert!(dump.contains("account"));
        assert_eq!(forest.dump(NodeRef::EMPTY).unwrap(), "(empty)\n");
    }

    // --- integrity checking --------------------------------------------------

    #[test]
    fn check_rejects_underfilled_branches() {
        let forest = live(S4_LIVE_CONFIG);
        let leaf = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        let mut children = [NodeRef::EMPTY; 16];
        children[3] = leaf;
        let branch = forest.store.create(Node::Branch(BranchNode::new(children))).unwrap();
        assert!(matches!(
            forest.check(branch),
            Err(MptError::Consistency(_))
        ));
    }

    #[test]
    fn check_forest_rejects_shared_mutable_nodes() {
        let forest = live(S4_LIVE_CONFIG);
        let leaf = forest
            .set_account_info(NodeRef::EMPTY, addr(1), info(1))
            .unwrap();
        assert!(matches!(
            forest.check_forest(&[leaf, leaf]),
            Err(MptError::Consistency(_))
        ));
        forest.freeze(leaf).unwrap();
        forest.check_forest(&[leaf, leaf]).unwrap();
    }

    #[test]
    fn randomized_updates_stay_consistent() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::HashMap;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let forest = live(S5_LIVE_CONFIG);
        let mut root = NodeRef::EMPTY;
        let mut reference: HashMap<(u8, u8), Value> = HashMap::new();
        for _ in 0..500 {
            let a = rng.gen_range(1..6u8);
            let k = rng.gen_range(0..12u8);
            if reference.get(&(a, 0)).is_none() {
                root = forest.set_account_info(root, addr(a), info(a as u64)).unwrap();
                reference.insert((a, 0), Value::repeat_byte(1));
            }
            let value = if rng.gen_bool(0.25) {
                Value::zero()
            } else {
                val(rng.gen_range(1..=255u8))
            };
            root = forest.set_value(root, addr(a), key(k), value).unwrap();
            reference.insert((a, k + 1), value);
        }
        forest.check(root).unwrap();
        for ((a, slot), expected) in &reference {
            if *slot == 0 {
                continue;
            }
            assert_eq!(
                forest.get_value(root, addr(*a), key(slot - 1)).unwrap(),
                *expected
            );
        }
        // hashing the whole thing twice is stable
        let (h1, _) = forest.update_hashes_for(root).unwrap();
        let (h2, _) = forest.update_hashes_for(root).unwrap();
        assert_eq!(h1, h2);
    }

    // --- shadowed stocks -----------------------------------------------------

    #[test]
    fn forest_runs_on_shadowed_stocks() {
        let config = S4_LIVE_CONFIG;
        let opts = codec_options(&config, Mode::Mutable);
        let stocks = Arc::new(StockSet {
            branches: Box::new(crate::shadow::ShadowStock::new(
                Box::new(MemoryStock::new(Box::new(BranchCodec::new(opts)))),
                Box::new(MemoryStock::new(Box::new(BranchCodec::new(opts)))),
            )),
            extensions: Box::new(crate::shadow::ShadowStock::new(
                Box::new(MemoryStock::new(Box::new(ExtensionCodec::new(opts)))),
                Box::new(MemoryStock::new(Box::new(ExtensionCodec::new(opts)))),
            )),
            accounts: Box::new(crate::shadow::ShadowStock::new(
                Box::new(MemoryStock::new(Box::new(AccountCodec::new(opts)))),
                Box::new(MemoryStock::new(Box::new(AccountCodec::new(opts)))),
            )),
            values: Box::new(crate::shadow::ShadowStock::new(
                Box::new(MemoryStock::new(Box::new(ValueCodec::new(opts)))),
                Box::new(MemoryStock::new(Box::new(ValueCodec::new(opts)))),
            )),
        });
        let forest = Forest::with_stocks(
            stocks,
            config,
            ForestConfig {
                mode: Mode::Mutable,
                cache_capacity: 2,
                write_buffer_channel_size: 2,
            },
            None,
        );
        let mut root = NodeRef::EMPTY;
        for i in 1..=12u8 {
            root = forest.set_account_info(root, addr(i), info(i as u64)).unwrap();
        }
        forest.check(root).unwrap();
        for i in 1..=12u8 {
            let (found, exists) = forest.get_account_info(root, addr(i)).unwrap();
            assert!(exists);
            assert_eq!(found.nonce, i as u64);
        }
        forest.flush().unwrap();
        forest.close().unwrap();
    }
}
