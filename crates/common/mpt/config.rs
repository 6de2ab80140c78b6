use serde::{Deserialize, Serialize};

use crate::hasher::keccak256;
use crate::nibbles::Nibbles;
use crate::types::{Address, Key};

/// The hashing scheme of a forest, fixed at creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hashing {
    /// Recursive keccak over the node contents with child hashes substituted
    /// for child references. Fast; used for internal integrity and tests.
    DirectHashing,
    /// Canonical Ethereum world-state hashing over RLP node encodings with
    /// embedded small nodes. Requires suffix-length tracking in leaves.
    EthereumLikeHashing,
}

impl Hashing {
    pub fn name(&self) -> &'static str {
        match self {
            Hashing::DirectHashing => "direct",
            Hashing::EthereumLikeHashing => "ethereum",
        }
    }
}

/// Whether history is overwritten in place (live) or preserved through
/// freeze-aware copy-on-write (archive).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Mutable,
    Immutable,
}

/// The trie flavor: hashing scheme, path derivation, and leaf bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MptConfig {
    pub name: &'static str,
    pub hashing: Hashing,
    /// Derive paths from the keccak of addresses and keys instead of their
    /// raw bytes, spreading leaves evenly over the trie.
    pub use_hashed_paths: bool,
    /// Track the number of remaining path nibbles in account and value
    /// leaves; required by Ethereum hashing.
    pub track_suffix_lengths: bool,
}

pub const S4_LIVE_CONFIG: MptConfig = MptConfig {
    name: "S4-Live",
    hashing: Hashing::DirectHashing,
    use_hashed_paths: true,
    track_suffix_lengths: false,
};

pub const S4_ARCHIVE_CONFIG: MptConfig = MptConfig {
    name: "S4-Archive",
    hashing: Hashing::DirectHashing,
    use_hashed_paths: true,
    track_suffix_lengths: false,
};

pub const S5_LIVE_CONFIG: MptConfig = MptConfig {
    name: "S5-Live",
    hashing: Hashing::EthereumLikeHashing,
    use_hashed_paths: true,
    track_suffix_lengths: true,
};

pub const S5_ARCHIVE_CONFIG: MptConfig = MptConfig {
    name: "S5-Archive",
    hashing: Hashing::EthereumLikeHashing,
    use_hashed_paths: true,
    track_suffix_lengths: true,
};

impl MptConfig {
    /// The trie path of an account address under this configuration.
    pub fn address_path(&self, address: &Address) -> Nibbles {
        if self.use_hashed_paths {
            Nibbles::from_bytes(keccak256(address.as_bytes()).as_bytes())
        } else {
            Nibbles::from_bytes(address.as_bytes())
        }
    }

    /// The trie path of a storage key under this configuration.
    pub fn key_path(&self, key: &Key) -> Nibbles {
        if self.use_hashed_paths {
            Nibbles::from_bytes(keccak256(key.as_bytes()).as_bytes())
        } else {
            Nibbles::from_bytes(key.as_bytes())
        }
    }

    pub fn address_path_len(&self) -> usize {
        if self.use_hashed_paths {
            64
        } else {
            40
        }
    }

    pub fn key_path_len(&self) -> usize {
        64
    }

    pub fn validate(&self) -> Result<(), crate::error::MptError> {
        if self.hashing == Hashing::EthereumLikeHashing && !self.track_suffix_lengths {
            return Err(crate::error::MptError::IncompatibleMetadata(format!(
                "configuration {} selects Ethereum hashing without suffix-length tracking",
                self.name
            )));
        }
        Ok(())
    }
}

/// Runtime parameters of a forest instance.
#[derive(Clone, Copy, Debug)]
pub struct ForestConfig {
    pub mode: Mode,
    /// Upper bound on resident nodes in the cache.
    pub cache_capacity: usize,
    /// Capacity of the write buffer's submission channel; producers block
    /// when it is full.
    pub write_buffer_channel_size: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            mode: Mode::Mutable,
            cache_capacity: 1 << 16,
            write_buffer_channel_size: 1 << 10,
        }
    }
}

/// Contents of `forest.json`, guarding a directory against being reopened
/// with a different flavor.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub(crate) struct ForestMeta {
    #[serde(rename = "Configuration")]
    pub configuration: String,
    #[serde(rename = "Mutable")]
    pub mutable: bool,
}
