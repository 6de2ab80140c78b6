use crate::error::MptError;
use crate::ids::{NodeId, NodeRef};
use crate::nibbles::Nibbles;
use crate::node::branch::BranchHashes;
use crate::node::{AccountNode, BranchNode, ExtensionNode, HashCell, HashStatus, NodeBase, ValueNode};
use crate::stock::Codec;
use crate::types::{AccountInfo, Address, Hash, Key};

/// Options shared by all node codecs.
///
/// `with_hash` selects the encoding variant that persists the node's own
/// hash; it is enabled for Ethereum-style hashing where recomputation is
/// expensive. `frozen_on_load` marks loaded nodes frozen, which is the case
/// for archive forests where everything persisted has been frozen.
///
/// Some state deliberately does not round-trip: per-child hash caches come
/// back dirty (child hashes are not re-verified at load time) and embedded
/// markers are recomputed by the first hashing pass.
#[derive(Clone, Copy)]
pub struct CodecOptions {
    pub with_hash: bool,
    pub frozen_on_load: bool,
}

impl CodecOptions {
    fn hash_block_size(&self) -> usize {
        if self.with_hash {
            33
        } else {
            0
        }
    }

    fn store_hash_block(&self, buf: &mut [u8], cell: &HashCell) -> usize {
        if !self.with_hash {
            return 0;
        }
        let (status, hash) = cell.get();
        buf[0] = (status == HashStatus::Clean) as u8;
        buf[1..33].copy_from_slice(hash.as_bytes());
        33
    }

    fn load_hash_block(&self, buf: &[u8]) -> (HashCell, usize) {
        if !self.with_hash {
            return (HashCell::with_status(HashStatus::Unknown), 0);
        }
        let cell = if buf[0] == 1 {
            HashCell::clean(Hash::from_slice(&buf[1..33]))
        } else {
            HashCell::with_status(HashStatus::Dirty)
        };
        (cell, 33)
    }

    fn load_base(&self, buf: &[u8]) -> (NodeBase, usize) {
        let (cell, used) = self.load_hash_block(buf);
        (NodeBase::with_hash(self.frozen_on_load, cell), used)
    }
}

fn write_ref(buf: &mut [u8], node: NodeRef) {
    buf.copy_from_slice(&node.id().to_bits().to_le_bytes());
}

fn read_ref(buf: &[u8]) -> NodeRef {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(buf);
    NodeRef::new(NodeId::from_bits(u64::from_le_bytes(bytes)))
}

fn occupied_mask(children: &[NodeRef; 16]) -> u16 {
    let mut mask = 0u16;
    for (i, child) in children.iter().enumerate() {
        if !child.is_empty() {
            mask |= 1 << i;
        }
    }
    mask
}

pub struct BranchCodec {
    opts: CodecOptions,
}

impl BranchCodec {
    pub fn new(opts: CodecOptions) -> Self {
        BranchCodec { opts }
    }
}

impl Codec<BranchNode> for BranchCodec {
    fn encoded_size(&self) -> usize {
        16 * 8 + 2 + self.opts.hash_block_size()
    }

    fn store(&self, buf: &mut [u8], node: &BranchNode) -> Result<(), MptError> {
        let mut at = 0;
        for child in &node.children {
            write_ref(&mut buf[at..at + 8], *child);
            at += 8;
        }
        buf[at..at + 2].copy_from_slice(&node.frozen_children.to_le_bytes());
        at += 2;
        self.opts.store_hash_block(&mut buf[at..], node.base.hash_cell());
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<BranchNode, MptError> {
        let mut at = 0;
        let mut children = [NodeRef::EMPTY; 16];
        for child in children.iter_mut() {
            *child = read_ref(&buf[at..at + 8]);
            at += 8;
        }
        let stored_frozen = u16::from_le_bytes([buf[at], buf[at + 1]]);
        at += 2;
        let (base, _) = self.opts.load_base(&buf[at..]);
        let occupied = occupied_mask(&children);
        let frozen_children = if self.opts.frozen_on_load {
            occupied
        } else {
            stored_frozen
        };
        Ok(BranchNode::from_parts(
            children,
            frozen_children,
            base,
            BranchHashes {
                child_hashes: [Hash::zero(); 16],
                dirty: occupied,
                embedded: 0,
            },
        ))
    }
}

pub struct ExtensionCodec {
    opts: CodecOptions,
}

impl ExtensionCodec {
    pub fn new(opts: CodecOptions) -> Self {
        ExtensionCodec { opts }
    }
}

impl Codec<ExtensionNode> for ExtensionCodec {
    fn encoded_size(&self) -> usize {
        1 + 32 + 8 + self.opts.hash_block_size()
    }

    fn store(&self, buf: &mut [u8], node: &ExtensionNode) -> Result<(), MptError> {
        let path = node.path.as_slice();
        if path.len() > 64 {
            return Err(MptError::Corrupted(format!(
                "extension path of {} nibbles exceeds the maximum of 64",
                path.len()
            )));
        }
        buf[0] = path.len() as u8;
        let mut packed = [0u8; 32];
        for (i, nibble) in path.iter().enumerate() {
            if i % 2 == 0 {
                packed[i / 2] |= nibble << 4;
            } else {
                packed[i / 2] |= nibble;
            }
        }
        buf[1..33].copy_from_slice(&packed);
        write_ref(&mut buf[33..41], node.next);
        self.opts.store_hash_block(&mut buf[41..], node.base.hash_cell());
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<ExtensionNode, MptError> {
        let len = buf[0] as usize;
        if len > 64 {
            return Err(MptError::Corrupted(format!(
                "extension path length {len} out of range"
            )));
        }
        let mut path = Vec::with_capacity(len);
        for i in 0..len {
            let byte = buf[1 + i / 2];
            path.push(if i % 2 == 0 { byte >> 4 } else { byte & 0x0f });
        }
        let next = read_ref(&buf[33..41]);
        let (base, _) = self.opts.load_base(&buf[41..]);
        Ok(ExtensionNode::from_parts(Nibbles::from_hex(path), next, base))
    }
}

pub struct AccountCodec {
    opts: CodecOptions,
}

impl AccountCodec {
    pub fn new(opts: CodecOptions) -> Self {
        AccountCodec { opts }
    }
}

impl Codec<AccountNode> for AccountCodec {
    fn encoded_size(&self) -> usize {
        20 + 8 + 16 + 32 + 8 + 1 + self.opts.hash_block_size()
    }

    fn store(&self, buf: &mut [u8], node: &AccountNode) -> Result<(), MptError> {
        buf[0..20].copy_from_slice(node.address.as_bytes());
        buf[20..28].copy_from_slice(&node.info.nonce.to_le_bytes());
        buf[28..44].copy_from_slice(&node.info.balance.to_le_bytes());
        buf[44..76].copy_from_slice(node.info.code_hash.as_bytes());
        write_ref(&mut buf[76..84], node.storage);
        buf[84] = node.path_length;
        self.opts.store_hash_block(&mut buf[85..], node.base.hash_cell());
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<AccountNode, MptError> {
        let address = Address::from_slice(&buf[0..20]);
        let nonce = u64::from_le_bytes(buf[20..28].try_into().expect("fixed slice"));
        let balance = u128::from_le_bytes(buf[28..44].try_into().expect("fixed slice"));
        let code_hash = Hash::from_slice(&buf[44..76]);
        let storage = read_ref(&buf[76..84]);
        let path_length = buf[84];
        if path_length > 64 {
            return Err(MptError::Corrupted(format!(
                "account suffix length {path_length} out of range"
            )));
        }
        let (base, _) = self.opts.load_base(&buf[85..]);
        Ok(AccountNode::from_parts(
            address,
            AccountInfo {
                nonce,
                balance,
                code_hash,
            },
            storage,
            path_length,
            base,
        ))
    }
}

pub struct ValueCodec {
    opts: CodecOptions,
}

impl ValueCodec {
    pub fn new(opts: CodecOptions) -> Self {
        ValueCodec { opts }
    }
}

impl Codec<ValueNode> for ValueCodec {
    fn encoded_size(&self) -> usize {
        32 + 32 + 1 + self.opts.hash_block_size()
    }

    fn store(&self, buf: &mut [u8], node: &ValueNode) -> Result<(), MptError> {
        buf[0..32].copy_from_slice(node.key.as_bytes());
        buf[32..64].copy_from_slice(node.value.as_bytes());
        buf[64] = node.path_length;
        self.opts.store_hash_block(&mut buf[65..], node.base.hash_cell());
        Ok(())
    }

    fn load(&self, buf: &[u8]) -> Result<ValueNode, MptError> {
        let key = Key::from_slice(&buf[0..32]);
        let value = Hash::from_slice(&buf[32..64]);
        let path_length = buf[64];
        if path_length > 64 {
            return Err(MptError::Corrupted(format!(
                "value suffix length {path_length} out of range"
            )));
        }
        let (base, _) = self.opts.load_base(&buf[65..]);
        Ok(ValueNode::from_parts(key, value, path_length, base))
    }
}
