use ethereum_types::H256;

/// A 20-byte account address.
pub type Address = ethereum_types::Address;
/// A 32-byte storage slot key.
pub type Key = H256;
/// A 32-byte storage slot value; the all-zero value denotes an absent slot.
pub type Value = H256;
/// A 32-byte hash.
pub type Hash = H256;

/// The basic information tracked per account.
///
/// The all-zero value marks a non-existing account: setting it deletes the
/// account, and lookups of absent accounts report it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub nonce: u64,
    pub balance: u128,
    pub code_hash: Hash,
}

impl AccountInfo {
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance == 0 && self.code_hash.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_account_info() {
        assert!(AccountInfo::default().is_empty());
        assert!(!AccountInfo {
            nonce: 1,
            ..Default::default()
        }
        .is_empty());
        assert!(!AccountInfo {
            code_hash: Hash::repeat_byte(1),
            ..Default::default()
        }
        .is_empty());
    }
}
