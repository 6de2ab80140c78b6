use ethereum_types::{Address, H256, U256};

use super::error::RLPDecodeError;

pub trait RLPDecode: Sized {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(buf: &[u8]) -> Result<Self, RLPDecodeError> {
        let (item, rest) = Self::decode_unfinished(buf)?;
        if !rest.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok(item)
    }
}

/// Splits the first RLP item off `buf`.
/// Returns `(is_list, payload, remaining)`.
pub fn decode_rlp_item(buf: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first = *buf.first().ok_or(RLPDecodeError::InvalidLength)?;
    match first {
        0x00..=0x7f => Ok((false, &buf[..1], &buf[1..])),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            split_payload(&buf[1..], len).map(|(p, r)| (false, p, r))
        }
        0xb8..=0xbf => {
            let len_len = (first - 0xb7) as usize;
            let (len, rest) = split_length(&buf[1..], len_len)?;
            split_payload(rest, len).map(|(p, r)| (false, p, r))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            split_payload(&buf[1..], len).map(|(p, r)| (true, p, r))
        }
        0xf8..=0xff => {
            let len_len = (first - 0xf7) as usize;
            let (len, rest) = split_length(&buf[1..], len_len)?;
            split_payload(rest, len).map(|(p, r)| (true, p, r))
        }
    }
}

fn split_length(buf: &[u8], len_len: usize) -> Result<(usize, &[u8]), RLPDecodeError> {
    if buf.len() < len_len || len_len > core::mem::size_of::<usize>() {
        return Err(RLPDecodeError::InvalidLength);
    }
    let mut len = 0usize;
    for byte in &buf[..len_len] {
        len = (len << 8) | *byte as usize;
    }
    Ok((len, &buf[len_len..]))
}

fn split_payload(buf: &[u8], len: usize) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    if buf.len() < len {
        return Err(RLPDecodeError::InvalidLength);
    }
    Ok(buf.split_at(len))
}

fn decode_bytes(buf: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    match decode_rlp_item(buf)? {
        (false, payload, rest) => Ok((payload, rest)),
        (true, _, _) => Err(RLPDecodeError::UnexpectedList),
    }
}

impl RLPDecode for Vec<u8> {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(buf)?;
        Ok((payload.to_vec(), rest))
    }
}

macro_rules! impl_decode_uint {
    ($t:ty) => {
        impl RLPDecode for $t {
            fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (payload, rest) = decode_bytes(buf)?;
                if payload.len() > core::mem::size_of::<$t>() {
                    return Err(RLPDecodeError::InvalidLength);
                }
                // Leading zeros are not canonical.
                if payload.first() == Some(&0) {
                    return Err(RLPDecodeError::MalformedData);
                }
                let mut value: $t = 0;
                for byte in payload {
                    value = value.wrapping_shl(8) | *byte as $t;
                }
                Ok((value, rest))
            }
        }
    };
}

impl_decode_uint!(u8);
impl_decode_uint!(u16);
impl_decode_uint!(u32);
impl_decode_uint!(u64);
impl_decode_uint!(u128);

impl RLPDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(buf)?;
        match payload {
            [] => Ok((false, rest)),
            [0x01] => Ok((true, rest)),
            _ => Err(RLPDecodeError::MalformedBoolean),
        }
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(buf)?;
        if payload.len() > 32 {
            return Err(RLPDecodeError::InvalidLength);
        }
        if payload.first() == Some(&0) {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((U256::from_big_endian(payload), rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(buf)?;
        if payload.len() != 32 {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok((H256::from_slice(payload), rest))
    }
}

impl RLPDecode for Address {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(buf)?;
        if payload.len() != 20 {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok((Address::from_slice(payload), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{encode, RLPEncode};
    use hex_literal::hex;

    #[test]
    fn decode_byte_strings() {
        assert_eq!(Vec::<u8>::decode(&hex!("83646f67")).unwrap(), b"dog");
        assert_eq!(Vec::<u8>::decode(&[0x00]).unwrap(), vec![0x00]);
        assert_eq!(Vec::<u8>::decode(&[0x80]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn decode_integers() {
        assert_eq!(u64::decode(&[0x80]).unwrap(), 0);
        assert_eq!(u64::decode(&hex!("820400")).unwrap(), 1024);
        assert!(u64::decode(&hex!("8200 01")).is_err());
    }

    #[test]
    fn round_trip() {
        for value in [0u64, 1, 127, 128, 255, 256, u64::MAX] {
            let encoded = encode(&value);
            assert_eq!(u64::decode(&encoded).unwrap(), value);
        }
        let hash = ethereum_types::H256::repeat_byte(0x5a);
        assert_eq!(H256::decode(&hash.encode_to_vec()).unwrap(), hash);
    }
}
