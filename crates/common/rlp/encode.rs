use ethereum_types::{Address, H256, U256};

use super::constants::RLP_NULL;

/// Function for encoding a value to RLP.
/// For encoding the value into a buffer directly, use [`RLPEncode::encode`].
pub fn encode<T: RLPEncode + ?Sized>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

pub trait RLPEncode {
    fn encode(&self, buf: &mut Vec<u8>);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the header of a list whose payload is `payload_len` bytes long.
/// The payload itself must be appended by the caller.
pub fn encode_length(payload_len: usize, buf: &mut Vec<u8>) {
    if payload_len < 56 {
        buf.push(0xc0 + payload_len as u8);
    } else {
        let be = payload_len.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        buf.push(0xf7 + (be.len() - skip) as u8);
        buf.extend_from_slice(&be[skip..]);
    }
}

/// Encodes a byte string item (prefix plus payload).
pub fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    match bytes.len() {
        1 if bytes[0] < RLP_NULL => buf.push(bytes[0]),
        len if len < 56 => {
            buf.push(RLP_NULL + len as u8);
            buf.extend_from_slice(bytes);
        }
        len => {
            let be = len.to_be_bytes();
            let skip = be.iter().take_while(|b| **b == 0).count();
            buf.push(0xb7 + (be.len() - skip) as u8);
            buf.extend_from_slice(&be[skip..]);
            buf.extend_from_slice(bytes);
        }
    }
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self, buf);
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self, buf);
    }
}

impl RLPEncode for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(if *self { 0x01 } else { RLP_NULL });
    }
}

macro_rules! impl_encode_uint {
    ($t:ty) => {
        impl RLPEncode for $t {
            fn encode(&self, buf: &mut Vec<u8>) {
                let be = self.to_be_bytes();
                let skip = be.iter().take_while(|b| **b == 0).count();
                encode_bytes(&be[skip..], buf);
            }
        }
    };
}

impl_encode_uint!(u8);
impl_encode_uint!(u16);
impl_encode_uint!(u32);
impl_encode_uint!(u64);
impl_encode_uint!(u128);
impl_encode_uint!(usize);

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut Vec<u8>) {
        let be = self.to_big_endian();
        let skip = be.iter().take_while(|b| **b == 0).count();
        encode_bytes(&be[skip..], buf);
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for Address {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self.as_bytes(), buf);
    }
}

impl RLPEncode for &str {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self.as_bytes(), buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encode_byte_strings() {
        assert_eq!(encode(b"dog".as_slice()), hex!("83646f67"));
        assert_eq!(encode([0x00u8].as_slice()), vec![0x00]);
        assert_eq!(encode([0x7fu8].as_slice()), vec![0x7f]);
        assert_eq!(encode([0x80u8].as_slice()), vec![0x81, 0x80]);
        assert_eq!(encode::<[u8]>(&[]), vec![RLP_NULL]);
    }

    #[test]
    fn encode_long_byte_string() {
        let payload = [0xaau8; 60];
        let encoded = encode(payload.as_slice());
        assert_eq!(encoded[0], 0xb8);
        assert_eq!(encoded[1], 60);
        assert_eq!(&encoded[2..], &payload);
    }

    #[test]
    fn encode_integers() {
        assert_eq!(encode(&0u64), vec![RLP_NULL]);
        assert_eq!(encode(&15u64), vec![0x0f]);
        assert_eq!(encode(&1024u64), hex!("820400"));
        assert_eq!(encode(&U256::zero()), vec![RLP_NULL]);
        assert_eq!(encode(&U256::from(1024)), hex!("820400").to_vec());
    }

    #[test]
    fn encode_list_header() {
        // ["cat", "dog"]
        let mut payload = Vec::new();
        "cat".encode(&mut payload);
        "dog".encode(&mut payload);
        let mut buf = Vec::new();
        encode_length(payload.len(), &mut buf);
        buf.extend_from_slice(&payload);
        assert_eq!(buf, hex!("c88363617483646f67"));
    }
}
