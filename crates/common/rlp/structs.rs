use super::encode::{encode_length, RLPEncode};

/// # List encoding helper
///
/// Accumulates the encoded fields of a list and writes the list header plus
/// payload into the target buffer on [`Encoder::finish`].
///
/// Items that are already in encoded form (for example inlined child nodes)
/// can be appended verbatim with [`Encoder::encode_raw`].
#[must_use = "`Encoder` must be consumed with `finish` to write the list"]
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
    payload: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self {
            buf,
            payload: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode + ?Sized>(mut self, value: &T) -> Self {
        value.encode(&mut self.payload);
        self
    }

    /// Appends an already-encoded item without re-encoding it.
    pub fn encode_raw(mut self, encoded: &[u8]) -> Self {
        self.payload.extend_from_slice(encoded);
        self
    }

    pub fn finish(self) {
        encode_length(self.payload.len(), self.buf);
        self.buf.extend_from_slice(&self.payload);
    }
}
