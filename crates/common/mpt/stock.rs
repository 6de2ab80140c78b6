use parking_lot::Mutex;

use crate::error::MptError;

/// Serialization of pool values into fixed-size records.
pub trait Codec<V>: Send + Sync + 'static {
    /// The fixed record size; `store` fills exactly this many bytes and
    /// `load` receives exactly this many.
    fn encoded_size(&self) -> usize;
    fn store(&self, buf: &mut [u8], value: &V) -> Result<(), MptError>;
    fn load(&self, buf: &[u8]) -> Result<V, MptError>;
}

/// A typed persistent object pool over dense `u64` indices.
///
/// Implementations are internally synchronized; the forest treats them as
/// thread-safe black boxes.
pub trait Stock<V>: Send + Sync {
    /// Allocates a fresh index, reusing previously deleted ones.
    fn reserve(&self) -> Result<u64, MptError>;
    fn get(&self, index: u64) -> Result<V, MptError>;
    fn set(&self, index: u64, value: &V) -> Result<(), MptError>;
    fn delete(&self, index: u64) -> Result<(), MptError>;
    fn flush(&self) -> Result<(), MptError>;
    fn close(&self) -> Result<(), MptError>;
}

/// An in-memory stock holding encoded records, mirroring the behavior of the
/// file-backed one without touching disk. Intended for tests and ephemeral
/// forests.
pub struct MemoryStock<V> {
    codec: Box<dyn Codec<V>>,
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    slots: Vec<Option<Box<[u8]>>>,
    free: Vec<u64>,
}

impl<V: 'static> MemoryStock<V> {
    pub fn new(codec: Box<dyn Codec<V>>) -> Self {
        MemoryStock {
            codec,
            inner: Mutex::new(MemoryInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }
}

impl<V: 'static> Stock<V> for MemoryStock<V> {
    fn reserve(&self) -> Result<u64, MptError> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            return Ok(index);
        }
        inner.slots.push(None);
        Ok(inner.slots.len() as u64 - 1)
    }

    fn get(&self, index: u64) -> Result<V, MptError> {
        let inner = self.inner.lock();
        let slot = inner
            .slots
            .get(index as usize)
            .and_then(|s| s.as_deref())
            .ok_or_else(|| MptError::Corrupted(format!("no value at index {index}")))?;
        self.codec.load(slot)
    }

    fn set(&self, index: u64, value: &V) -> Result<(), MptError> {
        let mut buf = vec![0u8; self.codec.encoded_size()];
        self.codec.store(&mut buf, value)?;
        let mut inner = self.inner.lock();
        let index = index as usize;
        if index >= inner.slots.len() {
            inner.slots.resize_with(index + 1, || None);
        }
        inner.slots[index] = Some(buf.into_boxed_slice());
        Ok(())
    }

    fn delete(&self, index: u64) -> Result<(), MptError> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(index as usize) {
            *slot = None;
        }
        inner.free.push(index);
        Ok(())
    }

    fn flush(&self) -> Result<(), MptError> {
        Ok(())
    }

    fn close(&self) -> Result<(), MptError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::U64Codec;
    use super::*;

    #[test]
    fn reserve_set_get_round_trip() {
        let stock = MemoryStock::new(Box::new(U64Codec));
        let a = stock.reserve().unwrap();
        let b = stock.reserve().unwrap();
        assert_ne!(a, b);
        stock.set(a, &11).unwrap();
        stock.set(b, &22).unwrap();
        assert_eq!(stock.get(a).unwrap(), 11);
        assert_eq!(stock.get(b).unwrap(), 22);
    }

    #[test]
    fn deleted_indices_are_reused() {
        let stock = MemoryStock::new(Box::new(U64Codec));
        let a = stock.reserve().unwrap();
        stock.set(a, &1).unwrap();
        stock.delete(a).unwrap();
        assert!(stock.get(a).is_err());
        let b = stock.reserve().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn get_of_unwritten_slot_fails() {
        let stock = MemoryStock::new(Box::new(U64Codec));
        let a = stock.reserve().unwrap();
        assert!(stock.get(a).is_err());
    }
}
