use std::fmt::Debug;

use crate::error::MptError;
use crate::stock::Stock;

/// A stock composed of two backends: every write goes to both, every read is
/// cross-checked. Purely a stress-testing aid for persistent stock
/// implementations; transparent to forest semantics.
pub struct ShadowStock<V> {
    primary: Box<dyn Stock<V>>,
    reference: Box<dyn Stock<V>>,
}

impl<V> ShadowStock<V> {
    pub fn new(primary: Box<dyn Stock<V>>, reference: Box<dyn Stock<V>>) -> Self {
        ShadowStock { primary, reference }
    }
}

impl<V: PartialEq + Debug + Send + Sync> Stock<V> for ShadowStock<V> {
    fn reserve(&self) -> Result<u64, MptError> {
        let index = self.primary.reserve()?;
        let shadow_index = self.reference.reserve()?;
        if index != shadow_index {
            return Err(MptError::Consistency(format!(
                "shadow stock index diverged: primary reserved {index}, reference {shadow_index}"
            )));
        }
        Ok(index)
    }

    fn get(&self, index: u64) -> Result<V, MptError> {
        let value = self.primary.get(index)?;
        let shadow_value = self.reference.get(index)?;
        if value != shadow_value {
            return Err(MptError::Consistency(format!(
                "shadow stock value diverged at index {index}: {value:?} vs {shadow_value:?}"
            )));
        }
        Ok(value)
    }

    fn set(&self, index: u64, value: &V) -> Result<(), MptError> {
        self.primary.set(index, value)?;
        self.reference.set(index, value)
    }

    fn delete(&self, index: u64) -> Result<(), MptError> {
        self.primary.delete(index)?;
        self.reference.delete(index)
    }

    fn flush(&self) -> Result<(), MptError> {
        self.primary.flush()?;
        self.reference.flush()
    }

    fn close(&self) -> Result<(), MptError> {
        self.primary.close()?;
        self.reference.close()
    }
}
