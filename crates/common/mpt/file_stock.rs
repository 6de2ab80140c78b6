use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MptError;
use crate::stock::{Codec, Stock};

const DATA_FILE: &str = "values.dat";
const FREELIST_FILE: &str = "freelist.dat";
const META_FILE: &str = "meta.json";

#[derive(Serialize, Deserialize, PartialEq, Debug)]
struct StockMeta {
    kind: String,
    encoded_size: usize,
    slots: u64,
}

/// A stock of fixed-size records in a single data file.
///
/// Record `i` lives at byte offset `i * encoded_size`. Deleted indices are
/// collected in a free list persisted next to the data on flush; `meta.json`
/// guards against opening a directory with a mismatched codec.
pub struct FileStock<V> {
    kind: &'static str,
    directory: PathBuf,
    codec: Box<dyn Codec<V>>,
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    slots: u64,
    free: Vec<u64>,
}

impl<V: 'static> FileStock<V> {
    pub fn open(
        directory: &Path,
        kind: &'static str,
        codec: Box<dyn Codec<V>>,
    ) -> Result<Self, MptError> {
        fs::create_dir_all(directory).map_err(MptError::from_io)?;
        let meta_path = directory.join(META_FILE);
        let mut slots = 0u64;
        let mut free = Vec::new();
        if meta_path.exists() {
            let raw = fs::read(&meta_path).map_err(MptError::from_io)?;
            let meta: StockMeta = serde_json::from_slice(&raw).map_err(|err| {
                MptError::IncompatibleMetadata(format!(
                    "corrupted stock metadata in {}: {err}",
                    meta_path.display()
                ))
            })?;
            if meta.kind != kind || meta.encoded_size != codec.encoded_size() {
                return Err(MptError::IncompatibleMetadata(format!(
                    "stock {} was created as kind {} with {}-byte records, expected kind {} with {}-byte records",
                    directory.display(),
                    meta.kind,
                    meta.encoded_size,
                    kind,
                    codec.encoded_size(),
                )));
            }
            slots = meta.slots;
            free = read_free_list(&directory.join(FREELIST_FILE))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join(DATA_FILE))
            .map_err(MptError::from_io)?;
        debug!(directory = %directory.display(), kind, slots, "opened stock");
        Ok(FileStock {
            kind,
            directory: directory.to_path_buf(),
            codec,
            inner: Mutex::new(FileInner { file, slots, free }),
        })
    }

    fn write_meta(&self, inner: &FileInner) -> Result<(), MptError> {
        let meta = StockMeta {
            kind: self.kind.to_string(),
            encoded_size: self.codec.encoded_size(),
            slots: inner.slots,
        };
        let raw = serde_json::to_vec_pretty(&meta)
            .map_err(|err| MptError::Shutdown(format!("cannot serialize stock metadata: {err}")))?;
        fs::write(self.directory.join(META_FILE), raw).map_err(MptError::from_io)?;
        let mut free_raw = Vec::with_capacity(inner.free.len() * 8);
        for index in &inner.free {
            free_raw.extend_from_slice(&index.to_le_bytes());
        }
        fs::write(self.directory.join(FREELIST_FILE), free_raw).map_err(MptError::from_io)
    }
}

fn read_free_list(path: &Path) -> Result<Vec<u64>, MptError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read(path).map_err(MptError::from_io)?;
    if raw.len() % 8 != 0 {
        return Err(MptError::IncompatibleMetadata(format!(
            "free list {} has a truncated entry",
            path.display()
        )));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("fixed chunk")))
        .collect())
}

impl<V: 'static> Stock<V> for FileStock<V> {
    fn reserve(&self) -> Result<u64, MptError> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            return Ok(index);
        }
        let index = inner.slots;
        inner.slots += 1;
        Ok(index)
    }

    fn get(&self, index: u64) -> Result<V, MptError> {
        let size = self.codec.encoded_size();
        let mut buf = vec![0u8; size];
        {
            let mut inner = self.inner.lock();
            if index >= inner.slots {
                return Err(MptError::Corrupted(format!(
                    "index {index} beyond stock size {}",
                    inner.slots
                )));
            }
            inner
                .file
                .seek(SeekFrom::Start(index * size as u64))
                .map_err(MptError::from_io)?;
            inner.file.read_exact(&mut buf).map_err(MptError::from_io)?;
        }
        self.codec.load(&buf)
    }

    fn set(&self, index: u64, value: &V) -> Result<(), MptError> {
        let size = self.codec.encoded_size();
        let mut buf = vec![0u8; size];
        self.codec.store(&mut buf, value)?;
        let mut inner = self.inner.lock();
        if index >= inner.slots {
            inner.slots = index + 1;
        }
        inner
            .file
            .seek(SeekFrom::Start(index * size as u64))
            .map_err(MptError::from_io)?;
        inner.file.write_all(&buf).map_err(MptError::from_io)
    }

    fn delete(&self, index: u64) -> Result<(), MptError> {
        let mut inner = self.inner.lock();
        inner.free.push(index);
        Ok(())
    }

    fn flush(&self) -> Result<(), MptError> {
        let inner = self.inner.lock();
        inner.file.sync_all().map_err(MptError::from_io)?;
        self.write_meta(&inner)
    }

    fn close(&self) -> Result<(), MptError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stock::test_support::U64Codec;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stock: FileStock<u64> =
                FileStock::open(dir.path(), "numbers", Box::new(U64Codec)).unwrap();
            let a = stock.reserve().unwrap();
            let b = stock.reserve().unwrap();
            stock.set(a, &100).unwrap();
            stock.set(b, &200).unwrap();
            stock.delete(b).unwrap();
            stock.close().unwrap();
        }
        let stock: FileStock<u64> =
            FileStock::open(dir.path(), "numbers", Box::new(U64Codec)).unwrap();
        assert_eq!(stock.get(0).unwrap(), 100);
        // the deleted index is first in line for reuse
        assert_eq!(stock.reserve().unwrap(), 1);
    }

    #[test]
    fn rejects_mismatched_metadata() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stock: FileStock<u64> =
                FileStock::open(dir.path(), "numbers", Box::new(U64Codec)).unwrap();
            stock.close().unwrap();
        }
        let reopened: Result<FileStock<u64>, _> =
            FileStock::open(dir.path(), "letters", Box::new(U64Codec));
        assert!(matches!(
            reopened,
            Err(MptError::IncompatibleMetadata(_))
        ));
    }

    #[test]
    fn rejects_corrupt_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(META_FILE), b"not json").unwrap();
        let opened: Result<FileStock<u64>, _> =
            FileStock::open(dir.path(), "numbers", Box::new(U64Codec));
        assert!(matches!(opened, Err(MptError::IncompatibleMetadata(_))));
    }

    #[test]
    fn out_of_range_get_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stock: FileStock<u64> =
            FileStock::open(dir.path(), "numbers", Box::new(U64Codec)).unwrap();
        assert!(stock.get(3).is_err());
    }
}
