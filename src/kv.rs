//! Key/value stores backing the replicated state machine. The store only
//! holds applied state; durability of the commands themselves is the log's
//! job, and a store that loses its tail is simply re-applied.

use crate::encoding::Value as _;
use crate::error::Result;

use std::collections::BTreeMap;
use std::io::{BufReader, Seek as _, SeekFrom};
use std::path::Path;

impl crate::encoding::Value for BTreeMap<String, Vec<u8>> {}

/// A key/value store.
pub trait Store: Send {
    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &str) -> Result<()>;

    /// Gets a value for a key, if it exists.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Sets a value for a key, replacing the existing value if any.
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// An in-memory key/value store, for testing.
pub struct Memory {
    data: BTreeMap<String, Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    fn delete(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }
}

/// A prototype on-disk key/value store. Keeps all data in memory and writes
/// out the entire dataset on every write; sufficient for the datasets this
/// is used with until a proper store is written.
pub struct File {
    file: std::fs::File,
    data: BTreeMap<String, Vec<u8>>,
}

impl File {
    /// Opens or creates a file-backed store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let data = if file.metadata()?.len() > 0 {
            BTreeMap::decode_from(BufReader::new(file.try_clone()?))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { file, data })
    }

    /// Writes out the entire dataset to the file.
    fn write_out(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.data.encode_into(&mut self.file)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Store for File {
    fn delete(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        self.write_out()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_string(), value);
        self.write_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(mut store: impl Store) -> Result<()> {
        assert_eq!(store.get("a")?, None);
        store.set("a", vec![1])?;
        assert_eq!(store.get("a")?, Some(vec![1]));
        store.set("a", vec![2])?;
        assert_eq!(store.get("a")?, Some(vec![2]));
        store.delete("a")?;
        assert_eq!(store.get("a")?, None);
        store.delete("missing")?;
        Ok(())
    }

    #[test]
    fn memory() -> Result<()> {
        test_store(Memory::new())
    }

    #[test]
    fn file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        test_store(File::open(&dir.path().join("state"))?)
    }

    #[test]
    fn file_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state");
        {
            let mut store = File::open(&path)?;
            store.set("a", vec![1])?;
            store.set("b", vec![2])?;
            store.delete("b")?;
        }
        let store = File::open(&path)?;
        assert_eq!(store.get("a")?, Some(vec![1]));
        assert_eq!(store.get("b")?, None);
        Ok(())
    }
}
