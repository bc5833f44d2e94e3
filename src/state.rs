//! The replicated state machine: the write commands carried in log entries,
//! and the key/value machine that applies them.

use crate::encoding;
use crate::encoding::Value as _;
use crate::error::Result;
use crate::kv;

use ::log::debug;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// A write command, serialized into a log entry. Reads are served at the
/// leader without log entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Sets a key to a value.
    Put { key: String, value: Vec<u8> },
    /// Deletes a key.
    Delete { key: String },
}

impl encoding::Value for Command {}

/// A state machine maintained by applying committed log commands. Commands
/// are applied exactly once per replica lifetime, strictly in log order; a
/// replay after restart re-applies the same commands in the same order and
/// converges to the same state.
pub trait State: Send {
    /// Applies a write command to the state machine. Errors are fatal to
    /// the replica, since replicas must not diverge.
    fn apply(&mut self, command: &[u8]) -> Result<()>;

    /// Reads a key from the applied state.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// The key/value state machine, over a pluggable store.
pub struct Kv {
    store: Box<dyn kv::Store>,
}

impl Kv {
    pub fn new(store: Box<dyn kv::Store>) -> Self {
        Self { store }
    }

    /// Opens a file-backed key/value state machine at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Box::new(kv::File::open(path)?)))
    }
}

impl State for Kv {
    fn apply(&mut self, command: &[u8]) -> Result<()> {
        match Command::decode(command)? {
            Command::Put { key, value } => {
                debug!("Applying put {key}");
                self.store.set(&key, value)
            }
            Command::Delete { key } => {
                debug!("Applying delete {key}");
                self.store.delete(&key)
            }
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_commands() -> Result<()> {
        let mut kv = Kv::new(Box::new(kv::Memory::new()));
        kv.apply(&Command::Put { key: "a".to_string(), value: vec![1] }.encode()?)?;
        assert_eq!(kv.get("a")?, Some(vec![1]));
        kv.apply(&Command::Delete { key: "a".to_string() }.encode()?)?;
        assert_eq!(kv.get("a")?, None);

        // Garbage commands fail rather than diverge.
        assert!(kv.apply(&[0xff, 0xff, 0xff]).is_err());
        Ok(())
    }
}
