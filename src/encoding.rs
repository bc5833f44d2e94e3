//! Binary encoding for everything quorumkv persists or puts on the wire:
//! log entry records, the metadata record, the key/value dataset, and the
//! peer/client protocols. All of it goes through the [`Value`] trait below,
//! so there is a single place that fixes the encoding parameters.
//!
//! The encoding is Bincode with variable-length integers. Note that the
//! upstream `bincode::serialize` convenience functions use fixed-length
//! integers instead, so they must not be mixed in.

use crate::error::{Error, Result};

use bincode::Options as _;

/// Returns the Bincode options all encoding uses.
fn options() -> bincode::DefaultOptions {
    bincode::DefaultOptions::new()
}

/// Bincode encoding of values, as a marker-implemented trait on the record
/// and message types that cross a storage or network boundary.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    /// Encodes the value to a byte buffer.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(options().serialize(self)?)
    }

    /// Decodes a value from a byte buffer.
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(options().deserialize(bytes)?)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        Ok(options().serialize_into(writer, self)?)
    }

    /// Decodes a value from a reader.
    fn decode_from<R: std::io::Read>(reader: R) -> Result<Self> {
        Ok(options().deserialize_from(reader)?)
    }

    /// Decodes a value from a reader, or returns None if the reader was
    /// closed first. Connection handlers use this to tell a normal
    /// disconnect between frames from a decoding failure.
    fn maybe_decode_from<R: std::io::Read>(reader: R) -> Result<Option<Self>> {
        use std::io::ErrorKind::{ConnectionAborted, ConnectionReset, UnexpectedEof};
        match options().deserialize_from(reader) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                if let bincode::ErrorKind::Io(io_err) = err.as_ref() {
                    if matches!(io_err.kind(), UnexpectedEof | ConnectionReset | ConnectionAborted)
                    {
                        return Ok(None);
                    }
                }
                Err(Error::from(err))
            }
        }
    }
}
