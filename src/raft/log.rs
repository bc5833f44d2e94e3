use super::message::Member;
use super::{Index, Term};
use crate::encoding::Value as _;
use crate::errcorrupt;
use crate::error::Result;

use ::log::warn;
use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

/// A replicated log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index. 1-based and dense.
    pub index: Index,
    /// The term in which a leader created the entry.
    pub term: Term,
    /// The state machine command.
    pub command: Vec<u8>,
}

impl crate::encoding::Value for Entry {}

/// The durable voting record, stored next to the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Metadata {
    current_term: Term,
    voted_for: Option<Member>,
}

impl crate::encoding::Value for Metadata {}

/// The durable log store: an ordered sequence of entries plus the replica's
/// voting record (current term and voted-for identity).
///
/// The log file contains sequential binary entry records, length-prefixed
/// with a big-endian u64. An index of record positions is rebuilt on startup
/// by scanning the file; a partial tail record left by a crash mid-append is
/// discarded during the scan. Appends are fsynced before returning, so an
/// acknowledged entry survives a crash.
///
/// The metadata record lives in a separate file, replaced via a temporary
/// file and an atomic rename and fsynced before any RPC response that depends
/// on it. It must be durable before the vote or term it records is acted on,
/// otherwise a replica could vote twice in one term after a restart.
///
/// Only followers truncate the log, and only to reconcile an uncommitted
/// suffix with the leader's history. A leader never truncates or overwrites
/// its own entries.
pub struct Log {
    inner: Mutex<Inner>,
}

struct Inner {
    dir: PathBuf,
    /// The append-only entry file.
    file: File,
    /// The size of the entry file in bytes, i.e. the append position.
    size: u64,
    /// Entry locations in the file: index → (record position, payload size).
    index: BTreeMap<Index, (u64, u64)>,
    /// The index of the last stored entry, 0 if empty.
    last_index: Index,
    /// The term of the last stored entry, 0 if empty.
    last_term: Term,
    /// The current term from the metadata record.
    current_term: Term,
    /// Our vote in the current term, if any, from the metadata record.
    voted_for: Option<Member>,
}

impl Log {
    /// Opens or creates a log in the given directory, rebuilding the entry
    /// index and loading the metadata record.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut file =
            OpenOptions::new().read(true).write(true).create(true).open(dir.join("log"))?;
        let (index, last_index, last_term, size) = Self::build_index(&mut file)?;
        let metadata = Self::load_metadata(&dir.join("metadata"))?;
        Ok(Self {
            inner: Mutex::new(Inner {
                dir: dir.to_path_buf(),
                file,
                size,
                index,
                last_index,
                last_term,
                current_term: metadata.current_term,
                voted_for: metadata.voted_for,
            }),
        })
    }

    /// Builds the entry index by scanning the log file. A partial tail record
    /// (crash during append) is discarded by truncating the file to the last
    /// whole record.
    #[allow(clippy::type_complexity)]
    fn build_index(file: &mut File) -> Result<(BTreeMap<Index, (u64, u64)>, Index, Term, u64)> {
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);
        let mut index = BTreeMap::new();
        let (mut last_index, mut last_term) = (0, 0);
        let mut pos = 0;
        while pos + 8 <= len {
            let mut sizebuf = [0; 8];
            reader.read_exact(&mut sizebuf)?;
            let size = u64::from_be_bytes(sizebuf);
            if pos + 8 + size > len {
                break;
            }
            let mut buf = vec![0; size as usize];
            reader.read_exact(&mut buf)?;
            let entry = Entry::decode(&buf)?;
            if entry.index != last_index + 1 {
                return errcorrupt!("log index gap: {} follows {}", entry.index, last_index);
            }
            index.insert(entry.index, (pos, size));
            last_index = entry.index;
            last_term = entry.term;
            pos += 8 + size;
        }
        drop(reader);
        if pos < len {
            warn!("Discarding partial log tail at offset {pos}");
            file.set_len(pos)?;
            file.sync_all()?;
        }
        Ok((index, last_index, last_term, pos))
    }

    /// Loads the metadata record, or defaults if it does not exist yet.
    fn load_metadata(path: &Path) -> Result<Metadata> {
        if !path.try_exists()? {
            return Ok(Metadata { current_term: 0, voted_for: None });
        }
        Metadata::decode_from(BufReader::new(File::open(path)?))
    }

    /// Appends a batch of entries to the tail and fsyncs them. The entries
    /// must have dense indices continuing at the current last index. Returns
    /// the new last index.
    pub fn append(&self, entries: &[Entry]) -> Result<Index> {
        self.inner.lock().append(entries)
    }

    /// Appends a single command at the given term, assigning it the next
    /// index. Used by the leader, which holds the state lock across the term
    /// read and this call. Returns the entry's index.
    pub fn append_command(&self, term: Term, command: Vec<u8>) -> Result<Index> {
        let mut inner = self.inner.lock();
        let entry = Entry { index: inner.last_index + 1, term, command };
        inner.append(&[entry])
    }

    /// Drops all entries with an index above last_kept_index. Used only to
    /// reconcile a follower's uncommitted tail with the leader's history.
    pub fn truncate_suffix(&self, last_kept_index: Index) -> Result<()> {
        let mut inner = self.inner.lock();
        if last_kept_index >= inner.last_index {
            return Ok(());
        }
        let (pos, _) = inner.index[&(last_kept_index + 1)];
        inner.file.set_len(pos)?;
        inner.file.sync_all()?;
        inner.index.split_off(&(last_kept_index + 1));
        inner.size = pos;
        inner.last_term = match last_kept_index {
            0 => 0,
            index => inner.read_entry(index)?.term,
        };
        inner.last_index = last_kept_index;
        Ok(())
    }

    /// Fetches the entry at the given index, or None if it does not exist.
    pub fn get_entry(&self, index: Index) -> Result<Option<Entry>> {
        let mut inner = self.inner.lock();
        if index == 0 || index > inner.last_index {
            return Ok(None);
        }
        Ok(Some(inner.read_entry(index)?))
    }

    /// Fetches up to max entries starting at the given index.
    pub fn entries(&self, from: Index, max: usize) -> Result<Vec<Entry>> {
        let mut inner = self.inner.lock();
        let last = inner.last_index;
        let mut entries = Vec::new();
        for index in from..=last {
            if entries.len() >= max {
                break;
            }
            entries.push(inner.read_entry(index)?);
        }
        Ok(entries)
    }

    /// Returns the term and index of the last entry, or (0, 0) when empty.
    pub fn get_last_log_term_and_index(&self) -> (Term, Index) {
        let inner = self.inner.lock();
        (inner.last_term, inner.last_index)
    }

    /// Returns the index of the last entry, or 0 when empty.
    pub fn get_last_log_index(&self) -> Index {
        self.inner.lock().last_index
    }

    /// Returns the current term (0 if none) and vote from the metadata record.
    pub fn get_term(&self) -> (Term, Option<Member>) {
        let inner = self.inner.lock();
        (inner.current_term, inner.voted_for.clone())
    }

    /// Durably replaces the metadata record, via a temporary file and an
    /// atomic rename.
    pub fn update_metadata(&self, current_term: Term, voted_for: Option<&Member>) -> Result<()> {
        let mut inner = self.inner.lock();
        let tmp = inner.dir.join("metadata.tmp");
        let path = inner.dir.join("metadata");
        let metadata = Metadata { current_term, voted_for: voted_for.cloned() };
        let mut file = File::create(&tmp)?;
        metadata.encode_into(&mut file)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        inner.current_term = metadata.current_term;
        inner.voted_for = metadata.voted_for;
        Ok(())
    }
}

impl Inner {
    fn append(&mut self, entries: &[Entry]) -> Result<Index> {
        if entries.is_empty() {
            return Ok(self.last_index);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entry.index != self.last_index + 1 + i as u64 {
                return errcorrupt!(
                    "appended entry {} does not follow last index {}",
                    entry.index,
                    self.last_index
                );
            }
        }

        // Write and fsync the records before updating the in-memory index, so
        // a failed write can't leave them out of sync.
        let mut records = Vec::with_capacity(entries.len());
        let mut pos = self.size;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut writer = BufWriter::new(&mut self.file);
        for entry in entries {
            let buf = entry.encode()?;
            writer.write_all(&(buf.len() as u64).to_be_bytes())?;
            writer.write_all(&buf)?;
            records.push((entry.index, pos, buf.len() as u64));
            pos += 8 + buf.len() as u64;
        }
        writer.flush()?;
        drop(writer);
        self.file.sync_data()?;

        for (index, pos, size) in records {
            self.index.insert(index, (pos, size));
        }
        self.size = pos;
        self.last_index = entries[entries.len() - 1].index;
        self.last_term = entries[entries.len() - 1].term;
        Ok(self.last_index)
    }

    fn read_entry(&mut self, index: Index) -> Result<Entry> {
        let Some(&(pos, size)) = self.index.get(&index) else {
            return errcorrupt!("missing log entry {index}");
        };
        self.file.seek(SeekFrom::Start(pos + 8))?;
        let mut buf = vec![0; size as usize];
        self.file.read_exact(&mut buf)?;
        let entry = Entry::decode(&buf)?;
        if entry.index != index {
            return errcorrupt!("log entry {} stored at index {index}", entry.index);
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: Index, term: Term, command: &str) -> Entry {
        Entry { index, term, command: command.as_bytes().to_vec() }
    }

    #[test]
    fn append_and_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path())?;
        assert_eq!(log.get_last_log_term_and_index(), (0, 0));
        assert_eq!(log.get_entry(1)?, None);

        log.append(&[entry(1, 1, "a"), entry(2, 1, "b")])?;
        log.append(&[entry(3, 2, "c")])?;
        assert_eq!(log.get_last_log_term_and_index(), (2, 3));
        assert_eq!(log.get_entry(2)?, Some(entry(2, 1, "b")));
        assert_eq!(log.get_entry(4)?, None);
        assert_eq!(log.entries(2, 10)?, vec![entry(2, 1, "b"), entry(3, 2, "c")]);
        assert_eq!(log.entries(1, 2)?, vec![entry(1, 1, "a"), entry(2, 1, "b")]);

        // Appends must continue at the last index.
        assert!(log.append(&[entry(5, 2, "e")]).is_err());
        Ok(())
    }

    #[test]
    fn append_command_assigns_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path())?;
        assert_eq!(log.append_command(1, b"a".to_vec())?, 1);
        assert_eq!(log.append_command(1, b"b".to_vec())?, 2);
        assert_eq!(log.get_entry(2)?, Some(entry(2, 1, "b")));
        Ok(())
    }

    #[test]
    fn reopen_recovers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let log = Log::open(dir.path())?;
            log.append(&[entry(1, 1, "a"), entry(2, 2, "b")])?;
            log.update_metadata(2, Some(&Member::new("10.0.0.1", 7001)))?;
        }
        let log = Log::open(dir.path())?;
        assert_eq!(log.get_last_log_term_and_index(), (2, 2));
        assert_eq!(log.get_entry(1)?, Some(entry(1, 1, "a")));
        assert_eq!(log.get_term(), (2, Some(Member::new("10.0.0.1", 7001))));
        Ok(())
    }

    #[test]
    fn truncate_suffix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path())?;
        log.append(&[entry(1, 1, "a"), entry(2, 1, "b"), entry(3, 1, "c")])?;

        log.truncate_suffix(1)?;
        assert_eq!(log.get_last_log_term_and_index(), (1, 1));
        assert_eq!(log.get_entry(2)?, None);

        // The tail can be replaced and survives a reopen.
        log.append(&[entry(2, 2, "x")])?;
        drop(log);
        let log = Log::open(dir.path())?;
        assert_eq!(log.get_last_log_term_and_index(), (2, 2));
        assert_eq!(log.get_entry(2)?, Some(entry(2, 2, "x")));

        // Truncating to the last index or beyond is a noop, as is truncating
        // an empty log to 0.
        log.truncate_suffix(2)?;
        log.truncate_suffix(7)?;
        assert_eq!(log.get_last_log_index(), 2);
        log.truncate_suffix(0)?;
        assert_eq!(log.get_last_log_index(), 0);
        Ok(())
    }

    #[test]
    fn discards_partial_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let log = Log::open(dir.path())?;
            log.append(&[entry(1, 1, "a"), entry(2, 1, "bbbbbbbb")])?;
        }
        // Chop a few bytes off the last record, simulating a torn append.
        let file = OpenOptions::new().write(true).open(dir.path().join("log"))?;
        let len = file.metadata()?.len();
        file.set_len(len - 3)?;
        drop(file);

        let log = Log::open(dir.path())?;
        assert_eq!(log.get_last_log_term_and_index(), (1, 1));
        assert_eq!(log.get_entry(1)?, Some(entry(1, 1, "a")));
        assert_eq!(log.get_entry(2)?, None);

        // The log accepts new appends at the truncated position.
        log.append(&[entry(2, 2, "c")])?;
        drop(log);
        let log = Log::open(dir.path())?;
        assert_eq!(log.get_entry(2)?, Some(entry(2, 2, "c")));
        Ok(())
    }

    #[test]
    fn metadata_defaults_and_update() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = Log::open(dir.path())?;
        assert_eq!(log.get_term(), (0, None));
        log.update_metadata(3, None)?;
        assert_eq!(log.get_term(), (3, None));
        let vote = Member::new("10.0.0.2", 7002);
        log.update_metadata(3, Some(&vote))?;
        drop(log);
        let log = Log::open(dir.path())?;
        assert_eq!(log.get_term(), (3, Some(vote)));
        Ok(())
    }
}
