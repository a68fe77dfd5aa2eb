//! TransactionLog — append-only, checksummed record file.
//!
//! Each record is framed as
//!
//! ```text
//! [len: u32 BE][checksum: u32 BE][payload: len bytes of JSON LogEntry]
//! ```
//!
//! where `checksum` is the first four bytes of SHA-256 over the payload.
//! Replay stops at the first incomplete or corrupt record and truncates the
//! file there, so a crash mid-append costs at most the entry being written.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::routing::{Decision, NodeId, RoutingState, RoutingStatus, epoch_millis};

/// Bytes of framing in front of every payload.
pub const RECORD_HEADER_LEN: usize = 8;

/// Largest payload a record may carry.
pub const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

// ── Entries ───────────────────────────────────────────────────────

/// Who opened a PREPARED entry and how this node voted on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRecord {
    pub coordinator: NodeId,
    pub vote: Decision,
}

/// One immutable snapshot in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub state: RoutingState,
    pub written_at_ms: u64,
    /// Present on PREPARED entries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<PrepareRecord>,
}

impl LogEntry {
    /// PREPARED entry for a proposal, recording the local vote.
    pub fn prepared(state: RoutingState, coordinator: &str, vote: Decision) -> Self {
        Self {
            state: state.with_status(RoutingStatus::Prepared),
            written_at_ms: epoch_millis(),
            prepare: Some(PrepareRecord {
                coordinator: coordinator.to_string(),
                vote,
            }),
        }
    }

    /// COMMITTED or ABORTED entry closing a transaction.
    pub fn terminal(state: RoutingState) -> Self {
        Self {
            state,
            written_at_ms: epoch_millis(),
            prepare: None,
        }
    }
}

// ── Journal ───────────────────────────────────────────────────────

/// Durable sink for log entries, as seen by the node engine.
pub trait Journal: Send {
    /// Persist `entry`; it is durable once this returns `Ok`.
    fn append(&mut self, entry: &LogEntry) -> StateResult<()>;

    /// Bring the journal back to a writable state after a failed append,
    /// dropping any partial bytes that append left behind.
    fn restore(&mut self) -> StateResult<()>;
}

/// Entries recovered from disk, plus how much of a torn tail was dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    pub entries: Vec<LogEntry>,
    pub discarded_bytes: u64,
}

/// File-backed [`Journal`]. Exclusively owned by its node.
pub struct TransactionLog {
    path: PathBuf,
    file: File,
    /// Offset just past the last complete record.
    end: u64,
}

impl TransactionLog {
    /// Open (or create) the log at `path`, replaying and repairing it.
    pub fn open(path: &Path) -> StateResult<(Self, Replay)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let file = open_file(path)?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
            end: 0,
        };
        let replay = log.replay()?;
        debug!(?path, entries = replay.entries.len(), "transaction log opened");
        Ok((log, replay))
    }

    /// Read every valid entry without modifying the file.
    pub fn read(path: &Path) -> StateResult<Replay> {
        let bytes = fs::read(path).map_err(map_err!(Read))?;
        let (entries, valid_len) = decode_records(&bytes)?;
        Ok(Replay {
            entries,
            discarded_bytes: bytes.len() as u64 - valid_len,
        })
    }

    /// Re-read the file from the start, truncating an incomplete tail.
    pub fn replay(&mut self) -> StateResult<Replay> {
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0)).map_err(map_err!(Read))?;
        self.file.read_to_end(&mut bytes).map_err(map_err!(Read))?;

        let (entries, valid_len) = decode_records(&bytes)?;
        let discarded_bytes = bytes.len() as u64 - valid_len;
        if discarded_bytes > 0 {
            warn!(
                path = ?self.path,
                valid_bytes = valid_len,
                discarded_bytes,
                "discarding incomplete transaction log tail"
            );
            self.file.set_len(valid_len).map_err(map_err!(Write))?;
            self.file.sync_all().map_err(map_err!(Write))?;
        }
        self.end = valid_len;
        Ok(Replay {
            entries,
            discarded_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for TransactionLog {
    fn append(&mut self, entry: &LogEntry) -> StateResult<()> {
        let record = encode_record(entry)?;
        self.file
            .seek(SeekFrom::Start(self.end))
            .map_err(map_err!(Write))?;
        self.file.write_all(&record).map_err(map_err!(Write))?;
        self.file.sync_data().map_err(map_err!(Write))?;
        self.end += record.len() as u64;
        debug!(
            version = entry.state.version,
            txid = %entry.state.txid,
            status = %entry.state.status,
            "log entry appended"
        );
        Ok(())
    }

    fn restore(&mut self) -> StateResult<()> {
        let file = open_file(&self.path)?;
        file.set_len(self.end).map_err(map_err!(Write))?;
        file.sync_all().map_err(map_err!(Write))?;
        self.file = file;
        debug!(path = ?self.path, end = self.end, "transaction log restored");
        Ok(())
    }
}

fn open_file(path: &Path) -> StateResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(map_err!(Open))
}

// ── Framing ───────────────────────────────────────────────────────

fn checksum(payload: &[u8]) -> u32 {
    let hash = Sha256::digest(payload);
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Frame one entry as a record.
pub fn encode_record(entry: &LogEntry) -> StateResult<Vec<u8>> {
    let payload = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(StateError::Serialize(format!(
            "record of {} bytes exceeds {MAX_RECORD_LEN}",
            payload.len()
        )));
    }
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(&checksum(&payload).to_be_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decode records from the start of `bytes`.
///
/// Returns the valid entries and the offset just past the last one. A torn
/// or corrupt record ends the scan; an ordering violation is an error.
fn decode_records(bytes: &[u8]) -> StateResult<(Vec<LogEntry>, u64)> {
    let mut entries = Vec::new();
    let mut order = OrderCheck::default();
    let mut offset = 0usize;

    while bytes.len() - offset >= RECORD_HEADER_LEN {
        let header = &bytes[offset..offset + RECORD_HEADER_LEN];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let sum = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_LEN {
            break;
        }
        let start = offset + RECORD_HEADER_LEN;
        let Some(payload) = bytes.get(start..start + len) else {
            break;
        };
        if checksum(payload) != sum {
            break;
        }
        let Ok(entry) = serde_json::from_slice::<LogEntry>(payload) else {
            break;
        };
        order.check(&entry, offset as u64)?;
        entries.push(entry);
        offset = start + len;
    }

    Ok((entries, offset as u64))
}

/// Tracks version ordering and the open PREPARED entry during a scan.
#[derive(Default)]
struct OrderCheck {
    last_version: u64,
    open: Option<(String, u64)>,
}

impl OrderCheck {
    fn check(&mut self, entry: &LogEntry, offset: u64) -> StateResult<()> {
        let state = &entry.state;
        let out_of_order = |reason: String| StateError::OutOfOrder { offset, reason };

        match (self.open.take(), state.status.is_terminal()) {
            (Some((txid, version)), true) if txid == state.txid => {
                if state.version != version {
                    return Err(out_of_order(format!(
                        "{} closes {txid} at version {}, prepared at {version}",
                        state.status, state.version
                    )));
                }
            }
            (Some((txid, _)), _) => {
                return Err(out_of_order(format!(
                    "{} entry for {} while {txid} is in doubt",
                    state.status, state.txid
                )));
            }
            (None, _) => {
                if state.version <= self.last_version {
                    return Err(out_of_order(format!(
                        "version {} does not follow {}",
                        state.version, self.last_version
                    )));
                }
                if !state.status.is_terminal() {
                    self.open = Some((state.txid.clone(), state.version));
                }
            }
        }
        self.last_version = self.last_version.max(state.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn proposal(version: u64) -> RoutingState {
        let weights = BTreeMap::from([("v1".to_string(), 0.9), ("v2".to_string(), 0.1)]);
        RoutingState::genesis("v1", "v2").propose(version, &format!("tx-{version}"), weights)
    }

    fn committed_round(log: &mut TransactionLog, version: u64) {
        let state = proposal(version);
        log.append(&LogEntry::prepared(state.clone(), "node-a", Decision::Commit))
            .unwrap();
        log.append(&LogEntry::terminal(state.with_status(RoutingStatus::Committed)))
            .unwrap();
    }

    #[test]
    fn append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");

        let (mut log, replay) = TransactionLog::open(&path).unwrap();
        assert!(replay.entries.is_empty());
        committed_round(&mut log, 1);
        committed_round(&mut log, 2);
        drop(log);

        let (_, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.entries.len(), 4);
        assert_eq!(replay.discarded_bytes, 0);
        assert_eq!(replay.entries[3].state.version, 2);
        assert_eq!(replay.entries[3].state.status, RoutingStatus::Committed);
        assert_eq!(
            replay.entries[0].prepare,
            Some(PrepareRecord {
                coordinator: "node-a".into(),
                vote: Decision::Commit
            })
        );
    }

    #[test]
    fn open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs/node-a.log");
        let (log, _) = TransactionLog::open(&path).unwrap();
        assert_eq!(log.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn torn_tail_is_truncated_and_appends_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");

        let (mut log, _) = TransactionLog::open(&path).unwrap();
        committed_round(&mut log, 1);
        drop(log);
        let good_len = fs::metadata(&path).unwrap().len();

        // Half of a record, as if the process died mid-write.
        let partial = encode_record(&LogEntry::prepared(proposal(2), "node-a", Decision::Commit))
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let (mut log, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.discarded_bytes, (partial.len() / 2) as u64);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        committed_round(&mut log, 2);
        drop(log);
        let (_, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.entries.len(), 4);
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn checksum_mismatch_drops_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");

        let (mut log, _) = TransactionLog::open(&path).unwrap();
        committed_round(&mut log, 1);
        drop(log);

        // Flip one payload byte of the last record.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x20;
        fs::write(&path, &bytes).unwrap();

        let (_, replay) = TransactionLog::open(&path).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.entries[0].state.status, RoutingStatus::Prepared);
        assert!(replay.discarded_bytes > 0);
    }

    #[test]
    fn short_header_is_treated_as_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");
        fs::write(&path, [0u8, 0, 1]).unwrap();

        let (_, replay) = TransactionLog::open(&path).unwrap();
        assert!(replay.entries.is_empty());
        assert_eq!(replay.discarded_bytes, 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn read_does_not_modify_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");
        let (mut log, _) = TransactionLog::open(&path).unwrap();
        committed_round(&mut log, 1);
        drop(log);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);
        let len = fs::metadata(&path).unwrap().len();

        let replay = TransactionLog::read(&path).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.discarded_bytes, 3);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn version_regression_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");
        let mut bytes = Vec::new();
        for version in [2, 1] {
            let state = proposal(version).with_status(RoutingStatus::Aborted);
            bytes.extend(encode_record(&LogEntry::terminal(state)).unwrap());
        }
        fs::write(&path, &bytes).unwrap();

        let err = TransactionLog::open(&path).err().unwrap();
        assert!(matches!(err, StateError::OutOfOrder { .. }));
    }

    #[test]
    fn second_prepare_while_in_doubt_is_a_hard_error() {
        let mut bytes = Vec::new();
        for version in [1, 2] {
            let entry = LogEntry::prepared(proposal(version), "node-a", Decision::Commit);
            bytes.extend(encode_record(&entry).unwrap());
        }
        let err = decode_records(&bytes).unwrap_err();
        assert!(matches!(err, StateError::OutOfOrder { .. }));
    }

    #[test]
    fn restore_drops_partial_bytes_after_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-a.log");
        let (mut log, _) = TransactionLog::open(&path).unwrap();
        committed_round(&mut log, 1);
        let good_len = fs::metadata(&path).unwrap().len();

        // A failed append that left garbage behind.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"garbage").unwrap();
        drop(file);

        log.restore().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
        committed_round(&mut log, 2);
        assert_eq!(log.replay().unwrap().entries.len(), 4);
    }

    #[test]
    fn terminal_without_prepare_is_accepted() {
        // Entries learned through reconciliation have no PREPARED record.
        let mut bytes = Vec::new();
        for version in [1, 2] {
            let state = proposal(version).with_status(RoutingStatus::Committed);
            bytes.extend(encode_record(&LogEntry::terminal(state)).unwrap());
        }
        let (entries, end) = decode_records(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(end, bytes.len() as u64);
    }
}
