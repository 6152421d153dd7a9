//! Message logs backing streams.
//!
//! The interface is deliberately small: streams append, erase by sequence,
//! purge, and report state. The memory variant is a plain deque; the file
//! variant keeps the same in-process index and additionally journals every
//! mutation as a length-prefixed JSON record under the stream's `msgs/`
//! directory, replaying the journal on open. The record layout is private to
//! this module.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "log.dat";

/// Fixed per-message accounting overhead added to subject + payload bytes.
const MSG_OVERHEAD: u64 = 16;

/// Observable state of a stream's message log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: usize,
}

pub trait MsgStore: Send {
    /// Appends a message, returning its sequence and the bytes charged
    /// against the account budget.
    fn store_msg(&mut self, subject: &str, payload: &[u8]) -> io::Result<(u64, u64)>;
    /// Removes one message; returns the bytes freed, or `None` when the
    /// sequence is not present.
    fn erase_msg(&mut self, seq: u64) -> io::Result<Option<u64>>;
    /// Drops every message; returns `(messages, bytes)` removed.
    fn purge(&mut self) -> io::Result<(u64, u64)>;
    fn state(&self) -> StreamState;
    /// Flushes and releases resources. The store must not be used after.
    fn stop(&mut self);
}

fn msg_size(subject: &str, payload: &[u8]) -> u64 {
    subject.len() as u64 + payload.len() as u64 + MSG_OVERHEAD
}

#[derive(Debug, Clone)]
struct StoredMsg {
    seq: u64,
    subject: String,
    payload: Vec<u8>,
}

/// In-process message log.
#[derive(Debug, Default)]
pub struct MemMsgStore {
    msgs: VecDeque<StoredMsg>,
    last_seq: u64,
    bytes: u64,
}

impl MemMsgStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, subject: &str, payload: &[u8]) -> (u64, u64) {
        let seq = self.last_seq + 1;
        self.last_seq = seq;
        let size = msg_size(subject, payload);
        self.bytes += size;
        self.msgs.push_back(StoredMsg {
            seq,
            subject: subject.to_string(),
            payload: payload.to_vec(),
        });
        (seq, size)
    }

    fn remove(&mut self, seq: u64) -> Option<u64> {
        let idx = self.msgs.iter().position(|m| m.seq == seq)?;
        let msg = self.msgs.remove(idx)?;
        let size = msg_size(&msg.subject, &msg.payload);
        self.bytes -= size;
        Some(size)
    }

    fn clear(&mut self) -> (u64, u64) {
        let removed = (self.msgs.len() as u64, self.bytes);
        self.msgs.clear();
        self.bytes = 0;
        removed
    }

    fn snapshot(&self) -> StreamState {
        let first_seq = match self.msgs.front() {
            Some(m) => m.seq,
            None if self.last_seq == 0 => 0,
            None => self.last_seq + 1,
        };
        StreamState {
            messages: self.msgs.len() as u64,
            bytes: self.bytes,
            first_seq,
            last_seq: self.last_seq,
            consumer_count: 0,
        }
    }
}

impl MsgStore for MemMsgStore {
    fn store_msg(&mut self, subject: &str, payload: &[u8]) -> io::Result<(u64, u64)> {
        Ok(self.append(subject, payload))
    }

    fn erase_msg(&mut self, seq: u64) -> io::Result<Option<u64>> {
        Ok(self.remove(seq))
    }

    fn purge(&mut self) -> io::Result<(u64, u64)> {
        Ok(self.clear())
    }

    fn state(&self) -> StreamState {
        self.snapshot()
    }

    fn stop(&mut self) {}
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Msg {
        seq: u64,
        subject: String,
        payload: Vec<u8>,
    },
    Erase {
        seq: u64,
    },
    Purge {
        last_seq: u64,
    },
}

/// Durable message log under `<stream dir>/msgs/`.
#[derive(Debug)]
pub struct FileMsgStore {
    index: MemMsgStore,
    file: File,
    path: PathBuf,
}

impl FileMsgStore {
    /// Opens (or creates) the log below `msgs_dir` and replays it. A torn
    /// tail record is discarded and the file truncated back to the last
    /// complete record.
    pub fn open(msgs_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(msgs_dir)?;
        let path = msgs_dir.join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;

        let mut index = MemMsgStore::new();
        let mut offset = 0usize;
        let mut valid_end = 0usize;
        while buf.len() - offset >= 4 {
            let len = u32::from_le_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]) as usize;
            if buf.len() - offset - 4 < len {
                break;
            }
            let body = &buf[offset + 4..offset + 4 + len];
            match serde_json::from_slice::<LogRecord>(body) {
                Ok(LogRecord::Msg {
                    seq,
                    subject,
                    payload,
                }) => {
                    let size = msg_size(&subject, &payload);
                    index.bytes += size;
                    index.last_seq = seq;
                    index.msgs.push_back(StoredMsg {
                        seq,
                        subject,
                        payload,
                    });
                }
                Ok(LogRecord::Erase { seq }) => {
                    index.remove(seq);
                }
                Ok(LogRecord::Purge { last_seq }) => {
                    index.clear();
                    index.last_seq = last_seq;
                }
                Err(err) => {
                    warn!("skipping unreadable message log record in {path:?}: {err}");
                }
            }
            offset += 4 + len;
            valid_end = offset;
        }
        if valid_end < buf.len() {
            warn!(
                "message log {path:?} has a torn tail ({} bytes dropped)",
                buf.len() - valid_end
            );
            file.set_len(valid_end as u64)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self { index, file, path })
    }

    fn append_record(&mut self, record: &LogRecord) -> io::Result<()> {
        let body = serde_json::to_vec(record).map_err(io::Error::other)?;
        let len = (body.len() as u32).to_le_bytes();
        self.file.write_all(&len)?;
        self.file.write_all(&body)?;
        self.file.sync_data()
    }
}

impl MsgStore for FileMsgStore {
    fn store_msg(&mut self, subject: &str, payload: &[u8]) -> io::Result<(u64, u64)> {
        let (seq, size) = self.index.append(subject, payload);
        self.append_record(&LogRecord::Msg {
            seq,
            subject: subject.to_string(),
            payload: payload.to_vec(),
        })?;
        Ok((seq, size))
    }

    fn erase_msg(&mut self, seq: u64) -> io::Result<Option<u64>> {
        match self.index.remove(seq) {
            Some(size) => {
                self.append_record(&LogRecord::Erase { seq })?;
                Ok(Some(size))
            }
            None => Ok(None),
        }
    }

    fn purge(&mut self) -> io::Result<(u64, u64)> {
        let removed = self.index.clear();
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.append_record(&LogRecord::Purge {
            last_seq: self.index.last_seq,
        })?;
        Ok(removed)
    }

    fn state(&self) -> StreamState {
        self.index.snapshot()
    }

    fn stop(&mut self) {
        if let Err(err) = self.file.sync_all() {
            warn!("failed to sync message log {:?}: {err}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mem_store_sequencing() {
        let mut store = MemMsgStore::new();
        let (seq, size) = store.store_msg("a.b", b"one").unwrap();
        assert_eq!(seq, 1);
        assert_eq!(size, 3 + 3 + MSG_OVERHEAD);
        store.store_msg("a.b", b"two").unwrap();
        let state = store.state();
        assert_eq!((state.first_seq, state.last_seq, state.messages), (1, 2, 2));
    }

    #[test]
    fn erase_and_purge_adjust_state() {
        let mut store = MemMsgStore::new();
        for payload in [b"1", b"2", b"3"] {
            store.store_msg("s", payload).unwrap();
        }
        assert!(store.erase_msg(1).unwrap().is_some());
        assert!(store.erase_msg(1).unwrap().is_none());
        let state = store.state();
        assert_eq!((state.first_seq, state.messages), (2, 2));

        store.purge().unwrap();
        let state = store.state();
        assert_eq!((state.messages, state.bytes), (0, 0));
        assert_eq!(state.first_seq, state.last_seq + 1);

        let (seq, _) = store.store_msg("s", b"4").unwrap();
        assert_eq!(seq, 4);
    }

    #[test]
    fn file_store_replays_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileMsgStore::open(dir.path()).unwrap();
            store.store_msg("orders.new", b"m1").unwrap();
            store.store_msg("orders.new", b"m2").unwrap();
            store.erase_msg(1).unwrap();
            store.stop();
        }
        let store = FileMsgStore::open(dir.path()).unwrap();
        let state = store.state();
        assert_eq!((state.messages, state.first_seq, state.last_seq), (1, 2, 2));
    }

    #[test]
    fn file_store_purge_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileMsgStore::open(dir.path()).unwrap();
            store.store_msg("s", b"1").unwrap();
            store.store_msg("s", b"2").unwrap();
            store.purge().unwrap();
            store.stop();
        }
        let store = FileMsgStore::open(dir.path()).unwrap();
        let state = store.state();
        assert_eq!((state.messages, state.last_seq, state.first_seq), (0, 2, 3));
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        {
            let mut store = FileMsgStore::open(dir.path()).unwrap();
            store.store_msg("s", b"whole").unwrap();
            store.stop();
        }
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0, 0, b'{', b'x']).unwrap();
        drop(file);

        let mut store = FileMsgStore::open(dir.path()).unwrap();
        assert_eq!(store.state().messages, 1);
        let (seq, _) = store.store_msg("s", b"after").unwrap();
        assert_eq!(seq, 2);
        store.stop();

        let store = FileMsgStore::open(dir.path()).unwrap();
        assert_eq!(store.state().messages, 2);
    }
}
