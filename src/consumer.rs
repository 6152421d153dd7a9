//! Consumers: named cursors over a stream.
//!
//! A consumer is durable when the client supplied a durable name; durables
//! on file-backed streams persist their config and cursor under the stream's
//! `consumers/` directory and are rebuilt at recovery. Ephemeral consumers
//! get a server-assigned name and leave no on-disk trace.

use crate::error::{JetStreamError, Result};
use crate::metastore::{self, CONSUMER_STATE_FILE};
use crate::stream::Stream;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

const EPHEMERAL_NAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default, rename = "durable_name", skip_serializing_if = "Option::is_none")]
    pub durable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
}

impl ConsumerConfig {
    pub fn is_durable(&self) -> bool {
        self.durable.as_deref().is_some_and(|d| !d.is_empty())
    }
}

/// Body of `$JS.STREAM.*.CONSUMER.*.CREATE` and its ephemeral sibling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConsumerRequest {
    pub stream_name: String,
    pub config: ConsumerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Persisted cursor of a durable consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerState {
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    pub num_pending: u64,
}

pub struct Consumer {
    name: String,
    stream: Weak<Stream>,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    /// Present for durables on file-backed streams.
    store_dir: Option<PathBuf>,
}

impl Consumer {
    pub(crate) fn new(
        name: String,
        stream: &Arc<Stream>,
        config: ConsumerConfig,
        store_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name,
            stream: Arc::downgrade(stream),
            config,
            state: Mutex::new(ConsumerState::default()),
            store_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.config.is_durable()
    }

    pub fn config(&self) -> ConsumerConfig {
        self.config.clone()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub fn info(&self) -> ConsumerInfo {
        let state = *self.state.lock();
        let (stream_name, last_seq) = match self.stream.upgrade() {
            Some(stream) => (stream.name().to_string(), stream.state().last_seq),
            None => (String::new(), 0),
        };
        ConsumerInfo {
            stream_name,
            name: self.name.clone(),
            config: self.config.clone(),
            delivered: state.delivered,
            ack_floor: state.ack_floor,
            num_pending: last_seq.saturating_sub(state.delivered.stream_seq),
        }
    }

    /// Removes the consumer from its stream and deletes any on-disk state.
    pub fn delete(&self) -> Result<()> {
        let stream = self.stream.upgrade().ok_or(JetStreamError::StreamNotFound)?;
        stream.remove_consumer(&self.name)?;
        if let Some(dir) = &self.store_dir {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(JetStreamError::Io(err)),
            }
        }
        Ok(())
    }

    /// Writes `meta.inf`/`meta.sum` for a durable. The checksum key is
    /// derived from the consumer's own directory path.
    pub(crate) fn persist_meta(&self) -> Result<()> {
        let Some(dir) = &self.store_dir else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&self.config)?;
        let key = metastore::checksum_key(dir);
        metastore::write_meta(dir, &key, &payload)?;
        // Seed the cursor file only when absent so recovery keeps the
        // previous position.
        let state_path = dir.join(CONSUMER_STATE_FILE);
        if !state_path.exists() {
            self.write_state()?;
        }
        Ok(())
    }

    pub(crate) fn write_state(&self) -> Result<()> {
        let Some(dir) = &self.store_dir else {
            return Ok(());
        };
        let payload = serde_json::to_vec_pretty(&*self.state.lock())?;
        metastore::atomic_write(&dir.join(CONSUMER_STATE_FILE), &payload)?;
        Ok(())
    }

    /// Reloads the persisted cursor, resuming the delivered/ack position.
    pub(crate) fn read_stored_state(&self) -> Result<()> {
        let Some(dir) = &self.store_dir else {
            return Ok(());
        };
        let path = dir.join(CONSUMER_STATE_FILE);
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => ConsumerState::default(),
            Err(err) => return Err(JetStreamError::Io(err)),
        };
        *self.state.lock() = state;
        Ok(())
    }
}

/// Server-assigned name for an ephemeral consumer.
pub(crate) fn generate_ephemeral_name() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(EPHEMERAL_NAME_LEN)
        .map(char::from)
        .collect()
}
