//! Streams: durable ordered logs capturing messages published to a subject
//! set.

use crate::account::JetStreamAccount;
use crate::bus::{Bus, BusClient, Delivery};
use crate::consumer::{generate_ephemeral_name, Consumer, ConsumerConfig};
use crate::error::{JetStreamError, Result};
use crate::metastore::CONSUMERS_DIR;
use crate::msgstore::{MsgStore, StreamState};
use crate::subject;
use log::warn;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(default)]
    pub max_consumers: i32,
    #[serde(default)]
    pub max_msgs: i64,
    #[serde(default)]
    pub max_bytes: i64,
    #[serde(default = "default_replicas", rename = "num_replicas")]
    pub replicas: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

fn default_replicas() -> usize {
    1
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            storage: StorageType::default(),
            max_consumers: 0,
            max_msgs: 0,
            max_bytes: 0,
            replicas: 1,
            template: None,
        }
    }
}

/// Body of `$JS.STREAM.*.INFO` replies.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub state: StreamState,
    pub config: StreamConfig,
}

/// Normalizes and validates a stream configuration: legal name, well-formed
/// subjects (defaulting to the stream name), at least one replica.
pub fn check_stream_config(mut cfg: StreamConfig) -> Result<StreamConfig> {
    if !subject::is_valid_name(&cfg.name) {
        return Err(JetStreamError::InvalidStreamName);
    }
    if cfg.subjects.is_empty() {
        cfg.subjects.push(cfg.name.clone());
    }
    for subj in &cfg.subjects {
        if !subject::is_valid_subject(subj) {
            return Err(JetStreamError::InvalidStreamSubject(subj.clone()));
        }
    }
    if cfg.replicas == 0 {
        cfg.replicas = 1;
    }
    if cfg.max_consumers < 0 {
        cfg.max_consumers = 0;
    }
    Ok(cfg)
}

pub struct Stream {
    name: String,
    account: Weak<JetStreamAccount>,
    config: RwLock<StreamConfig>,
    store: Mutex<Box<dyn MsgStore>>,
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
    client: Mutex<Option<Box<dyn BusClient>>>,
    /// `streams/<name>` for file-backed streams.
    store_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("store_dir", &self.store_dir)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(
        account: &Arc<JetStreamAccount>,
        config: StreamConfig,
        store: Box<dyn MsgStore>,
        store_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            account: Arc::downgrade(account),
            config: RwLock::new(config),
            store: Mutex::new(store),
            consumers: Mutex::new(HashMap::new()),
            client: Mutex::new(None),
            store_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> StreamConfig {
        self.config.read().clone()
    }

    pub fn state(&self) -> StreamState {
        let mut state = self.store.lock().state();
        state.consumer_count = self.consumers.lock().len();
        state
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            state: self.state(),
            config: self.config(),
        }
    }

    /// Wires the stream's subject set into the broker so published messages
    /// land in the log.
    pub(crate) fn subscribe(self: &Arc<Self>, bus: &Arc<dyn Bus>, account_name: &str) -> Result<()> {
        let client = bus.create_client(account_name);
        let subjects = self.config.read().subjects.clone();
        for subj in subjects {
            let weak = Arc::downgrade(self);
            client
                .subscribe(
                    &subj,
                    Arc::new(move |delivery: Delivery<'_>| {
                        if let Some(stream) = weak.upgrade() {
                            stream.process_inbound_msg(delivery.subject, delivery.reply, delivery.payload);
                        }
                    }),
                )
                .map_err(JetStreamError::Subscription)?;
        }
        *self.client.lock() = Some(client);
        Ok(())
    }

    /// Ingests one published message, charging the account and applying the
    /// stream's retention caps.
    pub fn process_inbound_msg(&self, subject: &str, _reply: &str, payload: &[u8]) {
        let Some(account) = self.account.upgrade() else {
            return;
        };
        let (storage, max_msgs, max_bytes) = {
            let cfg = self.config.read();
            (cfg.storage, cfg.max_msgs, cfg.max_bytes)
        };
        if account.limits_exceeded(storage) {
            warn!(
                "resource limits exceeded for account {:?}, dropping message on {subject:?}",
                account.name()
            );
            return;
        }
        let mut store = self.store.lock();
        match store.store_msg(subject, payload) {
            Ok((_seq, size)) => account.update_usage(storage, size as i64),
            Err(err) => {
                warn!("stream {:?} failed to store message: {err}", self.name);
                return;
            }
        }
        // Retention: oldest messages fall off once caps are crossed.
        loop {
            let state = store.state();
            let over_msgs = max_msgs > 0 && state.messages > max_msgs as u64;
            let over_bytes = max_bytes > 0 && state.bytes > max_bytes as u64;
            if (!over_msgs && !over_bytes) || state.messages == 0 {
                break;
            }
            match store.erase_msg(state.first_seq) {
                Ok(Some(freed)) => account.update_usage(storage, -(freed as i64)),
                _ => break,
            }
        }
    }

    /// Drops every message. Returns the number purged.
    pub fn purge(&self) -> u64 {
        let storage = self.config.read().storage;
        let purged = match self.store.lock().purge() {
            Ok((msgs, bytes)) => {
                if let Some(account) = self.account.upgrade() {
                    account.update_usage(storage, -(bytes as i64));
                }
                msgs
            }
            Err(err) => {
                warn!("stream {:?} purge failed: {err}", self.name);
                0
            }
        };
        purged
    }

    /// Erases one message by stream sequence. Returns false when the
    /// sequence is not present.
    pub fn erase_msg(&self, seq: u64) -> bool {
        let storage = self.config.read().storage;
        match self.store.lock().erase_msg(seq) {
            Ok(Some(freed)) => {
                if let Some(account) = self.account.upgrade() {
                    account.update_usage(storage, -(freed as i64));
                }
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("stream {:?} erase of seq {seq} failed: {err}", self.name);
                false
            }
        }
    }

    /// Removes the stream from its account, releasing reservations and
    /// deleting on-disk state.
    pub fn delete(self: &Arc<Self>) -> Result<()> {
        let account = self
            .account
            .upgrade()
            .ok_or(JetStreamError::NotEnabledForAccount)?;
        account.unregister_stream(self)?;
        self.stop(true);
        Ok(())
    }

    /// Stops ingestion and flushes the store. With `delete_data` the stream
    /// directory is removed as well.
    pub(crate) fn stop(&self, delete_data: bool) {
        if let Some(client) = self.client.lock().take() {
            client.close();
        }
        self.store.lock().stop();
        if delete_data {
            if let Some(dir) = &self.store_dir {
                if let Err(err) = fs::remove_dir_all(dir) {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!("failed to remove stream directory {dir:?}: {err}");
                    }
                }
            }
        }
    }

    /// Adds a consumer, enforcing per-stream and account-wide caps and the
    /// durable naming rules.
    pub fn add_consumer(self: &Arc<Self>, config: ConsumerConfig) -> Result<Arc<Consumer>> {
        let account = self
            .account
            .upgrade()
            .ok_or(JetStreamError::NotEnabledForAccount)?;

        if let Some(subj) = config.deliver_subject.as_deref() {
            if subj.contains(['*', '>']) {
                return Err(JetStreamError::DeliverSubjectWildcard);
            }
        }

        let account_limit = account.max_consumers_limit();
        let account_total = account.total_consumers();
        let stream_limit = self.config.read().max_consumers;

        let mut consumers = self.consumers.lock();
        if stream_limit > 0 && consumers.len() >= stream_limit as usize {
            return Err(JetStreamError::MaxConsumersReached);
        }
        if account_limit > 0 && account_total >= account_limit as usize {
            return Err(JetStreamError::MaxConsumersReached);
        }

        let name = if config.is_durable() {
            let durable = config.durable.clone().unwrap_or_default();
            if !subject::is_valid_name(&durable) {
                return Err(JetStreamError::InvalidConsumerName);
            }
            if consumers.contains_key(&durable) {
                return Err(JetStreamError::ConsumerNameInUse);
            }
            durable
        } else {
            loop {
                let candidate = generate_ephemeral_name();
                if !consumers.contains_key(&candidate) {
                    break candidate;
                }
            }
        };

        let store_dir = if config.is_durable() {
            self.store_dir
                .as_ref()
                .map(|dir| dir.join(CONSUMERS_DIR).join(&name))
        } else {
            None
        };

        let consumer = Arc::new(Consumer::new(name.clone(), self, config, store_dir));
        consumer.persist_meta()?;
        consumers.insert(name, Arc::clone(&consumer));
        Ok(consumer)
    }

    pub fn lookup_consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.lock().get(name).cloned()
    }

    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().values().cloned().collect()
    }

    pub(crate) fn num_consumers(&self) -> usize {
        self.consumers.lock().len()
    }

    pub(crate) fn remove_consumer(&self, name: &str) -> Result<()> {
        self.consumers
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or(JetStreamError::ConsumerNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_subjects_to_name() {
        let cfg = check_stream_config(StreamConfig {
            name: "orders".into(),
            ..StreamConfig::default()
        })
        .unwrap();
        assert_eq!(cfg.subjects, ["orders"]);
        assert_eq!(cfg.replicas, 1);
    }

    #[test]
    fn config_rejects_bad_names_and_subjects() {
        let bad_name = check_stream_config(StreamConfig {
            name: "or.ders".into(),
            ..StreamConfig::default()
        });
        assert!(matches!(bad_name, Err(JetStreamError::InvalidStreamName)));

        let bad_subject = check_stream_config(StreamConfig {
            name: "orders".into(),
            subjects: vec!["a..b".into()],
            ..StreamConfig::default()
        });
        assert!(matches!(
            bad_subject,
            Err(JetStreamError::InvalidStreamSubject(_))
        ));
    }

    #[test]
    fn config_json_shape() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"name":"x","storage":"file","num_replicas":1}"#).unwrap();
        assert_eq!(cfg.storage, StorageType::File);
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["num_replicas"], 1);
        assert!(json.get("template").is_none());
    }
}
