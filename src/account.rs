//! Per-account streaming state: limits, usage accounting, and the stream
//! and template registries.

use crate::bus::Bus;
use crate::error::{JetStreamError, Result};
use crate::metastore::{
    self, TemplateFileStore, TemplateMemStore, TemplateStore, MSGS_DIR, STREAMS_DIR,
};
use crate::msgstore::{FileMsgStore, MemMsgStore, MsgStore};
use crate::stream::{check_stream_config, StorageType, Stream, StreamConfig};
use crate::subject;
use crate::template::{StreamTemplate, StreamTemplateConfig, PROTOTYPE_NAME};
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-account resource limits. Byte limits of -1 mean unlimited/dynamic;
/// -1 counts mean unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLimits {
    pub max_memory: i64,
    #[serde(rename = "max_storage")]
    pub max_store: i64,
    pub max_streams: i32,
    pub max_consumers: i32,
}

/// Current usage and limits for an account, the `$JS.INFO` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStats {
    pub memory: u64,
    pub storage: u64,
    pub streams: usize,
    pub limits: AccountLimits,
}

struct AccountState {
    limits: AccountLimits,
    mem_reserved: i64,
    mem_used: i64,
    store_reserved: i64,
    store_used: i64,
    streams: HashMap<String, Arc<Stream>>,
    templates: HashMap<String, Arc<StreamTemplate>>,
    template_store: Option<Box<dyn TemplateStore>>,
}

/// A JetStream-enabled account.
pub struct JetStreamAccount {
    name: String,
    store_dir: PathBuf,
    bus: Arc<dyn Bus>,
    state: RwLock<AccountState>,
}

impl std::fmt::Debug for JetStreamAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamAccount")
            .field("name", &self.name)
            .field("store_dir", &self.store_dir)
            .finish_non_exhaustive()
    }
}

impl JetStreamAccount {
    pub(crate) fn new(
        name: &str,
        store_dir: PathBuf,
        bus: Arc<dyn Bus>,
        limits: AccountLimits,
    ) -> Self {
        Self {
            name: name.to_string(),
            store_dir,
            bus,
            state: RwLock::new(AccountState {
                limits,
                mem_reserved: 0,
                mem_used: 0,
                store_reserved: 0,
                store_used: 0,
                streams: HashMap::new(),
                templates: HashMap::new(),
                template_store: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn limits(&self) -> AccountLimits {
        self.state.read().limits
    }

    pub(crate) fn set_limits(&self, limits: AccountLimits) {
        self.state.write().limits = limits;
    }

    pub fn usage(&self) -> AccountStats {
        let st = self.state.read();
        AccountStats {
            memory: st.mem_used.max(0) as u64,
            storage: st.store_used.max(0) as u64,
            streams: st.streams.len(),
            limits: st.limits,
        }
    }

    /// Adjusts in-use accounting for the given storage class.
    pub(crate) fn update_usage(&self, storage: StorageType, delta: i64) {
        let mut st = self.state.write();
        match storage {
            StorageType::Memory => st.mem_used += delta,
            StorageType::File => st.store_used += delta,
        }
    }

    /// Whether in-use bytes exceed the account budget for a storage class.
    /// Non-positive limits are unlimited.
    pub(crate) fn limits_exceeded(&self, storage: StorageType) -> bool {
        let st = self.state.read();
        match storage {
            StorageType::Memory => st.limits.max_memory > 0 && st.mem_used > st.limits.max_memory,
            StorageType::File => st.limits.max_store > 0 && st.store_used > st.limits.max_store,
        }
    }

    pub fn num_streams(&self) -> usize {
        self.state.read().streams.len()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.state.read().streams.values().cloned().collect()
    }

    pub fn lookup_stream(&self, name: &str) -> Result<Arc<Stream>> {
        self.state
            .read()
            .streams
            .get(name)
            .cloned()
            .ok_or(JetStreamError::StreamNotFound)
    }

    pub(crate) fn stream_exists(&self, name: &str) -> bool {
        self.state.read().streams.contains_key(name)
    }

    pub(crate) fn max_consumers_limit(&self) -> i32 {
        self.state.read().limits.max_consumers
    }

    pub(crate) fn total_consumers(&self) -> usize {
        let streams = self.streams();
        streams.iter().map(|s| s.num_consumers()).sum()
    }

    /// Admission checks for a new stream, under the account lock. An
    /// admitted stream inherits the account's `max_consumers` policy.
    fn check_limits(st: &AccountState, cfg: &mut StreamConfig) -> Result<()> {
        if st.limits.max_streams > 0 && st.streams.len() >= st.limits.max_streams as usize {
            return Err(JetStreamError::MaxStreamsReached);
        }
        if cfg.replicas != 1 {
            return Err(JetStreamError::ReplicasNotSupported(cfg.replicas));
        }
        if cfg.max_consumers > 0 && cfg.max_consumers > st.limits.max_consumers {
            return Err(JetStreamError::MaxConsumersExceedsAccount);
        }
        cfg.max_consumers = st.limits.max_consumers;
        if cfg.max_bytes > 0 {
            let want = cfg.max_bytes * cfg.replicas as i64;
            match cfg.storage {
                StorageType::Memory => {
                    if st.limits.max_memory > 0 && st.mem_reserved + want > st.limits.max_memory {
                        return Err(JetStreamError::InsufficientMemory);
                    }
                }
                StorageType::File => {
                    if st.limits.max_store > 0 && st.store_reserved + want > st.limits.max_store {
                        return Err(JetStreamError::InsufficientStorage);
                    }
                }
            }
        }
        Ok(())
    }

    fn reserve_stream(st: &mut AccountState, cfg: &StreamConfig) {
        if cfg.max_bytes > 0 {
            let want = cfg.max_bytes * cfg.replicas as i64;
            match cfg.storage {
                StorageType::Memory => st.mem_reserved += want,
                StorageType::File => st.store_reserved += want,
            }
        }
    }

    fn release_stream(&self, cfg: &StreamConfig) {
        if cfg.max_bytes > 0 {
            let want = cfg.max_bytes * cfg.replicas as i64;
            let mut st = self.state.write();
            match cfg.storage {
                StorageType::Memory => st.mem_reserved -= want,
                StorageType::File => st.store_reserved -= want,
            }
        }
    }

    /// Creates a stream: validate, admit, reserve, build the backing store,
    /// register, subscribe. Admission happens before any persistent side
    /// effect; a lost registration race backs everything out.
    pub fn add_stream(self: &Arc<Self>, config: StreamConfig) -> Result<Arc<Stream>> {
        let mut cfg = check_stream_config(config)?;
        {
            let mut st = self.state.write();
            if st.streams.contains_key(&cfg.name) {
                return Err(JetStreamError::StreamNameInUse);
            }
            Self::check_limits(&st, &mut cfg)?;
            Self::reserve_stream(&mut st, &cfg);
        }

        let built = self.build_msg_store(&cfg);
        let (store, stream_dir) = match built {
            Ok(parts) => parts,
            Err(err) => {
                self.release_stream(&cfg);
                return Err(err);
            }
        };

        let stream = Arc::new(Stream::new(self, cfg.clone(), store, stream_dir));
        {
            let mut st = self.state.write();
            if st.streams.contains_key(&cfg.name) {
                drop(st);
                self.release_stream(&cfg);
                stream.stop(false);
                return Err(JetStreamError::StreamNameInUse);
            }
            st.streams.insert(cfg.name.clone(), Arc::clone(&stream));
        }

        if let Err(err) = stream.subscribe(&self.bus, &self.name) {
            let _ = self.unregister_stream(&stream);
            stream.stop(false);
            return Err(err);
        }

        if let Some(template) = &cfg.template {
            if let Err(err) = self.add_stream_name_to_template(template, &cfg.name) {
                warn!(
                    "stream {:?} names template {template:?} which is unknown: {err}",
                    cfg.name
                );
            }
        }
        Ok(stream)
    }

    fn build_msg_store(
        &self,
        cfg: &StreamConfig,
    ) -> Result<(Box<dyn MsgStore>, Option<PathBuf>)> {
        match cfg.storage {
            StorageType::Memory => Ok((Box::new(MemMsgStore::new()), None)),
            StorageType::File => {
                let stream_dir = self.store_dir.join(STREAMS_DIR).join(&cfg.name);
                let msgs_dir = stream_dir.join(MSGS_DIR);
                let store = FileMsgStore::open(&msgs_dir)?;
                let payload = serde_json::to_vec(cfg)?;
                let key = metastore::checksum_key(&msgs_dir);
                metastore::write_meta(&stream_dir, &key, &payload)?;
                Ok((Box::new(store), Some(stream_dir)))
            }
        }
    }

    /// Removes the stream from the registry, releasing its reservation and
    /// in-use accounting and detaching it from its template.
    pub(crate) fn unregister_stream(&self, stream: &Arc<Stream>) -> Result<()> {
        let cfg = stream.config();
        {
            let mut st = self.state.write();
            st.streams
                .remove(stream.name())
                .ok_or(JetStreamError::StreamNotFound)?;
        }
        self.release_stream(&cfg);
        let bytes = stream.state().bytes;
        if bytes > 0 {
            self.update_usage(cfg.storage, -(bytes as i64));
        }
        if let Some(template) = &cfg.template {
            if let Ok(t) = self.lookup_template(template) {
                t.remove_stream_name(stream.name());
            }
        }
        Ok(())
    }

    /// Registers a stream template. The prototype config must carry no name;
    /// a placeholder is assigned so it passes stream validation. The first
    /// template decides the account's metadata store flavor.
    pub fn add_stream_template(
        self: &Arc<Self>,
        tc: StreamTemplateConfig,
    ) -> Result<Arc<StreamTemplate>> {
        if !subject::is_valid_name(&tc.name) {
            return Err(JetStreamError::InvalidTemplateName);
        }
        if !tc.config.name.is_empty() {
            return Err(JetStreamError::TemplateNameNotEmpty);
        }
        let mut proto = tc.config.clone();
        proto.name = PROTOTYPE_NAME.to_string();
        let proto = check_stream_config(proto)?;
        let config = StreamTemplateConfig {
            name: tc.name.clone(),
            config: proto,
            max_streams: tc.max_streams,
        };
        let template = Arc::new(StreamTemplate::new(self, config));

        {
            let mut st = self.state.write();
            if st.templates.contains_key(&tc.name) {
                return Err(JetStreamError::TemplateNameInUse(tc.name));
            }
            if st.template_store.is_none() {
                st.template_store = Some(match template.prototype_storage() {
                    StorageType::File => Box::new(TemplateFileStore::new(&self.store_dir)),
                    StorageType::Memory => Box::new(TemplateMemStore),
                });
            }
            st.templates.insert(tc.name.clone(), Arc::clone(&template));
        }

        if let Err(err) = template.subscribe(&self.bus, &self.name) {
            let _ = template.delete();
            return Err(err);
        }

        let stored = {
            let st = self.state.read();
            match st.template_store.as_ref() {
                Some(store) => store.store(template.raw_config()),
                None => Ok(()),
            }
        };
        if let Err(err) = stored {
            let _ = template.delete();
            return Err(err);
        }
        Ok(template)
    }

    pub fn lookup_template(&self, name: &str) -> Result<Arc<StreamTemplate>> {
        self.state
            .read()
            .templates
            .get(name)
            .cloned()
            .ok_or(JetStreamError::TemplateNotFound)
    }

    pub fn templates(&self) -> Vec<Arc<StreamTemplate>> {
        self.state.read().templates.values().cloned().collect()
    }

    pub fn delete_stream_template(&self, name: &str) -> Result<()> {
        self.lookup_template(name)?.delete()
    }

    pub(crate) fn unregister_template(&self, name: &str) -> Result<()> {
        self.state
            .write()
            .templates
            .remove(name)
            .map(|_| ())
            .ok_or(JetStreamError::TemplateNotFound)
    }

    pub(crate) fn template_store_delete(&self, name: &str) -> Result<()> {
        let st = self.state.read();
        match st.template_store.as_ref() {
            Some(store) => store.delete(name),
            None => Ok(()),
        }
    }

    /// Records a materialized stream name against its template, for recovery
    /// and registration. Idempotent per name.
    pub(crate) fn add_stream_name_to_template(&self, template: &str, stream: &str) -> Result<()> {
        let t = self.lookup_template(template)?;
        t.add_stream_name(stream);
        Ok(())
    }

    /// Whether `template` currently lists `stream` as one of its own.
    pub fn check_template_ownership(&self, template: &str, stream: &str) -> bool {
        match self.lookup_template(template) {
            Ok(t) => t.stream_names().iter().any(|s| s == stream),
            Err(_) => false,
        }
    }

    /// Prunes a template's stream list down to names that still resolve.
    pub(crate) fn validate_streams(&self, template: &StreamTemplate) {
        let names = template.stream_names();
        let alive = {
            let st = self.state.read();
            names
                .into_iter()
                .filter(|n| st.streams.contains_key(n))
                .collect()
        };
        template.set_stream_names(alive);
    }

    /// Stops all streaming activity for the account, keeping on-disk state
    /// for a future re-enable.
    pub(crate) fn shutdown(&self) {
        let (streams, templates) = {
            let mut st = self.state.write();
            (
                st.streams.drain().map(|(_, s)| s).collect::<Vec<_>>(),
                st.templates.drain().map(|(_, t)| t).collect::<Vec<_>>(),
            )
        };
        for stream in streams {
            stream.stop(false);
        }
        for template in templates {
            template.close_client();
        }
    }
}
