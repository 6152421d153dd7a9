//! Stream templates: configurations that materialize a stream per distinct
//! matching subject, up to a cap.
//!
//! A template owns an internal broker client subscribed to its prototype's
//! subject set. The first message on a not-yet-seen subject creates a stream
//! whose name is the canonicalized subject; the message itself is handed to
//! the fresh stream so nothing is lost.

use crate::account::JetStreamAccount;
use crate::bus::{Bus, BusClient, Delivery};
use crate::error::{JetStreamError, Result};
use crate::stream::{StorageType, StreamConfig};
use crate::subject::canonical_name;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Placeholder assigned to the prototype config so it passes stream config
/// validation; persisted metadata blanks it again.
pub(crate) const PROTOTYPE_NAME: &str = "_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTemplateConfig {
    pub name: String,
    pub config: StreamConfig,
    #[serde(default)]
    pub max_streams: u32,
}

/// Body of `$JS.TEMPLATE.*.INFO` replies.
#[derive(Debug, Clone, Serialize)]
pub struct StreamTemplateInfo {
    pub config: StreamTemplateConfig,
    pub streams: Vec<String>,
}

pub struct StreamTemplate {
    config: StreamTemplateConfig,
    account: Weak<JetStreamAccount>,
    client: Mutex<Option<Box<dyn BusClient>>>,
    streams: Mutex<Vec<String>>,
}

impl StreamTemplate {
    pub(crate) fn new(account: &Arc<JetStreamAccount>, config: StreamTemplateConfig) -> Self {
        Self {
            config,
            account: Arc::downgrade(account),
            client: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn prototype_storage(&self) -> StorageType {
        self.config.config.storage
    }

    pub(crate) fn raw_config(&self) -> &StreamTemplateConfig {
        &self.config
    }

    /// Copy of the template config with the prototype placeholder name
    /// blanked, as shown to clients and persisted on disk.
    pub fn config(&self) -> StreamTemplateConfig {
        let mut cfg = self.config.clone();
        cfg.config.name = String::new();
        cfg
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.lock().clone()
    }

    pub fn info(&self) -> StreamTemplateInfo {
        StreamTemplateInfo {
            config: self.config(),
            streams: self.stream_names(),
        }
    }

    /// Records a materialized stream name. Idempotent, so the dispatcher's
    /// early append and stream registration cannot double-insert.
    pub(crate) fn add_stream_name(&self, name: &str) {
        let mut streams = self.streams.lock();
        if !streams.iter().any(|s| s == name) {
            streams.push(name.to_string());
        }
    }

    pub(crate) fn remove_stream_name(&self, name: &str) {
        self.streams.lock().retain(|s| s != name);
    }

    pub(crate) fn set_stream_names(&self, names: Vec<String>) {
        *self.streams.lock() = names;
    }

    /// Subscribes the prototype's subject set through a dedicated internal
    /// client, wiring deliveries into the materialization path.
    pub(crate) fn subscribe(self: &Arc<Self>, bus: &Arc<dyn Bus>, account_name: &str) -> Result<()> {
        let client = bus.create_client(account_name);
        for subj in &self.config.config.subjects {
            let weak = Arc::downgrade(self);
            client
                .subscribe(
                    subj,
                    Arc::new(move |delivery: Delivery<'_>| {
                        if let Some(template) = weak.upgrade() {
                            template.dispatch(delivery.subject, delivery.reply, delivery.payload);
                        }
                    }),
                )
                .map_err(JetStreamError::Subscription)?;
        }
        *self.client.lock() = Some(client);
        Ok(())
    }

    pub(crate) fn close_client(&self) {
        if let Some(client) = self.client.lock().take() {
            client.close();
        }
    }

    /// Materializes (at most once per canonical subject) the stream backing
    /// an inbound message, then hands the message to it. Existing streams
    /// receive the message through their own subscriptions, so an already
    /// materialized subject is simply skipped here.
    fn dispatch(self: &Arc<Self>, subject: &str, reply: &str, payload: &[u8]) {
        let Some(account) = self.account.upgrade() else {
            return;
        };
        let stream_name = canonical_name(subject);
        if account.stream_exists(&stream_name) {
            return;
        }

        let at_limit = {
            let mut streams = self.streams.lock();
            if streams.iter().any(|s| s == &stream_name) {
                // Another delivery is already materializing this subject.
                return;
            }
            let max = self.config.max_streams;
            if max > 0 && streams.len() >= max as usize {
                true
            } else {
                streams.push(stream_name.clone());
                false
            }
        };
        if at_limit {
            warn!(
                "jetstream could not create stream for account {:?} on subject {subject:?}, at limit",
                account.name()
            );
            return;
        }

        let mut cfg = self.config.config.clone();
        cfg.name = stream_name;
        cfg.subjects = vec![subject.to_string()];
        cfg.template = Some(self.config.name.clone());

        match account.add_stream(cfg) {
            Ok(stream) => stream.process_inbound_msg(subject, reply, payload),
            Err(err) => {
                account.validate_streams(self);
                warn!(
                    "jetstream could not create stream for account {:?} on subject {subject:?}: {err}",
                    account.name()
                );
            }
        }
    }

    /// Deletes the template and every stream it materialized. All streams
    /// are attempted; the last failure wins as the returned error.
    pub fn delete(self: &Arc<Self>) -> Result<()> {
        self.close_client();
        let account = self
            .account
            .upgrade()
            .ok_or(JetStreamError::NotEnabledForAccount)?;
        account.unregister_template(self.name())?;

        let store_result = account.template_store_delete(self.name());
        let names = self.stream_names();
        let mut last_err = None;
        for name in names {
            if let Ok(stream) = account.lookup_stream(&name) {
                if let Err(err) = stream.delete() {
                    last_err = Some(err);
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err);
        }
        store_result.map_err(|err| JetStreamError::TemplateStoreDelete(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_config_json_shape() {
        let tc: StreamTemplateConfig = serde_json::from_str(
            r#"{"name":"T","config":{"name":"","subjects":["stock.*"]},"max_streams":2}"#,
        )
        .unwrap();
        assert_eq!(tc.name, "T");
        assert_eq!(tc.max_streams, 2);
        assert!(tc.config.name.is_empty());
    }
}
