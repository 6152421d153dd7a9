#![allow(dead_code)]

use jetcore::{AccountLimits, JetStream, JetStreamConfig, MemoryBus};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Harness {
    pub bus: MemoryBus,
    pub js: JetStream,
    pub dir: TempDir,
}

/// An enabled server over a scratch store directory and an in-process bus.
pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let bus = MemoryBus::new();
    let js = JetStream::new(Arc::new(bus.clone()));
    js.enable(Some(server_config(dir.path()))).unwrap();
    Harness { bus, js, dir }
}

pub fn server_config(dir: &Path) -> JetStreamConfig {
    JetStreamConfig {
        max_memory: 64 * 1024 * 1024,
        max_store: 64 * 1024 * 1024,
        store_dir: dir.to_path_buf(),
    }
}

pub fn limits(mem: i64, store: i64, streams: i32, consumers: i32) -> AccountLimits {
    AccountLimits {
        max_memory: mem,
        max_store: store,
        max_streams: streams,
        max_consumers: consumers,
    }
}

/// Modest account limits leaving room for more accounts on the same server.
pub fn default_limits() -> AccountLimits {
    limits(1 << 20, 1 << 20, -1, -1)
}

impl Harness {
    /// Request/reply through the API, reply decoded as UTF-8.
    pub fn request_str(&self, account: &str, subject: &str, payload: &[u8]) -> String {
        let reply = self
            .bus
            .request(account, subject, payload)
            .unwrap_or_else(|| panic!("no reply on {subject}"));
        String::from_utf8(reply).unwrap()
    }

    pub fn request_json(&self, account: &str, subject: &str) -> serde_json::Value {
        let reply = self.request_str(account, subject, b"");
        serde_json::from_str(&reply)
            .unwrap_or_else(|err| panic!("non-JSON reply on {subject}: {reply} ({err})"))
    }
}
