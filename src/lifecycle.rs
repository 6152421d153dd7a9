//! Server-level lifecycle: enabling and shutting down the streaming
//! subsystem, and enabling/disabling it per account.

use crate::account::{AccountLimits, JetStreamAccount};
use crate::api;
use crate::bus::Bus;
use crate::config::JetStreamConfig;
use crate::error::{JetStreamError, Result};
use crate::ledger::Ledger;
use log::info;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// The streaming subsystem's per-server handle. Holds the server slot: at
/// most one enabled [`Ledger`] at a time.
pub struct JetStream {
    bus: Arc<dyn Bus>,
    state: Mutex<Option<Arc<Ledger>>>,
}

impl JetStream {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            state: Mutex::new(None),
        }
    }

    /// Enables the subsystem. A `None` configuration (or one with
    /// non-positive budgets) selects dynamic limits and a temp-based storage
    /// directory.
    pub fn enable(&self, config: Option<JetStreamConfig>) -> Result<()> {
        let mut slot = self.state.lock();
        if !self.bus.standalone() {
            return Err(JetStreamError::StandaloneRequired);
        }
        if slot.is_some() {
            return Err(JetStreamError::AlreadyEnabled);
        }
        info!("starting jetstream");
        let cfg = JetStreamConfig::normalize(config);
        ensure_store_dir(&cfg.store_dir)?;

        // The API is hosted as a service of the system account.
        let sys = match self.bus.system_account() {
            Some(sys) => sys,
            None => self.bus.set_default_system_account(),
        };

        let ledger = Arc::new(Ledger::new(cfg.clone(), Arc::clone(&self.bus)));
        api::subscribe_all(&self.bus, &ledger)?;
        for subject in api::ALL_ENDPOINTS {
            self.bus
                .add_service_export(&sys, subject)
                .map_err(JetStreamError::ServiceExport)?;
        }

        info!("  max memory:      {} bytes", cfg.max_memory);
        info!("  max storage:     {} bytes", cfg.max_store);
        info!("  store directory: {:?}", cfg.store_dir);

        *slot = Some(Arc::clone(&ledger));
        drop(slot);

        if self.bus.global_account_only() {
            let global = self.bus.global_account();
            ledger.enable_account(&global, None)?;
        }
        Ok(())
    }

    /// Tears the subsystem down: every account is flushed and disabled, then
    /// the server slot is cleared.
    pub fn shutdown(&self) {
        let ledger = self.state.lock().take();
        if let Some(ledger) = ledger {
            info!("shutting down jetstream");
            ledger.shutdown();
        }
    }

    pub fn enabled(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Copy of the active configuration, useful when it was chosen
    /// dynamically.
    pub fn config(&self) -> Option<JetStreamConfig> {
        self.state.lock().as_ref().map(|l| l.config().clone())
    }

    pub fn num_accounts(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |l| l.num_accounts())
    }

    /// Reserved (memory, storage) bytes across all accounts.
    pub fn reserved_resources(&self) -> Result<(i64, i64)> {
        Ok(self.ledger()?.reserved_resources())
    }

    pub fn enable_account(
        &self,
        name: &str,
        limits: Option<AccountLimits>,
    ) -> Result<Arc<JetStreamAccount>> {
        self.ledger()?.enable_account(name, limits)
    }

    pub fn disable_account(&self, name: &str) -> Result<()> {
        self.ledger()?.disable_account(name)
    }

    pub fn update_account_limits(
        &self,
        name: &str,
        limits: Option<AccountLimits>,
    ) -> Result<()> {
        self.ledger()?.update_account_limits(name, limits)
    }

    pub fn lookup_account(&self, name: &str) -> Option<Arc<JetStreamAccount>> {
        self.state
            .lock()
            .as_ref()
            .and_then(|l| l.lookup_account(name))
    }

    pub fn account_enabled(&self, name: &str) -> bool {
        self.lookup_account(name).is_some()
    }

    fn ledger(&self) -> Result<Arc<Ledger>> {
        self.state
            .lock()
            .clone()
            .ok_or(JetStreamError::NotEnabled)
    }
}

/// Verifies the storage directory exists, is a directory, and is writable
/// (probed with a scratch file).
fn ensure_store_dir(dir: &Path) -> Result<()> {
    match fs::metadata(dir) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return fs::create_dir_all(dir).map_err(JetStreamError::StorageDirCreate);
        }
        Err(err) => return Err(JetStreamError::Io(err)),
        Ok(md) if !md.is_dir() => return Err(JetStreamError::StorageDirNotADirectory),
        Ok(_) => {}
    }
    let probe = dir.join(format!("_probe_{}", std::process::id()));
    let write_check = fs::File::create(&probe).and_then(|mut f| f.write_all(b"ok"));
    match write_check {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(_) => Err(JetStreamError::StorageDirNotWritable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use tempfile::tempdir;

    fn server_config(dir: &Path) -> JetStreamConfig {
        JetStreamConfig {
            max_memory: 1024 * 1024,
            max_store: 1024 * 1024,
            store_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn enable_then_enable_fails() {
        let dir = tempdir().unwrap();
        let js = JetStream::new(Arc::new(MemoryBus::new()));
        js.enable(Some(server_config(dir.path()))).unwrap();
        let err = js.enable(Some(server_config(dir.path()))).unwrap_err();
        assert!(matches!(err, JetStreamError::AlreadyEnabled));
        assert_eq!(err.to_string(), "jetstream already enabled");
    }

    #[test]
    fn enable_requires_standalone() {
        let dir = tempdir().unwrap();
        let js = JetStream::new(Arc::new(MemoryBus::new_clustered()));
        let err = js.enable(Some(server_config(dir.path()))).unwrap_err();
        assert!(matches!(err, JetStreamError::StandaloneRequired));
    }

    #[test]
    fn enable_rejects_non_directory_store() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        let js = JetStream::new(Arc::new(MemoryBus::new()));
        let err = js
            .enable(Some(JetStreamConfig {
                max_memory: 1,
                max_store: 1,
                store_dir: file,
            }))
            .unwrap_err();
        assert!(matches!(err, JetStreamError::StorageDirNotADirectory));
    }

    #[test]
    fn dynamic_config_defaults() {
        let js = JetStream::new(Arc::new(MemoryBus::new()));
        js.enable(None).unwrap();
        let cfg = js.config().unwrap();
        assert_eq!(cfg.max_store, crate::config::MAX_STORE_DEFAULT);
        assert!(cfg.max_memory > 0);
        assert!(cfg.store_dir.ends_with(crate::config::STORE_DIR_NAME));
        js.shutdown();
    }

    #[test]
    fn global_account_only_auto_enables() {
        let dir = tempdir().unwrap();
        let bus = MemoryBus::new_global_only();
        let js = JetStream::new(Arc::new(bus.clone()));
        js.enable(Some(server_config(dir.path()))).unwrap();
        assert!(js.account_enabled(&Bus::global_account(&bus)));
        assert_eq!(js.num_accounts(), 1);
    }

    #[test]
    fn shutdown_clears_state() {
        let dir = tempdir().unwrap();
        let js = JetStream::new(Arc::new(MemoryBus::new()));
        js.enable(Some(server_config(dir.path()))).unwrap();
        js.enable_account("A", None).unwrap();
        js.shutdown();
        assert!(!js.enabled());
        assert!(matches!(
            js.reserved_resources(),
            Err(JetStreamError::NotEnabled)
        ));
        // A fresh enable starts clean.
        js.enable(Some(server_config(dir.path()))).unwrap();
        assert_eq!(js.num_accounts(), 0);
    }
}
