//! Server-level resource ledger: per-account reservations against the
//! server's memory and storage budgets, and the set of enabled accounts.
//!
//! Admission happens before any persistent side effect; release happens
//! after the account has left the registry. Limit updates are delta-checked
//! and applied release-then-reserve under the ledger lock so concurrent
//! enables can never observe transient over-reservation.

use crate::account::{AccountLimits, JetStreamAccount};
use crate::api;
use crate::bus::Bus;
use crate::config::JetStreamConfig;
use crate::error::{JetStreamError, Result};
use crate::recovery;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct LedgerInner {
    accounts: HashMap<String, Arc<JetStreamAccount>>,
    mem_reserved: i64,
    store_reserved: i64,
}

pub struct Ledger {
    config: JetStreamConfig,
    bus: Arc<dyn Bus>,
    inner: RwLock<LedgerInner>,
}

impl Ledger {
    pub(crate) fn new(config: JetStreamConfig, bus: Arc<dyn Bus>) -> Self {
        Self {
            config,
            bus,
            inner: RwLock::new(LedgerInner {
                accounts: HashMap::new(),
                mem_reserved: 0,
                store_reserved: 0,
            }),
        }
    }

    pub(crate) fn config(&self) -> &JetStreamConfig {
        &self.config
    }

    pub fn num_accounts(&self) -> usize {
        self.inner.read().accounts.len()
    }

    /// Currently reserved (memory, storage) bytes.
    pub fn reserved_resources(&self) -> (i64, i64) {
        let inner = self.inner.read();
        (inner.mem_reserved, inner.store_reserved)
    }

    pub fn lookup_account(&self, name: &str) -> Option<Arc<JetStreamAccount>> {
        self.inner.read().accounts.get(name).cloned()
    }

    pub fn accounts(&self) -> Vec<Arc<JetStreamAccount>> {
        self.inner.read().accounts.values().cloned().collect()
    }

    /// Default limits for accounts that do not specify their own: the whole
    /// server budget, unlimited counts.
    pub fn dynamic_account_limits(&self) -> AccountLimits {
        AccountLimits {
            max_memory: self.config.max_memory,
            max_store: self.config.max_store,
            max_streams: -1,
            max_consumers: -1,
        }
    }

    fn sufficient_resources(
        inner: &LedgerInner,
        config: &JetStreamConfig,
        limits: Option<&AccountLimits>,
    ) -> Result<()> {
        let Some(limits) = limits else {
            return Ok(());
        };
        if inner.mem_reserved + limits.max_memory > config.max_memory {
            return Err(JetStreamError::InsufficientMemory);
        }
        if inner.store_reserved + limits.max_store > config.max_store {
            return Err(JetStreamError::InsufficientStorage);
        }
        Ok(())
    }

    // Reservation arithmetic is unchecked; callers must have admitted first.
    fn reserve_resources(inner: &mut LedgerInner, limits: &AccountLimits) {
        if limits.max_memory > 0 {
            inner.mem_reserved += limits.max_memory;
        }
        if limits.max_store > 0 {
            inner.store_reserved += limits.max_store;
        }
    }

    fn release_resources(inner: &mut LedgerInner, limits: &AccountLimits) {
        if limits.max_memory > 0 {
            inner.mem_reserved -= limits.max_memory;
        }
        if limits.max_store > 0 {
            inner.store_reserved -= limits.max_store;
        }
    }

    /// Memory/storage delta between two limit records; counts are not part
    /// of reservation arithmetic.
    fn diff_limits(old: &AccountLimits, new: &AccountLimits) -> AccountLimits {
        AccountLimits {
            max_memory: new.max_memory - old.max_memory,
            max_store: new.max_store - old.max_store,
            max_streams: 0,
            max_consumers: 0,
        }
    }

    /// Enables JetStream for an account: admit, register, reserve, wire the
    /// API imports, then recover any on-disk state. A failure past
    /// registration backs the account out again, so a failed enable can be
    /// retried.
    pub(crate) fn enable_account(
        self: &Arc<Self>,
        name: &str,
        limits: Option<AccountLimits>,
    ) -> Result<Arc<JetStreamAccount>> {
        let limits = limits.unwrap_or_else(|| self.dynamic_account_limits());
        let account = {
            let mut inner = self.inner.write();
            Self::sufficient_resources(&inner, &self.config, Some(&limits))?;
            if inner.accounts.contains_key(name) {
                return Err(JetStreamError::AlreadyEnabledForAccount);
            }
            let account = Arc::new(JetStreamAccount::new(
                name,
                self.config.store_dir.join(name),
                Arc::clone(&self.bus),
                limits,
            ));
            inner.accounts.insert(name.to_string(), Arc::clone(&account));
            Self::reserve_resources(&mut inner, &limits);
            account
        };

        if let Err(err) = self.finish_account_enable(name, &account) {
            // Unwind the half-enabled account: imports, registration,
            // reservation, anything recovery already brought up.
            for subject in api::ALL_ENDPOINTS {
                self.bus.remove_service_import(name, subject);
            }
            {
                let mut inner = self.inner.write();
                inner.accounts.remove(name);
                Self::release_resources(&mut inner, &limits);
            }
            account.shutdown();
            return Err(err);
        }
        Ok(account)
    }

    /// Post-registration half of account enable: API imports, then on-disk
    /// recovery. The caller unwinds the registration when this fails.
    fn finish_account_enable(&self, name: &str, account: &Arc<JetStreamAccount>) -> Result<()> {
        let sys = self
            .bus
            .system_account()
            .unwrap_or_else(|| self.bus.set_default_system_account());
        for subject in api::ALL_ENDPOINTS {
            self.bus
                .add_service_import(name, &sys, subject)
                .map_err(JetStreamError::ServiceImport)?;
        }

        let limits = account.limits();
        debug!(
            "enabled jetstream for account {name:?} (max memory {}, max storage {})",
            limits.max_memory, limits.max_store
        );

        recovery::recover_account(account)
    }

    /// Disables JetStream for an account, releasing its reservation and
    /// stopping its streams. On-disk state is kept for a future re-enable.
    pub(crate) fn disable_account(&self, name: &str) -> Result<()> {
        for subject in api::ALL_ENDPOINTS {
            self.bus.remove_service_import(name, subject);
        }
        let account = {
            let mut inner = self.inner.write();
            let account = inner
                .accounts
                .remove(name)
                .ok_or(JetStreamError::NotEnabledForAccount)?;
            let limits = account.limits();
            Self::release_resources(&mut inner, &limits);
            account
        };
        account.shutdown();
        Ok(())
    }

    /// Atomically replaces an account's limits: delta-check, then
    /// release-then-reserve under the ledger lock, then store the new record.
    pub(crate) fn update_account_limits(
        &self,
        name: &str,
        limits: Option<AccountLimits>,
    ) -> Result<()> {
        let account = self
            .lookup_account(name)
            .ok_or(JetStreamError::NotEnabledForAccount)?;
        let new = limits.unwrap_or_else(|| self.dynamic_account_limits());
        let old = account.limits();
        let delta = Self::diff_limits(&old, &new);
        {
            let mut inner = self.inner.write();
            Self::sufficient_resources(&inner, &self.config, Some(&delta))?;
            Self::release_resources(&mut inner, &old);
            Self::reserve_resources(&mut inner, &new);
        }
        account.set_limits(new);
        Ok(())
    }

    /// Tears down every account. Used at server shutdown.
    pub(crate) fn shutdown(&self) {
        let names: Vec<String> = {
            let inner = self.inner.read();
            inner.accounts.keys().cloned().collect()
        };
        for name in names {
            let _ = self.disable_account(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use tempfile::tempdir;

    fn ledger_with_budget(max_memory: i64, max_store: i64) -> (Arc<Ledger>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let config = JetStreamConfig {
            max_memory,
            max_store,
            store_dir: dir.path().to_path_buf(),
        };
        (Arc::new(Ledger::new(config, bus)), dir)
    }

    fn limits(max_memory: i64, max_store: i64) -> AccountLimits {
        AccountLimits {
            max_memory,
            max_store,
            max_streams: -1,
            max_consumers: -1,
        }
    }

    #[test]
    fn admission_rejects_over_reservation() {
        let (ledger, _dir) = ledger_with_budget(100, 1000);
        ledger.enable_account("A", Some(limits(60, 10))).unwrap();
        let err = ledger
            .enable_account("B", Some(limits(50, 10)))
            .unwrap_err();
        assert!(matches!(err, JetStreamError::InsufficientMemory));
        assert_eq!(
            err.to_string(),
            "insufficient memory resources available"
        );
        assert_eq!(ledger.num_accounts(), 1);
        assert_eq!(ledger.reserved_resources(), (60, 10));
    }

    #[test]
    fn enable_twice_fails() {
        let (ledger, _dir) = ledger_with_budget(100, 100);
        ledger.enable_account("A", Some(limits(10, 10))).unwrap();
        let err = ledger
            .enable_account("A", Some(limits(10, 10)))
            .unwrap_err();
        assert!(matches!(err, JetStreamError::AlreadyEnabledForAccount));
    }

    #[test]
    fn update_limits_release_then_reserve() {
        let (ledger, _dir) = ledger_with_budget(100, 100);
        ledger.enable_account("A", Some(limits(40, 40))).unwrap();
        assert_eq!(ledger.reserved_resources(), (40, 40));

        ledger
            .update_account_limits("A", Some(limits(30, 40)))
            .unwrap();
        assert_eq!(ledger.reserved_resources(), (30, 40));
        assert_eq!(ledger.lookup_account("A").unwrap().limits().max_memory, 30);
    }

    #[test]
    fn update_limits_delta_checked() {
        let (ledger, _dir) = ledger_with_budget(100, 100);
        ledger.enable_account("A", Some(limits(40, 40))).unwrap();
        ledger.enable_account("B", Some(limits(50, 50))).unwrap();
        let err = ledger
            .update_account_limits("A", Some(limits(60, 40)))
            .unwrap_err();
        assert!(matches!(err, JetStreamError::InsufficientMemory));
        // Nothing moved.
        assert_eq!(ledger.reserved_resources(), (90, 90));
        assert_eq!(ledger.lookup_account("A").unwrap().limits().max_memory, 40);
    }

    #[test]
    fn disable_releases_reservation() {
        let (ledger, _dir) = ledger_with_budget(100, 100);
        ledger.enable_account("A", Some(limits(60, 60))).unwrap();
        ledger.disable_account("A").unwrap();
        assert_eq!(ledger.reserved_resources(), (0, 0));
        assert!(ledger.lookup_account("A").is_none());
        // Budget is free again.
        ledger.enable_account("B", Some(limits(90, 90))).unwrap();
    }

    #[test]
    fn dynamic_limits_cover_whole_server() {
        let (ledger, _dir) = ledger_with_budget(100, 200);
        let dynamic = ledger.dynamic_account_limits();
        assert_eq!(dynamic.max_memory, 100);
        assert_eq!(dynamic.max_store, 200);
        assert_eq!(dynamic.max_streams, -1);
        assert_eq!(dynamic.max_consumers, -1);
    }
}
