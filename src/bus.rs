//! Collaborator interfaces to the enclosing pub/sub broker, plus an
//! in-process implementation used by tests and embedders without a real
//! broker.
//!
//! The streaming subsystem never talks to connections directly: it receives
//! deliveries through [`MsgHandler`] callbacks and replies through
//! [`Bus::send_account_msg`]. Subject semantics follow the broker's rules:
//! `*` matches one token, `>` matches the tail.

use crate::error::BusError;
use crate::subject;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name of the global account used when the broker runs without configured
/// accounts.
pub const GLOBAL_ACCOUNT: &str = "$G";

/// Default name for the privileged system account hosting the API.
pub const SYSTEM_ACCOUNT: &str = "$SYS";

/// A single inbound message as seen by a subscription callback.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    /// Account of the publishing client; `None` for unauthenticated sources.
    pub account: Option<&'a str>,
    pub subject: &'a str,
    pub reply: &'a str,
    pub payload: &'a [u8],
}

pub type MsgHandler = Arc<dyn Fn(Delivery<'_>) + Send + Sync>;

pub type SubId = u64;

/// Broker services consumed by the streaming subsystem.
pub trait Bus: Send + Sync {
    /// Whether the broker runs as a single stand-alone server.
    fn standalone(&self) -> bool;
    fn system_account(&self) -> Option<String>;
    /// Creates the default system account if none is configured; returns its
    /// name either way.
    fn set_default_system_account(&self) -> String;
    /// True when only the global account exists.
    fn global_account_only(&self) -> bool;
    fn global_account(&self) -> String;
    fn add_service_export(&self, account: &str, subject: &str) -> Result<(), BusError>;
    fn add_service_import(&self, account: &str, from: &str, subject: &str)
        -> Result<(), BusError>;
    fn remove_service_import(&self, account: &str, subject: &str);
    /// Durable internal subscription on the system account.
    fn sys_subscribe(&self, subject: &str, handler: MsgHandler) -> Result<SubId, BusError>;
    /// Sends `payload` to `subject` as seen by clients of `account`.
    fn send_account_msg(&self, account: &str, subject: &str, payload: &[u8]);
    /// Creates an internal client scoped to `account`, used to own
    /// subscriptions whose lifetime is tied to an entity.
    fn create_client(&self, account: &str) -> Box<dyn BusClient>;
}

/// An internal broker client owning a set of subscriptions.
pub trait BusClient: Send + Sync {
    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<SubId, BusError>;
    /// Drops every subscription owned by this client. Idempotent.
    fn close(&self);
}

enum SubScope {
    System,
    Account(String),
}

struct SubEntry {
    id: SubId,
    subject: String,
    scope: SubScope,
    handler: MsgHandler,
}

struct BusState {
    system_account: Option<String>,
    exports: HashSet<(String, String)>,
    imports: HashSet<(String, String)>,
    subs: Vec<SubEntry>,
    next_sub: SubId,
    next_inbox: u64,
}

struct BusShared {
    standalone: bool,
    global_only: bool,
    state: Mutex<BusState>,
}

/// In-process [`Bus`] with synchronous dispatch. Matching subscriptions are
/// collected under the bus lock and invoked after it is released, so
/// handlers may freely publish or subscribe.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<BusShared>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::build(true, false)
    }

    /// A bus reporting itself as part of a cluster; server enable must
    /// refuse it.
    pub fn new_clustered() -> Self {
        Self::build(false, false)
    }

    /// A bus with only the global account configured.
    pub fn new_global_only() -> Self {
        Self::build(true, true)
    }

    fn build(standalone: bool, global_only: bool) -> Self {
        Self {
            shared: Arc::new(BusShared {
                standalone,
                global_only,
                state: Mutex::new(BusState {
                    system_account: None,
                    exports: HashSet::new(),
                    imports: HashSet::new(),
                    subs: Vec::new(),
                    next_sub: 1,
                    next_inbox: 1,
                }),
            }),
        }
    }

    /// Publishes a message as a client of `account` would.
    pub fn publish(&self, account: Option<&str>, subject: &str, reply: &str, payload: &[u8]) {
        let handlers: Vec<MsgHandler> = {
            let state = self.shared.state.lock();
            state
                .subs
                .iter()
                .filter(|sub| match (&sub.scope, account) {
                    (SubScope::System, _) => true,
                    (SubScope::Account(owner), Some(acc)) => owner == acc,
                    (SubScope::Account(_), None) => false,
                })
                .filter(|sub| subject::subject_matches(&sub.subject, subject))
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in handlers {
            handler(Delivery {
                account,
                subject,
                reply,
                payload,
            });
        }
    }

    /// Synchronous request/reply helper for callers within `account`.
    /// Returns `None` when no handler replied.
    pub fn request(&self, account: &str, subject: &str, payload: &[u8]) -> Option<Vec<u8>> {
        let inbox = {
            let mut state = self.shared.state.lock();
            let n = state.next_inbox;
            state.next_inbox += 1;
            format!("_INBOX.{n}")
        };
        let slot: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&slot);
        let id = self.add_sub(
            SubScope::Account(account.to_string()),
            &inbox,
            Arc::new(move |delivery: Delivery<'_>| {
                *captured.lock() = Some(delivery.payload.to_vec());
            }),
        );
        self.publish(Some(account), subject, &inbox, payload);
        self.remove_subs(&[id]);
        let result = slot.lock().take();
        result
    }

    /// Whether `account` currently imports `subject` from the system
    /// account.
    pub fn has_service_import(&self, account: &str, subject: &str) -> bool {
        self.shared
            .state
            .lock()
            .imports
            .contains(&(account.to_string(), subject.to_string()))
    }

    fn add_sub(&self, scope: SubScope, subject: &str, handler: MsgHandler) -> SubId {
        let mut state = self.shared.state.lock();
        let id = state.next_sub;
        state.next_sub += 1;
        state.subs.push(SubEntry {
            id,
            subject: subject.to_string(),
            scope,
            handler,
        });
        id
    }

    fn remove_subs(&self, ids: &[SubId]) {
        let mut state = self.shared.state.lock();
        state.subs.retain(|sub| !ids.contains(&sub.id));
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for MemoryBus {
    fn standalone(&self) -> bool {
        self.shared.standalone
    }

    fn system_account(&self) -> Option<String> {
        self.shared.state.lock().system_account.clone()
    }

    fn set_default_system_account(&self) -> String {
        let mut state = self.shared.state.lock();
        state
            .system_account
            .get_or_insert_with(|| SYSTEM_ACCOUNT.to_string())
            .clone()
    }

    fn global_account_only(&self) -> bool {
        self.shared.global_only
    }

    fn global_account(&self) -> String {
        GLOBAL_ACCOUNT.to_string()
    }

    fn add_service_export(&self, account: &str, subject: &str) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        state
            .exports
            .insert((account.to_string(), subject.to_string()));
        Ok(())
    }

    fn add_service_import(
        &self,
        account: &str,
        _from: &str,
        subject: &str,
    ) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        state
            .imports
            .insert((account.to_string(), subject.to_string()));
        Ok(())
    }

    fn remove_service_import(&self, account: &str, subject: &str) {
        let mut state = self.shared.state.lock();
        state
            .imports
            .remove(&(account.to_string(), subject.to_string()));
    }

    fn sys_subscribe(&self, subject: &str, handler: MsgHandler) -> Result<SubId, BusError> {
        if !subject::is_valid_subject(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }
        Ok(self.add_sub(SubScope::System, subject, handler))
    }

    fn send_account_msg(&self, account: &str, subject: &str, payload: &[u8]) {
        if subject.is_empty() {
            return;
        }
        self.publish(Some(account), subject, "", payload);
    }

    fn create_client(&self, account: &str) -> Box<dyn BusClient> {
        Box::new(MemoryBusClient {
            bus: self.clone(),
            account: account.to_string(),
            subs: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

struct MemoryBusClient {
    bus: MemoryBus,
    account: String,
    subs: Mutex<Vec<SubId>>,
    closed: AtomicBool,
}

impl BusClient for MemoryBusClient {
    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<SubId, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ClientClosed);
        }
        if !subject::is_valid_subject(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }
        let id = self
            .bus
            .add_sub(SubScope::Account(self.account.clone()), subject, handler);
        self.subs.lock().push(id);
        Ok(id)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ids: Vec<SubId> = self.subs.lock().drain(..).collect();
        if !ids.is_empty() {
            debug!("internal client for {} dropping {} subscriptions", self.account, ids.len());
            self.bus.remove_subs(&ids);
        }
    }
}

impl Drop for MemoryBusClient {
    fn drop(&mut self) {
        self.close();
    }
}
