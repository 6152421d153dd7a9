//! Per-server, per-account persistent streaming layered on a subject-based
//! pub/sub core.
//!
//! Clients create named streams that durably capture messages published to a
//! subject set, then attach consumers that cursor over them. The subsystem
//! owns admission control against per-account quotas, checksummed on-disk
//! metadata with best-effort recovery, auto-materialization of streams from
//! templates, and the `$JS.>` request/reply API. The enclosing broker is
//! abstracted behind the [`bus`] interfaces; [`bus::MemoryBus`] serves tests
//! and embedders without a real broker.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod account;
pub mod api;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod metastore;
pub mod msgstore;
mod recovery;
pub mod stream;
pub mod subject;
pub mod template;

pub use account::{AccountLimits, AccountStats, JetStreamAccount};
pub use bus::{Bus, BusClient, Delivery, MemoryBus, MsgHandler, SubId};
pub use config::JetStreamConfig;
pub use consumer::{
    AckPolicy, Consumer, ConsumerConfig, ConsumerInfo, ConsumerState, CreateConsumerRequest,
    SequencePair,
};
pub use error::{BusError, JetStreamError, Result};
pub use ledger::Ledger;
pub use lifecycle::JetStream;
pub use msgstore::{MsgStore, StreamState};
pub use stream::{StorageType, Stream, StreamConfig, StreamInfo};
pub use template::{StreamTemplate, StreamTemplateConfig, StreamTemplateInfo};
