//! Best-effort recovery of an account's on-disk streaming state, run during
//! account enable.
//!
//! Order matters: templates are rebuilt first so recovered streams can be
//! registered back against their owners, then streams (replaying their
//! message logs), then each stream's durable consumers. A corrupted entity
//! is logged and skipped; the scan always continues.

use crate::account::JetStreamAccount;
use crate::consumer::ConsumerConfig;
use crate::error::{JetStreamError, Result};
use crate::metastore::{self, CONSUMERS_DIR, MSGS_DIR, STREAMS_DIR, TEMPLATES_DIR};
use crate::stream::{Stream, StreamConfig};
use crate::template::StreamTemplateConfig;
use log::{info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub(crate) fn recover_account(account: &Arc<JetStreamAccount>) -> Result<()> {
    migrate_legacy_layout(account)?;
    recover_templates(account);
    recover_streams(account);
    Ok(())
}

/// One-time fixup for the pre-`streams/` directory layout: every direct
/// child of the account directory moves under `streams/`. A would-be name
/// collision aborts the migration.
fn migrate_legacy_layout(account: &JetStreamAccount) -> Result<()> {
    let dir = account.store_dir();
    let streams_dir = dir.join(STREAMS_DIR);
    if streams_dir.exists() {
        return Ok(());
    }
    let entries: Vec<_> = match fs::read_dir(dir) {
        Ok(entries) => entries.flatten().collect(),
        Err(_) => return Ok(()),
    };
    if entries.is_empty() {
        return Ok(());
    }
    info!(
        "upgrading storage directory structure for account {:?}",
        account.name()
    );
    fs::create_dir_all(&streams_dir).map_err(JetStreamError::StorageDirCreate)?;
    for entry in entries {
        let name = entry.file_name();
        let target = streams_dir.join(&name);
        if target.exists() {
            return Err(JetStreamError::StorageMigrationCollision(
                name.to_string_lossy().into_owned(),
            ));
        }
        fs::rename(entry.path(), &target)?;
    }
    Ok(())
}

fn recover_templates(account: &Arc<JetStreamAccount>) {
    let tdir = account.store_dir().join(TEMPLATES_DIR);
    let Ok(entries) = fs::read_dir(&tdir) else {
        return;
    };
    let key = metastore::checksum_key(&tdir);
    let mut recovered = 0usize;
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let payload = match metastore::read_verified_meta(&dir, &key) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("skipping stream template in {dir:?}: {err}");
                continue;
            }
        };
        let mut cfg: StreamTemplateConfig = match serde_json::from_slice(&payload) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("unreadable stream template metafile in {dir:?}: {err}");
                continue;
            }
        };
        cfg.config.name = String::new();
        match account.add_stream_template(cfg) {
            Ok(template) => {
                recovered += 1;
                info!("restored stream template {:?}", template.name());
            }
            Err(err) => warn!("could not recreate stream template from {dir:?}: {err}"),
        }
    }
    if recovered > 0 {
        info!(
            "recovered {recovered} stream templates for account {:?}",
            account.name()
        );
    }
}

fn recover_streams(account: &Arc<JetStreamAccount>) {
    let sdir = account.store_dir().join(STREAMS_DIR);
    let Ok(entries) = fs::read_dir(&sdir) else {
        return;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let key = metastore::checksum_key(&dir.join(MSGS_DIR));
        let payload = match metastore::read_verified_meta(&dir, &key) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("skipping stream in {dir:?}: {err}");
                continue;
            }
        };
        let cfg: StreamConfig = match serde_json::from_slice(&payload) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("unreadable stream metafile in {dir:?}: {err}");
                continue;
            }
        };
        if let Some(template) = cfg.template.clone() {
            if let Err(err) = account.add_stream_name_to_template(&template, &cfg.name) {
                warn!(
                    "error adding stream {:?} to template {template:?}: {err}",
                    cfg.name
                );
            }
        }
        let storage = cfg.storage;
        let stream = match account.add_stream(cfg) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("could not recreate stream from {dir:?}: {err}");
                continue;
            }
        };
        let state = stream.state();
        if state.bytes > 0 {
            // Replayed messages count against the account budget.
            account.update_usage(storage, state.bytes as i64);
        }
        info!(
            "restored {} messages for stream {:?}",
            state.messages,
            stream.name()
        );
        recover_consumers(&stream, &dir);
    }
}

fn recover_consumers(stream: &Arc<Stream>, stream_dir: &Path) {
    let odir = stream_dir.join(CONSUMERS_DIR);
    let Ok(entries) = fs::read_dir(&odir) else {
        return;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        // Consumer metadata is keyed by its own directory path, and the
        // checksum is verified just like templates and streams.
        let key = metastore::checksum_key(&dir);
        let payload = match metastore::read_verified_meta(&dir, &key) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("skipping consumer in {dir:?}: {err}");
                continue;
            }
        };
        let cfg: ConsumerConfig = match serde_json::from_slice(&payload) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("unreadable consumer metafile in {dir:?}: {err}");
                continue;
            }
        };
        let consumer = match stream.add_consumer(cfg) {
            Ok(consumer) => consumer,
            Err(err) => {
                warn!("error recreating consumer from {dir:?}: {err}");
                continue;
            }
        };
        if let Err(err) = consumer.read_stored_state() {
            warn!(
                "error restoring consumer state for {:?}: {err}",
                consumer.name()
            );
        }
    }
}
