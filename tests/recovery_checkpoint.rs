mod support;

use jetcore::{ConsumerConfig, JetStream, MemoryBus, StorageType, StreamConfig, StreamTemplateConfig};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use support::{default_limits, server_config};
use tempfile::TempDir;

fn start(dir: &Path) -> (MemoryBus, JetStream) {
    let bus = MemoryBus::new();
    let js = JetStream::new(Arc::new(bus.clone()));
    js.enable(Some(server_config(dir))).unwrap();
    (bus, js)
}

fn file_stream(name: &str, subjects: &[&str]) -> StreamConfig {
    StreamConfig {
        name: name.into(),
        subjects: subjects.iter().map(|s| s.to_string()).collect(),
        storage: StorageType::File,
        ..StreamConfig::default()
    }
}

fn file_template(name: &str, subjects: &[&str], max_streams: u32) -> StreamTemplateConfig {
    StreamTemplateConfig {
        name: name.into(),
        config: StreamConfig {
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            storage: StorageType::File,
            ..StreamConfig::default()
        },
        max_streams,
    }
}

#[test]
fn restart_restores_streams_and_durable_consumers() {
    let dir = TempDir::new().unwrap();
    {
        let (bus, js) = start(dir.path());
        js.enable_account("ONE", Some(default_limits())).unwrap();
        let account = js.lookup_account("ONE").unwrap();
        account
            .add_stream(file_stream("orders", &["orders.>"]))
            .unwrap();
        bus.publish(Some("ONE"), "orders.new", "", b"m1");
        bus.publish(Some("ONE"), "orders.paid", "", b"m2");

        let stream = account.lookup_stream("orders").unwrap();
        stream
            .add_consumer(ConsumerConfig {
                durable: Some("dur".into()),
                deliver_subject: Some("deliver.dur".into()),
                ..ConsumerConfig::default()
            })
            .unwrap();
        js.shutdown();
    }

    let (bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();

    let stream = account.lookup_stream("orders").unwrap();
    let state = stream.state();
    assert_eq!(state.messages, 2);
    assert_eq!(state.last_seq, 2);

    // Config round-trips through the metadata files.
    let cfg = stream.config();
    assert_eq!(cfg.subjects, ["orders.>"]);
    assert_eq!(cfg.storage, StorageType::File);

    // The durable came back; nothing else did.
    let consumer = stream.lookup_consumer("dur").expect("durable recovered");
    assert!(consumer.is_durable());
    assert_eq!(stream.consumers().len(), 1);

    // Replayed bytes are charged to the account.
    assert!(account.usage().storage > 0);

    // And the recovered stream is live again.
    bus.publish(Some("ONE"), "orders.shipped", "", b"m3");
    assert_eq!(stream.state().messages, 3);
}

#[test]
fn corrupted_template_is_skipped_on_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let (_bus, js) = start(dir.path());
        js.enable_account("ONE", Some(default_limits())).unwrap();
        let account = js.lookup_account("ONE").unwrap();
        account
            .add_stream_template(file_template("good", &["good.*"], 2))
            .unwrap();
        account
            .add_stream_template(file_template("evil", &["evil.*"], 2))
            .unwrap();
        js.shutdown();
    }

    // Truncate the second template's checksum to a wrong value.
    let sum = dir
        .path()
        .join("ONE")
        .join("templates")
        .join("evil")
        .join("meta.sum");
    fs::write(&sum, "0000000000000000").unwrap();

    let (_bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();
    assert!(account.lookup_template("good").is_ok());
    assert!(account.lookup_template("evil").is_err());
}

#[test]
fn corrupted_stream_metafile_is_skipped() {
    let dir = TempDir::new().unwrap();
    {
        let (_bus, js) = start(dir.path());
        js.enable_account("ONE", Some(default_limits())).unwrap();
        let account = js.lookup_account("ONE").unwrap();
        account.add_stream(file_stream("keep", &["keep.*"])).unwrap();
        account.add_stream(file_stream("drop", &["drop.*"])).unwrap();
        js.shutdown();
    }

    // Flip one byte of the second stream's metafile.
    let meta = dir
        .path()
        .join("ONE")
        .join("streams")
        .join("drop")
        .join("meta.inf");
    let mut bytes = fs::read(&meta).unwrap();
    bytes[3] ^= 0x01;
    fs::write(&meta, &bytes).unwrap();

    let (_bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();
    assert!(account.lookup_stream("keep").is_ok());
    assert!(account.lookup_stream("drop").is_err());
}

#[test]
fn corrupted_consumer_metafile_is_skipped() {
    let dir = TempDir::new().unwrap();
    {
        let (_bus, js) = start(dir.path());
        js.enable_account("ONE", Some(default_limits())).unwrap();
        let account = js.lookup_account("ONE").unwrap();
        let stream = account.add_stream(file_stream("s", &["s.*"])).unwrap();
        for name in ["keep", "drop"] {
            stream
                .add_consumer(ConsumerConfig {
                    durable: Some(name.into()),
                    ..ConsumerConfig::default()
                })
                .unwrap();
        }
        js.shutdown();
    }

    let meta = dir
        .path()
        .join("ONE")
        .join("streams")
        .join("s")
        .join("consumers")
        .join("drop")
        .join("meta.inf");
    let mut bytes = fs::read(&meta).unwrap();
    bytes[1] ^= 0x01;
    fs::write(&meta, &bytes).unwrap();

    let (_bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let stream = js
        .lookup_account("ONE")
        .unwrap()
        .lookup_stream("s")
        .unwrap();
    assert!(stream.lookup_consumer("keep").is_some());
    assert!(stream.lookup_consumer("drop").is_none());
}

#[test]
fn disable_keeps_disk_state_for_reenable() {
    let dir = TempDir::new().unwrap();
    let (bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();
    account
        .add_stream(file_stream("audit", &["audit.>"]))
        .unwrap();
    bus.publish(Some("ONE"), "audit.login", "", b"who");

    js.disable_account("ONE").unwrap();
    assert!(js.lookup_account("ONE").is_none());
    assert!(dir.path().join("ONE").join("streams").join("audit").exists());

    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();
    let stream = account.lookup_stream("audit").unwrap();
    assert_eq!(stream.state().messages, 1);
}

#[test]
fn legacy_layout_is_migrated_in_place() {
    let dir = TempDir::new().unwrap();
    {
        let (bus, js) = start(dir.path());
        js.enable_account("ONE", Some(default_limits())).unwrap();
        let account = js.lookup_account("ONE").unwrap();
        account.add_stream(file_stream("old", &["old.*"])).unwrap();
        bus.publish(Some("ONE"), "old.one", "", b"x");
        js.shutdown();
    }

    // Rewind to the pre-`streams/` layout: stream dirs directly below the
    // account directory.
    let account_dir = dir.path().join("ONE");
    fs::rename(
        account_dir.join("streams").join("old"),
        account_dir.join("old"),
    )
    .unwrap();
    fs::remove_dir(account_dir.join("streams")).unwrap();

    let (_bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();
    let stream = account.lookup_stream("old").unwrap();
    assert_eq!(stream.state().messages, 1);
    assert!(account_dir.join("streams").join("old").exists());
}

#[test]
fn recovered_templates_keep_their_streams_and_cap() {
    let dir = TempDir::new().unwrap();
    {
        let (bus, js) = start(dir.path());
        js.enable_account("ONE", Some(default_limits())).unwrap();
        let account = js.lookup_account("ONE").unwrap();
        account
            .add_stream_template(file_template("ticker", &["stock.*"], 2))
            .unwrap();
        bus.publish(Some("ONE"), "stock.AAPL", "", b"1");
        bus.publish(Some("ONE"), "stock.MSFT", "", b"2");
        assert_eq!(account.num_streams(), 2);
        js.shutdown();
    }

    let (bus, js) = start(dir.path());
    js.enable_account("ONE", Some(default_limits())).unwrap();
    let account = js.lookup_account("ONE").unwrap();

    let template = account.lookup_template("ticker").unwrap();
    let mut names = template.stream_names();
    names.sort();
    assert_eq!(names, ["stock_AAPL", "stock_MSFT"]);
    assert!(account.check_template_ownership("ticker", "stock_AAPL"));

    // The recovered cap still holds.
    bus.publish(Some("ONE"), "stock.GOOG", "", b"3");
    assert!(account.lookup_stream("stock_GOOG").is_err());
    assert_eq!(account.num_streams(), 2);
}
