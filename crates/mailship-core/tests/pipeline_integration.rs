//! End-to-end pipeline tests: log file → reader → shipper → memory store.

use std::fs;
use std::path::Path;

use mailship_core::config::ReaderConfig;
use mailship_core::controller::{Shipper, ShipperOptions};
use mailship_core::parser::PostfixLogParser;
use mailship_core::reader::{FileLineSource, LineSource};
use mailship_core::store::{BulkOp, MemoryStore};
use tempfile::tempdir;

const MAILLOG: &str = "\
Mar  5 10:00:00 mx1 postfix/pickup[10]: 3F2A1B: uid=1000 from=<alice>
Mar  5 10:00:00 mx1 postfix/cleanup[11]: 3F2A1B: message-id=<20240305100000.1@mx1>
Mar  5 10:00:00 mx1 postfix/qmgr[12]: 3F2A1B: from=<alice@mx1>, size=1234, nrcpt=1 (queue active)
Mar  5 10:00:01 mx1 sshd[99]: Accepted publickey for root
Mar  5 10:00:01 mx1 postfix/qmgr[12]: 4C0D2E: from=<bob@mx1>, size=99, nrcpt=2 (queue active)
Mar  5 10:00:02 mx1 postfix/smtp[13]: 3F2A1B: to=<carol@example.org>, relay=mx.example.org[192.0.2.1]:25, delay=2.5, delays=0.1/0.1/1/1.3, dsn=2.0.0, status=sent (250 2.0.0 Ok)
Mar  5 10:00:02 mx1 postfix/scache[14]: statistics: start interval Mar  5 09:58:00
Mar  5 10:00:03 mx1 postfix/qmgr[12]: 3F2A1B: removed
";

fn reader_config(file: &Path, batch_limit: usize) -> ReaderConfig {
    ReaderConfig {
        file: file.to_path_buf(),
        batch_limit,
        follow: false,
        poll_interval_ms: 10,
    }
}

fn immediate() -> ShipperOptions {
    ShipperOptions::default().immediate()
}

#[tokio::test]
async fn ships_maillog_across_batches() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("maillog");
    fs::write(&log, MAILLOG).unwrap();
    let bookmarks = dir.path().join(".bookmark");

    let mut reader = FileLineSource::open(&reader_config(&log, 3), &bookmarks).unwrap();
    let mut shipper = Shipper::new(MemoryStore::new(), PostfixLogParser, immediate());
    let stats = shipper.run(&mut reader).await.unwrap();

    assert_eq!(stats.lines_read, 8);
    assert_eq!(stats.lines_foreign, 1);
    assert_eq!(stats.cycles_completed, 3);

    let store = shipper.store();
    assert_eq!(store.len(), 2);

    let first = store.documents_for("3F2A1B");
    assert_eq!(first.len(), 1);
    let doc = &first[0];
    assert!(doc.is_final);
    assert_eq!(doc.uid, Some(1000));
    assert_eq!(doc.message_id.as_deref(), Some("<20240305100000.1@mx1>"));
    assert_eq!(doc.from.as_deref(), Some("alice@mx1"));
    assert_eq!(doc.size, Some(1234));
    assert_eq!(doc.delay, Some(2.5));
    let actions: Vec<_> = doc.events.iter().map(|e| e.action()).collect();
    assert_eq!(actions, [Some("queued"), None, Some("removed")]);

    let second = store.documents_for("4C0D2E");
    assert_eq!(second.len(), 1);
    assert!(!second[0].is_final);
    assert_eq!(second[0].nrcpt, Some(2));

    // later batches updated the document created by the first one
    let calls = store.bulk_calls();
    assert!(
        calls[1..]
            .iter()
            .flatten()
            .filter(|op| op.qid() == "3F2A1B")
            .all(|op| matches!(op, BulkOp::Index { .. }))
    );
}

#[tokio::test]
async fn restart_replays_nothing_already_acknowledged() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("maillog");
    fs::write(&log, MAILLOG).unwrap();
    let bookmarks = dir.path().join(".bookmark");
    let config = reader_config(&log, 100);

    let mut reader = FileLineSource::open(&config, &bookmarks).unwrap();
    let mut shipper = Shipper::new(MemoryStore::new(), PostfixLogParser, immediate());
    shipper.run(&mut reader).await.unwrap();
    let store = shipper.into_store();
    let writes = store.bulk_calls().len();

    let mut reopened = FileLineSource::open(&config, &bookmarks).unwrap();
    assert!(reopened.next_batch().await.unwrap().is_none());

    // appended lines continue the stored transaction
    let mut text = fs::read_to_string(&log).unwrap();
    text.push_str("Mar  5 10:05:00 mx1 postfix/qmgr[12]: 4C0D2E: removed\n");
    fs::write(&log, text).unwrap();

    let mut reopened = FileLineSource::open(&config, &bookmarks).unwrap();
    let mut shipper = Shipper::new(store, PostfixLogParser, immediate());
    shipper.run(&mut reopened).await.unwrap();

    let store = shipper.store();
    assert_eq!(store.bulk_calls().len(), writes + 1);
    let docs = store.documents_for("4C0D2E");
    assert_eq!(docs.len(), 1);
    assert!(docs[0].is_final);
    assert_eq!(docs[0].events.len(), 2);
}

#[tokio::test]
async fn replaying_the_same_log_adds_no_entries() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("maillog");
    fs::write(&log, MAILLOG).unwrap();
    let config = reader_config(&log, 100);

    let mut reader = FileLineSource::open(&config, &dir.path().join("a")).unwrap();
    let mut shipper = Shipper::new(MemoryStore::new(), PostfixLogParser, immediate());
    shipper.run(&mut reader).await.unwrap();
    let before = shipper.store().documents();

    // fresh bookmark directory: every line is read again
    let mut replay = FileLineSource::open(&config, &dir.path().join("b")).unwrap();
    shipper.run(&mut replay).await.unwrap();
    let after = shipper.store().documents();

    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.events, b.events);
    }
}
