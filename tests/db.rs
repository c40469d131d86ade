//! Cross-handle and end-to-end coverage: transaction serialization across
//! `DataFile` instances on one path, and a full pull into an on-disk
//! database.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use grove::actor::DbHandle;
use grove::docs::DocumentStore;
use grove::replicator::message::{Outgoing, RemoteSequence, Response, RevMessage};
use grove::replicator::{ActivityLevel, Event, Options as PullOptions, PullerHandle};
use grove::store::{Capabilities, DataFile, Options};

#[test]
fn transactions_serialize_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.grove");

    let a = DataFile::open(&path, Options::default()).unwrap();
    let b = DataFile::open(&path, Options::default()).unwrap();
    let store_a = a.get_key_store("docs", Capabilities::DOCUMENTS).unwrap();
    let store_b = b.get_key_store("docs", Capabilities::DOCUMENTS).unwrap();

    let txn_a = a.transaction().unwrap();
    store_a.set(b"doc", b"1-a", b"from-a", 0, &txn_a).unwrap();

    // Readers on B during A's transaction see the pre-A state.
    let snapshot = b.read_snapshot().unwrap();
    assert!(store_b.get_in(b"doc", &snapshot).unwrap().is_none());
    assert!(store_b.get(b"doc").unwrap().is_none());

    // A concurrent transaction on B blocks until A commits.
    let (started_tx, started_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let b_clone = b.clone();
    let store_b_clone = store_b.clone();
    let writer = thread::spawn(move || {
        started_tx.send(()).unwrap();
        let txn_b = b_clone.transaction().unwrap();
        // Once unblocked, B observes A's committed write.
        let record = store_b_clone
            .get_for_update(b"doc", &txn_b)
            .unwrap()
            .unwrap();
        assert_eq!(record.body.as_ref(), b"from-a");
        store_b_clone
            .set(b"doc", b"2-b", b"from-b", 0, &txn_b)
            .unwrap();
        txn_b.commit().unwrap();
        done_tx.send(()).unwrap();
    });

    started_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(done_rx.try_recv().is_err(), "B committed while A was open");

    txn_a.commit().unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();

    // Sequences stay dense across handles.
    let record = store_a.get(b"doc").unwrap().unwrap();
    assert_eq!(record.body.as_ref(), b"from-b");
    assert_eq!(record.sequence, 2);

    // The pinned snapshot still shows the state it was taken at.
    assert!(store_b.get_in(b"doc", &snapshot).unwrap().is_none());
}

#[test]
fn file_lock_excludes_writers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.grove");
    let a = DataFile::open(&path, Options::default()).unwrap();
    let b = DataFile::open(&path, Options::default()).unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = thread::spawn(move || {
        a.with_file_lock(|| {
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
    });

    locked_rx.recv().unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let writer = thread::spawn(move || {
        let txn = b.transaction().unwrap();
        txn.commit().unwrap();
        done_tx.send(()).unwrap();
    });
    thread::sleep(Duration::from_millis(100));
    assert!(done_rx.try_recv().is_err(), "writer ran under the file lock");

    release_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    holder.join().unwrap();
    writer.join().unwrap();
}

#[tokio::test]
async fn pull_into_on_disk_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulled.grove");

    let file = DataFile::open(&path, Options::default()).unwrap();
    let db = DbHandle::spawn(file.clone()).unwrap();
    let (outbound_tx, outbound_rx) = flume::unbounded();
    let (events_tx, events_rx) = flume::unbounded();
    let puller = PullerHandle::spawn(
        PullOptions::one_shot(),
        db.clone(),
        outbound_tx,
        events_tx,
        RemoteSequence::none(),
    );

    assert!(matches!(
        outbound_rx.recv_async().await.unwrap(),
        Outgoing::SubChanges { since: None, .. }
    ));

    let changes = serde_json::to_vec(&json!([
        ["s1", "note", "1-a", false, 10],
        ["s2", "todo", "2-b", false, 10]
    ]))
    .unwrap();
    let response = puller
        .changes(Bytes::from(changes), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, Response::Body(json!([[], []])));

    let note = RevMessage {
        id: "note".into(),
        rev: "1-a".into(),
        sequence: RemoteSequence::from("s1"),
        body: Bytes::from_static(b"{\"text\":\"hello\"}"),
        ..Default::default()
    };
    assert_eq!(puller.rev(note).await.unwrap().unwrap(), Response::Ok);

    // A second-generation revision arrives with its ancestry.
    let todo = RevMessage {
        id: "todo".into(),
        rev: "2-b".into(),
        history: Some("1-x".into()),
        sequence: RemoteSequence::from("s2"),
        body: Bytes::from_static(b"{\"done\":true}"),
        ..Default::default()
    };
    assert_eq!(puller.rev(todo).await.unwrap().unwrap(), Response::Ok);

    let caught_up = puller
        .changes(Bytes::from_static(b"[]"), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(caught_up, Response::Ok);

    // Wind down: last checkpoint covers both sequences.
    let mut last_checkpoint = None;
    loop {
        match events_rx.recv_async().await.unwrap() {
            Event::Checkpoint { sequence } => last_checkpoint = Some(sequence),
            Event::Activity {
                level: ActivityLevel::Stopped,
                progress,
            } => {
                assert_eq!(progress.completed, 2);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(last_checkpoint, Some(RemoteSequence::from("s2")));
    db.set_checkpoint(
        Bytes::from_static(b"peer"),
        RemoteSequence::from("s2").to_checkpoint_bytes(),
    )
    .await
    .unwrap();
    db.shutdown().await;
    file.close().unwrap();

    // Everything survives a reopen.
    let file = DataFile::open(&path, Options::default()).unwrap();
    let docs = DocumentStore::new(&file).unwrap();

    let note = docs.get(b"note").unwrap().unwrap();
    assert_eq!(note.current_rev_id().unwrap().as_bytes(), b"1-a");

    let todo = docs.get(b"todo").unwrap().unwrap();
    assert_eq!(todo.current_rev_id().unwrap().as_bytes(), b"2-b");
    assert_eq!(todo.tree.len(), 2);
    assert!(!todo.is_conflicted());

    let db = DbHandle::spawn(file.clone()).unwrap();
    let checkpoint = db
        .get_checkpoint(Bytes::from_static(b"peer"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.as_ref(), b"\"s2\"");
    db.shutdown().await;
}
