//! The database actor: a dedicated thread owning a [`DataFile`] and its
//! [`DocumentStore`], executing storage work serially so replication I/O
//! never blocks on the database.

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{error, error_span, trace, warn};

use crate::docs::{DocumentStore, PutRequest};
use crate::error::{Error, Result};
use crate::replicator::message::ChangeEntry;
use crate::revid::RevId;
use crate::store::{Capabilities, DataFile, KeyStore};

/// Name of the key store holding replication checkpoints.
pub const CHECKPOINTS_KEY_STORE: &str = "checkpoints";

/// A revision received from a peer, ready for insertion.
#[derive(Debug, Clone)]
pub struct PulledRev {
    /// The document id.
    pub doc_id: Bytes,
    /// The new revision id.
    pub rev_id: RevId,
    /// Whether the revision is a deletion tombstone.
    pub deleted: bool,
    /// Ancestor revision ids, nearest first.
    pub history: Vec<RevId>,
    /// The revision body, already converted to the internal form.
    pub body: Bytes,
}

#[derive(derive_more::Debug, derive_more::Display)]
enum Action {
    #[display("FindOrRequestRevs")]
    FindOrRequestRevs {
        changes: Vec<ChangeEntry>,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Vec<Option<Vec<Bytes>>>>>,
    },
    #[display("InsertRevision")]
    InsertRevision {
        rev: PulledRev,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    #[display("GetCheckpoint")]
    GetCheckpoint {
        client: Bytes,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    #[display("SetCheckpoint")]
    SetCheckpoint {
        client: Bytes,
        sequence: Bytes,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    #[display("Shutdown")]
    Shutdown,
}

/// Handle to the database actor thread. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DbHandle {
    tx: flume::Sender<Action>,
}

impl DbHandle {
    /// Spawns the actor thread over `file`.
    pub fn spawn(file: DataFile) -> Result<DbHandle> {
        const ACTION_CAP: usize = 128;
        let docs = DocumentStore::new(&file)?;
        let checkpoints = file.get_key_store(CHECKPOINTS_KEY_STORE, Capabilities::NONE)?;
        let (action_tx, action_rx) = flume::bounded(ACTION_CAP);
        let name = file
            .path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "memory".to_string());
        let mut actor = Actor {
            file,
            docs,
            checkpoints,
            action_rx,
        };
        std::thread::spawn(move || {
            let span = error_span!("db", %name);
            let _enter = span.enter();
            if let Err(err) = actor.run() {
                error!("db actor closed with error: {err:?}");
            }
        });
        Ok(DbHandle { tx: action_tx })
    }

    /// For each peer change, answers `None` when the revision is already
    /// known and `Some(known ancestor revids)` when it should be pulled.
    pub async fn find_or_request_revs(
        &self,
        changes: Vec<ChangeEntry>,
    ) -> Result<Vec<Option<Vec<Bytes>>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::FindOrRequestRevs { changes, reply })
            .await?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Inserts a pulled revision, splicing in its history, inside its own
    /// transaction.
    pub async fn insert_revision(&self, rev: PulledRev) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::InsertRevision { rev, reply }).await?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Reads the stored checkpoint for a replication client.
    pub async fn get_checkpoint(&self, client: Bytes) -> Result<Option<Bytes>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetCheckpoint { client, reply }).await?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Durably records a replication client's checkpoint.
    pub async fn set_checkpoint(&self, client: Bytes, sequence: Bytes) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::SetCheckpoint {
            client,
            sequence,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Canceled)?
    }

    /// Asks the actor thread to exit. In-flight actions still run.
    pub async fn shutdown(&self) {
        self.send(Action::Shutdown).await.ok();
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .map_err(|_| Error::Canceled)
    }
}

struct Actor {
    file: DataFile,
    docs: DocumentStore,
    checkpoints: KeyStore,
    action_rx: flume::Receiver<Action>,
}

impl Actor {
    fn run(&mut self) -> Result<()> {
        loop {
            let Ok(action) = self.action_rx.recv() else {
                break;
            };
            trace!(%action, "tick");
            let is_shutdown = matches!(action, Action::Shutdown);
            if let Err(err) = self.on_action(action) {
                warn!("failed to send reply: {err}");
            }
            if is_shutdown {
                break;
            }
        }
        trace!("shutdown");
        Ok(())
    }

    fn on_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Shutdown => Ok(()),
            Action::FindOrRequestRevs { changes, reply } => {
                send_reply(reply, self.find_or_request_revs(&changes))
            }
            Action::InsertRevision { rev, reply } => send_reply(reply, self.insert_revision(rev)),
            Action::GetCheckpoint { client, reply } => {
                let result = self
                    .checkpoints
                    .get(&client)
                    .map(|record| record.map(|record| record.body));
                send_reply(reply, result)
            }
            Action::SetCheckpoint {
                client,
                sequence,
                reply,
            } => send_reply(reply, self.set_checkpoint(&client, &sequence)),
        }
    }

    fn find_or_request_revs(
        &self,
        changes: &[ChangeEntry],
    ) -> Result<Vec<Option<Vec<Bytes>>>> {
        changes
            .iter()
            .map(|change| {
                let doc = self.docs.get(change.doc_id.as_bytes())?;
                Ok(match doc {
                    Some(doc) if doc.tree.find(change.rev_id.as_bytes()).is_some() => None,
                    Some(doc) => {
                        // Known branch tips let the peer send a delta
                        // history instead of the whole chain.
                        Some(
                            doc.tree
                                .leaves()
                                .map(|rev| rev.rev_id().to_bytes())
                                .collect(),
                        )
                    }
                    None => Some(Vec::new()),
                })
            })
            .collect()
    }

    fn insert_revision(&self, rev: PulledRev) -> Result<()> {
        let txn = self.file.transaction()?;
        let outcome = self.docs.put(
            &PutRequest {
                doc_id: rev.doc_id.clone(),
                rev_id: Some(rev.rev_id),
                parent_rev_id: None,
                history: rev.history,
                body: rev.body,
                deleted: rev.deleted,
                allow_conflict: true,
            },
            &txn,
        )?;
        txn.commit()?;
        trace!(
            doc = %String::from_utf8_lossy(&rev.doc_id),
            rev = %outcome.rev_id,
            conflict = outcome.was_conflict,
            "inserted pulled revision"
        );
        Ok(())
    }

    fn set_checkpoint(&self, client: &[u8], sequence: &[u8]) -> Result<()> {
        let txn = self.file.transaction()?;
        self.checkpoints.set(client, b"", sequence, 0, &txn)?;
        txn.commit()
    }
}

fn send_reply<T>(sender: oneshot::Sender<T>, value: T) -> Result<()> {
    sender.send(value).map_err(|_| Error::Canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::message::RemoteSequence;
    use crate::store::Options;

    fn change(seq: &str, doc: &str, rev: &str) -> ChangeEntry {
        ChangeEntry {
            sequence: RemoteSequence::from(serde_json::Value::from(seq)),
            doc_id: doc.to_string(),
            rev_id: rev.to_string(),
            deleted: false,
            body_size: 0,
        }
    }

    fn pulled(doc: &str, rev: &str, history: &[&str], body: &str) -> PulledRev {
        PulledRev {
            doc_id: Bytes::copy_from_slice(doc.as_bytes()),
            rev_id: RevId::from(rev),
            deleted: false,
            history: history.iter().map(|id| RevId::from(*id)).collect(),
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn requests_unknown_revisions() {
        let file = DataFile::open_memory(Options::default()).unwrap();
        let db = DbHandle::spawn(file.clone()).unwrap();

        db.insert_revision(pulled("doc1", "1-a", &[], "{}"))
            .await
            .unwrap();

        let answers = db
            .find_or_request_revs(vec![
                change("s1", "doc1", "1-a"),
                change("s2", "doc1", "2-b"),
                change("s3", "doc2", "1-x"),
            ])
            .await
            .unwrap();

        // Already known: no request.
        assert_eq!(answers[0], None);
        // Known document, unknown revision: request with known ancestors.
        assert_eq!(answers[1], Some(vec![Bytes::from_static(b"1-a")]));
        // Unknown document: request with no ancestors.
        assert_eq!(answers[2], Some(Vec::new()));

        db.shutdown().await;
    }

    #[tokio::test]
    async fn inserts_with_history() {
        let file = DataFile::open_memory(Options::default()).unwrap();
        let db = DbHandle::spawn(file.clone()).unwrap();

        db.insert_revision(pulled("doc", "2-b", &["1-a"], "{\"v\":2}"))
            .await
            .unwrap();

        let docs = DocumentStore::new(&file).unwrap();
        let doc = docs.get(b"doc").unwrap().unwrap();
        assert_eq!(doc.tree.len(), 2);
        assert_eq!(doc.current_rev_id().unwrap().as_bytes(), b"2-b");

        db.shutdown().await;
    }

    #[tokio::test]
    async fn checkpoints_roundtrip() {
        let file = DataFile::open_memory(Options::default()).unwrap();
        let db = DbHandle::spawn(file.clone()).unwrap();

        assert_eq!(db.get_checkpoint(Bytes::from_static(b"peer1")).await.unwrap(), None);
        db.set_checkpoint(Bytes::from_static(b"peer1"), Bytes::from_static(b"s42"))
            .await
            .unwrap();
        assert_eq!(
            db.get_checkpoint(Bytes::from_static(b"peer1")).await.unwrap(),
            Some(Bytes::from_static(b"s42"))
        );

        db.shutdown().await;
    }

    #[tokio::test]
    async fn closed_file_surfaces_not_open() {
        let file = DataFile::open_memory(Options::default()).unwrap();
        let db = DbHandle::spawn(file.clone()).unwrap();
        file.close().unwrap();

        let err = db
            .insert_revision(pulled("doc", "1-a", &[], "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotOpen));

        db.shutdown().await;
    }
}
