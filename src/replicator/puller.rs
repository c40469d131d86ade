//! The pull state machine.
//!
//! The Puller is an actor with a serial inbox, bound to one peer
//! connection. It owns no database state beyond checkpoints: all storage
//! effects go through the [`DbHandle`] actor, and every callback hops back
//! into the Puller's inbox so state mutations stay single-threaded.

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::actor::{DbHandle, PulledRev};
use crate::error::{Error, Result};
use crate::revid::RevId;

use super::message::{self, Outgoing, RemoteSequence, Response, RevMessage};
use super::sequence_set::SequenceSet;
use super::{ActivityLevel, Event, Options, Progress};

type ReplySender = oneshot::Sender<Response>;

enum Inbox {
    Changes {
        body: Bytes,
        reply: Option<ReplySender>,
    },
    Rev {
        rev: RevMessage,
        reply: Option<ReplySender>,
    },
    /// Internal hop: the db actor answered a `changes` lookup.
    ChangesHandled {
        response: Response,
        requested: Vec<RemoteSequence>,
        reply: Option<ReplySender>,
    },
    /// Internal hop: a revision insertion finished.
    Inserted {
        sequence: RemoteSequence,
        doc_id: Bytes,
        result: Result<()>,
        reply: Option<ReplySender>,
    },
    Stop,
}

/// Handle to a running Puller. The connection glue delivers incoming peer
/// messages through it; replies resolve asynchronously.
#[derive(Clone)]
pub struct PullerHandle {
    tx: flume::Sender<Inbox>,
}

impl std::fmt::Debug for PullerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PullerHandle")
    }
}

impl PullerHandle {
    /// Spawns a Puller over a peer connection.
    ///
    /// `outbound` carries requests to the peer, `events` reports activity,
    /// progress and checkpoints, and `since` is the checkpoint to resume
    /// from (may be [`RemoteSequence::none`]). In active mode a
    /// `subChanges` request is sent immediately.
    pub fn spawn(
        options: Options,
        db: DbHandle,
        outbound: flume::Sender<Outgoing>,
        events: flume::Sender<Event>,
        since: RemoteSequence,
    ) -> PullerHandle {
        const INBOX_CAP: usize = 128;
        let (tx, rx) = flume::bounded(INBOX_CAP);
        let mut requested = SequenceSet::default();
        requested.clear(since.clone());
        let puller = Puller {
            options,
            db,
            outbound,
            events,
            inbox_tx: tx.clone(),
            inbox_rx: rx,
            caught_up: false,
            requested,
            pending_callbacks: 0,
            last_sequence: since,
            level: ActivityLevel::Stopped,
            stopping: false,
            progress: Progress::default(),
        };
        tokio::spawn(puller.run().instrument(error_span!("pull")));
        PullerHandle { tx }
    }

    /// Delivers an incoming `changes` message. Returns `None` when the
    /// peer asked for no reply, the reply otherwise.
    pub async fn changes(&self, body: Bytes, no_reply: bool) -> Result<Option<Response>> {
        if no_reply {
            self.send(Inbox::Changes { body, reply: None }).await?;
            return Ok(None);
        }
        let (reply, rx) = oneshot::channel();
        self.send(Inbox::Changes {
            body,
            reply: Some(reply),
        })
        .await?;
        Ok(Some(rx.await.map_err(|_| Error::Canceled)?))
    }

    /// Delivers an incoming `rev` message.
    pub async fn rev(&self, rev: RevMessage) -> Result<Option<Response>> {
        if rev.no_reply {
            self.send(Inbox::Rev { rev, reply: None }).await?;
            return Ok(None);
        }
        let (reply, rx) = oneshot::channel();
        self.send(Inbox::Rev {
            rev,
            reply: Some(reply),
        })
        .await?;
        Ok(Some(rx.await.map_err(|_| Error::Canceled)?))
    }

    /// Stops the Puller. Outstanding replies are canceled; committed
    /// insertions stay committed. The actor drains its in-flight database
    /// callbacks before reporting [`ActivityLevel::Stopped`].
    pub async fn stop(&self) {
        self.send(Inbox::Stop).await.ok();
    }

    async fn send(&self, message: Inbox) -> Result<()> {
        self.tx
            .send_async(message)
            .await
            .map_err(|_| Error::Canceled)
    }
}

struct Puller {
    options: Options,
    db: DbHandle,
    outbound: flume::Sender<Outgoing>,
    events: flume::Sender<Event>,
    inbox_tx: flume::Sender<Inbox>,
    inbox_rx: flume::Receiver<Inbox>,
    caught_up: bool,
    requested: SequenceSet,
    pending_callbacks: usize,
    last_sequence: RemoteSequence,
    level: ActivityLevel,
    stopping: bool,
    progress: Progress,
}

impl Puller {
    async fn run(mut self) {
        if !self.options.passive {
            let since = (!self.last_sequence.is_none()).then(|| self.last_sequence.clone());
            debug!(?since, continuous = self.options.continuous, "starting pull");
            let subscribe = Outgoing::SubChanges {
                since,
                continuous: self.options.continuous,
            };
            if self.outbound.send(subscribe).is_err() {
                warn!("connection closed before subscribing to changes");
                self.stopping = true;
            }
        }
        self.update_activity();
        while self.level != ActivityLevel::Stopped {
            let Ok(message) = self.inbox_rx.recv_async().await else {
                break;
            };
            self.on_message(message);
            self.update_activity();
        }
        trace!("pull actor exited");
    }

    fn on_message(&mut self, message: Inbox) {
        match message {
            Inbox::Changes { body, reply } => self.handle_changes(body, reply),
            Inbox::Rev { rev, reply } => self.handle_rev(rev, reply),
            Inbox::ChangesHandled {
                response,
                requested,
                reply,
            } => {
                self.pending_callbacks -= 1;
                respond(reply, response);
                if !requested.is_empty() {
                    for sequence in requested {
                        self.requested.add(sequence);
                    }
                    debug!(waiting = self.requested.len(), "requested revisions");
                }
            }
            Inbox::Inserted {
                sequence,
                doc_id,
                result,
                reply,
            } => {
                self.pending_callbacks -= 1;
                match result {
                    Ok(()) => {
                        self.progress.completed += 1;
                        self.mark_complete(&sequence);
                        respond(reply, Response::Ok);
                    }
                    Err(err) => {
                        warn!(doc = %String::from_utf8_lossy(&doc_id), "insert failed: {err}");
                        self.progress.failed += 1;
                        let (domain, code) = err.domain_code();
                        let _ = self.events.send(Event::DocumentError {
                            doc_id,
                            domain: domain.wire_name(),
                            code,
                            message: err.to_string(),
                        });
                        respond(reply, Response::error(&err));
                    }
                }
            }
            Inbox::Stop => {
                debug!("stop requested");
                self.stopping = true;
            }
        }
    }

    /// Handles an incoming `changes` message.
    fn handle_changes(&mut self, body: Bytes, reply: Option<ReplySender>) {
        if self.stopping {
            return;
        }
        let entries = match message::parse_changes(&body) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("invalid changes body");
                respond(reply, Response::error(&err));
                return;
            }
        };
        if entries.is_empty() {
            // An empty list is the peer's caught-up signal.
            debug!("caught up with remote changes");
            self.caught_up = true;
            respond(reply, Response::Ok);
        } else if reply.is_none() {
            warn!("ignoring noreply changes message");
        } else {
            // The db actor decides which revisions we are missing; the
            // reply and the ledger update both happen on our inbox to keep
            // ordering with later rev messages.
            self.pending_callbacks += 1;
            let db = self.db.clone();
            let inbox = self.inbox_tx.clone();
            let passive = self.options.passive;
            tokio::spawn(async move {
                let (response, requested) = match db.find_or_request_revs(entries.clone()).await {
                    Ok(answers) => {
                        let requested = if passive {
                            Vec::new()
                        } else {
                            entries
                                .iter()
                                .zip(&answers)
                                .filter(|(_, answer)| answer.is_some())
                                .map(|(entry, _)| entry.sequence.clone())
                                .collect()
                        };
                        (Response::Body(message::changes_response(&answers)), requested)
                    }
                    Err(err) => (Response::error(&err), Vec::new()),
                };
                let _ = inbox
                    .send_async(Inbox::ChangesHandled {
                        response,
                        requested,
                        reply,
                    })
                    .await;
            });
        }
    }

    /// Handles an incoming `rev` message.
    fn handle_rev(&mut self, rev: RevMessage, reply: Option<ReplySender>) {
        if self.stopping {
            return;
        }
        // Convert the JSON body to the internal form before insertion.
        let parsed: serde_json::Value = match serde_json::from_slice(&rev.body) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("rev message body is not valid JSON");
                respond(reply, Response::bad_request());
                return;
            }
        };
        if rev.id.is_empty() || rev.rev.is_empty() {
            warn!("rev message without id or rev");
            respond(reply, Response::bad_request());
            return;
        }
        if !self.options.passive && rev.sequence.is_none() {
            warn!("rev message without sequence on an active puller");
            respond(reply, Response::bad_request());
            return;
        }
        trace!(doc = %rev.id, rev = %rev.rev, sequence = %rev.sequence, "received revision");

        let rejected = self
            .options
            .validator
            .as_ref()
            .is_some_and(|validator| !validator(rev.id.as_bytes(), &parsed));
        if rejected {
            warn!(doc = %rev.id, "revision rejected by validator");
            self.progress.failed += 1;
            let doc_id = Bytes::copy_from_slice(rev.id.as_bytes());
            let _ = self.events.send(Event::DocumentError {
                doc_id,
                domain: "BLIP",
                code: 403,
                message: "rejected by validator".into(),
            });
            // Check the sequence off anyway so the checkpoint can pass it.
            self.mark_complete(&rev.sequence);
            respond(reply, Response::Error {
                domain: "BLIP",
                code: 403,
            });
            return;
        }

        let body: Bytes = match serde_json::to_vec(&parsed) {
            Ok(body) => body.into(),
            Err(_) => {
                respond(reply, Response::bad_request());
                return;
            }
        };
        let doc_id = Bytes::copy_from_slice(rev.id.as_bytes());
        let pulled = PulledRev {
            doc_id: doc_id.clone(),
            rev_id: RevId::from(rev.rev.as_str()),
            deleted: rev.deleted,
            history: rev.parse_history(),
            body,
        };
        self.pending_callbacks += 1;
        let db = self.db.clone();
        let inbox = self.inbox_tx.clone();
        let sequence = rev.sequence.clone();
        tokio::spawn(async move {
            let result = db.insert_revision(pulled).await;
            let _ = inbox
                .send_async(Inbox::Inserted {
                    sequence,
                    doc_id,
                    result,
                    reply,
                })
                .await;
        });
    }

    /// Checks a completed sequence off the ledger and pushes a new
    /// checkpoint when the contiguous prefix grows.
    fn mark_complete(&mut self, sequence: &RemoteSequence) {
        if self.options.passive || sequence.is_none() {
            return;
        }
        if self.requested.remove(sequence) {
            self.last_sequence = self.requested.since().clone();
            debug!(checkpoint = %self.last_sequence, "pull checkpoint advanced");
            let _ = self.events.send(Event::Checkpoint {
                sequence: self.last_sequence.clone(),
            });
        }
    }

    fn compute_level(&self) -> ActivityLevel {
        if self.stopping {
            // Drain in-flight database work before stopping for good.
            if self.pending_callbacks > 0 {
                ActivityLevel::Busy
            } else {
                ActivityLevel::Stopped
            }
        } else if (!self.caught_up && !self.options.passive)
            || !self.requested.is_empty()
            || self.pending_callbacks > 0
        {
            ActivityLevel::Busy
        } else if self.options.continuous || self.options.passive {
            ActivityLevel::Idle
        } else {
            ActivityLevel::Stopped
        }
    }

    fn update_activity(&mut self) {
        let level = self.compute_level();
        if level != self.level {
            self.level = level;
            debug!(%level, "activity level changed");
            let _ = self.events.send(Event::Activity {
                level,
                progress: self.progress,
            });
        }
    }
}

fn respond(reply: Option<ReplySender>, response: Response) {
    if let Some(reply) = reply {
        // A dropped receiver means the connection went away; nothing to do.
        let _ = reply.send(response);
    }
}
