//! Message-level contract with a replication peer.
//!
//! The transport and framing are external; this module defines the
//! message payloads only. `changes` bodies are JSON arrays of
//! `[sequence, docID, revID, deleted, bodySize]` tuples, `rev` bodies are
//! JSON documents, and error replies carry a `(domain, code)` pair.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::revid::RevId;

/// An opaque peer sequence, carried verbatim: grove stores and compares
/// peer sequences but never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteSequence(Value);

impl RemoteSequence {
    /// The absent sequence (JSON `null`).
    pub fn none() -> RemoteSequence {
        RemoteSequence(Value::Null)
    }

    /// Whether this is the absent sequence.
    pub fn is_none(&self) -> bool {
        self.0.is_null()
    }

    /// The JSON value of the sequence.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Serializes the sequence for checkpoint storage.
    pub fn to_checkpoint_bytes(&self) -> Bytes {
        match serde_json::to_vec(&self.0) {
            Ok(bytes) => bytes.into(),
            Err(_) => Bytes::new(),
        }
    }
}

impl From<Value> for RemoteSequence {
    fn from(value: Value) -> Self {
        RemoteSequence(value)
    }
}

impl From<&str> for RemoteSequence {
    fn from(s: &str) -> Self {
        RemoteSequence(Value::from(s))
    }
}

impl fmt::Display for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of a peer `changes` message:
/// `[sequence, docID, revID, deleted, bodySize]`. The last two elements
/// are optional on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// The peer's sequence for this change.
    pub sequence: RemoteSequence,
    /// The changed document.
    pub doc_id: String,
    /// The new revision.
    pub rev_id: String,
    /// Whether the revision is a deletion.
    pub deleted: bool,
    /// Size of the revision body in bytes, if the peer reported it.
    pub body_size: u64,
}

impl ChangeEntry {
    /// Parses one wire entry.
    pub fn parse(value: &Value) -> Result<ChangeEntry> {
        let entry = value
            .as_array()
            .ok_or_else(|| Error::protocol(400, "changes entry is not an array"))?;
        if entry.len() < 3 {
            return Err(Error::protocol(400, "changes entry is too short"));
        }
        let doc_id = entry[1]
            .as_str()
            .ok_or_else(|| Error::protocol(400, "changes entry docID is not a string"))?;
        let rev_id = entry[2]
            .as_str()
            .ok_or_else(|| Error::protocol(400, "changes entry revID is not a string"))?;
        let deleted = match entry.get(3) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(deleted)) => *deleted,
            Some(Value::Number(number)) => number.as_i64().unwrap_or(0) != 0,
            Some(_) => return Err(Error::protocol(400, "changes entry deleted flag is invalid")),
        };
        let body_size = entry
            .get(4)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(ChangeEntry {
            sequence: RemoteSequence(entry[0].clone()),
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted,
            body_size,
        })
    }

    /// The wire form of this entry.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            self.sequence.0.clone(),
            Value::from(self.doc_id.as_str()),
            Value::from(self.rev_id.as_str()),
            Value::from(self.deleted),
            Value::from(self.body_size),
        ])
    }
}

/// Parses a `changes` message body.
pub fn parse_changes(body: &[u8]) -> Result<Vec<ChangeEntry>> {
    let entries: Vec<Value> = serde_json::from_slice(body)
        .map_err(|_| Error::protocol(400, "changes body is not a JSON array"))?;
    entries.iter().map(ChangeEntry::parse).collect()
}

/// Builds the reply body for a `changes` message: `0` for revisions we
/// already have, an array of known ancestor revids for ones we want.
pub fn changes_response(answers: &[Option<Vec<Bytes>>]) -> Value {
    Value::Array(
        answers
            .iter()
            .map(|answer| match answer {
                None => Value::from(0),
                Some(ancestors) => Value::Array(
                    ancestors
                        .iter()
                        .map(|id| Value::from(String::from_utf8_lossy(id).into_owned()))
                        .collect(),
                ),
            })
            .collect(),
    )
}

/// A peer `rev` message: one revision to insert.
#[derive(Debug, Clone, Default)]
pub struct RevMessage {
    /// The `id` property: the document id.
    pub id: String,
    /// The `rev` property: the revision id.
    pub rev: String,
    /// The `deleted` property.
    pub deleted: bool,
    /// The `history` property: ancestor revids as CSV, nearest first.
    pub history: Option<String>,
    /// The `sequence` property; required in active mode.
    pub sequence: RemoteSequence,
    /// The `noreply` property.
    pub no_reply: bool,
    /// The message body: the revision as JSON.
    pub body: Bytes,
}

impl RevMessage {
    /// Parses the `history` property into revision ids.
    pub fn parse_history(&self) -> Vec<RevId> {
        self.history
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter(|part| !part.is_empty())
            .map(RevId::from)
            .collect()
    }
}

/// A reply to a peer message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Empty success reply.
    Ok,
    /// Success reply with a JSON body.
    Body(Value),
    /// Error reply.
    Error {
        /// Wire domain name, e.g. `"BLIP"` or `"LiteCore"`.
        domain: &'static str,
        /// Error code within the domain.
        code: i32,
    },
}

impl Response {
    /// The error reply for a crate error.
    pub fn error(err: &Error) -> Response {
        let (domain, code) = err.domain_code();
        Response::Error {
            domain: domain.wire_name(),
            code,
        }
    }

    /// The generic protocol-violation reply.
    pub fn bad_request() -> Response {
        Response::Error {
            domain: "BLIP",
            code: 400,
        }
    }
}

/// Messages the Puller sends to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Subscribe to the peer's changes feed. No reply is expected.
    SubChanges {
        /// Resume after this checkpoint.
        since: Option<RemoteSequence>,
        /// Keep the subscription open after catching up.
        continuous: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_changes_entries() {
        let body = br#"[["s1","doc1","1-a"],["s2","doc2","2-b",1,42],[3,"doc3","1-c",false]]"#;
        let entries = parse_changes(body).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].doc_id, "doc1");
        assert!(!entries[0].deleted);
        assert_eq!(entries[0].body_size, 0);
        assert!(entries[1].deleted);
        assert_eq!(entries[1].body_size, 42);
        // Sequences may be any JSON value.
        assert_eq!(entries[2].sequence, RemoteSequence::from(Value::from(3)));
        assert!(!entries[2].deleted);
    }

    #[test]
    fn parse_changes_rejects_garbage() {
        assert!(matches!(
            parse_changes(b"not json"),
            Err(Error::Protocol { code: 400, .. })
        ));
        assert!(matches!(
            parse_changes(br#"[["s1","doc1"]]"#),
            Err(Error::Protocol { code: 400, .. })
        ));
        assert!(matches!(
            parse_changes(br#"[["s1",7,"1-a"]]"#),
            Err(Error::Protocol { code: 400, .. })
        ));
    }

    #[test]
    fn change_entry_roundtrip() {
        let entry = ChangeEntry {
            sequence: RemoteSequence::from("s9"),
            doc_id: "doc".into(),
            rev_id: "3-c".into(),
            deleted: true,
            body_size: 17,
        };
        assert_eq!(ChangeEntry::parse(&entry.to_value()).unwrap(), entry);
    }

    #[test]
    fn changes_response_shape() {
        let answers = vec![
            None,
            Some(vec![Bytes::from_static(b"1-a"), Bytes::from_static(b"2-b")]),
            Some(Vec::new()),
        ];
        let value = changes_response(&answers);
        assert_eq!(
            value,
            serde_json::json!([0, ["1-a", "2-b"], []])
        );
    }

    #[test]
    fn history_csv() {
        let message = RevMessage {
            history: Some("2-b,1-a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            message.parse_history(),
            vec![RevId::from("2-b"), RevId::from("1-a")]
        );
        assert!(RevMessage::default().parse_history().is_empty());
    }

    #[test]
    fn response_error_mapping() {
        assert_eq!(
            Response::error(&Error::protocol(400, "bad")),
            Response::Error {
                domain: "BLIP",
                code: 400
            }
        );
        assert_eq!(
            Response::error(&Error::Conflict),
            Response::Error {
                domain: "LiteCore",
                code: 3
            }
        );
    }
}
