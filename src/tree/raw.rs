//! Packed on-disk encoding of a revision tree.
//!
//! A blob is a sequence of variable-length records terminated by a 4-byte
//! big-endian zero. Each record:
//!
//! ```text
//! size        u32, big-endian, total record size including itself
//! parentIndex u16, big-endian, 0xFFFF = none
//! flags       u8
//! revIDLen    u8
//! revID       revIDLen bytes
//! sequence    unsigned varint
//! body        remaining bytes of the record
//! ```
//!
//! Records are written in sorted order, current revision first, so the
//! blob can answer "current revision" without decoding the whole tree.
//! The readers in this module ([`count`], [`get`], [`find`]) walk the raw
//! records in place for exactly that reason.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::revid::RevId;
use crate::tree::{Rev, Sequence, MAX_REVS};

/// Wire-only flag: the record carries body bytes after the sequence.
const HAS_DATA: u8 = 0x80;

/// Sentinel parent index meaning "none".
const NO_PARENT: u16 = 0xFFFF;

/// Fixed-size prefix of every record: size + parentIndex + flags + revIDLen.
const HEADER_SIZE: usize = 4 + 2 + 1 + 1;

/// Size of one revision's packed record.
fn size_for(rev: &Rev) -> usize {
    HEADER_SIZE + rev.rev_id().len() + varint_len(rev.sequence()) + rev.body().len()
}

fn varint_len(value: u64) -> usize {
    let mut buf = unsigned_varint::encode::u64_buffer();
    unsigned_varint::encode::u64(value, &mut buf).len()
}

/// Encodes revisions, in the order given, into a packed blob.
///
/// Non-persistent flags are cleared; the wire-only [`HAS_DATA`] bit is set
/// for every revision with a non-empty body.
pub fn encode_tree(revs: &[Rev]) -> Bytes {
    let total: usize = 4 + revs.iter().map(size_for).sum::<usize>();
    let mut buf = BytesMut::with_capacity(total);
    for rev in revs {
        buf.put_u32(size_for(rev) as u32);
        buf.put_u16(rev.parent().unwrap_or(NO_PARENT));
        let mut flags = rev.flags() & !Rev::NON_PERSISTENT;
        if !rev.body().is_empty() {
            flags |= HAS_DATA;
        }
        buf.put_u8(flags);
        buf.put_u8(rev.rev_id().len() as u8);
        buf.put_slice(rev.rev_id().as_bytes());
        let mut varint = unsigned_varint::encode::u64_buffer();
        buf.put_slice(unsigned_varint::encode::u64(rev.sequence(), &mut varint));
        buf.put_slice(rev.body());
    }
    buf.put_u32(0);
    debug_assert_eq!(buf.len(), total);
    buf.freeze()
}

/// Decodes a packed blob into revisions.
///
/// Revisions stored with sequence 0 adopt `record_sequence`. Any layout
/// violation fails with [`Error::CorruptRevisionData`].
pub fn decode_tree(blob: &[u8], record_sequence: Sequence) -> Result<Vec<Rev>> {
    let mut revs = Vec::new();
    for raw in RawIter::new(blob) {
        let raw = raw?;
        if revs.len() >= MAX_REVS {
            return Err(Error::CorruptRevisionData);
        }
        revs.push(raw.into_rev(record_sequence));
    }
    // Parent links must stay inside the decoded tree.
    for rev in &revs {
        if let Some(parent) = rev.parent() {
            if parent as usize >= revs.len() {
                return Err(Error::CorruptRevisionData);
            }
        }
    }
    Ok(revs)
}

/// Counts records without materializing them.
pub fn count(blob: &[u8]) -> Result<usize> {
    let mut n = 0;
    for raw in RawIter::new(blob) {
        raw?;
        n += 1;
    }
    Ok(n)
}

/// Reads the record at `index` in place.
pub fn get(blob: &[u8], index: usize) -> Result<Option<Rev>> {
    for (i, raw) in RawIter::new(blob).enumerate() {
        let raw = raw?;
        if i == index {
            return Ok(Some(raw.into_rev(0)));
        }
    }
    Ok(None)
}

/// Finds the record with the given revision id in place.
pub fn find(blob: &[u8], rev_id: &[u8]) -> Result<Option<Rev>> {
    for raw in RawIter::new(blob) {
        let raw = raw?;
        if raw.rev_id == rev_id {
            return Ok(Some(raw.into_rev(0)));
        }
    }
    Ok(None)
}

/// One record, borrowed from the blob.
struct RawRev<'a> {
    parent: Option<u16>,
    flags: u8,
    rev_id: &'a [u8],
    sequence: u64,
    body: &'a [u8],
}

impl RawRev<'_> {
    fn into_rev(self, record_sequence: Sequence) -> Rev {
        let sequence = if self.sequence == 0 {
            record_sequence
        } else {
            self.sequence
        };
        Rev::from_raw_parts(
            RevId::new(Bytes::copy_from_slice(self.rev_id)),
            // Wire-only bits never reach memory.
            self.flags & !HAS_DATA,
            self.parent,
            sequence,
            Bytes::copy_from_slice(self.body),
        )
    }
}

/// Walks the packed records of a blob, validating as it goes.
///
/// The iterator ends at the zero-size terminator, which must land exactly
/// on the last four bytes of the blob.
struct RawIter<'a> {
    blob: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> RawIter<'a> {
    fn new(blob: &'a [u8]) -> Self {
        RawIter {
            blob,
            pos: 0,
            failed: false,
        }
    }

    fn parse_next(&mut self) -> Result<Option<RawRev<'a>>> {
        let remaining = &self.blob[self.pos..];
        if remaining.len() < 4 {
            return Err(Error::CorruptRevisionData);
        }
        let size = u32::from_be_bytes(remaining[..4].try_into().expect("4 bytes")) as usize;
        if size == 0 {
            // Terminator: the records must exactly fill the blob.
            if self.pos + 4 != self.blob.len() {
                return Err(Error::CorruptRevisionData);
            }
            return Ok(None);
        }
        if size < HEADER_SIZE || size > remaining.len() {
            return Err(Error::CorruptRevisionData);
        }
        let record = &remaining[..size];
        let parent = match u16::from_be_bytes(record[4..6].try_into().expect("2 bytes")) {
            NO_PARENT => None,
            index => Some(index),
        };
        let flags = record[6];
        let rev_id_len = record[7] as usize;
        if HEADER_SIZE + rev_id_len > size {
            return Err(Error::CorruptRevisionData);
        }
        let rev_id = &record[HEADER_SIZE..HEADER_SIZE + rev_id_len];
        let tail = &record[HEADER_SIZE + rev_id_len..];
        let (sequence, after_varint) =
            unsigned_varint::decode::u64(tail).map_err(|_| Error::CorruptRevisionData)?;
        let body = if flags & HAS_DATA != 0 {
            after_varint
        } else {
            // Without HAS_DATA any trailing bytes are not a body (the
            // format reserves them for indirect-body records).
            &[]
        };
        self.pos += size;
        Ok(Some(RawRev {
            parent,
            flags,
            rev_id,
            sequence,
            body,
        }))
    }
}

impl<'a> Iterator for RawIter<'a> {
    type Item = Result<RawRev<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.parse_next() {
            Ok(Some(raw)) => Some(Ok(raw)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
