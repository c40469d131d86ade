//! Revision identifiers.
//!
//! A *proper* revision id has the form `G-S`, where `G` is a decimal
//! generation (1..=8 digits, greater than zero) and `S` is a non-empty
//! digest suffix. Ids that do not match this shape are still carried and
//! compared, but only as raw bytes.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

/// A proper generation never has more than eight decimal digits.
pub const MAX_GENERATION_DIGITS: usize = 8;

/// Splits `bytes` into `(generation, digest)` if it is a proper revision id.
pub fn parse(bytes: &[u8]) -> Option<(u32, &[u8])> {
    let dash = bytes.iter().position(|&b| b == b'-')?;
    if dash == 0 || dash > MAX_GENERATION_DIGITS || dash + 1 >= bytes.len() {
        return None;
    }
    let mut generation: u32 = 0;
    for &b in &bytes[..dash] {
        if !b.is_ascii_digit() {
            return None;
        }
        generation = generation * 10 + u32::from(b - b'0');
    }
    if generation == 0 {
        return None;
    }
    Some((generation, &bytes[dash + 1..]))
}

/// Total ordering over revision ids.
///
/// Proper ids order by generation, then by byte comparison of the digest.
/// If either side is improper both compare as plain bytes.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    match (parse(a), parse(b)) {
        (Some((gen_a, digest_a)), Some((gen_b, digest_b))) => gen_a
            .cmp(&gen_b)
            .then_with(|| digest_a.cmp(digest_b)),
        _ => a.cmp(b),
    }
}

/// An owned revision identifier. Cheap to clone.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct RevId(Bytes);

impl RevId {
    /// Wraps raw bytes as a revision id, proper or not.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        RevId(bytes.into())
    }

    /// Builds a proper revision id from a generation and digest suffix.
    pub fn from_parts(generation: u32, digest: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(MAX_GENERATION_DIGITS + 1 + digest.len());
        buf.extend_from_slice(generation.to_string().as_bytes());
        buf.push(b'-');
        buf.extend_from_slice(digest);
        RevId(buf.into())
    }

    /// The raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The backing buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The generation prefix, or 0 if the id is not proper.
    pub fn generation(&self) -> u32 {
        parse(&self.0).map_or(0, |(generation, _)| generation)
    }

    /// The digest suffix, if the id is proper.
    pub fn digest(&self) -> Option<&[u8]> {
        parse(&self.0).map(|(_, digest)| digest)
    }

    /// Whether the id has the proper `G-S` shape.
    pub fn is_proper(&self) -> bool {
        parse(&self.0).is_some()
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl AsRef<[u8]> for RevId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for RevId {
    fn from(s: &str) -> Self {
        RevId(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&[u8]> for RevId {
    fn from(bytes: &[u8]) -> Self {
        RevId(Bytes::copy_from_slice(bytes))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({})", String::from_utf8_lossy(&self.0))
    }
}
