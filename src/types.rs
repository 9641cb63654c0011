//! Core key formats and the write-batch codec.
//!
//! Every stored entry is keyed by an *internal key*: the user key
//! followed by an 8-byte tag packing a 56-bit sequence number and a
//! value type. All ordering and MVCC semantics hang off this format.

use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::util::coding::{
    decode_varint32, encode_length_prefixed, encode_varint32, read_fixed32, read_fixed64,
};

/// A sequence number: 56-bit monotonically increasing write counter.
pub type SequenceNumber = u64;

/// Maximum representable sequence number (56 bits).
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Value type indicator in internal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// Deletion marker (tombstone).
    Deletion = 0,
    /// Normal value.
    Value = 1,
}

/// The value type used when seeking.
///
/// The tag orders descending for a fixed user key, so the highest
/// type byte at a given sequence is encountered first; seeks use
/// `Value` (0x01) to land on the newest entry at or below a snapshot.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Create from byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        matches!(self, ValueType::Deletion)
    }
}

/// Pack a sequence number and value type into an 8-byte tag.
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | (value_type.to_byte() as u64)
}

/// Split a tag back into sequence number and value type.
pub fn unpack_sequence_and_type(tag: u64) -> (SequenceNumber, Option<ValueType>) {
    (tag >> 8, ValueType::from_byte((tag & 0xFF) as u8))
}

/// Append an encoded internal key (user key + tag) to a buffer.
pub fn append_internal_key(
    buf: &mut BytesMut,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    buf.put_slice(user_key);
    buf.put_u64_le(pack_sequence_and_type(sequence, value_type));
}

/// Extract the user-key portion of an encoded internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len().saturating_sub(8)]
}

/// An internal key decomposed into its parts, borrowing the user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParsedInternalKey<'a> {
    /// The user-provided key.
    pub user_key: &'a [u8],
    /// Sequence number of the write.
    pub sequence: SequenceNumber,
    /// Value or tombstone.
    pub value_type: Option<ValueType>,
}

impl<'a> ParsedInternalKey<'a> {
    /// Parse an encoded internal key.
    ///
    /// Returns None if the input is shorter than a tag or carries an
    /// unknown value type.
    pub fn parse(internal_key: &'a [u8]) -> Option<Self> {
        if internal_key.len() < 8 {
            return None;
        }
        let tag = read_fixed64(&internal_key[internal_key.len() - 8..])?;
        let (sequence, value_type) = unpack_sequence_and_type(tag);
        value_type?;
        Some(Self {
            user_key: &internal_key[..internal_key.len() - 8],
            sequence,
            value_type,
        })
    }
}

/// An owned internal key.
///
/// Encoded format: `user_key || fixed64_le((sequence << 8) | type)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    user_key: Bytes,
    sequence: SequenceNumber,
    value_type: ValueType,
}

impl InternalKey {
    /// Create a new internal key.
    pub fn new(user_key: impl Into<Bytes>, sequence: SequenceNumber, value_type: ValueType) -> Self {
        debug_assert!(sequence <= MAX_SEQUENCE);
        Self {
            user_key: user_key.into(),
            sequence,
            value_type,
        }
    }

    /// Create an internal key for a put operation.
    pub fn for_value(user_key: impl Into<Bytes>, sequence: SequenceNumber) -> Self {
        Self::new(user_key, sequence, ValueType::Value)
    }

    /// Create an internal key for a delete operation.
    pub fn for_deletion(user_key: impl Into<Bytes>, sequence: SequenceNumber) -> Self {
        Self::new(user_key, sequence, ValueType::Deletion)
    }

    /// Get the user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Get the sequence number.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    /// Get the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Check if this is a deletion marker.
    pub fn is_deletion(&self) -> bool {
        self.value_type.is_deletion()
    }

    /// Encode the internal key to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.user_key.len() + 8);
        append_internal_key(&mut buf, &self.user_key, self.sequence, self.value_type);
        buf.freeze()
    }

    /// Decode an internal key from bytes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let parsed = ParsedInternalKey::parse(data)?;
        Some(Self {
            user_key: Bytes::copy_from_slice(parsed.user_key),
            sequence: parsed.sequence,
            value_type: parsed.value_type?,
        })
    }

    /// Get the encoded length.
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + 8
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => {
                // Same user key: descending by tag, so newer entries
                // sort first
                let a = pack_sequence_and_type(self.sequence, self.value_type);
                let b = pack_sequence_and_type(other.sequence, other.value_type);
                b.cmp(&a)
            }
            ord => ord,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A key formatted for lookups across the memtable and tables.
///
/// Layout: `varint32(user_key.len + 8) || user_key || fixed64 tag`
/// with the tag set to `(snapshot << 8) | 0x01`. The whole buffer is a
/// valid memtable key; the suffix past the length prefix is a valid
/// internal key.
pub struct LookupKey {
    buf: Vec<u8>,
    // Offset where the internal key starts (just past the varint).
    kstart: usize,
}

impl LookupKey {
    /// Build a lookup key for `user_key` as of `snapshot`.
    pub fn new(user_key: &[u8], snapshot: SequenceNumber) -> Self {
        let mut tmp = BytesMut::with_capacity(user_key.len() + 13);
        encode_varint32(&mut tmp, (user_key.len() + 8) as u32);
        let kstart = tmp.len();
        append_internal_key(&mut tmp, user_key, snapshot, VALUE_TYPE_FOR_SEEK);
        Self {
            buf: tmp.to_vec(),
            kstart,
        }
    }

    /// The key to seek with inside the memtable's skip-list.
    pub fn memtable_key(&self) -> &[u8] {
        &self.buf
    }

    /// The internal key, for table lookups.
    pub fn internal_key(&self) -> &[u8] {
        &self.buf[self.kstart..]
    }

    /// The bare user key.
    pub fn user_key(&self) -> &[u8] {
        &self.buf[self.kstart..self.buf.len() - 8]
    }

    /// The snapshot sequence this lookup reads at.
    pub fn sequence(&self) -> SequenceNumber {
        read_fixed64(&self.buf[self.buf.len() - 8..])
            .map(|tag| tag >> 8)
            .unwrap_or(0)
    }
}

/// Result of a point lookup against one ordered source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// Value found.
    Found(Bytes),
    /// A tombstone shadows the key.
    Deleted,
    /// This source has no entry for the key.
    NotFound,
}

impl LookupResult {
    /// Check if a value was found.
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found(_))
    }

    /// Convert to Option, dropping the found/deleted distinction.
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            LookupResult::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Byte offset of the count field in an encoded batch.
const BATCH_COUNT_OFFSET: usize = 8;

/// Encoded batch header: fixed64 sequence + fixed32 count.
pub const BATCH_HEADER_SIZE: usize = 12;

/// Tag byte for a put record in a batch.
const BATCH_TAG_VALUE: u8 = ValueType::Value as u8;

/// Tag byte for a delete record in a batch.
const BATCH_TAG_DELETION: u8 = ValueType::Deletion as u8;

/// Handler invoked for each operation when replaying a batch.
pub trait WriteBatchHandler {
    /// Called for each put in the batch.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// Called for each delete in the batch.
    fn delete(&mut self, key: &[u8]);
}

/// An atomic group of updates, applied in order.
///
/// Wire format:
/// ```text
/// fixed64 sequence | fixed32 count | record*
/// record := 0x01 lp_key lp_value   (put)
///         | 0x00 lp_key            (delete)
/// ```
/// where `lp_x` is a varint32 length followed by the payload.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: BytesMut,
}

impl WriteBatch {
    /// Create a new empty write batch.
    pub fn new() -> Self {
        let mut rep = BytesMut::with_capacity(64);
        rep.resize(BATCH_HEADER_SIZE, 0);
        Self { rep }
    }

    /// Reconstruct a batch from its encoded form (WAL recovery).
    pub fn from_contents(data: &[u8]) -> Result<Self> {
        if data.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("write batch too small"));
        }
        Ok(Self {
            rep: BytesMut::from(data),
        })
    }

    /// Add a put operation to the batch.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(BATCH_TAG_VALUE);
        encode_length_prefixed(&mut self.rep, key);
        encode_length_prefixed(&mut self.rep, value);
    }

    /// Add a delete operation to the batch.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(BATCH_TAG_DELETION);
        encode_length_prefixed(&mut self.rep, key);
    }

    /// Clear the batch.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Check if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of operations in the batch.
    pub fn count(&self) -> u32 {
        read_fixed32(&self.rep[BATCH_COUNT_OFFSET..]).unwrap_or(0)
    }

    fn set_count(&mut self, count: u32) {
        self.rep[BATCH_COUNT_OFFSET..BATCH_COUNT_OFFSET + 4]
            .copy_from_slice(&count.to_le_bytes());
    }

    /// Base sequence number assigned to this batch.
    pub fn sequence(&self) -> SequenceNumber {
        read_fixed64(&self.rep).unwrap_or(0)
    }

    /// Assign the base sequence number for this batch.
    pub fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    /// The encoded bytes, as written to the WAL.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Approximate in-memory footprint of the batch.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Append all operations from `other` to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.put_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Replay the batch through a handler, in insertion order.
    pub fn iterate<H: WriteBatchHandler>(&self, handler: &mut H) -> Result<()> {
        let mut input = &self.rep[BATCH_HEADER_SIZE..];
        let mut found = 0u32;

        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];
            match tag {
                BATCH_TAG_VALUE => {
                    let key = take_length_prefixed(&mut input)
                        .ok_or_else(|| Error::corruption("bad WriteBatch put key"))?;
                    let value = take_length_prefixed(&mut input)
                        .ok_or_else(|| Error::corruption("bad WriteBatch put value"))?;
                    handler.put(key, value);
                }
                BATCH_TAG_DELETION => {
                    let key = take_length_prefixed(&mut input)
                        .ok_or_else(|| Error::corruption("bad WriteBatch delete key"))?;
                    handler.delete(key);
                }
                _ => return Err(Error::corruption("unknown WriteBatch tag")),
            }
            found += 1;
        }

        if found != self.count() {
            return Err(Error::corruption("WriteBatch has wrong count"));
        }
        Ok(())
    }

    /// Replay the batch into a memtable with per-entry sequences
    /// `sequence() + index`.
    pub fn insert_into(&self, memtable: &crate::memtable::MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence(),
            memtable,
        };
        self.iterate(&mut inserter)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrow a length-prefixed slice out of the input.
fn take_length_prefixed<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = decode_varint32(input)? as usize;
    if input.len() < len {
        return None;
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Some(head)
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    memtable: &'a crate::memtable::MemTable,
}

impl WriteBatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.memtable
            .add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.memtable
            .add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    }

    impl WriteBatchHandler for RecordingHandler {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.ops.push((key.to_vec(), Some(value.to_vec())));
        }

        fn delete(&mut self, key: &[u8]) {
            self.ops.push((key.to_vec(), None));
        }
    }

    #[test]
    fn test_value_type() {
        assert_eq!(ValueType::from_byte(0), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_byte(1), Some(ValueType::Value));
        assert_eq!(ValueType::from_byte(2), None);
        assert!(ValueType::Deletion.is_deletion());
        assert!(!ValueType::Value.is_deletion());
    }

    #[test]
    fn test_tag_packing() {
        let tag = pack_sequence_and_type(0x12_3456, ValueType::Value);
        assert_eq!(tag, 0x12_3456_01);

        let (seq, vt) = unpack_sequence_and_type(tag);
        assert_eq!(seq, 0x12_3456);
        assert_eq!(vt, Some(ValueType::Value));
    }

    #[test]
    fn test_internal_key_encode_decode() {
        let key = InternalKey::new(Bytes::from("hello"), 12345, ValueType::Value);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 5 + 8);

        let decoded = InternalKey::decode(&encoded).unwrap();
        assert_eq!(key, decoded);

        let parsed = ParsedInternalKey::parse(&encoded).unwrap();
        assert_eq!(parsed.user_key, b"hello");
        assert_eq!(parsed.sequence, 12345);
        assert_eq!(parsed.value_type, Some(ValueType::Value));
    }

    #[test]
    fn test_internal_key_tag_is_little_endian() {
        let key = InternalKey::new(Bytes::from("k"), 1, ValueType::Value);
        let encoded = key.encode();
        // tag = (1 << 8) | 1 = 0x0101, little-endian
        assert_eq!(&encoded[1..], &[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_internal_key_ordering() {
        let old = InternalKey::new(Bytes::from("aaa"), 100, ValueType::Value);
        let new = InternalKey::new(Bytes::from("aaa"), 200, ValueType::Value);
        let other = InternalKey::new(Bytes::from("bbb"), 100, ValueType::Value);

        // Same user key: higher sequence sorts first
        assert!(new < old);

        // Different user keys: lexicographic
        assert!(old < other);
        assert!(new < other);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ParsedInternalKey::parse(b"short").is_none());

        // Unknown value type byte
        let mut buf = BytesMut::new();
        buf.put_slice(b"key");
        buf.put_u64_le((5 << 8) | 0x7f);
        assert!(ParsedInternalKey::parse(&buf).is_none());
    }

    #[test]
    fn test_lookup_key_views() {
        let lk = LookupKey::new(b"apple", 42);

        assert_eq!(lk.user_key(), b"apple");
        assert_eq!(lk.sequence(), 42);

        // internal_key = user_key + 8-byte tag
        assert_eq!(lk.internal_key().len(), 5 + 8);
        assert_eq!(extract_user_key(lk.internal_key()), b"apple");

        // memtable_key = varint length prefix + internal key
        assert_eq!(lk.memtable_key()[0], 13);
        assert_eq!(&lk.memtable_key()[1..], lk.internal_key());

        let parsed = ParsedInternalKey::parse(lk.internal_key()).unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.value_type, Some(VALUE_TYPE_FOR_SEEK));
    }

    #[test]
    fn test_write_batch_basics() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.put(b"key1", b"value1");
        batch.put(b"key2", b"value2");
        batch.delete(b"key3");

        assert_eq!(batch.count(), 3);
        assert!(!batch.is_empty());

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.contents().len(), BATCH_HEADER_SIZE);
    }

    #[test]
    fn test_write_batch_sequence() {
        let mut batch = WriteBatch::new();
        assert_eq!(batch.sequence(), 0);
        batch.set_sequence(997);
        assert_eq!(batch.sequence(), 997);
    }

    #[test]
    fn test_write_batch_iterate() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");

        let mut handler = RecordingHandler::default();
        batch.iterate(&mut handler).unwrap();

        assert_eq!(
            handler.ops,
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"c".to_vec(), Some(b"3".to_vec())),
            ]
        );
    }

    #[test]
    fn test_write_batch_roundtrip_contents() {
        let mut batch = WriteBatch::new();
        batch.set_sequence(50);
        batch.put(b"key", b"value");
        batch.delete(b"gone");

        let restored = WriteBatch::from_contents(batch.contents()).unwrap();
        assert_eq!(restored.sequence(), 50);
        assert_eq!(restored.count(), 2);

        let mut handler = RecordingHandler::default();
        restored.iterate(&mut handler).unwrap();
        assert_eq!(handler.ops.len(), 2);
    }

    #[test]
    fn test_write_batch_append() {
        let mut a = WriteBatch::new();
        a.put(b"one", b"1");

        let mut b = WriteBatch::new();
        b.put(b"two", b"2");
        b.delete(b"three");

        a.append(&b);
        assert_eq!(a.count(), 3);

        let mut handler = RecordingHandler::default();
        a.iterate(&mut handler).unwrap();
        assert_eq!(handler.ops[2], (b"three".to_vec(), None));
    }

    #[test]
    fn test_write_batch_detects_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");

        // Truncate into the middle of the record
        let truncated = &batch.contents()[..batch.contents().len() - 3];
        let bad = WriteBatch::from_contents(truncated).unwrap();
        let mut handler = RecordingHandler::default();
        assert!(bad.iterate(&mut handler).is_err());

        // Count mismatch
        let mut wrong_count = WriteBatch::from_contents(batch.contents()).unwrap();
        wrong_count.set_count(9);
        let mut handler = RecordingHandler::default();
        assert!(wrong_count.iterate(&mut handler).is_err());
    }
}
