//! MemTable - in-memory sorted buffer for recent writes.
//!
//! Entries live in a skip-list whose keys are fully encoded records:
//!
//! ```text
//! varint32 internal_key_len | internal_key | varint32 value_len | value
//! ```
//!
//! The skip-list orders those records by their embedded internal key,
//! so one structure carries every version of every user key. Readers
//! run lock-free against a single externally synchronized writer.

pub mod arena;
pub mod skiplist;

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::iterator::Iter;
use crate::types::{
    pack_sequence_and_type, LookupKey, LookupResult, SequenceNumber, ValueType,
};
use crate::util::coding::{decode_varint32, encode_varint32, read_fixed64, varint_length};
use crate::util::comparator::{Comparator, InternalKeyComparator};

use arena::Arena;
use skiplist::{KeyComparator, SkipList, SkipListIterator};

/// Orders encoded memtable records by their internal key.
#[derive(Clone, Copy, Default)]
pub(crate) struct MemTableKeyComparator {
    cmp: InternalKeyComparator,
}

impl KeyComparator for MemTableKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
        let a_key = length_prefixed_slice(a);
        let b_key = length_prefixed_slice(b);
        self.cmp.compare(a_key, b_key)
    }
}

/// Decode the leading length-prefixed slice of an encoded record.
fn length_prefixed_slice(data: &[u8]) -> &[u8] {
    let mut cursor = data;
    let len = decode_varint32(&mut cursor).unwrap_or(0) as usize;
    &cursor[..len.min(cursor.len())]
}

struct MemTableCore {
    list: SkipList<MemTableKeyComparator>,
    arena: Arc<Arena>,
}

/// In-memory write buffer over a concurrent skip-list.
///
/// Cheap to clone (shared core); clones observe the same entries.
#[derive(Clone)]
pub struct MemTable {
    core: Arc<MemTableCore>,
}

impl MemTable {
    /// Create a new empty memtable.
    pub fn new() -> Self {
        let arena = Arc::new(Arena::new());
        Self {
            core: Arc::new(MemTableCore {
                list: SkipList::new(MemTableKeyComparator::default(), Arc::clone(&arena)),
                arena,
            }),
        }
    }

    /// Approximate bytes of data held by this memtable.
    pub fn approximate_memory_usage(&self) -> usize {
        self.core.arena.memory_usage()
    }

    /// Add an entry that maps `user_key` to `value` at `sequence`, or a
    /// tombstone when `value_type` is [`ValueType::Deletion`].
    ///
    /// Writers must be externally serialized.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = BytesMut::with_capacity(encoded_len);
        encode_varint32(&mut buf, internal_key_len as u32);
        buf.put_slice(user_key);
        buf.put_u64_le(pack_sequence_and_type(sequence, value_type));
        encode_varint32(&mut buf, value.len() as u32);
        buf.put_slice(value);

        self.core.list.insert(&buf);
    }

    /// Look up the newest entry for the lookup key's user key at or
    /// below its snapshot sequence.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let mut iter = self.core.list.iter();
        iter.seek(key.memtable_key());

        if !iter.valid() {
            return LookupResult::NotFound;
        }

        // The seek landed on the first record at or after
        // (user_key, snapshot). Only its user-key portion needs
        // checking: descending tag order guarantees it is the newest
        // visible version when the user keys match.
        let entry = iter.key();
        let (internal_key, value) = decode_entry(entry);
        if internal_key.len() < 8 {
            return LookupResult::NotFound;
        }
        let user_key = &internal_key[..internal_key.len() - 8];
        if user_key != key.user_key() {
            return LookupResult::NotFound;
        }

        let tag = read_fixed64(&internal_key[internal_key.len() - 8..]).unwrap_or(0);
        match ValueType::from_byte((tag & 0xFF) as u8) {
            Some(ValueType::Value) => LookupResult::Found(Bytes::copy_from_slice(value)),
            Some(ValueType::Deletion) => LookupResult::Deleted,
            None => LookupResult::NotFound,
        }
    }

    /// Create an iterator over the memtable's internal-key entries.
    ///
    /// The iterator keeps the memtable alive.
    pub fn iter(&self) -> MemTableIterator {
        // The raw cursor borrows the list inside `core`; holding the
        // Arc alongside keeps that borrow alive for the iterator's
        // lifetime.
        let raw = unsafe {
            std::mem::transmute::<
                SkipListIterator<'_, MemTableKeyComparator>,
                SkipListIterator<'static, MemTableKeyComparator>,
            >(self.core.list.iter())
        };
        MemTableIterator {
            _core: Arc::clone(&self.core),
            raw,
            scratch: Vec::new(),
        }
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Split an encoded record into (internal_key, value).
fn decode_entry(entry: &[u8]) -> (&[u8], &[u8]) {
    let mut cursor = entry;
    let klen = decode_varint32(&mut cursor).unwrap_or(0) as usize;
    if klen > cursor.len() {
        return (&[], &[]);
    }
    let (internal_key, rest) = cursor.split_at(klen);

    let mut rest_cursor = rest;
    let vlen = decode_varint32(&mut rest_cursor).unwrap_or(0) as usize;
    if vlen > rest_cursor.len() {
        return (internal_key, &[]);
    }
    (internal_key, &rest_cursor[..vlen])
}

/// Iterator over memtable entries, yielding internal keys.
pub struct MemTableIterator {
    _core: Arc<MemTableCore>,
    raw: SkipListIterator<'static, MemTableKeyComparator>,
    /// Seek-target scratch: target internal keys get a length prefix
    /// prepended to become memtable keys.
    scratch: Vec<u8>,
}

// The raw cursor only walks arena-backed nodes kept alive by `_core`.
unsafe impl Send for MemTableIterator {}

impl Iter for MemTableIterator {
    fn valid(&self) -> bool {
        self.raw.valid()
    }

    fn seek_to_first(&mut self) {
        self.raw.seek_to_first();
    }

    fn seek_to_last(&mut self) {
        self.raw.seek_to_last();
    }

    fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        let mut buf = BytesMut::with_capacity(5 + target.len());
        encode_varint32(&mut buf, target.len() as u32);
        buf.put_slice(target);
        self.scratch.extend_from_slice(&buf);
        self.raw.seek(&self.scratch);
    }

    fn next(&mut self) {
        self.raw.next();
    }

    fn prev(&mut self) {
        self.raw.prev();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        decode_entry(self.raw.key()).0
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        decode_entry(self.raw.key()).1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
