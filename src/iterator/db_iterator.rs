//! User-facing iterator: projects the internal-key entry stream onto
//! live user keys at a snapshot.
//!
//! Each user key is surfaced at most once, as its newest version with
//! sequence at or below the snapshot; tombstones and the versions they
//! shadow are hidden.

use std::cmp::Ordering as CmpOrdering;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::types::{
    append_internal_key, ParsedInternalKey, SequenceNumber, ValueType, VALUE_TYPE_FOR_SEEK,
};
use crate::util::comparator::{BytewiseComparator, Comparator};

use super::{Iter, MergingIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// `inner` is positioned at the entry yielding the current
    /// key/value.
    Forward,
    /// `inner` is positioned before all entries for the current user
    /// key, which is buffered in `saved_key`/`saved_value`.
    Reverse,
}

/// Snapshot-consistent iterator over user keys.
pub struct DbIterator {
    inner: MergingIterator,
    /// Writes after this sequence are invisible.
    sequence: SequenceNumber,
    user_cmp: BytewiseComparator,
    direction: Direction,
    valid: bool,
    /// Forward: the user key being skipped over. Reverse: the current
    /// user key.
    saved_key: Vec<u8>,
    /// Reverse only: the current value.
    saved_value: Bytes,
}

impl DbIterator {
    /// Wrap `inner` (yielding internal keys) at `sequence`.
    pub fn new(inner: MergingIterator, sequence: SequenceNumber) -> Self {
        Self {
            inner,
            sequence,
            user_cmp: BytewiseComparator::new(),
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Bytes::new(),
        }
    }

    /// Position at the first user key at or after `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value = Bytes::new();

        let mut seek_key = BytesMut::with_capacity(target.len() + 8);
        append_internal_key(&mut seek_key, target, self.sequence, VALUE_TYPE_FOR_SEEK);
        self.inner.seek(&seek_key);

        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Position at the first live user key.
    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value = Bytes::new();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Position at the last live user key.
    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value = Bytes::new();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current user key.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => {
                ParsedInternalKey::parse(self.inner.key())
                    .map(|p| p.user_key)
                    .unwrap_or(b"")
            }
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// Advance to the next live user key.
    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // inner sits before every entry of saved_key; move it to
            // the first entry at or after it.
            self.direction = Direction::Forward;
            if !self.inner.valid() {
                self.inner.seek_to_first();
            } else {
                self.inner.next();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key is the key just surfaced; skip its versions
        } else {
            // Remember the current user key, then step past it
            self.saved_key.clear();
            if let Some(parsed) = ParsedInternalKey::parse(self.inner.key()) {
                self.saved_key.extend_from_slice(parsed.user_key);
            }
            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    /// Step back to the previous live user key.
    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // inner is at the current entry; walk back before every
            // version of its user key.
            self.saved_key.clear();
            if let Some(parsed) = ParsedInternalKey::parse(self.inner.key()) {
                self.saved_key.extend_from_slice(parsed.user_key);
            }
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value = Bytes::new();
                    return;
                }
                let user_key = ParsedInternalKey::parse(self.inner.key())
                    .map(|p| p.user_key)
                    .unwrap_or(b"");
                if self.user_cmp.compare(user_key, &self.saved_key) == CmpOrdering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// First error from the underlying sources.
    pub fn status(&self) -> Result<()> {
        self.inner.status()
    }

    /// Scan forward for the newest visible, non-deleted user entry.
    /// With `skipping`, entries for `saved_key` (and older keys) are
    /// passed over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);

        while self.inner.valid() {
            if let Some(parsed) = ParsedInternalKey::parse(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    match parsed.value_type {
                        Some(ValueType::Deletion) => {
                            // Everything below this version is
                            // shadowed
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(parsed.user_key);
                            skipping = true;
                        }
                        Some(ValueType::Value) => {
                            if skipping
                                && self.user_cmp.compare(parsed.user_key, &self.saved_key)
                                    != CmpOrdering::Greater
                            {
                                // Hidden by a newer deletion or an
                                // already-surfaced version
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                        None => {}
                    }
                }
            }
            self.inner.next();
        }

        self.saved_key.clear();
        self.valid = false;
    }

    /// Scan backward, accumulating the newest visible version of the
    /// key preceding the current position.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        while self.inner.valid() {
            if let Some(parsed) = ParsedInternalKey::parse(self.inner.key()) {
                if parsed.sequence <= self.sequence {
                    if value_type != ValueType::Deletion
                        && self.user_cmp.compare(parsed.user_key, &self.saved_key)
                            == CmpOrdering::Less
                    {
                        // A live entry for saved_key is buffered, and
                        // we just stepped onto the previous user key.
                        break;
                    }
                    value_type = parsed.value_type.unwrap_or(ValueType::Deletion);
                    if value_type == ValueType::Deletion {
                        self.saved_key.clear();
                        self.saved_value = Bytes::new();
                    } else {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(parsed.user_key);
                        self.saved_value = Bytes::copy_from_slice(self.inner.value());
                    }
                }
            }
            self.inner.prev();
        }

        if value_type == ValueType::Deletion {
            // Ran off the beginning
            self.valid = false;
            self.saved_key.clear();
            self.saved_value = Bytes::new();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}
