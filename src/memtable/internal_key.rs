//! # Internal Key Format
//!
//! The storage layer never sees bare user keys. Every key is packed into an
//! *internal key* before it reaches the memtable or a table file:
//!
//! ```text
//! InternalKey:
//!   [user_key: bytes] [packed trailer: u64 little-endian]
//!   trailer = (sequence << 8) | value_type
//! ```
//!
//! ## Ordering
//!
//! Internal keys are ordered by:
//! 1. user_key (ascending, by the installed user comparator)
//! 2. sequence (descending - newer first)
//! 3. value_type (descending)

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;

/// Number of trailer bytes appended to a user key.
pub const INTERNAL_KEY_TRAILER_SIZE: usize = 8;

/// The largest sequence number the 56-bit counter can represent.
pub const MAX_SEQUENCE: u64 = (1u64 << 56) - 1;

/// The type of a value in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// A tombstone hiding every older version of the key.
    Deletion = 0,

    /// A normal value.
    Value = 1,

    /// A tombstone cancelling exactly one older value.
    SingleDeletion = 2,
}

/// The value type used when building seek keys: for a fixed (user_key,
/// sequence) it sorts before every real entry with that sequence.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::SingleDeletion;

impl ValueType {
    /// Converts a type byte to a ValueType. `None` marks a corrupt key.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            2 => Some(ValueType::SingleDeletion),
            _ => None,
        }
    }

    /// Converts the ValueType to its wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Packs a sequence number and type byte into the trailer word.
pub fn pack_sequence_and_type(sequence: u64, type_byte: u8) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | type_byte as u64
}

/// Appends the encoded form of `(user_key, sequence, type)` to `out`.
pub fn append_internal_key(out: &mut Vec<u8>, user_key: &[u8], sequence: u64, type_byte: u8) {
    out.extend_from_slice(user_key);
    out.extend_from_slice(&pack_sequence_and_type(sequence, type_byte).to_le_bytes());
}

/// Builds the encoded internal key used to position a read at `(user_key,
/// sequence)`: the first entry for `user_key` with sequence <= `sequence`.
pub fn lookup_key(user_key: &[u8], sequence: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TRAILER_SIZE);
    append_internal_key(&mut out, user_key, sequence, VALUE_TYPE_FOR_SEEK.as_u8());
    out
}

/// A borrowed view of an encoded internal key.
///
/// Parsing never fails for length >= 8; a trailer type byte outside the
/// known set is reported through [`ParsedInternalKey::value_type`] returning
/// `None`, which the compaction layer treats as a corrupt key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// The user-key prefix.
    pub user_key: &'a [u8],
    /// The 56-bit sequence number.
    pub sequence: u64,
    /// The raw trailer type byte (possibly corrupt).
    pub type_byte: u8,
}

impl<'a> ParsedInternalKey<'a> {
    /// Splits an encoded internal key. Returns `None` when the slice is too
    /// short to carry a trailer.
    pub fn parse(encoded: &'a [u8]) -> Option<Self> {
        if encoded.len() < INTERNAL_KEY_TRAILER_SIZE {
            return None;
        }
        let split = encoded.len() - INTERNAL_KEY_TRAILER_SIZE;
        let num = u64::from_le_bytes(encoded[split..].try_into().unwrap());
        Some(Self {
            user_key: &encoded[..split],
            sequence: num >> 8,
            type_byte: (num & 0xff) as u8,
        })
    }

    /// The decoded value type, or `None` for a corrupt trailer.
    pub fn value_type(&self) -> Option<ValueType> {
        ValueType::from_u8(self.type_byte)
    }

    /// Re-encodes this key with a different sequence number, preserving the
    /// raw type byte (corrupt keys keep their corrupt trailer).
    pub fn rewrite_sequence(&self, sequence: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + INTERNAL_KEY_TRAILER_SIZE);
        append_internal_key(&mut out, self.user_key, sequence, self.type_byte);
        out
    }
}

/// Extracts the user-key prefix of an encoded internal key.
pub fn extract_user_key(encoded: &[u8]) -> &[u8] {
    debug_assert!(encoded.len() >= INTERNAL_KEY_TRAILER_SIZE);
    &encoded[..encoded.len() - INTERNAL_KEY_TRAILER_SIZE]
}

/// Internal key used in the memtable.
///
/// Ordered by user key ascending (bytewise), then sequence descending, then
/// type descending, matching the encoded-key comparator with the default
/// user comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    user_key: Vec<u8>,
    sequence: u64,
    value_type: ValueType,
}

impl InternalKey {
    /// Creates a new InternalKey.
    pub fn new(user_key: Vec<u8>, sequence: u64, value_type: ValueType) -> Self {
        Self { user_key, sequence, value_type }
    }

    /// Returns the user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Encodes the InternalKey into bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + INTERNAL_KEY_TRAILER_SIZE);
        append_internal_key(&mut buf, &self.user_key, self.sequence, self.value_type.as_u8());
        buf
    }

    /// Decodes an InternalKey from bytes. Returns `None` for short input or
    /// a corrupt type byte.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let parsed = ParsedInternalKey::parse(data)?;
        let value_type = parsed.value_type()?;
        Some(Self { user_key: parsed.user_key.to_vec(), sequence: parsed.sequence, value_type })
    }

    /// Returns the total encoded size of this InternalKey.
    pub fn encoded_size(&self) -> usize {
        self.user_key.len() + INTERNAL_KEY_TRAILER_SIZE
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => match other.sequence.cmp(&self.sequence) {
                Ordering::Equal => other.value_type.cmp(&self.value_type),
                ord => ord,
            },
            ord => ord,
        }
    }
}

/// Orders encoded internal keys: user keys by the wrapped user comparator,
/// ties by the packed trailer descending (newer entries first).
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Wraps a user comparator.
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        Self { user }
    }

    /// The wrapped user comparator.
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }

    fn trailer_num(encoded: &[u8]) -> u64 {
        let split = encoded.len() - INTERNAL_KEY_TRAILER_SIZE;
        u64::from_le_bytes(encoded[split..].try_into().unwrap())
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "stripekv.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert!(a.len() >= INTERNAL_KEY_TRAILER_SIZE);
        debug_assert!(b.len() >= INTERNAL_KEY_TRAILER_SIZE);
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => Self::trailer_num(b).cmp(&Self::trailer_num(a)),
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let tmp = self.user.find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len()
            && self.user.compare(user_start, &tmp) == Ordering::Less
        {
            // User key became shorter physically but larger logically; tack
            // on the earliest possible trailer for that user key.
            let mut sep = tmp;
            sep.extend_from_slice(
                &pack_sequence_and_type(MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK.as_u8()).to_le_bytes(),
            );
            debug_assert_eq!(self.compare(start, &sep), Ordering::Less);
            return sep;
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let tmp = self.user.find_short_successor(user_key);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            let mut succ = tmp;
            succ.extend_from_slice(
                &pack_sequence_and_type(MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK.as_u8()).to_le_bytes(),
            );
            debug_assert_eq!(self.compare(key, &succ), Ordering::Less);
            return succ;
        }
        key.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    #[test]
    fn test_value_type_conversion() {
        assert_eq!(ValueType::Deletion.as_u8(), 0);
        assert_eq!(ValueType::Value.as_u8(), 1);
        assert_eq!(ValueType::SingleDeletion.as_u8(), 2);

        assert_eq!(ValueType::from_u8(0), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_u8(1), Some(ValueType::Value));
        assert_eq!(ValueType::from_u8(2), Some(ValueType::SingleDeletion));
        assert_eq!(ValueType::from_u8(3), None);
    }

    #[test]
    fn test_internal_key_encode_decode() {
        let original = InternalKey::new(b"test_key".to_vec(), 12345, ValueType::Value);
        let encoded = original.encode();
        assert_eq!(encoded.len(), original.encoded_size());

        let decoded = InternalKey::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_parse_corrupt_type() {
        let mut encoded = InternalKey::new(b"k".to_vec(), 7, ValueType::Value).encode();
        let trailer_pos = encoded.len() - INTERNAL_KEY_TRAILER_SIZE;
        encoded[trailer_pos] = 0x7f; // stomp the type byte

        let parsed = ParsedInternalKey::parse(&encoded).unwrap();
        assert_eq!(parsed.user_key, b"k");
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.value_type(), None);
        assert!(InternalKey::decode(&encoded).is_none());
    }

    #[test]
    fn test_rewrite_sequence_preserves_type_byte() {
        let mut encoded = InternalKey::new(b"k".to_vec(), 9, ValueType::Value).encode();
        let trailer_pos = encoded.len() - INTERNAL_KEY_TRAILER_SIZE;
        encoded[trailer_pos] = 0x55;

        let parsed = ParsedInternalKey::parse(&encoded).unwrap();
        let rewritten = parsed.rewrite_sequence(0);
        let reparsed = ParsedInternalKey::parse(&rewritten).unwrap();
        assert_eq!(reparsed.sequence, 0);
        assert_eq!(reparsed.type_byte, 0x55);
    }

    #[test]
    fn test_internal_key_ordering() {
        let mut keys = [
            InternalKey::new(b"key2".to_vec(), 100, ValueType::Value),
            InternalKey::new(b"key1".to_vec(), 50, ValueType::Value),
            InternalKey::new(b"key1".to_vec(), 100, ValueType::Deletion),
            InternalKey::new(b"key1".to_vec(), 100, ValueType::Value),
            InternalKey::new(b"key1".to_vec(), 150, ValueType::Value),
        ];

        keys.sort();

        assert_eq!(keys[0].sequence(), 150);
        assert_eq!(keys[1].sequence(), 100);
        assert_eq!(keys[1].value_type(), ValueType::Value);
        assert_eq!(keys[2].sequence(), 100);
        assert_eq!(keys[2].value_type(), ValueType::Deletion);
        assert_eq!(keys[3].sequence(), 50);
        assert_eq!(keys[4].user_key(), b"key2");
    }

    #[test]
    fn test_encoded_comparator_matches_struct_order() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        let a = InternalKey::new(b"key1".to_vec(), 150, ValueType::Value);
        let b = InternalKey::new(b"key1".to_vec(), 100, ValueType::Value);
        let c = InternalKey::new(b"key2".to_vec(), 1, ValueType::Deletion);

        assert_eq!(icmp.compare(&a.encode(), &b.encode()), Ordering::Less);
        assert_eq!(icmp.compare(&b.encode(), &c.encode()), Ordering::Less);
        assert_eq!(icmp.compare(&a.encode(), &a.encode()), Ordering::Equal);
    }

    #[test]
    fn test_lookup_key_positions_before_snapshot() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let lk = lookup_key(b"key", 100);

        // Entries newer than the snapshot sort before the lookup key
        let newer = InternalKey::new(b"key".to_vec(), 150, ValueType::Value).encode();
        let visible = InternalKey::new(b"key".to_vec(), 100, ValueType::Value).encode();
        let older = InternalKey::new(b"key".to_vec(), 50, ValueType::Value).encode();

        assert_eq!(icmp.compare(&newer, &lk), Ordering::Less);
        assert_eq!(icmp.compare(&lk, &visible), Ordering::Less);
        assert_eq!(icmp.compare(&visible, &older), Ordering::Less);
    }

    #[test]
    fn test_internal_separator_shortens_user_key() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let start = InternalKey::new(b"abcd".to_vec(), 5, ValueType::Value).encode();
        let limit = InternalKey::new(b"abzz".to_vec(), 9, ValueType::Value).encode();

        let sep = icmp.find_shortest_separator(&start, &limit);
        assert!(sep.len() < start.len());
        assert_eq!(icmp.compare(&start, &sep), Ordering::Less);
        assert_eq!(icmp.compare(&sep, &limit), Ordering::Less);
        assert_eq!(extract_user_key(&sep), b"abd");
    }
}
