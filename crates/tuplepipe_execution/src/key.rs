//! Locating and ordering keys within tuples.
//!
//! The same extractor/comparator pair backs both ordering (sort) and
//! equivalence (aggregate grouping) decisions.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use tuplepipe_error::{plan_err, Result};

use crate::tuple::Tuple;

type DeriveFn = dyn Fn(&Tuple, &mut [u8]) -> Result<()> + Send + Sync;

/// Describes where a key lives within a tuple.
#[derive(Clone)]
pub enum KeyExtractor {
    /// Key is `len` raw bytes starting at `offset`.
    Range { offset: usize, len: usize },
    /// Key is computed from the tuple into a `len` byte buffer.
    Derived { len: usize, derive: Arc<DeriveFn> },
}

impl KeyExtractor {
    pub const fn range(offset: usize, len: usize) -> Self {
        KeyExtractor::Range { offset, len }
    }

    /// Zero length key. Every tuple shares the same key.
    pub const fn empty() -> Self {
        KeyExtractor::Range { offset: 0, len: 0 }
    }

    pub fn derived<F>(len: usize, derive: F) -> Self
    where
        F: Fn(&Tuple, &mut [u8]) -> Result<()> + Send + Sync + 'static,
    {
        KeyExtractor::Derived {
            len,
            derive: Arc::new(derive),
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            KeyExtractor::Range { len, .. } => *len,
            KeyExtractor::Derived { len, .. } => *len,
        }
    }

    /// Check the key fits inside tuples of `tuple_size` bytes.
    pub fn validate(&self, tuple_size: usize) -> Result<()> {
        if let KeyExtractor::Range { offset, len } = self {
            let fits = matches!(offset.checked_add(*len), Some(end) if end <= tuple_size);
            if !fits {
                return Err(plan_err!(
                    "key range {offset}..{} exceeds tuple size {tuple_size}",
                    offset.saturating_add(*len)
                ));
            }
        }
        Ok(())
    }

    /// Extract the key bytes, borrowing from the tuple when possible.
    pub fn extract<'a>(&self, tuple: &'a Tuple) -> Result<Cow<'a, [u8]>> {
        match self {
            KeyExtractor::Range { offset, len } => Ok(Cow::Borrowed(tuple.bytes(*offset, *len)?)),
            KeyExtractor::Derived { len, derive } => {
                let mut buf = vec![0; *len];
                derive(tuple, &mut buf)?;
                Ok(Cow::Owned(buf))
            }
        }
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExtractor::Range { offset, len } => f
                .debug_struct("Range")
                .field("offset", offset)
                .field("len", len)
                .finish(),
            KeyExtractor::Derived { len, .. } => {
                f.debug_struct("Derived").field("len", len).finish_non_exhaustive()
            }
        }
    }
}

/// Integer prefix of a key that orders consistently with the full key.
///
/// When two hints differ, the keys compare like the hints. When `exact` is
/// set on both, equal hints also mean equal keys and the full comparison can
/// be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHint {
    pub value: i64,
    pub exact: bool,
}

/// Total order over extracted keys.
pub trait KeyComparator: Send + Sync + fmt::Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn hint(&self, _key: &[u8]) -> Option<KeyHint> {
        None
    }
}

/// Compare two keys, consulting hints before the full comparison.
pub fn compare_keys(cmp: &dyn KeyComparator, a: &[u8], b: &[u8]) -> Ordering {
    if let (Some(ha), Some(hb)) = (cmp.hint(a), cmp.hint(b)) {
        match ha.value.cmp(&hb.value) {
            Ordering::Equal if ha.exact && hb.exact => return Ordering::Equal,
            Ordering::Equal => (),
            other => return other,
        }
    }
    cmp.compare(a, b)
}

/// Lexicographic byte order. Hints on the first four bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesComparator;

impl KeyComparator for BytesComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn hint(&self, key: &[u8]) -> Option<KeyHint> {
        let mut prefix = [0u8; 4];
        let n = key.len().min(4);
        prefix[..n].copy_from_slice(&key[..n]);
        Some(KeyHint {
            value: u32::from_be_bytes(prefix) as i64,
            exact: key.len() == 4,
        })
    }
}

macro_rules! int_comparator {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Orders little-endian `", stringify!($ty), "` keys.")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name {
            pub descending: bool,
        }

        impl $name {
            pub const fn asc() -> Self {
                $name { descending: false }
            }

            pub const fn desc() -> Self {
                $name { descending: true }
            }

            fn decode(key: &[u8]) -> Option<$ty> {
                key.get(..std::mem::size_of::<$ty>())
                    .and_then(|b| b.try_into().ok())
                    .map(<$ty>::from_le_bytes)
            }
        }

        impl KeyComparator for $name {
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                let ord = match (Self::decode(a), Self::decode(b)) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    _ => a.cmp(b),
                };
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }

            fn hint(&self, key: &[u8]) -> Option<KeyHint> {
                let v = Self::decode(key)? as i64;
                Some(KeyHint {
                    value: if self.descending { !v } else { v },
                    exact: key.len() == std::mem::size_of::<$ty>(),
                })
            }
        }
    };
}

int_comparator!(Int32Comparator, i32);
int_comparator!(Int64Comparator, i64);

/// Orders little-endian `f64` keys using a total order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Float64Comparator {
    pub descending: bool,
}

impl Float64Comparator {
    pub const fn asc() -> Self {
        Float64Comparator { descending: false }
    }

    pub const fn desc() -> Self {
        Float64Comparator { descending: true }
    }
}

impl KeyComparator for Float64Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let decode = |k: &[u8]| -> Option<f64> {
            k.get(..8).and_then(|b| b.try_into().ok()).map(f64::from_le_bytes)
        };
        let ord = match (decode(a), decode(b)) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            _ => a.cmp(b),
        };
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_extract_borrows() {
        let t = Tuple::from_bytes(vec![1, 2, 3, 4, 5]);
        let key = KeyExtractor::range(1, 3).extract(&t).unwrap();
        assert!(matches!(key, Cow::Borrowed(_)));
        assert_eq!(&[2u8, 3, 4], key.as_ref());
    }

    #[test]
    fn validate_key_range() {
        KeyExtractor::range(4, 4).validate(8).unwrap();
        KeyExtractor::empty().validate(8).unwrap();
        assert!(KeyExtractor::range(6, 4).validate(8).is_err());
        assert!(KeyExtractor::range(usize::MAX, 2).validate(8).is_err());
    }

    #[test]
    fn derived_key() {
        // Key is the sum of two i32 fields.
        let ext = KeyExtractor::derived(4, |t, out| {
            let sum = t.read_i32(0)? + t.read_i32(4)?;
            out.copy_from_slice(&sum.to_le_bytes());
            Ok(())
        });
        let mut t = Tuple::zeroed(8);
        t.write_i32(0, 2).unwrap();
        t.write_i32(4, 40).unwrap();
        assert_eq!(42i32.to_le_bytes().as_slice(), ext.extract(&t).unwrap().as_ref());
    }

    #[test]
    fn int_comparator_directions() {
        let a = (-5i32).to_le_bytes();
        let b = 3i32.to_le_bytes();
        assert_eq!(Ordering::Less, Int32Comparator::asc().compare(&a, &b));
        assert_eq!(Ordering::Greater, Int32Comparator::desc().compare(&a, &b));
        assert_eq!(
            Ordering::Greater,
            compare_keys(&Int32Comparator::desc(), &a, &b)
        );
    }

    #[test]
    fn hint_agrees_with_compare() {
        let cmp = BytesComparator;
        let keys: [&[u8]; 4] = [b"abcd", b"abce", b"abcdz", b"ab"];
        for a in keys {
            for b in keys {
                assert_eq!(cmp.compare(a, b), compare_keys(&cmp, a, b), "{a:?} {b:?}");
            }
        }
    }

    #[test]
    fn float_total_order() {
        let a = (-0.5f64).to_le_bytes();
        let b = 2.0f64.to_le_bytes();
        assert_eq!(Ordering::Less, Float64Comparator::asc().compare(&a, &b));
        assert_eq!(Ordering::Equal, Float64Comparator::asc().compare(&b, &b));
    }
}
