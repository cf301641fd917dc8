use std::cmp::Ordering;
use std::sync::Arc;


/// Shared handle to a comparator, as stored in tables and iterators.
pub type ComparatorRef = Arc<dyn TableComparator>;

/// A total order over keys, plus the two key-shortening operations used to
/// shrink index entries. Both shortening operations may be implemented as
/// identity without affecting correctness.
pub trait TableComparator: Send + Sync {
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;

    /// Write into `separator` some key `s` with `from <= s < to`.
    ///
    /// Callers guarantee `from < to` and pass an empty `separator` buffer.
    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>);

    /// Write into `successor` some key `s >= key`.
    ///
    /// Callers pass an empty `successor` buffer.
    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>);
}

/// Lexicographic unsigned-byte ordering, the default key order.
#[derive(Default, Debug, Clone, Copy)]
pub struct BytewiseComparator;

/// Length of the longest common prefix of two byte slices.
pub(crate) fn common_prefix_len(lhs: &[u8], rhs: &[u8]) -> usize {
    lhs.iter().zip(rhs).take_while(|(a, b)| a == b).count()
}

impl TableComparator for BytewiseComparator {
    #[inline]
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        lhs.cmp(rhs)
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], separator: &mut Vec<u8>) {
        let common_len = common_prefix_len(from, to);

        if common_len >= from.len().min(to.len()) {
            // One key is a prefix of the other; `from` is already as short
            // as a separator can get.
            separator.extend(from);
            return;
        }

        let next_byte = from[common_len];
        if next_byte < 0xff && next_byte + 1 < to[common_len] {
            // Bumping the first differing byte stays below `to`.
            separator.extend(&from[..=common_len]);
            *separator.last_mut().unwrap() = next_byte + 1;
            debug_assert!(self.cmp(separator, to) == Ordering::Less);
        } else {
            separator.extend(from);
        }
    }

    fn find_short_successor(&self, key: &[u8], successor: &mut Vec<u8>) {
        // Bump the first byte that can be bumped, dropping the tail.
        for (index, &byte) in key.iter().enumerate() {
            if byte != 0xff {
                successor.extend(&key[..=index]);
                *successor.last_mut().unwrap() = byte + 1;
                return;
            }
        }
        // All 0xff (or empty): the key is its own shortest successor.
        successor.extend(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    fn separator(from: &[u8], to: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        BytewiseComparator.find_short_separator(from, to, &mut out);
        assert!(BytewiseComparator.cmp(from, &out) != Ordering::Greater);
        assert!(BytewiseComparator.cmp(&out, to) == Ordering::Less);
        out
    }

    fn successor(key: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        BytewiseComparator.find_short_successor(key, &mut out);
        assert!(BytewiseComparator.cmp(key, &out) != Ordering::Greater);
        out
    }

    #[test]
    fn separator_shortens_where_possible() {
        assert_eq!(separator(b"abcdefghij", b"abzzz"), b"abd");
        assert_eq!(separator(b"helloworld", b"hellozoomer"), b"hellox");
        // Adjacent differing bytes cannot shorten.
        assert_eq!(separator(b"abc1", b"abc2"), b"abc1");
        // Prefix relationship cannot shorten.
        assert_eq!(separator(b"abc", b"abcd"), b"abc");
        // 0xff run in `from`.
        assert_eq!(separator(b"a\xff\xff1", b"b"), b"a\xff\xff1");
    }

    #[test]
    fn successor_bumps_first_bumpable_byte() {
        assert_eq!(successor(b"abc"), b"b");
        assert_eq!(successor(b"\xff\xffabc"), b"\xff\xffb");
        assert_eq!(successor(b"\xff\xff"), b"\xff\xff");
        assert_eq!(successor(b""), b"");
    }
}
