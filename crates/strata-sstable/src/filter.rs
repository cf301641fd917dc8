use std::sync::Arc;


/// Shared handle to a filter policy.
pub type FilterPolicyRef = Arc<dyn FilterPolicy>;

/// A pluggable policy for building per-block key filters.
///
/// The policy's [`name`] is written into the table's meta-index block; a
/// reader that does not recognize the stored name skips the filter and
/// probes blocks directly.
///
/// [`name`]: FilterPolicy::name
pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append a filter for the given keys to `filter`.
    ///
    /// The keys are provided flattened: `key_offsets[i]` is the start of key
    /// `i` within `flattened_keys`, and keys are contiguous. Existing bytes
    /// of `filter` must be left untouched.
    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>);

    /// Whether `key` may have been among the keys `filter` was built from.
    ///
    /// False positives are allowed; false negatives are not.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// The hash the bloom filter double-hashes from; fixed by the file format.
fn bloom_hash(data: &[u8]) -> u32 {
    let seed: u32 = 0x_bc9f_1d34;
    let multiplier: u32 = 0x_c6a4_a793;

    let mut hash: u32 = seed ^ (data.len() as u32).wrapping_mul(multiplier);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        hash = hash.wrapping_add(word).wrapping_mul(multiplier);
        hash ^= hash >> 16;
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        for (index, &byte) in remainder.iter().enumerate() {
            hash = hash.wrapping_add(u32::from(byte) << (8 * index));
        }
        hash = hash.wrapping_mul(multiplier);
        // 24, not 16; the tail mixes differently from whole words.
        hash ^= hash >> 24;
    }

    hash
}

/// A bloom filter sized for a configured number of bits per key.
///
/// The default of 10 bits per key gives a false-positive rate just under 1%.
#[derive(Debug, Clone, Copy)]
pub struct BloomFilterPolicy {
    bits_per_key:       u8,
    /// The classic `k`: how many bits each key sets and probes.
    num_hash_functions: u8,
}

impl BloomFilterPolicy {
    #[must_use]
    pub fn new(bits_per_key: u8) -> Self {
        // k = bits_per_key * ln(2), clamped to 1..=30; ids above 30 are
        // reserved for future filter encodings.
        let num_hash_functions = (f32::from(bits_per_key) * std::f32::consts::LN_2).round() as u8;
        Self {
            bits_per_key,
            num_hash_functions: num_hash_functions.clamp(1, 30),
        }
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    #[inline]
    fn name(&self) -> &'static str {
        "leveldb.BuiltinBloomFilter2"
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        // At least 64 bits, else a tiny block would produce a filter with a
        // high false-positive rate.
        let num_bits = (key_offsets.len() * usize::from(self.bits_per_key)).max(64);
        let num_bytes = num_bits.div_ceil(8);
        let num_bits = (num_bytes * 8) as u32;

        let filter_start = filter.len();
        filter.resize(filter_start + num_bytes, 0);
        filter.push(self.num_hash_functions);

        let filter_bits = &mut filter[filter_start..filter_start + num_bytes];

        for (index, &key_start) in key_offsets.iter().enumerate() {
            let key_end = key_offsets
                .get(index + 1)
                .copied()
                .unwrap_or(flattened_keys.len());
            let key = &flattened_keys[key_start..key_end];

            let mut hash = bloom_hash(key);
            let delta = hash.rotate_right(17);
            for _ in 0..self.num_hash_functions {
                let bit = (hash % num_bits) as usize;
                filter_bits[bit / 8] |= 1 << (bit % 8);
                hash = hash.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }

        let num_hash_functions = *filter.last().unwrap();
        if num_hash_functions > 30 {
            // Reserved for future encodings; err on the side of a probe.
            return true;
        }

        let filter_bits = &filter[..filter.len() - 1];
        let num_bits = (filter_bits.len() * 8) as u32;

        let mut hash = bloom_hash(key);
        let delta = hash.rotate_right(17);
        for _ in 0..num_hash_functions {
            let bit = (hash % num_bits) as usize;
            if filter_bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            hash = hash.wrapping_add(delta);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    fn build_filter(policy: &BloomFilterPolicy, keys: &[&[u8]]) -> Vec<u8> {
        let mut flattened = Vec::new();
        let mut offsets = Vec::new();
        for key in keys {
            offsets.push(flattened.len());
            flattened.extend(*key);
        }

        let mut filter = Vec::new();
        policy.create_filter(&flattened, &offsets, &mut filter);
        filter
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let policy = BloomFilterPolicy::default();
        let filter = build_filter(&policy, &[]);

        // Even an empty key set produces the 64-bit minimum plus the k byte.
        assert_eq!(filter.len(), 9);
        assert!(!policy.key_may_match(b"anything", &filter));
        assert!(!policy.key_may_match(b"", &filter));
    }

    #[test]
    fn no_false_negatives() {
        let policy = BloomFilterPolicy::default();
        let keys: Vec<Vec<u8>> = (0_u32..1000).map(|n| n.to_le_bytes().to_vec()).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let filter = build_filter(&policy, &key_refs);

        for key in &keys {
            assert!(policy.key_may_match(key, &filter), "false negative for {key:?}");
        }
    }

    #[test]
    fn false_positive_rate_is_reasonable() {
        let policy = BloomFilterPolicy::default();
        let keys: Vec<Vec<u8>> = (0_u32..10_000).map(|n| n.to_le_bytes().to_vec()).collect();
        let key_refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let filter = build_filter(&policy, &key_refs);

        let false_positives = (10_000_u32..20_000)
            .filter(|n| policy.key_may_match(&n.to_le_bytes(), &filter))
            .count();

        // 10 bits/key targets just under 1%; 2% leaves slack for variance.
        assert!(false_positives < 200, "{false_positives} false positives out of 10000");
    }

    #[test]
    fn k_is_clamped() {
        assert!(BloomFilterPolicy::new(0).key_may_match(b"", &[0xff, 1]));
        let _ = BloomFilterPolicy::new(200);
    }
}
