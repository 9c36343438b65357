//! Scrape bloom filters
//!
//! Size estimates from the 256-byte `BFpe`/`BFsd` filters some nodes attach to
//! `get_peers` responses (BEP 33).

/// Filter size in bytes
pub const BLOOM_BYTES: usize = 256;

const M: f64 = (BLOOM_BYTES * 8) as f64;
const K: f64 = 2.0;

/// Estimated number of distinct entries in a scrape filter.
///
/// Returns `None` when the filter does not have the expected size.
pub fn estimate_count(filter: &[u8]) -> Option<u64> {
    if filter.len() != BLOOM_BYTES {
        return None;
    }
    let zeros: u32 = filter.iter().map(|b| b.count_zeros()).sum();
    let c = (zeros as f64).clamp(1.0, M - 1.0);
    let n = (c / M).ln() / (K * (1.0 - 1.0 / M).ln());
    Some(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::sha1_digest;
    use std::net::Ipv4Addr;

    fn insert(filter: &mut [u8], ip: Ipv4Addr) {
        let hash = sha1_digest(&ip.octets());
        for pair in [[hash[0], hash[1]], [hash[2], hash[3]]] {
            let index = (u16::from_le_bytes(pair) as usize) % (BLOOM_BYTES * 8);
            filter[index / 8] |= 1 << (index % 8);
        }
    }

    #[test]
    fn test_empty_filter() {
        assert_eq!(estimate_count(&[0u8; BLOOM_BYTES]), Some(0));
    }

    #[test]
    fn test_wrong_size() {
        assert_eq!(estimate_count(&[0u8; 10]), None);
    }

    #[test]
    fn test_estimate_close_to_inserted() {
        let mut filter = [0u8; BLOOM_BYTES];
        for i in 0..100u8 {
            insert(&mut filter, Ipv4Addr::new(10, 0, 1, i));
        }
        let estimate = estimate_count(&filter).unwrap();
        assert!((80..=120).contains(&estimate), "estimate {} too far from 100", estimate);
    }

    #[test]
    fn test_full_filter_is_large() {
        assert!(estimate_count(&[0xff; BLOOM_BYTES]).unwrap() > 5000);
    }
}
