//! Per-table bloom filter over user-key hashes.
//!
//! Point lookups hash the user key once ([`crate::format::hash_user_key`])
//! and probe every candidate table with that hash, so L0 scans skip tables
//! cheaply. Probe positions are derived from the single 64-bit hash by
//! rotation, which keeps insertion and lookup allocation-free.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const BITS_PER_KEY: usize = 10;

pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Build a filter from precomputed user-key hashes.
    pub fn from_hashes(hashes: &[u64]) -> Self {
        let n = hashes.len().max(1);
        let m = ((n * BITS_PER_KEY) as u64).max(64);
        // k = (m/n) * ln(2), clamped to a sane probe count.
        let k = ((m as f64 / n as f64) * std::f64::consts::LN_2).round() as u32;
        let k = k.clamp(1, 30);

        let mut filter = Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k,
        };
        for &h in hashes {
            filter.insert_hash(h);
        }
        filter
    }

    fn insert_hash(&mut self, mut h: u64) {
        let delta = h.rotate_left(17);
        for _ in 0..self.num_hashes {
            let idx = h % self.num_bits;
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
            h = h.wrapping_add(delta);
        }
    }

    /// `false` means the key is definitely absent from the table.
    pub fn may_contain_hash(&self, mut h: u64) -> bool {
        if self.num_bits == 0 {
            return true;
        }
        let delta = h.rotate_left(17);
        for _ in 0..self.num_hashes {
            let idx = h % self.num_bits;
            if self.bits[(idx / 8) as usize] & (1 << (idx % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<BigEndian>(self.num_bits)?;
        w.write_u32::<BigEndian>(self.num_hashes)?;
        w.write_u32::<BigEndian>(self.bits.len() as u32)?;
        w.write_all(&self.bits)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let num_bits = r.read_u64::<BigEndian>()?;
        let num_hashes = r.read_u32::<BigEndian>()?;
        let len = r.read_u32::<BigEndian>()? as usize;

        const MAX_BLOOM_BYTES: usize = 128 * 1024 * 1024;
        if len > MAX_BLOOM_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter too large: {len} bytes"),
            ));
        }

        let mut bits = vec![0u8; len];
        r.read_exact(&mut bits)?;
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    pub fn serialized_size(&self) -> usize {
        8 + 4 + 4 + self.bits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::hash_user_key;

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..500).map(|i| format!("key_{i:04}").into_bytes()).collect();
        let hashes: Vec<u64> = keys.iter().map(|k| hash_user_key(k)).collect();
        let filter = BloomFilter::from_hashes(&hashes);

        for k in &keys {
            assert!(filter.may_contain_hash(hash_user_key(k)));
        }
    }

    #[test]
    fn test_filters_most_absent_keys() {
        let hashes: Vec<u64> = (0..500)
            .map(|i| hash_user_key(format!("key_{i:04}").as_bytes()))
            .collect();
        let filter = BloomFilter::from_hashes(&hashes);

        let false_positives = (0..500)
            .filter(|i| filter.may_contain_hash(hash_user_key(format!("other_{i:04}").as_bytes())))
            .count();
        // 10 bits per key gives roughly a 1% false-positive rate; leave slack.
        assert!(false_positives < 50, "false positives: {false_positives}");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let hashes: Vec<u64> = (0..100).map(|i| hash_user_key(&[i as u8])).collect();
        let filter = BloomFilter::from_hashes(&hashes);

        let mut buf = Vec::new();
        filter.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), filter.serialized_size());

        let decoded = BloomFilter::read_from(&mut buf.as_slice()).unwrap();
        for &h in &hashes {
            assert!(decoded.may_contain_hash(h));
        }
    }

    #[test]
    fn test_empty_filter() {
        let filter = BloomFilter::from_hashes(&[]);
        let mut buf = Vec::new();
        filter.write_to(&mut buf).unwrap();
        BloomFilter::read_from(&mut buf.as_slice()).unwrap();
    }
}
