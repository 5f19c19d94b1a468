//! Block cache key and value types and their wire encodings.
//!
//! A key is `(ns_addr, block_id)` and always serializes to 12 big-endian
//! bytes. A value is the list of data servers that host the block and
//! serializes as a big-endian `u32` count followed by that many `u64`s.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::error::CacheError;
use crate::serialize::{Reader, Writer};

/// Size of a serialized [`BlockCacheKey`].
pub const KEY_SIZE: usize = 12;

/// Size of the count prefix of a serialized [`BlockCacheValue`].
pub const VALUE_BASE_SIZE: usize = 4;

/// Identifies a block inside a given name server cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockCacheKey {
    /// Packed address of the name server that owns the block.
    pub ns_addr: u64,
    pub block_id: u32,
}

impl BlockCacheKey {
    pub fn new(ns_addr: u64, block_id: u32) -> Self {
        Self { ns_addr, block_id }
    }

    /// Serialize into the fixed 12-byte form.
    pub fn encode(&self) -> [u8; KEY_SIZE] {
        let mut out = [0u8; KEY_SIZE];
        let mut w = Writer::new(&mut out);
        // The array is exactly KEY_SIZE, these cannot run short.
        let _ = w.write_u64(self.ns_addr);
        let _ = w.write_u32(self.block_id);
        out
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.encode())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CacheError> {
        if buf.len() != KEY_SIZE {
            return Err(CacheError::InvalidArgument("block cache key must be 12 bytes"));
        }
        let mut r = Reader::new(buf);
        let ns_addr = r.read_u64()?;
        let block_id = r.read_u32()?;
        Ok(Self { ns_addr, block_id })
    }
}

impl fmt::Display for BlockCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}", self.ns_addr, self.block_id)
    }
}

/// Total order over keys: name server address first, then block id.
pub fn cmp(left: &BlockCacheKey, right: &BlockCacheKey) -> Ordering {
    left.ns_addr
        .cmp(&right.ns_addr)
        .then_with(|| left.block_id.cmp(&right.block_id))
}

impl Ord for BlockCacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp(self, other)
    }
}

impl PartialOrd for BlockCacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(Ord::cmp(self, other))
    }
}

/// Data servers currently hosting a block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockCacheValue {
    pub ds_addrs: Vec<u64>,
}

impl BlockCacheValue {
    pub fn new(ds_addrs: Vec<u64>) -> Self {
        Self { ds_addrs }
    }

    pub fn ds_count(&self) -> u32 {
        self.ds_addrs.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.ds_addrs.is_empty()
    }

    /// Length of the serialized form.
    pub fn encoded_len(&self) -> usize {
        VALUE_BASE_SIZE + self.ds_addrs.len() * 8
    }

    pub fn encode(&self) -> Result<Bytes, CacheError> {
        let mut buf = vec![0u8; self.encoded_len()];
        let mut w = Writer::new(&mut buf);
        w.write_u32(self.ds_count())?;
        for addr in &self.ds_addrs {
            w.write_u64(*addr)?;
        }
        Ok(Bytes::from(buf))
    }

    /// Decode a count-prefixed value. The buffer length must match the count exactly.
    pub fn decode(buf: &[u8]) -> Result<Self, CacheError> {
        let mut r = Reader::new(buf);
        let count = r.read_u32()?;
        let expected = VALUE_BASE_SIZE as u64 + u64::from(count) * 8;
        if expected != buf.len() as u64 {
            return Err(CacheError::CorruptEntry {
                expected: expected as usize,
                actual: buf.len(),
            });
        }
        let ds_addrs = (0..count)
            .map(|_| r.read_u64())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ds_addrs })
    }
}

/// A key together with the value found for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCacheKv {
    pub key: BlockCacheKey,
    pub value: BlockCacheValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let key = BlockCacheKey::new(0x0102_0304_0506_0708, 0x0a0b_0c0d);
        assert_eq!(
            key.encode(),
            [1, 2, 3, 4, 5, 6, 7, 8, 0x0a, 0x0b, 0x0c, 0x0d]
        );
        assert_eq!(BlockCacheKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_key_decode_wrong_size() {
        assert!(matches!(
            BlockCacheKey::decode(&[0u8; 11]),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cmp_orders_by_ns_then_block() {
        let a = BlockCacheKey::new(1, 100);
        let b = BlockCacheKey::new(1, 200);
        let c = BlockCacheKey::new(2, 0);
        assert_eq!(cmp(&a, &b), Ordering::Less);
        assert_eq!(cmp(&b, &c), Ordering::Less);
        assert_eq!(cmp(&c, &a), Ordering::Greater);
        assert_eq!(cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_value_layout() {
        let value = BlockCacheValue::new(vec![0xAAAA, 0xBBBB]);
        let bytes = value.encode().unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
        assert_eq!(&bytes[4..12], &0xAAAAu64.to_be_bytes());
        assert_eq!(BlockCacheValue::decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_value_decode_count_mismatch() {
        let mut bytes = BlockCacheValue::new(vec![1, 2, 3]).encode().unwrap().to_vec();
        bytes.truncate(20);
        assert!(matches!(
            BlockCacheValue::decode(&bytes),
            Err(CacheError::CorruptEntry { expected: 28, actual: 20 })
        ));
    }

    #[test]
    fn test_value_decode_short_prefix() {
        assert!(matches!(
            BlockCacheValue::decode(&[0, 0]),
            Err(CacheError::Serialize(_))
        ));
    }
}
