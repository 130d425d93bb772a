//! The in-memory index: a chained hash map from key bytes to the file
//! offset of that key's most recent record.
//!
//! Keys are owned `Vec<u8>` (at most 128 bytes); offsets are `i64`,
//! matching the signed `off_t` the original store used. The bucket array
//! length is always a power of two, `2^dimension`; `grow` doubles it and
//! rehashes every entry.

use std::io::{self, Read, Write};

use crate::error::IndexError;

const MAX_KEY_LEN: usize = 128;

/// sdbm: the hash the original C store used (`hash = c + (hash<<6) +
/// (hash<<16) - hash`, accumulated over each byte).
fn sdbm(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0;
    for &b in bytes {
        hash = (b as u64)
            .wrapping_add(hash.wrapping_shl(6))
            .wrapping_add(hash.wrapping_shl(16))
            .wrapping_sub(hash);
    }
    hash
}

type Bucket = Vec<(Vec<u8>, i64)>;

/// Chained hash map keyed by owned byte strings, serialisable to the
/// `.tb` sidecar format.
#[derive(Debug, Clone)]
pub struct Index {
    buckets: Vec<Bucket>,
    dimension: u32,
    count: u64,
    random_int: i64,
}

impl Index {
    /// `dimension=1`, two empty buckets, `count=0`. `random_int` is a
    /// per-map marker carried through serialisation only. It plays no
    /// cryptographic role.
    pub fn new() -> Self {
        Index {
            buckets: vec![Vec::new(), Vec::new()],
            dimension: 1,
            count: 0,
            random_int: sdbm(&std::process::id().to_le_bytes()) as i64,
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dimension(&self) -> u32 {
        self.dimension
    }

    fn capacity(&self) -> u64 {
        1u64 << self.dimension
    }

    fn bucket_index(&self, key: &[u8]) -> usize {
        (sdbm(key) % self.capacity()) as usize
    }

    /// Overwrite in place if `key` is already present; else grow the
    /// table if inserting would push `count` past `2^dimension`, then
    /// push the new entry. Keys and offsets are copied in and owned by
    /// the index.
    pub fn put(&mut self, key: &[u8], offset: i64) -> Result<(), IndexError> {
        let idx = self.bucket_index(key);
        if let Some(entry) = self.buckets[idx].iter_mut().find(|(k, _)| k == key) {
            entry.1 = offset;
            return Ok(());
        }

        if self.count + 1 > self.capacity() {
            self.grow();
        }

        let idx = self.bucket_index(key);
        self.buckets[idx].push((key.to_vec(), offset));
        self.count += 1;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<i64> {
        let idx = self.bucket_index(key);
        self.buckets[idx]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, off)| *off)
    }

    /// Double the bucket array and rehash every entry. An atomic
    /// replacement in spirit: the new array is fully built before it
    /// replaces the old one, so a mid-grow panic never leaves the index
    /// half-migrated (Rust's allocator aborts the process on OOM rather
    /// than returning a recoverable error, so there is no partial-failure
    /// path to guard against here).
    fn grow(&mut self) {
        let new_dimension = self.dimension + 1;
        let new_capacity = 1usize << new_dimension;
        let mut new_buckets: Vec<Bucket> = (0..new_capacity).map(|_| Vec::new()).collect();

        for bucket in self.buckets.drain(..) {
            for (key, offset) in bucket {
                let idx = (sdbm(&key) % (new_capacity as u64)) as usize;
                new_buckets[idx].push((key, offset));
            }
        }

        self.buckets = new_buckets;
        self.dimension = new_dimension;
    }

    /// Serialise: map header (`dimension: u32`, `count: u64`,
    /// `random_int: i64`, all little-endian), then for each bucket in
    /// order a chain header (`u64` length) followed by `(key_len: u64,
    /// key_bytes, offset: i64)` entries. No padding.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.dimension.to_le_bytes())?;
        w.write_all(&self.count.to_le_bytes())?;
        w.write_all(&self.random_int.to_le_bytes())?;

        for bucket in &self.buckets {
            w.write_all(&(bucket.len() as u64).to_le_bytes())?;
            for (key, offset) in bucket {
                w.write_all(&(key.len() as u64).to_le_bytes())?;
                w.write_all(key)?;
                w.write_all(&offset.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Inverse of `write`. Rejects a short read or a `count` that's
    /// inconsistent with `dimension` (`count < 2^(dimension-1)`), a
    /// sanity check against a silently truncated sidecar.
    pub fn read<R: Read>(r: &mut R) -> Result<Self, IndexError> {
        let dimension = read_u32(r)?;
        let count = read_u64(r)?;
        let random_int = read_i64(r)?;

        if dimension >= 1 && count < (1u64 << (dimension - 1)) {
            return Err(IndexError::Corrupt { count, dimension });
        }

        let capacity = 1usize << dimension;
        let mut buckets: Vec<Bucket> = Vec::with_capacity(capacity);
        let mut total = 0u64;

        for _ in 0..capacity {
            let chain_len = read_u64(r)?;
            let mut chain = Vec::with_capacity(chain_len as usize);
            for _ in 0..chain_len {
                let key_len = read_u64(r)? as usize;
                let mut key = vec![0u8; key_len];
                r.read_exact(&mut key).map_err(|_| IndexError::ShortRead)?;
                let offset = read_i64(r)?;
                chain.push((key, offset));
                total += 1;
            }
            buckets.push(chain);
        }

        if total != count {
            return Err(IndexError::Corrupt { count, dimension });
        }

        Ok(Index {
            buckets,
            dimension,
            count,
            random_int,
        })
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Index {
    /// Equality ignores `random_int` and bucket layout, comparing only
    /// the logical key to offset mapping. Useful in tests that reload a
    /// persisted index and expect the same entries back, possibly after
    /// a different growth history.
    fn eq(&self, other: &Self) -> bool {
        if self.count != other.count {
            return false;
        }
        let mut mine: Vec<_> = self.buckets.iter().flatten().cloned().collect();
        let mut theirs: Vec<_> = other.buckets.iter().flatten().cloned().collect();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}

pub(crate) fn key_len_ok(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, IndexError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| IndexError::ShortRead)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, IndexError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|_| IndexError::ShortRead)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64, IndexError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|_| IndexError::ShortRead)?;
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let mut idx = Index::new();
        idx.put(b"hey", 0).unwrap();
        assert_eq!(idx.get(b"hey"), Some(0));
        assert_eq!(idx.get(b"missing"), None);
    }

    #[test]
    fn put_overwrites_in_place() {
        let mut idx = Index::new();
        idx.put(b"k", 10).unwrap();
        idx.put(b"k", 20).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get(b"k"), Some(20));
    }

    #[test]
    fn growth_invariant_holds_for_many_distinct_keys() {
        let mut idx = Index::new();
        for i in 0..500u32 {
            idx.put(format!("key-{i}").as_bytes(), i as i64).unwrap();
        }
        assert_eq!(idx.len(), 500);
        let capacity = 1u64 << idx.dimension();
        assert!(capacity / 2 <= idx.len() || idx.dimension() == 1);
        assert!(idx.len() <= capacity);
        for i in 0..500u32 {
            assert_eq!(idx.get(format!("key-{i}").as_bytes()), Some(i as i64));
        }
    }

    #[test]
    fn serialisation_roundtrip() {
        let mut idx = Index::new();
        for i in 0..64u32 {
            idx.put(format!("k{i}").as_bytes(), i as i64 * 7).unwrap();
        }

        let mut buf = Vec::new();
        idx.write(&mut buf).unwrap();

        let restored = Index::read(&mut &buf[..]).unwrap();
        assert_eq!(idx, restored);
    }

    #[test]
    fn read_rejects_truncated_count() {
        let mut idx = Index::new();
        for i in 0..20u32 {
            idx.put(format!("k{i}").as_bytes(), i as i64).unwrap();
        }

        let mut buf = Vec::new();
        idx.write(&mut buf).unwrap();
        // Corrupt the count field down to something inconsistent with
        // the serialised dimension.
        buf[4..12].copy_from_slice(&0u64.to_le_bytes());

        assert!(Index::read(&mut &buf[..]).is_err());
    }
}
