//! The segment store: an append-only log file plus its in-memory index.
//! A `Segment` owns one open file descriptor; all reads and writes
//! against it go through `get`/`put`, which are the only methods that
//! touch the fd.

use std::fs::{self, File, OpenOptions};
use std::io::{IoSlice, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ConnectError, GetError, InitError, LoadIndexError, PersistError, PutError};
use crate::index::{key_len_ok, Index};

/// Stored little-endian on disk regardless of host endianness, so
/// segment files are portable across machines.
pub const MAGIC: u32 = 0x123F_FABC;

const SHA256_LEN: usize = 32;

/// One append-only segment file and its index.
pub struct Segment {
    path: PathBuf,
    file: File,
    index: Index,
}

impl Segment {
    /// Create-or-truncate the file and write the 4-byte magic header.
    pub fn init(path: &Path) -> Result<(), InitError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| InitError::IOErrorAtPath {
                path: path.to_path_buf(),
                source: e,
            })?;
        file.write_all(&MAGIC.to_le_bytes())
            .map_err(|e| InitError::IOErrorAtPath {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(())
    }

    /// Open an existing segment file, verify its magic header, and load
    /// its index from the `.tb` sidecar if one is present and valid;
    /// otherwise start with an empty index (the caller may then choose
    /// to rebuild it by scanning, see `rebuild_index`).
    pub fn connect(path: &Path) -> Result<Segment, ConnectError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .append(true)
            .open(path)
            .map_err(|e| ConnectError::IOErrorAtPath {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut magic_buf = [0u8; 4];
        file.read_exact(&mut magic_buf)
            .map_err(|_| ConnectError::BadMagic)?;
        if u32::from_le_bytes(magic_buf) != MAGIC {
            return Err(ConnectError::BadMagic);
        }

        let sidecar = Self::sidecar_path_of(path);
        let index = if sidecar.exists() {
            load_index_file(&sidecar).unwrap_or_else(|e| {
                log::warn!("discarding sidecar for {}: {e}", path.display());
                Index::new()
            })
        } else {
            Index::new()
        };

        Ok(Segment {
            path: path.to_path_buf(),
            file,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar_path_of(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(".tb");
        PathBuf::from(os)
    }

    /// True iff the next `put` would push the segment's on-disk size
    /// past `max_size`.
    pub fn is_full(&self, max_size: u64) -> Result<bool, std::io::Error> {
        Ok(self.file.metadata()?.len() >= max_size)
    }

    /// Append `key_len | key_bytes(NUL-terminated) | value_len |
    /// value_bytes` as one vectored write, then record the record's
    /// starting offset under `key` in the index. The index is only
    /// updated after the write completes.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), PutError> {
        if !key_len_ok(key) {
            return Err(PutError::KeyExceedsMaxSize);
        }

        let offset = self.file.seek(SeekFrom::End(0))?;

        let mut key_bytes = Vec::with_capacity(key.len() + 1);
        key_bytes.extend_from_slice(key);
        key_bytes.push(0);
        let key_len = (key_bytes.len() as u64).to_le_bytes();
        let value_len = (value.len() as u64).to_le_bytes();

        let mut iov = [
            IoSlice::new(&key_len),
            IoSlice::new(&key_bytes),
            IoSlice::new(&value_len),
            IoSlice::new(value),
        ];
        write_all_vectored(&mut self.file, &mut iov)?;

        self.index.put(key, offset as i64)?;
        Ok(())
    }

    /// Look up `key` in the index; read the record at the recorded
    /// offset and verify the on-disk key still matches before returning
    /// the value.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, GetError> {
        let offset = self.index.get(key).ok_or(GetError::KeyNotFound)?;
        let offset = offset as u64;

        let mut key_len_buf = [0u8; 8];
        self.file.read_exact_at(&mut key_len_buf, offset)?;
        let key_len = u64::from_le_bytes(key_len_buf) as usize;

        let mut on_disk_key = vec![0u8; key_len];
        self.file.read_exact_at(&mut on_disk_key, offset + 8)?;

        // Stored keys carry a trailing NUL that isn't part of the
        // logical key the client sent.
        if on_disk_key.last() != Some(&0) || &on_disk_key[..on_disk_key.len() - 1] != key {
            return Err(GetError::KeyNotFoundOnDisk);
        }

        let value_len_offset = offset + 8 + key_len as u64;
        let mut value_len_buf = [0u8; 8];
        self.file.read_exact_at(&mut value_len_buf, value_len_offset)?;
        let value_len = u64::from_le_bytes(value_len_buf) as usize;

        let mut value = vec![0u8; value_len];
        self.file.read_exact_at(&mut value, value_len_offset + 8)?;
        Ok(value)
    }

    /// Write the serialised index to `<path>.tb` followed by the
    /// SHA-256 of the preceding bytes, via a temp-file-then-rename so a
    /// crash mid-write leaves the previous sidecar in place.
    pub fn persist_index(&self) -> Result<(), PersistError> {
        let sidecar = Self::sidecar_path_of(&self.path);
        let tmp = {
            let mut os = sidecar.as_os_str().to_owned();
            os.push(".tmp");
            PathBuf::from(os)
        };

        let mut buf = Vec::new();
        self.index.write(&mut buf)?;
        let hash = Sha256::digest(&buf);

        {
            let mut f = File::create(&tmp)?;
            f.write_all(&buf)?;
            f.write_all(&hash)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &sidecar)?;
        Ok(())
    }

    /// Reload the index from the `.tb` sidecar, failing with
    /// `Checksum` if the trailing SHA-256 doesn't match. Callers treat
    /// failure as "no usable sidecar, start empty".
    pub fn load_index(&mut self) -> Result<(), LoadIndexError> {
        let sidecar = Self::sidecar_path_of(&self.path);
        self.index = load_index_file(&sidecar)?;
        Ok(())
    }

    /// Rebuild the index by scanning every record in the log from the
    /// start, used when no sidecar is usable at all.
    pub fn rebuild_index(&mut self) -> Result<(), std::io::Error> {
        let len = self.file.metadata()?.len();
        let mut index = Index::new();
        let mut offset = 4u64; // past the magic header

        while offset < len {
            let mut key_len_buf = [0u8; 8];
            self.file.read_exact_at(&mut key_len_buf, offset)?;
            let key_len = u64::from_le_bytes(key_len_buf) as usize;

            let mut key_bytes = vec![0u8; key_len];
            self.file.read_exact_at(&mut key_bytes, offset + 8)?;

            let value_len_offset = offset + 8 + key_len as u64;
            let mut value_len_buf = [0u8; 8];
            self.file.read_exact_at(&mut value_len_buf, value_len_offset)?;
            let value_len = u64::from_le_bytes(value_len_buf);

            if key_bytes.last() == Some(&0) {
                let logical_key = &key_bytes[..key_bytes.len() - 1];
                let _ = index.put(logical_key, offset as i64);
            }

            offset = value_len_offset + 8 + value_len;
        }

        self.index = index;
        Ok(())
    }

    /// Drop the in-memory index without touching the file on disk.
    pub fn destroy_conn(&mut self) {
        self.index = Index::new();
    }

    /// Unlink the segment file and its `.tb` sidecar, if present.
    pub fn destroy(path: &Path) -> Result<(), std::io::Error> {
        let sidecar = {
            let mut os = path.as_os_str().to_owned();
            os.push(".tb");
            PathBuf::from(os)
        };
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match fs::remove_file(sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn load_index_file(sidecar: &Path) -> Result<Index, LoadIndexError> {
    let bytes = fs::read(sidecar)?;
    if bytes.len() < SHA256_LEN {
        return Err(LoadIndexError::Checksum);
    }
    let (body, trailer) = bytes.split_at(bytes.len() - SHA256_LEN);
    let expected = Sha256::digest(body);
    if expected.as_slice() != trailer {
        return Err(LoadIndexError::Checksum);
    }
    Ok(Index::read(&mut &body[..])?)
}

/// `Write::write_vectored` doesn't guarantee the whole buffer is
/// written in one call; retry until every slice is drained so the
/// record lands as a single logical append. In practice a regular file
/// accepts the whole `writev` in one syscall, but this does not assume it.
fn write_all_vectored(file: &mut File, bufs: &mut [IoSlice<'_>]) -> std::io::Result<()> {
    let mut bufs: &mut [IoSlice<'_>] = bufs;
    while !bufs.is_empty() {
        match file.write_vectored(bufs) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole record",
                ))
            }
            Ok(n) => IoSlice::advance_slices(&mut bufs, n),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_connect_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bit_db0");
        Segment::init(&path).unwrap();
        let mut seg = Segment::connect(&path).unwrap();

        seg.put(b"hey", b"bro\0").unwrap();
        assert_eq!(seg.get(b"hey").unwrap(), b"bro\0");
    }

    #[test]
    fn overwrite_keeps_latest_and_grows_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bit_db0");
        Segment::init(&path).unwrap();
        let mut seg = Segment::connect(&path).unwrap();

        seg.put(b"k", b"v1").unwrap();
        seg.put(b"k", b"v2").unwrap();
        assert_eq!(seg.get(b"k").unwrap(), b"v2");

        let expected = 4 + 2 * (8 + 2 + 8 + 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn get_on_fresh_segment_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bit_db0");
        Segment::init(&path).unwrap();
        let seg = Segment::connect(&path).unwrap();
        assert!(matches!(seg.get(b"nope"), Err(GetError::KeyNotFound)));
    }

    #[test]
    fn connect_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not-a-segment");
        fs::write(&path, b"nope").unwrap();
        assert!(matches!(Segment::connect(&path), Err(ConnectError::BadMagic)));
    }

    #[test]
    fn persist_and_reload_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bit_db0");
        Segment::init(&path).unwrap();
        let mut seg = Segment::connect(&path).unwrap();
        seg.put(b"k", b"v").unwrap();
        seg.persist_index().unwrap();

        let mut reloaded = Segment::connect(&path).unwrap();
        reloaded.load_index().unwrap();
        assert_eq!(reloaded.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn corrupt_sidecar_falls_back_to_empty_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bit_db0");
        Segment::init(&path).unwrap();
        let mut seg = Segment::connect(&path).unwrap();
        seg.put(b"k", b"v").unwrap();
        seg.persist_index().unwrap();

        let sidecar = Segment::sidecar_path_of(&path);
        let mut bytes = fs::read(&sidecar).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&sidecar, bytes).unwrap();

        let mut reloaded = Segment::connect(&path).unwrap();
        assert!(matches!(reloaded.load_index(), Err(LoadIndexError::Checksum)));
        assert!(matches!(reloaded.get(b"k"), Err(GetError::KeyNotFound)));
    }

    #[test]
    fn rebuild_index_recovers_without_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bit_db0");
        Segment::init(&path).unwrap();
        let mut seg = Segment::connect(&path).unwrap();
        seg.put(b"a", b"1").unwrap();
        seg.put(b"b", b"2").unwrap();
        drop(seg);

        let mut reloaded = Segment::connect(&path).unwrap();
        reloaded.rebuild_index().unwrap();
        assert_eq!(reloaded.get(b"a").unwrap(), b"1");
        assert_eq!(reloaded.get(b"b").unwrap(), b"2");
    }
}
