//! The segment registry: an ordered collection of open segments, with the
//! locking discipline that lets concurrent readers scan different
//! segments while writers are serialised against the active one.
//!
//! Two locks guard the registry itself:
//!
//! - `list_lock` guards the vector of segments (push during rotation,
//!   index access during a read scan).
//! - `rotate_lock` guards the "is the active segment full → create a new
//!   one" decision, and is held for the whole duration of a read scan so
//!   a rotation can't happen mid-scan.
//!
//! Each segment additionally carries its own lock, held while a reader or
//! writer dereferences that segment's fd and index, so concurrent access
//! to *other* segments is never blocked.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{GetError, RegistryError};
use crate::segment::Segment;

type SharedSegment = Arc<Mutex<Segment>>;

pub struct SegmentRegistry {
    dir: PathBuf,
    max_segment_size: u64,
    list_lock: Mutex<Vec<SharedSegment>>,
    rotate_lock: Mutex<()>,
}

impl SegmentRegistry {
    pub fn new(dir: PathBuf, max_segment_size: u64, segments: Vec<Segment>) -> Self {
        SegmentRegistry {
            dir,
            max_segment_size,
            list_lock: Mutex::new(segments.into_iter().map(|s| Arc::new(Mutex::new(s))).collect()),
            rotate_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.list_lock.lock().unwrap().len()
    }

    fn next_segment_path(&self, next_index: usize) -> PathBuf {
        self.dir.join(format!("bit_db{next_index}"))
    }

    /// Peek the active segment; if it's full, create and connect the
    /// next one and push it onto the registry before releasing
    /// `list_lock`/`rotate_lock`. The caller is left holding only the
    /// target segment's own lock, and performs the write after releasing
    /// both registry-level locks.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), RegistryError> {
        let target = {
            let mut list = self.list_lock.lock().unwrap();
            let active = list.last().cloned().ok_or(RegistryError::NoSegments)?;
            let mut active_guard = active.lock().unwrap();
            let _rotate_guard = self.rotate_lock.lock().unwrap();

            if active_guard.is_full(self.max_segment_size)? {
                drop(active_guard);
                let path = self.next_segment_path(list.len());
                Segment::init(&path)?;
                let new_segment = Segment::connect(&path)?;
                log::info!("rotating to new segment {}", path.display());
                let new_shared = Arc::new(Mutex::new(new_segment));
                list.push(new_shared.clone());
                new_shared
            } else {
                drop(active_guard);
                active
            }
        };

        let mut guard = target.lock().unwrap();
        guard.put(key, value)?;
        Ok(())
    }

    /// Hold `rotate_lock` for the whole scan (so no rotation happens
    /// underfoot), and visit each segment in insertion order under its
    /// own lock, stopping at the first hit.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, RegistryError> {
        let _rotate_guard = self.rotate_lock.lock().unwrap();

        let len = self.list_lock.lock().unwrap().len();
        for i in 0..len {
            let segment = {
                let list = self.list_lock.lock().unwrap();
                match list.get(i) {
                    Some(s) => s.clone(),
                    None => break,
                }
            };
            let guard = segment.lock().unwrap();
            match guard.get(key) {
                Ok(value) => return Ok(value),
                Err(GetError::KeyNotFound) | Err(GetError::KeyNotFoundOnDisk) => continue,
                Err(e) => return Err(RegistryError::Get(e)),
            }
        }

        Err(RegistryError::Get(GetError::KeyNotFound))
    }

    /// Persist every segment's index to its `.tb` sidecar; used on
    /// shutdown. Errors are logged, not propagated: a failure to persist
    /// one segment shouldn't stop the others from being tried.
    pub fn persist_all(&self) {
        let list = self.list_lock.lock().unwrap();
        for segment in list.iter() {
            let guard = segment.lock().unwrap();
            match guard.persist_index() {
                Ok(()) => log::info!("persisted index for {}", guard.path().display()),
                Err(e) => log::error!("failed to persist index for {}: {e}", guard.path().display()),
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use tempfile::tempdir;

    fn open_registry(dir: &Path, max_segment_size: u64) -> SegmentRegistry {
        let path = dir.join("bit_db0");
        Segment::init(&path).unwrap();
        let segment = Segment::connect(&path).unwrap();
        SegmentRegistry::new(dir.to_path_buf(), max_segment_size, vec![segment])
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let registry = open_registry(dir.path(), 64 * 1024 * 1024);

        registry.put(b"k", b"v").unwrap();
        assert_eq!(registry.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn rotation_happens_once_segment_is_full() {
        let dir = tempdir().unwrap();
        let registry = open_registry(dir.path(), 128);

        for i in 0..10 {
            let key = format!("k{i}");
            registry.put(key.as_bytes(), b"v").unwrap();
        }

        assert!(registry.len() >= 2);
        assert_eq!(registry.get(b"k0").unwrap(), b"v");
    }

    #[test]
    fn cross_segment_read_after_rotation() {
        let dir = tempdir().unwrap();
        let registry = open_registry(dir.path(), 64);

        registry.put(b"first", b"v").unwrap();
        // Push enough writes to force at least one rotation.
        for i in 0..5 {
            registry.put(format!("filler{i}").as_bytes(), b"vvvvvvvvvv").unwrap();
        }

        assert!(registry.len() >= 2);
        assert_eq!(registry.get(b"first").unwrap(), b"v");
    }

    #[test]
    fn get_on_empty_store_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = open_registry(dir.path(), 64 * 1024 * 1024);
        assert!(matches!(
            registry.get(b"nope"),
            Err(RegistryError::Get(GetError::KeyNotFound))
        ));
    }
}
