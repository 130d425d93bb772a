//! Bootstrap and shutdown: enumerate existing segments on disk, reopen
//! them, start the accept loop and worker pool, and on SIGINT drain
//! workers and persist every segment's index.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::{BootstrapError, ConnectError, DaemonError};
use crate::registry::SegmentRegistry;
use crate::segment::Segment;
use crate::worker::{ClientQueue, WorkerPool};

const SEGMENT_PREFIX: &str = "bit_db";
const ACCEPT_POLL: Duration = Duration::from_millis(100);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

/// Parse `bit_db<N>` (but not `bit_db<N>.tb`) out of a filename.
fn segment_id(filename: &str) -> Option<u64> {
    filename.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

fn discover_segment_paths(dir: &Path) -> Result<Vec<(u64, PathBuf)>, BootstrapError> {
    let entries = fs::read_dir(dir).map_err(|e| BootstrapError::ReadDir {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut found = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if let Some(id) = segment_id(name) {
            found.push((id, path));
        } else {
            log::debug!("skipping non-segment entry in {}: {name}", dir.display());
        }
    }
    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

/// Connect to an existing segment, retrying with a fresh `init` once if
/// the file is missing or its magic header is invalid. A second failure
/// is fatal.
fn connect_or_recreate(path: &Path) -> Result<Segment, BootstrapError> {
    match Segment::connect(path) {
        Ok(segment) => Ok(segment),
        Err(ConnectError::BadMagic) | Err(ConnectError::IOErrorAtPath { .. }) => {
            log::warn!("segment {} missing or invalid, recreating", path.display());
            Segment::init(path)?;
            Ok(Segment::connect(path)?)
        }
    }
}

pub fn bootstrap(config: &Config) -> Result<SegmentRegistry, BootstrapError> {
    if !config.dir.exists() {
        fs::create_dir_all(&config.dir).map_err(|e| BootstrapError::CreateDir {
            path: config.dir.clone(),
            source: e,
        })?;
    }

    let paths = discover_segment_paths(&config.dir)?;
    let mut segments = Vec::with_capacity(paths.len().max(1));

    for (_id, path) in &paths {
        segments.push(connect_or_recreate(path)?);
    }

    if segments.is_empty() {
        let path = config.dir.join(format!("{SEGMENT_PREFIX}0"));
        Segment::init(&path)?;
        segments.push(Segment::connect(&path)?);
        log::info!("created initial segment {}", path.display());
    }

    log::info!("bootstrapped {} segment(s) from {}", segments.len(), config.dir.display());
    Ok(SegmentRegistry::new(config.dir.clone(), config.max_segment_size, segments))
}

/// Run the daemon until SIGINT: accept connections, hand them to the
/// worker pool, and on shutdown drain workers and persist every index.
pub fn run(config: Config) -> Result<(), DaemonError> {
    let registry = Arc::new(bootstrap(&config)?);
    let running = Arc::new(AtomicBool::new(true));
    let clients = Arc::new(ClientQueue::new(config.workers));

    install_sigint_handler();

    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    listener.set_nonblocking(true)?;
    log::info!("listening on port {}", config.port);

    let pool = WorkerPool::start(config.workers, clients.clone(), registry.clone(), running.clone());

    while running.load(Ordering::SeqCst) {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            log::info!("received SIGINT, shutting down");
            running.store(false, Ordering::SeqCst);
            break;
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                if clients.is_saturated() {
                    log::warn!("worker pool saturated, dropping connection");
                    drop(stream);
                } else {
                    clients.enqueue(stream);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::error!("accept() failed: {e}");
                break;
            }
        }
    }

    drop(listener);
    clients.wake_all();
    pool.join();
    registry.persist_all();
    log::info!("exiting daemon");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_creates_initial_segment_in_empty_dir() {
        let dir = tempdir().unwrap();
        let config = Config {
            dir: dir.path().join("db"),
            ..Config::default()
        };

        let registry = bootstrap(&config).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn bootstrap_reopens_existing_segments_in_order() {
        let dir = tempdir().unwrap();
        let db_dir = dir.path().join("db");
        fs::create_dir_all(&db_dir).unwrap();

        for i in 0..3u64 {
            let path = db_dir.join(format!("bit_db{i}"));
            Segment::init(&path).unwrap();
        }
        // A stray sidecar and an unrelated file should both be skipped.
        fs::write(db_dir.join("bit_db0.tb"), b"not a real sidecar").unwrap();
        fs::write(db_dir.join("README"), b"hello").unwrap();

        let config = Config {
            dir: db_dir,
            ..Config::default()
        };
        let registry = bootstrap(&config).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn bootstrap_recreates_a_segment_with_bad_magic() {
        let dir = tempdir().unwrap();
        let db_dir = dir.path().join("db");
        fs::create_dir_all(&db_dir).unwrap();
        fs::write(db_dir.join("bit_db0"), b"not a valid segment header").unwrap();

        let config = Config {
            dir: db_dir,
            ..Config::default()
        };
        let registry = bootstrap(&config).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
