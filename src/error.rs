use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("corrupt index: count {count} is inconsistent with dimension {dimension}")]
    Corrupt { count: u64, dimension: u32 },

    #[error("unexpected end of index data")]
    ShortRead,

    #[error("IO error")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("IO error at path: {path}")]
    IOErrorAtPath { path: PathBuf, source: io::Error },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("segment file has a missing or invalid magic sequence")]
    BadMagic,

    #[error("IO error at path: {path}")]
    IOErrorAtPath { path: PathBuf, source: io::Error },
}

#[derive(Error, Debug)]
pub enum PutError {
    #[error("key exceeds max size (expected <= 128 bytes)")]
    KeyExceedsMaxSize,

    #[error("IO error")]
    IOError(#[from] io::Error),

    #[error("index error")]
    IndexError(#[from] IndexError),
}

#[derive(Error, Debug)]
pub enum GetError {
    /// The key is absent from this segment's in-memory index. Local to a
    /// single segment; callers scanning a registry try the next one.
    #[error("key not found")]
    KeyNotFound,

    /// The index pointed at an offset whose on-disk key no longer matches.
    /// Treated as not-found; the index is left untouched.
    #[error("key not found at recorded offset (stale index entry)")]
    KeyNotFoundOnDisk,

    #[error("IO error")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum LoadIndexError {
    #[error("sidecar checksum mismatch")]
    Checksum,

    #[error("sidecar is malformed")]
    Index(#[from] IndexError),

    #[error("IO error")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("segment registry is empty")]
    NoSegments,

    #[error("failed to create new segment")]
    Init(#[from] InitError),

    #[error("failed to connect to new segment")]
    Connect(#[from] ConnectError),

    #[error("put failed")]
    Put(#[from] PutError),

    #[error("get failed")]
    Get(#[from] GetError),

    #[error("IO error")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("could not read data directory: {path}")]
    ReadDir { path: PathBuf, source: io::Error },

    #[error("could not create data directory: {path}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("could not create a fresh segment after a bad-magic retry")]
    Init(#[from] InitError),

    #[error("could not connect to segment after a bad-magic retry")]
    Connect(#[from] ConnectError),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("missing key")]
    NoKey,

    #[error("missing size")]
    NoSize,

    #[error("size is non-positive or overflows")]
    BadSize,

    #[error("unrecognised verb")]
    BadToken,

    #[error("client closed the connection")]
    ConnectionClosed,

    #[error("IO error")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("bootstrap failed")]
    Bootstrap(#[from] BootstrapError),

    #[error("IO error")]
    IOError(#[from] io::Error),
}
