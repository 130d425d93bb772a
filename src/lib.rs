//! A persistent key-value store exposed as a TCP daemon, backed by an
//! append-only Bitcask-style log.
//!
//! [`index`] is the in-memory hash index; [`segment`] is one append-only
//! log file plus its index; [`registry`] holds the ordered collection of
//! open segments and the locking discipline that lets readers and
//! writers run concurrently; [`protocol`] and [`worker`] are the
//! request dispatcher and fixed thread pool; [`daemon`] ties it all
//! together (bootstrap, accept loop, graceful shutdown).

pub mod config;
pub mod daemon;
pub mod error;
pub mod index;
pub mod protocol;
pub mod registry;
pub mod segment;
pub mod worker;

pub use config::Config;
pub use error::DaemonError;
