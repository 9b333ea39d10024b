//! Write-ahead journal for an embedded B-Tree storage engine.
//!
//! Every page write is first recorded as a self-describing image in an
//! append-only, segmented on-disk log, together with periodic checkpoints.
//! A background worker copies journaled pages back to their home volumes
//! once a checkpoint makes them durable, reclaiming segments as it goes;
//! a second worker keeps the active segment forced to stable storage on a
//! timer. On restart, [`manager::JournalManager::recover`] replays the log
//! to rebuild the in-memory page index before accepting new writes.

pub mod config;
pub mod copyback;
pub mod error;
pub mod flush;
pub mod handle;
pub mod iorate;
pub mod manager;
pub mod page_index;
pub mod record;
pub mod recovery;
pub mod repo;
pub mod segment;
pub mod volume;

pub use crate::config::JournalOptions;
pub use crate::error::{CorruptReason, JournalError, Result};
pub use crate::manager::JournalManager;
pub use crate::page_index::FileAddress;
pub use crate::record::{Record, RecordType};
pub use crate::volume::{NoVolumes, TreeDescriptor, Volume, VolumeDescriptor, VolumeDirectory};
