//! The journal's external collaborators: home data volumes.
//!
//! The B-Tree, buffer pool and volume file layout are out of scope for this
//! crate; [`Volume`] is the narrow interface the copy-back worker and the
//! page read path need from them.

use std::io;
use std::sync::Arc;

/// Identifies a volume: its home path and a stable id stored alongside page
/// images so a stale copy can be detected after a volume is recreated at the
/// same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeDescriptor {
    pub path: String,
    pub id: u64,
}

impl PartialOrd for VolumeDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VolumeDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.path, self.id).cmp(&(&other.path, other.id))
    }
}

/// Identifies a tree within a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeDescriptor {
    pub volume_handle: u32,
    pub tree_name: String,
}

/// A home data volume that journalled pages are eventually copied back to.
pub trait Volume: Send + Sync {
    fn descriptor(&self) -> VolumeDescriptor;
    fn buffer_size(&self) -> u32;
    fn write_page(&self, page: u64, buf: &[u8]) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

/// Resolves a volume path to the live [`Volume`], if it is currently open.
///
/// Implemented by whatever owns the buffer pool / volume set in the wider
/// storage engine; the journal only ever calls `resolve`.
pub trait VolumeDirectory: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<dyn Volume>>;
}

/// A [`VolumeDirectory`] with nothing registered; useful for journals that
/// only ever replay into the page read path and never copy back (e.g. the
/// `journalctl` diagnostic binary).
#[derive(Default)]
pub struct NoVolumes;

impl VolumeDirectory for NoVolumes {
    fn resolve(&self, _path: &str) -> Option<Arc<dyn Volume>> {
        None
    }
}
