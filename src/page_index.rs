//! In-memory mapping from `(volume, page)` to the latest journal location
//! that holds that page's image.

use std::collections::BTreeMap;

use crate::volume::VolumeDescriptor;

/// The location of a record within a segment, plus the timestamp it was
/// written with (needed to decide which of two copies of the same page is
/// newer, and to compare against checkpoint boundaries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAddress {
    pub generation: u64,
    pub offset: u64,
    pub timestamp: i64,
}

/// `(volume_path, volume_id, page_number)`. Ordered by `(path, id)` first so
/// iteration visits one volume's pages contiguously, then by page number so
/// copy-back issues sequential writes to each volume.
pub type PageKey = (VolumeDescriptor, u64);

#[derive(Debug, Default)]
pub struct PageIndex {
    map: BTreeMap<PageKey, FileAddress>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the latest known location for `(volume, page)`. Callers are
    /// responsible for only calling this with a higher timestamp than any
    /// existing entry; the index itself does not arbitrate.
    pub fn insert(&mut self, volume: VolumeDescriptor, page: u64, addr: FileAddress) {
        self.map.insert((volume, page), addr);
    }

    pub fn get(&self, volume: &VolumeDescriptor, page: u64) -> Option<FileAddress> {
        self.map.get(&(volume.clone(), page)).copied()
    }

    /// Removes `(volume, page)` only if its recorded address still equals
    /// `expected`. Returns whether the removal happened. Used by the
    /// copy-back worker's reconciliation pass: if a newer page image was
    /// appended while the worker was writing the old one back, the index
    /// must keep pointing at the newer copy.
    pub fn remove_if(&mut self, volume: &VolumeDescriptor, page: u64, expected: FileAddress) -> bool {
        let key = (volume.clone(), page);
        if self.map.get(&key) == Some(&expected) {
            self.map.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PageKey, &FileAddress)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear()
    }

    /// The smallest segment generation referenced by any entry, if any.
    pub fn min_generation(&self) -> Option<u64> {
        self.map.values().map(|a| a.generation).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vd(path: &str) -> VolumeDescriptor {
        VolumeDescriptor {
            path: path.to_string(),
            id: 1,
        }
    }

    #[test]
    fn orders_by_volume_path_then_page() {
        let mut idx = PageIndex::new();
        idx.insert(
            vd("b"),
            1,
            FileAddress {
                generation: 0,
                offset: 0,
                timestamp: 1,
            },
        );
        idx.insert(
            vd("a"),
            5,
            FileAddress {
                generation: 0,
                offset: 10,
                timestamp: 1,
            },
        );
        idx.insert(
            vd("a"),
            1,
            FileAddress {
                generation: 0,
                offset: 20,
                timestamp: 1,
            },
        );
        let keys: Vec<_> = idx.iter().map(|(k, _)| (k.0.path.clone(), k.1)).collect();
        assert_eq!(keys, vec![("a".to_string(), 1), ("a".to_string(), 5), ("b".to_string(), 1)]);
    }

    #[test]
    fn remove_if_respects_supersession() {
        let mut idx = PageIndex::new();
        let addr1 = FileAddress {
            generation: 0,
            offset: 0,
            timestamp: 1,
        };
        let addr2 = FileAddress {
            generation: 0,
            offset: 40,
            timestamp: 2,
        };
        idx.insert(vd("a"), 1, addr1);
        idx.insert(vd("a"), 1, addr2);
        assert!(!idx.remove_if(&vd("a"), 1, addr1));
        assert_eq!(idx.get(&vd("a"), 1), Some(addr2));
        assert!(idx.remove_if(&vd("a"), 1, addr2));
        assert_eq!(idx.get(&vd("a"), 1), None);
    }
}
