//! Rebuilds the page index and handle state by scanning segments in
//! generation order and merging checkpoints.

use std::collections::HashMap;
use std::io::Read;

use log::{debug, info, trace, warn};

use crate::handle::HandleRegistry;
use crate::page_index::{FileAddress, PageIndex};
use crate::record::{self, Record, TRANSIENT_TIMESTAMP};
use crate::repo::Repo;
use crate::volume::{TreeDescriptor, VolumeDescriptor};

#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    pub timestamp: i64,
    pub millis: i64,
}

/// The location within a segment at which recovery stopped trusting the
/// data: either end of file, or the offset of a record that failed to
/// parse or referenced something inconsistent. A non-`None` value means
/// the journal was not cleanly closed.
#[derive(Debug, Clone, Copy)]
pub struct DirtyAddress {
    pub generation: u64,
    pub offset: u64,
}

pub struct RecoveredState {
    pub page_index: PageIndex,
    pub first_generation: u64,
    pub current_generation: u64,
    /// Logical length of `current_generation`'s segment at the point
    /// recovery stopped trusting it; this is where the segment writer
    /// resumes appending (silently dropping any torn tail).
    pub tail_offset: u64,
    pub last_checkpoint: Option<Checkpoint>,
    pub dirty: Option<DirtyAddress>,
    /// The handle registries as they stood at `tail_offset` within
    /// `current_generation`'s segment, i.e. exactly what a process
    /// resuming that segment must already consider declared.
    pub volumes: HandleRegistry<VolumeDescriptor>,
    pub trees: HandleRegistry<TreeDescriptor>,
}

/// A page version seen before the checkpoint that would promote it into
/// the page index arrived.
type Reconstruction = HashMap<(VolumeDescriptor, u64), Vec<FileAddress>>;

fn merge_checkpoint(reconstruction: &mut Reconstruction, page_index: &mut PageIndex, checkpoint_timestamp: i64) {
    reconstruction.retain(|(volume, page), addrs| {
        if let Some(latest) = addrs
            .iter()
            .filter(|a| a.timestamp <= checkpoint_timestamp)
            .max_by_key(|a| a.timestamp)
            .copied()
        {
            page_index.insert(volume.clone(), *page, latest);
            addrs.retain(|a| a.timestamp > checkpoint_timestamp);
        }
        !addrs.is_empty()
    });
}

/// Scans every segment in `repo`, rebuilding the page index from scratch.
///
/// `handle_registry_capacity` seeds the returned handle registries so they
/// self-clear at the same threshold the journal manager will use for the
/// rest of the journal's life (see [`crate::config::JournalOptions::handle_registry_capacity`]).
///
/// Segments are read in full into memory rather than through a bounded
/// mmap window as the base design sketches; this is an implementation
/// simplification (recovery is not a hot path) with identical observable
/// behavior -- see `DESIGN.md`.
pub fn recover<R: Repo>(repo: &R, max_record_len: u32, handle_registry_capacity: usize) -> std::io::Result<RecoveredState> {
    let mut generations = repo.existing_generations()?;
    generations.sort_unstable();

    let mut page_index = PageIndex::new();
    let mut reconstruction: Reconstruction = HashMap::new();
    let mut last_checkpoint: Option<Checkpoint> = None;
    let mut dirty: Option<DirtyAddress> = None;
    let mut last_scanned_generation: Option<u64> = None;
    let mut tail_offset_of_last = 0u64;
    let mut volumes_at_tail: HandleRegistry<VolumeDescriptor> = HandleRegistry::with_capacity(handle_registry_capacity);
    let mut trees_at_tail: HandleRegistry<TreeDescriptor> = HandleRegistry::with_capacity(handle_registry_capacity);

    'outer: for &generation in &generations {
        debug!("recovery: scanning segment {generation}");
        last_scanned_generation = Some(generation);

        let mut reader = repo.open_segment_reader(generation)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;

        let mut volumes: HandleRegistry<VolumeDescriptor> = HandleRegistry::with_capacity(handle_registry_capacity);
        let mut trees: HandleRegistry<TreeDescriptor> = HandleRegistry::with_capacity(handle_registry_capacity);

        let mut pos = 0usize;
        loop {
            let header = match record::scan_header(&buf[pos..]) {
                record::HeaderScan::EndOfData => {
                    tail_offset_of_last = pos as u64;
                    volumes_at_tail = std::mem::take(&mut volumes);
                    trees_at_tail = std::mem::take(&mut trees);
                    break; // true end of this segment's written data
                }
                record::HeaderScan::Unrecognized => {
                    warn!("recovery: segment {generation} offset {pos}: unrecognized or truncated record header");
                    dirty = Some(DirtyAddress { generation, offset: pos as u64 });
                    tail_offset_of_last = pos as u64;
                    volumes_at_tail = std::mem::take(&mut volumes);
                    trees_at_tail = std::mem::take(&mut trees);
                    break 'outer;
                }
                record::HeaderScan::Record(header) => header,
            };

            if pos + header.length as usize > buf.len() {
                warn!("recovery: segment {generation} offset {pos}: truncated record (torn write)");
                dirty = Some(DirtyAddress { generation, offset: pos as u64 });
                tail_offset_of_last = pos as u64;
                volumes_at_tail = std::mem::take(&mut volumes);
                trees_at_tail = std::mem::take(&mut trees);
                break 'outer;
            }

            let body = &buf[pos..pos + header.length as usize];
            let decoded = record::decode_body(&header, body, generation, pos as u64, max_record_len).and_then(|rec| {
                if let Record::PageImage { volume_handle, .. } = &rec {
                    if volumes.resolve(*volume_handle).is_none() {
                        return Err(crate::error::JournalError::Corrupt(crate::error::CorruptReason::UnresolvedHandle {
                            segment: generation,
                            offset: pos as u64,
                            handle: *volume_handle,
                        }));
                    }
                }
                Ok(rec)
            });

            match decoded {
                Err(e) => {
                    warn!("recovery: segment {generation} offset {pos}: {e}");
                    dirty = Some(DirtyAddress { generation, offset: pos as u64 });
                    tail_offset_of_last = pos as u64;
                    volumes_at_tail = std::mem::take(&mut volumes);
                    trees_at_tail = std::mem::take(&mut trees);
                    break 'outer;
                }
                Ok(Record::IdentifyVolume { handle, volume_id, path }) => {
                    trace!("recovery: IV handle={handle} path={path}");
                    volumes.install(handle, VolumeDescriptor { path, id: volume_id });
                }
                Ok(Record::IdentifyTree { handle, volume_handle, tree_name }) => {
                    trace!("recovery: IT handle={handle} tree={tree_name}");
                    trees.install(handle, TreeDescriptor { volume_handle, tree_name });
                }
                Ok(Record::PageImage {
                    volume_handle,
                    page_address,
                    ..
                }) => {
                    if header.timestamp == TRANSIENT_TIMESTAMP {
                        trace!("recovery: discarding transient page {page_address}");
                    } else {
                        let volume = volumes.resolve(volume_handle).expect("checked above").clone();
                        reconstruction.entry((volume, page_address)).or_default().push(FileAddress {
                            generation,
                            offset: pos as u64,
                            timestamp: header.timestamp,
                        });
                    }
                }
                Ok(Record::Checkpoint { millis }) => {
                    trace!("recovery: CP timestamp={} millis={millis}", header.timestamp);
                    merge_checkpoint(&mut reconstruction, &mut page_index, header.timestamp);
                    last_checkpoint = Some(Checkpoint {
                        timestamp: header.timestamp,
                        millis,
                    });
                }
            }

            pos += header.length as usize;
        }
    }

    let considered: Vec<u64> = match dirty {
        Some(d) => generations.into_iter().filter(|&g| g <= d.generation).collect(),
        None => generations,
    };
    let first_generation = considered.iter().copied().min().unwrap_or(0);
    let current_generation = considered.iter().copied().max().unwrap_or(0);
    let tail_offset = if last_scanned_generation == Some(current_generation) {
        tail_offset_of_last
    } else {
        0
    };

    info!(
        "recovery: done. first_generation={first_generation} current_generation={current_generation} \
         last_checkpoint={last_checkpoint:?} dirty={dirty:?} page_index_size={}",
        page_index.len()
    );

    Ok(RecoveredState {
        page_index,
        first_generation,
        current_generation,
        tail_offset,
        last_checkpoint,
        dirty,
        volumes: volumes_at_tail,
        trees: trees_at_tail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{Memory, SegmentWriterHandle};
    use crate::segment::SegmentWriter;
    use crate::JournalOptions;

    fn vd(path: &str) -> VolumeDescriptor {
        VolumeDescriptor {
            path: path.to_string(),
            id: 1,
        }
    }

    fn write_segment(repo: &Memory, opts: &JournalOptions, records: &[(Record, i64)]) {
        let mut writer = SegmentWriter::create(repo.clone(), 0, opts).unwrap();
        for (rec, ts) in records {
            let bytes = record::encode(rec, *ts);
            writer.reserve(bytes.len()).unwrap();
            writer.append(&bytes).unwrap();
        }
        writer.force().unwrap();
    }

    #[test]
    fn clean_cycle_installs_all_pages_after_checkpoint() {
        let repo = Memory::new();
        let opts = JournalOptions::default();
        let records = vec![
            (
                Record::IdentifyVolume {
                    handle: 0,
                    volume_id: 1,
                    path: "/vol".to_string(),
                },
                0,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 1,
                    payload: vec![1; 8],
                },
                1,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 2,
                    payload: vec![2; 8],
                },
                2,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 3,
                    payload: vec![3; 8],
                },
                3,
            ),
            (Record::Checkpoint { millis: 100 }, 10),
        ];
        write_segment(&repo, &opts, &records);

        let state = recover(&repo, 1 << 20, crate::handle::DEFAULT_CAPACITY).unwrap();
        assert_eq!(state.page_index.len(), 3);
        assert_eq!(state.last_checkpoint.unwrap().timestamp, 10);
        assert_eq!(state.first_generation, 0);
        assert_eq!(state.current_generation, 0);
        assert!(state.dirty.is_none());
    }

    #[test]
    fn torn_tail_is_flagged_dirty_but_prior_records_still_recovered() {
        let repo = Memory::new();
        let opts = JournalOptions::default();
        let records = vec![
            (
                Record::IdentifyVolume {
                    handle: 0,
                    volume_id: 1,
                    path: "/vol".to_string(),
                },
                0,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 1,
                    payload: vec![1; 8],
                },
                1,
            ),
            (Record::Checkpoint { millis: 100 }, 10),
        ];
        write_segment(&repo, &opts, &records);

        // Simulate a crash mid-append: only the header of the next record
        // makes it to disk, so its checksum (computed over the intended
        // body) won't match the all-zero bytes actually sitting there.
        let tail = recover(&repo, 1 << 20, crate::handle::DEFAULT_CAPACITY).unwrap().tail_offset;
        let mut writer = SegmentWriter::resume(repo.clone(), 0, tail, &opts).unwrap();
        let partial = record::encode(&Record::Checkpoint { millis: 424242 }, 99);
        writer.reserve(partial.len()).unwrap();
        writer.append(&partial[..record::HEADER_LEN]).unwrap();
        writer.force().unwrap();

        let state = recover(&repo, 1 << 20, crate::handle::DEFAULT_CAPACITY).unwrap();
        assert_eq!(state.page_index.len(), 1);
        assert_eq!(state.last_checkpoint.unwrap().timestamp, 10);
        assert!(state.dirty.is_some());
    }

    #[test]
    fn transient_page_is_discarded() {
        let repo = Memory::new();
        let opts = JournalOptions::default();
        let records = vec![
            (
                Record::IdentifyVolume {
                    handle: 0,
                    volume_id: 1,
                    path: "/vol".to_string(),
                },
                0,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 1,
                    payload: vec![1; 8],
                },
                TRANSIENT_TIMESTAMP,
            ),
            (Record::Checkpoint { millis: 100 }, 10),
        ];
        write_segment(&repo, &opts, &records);

        let state = recover(&repo, 1 << 20, crate::handle::DEFAULT_CAPACITY).unwrap();
        assert_eq!(state.page_index.len(), 0);
    }

    #[test]
    fn supersede_keeps_latest_version_at_checkpoint() {
        let repo = Memory::new();
        let opts = JournalOptions::default();
        let records = vec![
            (
                Record::IdentifyVolume {
                    handle: 0,
                    volume_id: 1,
                    path: "/vol".to_string(),
                },
                0,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 7,
                    payload: vec![1; 8],
                },
                1,
            ),
            (
                Record::PageImage {
                    volume_handle: 0,
                    buffer_size: 8,
                    left_size: 0,
                    page_address: 7,
                    payload: vec![2; 8],
                },
                2,
            ),
            (Record::Checkpoint { millis: 100 }, 3),
        ];
        write_segment(&repo, &opts, &records);

        let state = recover(&repo, 1 << 20, crate::handle::DEFAULT_CAPACITY).unwrap();
        assert_eq!(state.page_index.len(), 1);
        let addr = state.page_index.get(&vd("/vol"), 7).unwrap();
        assert_eq!(addr.timestamp, 2);
    }
}
