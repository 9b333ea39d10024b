//! Mechanics of one copy-back cycle: scoring urgency, snapshotting
//! candidates, writing page images back to their home volumes, and
//! reconciling the page index afterwards.
//!
//! Locking and segment reclamation are orchestration concerns and live in
//! [`crate::manager`]; this module only knows how to pick candidates and
//! move bytes.

use std::io::{Read, Seek, SeekFrom};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::config::JournalOptions;
use crate::error::{CorruptReason, JournalError, Result};
use crate::iorate::IoRateMeter;
use crate::page_index::{FileAddress, PageIndex, PageKey};
use crate::record::{self, HeaderScan, Record};
use crate::repo::Repo;
use crate::volume::VolumeDirectory;

/// `max(urgency, 10)`, matching the source design's apparent
/// `Math.max(urgency, 10)` literally rather than the `Math.min` one might
/// expect -- see `DESIGN.md` for why this is kept as-is.
pub fn urgency(page_index_len: usize, size_base: usize, segment_count: u64) -> u32 {
    let raw = (page_index_len / size_base.max(1)) as u32 + segment_count.saturating_sub(1) as u32;
    raw.max(10)
}

fn addr_min(a: Option<FileAddress>, b: FileAddress) -> Option<FileAddress> {
    match a {
        None => Some(b),
        Some(a) if (b.generation, b.offset) < (a.generation, a.offset) => Some(b),
        some => some,
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: PageKey,
    pub addr: FileAddress,
}

/// Snapshots the entries of `page_index` eligible for copy-back right now.
///
/// An entry is a candidate if its timestamp is below `timestamp_ceiling`
/// (the lesser of the last valid checkpoint's timestamp and the
/// configured `copier_timestamp_limit`) and either it lives in the oldest
/// live segment (`generation < first_generation + 1`) or `urgent` mode is
/// in effect. Everything else contributes to the returned "first missed"
/// address.
pub fn snapshot_candidates(page_index: &PageIndex, first_generation: u64, urgent: bool, timestamp_ceiling: i64) -> (Vec<Candidate>, Option<FileAddress>) {
    let mut candidates = Vec::new();
    let mut first_missed = None;

    for (key, addr) in page_index.iter() {
        let eligible = addr.timestamp < timestamp_ceiling && (addr.generation < first_generation + 1 || urgent);
        if eligible {
            candidates.push(Candidate { key: key.clone(), addr: *addr });
        } else {
            first_missed = addr_min(first_missed, *addr);
        }
    }

    (candidates, first_missed)
}

#[derive(Debug, Clone)]
pub struct WrittenEntry {
    pub key: PageKey,
    pub addr: FileAddress,
}

pub(crate) fn read_record_at<R: Repo>(repo: &R, generation: u64, offset: u64, max_record_len: u32) -> Result<Record> {
    let mut reader = repo.open_segment_reader(generation)?;
    reader.seek(SeekFrom::Start(offset))?;

    let mut head = vec![0u8; record::HEADER_LEN];
    reader.read_exact(&mut head)?;
    let header = match record::scan_header(&head) {
        HeaderScan::Record(header) => header,
        _ => {
            return Err(JournalError::Corrupt(CorruptReason::UnknownRecordType {
                segment: generation,
                offset,
                tag: head.first().copied().unwrap_or(0),
            }))
        }
    };

    let mut buf = vec![0u8; header.length as usize];
    buf[..record::HEADER_LEN].copy_from_slice(&head);
    reader.read_exact(&mut buf[record::HEADER_LEN..])?;

    record::decode_body(&header, &buf, generation, offset, max_record_len)
}

/// Writes every candidate's page image back to its home volume, without
/// holding the journal's monitor (I/O here can be slow; the only shared
/// state it touches -- `io_meter` -- is private to the copy-back worker's
/// own thread).
///
/// Returns the entries actually written plus any new "first missed"
/// address accumulated while resolving volumes.
pub fn write_back<R: Repo>(
    candidates: Vec<Candidate>,
    repo: &R,
    volumes: &dyn VolumeDirectory,
    io_meter: &mut IoRateMeter,
    opts: &JournalOptions,
    max_record_len: u32,
) -> Result<(Vec<WrittenEntry>, Option<FileAddress>)> {
    let mut written = Vec::with_capacity(candidates.len());
    let mut missed = None;
    let mut touched = Vec::new();

    for candidate in candidates {
        let (volume_descriptor, page) = (&candidate.key.0, candidate.key.1);
        let Some(volume) = volumes.resolve(&volume_descriptor.path) else {
            warn!("copy-back: volume {} not open, deferring page {page}", volume_descriptor.path);
            missed = addr_min(missed, candidate.addr);
            continue;
        };

        let live_descriptor = volume.descriptor();
        if live_descriptor.id != volume_descriptor.id {
            return Err(JournalError::Corrupt(CorruptReason::VolumeIdMismatch {
                path: volume_descriptor.path.clone(),
                expected: volume_descriptor.id,
                found: live_descriptor.id,
            }));
        }

        let Record::PageImage {
            buffer_size,
            left_size,
            page_address,
            payload,
            ..
        } = read_record_at(repo, candidate.addr.generation, candidate.addr.offset, max_record_len)?
        else {
            return Err(JournalError::IllegalState("page index pointed at a non-page-image record"));
        };

        if page_address != page {
            return Err(JournalError::Corrupt(CorruptReason::PageAddressMismatch {
                expected: page,
                found: page_address,
            }));
        }
        if buffer_size != volume.buffer_size() {
            return Err(JournalError::Corrupt(CorruptReason::BufferLengthMismatch {
                expected: volume.buffer_size(),
                found: buffer_size,
            }));
        }

        let buffer = record::reconstruct_buffer(buffer_size, left_size, &payload);
        volume.write_page(page, &buffer)?;
        touched.push(volume);

        let rate = io_meter.update(1);
        let sleep_ms = opts.io_rate_sleep_multiplier * rate.clamp(opts.io_rate_min, opts.io_rate_max) as f64;
        if sleep_ms > 0.0 {
            thread::sleep(Duration::from_millis(sleep_ms as u64));
        }

        written.push(WrittenEntry { key: candidate.key, addr: candidate.addr });
    }

    for volume in touched {
        volume.sync()?;
    }

    Ok((written, missed))
}

/// Removes each written entry from the page index, but only if it still
/// points at the address we just wrote back (a newer append during this
/// cycle must win). Entries that were superseded are folded into the
/// returned "first missed" address so their segment isn't reclaimed early.
pub fn reconcile(page_index: &mut PageIndex, written: &[WrittenEntry], mut first_missed: Option<FileAddress>) -> Option<FileAddress> {
    for entry in written {
        if !page_index.remove_if(&entry.key.0, entry.key.1, entry.addr) {
            first_missed = addr_min(first_missed, entry.addr);
        }
    }
    first_missed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::VolumeDescriptor;

    fn vd(path: &str) -> VolumeDescriptor {
        VolumeDescriptor {
            path: path.to_string(),
            id: 1,
        }
    }

    #[test]
    fn urgency_is_floored_at_ten() {
        assert_eq!(urgency(0, 1000, 1), 10);
        assert_eq!(urgency(50_000, 1000, 6), 55);
    }

    #[test]
    fn snapshot_prefers_oldest_segment_unless_urgent() {
        let mut idx = PageIndex::new();
        idx.insert(
            vd("a"),
            1,
            FileAddress {
                generation: 0,
                offset: 0,
                timestamp: 1,
            },
        );
        idx.insert(
            vd("a"),
            2,
            FileAddress {
                generation: 5,
                offset: 0,
                timestamp: 1,
            },
        );

        let (candidates, missed) = snapshot_candidates(&idx, 0, false, 100);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key.1, 1);
        assert!(missed.is_some());

        let (candidates, missed) = snapshot_candidates(&idx, 0, true, 100);
        assert_eq!(candidates.len(), 2);
        assert!(missed.is_none());
    }

    #[test]
    fn timestamp_ceiling_excludes_unwritten_checkpoint_pages() {
        let mut idx = PageIndex::new();
        idx.insert(
            vd("a"),
            1,
            FileAddress {
                generation: 0,
                offset: 0,
                timestamp: 50,
            },
        );
        let (candidates, missed) = snapshot_candidates(&idx, 0, false, 10);
        assert!(candidates.is_empty());
        assert!(missed.is_some());
    }
}
