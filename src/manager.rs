//! Top-level journal API: the single entry point the buffer pool and B-Tree
//! layer use to durably record page images and checkpoints, and to read
//! them back before a page has been copied to its home volume.
//!
//! All mutable state -- the page index, the handle registries, and the
//! active segment writer -- lives behind one `Mutex`, matching the base
//! design's single in-process monitor. Only the copy-back worker's actual
//! disk I/O happens outside the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::config::JournalOptions;
use crate::copyback;
use crate::error::{CorruptReason, JournalError, Result};
use crate::flush::FlushWorker;
use crate::handle::HandleRegistry;
use crate::iorate::IoRateMeter;
use crate::page_index::{FileAddress, PageIndex};
use crate::record::{self, Record};
use crate::recovery::{self, Checkpoint};
use crate::repo::Repo;
use crate::segment::SegmentWriter;
use crate::volume::{TreeDescriptor, VolumeDescriptor, VolumeDirectory};

struct Inner<R: Repo> {
    writer: SegmentWriter<R>,
    page_index: PageIndex,
    volumes: HandleRegistry<VolumeDescriptor>,
    trees: HandleRegistry<TreeDescriptor>,
    first_generation: u64,
    last_checkpoint: Option<Checkpoint>,
    closed: bool,
}

impl<R: Repo> Inner<R> {
    /// Appends `record` at `timestamp`, rolling the segment over if needed
    /// and re-declaring every live volume/tree into the new segment -- every
    /// segment must be self-describing for recovery to work.
    fn append(&mut self, record: &Record, timestamp: i64) -> Result<FileAddress> {
        let bytes = record::encode(record, timestamp);
        let rolled = self.writer.reserve(bytes.len())?;
        if rolled {
            self.reemit_after_rollover(timestamp)?;
            // Re-declaring IV/IT records consumed window space; make sure
            // the record we actually came here to write still fits.
            self.writer.reserve(bytes.len())?;
        }
        let generation = self.writer.generation();
        let offset = self.writer.append(&bytes)?;
        Ok(FileAddress { generation, offset, timestamp })
    }

    fn reemit_after_rollover(&mut self, timestamp: i64) -> Result<()> {
        let old_volumes: Vec<(u32, VolumeDescriptor)> = self.volumes.pairs().map(|(h, d)| (h, d.clone())).collect();
        let old_trees: Vec<(u32, TreeDescriptor)> = self.trees.pairs().map(|(h, d)| (h, d.clone())).collect();
        self.volumes.clear();
        self.trees.clear();

        let mut remapped_volume_handles = std::collections::HashMap::new();
        for (old_handle, descriptor) in old_volumes {
            let (new_handle, _) = self.volumes.handle_for(descriptor.clone());
            remapped_volume_handles.insert(old_handle, new_handle);
            let bytes = record::encode(
                &Record::IdentifyVolume {
                    handle: new_handle,
                    volume_id: descriptor.id,
                    path: descriptor.path,
                },
                timestamp,
            );
            self.writer.reserve(bytes.len())?;
            self.writer.append(&bytes)?;
        }

        for (_, descriptor) in old_trees {
            // The descriptor's volume_handle was assigned in the old
            // segment's namespace; translate it to survive the rollover.
            let Some(&new_volume_handle) = remapped_volume_handles.get(&descriptor.volume_handle) else {
                continue;
            };
            let (handle, _) = self.trees.handle_for(TreeDescriptor {
                volume_handle: new_volume_handle,
                tree_name: descriptor.tree_name.clone(),
            });
            let bytes = record::encode(
                &Record::IdentifyTree {
                    handle,
                    volume_handle: new_volume_handle,
                    tree_name: descriptor.tree_name,
                },
                timestamp,
            );
            self.writer.reserve(bytes.len())?;
            self.writer.append(&bytes)?;
        }
        Ok(())
    }
}

/// A live, recovered journal. Spawns a flush worker and a copy-back worker
/// on construction; both stop when the manager is dropped or [`Self::close`]
/// is called.
pub struct JournalManager<R: Repo> {
    repo: R,
    opts: JournalOptions,
    volumes_dir: Arc<dyn VolumeDirectory>,
    max_record_len: u32,
    inner: Arc<Mutex<Inner<R>>>,
    flush: FlushWorker,
    copyback_stop: Arc<AtomicBool>,
    copyback_handle: Option<JoinHandle<()>>,
}

const DEFAULT_MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

impl<R: Repo> JournalManager<R> {
    /// Scans `repo` for prior segments, rebuilds the page index, and opens
    /// (or creates) the active segment for further writes. Spawns the
    /// background flush and copy-back workers.
    pub fn recover(repo: R, opts: JournalOptions, volumes_dir: Arc<dyn VolumeDirectory>) -> Result<Self> {
        Self::recover_with_max_record_len(repo, opts, volumes_dir, DEFAULT_MAX_RECORD_LEN)
    }

    pub fn recover_with_max_record_len(repo: R, opts: JournalOptions, volumes_dir: Arc<dyn VolumeDirectory>, max_record_len: u32) -> Result<Self> {
        let opts = opts.clamped();
        let recovered = recovery::recover(&repo, max_record_len, opts.handle_registry_capacity)?;

        if let Some(dirty) = recovered.dirty {
            warn!("journal: recovered with a dirty tail at segment {} offset {}", dirty.generation, dirty.offset);
        }
        info!(
            "journal: recovered {} page(s), first_generation={} current_generation={}",
            recovered.page_index.len(),
            recovered.first_generation,
            recovered.current_generation
        );

        let has_segments = !repo.existing_generations()?.is_empty();
        let writer = if has_segments {
            SegmentWriter::resume(repo.clone(), recovered.current_generation, recovered.tail_offset, &opts)?
        } else {
            SegmentWriter::create(repo.clone(), 0, &opts)?
        };

        let inner = Arc::new(Mutex::new(Inner {
            writer,
            page_index: recovered.page_index,
            volumes: recovered.volumes,
            trees: recovered.trees,
            first_generation: recovered.first_generation,
            last_checkpoint: recovered.last_checkpoint,
            closed: false,
        }));

        let flush = {
            let inner = inner.clone();
            FlushWorker::spawn(opts.flush_interval, move || {
                let mut guard = inner.lock().unwrap();
                if guard.closed {
                    return Ok(());
                }
                guard.writer.force()
            })
        };

        let copyback_stop = Arc::new(AtomicBool::new(false));
        let copyback_handle = Self::spawn_copyback(repo.clone(), opts, volumes_dir.clone(), inner.clone(), copyback_stop.clone(), max_record_len);

        Ok(Self {
            repo,
            opts,
            volumes_dir,
            max_record_len,
            inner,
            flush,
            copyback_stop,
            copyback_handle: Some(copyback_handle),
        })
    }

    fn spawn_copyback(
        repo: R,
        opts: JournalOptions,
        volumes_dir: Arc<dyn VolumeDirectory>,
        inner: Arc<Mutex<Inner<R>>>,
        stop: Arc<AtomicBool>,
        max_record_len: u32,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("journal-copyback".into())
            .spawn(move || {
                let mut io_meter = IoRateMeter::new();
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(opts.copier_interval);
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = run_copy_back_cycle(&repo, &opts, &*volumes_dir, &inner, &mut io_meter, max_record_len, None) {
                        warn!("copy-back: cycle failed: {err}");
                    }
                }
            })
            .expect("failed to spawn journal-copyback thread")
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner<R>) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(JournalError::IllegalState("journal is closed"));
        }
        f(&mut inner)
    }

    /// Returns the process-local handle for `descriptor`, declaring it with
    /// an IV record in the active segment the first time it is seen.
    pub fn handle_for_volume(&self, descriptor: VolumeDescriptor, timestamp: i64) -> Result<u32> {
        self.with_inner(|inner| {
            let (handle, is_new) = inner.volumes.handle_for(descriptor.clone());
            if is_new {
                inner.append(
                    &Record::IdentifyVolume {
                        handle,
                        volume_id: descriptor.id,
                        path: descriptor.path,
                    },
                    timestamp,
                )?;
            }
            Ok(handle)
        })
    }

    /// Returns the process-local handle for `descriptor`, declaring it with
    /// an IT record the first time it is seen. `descriptor.volume_handle`
    /// must already have been returned by [`Self::handle_for_volume`].
    pub fn handle_for_tree(&self, descriptor: TreeDescriptor, timestamp: i64) -> Result<u32> {
        self.with_inner(|inner| {
            let (handle, is_new) = inner.trees.handle_for(descriptor.clone());
            if is_new {
                inner.append(
                    &Record::IdentifyTree {
                        handle,
                        volume_handle: descriptor.volume_handle,
                        tree_name: descriptor.tree_name,
                    },
                    timestamp,
                )?;
            }
            Ok(handle)
        })
    }

    /// Journals a page image. `buffer` is the full live page; the packed,
    /// gap-omitted payload is computed here. A `timestamp` of
    /// [`record::TRANSIENT_TIMESTAMP`] marks the page as transient: it is
    /// durable for crash safety but recovery will discard rather than
    /// install it.
    pub fn write_page_to_journal(&self, volume: VolumeDescriptor, volume_handle: u32, page: u64, buffer: &[u8], timestamp: i64) -> Result<()> {
        let (left_size, payload) = record::compact_buffer(buffer);
        self.with_inner(|inner| {
            let addr = inner.append(
                &Record::PageImage {
                    volume_handle,
                    buffer_size: buffer.len() as u32,
                    left_size,
                    page_address: page,
                    payload,
                },
                timestamp,
            )?;
            if timestamp != record::TRANSIENT_TIMESTAMP {
                inner.page_index.insert(volume, page, addr);
            }
            Ok(())
        })
    }

    /// Journals a checkpoint. Every page image written before `timestamp`
    /// is now eligible for copy-back (subject to `copier_timestamp_limit`).
    pub fn write_checkpoint_to_journal(&self, millis: i64, timestamp: i64) -> Result<()> {
        self.with_inner(|inner| {
            inner.append(&Record::Checkpoint { millis }, timestamp)?;
            inner.last_checkpoint = Some(Checkpoint { timestamp, millis });
            Ok(())
        })
    }

    /// Reads a page back from the journal, e.g. because it has not yet been
    /// copied to its home volume. Returns `None` if the journal holds no
    /// image for `(volume, page)`.
    pub fn read_page_from_journal(&self, volume: &VolumeDescriptor, page: u64) -> Result<Option<Vec<u8>>> {
        let addr = {
            let inner = self.inner.lock().unwrap();
            match inner.page_index.get(volume, page) {
                Some(addr) => addr,
                None => return Ok(None),
            }
        };
        let record = copyback::read_record_at(&self.repo, addr.generation, addr.offset, self.max_record_len)?;
        let Record::PageImage {
            buffer_size,
            left_size,
            page_address,
            payload,
            ..
        } = record
        else {
            return Err(JournalError::IllegalState("page index pointed at a non-page-image record"));
        };
        if page_address != page {
            return Err(JournalError::Corrupt(CorruptReason::PageAddressMismatch {
                expected: page,
                found: page_address,
            }));
        }
        Ok(Some(record::reconstruct_buffer(buffer_size, left_size, &payload)))
    }

    /// Forces one urgent copy-back cycle, bounded by `to_timestamp`, rather
    /// than waiting for the periodic worker's urgency score to trip. Runs
    /// synchronously on the calling thread; the periodic worker keeps
    /// running independently and `opts.suspend_copying` does not apply here
    /// -- that flag only pauses the background worker.
    pub fn copy_back(&self, to_timestamp: i64) -> Result<()> {
        {
            let guard = self.inner.lock().unwrap();
            if guard.closed {
                return Err(JournalError::IllegalState("journal is closed"));
            }
        }
        let mut io_meter = IoRateMeter::new();
        run_copy_back_cycle(
            &self.repo,
            &self.opts,
            &*self.volumes_dir,
            &self.inner,
            &mut io_meter,
            self.max_record_len,
            Some(to_timestamp),
        )
    }

    /// Stops the flush and copy-back workers and forces the active segment
    /// one last time. Further calls into the manager return
    /// [`JournalError::IllegalState`].
    pub fn close(&mut self) -> Result<()> {
        self.copyback_stop.store(true, Ordering::Release);
        if let Some(handle) = self.copyback_handle.take() {
            let _ = handle.join();
        }
        self.flush.shutdown();

        let mut inner = self.inner.lock().unwrap();
        inner.writer.force()?;

        // An empty page index means every journaled page has already been
        // copied back to its home volume: nothing on disk is needed to
        // reconstruct state, so the whole journal directory can go.
        if inner.page_index.is_empty() {
            for generation in self.repo.existing_generations()? {
                match self.repo.remove_segment(generation) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!("journal: closed with an empty page index, deleted all segment files");
        }

        inner.page_index.clear();
        inner.volumes.clear();
        inner.trees.clear();
        inner.closed = true;
        Ok(())
    }
}

impl<R: Repo> Drop for JournalManager<R> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// One copy-back cycle: score urgency, snapshot candidates under the lock,
/// write them back to their home volumes without the lock held, then
/// reconcile and reclaim segments under the lock again.
///
/// `forced_to_timestamp` is `Some` only when called from
/// [`JournalManager::copy_back`]: it forces urgent mode (bypassing the
/// minimum-urgency gate and `suspend_copying`, which only pauses the
/// periodic background worker) and bounds the ceiling by the given
/// timestamp in addition to the usual checkpoint/config limits.
fn run_copy_back_cycle<R: Repo>(
    repo: &R,
    opts: &JournalOptions,
    volumes_dir: &dyn VolumeDirectory,
    inner: &Arc<Mutex<Inner<R>>>,
    io_meter: &mut IoRateMeter,
    max_record_len: u32,
    forced_to_timestamp: Option<i64>,
) -> Result<()> {
    let (candidates, mut missed, current_generation) = {
        let guard = inner.lock().unwrap();
        if guard.closed {
            return Ok(());
        }

        let (urgent, ceiling) = if let Some(to_timestamp) = forced_to_timestamp {
            let ceiling = guard
                .last_checkpoint
                .map(|c| c.timestamp)
                .unwrap_or(i64::MIN)
                .min(opts.copier_timestamp_limit)
                .min(to_timestamp);
            debug!("copy-back: urgent cycle forced via copy_back, ceiling={ceiling}");
            (true, ceiling)
        } else {
            if opts.suspend_copying {
                return Ok(());
            }
            let segment_count = guard.writer.generation() - guard.first_generation + 1;
            let score = copyback::urgency(guard.page_index.len(), opts.write_buffer_size.max(1), segment_count);
            if score < opts.minimum_urgency {
                return Ok(());
            }
            // Falling further behind than a couple of segments: widen the
            // search past the oldest live segment instead of waiting on it.
            let urgent = segment_count > 2;
            let ceiling = guard
                .last_checkpoint
                .map(|c| c.timestamp)
                .unwrap_or(i64::MIN)
                .min(opts.copier_timestamp_limit);
            debug!("copy-back: cycle starting, urgency={score}");
            (urgent, ceiling)
        };

        let (candidates, missed) = copyback::snapshot_candidates(&guard.page_index, guard.first_generation, urgent, ceiling);
        debug!("copy-back: {} candidate(s)", candidates.len());
        (candidates, missed, guard.writer.generation())
    };

    if !candidates.is_empty() {
        let (written, write_missed) = copyback::write_back(candidates, repo, volumes_dir, io_meter, opts, max_record_len)?;
        if let Some(m) = write_missed {
            missed = Some(match missed {
                Some(existing) if (existing.generation, existing.offset) <= (m.generation, m.offset) => existing,
                _ => m,
            });
        }

        let mut guard = inner.lock().unwrap();
        missed = copyback::reconcile(&mut guard.page_index, &written, missed);

        let reclaim_below = missed
            .map(|m| m.generation)
            .into_iter()
            .chain(guard.page_index.min_generation())
            .min()
            .unwrap_or(current_generation)
            .min(current_generation);

        for generation in guard.first_generation..reclaim_below {
            match repo.remove_segment(generation) {
                Ok(()) => debug!("copy-back: reclaimed segment {generation}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        guard.first_generation = reclaim_below.max(guard.first_generation);
    }

    // Nothing missed and nothing left to copy back: if the active segment
    // has outgrown a full write window it is worth reclaiming now rather
    // than waiting for it to hit maximum_file_size on its own.
    let mut guard = inner.lock().unwrap();
    if missed.is_none() && guard.page_index.is_empty() && guard.writer.tail_offset() as usize > opts.write_buffer_size {
        let old_generation = guard.writer.generation();
        guard.writer.rollover()?;
        guard.volumes.clear();
        guard.trees.clear();
        match repo.remove_segment(old_generation) {
            Ok(()) => debug!("copy-back: rolled over and reclaimed drained segment {old_generation}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        guard.first_generation = guard.writer.generation();
    }

    Ok(())
}
