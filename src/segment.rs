//! Append-only segment file backed by a mapped write window, with rollover
//! on size limit.

use std::io;

use log::debug;

use crate::config::JournalOptions;
use crate::repo::{Repo, SegmentWriterHandle};

/// Writes records into the currently active segment of a journal, rolling
/// over to a new, higher-generation segment when the active one would
/// exceed its configured maximum size.
pub struct SegmentWriter<R: Repo> {
    repo: R,
    generation: u64,
    writer: R::Writer,
    /// Absolute offset within the segment file at which the currently
    /// mapped window begins.
    window_base: u64,
    write_buffer_size: usize,
    maximum_file_size: u64,
}

impl<R: Repo> SegmentWriter<R> {
    /// Creates a brand new segment at `generation` and maps its first write
    /// window.
    pub fn create(repo: R, generation: u64, opts: &JournalOptions) -> io::Result<Self> {
        let mut writer = repo.create_segment(generation)?;
        let window_len = opts.write_buffer_size.min(opts.maximum_file_size as usize);
        writer.map_window(0, window_len)?;
        debug!("segment {generation}: created, mapped window [0, {window_len})");
        Ok(Self {
            repo,
            generation,
            writer,
            window_base: 0,
            write_buffer_size: opts.write_buffer_size,
            maximum_file_size: opts.maximum_file_size,
        })
    }

    /// Resumes writing an existing segment whose logical length is already
    /// known (e.g. from the recovery engine), mapping a fresh window at the
    /// tail.
    pub fn resume(repo: R, generation: u64, tail_offset: u64, opts: &JournalOptions) -> io::Result<Self> {
        let mut writer = repo.open_segment_writer(generation)?;
        let window_len = opts
            .write_buffer_size
            .min((opts.maximum_file_size - tail_offset) as usize);
        writer.map_window(tail_offset, window_len)?;
        debug!("segment {generation}: resumed at tail={tail_offset}, mapped window [{tail_offset}, {})", tail_offset + window_len as u64);
        Ok(Self {
            repo,
            generation,
            writer,
            window_base: tail_offset,
            write_buffer_size: opts.write_buffer_size,
            maximum_file_size: opts.maximum_file_size,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The logical length of the active segment: everything appended so far.
    pub fn tail_offset(&self) -> u64 {
        self.window_base + self.writer.window_position() as u64
    }

    /// Ensures the next `size` bytes can be appended contiguously, remapping
    /// the write window or rolling over to a new segment as needed. Returns
    /// `true` if a rollover occurred, in which case the caller must clear
    /// its handle registry and re-emit IV/IT records before the next
    /// append.
    pub fn reserve(&mut self, size: usize) -> io::Result<bool> {
        let window_len = self.current_window_len();

        if self.writer.window_position() + size <= window_len {
            return Ok(false);
        }

        // Current window exhausted: force it and move to the next one.
        self.writer.force()?;
        let next_base = self.window_base + self.writer.window_position() as u64;

        if next_base + size as u64 > self.maximum_file_size {
            self.rollover()?;
            return Ok(true);
        }

        let next_len = self
            .write_buffer_size
            .max(size)
            .min((self.maximum_file_size - next_base) as usize);
        self.writer.map_window(next_base, next_len)?;
        self.window_base = next_base;
        Ok(false)
    }

    fn current_window_len(&self) -> usize {
        self.write_buffer_size.min((self.maximum_file_size - self.window_base) as usize)
    }

    /// Appends `bytes` into the current window. The caller must have
    /// already called [`Self::reserve`] with at least `bytes.len()`.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let offset = self.tail_offset();
        self.writer.write(bytes)?;
        Ok(offset)
    }

    pub fn force(&mut self) -> io::Result<()> {
        self.writer.force()
    }

    /// Truncates the active segment to its logical length, forces and
    /// closes it, deletes it if it ended up empty, then creates the next
    /// generation and maps a fresh window at offset 0.
    ///
    /// The caller (the journal manager) is responsible for clearing the
    /// handle registry: every segment must be self-describing.
    pub fn rollover(&mut self) -> io::Result<()> {
        let tail = self.tail_offset();
        self.writer.force()?;
        self.writer.truncate(tail)?;
        self.writer.sync_all()?;

        let old_generation = self.generation;
        if tail == 0 {
            debug!("segment {old_generation}: empty at rollover, removing");
            self.repo.remove_segment(old_generation)?;
        }

        let next_generation = old_generation + 1;
        let mut writer = self.repo.create_segment(next_generation)?;
        let window_len = self.write_buffer_size.min(self.maximum_file_size as usize);
        writer.map_window(0, window_len)?;

        debug!("segment {old_generation}: rolled over to {next_generation}");

        self.generation = next_generation;
        self.writer = writer;
        self.window_base = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Memory;

    fn opts(max_file: u64, write_buf: usize) -> JournalOptions {
        JournalOptions {
            maximum_file_size: max_file,
            write_buffer_size: write_buf,
            ..Default::default()
        }
    }

    #[test]
    fn append_within_one_window_never_rolls() {
        let repo = Memory::new();
        let mut w = SegmentWriter::create(repo, 0, &opts(1 << 20, 4096)).unwrap();
        for _ in 0..10 {
            let rolled = w.reserve(16).unwrap();
            assert!(!rolled);
            w.append(&[0u8; 16]).unwrap();
        }
        assert_eq!(w.generation(), 0);
        assert_eq!(w.tail_offset(), 160);
    }

    #[test]
    fn exceeding_max_file_size_rolls_over() {
        let repo = Memory::new();
        // Small enough that a handful of appends exceed it.
        let mut w = SegmentWriter::create(repo, 0, &opts(64, 64)).unwrap();
        let mut rolled_once = false;
        for _ in 0..8 {
            let rolled = w.reserve(16).unwrap();
            rolled_once |= rolled;
            w.append(&[1u8; 16]).unwrap();
        }
        assert!(rolled_once);
        assert!(w.generation() >= 1);
    }

    #[test]
    fn rollover_removes_empty_segment() {
        let repo = Memory::new();
        let mut w = SegmentWriter::create(repo.clone(), 0, &opts(1 << 20, 4096)).unwrap();
        w.rollover().unwrap();
        assert_eq!(w.generation(), 1);
        assert!(repo.existing_generations().unwrap().contains(&1));
        assert!(!repo.existing_generations().unwrap().contains(&0));
    }
}
