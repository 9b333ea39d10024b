use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use super::{parse_segment_file_name, segment_file_name, Repo, SegmentWriterHandle};

/// A journal repository which stores segments as ordinary files on disk,
/// writing through a memory-mapped window (mirrors the technique
/// `commitlog::index::indexfile::IndexFileMut` uses for its offset index,
/// applied here to the segment body itself).
#[derive(Clone)]
pub struct Fs {
    root: PathBuf,
}

impl Fs {
    /// Creates a journal repository rooted at `root`, which must name an
    /// extant, writable directory.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn segment_path(&self, generation: u64) -> PathBuf {
        self.root.join(segment_file_name(generation))
    }
}

impl Repo for Fs {
    type Writer = FsSegmentWriter;
    type Reader = File;

    fn create_segment(&self, generation: u64) -> io::Result<Self::Writer> {
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.segment_path(generation))
            .or_else(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    let file = File::options().read(true).write(true).open(self.segment_path(generation))?;
                    if file.metadata()?.len() == 0 {
                        debug!("segment {generation} already exists and is empty, resuming");
                        return Ok(file);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("segment {generation} already exists and is non-empty"),
                    ));
                }
                Err(e)
            })?;
        Ok(FsSegmentWriter::new(file))
    }

    fn open_segment_writer(&self, generation: u64) -> io::Result<Self::Writer> {
        let file = File::options().read(true).write(true).open(self.segment_path(generation))?;
        Ok(FsSegmentWriter::new(file))
    }

    fn open_segment_reader(&self, generation: u64) -> io::Result<Self::Reader> {
        File::open(self.segment_path(generation))
    }

    fn remove_segment(&self, generation: u64) -> io::Result<()> {
        fs::remove_file(self.segment_path(generation))
    }

    fn existing_generations(&self) -> io::Result<Vec<u64>> {
        let mut generations = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(generation) = parse_segment_file_name(&name.to_string_lossy()) {
                generations.push(generation);
            }
        }
        generations.sort_unstable();
        Ok(generations)
    }
}

pub struct FsSegmentWriter {
    file: File,
    map: Option<MmapMut>,
    window_offset: u64,
    pos: usize,
}

impl FsSegmentWriter {
    fn new(file: File) -> Self {
        Self {
            file,
            map: None,
            window_offset: 0,
            pos: 0,
        }
    }
}

impl SegmentWriterHandle for FsSegmentWriter {
    fn map_window(&mut self, offset: u64, len: usize) -> io::Result<()> {
        // Drop any previous mapping before growing the file, so we never
        // hold a stale mmap over a file we're about to resize.
        self.map = None;

        let needed = offset + len as u64;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }

        // SAFETY: the file is exclusively owned by this writer for the
        // lifetime of the mapping; no other process is expected to
        // truncate or resize a journal segment out from under us.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&self.file)? };
        self.map = Some(map);
        self.window_offset = offset;
        self.pos = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no window mapped"))?;
        if self.pos + buf.len() > map.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write exceeds mapped window"));
        }
        map[self.pos..self.pos + buf.len()].copy_from_slice(buf);
        self.pos += buf.len();
        Ok(())
    }

    fn window_position(&self) -> usize {
        self.pos
    }

    fn force(&mut self) -> io::Result<()> {
        if let Some(map) = self.map.as_mut() {
            map.flush()?;
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.map = None;
        self.file.set_len(len)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn write_then_read_back_through_window() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Fs::new(dir.path()).unwrap();
        let mut writer = repo.create_segment(0).unwrap();
        writer.map_window(0, 4096).unwrap();
        writer.write(b"hello").unwrap();
        writer.force().unwrap();
        writer.truncate(5).unwrap();
        writer.sync_all().unwrap();

        let mut reader = repo.open_segment_reader(0).unwrap();
        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn existing_generations_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Fs::new(dir.path()).unwrap();
        for g in [3, 1, 2] {
            repo.create_segment(g).unwrap();
        }
        assert_eq!(repo.existing_generations().unwrap(), vec![1, 2, 3]);
    }
}
