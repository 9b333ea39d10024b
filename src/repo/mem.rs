//! In-memory [`Repo`] implementation used by most unit tests, modeled on
//! `commitlog::repo::mem::Memory`.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, RwLock};

use super::{Repo, SegmentWriterHandle};

type SharedBytes = Arc<RwLock<Vec<u8>>>;

#[derive(Clone, Debug, Default)]
pub struct Memory(Arc<RwLock<BTreeMap<u64, SharedBytes>>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repo for Memory {
    type Writer = MemSegmentWriter;
    type Reader = MemReader;

    fn create_segment(&self, generation: u64) -> io::Result<Self::Writer> {
        let mut inner = self.0.write().unwrap();
        match inner.get(&generation) {
            Some(buf) if !buf.read().unwrap().is_empty() => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("segment {generation} already exists"),
            )),
            Some(buf) => Ok(MemSegmentWriter::new(Arc::clone(buf))),
            None => {
                let buf: SharedBytes = Arc::default();
                inner.insert(generation, Arc::clone(&buf));
                Ok(MemSegmentWriter::new(buf))
            }
        }
    }

    fn open_segment_writer(&self, generation: u64) -> io::Result<Self::Writer> {
        let inner = self.0.read().unwrap();
        let buf = inner
            .get(&generation)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("segment {generation} does not exist")))?;
        Ok(MemSegmentWriter::new(Arc::clone(buf)))
    }

    fn open_segment_reader(&self, generation: u64) -> io::Result<Self::Reader> {
        let inner = self.0.read().unwrap();
        let buf = inner
            .get(&generation)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("segment {generation} does not exist")))?;
        Ok(MemReader {
            buf: Arc::clone(buf),
            pos: 0,
        })
    }

    fn remove_segment(&self, generation: u64) -> io::Result<()> {
        let mut inner = self.0.write().unwrap();
        inner
            .remove(&generation)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("segment {generation} does not exist")))
    }

    fn existing_generations(&self) -> io::Result<Vec<u64>> {
        Ok(self.0.read().unwrap().keys().copied().collect())
    }
}

pub struct MemSegmentWriter {
    buf: SharedBytes,
    window_offset: u64,
    window_len: usize,
    pos: usize,
}

impl MemSegmentWriter {
    fn new(buf: SharedBytes) -> Self {
        Self {
            buf,
            window_offset: 0,
            window_len: 0,
            pos: 0,
        }
    }
}

impl SegmentWriterHandle for MemSegmentWriter {
    fn map_window(&mut self, offset: u64, len: usize) -> io::Result<()> {
        let needed = offset as usize + len;
        let mut inner = self.buf.write().unwrap();
        if inner.len() < needed {
            inner.resize(needed, 0);
        }
        self.window_offset = offset;
        self.window_len = len;
        self.pos = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.pos + buf.len() > self.window_len {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write exceeds mapped window"));
        }
        let mut inner = self.buf.write().unwrap();
        let start = self.window_offset as usize + self.pos;
        inner[start..start + buf.len()].copy_from_slice(buf);
        self.pos += buf.len();
        Ok(())
    }

    fn window_position(&self) -> usize {
        self.pos
    }

    fn force(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.buf.write().unwrap().resize(len as usize, 0);
        Ok(())
    }

    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct MemReader {
    buf: SharedBytes,
    pos: u64,
}

impl io::Read for MemReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let inner = self.buf.read().unwrap();
        let pos = self.pos as usize;
        if pos > inner.len() {
            return Ok(0);
        }
        let n = io::Read::read(&mut &inner[pos..], out)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl io::Seek for MemReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let len = self.buf.read().unwrap().len() as u64;
        let (base, offset) = match pos {
            io::SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            io::SeekFrom::End(n) => (len, n),
            io::SeekFrom::Current(n) => (self.pos, n),
        };
        match base.checked_add_signed(offset) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "seek out of range")),
        }
    }
}
