//! Pluggable segment storage backends.
//!
//! This mirrors `commitlog::repo::Repo`: an internal trait that lets the
//! segment writer and the recovery engine run unmodified against either a
//! real directory of files or an in-memory stand-in used by most unit
//! tests.

use std::io;

pub(crate) mod fs;
#[cfg(any(test, feature = "test"))]
pub mod mem;

pub use fs::Fs;
#[cfg(any(test, feature = "test"))]
pub use mem::Memory;

/// The file-name base shared by every segment in a journal directory.
/// Segment files are named `<SEGMENT_BASE>.<16-digit-generation>`, which
/// sorts lexicographically in generation order.
pub const SEGMENT_BASE: &str = "journal";

pub fn segment_file_name(generation: u64) -> String {
    format!("{SEGMENT_BASE}.{generation:016}")
}

/// Parses a file name produced by [`segment_file_name`] back into a
/// generation number. Returns `None` for anything else found in the
/// journal directory (the base spec requires it contain no other files
/// matching the segment pattern, but unrelated files, e.g. `.gitignore`,
/// are simply ignored).
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SEGMENT_BASE)?.strip_prefix('.')?;
    if digits.len() != 16 {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// A repository of journal segments.
pub trait Repo: Clone + Send + Sync + 'static {
    type Writer: SegmentWriterHandle;
    type Reader: io::Read + io::Seek + Send;

    /// Creates a brand new segment for `generation`. Must fail with
    /// [`io::ErrorKind::AlreadyExists`] if it already exists and is
    /// non-empty.
    fn create_segment(&self, generation: u64) -> io::Result<Self::Writer>;

    /// Opens an existing segment for appending, e.g. to resume the active
    /// segment across a restart.
    fn open_segment_writer(&self, generation: u64) -> io::Result<Self::Writer>;

    /// Opens an existing segment for sequential reading (recovery, copy-back,
    /// the page read path, `journalctl`).
    fn open_segment_reader(&self, generation: u64) -> io::Result<Self::Reader>;

    /// Removes the segment for `generation`. Returns
    /// [`io::ErrorKind::NotFound`] if it does not exist.
    fn remove_segment(&self, generation: u64) -> io::Result<()>;

    /// Lists the generations present, sorted ascending (i.e. in the same
    /// order the segment file names sort lexicographically).
    fn existing_generations(&self) -> io::Result<Vec<u64>>;
}

/// The write side of an open segment: a mapped window that can be advanced
/// ("rolled") to cover new regions of the file as they are appended to.
///
/// Implementations back this with `memmap2::MmapMut` over a real file
/// ([`fs::FsSegmentWriter`]) or with a shared `Vec<u8>`
/// ([`mem::MemSegmentWriter`]) for tests.
pub trait SegmentWriterHandle: Send {
    /// Maps (or re-maps) the write window to cover `[offset, offset+len)`
    /// of the segment, growing the underlying storage if needed. Resets
    /// the window-relative write cursor to zero.
    fn map_window(&mut self, offset: u64, len: usize) -> io::Result<()>;

    /// Appends `buf` at the current window-relative cursor. The caller
    /// (the segment writer) is responsible for ensuring `buf` fits in the
    /// remaining window space.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// The window-relative write cursor.
    fn window_position(&self) -> usize;

    /// Forces the mapped window to stable storage.
    fn force(&mut self) -> io::Result<()>;

    /// Truncates the segment to its logical length (used on rollover to
    /// drop the unused tail of the last mapped window).
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn sync_all(&mut self) -> io::Result<()>;
}
