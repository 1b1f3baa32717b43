//! Uniform byte-producer abstraction over file sources, memory buffers and
//! compositional filters.
//!
//! A stream used by any writer must be repeatable: layout computation and
//! body emission each read it once. Stream identity is the triple
//! `(fs_id, dev_id, ino_id)`; together with the size it keys content
//! deduplication and hardlink detection.

pub mod filter;
#[cfg(feature = "zisofs")]
pub mod zisofs;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{IsoError, Result};
use crate::fsource::FileSource;

/// Filesystem id used by in-memory streams.
pub const MEM_FS_ID: u32 = 2;
/// Filesystem id used by cut-out streams.
pub const CUT_OUT_FS_ID: u32 = 3;
/// Filesystem id used by filter streams.
pub const FILTER_FS_ID: u32 = 4;

static MEM_SERIAL: AtomicU64 = AtomicU64::new(1);
static CUT_OUT_SERIAL: AtomicU64 = AtomicU64::new(1);
static FILTER_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Stream identity used for deduplication and hardlink detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub fs_id: u32,
    pub dev_id: u64,
    pub ino_id: u64,
}

/// Outcome of [`IsoStream::open`]: whether the source still has the size
/// cached at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenSize {
    /// Actual size equals the cached size.
    Exact,
    /// Source grew; content will be truncated to the planned span.
    Larger,
    /// Source shrank; the planned span will be zero-padded.
    Smaller,
}

/// Polymorphic byte producer.
pub trait IsoStream: Send {
    /// Short class name for diagnostics ("mem", "fsrc", "cut_out", ...).
    fn class_name(&self) -> &'static str;

    fn open(&mut self) -> Result<OpenSize>;

    fn close(&mut self) -> Result<()>;

    /// Size of the stream in bytes, as cached at construction or the last
    /// [`IsoStream::update_size`].
    fn size(&self) -> u64;

    /// Read into `buf`; 0 means EOF. Only valid between open and close.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the stream can be opened and read more than once.
    fn is_repeatable(&self) -> bool;

    /// Re-derive the cached size from the underlying source.
    fn update_size(&mut self) -> Result<()>;

    fn id(&self) -> StreamId;

    /// The wrapped input stream of a filter, if any. Walking this chain
    /// reaches the most-original bytes of a filtered file.
    fn input_stream(&mut self) -> Option<&mut SharedStream> {
        None
    }
}

/// Shared handle to a stream; several tree nodes may reference the same
/// content, and the registry clones the handle it deduplicates on.
pub type SharedStream = Arc<Mutex<dyn IsoStream>>;

/// Wrap a concrete stream into a [`SharedStream`].
pub fn share(stream: impl IsoStream + 'static) -> SharedStream {
    Arc::new(Mutex::new(stream))
}

/// Read the full requested amount unless EOF or error occurs; missing
/// bytes are zero-filled. Returns `Ok(true)` when the buffer was filled
/// completely, `Ok(false)` on EOF.
pub fn read_buffer(stream: &mut dyn IsoStream, buf: &mut [u8]) -> Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        match stream.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) => {
                buf[got..].fill(0);
                return Err(e);
            }
        }
    }
    if got < buf.len() {
        buf[got..].fill(0);
        return Ok(false);
    }
    Ok(true)
}

/// A stream over the content of a [`FileSource`].
pub struct FSrcStream {
    src: Box<dyn FileSource>,
    fs_id: u32,
    dev_id: u64,
    ino_id: u64,
    size: u64,
}

impl FSrcStream {
    /// Wrap `src`. Stats once to cache identity and size; directories are
    /// rejected.
    pub fn new(src: Box<dyn FileSource>) -> Result<Self> {
        let info = src.stat()?;
        if info.is_dir() {
            return Err(IsoError::WrongArg(format!(
                "{} is a directory",
                src.path()
            )));
        }
        src.access()?;
        let fs_id = src.filesystem_id();
        Ok(FSrcStream {
            fs_id,
            dev_id: info.dev,
            ino_id: info.ino,
            size: info.size,
            src,
        })
    }

    pub fn path(&self) -> String {
        self.src.path()
    }
}

impl IsoStream for FSrcStream {
    fn class_name(&self) -> &'static str {
        "fsrc"
    }

    fn open(&mut self) -> Result<OpenSize> {
        let info = self.src.stat()?;
        self.src.open()?;
        Ok(if info.size == self.size {
            OpenSize::Exact
        } else if info.size > self.size {
            OpenSize::Larger
        } else {
            OpenSize::Smaller
        })
    }

    fn close(&mut self) -> Result<()> {
        self.src.close()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.src.read(buf)
    }

    fn is_repeatable(&self) -> bool {
        true
    }

    fn update_size(&mut self) -> Result<()> {
        self.size = self.src.stat()?.size;
        Ok(())
    }

    fn id(&self) -> StreamId {
        StreamId {
            fs_id: self.fs_id,
            dev_id: self.dev_id,
            ino_id: self.ino_id,
        }
    }
}

/// A fully repeatable stream over an owned byte buffer.
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
    opened: bool,
    ino_id: u64,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryStream {
            data,
            pos: 0,
            opened: false,
            ino_id: MEM_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl IsoStream for MemoryStream {
    fn class_name(&self) -> &'static str {
        "mem"
    }

    fn open(&mut self) -> Result<OpenSize> {
        self.pos = 0;
        self.opened = true;
        Ok(OpenSize::Exact)
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.opened {
            return Err(IsoError::WrongArg("memory stream is not open".into()));
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn is_repeatable(&self) -> bool {
        true
    }

    fn update_size(&mut self) -> Result<()> {
        Ok(())
    }

    fn id(&self) -> StreamId {
        StreamId {
            fs_id: MEM_FS_ID,
            dev_id: 0,
            ino_id: self.ino_id,
        }
    }
}

/// A stream over the window `[offset, offset + size)` of a larger source,
/// used for carving a single logical file out of a bigger one.
pub struct CutOutStream {
    src: Box<dyn FileSource>,
    offset: u64,
    size: u64,
    pos: u64,
    ino_id: u64,
}

impl CutOutStream {
    pub fn new(src: Box<dyn FileSource>, offset: u64, size: u64) -> Result<Self> {
        let info = src.stat()?;
        if !info.is_reg() {
            return Err(IsoError::WrongArg(format!(
                "{} is not a regular file",
                src.path()
            )));
        }
        if offset >= info.size {
            return Err(IsoError::WrongArg("cut-out offset past end of file".into()));
        }
        let size = size.min(info.size - offset);
        Ok(CutOutStream {
            src,
            offset,
            size,
            pos: 0,
            ino_id: CUT_OUT_SERIAL.fetch_add(1, Ordering::Relaxed),
        })
    }
}

impl IsoStream for CutOutStream {
    fn class_name(&self) -> &'static str {
        "cut_out"
    }

    fn open(&mut self) -> Result<OpenSize> {
        self.src.open()?;
        self.src.lseek(self.offset)?;
        self.pos = 0;
        Ok(OpenSize::Exact)
    }

    fn close(&mut self) -> Result<()> {
        self.src.close()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.size - self.pos;
        if remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = self.src.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn is_repeatable(&self) -> bool {
        true
    }

    fn update_size(&mut self) -> Result<()> {
        // The window was fixed at creation; re-deriving it from a source
        // that may have changed would silently move the carved span.
        Err(IsoError::WrongArg(
            "cut-out streams do not support update_size".into(),
        ))
    }

    fn id(&self) -> StreamId {
        StreamId {
            fs_id: CUT_OUT_FS_ID,
            dev_id: 0,
            ino_id: self.ino_id,
        }
    }
}

pub(crate) fn next_filter_serial() -> u64 {
    FILTER_SERIAL.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_identity_is_unique() {
        let a = MemoryStream::new(vec![1, 2, 3]);
        let b = MemoryStream::new(vec![1, 2, 3]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().fs_id, MEM_FS_ID);
    }

    #[test]
    fn memory_stream_is_repeatable() {
        let mut s = MemoryStream::new(b"abcdef".to_vec());
        for _ in 0..2 {
            s.open().unwrap();
            let mut buf = [0u8; 16];
            let n = s.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"abcdef");
            s.close().unwrap();
        }
    }

    #[test]
    fn read_buffer_zero_fills_tail() {
        let mut s = MemoryStream::new(b"xy".to_vec());
        s.open().unwrap();
        let mut buf = [0xFFu8; 6];
        let filled = read_buffer(&mut s, &mut buf).unwrap();
        assert!(!filled);
        assert_eq!(&buf, b"xy\0\0\0\0");
    }

    #[test]
    fn cut_out_rejects_update_size() {
        use crate::fsource::LocalFileSource;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[7u8; 64])
            .unwrap();

        let mut s = CutOutStream::new(Box::new(LocalFileSource::new(&path)), 8, 16).unwrap();
        assert_eq!(s.size(), 16);
        assert!(s.update_size().is_err());

        s.open().unwrap();
        let mut buf = [0u8; 64];
        let mut got = 0;
        loop {
            let n = s.read(&mut buf[got..]).unwrap();
            if n == 0 {
                break;
            }
            got += n;
        }
        assert_eq!(got, 16);
        s.close().unwrap();
    }
}
