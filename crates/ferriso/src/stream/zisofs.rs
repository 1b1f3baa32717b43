//! zisofs compression filter stream.
//!
//! Output layout: an 8-byte magic, the uncompressed size (LE u32), the
//! header size divided by 4, log2 of the block size (fixed 15, 32 KiB),
//! two reserved bytes; then `ceil(size / 32768) + 1` little-endian u32
//! block pointers (first = offset of the first data byte, last = total
//! size); then the zlib-compressed blocks. A block of all zeros is encoded
//! as zero length. Readable by zisofs-tools and Linux kernels.
//!
//! Sizing needs a first pass over the input, so the wrapped stream must be
//! repeatable; the second pass re-reads and emits.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{IsoError, Result};
use crate::stream::{next_filter_serial, IsoStream, OpenSize, SharedStream, StreamId, FILTER_FS_ID};

const ZISOFS_MAGIC: [u8; 8] = [0x37, 0xE4, 0x53, 0x96, 0xC9, 0xDB, 0xD6, 0x07];
const BLOCK_SIZE_LOG2: u8 = 15;
const ZBLOCK_SIZE: usize = 1 << BLOCK_SIZE_LOG2;
const HEADER_SIZE: usize = 16;

fn compress_block(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)
        .and_then(|_| enc.finish())
        .map_err(|e| IsoError::FilterBroken(format!("zisofs deflate failed: {e}")))
}

struct Running {
    /// Header plus pointer table, then per-block compressed data.
    pending: Vec<u8>,
    pending_pos: usize,
    blocks_done: usize,
    nblocks: usize,
}

/// A stream that emits the zisofs-compressed form of its input.
pub struct ZisofsStream {
    inner: SharedStream,
    ino_id: u64,
    uncompressed_size: u64,
    /// Compressed size of each block, discovered by the first pass.
    block_sizes: Option<Vec<u32>>,
    total_size: u64,
    running: Option<Running>,
}

impl ZisofsStream {
    pub fn new(inner: SharedStream) -> Result<Self> {
        let (size, repeatable) = {
            let guard = inner.lock().expect("stream poisoned");
            (guard.size(), guard.is_repeatable())
        };
        if !repeatable {
            return Err(IsoError::WrongArg(
                "zisofs input must be repeatable".into(),
            ));
        }
        if size > u32::MAX as u64 {
            return Err(IsoError::ZisofsTooBig);
        }
        Ok(ZisofsStream {
            inner,
            ino_id: next_filter_serial(),
            uncompressed_size: size,
            block_sizes: None,
            total_size: 0,
            running: None,
        })
    }

    fn nblocks(&self) -> usize {
        crate::types::div_up(self.uncompressed_size, ZBLOCK_SIZE as u64) as usize
    }

    /// First pass: compress every block once to learn the pointer table.
    fn discover_sizes(&mut self) -> Result<()> {
        if self.block_sizes.is_some() {
            return Ok(());
        }
        let nblocks = self.nblocks();
        let mut sizes = Vec::with_capacity(nblocks);
        {
            let mut inner = self.inner.lock().expect("stream poisoned");
            inner.open()?;
            let mut remaining = self.uncompressed_size;
            let mut buf = vec![0u8; ZBLOCK_SIZE];
            while remaining > 0 {
                let want = (remaining).min(ZBLOCK_SIZE as u64) as usize;
                let filled = crate::stream::read_buffer(&mut *inner, &mut buf[..want]);
                if let Err(e) = filled {
                    let _ = inner.close();
                    return Err(e);
                }
                if buf[..want].iter().all(|&b| b == 0) {
                    sizes.push(0);
                } else {
                    sizes.push(compress_block(&buf[..want])?.len() as u32);
                }
                remaining -= want as u64;
            }
            inner.close()?;
        }
        let pointer_bytes = (nblocks + 1) * 4;
        let data_start = (HEADER_SIZE + pointer_bytes) as u64;
        self.total_size = data_start + sizes.iter().map(|&s| s as u64).sum::<u64>();
        self.block_sizes = Some(sizes);
        Ok(())
    }

    fn header_and_pointers(&self) -> Vec<u8> {
        let sizes = self.block_sizes.as_ref().expect("sizes discovered");
        let nblocks = self.nblocks();
        let mut out = Vec::with_capacity(HEADER_SIZE + (nblocks + 1) * 4);
        out.extend_from_slice(&ZISOFS_MAGIC);
        out.extend_from_slice(&(self.uncompressed_size as u32).to_le_bytes());
        out.push((HEADER_SIZE / 4) as u8);
        out.push(BLOCK_SIZE_LOG2);
        out.extend_from_slice(&[0, 0]);
        let mut pos = (HEADER_SIZE + (nblocks + 1) * 4) as u32;
        out.extend_from_slice(&pos.to_le_bytes());
        for &s in sizes {
            pos += s;
            out.extend_from_slice(&pos.to_le_bytes());
        }
        out
    }
}

impl IsoStream for ZisofsStream {
    fn class_name(&self) -> &'static str {
        "ziso"
    }

    fn open(&mut self) -> Result<OpenSize> {
        if self.running.is_some() {
            return Err(IsoError::WrongArg("zisofs stream already open".into()));
        }
        self.discover_sizes()?;
        self.inner.lock().expect("stream poisoned").open()?;
        self.running = Some(Running {
            pending: self.header_and_pointers(),
            pending_pos: 0,
            blocks_done: 0,
            nblocks: self.nblocks(),
        });
        Ok(OpenSize::Exact)
    }

    fn close(&mut self) -> Result<()> {
        if self.running.take().is_none() {
            return Err(IsoError::WrongArg("zisofs stream is not open".into()));
        }
        self.inner.lock().expect("stream poisoned").close()
    }

    fn size(&self) -> u64 {
        self.total_size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.running.is_none() {
            return Err(IsoError::WrongArg("zisofs stream is not open".into()));
        }
        loop {
            let run = self.running.as_mut().expect("zisofs open");
            if run.pending_pos < run.pending.len() {
                let n = buf.len().min(run.pending.len() - run.pending_pos);
                buf[..n].copy_from_slice(&run.pending[run.pending_pos..run.pending_pos + n]);
                run.pending_pos += n;
                return Ok(n);
            }
            if run.blocks_done == run.nblocks {
                return Ok(0);
            }
            let offset = run.blocks_done as u64 * ZBLOCK_SIZE as u64;
            let want = (self.uncompressed_size - offset).min(ZBLOCK_SIZE as u64) as usize;
            let mut block = vec![0u8; want];
            crate::stream::read_buffer(
                &mut *self.inner.lock().expect("stream poisoned"),
                &mut block,
            )?;
            let run = self.running.as_mut().expect("zisofs open");
            run.blocks_done += 1;
            if block.iter().all(|&b| b == 0) {
                // encoded as zero length, nothing to emit
                continue;
            }
            run.pending = compress_block(&block)?;
            run.pending_pos = 0;
        }
    }

    fn is_repeatable(&self) -> bool {
        true
    }

    fn update_size(&mut self) -> Result<()> {
        self.block_sizes = None;
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.update_size()?;
        let size = inner.size();
        drop(inner);
        if size > u32::MAX as u64 {
            return Err(IsoError::ZisofsTooBig);
        }
        self.uncompressed_size = size;
        self.discover_sizes()
    }

    fn id(&self) -> StreamId {
        StreamId {
            fs_id: FILTER_FS_ID,
            dev_id: 0,
            ino_id: self.ino_id,
        }
    }

    fn input_stream(&mut self) -> Option<&mut SharedStream> {
        Some(&mut self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{share, MemoryStream};
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn drain(s: &mut dyn IsoStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = s.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn header_layout_and_roundtrip() {
        let mut payload = vec![0u8; ZBLOCK_SIZE + 100];
        for (i, b) in payload.iter_mut().enumerate().take(ZBLOCK_SIZE) {
            *b = (i % 251) as u8;
        }
        // second block is mostly zeros plus a marker
        payload[ZBLOCK_SIZE + 50] = 7;

        let mut z = ZisofsStream::new(share(MemoryStream::new(payload.clone()))).unwrap();
        z.open().unwrap();
        let out = drain(&mut z);
        z.close().unwrap();

        assert_eq!(out.len() as u64, z.size());
        assert_eq!(&out[..8], &ZISOFS_MAGIC);
        assert_eq!(
            u32::from_le_bytes(out[8..12].try_into().unwrap()),
            payload.len() as u32
        );
        assert_eq!(out[12], 4);
        assert_eq!(out[13], BLOCK_SIZE_LOG2);

        // two blocks -> three pointers
        let ptr = |i: usize| {
            u32::from_le_bytes(out[HEADER_SIZE + 4 * i..HEADER_SIZE + 4 * i + 4].try_into().unwrap())
        };
        assert_eq!(ptr(0) as usize, HEADER_SIZE + 3 * 4);
        assert_eq!(ptr(2) as usize, out.len());

        // decompress both blocks and compare
        let mut restored = Vec::new();
        for i in 0..2 {
            let (a, b) = (ptr(i) as usize, ptr(i + 1) as usize);
            let mut dec = ZlibDecoder::new(&out[a..b]);
            dec.read_to_end(&mut restored).unwrap();
        }
        assert_eq!(restored, payload);
    }

    #[test]
    fn zero_block_has_zero_length() {
        let payload = vec![0u8; ZBLOCK_SIZE];
        let mut z = ZisofsStream::new(share(MemoryStream::new(payload))).unwrap();
        z.open().unwrap();
        let out = drain(&mut z);
        z.close().unwrap();
        // header + 2 pointers, no data at all
        assert_eq!(out.len(), HEADER_SIZE + 8);
        let first = u32::from_le_bytes(out[16..20].try_into().unwrap());
        let last = u32::from_le_bytes(out[20..24].try_into().unwrap());
        assert_eq!(first, last);
    }
}
