//! Session and per-file MD5 checksums.
//!
//! The session context is fed by every byte the producer emits. Tag
//! blocks record the digest over `[range_start, pos)` together with a
//! digest of the tag line itself, at fixed spots: after the descriptor
//! set terminator (superblock tag), after the directory structures (tree
//! tag), after the data area (session tag), and — for growable media —
//! relocated into the overwrite buffer when its position still lies in
//! the first 32 blocks. Per-file digests land in an array of 16-byte
//! entries after the data area.

use md5::Digest;

use crate::error::Result;
use crate::types::{div_up, BLOCK_SIZE};
use crate::write::{ImageWriter, WriteTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagType {
    Superblock,
    Tree,
    Session,
    RelocatedSuperblock,
}

impl TagType {
    fn id(&self) -> &'static str {
        match self {
            TagType::Superblock => "ferriso_sb_tag_v1",
            TagType::Tree => "ferriso_tree_tag_v1",
            TagType::Session => "ferriso_checksum_tag_v1",
            TagType::RelocatedSuperblock => "ferriso_rlsb_tag_v1",
        }
    }
}

fn hex(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn render_tag(id: &str, pos: u32, range_start: u32, range_size: u32, md5: [u8; 16]) -> Vec<u8> {
    let head = format!(
        "{id} pos={pos} range_start={range_start} range_size={range_size} md5={} self=",
        hex(&md5)
    );
    let self_md5: [u8; 16] = md5::Md5::digest(head.as_bytes()).into();
    let mut block = vec![0u8; BLOCK_SIZE];
    let line = format!("{head}{}\n", hex(&self_md5));
    block[..line.len()].copy_from_slice(line.as_bytes());
    block
}

/// Quick test whether a block holds one of our tags.
pub fn looks_like_tag(block: &[u8]) -> bool {
    block.starts_with(b"ferriso_")
        && block[..128.min(block.len())]
            .windows(8)
            .any(|w| w == b"_tag_v1 ")
}

/// Emit a tag block into the image stream, covering everything hashed so
/// far.
pub fn write_tag(t: &mut WriteTarget, tag: TagType) -> Result<()> {
    let (pos, range_start, digest) = {
        let cs = &t.checksum;
        let pos = t.opts.ms_block + (cs.counter / BLOCK_SIZE as u64) as u32;
        let digest: [u8; 16] = cs
            .ctx
            .as_ref()
            .map(|ctx| ctx.clone().finalize().into())
            .unwrap_or([0; 16]);
        (pos, cs.range_start, digest)
    };
    let block = render_tag(tag.id(), pos, range_start, pos - range_start, digest);
    t.write(&block)
}

/// Write the relocated superblock tag into the overwrite buffer. The tag
/// covers the buffer content before its own position.
pub fn write_overwrite_tag(t: &mut WriteTarget, overwrite: &mut [u8], pos: u32) -> Result<()> {
    let span = pos as usize * BLOCK_SIZE;
    let digest: [u8; 16] = md5::Md5::digest(&overwrite[..span]).into();
    let block = render_tag(TagType::RelocatedSuperblock.id(), pos, 0, pos, digest);
    overwrite[span..span + BLOCK_SIZE].copy_from_slice(&block);
    Ok(())
}

/// Writer for the checksum blocks after the data area: the per-file MD5
/// array and the session tag.
pub struct ChecksumWriter {
    array_blocks: u32,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        ChecksumWriter { array_blocks: 0 }
    }
}

impl Default for ChecksumWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageWriter for ChecksumWriter {
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        if t.opts.md5_file_checksums & 1 != 0 {
            // entry 0 is reserved, plus one tail entry, like the session
            // array consumers expect
            let entries = t.filesrcs.to_list(t.opts.appendable).len() as u64 + 2;
            self.array_blocks = div_up(entries * 16, BLOCK_SIZE as u64) as u32;
            t.checksum.array_pos = t.curblock;
            t.curblock += self.array_blocks;
        }
        if t.opts.md5_session_checksum {
            t.checksum.tag_pos = t.curblock;
            t.curblock += 1;
        }
        Ok(())
    }

    fn write_vol_desc(&mut self, _t: &mut WriteTarget) -> Result<()> {
        Ok(())
    }

    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()> {
        if t.opts.md5_file_checksums & 1 != 0 {
            let mut area = std::mem::take(&mut t.checksum.array);
            area.resize(self.array_blocks as usize * BLOCK_SIZE, 0);
            t.write(&area)?;
            t.checksum.array = area;
        }
        if t.opts.md5_session_checksum {
            write_tag(t, TagType::Session)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_line_is_self_checked() {
        let block = render_tag("ferriso_checksum_tag_v1", 40, 0, 40, [0xAB; 16]);
        let line = std::str::from_utf8(&block[..block.iter().position(|&b| b == b'\n').unwrap()])
            .unwrap();
        assert!(line.starts_with("ferriso_checksum_tag_v1 pos=40 range_start=0 range_size=40"));
        let (head, selfsum) = line.split_once("self=").unwrap();
        let expect: [u8; 16] = md5::Md5::digest(format!("{head}self=").as_bytes()).into();
        assert_eq!(selfsum, hex(&expect));
    }

    #[test]
    fn tag_detection() {
        let block = render_tag("ferriso_sb_tag_v1", 18, 0, 18, [0; 16]);
        assert!(looks_like_tag(&block));
        assert!(!looks_like_tag(&[0u8; BLOCK_SIZE]));
    }
}
