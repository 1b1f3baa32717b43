//! Unique file-content identities and the writer that streams them.
//!
//! Every file node resolves to one [`FileSrc`] per distinct stream
//! identity; nodes sharing content share the entry, so content is laid out
//! and written exactly once. The registry orders entries by identity,
//! which keeps layout deterministic.

use std::collections::BTreeMap;

use crate::error::{codes, Result};
use crate::msg;
use crate::stream::{read_buffer, OpenSize, SharedStream, StreamId};
use crate::types::{div_up, BLOCK_SIZE, ISO_EXTENT_SIZE};
use crate::write::{ImageWriter, WriteTarget};

/// Index of a [`FileSrc`] inside the registry.
pub type FileSrcId = usize;

/// A contiguous run of content inside the image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub block: u32,
    pub size: u32,
}

/// Ordering key of a file source: stream identity plus size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileSrcKey {
    pub id: StreamId,
    pub size: u64,
}

/// One unique piece of file content in the output image.
pub struct FileSrc {
    pub stream: SharedStream,
    pub key: FileSrcKey,
    pub sort_weight: i32,
    /// Content already present in a previous session; in an appendable
    /// production its sections are referenced, never rewritten.
    pub from_previous_image: bool,
    pub sections: Vec<Section>,
    /// Index into the file checksum array, 0 when none.
    #[cfg(feature = "checksums")]
    pub checksum_index: u32,
}

impl FileSrc {
    pub fn size(&self) -> u64 {
        self.key.size
    }

    pub fn nblocks(&self) -> u64 {
        div_up(self.size(), BLOCK_SIZE as u64)
    }
}

/// How many sections content of `size` bytes occupies.
///
/// Only level 3 permits multi-extent files; there a file is split into
/// [`ISO_EXTENT_SIZE`] sections plus a tail. Below level 3 everything is a
/// single section and sizes beyond [`crate::types::MAX_FILE_SECTION_SIZE`]
/// were already rejected during tree construction.
pub fn section_count(size: u64, iso_level: u8) -> usize {
    if iso_level == 3 && size > ISO_EXTENT_SIZE {
        div_up(size, ISO_EXTENT_SIZE) as usize
    } else {
        1
    }
}

/// Deduplicating registry of file sources.
#[derive(Default)]
pub struct FileSrcRegistry {
    srcs: Vec<FileSrc>,
    index: BTreeMap<FileSrcKey, FileSrcId>,
}

impl FileSrcRegistry {
    /// Register content for a file node, returning the existing entry when
    /// an identical stream was registered before.
    pub fn register(
        &mut self,
        stream: SharedStream,
        sort_weight: i32,
        from_previous_image: bool,
        old_sections: &[Section],
        appendable: bool,
        iso_level: u8,
    ) -> FileSrcId {
        let key = {
            let guard = stream.lock().expect("stream poisoned");
            FileSrcKey {
                id: guard.id(),
                size: guard.size(),
            }
        };
        if let Some(&id) = self.index.get(&key) {
            // keep the highest weight of all nodes sharing the content
            self.srcs[id].sort_weight = self.srcs[id].sort_weight.max(sort_weight);
            return id;
        }
        let sections = if from_previous_image && appendable {
            old_sections.to_vec()
        } else {
            vec![Section::default(); section_count(key.size, iso_level)]
        };
        let id = self.srcs.len();
        self.srcs.push(FileSrc {
            stream,
            key,
            sort_weight,
            from_previous_image,
            sections,
            #[cfg(feature = "checksums")]
            checksum_index: 0,
        });
        self.index.insert(key, id);
        id
    }

    pub fn get(&self, id: FileSrcId) -> &FileSrc {
        &self.srcs[id]
    }

    pub fn get_mut(&mut self, id: FileSrcId) -> &mut FileSrc {
        &mut self.srcs[id]
    }

    pub fn len(&self) -> usize {
        self.srcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.srcs.is_empty()
    }

    /// Entries in identity order; previous-session entries are skipped in
    /// an appendable production since their bytes are never emitted.
    pub fn to_list(&self, appendable: bool) -> Vec<FileSrcId> {
        self.index
            .values()
            .copied()
            .filter(|&id| !(appendable && self.srcs[id].from_previous_image))
            .collect()
    }
}

/// Writer that lays out and streams all file content.
pub struct FileSrcWriter {
    filelist: Vec<FileSrcId>,
}

impl FileSrcWriter {
    pub fn new() -> Self {
        FileSrcWriter {
            filelist: Vec::new(),
        }
    }
}

impl ImageWriter for FileSrcWriter {
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        let mut list = t.filesrcs.to_list(t.opts.appendable);
        if t.opts.sort_files {
            // higher weighted first; identity order breaks ties
            let registry = &t.filesrcs;
            list.sort_by(|&a, &b| {
                registry
                    .get(b)
                    .sort_weight
                    .cmp(&registry.get(a).sort_weight)
            });
        }
        for &id in &list {
            let src = t.filesrcs.get_mut(id);
            let nsections = src.sections.len();
            let mut remaining = src.key.size;
            for (extent, section) in src.sections.iter_mut().enumerate() {
                section.block =
                    t.curblock + (extent as u64 * (ISO_EXTENT_SIZE / BLOCK_SIZE as u64)) as u32;
                if extent + 1 < nsections {
                    section.size = ISO_EXTENT_SIZE as u32;
                    remaining -= ISO_EXTENT_SIZE;
                } else {
                    section.size = remaining as u32;
                }
            }
            t.curblock += div_up(src.key.size, BLOCK_SIZE as u64) as u32;
        }
        self.filelist = list;
        Ok(())
    }

    fn write_vol_desc(&mut self, _t: &mut WriteTarget) -> Result<()> {
        Ok(())
    }

    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()> {
        msg::debug(t.image.id(), "Writing file contents");
        for &id in &self.filelist {
            write_one_src(t, id)?;
        }
        Ok(())
    }
}

fn write_one_src(t: &mut WriteTarget, id: FileSrcId) -> Result<()> {
    let (stream, size, nblocks, name) = {
        let src = t.filesrcs.get(id);
        let name = {
            let guard = src.stream.lock().expect("stream poisoned");
            format!("{}:{}", guard.class_name(), guard.id().ino_id)
        };
        (src.stream.clone(), src.size(), src.nblocks(), name)
    };

    let opened = stream.lock().expect("stream poisoned").open();
    match opened {
        Err(e) => {
            // the layout is fixed, the best we can do is zero the span
            msg::submit(
                t.image.id(),
                codes::FILE_CANT_WRITE,
                e.code(),
                format!("Stream {name} can't be opened, filling with 0s"),
            )?;
            return write_zeros(t, nblocks);
        }
        Ok(OpenSize::Larger) => {
            msg::submit(
                t.image.id(),
                codes::FILE_CANT_WRITE,
                0,
                format!("Size of stream {name} has changed, it will be truncated"),
            )?;
        }
        Ok(OpenSize::Smaller) => {
            msg::submit(
                t.image.id(),
                codes::FILE_CANT_WRITE,
                0,
                format!("Size of stream {name} has changed, it will be padded with 0s"),
            )?;
        }
        Ok(OpenSize::Exact) => {}
    }

    #[cfg(feature = "checksums")]
    let mut md5 = if t.opts.md5_file_checksums & 1 != 0 {
        Some(<md5::Md5 as md5::Digest>::new())
    } else {
        None
    };

    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut written_blocks: u64 = 0;
    let mut read_failed = None;
    while written_blocks < nblocks {
        let res = read_buffer(
            &mut *stream.lock().expect("stream poisoned"),
            &mut buffer,
        );
        match res {
            Ok(_full) => {}
            Err(e) => {
                read_failed = Some(e);
                break;
            }
        }
        #[cfg(feature = "checksums")]
        if let Some(ctx) = md5.as_mut() {
            // the digest covers the content, not the block padding
            let content = (size - written_blocks * BLOCK_SIZE as u64).min(BLOCK_SIZE as u64);
            md5::Digest::update(ctx, &buffer[..content as usize]);
        }
        if let Err(e) = t.write(&buffer) {
            let _ = stream.lock().expect("stream poisoned").close();
            return Err(e);
        }
        written_blocks += 1;
    }

    let _ = stream.lock().expect("stream poisoned").close();

    if let Some(cause) = read_failed {
        msg::submit(
            t.image.id(),
            codes::FILE_CANT_WRITE,
            cause.code(),
            format!("Read error in stream {name}, filling with 0s"),
        )?;
        write_zeros(t, nblocks - written_blocks)?;
    }

    #[cfg(feature = "checksums")]
    if let Some(ctx) = md5 {
        let digest: [u8; 16] = md5::Digest::finalize(ctx).into();
        t.record_file_checksum(id, digest)?;
    }

    Ok(())
}

fn write_zeros(t: &mut WriteTarget, blocks: u64) -> Result<()> {
    let zeros = vec![0u8; BLOCK_SIZE];
    for _ in 0..blocks {
        t.write(&zeros)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{share, MemoryStream};

    #[test]
    fn identical_streams_are_deduplicated() {
        let mut reg = FileSrcRegistry::default();
        let stream = share(MemoryStream::new(vec![1, 2, 3]));
        let a = reg.register(stream.clone(), 0, false, &[], false, 1);
        let b = reg.register(stream, 5, false, &[], false, 1);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(a).sort_weight, 5);

        let other = share(MemoryStream::new(vec![1, 2, 3]));
        let c = reg.register(other, 0, false, &[], false, 1);
        assert_ne!(a, c);
    }

    #[test]
    fn section_boundaries() {
        // exactly one full extent: a single section
        assert_eq!(section_count(0xFFFF_F800, 3), 1);
        // one byte more: two sections
        assert_eq!(section_count(0xFFFF_F801, 3), 2);
        assert_eq!(section_count(0x1_FFFF_F000, 3), 2);
        assert_eq!(section_count(0x1_FFFF_F001, 3), 3);
        assert_eq!(section_count(0, 3), 1);
        // below level 3 nothing is split
        assert_eq!(section_count(0xFFFF_FFFF, 2), 1);
    }

    #[test]
    fn appendable_skips_old_content() {
        let mut reg = FileSrcRegistry::default();
        let old = share(MemoryStream::new(vec![1]));
        let new = share(MemoryStream::new(vec![2]));
        let old_id = reg.register(old, 0, true, &[Section { block: 200, size: 1 }], true, 3);
        let _new_id = reg.register(new, 0, false, &[], true, 3);
        assert_eq!(reg.get(old_id).sections, vec![Section { block: 200, size: 1 }]);
        let list = reg.to_list(true);
        assert_eq!(list.len(), 1);
        assert!(!reg.get(list[0]).from_previous_image);
    }
}
