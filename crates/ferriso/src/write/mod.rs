//! The image-writing pipeline.
//!
//! Image generation runs in three passes over an ordered set of writers:
//! every writer first declares the blocks it needs (advancing the shared
//! `curblock` counter), then emits its volume descriptor, then streams its
//! body. The body bytes flow through a bounded ring buffer to the
//! [`ImageSource`] handed to the caller; the writer side runs on its own
//! thread and observes cancellation cooperatively.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::buffer::{BufferRead, RingBuffer};
use crate::error::{codes, IsoError, Result};
use crate::filesrc::{FileSrcId, FileSrcRegistry, FileSrcWriter};
use crate::msg;
use crate::opts::WriteOpts;
use crate::tree::Image;
use crate::types::BLOCK_SIZE;

/// Flattened generation options, resolved from [`WriteOpts`] at
/// production start. Writers read these instead of the user struct.
#[derive(Debug, Clone)]
pub struct TargetOpts {
    pub iso_level: u8,
    pub rockridge: bool,
    pub joliet: bool,
    pub iso1999: bool,
    pub eltorito: bool,
    pub aaip: bool,
    pub hardlinks: bool,
    pub always_gmt: bool,
    /// bit0: ECMA-119 and Joliet, bit1: Joliet.
    pub omit_version_numbers: u8,
    pub allow_deep_paths: bool,
    pub allow_longer_paths: bool,
    pub max_37_char_filenames: bool,
    /// bit0: ECMA-119, bit1: Joliet.
    pub no_force_dots: u8,
    pub allow_lowercase: bool,
    pub allow_full_ascii: bool,
    pub relaxed_vol_atts: bool,
    pub joliet_longer_paths: bool,
    pub rrip_version_1_10: bool,
    pub rrip_1_10_px_ino: bool,
    pub aaip_susp_1_10: bool,
    pub dir_rec_mtime: bool,
    pub md5_session_checksum: bool,
    /// bit0: compute, bit1: verify against a pre-computed value.
    pub md5_file_checksums: u8,
    pub sort_files: bool,

    pub replace_uid: bool,
    pub replace_gid: bool,
    pub replace_file_mode: bool,
    pub replace_dir_mode: bool,
    pub replace_timestamps: bool,
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    pub dir_mode: u32,
    pub timestamp: i64,

    pub output_charset: Option<String>,
    pub appendable: bool,
    pub ms_block: u32,
    pub fifo_size: usize,
    pub system_area_data: Option<Vec<u8>>,
    /// bit0: protective MBR partition table, bit1: isohybrid patching.
    pub system_area_options: u8,

    pub vol_creation_time: i64,
    pub vol_modification_time: i64,
    pub vol_expiration_time: i64,
    pub vol_effective_time: i64,
    /// 16 decimal digits overriding the PVD creation/modification times.
    pub vol_uuid: Option<[u8; 16]>,
}

impl Default for TargetOpts {
    fn default() -> Self {
        TargetOpts {
            iso_level: 1,
            rockridge: false,
            joliet: false,
            iso1999: false,
            eltorito: false,
            aaip: false,
            hardlinks: false,
            always_gmt: false,
            omit_version_numbers: 0,
            allow_deep_paths: false,
            allow_longer_paths: false,
            max_37_char_filenames: false,
            no_force_dots: 0,
            allow_lowercase: false,
            allow_full_ascii: false,
            relaxed_vol_atts: false,
            joliet_longer_paths: false,
            rrip_version_1_10: false,
            rrip_1_10_px_ino: false,
            aaip_susp_1_10: false,
            dir_rec_mtime: false,
            md5_session_checksum: false,
            md5_file_checksums: 0,
            sort_files: false,
            replace_uid: false,
            replace_gid: false,
            replace_file_mode: false,
            replace_dir_mode: false,
            replace_timestamps: false,
            uid: 0,
            gid: 0,
            file_mode: 0o444,
            dir_mode: 0o555,
            timestamp: 0,
            output_charset: None,
            appendable: false,
            ms_block: 0,
            fifo_size: 1024,
            system_area_data: None,
            system_area_options: 0,
            vol_creation_time: 0,
            vol_modification_time: 0,
            vol_expiration_time: 0,
            vol_effective_time: 0,
            vol_uuid: None,
        }
    }
}

/// A member of the writer pipeline.
///
/// Writers are consulted in a fixed order in three passes; each may
/// advance [`WriteTarget::curblock`] during declaration and emits through
/// [`WriteTarget::write`] afterwards. Resources are released on drop.
pub trait ImageWriter: Send {
    /// Pass 1: declare body blocks, record own start LBAs.
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()>;
    /// Pass 2: emit exactly one volume-descriptor block, or nothing.
    fn write_vol_desc(&mut self, t: &mut WriteTarget) -> Result<()>;
    /// Pass 3: emit the body in declared block order.
    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()>;
}

/// El Torito production state shared between tree construction, the boot
/// writer and the system-area emitter.
#[cfg(feature = "el-torito")]
pub struct ElToritoState {
    pub config: crate::eltorito::BootCatalog,
    /// Catalog block content, rendered once boot LBAs are known; the
    /// catalog file source reads from here during pass 3.
    pub catalog_content: Arc<Mutex<Vec<u8>>>,
    pub cat_src: FileSrcId,
    pub boot_src: FileSrcId,
}

/// Session checksum state.
#[cfg(feature = "checksums")]
pub struct ChecksumState {
    pub ctx: Option<md5::Md5>,
    pub counter: u64,
    /// Tag positions; 0 means "not placed".
    pub rlsb_tag_pos: u32,
    pub sb_tag_pos: u32,
    pub tree_tag_pos: u32,
    pub tag_pos: u32,
    pub array_pos: u32,
    pub range_start: u32,
    /// File checksum array: one 16-byte entry per index.
    pub array: Vec<u8>,
    pub idx_counter: u32,
}

#[cfg(feature = "checksums")]
impl ChecksumState {
    fn new() -> Self {
        ChecksumState {
            ctx: None,
            counter: 0,
            rlsb_tag_pos: 0,
            sb_tag_pos: 0,
            tree_tag_pos: 0,
            tag_pos: 0,
            array_pos: 0,
            range_start: 0,
            array: Vec::new(),
            idx_counter: 0,
        }
    }
}

/// Shared production state: the logical tree, the derived on-disc trees,
/// the file-source registry, the layout counters and the ring buffer.
pub struct WriteTarget {
    pub image: Image,
    pub opts: TargetOpts,
    /// Time writing began; recording timestamps use this.
    pub now: i64,
    /// Block being processed, during both layout and writing.
    pub curblock: u32,
    pub total_size: u64,
    pub vol_space_size: u32,
    bytes_written: u64,
    percent_written: u8,

    pub filesrcs: FileSrcRegistry,

    pub ecma: Option<crate::ecma119::tree::Ecma119Tree>,
    pub ndirs: usize,
    pub path_table_size: u32,
    pub l_path_table_pos: u32,
    pub m_path_table_pos: u32,

    pub joliet: Option<crate::joliet::JolietTree>,
    pub joliet_ndirs: usize,
    pub joliet_path_table_size: u32,
    pub joliet_l_path_table_pos: u32,
    pub joliet_m_path_table_pos: u32,

    pub iso1999: Option<crate::iso1999::Iso1999Tree>,
    pub iso1999_ndirs: usize,
    pub iso1999_path_table_size: u32,
    pub iso1999_l_path_table_pos: u32,
    pub iso1999_m_path_table_pos: u32,

    #[cfg(feature = "el-torito")]
    pub eltorito: Option<ElToritoState>,

    pub pad_blocks: u32,

    #[cfg(feature = "checksums")]
    pub checksum: ChecksumState,

    pub buffer: Arc<RingBuffer>,
}

impl WriteTarget {
    /// Write bytes into the ring buffer, feeding the session checksum and
    /// reporting progress. A closed reader turns into [`IsoError::Canceled`].
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let n = self.buffer.write(data);
        if n < data.len() {
            return Err(IsoError::Canceled);
        }

        #[cfg(feature = "checksums")]
        if let Some(ctx) = self.checksum.ctx.as_mut() {
            md5::Digest::update(ctx, data);
            self.checksum.counter += data.len() as u64;
        }

        // total_size is 0 while replaying descriptors into the overwrite
        // buffer; no progress is reported there
        if self.total_size != 0 {
            self.bytes_written += data.len() as u64;
            let percent = (self.bytes_written * 100 / self.total_size) as u8;
            if percent >= self.percent_written + 5 {
                msg::debug(
                    self.image.id(),
                    format!(
                        "Processed {} of {} KB ({} %)",
                        self.bytes_written >> 10,
                        self.total_size >> 10,
                        percent
                    ),
                );
                self.percent_written = percent;
            }
        }
        Ok(())
    }

    /// Record the MD5 of a streamed file into the checksum array.
    #[cfg(feature = "checksums")]
    pub fn record_file_checksum(
        &mut self,
        src: FileSrcId,
        digest: [u8; 16],
    ) -> Result<()> {
        self.checksum.idx_counter += 1;
        let index = self.checksum.idx_counter;
        self.filesrcs.get_mut(src).checksum_index = index;
        let offset = index as usize * 16;
        if self.checksum.array.len() < offset + 16 {
            self.checksum.array.resize(offset + 16, 0);
        }
        self.checksum.array[offset..offset + 16].copy_from_slice(&digest);
        Ok(())
    }
}

/// Zero padding up to block 32, so the descriptors of a grown image can
/// always be rewritten without clobbering data.
struct PadWriter;

impl ImageWriter for PadWriter {
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        if t.curblock < 32 {
            t.pad_blocks = 32 - t.curblock;
            t.curblock = 32;
        }
        Ok(())
    }

    fn write_vol_desc(&mut self, _t: &mut WriteTarget) -> Result<()> {
        Ok(())
    }

    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()> {
        let zeros = vec![0u8; BLOCK_SIZE];
        for _ in 0..t.pad_blocks {
            t.write(&zeros)?;
        }
        Ok(())
    }
}

/// Volume Descriptor Set Terminator (ECMA-119, 8.3).
fn write_vol_desc_terminator(t: &mut WriteTarget) -> Result<()> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0] = 255;
    block[1..6].copy_from_slice(b"CD001");
    block[6] = 1;
    t.write(&block)
}

fn write_function(
    mut target: WriteTarget,
    mut writers: Vec<Box<dyn ImageWriter>>,
) -> std::result::Result<(), (WriteTarget, IsoError)> {
    msg::debug(target.image.id(), "Starting image writing...");
    target.bytes_written = 0;
    target.percent_written = 0;

    let res = (|| -> Result<()> {
        // System Area (ECMA-119, 6.2.1)
        let sa = crate::system_area::render(&target)?;
        target.write(&sa)?;

        msg::debug(target.image.id(), "Write volume descriptors");
        for writer in writers.iter_mut() {
            writer.write_vol_desc(&mut target)?;
        }
        write_vol_desc_terminator(&mut target)?;

        #[cfg(feature = "checksums")]
        if target.opts.md5_session_checksum && target.checksum.sb_tag_pos != 0 {
            crate::checksum::write_tag(&mut target, crate::checksum::TagType::Superblock)?;
        }

        for writer in writers.iter_mut() {
            writer.write_data(&mut target)?;
        }
        Ok(())
    })();

    match res {
        Ok(()) => {
            target.buffer.writer_close(0);
            Ok(())
        }
        Err(err) => {
            if matches!(err, IsoError::Canceled) {
                let _ = msg::submit(
                    target.image.id(),
                    codes::IMAGE_WRITE_CANCELED,
                    0,
                    "Image write canceled",
                );
            } else {
                let _ = msg::submit(
                    target.image.id(),
                    codes::WRITE_ERROR,
                    err.code(),
                    format!("Image write error: {err}"),
                );
            }
            target.buffer.writer_close(err.code());
            Err((target, err))
        }
    }
}

/// The byte source handed to the consumer.
///
/// `read` yields the image in strict production order; a short read of 0
/// is clean EOF, an error carries the writer's failure code. Dropping the
/// source cancels a still-running production and joins the writer thread.
pub struct ImageSource {
    buffer: Arc<RingBuffer>,
    thread: Option<JoinHandle<()>>,
    total_size: u64,
    image_id: u32,
}

impl ImageSource {
    /// Predicted total image size in bytes, exact after pass 1.
    pub fn get_size(&self) -> u64 {
        self.total_size
    }

    /// Override the size reported by [`ImageSource::get_size`]. The value
    /// is not used by the engine; it helps consumers that pad media.
    pub fn set_size(&mut self, size: u64) {
        self.total_size = size;
    }

    /// Read image bytes. Blocks until `buf` is filled, EOF, or error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.buffer.read(buf) {
            BufferRead::Full => Ok(buf.len()),
            BufferRead::Eof(n) => Ok(n),
            BufferRead::Error(code) => Err(IsoError::BufRead(code)),
        }
    }

    /// Cancel the production. The writer observes the closed reader at
    /// its next buffer write and terminates; the thread is joined here.
    pub fn cancel(&mut self) {
        self.buffer.reader_close(codes::CANCELED);
        self.join_writer();
    }

    fn join_writer(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            msg::debug(self.image_id, "Writer thread joined");
        }
    }

    /// Ring-buffer statistics: how often the writer found it full and the
    /// reader found it empty.
    pub fn buffer_stats(&self) -> (u32, u32) {
        (self.buffer.times_full(), self.buffer.times_empty())
    }
}

impl std::io::Read for ImageSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        ImageSource::read(self, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl Drop for ImageSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.buffer.reader_close(0);
            self.join_writer();
        }
    }
}

/// Assemble the pipeline, run pass 1, optionally fill the overwrite
/// buffer, and start the writer thread.
///
/// The image, all streams and the file-source registry are transferred to
/// the writer thread; the caller only holds the returned byte source.
/// `opts` is borrowed mutably for the overwrite buffer, which is filled
/// with the descriptors to be written at LBA 0 of a growable medium.
pub fn create_source(image: Image, opts: &mut WriteOpts) -> Result<ImageSource> {
    let topts = opts.snapshot(&image)?;
    let image_id = image.id();
    let fifo_size = topts.fifo_size;

    #[cfg(feature = "el-torito")]
    let eltorito_config = if topts.eltorito {
        image.boot_catalog.clone()
    } else {
        None
    };

    let mut target = WriteTarget {
        image,
        now: chrono::Utc::now().timestamp(),
        curblock: topts.ms_block + 16,
        total_size: 0,
        vol_space_size: 0,
        bytes_written: 0,
        percent_written: 0,
        filesrcs: FileSrcRegistry::default(),
        ecma: None,
        ndirs: 0,
        path_table_size: 0,
        l_path_table_pos: 0,
        m_path_table_pos: 0,
        joliet: None,
        joliet_ndirs: 0,
        joliet_path_table_size: 0,
        joliet_l_path_table_pos: 0,
        joliet_m_path_table_pos: 0,
        iso1999: None,
        iso1999_ndirs: 0,
        iso1999_path_table_size: 0,
        iso1999_l_path_table_pos: 0,
        iso1999_m_path_table_pos: 0,
        #[cfg(feature = "el-torito")]
        eltorito: None,
        pad_blocks: 0,
        #[cfg(feature = "checksums")]
        checksum: ChecksumState::new(),
        buffer: Arc::new(RingBuffer::new(fifo_size)),
        opts: topts,
    };

    let mut writers: Vec<Box<dyn ImageWriter>> = Vec::new();
    let mut eltorito_writer_index: Option<usize> = None;

    // ECMA-119 writer: builds the canonical low-level tree and owns the PVD
    #[cfg(feature = "el-torito")]
    let mut prepared = eltorito_config.map(crate::eltorito::prepare);
    #[cfg(feature = "el-torito")]
    let eltorito_setup = prepared.as_mut().map(|p| &mut p.setup);
    #[cfg(not(feature = "el-torito"))]
    let eltorito_setup: Option<&mut crate::ecma119::tree::ElToritoSetup> = None;

    writers.push(Box::new(crate::ecma119::Ecma119Writer::create(
        &mut target,
        eltorito_setup,
    )?));

    #[cfg(feature = "el-torito")]
    if let Some(prep) = prepared.take() {
        writers.push(Box::new(crate::eltorito::ElToritoWriter::create(
            &mut target,
            prep,
        )?));
        eltorito_writer_index = Some(writers.len() - 1);
    }

    if target.opts.joliet {
        writers.push(Box::new(crate::joliet::JolietWriter::create(&mut target)?));
    }
    if target.opts.iso1999 {
        writers.push(Box::new(crate::iso1999::Iso1999Writer::create(
            &mut target,
        )?));
    }

    let voldesc_count = target.curblock - target.opts.ms_block - 16;

    // Volume Descriptor Set Terminator
    target.curblock += 1;

    #[cfg(feature = "checksums")]
    if target.opts.md5_session_checksum {
        target.checksum.range_start = target.opts.ms_block;
        target.checksum.sb_tag_pos = target.curblock;
        target.curblock += 1;
    }

    writers.push(Box::new(PadWriter));
    let file_src_writer_index = writers.len();
    writers.push(Box::new(FileSrcWriter::new()));

    #[cfg(feature = "checksums")]
    if target.opts.md5_session_checksum || target.opts.md5_file_checksums & 1 != 0 {
        writers.push(Box::new(crate::checksum::ChecksumWriter::new()));
    }

    // Pass 1: every writer declares its blocks. The El Torito declaration
    // is deferred until the file LBAs are known, so it can patch the boot
    // image location into its catalog.
    for (i, writer) in writers.iter_mut().enumerate() {
        if Some(i) == eltorito_writer_index {
            continue;
        }
        if i == file_src_writer_index {
            msg::debug(target.image.id(), "Computing position of file contents");
        }
        writer.compute_data_blocks(&mut target)?;
    }
    if let Some(i) = eltorito_writer_index {
        writers[i].compute_data_blocks(&mut target)?;
    }

    // Replay the descriptors into the overwrite buffer, if requested.
    if let Some(overwrite) = opts.overwrite_buf() {
        target.vol_space_size = target.curblock;
        fill_overwrite_buffer(&mut target, &mut writers, voldesc_count, overwrite)?;
    }

    // The volume space is only the current session.
    target.vol_space_size = target.curblock - target.opts.ms_block;
    target.total_size = target.vol_space_size as u64 * BLOCK_SIZE as u64;
    let total_size = target.total_size;

    #[cfg(feature = "checksums")]
    if target.opts.md5_session_checksum {
        target.checksum.ctx = Some(<md5::Md5 as md5::Digest>::new());
        target.checksum.counter = 0;
    }

    let buffer = Arc::clone(&target.buffer);
    let thread = std::thread::Builder::new()
        .name("ferriso-writer".into())
        .spawn(move || {
            let _ = write_function(target, writers);
        })
        .map_err(|_| {
            let _ = msg::submit(
                image_id,
                codes::THREAD_ERROR,
                0,
                "Cannot create writer thread",
            );
            IsoError::Thread
        })?;

    Ok(ImageSource {
        buffer,
        thread: Some(thread),
        total_size,
        image_id,
    })
}

/// Render system area plus volume descriptors into the caller's overwrite
/// buffer: the content meant to land at LBA 0 of a growable medium.
fn fill_overwrite_buffer(
    target: &mut WriteTarget,
    writers: &mut [Box<dyn ImageWriter>],
    voldesc_count: u32,
    overwrite: &mut [u8],
) -> Result<()> {
    let needed = (16 + voldesc_count as usize + 1) * BLOCK_SIZE;
    if overwrite.len() < needed.max(32 * BLOCK_SIZE) {
        return Err(IsoError::WrongArg(
            "overwrite buffer must hold at least 64 KiB".into(),
        ));
    }

    let sa = crate::system_area::render(target)?;
    overwrite[..16 * BLOCK_SIZE].copy_from_slice(&sa);

    // The descriptors pass through the ring buffer exactly like during
    // the real run, and are pulled back out here.
    for writer in writers.iter_mut() {
        writer.write_vol_desc(target)?;
    }
    let voldesc_bytes = voldesc_count as usize * BLOCK_SIZE;
    let span = &mut overwrite[16 * BLOCK_SIZE..16 * BLOCK_SIZE + voldesc_bytes];
    match target.buffer.read(span) {
        BufferRead::Full => {}
        _ => return Err(IsoError::AssertFailure),
    }

    let term = 16 * BLOCK_SIZE + voldesc_bytes;
    overwrite[term..term + BLOCK_SIZE].fill(0);
    overwrite[term] = 255;
    overwrite[term + 1..term + 6].copy_from_slice(b"CD001");
    overwrite[term + 6] = 1;

    #[cfg(feature = "checksums")]
    {
        let mut tag_pos = voldesc_count + 16 + 1;
        if target.opts.md5_session_checksum {
            // Valid only while the volume fits into the first 32 blocks;
            // otherwise the relocated tag is silently not written.
            target.checksum.rlsb_tag_pos = tag_pos;
            if tag_pos < 32 {
                crate::checksum::write_overwrite_tag(target, overwrite, tag_pos)?;
            }
            tag_pos += 1;
        }
        // stale tags of an older session must not survive
        for i in tag_pos..32 {
            let off = i as usize * BLOCK_SIZE;
            if crate::checksum::looks_like_tag(&overwrite[off..off + BLOCK_SIZE]) {
                overwrite[off] = 0;
            }
        }
    }

    Ok(())
}
