//! El Torito boot catalog support.
//!
//! The catalog occupies one 2048-byte block holding a validation entry
//! and the default boot entry; it lives in the tree as a regular file
//! whose position the user chooses. Catalog content can only be rendered
//! once the boot image's LBA is known, so the boot writer's declaration
//! pass is deferred until after file content was laid out; the catalog
//! file source reads the rendered block during pass 3.

use std::sync::{Arc, Mutex};

use crate::error::{IsoError, Result};
use crate::filesrc::FileSrcId;
use crate::msg;
use crate::stream::{read_buffer, share, IsoStream, MemoryStream, OpenSize, SharedStream, StreamId};
use crate::tree::NodeId;
use crate::types::{div_up, U16Le, U32Le, BLOCK_SIZE};
use crate::write::{ElToritoState, ImageWriter, WriteTarget};

/// How the BIOS is told to treat the boot image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emulation {
    NoEmulation,
    Floppy12,
    Floppy144,
    Floppy288,
    HardDisk,
}

impl Emulation {
    pub fn to_u8(self) -> u8 {
        match self {
            Emulation::NoEmulation => 0x00,
            Emulation::Floppy12 => 0x01,
            Emulation::Floppy144 => 0x02,
            Emulation::Floppy288 => 0x03,
            Emulation::HardDisk => 0x04,
        }
    }
}

/// Platform id of the validation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformId {
    X86,
    PowerPC,
    Mac,
    Efi,
}

impl PlatformId {
    pub fn to_u8(self) -> u8 {
        match self {
            PlatformId::X86 => 0x00,
            PlatformId::PowerPC => 0x01,
            PlatformId::Mac => 0x02,
            PlatformId::Efi => 0xEF,
        }
    }
}

/// User-facing boot configuration attached to an [`crate::tree::Image`].
#[derive(Debug, Clone)]
pub struct BootCatalog {
    /// Tree node of the catalog placeholder.
    pub catalog_node: NodeId,
    /// Tree node of the boot image file.
    pub image_node: NodeId,
    pub bootable: bool,
    pub emulation: Emulation,
    pub platform_id: PlatformId,
    pub id_string: [u8; 24],
    pub load_seg: u16,
    /// Sectors (512 bytes) to load; 0 computes it from the image size.
    pub load_size: u16,
    /// System type byte for hard-disk emulation.
    pub partition_type: u8,
    /// Patch an isolinux boot info table into the outgoing image bytes.
    pub isolinux_patch: bool,
}

impl BootCatalog {
    pub fn new(catalog_node: NodeId, image_node: NodeId) -> Self {
        BootCatalog {
            catalog_node,
            image_node,
            bootable: true,
            emulation: Emulation::NoEmulation,
            platform_id: PlatformId::X86,
            id_string: [0; 24],
            load_seg: 0,
            load_size: 0,
            partition_type: 0,
            isolinux_patch: false,
        }
    }
}

/// Validation entry (El Torito, 2.1).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ValidationEntry {
    pub header_id: u8,
    pub platform_id: u8,
    pub reserved: [u8; 2],
    pub id_string: [u8; 24],
    pub checksum: U16Le,
    pub key: [u8; 2],
}

impl ValidationEntry {
    pub fn new(platform_id: u8, id_string: [u8; 24]) -> Self {
        let mut entry = ValidationEntry {
            header_id: 1,
            platform_id,
            reserved: [0; 2],
            id_string,
            checksum: U16Le::new(0),
            key: [0x55, 0xAA],
        };
        entry.checksum = U16Le::new(entry.calculate_checksum());
        entry
    }

    /// The checksum makes all 16-bit words of the entry sum to zero.
    pub fn calculate_checksum(&self) -> u16 {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(bytemuck::bytes_of(self));
        bytes[28] = 0;
        bytes[29] = 0;
        let mut sum = 0u16;
        for pair in bytes.chunks_exact(2) {
            sum = sum.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
        }
        (!sum).wrapping_add(1)
    }

    pub fn is_valid(&self) -> bool {
        self.header_id == 0x01
            && self.key == [0x55, 0xAA]
            && self.checksum.get() == self.calculate_checksum()
    }
}

/// Default/section entry (El Torito, 2.2 and 2.4).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BootEntry {
    /// 0x88 bootable, 0x00 not bootable.
    pub boot_indicator: u8,
    pub boot_media_type: u8,
    pub load_segment: U16Le,
    pub system_type: u8,
    pub reserved0: u8,
    pub sector_count: U16Le,
    pub load_rba: U32Le,
    pub reserved1: [u8; 20],
}

/// Section header entry (El Torito, 2.3), kept for catalogs carrying more
/// than the default image.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SectionHeaderEntry {
    /// 0x90 when more headers follow, 0x91 for the final header.
    pub header_type: u8,
    pub platform_id: u8,
    pub section_count: U16Le,
    pub section_ident: [u8; 28],
}

/// Boot information table patched into isolinux images at offset 8.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BootInfoTable {
    /// LBA of the Primary Volume Descriptor.
    pub pvd_lba: U32Le,
    /// LBA of the boot file.
    pub file_lba: U32Le,
    /// Length of the boot file in bytes.
    pub file_len: U32Le,
    /// 32-bit sum of all little-endian words from byte 64 on.
    pub checksum: U32Le,
    pub reserved: [u8; 40],
}

/// Stream over the rendered catalog block. The content cell is filled by
/// the boot writer's deferred declaration pass, before any body bytes are
/// produced.
pub struct BootCatalogStream {
    content: Arc<Mutex<Vec<u8>>>,
    pos: usize,
    ino_id: u64,
}

impl BootCatalogStream {
    fn new(content: Arc<Mutex<Vec<u8>>>) -> Self {
        BootCatalogStream {
            content,
            pos: 0,
            ino_id: crate::stream::next_filter_serial(),
        }
    }
}

impl IsoStream for BootCatalogStream {
    fn class_name(&self) -> &'static str {
        "boot"
    }

    fn open(&mut self) -> Result<OpenSize> {
        self.pos = 0;
        Ok(OpenSize::Exact)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        BLOCK_SIZE as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let content = self.content.lock().expect("catalog poisoned");
        let n = buf.len().min(content.len().saturating_sub(self.pos));
        buf[..n].copy_from_slice(&content[self.pos..self.pos + n]);
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
            fs_id: crate::stream::FILTER_FS_ID,
            dev_id: 0,
            ino_id: self.ino_id,
        }
    }
}

/// Hooks handed to the tree builder plus the pieces the writer needs.
pub struct Prepared {
    pub setup: crate::ecma119::tree::ElToritoSetup,
    pub config: BootCatalog,
    pub content: Arc<Mutex<Vec<u8>>>,
}

/// Create the catalog stream and the tree-construction hookup.
pub fn prepare(config: BootCatalog) -> Prepared {
    let content = Arc::new(Mutex::new(vec![0u8; BLOCK_SIZE]));
    let stream: SharedStream = share(BootCatalogStream::new(Arc::clone(&content)));
    Prepared {
        setup: crate::ecma119::tree::ElToritoSetup {
            catalog_stream: stream,
            image_node: config.image_node,
            cat_src: None,
            boot_src: None,
        },
        config,
        content,
    }
}

pub struct ElToritoWriter;

impl ElToritoWriter {
    /// Register the boot state and reserve the boot record descriptor.
    pub fn create(t: &mut WriteTarget, prep: Prepared) -> Result<Self> {
        let cat_src = prep.setup.cat_src.ok_or_else(|| {
            IsoError::BootImageNotValid("boot catalog not reachable in the tree".into())
        })?;
        let boot_src = prep.setup.boot_src.ok_or_else(|| {
            IsoError::BootImageNotValid("boot image not reachable in the tree".into())
        })?;
        t.eltorito = Some(ElToritoState {
            config: prep.config,
            catalog_content: prep.content,
            cat_src,
            boot_src,
        });
        t.curblock += 1;
        Ok(ElToritoWriter)
    }
}

fn render_catalog(t: &WriteTarget) -> Vec<u8> {
    let state = t.eltorito.as_ref().expect("el torito state set");
    let config = &state.config;
    let boot = t.filesrcs.get(state.boot_src);
    let image_lba = boot.sections[0].block;
    let sector_count = if config.load_size != 0 {
        config.load_size
    } else {
        div_up(boot.size(), 512).min(u16::MAX as u64) as u16
    };

    let validation = ValidationEntry::new(config.platform_id.to_u8(), config.id_string);
    let entry = BootEntry {
        boot_indicator: if config.bootable { 0x88 } else { 0x00 },
        boot_media_type: config.emulation.to_u8(),
        load_segment: U16Le::new(config.load_seg),
        system_type: config.partition_type,
        reserved0: 0,
        sector_count: U16Le::new(sector_count),
        load_rba: U32Le::new(image_lba),
        reserved1: [0; 20],
    };

    let mut block = vec![0u8; BLOCK_SIZE];
    block[..32].copy_from_slice(bytemuck::bytes_of(&validation));
    block[32..64].copy_from_slice(bytemuck::bytes_of(&entry));
    block
}

/// Patch the boot info table into the outgoing stream of the boot image.
/// The on-disc source file is never touched; the file source's stream is
/// replaced with a patched in-memory copy.
fn patch_boot_info_table(t: &mut WriteTarget) -> Result<()> {
    let state = t.eltorito.as_ref().expect("el torito state set");
    let boot_src = state.boot_src;
    let (stream, size, file_lba) = {
        let src = t.filesrcs.get(boot_src);
        (src.stream.clone(), src.size(), src.sections[0].block)
    };

    let mut data = vec![0u8; size as usize];
    {
        let mut guard = stream.lock().expect("stream poisoned");
        guard.open()?;
        let res = read_buffer(&mut *guard, &mut data);
        let _ = guard.close();
        res?;
    }
    if data.len() < 64 {
        return Err(IsoError::BootImageNotValid(
            "boot image too small for a boot info table".into(),
        ));
    }

    let mut checksum = 0u32;
    for word in data[64..].chunks(4) {
        let mut bytes = [0u8; 4];
        bytes[..word.len()].copy_from_slice(word);
        checksum = checksum.wrapping_add(u32::from_le_bytes(bytes));
    }

    let table = BootInfoTable {
        pvd_lba: U32Le::new(t.opts.ms_block + 16),
        file_lba: U32Le::new(file_lba),
        file_len: U32Le::new(size as u32),
        checksum: U32Le::new(checksum),
        reserved: [0; 40],
    };
    data[8..64].copy_from_slice(bytemuck::bytes_of(&table));

    msg::debug(t.image.id(), "Patched boot info table into boot image");
    t.filesrcs.get_mut(boot_src).stream = share(MemoryStream::new(data));
    Ok(())
}

impl ImageWriter for ElToritoWriter {
    /// Runs after the file-content layout, so the boot image LBA is known.
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        let catalog = render_catalog(t);
        {
            let state = t.eltorito.as_ref().expect("el torito state set");
            *state.catalog_content.lock().expect("catalog poisoned") = catalog;
        }
        let patch = t
            .eltorito
            .as_ref()
            .map(|s| s.config.isolinux_patch)
            .unwrap_or(false);
        if patch {
            patch_boot_info_table(t)?;
        }
        Ok(())
    }

    fn write_vol_desc(&mut self, t: &mut WriteTarget) -> Result<()> {
        msg::debug(t.image.id(), "Write El Torito boot record");
        let catalog_lba = {
            let state = t.eltorito.as_ref().expect("el torito state set");
            t.filesrcs.get(state.cat_src).sections[0].block
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        block[0] = 0;
        block[1..6].copy_from_slice(b"CD001");
        block[6] = 1;
        const BOOT_SYS_ID: &[u8] = b"EL TORITO SPECIFICATION";
        block[7..7 + BOOT_SYS_ID.len()].copy_from_slice(BOOT_SYS_ID);
        block[71..75].copy_from_slice(&catalog_lba.to_le_bytes());
        t.write(&block)
    }

    fn write_data(&mut self, _t: &mut WriteTarget) -> Result<()> {
        // the catalog and the boot image are regular file sources
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_eq_size;

    assert_eq_size!(ValidationEntry, [u8; 32]);
    assert_eq_size!(BootEntry, [u8; 32]);
    assert_eq_size!(SectionHeaderEntry, [u8; 32]);
    assert_eq_size!(BootInfoTable, [u8; 56]);

    #[test]
    fn validation_entry_checksums_to_zero() {
        let entry = ValidationEntry::new(0, [0; 24]);
        assert!(entry.is_valid());
        let bytes = bytemuck::bytes_of(&entry);
        let mut sum = 0u16;
        for pair in bytes.chunks_exact(2) {
            sum = sum.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
        }
        assert_eq!(sum, 0);
    }

    #[test]
    fn catalog_stream_serves_rendered_content() {
        let content = Arc::new(Mutex::new(vec![7u8; BLOCK_SIZE]));
        let mut s = BootCatalogStream::new(Arc::clone(&content));
        s.open().unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(read_buffer(&mut s, &mut buf).unwrap());
        assert_eq!(buf, vec![7u8; BLOCK_SIZE]);
        s.close().unwrap();
    }
}
