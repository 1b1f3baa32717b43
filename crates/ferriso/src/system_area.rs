//! The System Area: the first 16 blocks of the image (ECMA-119, 6.2.1).
//!
//! Caller-provided data is copied verbatim; on request the area gets a
//! protective MBR partition table (the GRUB msdos label gesture) or an
//! isohybrid patch that makes the image bootable from disk media.

use crate::error::{IsoError, Result};
use crate::types::BLOCK_SIZE;
use crate::write::WriteTarget;

/// System area length in bytes.
pub const SYSTEM_AREA_SIZE: usize = 16 * BLOCK_SIZE;

/// Partition table bit of `system_area_options`.
pub const OPT_PROTECTIVE_MBR: u8 = 1 << 0;
/// Isohybrid bit of `system_area_options`.
pub const OPT_ISOHYBRID: u8 = 1 << 1;

const SECTORS_PER_TRACK: u64 = 63;
const HEADS_PER_CYL: u64 = 255;

/// CHS encoding of a 512-byte LBA, clamped to the classic 1023/254/63.
fn chs(lba512: u64) -> [u8; 3] {
    let mut cyl = lba512 / (SECTORS_PER_TRACK * HEADS_PER_CYL);
    let rest = lba512 % (SECTORS_PER_TRACK * HEADS_PER_CYL);
    let mut head = rest / SECTORS_PER_TRACK;
    let mut sec = rest % SECTORS_PER_TRACK + 1;
    if cyl >= 1024 {
        cyl = 1023;
        head = HEADS_PER_CYL - 1;
        sec = SECTORS_PER_TRACK;
    }
    [
        head as u8,
        (sec as u8) | (((cyl >> 2) & 0xC0) as u8),
        (cyl & 0xFF) as u8,
    ]
}

/// Write a single partition entry reserving the whole image, bytes
/// 446..462, plus the boot signature.
fn protective_mbr(img_blocks: u32, buf: &mut [u8]) {
    // unit of the table is 512-byte sectors
    let img_blocks = img_blocks.min(0x4000_0000) as u64;
    let end_lba = img_blocks * 4 - 1;

    buf[446..510].fill(0);
    buf[510] = 0x55;
    buf[511] = 0xAA;

    let entry = &mut buf[446..462];
    entry[0] = 0x80;
    // CHS of the start: head 0, sector 2, cylinder 0
    entry[1] = 0;
    entry[2] = 2;
    entry[3] = 0;
    entry[4] = 0xCD;
    entry[5..8].copy_from_slice(&chs(end_lba));
    entry[8..12].copy_from_slice(&1u32.to_le_bytes());
    entry[12..16].copy_from_slice(&(end_lba as u32).to_le_bytes());
}

/// Rework the supplied MBR so the medium boots from disk as well: record
/// the boot image location and cover the whole image with partition 1.
fn isohybrid_patch(img_blocks: u32, boot_lba: u32, buf: &mut [u8]) {
    let img_blocks = img_blocks.min(0x4000_0000) as u64;
    let end_lba = img_blocks * 4 - 1;

    // the isolinux loader reads its own start from bytes 432..436,
    // in 512-byte units
    buf[432..436].copy_from_slice(&(boot_lba * 4).to_le_bytes());

    buf[446..510].fill(0);
    buf[510] = 0x55;
    buf[511] = 0xAA;

    let entry = &mut buf[446..462];
    entry[0] = 0x80;
    // partition 1 starts at the very beginning of the medium
    entry[1] = 0;
    entry[2] = 1;
    entry[3] = 0;
    entry[4] = 0x17;
    entry[5..8].copy_from_slice(&chs(end_lba));
    entry[8..12].copy_from_slice(&0u32.to_le_bytes());
    entry[12..16].copy_from_slice(&((end_lba + 1) as u32).to_le_bytes());
}

/// Render the 16-block system area for the current layout.
pub fn render(t: &WriteTarget) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; SYSTEM_AREA_SIZE];
    if let Some(data) = &t.opts.system_area_data {
        let n = data.len().min(SYSTEM_AREA_SIZE);
        buf[..n].copy_from_slice(&data[..n]);
    }

    let img_blocks = t.curblock;
    if t.opts.system_area_options & OPT_PROTECTIVE_MBR != 0 {
        protective_mbr(img_blocks, &mut buf);
    } else if t.opts.system_area_options & OPT_ISOHYBRID != 0 {
        #[cfg(feature = "el-torito")]
        {
            let state = t.eltorito.as_ref().ok_or(IsoError::IsolinuxCantPatch)?;
            if t.opts.system_area_data.is_none() {
                return Err(IsoError::IsolinuxCantPatch);
            }
            let boot_lba = t.filesrcs.get(state.boot_src).sections[0].block;
            isohybrid_patch(img_blocks, boot_lba, &mut buf);
        }
        #[cfg(not(feature = "el-torito"))]
        return Err(IsoError::IsolinuxCantPatch);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chs_of_small_lba() {
        // LBA 0: cylinder 0, head 0, sector 1
        assert_eq!(chs(0), [0, 1, 0]);
    }

    #[test]
    fn chs_clamps_large_volumes() {
        let enc = chs(u64::MAX / 4);
        assert_eq!(enc[0], 254);
        assert_eq!(enc[2], 0xFF);
    }

    #[test]
    fn protective_entry_layout() {
        let mut buf = vec![0u8; SYSTEM_AREA_SIZE];
        protective_mbr(33, &mut buf);
        assert_eq!(buf[510], 0x55);
        assert_eq!(buf[511], 0xAA);
        assert_eq!(buf[446], 0x80);
        assert_eq!(buf[450], 0xCD);
        let start = u32::from_le_bytes(buf[454..458].try_into().unwrap());
        let count = u32::from_le_bytes(buf[458..462].try_into().unwrap());
        assert_eq!(start, 1);
        assert_eq!(count, 33 * 4 - 1);
    }
}
