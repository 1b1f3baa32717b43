//! Options for image generation.
//!
//! `WriteOpts` is the user-facing struct: builder-style setters over a
//! profile baseline. At production start it is resolved into the internal
//! [`TargetOpts`] snapshot, validating ranges and applying the replace
//! semantics (0 keep, 1 default, 2 use the supplied value).

use crate::error::{IsoError, Result};
use crate::tree::Image;
use crate::write::TargetOpts;

/// Baseline configurations selectable at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Level 1, no extensions: readable everywhere.
    Basic,
    /// Level 3 with Rock Ridge: suitable for backups.
    Backup,
    /// Level 2 with Rock Ridge and Joliet, ownership and timestamps
    /// replaced by defaults, timestamps in GMT.
    Distribution,
}

/// Options for the production of an image.
#[derive(Debug, Clone, Default)]
pub struct WriteOpts {
    pub iso_level: u8,
    pub rockridge: bool,
    pub joliet: bool,
    pub iso1999: bool,
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
    /// bit0: compute, bit1: verify pre-computed values.
    pub md5_file_checksums: u8,
    pub sort_files: bool,

    /// 0 keep, 1 default, 2 use the value below.
    pub replace_uid: u8,
    pub replace_gid: u8,
    pub replace_dir_mode: u8,
    pub replace_file_mode: u8,
    pub replace_timestamps: u8,
    pub uid: u32,
    pub gid: u32,
    pub dir_mode: u32,
    pub file_mode: u32,
    pub timestamp: i64,

    pub output_charset: Option<String>,
    pub appendable: bool,
    /// Start LBA of the image on the medium.
    pub ms_block: u32,
    /// Ring buffer size in blocks, at least 32.
    pub fifo_size: usize,
    /// Caller buffer receiving the content for LBA 0 of a growable
    /// medium; at least 64 KiB.
    pub overwrite: Option<Vec<u8>>,
    /// Opaque system area content, at most 32 KiB.
    pub system_area_data: Option<Vec<u8>>,
    /// bit0: protective MBR partition table, bit1: isohybrid patching.
    pub system_area_options: u8,

    pub vol_creation_time: i64,
    pub vol_modification_time: i64,
    pub vol_expiration_time: i64,
    pub vol_effective_time: i64,
    /// 16 decimal digits placed verbatim into the PVD creation and
    /// modification times.
    pub vol_uuid: Option<[u8; 16]>,
}

impl WriteOpts {
    pub fn new(profile: Profile) -> Self {
        let mut opts = WriteOpts {
            fifo_size: 1024,
            sort_files: true,
            ..WriteOpts::default()
        };
        match profile {
            Profile::Basic => {
                opts.iso_level = 1;
            }
            Profile::Backup => {
                opts.iso_level = 3;
                opts.rockridge = true;
            }
            Profile::Distribution => {
                opts.iso_level = 2;
                opts.rockridge = true;
                opts.joliet = true;
                opts.replace_dir_mode = 1;
                opts.replace_file_mode = 1;
                opts.replace_uid = 1;
                opts.replace_gid = 1;
                opts.replace_timestamps = 1;
                opts.always_gmt = true;
            }
        }
        opts
    }

    pub fn with_iso_level(mut self, level: u8) -> Self {
        self.iso_level = level;
        self
    }

    pub fn with_rockridge(mut self, enable: bool) -> Self {
        self.rockridge = enable;
        self
    }

    pub fn with_joliet(mut self, enable: bool) -> Self {
        self.joliet = enable;
        self
    }

    pub fn with_iso1999(mut self, enable: bool) -> Self {
        self.iso1999 = enable;
        self
    }

    pub fn with_aaip(mut self, enable: bool) -> Self {
        self.aaip = enable;
        self
    }

    pub fn with_hardlinks(mut self, enable: bool) -> Self {
        self.hardlinks = enable;
        self
    }

    pub fn with_omit_version_numbers(mut self, omit: u8) -> Self {
        self.omit_version_numbers = omit & 3;
        self
    }

    pub fn with_appendable(mut self, appendable: bool) -> Self {
        self.appendable = appendable;
        self
    }

    pub fn with_ms_block(mut self, ms_block: u32) -> Self {
        self.ms_block = ms_block;
        self
    }

    pub fn with_fifo_size(mut self, blocks: usize) -> Self {
        self.fifo_size = blocks;
        self
    }

    pub fn with_overwrite_buffer(mut self, buf: Vec<u8>) -> Self {
        self.overwrite = Some(buf);
        self
    }

    pub fn with_system_area(mut self, data: Vec<u8>, options: u8) -> Self {
        self.system_area_data = Some(data);
        self.system_area_options = options;
        self
    }

    pub fn with_sort_files(mut self, sort: bool) -> Self {
        self.sort_files = sort;
        self
    }

    pub fn with_replace_uid(mut self, mode: u8, uid: u32) -> Self {
        self.replace_uid = mode;
        self.uid = uid;
        self
    }

    pub fn with_replace_gid(mut self, mode: u8, gid: u32) -> Self {
        self.replace_gid = mode;
        self.gid = gid;
        self
    }

    pub fn with_replace_dir_mode(mut self, mode: u8, dir_mode: u32) -> Self {
        self.replace_dir_mode = mode;
        self.dir_mode = dir_mode;
        self
    }

    pub fn with_replace_file_mode(mut self, mode: u8, file_mode: u32) -> Self {
        self.replace_file_mode = mode;
        self.file_mode = file_mode;
        self
    }

    pub fn with_replace_timestamps(mut self, mode: u8, timestamp: i64) -> Self {
        self.replace_timestamps = mode;
        self.timestamp = timestamp;
        self
    }

    pub fn with_pvd_times(mut self, creation: i64, modification: i64) -> Self {
        self.vol_creation_time = creation;
        self.vol_modification_time = modification;
        self
    }

    pub fn with_vol_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.vol_uuid = Some(uuid);
        self
    }

    pub(crate) fn overwrite_buf(&mut self) -> Option<&mut [u8]> {
        self.overwrite.as_mut().map(Vec::as_mut_slice)
    }

    /// Validate and flatten into the internal snapshot the writers use.
    pub(crate) fn snapshot(&self, image: &Image) -> Result<TargetOpts> {
        if !(1..=3).contains(&self.iso_level) {
            return Err(IsoError::WrongArg(format!(
                "invalid ISO level {}",
                self.iso_level
            )));
        }
        if self.fifo_size < 32 {
            return Err(IsoError::WrongArg(
                "fifo size must be at least 32 blocks".into(),
            ));
        }
        if self.replace_uid > 2
            || self.replace_gid > 2
            || self.replace_dir_mode > 2
            || self.replace_file_mode > 2
            || self.replace_timestamps > 2
        {
            return Err(IsoError::WrongArg("replace modes are 0, 1 or 2".into()));
        }
        if let Some(data) = &self.system_area_data {
            if data.len() > 16 * crate::types::BLOCK_SIZE {
                return Err(IsoError::WrongArg(
                    "system area data is larger than 32 KiB".into(),
                ));
            }
        }
        let sa_opts = self.system_area_options & 3;
        if sa_opts == 3 {
            return Err(IsoError::WrongArg(
                "protective MBR and isohybrid are mutually exclusive".into(),
            ));
        }
        if let Some(buf) = &self.overwrite {
            if buf.len() < 32 * crate::types::BLOCK_SIZE {
                return Err(IsoError::WrongArg(
                    "overwrite buffer must hold at least 64 KiB".into(),
                ));
            }
        }

        #[cfg(feature = "el-torito")]
        let eltorito = image.boot_catalog.is_some();
        #[cfg(not(feature = "el-torito"))]
        let eltorito = false;
        let _ = image;

        let now = chrono::Utc::now().timestamp();
        Ok(TargetOpts {
            iso_level: self.iso_level,
            rockridge: self.rockridge,
            joliet: self.joliet,
            iso1999: self.iso1999,
            eltorito,
            aaip: self.aaip,
            hardlinks: self.hardlinks,
            always_gmt: self.always_gmt,
            // forcing 37 character names eats the version number space
            omit_version_numbers: self.omit_version_numbers
                | if self.max_37_char_filenames { 1 } else { 0 },
            allow_deep_paths: self.allow_deep_paths,
            allow_longer_paths: self.allow_longer_paths,
            max_37_char_filenames: self.max_37_char_filenames,
            no_force_dots: self.no_force_dots,
            allow_lowercase: self.allow_lowercase,
            allow_full_ascii: self.allow_full_ascii,
            relaxed_vol_atts: self.relaxed_vol_atts,
            joliet_longer_paths: self.joliet_longer_paths,
            rrip_version_1_10: self.rrip_version_1_10,
            rrip_1_10_px_ino: self.rrip_1_10_px_ino,
            aaip_susp_1_10: self.aaip_susp_1_10,
            dir_rec_mtime: self.dir_rec_mtime,
            md5_session_checksum: self.md5_session_checksum,
            md5_file_checksums: self.md5_file_checksums,
            sort_files: self.sort_files,
            replace_uid: self.replace_uid != 0,
            replace_gid: self.replace_gid != 0,
            replace_dir_mode: self.replace_dir_mode != 0,
            replace_file_mode: self.replace_file_mode != 0,
            replace_timestamps: self.replace_timestamps != 0,
            uid: if self.replace_uid == 2 { self.uid } else { 0 },
            gid: if self.replace_gid == 2 { self.gid } else { 0 },
            dir_mode: if self.replace_dir_mode == 2 {
                self.dir_mode
            } else {
                0o555
            },
            file_mode: if self.replace_file_mode == 2 {
                self.file_mode
            } else {
                0o444
            },
            timestamp: if self.replace_timestamps == 2 {
                self.timestamp
            } else {
                now
            },
            output_charset: self.output_charset.clone(),
            appendable: self.appendable,
            ms_block: self.ms_block,
            fifo_size: self.fifo_size,
            system_area_data: self.system_area_data.clone(),
            system_area_options: sa_opts,
            vol_creation_time: self.vol_creation_time,
            vol_modification_time: self.vol_modification_time,
            vol_expiration_time: self.vol_expiration_time,
            vol_effective_time: self.vol_effective_time,
            vol_uuid: self.vol_uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_match_their_purpose() {
        let basic = WriteOpts::new(Profile::Basic);
        assert_eq!(basic.iso_level, 1);
        assert!(!basic.rockridge && !basic.joliet);
        assert_eq!(basic.fifo_size, 1024);
        assert!(basic.sort_files);

        let backup = WriteOpts::new(Profile::Backup);
        assert_eq!(backup.iso_level, 3);
        assert!(backup.rockridge);

        let distro = WriteOpts::new(Profile::Distribution);
        assert_eq!(distro.iso_level, 2);
        assert!(distro.rockridge && distro.joliet && distro.always_gmt);
        assert_eq!(distro.replace_uid, 1);
    }

    #[test]
    fn snapshot_validates_arguments() {
        let image = Image::new("T");
        assert!(WriteOpts::new(Profile::Basic)
            .with_iso_level(4)
            .snapshot(&image)
            .is_err());
        assert!(WriteOpts::new(Profile::Basic)
            .with_fifo_size(16)
            .snapshot(&image)
            .is_err());
        let bad_sa = WriteOpts {
            system_area_options: 3,
            ..WriteOpts::new(Profile::Basic)
        };
        assert!(bad_sa.snapshot(&image).is_err());
    }

    #[test]
    fn max_37_forces_version_omission() {
        let image = Image::new("T");
        let opts = WriteOpts {
            max_37_char_filenames: true,
            ..WriteOpts::new(Profile::Basic)
        };
        let t = opts.snapshot(&image).unwrap();
        assert_eq!(t.omit_version_numbers & 1, 1);
    }

    #[test]
    fn replace_semantics() {
        let image = Image::new("T");
        let t = WriteOpts::new(Profile::Basic)
            .with_replace_uid(2, 1000)
            .with_replace_gid(1, 4242)
            .snapshot(&image)
            .unwrap();
        assert!(t.replace_uid && t.replace_gid);
        assert_eq!(t.uid, 1000);
        // mode 1 means "default", the supplied value is ignored
        assert_eq!(t.gid, 0);
    }
}
