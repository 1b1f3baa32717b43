//! The `FileSource` contract consumed from ingestion code, plus the local
//! filesystem implementation used by tests and demos.
//!
//! Ingestion (filesystem walks, ISO re-import) lives outside this crate;
//! the engine only relies on the capability set below to stat and stream
//! file content.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{IsoError, Result};

/// POSIX-ish stat information the engine needs from a source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File type and permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Device the source lives on, used for hardlink identity.
    pub dev: u64,
    /// Inode on that device, used for hardlink identity.
    pub ino: u64,
    pub nlink: u32,
    /// Device number of block/char special files.
    pub rdev: u64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }
    pub fn is_reg(&self) -> bool {
        self.mode & 0o170000 == 0o100000
    }
    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }
}

/// A named extended attribute, forwarded into AAIP fields when enabled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct XAttr {
    pub name: String,
    pub value: Vec<u8>,
}

/// Byte source for file content, with enough metadata for identity and
/// hardlink detection. All methods may be called from the writer thread.
pub trait FileSource: Send {
    /// Full path of the source, for diagnostics.
    fn path(&self) -> String;

    /// Last path component.
    fn name(&self) -> String;

    /// Stat without following a final symlink.
    fn lstat(&self) -> Result<FileStat>;

    /// Stat following symlinks.
    fn stat(&self) -> Result<FileStat>;

    /// Check read access to the content without opening it.
    fn access(&self) -> Result<()>;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Read into `buf`, returning 0 at EOF. Only valid while open.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Destination of a symlink source.
    fn readlink(&self) -> Result<String> {
        Err(IsoError::WrongArg(format!(
            "{} is not a symlink",
            self.path()
        )))
    }

    /// Seek to an absolute content offset. Only valid while open.
    fn lseek(&mut self, offset: u64) -> Result<u64>;

    /// Identifier of the filesystem the source belongs to.
    fn filesystem_id(&self) -> u32;

    /// Extended attributes of the source, empty when unsupported.
    fn xattrs(&self) -> Result<Vec<XAttr>> {
        Ok(Vec::new())
    }
}

/// Filesystem id assigned to everything reached through [`LocalFileSource`].
pub const LOCAL_FS_ID: u32 = 1;

/// A `FileSource` over a path in the local filesystem.
pub struct LocalFileSource {
    path: PathBuf,
    file: Option<fs::File>,
}

impl LocalFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        LocalFileSource {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }
}

#[cfg(unix)]
fn stat_of(meta: &fs::Metadata) -> FileStat {
    use std::os::unix::fs::MetadataExt;
    FileStat {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        dev: meta.dev(),
        ino: meta.ino(),
        nlink: meta.nlink() as u32,
        rdev: meta.rdev(),
    }
}

#[cfg(not(unix))]
fn stat_of(meta: &fs::Metadata) -> FileStat {
    FileStat {
        mode: if meta.is_dir() { 0o040755 } else { 0o100644 },
        size: meta.len(),
        nlink: 1,
        ..FileStat::default()
    }
}

impl FileSource for LocalFileSource {
    fn path(&self) -> String {
        self.path.display().to_string()
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn lstat(&self) -> Result<FileStat> {
        Ok(stat_of(&fs::symlink_metadata(&self.path)?))
    }

    fn stat(&self) -> Result<FileStat> {
        Ok(stat_of(&fs::metadata(&self.path)?))
    }

    fn access(&self) -> Result<()> {
        fs::File::open(&self.path)?;
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        self.file = Some(fs::File::open(&self.path)?);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.as_mut() {
            Some(f) => Ok(f.read(buf)?),
            None => Err(IsoError::WrongArg("source is not open".into())),
        }
    }

    fn readlink(&self) -> Result<String> {
        let dest = fs::read_link(&self.path)?;
        Ok(dest.to_string_lossy().into_owned())
    }

    fn lseek(&mut self, offset: u64) -> Result<u64> {
        match self.file.as_mut() {
            Some(f) => Ok(f.seek(SeekFrom::Start(offset))?),
            None => Err(IsoError::WrongArg("source is not open".into())),
        }
    }

    fn filesystem_id(&self) -> u32 {
        LOCAL_FS_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn local_source_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"content")
            .unwrap();

        let mut src = LocalFileSource::new(&path);
        assert_eq!(src.name(), "a.txt");
        let st = src.stat().unwrap();
        assert_eq!(st.size, 7);
        assert!(st.is_reg());

        src.open().unwrap();
        let mut buf = [0u8; 16];
        let n = src.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"content");
        src.close().unwrap();
    }
}
