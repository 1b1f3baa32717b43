//! Ferriso
//!
//! A streaming authoring engine for ISO 9660 filesystem images with the
//! Rock Ridge, Joliet, ISO 9660:1999 and El Torito extensions.
//!
//! An in-memory [`Image`] tree of directories, files, symlinks and
//! special files is laid out by a multi-pass writer pipeline and produced
//! block by block on a bounded ring buffer. The consumer pulls bytes from
//! the [`ImageSource`] on its own thread while the writer thread streams
//! ahead; production can be appendable, referencing content of a previous
//! session without rewriting it.
//!
//! # Example
//!
//! ```
//! use ferriso::{create_source, Image, Profile, WriteOpts};
//! use ferriso::stream::{share, MemoryStream};
//!
//! let mut image = Image::new("EXAMPLE");
//! let root = image.root();
//! image.add_file(root, "hello.txt", share(MemoryStream::new(b"hi\n".to_vec())))?;
//!
//! let mut opts = WriteOpts::new(Profile::Basic);
//! let mut src = create_source(image, &mut opts)?;
//!
//! let mut iso = Vec::new();
//! let mut block = [0u8; 2048];
//! loop {
//!     let n = src.read(&mut block)?;
//!     if n == 0 {
//!         break;
//!     }
//!     iso.extend_from_slice(&block[..n]);
//! }
//! assert_eq!(iso.len() as u64, src.get_size());
//! assert_eq!(&iso[16 * 2048 + 1..16 * 2048 + 6], b"CD001");
//! # Ok::<(), ferriso::IsoError>(())
//! ```

pub mod buffer;
#[cfg(feature = "checksums")]
pub mod checksum;
pub mod ecma119;
#[cfg(feature = "el-torito")]
pub mod eltorito;
pub mod error;
pub mod filesrc;
pub mod fsource;
pub mod iso1999;
pub mod joliet;
mod mangle;
pub mod msg;
pub mod opts;
pub mod rrip;
pub mod stream;
pub mod system_area;
pub mod tree;
pub mod types;
pub mod write;

pub use error::{IsoError, Result};
pub use filesrc::Section;
pub use fsource::{FileSource, FileStat, LocalFileSource};
pub use msg::{Message, Severity};
pub use opts::{Profile, WriteOpts};
pub use tree::{HideFlags, Image, Node, NodeAttrs, NodeId, NodeKind};
pub use types::BLOCK_SIZE;
pub use write::{create_source, ImageSource};
