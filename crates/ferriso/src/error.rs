//! Error type and the numeric error-code space.
//!
//! Every reportable condition has a `u32` code with the severity in the
//! high byte, a priority in the next byte and a unique id in the low 16
//! bits. The codes double as message-queue identifiers, so a consumer can
//! match on them without parsing text.

use crate::msg::Severity;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IsoError>;

macro_rules! codes {
    ($($(#[$doc:meta])* $name:ident = ($sev:ident, $prio:expr, $id:expr);)*) => {
        $(
            $(#[$doc])*
            pub const $name: u32 =
                ((Severity::$sev as u32) << 24) | (($prio as u32) << 16) | ($id as u32);
        )*
    };
}

/// Numeric error codes. High byte severity, next byte priority, low 16
/// bits unique id.
pub mod codes {
    use super::Severity;

    codes! {
        /// Image generation canceled by the consumer.
        CANCELED = (Failure, 0x30, 0xFFFF);
        /// Unexpected fatal error.
        FATAL = (Fatal, 0x30, 0xFFFE);
        /// Unknown or unexpected error.
        ERROR = (Failure, 0x30, 0xFFFD);
        /// Internal programming error.
        ASSERT_FAILURE = (Fatal, 0x30, 0xFFFC);
        /// Invalid parameter value.
        WRONG_ARG_VALUE = (Failure, 0x30, 0xFFF8);
        /// Cannot create a needed thread.
        THREAD_ERROR = (Fatal, 0x30, 0xFFF7);
        /// Write error on the image stream.
        WRITE_ERROR = (Failure, 0x30, 0xFFF6);
        /// Error reading from the ring buffer.
        BUF_READ_ERROR = (Failure, 0x30, 0xFFF5);

        /// A node with the same name already exists.
        NODE_NAME_NOT_UNIQUE = (Failure, 0x30, 0xFFC0);
        /// The node is already attached to a directory.
        NODE_ALREADY_ADDED = (Failure, 0x30, 0xFFBF);
        /// A requested node does not exist.
        NODE_DOESNT_EXIST = (Failure, 0x30, 0xFFBD);
        /// The file is not suitable as a boot image.
        BOOT_IMAGE_NOT_VALID = (Failure, 0x30, 0xFFBB);

        /// Generic file operation error.
        FILE_ERROR = (Failure, 0x30, 0xFF80);
        /// Access to a file source was denied.
        FILE_ACCESS_DENIED = (Failure, 0x30, 0xFF7E);
        /// A directory was used where a file is expected.
        FILE_IS_DIR = (Failure, 0x30, 0xFF7A);
        /// Read error on a file source.
        FILE_READ_ERROR = (Failure, 0x30, 0xFF79);
        /// Seek error on a file source.
        FILE_SEEK_ERROR = (Failure, 0x30, 0xFF77);
        /// Node not representable in the target tree, dropped.
        FILE_IGNORED = (Hint, 0x30, 0xFF76);
        /// File too big for the selected interchange level.
        FILE_TOO_BIG = (Failure, 0x30, 0xFF75);
        /// File content could not be streamed, span zero-filled.
        FILE_CANT_WRITE = (Mishap, 0x30, 0xFF74);
        /// Name not convertible to the output charset.
        FILENAME_WRONG_CHARSET = (Warning, 0x30, 0xFF73);
        /// Image path violates depth or length limits.
        FILE_IMGPATH_WRONG = (Failure, 0x30, 0xFF72);
        /// More colliding names than the mangler can number.
        MANGLE_TOO_MUCH_FILES = (Failure, 0x30, 0xFF71);

        /// Image write canceled (writer-side observation).
        IMAGE_WRITE_CANCELED = (Update, 0x30, 0xFF70);
        /// isohybrid patching requested without the needed inputs.
        ISOLINUX_CANT_PATCH = (Sorry, 0x30, 0xFF6F);
        /// zisofs cannot encode files of 4 GiB or more.
        ZISOFS_TOO_BIG = (Failure, 0x30, 0xFF6E);
        /// External filter process failed.
        FILTER_BROKEN = (Failure, 0x30, 0xFF6D);
        /// MD5 of streamed content does not match the recorded one.
        MD5_MISMATCH = (Mishap, 0x30, 0xFF6C);
    }
}

/// Severity embedded in an error code.
pub fn code_severity(code: u32) -> Severity {
    Severity::from_value((code >> 24) as u8)
}

/// Errors surfaced by the authoring engine.
#[derive(Debug, thiserror::Error)]
pub enum IsoError {
    #[error("operation canceled")]
    Canceled,

    #[error("internal assertion failure")]
    AssertFailure,

    #[error("invalid argument: {0}")]
    WrongArg(String),

    #[error("cannot create writer thread")]
    Thread,

    #[error("error writing to image stream")]
    Write,

    #[error("error reading from ring buffer (code {0:#010x})")]
    BufRead(u32),

    #[error("name {0:?} is not unique inside its directory")]
    NameNotUnique(String),

    #[error("node is already added to a directory")]
    NodeAlreadyAdded,

    #[error("invalid node name or path: {0}")]
    InvalidPath(String),

    #[error("too many files with the same name to mangle")]
    MangleTooManyFiles,

    #[error("file {0:?} is bigger than allowed by the selected ISO level")]
    FileTooBig(String),

    #[error("image path for {0:?} exceeds ECMA-119 limits")]
    ImgPathWrong(String),

    #[error("cannot convert name {0:?} to the output character set")]
    WrongCharset(String),

    #[error("{0:?} is not a valid boot image")]
    BootImageNotValid(String),

    #[error("isohybrid patching needs an El Torito image and system area data")]
    IsolinuxCantPatch,

    #[error("zisofs cannot encode files of 4 GiB or more")]
    ZisofsTooBig,

    #[error("external filter failed: {0}")]
    FilterBroken(String),

    #[error("message severity reached the abort threshold (code {code:#010x}): {text}")]
    Abort { code: u32, text: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IsoError {
    /// The numeric code of this error; see [`codes`].
    pub fn code(&self) -> u32 {
        use codes::*;
        match self {
            IsoError::Canceled => CANCELED,
            IsoError::AssertFailure => ASSERT_FAILURE,
            IsoError::WrongArg(_) => WRONG_ARG_VALUE,
            IsoError::Thread => THREAD_ERROR,
            IsoError::Write => WRITE_ERROR,
            IsoError::BufRead(code) => *code,
            IsoError::NameNotUnique(_) => NODE_NAME_NOT_UNIQUE,
            IsoError::NodeAlreadyAdded => NODE_ALREADY_ADDED,
            IsoError::InvalidPath(_) => WRONG_ARG_VALUE,
            IsoError::MangleTooManyFiles => MANGLE_TOO_MUCH_FILES,
            IsoError::FileTooBig(_) => FILE_TOO_BIG,
            IsoError::ImgPathWrong(_) => FILE_IMGPATH_WRONG,
            IsoError::WrongCharset(_) => FILENAME_WRONG_CHARSET,
            IsoError::BootImageNotValid(_) => BOOT_IMAGE_NOT_VALID,
            IsoError::IsolinuxCantPatch => ISOLINUX_CANT_PATCH,
            IsoError::ZisofsTooBig => ZISOFS_TOO_BIG,
            IsoError::FilterBroken(_) => FILTER_BROKEN,
            IsoError::Abort { code, .. } => *code,
            IsoError::Io(_) => FILE_ERROR,
        }
    }

    /// Severity of this error, decoded from its code.
    pub fn severity(&self) -> Severity {
        code_severity(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_encoding() {
        assert_eq!(codes::CANCELED, 0x5830_FFFF);
        assert_eq!(code_severity(codes::CANCELED), Severity::Failure);
        assert_eq!(code_severity(codes::FILE_CANT_WRITE), Severity::Mishap);
        assert_eq!(code_severity(codes::FILE_IGNORED), Severity::Hint);
    }

    #[test]
    fn severity_of_error() {
        assert_eq!(IsoError::Canceled.severity(), Severity::Failure);
        assert_eq!(IsoError::Thread.severity(), Severity::Fatal);
    }
}
