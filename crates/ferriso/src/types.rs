//! Primitive on-disc field types shared by every descriptor and record:
//! single- and both-endian integers (ECMA-119, 7.2 and 7.3), the d- and
//! a-character sets (ECMA-119, 7.4) and the two timestamp encodings
//! (ECMA-119, 8.4.26 and 9.1.5).

use chrono::{Datelike, FixedOffset, TimeZone, Timelike, Utc};

/// Logical block size of every ISO 9660 structure in this crate.
pub const BLOCK_SIZE: usize = 2048;

/// Largest size a single file section may have: 4 GiB - 1.
pub const MAX_FILE_SECTION_SIZE: u64 = 0xFFFF_FFFF;

/// Section size used for all but the last section of a split file.
/// A multiple of [`BLOCK_SIZE`]: 4 GiB - 2048.
pub const ISO_EXTENT_SIZE: u64 = 0xFFFF_F800;

pub(crate) fn div_up(n: u64, div: u64) -> u64 {
    (n + div - 1) / div
}

pub(crate) fn round_up(n: usize, mul: usize) -> usize {
    div_up(n as u64, mul as u64) as usize * mul
}

/// A 16-bit little-endian field.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct U16Le([u8; 2]);

/// A 32-bit little-endian field.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct U32Le([u8; 4]);

/// A 16-bit big-endian field.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct U16Be([u8; 2]);

/// A 32-bit big-endian field.
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct U32Be([u8; 4]);

impl U16Le {
    pub fn new(v: u16) -> Self {
        Self(v.to_le_bytes())
    }
    pub fn get(&self) -> u16 {
        u16::from_le_bytes(self.0)
    }
    pub fn set(&mut self, v: u16) {
        self.0 = v.to_le_bytes();
    }
}

impl U32Le {
    pub fn new(v: u32) -> Self {
        Self(v.to_le_bytes())
    }
    pub fn get(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
    pub fn set(&mut self, v: u32) {
        self.0 = v.to_le_bytes();
    }
}

impl U16Be {
    pub fn new(v: u16) -> Self {
        Self(v.to_be_bytes())
    }
    pub fn get(&self) -> u16 {
        u16::from_be_bytes(self.0)
    }
    pub fn set(&mut self, v: u16) {
        self.0 = v.to_be_bytes();
    }
}

impl U32Be {
    pub fn new(v: u32) -> Self {
        Self(v.to_be_bytes())
    }
    pub fn get(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
    pub fn set(&mut self, v: u32) {
        self.0 = v.to_be_bytes();
    }
}

/// A 16-bit both-endian field: LSB form followed by MSB form (ECMA-119, 7.2.3).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct U16LsbMsb {
    lsb: U16Le,
    msb: U16Be,
}

/// A 32-bit both-endian field: LSB form followed by MSB form (ECMA-119, 7.3.3).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct U32LsbMsb {
    lsb: U32Le,
    msb: U32Be,
}

impl U16LsbMsb {
    pub fn new(v: u16) -> Self {
        Self {
            lsb: U16Le::new(v),
            msb: U16Be::new(v),
        }
    }
    pub fn get(&self) -> u16 {
        self.lsb.get()
    }
    pub fn set(&mut self, v: u16) {
        self.lsb.set(v);
        self.msb.set(v);
    }
}

impl U32LsbMsb {
    pub fn new(v: u32) -> Self {
        Self {
            lsb: U32Le::new(v),
            msb: U32Be::new(v),
        }
    }
    pub fn get(&self) -> u32 {
        self.lsb.get()
    }
    pub fn set(&mut self, v: u32) {
        self.lsb.set(v);
        self.msb.set(v);
    }
}

/// Whether `c` belongs to the d-character set (ECMA-119, 7.4.1).
pub fn is_d_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_'
}

/// Whether `c` belongs to the a-character set (ECMA-119, 7.4.1).
pub fn is_a_char(c: u8) -> bool {
    const SYMBOLS: &[u8] = b" !\"%&'()*+,-./:;<=>?";
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_' || SYMBOLS.contains(&c)
}

/// Copy `src` into a space-padded fixed field (ECMA-119 identifier fields
/// are filled with 0x20 up to their length).
pub fn copy_str_pad(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in dst[n..].iter_mut() {
        *b = b' ';
    }
}

fn tz_quarters(tz_offset_secs: i32) -> u8 {
    // Offset from GMT in 15 minute intervals, -48 .. +52 (ECMA-119, 8.4.26.1).
    (tz_offset_secs / 900) as i8 as u8
}

/// Encode a 7-byte directory-record timestamp (ECMA-119, 9.1.5).
///
/// `always_gmt` forces timezone 0 and a UTC rendition of the instant.
pub fn datetime_7(buf: &mut [u8; 7], secs: i64, always_gmt: bool) {
    let (dt, off) = localized(secs, always_gmt);
    buf[0] = (dt.year() - 1900).clamp(0, 255) as u8;
    buf[1] = dt.month() as u8;
    buf[2] = dt.day() as u8;
    buf[3] = dt.hour() as u8;
    buf[4] = dt.minute() as u8;
    buf[5] = dt.second() as u8;
    buf[6] = tz_quarters(off);
}

/// Encode a 17-byte volume-descriptor timestamp (ECMA-119, 8.4.26).
pub fn datetime_17(buf: &mut [u8; 17], secs: i64, always_gmt: bool) {
    let (dt, off) = localized(secs, always_gmt);
    let digits = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
        dt.year().clamp(0, 9999),
        dt.month(),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        0
    );
    buf[..16].copy_from_slice(&digits.as_bytes()[..16]);
    buf[16] = tz_quarters(off);
}

fn localized(secs: i64, always_gmt: bool) -> (chrono::DateTime<FixedOffset>, i32) {
    let utc = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(|| {
        Utc.timestamp_opt(0, 0).single().expect("epoch is representable")
    });
    if always_gmt {
        (utc.fixed_offset(), 0)
    } else {
        let local = utc.with_timezone(&chrono::Local);
        let off = local.offset().local_minus_utc();
        (local.fixed_offset(), off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_endian_layout() {
        let v = U32LsbMsb::new(0x0102_0304);
        let bytes = bytemuck::bytes_of(&v);
        assert_eq!(bytes, &[0x04, 0x03, 0x02, 0x01, 0x01, 0x02, 0x03, 0x04]);

        let v = U16LsbMsb::new(0x1234);
        let bytes = bytemuck::bytes_of(&v);
        assert_eq!(bytes, &[0x34, 0x12, 0x12, 0x34]);
    }

    #[test]
    fn datetime_7_gmt() {
        // 2009-07-14 12:30:05 UTC
        let mut buf = [0u8; 7];
        datetime_7(&mut buf, 1_247_574_605, true);
        assert_eq!(buf, [109, 7, 14, 12, 30, 5, 0]);
    }

    #[test]
    fn datetime_17_gmt() {
        let mut buf = [0u8; 17];
        datetime_17(&mut buf, 1_247_574_605, true);
        assert_eq!(&buf[..16], b"2009071412300500");
        assert_eq!(buf[16], 0);
    }

    #[test]
    fn d_chars() {
        assert!(is_d_char(b'A'));
        assert!(is_d_char(b'0'));
        assert!(is_d_char(b'_'));
        assert!(!is_d_char(b'a'));
        assert!(!is_d_char(b'.'));
    }
}
