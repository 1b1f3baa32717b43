//! Translation of logical names into ECMA-119 identifiers.
//!
//! The strict forms keep only d-characters `[A-Z0-9_]`; relaxation levels
//! admit lowercase or the full ASCII range. File names are split at the
//! last dot; level 1 enforces 8+3, levels 2 and 3 allow 31 characters in
//! total, and `max_37_char_filenames` stretches that to 37 by dropping the
//! version number.

use crate::types::is_d_char;

/// How far the identifier character set is relaxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relaxed {
    /// d-characters only, lowercase folded to uppercase.
    No,
    /// Lowercase letters survive.
    Lowercase,
    /// Any ASCII except NUL and '/'.
    FullAscii,
}

fn map_char(c: u8, relaxed: Relaxed) -> u8 {
    match relaxed {
        Relaxed::FullAscii => {
            if c == 0 || c == b'/' {
                b'_'
            } else {
                c
            }
        }
        Relaxed::Lowercase => {
            if is_d_char(c) || c.is_ascii_lowercase() {
                c
            } else if is_d_char(c.to_ascii_uppercase()) {
                c.to_ascii_uppercase()
            } else {
                b'_'
            }
        }
        Relaxed::No => {
            let up = c.to_ascii_uppercase();
            if is_d_char(up) {
                up
            } else {
                b'_'
            }
        }
    }
}

/// Reduce a name to its ASCII rendition; non-ASCII characters become '_'.
/// The full charset conversion of the ingestion layer happens before the
/// engine sees names, so this is only the final safety net.
fn to_ascii(name: &str) -> Vec<u8> {
    name.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'_' })
        .collect()
}

/// Directory identifier: a single component of at most `max_len` bytes.
pub fn dirid(name: &str, max_len: usize, relaxed: Relaxed) -> String {
    let ascii = to_ascii(name);
    let out: Vec<u8> = ascii
        .iter()
        .take(max_len)
        .map(|&c| map_char(c, relaxed))
        .collect();
    String::from_utf8(out).expect("mapped chars are ASCII")
}

/// Split a file name at the last dot. A trailing dot counts as an empty
/// extension, with the dot itself not part of the base name.
fn split_ext(name: &[u8]) -> (usize, usize) {
    match name.iter().rposition(|&c| c == b'.') {
        Some(dot) if dot + 1 < name.len() => (dot, name.len() - dot - 1),
        Some(dot) => (dot, 0),
        None => (name.len(), 0),
    }
}

/// File identifier with a maximum of `max_len` characters for name plus
/// extension (the dot not counted). The extension keeps at least 3
/// characters when trimming; the dot is forced unless `force_dot` is off
/// and the source has no extension.
pub fn fileid(name: &str, max_len: usize, relaxed: Relaxed, force_dot: bool) -> String {
    let ascii = to_ascii(name);
    let (lname, lext) = split_ext(&ascii);

    let (lnname, lnext) = if lext == 0 {
        (lname.min(max_len), 0)
    } else if lname + lext > max_len {
        // trim the extension first, but never below 3 characters
        let lnext = if lext > 3 {
            if lname < max_len - 3 {
                max_len - lname
            } else {
                3
            }
        } else {
            lext
        };
        (max_len - lnext, lnext)
    } else {
        (lname, lext)
    };

    let mut out = Vec::with_capacity(lnname + lnext + 1);
    for &c in ascii.iter().take(lnname) {
        out.push(map_char(c, relaxed));
    }
    if lnext > 0 || force_dot {
        out.push(b'.');
    }
    for &c in ascii[lname + 1..].iter().take(lnext) {
        out.push(map_char(c, relaxed));
    }
    String::from_utf8(out).expect("mapped chars are ASCII")
}

/// Level 1 file identifier: 8 name characters, 3 extension characters,
/// mandatory dot.
pub fn iso_1_fileid(name: &str) -> String {
    let ascii = to_ascii(name);
    let (lname, lext) = split_ext(&ascii);
    let mut out = Vec::with_capacity(12);
    for &c in ascii.iter().take(lname.min(8)) {
        out.push(map_char(c, Relaxed::No));
    }
    out.push(b'.');
    for &c in ascii[lname.min(ascii.len())..]
        .iter()
        .skip(if lext > 0 { 1 } else { 0 })
        .take(lext.min(3))
    {
        out.push(map_char(c, Relaxed::No));
    }
    String::from_utf8(out).expect("mapped chars are ASCII")
}

/// Level 2 and 3 file identifier: up to 31 characters including the dot.
pub fn iso_2_fileid(name: &str) -> String {
    fileid(name, 30, Relaxed::No, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level1_basics() {
        assert_eq!(iso_1_fileid("hello.txt"), "HELLO.TXT");
        assert_eq!(iso_1_fileid("a_very_long_name.text"), "A_VERY_L.TEX");
        assert_eq!(iso_1_fileid("noext"), "NOEXT.");
        assert_eq!(iso_1_fileid("sp ace.c"), "SP_ACE.C");
    }

    #[test]
    fn level2_keeps_more() {
        assert_eq!(iso_2_fileid("hello.txt"), "HELLO.TXT");
        let long = "abcdefghijklmnopqrstuvwxyz0123456789.extension";
        let id = iso_2_fileid(long);
        assert!(id.len() <= 31);
        assert!(id.contains('.'));
        // extension trimmed to 3, name fills the rest
        assert!(id.ends_with(".EXT"));
    }

    #[test]
    fn dirid_truncates() {
        assert_eq!(dirid("Subdir", 8, Relaxed::No), "SUBDIR");
        assert_eq!(dirid("verylongdirectory", 8, Relaxed::No), "VERYLONG");
        assert_eq!(dirid("MixedCase", 31, Relaxed::Lowercase), "MixedCase");
        assert_eq!(dirid("we?rd", 8, Relaxed::FullAscii), "we?rd");
    }

    #[test]
    fn relaxed_file_names() {
        assert_eq!(fileid("lower.txt", 30, Relaxed::Lowercase, true), "lower.txt");
        assert_eq!(
            fileid("no_ext_no_dot", 30, Relaxed::Lowercase, false),
            "no_ext_no_dot"
        );
        assert_eq!(
            fileid("no_ext_forced", 30, Relaxed::No, true),
            "NO_EXT_FORCED."
        );
    }
}
