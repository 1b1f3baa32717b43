//! Collision numbering for on-disc identifiers.
//!
//! After translation, sibling identifiers may collide. Colliding groups
//! get a decimal suffix of progressively wider width (1..7 digits); the
//! base name, and for files the extension (never below 3 characters), is
//! trimmed to make room. Names are probed against a set of all sibling
//! names so a synthesized name never collides with an existing one.
//!
//! Used by all three on-disc trees; lengths are counted in characters,
//! which equals bytes for the ASCII ECMA-119 and 9660:1999 identifiers
//! and code units for the UCS-2 Joliet identifiers.

use std::collections::HashSet;

use crate::error::{IsoError, Result};

/// One sibling entry as seen by the mangler.
pub struct MangleEntry {
    pub name: String,
    pub is_dir: bool,
}

fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Make the names of `children` unique. The slice must be sorted by name.
///
/// Returns true when a name changed, in which case the caller re-sorts
/// the directory. Fails with [`IsoError::MangleTooManyFiles`] if seven
/// digits cannot resolve a group.
pub fn mangle_children(
    children: &mut [MangleEntry],
    max_file_len: usize,
    max_dir_len: usize,
) -> Result<bool> {
    let mut table: HashSet<String> = children.iter().map(|c| c.name.clone()).collect();
    let mut changed = false;

    let mut i = 0;
    while i < children.len() {
        // find the run of children sharing this name
        let mut j = i;
        while j + 1 < children.len() && children[j + 1].name == children[i].name {
            j += 1;
        }
        if j == i {
            i += 1;
            continue;
        }

        let mut digits = 1usize;
        'widen: while digits < 8 {
            // split the colliding name into base and extension
            let full = children[i].name.clone();
            let is_dir = children[i].is_dir;
            let dot = if is_dir { None } else { full.rfind('.') };
            let (mut base, mut ext, has_dot) = match dot {
                Some(pos) => (
                    full[..pos].to_string(),
                    full[pos + 1..].to_string(),
                    true,
                ),
                None => (full.clone(), String::new(), false),
            };

            let max = if has_dot {
                // level 1 extensions cannot give back space to the name
                let mut extlen = if max_file_len == 12 { 3 } else { char_len(&ext) };
                let mut room = max_file_len as isize - extlen as isize - 1 - digits as isize;
                if room <= 0 {
                    if extlen as isize + room > 3 {
                        extlen = (extlen as isize + room - 1) as usize;
                        ext = truncate_chars(&ext, extlen).to_string();
                        room = max_file_len as isize - extlen as isize - 1 - digits as isize;
                    } else {
                        return Err(IsoError::MangleTooManyFiles);
                    }
                }
                room as usize
            } else if is_dir {
                max_dir_len.saturating_sub(digits)
            } else {
                max_file_len.saturating_sub(digits)
            };
            if char_len(&base) > max {
                base = truncate_chars(&base, max).to_string();
            }

            let limit = 10usize.pow(digits as u32);
            let mut change = 0usize;
            let mut renames: Vec<(usize, String)> = Vec::with_capacity(j - i + 1);
            for k in i..=j {
                let new_name = loop {
                    if change >= limit {
                        digits += 1;
                        continue 'widen;
                    }
                    let candidate = if has_dot {
                        format!("{base}{change:0width$}.{ext}", width = digits)
                    } else {
                        format!("{base}{change:0width$}", width = digits)
                    };
                    change += 1;
                    if !table.contains(&candidate) {
                        break candidate;
                    }
                };
                renames.push((k, new_name));
            }
            for (k, new_name) in renames {
                log::debug!("\"{}\" renamed to \"{}\"", children[k].name, new_name);
                table.remove(&children[k].name);
                table.insert(new_name.clone());
                children[k].name = new_name;
                changed = true;
            }
            break;
        }
        if digits == 8 {
            return Err(IsoError::MangleTooManyFiles);
        }
        i = j + 1;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[&str]) -> Vec<MangleEntry> {
        names
            .iter()
            .map(|n| MangleEntry {
                name: n.to_string(),
                is_dir: false,
            })
            .collect()
    }

    #[test]
    fn unique_names_untouched() {
        let mut c = entries(&["A.TXT", "B.TXT"]);
        assert!(!mangle_children(&mut c, 12, 8).unwrap());
        assert_eq!(c[0].name, "A.TXT");
    }

    #[test]
    fn collision_group_gets_digits() {
        let mut c = entries(&["FOO.TXT", "FOO.TXT", "FOO.TXT"]);
        assert!(mangle_children(&mut c, 12, 8).unwrap());
        let names: Vec<&str> = c.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["FOO0.TXT", "FOO1.TXT", "FOO2.TXT"]);
        for n in names {
            assert!(n.len() <= 12);
        }
    }

    #[test]
    fn synthesized_names_avoid_existing() {
        let mut c = entries(&["FOO.TXT", "FOO.TXT", "FOO0.TXT"]);
        // the slice must be sorted by name
        c.sort_by(|a, b| a.name.cmp(&b.name));
        assert!(mangle_children(&mut c, 12, 8).unwrap());
        let mut names: Vec<String> = c.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"FOO0.TXT".to_string()));
    }

    #[test]
    fn long_base_is_trimmed_for_digits() {
        // 8-char base at level 1 must shrink to make room for the digit
        let mut c = entries(&["ABCDEFGH.TXT", "ABCDEFGH.TXT"]);
        assert!(mangle_children(&mut c, 12, 8).unwrap());
        assert_eq!(c[0].name, "ABCDEFG0.TXT");
        assert_eq!(c[1].name, "ABCDEFG1.TXT");
    }

    #[test]
    fn directories_have_no_extension_logic() {
        let mut c = vec![
            MangleEntry {
                name: "DIR.A".into(),
                is_dir: true,
            },
            MangleEntry {
                name: "DIR.A".into(),
                is_dir: true,
            },
        ];
        assert!(mangle_children(&mut c, 12, 8).unwrap());
        assert_eq!(c[0].name, "DIR.A0");
        assert_eq!(c[1].name, "DIR.A1");
    }

    #[test]
    fn group_overflow_widens_digits() {
        let mut c = entries(&vec!["X.TXT"; 12]);
        assert!(mangle_children(&mut c, 12, 8).unwrap());
        let mut names: Vec<String> = c.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 12);
        // widened to two digits
        assert!(names.iter().all(|n| n.len() <= 12));
        assert!(names.contains(&"X00.TXT".to_string()));
    }
}
