//! SUSP and Rock Ridge fields for directory records.
//!
//! Field byte forms follow SUSP 1.12 and IEEE P1282 (RRIP) 1.12, with the
//! 1.10 variants selectable: signature "RRIP_1991A" instead of
//! "IEEE_1282" and a PX field without the file serial number.
//!
//! The same routine is used for size calculation (pass 1) and emission
//! (pass 3); the only difference is that pass 1 does not know the
//! continuation-area location yet and fills the CE payload with zeros of
//! identical length, so both passes agree on every record length.

use crate::ecma119::tree::{Ecma119Tree, EcmaId, EcmaKind};
use crate::tree::{Image, NodeKind};
use crate::types::{datetime_7, U32LsbMsb};
use crate::write::TargetOpts;

/// Which directory record the fields are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The "." record of a directory.
    TheDir,
    /// The ".." record of a directory.
    ParentDir,
    /// A real child record.
    Child,
}

/// Fields split between the directory record and the continuation area.
#[derive(Default)]
pub struct SuspFields {
    /// Bytes appended to the directory record (CE field included).
    pub record: Vec<u8>,
    /// Bytes of this record in the directory's continuation area.
    pub ce: Vec<u8>,
}

pub struct RripCtx<'a> {
    pub opts: &'a TargetOpts,
    pub image: &'a Image,
    pub tree: &'a Ecma119Tree,
    pub now: i64,
}

/// Longest content of a single NM / SL / AL field before it continues in
/// a follow-up field.
const FIELD_CONTENT_MAX: usize = 250;

const CE_LEN: usize = 28;

fn bb32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(bytemuck::bytes_of(&U32LsbMsb::new(v)));
}

fn header(out: &mut Vec<u8>, sig: &[u8; 2], len: u8, version: u8) {
    out.extend_from_slice(sig);
    out.push(len);
    out.push(version);
}

fn sp_field() -> Vec<u8> {
    let mut f = Vec::with_capacity(7);
    header(&mut f, b"SP", 7, 1);
    f.extend_from_slice(&[0xBE, 0xEF, 0]);
    f
}

fn re_field() -> Vec<u8> {
    let mut f = Vec::with_capacity(4);
    header(&mut f, b"RE", 4, 1);
    f
}

fn cl_field(child_block: u32) -> Vec<u8> {
    let mut f = Vec::with_capacity(12);
    header(&mut f, b"CL", 12, 1);
    bb32(&mut f, child_block);
    f
}

fn pl_field(parent_block: u32) -> Vec<u8> {
    let mut f = Vec::with_capacity(12);
    header(&mut f, b"PL", 12, 1);
    bb32(&mut f, parent_block);
    f
}

fn pn_field(dev: u64) -> Vec<u8> {
    let mut f = Vec::with_capacity(20);
    header(&mut f, b"PN", 20, 1);
    bb32(&mut f, (dev >> 32) as u32);
    bb32(&mut f, dev as u32);
    f
}

fn px_field(ctx: &RripCtx, id: EcmaId) -> Vec<u8> {
    let tnode = ctx.tree.node(id);
    let node = ctx.image.node(tnode.node);
    let opts = ctx.opts;

    let is_dir = matches!(
        tnode.kind,
        EcmaKind::Dir(_) | EcmaKind::Placeholder { .. }
    );
    let mode = if is_dir {
        if opts.replace_dir_mode {
            (node.attrs.mode & 0o170000) | (opts.dir_mode & 0o7777)
        } else {
            node.attrs.mode
        }
    } else if opts.replace_file_mode {
        (node.attrs.mode & 0o170000) | (opts.file_mode & 0o7777)
    } else {
        node.attrs.mode
    };
    let uid = if opts.replace_uid { opts.uid } else { node.attrs.uid };
    let gid = if opts.replace_gid { opts.gid } else { node.attrs.gid };

    let with_ino = !opts.rrip_version_1_10 || opts.rrip_1_10_px_ino;
    let len = if with_ino { 44 } else { 36 };
    let mut f = Vec::with_capacity(len as usize);
    header(&mut f, b"PX", len, 1);
    bb32(&mut f, mode);
    bb32(&mut f, tnode.nlink);
    bb32(&mut f, uid);
    bb32(&mut f, gid);
    if with_ino {
        bb32(&mut f, tnode.ino as u32);
    }
    f
}

fn tf_field(ctx: &RripCtx, id: EcmaId) -> Vec<u8> {
    let node = ctx.image.node(ctx.tree.node(id).node);
    let opts = ctx.opts;
    let (mtime, atime, ctime) = if opts.replace_timestamps {
        (opts.timestamp, opts.timestamp, opts.timestamp)
    } else {
        (node.attrs.mtime, node.attrs.atime, node.attrs.ctime)
    };
    // flags: MODIFY | ACCESS | ATTRIBUTES, short form
    let mut f = Vec::with_capacity(5 + 3 * 7);
    header(&mut f, b"TF", 5 + 3 * 7, 1);
    f.push(0x0E);
    let mut buf = [0u8; 7];
    for t in [mtime, atime, ctime] {
        datetime_7(&mut buf, t, opts.always_gmt);
        f.extend_from_slice(&buf);
    }
    f
}

/// NM chain: the original name, split over several fields when long.
fn nm_fields(name: &str) -> Vec<Vec<u8>> {
    let bytes = name.as_bytes();
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let chunk = (bytes.len() - pos).min(FIELD_CONTENT_MAX);
        let cont = pos + chunk < bytes.len();
        let mut f = Vec::with_capacity(5 + chunk);
        header(&mut f, b"NM", (5 + chunk) as u8, 1);
        f.push(if cont { 1 } else { 0 });
        f.extend_from_slice(&bytes[pos..pos + chunk]);
        out.push(f);
        pos += chunk;
        if !cont {
            break;
        }
    }
    out
}

/// SL chain: the symlink destination as component records.
fn sl_fields(dest: &str) -> Vec<Vec<u8>> {
    // build the component records first
    let mut comps: Vec<Vec<u8>> = Vec::new();
    let mut path = dest;
    if let Some(rest) = dest.strip_prefix('/') {
        comps.push(vec![0x8, 0]);
        path = rest;
    }
    for comp in path.split('/') {
        match comp {
            "" => {}
            "." => comps.push(vec![0x2, 0]),
            ".." => comps.push(vec![0x4, 0]),
            name => {
                let bytes = name.as_bytes();
                // split an over-long component with the continue flag
                let mut pos = 0;
                loop {
                    let chunk = (bytes.len() - pos).min(248);
                    let cont = pos + chunk < bytes.len();
                    let mut c = Vec::with_capacity(2 + chunk);
                    c.push(if cont { 0x1 } else { 0 });
                    c.push(chunk as u8);
                    c.extend_from_slice(&bytes[pos..pos + chunk]);
                    comps.push(c);
                    pos += chunk;
                    if !cont {
                        break;
                    }
                }
            }
        }
    }

    // then distribute them over SL fields
    let mut out = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for comp in comps {
        if 5 + current.len() + comp.len() > 5 + FIELD_CONTENT_MAX && !current.is_empty() {
            let mut f = Vec::with_capacity(5 + current.len());
            header(&mut f, b"SL", (5 + current.len()) as u8, 1);
            f.push(1); // continue
            f.extend_from_slice(&current);
            out.push(f);
            current = Vec::new();
        }
        current.extend_from_slice(&comp);
    }
    let mut f = Vec::with_capacity(5 + current.len());
    header(&mut f, b"SL", (5 + current.len()) as u8, 1);
    f.push(0);
    f.extend_from_slice(&current);
    out.push(f);
    out
}

/// AL chain (AAIP): extended attributes as name/value component pairs.
fn al_fields(xattrs: &[crate::fsource::XAttr]) -> Vec<Vec<u8>> {
    let mut comps: Vec<Vec<u8>> = Vec::new();
    for attr in xattrs {
        for data in [attr.name.as_bytes(), attr.value.as_slice()] {
            let mut pos = 0;
            loop {
                let chunk = (data.len() - pos).min(248);
                let cont = pos + chunk < data.len();
                let mut c = Vec::with_capacity(2 + chunk);
                c.push(if cont { 0x1 } else { 0 });
                c.push(chunk as u8);
                c.extend_from_slice(&data[pos..pos + chunk]);
                comps.push(c);
                pos += chunk;
                if !cont {
                    break;
                }
            }
        }
    }
    if comps.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for comp in comps {
        if 5 + current.len() + comp.len() > 5 + FIELD_CONTENT_MAX && !current.is_empty() {
            let mut f = Vec::with_capacity(5 + current.len());
            header(&mut f, b"AL", (5 + current.len()) as u8, 1);
            f.push(1);
            f.extend_from_slice(&current);
            out.push(f);
            current = Vec::new();
        }
        current.extend_from_slice(&comp);
    }
    let mut f = Vec::with_capacity(5 + current.len());
    header(&mut f, b"AL", (5 + current.len()) as u8, 1);
    f.push(0);
    f.extend_from_slice(&current);
    out.push(f);
    out
}

fn er_field(id: &str, desc: &str, src: &str) -> Vec<u8> {
    let len = 8 + id.len() + desc.len() + src.len();
    let mut f = Vec::with_capacity(len);
    header(&mut f, b"ER", len as u8, 1);
    f.push(id.len() as u8);
    f.push(desc.len() as u8);
    f.push(src.len() as u8);
    f.push(1); // extension version
    f.extend_from_slice(id.as_bytes());
    f.extend_from_slice(desc.as_bytes());
    f.extend_from_slice(src.as_bytes());
    f
}

fn rrip_er(opts: &TargetOpts) -> Vec<u8> {
    if opts.rrip_version_1_10 {
        er_field(
            "RRIP_1991A",
            "THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS",
            "PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.",
        )
    } else {
        er_field(
            "IEEE_1282",
            "THE IEEE 1282 PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS.",
            "PLEASE CONTACT THE IEEE STANDARDS DEPARTMENT, PISCATAWAY, NJ, USA FOR THE 1282 SPECIFICATION.",
        )
    }
}

fn aaip_er() -> Vec<u8> {
    er_field(
        "AAIP_0200",
        "AL PROVIDES VIA AAIP 2.0 SUPPORT FOR ARBITRARY FILE ATTRIBUTES IN ISO 9660 IMAGES",
        "PLEASE CONTACT THE LIBBURNIA PROJECT VIA LIBBURNIA-PROJECT.ORG",
    )
}

/// Compute the SUSP fields of one directory record.
///
/// `space` is the free room inside the record (255 minus the base record
/// length). `ce_loc` is `(first block, byte offset)` of the directory's
/// continuation area, unknown during size calculation.
pub fn susp_fields(
    ctx: &RripCtx,
    id: EcmaId,
    role: Role,
    space: usize,
    ce_loc: Option<(u32, u32)>,
) -> SuspFields {
    let tnode = ctx.tree.node(id);
    let mut fields: Vec<Vec<u8>> = Vec::new();

    match role {
        Role::TheDir => {
            if id == ctx.tree.root() {
                fields.push(sp_field());
            }
            fields.push(px_field(ctx, id));
            fields.push(tf_field(ctx, id));
            if id == ctx.tree.root() {
                fields.push(rrip_er(ctx.opts));
                if ctx.opts.aaip && !ctx.opts.aaip_susp_1_10 {
                    fields.push(aaip_er());
                }
            }
        }
        Role::ParentDir => {
            // the ".." record describes the parent directory
            let parent = tnode.parent;
            fields.push(px_field(ctx, parent));
            fields.push(tf_field(ctx, parent));
            if let Some(real_parent) = ctx.tree.dir_info(id).real_parent {
                fields.push(pl_field(ctx.tree.dir_info(real_parent).block));
            }
        }
        Role::Child => {
            fields.push(px_field(ctx, id));
            fields.push(tf_field(ctx, id));
            let node = ctx.image.node(tnode.node);
            fields.extend(nm_fields(&node.name));
            match &tnode.kind {
                EcmaKind::Symlink => {
                    if let NodeKind::Symlink { dest } = &node.kind {
                        fields.extend(sl_fields(dest));
                    }
                }
                EcmaKind::Special => {
                    if let NodeKind::Special { dev } = &node.kind {
                        fields.push(pn_field(*dev));
                    }
                }
                EcmaKind::Placeholder { real } => {
                    fields.push(cl_field(ctx.tree.dir_info(*real).block));
                }
                EcmaKind::Dir(info) => {
                    if info.real_parent.is_some() {
                        fields.push(re_field());
                    }
                }
                EcmaKind::File { .. } => {}
            }
            if ctx.opts.aaip {
                fields.extend(al_fields(&node.xattrs));
            }
        }
    }

    pack(fields, space, ce_loc)
}

/// Distribute fields between the record and the continuation area.
///
/// The longest prefix that fits stays in the record; once anything
/// overflows, 28 bytes are reserved for the CE field and the rest moves
/// to the continuation area.
fn pack(fields: Vec<Vec<u8>>, space: usize, ce_loc: Option<(u32, u32)>) -> SuspFields {
    let total: usize = fields.iter().map(Vec::len).sum();
    let mut out = SuspFields::default();
    if total <= space {
        for f in fields {
            out.record.extend_from_slice(&f);
        }
        return out;
    }

    let budget = space.saturating_sub(CE_LEN);
    let mut in_record = true;
    for f in fields {
        if in_record && out.record.len() + f.len() > budget {
            in_record = false;
        }
        if in_record {
            out.record.extend_from_slice(&f);
        } else {
            out.ce.extend_from_slice(&f);
        }
    }

    let (block, offset) = match ce_loc {
        Some((start_block, byte_offset)) => (
            start_block + byte_offset / crate::types::BLOCK_SIZE as u32,
            byte_offset % crate::types::BLOCK_SIZE as u32,
        ),
        None => (0, 0),
    };
    let mut ce = Vec::with_capacity(CE_LEN);
    header(&mut ce, b"CE", CE_LEN as u8, 1);
    bb32(&mut ce, block);
    bb32(&mut ce, offset);
    bb32(&mut ce, out.ce.len() as u32);
    out.record.extend_from_slice(&ce);
    out
}

/// Record and continuation-area byte counts for one record.
pub fn calc_len(ctx: &RripCtx, id: EcmaId, role: Role, space: usize) -> (usize, usize) {
    let f = susp_fields(ctx, id, role, space, None);
    (f.record.len(), f.ce.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sp_is_seven_bytes() {
        let f = sp_field();
        assert_eq!(f, vec![b'S', b'P', 7, 1, 0xBE, 0xEF, 0]);
    }

    #[test]
    fn nm_splits_long_names() {
        let name = "x".repeat(300);
        let fields = nm_fields(&name);
        assert_eq!(fields.len(), 2);
        // first carries the continue flag
        assert_eq!(fields[0][4], 1);
        assert_eq!(fields[1][4], 0);
        let total: usize = fields.iter().map(|f| f.len() - 5).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn sl_components() {
        let fields = sl_fields("target");
        assert_eq!(fields.len(), 1);
        let f = &fields[0];
        assert_eq!(&f[..2], b"SL");
        assert_eq!(f[4], 0); // no continuation
        // single component: flags 0, len 6, "target"
        assert_eq!(f[5], 0);
        assert_eq!(f[6], 6);
        assert_eq!(&f[7..13], b"target");
    }

    #[test]
    fn sl_absolute_and_dots() {
        let fields = sl_fields("/a/../b");
        let f = &fields[0];
        // root, "a", parent, "b"
        assert_eq!(f[5], 0x8);
        assert_eq!(f[7], 0x0);
        assert_eq!(f[8], 1);
        assert_eq!(f[9], b'a');
        assert_eq!(f[10], 0x4);
        assert_eq!(f[12], 0x0);
        assert_eq!(f[13], 1);
        assert_eq!(f[14], b'b');
    }

    #[test]
    fn pack_spills_to_ce() {
        let fields = vec![vec![1u8; 100], vec![2u8; 100], vec![3u8; 100]];
        let out = pack(fields, 250, Some((10, 0)));
        // first two fit under the CE reservation, third spills
        assert_eq!(out.record.len(), 200 + 28);
        assert_eq!(out.ce.len(), 100);
        let ce = &out.record[200..];
        assert_eq!(&ce[..2], b"CE");
        assert_eq!(ce[2], 28);
    }

    #[test]
    fn pack_len_is_stable_without_location() {
        let fields = vec![vec![1u8; 100], vec![2u8; 100], vec![3u8; 100]];
        let a = pack(fields.clone(), 250, None);
        let b = pack(fields, 250, Some((99, 4000)));
        assert_eq!(a.record.len(), b.record.len());
        assert_eq!(a.ce.len(), b.ce.len());
    }
}
