//! The ECMA-119 writer: canonical directory hierarchy, path tables and
//! the Primary Volume Descriptor.
//!
//! Directory records are packed so that none crosses a 2048-byte block
//! boundary (ECMA-119, 6.8.1.1); each directory's record area is padded
//! to whole blocks, followed by its SUSP continuation area when Rock
//! Ridge is enabled.

pub mod name;
pub mod tree;

use bytemuck::Zeroable;

use crate::error::Result;
use crate::msg;
use crate::rrip::{self, Role, RripCtx};
use crate::types::{
    copy_str_pad, datetime_17, datetime_7, div_up, is_a_char, is_d_char, round_up, U16LsbMsb,
    U32Be, U32Le, U32LsbMsb, BLOCK_SIZE,
};
use crate::write::{ImageWriter, TargetOpts, WriteTarget};

use tree::{Ecma119Tree, EcmaId, EcmaKind, ElToritoSetup};

/// Fixed part of a directory record (ECMA-119, 9.1), followed by the file
/// identifier, an optional pad byte and the SUSP fields.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DirRecordHeader {
    pub len_dr: u8,
    pub len_xa: u8,
    pub block: U32LsbMsb,
    pub length: U32LsbMsb,
    pub recording_time: [u8; 7],
    pub flags: u8,
    pub file_unit_size: u8,
    pub interleave_gap_size: u8,
    pub vol_seq_number: U16LsbMsb,
    pub len_fi: u8,
}

/// Primary Volume Descriptor (ECMA-119, 8.4).
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PrimaryVolDesc {
    pub vol_desc_type: u8,
    pub std_identifier: [u8; 5],
    pub vol_desc_version: u8,
    pub unused1: u8,
    pub system_id: [u8; 32],
    pub volume_id: [u8; 32],
    pub unused2: [u8; 8],
    pub vol_space_size: U32LsbMsb,
    pub unused3: [u8; 32],
    pub vol_set_size: U16LsbMsb,
    pub vol_seq_number: U16LsbMsb,
    pub block_size: U16LsbMsb,
    pub path_table_size: U32LsbMsb,
    pub l_path_table_pos: U32Le,
    pub opt_l_path_table_pos: U32Le,
    pub m_path_table_pos: U32Be,
    pub opt_m_path_table_pos: U32Be,
    pub root_dir_record: [u8; 34],
    pub vol_set_id: [u8; 128],
    pub publisher_id: [u8; 128],
    pub data_prep_id: [u8; 128],
    pub application_id: [u8; 128],
    pub copyright_file_id: [u8; 37],
    pub abstract_file_id: [u8; 37],
    pub bibliographic_file_id: [u8; 37],
    pub vol_creation_time: [u8; 17],
    pub vol_modification_time: [u8; 17],
    pub vol_expiration_time: [u8; 17],
    pub vol_effective_time: [u8; 17],
    pub file_structure_version: u8,
    pub reserved1: u8,
    pub app_use: [u8; 512],
    pub reserved2: [u8; 653],
}

fn rrip_ctx<'a>(t: &'a WriteTarget, tree: &'a Ecma119Tree) -> RripCtx<'a> {
    RripCtx {
        opts: &t.opts,
        image: &t.image,
        tree,
        now: t.now,
    }
}

fn need_version_number(opts: &TargetOpts, kind: &EcmaKind) -> bool {
    if opts.omit_version_numbers & 1 != 0 {
        return false;
    }
    !matches!(kind, EcmaKind::Dir(_) | EcmaKind::Placeholder { .. })
}

/// Base length of a directory record for this node, SUSP not included.
fn dirent_len(opts: &TargetOpts, tree: &Ecma119Tree, id: EcmaId) -> usize {
    let node = tree.node(id);
    let fi = node.iso_name.as_deref().map(str::len).unwrap_or(1);
    let mut len = 33 + fi;
    if need_version_number(opts, &node.kind) {
        len += 2;
    }
    if len % 2 != 0 {
        len += 1;
    }
    len
}

/// Recording timestamp of a node (ECMA-119, 9.1.5).
fn recording_time(t: &WriteTarget, node: crate::tree::NodeId) -> i64 {
    if t.opts.dir_rec_mtime {
        if t.opts.replace_timestamps {
            t.opts.timestamp
        } else {
            t.image.node(node).attrs.mtime
        }
    } else {
        t.now
    }
}

/// Build one directory record. `file_id` overrides the identifier for the
/// "." (0x00) and ".." (0x01) records; `extent` selects the section of a
/// multi-extent file.
fn render_record(
    t: &WriteTarget,
    tree: &Ecma119Tree,
    id: EcmaId,
    file_id: Option<u8>,
    susp: &[u8],
    extent: usize,
) -> Vec<u8> {
    let node = tree.node(id);
    let name: Vec<u8> = match file_id {
        Some(b) => vec![b],
        None => node
            .iso_name
            .as_deref()
            .unwrap_or("")
            .as_bytes()
            .to_vec(),
    };
    let mut fi = name.clone();
    if file_id.is_none() && need_version_number(&t.opts, &node.kind) {
        fi.extend_from_slice(b";1");
    }

    let (block, length, multi_extent) = match &node.kind {
        EcmaKind::Dir(info) => (info.block, info.len, false),
        EcmaKind::File { src } => {
            let section = &t.filesrcs.get(*src).sections[extent];
            let last = extent + 1 == t.filesrcs.get(*src).sections.len();
            (section.block, section.size, !last)
        }
        _ => (0, 0, false),
    };

    let len_fi = fi.len();
    let len_dr = 33 + len_fi + if len_fi % 2 == 0 { 1 } else { 0 };

    let mut flags = 0u8;
    if node.is_dir() {
        flags |= 2;
    }
    if multi_extent {
        flags |= 0x80;
    }

    let mut header = DirRecordHeader {
        len_dr: (len_dr + susp.len()) as u8,
        len_xa: 0,
        block: U32LsbMsb::new(block),
        length: U32LsbMsb::new(length),
        recording_time: [0; 7],
        flags,
        file_unit_size: 0,
        interleave_gap_size: 0,
        vol_seq_number: U16LsbMsb::new(1),
        len_fi: len_fi as u8,
    };
    datetime_7(
        &mut header.recording_time,
        recording_time(t, node.node),
        t.opts.always_gmt,
    );

    let mut out = Vec::with_capacity(len_dr + susp.len());
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(&fi);
    if len_fi % 2 == 0 {
        out.push(0);
    }
    out.extend_from_slice(susp);
    out
}

/// The ".." record shows the parent's extent; relocated directories show
/// their relocation parent (the tree parent), with PL carrying the truth.
fn parent_of(tree: &Ecma119Tree, dir: EcmaId) -> EcmaId {
    tree.node(dir).parent
}

/// Total directory-record area length (6.8.1.1) and the continuation-area
/// length of one directory.
fn calc_dir_size(t: &WriteTarget, tree: &Ecma119Tree, dir: EcmaId) -> (u32, u32) {
    let ctx = rrip_ctx(t, tree);
    let mut len: usize = 34 + 34;
    let mut ce: usize = 0;
    if t.opts.rockridge {
        let (r, c) = rrip::calc_len(&ctx, dir, Role::TheDir, 255 - 34);
        len += r;
        ce += c;
        let (r, c) = rrip::calc_len(&ctx, dir, Role::ParentDir, 255 - 34);
        len += r;
        ce += c;
    }
    for &child in tree.children(dir) {
        let nsections = match &tree.node(child).kind {
            EcmaKind::File { src } => t.filesrcs.get(*src).sections.len(),
            _ => 1,
        };
        for _section in 0..nsections {
            let mut dl = dirent_len(&t.opts, tree, child);
            if t.opts.rockridge {
                let (r, c) = rrip::calc_len(&ctx, child, Role::Child, 255 - dl);
                dl += r;
                ce += c;
            }
            let remaining = BLOCK_SIZE - (len % BLOCK_SIZE);
            if dl > remaining {
                len += remaining;
            }
            len += dl;
        }
    }
    (round_up(len, BLOCK_SIZE) as u32, ce as u32)
}

fn calc_dir_pos(t: &mut WriteTarget, tree: &mut Ecma119Tree, dir: EcmaId) {
    t.ndirs += 1;
    let (len, ce) = calc_dir_size(t, tree, dir);
    {
        let info = tree.dir_info_mut(dir);
        info.block = t.curblock;
        info.len = len;
        info.ce_len = ce;
    }
    t.curblock += div_up(len as u64, BLOCK_SIZE as u64) as u32;
    if t.opts.rockridge {
        t.curblock += div_up(ce as u64, BLOCK_SIZE as u64) as u32;
    }
    let children: Vec<EcmaId> = tree.children(dir).to_vec();
    for child in children {
        if tree.node(child).is_dir() {
            calc_dir_pos(t, tree, child);
        }
    }
}

/// Directories in path-table order: breadth-first, root first, siblings
/// in sorted order (ECMA-119, 6.9.1).
fn path_table_list(tree: &Ecma119Tree) -> Vec<EcmaId> {
    let mut list = vec![tree.root()];
    let mut i = 0;
    while i < list.len() {
        let dir = list[i];
        for &child in tree.children(dir) {
            if tree.node(child).is_dir() {
                list.push(child);
            }
        }
        i += 1;
    }
    list
}

fn render_path_table(tree: &Ecma119Tree, little_endian: bool) -> Vec<u8> {
    let list = path_table_list(tree);
    let mut out = Vec::new();
    for (idx, &dir) in list.iter().enumerate() {
        let parent_index = if idx == 0 {
            1
        } else {
            list.iter()
                .position(|&d| d == tree.node(dir).parent)
                .expect("parent precedes child in path table order")
                + 1
        };
        let name: &[u8] = match tree.node(dir).iso_name.as_deref() {
            Some(n) => n.as_bytes(),
            None => &[0],
        };
        out.push(name.len() as u8);
        out.push(0);
        let block = tree.dir_info(dir).block;
        if little_endian {
            out.extend_from_slice(&block.to_le_bytes());
            out.extend_from_slice(&(parent_index as u16).to_le_bytes());
        } else {
            out.extend_from_slice(&block.to_be_bytes());
            out.extend_from_slice(&(parent_index as u16).to_be_bytes());
        }
        out.extend_from_slice(name);
        if name.len() % 2 != 0 {
            out.push(0);
        }
    }
    out.resize(round_up(out.len(), BLOCK_SIZE), 0);
    out
}

/// Render a directory's record area and continuation area, both padded to
/// whole blocks.
fn render_dir(t: &WriteTarget, tree: &Ecma119Tree, dir: EcmaId) -> (Vec<u8>, Vec<u8>) {
    let ctx = rrip_ctx(t, tree);
    let info = tree.dir_info(dir);
    let ce_start_block = info.block + div_up(info.len as u64, BLOCK_SIZE as u64) as u32;

    let mut area = Vec::with_capacity(info.len as usize);
    let mut ce_area: Vec<u8> = Vec::new();

    let push_record = |area: &mut Vec<u8>, rec: Vec<u8>| {
        let remaining = BLOCK_SIZE - (area.len() % BLOCK_SIZE);
        if rec.len() > remaining {
            area.resize(area.len() + remaining, 0);
        }
        area.extend_from_slice(&rec);
    };

    // "." and ".."
    for (role, file_id) in [(Role::TheDir, 0u8), (Role::ParentDir, 1u8)] {
        let susp = if t.opts.rockridge {
            rrip::susp_fields(
                &ctx,
                dir,
                role,
                255 - 34,
                Some((ce_start_block, ce_area.len() as u32)),
            )
        } else {
            Default::default()
        };
        let node = if role == Role::ParentDir {
            parent_of(tree, dir)
        } else {
            dir
        };
        let rec = render_record(t, tree, node, Some(file_id), &susp.record, 0);
        push_record(&mut area, rec);
        ce_area.extend_from_slice(&susp.ce);
    }

    for &child in tree.children(dir) {
        let nsections = match &tree.node(child).kind {
            EcmaKind::File { src } => t.filesrcs.get(*src).sections.len(),
            _ => 1,
        };
        for section in 0..nsections {
            let dl = dirent_len(&t.opts, tree, child);
            let susp = if t.opts.rockridge {
                rrip::susp_fields(
                    &ctx,
                    child,
                    Role::Child,
                    255 - dl,
                    Some((ce_start_block, ce_area.len() as u32)),
                )
            } else {
                Default::default()
            };
            let rec = render_record(t, tree, child, None, &susp.record, section);
            push_record(&mut area, rec);
            ce_area.extend_from_slice(&susp.ce);
        }
    }

    area.resize(info.len as usize, 0);
    if !ce_area.is_empty() {
        ce_area.resize(round_up(ce_area.len(), BLOCK_SIZE), 0);
    }
    (area, ce_area)
}

/// Map a string into d-characters for a PVD identifier field.
fn str_to_d(s: &str, relaxed: bool) -> String {
    s.chars()
        .map(|c| {
            if relaxed && c.is_ascii() && c != '\0' {
                c
            } else {
                let up = c.to_ascii_uppercase();
                if up.is_ascii() && is_d_char(up as u8) {
                    up
                } else {
                    '_'
                }
            }
        })
        .collect()
}

fn str_to_a(s: &str) -> String {
    s.chars()
        .map(|c| {
            let up = c.to_ascii_uppercase();
            if up.is_ascii() && is_a_char(up as u8) {
                up
            } else {
                '_'
            }
        })
        .collect()
}

/// Fill a 17-byte PVD timestamp, honoring the UUID override.
fn pvd_time(buf: &mut [u8; 17], t: &WriteTarget, configured: i64, uuid_field: bool) {
    if uuid_field {
        if let Some(uuid) = &t.opts.vol_uuid {
            for (i, b) in buf.iter_mut().take(16).enumerate() {
                *b = if uuid[i].is_ascii_digit() { uuid[i] } else { b'1' };
            }
            buf[16] = 0;
            return;
        }
    }
    let secs = if configured > 0 { configured } else { t.now };
    datetime_17(buf, secs, t.opts.always_gmt);
}

pub struct Ecma119Writer;

impl Ecma119Writer {
    /// Build the low-level tree and reserve the PVD block.
    pub fn create(t: &mut WriteTarget, eltorito: Option<&mut ElToritoSetup>) -> Result<Self> {
        msg::debug(t.image.id(), "Creating low level ECMA-119 tree...");
        let WriteTarget {
            image,
            filesrcs,
            opts,
            ..
        } = t;
        let built = tree::create(image, filesrcs, opts, eltorito)?;
        t.ecma = Some(built);
        t.curblock += 1;
        Ok(Ecma119Writer)
    }
}

impl ImageWriter for Ecma119Writer {
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        let mut tree = t.ecma.take().expect("ECMA-119 tree built");

        msg::debug(t.image.id(), "Computing position of dir structure");
        t.ndirs = 0;
        let root = tree.root();
        calc_dir_pos(t, &mut tree, root);

        msg::debug(t.image.id(), "Computing length of path tables");
        let mut path_table_size = 0u32;
        for id in path_table_list(&tree) {
            let name_len = tree.node(id).iso_name.as_deref().map(str::len).unwrap_or(1);
            path_table_size += (8 + name_len + (name_len % 2)) as u32;
        }
        t.l_path_table_pos = t.curblock;
        t.curblock += div_up(path_table_size as u64, BLOCK_SIZE as u64) as u32;
        t.m_path_table_pos = t.curblock;
        t.curblock += div_up(path_table_size as u64, BLOCK_SIZE as u64) as u32;
        t.path_table_size = path_table_size;

        #[cfg(feature = "checksums")]
        if t.opts.md5_session_checksum {
            t.checksum.tree_tag_pos = t.curblock;
            t.curblock += 1;
        }

        t.ecma = Some(tree);
        Ok(())
    }

    fn write_vol_desc(&mut self, t: &mut WriteTarget) -> Result<()> {
        let tree = t.ecma.take().expect("ECMA-119 tree built");
        msg::debug(t.image.id(), "Write Primary Volume Descriptor");

        let mut vol = PrimaryVolDesc::zeroed();
        vol.vol_desc_type = 1;
        vol.std_identifier = *b"CD001";
        vol.vol_desc_version = 1;

        let relaxed = t.opts.relaxed_vol_atts;
        copy_str_pad(&mut vol.system_id, &str_to_a(&t.image.system_id));
        copy_str_pad(&mut vol.volume_id, &str_to_d(&t.image.volume_id, relaxed));
        vol.vol_space_size = U32LsbMsb::new(t.vol_space_size);
        vol.vol_set_size = U16LsbMsb::new(1);
        vol.vol_seq_number = U16LsbMsb::new(1);
        vol.block_size = U16LsbMsb::new(BLOCK_SIZE as u16);
        vol.path_table_size = U32LsbMsb::new(t.path_table_size);
        vol.l_path_table_pos = U32Le::new(t.l_path_table_pos);
        vol.m_path_table_pos = U32Be::new(t.m_path_table_pos);

        let root_rec = render_record(t, &tree, tree.root(), Some(0), &[], 0);
        vol.root_dir_record[..root_rec.len()].copy_from_slice(&root_rec);

        copy_str_pad(&mut vol.vol_set_id, &str_to_d(&t.image.volset_id, relaxed));
        copy_str_pad(&mut vol.publisher_id, &str_to_a(&t.image.publisher_id));
        copy_str_pad(&mut vol.data_prep_id, &str_to_a(&t.image.data_preparer_id));
        copy_str_pad(&mut vol.application_id, &str_to_a(&t.image.application_id));
        copy_str_pad(
            &mut vol.copyright_file_id,
            &str_to_d(&t.image.copyright_file_id, false),
        );
        copy_str_pad(
            &mut vol.abstract_file_id,
            &str_to_d(&t.image.abstract_file_id, false),
        );
        copy_str_pad(
            &mut vol.bibliographic_file_id,
            &str_to_d(&t.image.biblio_file_id, false),
        );

        pvd_time(&mut vol.vol_creation_time, t, t.opts.vol_creation_time, true);
        pvd_time(
            &mut vol.vol_modification_time,
            t,
            t.opts.vol_modification_time,
            true,
        );
        if t.opts.vol_expiration_time > 0 {
            pvd_time(
                &mut vol.vol_expiration_time,
                t,
                t.opts.vol_expiration_time,
                false,
            );
        }
        if t.opts.vol_effective_time > 0 {
            pvd_time(
                &mut vol.vol_effective_time,
                t,
                t.opts.vol_effective_time,
                false,
            );
        }
        vol.file_structure_version = 1;

        let res = t.write(bytemuck::bytes_of(&vol));
        t.ecma = Some(tree);
        res
    }

    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()> {
        let tree = t.ecma.take().expect("ECMA-119 tree built");
        let res = (|| -> Result<()> {
            // directory hierarchy, depth-first in block order
            let mut stack = vec![tree.root()];
            let mut order = Vec::new();
            while let Some(dir) = stack.pop() {
                order.push(dir);
                for &c in tree.children(dir).iter().rev() {
                    if tree.node(c).is_dir() {
                        stack.push(c);
                    }
                }
            }
            for dir in order {
                let (area, ce_area) = render_dir(t, &tree, dir);
                t.write(&area)?;
                if !ce_area.is_empty() {
                    t.write(&ce_area)?;
                }
            }

            msg::debug(t.image.id(), "Writing ISO Path tables");
            let l = render_path_table(&tree, true);
            t.write(&l)?;
            let m = render_path_table(&tree, false);
            t.write(&m)?;

            #[cfg(feature = "checksums")]
            if t.opts.md5_session_checksum {
                crate::checksum::write_tag(t, crate::checksum::TagType::Tree)?;
            }
            Ok(())
        })();
        t.ecma = Some(tree);
        res
    }
}
