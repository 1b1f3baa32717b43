//! Joliet: a parallel UCS-2BE name tree with its own Supplementary Volume
//! Descriptor, directory hierarchy and path tables.
//!
//! Joliet carries directories and files only; symlinks and special files
//! have no representation and are omitted from this tree.

use bytemuck::Zeroable;

use crate::ecma119::{DirRecordHeader, PrimaryVolDesc};
use crate::error::Result;
use crate::filesrc::FileSrcId;
use crate::mangle::{mangle_children, MangleEntry};
use crate::msg;
use crate::tree::{HideFlags, Image, NodeId, NodeKind};
use crate::types::{
    datetime_7, div_up, round_up, U16LsbMsb, U32Be, U32Le, U32LsbMsb, BLOCK_SIZE,
};
use crate::write::{ImageWriter, TargetOpts, WriteTarget};

pub type JolietId = usize;

pub struct JDirInfo {
    pub children: Vec<JolietId>,
    pub block: u32,
    pub len: u32,
}

pub enum JolietKind {
    Dir(JDirInfo),
    File { src: FileSrcId },
}

pub struct JolietNode {
    /// UCS-2 name, `None` only for the root. All characters are BMP.
    pub name: Option<String>,
    pub node: NodeId,
    pub parent: JolietId,
    pub kind: JolietKind,
}

impl JolietNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, JolietKind::Dir(_))
    }
}

pub struct JolietTree {
    nodes: Vec<JolietNode>,
    root: JolietId,
}

impl JolietTree {
    pub fn root(&self) -> JolietId {
        self.root
    }

    pub fn node(&self, id: JolietId) -> &JolietNode {
        &self.nodes[id]
    }

    pub fn dir_info(&self, id: JolietId) -> &JDirInfo {
        match &self.nodes[id].kind {
            JolietKind::Dir(info) => info,
            _ => panic!("node {id} is not a directory"),
        }
    }

    pub fn dir_info_mut(&mut self, id: JolietId) -> &mut JDirInfo {
        match &mut self.nodes[id].kind {
            JolietKind::Dir(info) => info,
            _ => panic!("node {id} is not a directory"),
        }
    }

    pub fn children(&self, id: JolietId) -> &[JolietId] {
        match &self.nodes[id].kind {
            JolietKind::Dir(info) => &info.children,
            _ => &[],
        }
    }

    fn sort_children(&mut self, dir: JolietId) {
        let mut children = std::mem::take(&mut self.dir_info_mut(dir).children);
        children.sort_by(|&a, &b| ucs2_cmp(name_of(self, a), name_of(self, b)));
        self.dir_info_mut(dir).children = children;
    }
}

fn name_of(tree: &JolietTree, id: JolietId) -> &str {
    tree.nodes[id].name.as_deref().unwrap_or("")
}

/// Compare as the UCS-2BE byte sequences would compare.
fn ucs2_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.chars().map(|c| c as u32).cmp(b.chars().map(|c| c as u32))
}

fn ucs2_len(s: &str) -> usize {
    s.chars().count()
}

fn ucs2_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for c in s.chars() {
        out.extend_from_slice(&(c as u16).to_be_bytes());
    }
    out
}

fn valid_j_char(c: char) -> bool {
    let forbidden = ['*', '/', ':', ';', '?', '\\'];
    c >= ' ' && (c as u32) <= 0xFFFF && !forbidden.contains(&c)
}

/// Joliet identifier: forbidden characters replaced by '_', capped at 64
/// UCS-2 characters (103 with `joliet_longer_paths`).
fn joliet_name(opts: &TargetOpts, name: &str) -> String {
    let max = if opts.joliet_longer_paths { 103 } else { 64 };
    name.chars()
        .map(|c| if valid_j_char(c) { c } else { '_' })
        .take(max)
        .collect()
}

fn need_version_number(opts: &TargetOpts, is_dir: bool) -> bool {
    !is_dir && opts.omit_version_numbers & 3 == 0
}

struct Builder<'a> {
    image: &'a Image,
    opts: &'a TargetOpts,
    files: &'a mut crate::filesrc::FileSrcRegistry,
    cat_src: Option<FileSrcId>,
    nodes: Vec<JolietNode>,
}

impl<'a> Builder<'a> {
    fn create(&mut self, id: NodeId, pathlen: usize) -> Result<Option<JolietId>> {
        let node = self.image.node(id);
        if node.hidden.contains(HideFlags::ON_JOLIET) {
            return Ok(None);
        }
        let name = if id == self.image.root() {
            None
        } else {
            Some(joliet_name(self.opts, &node.name))
        };
        let name_len = name.as_deref().map(ucs2_len).unwrap_or(0);
        let max_path = pathlen + 1 + name_len;
        if max_path > 240 && !self.opts.joliet_longer_paths {
            msg::submit(
                self.image.id(),
                crate::error::codes::FILE_IMGPATH_WRONG,
                0,
                format!(
                    "File \"{}\" can't be added to Joliet tree, path is longer \
                     than 240 characters",
                    self.image.path_of(id)
                ),
            )?;
            return Ok(None);
        }

        let kind = match &self.image.node(id).kind {
            NodeKind::Dir { .. } => JolietKind::Dir(JDirInfo {
                children: Vec::new(),
                block: 0,
                len: 0,
            }),
            NodeKind::File {
                stream,
                sort_weight,
                from_old_session,
                old_sections,
            } => {
                // shared identity resolves to the entry the ECMA-119 tree
                // already registered
                let src = self.files.register(
                    stream.clone(),
                    *sort_weight,
                    *from_old_session,
                    old_sections,
                    self.opts.appendable,
                    self.opts.iso_level,
                );
                JolietKind::File { src }
            }
            NodeKind::BootCatalog => match self.cat_src {
                Some(src) => JolietKind::File { src },
                None => return Ok(None),
            },
            // no representation in Joliet
            NodeKind::Symlink { .. } | NodeKind::Special { .. } => return Ok(None),
        };

        let jid = self.nodes.len();
        self.nodes.push(JolietNode {
            name,
            node: id,
            parent: jid,
            kind,
        });

        if self.image.node(id).is_dir() {
            for child in self.image.node(id).children().to_vec() {
                if let Some(child_j) = self.create(child, max_path)? {
                    self.nodes[child_j].parent = jid;
                    match &mut self.nodes[jid].kind {
                        JolietKind::Dir(info) => info.children.push(child_j),
                        _ => unreachable!(),
                    }
                }
            }
        }
        Ok(Some(jid))
    }
}

fn mangle_tree(tree: &mut JolietTree, opts: &TargetOpts) -> Result<()> {
    let max = if opts.joliet_longer_paths { 103 } else { 64 };
    let mut stack = vec![tree.root()];
    while let Some(dir) = stack.pop() {
        let child_ids: Vec<JolietId> = tree.children(dir).to_vec();
        let mut entries: Vec<MangleEntry> = child_ids
            .iter()
            .map(|&c| MangleEntry {
                name: name_of(tree, c).to_string(),
                is_dir: tree.node(c).is_dir(),
            })
            .collect();
        if mangle_children(&mut entries, max, max)? {
            for (&c, entry) in child_ids.iter().zip(entries.into_iter()) {
                tree.nodes[c].name = Some(entry.name);
            }
            tree.sort_children(dir);
        }
        for c in child_ids {
            if tree.node(c).is_dir() {
                stack.push(c);
            }
        }
    }
    Ok(())
}

fn build_tree(t: &mut WriteTarget) -> Result<JolietTree> {
    #[cfg(feature = "el-torito")]
    let cat_src = t.eltorito.as_ref().map(|el| el.cat_src);
    #[cfg(not(feature = "el-torito"))]
    let cat_src = None;

    let WriteTarget {
        image,
        opts,
        filesrcs,
        ..
    } = t;
    let mut builder = Builder {
        image,
        opts,
        files: filesrcs,
        cat_src,
        nodes: Vec::new(),
    };
    let logical_root = builder.image.root();
    let root = builder
        .create(logical_root, 0)?
        .ok_or(crate::error::IsoError::AssertFailure)?;
    let mut tree = JolietTree {
        nodes: builder.nodes,
        root,
    };
    for id in 0..tree.nodes.len() {
        if tree.node(id).is_dir() {
            tree.sort_children(id);
        }
    }
    mangle_tree(&mut tree, &t.opts)?;
    Ok(tree)
}

fn dirent_len(opts: &TargetOpts, tree: &JolietTree, id: JolietId) -> usize {
    let chars = name_of(tree, id).chars().count().max(1);
    let mut fi = 2 * chars;
    if need_version_number(opts, tree.node(id).is_dir()) {
        fi += 4;
    }
    let mut len = 33 + fi;
    if len % 2 != 0 {
        len += 1;
    }
    len
}

fn calc_dir_size(opts: &TargetOpts, tree: &JolietTree, t: &WriteTarget, dir: JolietId) -> u32 {
    let mut len: usize = 34 + 34;
    for &child in tree.children(dir) {
        let nsections = match &tree.node(child).kind {
            JolietKind::File { src } => t.filesrcs.get(*src).sections.len(),
            _ => 1,
        };
        for _ in 0..nsections {
            let dl = dirent_len(opts, tree, child);
            let remaining = BLOCK_SIZE - (len % BLOCK_SIZE);
            if dl > remaining {
                len += remaining;
            }
            len += dl;
        }
    }
    round_up(len, BLOCK_SIZE) as u32
}

fn calc_dir_pos(t: &mut WriteTarget, tree: &mut JolietTree, dir: JolietId) {
    t.joliet_ndirs += 1;
    let len = calc_dir_size(&t.opts, tree, t, dir);
    {
        let info = tree.dir_info_mut(dir);
        info.block = t.curblock;
        info.len = len;
    }
    t.curblock += div_up(len as u64, BLOCK_SIZE as u64) as u32;
    let children: Vec<JolietId> = tree.children(dir).to_vec();
    for child in children {
        if tree.node(child).is_dir() {
            calc_dir_pos(t, tree, child);
        }
    }
}

fn path_table_list(tree: &JolietTree) -> Vec<JolietId> {
    let mut list = vec![tree.root()];
    let mut i = 0;
    while i < list.len() {
        for &child in tree.children(list[i]) {
            if tree.node(child).is_dir() {
                list.push(child);
            }
        }
        i += 1;
    }
    list
}

fn path_table_size(tree: &JolietTree) -> u32 {
    let mut size = 0u32;
    for id in path_table_list(tree) {
        let name_len = if id == tree.root() {
            1
        } else {
            2 * ucs2_len(name_of(tree, id))
        };
        size += (8 + name_len + (name_len % 2)) as u32;
    }
    size
}

fn render_path_table(tree: &JolietTree, little_endian: bool) -> Vec<u8> {
    let list = path_table_list(tree);
    let mut out = Vec::new();
    for (idx, &dir) in list.iter().enumerate() {
        let parent_index = if idx == 0 {
            1
        } else {
            list.iter()
                .position(|&d| d == tree.node(dir).parent)
                .expect("parent precedes child")
                + 1
        };
        let name: Vec<u8> = if idx == 0 {
            vec![0]
        } else {
            ucs2_bytes(name_of(tree, dir))
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
        out.extend_from_slice(&name);
        if name.len() % 2 != 0 {
            out.push(0);
        }
    }
    out.resize(round_up(out.len(), BLOCK_SIZE), 0);
    out
}

fn render_record(
    t: &WriteTarget,
    tree: &JolietTree,
    id: JolietId,
    file_id: Option<u8>,
    extent: usize,
) -> Vec<u8> {
    let node = tree.node(id);
    let mut fi: Vec<u8> = match file_id {
        Some(b) => vec![b],
        None => ucs2_bytes(name_of(tree, id)),
    };
    if file_id.is_none() && need_version_number(&t.opts, node.is_dir()) {
        fi.extend_from_slice(&[0, b';', 0, b'1']);
    }

    let (block, length, multi_extent) = match &node.kind {
        JolietKind::Dir(info) => (info.block, info.len, false),
        JolietKind::File { src } => {
            let section = &t.filesrcs.get(*src).sections[extent];
            let last = extent + 1 == t.filesrcs.get(*src).sections.len();
            (section.block, section.size, !last)
        }
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
        len_dr: len_dr as u8,
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
    let rec_time = if t.opts.dir_rec_mtime {
        if t.opts.replace_timestamps {
            t.opts.timestamp
        } else {
            t.image.node(node.node).attrs.mtime
        }
    } else {
        t.now
    };
    datetime_7(&mut header.recording_time, rec_time, t.opts.always_gmt);

    let mut out = Vec::with_capacity(len_dr);
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(&fi);
    if len_fi % 2 == 0 {
        out.push(0);
    }
    out
}

fn render_dir(t: &WriteTarget, tree: &JolietTree, dir: JolietId) -> Vec<u8> {
    let info = tree.dir_info(dir);
    let mut area = Vec::with_capacity(info.len as usize);

    let push_record = |area: &mut Vec<u8>, rec: Vec<u8>| {
        let remaining = BLOCK_SIZE - (area.len() % BLOCK_SIZE);
        if rec.len() > remaining {
            area.resize(area.len() + remaining, 0);
        }
        area.extend_from_slice(&rec);
    };

    push_record(&mut area, render_record(t, tree, dir, Some(0), 0));
    push_record(
        &mut area,
        render_record(t, tree, tree.node(dir).parent, Some(1), 0),
    );
    for &child in tree.children(dir) {
        let nsections = match &tree.node(child).kind {
            JolietKind::File { src } => t.filesrcs.get(*src).sections.len(),
            _ => 1,
        };
        for section in 0..nsections {
            push_record(&mut area, render_record(t, tree, child, None, section));
        }
    }
    area.resize(info.len as usize, 0);
    area
}

/// Pad a UCS-2BE identifier field with UCS-2 spaces.
fn copy_ucs2_pad(dst: &mut [u8], s: &str) {
    let bytes = ucs2_bytes(s);
    let n = bytes.len().min(dst.len() & !1);
    dst[..n].copy_from_slice(&bytes[..n]);
    let mut i = n;
    while i + 1 < dst.len() {
        dst[i] = 0;
        dst[i + 1] = b' ';
        i += 2;
    }
}

pub struct JolietWriter;

impl JolietWriter {
    pub fn create(t: &mut WriteTarget) -> Result<Self> {
        msg::debug(t.image.id(), "Creating low level Joliet tree...");
        t.joliet = Some(build_tree(t)?);
        t.curblock += 1;
        Ok(JolietWriter)
    }
}

impl ImageWriter for JolietWriter {
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        let mut tree = t.joliet.take().expect("Joliet tree built");
        t.joliet_ndirs = 0;
        let root = tree.root();
        calc_dir_pos(t, &mut tree, root);

        let size = path_table_size(&tree);
        t.joliet_l_path_table_pos = t.curblock;
        t.curblock += div_up(size as u64, BLOCK_SIZE as u64) as u32;
        t.joliet_m_path_table_pos = t.curblock;
        t.curblock += div_up(size as u64, BLOCK_SIZE as u64) as u32;
        t.joliet_path_table_size = size;

        t.joliet = Some(tree);
        Ok(())
    }

    fn write_vol_desc(&mut self, t: &mut WriteTarget) -> Result<()> {
        let tree = t.joliet.take().expect("Joliet tree built");
        msg::debug(t.image.id(), "Write Supplementary Volume Descriptor");

        // same layout as the PVD, reinterpreted per Joliet
        let mut vol = PrimaryVolDesc::zeroed();
        vol.vol_desc_type = 2;
        vol.std_identifier = *b"CD001";
        vol.vol_desc_version = 1;
        // UCS-2 level 3 escape sequence (unused3 is the SVD escape field)
        vol.unused3[..3].copy_from_slice(b"%/E");

        copy_ucs2_pad(&mut vol.system_id, &t.image.system_id);
        copy_ucs2_pad(&mut vol.volume_id, &t.image.volume_id);
        vol.vol_space_size = U32LsbMsb::new(t.vol_space_size);
        vol.vol_set_size = U16LsbMsb::new(1);
        vol.vol_seq_number = U16LsbMsb::new(1);
        vol.block_size = U16LsbMsb::new(BLOCK_SIZE as u16);
        vol.path_table_size = U32LsbMsb::new(t.joliet_path_table_size);
        vol.l_path_table_pos = U32Le::new(t.joliet_l_path_table_pos);
        vol.m_path_table_pos = U32Be::new(t.joliet_m_path_table_pos);

        let root_rec = render_record(t, &tree, tree.root(), Some(0), 0);
        vol.root_dir_record[..root_rec.len()].copy_from_slice(&root_rec);

        copy_ucs2_pad(&mut vol.vol_set_id, &t.image.volset_id);
        copy_ucs2_pad(&mut vol.publisher_id, &t.image.publisher_id);
        copy_ucs2_pad(&mut vol.data_prep_id, &t.image.data_preparer_id);
        copy_ucs2_pad(&mut vol.application_id, &t.image.application_id);
        copy_ucs2_pad(&mut vol.copyright_file_id, &t.image.copyright_file_id);
        copy_ucs2_pad(&mut vol.abstract_file_id, &t.image.abstract_file_id);
        copy_ucs2_pad(&mut vol.bibliographic_file_id, &t.image.biblio_file_id);

        let mut ts = [0u8; 17];
        crate::types::datetime_17(
            &mut ts,
            if t.opts.vol_creation_time > 0 {
                t.opts.vol_creation_time
            } else {
                t.now
            },
            t.opts.always_gmt,
        );
        vol.vol_creation_time = ts;
        crate::types::datetime_17(
            &mut ts,
            if t.opts.vol_modification_time > 0 {
                t.opts.vol_modification_time
            } else {
                t.now
            },
            t.opts.always_gmt,
        );
        vol.vol_modification_time = ts;
        vol.file_structure_version = 1;

        let res = t.write(bytemuck::bytes_of(&vol));
        t.joliet = Some(tree);
        res
    }

    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()> {
        let tree = t.joliet.take().expect("Joliet tree built");
        let res = (|| -> Result<()> {
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
                let area = render_dir(t, &tree, dir);
                t.write(&area)?;
            }
            msg::debug(t.image.id(), "Writing Joliet Path tables");
            let l = render_path_table(&tree, true);
            t.write(&l)?;
            let m = render_path_table(&tree, false);
            t.write(&m)?;
            Ok(())
        })();
        t.joliet = Some(tree);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_chars_become_underscores() {
        let opts = TargetOpts::default();
        assert_eq!(joliet_name(&opts, "a*b:c"), "a_b_c");
        assert_eq!(joliet_name(&opts, "ok name.txt"), "ok name.txt");
    }

    #[test]
    fn names_are_capped() {
        let opts = TargetOpts::default();
        let long: String = "x".repeat(100);
        assert_eq!(joliet_name(&opts, &long).chars().count(), 64);
        let opts = TargetOpts {
            joliet_longer_paths: true,
            ..TargetOpts::default()
        };
        assert_eq!(joliet_name(&opts, &long).chars().count(), 100);
    }

    #[test]
    fn ucs2_encoding_is_big_endian() {
        assert_eq!(ucs2_bytes("AB"), vec![0, b'A', 0, b'B']);
        assert_eq!(ucs2_bytes("\u{20AC}"), vec![0x20, 0xAC]);
    }
}
