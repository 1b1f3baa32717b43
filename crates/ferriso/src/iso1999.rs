//! ISO 9660:1999: an enhanced name tree (up to 207 bytes per identifier,
//! no depth limit) with its Enhanced Volume Descriptor.
//!
//! Like Joliet this tree carries directories and files only.

use bytemuck::Zeroable;

use crate::ecma119::{DirRecordHeader, PrimaryVolDesc};
use crate::error::Result;
use crate::filesrc::FileSrcId;
use crate::mangle::{mangle_children, MangleEntry};
use crate::msg;
use crate::tree::{HideFlags, Image, NodeId, NodeKind};
use crate::types::{
    copy_str_pad, datetime_17, datetime_7, div_up, round_up, U16LsbMsb, U32Be, U32Le, U32LsbMsb,
    BLOCK_SIZE,
};
use crate::write::{ImageWriter, TargetOpts, WriteTarget};

pub type Iso1999Id = usize;

/// Longest identifier in bytes (ISO 9660:1999, 7.5.1).
const MAX_NAME_LEN: usize = 207;

pub struct DirInfo1999 {
    pub children: Vec<Iso1999Id>,
    pub block: u32,
    pub len: u32,
}

pub enum Iso1999Kind {
    Dir(DirInfo1999),
    File { src: FileSrcId },
}

pub struct Iso1999Node {
    pub name: Option<String>,
    pub node: NodeId,
    pub parent: Iso1999Id,
    pub kind: Iso1999Kind,
}

impl Iso1999Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, Iso1999Kind::Dir(_))
    }
}

pub struct Iso1999Tree {
    nodes: Vec<Iso1999Node>,
    root: Iso1999Id,
}

impl Iso1999Tree {
    pub fn root(&self) -> Iso1999Id {
        self.root
    }

    pub fn node(&self, id: Iso1999Id) -> &Iso1999Node {
        &self.nodes[id]
    }

    pub fn dir_info(&self, id: Iso1999Id) -> &DirInfo1999 {
        match &self.nodes[id].kind {
            Iso1999Kind::Dir(info) => info,
            _ => panic!("node {id} is not a directory"),
        }
    }

    pub fn dir_info_mut(&mut self, id: Iso1999Id) -> &mut DirInfo1999 {
        match &mut self.nodes[id].kind {
            Iso1999Kind::Dir(info) => info,
            _ => panic!("node {id} is not a directory"),
        }
    }

    pub fn children(&self, id: Iso1999Id) -> &[Iso1999Id] {
        match &self.nodes[id].kind {
            Iso1999Kind::Dir(info) => &info.children,
            _ => &[],
        }
    }

    fn sort_children(&mut self, dir: Iso1999Id) {
        let mut children = std::mem::take(&mut self.dir_info_mut(dir).children);
        children.sort_by(|&a, &b| {
            self.nodes[a]
                .name
                .as_deref()
                .unwrap_or("")
                .cmp(self.nodes[b].name.as_deref().unwrap_or(""))
        });
        self.dir_info_mut(dir).children = children;
    }
}

fn name_of(tree: &Iso1999Tree, id: Iso1999Id) -> &str {
    tree.nodes[id].name.as_deref().unwrap_or("")
}

/// 9660:1999 identifier: any ASCII except NUL and '/', capped at 207
/// bytes. Non-ASCII characters degrade to '_'.
fn iso1999_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii() && c != '\0' && c != '/' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect()
}

struct Builder<'a> {
    image: &'a Image,
    opts: &'a TargetOpts,
    files: &'a mut crate::filesrc::FileSrcRegistry,
    cat_src: Option<FileSrcId>,
    nodes: Vec<Iso1999Node>,
}

impl<'a> Builder<'a> {
    fn create(&mut self, id: NodeId) -> Result<Option<Iso1999Id>> {
        let node = self.image.node(id);
        if node.hidden.contains(HideFlags::ON_1999) {
            return Ok(None);
        }
        let name = if id == self.image.root() {
            None
        } else {
            Some(iso1999_name(&node.name))
        };

        let kind = match &self.image.node(id).kind {
            NodeKind::Dir { .. } => Iso1999Kind::Dir(DirInfo1999 {
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
                let src = self.files.register(
                    stream.clone(),
                    *sort_weight,
                    *from_old_session,
                    old_sections,
                    self.opts.appendable,
                    self.opts.iso_level,
                );
                Iso1999Kind::File { src }
            }
            NodeKind::BootCatalog => match self.cat_src {
                Some(src) => Iso1999Kind::File { src },
                None => return Ok(None),
            },
            NodeKind::Symlink { .. } | NodeKind::Special { .. } => return Ok(None),
        };

        let nid = self.nodes.len();
        self.nodes.push(Iso1999Node {
            name,
            node: id,
            parent: nid,
            kind,
        });

        if self.image.node(id).is_dir() {
            for child in self.image.node(id).children().to_vec() {
                if let Some(child_n) = self.create(child)? {
                    self.nodes[child_n].parent = nid;
                    match &mut self.nodes[nid].kind {
                        Iso1999Kind::Dir(info) => info.children.push(child_n),
                        _ => unreachable!(),
                    }
                }
            }
        }
        Ok(Some(nid))
    }
}

fn build_tree(t: &mut WriteTarget) -> Result<Iso1999Tree> {
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
        .create(logical_root)?
        .ok_or(crate::error::IsoError::AssertFailure)?;
    let mut tree = Iso1999Tree {
        nodes: builder.nodes,
        root,
    };
    for id in 0..tree.nodes.len() {
        if tree.node(id).is_dir() {
            tree.sort_children(id);
        }
    }
    mangle_tree(&mut tree)?;
    Ok(tree)
}

fn mangle_tree(tree: &mut Iso1999Tree) -> Result<()> {
    let mut stack = vec![tree.root()];
    while let Some(dir) = stack.pop() {
        let child_ids: Vec<Iso1999Id> = tree.children(dir).to_vec();
        let mut entries: Vec<MangleEntry> = child_ids
            .iter()
            .map(|&c| MangleEntry {
                name: name_of(tree, c).to_string(),
                is_dir: tree.node(c).is_dir(),
            })
            .collect();
        if mangle_children(&mut entries, MAX_NAME_LEN, MAX_NAME_LEN)? {
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

fn dirent_len(tree: &Iso1999Tree, id: Iso1999Id) -> usize {
    let fi = name_of(tree, id).len().max(1);
    let mut len = 33 + fi;
    if len % 2 != 0 {
        len += 1;
    }
    len
}

fn calc_dir_size(tree: &Iso1999Tree, t: &WriteTarget, dir: Iso1999Id) -> u32 {
    let mut len: usize = 34 + 34;
    for &child in tree.children(dir) {
        let nsections = match &tree.node(child).kind {
            Iso1999Kind::File { src } => t.filesrcs.get(*src).sections.len(),
            _ => 1,
        };
        for _ in 0..nsections {
            let dl = dirent_len(tree, child);
            let remaining = BLOCK_SIZE - (len % BLOCK_SIZE);
            if dl > remaining {
                len += remaining;
            }
            len += dl;
        }
    }
    round_up(len, BLOCK_SIZE) as u32
}

fn calc_dir_pos(t: &mut WriteTarget, tree: &mut Iso1999Tree, dir: Iso1999Id) {
    t.iso1999_ndirs += 1;
    let len = calc_dir_size(tree, t, dir);
    {
        let info = tree.dir_info_mut(dir);
        info.block = t.curblock;
        info.len = len;
    }
    t.curblock += div_up(len as u64, BLOCK_SIZE as u64) as u32;
    let children: Vec<Iso1999Id> = tree.children(dir).to_vec();
    for child in children {
        if tree.node(child).is_dir() {
            calc_dir_pos(t, tree, child);
        }
    }
}

fn path_table_list(tree: &Iso1999Tree) -> Vec<Iso1999Id> {
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

fn path_table_size(tree: &Iso1999Tree) -> u32 {
    let mut size = 0u32;
    for id in path_table_list(tree) {
        let name_len = if id == tree.root() {
            1
        } else {
            name_of(tree, id).len()
        };
        size += (8 + name_len + (name_len % 2)) as u32;
    }
    size
}

fn render_path_table(tree: &Iso1999Tree, little_endian: bool) -> Vec<u8> {
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
        let name: &[u8] = if idx == 0 {
            &[0]
        } else {
            name_of(tree, dir).as_bytes()
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

fn render_record(
    t: &WriteTarget,
    tree: &Iso1999Tree,
    id: Iso1999Id,
    file_id: Option<u8>,
    extent: usize,
) -> Vec<u8> {
    let node = tree.node(id);
    let fi: Vec<u8> = match file_id {
        Some(b) => vec![b],
        None => name_of(tree, id).as_bytes().to_vec(),
    };

    let (block, length, multi_extent) = match &node.kind {
        Iso1999Kind::Dir(info) => (info.block, info.len, false),
        Iso1999Kind::File { src } => {
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

fn render_dir(t: &WriteTarget, tree: &Iso1999Tree, dir: Iso1999Id) -> Vec<u8> {
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
            Iso1999Kind::File { src } => t.filesrcs.get(*src).sections.len(),
            _ => 1,
        };
        for section in 0..nsections {
            push_record(&mut area, render_record(t, tree, child, None, section));
        }
    }
    area.resize(info.len as usize, 0);
    area
}

pub struct Iso1999Writer;

impl Iso1999Writer {
    pub fn create(t: &mut WriteTarget) -> Result<Self> {
        msg::debug(t.image.id(), "Creating low level ISO 9660:1999 tree...");
        t.iso1999 = Some(build_tree(t)?);
        t.curblock += 1;
        Ok(Iso1999Writer)
    }
}

impl ImageWriter for Iso1999Writer {
    fn compute_data_blocks(&mut self, t: &mut WriteTarget) -> Result<()> {
        let mut tree = t.iso1999.take().expect("1999 tree built");
        t.iso1999_ndirs = 0;
        let root = tree.root();
        calc_dir_pos(t, &mut tree, root);

        let size = path_table_size(&tree);
        t.iso1999_l_path_table_pos = t.curblock;
        t.curblock += div_up(size as u64, BLOCK_SIZE as u64) as u32;
        t.iso1999_m_path_table_pos = t.curblock;
        t.curblock += div_up(size as u64, BLOCK_SIZE as u64) as u32;
        t.iso1999_path_table_size = size;

        t.iso1999 = Some(tree);
        Ok(())
    }

    fn write_vol_desc(&mut self, t: &mut WriteTarget) -> Result<()> {
        let tree = t.iso1999.take().expect("1999 tree built");
        msg::debug(t.image.id(), "Write Enhanced Volume Descriptor");

        // the EVD shares the SVD layout: type 2, version 2 (9660:1999, 8.5)
        let mut vol = PrimaryVolDesc::zeroed();
        vol.vol_desc_type = 2;
        vol.std_identifier = *b"CD001";
        vol.vol_desc_version = 2;

        copy_str_pad(&mut vol.system_id, &t.image.system_id);
        copy_str_pad(&mut vol.volume_id, &t.image.volume_id);
        vol.vol_space_size = U32LsbMsb::new(t.vol_space_size);
        vol.vol_set_size = U16LsbMsb::new(1);
        vol.vol_seq_number = U16LsbMsb::new(1);
        vol.block_size = U16LsbMsb::new(BLOCK_SIZE as u16);
        vol.path_table_size = U32LsbMsb::new(t.iso1999_path_table_size);
        vol.l_path_table_pos = U32Le::new(t.iso1999_l_path_table_pos);
        vol.m_path_table_pos = U32Be::new(t.iso1999_m_path_table_pos);

        let root_rec = render_record(t, &tree, tree.root(), Some(0), 0);
        vol.root_dir_record[..root_rec.len()].copy_from_slice(&root_rec);

        copy_str_pad(&mut vol.vol_set_id, &t.image.volset_id);
        copy_str_pad(&mut vol.publisher_id, &t.image.publisher_id);
        copy_str_pad(&mut vol.data_prep_id, &t.image.data_preparer_id);
        copy_str_pad(&mut vol.application_id, &t.image.application_id);
        copy_str_pad(&mut vol.copyright_file_id, &t.image.copyright_file_id);
        copy_str_pad(&mut vol.abstract_file_id, &t.image.abstract_file_id);
        copy_str_pad(&mut vol.bibliographic_file_id, &t.image.biblio_file_id);

        let mut ts = [0u8; 17];
        datetime_17(
            &mut ts,
            if t.opts.vol_creation_time > 0 {
                t.opts.vol_creation_time
            } else {
                t.now
            },
            t.opts.always_gmt,
        );
        vol.vol_creation_time = ts;
        datetime_17(
            &mut ts,
            if t.opts.vol_modification_time > 0 {
                t.opts.vol_modification_time
            } else {
                t.now
            },
            t.opts.always_gmt,
        );
        vol.vol_modification_time = ts;
        vol.file_structure_version = 2;

        let res = t.write(bytemuck::bytes_of(&vol));
        t.iso1999 = Some(tree);
        res
    }

    fn write_data(&mut self, t: &mut WriteTarget) -> Result<()> {
        let tree = t.iso1999.take().expect("1999 tree built");
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
            msg::debug(t.image.id(), "Writing ISO 9660:1999 Path tables");
            let l = render_path_table(&tree, true);
            t.write(&l)?;
            let m = render_path_table(&tree, false);
            t.write(&m)?;
            Ok(())
        })();
        t.iso1999 = Some(tree);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_keep_case_and_length() {
        assert_eq!(iso1999_name("Mixed Case (1).txt"), "Mixed Case (1).txt");
        let long = "y".repeat(300);
        assert_eq!(iso1999_name(&long).len(), MAX_NAME_LEN);
        assert_eq!(iso1999_name("a/b"), "a_b");
    }
}
