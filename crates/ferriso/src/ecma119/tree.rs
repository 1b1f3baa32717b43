//! Construction of the low-level ECMA-119 tree.
//!
//! The logical tree is translated node by node (applying the identifier
//! rules of the selected level and relaxations), hardlink families get
//! their image inode numbers, children are sorted, colliding identifiers
//! mangled, and, with Rock Ridge, directories that violate the depth or
//! path-length limits are relocated under `/RR_MOVED`.

use crate::error::{codes, IsoError, Result};
use crate::filesrc::{FileSrcId, FileSrcRegistry};
use crate::fsource::XAttr;
use crate::mangle::{mangle_children, MangleEntry};
use crate::msg;
use crate::tree::{HideFlags, Image, NodeId, NodeKind};
use crate::types::MAX_FILE_SECTION_SIZE;
use crate::write::TargetOpts;

use super::name::{self, Relaxed};

/// Index of a node inside an [`Ecma119Tree`].
pub type EcmaId = usize;

/// Identifier of the relocation directory.
pub const RR_MOVED_NAME: &str = "RR_MOVED";

pub struct DirInfo {
    pub children: Vec<EcmaId>,
    /// Starting LBA of the directory-record area, assigned in pass 1.
    pub block: u32,
    /// Length of the directory-record area in bytes.
    pub len: u32,
    /// Length of the SUSP continuation area following the records.
    pub ce_len: u32,
    /// Original parent of a relocated directory.
    pub real_parent: Option<EcmaId>,
}

impl DirInfo {
    fn new() -> Self {
        DirInfo {
            children: Vec::new(),
            block: 0,
            len: 0,
            ce_len: 0,
            real_parent: None,
        }
    }
}

pub enum EcmaKind {
    Dir(DirInfo),
    File { src: FileSrcId },
    /// Stand-in for a relocated directory, carrying the CL link.
    Placeholder { real: EcmaId },
    Symlink,
    Special,
}

pub struct EcmaNode {
    /// Mangled on-disc identifier; `None` only for the root.
    pub iso_name: Option<String>,
    /// The logical node this entry was derived from.
    pub node: NodeId,
    /// Parent inside this tree; the root points at itself.
    pub parent: EcmaId,
    /// Image inode number for Rock Ridge PX and hardlink coalescing.
    pub ino: u64,
    pub nlink: u32,
    pub kind: EcmaKind,
}

impl EcmaNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EcmaKind::Dir(_))
    }
}

pub struct Ecma119Tree {
    nodes: Vec<EcmaNode>,
    root: EcmaId,
    rr_moved: Option<EcmaId>,
}

impl Ecma119Tree {
    pub fn root(&self) -> EcmaId {
        self.root
    }

    pub fn rr_moved(&self) -> Option<EcmaId> {
        self.rr_moved
    }

    pub fn node(&self, id: EcmaId) -> &EcmaNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: EcmaId) -> &mut EcmaNode {
        &mut self.nodes[id]
    }

    pub fn dir_info(&self, id: EcmaId) -> &DirInfo {
        match &self.nodes[id].kind {
            EcmaKind::Dir(info) => info,
            _ => panic!("node {id} is not a directory"),
        }
    }

    pub fn dir_info_mut(&mut self, id: EcmaId) -> &mut DirInfo {
        match &mut self.nodes[id].kind {
            EcmaKind::Dir(info) => info,
            _ => panic!("node {id} is not a directory"),
        }
    }

    pub fn children(&self, id: EcmaId) -> &[EcmaId] {
        match &self.nodes[id].kind {
            EcmaKind::Dir(info) => &info.children,
            _ => &[],
        }
    }

    /// All node ids, root first, depth-first order.
    pub fn all_ids(&self) -> Vec<EcmaId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            for &c in self.children(id).iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    fn sort_children(&mut self, dir: EcmaId) {
        let mut children = std::mem::take(&mut self.dir_info_mut(dir).children);
        children.sort_by(|&a, &b| {
            self.nodes[a]
                .iso_name
                .as_deref()
                .unwrap_or("")
                .cmp(self.nodes[b].iso_name.as_deref().unwrap_or(""))
        });
        self.dir_info_mut(dir).children = children;
    }
}

/// El Torito hookup for tree construction: where the catalog and the boot
/// image land in the file-source registry.
pub struct ElToritoSetup {
    /// Content of the catalog block, rendered late by the boot writer.
    pub catalog_stream: crate::stream::SharedStream,
    /// Logical node of the boot image file.
    pub image_node: NodeId,
    pub cat_src: Option<FileSrcId>,
    pub boot_src: Option<FileSrcId>,
}

struct Builder<'a> {
    image: &'a mut Image,
    files: &'a mut FileSrcRegistry,
    opts: &'a TargetOpts,
    eltorito: Option<&'a mut ElToritoSetup>,
    nodes: Vec<EcmaNode>,
}

impl<'a> Builder<'a> {
    fn iso_name(&self, id: NodeId) -> String {
        let node = self.image.node(id);
        let relaxed = if self.opts.allow_full_ascii {
            Relaxed::FullAscii
        } else if self.opts.allow_lowercase {
            Relaxed::Lowercase
        } else {
            Relaxed::No
        };
        let force_dot = self.opts.no_force_dots & 1 == 0;
        if node.is_dir() {
            if self.opts.max_37_char_filenames {
                name::dirid(&node.name, 37, relaxed)
            } else if self.opts.iso_level == 1 {
                name::dirid(&node.name, 8, relaxed)
            } else {
                name::dirid(&node.name, 31, relaxed)
            }
        } else if self.opts.max_37_char_filenames {
            name::fileid(&node.name, 36, relaxed, force_dot)
        } else if self.opts.iso_level == 1 {
            if relaxed != Relaxed::No {
                name::fileid(&node.name, 11, relaxed, force_dot)
            } else {
                name::iso_1_fileid(&node.name)
            }
        } else if relaxed != Relaxed::No {
            name::fileid(&node.name, 30, relaxed, force_dot)
        } else {
            name::iso_2_fileid(&node.name)
        }
    }

    /// Translate one logical node, recursing into directories.
    /// Returns `None` for nodes that cannot appear in this tree.
    fn create(&mut self, id: NodeId, depth: usize, pathlen: usize) -> Result<Option<EcmaId>> {
        let node = self.image.node(id);
        if node.hidden.contains(HideFlags::ON_RR) {
            return Ok(None);
        }
        let iso_name = if id == self.image.root() {
            None
        } else {
            Some(self.iso_name(id))
        };
        let name_len = iso_name.as_deref().map(str::len).unwrap_or(0);
        let max_path = pathlen + 1 + name_len;

        if !self.opts.rockridge {
            let node = self.image.node(id);
            if node.is_dir() && depth > 8 && !self.opts.allow_deep_paths {
                msg::submit(
                    self.image.id(),
                    codes::FILE_IMGPATH_WRONG,
                    0,
                    format!(
                        "File \"{}\" can't be added, directory depth is greater than 8",
                        self.image.path_of(id)
                    ),
                )?;
                return Ok(None);
            }
            if max_path > 255 && !self.opts.allow_longer_paths {
                msg::submit(
                    self.image.id(),
                    codes::FILE_IMGPATH_WRONG,
                    0,
                    format!(
                        "File \"{}\" can't be added, path length is greater than 255 characters",
                        self.image.path_of(id)
                    ),
                )?;
                return Ok(None);
            }
        }

        let ecma = match &self.image.node(id).kind {
            NodeKind::File {
                stream,
                sort_weight,
                from_old_session,
                old_sections,
            } => {
                let size = stream.lock().expect("stream poisoned").size();
                if size > MAX_FILE_SECTION_SIZE && self.opts.iso_level != 3 {
                    msg::submit(
                        self.image.id(),
                        codes::FILE_TOO_BIG,
                        0,
                        format!(
                            "File \"{}\" can't be added to image because it is \
                             greater than 4GB",
                            self.image.path_of(id)
                        ),
                    )?;
                    return Ok(None);
                }
                let src = self.files.register(
                    stream.clone(),
                    *sort_weight,
                    *from_old_session,
                    old_sections,
                    self.opts.appendable,
                    self.opts.iso_level,
                );
                if let Some(setup) = self.eltorito.as_deref_mut() {
                    if setup.image_node == id {
                        setup.boot_src = Some(src);
                    }
                }
                EcmaKind::File { src }
            }
            NodeKind::Symlink { .. } => {
                if !self.opts.rockridge {
                    msg::submit(
                        self.image.id(),
                        codes::FILE_IGNORED,
                        0,
                        format!(
                            "File \"{}\" ignored. Symlinks need RockRidge extensions.",
                            self.image.path_of(id)
                        ),
                    )?;
                    return Ok(None);
                }
                EcmaKind::Symlink
            }
            NodeKind::Special { .. } => {
                if !self.opts.rockridge {
                    msg::submit(
                        self.image.id(),
                        codes::FILE_IGNORED,
                        0,
                        format!(
                            "File \"{}\" ignored. Special files need RockRidge extensions.",
                            self.image.path_of(id)
                        ),
                    )?;
                    return Ok(None);
                }
                EcmaKind::Special
            }
            NodeKind::BootCatalog => {
                if let Some(setup) = self.eltorito.as_deref_mut() {
                    let src = self.files.register(
                        setup.catalog_stream.clone(),
                        0,
                        false,
                        &[],
                        self.opts.appendable,
                        self.opts.iso_level,
                    );
                    setup.cat_src = Some(src);
                    let ecma_id = self.nodes.len();
                    self.nodes.push(EcmaNode {
                        iso_name,
                        node: id,
                        parent: ecma_id,
                        ino: 0,
                        nlink: 1,
                        kind: EcmaKind::File { src },
                    });
                    return Ok(Some(ecma_id));
                }
                msg::submit(
                    self.image.id(),
                    codes::FILE_IGNORED,
                    0,
                    "El-Torito catalog found on an image without El-Torito",
                )?;
                return Ok(None);
            }
            NodeKind::Dir { .. } => EcmaKind::Dir(DirInfo::new()),
        };

        let ecma_id = self.nodes.len();
        self.nodes.push(EcmaNode {
            iso_name,
            node: id,
            parent: ecma_id,
            ino: 0,
            nlink: 1,
            kind: ecma,
        });

        if self.image.node(id).is_dir() {
            let children: Vec<NodeId> = self.image.node(id).children().to_vec();
            for child in children {
                if let Some(child_ecma) = self.create(child, depth + 1, max_path)? {
                    self.nodes[child_ecma].parent = ecma_id;
                    match &mut self.nodes[ecma_id].kind {
                        EcmaKind::Dir(info) => info.children.push(child_ecma),
                        _ => unreachable!(),
                    }
                }
            }
        }
        Ok(Some(ecma_id))
    }
}

/// Key the hardlink detector sorts by: equal keys form one inode family.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HardlinkKey {
    kind_rank: u8,
    fs_id: u32,
    dev_id: u64,
    ino_id: u64,
    size: u64,
    sym_dest: String,
    dev_num: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: i64,
    mtime: i64,
    ctime: i64,
    xattrs: Vec<XAttr>,
    /// Nonzero forces the node into a family of its own.
    unique: u64,
}

fn hardlink_key(tree_node: &EcmaNode, image: &Image, opts: &TargetOpts) -> HardlinkKey {
    let node = image.node(tree_node.node);
    let (kind_rank, fs_id, dev_id, ino_id, size, sym_dest, dev_num) = match &node.kind {
        NodeKind::Dir { .. } => (0u8, 0, 0, 0, 0, String::new(), 0),
        NodeKind::File { stream, .. } => {
            let guard = stream.lock().expect("stream poisoned");
            let id = guard.id();
            (1, id.fs_id, id.dev_id, id.ino_id, guard.size(), String::new(), 0)
        }
        NodeKind::BootCatalog => (2, 0, 0, 0, 0, String::new(), 0),
        NodeKind::Symlink { dest } => (3, 0, 0, 0, 0, dest.clone(), 0),
        NodeKind::Special { dev } => (4, 0, 0, 0, 0, String::new(), *dev),
    };
    // Nodes without a content identity cannot be coalesced unless they
    // were imported with a persistent image inode.
    let content_identity = matches!(node.kind, NodeKind::File { .. }) || node.ino != 0;
    let unique = if opts.hardlinks && content_identity {
        0
    } else {
        tree_node.node as u64 + 1
    };
    HardlinkKey {
        kind_rank,
        fs_id,
        dev_id,
        ino_id,
        size,
        sym_dest,
        dev_num,
        mode: node.attrs.mode,
        uid: node.attrs.uid,
        gid: node.attrs.gid,
        atime: node.attrs.atime,
        mtime: node.attrs.mtime,
        ctime: node.attrs.ctime,
        xattrs: node.xattrs.clone(),
        unique,
    }
}

/// Assign image inode numbers and link counts.
///
/// Nodes are sorted by identity and attributes; every run of equal keys
/// becomes one inode family. An imported inode number is preserved for
/// the family when the attributes still match, unless the previous family
/// already took it.
fn match_hardlinks(tree: &mut Ecma119Tree, image: &mut Image, opts: &TargetOpts) {
    let mut keyed: Vec<(HardlinkKey, EcmaId)> = tree
        .all_ids()
        .into_iter()
        .map(|id| (hardlink_key(tree.node(id), image, opts), id))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut prev_ino = 0u64;
    let mut start = 0usize;
    while start < keyed.len() {
        let mut end = start;
        while end + 1 < keyed.len() && keyed[end + 1].0 == keyed[start].0 {
            end += 1;
        }
        // preserve an imported inode if any family member carries one
        let mut img_ino = keyed[start..=end]
            .iter()
            .map(|&(_, id)| image.node(tree.node(id).node).ino)
            .find(|&ino| ino != 0)
            .unwrap_or(0);
        if img_ino != 0 && img_ino == prev_ino {
            // property divergence of an imported hardlink family
            img_ino = 0;
        }
        if img_ino == 0 {
            img_ino = image.give_ino_number();
        }
        let nlink = (end - start + 1) as u32;
        for &(_, id) in &keyed[start..=end] {
            tree.node_mut(id).ino = img_ino;
            tree.node_mut(id).nlink = nlink;
        }
        prev_ino = img_ino;
        start = end + 1;
    }
}

fn sort_tree(tree: &mut Ecma119Tree) {
    for id in tree.all_ids() {
        if tree.node(id).is_dir() {
            tree.sort_children(id);
        }
    }
}

fn mangle_limits(opts: &TargetOpts) -> (usize, usize) {
    if opts.max_37_char_filenames {
        (37, 37)
    } else if opts.iso_level == 1 {
        // 8 + 3 + 1
        (12, 8)
    } else {
        (31, 31)
    }
}

fn mangle_dir(tree: &mut Ecma119Tree, dir: EcmaId, opts: &TargetOpts, recurse: bool) -> Result<()> {
    let (max_file, max_dir) = mangle_limits(opts);
    let child_ids: Vec<EcmaId> = tree.children(dir).to_vec();
    let mut entries: Vec<MangleEntry> = child_ids
        .iter()
        .map(|&c| MangleEntry {
            name: tree.node(c).iso_name.clone().unwrap_or_default(),
            is_dir: tree.node(c).is_dir(),
        })
        .collect();
    let changed = mangle_children(&mut entries, max_file, max_dir)?;
    if changed {
        for (&c, entry) in child_ids.iter().zip(entries.into_iter()) {
            tree.node_mut(c).iso_name = Some(entry.name);
        }
        tree.sort_children(dir);
    }
    if recurse {
        for c in child_ids {
            if tree.node(c).is_dir() {
                mangle_dir(tree, c, opts, true)?;
            }
        }
    }
    Ok(())
}

fn max_child_name_len(tree: &Ecma119Tree, dir: EcmaId) -> usize {
    tree.children(dir)
        .iter()
        .map(|&c| tree.node(c).iso_name.as_deref().map(str::len).unwrap_or(0))
        .max()
        .unwrap_or(0)
}

/// Find the first directory violating ECMA-119, 6.8.2.1: more than eight
/// name components deep, or a path that would exceed 255 characters.
fn find_deep_dir(
    tree: &Ecma119Tree,
    dir: EcmaId,
    depth: usize,
    pathlen: usize,
    rr_moved: Option<EcmaId>,
) -> Option<EcmaId> {
    let max_path = pathlen + 1 + max_child_name_len(tree, dir);
    if depth > 8 || max_path > 255 {
        // the relocation dir and dirs already inside it cannot move again
        if Some(dir) != rr_moved && Some(tree.node(dir).parent) != rr_moved {
            return Some(dir);
        }
    }
    for &c in tree.children(dir) {
        if tree.node(c).is_dir() {
            let name_len = tree.node(c).iso_name.as_deref().map(str::len).unwrap_or(0);
            if let Some(found) = find_deep_dir(tree, c, depth + 1, pathlen + 1 + name_len, rr_moved)
            {
                return Some(found);
            }
        }
    }
    None
}

fn ensure_rr_moved(tree: &mut Ecma119Tree, image: &mut Image) -> Result<EcmaId> {
    if let Some(id) = tree.rr_moved {
        return Ok(id);
    }
    let root = tree.root;
    let logical = match image.child_by_name(image.root(), RR_MOVED_NAME) {
        Some(existing) => existing,
        None => {
            let id = image.add_dir(image.root(), RR_MOVED_NAME)?;
            image.node_mut(id).hidden = HideFlags::ON_JOLIET | HideFlags::ON_1999;
            image.node_mut(id).attrs.mode = 0o040555;
            id
        }
    };
    let id = tree.nodes.len();
    tree.nodes.push(EcmaNode {
        iso_name: Some(RR_MOVED_NAME.to_string()),
        node: logical,
        parent: root,
        ino: 0,
        nlink: 1,
        kind: EcmaKind::Dir(DirInfo::new()),
    });
    tree.dir_info_mut(root).children.push(id);
    tree.rr_moved = Some(id);
    Ok(id)
}

/// Relocate `dir` under `/RR_MOVED` (IEEE P1282, 4.1.5), leaving a
/// placeholder with the same identifier in its old slot.
fn relocate_dir(tree: &mut Ecma119Tree, image: &mut Image, dir: EcmaId) -> Result<()> {
    let rr_moved = ensure_rr_moved(tree, image)?;
    let old_parent = tree.node(dir).parent;

    let placeholder = tree.nodes.len();
    tree.nodes.push(EcmaNode {
        iso_name: tree.node(dir).iso_name.clone(),
        node: tree.node(dir).node,
        parent: old_parent,
        ino: tree.node(dir).ino,
        nlink: tree.node(dir).nlink,
        kind: EcmaKind::Placeholder { real: dir },
    });
    let slot = tree
        .dir_info(old_parent)
        .children
        .iter()
        .position(|&c| c == dir)
        .expect("relocated dir is a child of its parent");
    tree.dir_info_mut(old_parent).children[slot] = placeholder;

    tree.dir_info_mut(dir).real_parent = Some(old_parent);
    tree.node_mut(dir).parent = rr_moved;
    tree.dir_info_mut(rr_moved).children.push(dir);
    tree.sort_children(rr_moved);
    Ok(())
}

/// Build the complete low-level ECMA-119 tree for `image`.
pub fn create(
    image: &mut Image,
    files: &mut FileSrcRegistry,
    opts: &TargetOpts,
    eltorito: Option<&mut ElToritoSetup>,
) -> Result<Ecma119Tree> {
    let mut builder = Builder {
        image,
        files,
        opts,
        eltorito,
        nodes: Vec::new(),
    };
    let logical_root = builder.image.root();
    let root = builder
        .create(logical_root, 0, 0)?
        .ok_or(IsoError::AssertFailure)?;
    let mut tree = Ecma119Tree {
        nodes: builder.nodes,
        root,
        rr_moved: None,
    };

    msg::debug(image.id(), "Matching hardlinks...");
    match_hardlinks(&mut tree, image, opts);

    msg::debug(image.id(), "Sorting the low level tree...");
    sort_tree(&mut tree);

    msg::debug(image.id(), "Mangling names...");
    let tree_root = tree.root();
    mangle_dir(&mut tree, tree_root, opts, true)?;

    if opts.rockridge && !opts.allow_deep_paths {
        // relocate until every directory satisfies ECMA-119, 6.8.2.1
        while let Some(deep) = find_deep_dir(&tree, tree_root, 0, 0, tree.rr_moved) {
            relocate_dir(&mut tree, image, deep)?;
        }
        // RR_MOVED and the relocated dirs may collide with root entries
        tree.sort_children(tree_root);
        mangle_dir(&mut tree, tree_root, opts, false)?;
        if let Some(rr_moved) = tree.rr_moved {
            mangle_dir(&mut tree, rr_moved, opts, false)?;
        }
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{share, MemoryStream};
    use crate::write::TargetOpts;

    fn build(image: &mut Image, opts: &TargetOpts) -> Ecma119Tree {
        let mut files = FileSrcRegistry::default();
        create(image, &mut files, opts, None).unwrap()
    }

    #[test]
    fn children_are_sorted_and_mangled() {
        let mut img = Image::new("T");
        let root = img.root();
        for name in ["foo.txt", "Foo.txt", "FOO.txt"] {
            img.add_file(root, name, share(MemoryStream::new(vec![0])))
                .unwrap();
        }
        let opts = TargetOpts {
            iso_level: 1,
            ..TargetOpts::default()
        };
        let tree = build(&mut img, &opts);
        let names: Vec<String> = tree
            .children(tree.root())
            .iter()
            .map(|&c| tree.node(c).iso_name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["FOO0.TXT", "FOO1.TXT", "FOO2.TXT"]);
        assert!(names.iter().all(|n| n.len() <= 12));
    }

    #[test]
    fn deep_tree_is_relocated() {
        let mut img = Image::new("T");
        let mut cur = img.root();
        for name in ["a", "b", "c", "d", "e", "f", "g", "h", "i"] {
            cur = img.add_dir(cur, name).unwrap();
        }
        img.add_file(cur, "leaf", share(MemoryStream::new(vec![0])))
            .unwrap();

        let opts = TargetOpts {
            iso_level: 2,
            rockridge: true,
            ..TargetOpts::default()
        };
        let tree = build(&mut img, &opts);

        // h still holds an entry named I, but it is a placeholder now
        let mut cur_ecma = tree.root();
        for want in ["A", "B", "C", "D", "E", "F", "G", "H"] {
            cur_ecma = *tree
                .children(cur_ecma)
                .iter()
                .find(|&&c| tree.node(c).iso_name.as_deref() == Some(want))
                .unwrap_or_else(|| panic!("missing {want}"));
        }
        let placeholder = tree.children(cur_ecma)[0];
        let real = match tree.node(placeholder).kind {
            EcmaKind::Placeholder { real } => real,
            _ => panic!("expected placeholder for I"),
        };
        assert_eq!(tree.node(placeholder).iso_name.as_deref(), Some("I"));

        // the real i lives under RR_MOVED with its subtree intact
        let rr_moved = tree.rr_moved().expect("RR_MOVED created");
        assert_eq!(tree.node(rr_moved).iso_name.as_deref(), Some(RR_MOVED_NAME));
        assert!(tree.children(rr_moved).contains(&real));
        assert_eq!(
            tree.dir_info(real).real_parent,
            Some(cur_ecma),
            "relocated dir remembers its original parent"
        );
        assert_eq!(tree.children(real).len(), 1, "leaf file moved along");
    }

    #[test]
    fn hardlinks_share_an_inode() {
        let mut img = Image::new("T");
        let root = img.root();
        let stream = share(MemoryStream::new(vec![1, 2, 3]));
        img.add_file(root, "one", stream.clone()).unwrap();
        img.add_file(root, "two", stream).unwrap();
        img.add_file(root, "other", share(MemoryStream::new(vec![1, 2, 3])))
            .unwrap();

        let opts = TargetOpts {
            iso_level: 2,
            rockridge: true,
            hardlinks: true,
            ..TargetOpts::default()
        };
        let tree = build(&mut img, &opts);
        let by_name = |n: &str| {
            *tree
                .children(tree.root())
                .iter()
                .find(|&&c| tree.node(c).iso_name.as_deref() == Some(n))
                .unwrap()
        };
        let one = tree.node(by_name("ONE."));
        let two = tree.node(by_name("TWO."));
        let other = tree.node(by_name("OTHER."));
        assert_eq!(one.ino, two.ino);
        assert_eq!(one.nlink, 2);
        assert_ne!(one.ino, other.ino);
        assert_eq!(other.nlink, 1);
    }

    #[test]
    fn too_deep_without_rr_is_rejected() {
        let mut img = Image::new("T");
        let mut cur = img.root();
        for i in 0..9 {
            cur = img.add_dir(cur, format!("d{i}")).unwrap();
        }
        let opts = TargetOpts {
            iso_level: 2,
            ..TargetOpts::default()
        };
        let mut files = FileSrcRegistry::default();
        let res = create(&mut img, &mut files, &opts, None);
        assert!(res.is_err());
    }
}
