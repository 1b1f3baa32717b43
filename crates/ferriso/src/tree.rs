//! The logical tree an image is generated from.
//!
//! Nodes live in an arena owned by [`Image`]; children refer to their
//! parent by id and the root's parent is itself. The full tree-mutation
//! API lives with the ingestion layer; the constructors here are the
//! subset the engine and its tests need.

use bitflags::bitflags;

use crate::error::{IsoError, Result};
use crate::filesrc::Section;
use crate::fsource::XAttr;
use crate::stream::SharedStream;

/// Index of a node inside its [`Image`] arena.
pub type NodeId = usize;

/// Longest node name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Longest symlink destination in bytes.
pub const MAX_SYMLINK_DEST: usize = 4096;

bitflags! {
    /// Which on-disc trees a node is hidden from.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HideFlags: u8 {
        /// Hide in the ECMA-119 / Rock Ridge tree.
        const ON_RR = 1 << 0;
        /// Hide in the Joliet tree.
        const ON_JOLIET = 1 << 1;
        /// Hide in the ISO 9660:1999 tree.
        const ON_1999 = 1 << 2;
    }
}

/// POSIX attributes common to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttrs {
    /// File type and permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl NodeAttrs {
    pub fn dir(mode: u32) -> Self {
        NodeAttrs {
            mode: 0o040000 | (mode & 0o7777),
            ..Self::zeroed()
        }
    }

    pub fn file(mode: u32) -> Self {
        NodeAttrs {
            mode: 0o100000 | (mode & 0o7777),
            ..Self::zeroed()
        }
    }

    fn zeroed() -> Self {
        NodeAttrs {
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }
}

/// The node variants of the logical tree.
pub enum NodeKind {
    Dir {
        /// Insertion-ordered, names unique.
        children: Vec<NodeId>,
    },
    File {
        stream: SharedStream,
        /// Higher weights are laid out first when file sorting is on.
        sort_weight: i32,
        /// Content already present in an imported session.
        from_old_session: bool,
        /// Sections of the content in the old image, carried over verbatim
        /// when writing an appendable add-on session.
        old_sections: Vec<Section>,
    },
    Symlink {
        dest: String,
    },
    /// Block or character device, fifo or socket; the type is in the mode.
    Special {
        dev: u64,
    },
    /// Position marker for the El Torito boot catalog.
    BootCatalog,
}

pub struct Node {
    pub name: String,
    pub parent: NodeId,
    pub attrs: NodeAttrs,
    pub hidden: HideFlags,
    pub xattrs: Vec<XAttr>,
    /// Persistent image inode, 0 until assigned. Nodes re-imported from an
    /// existing image keep their old number when attributes still match.
    pub ino: u64,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Dir { children } => children,
            _ => &[],
        }
    }
}

/// The logical tree plus the volume metadata that ends up in the PVD.
pub struct Image {
    nodes: Vec<Node>,
    image_id: u32,
    ino_counter: u64,

    pub volume_id: String,
    pub volset_id: String,
    pub publisher_id: String,
    pub data_preparer_id: String,
    pub system_id: String,
    pub application_id: String,
    pub copyright_file_id: String,
    pub abstract_file_id: String,
    pub biblio_file_id: String,

    /// El Torito configuration, if the image is bootable.
    #[cfg(feature = "el-torito")]
    pub boot_catalog: Option<crate::eltorito::BootCatalog>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.len() > MAX_NAME_LEN
    {
        return Err(IsoError::InvalidPath(name.to_string()));
    }
    Ok(())
}

impl Image {
    pub fn new(volume_id: impl Into<String>) -> Self {
        static IMAGE_IDS: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);
        let root = Node {
            name: String::new(),
            parent: 0,
            attrs: NodeAttrs::dir(0o555),
            hidden: HideFlags::empty(),
            xattrs: Vec::new(),
            ino: 0,
            kind: NodeKind::Dir {
                children: Vec::new(),
            },
        };
        Image {
            nodes: vec![root],
            image_id: IMAGE_IDS.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            ino_counter: 0,
            volume_id: volume_id.into(),
            volset_id: String::new(),
            publisher_id: String::new(),
            data_preparer_id: String::new(),
            system_id: String::new(),
            application_id: String::new(),
            copyright_file_id: String::new(),
            abstract_file_id: String::new(),
            biblio_file_id: String::new(),
            #[cfg(feature = "el-torito")]
            boot_catalog: None,
        }
    }

    /// Identifier used as message-queue origin for this image.
    pub fn id(&self) -> u32 {
        self.image_id
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Number of nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Hand out a fresh image inode number.
    pub fn give_ino_number(&mut self) -> u64 {
        self.ino_counter += 1;
        self.ino_counter
    }

    /// Absolute path of a node inside the tree, for diagnostics.
    pub fn path_of(&self, id: NodeId) -> String {
        if id == self.root() {
            return "/".to_string();
        }
        let mut parts = Vec::new();
        let mut cur = id;
        while cur != self.root() {
            parts.push(self.nodes[cur].name.clone());
            cur = self.nodes[cur].parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Find a direct child of `dir` by name.
    pub fn child_by_name(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[dir]
            .children()
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == name)
    }

    fn attach(&mut self, parent: NodeId, node: Node) -> Result<NodeId> {
        validate_name(&node.name)?;
        if !self.nodes[parent].is_dir() {
            return Err(IsoError::WrongArg(format!(
                "{} is not a directory",
                self.path_of(parent)
            )));
        }
        if self.child_by_name(parent, &node.name).is_some() {
            return Err(IsoError::NameNotUnique(node.name));
        }
        let id = self.nodes.len();
        self.nodes.push(node);
        match &mut self.nodes[parent].kind {
            NodeKind::Dir { children } => children.push(id),
            _ => unreachable!(),
        }
        Ok(id)
    }

    pub fn add_dir(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        self.attach(
            parent,
            Node {
                name: name.into(),
                parent,
                attrs: NodeAttrs::dir(0o755),
                hidden: HideFlags::empty(),
                xattrs: Vec::new(),
                ino: 0,
                kind: NodeKind::Dir {
                    children: Vec::new(),
                },
            },
        )
    }

    pub fn add_file(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        stream: SharedStream,
    ) -> Result<NodeId> {
        self.attach(
            parent,
            Node {
                name: name.into(),
                parent,
                attrs: NodeAttrs::file(0o644),
                hidden: HideFlags::empty(),
                xattrs: Vec::new(),
                ino: 0,
                kind: NodeKind::File {
                    stream,
                    sort_weight: 0,
                    from_old_session: false,
                    old_sections: Vec::new(),
                },
            },
        )
    }

    /// Add a file whose content already lives in a previous session at the
    /// given sections. In an appendable production the sections are
    /// referenced, not rewritten.
    pub fn add_file_from_old_session(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        stream: SharedStream,
        old_sections: Vec<Section>,
    ) -> Result<NodeId> {
        self.attach(
            parent,
            Node {
                name: name.into(),
                parent,
                attrs: NodeAttrs::file(0o644),
                hidden: HideFlags::empty(),
                xattrs: Vec::new(),
                ino: 0,
                kind: NodeKind::File {
                    stream,
                    sort_weight: 0,
                    from_old_session: true,
                    old_sections,
                },
            },
        )
    }

    pub fn add_symlink(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        dest: impl Into<String>,
    ) -> Result<NodeId> {
        let dest = dest.into();
        if dest.is_empty() || dest.len() > MAX_SYMLINK_DEST {
            return Err(IsoError::InvalidPath(dest));
        }
        self.attach(
            parent,
            Node {
                name: name.into(),
                parent,
                attrs: NodeAttrs {
                    mode: 0o120777,
                    ..NodeAttrs::file(0o777)
                },
                hidden: HideFlags::empty(),
                xattrs: Vec::new(),
                ino: 0,
                kind: NodeKind::Symlink { dest },
            },
        )
    }

    /// Add a special file; the file type must already be in `mode`
    /// (block, char, fifo or socket bits).
    pub fn add_special(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        mode: u32,
        dev: u64,
    ) -> Result<NodeId> {
        self.attach(
            parent,
            Node {
                name: name.into(),
                parent,
                attrs: NodeAttrs {
                    mode,
                    ..NodeAttrs::file(0o644)
                },
                hidden: HideFlags::empty(),
                xattrs: Vec::new(),
                ino: 0,
                kind: NodeKind::Special { dev },
            },
        )
    }

    /// Add the placeholder node marking where the El Torito boot catalog
    /// will appear in the tree.
    #[cfg(feature = "el-torito")]
    pub fn add_boot_catalog_node(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
    ) -> Result<NodeId> {
        self.attach(
            parent,
            Node {
                name: name.into(),
                parent,
                attrs: NodeAttrs::file(0o444),
                hidden: HideFlags::empty(),
                xattrs: Vec::new(),
                ino: 0,
                kind: NodeKind::BootCatalog,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{share, MemoryStream};

    #[test]
    fn names_are_validated() {
        let mut img = Image::new("TEST");
        let root = img.root();
        assert!(img.add_dir(root, "").is_err());
        assert!(img.add_dir(root, ".").is_err());
        assert!(img.add_dir(root, "..").is_err());
        assert!(img.add_dir(root, "a/b").is_err());
        assert!(img.add_dir(root, "x".repeat(256)).is_err());
        assert!(img.add_dir(root, "ok").is_ok());
    }

    #[test]
    fn sibling_names_are_unique() {
        let mut img = Image::new("TEST");
        let root = img.root();
        img.add_dir(root, "a").unwrap();
        match img.add_dir(root, "a") {
            Err(IsoError::NameNotUnique(n)) => assert_eq!(n, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn paths_and_parents() {
        let mut img = Image::new("TEST");
        let root = img.root();
        let a = img.add_dir(root, "a").unwrap();
        let b = img.add_dir(a, "b").unwrap();
        let f = img
            .add_file(b, "f.txt", share(MemoryStream::new(vec![1])))
            .unwrap();
        assert_eq!(img.path_of(f), "/a/b/f.txt");
        assert_eq!(img.node(root).parent, root);
        assert_eq!(img.node(f).parent, b);
    }
}
