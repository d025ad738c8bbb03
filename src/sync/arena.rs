// Index-addressed tree arena used while folding flat listings.

use std::collections::BTreeMap;

use tracing::warn;

use crate::tree::{split_path, EntryKind, FileEntry, ListingEntry, Tree, TreeKey, TreeNode};

pub type NodeId = usize;

/// The root directory of every arena.
pub const ROOT: NodeId = 0;

#[derive(Debug)]
enum ArenaNode {
    Dir(BTreeMap<TreeKey, NodeId>),
    File(FileEntry),
}

/// Nodes live in one vector and refer to children by index, so folding a
/// listing into any subtree needs only the subtree's id.
#[derive(Debug)]
pub struct TreeArena {
    nodes: Vec<ArenaNode>,
}

impl Default for TreeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeArena {
    pub fn new() -> Self {
        Self {
            nodes: vec![ArenaNode::Dir(BTreeMap::new())],
        }
    }

    /// Distinct entries (files and directories) below the root.
    pub fn entry_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Fold a flat listing whose paths are relative to `at`.
    /// Returns the number of entries applied.
    pub fn fold(&mut self, at: NodeId, entries: &[ListingEntry]) -> usize {
        let mut applied = 0;
        for entry in entries {
            let segments: Vec<&str> = split_path(&entry.path).collect();
            let Some((last, parents)) = segments.split_last() else {
                continue;
            };
            let mut node = at;
            for segment in parents {
                node = self.ensure_dir(node, TreeKey::new(*segment));
            }
            let key = TreeKey::new(*last);
            match entry.kind {
                EntryKind::Tree => {
                    self.ensure_dir(node, key);
                }
                EntryKind::Blob => {
                    let file = FileEntry::new(
                        entry.size.unwrap_or(0),
                        entry.sha.clone().unwrap_or_default(),
                    );
                    self.put_file(node, key, file);
                }
                EntryKind::Other => continue,
            }
            applied += 1;
        }
        applied
    }

    /// Child of a directory node, if any.
    pub fn child(&self, parent: NodeId, key: &TreeKey) -> Option<NodeId> {
        match &self.nodes[parent] {
            ArenaNode::Dir(children) => children.get(key).copied(),
            ArenaNode::File(_) => None,
        }
    }

    /// A directory that already holds children. Git never stores empty
    /// directories, so an empty node was announced but not yet expanded.
    pub fn is_expanded_dir(&self, id: NodeId) -> bool {
        matches!(&self.nodes[id], ArenaNode::Dir(children) if !children.is_empty())
    }

    /// Directory child under `key`, created when missing. A file in the way is
    /// turned into a directory so a key is never both.
    pub fn ensure_dir(&mut self, parent: NodeId, key: TreeKey) -> NodeId {
        if let Some(existing) = self.child(parent, &key) {
            if let ArenaNode::File(_) = self.nodes[existing] {
                warn!("tree fold: directory {} replaces a file entry", key);
                self.nodes[existing] = ArenaNode::Dir(BTreeMap::new());
            }
            return existing;
        }
        let id = self.push(ArenaNode::Dir(BTreeMap::new()));
        self.link(parent, key, id);
        id
    }

    fn put_file(&mut self, parent: NodeId, key: TreeKey, file: FileEntry) {
        if let Some(existing) = self.child(parent, &key) {
            if self.is_expanded_dir(existing) {
                warn!("tree fold: file {} would replace a populated directory, skipped", key);
                return;
            }
            self.nodes[existing] = ArenaNode::File(file);
            return;
        }
        let id = self.push(ArenaNode::File(file));
        self.link(parent, key, id);
    }

    fn push(&mut self, node: ArenaNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn link(&mut self, parent: NodeId, key: TreeKey, child: NodeId) {
        if let ArenaNode::Dir(children) = &mut self.nodes[parent] {
            children.insert(key, child);
        }
    }

    /// Materialize the owned [`Tree`] rooted at [`ROOT`].
    pub fn into_tree(self) -> Tree {
        self.build(ROOT)
    }

    fn build(&self, id: NodeId) -> Tree {
        let mut tree = Tree::new();
        if let ArenaNode::Dir(children) = &self.nodes[id] {
            for (key, child) in children {
                let node = match &self.nodes[*child] {
                    ArenaNode::File(file) => TreeNode::File(file.clone()),
                    ArenaNode::Dir(_) => TreeNode::Dir(self.build(*child)),
                };
                tree.insert(key.clone(), node);
            }
        }
        tree
    }
}

/// Fold a complete, non-truncated listing into a [`Tree`].
pub fn fold_listing(entries: &[ListingEntry]) -> Tree {
    let mut arena = TreeArena::new();
    arena.fold(ROOT, entries);
    arena.into_tree()
}
