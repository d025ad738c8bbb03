// Repository tree model: nested path segments mapped to files or subtrees.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::config::{ESCAPE_PREFIX, RESERVED_MARKER};

/// One path segment of a [`Tree`].
///
/// The in-memory key always holds the raw segment. Escaping only exists in
/// the at-rest encoding, where segments starting with the reserved marker (or
/// with the escape prefix itself) get one escape prefix. Two distinct raw
/// segments therefore never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeKey {
    raw: String,
    escaped: bool,
}

impl TreeKey {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let escaped = raw.starts_with(RESERVED_MARKER) || raw.starts_with(ESCAPE_PREFIX);
        Self { raw, escaped }
    }

    /// Decode a key from its at-rest form.
    pub fn decode(encoded: &str) -> Self {
        match encoded.strip_prefix(ESCAPE_PREFIX) {
            Some(rest) => Self::new(rest),
            None => Self::new(encoded),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the at-rest form carries an escape prefix.
    pub fn is_escaped(&self) -> bool {
        self.escaped
    }

    pub fn encoded(&self) -> Cow<'_, str> {
        if self.escaped {
            Cow::Owned(format!("{}{}", ESCAPE_PREFIX, self.raw))
        } else {
            Cow::Borrowed(&self.raw)
        }
    }
}

impl fmt::Display for TreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TreeKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Leaf record of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    pub size: u64,
    /// Remote blob hash for remote sources, local version marker for cached content.
    pub sha: String,
}

impl FileEntry {
    pub fn new(size: u64, sha: impl Into<String>) -> Self {
        Self {
            size,
            sha: sha.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    File(FileEntry),
    Dir(Tree),
}

impl TreeNode {
    pub fn as_file(&self) -> Option<&FileEntry> {
        match self {
            TreeNode::File(f) => Some(f),
            TreeNode::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&Tree> {
        match self {
            TreeNode::Dir(t) => Some(t),
            TreeNode::File(_) => None,
        }
    }
}

/// Recursive directory structure. Sibling keys are unique and a key is either
/// a file or a subtree, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<TreeKey, TreeNode>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TreeKey, &TreeNode)> {
        self.entries.iter()
    }

    /// Insert or replace a direct child.
    pub fn insert(&mut self, key: TreeKey, node: TreeNode) -> Option<TreeNode> {
        self.entries.insert(key, node)
    }

    /// Look up a node by `/`-separated logical path. Empty components are ignored.
    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        let mut segments = split_path(path).peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            let node = current.entries.get(&TreeKey::new(segment))?;
            if segments.peek().is_none() {
                return Some(node);
            }
            current = node.as_dir()?;
        }
        None
    }

    /// Insert a file at `path`, creating intermediate subtrees. A file sitting
    /// where a subtree is needed is replaced by the subtree.
    pub fn insert_file(&mut self, path: &str, entry: FileEntry) {
        let segments: Vec<&str> = split_path(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            current = current.dir_mut(TreeKey::new(*segment));
        }
        current.entries.insert(TreeKey::new(*last), TreeNode::File(entry));
    }

    /// Get the subtree under `key`, creating it if missing or if a file is in the way.
    pub fn dir_mut(&mut self, key: TreeKey) -> &mut Tree {
        let node = self
            .entries
            .entry(key)
            .or_insert_with(|| TreeNode::Dir(Tree::new()));
        if let TreeNode::File(_) = node {
            *node = TreeNode::Dir(Tree::new());
        }
        match node {
            TreeNode::Dir(tree) => tree,
            TreeNode::File(_) => unreachable!("file replaced by directory above"),
        }
    }

    /// Total number of files in this tree and all subtrees.
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|node| match node {
                TreeNode::File(_) => 1,
                TreeNode::Dir(tree) => tree.file_count(),
            })
            .sum()
    }

    /// Flatten into listing entries in depth-first order, directories before their children.
    pub fn flatten(&self) -> Vec<ListingEntry> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut Vec<ListingEntry>) {
        for (key, node) in &self.entries {
            let path = join_path(prefix, key.raw());
            match node {
                TreeNode::File(file) => out.push(ListingEntry {
                    path,
                    kind: EntryKind::Blob,
                    sha: Some(file.sha.clone()),
                    size: Some(file.size),
                }),
                TreeNode::Dir(tree) => {
                    out.push(ListingEntry {
                        path: path.clone(),
                        kind: EntryKind::Tree,
                        sha: None,
                        size: None,
                    });
                    tree.flatten_into(&path, out);
                }
            }
        }
    }
}

impl Serialize for Tree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, node) in &self.entries {
            map.serialize_entry(key.encoded().as_ref(), node)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Tree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, TreeNode>::deserialize(deserializer)?;
        let entries = raw
            .into_iter()
            .map(|(k, v)| (TreeKey::decode(&k), v))
            .collect();
        Ok(Tree { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    /// Submodule links and anything else the host may report.
    #[serde(other)]
    Other,
}

/// One entry of a flat remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Flat listing returned by the remote tree API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeListing {
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(rename = "tree", default)]
    pub entries: Vec<ListingEntry>,
    #[serde(default)]
    pub truncated: bool,
}

/// Split a logical path on `/`, dropping empty components.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
