//! Document tree index
//!
//! The viewer ships a JSON description of every document it can show:
//! folders with optional index documents (a README) and ordered children.
//! [`DocumentTree`] flattens that description once into an arena where every
//! node knows its parent, so "which folder is this document in, and what else
//! is there" is a hash lookup instead of a fresh traversal.

mod scan;

pub use scan::{scan_directory, DEFAULT_INDEX_NAMES};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub type NodeId = usize;

/// The designated index document of a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDoc {
    pub path: String,
    #[serde(default)]
    pub title: String,
}

/// Wire shape of one node in the tree JSON.
///
/// A node with neither `children` nor `index` is a leaf file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTreeNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DocumentTreeNode>>,
}

impl DocumentTreeNode {
    pub fn file(path: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn folder(
        path: Option<String>,
        title: impl Into<String>,
        index: Option<IndexDoc>,
        children: Vec<DocumentTreeNode>,
    ) -> Self {
        Self {
            path,
            title: title.into(),
            index,
            children: Some(children),
        }
    }
}

/// A node in the flattened arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: NodeId,
    pub path: Option<String>,
    pub title: String,
    pub index: Option<IndexDoc>,
    pub parent: Option<NodeId>,
    children: Option<Vec<NodeId>>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none() && self.index.is_none()
    }

    pub fn is_folder(&self) -> bool {
        !self.is_leaf()
    }

    pub fn children(&self) -> &[NodeId] {
        self.children.as_deref().unwrap_or(&[])
    }

    pub fn index_path(&self) -> Option<&str> {
        self.index.as_ref().map(|index| index.path.as_str())
    }

    /// True when `target` is this node's own path or its index path.
    pub fn matches(&self, target: &str) -> bool {
        self.path.as_deref() == Some(target) || self.index_path() == Some(target)
    }
}

/// Result of [`DocumentTree::find_node_and_parent`].
#[derive(Debug, Clone, Copy)]
pub struct Located<'a> {
    pub node: &'a TreeNode,
    pub parent: Option<&'a TreeNode>,
}

/// Immutable, arena-backed index over a document tree.
#[derive(Debug, Clone)]
pub struct DocumentTree {
    nodes: Vec<TreeNode>,
    by_path: HashMap<String, NodeId>,
    duplicates: Vec<String>,
}

impl DocumentTree {
    /// Flatten `root` in depth-first declared order.
    ///
    /// When a path is declared more than once, the first declaration wins and
    /// the path is reported by [`DocumentTree::duplicate_paths`].
    pub fn from_root(root: DocumentTreeNode) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            by_path: HashMap::new(),
            duplicates: Vec::new(),
        };
        tree.push(root, None);

        if !tree.duplicates.is_empty() {
            tracing::warn!(
                duplicates = ?tree.duplicates,
                "document tree declares paths more than once; first declaration wins"
            );
        }
        tree
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let root: DocumentTreeNode =
            serde_json::from_str(json).context("Failed to parse document tree JSON")?;
        Ok(Self::from_root(root))
    }

    /// Read and index a tree JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document tree {}", path.display()))?;
        let tree = Self::from_json(&content)
            .with_context(|| format!("Invalid document tree {}", path.display()))?;
        tracing::debug!(nodes = tree.len(), path = %path.display(), "loaded document tree");
        Ok(tree)
    }

    fn push(&mut self, node: DocumentTreeNode, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        let DocumentTreeNode {
            path,
            title,
            index,
            children,
        } = node;

        for key in path.iter().chain(index.iter().map(|index| &index.path)) {
            if self.by_path.contains_key(key) {
                self.duplicates.push(key.clone());
            } else {
                self.by_path.insert(key.clone(), id);
            }
        }

        self.nodes.push(TreeNode {
            id,
            path,
            title,
            index,
            parent,
            children: children.as_ref().map(|_| Vec::new()),
        });

        if let Some(children) = children {
            let mut child_ids = Vec::with_capacity(children.len());
            for child in children {
                child_ids.push(self.push(child, Some(id)));
            }
            self.nodes[id].children = Some(child_ids);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes.first()
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn children_of<'a>(&'a self, node: &'a TreeNode) -> impl Iterator<Item = &'a TreeNode> + 'a {
        node.children().iter().filter_map(|&id| self.nodes.get(id))
    }

    /// The node declaring `target` (as its path or index path) and its parent.
    pub fn find_node_and_parent(&self, target: &str) -> Option<Located<'_>> {
        let node = self.nodes.get(*self.by_path.get(target)?)?;
        let parent = node.parent.and_then(|id| self.nodes.get(id));
        Some(Located { node, parent })
    }

    /// Every leaf file path and every index path, depth-first, deduplicated.
    pub fn collect_all_paths(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        // Arena order is depth-first pre-order.
        for node in &self.nodes {
            if let Some(index) = node.index_path() {
                if seen.insert(index) {
                    paths.push(index.to_string());
                }
            }
            if node.is_leaf() {
                if let Some(path) = node.path.as_deref() {
                    if seen.insert(path) {
                        paths.push(path.to_string());
                    }
                }
            }
        }
        paths
    }

    /// Documents in sidebar reading order (what previous/next links walk).
    pub fn reading_order(&self) -> Vec<String> {
        self.collect_all_paths()
    }

    /// Previous and next documents around `path` in reading order.
    pub fn neighbours(&self, path: &str) -> (Option<String>, Option<String>) {
        let order = self.reading_order();
        let Some(position) = order.iter().position(|p| p == path) else {
            return (None, None);
        };
        let previous = position
            .checked_sub(1)
            .and_then(|i| order.get(i))
            .cloned();
        let next = order.get(position + 1).cloned();
        (previous, next)
    }

    /// Paths declared more than once, in the order the repeats were found.
    pub fn duplicate_paths(&self) -> &[String] {
        &self.duplicates
    }
}

/// Folder owning an index document: `guide/README.md` → `guide`.
pub fn folder_path_of(index_path: &str) -> String {
    let trimmed = index_path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => trimmed[..pos].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn index(path: &str) -> Option<IndexDoc> {
        Some(IndexDoc {
            path: path.to_string(),
            title: String::new(),
        })
    }

    /// root → guide (a.md, b.md, index guide/README.md)
    pub(crate) fn guide_tree() -> DocumentTree {
        DocumentTree::from_root(DocumentTreeNode::folder(
            None,
            "Docs",
            None,
            vec![DocumentTreeNode::folder(
                Some("guide".into()),
                "Guide",
                index("guide/README.md"),
                vec![
                    DocumentTreeNode::file("guide/a.md", "A"),
                    DocumentTreeNode::file("guide/b.md", "B"),
                ],
            )],
        ))
    }

    /// A larger tree with nested folders and a root index.
    pub(crate) fn handbook_tree() -> DocumentTree {
        DocumentTree::from_json(
            r#"{
                "title": "Handbook",
                "index": { "path": "README.md", "title": "Home" },
                "children": [
                    { "path": "intro.md", "title": "Intro" },
                    {
                        "path": "guide",
                        "title": "Guide",
                        "index": { "path": "guide/README.md", "title": "Guide" },
                        "children": [
                            { "path": "guide/a.md", "title": "A" },
                            { "path": "guide/b.md", "title": "B" },
                            { "path": "guide/c.md", "title": "C" },
                            {
                                "path": "guide/advanced",
                                "title": "Advanced",
                                "index": { "path": "guide/advanced/README.md", "title": "Advanced" },
                                "children": [
                                    { "path": "guide/advanced/x.md", "title": "X" }
                                ]
                            },
                            {
                                "path": "guide/api",
                                "title": "API",
                                "index": { "path": "guide/api/index.md", "title": "API" }
                            },
                            { "path": "guide/d.md", "title": "D" }
                        ]
                    },
                    { "path": "faq.md", "title": "FAQ" }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn finds_file_and_its_folder() {
        let tree = guide_tree();
        let located = tree.find_node_and_parent("guide/a.md").unwrap();
        assert_eq!(located.node.path.as_deref(), Some("guide/a.md"));
        assert!(located.node.is_leaf());
        let parent = located.parent.unwrap();
        assert_eq!(parent.path.as_deref(), Some("guide"));
        assert_eq!(parent.index_path(), Some("guide/README.md"));
    }

    #[test]
    fn index_path_resolves_to_the_folder_node() {
        let tree = guide_tree();
        let located = tree.find_node_and_parent("guide/README.md").unwrap();
        assert_eq!(located.node.path.as_deref(), Some("guide"));
        assert!(located.node.is_folder());
        let root = located.parent.unwrap();
        assert_eq!(root.title, "Docs");
        assert!(root.parent.is_none());
    }

    #[test]
    fn unknown_path_and_root_have_no_parent() {
        let tree = handbook_tree();
        assert!(tree.find_node_and_parent("nope.md").is_none());
        let root = tree.find_node_and_parent("README.md").unwrap();
        assert!(root.parent.is_none());
    }

    #[test]
    fn first_declaration_wins_on_duplicates() {
        let tree = DocumentTree::from_root(DocumentTreeNode::folder(
            None,
            "root",
            None,
            vec![
                DocumentTreeNode::folder(
                    Some("one".into()),
                    "One",
                    None,
                    vec![DocumentTreeNode::file("dup.md", "first")],
                ),
                DocumentTreeNode::folder(
                    Some("two".into()),
                    "Two",
                    None,
                    vec![DocumentTreeNode::file("dup.md", "second")],
                ),
            ],
        ));
        let located = tree.find_node_and_parent("dup.md").unwrap();
        assert_eq!(located.node.title, "first");
        assert_eq!(located.parent.unwrap().path.as_deref(), Some("one"));
        assert_eq!(tree.duplicate_paths(), ["dup.md".to_string()]);
        assert_eq!(tree.collect_all_paths(), vec!["dup.md"]);
    }

    #[test]
    fn collects_files_and_index_paths_in_declared_order() {
        let tree = handbook_tree();
        assert_eq!(
            tree.collect_all_paths(),
            vec![
                "README.md",
                "intro.md",
                "guide/README.md",
                "guide/a.md",
                "guide/b.md",
                "guide/c.md",
                "guide/advanced/README.md",
                "guide/advanced/x.md",
                "guide/api/index.md",
                "guide/d.md",
                "faq.md",
            ]
        );
    }

    #[test]
    fn empty_children_make_a_folder_not_a_file() {
        let tree = DocumentTree::from_json(
            r#"{"title":"root","children":[{"path":"empty","title":"Empty","children":[]}]}"#,
        )
        .unwrap();
        let located = tree.find_node_and_parent("empty").unwrap();
        assert!(located.node.is_folder());
        assert!(tree.collect_all_paths().is_empty());
    }

    #[test]
    fn neighbours_follow_reading_order() {
        let tree = handbook_tree();
        assert_eq!(
            tree.neighbours("guide/README.md"),
            (Some("intro.md".into()), Some("guide/a.md".into()))
        );
        assert_eq!(tree.neighbours("README.md"), (None, Some("intro.md".into())));
        assert_eq!(tree.neighbours("faq.md"), (Some("guide/d.md".into()), None));
        assert_eq!(tree.neighbours("missing.md"), (None, None));
    }

    #[test]
    fn folder_path_strips_index_segment() {
        assert_eq!(folder_path_of("guide/README.md"), "guide");
        assert_eq!(folder_path_of("guide/advanced/index.md"), "guide/advanced");
        assert_eq!(folder_path_of("README.md"), "");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(DocumentTree::from_json("{\"children\": 3}").is_err());
    }

    #[test]
    fn load_reads_tree_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tree.json");
        std::fs::write(&path, r#"{"title":"root","children":[{"path":"a.md","title":"A"}]}"#)
            .unwrap();
        let tree = DocumentTree::load(&path).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(DocumentTree::load(&tmp.path().join("missing.json")).is_err());
    }
}
