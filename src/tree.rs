//! Virtual project trees and their conversion into the runtime's mount shape.
//!
//! A project is handed to the manager as a list of [`VirtualFileNode`]s.
//! The runtime's mount primitive expects a nested map instead:
//!
//! ```json
//! { "src": { "directory": { "main.js": { "file": { "contents": "..." } } } } }
//! ```
//!
//! [`MountTree::from_nodes`] performs that conversion as a pure function.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    #[serde(alias = "folder")]
    Directory,
}

/// One file or directory of a project's source tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFileNode {
    pub name: String,
    #[serde(alias = "type")]
    pub kind: NodeKind,
    /// Absolute, slash-separated
    #[serde(default)]
    pub path: String,
    /// Present only for files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Present only for directories
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<VirtualFileNode>,
}

impl VirtualFileNode {
    pub fn file(path: &str, content: impl Into<String>) -> Self {
        Self {
            name: base_name(path).to_string(),
            kind: NodeKind::File,
            path: path.to_string(),
            content: Some(content.into()),
            children: Vec::new(),
        }
    }

    pub fn directory(path: &str, children: Vec<VirtualFileNode>) -> Self {
        Self {
            name: base_name(path).to_string(),
            kind: NodeKind::Directory,
            path: path.to_string(),
            content: None,
            children,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("invalid node name {name:?} under {parent}")]
    InvalidName { parent: String, name: String },

    #[error("duplicate entry {name:?} under {parent}")]
    DuplicateName { parent: String, name: String },
}

/// Nested name -> entry map accepted by the runtime's mount primitive
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct MountTree(pub BTreeMap<String, MountEntry>);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountEntry {
    File { contents: String },
    Directory(MountTree),
}

impl MountTree {
    /// Convert an ordered node list, rejecting trees the runtime could not
    /// represent faithfully. Nothing is mounted when this fails.
    pub fn from_nodes(nodes: &[VirtualFileNode]) -> Result<Self, TreeError> {
        Self::from_level("/", nodes)
    }

    fn from_level(parent: &str, nodes: &[VirtualFileNode]) -> Result<Self, TreeError> {
        let mut entries = BTreeMap::new();
        for node in nodes {
            if !is_valid_name(&node.name) {
                return Err(TreeError::InvalidName {
                    parent: parent.to_string(),
                    name: node.name.clone(),
                });
            }

            let entry = match node.kind {
                NodeKind::File => MountEntry::File {
                    contents: node.content.clone().unwrap_or_default(),
                },
                NodeKind::Directory => {
                    let path = join(parent, &node.name);
                    MountEntry::Directory(Self::from_level(&path, &node.children)?)
                }
            };

            if entries.insert(node.name.clone(), entry).is_some() {
                return Err(TreeError::DuplicateName {
                    parent: parent.to_string(),
                    name: node.name.clone(),
                });
            }
        }
        Ok(Self(entries))
    }

    pub fn get(&self, name: &str) -> Option<&MountEntry> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of file leaves in the whole tree
    pub fn file_count(&self) -> usize {
        self.0
            .values()
            .map(|entry| match entry {
                MountEntry::File { .. } => 1,
                MountEntry::Directory(dir) => dir.file_count(),
            })
            .sum()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> Vec<VirtualFileNode> {
        vec![
            VirtualFileNode::file("/package.json", "{}"),
            VirtualFileNode::directory(
                "/src",
                vec![
                    VirtualFileNode::file("/src/main.js", "console.log(1)"),
                    VirtualFileNode::directory("/src/empty", vec![]),
                ],
            ),
        ]
    }

    #[test]
    fn single_file_shape() {
        let nodes = vec![VirtualFileNode::file("/package.json", "{}")];
        let tree = MountTree::from_nodes(&nodes).unwrap();
        assert_eq!(
            serde_json::to_value(&tree).unwrap(),
            json!({ "package.json": { "file": { "contents": "{}" } } })
        );
    }

    #[test]
    fn nested_shape() {
        let tree = MountTree::from_nodes(&project()).unwrap();
        assert_eq!(
            serde_json::to_value(&tree).unwrap(),
            json!({
                "package.json": { "file": { "contents": "{}" } },
                "src": { "directory": {
                    "empty": { "directory": {} },
                    "main.js": { "file": { "contents": "console.log(1)" } }
                } }
            })
        );
        assert_eq!(tree.file_count(), 2);
    }

    #[test]
    fn conversion_is_repeatable() {
        let nodes = project();
        assert_eq!(
            MountTree::from_nodes(&nodes).unwrap(),
            MountTree::from_nodes(&nodes).unwrap()
        );
    }

    #[test]
    fn missing_content_becomes_empty() {
        let mut node = VirtualFileNode::file("/README.md", "");
        node.content = None;
        let tree = MountTree::from_nodes(&[node]).unwrap();
        assert_eq!(
            tree.get("README.md"),
            Some(&MountEntry::File {
                contents: String::new()
            })
        );
    }

    #[test]
    fn rejects_duplicate_siblings() {
        let nodes = vec![
            VirtualFileNode::directory(
                "/src",
                vec![
                    VirtualFileNode::file("/src/a.js", "1"),
                    VirtualFileNode::file("/src/a.js", "2"),
                ],
            ),
        ];
        assert_eq!(
            MountTree::from_nodes(&nodes),
            Err(TreeError::DuplicateName {
                parent: "/src".to_string(),
                name: "a.js".to_string()
            })
        );
    }

    #[test]
    fn rejects_path_like_names() {
        let mut node = VirtualFileNode::file("/x", "");
        node.name = "../etc".to_string();
        assert!(matches!(
            MountTree::from_nodes(&[node]),
            Err(TreeError::InvalidName { .. })
        ));
    }

    #[test]
    fn accepts_editor_shape() {
        let nodes: Vec<VirtualFileNode> = serde_json::from_value(json!([
            { "name": "app", "type": "folder", "path": "/app", "children": [
                { "name": "page.tsx", "type": "file", "path": "/app/page.tsx", "content": "x" }
            ] }
        ]))
        .unwrap();
        assert!(nodes[0].is_dir());
        assert_eq!(MountTree::from_nodes(&nodes).unwrap().file_count(), 1);
    }
}
