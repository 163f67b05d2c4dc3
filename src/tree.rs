//! Browsable file tree of a committed project.
//!
//! Built from the flat list of relative paths a backend reports. Nodes live
//! in one `Vec` and refer to each other by index, so construction and
//! traversal are iterative and depth is bounded only by memory. A parent
//! always has a lower index than its children.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub name: String,
    pub kind: NodeKind,
    /// `<project>/<relative path>`; the root's path is the project name.
    pub path: String,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FileTree {
    nodes: Vec<FileNode>,
}

impl FileTree {
    pub const ROOT: usize = 0;

    /// Build a tree from `/`-separated relative file paths.
    pub fn from_paths<I, S>(project: &str, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut nodes = vec![FileNode {
            name: project.to_string(),
            kind: NodeKind::Folder,
            path: project.to_string(),
            children: Vec::new(),
        }];
        let mut index: HashMap<String, usize> = HashMap::new();

        for path in paths {
            let parts: Vec<&str> = path
                .as_ref()
                .split('/')
                .filter(|p| !p.is_empty())
                .collect();
            let mut parent = Self::ROOT;
            let mut current = String::new();

            for (i, part) in parts.iter().enumerate() {
                if !current.is_empty() {
                    current.push('/');
                }
                current.push_str(part);
                let kind = if i + 1 == parts.len() {
                    NodeKind::File
                } else {
                    NodeKind::Folder
                };

                parent = match index.get(&current) {
                    Some(&existing) => existing,
                    None => {
                        let id = nodes.len();
                        nodes.push(FileNode {
                            name: part.to_string(),
                            kind,
                            path: format!("{}/{}", project, current),
                            children: Vec::new(),
                        });
                        nodes[parent].children.push(id);
                        index.insert(current.clone(), id);
                        id
                    }
                };
            }
        }

        // Folders before files, then by name.
        let order: Vec<(NodeKind, String)> =
            nodes.iter().map(|n| (n.kind, n.name.clone())).collect();
        for node in &mut nodes {
            node.children.sort_by(|&a, &b| order[a].cmp(&order[b]));
        }

        Self { nodes }
    }

    pub fn node(&self, id: usize) -> &FileNode {
        &self.nodes[id]
    }

    pub fn root(&self) -> &FileNode {
        self.node(Self::ROOT)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().children.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind == NodeKind::File).count()
    }

    /// Nested JSON: `{ name, type, path, children? }`.
    pub fn to_json(&self) -> Value {
        // Children always have higher indices than their parent, so a
        // reverse sweep sees every child before its parent.
        let mut built: Vec<Option<Value>> = vec![None; self.nodes.len()];
        for id in (0..self.nodes.len()).rev() {
            let node = &self.nodes[id];
            let mut value = json!({
                "name": node.name,
                "type": node.kind,
                "path": node.path,
            });
            if !node.children.is_empty() {
                let children: Vec<Value> = node
                    .children
                    .iter()
                    .filter_map(|&c| built[c].take())
                    .collect();
                value["children"] = Value::Array(children);
            }
            built[id] = Some(value);
        }
        built[Self::ROOT].take().unwrap_or(Value::Null)
    }

    /// Indented plain-text rendering, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(Self::ROOT, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = &self.nodes[id];
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.name);
            if node.kind == NodeKind::Folder {
                out.push('/');
            }
            out.push('\n');
            for &child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_structure() {
        let tree = FileTree::from_paths("demo", ["src/main/App.java", "README.md", "src/Util.java"]);
        assert_eq!(tree.file_count(), 3);

        let root = tree.root();
        assert_eq!(root.path, "demo");
        let names: Vec<&str> = root
            .children
            .iter()
            .map(|&c| tree.node(c).name.as_str())
            .collect();
        assert_eq!(names, vec!["src", "README.md"]);

        let src = tree.node(root.children[0]);
        assert_eq!(src.kind, NodeKind::Folder);
        assert_eq!(src.path, "demo/src");
        let src_names: Vec<&str> = src
            .children
            .iter()
            .map(|&c| tree.node(c).name.as_str())
            .collect();
        assert_eq!(src_names, vec!["main", "Util.java"]);
    }

    #[test]
    fn json_shape() {
        let tree = FileTree::from_paths("demo", ["a/b.txt"]);
        let json = tree.to_json();
        assert_eq!(json["name"], "demo");
        assert_eq!(json["type"], "folder");
        assert_eq!(json["children"][0]["path"], "demo/a");
        assert_eq!(json["children"][0]["children"][0]["type"], "file");
        assert!(json["children"][0]["children"][0].get("children").is_none());
    }

    #[test]
    fn deep_paths_do_not_recurse() {
        let deep = (0..1_000).map(|i| format!("d{}", i)).collect::<Vec<_>>().join("/");
        let tree = FileTree::from_paths("demo", [format!("{}/leaf.txt", deep)]);
        assert_eq!(tree.len(), 1_002);
        assert!(tree.render().ends_with("leaf.txt\n"));
        let _ = tree.to_json();
    }

    #[test]
    fn render_indents() {
        let tree = FileTree::from_paths("demo", ["src/a.rs", "b.txt"]);
        assert_eq!(tree.render(), "demo/\n  src/\n    a.rs\n  b.txt\n");
    }

    #[test]
    fn empty_project() {
        let tree = FileTree::from_paths("demo", Vec::<String>::new());
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 1);
    }
}
