//! Rojo-compatible `sourcemap.json` generation and maintenance.
//!
//! The sourcemap mirrors the in-memory tree with `filePaths` on script nodes
//! plus the Azul extensions `guid` (per node) and `_azul` (root metadata
//! stamped by pack). Incremental operations return
//! [`RegenerateRequested`] on any trouble; the service wrappers fall back to
//! a full rebuild, so the file on disk is always recoverable.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs_writer::FileMapping;
use crate::message::Guid;
use crate::tree::{SyncTree, TreeNode};

/// Root metadata written by the `pack` command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackMeta {
    pub pack_version: u32,
    pub packed_at: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourcemapNode {
    pub name: String,
    pub class_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Guid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SourcemapNode>,

    #[serde(
        rename = "_azul",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub azul: Option<PackMeta>,
}

impl SourcemapNode {
    pub fn new_root() -> SourcemapNode {
        SourcemapNode {
            name: "Game".to_owned(),
            class_name: "DataModel".to_owned(),
            guid: None,
            file_paths: Vec::new(),
            properties: None,
            attributes: None,
            children: Vec::new(),
            azul: None,
        }
    }

    /// Whether this node carries nothing worth keeping once its children
    /// are gone. Used for ancestor collapse after a prune.
    fn is_hollow(&self) -> bool {
        self.children.is_empty()
            && self.file_paths.is_empty()
            && self.properties.is_none()
            && self.attributes.is_none()
    }
}

#[derive(Debug, Error)]
pub enum SourcemapError {
    #[error("sourcemap at {path} is corrupted")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An incremental update could not be applied safely; the caller should
/// rebuild the whole file from the tree.
#[derive(Debug, Error)]
#[error("incremental sourcemap update abandoned: {reason}")]
pub struct RegenerateRequested {
    pub reason: String,
}

impl RegenerateRequested {
    fn new(reason: impl Into<String>) -> Self {
        RegenerateRequested {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

pub struct SourcemapService {
    output_path: PathBuf,
    /// Base for `filePaths` entries; the process working directory in
    /// production, injectable for tests.
    relative_base: PathBuf,
}

impl SourcemapService {
    pub fn new(output_path: &Path) -> Self {
        let relative_base =
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_relative_base(output_path, &relative_base)
    }

    pub fn with_relative_base(output_path: &Path, relative_base: &Path) -> Self {
        SourcemapService {
            output_path: output_path.to_owned(),
            relative_base: relative_base.to_owned(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Full reconstruction from the tree. Services are the sorted children
    /// of the synthetic root, or every path-length-1 node if the tree has no
    /// root yet. A visited set breaks cycles that a malformed snapshot might
    /// smuggle in.
    pub fn generate(
        &self,
        tree: &SyncTree,
        mappings: &HashMap<Guid, FileMapping>,
    ) -> SourcemapNode {
        let mut root = SourcemapNode::new_root();
        let mut visited = HashSet::new();

        let mut service_nodes: Vec<&TreeNode> = match tree.root() {
            Some(root_node) => root_node
                .children
                .iter()
                .filter_map(|guid| tree.get_node(guid))
                .collect(),
            None => tree.get_all_nodes().filter(|n| n.path.len() == 1).collect(),
        };
        service_nodes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        for service in service_nodes {
            if let Some(child) = self.build_subtree(tree, &service.guid, mappings, &mut visited)
            {
                root.children.push(child);
            }
        }

        root
    }

    fn build_subtree(
        &self,
        tree: &SyncTree,
        guid: &str,
        mappings: &HashMap<Guid, FileMapping>,
        visited: &mut HashSet<Guid>,
    ) -> Option<SourcemapNode> {
        if !visited.insert(guid.to_owned()) {
            log::warn!("Cycle detected at {guid} while generating sourcemap; truncating");
            return None;
        }

        let node = tree.get_node(guid)?;

        let file_paths = match mappings.get(guid) {
            Some(mapping) => vec![self.relative_file_path(&mapping.file_path)],
            None => Vec::new(),
        };

        let mut children_nodes: Vec<&TreeNode> = node
            .children
            .iter()
            .filter_map(|child| tree.get_node(child))
            .collect();
        children_nodes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let children = children_nodes
            .iter()
            .filter_map(|child| self.build_subtree(tree, &child.guid, mappings, visited))
            .collect();

        Some(SourcemapNode {
            name: node.name.clone(),
            class_name: node.class_name.clone(),
            guid: Some(node.guid.clone()),
            file_paths,
            properties: None,
            attributes: None,
            children,
            azul: None,
        })
    }

    /// Forward-slashed path relative to the service's base directory.
    fn relative_file_path(&self, path: &Path) -> String {
        let relative = pathdiff::diff_paths(path, &self.relative_base)
            .unwrap_or_else(|| path.to_owned());
        forward_slashed(&relative)
    }

    pub fn write(&self, root: &SourcemapNode) -> Result<(), SourcemapError> {
        if let Some(parent) = self.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(root)
            .expect("sourcemap nodes always serialize");
        fs_err::write(&self.output_path, json)?;
        Ok(())
    }

    /// Reads the existing sourcemap. A missing file is `Ok(None)`; a file
    /// that fails to parse is [`SourcemapError::Corrupted`].
    pub fn load(&self) -> Result<Option<SourcemapNode>, SourcemapError> {
        let contents = match fs_err::read_to_string(&self.output_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| SourcemapError::Corrupted {
                path: self.output_path.clone(),
                source,
            })
    }

    /// Regenerates the file from scratch. The safety net under every
    /// incremental failure.
    pub fn regenerate(
        &self,
        tree: &SyncTree,
        mappings: &HashMap<Guid, FileMapping>,
    ) -> Result<(), SourcemapError> {
        let root = self.generate(tree, mappings);
        self.write(&root)
    }

    /// Rebuilds one subtree in place. `old_path` prunes the previous
    /// location first when the node moved; `is_new` forces append semantics
    /// so same-name siblings are never merged.
    pub fn upsert_subtree(
        &self,
        guid: &str,
        tree: &SyncTree,
        mappings: &HashMap<Guid, FileMapping>,
        old_path: Option<&[String]>,
        is_new: bool,
    ) -> Result<(), RegenerateRequested> {
        let node = tree
            .get_node(guid)
            .ok_or_else(|| RegenerateRequested::new(format!("node {guid} not in tree")))?;

        let mut root = match self.load() {
            Ok(Some(root)) => root,
            Ok(None) => SourcemapNode::new_root(),
            Err(err) => return Err(RegenerateRequested::new(err.to_string())),
        };

        if let Some(old_path) = old_path {
            if !old_path.is_empty() {
                // No ancestor collapse here: the node is about to be
                // re-inserted, and collapsing would churn sibling order.
                remove_at_path(&mut root, old_path, None, Some(guid), false);
            }
        }

        let mut visited = HashSet::new();
        let subtree = self
            .build_subtree(tree, guid, mappings, &mut visited)
            .ok_or_else(|| RegenerateRequested::new("subtree build failed"))?;

        // Walk the ancestor chain from the service down to the direct
        // parent, creating structural entries where the file has none.
        let ancestors = ancestor_chain(tree, node)?;
        let mut cursor = &mut root;
        for ancestor in &ancestors {
            cursor = find_or_insert_child(cursor, ancestor);
        }

        let slot = cursor.children.iter().position(|child| {
            child.guid.as_deref() == Some(guid)
                || (!is_new
                    && child.guid.is_none()
                    && child.name == subtree.name
                    && child.class_name == subtree.class_name)
        });

        match slot {
            Some(index) => cursor.children[index] = subtree,
            None => cursor.children.push(subtree),
        }

        self.write(&root)
            .map_err(|err| RegenerateRequested::new(err.to_string()))
    }

    /// Removes the entry at `path_segments`, preferring a guid match, then
    /// class name, then name alone. Hollow ancestors are collapsed. Returns
    /// whether anything was removed.
    pub fn prune_path(
        &self,
        path_segments: &[String],
        target_class: Option<&str>,
        target_guid: Option<&str>,
    ) -> Result<bool, RegenerateRequested> {
        if path_segments.is_empty() {
            return Ok(false);
        }

        let mut root = match self.load() {
            Ok(Some(root)) => root,
            Ok(None) => return Ok(false),
            Err(err) => return Err(RegenerateRequested::new(err.to_string())),
        };

        let removed = remove_at_path(&mut root, path_segments, target_class, target_guid, true);

        if removed {
            self.write(&root)
                .map_err(|err| RegenerateRequested::new(err.to_string()))?;
        }
        Ok(removed)
    }

    /// Incremental upsert with automatic fallback to full regeneration.
    pub fn upsert_or_regenerate(
        &self,
        guid: &str,
        tree: &SyncTree,
        mappings: &HashMap<Guid, FileMapping>,
        old_path: Option<&[String]>,
        is_new: bool,
    ) {
        if let Err(err) = self.upsert_subtree(guid, tree, mappings, old_path, is_new) {
            log::warn!("{err}; regenerating sourcemap");
            if let Err(err) = self.regenerate(tree, mappings) {
                log::error!("Failed to regenerate sourcemap: {err}");
            }
        }
    }

    /// Incremental prune with automatic fallback to full regeneration.
    pub fn prune_or_regenerate(
        &self,
        path_segments: &[String],
        target_class: Option<&str>,
        target_guid: Option<&str>,
        tree: &SyncTree,
        mappings: &HashMap<Guid, FileMapping>,
    ) {
        if let Err(err) = self.prune_path(path_segments, target_class, target_guid) {
            log::warn!("{err}; regenerating sourcemap");
            if let Err(err) = self.regenerate(tree, mappings) {
                log::error!("Failed to regenerate sourcemap: {err}");
            }
        }
    }

    /// Reports `filePaths` entries that do not exist on disk.
    pub fn validate(&self, root: &SourcemapNode) -> Validation {
        let mut errors = Vec::new();
        self.validate_node(root, &mut errors);
        Validation {
            valid: errors.is_empty(),
            errors,
        }
    }

    fn validate_node(&self, node: &SourcemapNode, errors: &mut Vec<String>) {
        for file_path in &node.file_paths {
            let resolved = self.relative_base.join(file_path);
            if !resolved.is_file() {
                errors.push(format!(
                    "{} references missing file {}",
                    node.name, file_path
                ));
            }
        }
        for child in &node.children {
            self.validate_node(child, errors);
        }
    }
}

/// Ancestor tree nodes from the service down to the node's direct parent,
/// excluding the synthetic root and the node itself.
fn ancestor_chain<'a>(
    tree: &'a SyncTree,
    node: &TreeNode,
) -> Result<Vec<&'a TreeNode>, RegenerateRequested> {
    let mut chain = Vec::new();
    let mut current = node.parent.clone();

    while let Some(guid) = current {
        let parent = tree
            .get_node(&guid)
            .ok_or_else(|| RegenerateRequested::new(format!("ancestor {guid} missing")))?;
        if parent.path.is_empty() {
            break;
        }
        chain.push(parent);
        current = parent.parent.clone();
    }

    chain.reverse();
    Ok(chain)
}

/// Finds the child matching `node` (guid first, then name + class), creating
/// a structural entry when absent. Returns a cursor into the child.
fn find_or_insert_child<'a>(
    parent: &'a mut SourcemapNode,
    node: &TreeNode,
) -> &'a mut SourcemapNode {
    let index = parent.children.iter().position(|child| {
        child.guid.as_deref() == Some(node.guid.as_str())
            || (child.guid.is_none()
                && child.name == node.name
                && child.class_name == node.class_name)
    });

    let index = match index {
        Some(index) => index,
        None => {
            parent.children.push(SourcemapNode {
                name: node.name.clone(),
                class_name: node.class_name.clone(),
                guid: Some(node.guid.clone()),
                file_paths: Vec::new(),
                properties: None,
                attributes: None,
                children: Vec::new(),
                azul: None,
            });
            parent.children.len() - 1
        }
    };

    &mut parent.children[index]
}

/// Depth-first removal along `segments`. The final segment prefers a guid
/// match, then class name, then bare name. With `collapse`, ancestors left
/// hollow by the removal are collapsed on unwind.
fn remove_at_path(
    node: &mut SourcemapNode,
    segments: &[String],
    target_class: Option<&str>,
    target_guid: Option<&str>,
    collapse: bool,
) -> bool {
    let (segment, rest) = match segments.split_first() {
        Some(split) => split,
        None => return false,
    };

    if rest.is_empty() {
        let index = node
            .children
            .iter()
            .position(|child| {
                target_guid.is_some() && child.guid.as_deref() == target_guid
            })
            .or_else(|| {
                target_class.and_then(|class| {
                    node.children
                        .iter()
                        .position(|child| child.name == *segment && child.class_name == class)
                })
            })
            .or_else(|| {
                node.children
                    .iter()
                    .position(|child| child.name == *segment)
            });

        if let Some(index) = index {
            node.children.remove(index);
            return true;
        }
        return false;
    }

    // Several children can share the segment name; descend into each until
    // one of them contains the target. Only the branch that held the target
    // collapses when hollow; unrelated siblings are untouched.
    for index in 0..node.children.len() {
        if node.children[index].name != *segment {
            continue;
        }
        if remove_at_path(&mut node.children[index], rest, target_class, target_guid, collapse) {
            if collapse && node.children[index].is_hollow() {
                node.children.remove(index);
            }
            return true;
        }
    }

    false
}

fn forward_slashed(path: &Path) -> String {
    let display = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        display.into_owned()
    } else {
        display.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
