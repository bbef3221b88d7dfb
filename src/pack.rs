//! Overlay of instance properties and attributes onto the sourcemap.
//!
//! The `pack` command asks the plugin for a full snapshot including
//! properties, rebuilds the sourcemap shape from it, and merges the result
//! with whatever `filePaths` the existing sourcemap already carries. All
//! matching prefers guid; `(path, className)` buckets with an advancing
//! cursor handle entries that predate guid stamping, including non-unique
//! keys from same-name siblings.

use std::collections::{HashMap, HashSet};

use crate::message::{Guid, InstanceData};
use crate::sourcemap::{PackMeta, SourcemapNode, SourcemapService};
use crate::tree::SyncTree;

pub const PACK_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackMode {
    Full,
    ScriptsOnly,
}

impl PackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PackMode::Full => "full",
            PackMode::ScriptsOnly => "scripts",
        }
    }
}

/// A flattened view of one existing sourcemap entry, used to carry
/// `filePaths` over into the regenerated shape.
struct ExistingEntry {
    path: Vec<String>,
    class_name: String,
    guid: Option<Guid>,
    file_paths: Vec<String>,
    consumed: bool,
}

/// Builds the packed sourcemap from a property-bearing snapshot.
///
/// `existing` is the current sourcemap (if any) whose `filePaths` survive
/// the regeneration; `packed_at` is an ISO-8601 stamp supplied by the
/// caller.
pub fn build_packed_sourcemap(
    service: &SourcemapService,
    snapshot: &[InstanceData],
    existing: Option<&SourcemapNode>,
    mode: PackMode,
    packed_at: String,
) -> SourcemapNode {
    let mut tree = SyncTree::new();
    tree.apply_full_snapshot(snapshot);

    let mut root = service.generate(&tree, &HashMap::new());

    if let Some(existing) = existing {
        let mut entries = Vec::new();
        flatten_existing(existing, &mut Vec::new(), &mut entries);
        restore_file_paths(&mut root, &mut entries);
    }

    overlay_instance_state(&mut root, snapshot);

    root.azul = Some(PackMeta {
        pack_version: PACK_VERSION,
        packed_at,
        mode: mode.as_str().to_owned(),
    });

    root
}

fn flatten_existing(
    node: &SourcemapNode,
    path: &mut Vec<String>,
    out: &mut Vec<ExistingEntry>,
) {
    for child in &node.children {
        path.push(child.name.clone());
        if !child.file_paths.is_empty() {
            out.push(ExistingEntry {
                path: path.clone(),
                class_name: child.class_name.clone(),
                guid: child.guid.clone(),
                file_paths: child.file_paths.clone(),
                consumed: false,
            });
        }
        flatten_existing(child, path, out);
        path.pop();
    }
}

/// Copies `filePaths` from the old sourcemap into the regenerated shape.
/// Pass one binds by guid; pass two binds leftovers by `(path, className)`,
/// consuming bucket entries front to back so same-keyed siblings each get
/// their own paths.
fn restore_file_paths(root: &mut SourcemapNode, entries: &mut Vec<ExistingEntry>) {
    let mut by_guid: HashMap<Guid, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(guid) = &entry.guid {
            by_guid.entry(guid.clone()).or_insert(index);
        }
    }

    restore_by_guid(root, entries, &by_guid);

    let mut buckets: HashMap<(Vec<String>, String), Vec<usize>> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if !entry.consumed {
            buckets
                .entry((entry.path.clone(), entry.class_name.clone()))
                .or_default()
                .push(index);
        }
    }

    restore_by_key(root, &mut Vec::new(), entries, &mut buckets);
}

fn restore_by_guid(
    node: &mut SourcemapNode,
    entries: &mut [ExistingEntry],
    by_guid: &HashMap<Guid, usize>,
) {
    for child in &mut node.children {
        if child.file_paths.is_empty() {
            if let Some(&index) = child.guid.as_ref().and_then(|guid| by_guid.get(guid)) {
                if !entries[index].consumed {
                    child.file_paths = entries[index].file_paths.clone();
                    entries[index].consumed = true;
                }
            }
        }
        restore_by_guid(child, entries, by_guid);
    }
}

fn restore_by_key(
    node: &mut SourcemapNode,
    path: &mut Vec<String>,
    entries: &mut [ExistingEntry],
    buckets: &mut HashMap<(Vec<String>, String), Vec<usize>>,
) {
    for child in &mut node.children {
        path.push(child.name.clone());
        if child.file_paths.is_empty() {
            let key = (path.clone(), child.class_name.clone());
            if let Some(bucket) = buckets.get_mut(&key) {
                // Advancing cursor: skip anything a guid match already took.
                while let Some(&index) = bucket.first() {
                    bucket.remove(0);
                    if !entries[index].consumed {
                        child.file_paths = entries[index].file_paths.clone();
                        entries[index].consumed = true;
                        break;
                    }
                }
            }
        }
        restore_by_key(child, path, entries, buckets);
        path.pop();
    }
}

/// Writes `properties` and `attributes` from the snapshot onto matching
/// sourcemap nodes: guid-keyed first, then `(path, className)` with a
/// used-guid set so no instance binds twice.
fn overlay_instance_state(root: &mut SourcemapNode, snapshot: &[InstanceData]) {
    let mut by_guid: HashMap<&str, &InstanceData> = HashMap::new();
    let mut by_key: HashMap<(&[String], &str), Vec<&InstanceData>> = HashMap::new();
    for data in snapshot {
        by_guid.insert(&data.guid, data);
        by_key
            .entry((data.path.as_slice(), data.class_name.as_str()))
            .or_default()
            .push(data);
    }

    let mut used = HashSet::new();
    overlay_node(root, &mut Vec::new(), &by_guid, &by_key, &mut used);
}

fn overlay_node(
    node: &mut SourcemapNode,
    path: &mut Vec<String>,
    by_guid: &HashMap<&str, &InstanceData>,
    by_key: &HashMap<(&[String], &str), Vec<&InstanceData>>,
    used: &mut HashSet<Guid>,
) {
    for child in &mut node.children {
        path.push(child.name.clone());

        let matched = child
            .guid
            .as_deref()
            .and_then(|guid| by_guid.get(guid).copied())
            .filter(|data| !used.contains(&data.guid))
            .or_else(|| {
                by_key
                    .get(&(path.as_slice(), child.class_name.as_str()))
                    .and_then(|candidates| {
                        candidates.iter().find(|data| !used.contains(&data.guid))
                    })
                    .copied()
            });

        if let Some(data) = matched {
            used.insert(data.guid.clone());
            child.properties = data
                .properties
                .as_ref()
                .map(|props| props.clone().into_iter().collect());
            child.attributes = data
                .attributes
                .as_ref()
                .map(|attrs| attrs.clone().into_iter().collect());
        }

        overlay_node(child, path, by_guid, by_key, used);
        path.pop();
    }
}
