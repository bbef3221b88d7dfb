//! Authoritative in-memory mirror of the Studio DataModel.
//!
//! The tree is an arena keyed by guid: nodes own nothing but their own data,
//! containment is the `children` guid sets plus a `parent` back-guid, and a
//! path index supports structural lookups. Same-name siblings are legal, so
//! path lookups that hit more than one candidate deliberately return nothing
//! instead of guessing.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::message::{is_script_class, Guid, InstanceData, ROOT_GUID};
use crate::multimap::MultiMap;

/// One mirrored instance. The node table in [`SyncTree`] is the authoritative
/// owner; `parent` and `children` are guid relations, never ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub guid: Guid,
    pub class_name: String,
    pub name: String,
    /// Segments from the root service down to this node, inclusive of the
    /// node's own name. Services have length 1; the synthetic root length 0.
    pub path: Vec<String>,
    pub parent: Option<Guid>,
    /// Script body, present only for script classes.
    pub source: Option<String>,
    pub children: HashSet<Guid>,
}

impl TreeNode {
    pub fn is_script(&self) -> bool {
        is_script_class(&self.class_name)
    }

    /// Sibling ordering used by every projected output.
    pub fn sort_key(&self) -> (&str, &str, &str) {
        (&self.name, &self.class_name, &self.guid)
    }
}

/// Result of an upsert, telling the session which mirrors need refreshing.
#[derive(Debug, Default, PartialEq)]
pub struct UpdateOutcome {
    pub is_new: bool,
    pub name_changed: bool,
    pub path_changed: bool,
    pub parent_changed: bool,
    pub prev_name: Option<String>,
    pub prev_path: Option<Vec<String>>,
}

/// A deleted node together with everything that was under it, so callers can
/// propagate file deletions for descendant scripts.
#[derive(Debug)]
pub struct RemovedSubtree {
    pub root: TreeNode,
    pub descendants: Vec<TreeNode>,
}

impl RemovedSubtree {
    pub fn script_guids(&self) -> Vec<Guid> {
        std::iter::once(&self.root)
            .chain(self.descendants.iter())
            .filter(|node| node.is_script())
            .map(|node| node.guid.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeStats {
    pub node_count: usize,
    pub script_count: usize,
    pub service_count: usize,
}

#[derive(Debug, Default)]
pub struct SyncTree {
    nodes: HashMap<Guid, TreeNode>,
    /// Path -> guids of every node sharing that path. Only non-empty paths
    /// are indexed; the synthetic root is reachable by guid alone.
    path_index: MultiMap<Vec<String>, Guid>,
    script_guids: HashSet<Guid>,
}

impl SyncTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The synthetic DataModel root, created on first need.
    fn ensure_root(&mut self) -> Guid {
        if !self.nodes.contains_key(ROOT_GUID) {
            self.nodes.insert(
                ROOT_GUID.to_owned(),
                TreeNode {
                    guid: ROOT_GUID.to_owned(),
                    class_name: "DataModel".to_owned(),
                    name: "Game".to_owned(),
                    path: Vec::new(),
                    parent: None,
                    source: None,
                    children: HashSet::new(),
                },
            );
        }
        ROOT_GUID.to_owned()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.path_index.clear();
        self.script_guids.clear();
    }

    /// Replaces all state from a plugin snapshot. Two passes: materialize
    /// every node first, then link children, so forward references between
    /// instances in the stream don't matter.
    pub fn apply_full_snapshot(&mut self, instances: &[InstanceData]) {
        self.clear();

        for data in instances {
            if self.nodes.contains_key(&data.guid) {
                log::warn!(
                    "Snapshot contains duplicate guid {}; keeping the later entry",
                    data.guid
                );
                self.unregister_node(&data.guid);
            }
            self.register_node(TreeNode {
                guid: data.guid.clone(),
                class_name: data.class_name.clone(),
                name: data.name.clone(),
                path: data.path.clone(),
                parent: None,
                source: data.source.clone(),
                children: HashSet::new(),
            });
        }

        for data in instances {
            let parent_guid = self.resolve_parent(data, None);
            self.attach(&data.guid, &parent_guid);
        }
    }

    /// Upsert keyed by guid. For existing nodes the subtree is unregistered
    /// from the path index, mutated in place, re-parented, descendant paths
    /// recalculated, and re-registered.
    pub fn update_instance(&mut self, data: &InstanceData) -> UpdateOutcome {
        if !self.nodes.contains_key(&data.guid) {
            let parent_guid = self.resolve_parent(data, None);
            let parent_path = self.nodes[&parent_guid].path.clone();

            let mut path = parent_path;
            path.push(data.name.clone());

            self.register_node(TreeNode {
                guid: data.guid.clone(),
                class_name: data.class_name.clone(),
                name: data.name.clone(),
                path,
                parent: None,
                source: data.source.clone(),
                children: HashSet::new(),
            });
            self.attach(&data.guid, &parent_guid);

            return UpdateOutcome {
                is_new: true,
                ..UpdateOutcome::default()
            };
        }

        let (prev_name, prev_path, prev_parent) = {
            let node = &self.nodes[&data.guid];
            (node.name.clone(), node.path.clone(), node.parent.clone())
        };

        let desired_parent = self.resolve_parent(data, Some(data.guid.as_str()));
        let parent_changed = prev_parent.as_deref() != Some(desired_parent.as_str());
        let name_changed = prev_name != data.name;

        let mut new_path = self.nodes[&desired_parent].path.clone();
        new_path.push(data.name.clone());
        let path_changed = prev_path != new_path;

        if name_changed || parent_changed || path_changed {
            self.unindex_subtree(&data.guid);

            {
                let node = self.nodes.get_mut(&data.guid).unwrap();
                node.name = data.name.clone();
                node.class_name = data.class_name.clone();
                node.path = new_path;
            }

            if parent_changed {
                if let Some(old_parent) = prev_parent {
                    if let Some(parent_node) = self.nodes.get_mut(&old_parent) {
                        parent_node.children.remove(&data.guid);
                    }
                }
                self.attach(&data.guid, &desired_parent);
            }

            self.recalculate_descendant_paths(&data.guid);
            self.index_subtree(&data.guid);
        } else {
            let node = self.nodes.get_mut(&data.guid).unwrap();
            node.class_name = data.class_name.clone();
        }

        // Script tracking follows the class, which upserts may change.
        if is_script_class(&data.class_name) {
            self.script_guids.insert(data.guid.clone());
        } else {
            self.script_guids.remove(&data.guid);
        }

        if let Some(source) = &data.source {
            let node = self.nodes.get_mut(&data.guid).unwrap();
            node.source = Some(source.clone());
        }

        UpdateOutcome {
            is_new: false,
            name_changed,
            path_changed,
            parent_changed,
            prev_name: name_changed.then_some(prev_name),
            prev_path: path_changed.then_some(prev_path),
        }
    }

    /// Removes the node and everything under it. Detaches from the parent
    /// first so a partial failure can never leave a dangling child link.
    pub fn delete_instance(&mut self, guid: &str) -> Option<RemovedSubtree> {
        if !self.nodes.contains_key(guid) {
            return None;
        }

        if let Some(parent_guid) = self.nodes[guid].parent.clone() {
            if let Some(parent) = self.nodes.get_mut(&parent_guid) {
                parent.children.remove(guid);
            }
        }

        let mut descendants = Vec::new();
        let mut queue: VecDeque<Guid> = self.nodes[guid]
            .children
            .iter()
            .cloned()
            .collect();

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.take_node(&current) {
                queue.extend(node.children.iter().cloned());
                descendants.push(node);
            }
        }

        let root = self.take_node(guid)?;
        Some(RemovedSubtree { root, descendants })
    }

    /// Source-only mutation used when the plugin (or the watcher) reports a
    /// script edit without any structural change.
    pub fn update_script_source(&mut self, guid: &str, source: &str) -> bool {
        match self.nodes.get_mut(guid) {
            Some(node) if node.is_script() => {
                node.source = Some(source.to_owned());
                true
            }
            Some(node) => {
                log::warn!(
                    "Ignoring source update for non-script {} ({})",
                    node.name,
                    node.class_name
                );
                false
            }
            None => {
                log::warn!("Ignoring source update for unknown guid {guid}");
                false
            }
        }
    }

    pub fn get_node(&self, guid: &str) -> Option<&TreeNode> {
        self.nodes.get(guid)
    }

    pub fn get_all_nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }

    pub fn get_script_nodes(&self) -> Vec<&TreeNode> {
        let mut scripts: Vec<&TreeNode> = self
            .script_guids
            .iter()
            .filter_map(|guid| self.nodes.get(guid))
            .collect();
        scripts.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        scripts
    }

    /// Every script at or below `guid`, breadth-first.
    pub fn get_descendant_scripts(&self, guid: &str) -> Vec<&TreeNode> {
        let mut scripts = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(guid.to_owned());

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&current) {
                if node.is_script() {
                    scripts.push(node);
                }
                queue.extend(node.children.iter().cloned());
            }
        }

        scripts
    }

    /// Structural lookup by full path. Ambiguous paths (same-name siblings)
    /// return `None`; callers must disambiguate by guid or accept failure.
    pub fn find_by_path(&self, path: &[String]) -> Option<&TreeNode> {
        match self.path_index.get(&path.to_vec()) {
            [only] => self.nodes.get(only),
            [] => None,
            candidates => {
                log::debug!(
                    "Path {:?} is ambiguous ({} candidates); refusing to pick",
                    path,
                    candidates.len()
                );
                None
            }
        }
    }

    pub fn root(&self) -> Option<&TreeNode> {
        self.nodes.get(ROOT_GUID)
    }

    pub fn stats(&self) -> TreeStats {
        let service_count = self
            .root()
            .map(|root| root.children.len())
            .unwrap_or_else(|| {
                self.nodes.values().filter(|n| n.path.len() == 1).count()
            });

        TreeStats {
            node_count: self.nodes.len().saturating_sub(usize::from(self.root().is_some())),
            script_count: self.script_guids.len(),
            service_count,
        }
    }

    /// Resolves the parent for `data`, preferring `parentGuid`, falling back
    /// to path-prefix lookup, and landing on the synthetic root when neither
    /// works. `moving` guards against re-parenting a node into its own
    /// subtree when the prefix lookup finds a descendant.
    fn resolve_parent(&mut self, data: &InstanceData, moving: Option<&str>) -> Guid {
        if let Some(parent_guid) = &data.parent_guid {
            if self.nodes.contains_key(parent_guid)
                && !self.is_descendant_of(parent_guid, moving)
            {
                return parent_guid.clone();
            }
            if self.nodes.contains_key(parent_guid) {
                log::warn!(
                    "parentGuid {} for {} is inside its own subtree; ignoring",
                    parent_guid,
                    data.guid
                );
            } else {
                log::warn!(
                    "parentGuid {} for {} not found; falling back to path lookup",
                    parent_guid,
                    data.guid
                );
            }
        }

        if data.path.len() <= 1 {
            return self.ensure_root();
        }

        let prefix = data.path[..data.path.len() - 1].to_vec();
        match self.path_index.get(&prefix) {
            [only] if !self.is_descendant_of(only, moving) => return only.clone(),
            [] => log::warn!(
                "Parent path {:?} for {} not found; attaching to root",
                prefix,
                data.guid
            ),
            _ => log::warn!(
                "Parent path {:?} for {} is ambiguous; attaching to root",
                prefix,
                data.guid
            ),
        }

        self.ensure_root()
    }

    fn is_descendant_of(&self, candidate: &str, ancestor: Option<&str>) -> bool {
        let Some(ancestor) = ancestor else {
            return false;
        };

        let mut current = Some(candidate.to_owned());
        while let Some(guid) = current {
            if guid == ancestor {
                return true;
            }
            current = self.nodes.get(&guid).and_then(|n| n.parent.clone());
        }
        false
    }

    fn attach(&mut self, child: &str, parent: &str) {
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.insert(child.to_owned());
        }
        if let Some(child_node) = self.nodes.get_mut(child) {
            child_node.parent = Some(parent.to_owned());
        }
    }

    fn register_node(&mut self, node: TreeNode) {
        if !node.path.is_empty() {
            self.path_index.insert(node.path.clone(), node.guid.clone());
        }
        if node.is_script() {
            self.script_guids.insert(node.guid.clone());
        }
        self.nodes.insert(node.guid.clone(), node);
    }

    fn unregister_node(&mut self, guid: &str) {
        if let Some(node) = self.nodes.remove(guid) {
            if !node.path.is_empty() {
                self.path_index.remove(&node.path, node.guid);
            }
            self.script_guids.remove(guid);
        }
    }

    fn take_node(&mut self, guid: &str) -> Option<TreeNode> {
        let node = self.nodes.remove(guid)?;
        if !node.path.is_empty() {
            self.path_index.remove(&node.path, node.guid.clone());
        }
        self.script_guids.remove(guid);
        Some(node)
    }

    fn subtree_guids(&self, guid: &str) -> Vec<Guid> {
        let mut guids = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(guid.to_owned());

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.children.iter().cloned());
                guids.push(current);
            }
        }

        guids
    }

    fn unindex_subtree(&mut self, guid: &str) {
        for member in self.subtree_guids(guid) {
            let path = self.nodes[&member].path.clone();
            if !path.is_empty() {
                self.path_index.remove(&path, member);
            }
        }
    }

    fn index_subtree(&mut self, guid: &str) {
        for member in self.subtree_guids(guid) {
            let path = self.nodes[&member].path.clone();
            if !path.is_empty() {
                self.path_index.insert(path, member);
            }
        }
    }

    /// Rewrites `path` for everything strictly below `guid` from its parent
    /// chain, iteratively. The node's own path must already be correct.
    fn recalculate_descendant_paths(&mut self, guid: &str) {
        let mut queue: VecDeque<Guid> = match self.nodes.get(guid) {
            Some(node) => node.children.iter().cloned().collect(),
            None => return,
        };

        while let Some(current) = queue.pop_front() {
            let parent_path = match self
                .nodes
                .get(&current)
                .and_then(|n| n.parent.as_ref())
                .and_then(|p| self.nodes.get(p))
            {
                Some(parent) => parent.path.clone(),
                None => continue,
            };

            if let Some(node) = self.nodes.get_mut(&current) {
                let mut path = parent_path;
                path.push(node.name.clone());
                node.path = path;
                queue.extend(node.children.iter().cloned());
            }
        }
    }
}
