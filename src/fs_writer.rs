//! Projects script nodes onto the sync directory and owns the guid ↔ file
//! path mapping. The mapping is authoritative over disk layout: whenever it
//! changes, the old file is unlinked before the new one is written.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::message::Guid;
use crate::tree::TreeNode;
use crate::watcher::PathSuppressor;

/// Characters that cannot appear in filenames on at least one supported
/// platform. Replaced with `_` when projecting names onto disk.
const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// One script node's on-disk location.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMapping {
    pub guid: Guid,
    pub file_path: PathBuf,
    pub class_name: String,
}

pub struct ScriptWriter {
    base_dir: PathBuf,
    script_extension: String,
    suffix_module_scripts: bool,
    mappings: HashMap<Guid, FileMapping>,
    path_to_guid: HashMap<PathBuf, Guid>,
    suppressor: Arc<PathSuppressor>,
}

impl ScriptWriter {
    /// Creates the sync directory if needed and canonicalizes it so that
    /// mapping paths compare equal to watcher event paths.
    pub fn new(
        base_dir: &Path,
        script_extension: &str,
        suffix_module_scripts: bool,
        suppressor: Arc<PathSuppressor>,
    ) -> io::Result<Self> {
        fs_err::create_dir_all(base_dir)?;
        let base_dir = fs_err::canonicalize(base_dir)?;

        let extension = if script_extension.starts_with('.') {
            script_extension.to_owned()
        } else {
            format!(".{script_extension}")
        };

        Ok(ScriptWriter {
            base_dir,
            script_extension: extension,
            suffix_module_scripts,
            mappings: HashMap::new(),
            path_to_guid: HashMap::new(),
            suppressor,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn mappings(&self) -> &HashMap<Guid, FileMapping> {
        &self.mappings
    }

    pub fn mapping_for(&self, guid: &str) -> Option<&FileMapping> {
        self.mappings.get(guid)
    }

    pub fn guid_for_path(&self, path: &Path) -> Option<&Guid> {
        self.path_to_guid.get(path)
    }

    /// Computes the on-disk path for a script node.
    ///
    /// Directory segments mirror the node's ancestors; a script named after
    /// its parent folder becomes `init<ext>` inside it, so the folder "is"
    /// the module. A target already claimed by a different guid gets the
    /// first 8 hex digits of this node's guid appended to the stem, which is
    /// stable for the lifetime of the collision.
    pub fn file_path_for(&self, node: &TreeNode) -> PathBuf {
        let mut dir = self.base_dir.clone();
        for segment in &node.path[..node.path.len().saturating_sub(1)] {
            dir.push(sanitize(segment));
        }

        let uses_init_file =
            node.path.len() >= 2 && node.name == node.path[node.path.len() - 2];

        let stem = if uses_init_file {
            "init".to_owned()
        } else {
            let mut stem = sanitize(&node.name);
            if self.suffix_module_scripts && node.class_name == "ModuleScript" {
                stem.push_str(".module");
            }
            stem
        };

        let candidate = dir.join(format!("{stem}{}", self.script_extension));
        match self.path_to_guid.get(&candidate) {
            Some(owner) if *owner != node.guid => {
                let prefix: String = node.guid.chars().take(8).collect();
                dir.join(format!("{stem}__{prefix}{}", self.script_extension))
            }
            _ => candidate,
        }
    }

    /// Writes one script node to disk, moving its file first if the mapping
    /// points somewhere else. The mapping is only updated when the write
    /// succeeds, so a failed write leaves the previous state intact for the
    /// next event to retry.
    pub fn write_script(&mut self, node: &TreeNode) -> io::Result<PathBuf> {
        let target = self.file_path_for(node);

        let stale_path = match self.mappings.get(&node.guid) {
            Some(mapping) if mapping.file_path != target => Some(mapping.file_path.clone()),
            _ => None,
        };

        if let Some(old_path) = &stale_path {
            self.remove_file_suppressed(old_path)?;
        }

        if let Some(parent) = target.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let source = node.source.as_deref().unwrap_or_default();
        self.suppressor.expect_write(&target);
        if let Err(err) = fs_err::write(&target, source) {
            self.suppressor.forget_write(&target);
            return Err(err);
        }

        if let Some(old_path) = stale_path {
            self.path_to_guid.remove(&old_path);
            self.prune_empty_parents(&old_path);
        }

        self.path_to_guid.insert(target.clone(), node.guid.clone());
        self.mappings.insert(
            node.guid.clone(),
            FileMapping {
                guid: node.guid.clone(),
                file_path: target.clone(),
                class_name: node.class_name.clone(),
            },
        );

        log::debug!("Wrote {} -> {}", node.guid, target.display());
        Ok(target)
    }

    /// Bulk projection after a full snapshot.
    pub fn write_tree<'a, I>(&mut self, nodes: I) -> usize
    where
        I: IntoIterator<Item = &'a TreeNode>,
    {
        let mut written = 0;
        for node in nodes {
            if !node.is_script() {
                continue;
            }
            match self.write_script(node) {
                Ok(_) => written += 1,
                Err(err) => {
                    log::error!("Failed to write script {}: {}", node.guid, err);
                }
            }
        }
        written
    }

    /// Removes a script's file and mapping. No-op for unmapped guids.
    /// Directories are left in place, even when emptied: a deletion is not a
    /// move, and the enclosing service directory is structural.
    pub fn delete_script(&mut self, guid: &str) -> io::Result<Option<PathBuf>> {
        let Some(mapping) = self.mappings.remove(guid) else {
            return Ok(None);
        };

        self.path_to_guid.remove(&mapping.file_path);
        self.remove_file_suppressed(&mapping.file_path)?;

        log::debug!("Deleted {} ({})", mapping.file_path.display(), guid);
        Ok(Some(mapping.file_path))
    }

    /// Removes a stray file and any mapping pointing at it. Used for orphan
    /// cleanup and for watcher-reported deletions that raced a rename.
    pub fn delete_file_path(&mut self, path: &Path) -> io::Result<()> {
        if let Some(guid) = self.path_to_guid.remove(path) {
            self.mappings.remove(&guid);
        }

        if path.exists() {
            self.remove_file_suppressed(path)?;
        }
        Ok(())
    }

    /// Drops the mapping for a path without touching disk. Used when the
    /// user deleted the file themselves and the watcher reported it.
    pub fn forget_path(&mut self, path: &Path) -> Option<Guid> {
        let guid = self.path_to_guid.remove(path)?;
        self.mappings.remove(&guid);
        Some(guid)
    }

    /// Files under the base directory that no mapping claims. These are
    /// leftovers from before a reconnect, or files the daemon never created.
    pub fn collect_orphan_files(&self) -> Vec<PathBuf> {
        let mut orphans = Vec::new();
        collect_files(&self.base_dir, &mut orphans);
        orphans.retain(|path| !self.path_to_guid.contains_key(path));
        orphans
    }

    /// Depth-first removal of every empty directory strictly inside the base.
    pub fn cleanup_empty_directories(&self) {
        let _ = remove_empty_dirs(&self.base_dir, false);
    }

    fn remove_file_suppressed(&self, path: &Path) -> io::Result<()> {
        self.suppressor.expect_remove(path);
        match fs_err::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.suppressor.forget_remove(path);
                Ok(())
            }
            Err(err) => {
                self.suppressor.forget_remove(path);
                Err(err)
            }
        }
    }

    /// Removes empty ancestor directories of `path`, stopping at (and never
    /// removing) the base directory.
    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base_dir || !dir.starts_with(&self.base_dir) {
                break;
            }
            match fs_err::read_dir(dir) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(_) => break,
            }
            if fs_err::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn sanitize(segment: &str) -> String {
    segment.replace(UNSAFE_CHARS, "_")
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs_err::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => collect_files(&path, out),
            Ok(kind) if kind.is_file() => out.push(path),
            _ => {}
        }
    }
}

/// Returns whether `dir` ended up empty (and, unless it is the root of the
/// walk, removed).
fn remove_empty_dirs(dir: &Path, remove_self: bool) -> io::Result<bool> {
    let mut is_empty = true;
    for entry in fs_err::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if !remove_empty_dirs(&path, true)? {
                is_empty = false;
            }
        } else {
            is_empty = false;
        }
    }

    if is_empty && remove_self {
        fs_err::remove_dir(dir)?;
    }
    Ok(is_empty)
}

#[cfg(test)]
mod test {
    use super::*;

    fn script(guid: &str, class_name: &str, name: &str, path: &[&str], source: &str) -> TreeNode {
        TreeNode {
            guid: guid.to_owned(),
            class_name: class_name.to_owned(),
            name: name.to_owned(),
            path: path.iter().map(|s| s.to_string()).collect(),
            parent: None,
            source: Some(source.to_owned()),
            children: Default::default(),
        }
    }

    fn writer_in(dir: &Path) -> ScriptWriter {
        ScriptWriter::new(dir, ".luau", false, Arc::new(PathSuppressor::new())).unwrap()
    }

    #[test]
    fn writes_script_under_mirrored_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let node = script(
            "aaaa1111bbbb2222",
            "ModuleScript",
            "Util",
            &["ReplicatedStorage", "Util"],
            "return {}",
        );
        let path = writer.write_script(&node).unwrap();

        assert!(path.ends_with("ReplicatedStorage/Util.luau"));
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "return {}");
        assert_eq!(writer.guid_for_path(&path).unwrap(), "aaaa1111bbbb2222");
    }

    #[test]
    fn script_named_after_parent_becomes_init_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let node = script(
            "gg",
            "ModuleScript",
            "Util",
            &["ReplicatedStorage", "Util", "Util"],
            "return 0",
        );
        let path = writer.write_script(&node).unwrap();
        assert!(path.ends_with("ReplicatedStorage/Util/init.luau"));
    }

    #[test]
    fn module_suffix_is_applied_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScriptWriter::new(
            dir.path(),
            ".luau",
            true,
            Arc::new(PathSuppressor::new()),
        )
        .unwrap();

        let module = script("m", "ModuleScript", "Util", &["RS", "Util"], "");
        assert!(writer
            .write_script(&module)
            .unwrap()
            .ends_with("RS/Util.module.luau"));

        let plain = script("s", "Script", "Run", &["RS", "Run"], "");
        assert!(writer.write_script(&plain).unwrap().ends_with("RS/Run.luau"));
    }

    #[test]
    fn unsafe_characters_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let node = script(
            "q",
            "Script",
            "What?No:Really",
            &["Workspace", "What?No:Really"],
            "",
        );
        let path = writer.write_script(&node).unwrap();
        assert!(path.ends_with("Workspace/What_No_Really.luau"));
    }

    #[test]
    fn colliding_names_get_guid_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let first = script(
            "aaaaaaaabbbbbbbb",
            "ModuleScript",
            "Shared",
            &["ReplicatedStorage", "Shared"],
            "return 1",
        );
        let second = script(
            "ccccccccdddddddd",
            "ModuleScript",
            "Shared",
            &["ReplicatedStorage", "Shared"],
            "return 2",
        );

        let first_path = writer.write_script(&first).unwrap();
        let second_path = writer.write_script(&second).unwrap();

        assert!(first_path.ends_with("Shared.luau"));
        assert!(second_path.ends_with("Shared__cccccccc.luau"));
        assert_ne!(first_path, second_path);

        // Re-writing either node is stable.
        assert_eq!(writer.write_script(&first).unwrap(), first_path);
        assert_eq!(writer.write_script(&second).unwrap(), second_path);
    }

    #[test]
    fn rename_moves_file_and_prunes_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let mut node = script(
            "g",
            "ModuleScript",
            "Util",
            &["ReplicatedStorage", "Deep", "Util"],
            "return {}",
        );
        let old_path = writer.write_script(&node).unwrap();

        node.name = "Helper".to_owned();
        node.path = vec!["Workspace".into(), "Helper".into()];
        let new_path = writer.write_script(&node).unwrap();

        assert!(!old_path.exists());
        assert!(new_path.ends_with("Workspace/Helper.luau"));
        assert_eq!(fs_err::read_to_string(&new_path).unwrap(), "return {}");
        // The now-empty intermediate directory is gone; the base survives.
        assert!(!dir.path().join("ReplicatedStorage").join("Deep").exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn delete_script_removes_file_and_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let node = script("g", "Script", "Run", &["Workspace", "Run"], "print(1)");
        let path = writer.write_script(&node).unwrap();

        let removed = writer.delete_script("g").unwrap();
        assert_eq!(removed.as_deref(), Some(path.as_path()));
        assert!(!path.exists());
        assert!(writer.mapping_for("g").is_none());

        // Deleting again is a no-op.
        assert!(writer.delete_script("g").unwrap().is_none());
    }

    #[test]
    fn orphans_are_files_without_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(dir.path());

        let node = script("g", "Script", "Run", &["Workspace", "Run"], "print(1)");
        writer.write_script(&node).unwrap();

        let stray = writer.base_dir().join("Workspace").join("Old.luau");
        fs_err::write(&stray, "-- stale").unwrap();

        let orphans = writer.collect_orphan_files();
        assert_eq!(orphans, vec![stray.clone()]);

        writer.delete_file_path(&stray).unwrap();
        assert!(!stray.exists());
    }

    #[test]
    fn cleanup_removes_nested_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let writer = writer_in(dir.path());

        let nested = writer.base_dir().join("A").join("B").join("C");
        fs_err::create_dir_all(&nested).unwrap();
        let keeper = writer.base_dir().join("Keep");
        fs_err::create_dir_all(&keeper).unwrap();
        fs_err::write(keeper.join("file.luau"), "x").unwrap();

        writer.cleanup_empty_directories();

        assert!(!writer.base_dir().join("A").exists());
        assert!(keeper.join("file.luau").exists());
        assert!(writer.base_dir().exists());
    }
}
