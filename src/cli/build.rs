//! One-shot `build`: reconstructs an instance stream from `sourcemap.json`
//! and hands it to Studio as a `buildSnapshot`, without entering live sync.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use uuid::Uuid;

use crate::message::{is_script_class, InstanceData, OutgoingMessage};
use crate::sourcemap::{SourcemapNode, SourcemapService};
use crate::transport::{Transport, TransportEvent};

/// Grace period for the socket task to flush the final message before the
/// process exits.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
pub struct BuildCommand {
    /// Path to the sourcemap to build from.
    #[clap(long, default_value = "./sourcemap.json")]
    pub sourcemap: PathBuf,

    /// Port to wait for Studio on.
    #[clap(long, default_value = "8080")]
    pub port: u16,
}

impl BuildCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let service = SourcemapService::new(&self.sourcemap);
        let root = service
            .load()
            .with_context(|| format!("could not read {}", self.sourcemap.display()))?;
        let Some(root) = root else {
            bail!("no sourcemap at {}", self.sourcemap.display());
        };

        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let instances = instances_from_sourcemap(&root, &base);
        if instances.is_empty() {
            bail!("sourcemap {} contains no instances", self.sourcemap.display());
        }

        let (transport, events) = Transport::bind(self.port, false)?;

        log::info!("Waiting for Studio to connect on port {}...", self.port);
        wait_for_connection(&events)?;

        let count = instances.len();
        transport.send(&OutgoingMessage::BuildSnapshot { data: instances })?;
        std::thread::sleep(FLUSH_GRACE);

        log::info!("Sent build snapshot of {count} instances");
        Ok(())
    }
}

pub(super) fn wait_for_connection(
    events: &crossbeam_channel::Receiver<TransportEvent>,
) -> anyhow::Result<()> {
    loop {
        match events.recv() {
            Ok(TransportEvent::Connected) => return Ok(()),
            Ok(_) => continue,
            Err(_) => bail!("transport shut down before Studio connected"),
        }
    }
}

/// Flattens a sourcemap into the `InstanceData` stream Studio applies,
/// sorted parents-first by path length. Entries without a guid get a fresh
/// one minted; minted guids are not persisted back to the sourcemap.
pub fn instances_from_sourcemap(root: &SourcemapNode, base: &Path) -> Vec<InstanceData> {
    let mut instances = Vec::new();
    for child in &root.children {
        flatten(child, base, &mut Vec::new(), None, &mut instances);
    }
    instances.sort_by_key(|data| data.path.len());
    instances
}

fn flatten(
    node: &SourcemapNode,
    base: &Path,
    path: &mut Vec<String>,
    parent_guid: Option<&str>,
    out: &mut Vec<InstanceData>,
) {
    path.push(node.name.clone());

    let guid = node
        .guid
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let source = if is_script_class(&node.class_name) {
        node.file_paths.first().and_then(|file_path| {
            match fs_err::read_to_string(base.join(file_path)) {
                Ok(source) => Some(source),
                Err(err) => {
                    log::warn!("Skipping source for {}: {err}", node.name);
                    None
                }
            }
        })
    } else {
        None
    };

    out.push(InstanceData {
        guid: guid.clone(),
        class_name: node.class_name.clone(),
        name: node.name.clone(),
        path: path.clone(),
        parent_guid: parent_guid.map(str::to_owned),
        source,
        properties: node.properties.as_ref().map(map_to_hash),
        attributes: node.attributes.as_ref().map(map_to_hash),
    });

    for child in &node.children {
        flatten(child, base, path, Some(guid.as_str()), out);
    }

    path.pop();
}

fn map_to_hash(
    map: &serde_json::Map<String, serde_json::Value>,
) -> HashMap<String, serde_json::Value> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(name: &str, class_name: &str, guid: Option<&str>, file: Option<&str>) -> SourcemapNode {
        SourcemapNode {
            name: name.to_owned(),
            class_name: class_name.to_owned(),
            guid: guid.map(str::to_owned),
            file_paths: file.map(|f| vec![f.to_owned()]).unwrap_or_default(),
            properties: None,
            attributes: None,
            children: Vec::new(),
            azul: None,
        }
    }

    #[test]
    fn flatten_orders_parents_first_and_reads_sources() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join("sync/ReplicatedStorage")).unwrap();
        fs_err::write(
            dir.path().join("sync/ReplicatedStorage/Util.luau"),
            "return {}",
        )
        .unwrap();

        let mut root = SourcemapNode::new_root();
        let mut rs = leaf("ReplicatedStorage", "ReplicatedStorage", Some("svc-rs"), None);
        rs.children.push(leaf(
            "Util",
            "ModuleScript",
            Some("util"),
            Some("sync/ReplicatedStorage/Util.luau"),
        ));
        root.children.push(rs);

        let instances = instances_from_sourcemap(&root, dir.path());

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].name, "ReplicatedStorage");
        assert_eq!(instances[0].path, vec!["ReplicatedStorage"]);
        assert_eq!(instances[1].name, "Util");
        assert_eq!(instances[1].parent_guid.as_deref(), Some("svc-rs"));
        assert_eq!(instances[1].source.as_deref(), Some("return {}"));
    }

    #[test]
    fn flatten_mints_guids_where_absent() {
        let mut root = SourcemapNode::new_root();
        let mut folder = leaf("Folder", "Folder", None, None);
        folder.children.push(leaf("Inner", "Folder", None, None));
        root.children.push(folder);

        let instances = instances_from_sourcemap(&root, Path::new("."));

        assert_eq!(instances.len(), 2);
        let folder_guid = &instances[0].guid;
        assert_eq!(folder_guid.len(), 32, "minted guid is simple-format hex");
        assert_eq!(instances[1].parent_guid.as_ref(), Some(folder_guid));
        assert_ne!(instances[0].guid, instances[1].guid);
    }

    #[test]
    fn flatten_skips_missing_script_files_but_keeps_the_node() {
        let mut root = SourcemapNode::new_root();
        root.children.push(leaf(
            "Ghost",
            "ModuleScript",
            Some("ghost"),
            Some("sync/Ghost.luau"),
        ));

        let dir = tempfile::tempdir().unwrap();
        let instances = instances_from_sourcemap(&root, dir.path());

        assert_eq!(instances.len(), 1);
        assert!(instances[0].source.is_none());
    }
}
