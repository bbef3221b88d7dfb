//! One-shot `push`: sends the current on-disk script bodies to Studio,
//! addressed by the guids recorded in the sourcemap.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::message::{is_script_class, OutgoingMessage};
use crate::sourcemap::SourcemapService;
use crate::transport::Transport;

use super::build::{instances_from_sourcemap, wait_for_connection};

const FLUSH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
pub struct PushCommand {
    /// Path to the sourcemap describing which files map to which instances.
    #[clap(long, default_value = "./sourcemap.json")]
    pub sourcemap: PathBuf,

    /// Port to wait for Studio on.
    #[clap(long, default_value = "8080")]
    pub port: u16,
}

impl PushCommand {
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

        let (transport, events) = Transport::bind(self.port, false)?;

        log::info!("Waiting for Studio to connect on port {}...", self.port);
        wait_for_connection(&events)?;

        let mut pushed = 0;
        let mut skipped = 0;
        for data in &instances {
            if !is_script_class(&data.class_name) {
                continue;
            }
            let Some(source) = &data.source else {
                continue;
            };

            // Guids minted during flattening don't exist in Studio yet, so
            // there is nothing to address the edit to.
            if root_has_guid(&root, &data.guid) {
                transport.send(&OutgoingMessage::ScriptSourceChanged {
                    guid: data.guid.clone(),
                    source: source.clone(),
                })?;
                pushed += 1;
            } else {
                log::warn!("Skipping {}: sourcemap entry has no guid", data.name);
                skipped += 1;
            }
        }

        std::thread::sleep(FLUSH_GRACE);

        log::info!("Pushed {pushed} scripts ({skipped} skipped)");
        Ok(())
    }
}

fn root_has_guid(node: &crate::sourcemap::SourcemapNode, guid: &str) -> bool {
    if node.guid.as_deref() == Some(guid) {
        return true;
    }
    node.children.iter().any(|child| root_has_guid(child, guid))
}
