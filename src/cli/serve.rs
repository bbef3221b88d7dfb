//! The live-sync daemon: binds the port, projects the tree to disk, and
//! keeps both sides reconciled until interrupted.

use std::path::PathBuf;

use clap::Parser;

use crate::config;
use crate::session::SyncSession;

#[derive(Debug, Parser)]
pub struct ServeCommand {
    /// Port to listen on for Studio. Overrides the user config.
    #[clap(long)]
    pub port: Option<u16>,

    /// Directory scripts are projected into. Overrides the user config.
    #[clap(long)]
    pub sync_dir: Option<PathBuf>,

    /// Where to write sourcemap.json. Overrides the user config.
    #[clap(long)]
    pub sourcemap: Option<PathBuf>,
}

impl ServeCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let mut config = config::load();
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(sync_dir) = self.sync_dir {
            config.sync_dir = sync_dir;
        }
        if let Some(sourcemap) = self.sourcemap {
            config.sourcemap_path = sourcemap;
        }

        log::info!(
            "Syncing {} on port {}",
            config.sync_dir.display(),
            config.port
        );

        let _session = SyncSession::start(config)?;

        // The session runs on its own threads; park here until killed.
        let (_keep_alive, wait_forever) = crossbeam_channel::bounded::<()>(0);
        let _ = wait_forever.recv();
        Ok(())
    }
}
