//! One-shot `pack`: asks Studio for a property-bearing snapshot and folds
//! properties and attributes into the sourcemap for later restoration.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use thiserror::Error;

use crate::message::IncomingMessage;
use crate::pack::{build_packed_sourcemap, PackMode};
use crate::sourcemap::SourcemapService;
use crate::transport::{Transport, TransportEvent};

use super::build::wait_for_connection;

/// How long to wait for the plugin to deliver its snapshot.
const SNAPSHOT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PackError {
    #[error("Studio did not deliver a snapshot within {0:?}")]
    SnapshotTimeout(Duration),

    #[error("Studio disconnected before delivering a snapshot")]
    Disconnected,
}

#[derive(Debug, Parser)]
pub struct PackCommand {
    /// Path of the sourcemap to update.
    #[clap(long, default_value = "./sourcemap.json")]
    pub sourcemap: PathBuf,

    /// Port to wait for Studio on.
    #[clap(long, default_value = "8080")]
    pub port: u16,

    /// Only include scripts and their descendants in the snapshot.
    #[clap(long)]
    pub scripts_only: bool,
}

impl PackCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let service = SourcemapService::new(&self.sourcemap);
        let existing = service
            .load()
            .with_context(|| format!("could not read {}", self.sourcemap.display()))?;

        let (transport, events) = Transport::bind(self.port, false)?;

        log::info!("Waiting for Studio to connect on port {}...", self.port);
        wait_for_connection(&events)?;

        transport.request_snapshot(Some(true), self.scripts_only.then_some(true))?;
        log::info!("Requested snapshot with properties; waiting...");

        let snapshot = await_snapshot(&events, SNAPSHOT_DEADLINE)?;
        log::info!("Received snapshot of {} instances", snapshot.len());

        let mode = if self.scripts_only {
            PackMode::ScriptsOnly
        } else {
            PackMode::Full
        };

        let packed = build_packed_sourcemap(
            &service,
            &snapshot,
            existing.as_ref(),
            mode,
            chrono::Utc::now().to_rfc3339(),
        );
        service.write(&packed)?;

        log::info!("Packed sourcemap written to {}", self.sourcemap.display());
        Ok(())
    }
}

/// Blocks until a `fullSnapshot` arrives, honoring the deadline across any
/// interleaved messages.
fn await_snapshot(
    events: &crossbeam_channel::Receiver<TransportEvent>,
    deadline: Duration,
) -> Result<Vec<crate::message::InstanceData>, PackError> {
    let started = Instant::now();

    loop {
        let remaining = deadline
            .checked_sub(started.elapsed())
            .ok_or(PackError::SnapshotTimeout(deadline))?;

        match events.recv_timeout(remaining) {
            Ok(TransportEvent::Message(IncomingMessage::FullSnapshot { data })) => {
                return Ok(data);
            }
            Ok(TransportEvent::Disconnected) => return Err(PackError::Disconnected),
            Ok(_) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                return Err(PackError::SnapshotTimeout(deadline));
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(PackError::Disconnected);
            }
        }
    }
}
