//! The sync coordinator: owns the tree, the file writer, and the sourcemap
//! service, and routes plugin messages and watcher events between them.
//!
//! All mutation happens on one job thread driven by a `select!` loop, which
//! is the serialization point for the whole daemon: message handling, file
//! writes, and sourcemap updates never interleave.

use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use jod_thread::JoinHandle;

use crate::config::Config;
use crate::fs_writer::ScriptWriter;
use crate::message::{IncomingMessage, InstanceData, OutgoingMessage};
use crate::sourcemap::SourcemapService;
use crate::transport::{Transport, TransportEvent};
use crate::tree::{SyncTree, TreeNode};
use crate::watcher::{PathSuppressor, SyncWatcher, WatcherEvent};

/// Session lifecycle. `Priming` is the window between a plugin connecting
/// and its first full snapshot landing; watcher `Added` events during that
/// window are the daemon's own bulk writes and are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionState {
    Idle,
    Priming,
    Live,
    Disconnected,
}

/// Pure dispatch core of the daemon, factored apart from the thread and
/// socket plumbing so the whole message table is exercisable in tests.
pub struct SyncEngine {
    config: Config,
    tree: SyncTree,
    writer: ScriptWriter,
    sourcemap: SourcemapService,
    state: SessionState,
}

impl SyncEngine {
    pub fn new(config: Config, writer: ScriptWriter, sourcemap: SourcemapService) -> Self {
        SyncEngine {
            config,
            tree: SyncTree::new(),
            writer,
            sourcemap,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tree(&self) -> &SyncTree {
        &self.tree
    }

    pub fn writer(&self) -> &ScriptWriter {
        &self.writer
    }

    pub fn handle_connected(&mut self) {
        log::info!("Studio connected; waiting for snapshot");
        self.state = SessionState::Priming;
    }

    /// The tree and mappings survive a disconnect so the next snapshot can
    /// be diffed cheaply instead of rewriting every file.
    pub fn handle_disconnected(&mut self) {
        log::info!("Studio disconnected");
        self.state = SessionState::Disconnected;
    }

    pub fn handle_message(&mut self, message: IncomingMessage) -> Vec<OutgoingMessage> {
        match message {
            IncomingMessage::FullSnapshot { data } => self.apply_full_snapshot(&data),
            IncomingMessage::InstanceUpdated { data } => self.apply_instance_update(&data),
            IncomingMessage::InstanceDeleted { guid } => self.apply_instance_delete(&guid),
            IncomingMessage::ScriptSourceChanged { guid, source } => {
                self.apply_source_change(&guid, &source)
            }
        }

        Vec::new()
    }

    fn apply_full_snapshot(&mut self, data: &[InstanceData]) {
        log::info!("Applying full snapshot of {} instances", data.len());
        self.tree.apply_full_snapshot(data);

        let scripts: Vec<TreeNode> = self
            .tree
            .get_script_nodes()
            .into_iter()
            .cloned()
            .collect();
        let written = self.writer.write_tree(scripts.iter());
        log::info!("Projected {written} scripts to {}", self.writer.base_dir().display());

        if self.config.delete_orphans_on_connect {
            for orphan in self.writer.collect_orphan_files() {
                log::info!("Deleting orphan file {}", orphan.display());
                if let Err(err) = self.writer.delete_file_path(&orphan) {
                    log::error!("Failed to delete orphan {}: {err}", orphan.display());
                }
            }
            self.writer.cleanup_empty_directories();
        }

        if let Err(err) = self.sourcemap.regenerate(&self.tree, self.writer.mappings()) {
            log::error!("Failed to write sourcemap: {err}");
        }

        self.state = SessionState::Live;
        let stats = self.tree.stats();
        log::info!(
            "Live: {} instances, {} scripts across {} services",
            stats.node_count,
            stats.script_count,
            stats.service_count
        );
    }

    fn apply_instance_update(&mut self, data: &InstanceData) {
        let outcome = self.tree.update_instance(data);

        if outcome.is_new || outcome.path_changed {
            // A structural change moves every descendant script file, not
            // just the updated node's own file.
            let scripts: Vec<TreeNode> = self
                .tree
                .get_descendant_scripts(&data.guid)
                .into_iter()
                .cloned()
                .collect();
            for script in &scripts {
                if let Err(err) = self.writer.write_script(script) {
                    log::error!("Failed to write {}: {err}", script.name);
                }
            }

            self.sourcemap.upsert_or_regenerate(
                &data.guid,
                &self.tree,
                self.writer.mappings(),
                outcome.prev_path.as_deref(),
                outcome.is_new,
            );
        } else if data.source.is_some() {
            // Source-only edit: refresh the file, the sourcemap shape is
            // untouched.
            if let Some(node) = self.tree.get_node(&data.guid).cloned() {
                if node.is_script() {
                    if let Err(err) = self.writer.write_script(&node) {
                        log::error!("Failed to write {}: {err}", node.name);
                    }
                }
            }
        }
    }

    fn apply_instance_delete(&mut self, guid: &str) {
        let Some(removed) = self.tree.delete_instance(guid) else {
            log::warn!("Delete for unknown guid {guid}");
            return;
        };

        for script_guid in removed.script_guids() {
            if let Err(err) = self.writer.delete_script(&script_guid) {
                log::error!("Failed to delete script {script_guid}: {err}");
            }
        }

        self.sourcemap.prune_or_regenerate(
            &removed.root.path,
            Some(removed.root.class_name.as_str()),
            Some(removed.root.guid.as_str()),
            &self.tree,
            self.writer.mappings(),
        );
    }

    fn apply_source_change(&mut self, guid: &str, source: &str) {
        if !self.tree.update_script_source(guid, source) {
            return;
        }
        if let Some(node) = self.tree.get_node(guid).cloned() {
            if let Err(err) = self.writer.write_script(&node) {
                log::error!("Failed to write {}: {err}", node.name);
            }
        }
    }

    /// Maps a debounced disk event back to the tree through the writer's
    /// mapping and produces the messages to forward to the plugin.
    pub fn handle_watcher_event(&mut self, event: WatcherEvent) -> Vec<OutgoingMessage> {
        match event {
            WatcherEvent::Changed(path) => {
                let Some(guid) = self.writer.guid_for_path(&path).cloned() else {
                    log::debug!("Change for unmapped path {}; ignoring", path.display());
                    return Vec::new();
                };

                let source = match fs_err::read_to_string(&path) {
                    Ok(source) => source,
                    Err(err) => {
                        log::warn!("Could not read {}: {err}", path.display());
                        return Vec::new();
                    }
                };

                if !self.tree.update_script_source(&guid, &source) {
                    return Vec::new();
                }

                log::info!("Local edit: {} -> {guid}", path.display());
                vec![OutgoingMessage::ScriptSourceChanged { guid, source }]
            }

            WatcherEvent::Added(path) => {
                if self.state != SessionState::Live {
                    return Vec::new();
                }
                // Files the daemon didn't create have no guid to sync under;
                // they stay on disk untouched until the plugin mirrors them.
                log::info!(
                    "Untracked file {} created; not mapped to any instance",
                    path.display()
                );
                Vec::new()
            }

            WatcherEvent::Removed(path) => {
                let Some(guid) = self.writer.forget_path(&path) else {
                    log::debug!("Remove for unmapped path {}; ignoring", path.display());
                    return Vec::new();
                };

                log::info!("Local delete: {} -> {guid}", path.display());

                if let Some(removed) = self.tree.delete_instance(&guid) {
                    // The user deleted one file; descendants of that node
                    // lose their instances too, so their files go as well.
                    for script_guid in removed.script_guids() {
                        if script_guid == guid {
                            continue;
                        }
                        if let Err(err) = self.writer.delete_script(&script_guid) {
                            log::error!("Failed to delete script {script_guid}: {err}");
                        }
                    }

                    self.sourcemap.prune_or_regenerate(
                        &removed.root.path,
                        Some(removed.root.class_name.as_str()),
                        Some(removed.root.guid.as_str()),
                        &self.tree,
                        self.writer.mappings(),
                    );
                }

                vec![OutgoingMessage::ApplyPatch {
                    updated: Vec::new(),
                    removed: vec![guid],
                }]
            }
        }
    }
}

/// The live daemon: transport, watcher, and engine wired together on one
/// job thread.
pub struct SyncSession {
    /// Signaled before dropping so the job thread leaves its loop instead of
    /// hanging on the next `select!`.
    shutdown_sender: Sender<()>,

    // Held for its Drop side effect: joins the job thread.
    #[allow(unused)]
    job_thread: JoinHandle<()>,
}

impl SyncSession {
    pub fn start(config: Config) -> anyhow::Result<SyncSession> {
        let suppressor = Arc::new(PathSuppressor::new());

        let writer = ScriptWriter::new(
            &config.sync_dir,
            &config.script_extension,
            config.suffix_module_scripts,
            Arc::clone(&suppressor),
        )?;

        let sourcemap = SourcemapService::new(&config.sourcemap_path);

        let watcher = SyncWatcher::new(writer.base_dir(), config.file_watch_debounce)?;
        let watcher_receiver = watcher.event_receiver();

        let (transport, transport_receiver) =
            Transport::bind(config.port, config.request_snapshot_on_connect)?;

        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);

        let mut engine = SyncEngine::new(config, writer, sourcemap);

        let job_thread = jod_thread::Builder::new()
            .name("sync session thread".to_owned())
            .spawn(move || {
                // The watcher must live exactly as long as the loop.
                let _watcher = watcher;

                run_loop(
                    &mut engine,
                    &transport,
                    &suppressor,
                    transport_receiver,
                    watcher_receiver,
                    shutdown_receiver,
                );

                log::trace!("Sync session thread exiting");
            })
            .expect("Could not start sync session thread");

        Ok(SyncSession {
            shutdown_sender,
            job_thread,
        })
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let _ = self.shutdown_sender.send(());
    }
}

fn run_loop(
    engine: &mut SyncEngine,
    transport: &Transport,
    suppressor: &PathSuppressor,
    transport_receiver: Receiver<TransportEvent>,
    watcher_receiver: Receiver<WatcherEvent>,
    shutdown_receiver: Receiver<()>,
) {
    loop {
        select! {
            recv(transport_receiver) -> event => {
                let Ok(event) = event else { break };
                let outgoing = match event {
                    TransportEvent::Connected => {
                        engine.handle_connected();
                        Vec::new()
                    }
                    TransportEvent::Disconnected => {
                        engine.handle_disconnected();
                        Vec::new()
                    }
                    TransportEvent::Message(message) => engine.handle_message(message),
                };
                send_all(transport, outgoing);
            },

            recv(watcher_receiver) -> event => {
                let Ok(event) = event else { break };
                if suppressor.consume(&event) {
                    log::trace!("Suppressed own write echo: {:?}", event.path());
                } else {
                    let outgoing = engine.handle_watcher_event(event);
                    send_all(transport, outgoing);
                }
            },

            recv(shutdown_receiver) -> _ => break,
        }
    }
}

fn send_all(transport: &Transport, messages: Vec<OutgoingMessage>) {
    for message in messages {
        if let Err(err) = transport.send(&message) {
            // Dropped, not retried: the next snapshot reconciles.
            log::debug!("Dropping outgoing message: {err}");
        }
    }
}
