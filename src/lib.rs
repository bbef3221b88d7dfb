pub mod cli;
pub mod logging;

mod config;
mod fs_writer;
mod message;
mod multimap;
mod pack;
mod session;
mod sourcemap;
mod transport;
mod tree;
mod watcher;

pub use config::{config_path, Config, ConfigError};
pub use fs_writer::{FileMapping, ScriptWriter};
pub use message::{
    decode_incoming, encode_outgoing, Guid, IncomingMessage, InstanceData, OutgoingMessage,
    ProtocolError,
};
pub use pack::{build_packed_sourcemap, PackMode};
pub use session::{SessionState, SyncEngine, SyncSession};
pub use sourcemap::{
    PackMeta, RegenerateRequested, SourcemapError, SourcemapNode, SourcemapService, Validation,
};
pub use transport::{Transport, TransportError, TransportEvent};
pub use tree::{RemovedSubtree, SyncTree, TreeNode, TreeStats, UpdateOutcome};
pub use watcher::{PathSuppressor, SyncWatcher, WatcherEvent};
