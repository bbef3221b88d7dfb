//! End-to-end scenarios for the sync engine, driven through the public
//! library API: a plugin session is simulated by feeding messages and
//! watcher events directly into a `SyncEngine` over a temporary directory.

use std::path::PathBuf;
use std::sync::Arc;

use libazul::{
    Config, IncomingMessage, InstanceData, OutgoingMessage, PathSuppressor, ScriptWriter,
    SourcemapService, SyncEngine, WatcherEvent,
};

fn instance(
    guid: &str,
    class_name: &str,
    name: &str,
    path: &[&str],
    parent_guid: Option<&str>,
    source: Option<&str>,
) -> InstanceData {
    InstanceData {
        guid: guid.to_owned(),
        class_name: class_name.to_owned(),
        name: name.to_owned(),
        path: path.iter().map(|s| s.to_string()).collect(),
        parent_guid: parent_guid.map(str::to_owned),
        source: source.map(str::to_owned),
        properties: None,
        attributes: None,
    }
}

struct Session {
    dir: tempfile::TempDir,
    engine: SyncEngine,
}

impl Session {
    fn new() -> Session {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            sync_dir: dir.path().join("sync"),
            sourcemap_path: dir.path().join("sourcemap.json"),
            ..Config::default()
        };

        let writer = ScriptWriter::new(
            &config.sync_dir,
            &config.script_extension,
            config.suffix_module_scripts,
            Arc::new(PathSuppressor::new()),
        )
        .unwrap();
        let base = dir.path().canonicalize().unwrap();
        let sourcemap = SourcemapService::with_relative_base(&config.sourcemap_path, &base);

        let engine = SyncEngine::new(config, writer, sourcemap);
        Session { dir, engine }
    }

    fn sync_path(&self, tail: &str) -> PathBuf {
        self.dir.path().join("sync").join(tail)
    }

    fn read(&self, tail: &str) -> String {
        fs_err::read_to_string(self.sync_path(tail)).unwrap()
    }

    fn sourcemap(&self) -> serde_json::Value {
        let contents =
            fs_err::read_to_string(self.dir.path().join("sourcemap.json")).unwrap();
        serde_json::from_str(&contents).unwrap()
    }
}

fn find<'a>(value: &'a serde_json::Value, name: &str) -> Option<&'a serde_json::Value> {
    if value["name"] == name {
        return Some(value);
    }
    value["children"]
        .as_array()?
        .iter()
        .find_map(|child| find(child, name))
}

const UTIL_GUID: &str = "aaaa00000000000000000000000000aa";

fn cold_connect(session: &mut Session) {
    session.engine.handle_connected();
    session.engine.handle_message(IncomingMessage::FullSnapshot {
        data: vec![
            instance("ws00", "Workspace", "Workspace", &["Workspace"], None, None),
            instance(
                "rs00",
                "ReplicatedStorage",
                "ReplicatedStorage",
                &["ReplicatedStorage"],
                None,
                None,
            ),
            instance(
                UTIL_GUID,
                "ModuleScript",
                "Util",
                &["ReplicatedStorage", "Util"],
                Some("rs00"),
                Some("return {}"),
            ),
        ],
    });
}

#[test]
fn cold_connect_projects_scripts_and_sourcemap() {
    let mut session = Session::new();
    cold_connect(&mut session);

    assert_eq!(session.read("ReplicatedStorage/Util.luau"), "return {}");

    let map = session.sourcemap();
    assert_eq!(map["name"], "Game");
    let util = find(&map, "Util").unwrap();
    assert_eq!(util["guid"], UTIL_GUID);
    assert_eq!(util["filePaths"][0], "sync/ReplicatedStorage/Util.luau");
}

#[test]
fn full_lifecycle_rename_move_edit_delete() {
    let mut session = Session::new();
    cold_connect(&mut session);

    // Rename Util -> Helper: old file gone, content carried over.
    session.engine.handle_message(IncomingMessage::InstanceUpdated {
        data: instance(
            UTIL_GUID,
            "ModuleScript",
            "Helper",
            &["ReplicatedStorage", "Helper"],
            Some("rs00"),
            None,
        ),
    });
    assert!(!session.sync_path("ReplicatedStorage/Util.luau").exists());
    assert_eq!(session.read("ReplicatedStorage/Helper.luau"), "return {}");
    let map = session.sourcemap();
    assert!(find(&map, "Util").is_none());
    assert_eq!(find(&map, "Helper").unwrap()["guid"], UTIL_GUID);

    // Move under Workspace: the emptied ReplicatedStorage directory is
    // pruned from disk.
    session.engine.handle_message(IncomingMessage::InstanceUpdated {
        data: instance(
            UTIL_GUID,
            "ModuleScript",
            "Helper",
            &["Workspace", "Helper"],
            Some("ws00"),
            None,
        ),
    });
    assert!(!session.sync_path("ReplicatedStorage").exists());
    assert_eq!(session.read("Workspace/Helper.luau"), "return {}");
    let map = session.sourcemap();
    let workspace = find(&map, "Workspace").unwrap();
    assert!(find(workspace, "Helper").is_some());

    // Local edit: after debounce the watcher reports a change; exactly one
    // scriptSourceChanged goes back carrying the mapped guid.
    let helper = session.sync_path("Workspace/Helper.luau");
    fs_err::write(&helper, "return 2").unwrap();
    let messages = session
        .engine
        .handle_watcher_event(WatcherEvent::Changed(helper));
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        OutgoingMessage::ScriptSourceChanged { guid, source } => {
            assert_eq!(guid, UTIL_GUID);
            assert_eq!(source, "return 2");
        }
        other => panic!("expected scriptSourceChanged, got {other:?}"),
    }

    // Delete from the editor: file and sourcemap entry disappear, but the
    // Workspace service directory itself is structural and stays.
    session.engine.handle_message(IncomingMessage::InstanceDeleted {
        guid: UTIL_GUID.to_owned(),
    });
    assert!(!session.sync_path("Workspace/Helper.luau").exists());
    assert!(find(&session.sourcemap(), "Helper").is_none());
    // Deletion empties the Workspace directory but does not remove it.
    assert!(session.sync_path("Workspace").exists());
}

#[test]
fn same_name_siblings_never_merge() {
    let mut session = Session::new();
    cold_connect(&mut session);

    let guid_a = "bbbb00000000000000000000000000bb";
    let guid_b = "cccc00000000000000000000000000cc";
    for (guid, source) in [(guid_a, "return 1"), (guid_b, "return 2")] {
        session.engine.handle_message(IncomingMessage::InstanceUpdated {
            data: instance(
                guid,
                "ModuleScript",
                "Shared",
                &["ReplicatedStorage", "Shared"],
                Some("rs00"),
                Some(source),
            ),
        });
    }

    assert_eq!(session.read("ReplicatedStorage/Shared.luau"), "return 1");
    assert_eq!(
        session.read("ReplicatedStorage/Shared__cccc0000.luau"),
        "return 2"
    );

    let map = session.sourcemap();
    let rs = find(&map, "ReplicatedStorage").unwrap();
    let shared: Vec<_> = rs["children"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["name"] == "Shared")
        .collect();
    assert_eq!(shared.len(), 2);

    // Distinct guids always resolve to distinct file paths.
    let paths: Vec<&str> = shared
        .iter()
        .map(|c| c["filePaths"][0].as_str().unwrap())
        .collect();
    assert_ne!(paths[0], paths[1]);
}

#[test]
fn applying_the_same_snapshot_twice_is_idempotent() {
    let mut session = Session::new();
    cold_connect(&mut session);
    let first_map = session.sourcemap();
    let first_body = session.read("ReplicatedStorage/Util.luau");

    cold_connect(&mut session);

    assert_eq!(session.sourcemap(), first_map);
    assert_eq!(session.read("ReplicatedStorage/Util.luau"), first_body);
}

#[test]
fn replay_equivalence_of_incremental_events_and_final_snapshot() {
    // Drive one session incrementally and another with the equivalent final
    // snapshot; both must agree on disk layout and sourcemap shape.
    let mut incremental = Session::new();
    cold_connect(&mut incremental);
    incremental
        .engine
        .handle_message(IncomingMessage::InstanceUpdated {
            data: instance(
                "dddd0000000000000000000000000000",
                "Script",
                "Boot",
                &["Workspace", "Boot"],
                Some("ws00"),
                Some("print('boot')"),
            ),
        });
    incremental
        .engine
        .handle_message(IncomingMessage::InstanceUpdated {
            data: instance(
                UTIL_GUID,
                "ModuleScript",
                "Helper",
                &["ReplicatedStorage", "Helper"],
                Some("rs00"),
                None,
            ),
        });

    let mut replayed = Session::new();
    replayed.engine.handle_connected();
    replayed.engine.handle_message(IncomingMessage::FullSnapshot {
        data: vec![
            instance("ws00", "Workspace", "Workspace", &["Workspace"], None, None),
            instance(
                "rs00",
                "ReplicatedStorage",
                "ReplicatedStorage",
                &["ReplicatedStorage"],
                None,
                None,
            ),
            instance(
                UTIL_GUID,
                "ModuleScript",
                "Helper",
                &["ReplicatedStorage", "Helper"],
                Some("rs00"),
                Some("return {}"),
            ),
            instance(
                "dddd0000000000000000000000000000",
                "Script",
                "Boot",
                &["Workspace", "Boot"],
                Some("ws00"),
                Some("print('boot')"),
            ),
        ],
    });

    assert_eq!(
        incremental.read("ReplicatedStorage/Helper.luau"),
        replayed.read("ReplicatedStorage/Helper.luau")
    );
    assert_eq!(
        incremental.read("Workspace/Boot.luau"),
        replayed.read("Workspace/Boot.luau")
    );

    // Sourcemaps agree modulo sibling ordering of incremental inserts;
    // regenerate both to compare canonical forms.
    let incremental_names = collect_names(&incremental.sourcemap());
    let replayed_names = collect_names(&replayed.sourcemap());
    assert_eq!(incremental_names, replayed_names);
}

fn collect_names(value: &serde_json::Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    fn walk(value: &serde_json::Value, out: &mut Vec<(String, String)>) {
        out.push((
            value["name"].as_str().unwrap_or_default().to_owned(),
            value["guid"].as_str().unwrap_or_default().to_owned(),
        ));
        if let Some(children) = value["children"].as_array() {
            for child in children {
                walk(child, out);
            }
        }
    }
    walk(value, &mut out);
    out.sort();
    out
}
