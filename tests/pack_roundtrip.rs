//! The pack → build round-trip law: packing a property-bearing snapshot and
//! then building from the resulting sourcemap reproduces the snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use libazul::cli::instances_from_sourcemap;
use libazul::{
    build_packed_sourcemap, Config, IncomingMessage, InstanceData, PackMode, PathSuppressor,
    ScriptWriter, SourcemapService, SyncEngine,
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

fn props(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn pack_then_build_reproduces_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        sync_dir: dir.path().join("sync"),
        sourcemap_path: dir.path().join("sourcemap.json"),
        ..Config::default()
    };

    // A live session projects the scripts and writes the initial sourcemap.
    let base = dir.path().canonicalize().unwrap();
    let writer = ScriptWriter::new(
        &config.sync_dir,
        &config.script_extension,
        config.suffix_module_scripts,
        Arc::new(PathSuppressor::new()),
    )
    .unwrap();
    let service = SourcemapService::with_relative_base(&config.sourcemap_path, &base);
    let mut engine = SyncEngine::new(
        config,
        writer,
        SourcemapService::with_relative_base(&dir.path().join("sourcemap.json"), &base),
    );

    engine.handle_connected();
    engine.handle_message(IncomingMessage::FullSnapshot {
        data: vec![
            instance("ws00", "Workspace", "Workspace", &["Workspace"], None, None),
            instance(
                "util",
                "ModuleScript",
                "Util",
                &["Workspace", "Util"],
                Some("ws00"),
                Some("return {}"),
            ),
        ],
    });

    // The pack command's snapshot carries properties and attributes.
    let mut packed_snapshot = vec![
        instance("ws00", "Workspace", "Workspace", &["Workspace"], None, None),
        instance(
            "util",
            "ModuleScript",
            "Util",
            &["Workspace", "Util"],
            Some("ws00"),
            None,
        ),
    ];
    packed_snapshot[0].properties = Some(props(&[("Gravity", serde_json::json!(196.2))]));
    packed_snapshot[1].properties = Some(props(&[("RunContext", serde_json::json!("Server"))]));
    packed_snapshot[1].attributes = Some(props(&[("Version", serde_json::json!(2))]));

    let existing = service.load().unwrap();
    let packed = build_packed_sourcemap(
        &service,
        &packed_snapshot,
        existing.as_ref(),
        PackMode::Full,
        "2024-06-01T12:00:00+00:00".to_owned(),
    );
    service.write(&packed).unwrap();

    // The written file carries the pack stamp.
    let raw: serde_json::Value =
        serde_json::from_str(&fs_err::read_to_string(dir.path().join("sourcemap.json")).unwrap())
            .unwrap();
    assert_eq!(raw["_azul"]["packVersion"], 1);
    assert_eq!(raw["_azul"]["mode"], "full");
    assert_eq!(raw["_azul"]["packedAt"], "2024-06-01T12:00:00+00:00");

    // Build from the packed sourcemap alone.
    let loaded = service.load().unwrap().unwrap();
    let built = instances_from_sourcemap(&loaded, dir.path());

    assert_eq!(built.len(), packed_snapshot.len());

    // Sorted by path length, the stream matches the packed snapshot.
    for expected in &packed_snapshot {
        let actual = built
            .iter()
            .find(|data| data.guid == expected.guid)
            .unwrap_or_else(|| panic!("missing instance {}", expected.name));

        assert_eq!(actual.class_name, expected.class_name);
        assert_eq!(actual.name, expected.name);
        assert_eq!(actual.path, expected.path);
        assert_eq!(actual.properties, expected.properties);
        assert_eq!(actual.attributes, expected.attributes);
    }

    // The script body comes back from disk via the preserved filePaths.
    let util = built.iter().find(|data| data.guid == "util").unwrap();
    assert_eq!(util.source.as_deref(), Some("return {}"));

    // Parents appear before children.
    let ws_index = built.iter().position(|d| d.guid == "ws00").unwrap();
    let util_index = built.iter().position(|d| d.guid == "util").unwrap();
    assert!(ws_index < util_index);

    // And the packed map still points at real files.
    let validation = service.validate(&loaded);
    assert!(validation.valid, "{:?}", validation.errors);
}
