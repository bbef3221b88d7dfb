//! User configuration, read from a JSON file in the platform config
//! directory. Every field is optional and falls back independently: a bad
//! value for one key never poisons the rest of the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub debug_mode: bool,
    pub sync_dir: PathBuf,
    pub sourcemap_path: PathBuf,
    pub script_extension: String,
    pub file_watch_debounce: Duration,
    pub delete_orphans_on_connect: bool,
    pub suffix_module_scripts: bool,
    pub request_snapshot_on_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            debug_mode: false,
            sync_dir: PathBuf::from("./sync"),
            sourcemap_path: PathBuf::from("./sourcemap.json"),
            script_extension: ".luau".to_owned(),
            file_watch_debounce: Duration::from_millis(100),
            delete_orphans_on_connect: false,
            suffix_module_scripts: false,
            request_snapshot_on_connect: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// `<config dir>/azul/config.json`, e.g. `~/.config/azul/config.json`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("azul").join("config.json"))
}

/// Loads the user config, falling back to defaults on any error. The error
/// is logged once here so callers can stay on the happy path.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        log::debug!("No platform config directory; using default config");
        return Config::default();
    };

    if !path.exists() {
        return Config::default();
    }

    match load_from(&path) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("{err}; using default config");
            Config::default()
        }
    }
}

pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs_err::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;

    let value: serde_json::Value =
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

    Ok(from_value(&value))
}

/// Field-by-field extraction with per-field fallback. Unknown keys are
/// ignored by construction.
fn from_value(value: &serde_json::Value) -> Config {
    let mut config = Config::default();

    if let Some(port) = value.get("port") {
        match port.as_u64().filter(|p| (1..=u64::from(u16::MAX)).contains(p)) {
            Some(port) => config.port = port as u16,
            None => log::warn!("Ignoring invalid \"port\" in config: {port}"),
        }
    }

    read_bool(value, "debugMode", &mut config.debug_mode);
    read_bool(
        value,
        "deleteOrphansOnConnect",
        &mut config.delete_orphans_on_connect,
    );
    read_bool(
        value,
        "suffixModuleScripts",
        &mut config.suffix_module_scripts,
    );
    read_bool(
        value,
        "requestSnapshotOnConnect",
        &mut config.request_snapshot_on_connect,
    );

    if let Some(dir) = value.get("syncDir") {
        match dir.as_str().filter(|s| !s.is_empty()) {
            Some(dir) => config.sync_dir = PathBuf::from(dir),
            None => log::warn!("Ignoring invalid \"syncDir\" in config: {dir}"),
        }
    }

    if let Some(path) = value.get("sourcemapPath") {
        match path.as_str().filter(|s| !s.is_empty()) {
            Some(path) => config.sourcemap_path = PathBuf::from(path),
            None => log::warn!("Ignoring invalid \"sourcemapPath\" in config: {path}"),
        }
    }

    if let Some(ext) = value.get("scriptExtension") {
        match ext.as_str().filter(|s| !s.is_empty()) {
            Some(ext) => {
                config.script_extension = if ext.starts_with('.') {
                    ext.to_owned()
                } else {
                    format!(".{ext}")
                };
            }
            None => log::warn!("Ignoring invalid \"scriptExtension\" in config: {ext}"),
        }
    }

    if let Some(debounce) = value.get("fileWatchDebounce") {
        match debounce.as_u64().filter(|ms| *ms > 0) {
            Some(ms) => config.file_watch_debounce = Duration::from_millis(ms),
            None => log::warn!("Ignoring invalid \"fileWatchDebounce\" in config: {debounce}"),
        }
    }

    config
}

fn read_bool(value: &serde_json::Value, key: &str, target: &mut bool) {
    if let Some(field) = value.get(key) {
        match field.as_bool() {
            Some(flag) => *target = flag,
            None => log::warn!("Ignoring invalid \"{key}\" in config: {field}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(json: &str) -> Config {
        from_value(&serde_json::from_str(json).unwrap())
    }

    #[test]
    fn empty_object_yields_defaults() {
        assert_eq!(parse("{}"), Config::default());
    }

    #[test]
    fn all_fields_parse() {
        let config = parse(
            r#"{
                "port": 9000,
                "debugMode": true,
                "syncDir": "./game/src",
                "sourcemapPath": "./game/sourcemap.json",
                "scriptExtension": ".lua",
                "fileWatchDebounce": 250,
                "deleteOrphansOnConnect": true,
                "suffixModuleScripts": true,
                "requestSnapshotOnConnect": false
            }"#,
        );

        assert_eq!(config.port, 9000);
        assert!(config.debug_mode);
        assert_eq!(config.sync_dir, PathBuf::from("./game/src"));
        assert_eq!(config.sourcemap_path, PathBuf::from("./game/sourcemap.json"));
        assert_eq!(config.script_extension, ".lua");
        assert_eq!(config.file_watch_debounce, Duration::from_millis(250));
        assert!(config.delete_orphans_on_connect);
        assert!(config.suffix_module_scripts);
        assert!(!config.request_snapshot_on_connect);
    }

    #[test]
    fn invalid_values_fall_back_per_field() {
        let config = parse(
            r#"{
                "port": 0,
                "debugMode": "yes",
                "syncDir": "",
                "fileWatchDebounce": -5,
                "scriptExtension": 7
            }"#,
        );

        assert_eq!(config, Config::default());
    }

    #[test]
    fn one_bad_field_does_not_poison_the_rest() {
        let config = parse(r#"{"port": 70000, "debugMode": true}"#);
        assert_eq!(config.port, 8080);
        assert!(config.debug_mode);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = parse(r#"{"futureOption": [1, 2, 3], "port": 4242}"#);
        assert_eq!(config.port, 4242);
    }

    #[test]
    fn extension_gains_leading_dot() {
        let config = parse(r#"{"scriptExtension": "lua"}"#);
        assert_eq!(config.script_extension, ".lua");
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_from_bad_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs_err::write(&path, "{nope").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs_err::write(&path, r#"{"port": 5151}"#).unwrap();
        assert_eq!(load_from(&path).unwrap().port, 5151);
    }
}
