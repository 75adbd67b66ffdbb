//! Configuration loading and root folder resolution tests
//!
//! - Missing TOML files do not prevent startup (defaults + warning)
//! - Root folder priority: CLI → LMSYNC_ROOT → TOML → default
//! - Atomic TOML write-back round-trips
//!
//! Tests that touch LMSYNC_ROOT are marked #[serial] so they never run in
//! parallel with each other.

use lmsync_common::config::{
    config_file_path, default_root_folder, load_toml_config, write_toml_config, LmsSection,
    RootFolderInitializer, RootFolderResolver, RunSection, TomlConfig, ROOT_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
#[serial]
fn test_resolver_with_no_overrides_uses_default() {
    env::remove_var(ROOT_ENV_VAR);

    let resolved = RootFolderResolver::new("lmsync-import").resolve();
    assert_eq!(resolved, default_root_folder());
}

#[test]
#[serial]
fn test_resolver_env_var_beats_toml() {
    env::set_var(ROOT_ENV_VAR, "/srv/from-env");

    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/srv/from-toml")),
        ..Default::default()
    };
    let resolved = RootFolderResolver::new("lmsync-import")
        .with_toml_config(&config)
        .resolve();

    env::remove_var(ROOT_ENV_VAR);
    assert_eq!(resolved, PathBuf::from("/srv/from-env"));
}

#[test]
#[serial]
fn test_resolver_blank_env_var_ignored() {
    env::set_var(ROOT_ENV_VAR, "   ");

    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/srv/from-toml")),
        ..Default::default()
    };
    let resolved = RootFolderResolver::new("lmsync-import")
        .with_toml_config(&config)
        .resolve();

    env::remove_var(ROOT_ENV_VAR);
    assert_eq!(resolved, PathBuf::from("/srv/from-toml"));
}

#[test]
#[serial]
fn test_resolver_cli_beats_env() {
    env::set_var(ROOT_ENV_VAR, "/srv/from-env");

    let resolved = RootFolderResolver::new("lmsync-import")
        .with_cli_arg(Some(PathBuf::from("/srv/from-cli")))
        .resolve();

    env::remove_var(ROOT_ENV_VAR);
    assert_eq!(resolved, PathBuf::from("/srv/from-cli"));
}

#[test]
fn test_missing_config_file_returns_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config = load_toml_config(&temp_dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
fn test_invalid_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "[lms\nendpoint = ").unwrap();

    let result = load_toml_config(&path);
    assert!(matches!(result, Err(lmsync_common::Error::Config(_))));
}

#[test]
fn test_toml_write_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("lmsync").join("lmsync-import.toml");

    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/srv/lmsync")),
        lms: LmsSection {
            endpoint: Some("https://lms.example.org/manifest".to_string()),
            schema_profile: Some("moodle".to_string()),
            max_attempts: Some(5),
            local_files: [(
                "https://lms.example.org/files/week1.pdf".to_string(),
                PathBuf::from("/srv/export/week1.pdf"),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        },
        run: RunSection {
            lock_ttl_secs: Some(600),
            failure_webhook: Some("https://ops.example.org/hooks/lmsync".to_string()),
        },
        ..Default::default()
    };

    write_toml_config(&config, &path).unwrap();
    assert!(!path.with_extension("toml.tmp").exists(), "temp file left behind");

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_initializer_creates_nested_directory() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("a").join("b");

    let initializer = RootFolderInitializer::new(root.clone());
    initializer.ensure_directory_exists().unwrap();
    initializer.ensure_directory_exists().unwrap();

    assert!(root.is_dir());
    assert_eq!(initializer.database_path(), root.join("lmsync.db"));
}

#[test]
fn test_module_name_in_config_path() {
    if let Some(path) = config_file_path("lmsync-import") {
        assert!(path.ends_with("lmsync/lmsync-import.toml"));
    }
}
