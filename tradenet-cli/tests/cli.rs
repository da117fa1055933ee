//! End-to-end checks of the `tradenet` binary's offline subcommands

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn tradenet(args: &[&str], data_dir: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tradenet"))
        .args(args)
        .env("TRADENET_PERSISTENCE_DATA_DIR", data_dir)
        .env("TRADENET_LOG_LEVEL", "warn")
        .output()
        .expect("failed to run tradenet")
}

#[test]
fn test_init_config_writes_loadable_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node.toml");
    let path_arg = path.to_str().unwrap();

    let output = tradenet(&["init-config", path_arg], dir.path());
    assert!(output.status.success());
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("[broadcast]"));

    // Second run refuses to clobber
    let output = tradenet(&["init-config", path_arg], dir.path());
    assert!(!output.status.success());

    let output = tradenet(&["--config", path_arg, "inspect"], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn test_inspect_empty_data_dir_as_json() {
    let dir = TempDir::new().unwrap();

    let output = tradenet(&["inspect", "--json"], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["records"], 0);
    assert_eq!(summary["append_only"], 0);
    assert_eq!(summary["records_by_kind"]["offer"], 0);
}

#[test]
fn test_purge_sequences_writes_snapshot() {
    let dir = TempDir::new().unwrap();

    let output = tradenet(&["purge-sequences"], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Purged 0 of 0"));
    assert!(dir.path().join("sequence_map.bin").exists());
}

#[test]
fn test_corrupt_state_fails_inspect() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("append_only.bin"), b"not a snapshot").unwrap();

    let output = tradenet(&["inspect"], dir.path());
    assert!(!output.status.success());
}
