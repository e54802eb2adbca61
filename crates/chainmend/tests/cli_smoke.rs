//! CLI smoke tests.
//!
//! Runs the `chainmend` binary against temp replicas and config files and
//! checks exit codes, stdout shape and error guidance.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use chainmend_core::record::{BlockPayload, StateChangeRecord};
use chainmend_core::replica::{ReplicaConfig, SqliteReplica};
use chainmend_core::sink::EntrySink;

// =============================================================================
// Fixtures
// =============================================================================

/// Temp dir with a config file pointing at `replica.db` inside it.
fn setup(extra_toml: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let config_path = dir.path().join("chainmend.toml");
    let replica_path = dir.path().join("replica.db");
    let toml = format!(
        "[replica]\npath = {:?}\n\n[remote]\nnode_url = \"http://127.0.0.1:1\"\nfetch_attempts = 1\ntimeout_secs = 2\n\n{extra_toml}",
        replica_path.display().to_string()
    );
    std::fs::write(&config_path, toml).expect("write config");
    (dir, config_path)
}

fn seed_replica(dir: &Path, heights: impl IntoIterator<Item = u64>) {
    let mut replica = SqliteReplica::open(&ReplicaConfig {
        path: dir.join("replica.db"),
        ..ReplicaConfig::default()
    })
    .expect("open replica");
    let records: Vec<_> = heights
        .into_iter()
        .map(|height| {
            StateChangeRecord::block(
                height.to_le_bytes().repeat(4),
                BlockPayload {
                    height,
                    ..BlockPayload::default()
                },
            )
        })
        .collect();
    replica.begin().expect("begin");
    replica.apply_batch(&records, false).expect("apply");
    replica.commit().expect("commit");
}

fn chainmend(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("chainmend").expect("binary");
    for key in [
        "CHAINMEND_CONFIG",
        "CHAINMEND_NODE_URL",
        "CHAINMEND_WORKERS",
        "CHAINMEND_STATE_CHANGE_DIR",
        "CHAINMEND_REPLICA_PATH",
        "RUST_LOG",
    ] {
        cmd.env_remove(key);
    }
    cmd.arg("--config").arg(config);
    cmd
}

// =============================================================================
// Help and config
// =============================================================================

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("chainmend")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("repair"))
        .stdout(predicate::str::contains("gaps"))
        .stdout(predicate::str::contains("scan-log"));
}

#[test]
fn config_prints_effective_settings() {
    let (_dir, config) = setup("[repair]\nworkers = 12\n");
    chainmend(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("workers = 12"))
        .stdout(predicate::str::contains("commit_interval = 10000"));
}

#[test]
fn env_override_reaches_effective_config() {
    let (_dir, config) = setup("");
    chainmend(&config)
        .env("CHAINMEND_WORKERS", "9")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("workers = 9"));
}

#[test]
fn invalid_config_is_fatal_with_guidance() {
    let (_dir, config) = setup("[repair]\nworkers = 0\n");
    chainmend(&config)
        .arg("gaps")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("repair.workers"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn missing_config_file_is_fatal() {
    let dir = TempDir::new().unwrap();
    chainmend(&dir.path().join("absent.toml"))
        .arg("config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Config file not found"));
}

// =============================================================================
// Gaps and repair
// =============================================================================

#[test]
fn gaps_json_lists_missing_ranges() {
    let (dir, config) = setup("");
    seed_replica(dir.path(), (0..=150).chain(153..=300).chain([302]));

    let output = chainmend(&config)
        .args(["gaps", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(json["total_missing"], 3);
    assert_eq!(json["gaps"][0]["start"], 151);
    assert_eq!(json["gaps"][0]["end"], 152);
    assert_eq!(json["gaps"][1]["size"], 1);
    assert_eq!(json["highest_height"], 302);
}

#[test]
fn gaps_on_missing_replica_is_fatal() {
    let (_dir, config) = setup("");
    chainmend(&config)
        .arg("gaps")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn dry_run_prints_plan_without_fetching() {
    let (dir, config) = setup("");
    seed_replica(dir.path(), (0..=10).chain(12..=5_000).chain([5_500]));

    chainmend(&config)
        .args(["repair", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[11, 11]"))
        .stdout(predicate::str::contains("sequential_remote"))
        .stdout(predicate::str::contains("[5001, 5499]"))
        .stdout(predicate::str::contains("parallel_remote"));
}

#[test]
fn manual_range_needs_both_bounds() {
    let (_dir, config) = setup("");
    chainmend(&config)
        .args(["repair", "--start", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--end"));
}

#[test]
fn unreachable_node_fails_range_with_exit_code_one() {
    let (dir, config) = setup("");
    seed_replica(dir.path(), [0, 3]);

    chainmend(&config)
        .arg("repair")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("0 repaired, 0 skipped, 1 failed"));
}

#[test]
fn scan_log_without_directory_is_fatal() {
    let (_dir, config) = setup("");
    chainmend(&config)
        .arg("scan-log")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("chainmend scan-log").or(predicate::str::contains("binlog")));
}
