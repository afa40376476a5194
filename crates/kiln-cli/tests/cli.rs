//! End-to-end tests for the kiln binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn kiln(workspace: &Path) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd.arg("--config")
        .arg(workspace.join("config.toml"))
        .env_remove("KILN_ENGINE_CACHE_ENABLE")
        .env_remove("KILN_ENGINE_CACHE_PATH")
        .env_remove("KILN_EAGER_PERSIST");
    cmd
}

fn simulate(workspace: &Path, cache: &Path, shapes: &[&str]) -> Command {
    let mut cmd = kiln(workspace);
    cmd.args(["simulate", "--graph", "cachingtest"])
        .args(["--input", "X=1,-1,-1", "--input", "Y=1,-1,-1", "--input", "Z=1,-1,-1"])
        .arg("--dir")
        .arg(cache);
    for shape in shapes {
        cmd.args(["--shape", shape]);
    }
    cmd
}

fn count_files(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(extension))
                .count()
        })
        .unwrap_or(0)
}

fn find_file(dir: &Path, extension: &str) -> PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.to_string_lossy().ends_with(extension))
        .unwrap()
}

#[test]
fn test_help() {
    let workspace = TempDir::new().unwrap();
    kiln(workspace.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn test_simulate_writes_one_engine_and_profile() {
    let workspace = TempDir::new().unwrap();
    let cache = workspace.path().join("cache");

    simulate(workspace.path(), &cache, &["1,3,2", "1,1,6", "1,1,6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hit"));

    assert_eq!(count_files(&cache, ".engine"), 1);
    assert_eq!(count_files(&cache, ".profile"), 1);
}

#[test]
fn test_simulate_json_reports_builds_and_hits() {
    let workspace = TempDir::new().unwrap();
    let cache = workspace.path().join("cache");

    let output = simulate(workspace.path(), &cache, &["1,3,2", "1,3,2"])
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["stats"]["builds"], 1);
    assert_eq!(report["stats"]["hits"], 1);
    assert_eq!(report["flush"]["written"][0], "cachingtest");

    // A second run reuses the persisted engine
    let output = simulate(workspace.path(), &cache, &["1,3,2"])
        .arg("--json")
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["stats"]["loaded_from_disk"], 1);
    assert_eq!(report["stats"]["builds"], 0);
}

#[test]
fn test_simulate_static_mismatch_is_reported() {
    let workspace = TempDir::new().unwrap();
    let cache = workspace.path().join("cache");

    kiln(workspace.path())
        .args(["simulate", "--graph", "static", "--input", "X=1,3,2"])
        .args(["--shape", "1,3,2", "--shape", "1,1,6"])
        .arg("--dir")
        .arg(&cache)
        .assert()
        .success()
        .stdout(predicate::str::contains("STATIC_SHAPE_MISMATCH"));

    assert_eq!(count_files(&cache, ".engine"), 1);
    assert_eq!(count_files(&cache, ".profile"), 0);
}

#[test]
fn test_list_inspect_and_purge() {
    let workspace = TempDir::new().unwrap();
    let cache = workspace.path().join("cache");
    simulate(workspace.path(), &cache, &["1,3,2"]).assert().success();

    kiln(workspace.path())
        .args(["list", "--dir"])
        .arg(&cache)
        .assert()
        .success()
        .stdout(predicate::str::contains("cachingtest-").and(predicate::str::contains(".profile")));

    let profile = find_file(&cache, ".profile");
    assert!(profile
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("cachingtest-"));

    kiln(workspace.path())
        .arg("inspect")
        .arg(&profile)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"X\""));

    kiln(workspace.path())
        .args(["purge", "--kind", "engine", "--dir"])
        .arg(&cache)
        .assert()
        .success();
    assert_eq!(count_files(&cache, ".engine"), 0);
    assert_eq!(count_files(&cache, ".profile"), 1);
}

#[test]
fn test_inspect_rejects_corrupt_profile() {
    let workspace = TempDir::new().unwrap();
    let path = workspace.path().join("broken.profile");
    std::fs::write(&path, [1u8, 0, 0, 0, 9]).unwrap();

    kiln(workspace.path())
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("PROFILE_CORRUPT"));
}
