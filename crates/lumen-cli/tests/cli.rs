//! CLI command integration tests.
//! Each test works in its own temp directory and ignores any ambient config.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const SMALL_CONFIG: &str = r#"
[morph.counts]
idle = 256
presence = 384
environment = 512
thinking = 256
alert = 192
"#;

fn lumen_cmd() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("lumen").unwrap();
    cmd.env_remove("LUMEN_CONFIG")
        .env_remove("LUMEN_TARGET_FPS")
        .env_remove("LUMEN_BACKEND")
        .env_remove("LUMEN_ATTRIBUTES")
        .env_remove("RUST_LOG");
    cmd
}

fn small_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("lumen.toml");
    std::fs::write(&path, SMALL_CONFIG).unwrap();
    path
}

#[test]
fn simulate_then_decode() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir);
    let recording = dir.path().join("frames.lumen");

    lumen_cmd()
        .arg("--config")
        .arg(&config)
        .args(["simulate", "--frames", "45", "--at", "11:interaction.user_present=true", "--out"])
        .arg(&recording)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote 45 frames"))
        .stdout(predicate::str::contains("idle -> presence"));

    let output = lumen_cmd().arg("decode").arg(&recording).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("45 frames"));
    let lines: Vec<&str> = stdout.lines().filter(|l| l.starts_with("frame")).collect();
    assert_eq!(lines.len(), 45);
    assert!(lines[0].contains("mode=idle"));
    assert!(lines[0].contains("particles=256"));
    assert!(lines[10].contains("mode=presence"));
    assert!(lines[10].contains("blending"));
    assert!(lines[44].contains("particles=384"));
    assert!(!lines[44].contains("blending"));
}

#[test]
fn simulate_position_only_with_reference_backend() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir);
    let recording = dir.path().join("accel.lumen");

    lumen_cmd()
        .arg("--config")
        .arg(&config)
        .args([
            "simulate",
            "--frames",
            "5",
            "--backend",
            "reference",
            "--attributes",
            "position",
            "--set",
            "threat.level=0.9",
            "-o",
        ])
        .arg(&recording)
        .assert()
        .success()
        .stdout(predicate::str::contains("modes: alert"));

    lumen_cmd()
        .args(["decode", "--json"])
        .arg(&recording)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"layout\":\"position\""))
        .stdout(predicate::str::contains("\"particle_count\":192"));
}

#[test]
fn simulate_rejects_bad_config() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[engine]\nbackend = \"quantum\"\n").unwrap();

    lumen_cmd()
        .arg("--config")
        .arg(&config)
        .args(["simulate", "--frames", "1", "--out"])
        .arg(dir.path().join("never.lumen"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("engine.backend"));
}

#[test]
fn decode_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.lumen");
    std::fs::write(&path, [4u8, 0, 0, 0, 1, 2, 3, 4]).unwrap();

    lumen_cmd()
        .arg("decode")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not decode"));
}

#[test]
fn layout_lists_slots_and_triggers() {
    lumen_cmd()
        .arg("layout")
        .assert()
        .success()
        .stdout(predicate::str::contains("feature layout v1 (120 slots)"))
        .stdout(predicate::str::contains("environment.temperature"))
        .stdout(predicate::str::contains("[threat] slots 32..40"))
        .stdout(predicate::str::contains("mode.override"))
        .stdout(predicate::str::contains("interaction.user_present == true"));
}

#[test]
fn health_against_unreachable_daemon() {
    lumen_cmd()
        .args(["health", "--url", "http://127.0.0.1:9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot reach"));
}
