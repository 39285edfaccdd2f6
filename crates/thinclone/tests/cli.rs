//! Command-line smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn thinclone() -> Command {
    let mut cmd = Command::cargo_bin("thinclone").unwrap();
    cmd.env_remove("THINCLONE_CONFIG");
    cmd
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("server.yml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn help_lists_commands() {
    thinclone()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pools"))
        .stdout(predicate::str::contains("refresh-candidate"))
        .stdout(predicate::str::contains("check-config"));
}

#[test]
fn valid_config_passes_the_check() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "poolManager:\n  mountDir: /var/lib/thinclone\nprovision:\n  portPool:\n    from: 6000\n    to: 6010\n",
    );

    thinclone()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn invalid_port_range_fails_the_check() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "provision:\n  portPool:\n    from: 6010\n    to: 6000\n");

    thinclone()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("portPool.from"));
}

#[test]
fn config_path_comes_from_the_environment() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "provision:\n  image: \"\"\n");

    thinclone()
        .env("THINCLONE_CONFIG", &path)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("image must not be empty"));
}

#[test]
fn empty_mount_directory_has_no_pools() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "");

    thinclone()
        .arg("--config")
        .arg(&path)
        .arg("--mount-dir")
        .arg(dir.path().join("pools"))
        .arg("pools")
        .assert()
        .failure();
}
