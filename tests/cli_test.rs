use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn burrow() -> Command {
    let mut cmd = Command::cargo_bin("burrow").unwrap();
    cmd.env_remove("BURROW_CONFIG").env("RUST_LOG", "off");
    cmd
}

fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

#[test]
fn test_init_writes_valid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();

    burrow()
        .args(["init", "--config", path])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote starter config"));
    assert!(Path::new(path).exists());

    burrow()
        .args(["check", "--config", path])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok    postgres"));

    // A second init refuses to clobber the file.
    burrow()
        .args(["init", "--config", path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    burrow()
        .args(["init", "--force", "--config", path])
        .assert()
        .success();
}

#[test]
fn test_check_reports_invalid_tunnels() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "config.toml",
        r#"
[[tunnels]]
name = "good"
host = "bastion.example.com"
username = "deploy"
identity_file = "~/.ssh/id_ed25519"
local_port = 5433
remote_host = "localhost"
remote_port = 5432

[[tunnels]]
name = "nocreds"
host = "bastion.example.com"
username = "deploy"
remote_host = "localhost"
remote_port = 6379
"#,
    );

    burrow()
        .args(["check", "--config", &path])
        .assert()
        .failure()
        .stdout(predicate::str::contains("ok    good"))
        .stdout(predicate::str::contains("FAIL  nocreds"));
}

#[test]
fn test_list_shows_configured_tunnels() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "config.toml",
        r#"
[[tunnels]]
name = "redis"
host = "cache-bastion"
username = "ops"
password = "hunter2"
remote_host = "redis.internal"
remote_port = 6379
"#,
    );

    burrow()
        .args(["list", "--config", &path])
        .assert()
        .success()
        .stdout(predicate::str::contains("redis"))
        .stdout(predicate::str::contains("redis.internal:6379"))
        .stdout(predicate::str::contains("auto"))
        .stdout(predicate::str::contains("hunter2").not());
}

#[test]
fn test_keygen_to_stdout() {
    burrow()
        .arg("keygen")
        .assert()
        .success()
        .stdout(predicate::str::contains("BEGIN OPENSSH PRIVATE KEY"))
        .stdout(predicate::str::contains("ssh-ed25519 "))
        .stderr(predicate::str::contains("SHA256:"));
}

#[test]
fn test_keygen_then_import_key() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("id_burrow");
    let key_path = key_path.to_str().unwrap();

    burrow()
        .args(["keygen", "--algorithm", "ecdsa", "--output", key_path])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fingerprint: SHA256:"));

    let public = fs::read_to_string(format!("{key_path}.pub")).unwrap();
    assert!(public.starts_with("ecdsa-sha2-nistp256 "));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    burrow()
        .args(["import-key", key_path])
        .assert()
        .success()
        .stdout(predicate::str::contains("Type:        ecdsa"))
        .stdout(predicate::str::contains("Encrypted:   no"));

    // Refuses to overwrite an existing key.
    burrow()
        .args(["keygen", "--output", key_path])
        .assert()
        .failure();
}

#[test]
fn test_import_key_rejects_non_key_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "notes.txt", "just some notes\n");

    burrow()
        .args(["import-key", &path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid key format"));
}

#[test]
fn test_up_without_tunnels_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "config.toml", "[settings]\nport_base = 4000\n");

    burrow()
        .args(["up", "--config", &path])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No tunnels configured"));
}
