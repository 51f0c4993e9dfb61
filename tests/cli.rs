use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn vmlab() -> assert_cmd::Command {
    cargo_bin_cmd!("vmlab").into()
}

fn write_test_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let config_path = dir.path().join("vmlab.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
[paths]
data_dir = "{}"

[hypervisor]
launch = "direct"
"#,
        dir.path().join("data").display()
    )
    .unwrap();
    config_path
}

#[test]
fn help_works() {
    vmlab()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Local VM lifecycle manager"));
}

#[test]
fn missing_config_shows_error() {
    vmlab()
        .args(["--config", "/nonexistent/vmlab.toml", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn malformed_config_shows_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("vmlab.toml");
    std::fs::write(&config_path, "[paths\ndata_dir = ").unwrap();

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config"));
}

#[test]
fn list_with_no_vms() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No VMs."));
}

#[test]
fn list_json_is_empty_array() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "--json", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn get_nonexistent_vm() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "get", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn create_rejects_bad_name() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "create", "-bad"])
        .assert()
        .failure();

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "create", "no/slash"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("VM name must match"));
}

#[test]
fn create_with_missing_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "create",
            "web",
            "--image",
            "no-such-image",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not available locally"));

    // Nothing is left behind for a failed create.
    assert!(!dir.path().join("data/vms/web").exists());
}

#[test]
fn image_add_then_list() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);
    let image = dir.path().join("base.qcow2");
    std::fs::write(&image, b"not really qcow2").unwrap();

    vmlab()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "image",
            "add",
            "base",
            image.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered 'base'"));

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "image", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("base"));
}

#[test]
fn delete_without_terminal_requires_yes() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "delete", "web"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn delete_nonexistent_vm() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "delete", "ghost", "--yes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn exec_requires_a_command() {
    vmlab().args(["exec", "web"]).assert().failure();
}

#[test]
fn logs_for_missing_vm_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    vmlab()
        .args(["--config", config_path.to_str().unwrap(), "logs", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
