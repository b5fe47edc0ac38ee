mod support;

use predicates::str::contains;

use support::{mainline_cmd, TestResult};

fn json_data(output: &[u8]) -> TestResult<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_slice(output)?;
    assert_eq!(value["schema_version"], "mainline.v1");
    assert_eq!(value["status"], "success");
    Ok(value["data"].clone())
}

#[test]
fn help_lists_command_groups() {
    let root = tempfile::tempdir().expect("tempdir");
    mainline_cmd(root.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("workspace"))
        .stdout(contains("snapshot"))
        .stdout(contains("changelog"));
}

#[test]
fn init_writes_default_config() -> TestResult {
    let root = tempfile::tempdir()?;
    mainline_cmd(root.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("initialized data root"));
    assert!(root.path().join("mainline.toml").exists());

    mainline_cmd(root.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("nothing to do"));
    Ok(())
}

#[test]
fn edit_and_land_through_the_cli() -> TestResult {
    let root = tempfile::tempdir()?;
    let output = mainline_cmd(root.path())
        .args(["--json", "codebase", "create", "demo"])
        .output()?;
    assert!(output.status.success());
    let codebase = json_data(&output.stdout)?["id"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let output = mainline_cmd(root.path())
        .args(["--json", "--actor", "alice", "view", "create", "--codebase", &codebase])
        .output()?;
    let view = json_data(&output.stdout)?;
    let view_id = view["id"].as_str().unwrap_or_default().to_string();
    let view_path = view["path"].as_str().unwrap_or_default().to_string();

    let output = mainline_cmd(root.path())
        .args(["--json", "--actor", "alice", "workspace", "create"])
        .args(["--codebase", &codebase, "--name", "cli"])
        .output()?;
    let workspace = json_data(&output.stdout)?["id"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    mainline_cmd(root.path())
        .args(["--actor", "alice", "view", "open", &view_id, &workspace])
        .assert()
        .success();
    std::fs::write(std::path::Path::new(&view_path).join("hello.txt"), "hello\n")?;

    mainline_cmd(root.path())
        .args(["--actor", "alice", "workspace", "diff", &workspace])
        .assert()
        .success()
        .stdout(contains("hello.txt (new)"));

    mainline_cmd(root.path())
        .args(["--actor", "alice", "workspace", "land", &workspace, "--all"])
        .args(["--message", "Say hello"])
        .assert()
        .success()
        .stdout(contains("Say hello"));

    mainline_cmd(root.path())
        .args(["changelog", "--codebase", &codebase])
        .assert()
        .success()
        .stdout(contains("alice"))
        .stdout(contains("Say hello"));
    Ok(())
}

#[test]
fn errors_map_to_exit_codes() -> TestResult {
    let root = tempfile::tempdir()?;
    mainline_cmd(root.path())
        .args(["workspace", "state", "missing"])
        .assert()
        .code(2)
        .stderr(contains("Workspace not found: missing"));

    let output = mainline_cmd(root.path())
        .args(["--json", "workspace", "land", "missing", "--hunk", "h1", "-m", "x"])
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(value["status"], "error");
    assert_eq!(value["command"], "workspace land");
    assert_eq!(value["error"]["kind"], "not_found");
    Ok(())
}
