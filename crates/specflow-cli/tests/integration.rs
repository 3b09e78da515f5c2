use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn specflow(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("specflow").unwrap();
    cmd.current_dir(dir.path())
        .env("SPECFLOW_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

/// Initialized project whose agent is `true` and which never commits.
fn init_project(dir: &TempDir) {
    specflow(dir).arg("init").assert().success();
    std::fs::write(
        dir.path().join(".specflow/config.yaml"),
        "version: 1\n\
         project:\n  name: shop\n\
         agent:\n  command: \"true\"\n  args: []\n\
         commit:\n  enabled: false\n\
         retry:\n  max_attempts: 1\n  initial_delay_ms: 1\n\
         \x20 backoff_multiplier: 2\n  max_delay_ms: 1\n",
    )
    .unwrap();
}

fn json_out(cmd: &mut Command) -> Value {
    let out = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

fn phase(dir: &TempDir, feature: &str) -> String {
    let v = json_out(specflow(dir).args(["status", feature]));
    v["flow"]["phase"]["type"].as_str().unwrap().to_string()
}

fn write_tasks(dir: &TempDir, feature: &str, body: &str) {
    let path = dir.path().join(format!(".specflow/flows/{feature}/tasks.md"));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn write_plugin(root: &Path, name: &str, points: &[&str], contributions: Value) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = json!({
        "name": name,
        "version": "1.0.0",
        "description": format!("{name} plugin"),
        "entryPoint": "contributions.json",
        "compatibleCliVersion": ">=0.1.0",
        "extensionPoints": points,
        "configSchema": {"properties": {"greeting": {"type": "string"}}}
    });
    std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
    std::fs::write(dir.join("contributions.json"), contributions.to_string()).unwrap();
    dir
}

// ---------------------------------------------------------------------------
// init / config
// ---------------------------------------------------------------------------

#[test]
fn init_creates_directory_tree() {
    let dir = TempDir::new().unwrap();
    specflow(&dir).arg("init").assert().success();

    assert!(dir.path().join(".specflow/flows").is_dir());
    assert!(dir.path().join(".specflow/plugins").is_dir());
    assert!(dir.path().join(".specflow/config.yaml").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    specflow(&dir).arg("init").assert().success();
    specflow(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists"));
}

#[test]
fn commands_require_init() {
    let dir = TempDir::new().unwrap();
    specflow(&dir)
        .args(["start", "coupon", "-d", "coupons"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir).args(["config", "validate"]).assert().success();

    std::fs::write(
        dir.path().join(".specflow/config.yaml"),
        "version: 1\nproject:\n  name: shop\nhooks:\n  timeout_secs: 0\n",
    )
    .unwrap();
    specflow(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"));
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

#[test]
fn start_creates_flow_and_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    let v = json_out(specflow(&dir).args(["start", "coupon", "-d", "coupons at checkout"]));
    assert_eq!(v["phase"]["type"], "requirements-generating");
    assert_eq!(v["metadata"]["mode"], "greenfield");
    assert!(dir.path().join(".specflow/flows/coupon/flow-state.json").exists());

    specflow(&dir)
        .args(["start", "coupon", "-d", "again"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    specflow(&dir)
        .args(["start", "Bad_Name", "-d", "x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid feature name"));
}

#[test]
fn illegal_event_fails_without_changing_state() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir)
        .args(["start", "coupon", "-d", "coupons"])
        .assert()
        .success();

    specflow(&dir)
        .args(["approve", "coupon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid transition"));
    assert_eq!(phase(&dir, "coupon"), "requirements-generating");
}

#[test]
fn greenfield_flow_end_to_end() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir)
        .args(["start", "checkout-coupon", "-d", "apply coupons"])
        .assert()
        .success();

    for review in ["requirements-approval", "design-approval", "tasks-approval"] {
        specflow(&dir).args(["run", "checkout-coupon"]).assert().success();
        assert_eq!(phase(&dir, "checkout-coupon"), review);
        specflow(&dir).args(["approve", "checkout-coupon"]).assert().success();
    }
    assert_eq!(phase(&dir, "checkout-coupon"), "implementing");

    write_tasks(
        &dir,
        "checkout-coupon",
        "# Tasks\n- [ ] model\n- [ ] service\n- [ ] endpoint\n- [ ] ui\n- [ ] docs\n",
    );
    let v = json_out(specflow(&dir).args(["run", "checkout-coupon", "--yes"]));
    assert_eq!(v["outcome"]["outcome"], "awaiting_decision");
    assert_eq!(v["flow"]["phase"]["type"], "merge-decision");

    specflow(&dir).args(["merge", "checkout-coupon"]).assert().success();
    assert_eq!(phase(&dir, "checkout-coupon"), "complete");

    let list = json_out(specflow(&dir).arg("list"));
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[test]
fn reject_returns_to_generation() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir).args(["start", "coupon", "-d", "c"]).assert().success();
    specflow(&dir).args(["advance", "coupon"]).assert().success();
    specflow(&dir).args(["reject", "coupon"]).assert().success();
    assert_eq!(phase(&dir, "coupon"), "requirements-generating");
}

#[test]
fn brownfield_inserts_gap_analysis() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir)
        .args(["start", "legacy", "-d", "retrofit", "--mode", "brownfield"])
        .assert()
        .success();
    specflow(&dir).args(["run", "legacy"]).assert().success();
    specflow(&dir).args(["approve", "legacy"]).assert().success();
    assert_eq!(phase(&dir, "legacy"), "gap-analysis");
}

#[test]
fn agent_failure_enters_error_and_resume_retries() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let config = dir.path().join(".specflow/config.yaml");
    let text = std::fs::read_to_string(&config).unwrap();
    std::fs::write(&config, text.replace("command: \"true\"", "command: \"false\"")).unwrap();

    specflow(&dir).args(["start", "coupon", "-d", "c"]).assert().success();
    specflow(&dir)
        .args(["run", "coupon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("requirements-generating failed"));
    assert_eq!(phase(&dir, "coupon"), "error");
    specflow(&dir)
        .args(["status", "coupon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("specflow resume coupon"));

    std::fs::write(&config, text).unwrap();
    specflow(&dir).args(["resume", "coupon"]).assert().success();
    assert_eq!(phase(&dir, "coupon"), "requirements-generating");
    specflow(&dir).args(["run", "coupon"]).assert().success();
    assert_eq!(phase(&dir, "coupon"), "requirements-approval");
}

#[test]
fn abort_is_terminal() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir).args(["start", "coupon", "-d", "c"]).assert().success();
    specflow(&dir)
        .args(["abort", "coupon", "--reason", "descoped"])
        .assert()
        .success();
    assert_eq!(phase(&dir, "coupon"), "aborted");
    specflow(&dir).args(["resume", "coupon"]).assert().failure();
}

#[test]
fn status_of_unknown_flow_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    specflow(&dir)
        .args(["status", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("flow not found"));
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

#[test]
fn plugin_install_list_and_run_command() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let src = TempDir::new().unwrap();
    let plugin = write_plugin(
        src.path(),
        "greeter",
        &["commands"],
        json!({"commands": [{"name": "greet", "run": "echo \"hello $1\""}]}),
    );

    specflow(&dir)
        .args(["plugin", "install", plugin.to_str().unwrap()])
        .assert()
        .success();
    assert!(dir.path().join(".specflow/plugins/greeter/plugin.json").exists());

    let list = json_out(specflow(&dir).args(["plugin", "list"]));
    assert_eq!(list[0]["manifest"]["name"], "greeter");
    assert_eq!(list[0]["state"], "enabled");

    specflow(&dir)
        .args(["greet", "world"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello world"));

    specflow(&dir).args(["plugin", "disable", "greeter"]).assert().success();
    specflow(&dir)
        .args(["greet", "world"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown command"));

    specflow(&dir).args(["plugin", "uninstall", "greeter"]).assert().success();
    assert!(!dir.path().join(".specflow/plugins/greeter").exists());
}

#[test]
fn plugin_with_mismatched_extension_points_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let src = TempDir::new().unwrap();
    let plugin = write_plugin(
        src.path(),
        "liar",
        &["commands", "agents"],
        json!({"commands": [{"name": "hi", "run": "echo hi"}]}),
    );

    specflow(&dir)
        .args(["plugin", "validate", plugin.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("agents"));
    specflow(&dir)
        .args(["plugin", "install", plugin.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn plugin_config_is_validated_against_schema() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let src = TempDir::new().unwrap();
    let plugin = write_plugin(
        src.path(),
        "greeter",
        &["commands"],
        json!({"commands": [{"name": "greet", "run": "echo hi"}]}),
    );
    specflow(&dir)
        .args(["plugin", "install", plugin.to_str().unwrap()])
        .assert()
        .success();

    specflow(&dir)
        .args(["plugin", "config", "set", "greeter", "greeting", "hey"])
        .assert()
        .success();
    specflow(&dir)
        .args(["plugin", "config", "get", "greeter", "greeting"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hey"));
    specflow(&dir)
        .args(["plugin", "config", "set", "greeter", "colour", "red"])
        .assert()
        .failure();
}

#[test]
fn pre_phase_hook_veto_blocks_run() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let src = TempDir::new().unwrap();
    let plugin = write_plugin(
        src.path(),
        "policy",
        &["hooks"],
        json!({"hooks": [{
            "phase": "requirements-generating",
            "timing": "pre",
            "run": "cat >/dev/null; echo '{\"action\":\"veto\",\"reason\":\"ticket missing\"}'"
        }]}),
    );
    specflow(&dir)
        .args(["plugin", "install", plugin.to_str().unwrap()])
        .assert()
        .success();

    specflow(&dir).args(["start", "coupon", "-d", "c"]).assert().success();
    specflow(&dir)
        .args(["run", "coupon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("vetoed by plugin 'policy': ticket missing"));
    assert_eq!(phase(&dir, "coupon"), "requirements-generating");
}
