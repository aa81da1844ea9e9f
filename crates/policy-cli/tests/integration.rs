#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn policy(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("policy").unwrap();
    cmd.current_dir(dir.path()).env("POLICY_ROOT", dir.path());
    cmd
}

fn init_project(dir: &TempDir) {
    policy(dir).arg("init").assert().success();
}

fn write_rule(dir: &TempDir, id: &str, content: &str) {
    std::fs::write(dir.path().join(format!(".policy/rules/{id}.md")), content).unwrap();
}

const TEST_SYNC: &str = "---
name: Keep tests in sync
set:
  - \"src/{path}.py\"
  - \"tests/{path}_test.py\"
---
Update {expected_files} to cover the changes.
";

const API_DOCS: &str = "---
pair:
  trigger: \"api/{name}.py\"
  expects: \"docs/api/{name}.md\"
---
Document the endpoint change.
";

fn queue_json(dir: &TempDir) -> serde_json::Value {
    let out = policy(dir)
        .args(["queue", "list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&out).unwrap()
}

// ---------------------------------------------------------------------------
// policy init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_policy_tree() {
    let dir = TempDir::new().unwrap();
    policy(&dir).arg("init").assert().success();

    assert!(dir.path().join(".policy/rules").is_dir());
    assert!(dir.path().join(".policy/config.yaml").exists());
    let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert!(gitignore.contains(".policy/queue/"));
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    policy(&dir).arg("init").assert().success();
    policy(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .policy/config.yaml"));
}

// ---------------------------------------------------------------------------
// policy rules
// ---------------------------------------------------------------------------

#[test]
fn rules_list_shows_mode_and_action() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);
    write_rule(&dir, "api-docs", API_DOCS);

    policy(&dir)
        .args(["rules", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("api-docs"))
        .stdout(predicate::str::contains("pair"))
        .stdout(predicate::str::contains("Keep tests in sync"));
}

#[test]
fn malformed_rule_fails_validation() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "broken", "---\ntrigger: \"src/{a.py\"\n---\nbody\n");

    policy(&dir)
        .args(["rules", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("src/{a.py"));
}

#[test]
fn zero_timeout_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".policy/config.yaml"),
        "command_timeout_seconds: 0\n",
    )
    .unwrap();

    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("command_timeout_seconds"));
}

// ---------------------------------------------------------------------------
// policy check
// ---------------------------------------------------------------------------

#[test]
fn check_reports_one_block_per_rule() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);

    let out = policy(&dir)
        .args([
            "check", "--file", "src/a.py", "--file", "src/b.py", "--file", "src/c.py",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches("## ").count(), 1);
    assert!(text.contains("- src/a.py → tests/a_test.py"));
    assert!(text.contains("- src/c.py → tests/c_test.py"));
    assert!(text.contains("<promise>tests</promise>"));
}

#[test]
fn check_is_quiet_when_satisfied() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);

    policy(&dir)
        .args(["check", "--file", "src/a.py", "--file", "tests/a_test.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All policies satisfied."));
}

#[test]
fn pair_only_fires_from_trigger_side() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "api-docs", API_DOCS);

    policy(&dir)
        .args(["check", "--file", "docs/api/users.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All policies satisfied."));
    policy(&dir)
        .args(["check", "--file", "api/users.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("docs/api/users.md"));
}

#[test]
fn repeated_checks_do_not_duplicate_entries() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);

    for _ in 0..3 {
        policy(&dir)
            .args(["check", "--file", "src/a.py"])
            .assert()
            .success();
    }
    assert_eq!(queue_json(&dir).as_array().unwrap().len(), 1);
}

#[test]
fn check_json_includes_rule_outcomes() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);

    let out = policy(&dir)
        .args(["--json", "check", "--file", "src/a.py"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(report["rules"][0]["outcome"], "pending");
    assert_eq!(
        report["rules"][0]["entries"][0]["entry"]["expected_files"][0],
        "tests/a_test.py"
    );
}

#[test]
fn command_rule_runs_and_passes() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(
        &dir,
        "stamp",
        "---\ntrigger: \"src/*.py\"\naction:\n  command: \"printf ok > stamp.txt\"\n  run_for: all_matches\n---\n",
    );

    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 1 command rule: stamp"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("stamp.txt")).unwrap(),
        "ok"
    );
    assert_eq!(queue_json(&dir)[0]["status"], "passed");
}

#[test]
fn non_idempotent_command_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(
        &dir,
        "grow",
        "---\ntrigger: \"src/*.py\"\naction:\n  command: \"echo x >> grow.txt\"\n  run_for: all_matches\n---\n",
    );

    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("## grow [failed]"))
        .stdout(predicate::str::contains("not idempotent"));
    assert_eq!(queue_json(&dir)[0]["status"], "failed");
}

// ---------------------------------------------------------------------------
// policy dismiss / queue
// ---------------------------------------------------------------------------

#[test]
fn dismiss_settles_pending_prompts() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);
    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success();

    policy(&dir)
        .args(["dismiss", "TESTS"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Dismissed 1 queued entry."));
    assert_eq!(queue_json(&dir)[0]["status"], "passed");

    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All policies satisfied."));
}

#[test]
fn transcript_markers_dismiss_before_checking() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);
    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success();

    let transcript = dir.path().join("transcript.txt");
    std::fs::write(&transcript, "Added the test. ✓ <promise>tests</promise>").unwrap();
    policy(&dir)
        .args(["check", "--file", "src/a.py", "--transcript"])
        .arg(&transcript)
        .assert()
        .success()
        .stdout(predicate::str::contains("All policies satisfied."));
}

#[test]
fn dismiss_unknown_rule_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    policy(&dir)
        .args(["dismiss", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rule not found: nope"));
}

#[test]
fn queue_skip_and_prune() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write_rule(&dir, "tests", TEST_SYNC);
    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success();

    let hash = queue_json(&dir)[0]["hash"].as_str().unwrap().to_string();
    policy(&dir)
        .args(["queue", "skip", &hash[..8], "--reason", "generated file"])
        .assert()
        .success();
    policy(&dir)
        .args(["queue", "show", &hash])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped (generated file)"));

    policy(&dir)
        .args(["queue", "prune", "--status", "queued"])
        .assert()
        .failure();
    policy(&dir)
        .args(["queue", "prune"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned 1 entry."));
    assert!(queue_json(&dir).as_array().unwrap().is_empty());
}

#[test]
fn redb_backend_is_selectable() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(
        dir.path().join(".policy/config.yaml"),
        "queue:\n  backend: redb\n",
    )
    .unwrap();
    write_rule(&dir, "tests", TEST_SYNC);

    policy(&dir)
        .args(["check", "--file", "src/a.py"])
        .assert()
        .success();
    assert!(dir.path().join(".policy/queue.redb").exists());
    assert_eq!(queue_json(&dir).as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// policy match
// ---------------------------------------------------------------------------

#[test]
fn match_prints_captures() {
    let dir = TempDir::new().unwrap();
    policy(&dir)
        .args(["match", "src/{path}.py", "src/a/b/c.py", "lib/x.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("src/a/b/c.py: match (path=a/b/c)"))
        .stdout(predicate::str::contains("lib/x.py: no match"));
}

#[test]
fn match_single_segment_does_not_cross_directories() {
    let dir = TempDir::new().unwrap();
    policy(&dir)
        .args(["match", "src/{name}.py", "src/a/b.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("src/a/b.py: no match"));
}
