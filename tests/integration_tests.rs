use assert_cmd::Command;
use predicates::prelude::*;

fn storyloop() -> Command {
    Command::cargo_bin("storyloop").expect("binary should build")
}

#[test]
fn help_lists_subcommands() {
    storyloop()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("serve"));
}

#[test]
fn version_prints() {
    storyloop()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("storyloop"));
}

#[test]
fn run_requires_repo_and_prompt() {
    storyloop()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn run_help_documents_yolo() {
    storyloop()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--yolo"));
}

#[test]
fn unknown_subcommand_fails() {
    storyloop()
        .arg("definitely-not-a-command")
        .assert()
        .failure();
}

#[test]
fn missing_config_file_is_reported() {
    storyloop()
        .args([
            "--config",
            "/nonexistent/storyloop.toml",
            "serve",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
