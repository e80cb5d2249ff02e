use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write");
}

fn gantry() -> Command {
    Command::cargo_bin("gantry").expect("binary built")
}

fn write_config(root: &Path) {
    write_file(
        &root.join(".gantry.toml"),
        r#"
[pipeline]
release_ref = "refs/heads/main"
binary = "apwm"
features = "cli"
context = "ctx"

[image.worlds]
strategy = "compile_then_package"
builder_image = "rust:1.85"
runtime_image = "debian:bookworm-slim"
binary = "apwm"
features = "cli"
packages = ["ca-certificates", "git"]
"#,
    );
}

#[test]
fn plan_without_config_uses_defaults() {
    let dir = tempdir().expect("tempdir");

    gantry()
        .current_dir(dir.path())
        .arg("plan")
        .assert()
        .success()
        .stdout(contains("release_ref: refs/heads/main"))
        .stdout(contains("binary: apwm (features: cli)"))
        .stdout(contains("deploy"));
}

#[test]
fn cli_flags_override_config_file_values() {
    let dir = tempdir().expect("tempdir");
    write_config(dir.path());

    // defaults < file < flags: the file sets refs/heads/main, the flag wins.
    gantry()
        .current_dir(dir.path())
        .args(["--release-ref", "refs/heads/release", "--binary", "worldd"])
        .arg("plan")
        .assert()
        .success()
        .stdout(contains("release_ref: refs/heads/release"))
        .stdout(contains("binary: worldd (features: cli)"));
}

#[test]
fn plan_lists_configured_image_digests() {
    let dir = tempdir().expect("tempdir");
    write_config(dir.path());

    gantry()
        .current_dir(dir.path())
        .arg("plan")
        .assert()
        .success()
        .stdout(contains("images:"))
        .stdout(contains("worlds:"));
}

#[test]
fn render_prints_the_containerfile() {
    let dir = tempdir().expect("tempdir");
    write_config(dir.path());

    gantry()
        .current_dir(dir.path())
        .args(["render", "--image", "worlds"])
        .assert()
        .success()
        .stdout(contains("FROM rust:1.85 AS builder"))
        .stdout(contains("FROM debian:bookworm-slim"))
        .stdout(contains("--features cli --release"))
        .stdout(contains("USER worker"));
}

#[test]
fn render_rejects_unknown_image() {
    let dir = tempdir().expect("tempdir");
    write_config(dir.path());

    gantry()
        .current_dir(dir.path())
        .args(["render", "--image", "nope"])
        .assert()
        .failure()
        .stderr(contains("image `nope` is not configured"));
}

#[test]
fn unknown_config_key_is_rejected() {
    let dir = tempdir().expect("tempdir");
    write_file(
        &dir.path().join(".gantry.toml"),
        "[pipeline]\nrelase_ref = \"refs/heads/main\"\n",
    );

    gantry()
        .current_dir(dir.path())
        .arg("plan")
        .assert()
        .failure()
        .stderr(contains(".gantry.toml"));
}

#[test]
fn run_fails_fast_on_empty_context_and_writes_a_receipt() {
    let dir = tempdir().expect("tempdir");
    write_config(dir.path());
    fs::create_dir_all(dir.path().join("ctx")).expect("mkdir");

    gantry()
        .current_dir(dir.path())
        .args(["run", "--ref", "refs/heads/feature/x"])
        .assert()
        .failure()
        .stderr(contains("build context"));

    // The failed run still leaves an audit receipt behind.
    gantry()
        .current_dir(dir.path())
        .arg("receipt")
        .assert()
        .success()
        .stdout(contains("\"deploy_allowed\": false"))
        .stdout(contains("\"ref_name\": \"refs/heads/feature/x\""));
}

#[test]
fn receipt_without_a_prior_run_is_an_error() {
    let dir = tempdir().expect("tempdir");

    gantry()
        .current_dir(dir.path())
        .arg("receipt")
        .assert()
        .failure()
        .stderr(contains("no receipt found"));
}

#[test]
fn doctor_reports_secret_names_without_values() {
    let dir = tempdir().expect("tempdir");

    gantry()
        .current_dir(dir.path())
        .env_remove("GANTRY_DEPLOY_KEY")
        .env_remove("GANTRY_DEPLOY_USER")
        .env_remove("GANTRY_DEPLOY_HOST")
        .env_remove("GANTRY_DEPLOY_PATH")
        .arg("doctor")
        .assert()
        .success()
        .stdout(contains("GANTRY_DEPLOY_KEY: missing"))
        .stdout(contains("GANTRY_DEPLOY_HOST: missing"));
}
