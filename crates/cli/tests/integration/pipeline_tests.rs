//! validate, plan and render against the fixture pipeline.

use predicates::prelude::*;

use super::common::{TestEnv, fixture_path};

#[test]
fn validate_resolves_every_service() {
  let env = TestEnv::new();
  env
    .cmd("validate")
    .assert()
    .success()
    .stdout(predicate::str::contains("laravel-app-web-prod-pipeline"))
    .stdout(predicate::str::contains("2 image build(s)"))
    .stdout(predicate::str::contains("x/ops"));
}

#[test]
fn validate_without_params_is_a_resolution_failure() {
  let env = TestEnv::new();
  env
    .bare_cmd()
    .arg("validate")
    .arg(fixture_path("pipeline.toml"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid pipeline file"));
}

#[test]
fn validate_rejects_duplicate_repositories() {
  let env = TestEnv::new();
  env
    .bare_cmd()
    .arg("validate")
    .arg(fixture_path("duplicate_repository.toml"))
    .arg("--params")
    .arg(fixture_path("params.toml"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("app"));
}

#[test]
fn plan_lists_stages_in_order() {
  let env = TestEnv::new();
  let output = env.cmd("plan").assert().success().get_output().stdout.clone();
  let stdout = String::from_utf8(output).unwrap();

  let source = stdout.find("Source").unwrap();
  let build = stdout.find("app-nginx-ImageBuild").unwrap();
  let deploy = stdout.find("laravel-app-prod-PrepareDeploy").unwrap();
  assert!(source < build && build < deploy);
  assert!(stdout.contains("PULL_REQUEST_CREATED"));
}

#[test]
fn plan_json_holds_secret_references_only() {
  let env = TestEnv::new();
  let output = env
    .cmd("plan")
    .args(["--format", "json"])
    .assert()
    .success()
    .get_output()
    .stdout
    .clone();
  let stdout = String::from_utf8(output).unwrap();

  let plans: serde_json::Value = serde_json::from_str(&stdout).unwrap();
  assert_eq!(plans[0]["name"], "laravel-app-web-prod-pipeline");
  assert!(stdout.contains("/LaravelApp/Prod/Cd/Git/SshKey"));
  assert!(!stdout.contains("ghp_fixture_token"));
  assert!(!stdout.contains("BEGIN FIXTURE KEY"));
}

#[test]
fn plan_unknown_service_fails() {
  let env = TestEnv::new();
  env
    .cmd("plan")
    .args(["--service", "missing"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("No service named 'missing'"));
}

#[test]
fn render_writes_documents_and_scripts() {
  let env = TestEnv::new();
  env
    .cmd("render")
    .args(["--service", "web", "--out", "out", "--script"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Rendered laravel-app-web-prod-pipeline"));

  let pipeline: serde_json::Value = serde_json::from_str(&env.read_file("out/pipeline.json")).unwrap();
  assert_eq!(pipeline["stages"].as_array().unwrap().len(), 3);

  let buildspec = env.read_file("out/app-ImageBuild.buildspec.yml");
  assert!(buildspec.contains("version:"));
  assert!(buildspec.contains("docker"));

  let deploy = env.read_file("out/laravel-app-prod-PrepareDeploy.buildspec.yml");
  assert!(deploy.contains("/LaravelApp/Prod/Cd/Git/SshKey"));

  let script = env.read_file("out/app-ImageBuild.sh");
  assert!(script.starts_with("#!/bin/sh"));
  assert!(script.contains("set -eu"));

  for file in [
    "out/pipeline.json",
    "out/app-ImageBuild.buildspec.yml",
    "out/laravel-app-prod-PrepareDeploy.buildspec.yml",
    "out/laravel-app-prod-PrepareDeploy.sh",
  ] {
    let content = env.read_file(file);
    assert!(!content.contains("ghp_fixture_token"), "{} leaks the token", file);
    assert!(!content.contains("BEGIN FIXTURE KEY"), "{} leaks the key", file);
  }
}
