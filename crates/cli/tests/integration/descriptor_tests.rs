//! The descriptor command rewrites image tags in place.

use predicates::prelude::*;

use super::common::TestEnv;

const REGISTRY: &str = "123456789012.dkr.ecr.ap-northeast-1.amazonaws.com";

#[test]
fn creates_a_missing_descriptor() {
  let env = TestEnv::new();
  env
    .bare_cmd()
    .args(["descriptor", "ops/imagedefinitions.json", "--tag", "1234567", "--registry", REGISTRY])
    .args(["--container", "app", "--container", "app-nginx=app-nginx"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Updated"));

  assert_eq!(
    env.read_file("ops/imagedefinitions.json"),
    format!(r#"[{{"name":"app","imageUri":"{REGISTRY}/app:1234567"}},{{"name":"app-nginx","imageUri":"{REGISTRY}/app-nginx:1234567"}}]"#)
  );
}

#[test]
fn second_rewrite_with_same_tag_changes_nothing() {
  let env = TestEnv::new();
  for expected in ["Updated", "already points at tag"] {
    env
      .bare_cmd()
      .args(["descriptor", "imagedefinitions.json", "-t", "abcdef0", "-r", REGISTRY, "-c", "app"])
      .assert()
      .success()
      .stdout(predicate::str::contains(expected));
  }
}

#[test]
fn invalid_binding_fails() {
  let env = TestEnv::new();
  env
    .bare_cmd()
    .args(["descriptor", "imagedefinitions.json", "-t", "abcdef0", "-r", REGISTRY, "-c", "=app"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("expected name=repository"));
}
