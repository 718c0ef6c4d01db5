//! Event routing through `deckhand run`.

use predicates::prelude::*;

use super::common::{TestEnv, fixture_path};

#[test]
fn push_to_an_untracked_branch_runs_nothing() {
  let env = TestEnv::new();
  env
    .cmd("run")
    .arg("--event")
    .arg(fixture_path("push_event.json"))
    .args(["--workspace", "work"])
    .assert()
    .success()
    .stderr(predicate::str::contains("No pipeline is triggered by a push to x/y@feature"));
}

#[test]
fn malformed_event_fails() {
  let env = TestEnv::new();
  let event = env.write_file("event.json", r#"{"ref": "refs/tags/v1"}"#);
  env
    .cmd("run")
    .arg("--event")
    .arg(event)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Invalid push event"));
}

#[test]
fn revision_and_event_conflict() {
  let env = TestEnv::new();
  env
    .cmd("run")
    .args(["--revision", "1234567890ab"])
    .arg("--event")
    .arg(fixture_path("push_event.json"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("cannot be used with"));
}
