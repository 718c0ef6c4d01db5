//! Whole runs through `execute_run`.

use std::sync::Arc;

use deckhand_lib::deploy::DeployOutcome;
use deckhand_lib::error::ErrorClass;
use deckhand_lib::pipeline::{SOURCE_ACTION, StageKind};
use deckhand_lib::run::{Cancellation, FailureCause, RunState, execute_run};

use super::common::{TestExecutor, definition, revision};

const PIPELINE: &str = "laravel-app-web-prod-pipeline";
const DEPLOY_JOB: &str = "laravel-app-prod-PrepareDeploy";

#[tokio::test]
async fn push_produces_tagged_images_and_a_deploy_pull_request() {
  let executor = Arc::new(TestExecutor::new());
  let config = executor.config().clone();

  let result = execute_run(
    &definition(),
    revision("1234567890ab"),
    executor.clone(),
    &config,
    Cancellation::never(),
  )
  .await
  .unwrap();

  assert!(result.is_success(), "run failed: {}", result.state);
  assert_eq!(result.pipeline, PIPELINE);
  assert_eq!(result.tag.as_str(), "1234567");
  assert_eq!(
    result.history,
    vec![
      RunState::Idle,
      RunState::SourceFetching,
      RunState::Building,
      RunState::PreparingDeploy,
      RunState::Succeeded,
    ]
  );
  assert!(result.skipped.is_empty());
  assert!(result.job("app-ImageBuild").is_some());
  assert!(result.job("app-nginx-ImageBuild").is_some());

  let deploy = result.deploy().unwrap();
  assert_eq!(deploy.branch, "deploy/1234567");
  assert_eq!(deploy.outcome, DeployOutcome::Opened);
  assert_eq!(deploy.pull_request.url, "https://github.com/x/ops/pull/1");

  assert_eq!(
    executor.descriptor(PIPELINE, "1234567"),
    concat!(
      r#"[{"name":"app","imageUri":"123456789012.dkr.ecr.ap-northeast-1.amazonaws.com/app:1234567"},"#,
      r#"{"name":"app-nginx","imageUri":"123456789012.dkr.ecr.ap-northeast-1.amazonaws.com/app-nginx:1234567"}]"#
    )
  );
}

#[tokio::test]
async fn deploy_waits_for_every_build() {
  let executor = Arc::new(TestExecutor::new());
  let config = executor.config().clone();

  execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, Cancellation::never())
    .await
    .unwrap();

  let started = executor.started_jobs();
  assert_eq!(started.len(), 3);
  assert_eq!(started.last().map(String::as_str), Some(DEPLOY_JOB));
}

#[tokio::test]
async fn failed_build_blocks_the_deploy() {
  let executor = Arc::new(TestExecutor::new().failing("app-nginx-ImageBuild"));
  *executor.hanging.lock().unwrap() = Some(revision("1234567890ab"));
  let config = executor.config().clone();

  let result = execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, Cancellation::never())
    .await
    .unwrap();

  assert!(!result.is_success());
  assert!(matches!(
    &result.state,
    RunState::Failed {
      stage: Some(StageKind::Build),
      cause: FailureCause::Error { class: ErrorClass::Build, .. },
    }
  ));

  let failure = result.failed.as_ref().unwrap();
  assert_eq!(failure.job, "app-nginx-ImageBuild");
  assert_eq!(failure.class, ErrorClass::Build);

  // The hanging build was aborted and the deploy never started.
  assert!(result.skipped.contains(&"app-ImageBuild".to_string()));
  assert!(result.skipped.contains(&DEPLOY_JOB.to_string()));
  assert!(!executor.started_jobs().contains(&DEPLOY_JOB.to_string()));
  assert!(executor.git().pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn panicked_build_is_reported_under_its_own_name() {
  let executor = Arc::new(TestExecutor::new().panicking("app-nginx-ImageBuild"));
  *executor.hanging.lock().unwrap() = Some(revision("1234567890ab"));
  let config = executor.config().clone();

  let result = execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, Cancellation::never())
    .await
    .unwrap();

  let failure = result.failed.as_ref().unwrap();
  assert_eq!(failure.job, "app-nginx-ImageBuild");
  assert_eq!(failure.class, ErrorClass::Build);
  assert!(result.skipped.contains(&"app-ImageBuild".to_string()));
  assert!(!result.skipped.contains(&"app-nginx-ImageBuild".to_string()));
}

#[tokio::test]
async fn rerun_of_the_same_revision_reuses_the_pull_request() {
  let executor = Arc::new(TestExecutor::new());
  let config = executor.config().clone();

  for _ in 0..2 {
    let result = execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, Cancellation::never())
      .await
      .unwrap();
    assert!(result.is_success());
  }

  let prs = executor.git().open_prs.lock().unwrap();
  assert_eq!(prs.len(), 1);
  assert_eq!(*executor.git().pushes.lock().unwrap(), vec!["deploy/1234567".to_string()]);
}

#[tokio::test]
async fn different_revisions_get_different_branches() {
  let executor = Arc::new(TestExecutor::new());
  let config = executor.config().clone();

  for sha in ["1234567890ab", "abcdef0123456"] {
    execute_run(&definition(), revision(sha), executor.clone(), &config, Cancellation::never())
      .await
      .unwrap();
  }

  assert_eq!(
    *executor.git().pushes.lock().unwrap(),
    vec!["deploy/1234567".to_string(), "deploy/abcdef0".to_string()]
  );
  assert_eq!(executor.git().open_prs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn transient_pull_request_failures_are_retried_without_pushing_again() {
  let executor = Arc::new(TestExecutor::new());
  *executor.git().failing_creates.lock().unwrap() = 2;
  let config = executor.config().clone();

  let result = execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, Cancellation::never())
    .await
    .unwrap();

  assert!(result.is_success());
  assert_eq!(result.deploy().unwrap().outcome, DeployOutcome::Retried);
  assert_eq!(*executor.git().create_calls.lock().unwrap(), 3);
  assert_eq!(executor.git().pushes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_pull_request_retries_fail_deploy_preparation() {
  let executor = Arc::new(TestExecutor::new());
  *executor.git().failing_creates.lock().unwrap() = 5;
  let config = executor.config().clone();

  let result = execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, Cancellation::never())
    .await
    .unwrap();

  assert!(matches!(
    result.state,
    RunState::Failed {
      stage: Some(StageKind::PrepareDeploy),
      ..
    }
  ));
  assert_eq!(result.failed.unwrap().class, ErrorClass::DeployPreparation);
  assert_eq!(*executor.git().create_calls.lock().unwrap(), 3);
}

#[tokio::test]
async fn superseded_before_start_runs_nothing() {
  let executor = Arc::new(TestExecutor::new());
  let config = executor.config().clone();

  // Issued for generation 1 while generation 2 is current.
  let (_generation, rx) = tokio::sync::watch::channel(2u64);
  let cancel = Cancellation::new(rx, 1);

  let result = execute_run(&definition(), revision("1234567890ab"), executor.clone(), &config, cancel)
    .await
    .unwrap();

  assert_eq!(
    result.state,
    RunState::Failed {
      stage: None,
      cause: FailureCause::Superseded,
    }
  );
  assert_eq!(result.history.len(), 2);
  assert!(result.skipped.contains(&SOURCE_ACTION.to_string()));
  assert!(executor.started_jobs().is_empty());
}
