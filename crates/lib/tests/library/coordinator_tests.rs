//! Routing, per-pipeline serialization and supersession.

use std::sync::Arc;

use deckhand_lib::config::FeatureFlags;
use deckhand_lib::pipeline::{PushEvent, SourceSpec, StageKind};
use deckhand_lib::run::{Coordinator, FailureCause, RunState};

use super::common::{TestExecutor, builder, definition, revision, token};

fn coordinator(executor: &Arc<TestExecutor>) -> Coordinator<TestExecutor> {
  let worker = builder("worker")
    .source(SourceSpec::new("x", "worker-src", "main").with_credential(token()))
    .image(deckhand_lib::build::BuildSpec::new("worker", "Dockerfile"))
    .build()
    .unwrap();
  Coordinator::new(executor.clone(), executor.config().clone(), vec![definition(), worker])
}

#[test]
fn push_routes_to_the_matching_pipeline_only() {
  let executor = Arc::new(TestExecutor::new());
  let coordinator = coordinator(&executor);

  let matched = coordinator.route(&PushEvent::new("X", "y", "main", revision("1234567890ab")));
  assert_eq!(matched.len(), 1);
  assert_eq!(matched[0].name(), "laravel-app-web-prod-pipeline");

  assert!(coordinator.route(&PushEvent::new("x", "y", "develop", revision("1234567890ab"))).is_empty());
  assert_eq!(
    coordinator.route(&PushEvent::new("x", "worker-src", "main", revision("1234567890ab")))[0].name(),
    "laravel-app-worker-prod-pipeline"
  );
}

#[tokio::test]
async fn dispatch_runs_triggered_pipelines() {
  let executor = Arc::new(TestExecutor::new());
  let coordinator = coordinator(&executor);

  let results = coordinator
    .dispatch(&PushEvent::new("x", "y", "main", revision("1234567890ab")))
    .await;
  assert_eq!(results.len(), 1);
  assert!(results[0].as_ref().unwrap().is_success());

  let results = coordinator
    .dispatch(&PushEvent::new("x", "y", "feature", revision("1234567890ab")))
    .await;
  assert!(results.is_empty());
}

#[tokio::test]
async fn newer_push_supersedes_the_running_build() {
  let executor = Arc::new(TestExecutor::new());
  *executor.hanging.lock().unwrap() = Some(revision("aaaaaaa1111"));
  let coordinator = coordinator(&executor);
  let web = coordinator.pipelines()[0].clone();

  let older = coordinator.run(&web, revision("aaaaaaa1111"));
  let newer = async {
    executor.build_started.notified().await;
    coordinator.run(&web, revision("bbbbbbb2222")).await
  };
  let (older, newer) = tokio::join!(older, newer);

  let older = older.unwrap();
  assert_eq!(
    older.state,
    RunState::Failed {
      stage: Some(StageKind::Build),
      cause: FailureCause::Superseded,
    }
  );
  assert!(older.skipped.contains(&"laravel-app-prod-PrepareDeploy".to_string()));

  let newer = newer.unwrap();
  assert!(newer.is_success(), "newer run failed: {}", newer.state);
  assert_eq!(*executor.git().pushes.lock().unwrap(), vec!["deploy/bbbbbbb".to_string()]);
}

#[tokio::test]
async fn serialized_runs_do_not_overlap() {
  let executor = Arc::new(TestExecutor::new());
  let features = FeatureFlags {
    cancel_superseded: false,
    ..FeatureFlags::default()
  };
  let web = builder("web").features(features).build().unwrap();
  let coordinator = Coordinator::new(executor.clone(), executor.config().clone(), vec![web.clone()]);

  let (first, second) = tokio::join!(
    coordinator.run(&web, revision("aaaaaaa1111")),
    coordinator.run(&web, revision("bbbbbbb2222")),
  );
  assert!(first.unwrap().is_success());
  assert!(second.unwrap().is_success());

  let order: Vec<_> = executor
    .started
    .lock()
    .unwrap()
    .iter()
    .map(|(_, revision)| revision.as_str().to_string())
    .collect();
  assert_eq!(order.len(), 6);
  assert!(order[..3].iter().all(|r| r == "aaaaaaa1111"));
  assert!(order[3..].iter().all(|r| r == "bbbbbbb2222"));
}
