//! From a pipeline file on disk to rendered backend documents.

use deckhand_lib::config::PipelineFile;
use deckhand_lib::params::FileStore;
use deckhand_lib::pipeline::StageGraph;
use deckhand_lib::render::{buildspec, pipeline_document, script};
use tempfile::TempDir;

const PIPELINE: &str = r#"
version = 1

[context]
app = "laravel-app"
env = "prod"
account = "123456789012"
region = "ap-northeast-1"

[[services]]
name = "web"

[services.source]
owner = { param = "/Cd/Git/Owner" }
repo = "y"
branch = "main"
credential = { secret = "/Cd/Git/Token", field = "github-token" }

[[services.builds]]
repository = "app"
dockerfile = "docker/app/Dockerfile"

[[services.builds]]
repository = "app-nginx"
dockerfile = "docker/nginx/Dockerfile"

[services.deploy]
owner = { param = "/Cd/Git/Owner" }
repo = "ops"
branch = "main"
identity = { name = "deploy-bot", email = "bot@example.com" }
ssh_key = { secret = "/Cd/Git/SshKey" }
"#;

const PARAMS: &str = r#"
[params]
"/LaravelApp/Prod/Cd/Git/Owner" = "x"

[secrets]
"/LaravelApp/Prod/Cd/Git/Token" = "{\"github-token\": \"ghp_file_token\"}"
"/LaravelApp/Prod/Cd/Git/SshKey" = "-----BEGIN FILE KEY-----"
"#;

fn load() -> (PipelineFile, FileStore) {
  let temp = TempDir::new().unwrap();
  let pipeline = temp.path().join("deckhand.toml");
  let params = temp.path().join("params.toml");
  std::fs::write(&pipeline, PIPELINE).unwrap();
  std::fs::write(&params, PARAMS).unwrap();
  (PipelineFile::load(&pipeline).unwrap(), FileStore::load(&params).unwrap())
}

#[test]
fn pipeline_file_renders_without_secret_values() {
  let (file, store) = load();
  let definitions = file.definitions(&file.resolver(&store)).unwrap();
  assert_eq!(definitions.len(), 1);

  let plan = definitions[0].plan().unwrap();
  let document = serde_json::to_string(&pipeline_document(&plan).unwrap()).unwrap();
  assert!(document.contains("/LaravelApp/Prod/Cd/Git/Token:github-token"));

  let mut rendered = vec![document];
  for job in plan.jobs() {
    rendered.push(buildspec(job).unwrap());
    rendered.push(script(job).unwrap());
  }
  for text in &rendered {
    assert!(!text.contains("ghp_file_token"));
    assert!(!text.contains("BEGIN FILE KEY"));
  }
}

#[test]
fn stage_graph_orders_source_builds_deploy() {
  let (file, store) = load();
  let definition = file.definition("web", &file.resolver(&store)).unwrap().unwrap();
  let graph = StageGraph::from_plan(&definition.plan().unwrap()).unwrap();

  let waves: Vec<Vec<String>> = graph
    .waves()
    .iter()
    .map(|wave| wave.iter().map(|node| node.stage().to_string()).collect())
    .collect();
  assert_eq!(
    waves,
    vec![
      vec!["Source".to_string()],
      vec!["Build".to_string(), "Build".to_string()],
      vec!["PrepareDeploy".to_string()],
    ]
  );
}

#[test]
fn plan_fingerprint_is_stable_across_loads() {
  use deckhand_lib::util::hash::Fingerprintable;

  let (first_file, first_store) = load();
  let (second_file, second_store) = load();
  let first = first_file.definitions(&first_file.resolver(&first_store)).unwrap()[0]
    .plan()
    .unwrap();
  let second = second_file.definitions(&second_file.resolver(&second_store)).unwrap()[0]
    .plan()
    .unwrap();
  assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
}
