//! Backend renderings of plans and jobs.
//!
//! Every rendering goes through [`JobSpec::phase_commands`], so validated
//! steps are the only source of script text. Secrets appear only as names
//! and store references, never as values.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::build::CacheMode;
use crate::pipeline::{ActionKind, PipelinePlan, Trigger};
use crate::step::{JobSpec, Phase, StepError};
use crate::step::shell::squote;
use crate::util::hash::Fingerprintable;

pub const BUILDSPEC_VERSION: &str = "0.2";

/// Paths kept between builds when a job uses the source cache.
pub const SOURCE_CACHE_PATHS: &[&str] = &["/root/.cache/**/*", "vendor/**/*", "node_modules/**/*"];

#[derive(Debug, Error)]
pub enum RenderError {
  #[error("job {job}: {source}")]
  Step {
    job: String,
    #[source]
    source: StepError,
  },

  #[error("failed to serialize YAML: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("failed to serialize JSON: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Buildspec<'a> {
  version: &'static str,
  env: BuildspecEnv,
  phases: BTreeMap<Phase, BuildspecPhase>,
  #[serde(skip_serializing_if = "Option::is_none")]
  cache: Option<BuildspecCache<'a>>,
}

#[derive(Serialize)]
struct BuildspecEnv {
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  variables: BTreeMap<String, String>,
  #[serde(rename = "secrets-manager", skip_serializing_if = "BTreeMap::is_empty")]
  secrets_manager: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct BuildspecPhase {
  commands: Vec<String>,
}

#[derive(Serialize)]
struct BuildspecCache<'a> {
  paths: &'a [&'a str],
}

fn phase_commands(job: &JobSpec) -> Result<BTreeMap<Phase, Vec<String>>, RenderError> {
  job.phase_commands().map_err(|source| RenderError::Step {
    job: job.name.clone(),
    source,
  })
}

/// Render a job as a buildspec document.
pub fn buildspec(job: &JobSpec) -> Result<String, RenderError> {
  let phases = phase_commands(job)?
    .into_iter()
    .map(|(phase, commands)| (phase, BuildspecPhase { commands }))
    .collect();

  let secrets_manager = job
    .secret_variables()
    .into_iter()
    .map(|(name, handle)| (name, handle.reference()))
    .collect();

  let doc = Buildspec {
    version: BUILDSPEC_VERSION,
    env: BuildspecEnv {
      variables: job.plain_variables(),
      secrets_manager,
    },
    phases,
    cache: match job.environment.cache {
      Some(CacheMode::Source) => Some(BuildspecCache {
        paths: SOURCE_CACHE_PATHS,
      }),
      _ => None,
    },
  };

  Ok(serde_yaml::to_string(&doc)?)
}

/// Render a job as a standalone POSIX shell script.
///
/// Plain variables get defaults that the caller's environment may override.
/// Secret variables must be injected by the caller; the script only checks
/// they are set.
pub fn script(job: &JobSpec) -> Result<String, RenderError> {
  let phases = phase_commands(job)?;

  let mut out = String::new();
  out.push_str("#!/bin/sh\n");
  out.push_str(&format!("# {} ({:?})\n", job.name, job.kind));
  out.push_str("set -eu\n\n");

  for (name, value) in job.plain_variables() {
    out.push_str(&format!("[ -n \"${{{name}+set}}\" ] || {name}={}\n", squote(&value)));
    out.push_str(&format!("export {name}\n"));
  }
  for (name, handle) in job.secret_variables() {
    out.push_str(&format!("# {name} <- {handle}\n"));
    out.push_str(&format!(": \"${{{name}:?must be injected from the secret store}}\"\n"));
  }

  for (phase, commands) in phases {
    out.push_str(&format!("\n# phase: {phase}\n"));
    for command in commands {
      out.push_str(&command);
      out.push('\n');
    }
  }

  Ok(out)
}

fn webhook_filters(trigger: &Trigger) -> Value {
  let branch = format!("^refs/heads/{}$", regex_escape(&trigger.branch));
  let mut groups = vec![json!([
    { "type": "EVENT", "pattern": "PUSH" },
    { "type": "HEAD_REF", "pattern": branch },
  ])];
  if !trigger.pull_requests.is_empty() {
    let events = trigger
      .pull_requests
      .iter()
      .map(|action| action.event_name())
      .collect::<Vec<_>>()
      .join(", ");
    groups.push(json!([
      { "type": "EVENT", "pattern": events },
      { "type": "BASE_REF", "pattern": branch },
    ]));
  }
  Value::Array(groups)
}

fn regex_escape(value: &str) -> String {
  let mut out = String::with_capacity(value.len());
  for c in value.chars() {
    if matches!(c, '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

fn job_document(job: &JobSpec) -> Result<Value, RenderError> {
  let env = &job.environment;
  Ok(json!({
    "kind": job.kind,
    "environment": {
      "image": env.image,
      "computeType": env.compute.backend_name(),
      "privilegedMode": env.privileged,
    },
    "cache": env.cache.map(|mode| json!({ "type": "LOCAL", "modes": [mode.backend_name()] })),
    "buildspec": buildspec(job)?,
  }))
}

/// Render the whole pipeline as one JSON document.
pub fn pipeline_document(plan: &PipelinePlan) -> Result<Value, RenderError> {
  let mut stages = Vec::with_capacity(plan.stages.len());
  for stage in &plan.stages {
    let mut actions = Vec::with_capacity(stage.actions.len());
    for action in &stage.actions {
      // Actions inside a stage run in parallel.
      let mut doc = json!({
        "name": action.name,
        "runOrder": 1,
      });
      let detail = match &action.kind {
        ActionKind::Source(source) => json!({
          "provider": "GitHub",
          "owner": source.owner,
          "repo": source.repo,
          "branch": source.branch,
          "oauthToken": source.credential.as_ref().map(|handle| handle.reference()),
        }),
        ActionKind::Job(job) => job_document(job)?,
      };
      if let (Some(doc), Value::Object(detail)) = (doc.as_object_mut(), detail) {
        doc.extend(detail);
      }
      actions.push(doc);
    }
    stages.push(json!({ "name": stage.kind.as_str(), "actions": actions }));
  }

  Ok(json!({
    "name": plan.name,
    "service": plan.service,
    "fingerprint": plan.fingerprint()?.to_string(),
    "trigger": {
      "owner": plan.trigger.owner,
      "repo": plan.trigger.repo,
      "branch": plan.trigger.branch,
      "webhookFilters": webhook_filters(&plan.trigger),
    },
    "stages": stages,
  }))
}
