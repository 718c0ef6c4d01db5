//! Source-change triggers and the webhook events that fire them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::revision::{Revision, RevisionError};

#[derive(Debug, Error)]
pub enum TriggerError {
  #[error("failed to parse webhook payload: {0}")]
  Payload(#[from] serde_json::Error),

  #[error("ref '{0}' is not a branch")]
  NotABranch(String),

  #[error("push deletes branch '{0}'")]
  BranchDeleted(String),

  #[error("payload has no repository owner")]
  MissingOwner,

  #[error(transparent)]
  Revision(#[from] RevisionError),
}

/// A push to a branch: `{owner, repo, branch, revision}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
  pub owner: String,
  pub repo: String,
  pub branch: String,
  pub revision: Revision,
}

#[derive(Deserialize)]
struct Owner {
  name: Option<String>,
  login: Option<String>,
}

impl Owner {
  fn into_name(self) -> Result<String, TriggerError> {
    self.login.or(self.name).ok_or(TriggerError::MissingOwner)
  }
}

#[derive(Deserialize)]
struct Repository {
  name: String,
  owner: Owner,
}

#[derive(Deserialize)]
struct GithubPush {
  #[serde(rename = "ref")]
  git_ref: String,
  after: String,
  #[serde(default)]
  deleted: bool,
  repository: Repository,
}

impl PushEvent {
  pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>, revision: Revision) -> Self {
    Self {
      owner: owner.into(),
      repo: repo.into(),
      branch: branch.into(),
      revision,
    }
  }

  /// Parse a GitHub `push` webhook payload.
  pub fn from_github_payload(payload: &str) -> Result<Self, TriggerError> {
    let push: GithubPush = serde_json::from_str(payload)?;
    let branch = push
      .git_ref
      .strip_prefix("refs/heads/")
      .ok_or_else(|| TriggerError::NotABranch(push.git_ref.clone()))?
      .to_string();
    if push.deleted {
      return Err(TriggerError::BranchDeleted(branch));
    }
    Ok(Self {
      owner: push.repository.owner.into_name()?,
      repo: push.repository.name,
      branch,
      revision: Revision::parse(&push.after)?,
    })
  }
}

/// Pull request webhook actions that can start an image build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
  Created,
  Updated,
  Reopened,
}

impl PullRequestAction {
  pub const ALL: [PullRequestAction; 3] = [
    PullRequestAction::Created,
    PullRequestAction::Updated,
    PullRequestAction::Reopened,
  ];

  /// Backend webhook event name.
  pub fn event_name(&self) -> &'static str {
    match self {
      PullRequestAction::Created => "PULL_REQUEST_CREATED",
      PullRequestAction::Updated => "PULL_REQUEST_UPDATED",
      PullRequestAction::Reopened => "PULL_REQUEST_REOPENED",
    }
  }

  fn from_github(action: &str) -> Option<Self> {
    match action {
      "opened" => Some(PullRequestAction::Created),
      "synchronize" => Some(PullRequestAction::Updated),
      "reopened" => Some(PullRequestAction::Reopened),
      _ => None,
    }
  }
}

/// A pull request against a base branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
  pub owner: String,
  pub repo: String,
  pub base: String,
  /// `None` for actions that never start a build (closed, labeled, ...).
  pub action: Option<PullRequestAction>,
  pub revision: Revision,
}

#[derive(Deserialize)]
struct GithubRef {
  #[serde(rename = "ref")]
  git_ref: String,
  #[serde(default)]
  sha: Option<String>,
}

#[derive(Deserialize)]
struct GithubPullRequestBody {
  base: GithubRef,
  head: GithubRef,
}

#[derive(Deserialize)]
struct GithubPullRequest {
  action: String,
  pull_request: GithubPullRequestBody,
  repository: Repository,
}

impl PullRequestEvent {
  /// Parse a GitHub `pull_request` webhook payload.
  pub fn from_github_payload(payload: &str) -> Result<Self, TriggerError> {
    let pr: GithubPullRequest = serde_json::from_str(payload)?;
    let sha = pr
      .pull_request
      .head
      .sha
      .ok_or_else(|| TriggerError::NotABranch(pr.pull_request.head.git_ref.clone()))?;
    Ok(Self {
      owner: pr.repository.owner.into_name()?,
      repo: pr.repository.name,
      base: pr.pull_request.base.git_ref,
      action: PullRequestAction::from_github(&pr.action),
      revision: Revision::parse(&sha)?,
    })
  }
}

/// Webhook filter starting a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
  pub owner: String,
  pub repo: String,
  /// Push filter: only pushes to this branch start a run.
  pub branch: String,
  /// Pull request actions, against `branch`, that start an image build.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub pull_requests: Vec<PullRequestAction>,
}

impl Trigger {
  pub fn matches(&self, event: &PushEvent) -> bool {
    self.owner.eq_ignore_ascii_case(&event.owner)
      && self.repo.eq_ignore_ascii_case(&event.repo)
      && self.branch == event.branch
  }

  pub fn matches_pull_request(&self, event: &PullRequestEvent) -> bool {
    self.owner.eq_ignore_ascii_case(&event.owner)
      && self.repo.eq_ignore_ascii_case(&event.repo)
      && self.branch == event.base
      && event.action.is_some_and(|action| self.pull_requests.contains(&action))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PUSH: &str = r#"{
    "ref": "refs/heads/main",
    "before": "0000000000000000000000000000000000000000",
    "after": "1234567890abcdef1234567890abcdef12345678",
    "repository": {"name": "y", "owner": {"name": "x", "login": "x"}}
  }"#;

  fn trigger() -> Trigger {
    Trigger {
      owner: "x".to_string(),
      repo: "y".to_string(),
      branch: "main".to_string(),
      pull_requests: PullRequestAction::ALL.to_vec(),
    }
  }

  #[test]
  fn parses_github_push() {
    let event = PushEvent::from_github_payload(PUSH).unwrap();
    assert_eq!(event.owner, "x");
    assert_eq!(event.repo, "y");
    assert_eq!(event.branch, "main");
    assert_eq!(event.revision.short_tag().as_str(), "1234567");
    assert!(trigger().matches(&event));
  }

  #[test]
  fn push_to_other_branch_does_not_match() {
    let event = PushEvent::new("x", "y", "develop", Revision::parse("1234567890ab").unwrap());
    assert!(!trigger().matches(&event));
  }

  #[test]
  fn tag_pushes_are_not_branches() {
    let payload = PUSH.replace("refs/heads/main", "refs/tags/v1");
    assert!(matches!(
      PushEvent::from_github_payload(&payload),
      Err(TriggerError::NotABranch(_))
    ));
  }

  #[test]
  fn branch_deletion_is_rejected() {
    let payload = PUSH.replace("\"ref\"", "\"deleted\": true, \"ref\"");
    assert!(matches!(
      PushEvent::from_github_payload(&payload),
      Err(TriggerError::BranchDeleted(_))
    ));
  }

  #[test]
  fn pull_request_filters_by_action_and_base() {
    let payload = r#"{
      "action": "synchronize",
      "pull_request": {"base": {"ref": "main"}, "head": {"ref": "feature", "sha": "abcdef0123456789"}},
      "repository": {"name": "y", "owner": {"login": "x"}}
    }"#;
    let event = PullRequestEvent::from_github_payload(payload).unwrap();
    assert_eq!(event.action, Some(PullRequestAction::Updated));
    assert!(trigger().matches_pull_request(&event));

    let push_only = Trigger {
      pull_requests: Vec::new(),
      ..trigger()
    };
    assert!(!push_only.matches_pull_request(&event));

    let closed = PullRequestEvent { action: None, ..event };
    assert!(!trigger().matches_pull_request(&closed));
  }
}
