//! Shell step execution with an isolated environment.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::params::SecretValue;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Error)]
pub enum ShellError {
  #[error("failed to spawn {shell}: {source}")]
  Spawn {
    shell: String,
    #[source]
    source: std::io::Error,
  },

  #[error("command exited with code {code:?}: {command}")]
  Failed { command: String, code: Option<i32> },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Environment handed to a shell step.
#[derive(Debug, Default)]
pub struct StepEnv<'a> {
  /// Taken from the parent process, see [`forwarded_env`].
  pub inherited: BTreeMap<String, OsString>,
  pub vars: BTreeMap<String, String>,
  pub secrets: BTreeMap<String, &'a SecretValue>,
}

/// Client configuration files that live under the real `HOME`. Shell steps
/// get a scratch `HOME`, so these are pointed back at the user's files.
const HOME_CONFIG: &[(&str, &str)] = &[
  ("AWS_CONFIG_FILE", ".aws/config"),
  ("AWS_SHARED_CREDENTIALS_FILE", ".aws/credentials"),
  ("DOCKER_CONFIG", ".docker"),
];

fn forwards(patterns: &[String], name: &str) -> bool {
  patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
    Some(prefix) => name.starts_with(prefix),
    None => name == pattern,
  })
}

/// Parent variables matching `patterns`.
pub fn forwarded_env(patterns: &[String]) -> BTreeMap<String, OsString> {
  let mut env: BTreeMap<String, OsString> = std::env::vars_os()
    .filter_map(|(name, value)| Some((name.into_string().ok()?, value)))
    .filter(|(name, _)| forwards(patterns, name))
    .collect();

  if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
    for (name, relative) in HOME_CONFIG {
      if forwards(patterns, name) && !env.contains_key(*name) {
        env.insert(name.to_string(), home.join(relative).into_os_string());
      }
    }
  }
  env
}

/// Run `command` through the shell in `cwd`.
///
/// The child gets a cleared environment: `PATH` from the parent, `HOME` and
/// `TMPDIR` inside `scratch`, the forwarded parent variables, then the job
/// variables and revealed secrets.
/// Output is logged at debug level with secret values masked.
pub async fn run_shell(
  command: &str,
  env: &StepEnv<'_>,
  cwd: &Path,
  scratch: &Path,
  shell: Option<&str>,
) -> Result<String, ShellError> {
  info!(cmd = %command, "executing command");

  let home = scratch.join("home");
  let tmp = scratch.join("tmp");
  tokio::fs::create_dir_all(&home).await?;
  tokio::fs::create_dir_all(&tmp).await?;

  let (shell_cmd, shell_args) = get_shell(shell);
  let path = std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into());

  let mut child = Command::new(&shell_cmd);
  child
    .args(&shell_args)
    .arg(command)
    .current_dir(cwd)
    .env_clear()
    .env("PATH", path)
    .env("HOME", &home)
    .env("TMPDIR", &tmp)
    .env("LANG", "C")
    .env("LC_ALL", "C")
    .stdin(Stdio::null())
    .kill_on_drop(true);

  for (key, value) in &env.inherited {
    child.env(key, value);
  }
  for (key, value) in &env.vars {
    child.env(key, value);
  }
  for (key, value) in &env.secrets {
    child.env(key, value.expose());
  }

  debug!(shell = %shell_cmd, cwd = %cwd.display(), "spawning process");

  let output = child.output().await.map_err(|source| ShellError::Spawn {
    shell: shell_cmd.clone(),
    source,
  })?;

  let stdout = mask(String::from_utf8_lossy(&output.stdout).trim(), env);
  let stderr = mask(String::from_utf8_lossy(&output.stderr).trim(), env);

  if !output.status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command stdout");
    }
    return Err(ShellError::Failed {
      command: command.to_string(),
      code: output.status.code(),
    });
  }

  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }

  Ok(stdout)
}

fn mask(text: &str, env: &StepEnv<'_>) -> String {
  let mut out = text.to_string();
  for secret in env.secrets.values() {
    if !secret.expose().is_empty() {
      out = out.replace(secret.expose(), "***");
    }
  }
  out
}

fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  match override_shell {
    Some(shell) => (shell.to_string(), vec!["-c".to_string()]),
    None => ("/bin/sh".to_string(), vec!["-c".to_string()]),
  }
}
