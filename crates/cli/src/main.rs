mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(author, version, about = "Container delivery pipelines from one pipeline file", long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Check a pipeline file and resolve every parameter reference
  Validate {
    /// Path to the pipeline file
    #[arg(default_value = "deckhand.toml")]
    file: PathBuf,

    /// Parameter file with [params] and [secrets] tables
    #[arg(short, long)]
    params: Option<PathBuf>,
  },

  /// Show the stages and jobs of each pipeline
  Plan {
    #[arg(default_value = "deckhand.toml")]
    file: PathBuf,

    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Only show this service
    #[arg(short, long)]
    service: Option<String>,

    #[arg(short, long, value_enum, default_value_t)]
    format: OutputFormat,
  },

  /// Write the pipeline document and job buildspecs for a service
  Render {
    #[arg(default_value = "deckhand.toml")]
    file: PathBuf,

    #[arg(short, long)]
    params: Option<PathBuf>,

    #[arg(short, long)]
    service: String,

    /// Output directory
    #[arg(short, long)]
    out: PathBuf,

    /// Also write a POSIX shell script per job
    #[arg(long)]
    script: bool,
  },

  /// Print the image tag and deploy branch for a revision
  Tag {
    /// Source commit id
    revision: String,
  },

  /// Point descriptor entries at a new image tag
  Descriptor {
    /// Descriptor file, created when absent
    file: PathBuf,

    #[arg(short, long)]
    tag: String,

    /// Registry host, e.g. 123456789012.dkr.ecr.ap-northeast-1.amazonaws.com
    #[arg(short, long)]
    registry: String,

    /// Container binding as name=repository; repeatable
    #[arg(short, long = "container", required = true)]
    containers: Vec<String>,
  },

  /// Run a pipeline locally for one revision
  Run {
    #[arg(default_value = "deckhand.toml")]
    file: PathBuf,

    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Service to run; required with --revision
    #[arg(short, long)]
    service: Option<String>,

    /// Source commit id to run for
    #[arg(long, conflicts_with = "event", required_unless_present = "event")]
    revision: Option<String>,

    /// GitHub push webhook payload; runs every pipeline it triggers
    #[arg(long)]
    event: Option<PathBuf>,

    /// Working directory for job checkouts
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Existing source checkout to build from instead of cloning
    #[arg(long)]
    source: Option<PathBuf>,

    /// Maximum number of build jobs in parallel
    #[arg(short = 'j', long)]
    parallelism: Option<usize>,

    #[arg(short, long, value_enum, default_value_t)]
    format: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Validate { file, params } => cmd::cmd_validate(&file, params.as_deref()),
    Commands::Plan {
      file,
      params,
      service,
      format,
    } => cmd::cmd_plan(&file, params.as_deref(), service.as_deref(), format, cli.verbose),
    Commands::Render {
      file,
      params,
      service,
      out,
      script,
    } => cmd::cmd_render(&file, params.as_deref(), &service, &out, script),
    Commands::Tag { revision } => cmd::cmd_tag(&revision),
    Commands::Descriptor {
      file,
      tag,
      registry,
      containers,
    } => cmd::cmd_descriptor(&file, &tag, &registry, &containers),
    Commands::Run {
      file,
      params,
      service,
      revision,
      event,
      workspace,
      source,
      parallelism,
      format,
    } => cmd::cmd_run(cmd::RunArgs {
      file,
      params,
      service,
      revision,
      event,
      workspace,
      source,
      parallelism,
      format,
    }),
  }
}
