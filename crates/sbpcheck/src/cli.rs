//! Command-line interface of the `sbpcheck` runner.

use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::info;

use sbpcheck_harness::registry::{TestOutcome, TestRegistry, TestStatus};
use sbpcheck_harness::suites::default_registry;
use sbpcheck_harness::{ConfigError, HarnessConfig, RegistryError, RunSummary};

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("failed to serialize the run summary: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "sbpcheck", version)]
#[command(about = "Checks in-place tensor operations for equivalence across placements and SBP signatures")]
pub struct Cli {
    /// Log debug events (overrides `RUST_LOG`)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered tests
    List {
        /// Only list tests that require this number of nodes
        #[arg(long)]
        num_nodes: Option<usize>,
    },

    /// Run registered tests
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Only run tests whose name contains this string
    #[arg(long)]
    pub filter: Option<String>,

    /// Only run tests that require this number of nodes
    #[arg(long, default_value_t = 1)]
    pub num_nodes: usize,

    /// Seed of the run (replays a previous run)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of simulated ranks
    #[arg(long)]
    pub world_size: Option<usize>,

    /// Number of simulated nodes
    #[arg(long)]
    pub node_size: Option<usize>,

    /// Only enumerate CPU placements
    #[arg(long)]
    pub cpu_only: bool,

    /// Number of cases executed per configuration
    #[arg(long)]
    pub repeat: Option<usize>,

    /// Skip the gradient comparison
    #[arg(long)]
    pub no_gradients: bool,

    /// Skip the alias visibility check
    #[arg(long)]
    pub no_aliasing: bool,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Resolves the harness configuration: defaults, then the configuration file, then the `SBPCHECK_*`
    /// variables that `lookup` resolves, then command-line flags.
    pub fn resolve_config<F: Fn(&str) -> Option<String>>(&self, lookup: F) -> Result<HarnessConfig, ConfigError> {
        let config = match &self.config {
            Some(path) => HarnessConfig::from_file(path)?,
            None => HarnessConfig::default(),
        };
        let mut config = config.with_overrides_from(lookup)?;
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(world_size) = self.world_size {
            config.world_size = world_size;
        }
        if let Some(node_size) = self.node_size {
            config.node_size = node_size;
        }
        if let Some(repeat) = self.repeat {
            config.repeat = repeat;
        }
        config.cpu_only |= self.cpu_only;
        config.check_gradients &= !self.no_gradients;
        config.check_aliasing &= !self.no_aliasing;
        config.validate()?;
        Ok(config)
    }
}

/// Executes `cli`, writing its report to `output`. Returns `false` if any test failed or errored.
pub fn execute<W: Write>(cli: &Cli, output: &mut W) -> Result<bool, CliError> {
    let registry = default_registry()?;
    match &cli.command {
        Command::List { num_nodes } => {
            let registry = match num_nodes {
                Some(num_nodes) => registry.filter_by_num_nodes(|required| required == *num_nodes),
                None => registry,
            };
            list(&registry, output)?;
            Ok(true)
        }
        Command::Run(args) => {
            let config = args.resolve_config(|variable| std::env::var(variable).ok())?;
            let registry = registry.filter_by_num_nodes(|required| required == args.num_nodes);
            let summary = registry.run(&config, args.filter.as_deref());
            info!(%summary, "run finished");
            if args.json {
                writeln!(output, "{}", serde_json::to_string_pretty(&summary)?)?;
            } else {
                report(&summary, output)?;
            }
            Ok(summary.is_success())
        }
    }
}

fn list<W: Write>(registry: &TestRegistry, output: &mut W) -> std::io::Result<()> {
    for test in registry.tests() {
        match test.status() {
            TestStatus::Enabled => writeln!(output, "{} (nodes={})", test.name(), test.num_nodes())?,
            TestStatus::Disabled { reason } => {
                writeln!(output, "{} (nodes={}, disabled: {reason})", test.name(), test.num_nodes())?
            }
        }
    }
    Ok(())
}

fn report<W: Write>(summary: &RunSummary, output: &mut W) -> std::io::Result<()> {
    for result in &summary.results {
        writeln!(output, "{result}")?;
        for sweep in &result.sweeps {
            writeln!(output, "  {sweep}")?;
        }
        if let TestOutcome::Failed { failures } | TestOutcome::Errored { failures, .. } = &result.outcome {
            for failure in failures {
                writeln!(output, "  {failure}")?;
            }
        }
    }
    writeln!(output, "{summary}")
}
