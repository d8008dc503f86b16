//! Execute pipeline steps.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use log::info;

use graphmill_lib::config::PipelineConfig;
use graphmill_lib::driver::{Pipeline, StepName, STEP_ORDER};
use graphmill_lib::logging::OperationTimer;

use crate::commands::command::Command;

/// Step selection on the command line: the step names plus the literal
/// `all`. Unknown names are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StepArg {
    All,
    Sequences,
    Graph,
    Stats,
    Components,
}

/// Run pipeline steps.
///
/// Steps run in their fixed order regardless of how they are listed. A step
/// whose output is already complete is skipped; an interrupted step is
/// resumed with --continue and overwritten with --force.
#[derive(Debug, Parser)]
#[command(
    name = "run",
    about = "Run pipeline steps over the input link file",
    long_about = r#"
Run one or more pipeline steps.

Steps always execute in their fixed order:

  sequences   Index the input FASTA into the nid table.
  graph       Translate, merge, and filter pairwise links (chunk-parallel).
  stats       Per-query neighbourhood statistics (chunk-parallel).
  components  Connected components of the filtered graph.

Every output file ends in a completion sentinel once its writer has
finished. Steps whose output is already complete are skipped, so re-running
the same command after a crash or kill only redoes unfinished work.

EXAMPLES:

  # run everything with one chunk per core
  graphmill run -d work --fasta seqs.fasta --links links.tsv --steps all

  # re-enter an interrupted graph stage, resuming partial shards
  graphmill run -d work --links links.tsv --steps graph --continue

  # recompute statistics from scratch over 8 chunks
  graphmill run -d work --links links.tsv --steps stats --force --chunks 8
"#
)]
pub struct Run {
    /// Working directory for all pipeline artifacts.
    #[arg(short = 'd', long = "dir", default_value = ".")]
    pub dir: PathBuf,

    /// Input FASTA file (needed by the sequences step).
    #[arg(long = "fasta", default_value = "sequences.fasta")]
    pub fasta: PathBuf,

    /// Input pairwise link file, sorted and grouped by query token.
    #[arg(long = "links", default_value = "links.tsv")]
    pub links: PathBuf,

    /// Steps to run, or 'all'.
    #[arg(
        short = 's',
        long = "steps",
        value_enum,
        num_args = 1..,
        value_delimiter = ',',
        default_value = "all"
    )]
    pub steps: Vec<StepArg>,

    /// Number of chunks for parallel steps (0 = one per available core).
    #[arg(short = 'c', long = "chunks", default_value = "0")]
    pub chunks: usize,

    /// Overwrite complete outputs instead of skipping them.
    #[arg(long = "force")]
    pub force: bool,

    /// Resume in-progress outputs from their continuation point.
    #[arg(long = "continue", alias = "append", conflicts_with = "force")]
    pub resume: bool,

    /// Drop links with an evalue above this threshold.
    #[arg(long = "max-evalue", default_value = "1.0")]
    pub max_evalue: f64,

    /// Adjacent links closer than this on both sequences are merged.
    #[arg(long = "min-domain-size", default_value = "30")]
    pub min_domain_size: u32,

    /// Merge adjacent repeat links in the graph step.
    #[arg(long = "merge-repeats", default_value = "true", action = clap::ArgAction::Set)]
    pub merge_repeats: bool,

    /// Progress log interval, in records.
    #[arg(long = "report-interval", default_value = "100000")]
    pub report_interval: u64,
}

impl Run {
    /// Expands the CLI selection into concrete step names, in pipeline order.
    fn requested_steps(&self) -> Vec<StepName> {
        if self.steps.contains(&StepArg::All) {
            return STEP_ORDER.to_vec();
        }
        let selected: Vec<StepName> = self
            .steps
            .iter()
            .filter_map(|step| match step {
                StepArg::All => None,
                StepArg::Sequences => Some(StepName::Sequences),
                StepArg::Graph => Some(StepName::Graph),
                StepArg::Stats => Some(StepName::Stats),
                StepArg::Components => Some(StepName::Components),
            })
            .collect();
        STEP_ORDER.into_iter().filter(|name| selected.contains(name)).collect()
    }
}

impl Command for Run {
    fn execute(&self) -> Result<()> {
        let requested = self.requested_steps();
        if requested.is_empty() {
            bail!("no steps selected");
        }
        if requested.contains(&StepName::Sequences) && !self.fasta.exists() {
            bail!("Input FASTA {} does not exist", self.fasta.display());
        }
        if requested.iter().any(|name| name.is_parallel()) && !self.links.exists() {
            bail!("Input link file {} does not exist", self.links.display());
        }

        info!("Working directory: {}", self.dir.display());
        info!(
            "Steps: {}",
            requested.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        if self.force {
            info!("Force: overwriting existing outputs");
        }
        if self.resume {
            info!("Continue: resuming in-progress outputs");
        }

        let config = PipelineConfig {
            dir: self.dir.clone(),
            fasta: self.fasta.clone(),
            links: self.links.clone(),
            chunks: self.chunks,
            force: self.force,
            append: self.resume,
            max_evalue: self.max_evalue,
            min_domain_size: self.min_domain_size,
            merge_repeats: self.merge_repeats,
            report_interval: self.report_interval,
        };

        let timer = OperationTimer::new("Running pipeline");
        Pipeline::new(config).run(&requested)?;
        timer.log_completion(requested.len() as u64);
        Ok(())
    }
}
