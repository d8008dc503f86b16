//! Explicit pipeline configuration.
//!
//! One immutable struct, built by the CLI layer and passed into the driver
//! and every step constructor. Artifact paths are derived from the working
//! directory so that steps agree on file names without any shared state.

use std::path::{Path, PathBuf};

/// Configuration shared by the driver and all steps.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory all artifacts are written into
    pub dir: PathBuf,
    /// Input FASTA file with the sequences to index
    pub fasta: PathBuf,
    /// Input pairwise-link file, sorted and grouped by query token
    pub links: PathBuf,
    /// Number of chunks for parallel steps (0 = one per available core)
    pub chunks: usize,
    /// Overwrite complete outputs instead of skipping them
    pub force: bool,
    /// Resume in-progress outputs instead of failing on existing files
    pub append: bool,
    /// Drop links with an evalue above this threshold
    pub max_evalue: f64,
    /// Adjacent links closer than this on both sequences are merged
    pub min_domain_size: u32,
    /// Whether the graph step merges adjacent repeat links at all
    pub merge_repeats: bool,
    /// Progress log interval, in records
    pub report_interval: u64,
}

impl PipelineConfig {
    /// Effective chunk count: the configured value, or one per core.
    #[must_use]
    pub fn effective_chunks(&self) -> usize {
        if self.chunks > 0 {
            self.chunks
        } else {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        }
    }

    /// The sequence index written by the `sequences` step.
    #[must_use]
    pub fn nids_path(&self) -> PathBuf {
        self.artifact("graphmill.nids")
    }

    /// The filtered link graph written by the `graph` step.
    #[must_use]
    pub fn graph_path(&self) -> PathBuf {
        self.artifact("graphmill.graph")
    }

    /// Per-query neighbourhood statistics written by the `stats` step.
    #[must_use]
    pub fn stats_path(&self) -> PathBuf {
        self.artifact("graphmill.stats")
    }

    /// Connected components written by the `components` step.
    #[must_use]
    pub fn components_path(&self) -> PathBuf {
        self.artifact("graphmill.components")
    }

    /// The per-run step summary table.
    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.artifact("graphmill_summary.tsv")
    }

    fn artifact(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            fasta: PathBuf::from("sequences.fasta"),
            links: PathBuf::from("links.tsv"),
            chunks: 0,
            force: false,
            append: false,
            max_evalue: 1.0,
            min_domain_size: 30,
            merge_repeats: true,
            report_interval: 100_000,
        }
    }
}

/// Convenience for tests and embedders: a config rooted at `dir` with all
/// other settings at their defaults.
impl PipelineConfig {
    #[must_use]
    pub fn rooted_at<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), ..Self::default() }
    }
}
