//! Pipeline driver: step sequencing, chunk fan-out, failure aggregation.
//!
//! The driver walks a fixed step order and, for each requested step, either
//! drives it to completion on the calling thread (sequential steps) or fans
//! it out over a bounded worker pool, one task per chunk (parallel steps).
//! Workers never crash the process: every error and panic is captured as a
//! [`WorkerFailure`] and returned over the result channel, so the driver can
//! report all failed chunks before aborting the stage. Completed shards are
//! left on disk; re-running the same command resumes them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use crossbeam_channel::bounded;
use fgoxide::io::DelimFile;
use log::{error, info};
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::errors::WorkerFailure;
use crate::module::{StepCounters, StepModule, WorkUnit};
use crate::records::IdMap;
use crate::segment;
use crate::slice::{self, Chunk, GroupSlice};
use crate::steps::{ComponentsStep, GraphStep, SequencesStep, StatsStep, Step};

/// The closed set of step names, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepName {
    Sequences,
    Graph,
    Stats,
    Components,
}

/// The fixed execution order; the driver never reorders steps.
pub const STEP_ORDER: [StepName; 4] =
    [StepName::Sequences, StepName::Graph, StepName::Stats, StepName::Components];

impl StepName {
    /// True for steps fanned out over chunks of the link file.
    #[must_use]
    pub fn is_parallel(self) -> bool {
        matches!(self, StepName::Graph | StepName::Stats)
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepName::Sequences => "sequences",
            StepName::Graph => "graph",
            StepName::Stats => "stats",
            StepName::Components => "components",
        };
        f.write_str(name)
    }
}

/// One row of the per-run step summary table.
#[derive(Debug, Serialize)]
pub struct SummaryRow {
    step: String,
    chunk: String,
    input: u64,
    output: u64,
    skipped: u64,
    elapsed_secs: f64,
}

impl SummaryRow {
    fn new(step: StepName, chunk: Option<usize>, counters: StepCounters) -> Self {
        Self {
            step: step.to_string(),
            chunk: chunk.map_or_else(|| "-".to_string(), |index| index.to_string()),
            input: counters.input,
            output: counters.output,
            skipped: counters.skipped,
            elapsed_secs: counters.elapsed_secs,
        }
    }
}

/// The result a worker sends back for one chunk.
struct ChunkOutcome {
    chunk: Chunk,
    result: std::result::Result<StepCounters, String>,
}

/// Sequences steps and fans parallel ones out across the worker pool.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Runs every step of [`STEP_ORDER`] that appears in `requested`.
    ///
    /// Aborts on the first stage with a failed chunk or merge, leaving
    /// completed stages and partially written shards on disk for resumption.
    pub fn run(&self, requested: &[StepName]) -> Result<()> {
        std::fs::create_dir_all(&self.config.dir)
            .with_context(|| format!("Failed to create {}", self.config.dir.display()))?;
        let mut summary: Vec<SummaryRow> = Vec::new();
        let mut id_map: Option<Arc<IdMap>> = None;
        for name in STEP_ORDER {
            if !requested.contains(&name) {
                continue;
            }
            let output = self.output_path(name);
            if self.config.force {
                self.clear_existing(name)?;
            } else if segment::is_complete(&output) {
                info!("step '{name}': output is complete, skipping");
                continue;
            }
            if name.is_parallel() {
                let map = self.shared_id_map(&mut id_map)?;
                self.run_parallel(name, &map, &mut summary)?;
            } else {
                self.run_sequential(name, &mut summary)?;
            }
            if !segment::is_complete(&output) {
                bail!("step '{name}' did not produce a complete output: {}", output.display());
            }
        }
        self.write_summary(&summary)?;
        Ok(())
    }

    /// The canonical output artifact of a step.
    fn output_path(&self, name: StepName) -> std::path::PathBuf {
        match name {
            StepName::Sequences => self.config.nids_path(),
            StepName::Graph => self.config.graph_path(),
            StepName::Stats => self.config.stats_path(),
            StepName::Components => self.config.components_path(),
        }
    }

    /// Under --force, stale canonical output and shards are removed before
    /// the step re-runs, so the merge cannot pick up old data.
    fn clear_existing(&self, name: StepName) -> Result<()> {
        let output = self.output_path(name);
        let mut stale = segment::shard_parts(&output).unwrap_or_default();
        if output.exists() {
            stale.push(output);
        }
        for path in stale {
            info!("step '{name}': removing existing {}", path.display());
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Loads the id map once and shares it with every later stage.
    fn shared_id_map(&self, cache: &mut Option<Arc<IdMap>>) -> Result<Arc<IdMap>> {
        if let Some(map) = cache {
            return Ok(Arc::clone(map));
        }
        let path = self.config.nids_path();
        let map = Arc::new(
            IdMap::load(&path)
                .with_context(|| "the sequence index must be complete before link steps run")?,
        );
        info!("loaded id map with {} sequences from {}", map.len(), path.display());
        cache.replace(Arc::clone(&map));
        Ok(map)
    }

    fn run_sequential(&self, name: StepName, summary: &mut Vec<SummaryRow>) -> Result<()> {
        let mut step = match name {
            StepName::Sequences => Step::Sequences(SequencesStep::new(&self.config)),
            StepName::Components => Step::Components(ComponentsStep::new(&self.config)),
            StepName::Graph | StepName::Stats => {
                bail!("step '{name}' is chunk-parallel")
            }
        };
        if !self.config.force && step.is_complete() {
            info!("step '{name}': output is complete, skipping");
            return Ok(());
        }
        step.start_up().with_context(|| format!("step '{name}' start_up"))?;
        step.run().with_context(|| format!("step '{name}' run"))?;
        let counters = step.finish().with_context(|| format!("step '{name}' finish"))?;
        summary.push(SummaryRow::new(name, None, counters));
        Ok(())
    }

    fn run_parallel(
        &self,
        name: StepName,
        id_map: &Arc<IdMap>,
        summary: &mut Vec<SummaryRow>,
    ) -> Result<()> {
        let input = &self.config.links;
        if !input.exists() {
            bail!("step '{name}': input link file {} is missing", input.display());
        }
        let chunks = slice::plan(input, self.config.effective_chunks())?;
        let workers = chunks
            .len()
            .min(thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get));
        info!("step '{name}': {} chunks, {} workers", chunks.len(), workers);

        let (task_tx, task_rx) = bounded::<Chunk>(chunks.len());
        let (result_tx, result_rx) = bounded::<ChunkOutcome>(chunks.len());
        for chunk in &chunks {
            if task_tx.send(*chunk).is_err() {
                bail!("task channel closed unexpectedly");
            }
        }
        drop(task_tx);

        let outcomes: Vec<ChunkOutcome> = thread::scope(|scope| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let id_map = Arc::clone(id_map);
                let config = &self.config;
                scope.spawn(move || {
                    for chunk in task_rx.iter() {
                        let caught = catch_unwind(AssertUnwindSafe(|| {
                            run_chunk(config, name, &chunk, &id_map)
                        }));
                        let result = match caught {
                            Ok(Ok(counters)) => Ok(counters),
                            Ok(Err(e)) => Err(format!("{e:#}")),
                            Err(payload) => Err(panic_message(payload.as_ref())),
                        };
                        if result_tx.send(ChunkOutcome { chunk, result }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);
            drop(task_rx);
            result_rx.iter().collect()
        });

        let mut failures: Vec<WorkerFailure> = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(counters) => {
                    summary.push(SummaryRow::new(name, Some(outcome.chunk.index), counters));
                }
                Err(message) => failures.push(WorkerFailure {
                    step: name.to_string(),
                    chunk: outcome.chunk.index,
                    message,
                }),
            }
        }
        if !failures.is_empty() {
            failures.sort_by_key(|f| f.chunk);
            for failure in &failures {
                error!("{failure}");
            }
            bail!(
                "step '{name}' failed in {} of {} chunks; completed shards were kept for resumption",
                failures.len(),
                chunks.len()
            );
        }

        // all shards finished: unify them into the canonical output
        let mut representative = match name {
            StepName::Graph => Step::Graph(GraphStep::new(&self.config, None, Arc::clone(id_map))),
            StepName::Stats => Step::Stats(StatsStep::new(&self.config, None, Arc::clone(id_map))),
            StepName::Sequences | StepName::Components => {
                bail!("step '{name}' is sequential")
            }
        };
        let merged = representative
            .merge()
            .with_context(|| format!("step '{name}' merge"))?;
        if merged {
            info!("step '{name}': merged {} shard(s)", chunks.len());
        }
        Ok(())
    }

    fn write_summary(&self, rows: &[SummaryRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let path = self.config.summary_path();
        DelimFile::default()
            .write_tsv(&path, rows)
            .with_context(|| format!("Failed to write run summary: {}", path.display()))?;
        info!("wrote run summary: {}", path.display());
        Ok(())
    }
}

/// The worker task: build a shard-scoped step and drive its lifecycle over
/// one chunk of the link file.
fn run_chunk(
    config: &PipelineConfig,
    name: StepName,
    chunk: &Chunk,
    id_map: &Arc<IdMap>,
) -> Result<StepCounters> {
    let shard = Some((chunk.index, chunk.total));
    let mut step = match name {
        StepName::Graph => Step::Graph(GraphStep::new(config, shard, Arc::clone(id_map))),
        StepName::Stats => Step::Stats(StatsStep::new(config, shard, Arc::clone(id_map))),
        StepName::Sequences | StepName::Components => {
            bail!("step '{name}' is not chunk-parallel")
        }
    };
    if !config.force && step.is_complete() {
        info!("step '{name}' chunk {}: shard is complete, skipping", chunk.index);
        return Ok(StepCounters::default());
    }
    step.start_up()
        .with_context(|| format!("step '{name}' chunk {} start_up", chunk.index))?;
    for group in GroupSlice::new(&config.links, chunk)? {
        let group = group?;
        step.apply(WorkUnit::Group(group))?;
    }
    step.finish()
        .with_context(|| format!("step '{name}' chunk {} finish", chunk.index))
}

/// Renders a panic payload for the failure report.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic with non-string payload".to_string()
    }
}
