//! The lifecycle contract every computational step implements.
//!
//! The driver treats all steps interchangeably through [`StepModule`]:
//!
//! ```text
//! NotStarted -> (is_complete? -> skipped) -> start_up -> run | apply* -> finish -> merge
//! ```
//!
//! A step that owns a complete output is skipped without `start_up` ever
//! running. A step resumed in append mode recovers its continuation key in
//! `start_up` and silently skips every unit up to and including that key.
//! `finish` sentinel-closes the step's outputs and reports counters; `merge`
//! runs once per step, after every shard has finished, and unifies shard
//! outputs into the canonical file.

use std::path::{Path, PathBuf};

use enum_dispatch::enum_dispatch;
use log::warn;

use crate::errors::{PipelineError, Result};
use crate::records::LinkGroup;
use crate::segment::{self, SegmentReader, SegmentWriter};

/// One unit of work routed into a step's `apply`.
#[derive(Debug, Clone)]
pub enum WorkUnit {
    /// A single payload line.
    Line(String),
    /// All records sharing one grouping key.
    Group(LinkGroup),
}

impl WorkUnit {
    /// The grouping key, when the unit has one.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            WorkUnit::Line(line) => crate::records::key_of(line),
            WorkUnit::Group(group) => Some(&group.key),
        }
    }
}

/// Counters reported by a step's `finish`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepCounters {
    /// Units received by `apply` (or scanned by `run`)
    pub input: u64,
    /// Records written
    pub output: u64,
    /// Records dropped because a cross-reference lookup failed
    pub skipped: u64,
    /// Wall-clock seconds spent in the step
    pub elapsed_secs: f64,
}

/// Trait implemented by every pipeline step.
///
/// Chunk-parallel steps are driven through `apply`, one [`WorkUnit`] at a
/// time; sequential steps do their whole computation in `run`. Each concrete
/// step implements whichever entry point its stage uses and rejects the
/// other.
#[enum_dispatch]
pub trait StepModule {
    /// The step's stable name, used in logs and the run summary.
    fn name(&self) -> &'static str;

    /// True when this step's output (scoped to this shard, if sharded) is
    /// already complete and the step can be skipped.
    fn is_complete(&self) -> bool;

    /// Idempotent setup: verify prerequisites, open output streams, recover
    /// the continuation key when resuming.
    fn start_up(&mut self) -> Result<()>;

    /// Transform one unit of work into zero or more output records.
    fn apply(&mut self, unit: WorkUnit) -> Result<()>;

    /// Run a sequential step to completion.
    fn run(&mut self) -> Result<()>;

    /// Flush and sentinel-close all owned outputs; report counters.
    fn finish(&mut self) -> Result<StepCounters>;

    /// Unify shard outputs into the canonical file after all shards have
    /// finished. Returns true when a merge actually occurred.
    fn merge(&mut self) -> Result<bool>;
}

/// One sentinel-terminated output owned by a step, scoped to a shard when
/// the step is chunk-parallel.
///
/// Wraps the open/append/force decision tree, the continuation-key recovery
/// on resumption, and the exactly-once skip of already-processed units.
pub struct StepOutput {
    logical: PathBuf,
    target: PathBuf,
    sharded: bool,
    writer: Option<SegmentWriter>,
    continuation: Option<String>,
}

impl StepOutput {
    /// Creates the handle for `logical`, scoped to `shard` when given as
    /// `(index, total)`.
    #[must_use]
    pub fn new(logical: PathBuf, shard: Option<(usize, usize)>) -> Self {
        let target = match shard {
            Some((index, total)) => segment::shard_path(&logical, total, index),
            None => logical.clone(),
        };
        Self { logical, target, sharded: shard.is_some(), writer: None, continuation: None }
    }

    /// True when the canonical file, or this shard, is already complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        segment::is_complete(&self.logical)
            || (self.sharded && segment::is_complete(&self.target))
    }

    /// Opens the output for writing.
    ///
    /// In append mode over an existing in-progress file, the continuation
    /// key is recovered from the file tail before reopening. Returns true
    /// when the output is fresh, i.e. the step should write its header.
    pub fn open(&mut self, force: bool, append: bool) -> Result<bool> {
        let resume = append && self.target.exists();
        if resume {
            self.continuation = segment::find_continuation_key(&self.target)?;
            self.writer = Some(SegmentWriter::append(&self.target)?);
        } else {
            self.continuation = None;
            self.writer = Some(SegmentWriter::create(&self.target, force)?);
        }
        Ok(!resume)
    }

    /// Exactly-once skip of units at or before the continuation key.
    ///
    /// Returns true while resuming has not yet passed the continuation
    /// point; the key is cleared when its own unit is seen, so everything
    /// after it is processed normally.
    pub fn should_skip(&mut self, key: &str) -> bool {
        match &self.continuation {
            Some(continuation) => {
                if continuation == key {
                    self.continuation = None;
                }
                true
            }
            None => false,
        }
    }

    /// The recovered continuation key, while resuming.
    #[must_use]
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Writes one payload line.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_line(line),
            None => Err(PipelineError::io(
                &self.target,
                std::io::Error::other("output stream is not open"),
            )),
        }
    }

    /// Sentinel-closes the output. Safe to call when never opened.
    pub fn close(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        }
    }

    /// The canonical (unsharded) path.
    #[must_use]
    pub fn logical(&self) -> &Path {
        &self.logical
    }

    /// The file this handle actually writes: the shard path when sharded.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// Cross-shard invariant check run by step `merge` implementations.
///
/// Scans the merged file and warns about keys that appear in more than one
/// run (a key emitted by two shards) and, when `expected_keys` is known,
/// about a distinct-key count that does not match. Mismatches are reported
/// as warnings, never as failures: partial results remain useful to an
/// operator deciding whether to re-run.
pub fn check_key_partition(path: &Path, expected_keys: Option<usize>) -> Result<()> {
    let mut seen = ahash::AHashSet::new();
    let mut last: Option<String> = None;
    let mut duplicates: u64 = 0;
    let mut header_skipped = false;
    for line in SegmentReader::open(path)? {
        let line = line?;
        let Some(key) = crate::records::key_of(&line) else { continue };
        if !header_skipped {
            header_skipped = true;
            continue;
        }
        if last.as_deref() == Some(key) {
            continue;
        }
        if !seen.insert(key.to_string()) {
            duplicates += 1;
        }
        last = Some(key.to_string());
    }
    if duplicates > 0 {
        warn!(
            "{}: {duplicates} key(s) appear in more than one shard run",
            path.display()
        );
    }
    if let Some(expected) = expected_keys {
        if seen.len() != expected {
            warn!(
                "{}: merged file has {} distinct keys, expected {expected}",
                path.display(),
                seen.len()
            );
        }
    }
    Ok(())
}
