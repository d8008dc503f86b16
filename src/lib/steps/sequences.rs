//! The `sequences` step: index the input FASTA into the nid table.
//!
//! Assigns dense numeric ids (nids) to sequences in input order and writes
//! `nid\ttoken\tlength` for each. The table is the read-only id map every
//! later step uses to translate sequence tokens.

use std::path::PathBuf;

use log::info;

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::logging::OperationTimer;
use crate::module::{StepCounters, StepModule, StepOutput, WorkUnit};
use crate::segment;
use crate::slice::open_text;

/// Sequential step producing the sequence index.
pub struct SequencesStep {
    fasta: PathBuf,
    force: bool,
    append: bool,
    out: StepOutput,
    counters: StepCounters,
    timer: Option<OperationTimer>,
}

impl SequencesStep {
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            fasta: config.fasta.clone(),
            force: config.force,
            append: config.append,
            out: StepOutput::new(config.nids_path(), None),
            counters: StepCounters::default(),
            timer: None,
        }
    }

    /// Writes one indexed sequence, honouring the resume point.
    fn emit(&mut self, nid: u64, token: &str, length: u64, resume_after: Option<u64>) -> Result<()> {
        self.counters.input += 1;
        if resume_after.is_some_and(|last| nid <= last) {
            return Ok(());
        }
        self.out.write_line(&format!("{nid}\t{token}\t{length}"))?;
        self.counters.output += 1;
        Ok(())
    }
}

impl StepModule for SequencesStep {
    fn name(&self) -> &'static str {
        "sequences"
    }

    fn is_complete(&self) -> bool {
        self.out.is_complete()
    }

    fn start_up(&mut self) -> Result<()> {
        if !self.fasta.exists() {
            return Err(PipelineError::IncompleteInput { path: self.fasta.clone() });
        }
        self.timer = Some(OperationTimer::new("Indexing sequences"));
        let fresh = self.out.open(self.force, self.append)?;
        if fresh {
            self.out.write_line("# sequence index: dense nids in input order")?;
            self.out.write_line("nid\ttoken\tlength")?;
        } else if let Some(key) = self.out.continuation() {
            info!("sequences: continuing after nid {key}");
        }
        Ok(())
    }

    fn apply(&mut self, _unit: WorkUnit) -> Result<()> {
        unreachable!("sequences is a sequential step")
    }

    fn run(&mut self) -> Result<()> {
        let resume_after: Option<u64> =
            self.out.continuation().and_then(|key| key.parse().ok());
        let mut reader = open_text(&self.fasta)?;
        let mut line = String::new();
        let mut nid: u64 = 0;
        let mut current: Option<(String, u64)> = None;
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| PipelineError::io(&self.fasta, e))?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim_end();
            if let Some(header) = trimmed.strip_prefix('>') {
                if let Some((token, length)) = current.take() {
                    self.emit(nid, &token, length, resume_after)?;
                }
                nid += 1;
                let token = header.split_whitespace().next().unwrap_or(header);
                current = Some((token.to_string(), 0));
            } else if let Some((_, length)) = current.as_mut() {
                *length += trimmed.len() as u64;
            }
        }
        if let Some((token, length)) = current.take() {
            self.emit(nid, &token, length, resume_after)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<StepCounters> {
        self.out.close()?;
        if let Some(timer) = &self.timer {
            self.counters.elapsed_secs = timer.elapsed_secs();
            timer.log_completion(self.counters.input);
        }
        info!(
            "sequences finished: ninput={}, noutput={}",
            self.counters.input, self.counters.output
        );
        Ok(self.counters)
    }

    fn merge(&mut self) -> Result<bool> {
        segment::merge(self.out.logical())
    }
}
