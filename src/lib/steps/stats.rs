//! The `stats` step: per-query neighbourhood statistics.
//!
//! For each query with at least one mapped link, reports the neighbour
//! count, the best and worst evalue, and the fraction of the query covered
//! by any alignment.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::logging::OperationTimer;
use crate::module::{check_key_partition, StepCounters, StepModule, StepOutput, WorkUnit};
use crate::progress::ProgressTracker;
use crate::records::{IdMap, LinkRecord};
use crate::segment;

/// Chunk-parallel step producing per-query link statistics.
pub struct StatsStep {
    id_map: Arc<IdMap>,
    out: StepOutput,
    force: bool,
    append: bool,
    progress: ProgressTracker,
    counters: StepCounters,
    timer: Option<OperationTimer>,
}

impl StatsStep {
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        shard: Option<(usize, usize)>,
        id_map: Arc<IdMap>,
    ) -> Self {
        let label = match shard {
            Some((index, total)) => format!("stats[{index}/{total}]: queries"),
            None => "stats: queries".to_string(),
        };
        Self {
            id_map,
            out: StepOutput::new(config.stats_path(), shard),
            force: config.force,
            append: config.append,
            progress: ProgressTracker::new(label, config.report_interval),
            counters: StepCounters::default(),
            timer: None,
        }
    }
}

/// Residues of `[1, length]` covered by at least one alignment interval.
fn covered_residues(links: &[LinkRecord]) -> u64 {
    let mut intervals: Vec<(u32, u32)> =
        links.iter().map(|l| (l.query_start, l.query_end)).collect();
    intervals.sort_unstable();
    let mut covered: u64 = 0;
    let mut current: Option<(u32, u32)> = None;
    for (start, end) in intervals {
        match &mut current {
            Some((_, last_end)) if start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => {
                if let Some((s, e)) = current.take() {
                    covered += u64::from(e - s + 1);
                }
                current = Some((start, end));
            }
        }
    }
    if let Some((s, e)) = current {
        covered += u64::from(e - s + 1);
    }
    covered
}

impl StepModule for StatsStep {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn is_complete(&self) -> bool {
        self.out.is_complete()
    }

    fn start_up(&mut self) -> Result<()> {
        self.timer = Some(OperationTimer::new("Computing link statistics"));
        let fresh = self.out.open(self.force, self.append)?;
        if fresh {
            self.out.write_line("# per-query neighbourhood statistics")?;
            self.out.write_line("nid\tnlinks\tbest_evalue\tworst_evalue\tcoverage")?;
        } else if let Some(key) = self.out.continuation() {
            info!("stats: continuing after query nid {key}");
        }
        Ok(())
    }

    fn apply(&mut self, unit: WorkUnit) -> Result<()> {
        let WorkUnit::Group(group) = unit else {
            unreachable!("stats consumes grouped units")
        };
        self.counters.input += 1;
        self.progress.inc();

        let Some(query) = self.id_map.get(&group.key) else {
            debug!("stats: query '{}' not in id map, dropping group", group.key);
            self.counters.skipped += group.links.len() as u64;
            return Ok(());
        };
        if self.out.should_skip(&query.nid.to_string()) {
            return Ok(());
        }
        let mapped: Vec<&LinkRecord> = group
            .links
            .iter()
            .filter(|link| {
                let known = self.id_map.get(&link.sbjct).is_some();
                if !known {
                    self.counters.skipped += 1;
                }
                known
            })
            .collect();
        if mapped.is_empty() {
            return Ok(());
        }
        let best = mapped.iter().map(|l| l.evalue).fold(f64::INFINITY, f64::min);
        let worst = mapped.iter().map(|l| l.evalue).fold(f64::NEG_INFINITY, f64::max);
        let owned: Vec<LinkRecord> = mapped.into_iter().cloned().collect();
        let covered = covered_residues(&owned);
        let coverage = if query.length > 0 {
            covered as f64 / f64::from(query.length)
        } else {
            0.0
        };
        self.out.write_line(&format!(
            "{}\t{}\t{}\t{}\t{:.4}",
            query.nid,
            owned.len(),
            best,
            worst,
            coverage.min(1.0)
        ))?;
        self.counters.output += 1;
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        unreachable!("stats is a chunk-parallel step")
    }

    fn finish(&mut self) -> Result<StepCounters> {
        self.out.close()?;
        self.progress.log_final();
        if let Some(timer) = &self.timer {
            self.counters.elapsed_secs = timer.elapsed_secs();
        }
        if self.counters.skipped > 0 {
            warn!(
                "stats: {} link(s) dropped because an id was not in the map",
                self.counters.skipped
            );
        }
        info!(
            "stats finished: ninput={}, noutput={}, nskipped={}",
            self.counters.input, self.counters.output, self.counters.skipped
        );
        Ok(self.counters)
    }

    fn merge(&mut self) -> Result<bool> {
        let merged = segment::merge(self.out.logical())?;
        if merged {
            check_key_partition(self.out.logical(), None)?;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::LinkGroup;
    use crate::segment::SegmentReader;
    use tempfile::TempDir;

    fn link(sbjct: &str, evalue: f64, qs: u32, qe: u32) -> LinkRecord {
        LinkRecord {
            query: "q1".to_string(),
            sbjct: sbjct.to_string(),
            evalue,
            query_start: qs,
            query_end: qe,
            query_ali: "+0".to_string(),
            sbjct_start: qs,
            sbjct_end: qe,
            sbjct_ali: "+0".to_string(),
        }
    }

    #[test]
    fn test_covered_residues_merges_overlaps() {
        let links = vec![link("s1", 0.1, 1, 50), link("s2", 0.1, 40, 60), link("s3", 0.1, 80, 90)];
        assert_eq!(covered_residues(&links), 60 + 11);
    }

    #[test]
    fn test_stats_row_per_query() {
        let dir = TempDir::new().unwrap();
        let nids = dir.path().join("nids.tsv");
        let mut writer = segment::SegmentWriter::create(&nids, false).unwrap();
        writer.write_line("nid\ttoken\tlength").unwrap();
        writer.write_line("1\tq1\t100").unwrap();
        writer.write_line("2\ts1\t100").unwrap();
        writer.close().unwrap();
        let id_map = Arc::new(IdMap::load(&nids).unwrap());

        let config = PipelineConfig::rooted_at(dir.path());
        let mut step = StatsStep::new(&config, None, id_map);
        step.start_up().unwrap();
        step.apply(WorkUnit::Group(LinkGroup {
            key: "q1".to_string(),
            links: vec![link("s1", 1e-10, 1, 50), link("s1", 1e-2, 26, 75)],
        }))
        .unwrap();
        let counters = step.finish().unwrap();
        assert_eq!(counters.output, 1);

        let row = SegmentReader::open(config.stats_path())
            .unwrap()
            .map(|l| l.unwrap())
            .find(|l| !l.starts_with('#') && !l.starts_with("nid"))
            .unwrap();
        let fields: Vec<&str> = row.split('\t').collect();
        assert_eq!(fields[0], "1");
        assert_eq!(fields[1], "2");
        assert_eq!(fields[4], "0.7500"); // residues 1..=75 of length 100
    }
}
