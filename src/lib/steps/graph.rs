//! The `graph` step: translate, merge, and filter pairwise links.
//!
//! Consumes the raw link file grouped by query token and writes the
//! filtered link graph keyed by nids. Links to sequences missing from the
//! id map are dropped and counted rather than aborting the run. When repeat
//! merging is enabled, consecutive links to the same subject that are
//! adjacent on both sequences are collapsed into one link spanning both,
//! keeping the better evalue; this joins alignments split by low-complexity
//! or transmembrane regions without merging genuine 1:many repeats.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::logging::OperationTimer;
use crate::module::{check_key_partition, StepCounters, StepModule, StepOutput, WorkUnit};
use crate::progress::ProgressTracker;
use crate::records::{IdMap, LinkRecord};
use crate::segment;

/// Chunk-parallel step producing the filtered link graph.
pub struct GraphStep {
    id_map: Arc<IdMap>,
    out: StepOutput,
    force: bool,
    append: bool,
    max_evalue: f64,
    merge_repeats: bool,
    min_domain_size: u32,
    progress: ProgressTracker,
    counters: StepCounters,
    joined: u64,
    timer: Option<OperationTimer>,
}

impl GraphStep {
    #[must_use]
    pub fn new(
        config: &PipelineConfig,
        shard: Option<(usize, usize)>,
        id_map: Arc<IdMap>,
    ) -> Self {
        let label = match shard {
            Some((index, total)) => format!("graph[{index}/{total}]: queries"),
            None => "graph: queries".to_string(),
        };
        Self {
            id_map,
            out: StepOutput::new(config.graph_path(), shard),
            force: config.force,
            append: config.append,
            max_evalue: config.max_evalue,
            merge_repeats: config.merge_repeats,
            min_domain_size: config.min_domain_size,
            progress: ProgressTracker::new(label, config.report_interval),
            counters: StepCounters::default(),
            joined: 0,
            timer: None,
        }
    }

    /// Collapses consecutive links to the same subject that are adjacent on
    /// both sequences, keeping the better evalue and the combined span.
    fn merge_adjacent(&mut self, mut links: Vec<LinkRecord>) -> Vec<LinkRecord> {
        links.sort_by(|a, b| {
            (a.sbjct.as_str(), a.query_start).cmp(&(b.sbjct.as_str(), b.query_start))
        });
        let mut merged: Vec<LinkRecord> = Vec::with_capacity(links.len());
        for link in links {
            if let Some(last) = merged.last_mut() {
                if link.sbjct == last.sbjct
                    && gap(last.query_end, link.query_start)
                        .is_some_and(|g| g <= self.min_domain_size)
                    && gap(last.sbjct_end, link.sbjct_start)
                        .is_some_and(|g| g <= self.min_domain_size)
                {
                    self.joined += 1;
                    last.evalue = last.evalue.min(link.evalue);
                    last.query_end = last.query_end.max(link.query_end);
                    last.sbjct_end = last.sbjct_end.max(link.sbjct_end);
                    continue;
                }
            }
            merged.push(link);
        }
        merged
    }
}

/// The positive gap between the end of one alignment and the start of the
/// next, or `None` when they touch or overlap.
fn gap(end: u32, start: u32) -> Option<u32> {
    (start > end).then(|| start - end)
}

impl StepModule for GraphStep {
    fn name(&self) -> &'static str {
        "graph"
    }

    fn is_complete(&self) -> bool {
        self.out.is_complete()
    }

    fn start_up(&mut self) -> Result<()> {
        self.timer = Some(OperationTimer::new("Building graph"));
        let fresh = self.out.open(self.force, self.append)?;
        if fresh {
            self.out.write_line("# filtered link graph keyed by nid")?;
            self.out.write_line(
                "query_nid\tsbjct_nid\tevalue\tquery_start\tquery_end\tsbjct_start\tsbjct_end",
            )?;
        } else if let Some(key) = self.out.continuation() {
            info!("graph: continuing after query nid {key}");
        }
        Ok(())
    }

    fn apply(&mut self, unit: WorkUnit) -> Result<()> {
        let WorkUnit::Group(group) = unit else {
            unreachable!("graph consumes grouped units")
        };
        self.counters.input += 1;
        self.progress.inc();

        let Some(query) = self.id_map.get(&group.key) else {
            debug!("graph: query '{}' not in id map, dropping group", group.key);
            self.counters.skipped += group.links.len() as u64;
            return Ok(());
        };
        if self.out.should_skip(&query.nid.to_string()) {
            return Ok(());
        }
        let links = if self.merge_repeats {
            self.merge_adjacent(group.links)
        } else {
            group.links
        };
        for link in links {
            if link.evalue > self.max_evalue {
                continue;
            }
            let Some(sbjct) = self.id_map.get(&link.sbjct) else {
                debug!("graph: sbjct '{}' not in id map, dropping link", link.sbjct);
                self.counters.skipped += 1;
                continue;
            };
            self.out.write_line(&format!(
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                query.nid,
                sbjct.nid,
                link.evalue,
                link.query_start,
                link.query_end,
                link.sbjct_start,
                link.sbjct_end
            ))?;
            self.counters.output += 1;
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        unreachable!("graph is a chunk-parallel step")
    }

    fn finish(&mut self) -> Result<StepCounters> {
        self.out.close()?;
        self.progress.log_final();
        if let Some(timer) = &self.timer {
            self.counters.elapsed_secs = timer.elapsed_secs();
        }
        if self.counters.skipped > 0 {
            warn!(
                "graph: {} link(s) dropped because an id was not in the map",
                self.counters.skipped
            );
        }
        info!(
            "graph finished: ninput={}, noutput={}, nskipped={}, njoined={}",
            self.counters.input, self.counters.output, self.counters.skipped, self.joined
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

    fn link(sbjct: &str, evalue: f64, qs: u32, qe: u32, ss: u32, se: u32) -> LinkRecord {
        LinkRecord {
            query: "q1".to_string(),
            sbjct: sbjct.to_string(),
            evalue,
            query_start: qs,
            query_end: qe,
            query_ali: "+0".to_string(),
            sbjct_start: ss,
            sbjct_end: se,
            sbjct_ali: "+0".to_string(),
        }
    }

    fn test_id_map(dir: &TempDir, tokens: &[&str]) -> Arc<IdMap> {
        let path = dir.path().join("nids.tsv");
        let mut writer = segment::SegmentWriter::create(&path, false).unwrap();
        writer.write_line("nid\ttoken\tlength").unwrap();
        for (i, token) in tokens.iter().enumerate() {
            writer.write_line(&format!("{}\t{token}\t100", i + 1)).unwrap();
        }
        writer.close().unwrap();
        Arc::new(IdMap::load(&path).unwrap())
    }

    fn payload_lines(path: &std::path::Path) -> Vec<String> {
        SegmentReader::open(path)
            .unwrap()
            .map(|l| l.unwrap())
            .filter(|l| !l.starts_with('#'))
            .skip(1) // header
            .collect()
    }

    #[test]
    fn test_adjacent_links_are_joined() {
        let dir = TempDir::new().unwrap();
        let id_map = test_id_map(&dir, &["q1", "s1"]);
        let config = PipelineConfig {
            min_domain_size: 30,
            ..PipelineConfig::rooted_at(dir.path())
        };
        let mut step = GraphStep::new(&config, None, id_map);
        step.start_up().unwrap();
        let group = LinkGroup {
            key: "q1".to_string(),
            links: vec![
                link("s1", 1e-10, 1, 50, 1, 50),
                link("s1", 1e-5, 60, 100, 60, 100),
            ],
        };
        step.apply(WorkUnit::Group(group)).unwrap();
        let counters = step.finish().unwrap();
        assert_eq!(counters.output, 1);

        let lines = payload_lines(&config.graph_path());
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(fields[0], "1"); // query nid
        assert_eq!(fields[1], "2"); // sbjct nid
        assert_eq!(fields[2], "0.0000000001"); // better evalue kept
        assert_eq!(fields[4], "100"); // combined span
    }

    #[test]
    fn test_distant_links_are_not_joined() {
        let dir = TempDir::new().unwrap();
        let id_map = test_id_map(&dir, &["q1", "s1"]);
        let config = PipelineConfig {
            min_domain_size: 30,
            ..PipelineConfig::rooted_at(dir.path())
        };
        let mut step = GraphStep::new(&config, None, id_map);
        step.start_up().unwrap();
        let group = LinkGroup {
            key: "q1".to_string(),
            links: vec![
                link("s1", 1e-10, 1, 50, 1, 50),
                link("s1", 1e-5, 200, 250, 200, 250),
            ],
        };
        step.apply(WorkUnit::Group(group)).unwrap();
        let counters = step.finish().unwrap();
        assert_eq!(counters.output, 2);
    }

    #[test]
    fn test_unknown_ids_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let id_map = test_id_map(&dir, &["q1", "s1"]);
        let config = PipelineConfig::rooted_at(dir.path());
        let mut step = GraphStep::new(&config, None, Arc::clone(&id_map));
        step.start_up().unwrap();
        step.apply(WorkUnit::Group(LinkGroup {
            key: "unknown".to_string(),
            links: vec![link("s1", 1e-10, 1, 50, 1, 50)],
        }))
        .unwrap();
        step.apply(WorkUnit::Group(LinkGroup {
            key: "q1".to_string(),
            links: vec![link("missing", 1e-10, 1, 50, 1, 50)],
        }))
        .unwrap();
        let counters = step.finish().unwrap();
        assert_eq!(counters.input, 2);
        assert_eq!(counters.output, 0);
        assert_eq!(counters.skipped, 2);
    }

    #[test]
    fn test_evalue_filter() {
        let dir = TempDir::new().unwrap();
        let id_map = test_id_map(&dir, &["q1", "s1"]);
        let config = PipelineConfig {
            max_evalue: 1e-5,
            merge_repeats: false,
            ..PipelineConfig::rooted_at(dir.path())
        };
        let mut step = GraphStep::new(&config, None, id_map);
        step.start_up().unwrap();
        step.apply(WorkUnit::Group(LinkGroup {
            key: "q1".to_string(),
            links: vec![
                link("s1", 1e-10, 1, 50, 1, 50),
                link("s1", 0.5, 200, 250, 200, 250),
            ],
        }))
        .unwrap();
        let counters = step.finish().unwrap();
        assert_eq!(counters.output, 1);
    }

    #[test]
    fn test_sharded_outputs_merge_into_canonical_graph() {
        let dir = TempDir::new().unwrap();
        let id_map = test_id_map(&dir, &["q1", "q2", "s1"]);
        let config = PipelineConfig::rooted_at(dir.path());

        for (index, key) in ["q1", "q2"].iter().enumerate() {
            let mut step = GraphStep::new(&config, Some((index, 2)), Arc::clone(&id_map));
            assert!(!step.is_complete());
            step.start_up().unwrap();
            step.apply(WorkUnit::Group(LinkGroup {
                key: (*key).to_string(),
                links: vec![link("s1", 1e-10, 1, 50, 1, 50)],
            }))
            .unwrap();
            step.finish().unwrap();
        }

        let mut representative = GraphStep::new(&config, None, id_map);
        assert!(representative.merge().unwrap());
        assert!(segment::is_complete(config.graph_path()));
        assert_eq!(payload_lines(&config.graph_path()).len(), 2);
        // idempotent: second merge is a no-op
        assert!(!representative.merge().unwrap());
    }
}
