//! The `components` step: connected components of the filtered graph.
//!
//! Reads the complete merged graph and labels every nid with its component,
//! where a component's label is the smallest nid it contains. The graph
//! LogicalFile must be complete before this step will run.

use std::path::PathBuf;

use ahash::AHashMap;
use log::info;

use crate::config::PipelineConfig;
use crate::errors::{PipelineError, Result};
use crate::logging::OperationTimer;
use crate::module::{StepCounters, StepModule, StepOutput, WorkUnit};
use crate::segment::{self, SegmentReader};

/// Sequential step labelling graph components.
pub struct ComponentsStep {
    graph: PathBuf,
    force: bool,
    append: bool,
    out: StepOutput,
    counters: StepCounters,
    timer: Option<OperationTimer>,
}

impl ComponentsStep {
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            graph: config.graph_path(),
            force: config.force,
            append: config.append,
            out: StepOutput::new(config.components_path(), None),
            counters: StepCounters::default(),
            timer: None,
        }
    }
}

/// Union-find over sparse nids, with path compression.
#[derive(Default)]
struct Components {
    parent: AHashMap<u64, u64>,
}

impl Components {
    fn find(&mut self, node: u64) -> u64 {
        let mut root = node;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        // path compression
        let mut current = node;
        while let Some(&parent) = self.parent.get(&current) {
            if parent == root {
                break;
            }
            self.parent.insert(current, root);
            current = parent;
        }
        self.parent.entry(node).or_insert(root);
        root
    }

    fn union(&mut self, a: u64, b: u64) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            // smaller root wins so labels are deterministic
            let (keep, absorb) = if root_a < root_b { (root_a, root_b) } else { (root_b, root_a) };
            self.parent.insert(absorb, keep);
        }
    }

    /// `(nid, component)` pairs sorted by nid.
    fn labelled(mut self) -> Vec<(u64, u64)> {
        let nodes: Vec<u64> = self.parent.keys().copied().collect();
        let mut labelled: Vec<(u64, u64)> =
            nodes.into_iter().map(|node| (node, 0)).collect();
        for entry in &mut labelled {
            entry.1 = self.find(entry.0);
        }
        labelled.sort_unstable();
        labelled
    }
}

impl StepModule for ComponentsStep {
    fn name(&self) -> &'static str {
        "components"
    }

    fn is_complete(&self) -> bool {
        self.out.is_complete()
    }

    fn start_up(&mut self) -> Result<()> {
        if !segment::is_complete(&self.graph) {
            return Err(PipelineError::IncompleteInput { path: self.graph.clone() });
        }
        self.timer = Some(OperationTimer::new("Labelling components"));
        let fresh = self.out.open(self.force, self.append)?;
        if fresh {
            self.out.write_line("# connected components of the filtered graph")?;
            self.out.write_line("nid\tcomponent")?;
        } else if let Some(key) = self.out.continuation() {
            info!("components: continuing after nid {key}");
        }
        Ok(())
    }

    fn apply(&mut self, _unit: WorkUnit) -> Result<()> {
        unreachable!("components is a sequential step")
    }

    fn run(&mut self) -> Result<()> {
        let resume_after: Option<u64> =
            self.out.continuation().and_then(|key| key.parse().ok());
        let mut components = Components::default();
        let mut saw_header = false;
        for line in SegmentReader::open(&self.graph)? {
            let line = line?;
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            if !saw_header {
                saw_header = true;
                continue;
            }
            let mut fields = line.split('\t');
            let (Some(query), Some(sbjct)) = (fields.next(), fields.next()) else {
                return Err(PipelineError::Parse {
                    path: self.graph.clone(),
                    line,
                    reason: "expected columns query_nid, sbjct_nid".to_string(),
                });
            };
            let parse = |value: &str| -> Result<u64> {
                value.parse().map_err(|_| PipelineError::Parse {
                    path: self.graph.clone(),
                    line: line.clone(),
                    reason: "nid is not an integer".to_string(),
                })
            };
            components.union(parse(query)?, parse(sbjct)?);
            self.counters.input += 1;
        }
        for (nid, component) in components.labelled() {
            if resume_after.is_some_and(|last| nid <= last) {
                continue;
            }
            self.out.write_line(&format!("{nid}\t{component}"))?;
            self.counters.output += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<StepCounters> {
        self.out.close()?;
        if let Some(timer) = &self.timer {
            self.counters.elapsed_secs = timer.elapsed_secs();
        }
        info!(
            "components finished: nedges={}, nnodes={}",
            self.counters.input, self.counters.output
        );
        Ok(self.counters)
    }

    fn merge(&mut self) -> Result<bool> {
        segment::merge(self.out.logical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentWriter;
    use tempfile::TempDir;

    fn write_graph(config: &PipelineConfig, edges: &[(u64, u64)]) {
        let mut writer = SegmentWriter::create(config.graph_path(), false).unwrap();
        writer.write_line("# graph").unwrap();
        writer
            .write_line("query_nid\tsbjct_nid\tevalue\tquery_start\tquery_end\tsbjct_start\tsbjct_end")
            .unwrap();
        for (a, b) in edges {
            writer.write_line(&format!("{a}\t{b}\t0.001\t1\t50\t1\t50")).unwrap();
        }
        writer.close().unwrap();
    }

    fn read_labels(config: &PipelineConfig) -> Vec<(u64, u64)> {
        SegmentReader::open(config.components_path())
            .unwrap()
            .map(|l| l.unwrap())
            .filter(|l| !l.starts_with('#') && !l.starts_with("nid"))
            .map(|l| {
                let mut fields = l.split('\t');
                (
                    fields.next().unwrap().parse().unwrap(),
                    fields.next().unwrap().parse().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_labels_use_smallest_member_nid() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        write_graph(&config, &[(5, 3), (3, 9), (2, 7)]);

        let mut step = ComponentsStep::new(&config);
        step.start_up().unwrap();
        step.run().unwrap();
        let counters = step.finish().unwrap();
        assert_eq!(counters.input, 3);
        assert_eq!(counters.output, 5);
        assert_eq!(read_labels(&config), vec![(2, 2), (3, 3), (5, 3), (7, 2), (9, 3)]);
    }

    #[test]
    fn test_requires_complete_graph() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::rooted_at(dir.path());
        std::fs::write(config.graph_path(), "query_nid\tsbjct_nid\n1\t2\n").unwrap();
        let mut step = ComponentsStep::new(&config);
        let err = step.start_up().unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteInput { .. }));
    }
}
