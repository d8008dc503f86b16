//! Report artifact completeness.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;

use graphmill_lib::config::PipelineConfig;
use graphmill_lib::segment;

use crate::commands::command::Command;

/// Report the completeness of every pipeline artifact.
///
/// For each artifact the report shows whether it is complete, in-progress,
/// absent, or still sharded. Exits non-zero when any artifact is not
/// complete, so the command doubles as a scriptable readiness check.
#[derive(Debug, Parser)]
#[command(name = "check", about = "Report completeness of pipeline artifacts")]
pub struct Check {
    /// Working directory holding the pipeline artifacts.
    #[arg(short = 'd', long = "dir", default_value = ".")]
    pub dir: PathBuf,
}

/// Completeness state of one artifact.
enum ArtifactState {
    Complete,
    InProgress,
    Sharded { complete: usize, total: usize },
    Absent,
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactState::Complete => f.write_str("complete"),
            ArtifactState::InProgress => f.write_str("in-progress"),
            ArtifactState::Sharded { complete, total } => {
                write!(f, "sharded ({complete}/{total} shards complete)")
            }
            ArtifactState::Absent => f.write_str("absent"),
        }
    }
}

fn artifact_state(path: &Path) -> ArtifactState {
    if segment::is_complete(path) {
        return ArtifactState::Complete;
    }
    if path.exists() {
        return ArtifactState::InProgress;
    }
    let parts = segment::shard_parts(path).unwrap_or_default();
    if parts.is_empty() {
        return ArtifactState::Absent;
    }
    let complete = parts.iter().filter(|part| segment::is_complete(part)).count();
    ArtifactState::Sharded { complete, total: parts.len() }
}

impl Command for Check {
    fn execute(&self) -> Result<()> {
        let config = PipelineConfig::rooted_at(&self.dir);
        let artifacts = [
            ("sequences", config.nids_path()),
            ("graph", config.graph_path()),
            ("stats", config.stats_path()),
            ("components", config.components_path()),
        ];
        let mut incomplete = Vec::new();
        for (step, path) in &artifacts {
            let state = artifact_state(path);
            println!("{step:<12} {:<40} {state}", path.display().to_string());
            if !matches!(state, ArtifactState::Complete) {
                incomplete.push(*step);
            }
        }
        if !incomplete.is_empty() {
            bail!("incomplete artifacts: {}", incomplete.join(", "));
        }
        Ok(())
    }
}
