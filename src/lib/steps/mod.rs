//! Concrete pipeline steps.
//!
//! Each submodule implements one stage of the fixed pipeline:
//!
//! - [`sequences`] - index the input FASTA into the nid table
//! - [`graph`] - id-map, merge, and filter pairwise links
//! - [`stats`] - per-query neighbourhood statistics
//! - [`components`] - connected components of the filtered graph
//!
//! The [`Step`] enum is the closed step registry: the driver constructs a
//! variant per stage (and per chunk, for parallel stages) and drives it
//! through the [`StepModule`] lifecycle without knowing which step it holds.

use enum_dispatch::enum_dispatch;

use crate::errors::Result;
use crate::module::{StepCounters, StepModule, WorkUnit};

pub mod components;
pub mod graph;
pub mod sequences;
pub mod stats;

pub use components::ComponentsStep;
pub use graph::GraphStep;
pub use sequences::SequencesStep;
pub use stats::StatsStep;

/// The closed registry of pipeline steps.
#[enum_dispatch(StepModule)]
pub enum Step {
    Sequences(SequencesStep),
    Graph(GraphStep),
    Stats(StatsStep),
    Components(ComponentsStep),
}
