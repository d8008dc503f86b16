#![deny(unsafe_code)]
// Clippy lint configuration for CI
// These lints are allowed because:
// - cast_*: byte-offset and counter arithmetic intentionally casts between numeric types
// - missing_*_doc: documentation improvements tracked separately
// - module_name_repetitions: step types are named after their step on purpose
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

//! # graphmill - restartable batch pipeline for pairwise-alignment graphs
//!
//! This library provides the infrastructure for running a fixed sequence of
//! expensive, interruptible computations over very large link files:
//! restartable, chunk-parallel, and verifiably complete.
//!
//! ## Overview
//!
//! ### Core Infrastructure
//!
//! - **[`segment`]** - sentinel-terminated segmented files, shard naming, merge
//! - **[`slice`]** - byte-range chunk planning and boundary-safe iteration
//! - **[`module`]** - the step lifecycle contract ([`module::StepModule`])
//! - **[`driver`]** - step sequencing, worker pool, failure aggregation
//!
//! ### Domain
//!
//! - **[`records`]** - link records, grouping, the id→nid map
//! - **[`steps`]** - the concrete pipeline steps
//! - **[`config`]** - the explicit pipeline configuration
//!
//! ### Utilities
//!
//! - **[`errors`]** - structured error taxonomy
//! - **[`logging`]** - duration/count formatting, operation timing
//! - **[`progress`]** - interval progress reporting
//!
//! ## Quick Start
//!
//! ```no_run
//! use graphmill_lib::config::PipelineConfig;
//! use graphmill_lib::driver::{Pipeline, STEP_ORDER};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PipelineConfig::rooted_at("work");
//! Pipeline::new(config).run(&STEP_ORDER)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Completeness protocol
//!
//! Every artifact is either absent, in-progress, or complete; only complete
//! files (trailing sentinel) are consumed by later steps. Interrupting the
//! process at any point leaves in-progress files without the sentinel, which
//! is exactly the signal the next run needs to resume:
//!
//! ```no_run
//! use graphmill_lib::segment;
//!
//! if segment::is_complete("work/graphmill.graph") {
//!     // safe to consume
//! }
//! ```

pub mod config;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod module;
pub mod progress;
pub mod records;
pub mod segment;
pub mod slice;
pub mod steps;
