//! Episodic -> semantic consolidation
//!
//! [`ConsolidationEngine`] turns batches of episodic entries into graph
//! operations through the generation capability; [`ConsolidationDaemon`]
//! drives it on an adaptive schedule.

pub mod daemon;
pub mod engine;
pub mod prompts;
pub mod types;

pub use daemon::{ConsolidationDaemon, DaemonMetrics, MetricsSnapshot, TickOutcome, select_interval};
pub use engine::ConsolidationEngine;
pub use prompts::{CONSOLIDATION_PROMPT, build_prompt, parse_operations};
pub use types::{
    ApplyStats, ConsolidationMode, ConsolidationOperation, ConsolidationReport, ConsolidationState,
};
