//! Recollect - adaptive memory and context engineering for LLM agents
//!
//! Three memory stores (episodic, semantic, procedural), an LLM-driven
//! consolidation engine that turns conversations into temporal facts, and a
//! retrieve -> rerank -> compress -> assemble pipeline that builds
//! token-budgeted context. [`MemoryManager`] ties them together.

pub mod config;
pub mod consolidation;
pub mod context;
pub mod episodic;
pub mod error;
pub mod manager;
pub mod ports;
pub mod procedural;
pub mod semantic;
pub mod testing;

pub use config::Config;
pub use error::{MemoryError, Result};
pub use manager::{Collaborators, MemoryManager};
