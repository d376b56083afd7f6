//! DocForge Reasoning Core
//!
//! Neuro-symbolic question answering over indexed documentation:
//! - Semantic parsing and symbol grounding (LLM with heuristic fallbacks)
//! - Forward-chaining and LLM-guided inference
//! - Session orchestration with suspension and resume
//! - LLM and knowledge-lookup clients
//! - Error types, configuration and metrics

pub mod config;
pub mod errors;
pub mod knowledge;
pub mod llm;
pub mod metrics;
pub mod reasoning;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use knowledge::KnowledgeBase;
pub use llm::LlmClient;
pub use reasoning::{InferenceMode, Pipeline, ReasoningOptions, ResumeInput};
pub use session::{Orchestrator, ReasoningOutcome, Session, SessionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
