//! Reasoning Pipeline Components
//!
//! The pipeline turns a natural-language question into an explained,
//! confidence-scored answer:
//! - Semantic parsing (intent, entities, relations)
//! - Symbol grounding (formal ids, knowledge-base matches)
//! - Inference (forward-chaining rules, LLM guidance, or both)
//! - Explanation
//!
//! Stages that cannot proceed without caller input yield a
//! [`PendingContext`] instead of a value.

mod explainer;
mod grounder;
mod parser;
mod pipeline;
mod reasoner;
mod rules;

pub use explainer::Explainer;
pub use grounder::{
    EntityKind, GroundedEntity, GroundedPredicate, GroundedSymbols, PredicateKind, SymbolGrounder,
};
pub use parser::{Intent, Modifiers, ParsedIntent, Relation, SemanticParser};
pub use pipeline::{Pipeline, Stage, StageInput, Step};
pub use reasoner::{
    Conclusion, InferenceMode, InferenceResult, ProofStep, ProofStepKind, Reasoner,
};
pub use rules::{forward_chain, ChainResult, Derivation, DerivationKind, Fact, Origin, RuleDef, BUILTIN_RULES};

use crate::config::{KnowledgeConfig, ReasoningConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Per-session pipeline options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReasoningOptions {
    /// Inference strategy
    pub mode: InferenceMode,

    /// Entities grounded below this confidence trigger a clarification request
    #[validate(range(min = 0.0, max = 1.0))]
    pub ambiguity_threshold: f64,

    /// Hybrid mode returns the rule-based result when it is more confident than this
    #[validate(range(min = 0.0, max = 1.0))]
    pub hybrid_threshold: f64,

    /// Forward-chaining iteration limit
    #[validate(range(min = 1, max = 32))]
    pub max_depth: usize,

    /// Skip the grounding LLM call
    pub fast_grounding: bool,

    /// Attach knowledge-base matches during grounding
    pub use_knowledge_base: bool,

    /// Matches requested per entity
    #[validate(range(min = 1, max = 50))]
    pub knowledge_limit: usize,

    /// Known facts, e.g. `type(parser, function)`
    pub background_facts: Vec<String>,

    /// Suspend for caller-supplied facts when nothing can be concluded
    pub request_facts_when_empty: bool,
}

impl Default for ReasoningOptions {
    fn default() -> Self {
        Self {
            mode: InferenceMode::Hybrid,
            ambiguity_threshold: 0.5,
            hybrid_threshold: 0.7,
            max_depth: 5,
            fast_grounding: false,
            use_knowledge_base: true,
            knowledge_limit: 3,
            background_facts: Vec::new(),
            request_facts_when_empty: false,
        }
    }
}

impl ReasoningOptions {
    /// Options seeded from service configuration
    pub fn from_config(reasoning: &ReasoningConfig, knowledge: &KnowledgeConfig) -> Self {
        Self {
            ambiguity_threshold: reasoning.ambiguity_threshold,
            hybrid_threshold: reasoning.hybrid_threshold,
            max_depth: reasoning.max_depth,
            knowledge_limit: knowledge.limit,
            ..Self::default()
        }
    }
}

/// Output of a stage that may suspend
#[derive(Debug, Clone)]
pub enum StageOutput<T> {
    Ready(T),
    Yield(PendingContext),
}

impl<T> StageOutput<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            StageOutput::Ready(value) => Some(value),
            StageOutput::Yield(_) => None,
        }
    }
}

/// What a suspended stage needs before it can continue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingContext {
    /// Grounding found entities it could not map confidently
    NeedClarification {
        ambiguous: Vec<String>,
        partial: GroundedSymbols,
        parsed: ParsedIntent,
    },
    /// Inference could not conclude anything from the known facts
    NeedFacts {
        reason: String,
        parsed: ParsedIntent,
        grounded: GroundedSymbols,
    },
}

impl PendingContext {
    pub fn describe(&self) -> String {
        match self {
            PendingContext::NeedClarification { ambiguous, .. } => {
                format!("awaiting clarification for: {}", ambiguous.join(", "))
            }
            PendingContext::NeedFacts { reason, .. } => format!("awaiting facts: {}", reason),
        }
    }
}

/// Caller-supplied input for a suspended session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeInput {
    /// Entity text to formal id (`entity:bank_account`) or replacement text
    pub clarifications: BTreeMap<String, String>,

    /// Additional facts, e.g. `property(parser, tested)`
    pub facts: Vec<String>,
}

/// Lowercase snake_case form used in formal ids
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;

    for c in text.trim().chars() {
        if c.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }

    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("function"), "function");
        assert_eq!(slugify("  Bank Account "), "bank_account");
        assert_eq!(slugify("thread-safe / async"), "thread_safe_async");
        assert_eq!(slugify("?!"), "");
    }

    #[test]
    fn test_default_options_validate() {
        assert!(ReasoningOptions::default().validate().is_ok());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let options = ReasoningOptions {
            ambiguity_threshold: 1.5,
            ..ReasoningOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_resume_input_defaults() {
        let input: ResumeInput = serde_json::from_str(r#"{"facts": ["type(x, function)"]}"#).unwrap();
        assert!(input.clarifications.is_empty());
        assert_eq!(input.facts.len(), 1);
    }
}
