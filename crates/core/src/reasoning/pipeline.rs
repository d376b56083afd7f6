//! Pipeline - Runs one stage at a time
//!
//! Each call to [`Pipeline::step`] consumes the input of one stage and
//! reports what happens next: another stage, a suspension, the final
//! explanation, or a failure. The session layer records every step.

use super::{
    Explainer, GroundedSymbols, InferenceResult, ParsedIntent, PendingContext, Reasoner,
    ReasoningOptions, SemanticParser, StageOutput, SymbolGrounder,
};
use crate::knowledge::KnowledgeBase;
use crate::llm::LlmClient;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsing,
    Grounding,
    Reasoning,
    Explaining,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::Grounding => "grounding",
            Stage::Reasoning => "reasoning",
            Stage::Explaining => "explaining",
        }
    }
}

/// Everything a stage needs to run
#[derive(Debug, Clone)]
pub enum StageInput {
    Parse {
        query: String,
    },
    Ground {
        parsed: ParsedIntent,
    },
    /// Re-check a suspended grounding after caller clarifications
    Clarify {
        parsed: ParsedIntent,
        partial: GroundedSymbols,
        clarifications: BTreeMap<String, String>,
    },
    Reason {
        parsed: ParsedIntent,
        grounded: GroundedSymbols,
    },
    Explain {
        parsed: ParsedIntent,
        grounded: GroundedSymbols,
        inference: InferenceResult,
    },
}

impl StageInput {
    pub fn stage(&self) -> Stage {
        match self {
            StageInput::Parse { .. } => Stage::Parsing,
            StageInput::Ground { .. } | StageInput::Clarify { .. } => Stage::Grounding,
            StageInput::Reason { .. } => Stage::Reasoning,
            StageInput::Explain { .. } => Stage::Explaining,
        }
    }
}

/// Outcome of one stage
#[derive(Debug, Clone)]
pub enum Step {
    Continue(StageInput),
    Suspended(PendingContext),
    Done(String),
    Failed(String),
}

/// The four reasoning stages wired to their collaborators
pub struct Pipeline {
    parser: SemanticParser,
    grounder: SymbolGrounder,
    reasoner: Reasoner,
    explainer: Explainer,
}

impl Pipeline {
    pub fn new(llm: Arc<dyn LlmClient>, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        Self {
            parser: SemanticParser::new(llm.clone()),
            grounder: SymbolGrounder::new(llm.clone(), knowledge),
            reasoner: Reasoner::new(llm),
            explainer: Explainer::new(),
        }
    }

    /// Run the stage `input` belongs to
    pub async fn step(&self, input: StageInput, options: &ReasoningOptions) -> Step {
        let stage = input.stage();
        let start = Instant::now();

        let step = match input {
            StageInput::Parse { query } => {
                let parsed = self.parser.parse(&query, options).await;
                Step::Continue(StageInput::Ground { parsed })
            }
            StageInput::Ground { parsed } => match self.grounder.ground(&parsed, options).await {
                Ok(output) => Self::after_grounding(parsed, output),
                Err(e) => Step::Failed(e.to_string()),
            },
            StageInput::Clarify {
                parsed,
                partial,
                clarifications,
            } => {
                let grounded = SymbolGrounder::apply_clarifications(partial, &clarifications);
                let output = SymbolGrounder::check_ambiguity(&parsed, grounded, options.ambiguity_threshold);
                Self::after_grounding(parsed, output)
            }
            StageInput::Reason { parsed, grounded } => {
                match self.reasoner.infer(&parsed, &grounded, options).await {
                    StageOutput::Ready(inference) => Step::Continue(StageInput::Explain {
                        parsed,
                        grounded,
                        inference,
                    }),
                    StageOutput::Yield(pending) => Step::Suspended(pending),
                }
            }
            StageInput::Explain {
                parsed,
                grounded,
                inference,
            } => Step::Done(self.explainer.explain(&parsed, &grounded, &inference)),
        };

        metrics::record_stage(stage.as_str(), start.elapsed().as_secs_f64());
        step
    }

    fn after_grounding(parsed: ParsedIntent, output: StageOutput<GroundedSymbols>) -> Step {
        match output {
            StageOutput::Ready(grounded) => Step::Continue(StageInput::Reason { parsed, grounded }),
            StageOutput::Yield(pending) => Step::Suspended(pending),
        }
    }
}
