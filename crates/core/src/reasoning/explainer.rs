//! Explainer - Renders an inference result as plain text

use super::{GroundedSymbols, InferenceMode, InferenceResult, Intent, ParsedIntent};

/// Conclusions listed in an explanation
const MAX_LISTED_CONCLUSIONS: usize = 5;

/// Deterministic template-based explainer
#[derive(Debug, Clone, Copy, Default)]
pub struct Explainer;

impl Explainer {
    pub fn new() -> Self {
        Self
    }

    pub fn explain(&self, parsed: &ParsedIntent, grounded: &GroundedSymbols, inference: &InferenceResult) -> String {
        let mut lines = Vec::new();

        let subject = if parsed.entities.is_empty() {
            String::new()
        } else {
            format!(" about {}", join_quoted(parsed.entities.iter().map(String::as_str)))
        };
        let opening = match parsed.intent {
            Intent::Query => "You asked a question",
            Intent::Assertion => "You made a statement",
            Intent::Command => "You gave an instruction",
        };
        lines.push(format!("{}{}.", opening, subject));

        if !grounded.entities.is_empty() {
            let recognized: Vec<String> = grounded
                .entities
                .iter()
                .map(|(text, e)| match &e.kb_match {
                    Some(kb) => format!("{} as {} (indexed as {})", text, e.id, kb),
                    None => format!("{} as {}", text, e.id),
                })
                .collect();
            lines.push(format!("Recognized {}.", recognized.join(", ")));
        }

        if !grounded.ungrounded.is_empty() {
            lines.push(format!(
                "Could not ground {}.",
                join_quoted(grounded.ungrounded.iter().map(String::as_str))
            ));
        }

        if inference.conclusions.is_empty() {
            lines.push("No conclusions could be drawn from the available facts.".to_string());
        } else {
            lines.push(format!(
                "Conclusions ({} reasoning, overall confidence {}):",
                mode_label(inference.mode),
                percent(inference.confidence)
            ));
            for conclusion in inference.conclusions.iter().take(MAX_LISTED_CONCLUSIONS) {
                lines.push(format!("- {} ({})", conclusion.statement, percent(conclusion.confidence)));
            }
            let remaining = inference.conclusions.len().saturating_sub(MAX_LISTED_CONCLUSIONS);
            if remaining > 0 {
                lines.push(format!("- and {} more", remaining));
            }
        }

        if parsed.modifiers.negated {
            lines.push("The question is negated; the conclusions describe the positive case.".to_string());
        }
        if parsed.modifiers.uncertain {
            lines.push("The question was phrased tentatively.".to_string());
        }
        if parsed.modifiers.conditional {
            lines.push("The question is conditional; the conclusions assume its condition holds.".to_string());
        }

        if let Some(notes) = &inference.reasoning_notes {
            lines.push(format!("Notes: {}.", notes.trim_end_matches('.')));
        }

        lines.join("\n")
    }
}

fn mode_label(mode: InferenceMode) -> &'static str {
    match mode {
        InferenceMode::RuleBased => "rule-based",
        InferenceMode::LlmGuided => "LLM-guided",
        InferenceMode::Hybrid => "hybrid",
    }
}

fn percent(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

fn join_quoted<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.map(|s| format!("\"{}\"", s)).collect::<Vec<_>>().join(", ")
}
