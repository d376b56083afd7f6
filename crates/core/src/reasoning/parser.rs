//! Semantic Parser - Turns a question into a structured intent
//!
//! Provides:
//! - Model selection by a coding-keyword heuristic
//! - LLM-based intent, entity and relation extraction
//! - A deterministic heuristic parser used whenever the LLM path fails

use super::ReasoningOptions;
use crate::llm::{decode_json_object, null_as_default, GenerateRequest, LlmClient, ModelProfile};
use crate::metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Maximum entities kept by the heuristic parser
const HEURISTIC_ENTITY_LIMIT: usize = 5;

/// What the question asks the engine to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Query,
    Assertion,
    Command,
}

impl Intent {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "assertion" | "statement" | "claim" => Intent::Assertion,
            "command" | "instruction" | "request" => Intent::Command,
            _ => Intent::Query,
        }
    }
}

/// Subject-predicate-object triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Modifiers {
    #[serde(deserialize_with = "null_as_default")]
    pub negated: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub uncertain: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub conditional: bool,
}

/// Structured form of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub intent: Intent,
    pub predicates: BTreeSet<String>,
    pub entities: BTreeSet<String>,
    pub relations: Vec<Relation>,
    pub modifiers: Modifiers,
    pub raw_query: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawParse {
    intent: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    predicates: Vec<Option<String>>,
    #[serde(deserialize_with = "null_as_default")]
    entities: Vec<Option<String>>,
    #[serde(deserialize_with = "null_as_default")]
    relations: Vec<Value>,
    #[serde(deserialize_with = "null_as_default")]
    modifiers: Modifiers,
}

const CODE_KEYWORDS: &[&str] = &[
    "function", "bug", "compile", "compiler", "code", "method", "class", "variable",
    "syntax", "debug", "exception", "stack trace", "api", "library", "refactor", "runtime",
];

const INTERROGATIVES: &[&str] = &[
    "what", "who", "whom", "whose", "where", "when", "why", "how", "which", "is", "are",
    "was", "were", "do", "does", "did", "can", "could", "should", "would", "will", "may",
    "might", "has", "have",
];

const IMPERATIVES: &[&str] = &[
    "find", "show", "list", "explain", "describe", "get", "give", "tell", "create",
    "delete", "remove", "run", "compare", "generate", "search", "fetch", "summarize", "check",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at",
    "to", "for", "of", "with", "by", "from", "and", "or", "but", "not", "this", "that",
    "these", "those", "it", "its", "as", "do", "does", "did", "has", "have", "had", "can",
    "could", "will", "would", "should", "may", "might", "what", "which", "who", "whom",
    "when", "where", "why", "how", "there", "their", "they", "them", "then", "than", "into",
    "about", "some", "any", "also", "just", "very", "your", "you", "our", "we",
];

const NEGATION_MARKERS: &[&str] = &[" not ", "n't", " no ", " never ", " none ", " nothing ", " cannot "];
const UNCERTAINTY_MARKERS: &[&str] = &[" maybe ", " might ", " possibly ", " perhaps ", " probably ", " likely ", " unsure ", " not sure "];
const CONDITIONAL_MARKERS: &[&str] = &[" if ", " unless ", " assuming ", " provided that ", " in case "];

/// Parser for natural-language questions
pub struct SemanticParser {
    llm: Arc<dyn LlmClient>,
}

impl SemanticParser {
    /// Create a new parser
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Parse a query into a structured intent.
    ///
    /// Never fails: LLM errors and unusable responses fall back to
    /// [`SemanticParser::heuristic_parse`].
    pub async fn parse(&self, query: &str, _options: &ReasoningOptions) -> ParsedIntent {
        let profile = Self::select_profile(query);
        let request = GenerateRequest::new(profile, Self::build_prompt(query))
            .with_temperature(0.1)
            .with_max_tokens(512);

        let raw = match self.llm.generate(&request).await {
            Ok(text) => decode_json_object::<RawParse>(&text),
            Err(e) => Err(e),
        };

        match raw {
            Ok(raw) => {
                tracing::debug!(profile = ?profile, "Query parsed by LLM");
                Self::normalize(raw, query)
            }
            Err(e) => {
                tracing::warn!(error = %e, "LLM parse failed, using heuristic parser");
                metrics::record_fallback("parsing");
                Self::heuristic_parse(query)
            }
        }
    }

    /// Route code-flavoured questions to the code model
    pub fn select_profile(query: &str) -> ModelProfile {
        let lower = query.to_lowercase();
        if CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            ModelProfile::Code
        } else {
            ModelProfile::General
        }
    }

    /// Deterministic keyword-based parse
    pub fn heuristic_parse(query: &str) -> ParsedIntent {
        let trimmed = query.trim();
        let lower = trimmed.to_lowercase();
        let first_word = lower
            .split_whitespace()
            .next()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .unwrap_or("");

        let intent = if lower.ends_with('?') || INTERROGATIVES.contains(&first_word) {
            Intent::Query
        } else if IMPERATIVES.contains(&first_word) {
            Intent::Command
        } else {
            Intent::Assertion
        };

        // Length is judged on the raw token so trailing punctuation counts
        let mut entities = BTreeSet::new();
        let mut seen = Vec::new();
        for token in lower.split_whitespace() {
            if token.chars().count() <= 3 {
                continue;
            }
            let word = token.trim_matches(|c: char| !c.is_alphanumeric());
            if word.is_empty() || STOP_WORDS.contains(&word) || seen.iter().any(|w| w == word) {
                continue;
            }
            seen.push(word.to_string());
            entities.insert(word.to_string());
            if seen.len() == HEURISTIC_ENTITY_LIMIT {
                break;
            }
        }

        let padded = format!(" {} ", lower.replace(|c: char| c.is_ascii_punctuation() && c != '\'', " "));
        let has_any = |markers: &[&str]| markers.iter().any(|m| padded.contains(m));

        ParsedIntent {
            intent,
            predicates: BTreeSet::new(),
            entities,
            relations: Vec::new(),
            modifiers: Modifiers {
                negated: has_any(NEGATION_MARKERS),
                uncertain: has_any(UNCERTAINTY_MARKERS),
                conditional: has_any(CONDITIONAL_MARKERS),
            },
            raw_query: trimmed.to_string(),
        }
    }

    fn build_prompt(query: &str) -> String {
        format!(
            "Analyze the following question and extract its logical structure.\n\
             Respond with a single JSON object and nothing else, using this shape:\n\
             {{\"intent\": \"query\" | \"assertion\" | \"command\",\n \
              \"predicates\": [string], \"entities\": [string],\n \
              \"relations\": [[subject, predicate, object]],\n \
              \"modifiers\": {{\"negated\": bool, \"uncertain\": bool, \"conditional\": bool}}}}\n\n\
             Question: {}\n",
            query
        )
    }

    fn normalize(raw: RawParse, query: &str) -> ParsedIntent {
        let clean = |items: Vec<Option<String>>| -> BTreeSet<String> {
            items
                .into_iter()
                .flatten()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let relations = raw.relations.iter().filter_map(Self::relation_from_value).collect();

        ParsedIntent {
            intent: raw.intent.as_deref().map(Intent::from_label).unwrap_or_default(),
            predicates: clean(raw.predicates),
            entities: clean(raw.entities),
            relations,
            modifiers: raw.modifiers,
            raw_query: query.trim().to_string(),
        }
    }

    /// Accept `[s, p, o]` arrays or `{subject, predicate, object}` objects
    fn relation_from_value(value: &Value) -> Option<Relation> {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).map(|s| s.trim().to_lowercase());

        let (subject, predicate, object) = match value {
            Value::Array(items) if items.len() == 3 => {
                (text(items.first()), text(items.get(1)), text(items.get(2)))
            }
            Value::Object(map) => (
                text(map.get("subject")),
                text(map.get("predicate")),
                text(map.get("object")),
            ),
            _ => return None,
        };

        Some(Relation {
            subject: subject?,
            predicate: predicate?,
            object: object.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::OfflineLlm;
    use crate::testing::ScriptedLlm;

    fn offline_parser() -> SemanticParser {
        SemanticParser::new(Arc::new(OfflineLlm))
    }

    #[tokio::test]
    async fn test_heuristic_parse_with_llm_down() {
        let parsed = offline_parser()
            .parse("Is this function safe to use?", &ReasoningOptions::default())
            .await;

        assert_eq!(parsed.intent, Intent::Query);
        for expected in ["function", "safe", "use"] {
            assert!(parsed.entities.contains(expected), "missing {expected}");
        }
        assert!(!parsed.modifiers.negated);
        assert_eq!(parsed.raw_query, "Is this function safe to use?");
    }

    #[test]
    fn test_command_and_assertion_intents() {
        assert_eq!(
            SemanticParser::heuristic_parse("List every deprecated endpoint").intent,
            Intent::Command
        );
        assert_eq!(
            SemanticParser::heuristic_parse("The parser handles unicode input").intent,
            Intent::Assertion
        );
        assert_eq!(
            SemanticParser::heuristic_parse("Explain the cache layer?").intent,
            Intent::Query
        );
    }

    #[test]
    fn test_entity_cap_and_stopwords() {
        let parsed = SemanticParser::heuristic_parse(
            "which parser module tokenizer lexer grammar emitter optimizer handles this",
        );
        assert_eq!(parsed.entities.len(), 5);
        assert!(!parsed.entities.contains("which"));
        assert!(!parsed.entities.contains("optimizer"));
    }

    #[test]
    fn test_modifiers() {
        let parsed = SemanticParser::heuristic_parse("If the cache is cold, maybe the query doesn't return?");
        assert!(parsed.modifiers.negated);
        assert!(parsed.modifiers.uncertain);
        assert!(parsed.modifiers.conditional);
    }

    #[test]
    fn test_profile_selection() {
        assert_eq!(SemanticParser::select_profile("Why does this compile slowly?"), ModelProfile::Code);
        assert_eq!(SemanticParser::select_profile("Who wrote the onboarding guide?"), ModelProfile::General);
    }

    #[tokio::test]
    async fn test_llm_response_wrapped_in_prose() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            "Here you go:\n{\"intent\": \"assertion\", \"entities\": [\"Parser\", \" \"], \
             \"predicates\": [\"fast\"], \"relations\": [[\"parser\", \"is\", \"fast\"], \
             {\"subject\": \"lexer\", \"predicate\": \"feeds\", \"object\": \"parser\"}, 42]}"
                .to_string(),
        )]));
        let parser = SemanticParser::new(llm.clone());

        let parsed = parser.parse("The parser is fast", &ReasoningOptions::default()).await;

        assert_eq!(parsed.intent, Intent::Assertion);
        assert_eq!(parsed.entities, BTreeSet::from(["parser".to_string()]));
        assert_eq!(parsed.predicates, BTreeSet::from(["fast".to_string()]));
        assert_eq!(parsed.relations.len(), 2);
        assert_eq!(parsed.relations[1].subject, "lexer");
        assert_eq!(parsed.modifiers, Modifiers::default());
        assert_eq!(llm.requests()[0].profile, ModelProfile::General);
    }

    #[tokio::test]
    async fn test_prose_without_json_falls_back() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("I am not sure what you mean.".to_string())]));
        let parser = SemanticParser::new(llm);

        let parsed = parser.parse("Show broken links", &ReasoningOptions::default()).await;

        assert_eq!(parsed.intent, Intent::Command);
        assert!(parsed.entities.contains("broken"));
        assert!(parsed.entities.contains("links"));
    }

    #[tokio::test]
    async fn test_missing_fields_default() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok("{}".to_string())]));
        let parser = SemanticParser::new(llm);

        let parsed = parser.parse("anything", &ReasoningOptions::default()).await;

        assert_eq!(parsed.intent, Intent::Query);
        assert!(parsed.entities.is_empty());
        assert!(parsed.relations.is_empty());
    }

    #[tokio::test]
    async fn test_null_fields_keep_llm_answer() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{
            "intent": "assertion",
            "entities": null,
            "predicates": ["Fast", null],
            "relations": null,
            "modifiers": {"negated": null, "uncertain": true}
        }"#
        .to_string())]));
        let parser = SemanticParser::new(llm);

        let parsed = parser.parse("the parser is fast", &ReasoningOptions::default()).await;

        assert_eq!(parsed.intent, Intent::Assertion);
        assert!(parsed.predicates.contains("fast"));
        assert_eq!(parsed.predicates.len(), 1);
        assert!(parsed.entities.is_empty());
        assert!(parsed.relations.is_empty());
        assert!(!parsed.modifiers.negated);
        assert!(parsed.modifiers.uncertain);
    }
}
