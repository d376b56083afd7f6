//! Symbol Grounder - Maps surface mentions to formal symbols
//!
//! Provides:
//! - LLM-based grounding of entities and predicates
//! - Knowledge-base augmentation with the best similarity match
//! - Ambiguity detection (suspends for caller clarification)
//! - A deterministic heuristic grounder used as fallback and by `ground_fast`

use super::{slugify, ParsedIntent, PendingContext, ReasoningOptions, StageOutput};
use crate::errors::Result;
use crate::knowledge::KnowledgeBase;
use crate::llm::{decode_json_object, null_as_default, GenerateRequest, LlmClient, ModelProfile};
use crate::metrics;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Confidence assigned by the heuristic grounder
const HEURISTIC_ENTITY_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Concept,
    Instance,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    #[default]
    Property,
    Relation,
    Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundedEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_match: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb_confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundedPredicate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PredicateKind,
    pub arity: u32,
}

/// Formal bindings for a parsed intent; keys are always parsed surface texts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundedSymbols {
    pub entities: BTreeMap<String, GroundedEntity>,
    pub predicates: BTreeMap<String, GroundedPredicate>,
    pub ungrounded: Vec<String>,
}

impl GroundedSymbols {
    /// Entity texts grounded below `threshold`, sorted
    pub fn ambiguous(&self, threshold: f64) -> Vec<String> {
        self.entities
            .iter()
            .filter(|(_, e)| e.confidence < threshold)
            .map(|(text, _)| text.clone())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGrounding {
    #[serde(deserialize_with = "null_as_default")]
    entities: HashMap<String, Option<RawEntity>>,
    #[serde(deserialize_with = "null_as_default")]
    predicates: HashMap<String, Option<RawPredicate>>,
    #[serde(deserialize_with = "null_as_default")]
    ungrounded: Vec<Option<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEntity {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    confidence: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPredicate {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    arity: Option<u32>,
}

/// Grounder for parsed intents
pub struct SymbolGrounder {
    llm: Arc<dyn LlmClient>,
    knowledge: Arc<dyn KnowledgeBase>,
}

impl SymbolGrounder {
    /// Create a new grounder
    pub fn new(llm: Arc<dyn LlmClient>, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        Self { llm, knowledge }
    }

    /// Ground a parsed intent, suspending when any entity is ambiguous
    pub async fn ground(
        &self,
        parsed: &ParsedIntent,
        options: &ReasoningOptions,
    ) -> Result<StageOutput<GroundedSymbols>> {
        if options.fast_grounding {
            let grounded = self.ground_fast(parsed, options).await;
            return Ok(Self::check_ambiguity(parsed, grounded, options.ambiguity_threshold));
        }

        let grounded = match self.ground_with_llm(parsed).await {
            Ok(grounded) => grounded,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "LLM grounding failed, using heuristic grounder");
                metrics::record_fallback("grounding");
                Self::heuristic_ground(parsed)
            }
            Err(e) => return Err(e),
        };

        let grounded = self.augment(grounded, options).await;
        Ok(Self::check_ambiguity(parsed, grounded, options.ambiguity_threshold))
    }

    /// Heuristic grounding plus knowledge lookup, without any LLM call
    pub async fn ground_fast(&self, parsed: &ParsedIntent, options: &ReasoningOptions) -> GroundedSymbols {
        self.augment(Self::heuristic_ground(parsed), options).await
    }

    /// Deterministic slug-based grounding
    pub fn heuristic_ground(parsed: &ParsedIntent) -> GroundedSymbols {
        let entities = parsed
            .entities
            .iter()
            .map(|text| (text.clone(), Self::default_entity(text)))
            .collect();

        let predicates = parsed
            .predicates
            .iter()
            .map(|text| (text.clone(), Self::default_predicate(text)))
            .collect();

        GroundedSymbols {
            entities,
            predicates,
            ungrounded: Vec::new(),
        }
    }

    /// Fold caller clarifications into a partial grounding.
    ///
    /// A value containing `:` is taken as the formal id; anything else is
    /// slugified into `entity:<slug>`. Clarified entities become fully
    /// confident. Texts not present in the grounding are ignored.
    pub fn apply_clarifications(
        mut partial: GroundedSymbols,
        clarifications: &BTreeMap<String, String>,
    ) -> GroundedSymbols {
        for (text, value) in clarifications {
            let key = text.trim().to_lowercase();
            let Some(entity) = partial.entities.get_mut(&key) else {
                tracing::debug!(entity = %key, "Clarification for unknown entity ignored");
                continue;
            };

            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            entity.id = if value.contains(':') {
                value.to_string()
            } else {
                format!("entity:{}", slugify(value))
            };
            entity.confidence = 1.0;
        }

        partial
    }

    /// Yield a clarification request if any entity is below `threshold`
    pub fn check_ambiguity(
        parsed: &ParsedIntent,
        grounded: GroundedSymbols,
        threshold: f64,
    ) -> StageOutput<GroundedSymbols> {
        let ambiguous = grounded.ambiguous(threshold);
        if ambiguous.is_empty() {
            return StageOutput::Ready(grounded);
        }

        tracing::info!(ambiguous = ?ambiguous, threshold, "Grounding needs clarification");
        StageOutput::Yield(PendingContext::NeedClarification {
            ambiguous,
            partial: grounded,
            parsed: parsed.clone(),
        })
    }

    async fn ground_with_llm(&self, parsed: &ParsedIntent) -> Result<GroundedSymbols> {
        if parsed.entities.is_empty() && parsed.predicates.is_empty() {
            return Ok(GroundedSymbols::default());
        }

        let request = GenerateRequest::new(ModelProfile::General, Self::build_prompt(parsed))
            .with_temperature(0.1)
            .with_max_tokens(768);

        let text = self.llm.generate(&request).await?;
        let raw: RawGrounding = decode_json_object(&text)?;
        Ok(Self::normalize(raw, parsed))
    }

    fn build_prompt(parsed: &ParsedIntent) -> String {
        let entities: Vec<&String> = parsed.entities.iter().collect();
        let predicates: Vec<&String> = parsed.predicates.iter().collect();

        format!(
            "Map each mention below to a formal symbol.\n\
             Entities get an id like \"entity:snake_case\", a type (concept, instance or unknown) \
             and a confidence between 0 and 1.\n\
             Predicates get an id like \"pred:snake_case\", a type (property, relation or action) \
             and an arity.\n\
             List mentions you cannot map under \"ungrounded\".\n\
             Respond with a single JSON object:\n\
             {{\"entities\": {{\"<mention>\": {{\"id\": string, \"type\": string, \"confidence\": number}}}},\n \
              \"predicates\": {{\"<mention>\": {{\"id\": string, \"type\": string, \"arity\": number}}}},\n \
              \"ungrounded\": [string]}}\n\n\
             Question: {}\nEntities: {:?}\nPredicates: {:?}\n",
            parsed.raw_query, entities, predicates
        )
    }

    fn normalize(raw: RawGrounding, parsed: &ParsedIntent) -> GroundedSymbols {
        let mut entities = BTreeMap::new();
        for (text, raw_entity) in raw.entities {
            let raw_entity = raw_entity.unwrap_or_default();
            let key = text.trim().to_lowercase();
            if !parsed.entities.contains(&key) {
                continue;
            }
            let fallback = Self::default_entity(&key);
            entities.insert(
                key,
                GroundedEntity {
                    id: non_empty(raw_entity.id).unwrap_or(fallback.id),
                    kind: raw_entity.kind.as_deref().map(entity_kind).unwrap_or_default(),
                    confidence: raw_entity
                        .confidence
                        .filter(|c| c.is_finite())
                        .unwrap_or(HEURISTIC_ENTITY_CONFIDENCE)
                        .clamp(0.0, 1.0),
                    kb_match: None,
                    kb_confidence: None,
                },
            );
        }

        let mut predicates = BTreeMap::new();
        for (text, raw_predicate) in raw.predicates {
            let raw_predicate = raw_predicate.unwrap_or_default();
            let key = text.trim().to_lowercase();
            if !parsed.predicates.contains(&key) {
                continue;
            }
            let kind = raw_predicate.kind.as_deref().map(predicate_kind).unwrap_or_default();
            let default_arity = if kind == PredicateKind::Relation { 2 } else { 1 };
            predicates.insert(
                key.clone(),
                GroundedPredicate {
                    id: non_empty(raw_predicate.id).unwrap_or_else(|| Self::default_predicate(&key).id),
                    kind,
                    arity: raw_predicate.arity.unwrap_or(default_arity),
                },
            );
        }

        let mut ungrounded: BTreeSet<String> = raw
            .ungrounded
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| parsed.entities.contains(s) || parsed.predicates.contains(s))
            .collect();

        for text in parsed.entities.iter().chain(parsed.predicates.iter()) {
            if !entities.contains_key(text) && !predicates.contains_key(text) {
                ungrounded.insert(text.clone());
            }
        }

        ungrounded.retain(|s| !entities.contains_key(s) && !predicates.contains_key(s));

        GroundedSymbols {
            entities,
            predicates,
            ungrounded: ungrounded.into_iter().collect(),
        }
    }

    /// Attach the best knowledge-base match to every entity
    async fn augment(&self, mut grounded: GroundedSymbols, options: &ReasoningOptions) -> GroundedSymbols {
        if !options.use_knowledge_base || grounded.entities.is_empty() {
            return grounded;
        }

        let lookups = grounded.entities.keys().map(|text| {
            let knowledge = self.knowledge.clone();
            let text = text.clone();
            async move {
                let result = knowledge.search(&text, options.knowledge_limit).await;
                (text, result)
            }
        });

        for (text, result) in join_all(lookups).await {
            let best = match result {
                Ok(matches) => matches.into_iter().max_by(|a, b| a.score.total_cmp(&b.score)),
                Err(e) => {
                    tracing::debug!(entity = %text, error = %e, "Knowledge lookup failed, treating as no match");
                    None
                }
            };

            if let (Some(best), Some(entity)) = (best, grounded.entities.get_mut(&text)) {
                entity.kb_match = Some(best.id);
                entity.kb_confidence = Some(best.score.clamp(0.0, 1.0));
            }
        }

        grounded
    }

    fn default_entity(text: &str) -> GroundedEntity {
        GroundedEntity {
            id: format!("entity:{}", slugify(text)),
            kind: EntityKind::Unknown,
            confidence: HEURISTIC_ENTITY_CONFIDENCE,
            kb_match: None,
            kb_confidence: None,
        }
    }

    fn default_predicate(text: &str) -> GroundedPredicate {
        GroundedPredicate {
            id: format!("pred:{}", slugify(text)),
            kind: PredicateKind::Property,
            arity: 1,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn entity_kind(label: &str) -> EntityKind {
    match label.trim().to_lowercase().as_str() {
        "concept" => EntityKind::Concept,
        "instance" => EntityKind::Instance,
        _ => EntityKind::Unknown,
    }
}

fn predicate_kind(label: &str) -> PredicateKind {
    match label.trim().to_lowercase().as_str() {
        "relation" => PredicateKind::Relation,
        "action" => PredicateKind::Action,
        _ => PredicateKind::Property,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::knowledge::{InMemoryKnowledgeBase, KnowledgeMatch};
    use crate::llm::OfflineLlm;
    use crate::reasoning::{Intent, Modifiers};
    use crate::testing::ScriptedLlm;
    use async_trait::async_trait;

    struct BrokenKnowledgeBase;

    #[async_trait]
    impl KnowledgeBase for BrokenKnowledgeBase {
        async fn search(&self, _text: &str, _limit: usize) -> Result<Vec<KnowledgeMatch>> {
            Err(AppError::KnowledgeLookup {
                message: "index offline".to_string(),
            })
        }
    }

    fn parsed(entities: &[&str], predicates: &[&str]) -> ParsedIntent {
        ParsedIntent {
            intent: Intent::Query,
            predicates: predicates.iter().map(|s| s.to_string()).collect(),
            entities: entities.iter().map(|s| s.to_string()).collect(),
            relations: Vec::new(),
            modifiers: Modifiers::default(),
            raw_query: "test".to_string(),
        }
    }

    fn offline_grounder() -> SymbolGrounder {
        SymbolGrounder::new(Arc::new(OfflineLlm), Arc::new(InMemoryKnowledgeBase::new()))
    }

    #[tokio::test]
    async fn test_heuristic_grounding_with_llm_down() {
        let grounded = offline_grounder()
            .ground(&parsed(&["function"], &["safe"]), &ReasoningOptions::default())
            .await
            .unwrap()
            .ready()
            .unwrap();

        let entity = &grounded.entities["function"];
        assert_eq!(entity.id, "entity:function");
        assert_eq!(entity.kind, EntityKind::Unknown);
        assert_eq!(entity.confidence, 0.7);

        let predicate = &grounded.predicates["safe"];
        assert_eq!(predicate.id, "pred:safe");
        assert_eq!(predicate.kind, PredicateKind::Property);
        assert_eq!(predicate.arity, 1);
    }

    #[tokio::test]
    async fn test_llm_grounding_drops_invented_keys_and_clamps() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"Result:
            {"entities": {
                "Function": {"id": "entity:fn", "type": "concept", "confidence": 1.7},
                "kernel": {"id": "entity:kernel", "type": "concept", "confidence": 0.9}
             },
             "predicates": {"safe": {"type": "relation"}},
             "ungrounded": ["kernel", "use"]}"#
            .to_string())]));
        let grounder = SymbolGrounder::new(llm, Arc::new(InMemoryKnowledgeBase::new()));

        let grounded = grounder
            .ground(&parsed(&["function", "use"], &["safe"]), &ReasoningOptions::default())
            .await
            .unwrap()
            .ready()
            .unwrap();

        assert_eq!(grounded.entities.len(), 1);
        assert_eq!(grounded.entities["function"].confidence, 1.0);
        assert_eq!(grounded.entities["function"].kind, EntityKind::Concept);
        assert_eq!(grounded.predicates["safe"].id, "pred:safe");
        assert_eq!(grounded.predicates["safe"].arity, 2);
        assert_eq!(grounded.ungrounded, vec!["use".to_string()]);
    }

    #[tokio::test]
    async fn test_low_confidence_yields_clarification() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{"entities": {
                "bank": {"id": "entity:bank", "type": "concept", "confidence": 0.3},
                "account": {"id": "entity:account", "type": "concept", "confidence": 0.9}
            }}"#
        .to_string())]));
        let grounder = SymbolGrounder::new(llm, Arc::new(InMemoryKnowledgeBase::new()));
        let input = parsed(&["bank", "account"], &[]);

        let output = grounder.ground(&input, &ReasoningOptions::default()).await.unwrap();

        match output {
            StageOutput::Yield(PendingContext::NeedClarification { ambiguous, partial, parsed }) => {
                assert_eq!(ambiguous, vec!["bank".to_string()]);
                assert_eq!(partial.entities.len(), 2);
                assert_eq!(parsed, input);
            }
            other => panic!("expected clarification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_knowledge_match_attached_without_overriding() {
        let kb = Arc::new(InMemoryKnowledgeBase::new());
        kb.insert("doc:functions", "function reference").await;
        let grounder = SymbolGrounder::new(Arc::new(OfflineLlm), kb);

        let grounded = grounder
            .ground_fast(&parsed(&["function"], &[]), &ReasoningOptions::default())
            .await;

        let entity = &grounded.entities["function"];
        assert_eq!(entity.id, "entity:function");
        assert_eq!(entity.confidence, 0.7);
        assert_eq!(entity.kb_match.as_deref(), Some("doc:functions"));
        assert_eq!(entity.kb_confidence, Some(1.0));
    }

    #[tokio::test]
    async fn test_knowledge_failure_is_no_match() {
        let grounder = SymbolGrounder::new(Arc::new(OfflineLlm), Arc::new(BrokenKnowledgeBase));

        let grounded = grounder
            .ground(&parsed(&["function"], &[]), &ReasoningOptions::default())
            .await
            .unwrap()
            .ready()
            .unwrap();

        assert!(grounded.entities["function"].kb_match.is_none());
    }

    #[tokio::test]
    async fn test_null_fields_keep_llm_grounding() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{
            "entities": {"function": null, "cache": {"id": null, "type": "concept", "confidence": 0.9}},
            "predicates": null,
            "ungrounded": null
        }"#
        .to_string())]));
        let grounder = SymbolGrounder::new(llm, Arc::new(InMemoryKnowledgeBase::new()));

        let grounded = grounder
            .ground(&parsed(&["function", "cache"], &["safe"]), &ReasoningOptions::default())
            .await
            .unwrap()
            .ready()
            .unwrap();

        assert_eq!(grounded.entities["function"].id, "entity:function");
        assert_eq!(grounded.entities["function"].confidence, 0.7);
        assert_eq!(grounded.entities["cache"].id, "entity:cache");
        assert_eq!(grounded.entities["cache"].kind, EntityKind::Concept);
        assert_eq!(grounded.entities["cache"].confidence, 0.9);
        assert!(grounded.predicates.is_empty());
        assert_eq!(grounded.ungrounded, vec!["safe".to_string()]);
    }

    #[tokio::test]
    async fn test_fast_grounding_skips_llm() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let grounder = SymbolGrounder::new(llm.clone(), Arc::new(InMemoryKnowledgeBase::new()));
        let options = ReasoningOptions {
            fast_grounding: true,
            ..ReasoningOptions::default()
        };

        let grounded = grounder
            .ground(&parsed(&["scheduler"], &["blocking"]), &options)
            .await
            .unwrap()
            .ready()
            .unwrap();

        assert!(llm.requests().is_empty());
        assert_eq!(grounded.entities["scheduler"].id, "entity:scheduler");
        assert_eq!(grounded.predicates["blocking"].id, "pred:blocking");
    }

    #[tokio::test]
    async fn test_ground_fast_is_idempotent() {
        let grounder = offline_grounder();
        let input = parsed(&["Thread Pool", "scheduler"], &["is blocking"]);
        let options = ReasoningOptions::default();

        let first = grounder.ground_fast(&input, &options).await;
        let second = grounder.ground_fast(&input, &options).await;

        assert_eq!(first, second);
        assert_eq!(first.entities["Thread Pool"].id, "entity:thread_pool");
        assert_eq!(first.predicates["is blocking"].id, "pred:is_blocking");
    }

    #[tokio::test]
    async fn test_keys_are_subset_of_parse_and_confidences_in_range() {
        let grounder = offline_grounder();
        for entities in [vec![], vec!["a"], vec!["cache", "eviction", "policy"]] {
            let input = parsed(&entities, &["stale"]);
            let grounded = grounder
                .ground(&input, &ReasoningOptions::default())
                .await
                .unwrap()
                .ready()
                .unwrap();

            for (text, entity) in &grounded.entities {
                assert!(input.entities.contains(text));
                assert!((0.0..=1.0).contains(&entity.confidence));
            }
            for text in grounded.predicates.keys() {
                assert!(input.predicates.contains(text));
            }
        }
    }

    #[test]
    fn test_apply_clarifications() {
        let partial = SymbolGrounder::heuristic_ground(&parsed(&["bank", "river"], &[]));
        let clarifications = BTreeMap::from([
            ("bank".to_string(), "entity:financial_institution".to_string()),
            ("River".to_string(), "Rhine River".to_string()),
            ("ocean".to_string(), "entity:ocean".to_string()),
        ]);

        let folded = SymbolGrounder::apply_clarifications(partial, &clarifications);

        assert_eq!(folded.entities["bank"].id, "entity:financial_institution");
        assert_eq!(folded.entities["bank"].confidence, 1.0);
        assert_eq!(folded.entities["river"].id, "entity:rhine_river");
        assert!(!folded.entities.contains_key("ocean"));
    }
}
