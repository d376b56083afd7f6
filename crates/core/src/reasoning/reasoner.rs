//! Reasoner - Draws confidence-scored conclusions from grounded symbols
//!
//! Three strategies:
//! - `RuleBased`: forward chaining over the built-in rules (pure, cannot fail)
//! - `LlmGuided`: a single LLM call, falling back to rules on any failure
//! - `Hybrid`: rules first, the LLM only when rules are not confident enough

use super::rules::{forward_chain, DerivationKind, Fact, Origin, BUILTIN_RULES};
use super::{slugify, GroundedSymbols, ParsedIntent, PendingContext, PredicateKind, ReasoningOptions, StageOutput};
use crate::errors::Result;
use crate::llm::{decode_json_object, null_as_default, GenerateRequest, LlmClient, ModelProfile};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const DIRECT_CONFIDENCE: f64 = 0.9;
const DERIVED_TYPE_CONFIDENCE: f64 = 0.85;
const DERIVED_PROPERTY_CONFIDENCE: f64 = 0.8;

/// Confidence assumed for LLM conclusions that omit one
const DEFAULT_LLM_CONFIDENCE: f64 = 0.5;

/// Relation predicates read as type assertions
const TYPE_PREDICATES: &[&str] = &["is_a", "is_an", "isa", "instance_of", "type_of", "kind_of"];

/// Relation predicates read as property assertions
const PROPERTY_PREDICATES: &[&str] = &["is", "are", "has_property", "has"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    RuleBased,
    LlmGuided,
    #[default]
    Hybrid,
}

impl InferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceMode::RuleBased => "rule_based",
            InferenceMode::LlmGuided => "llm_guided",
            InferenceMode::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conclusion {
    pub statement: String,
    pub confidence: f64,
    pub derivation: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStepKind {
    Fact,
    Rule,
    #[default]
    Inference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofStep {
    pub step: u32,
    pub statement: String,
    #[serde(rename = "type")]
    pub kind: ProofStepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub conclusions: Vec<Conclusion>,
    pub proof_steps: Vec<ProofStep>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_notes: Option<String>,
    pub mode: InferenceMode,
}

/// Arithmetic mean of conclusion confidences, 0 when empty
pub fn mean_confidence(conclusions: &[Conclusion]) -> f64 {
    if conclusions.is_empty() {
        return 0.0;
    }
    conclusions.iter().map(|c| c.confidence).sum::<f64>() / conclusions.len() as f64
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInference {
    #[serde(deserialize_with = "null_as_default")]
    conclusions: Vec<Option<RawConclusion>>,
    #[serde(deserialize_with = "null_as_default")]
    proof_steps: Vec<Option<RawProofStep>>,
    confidence: Option<f64>,
    reasoning_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConclusion {
    #[serde(deserialize_with = "null_as_default")]
    statement: String,
    confidence: Option<f64>,
    #[serde(deserialize_with = "null_as_default")]
    derivation: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProofStep {
    #[serde(deserialize_with = "null_as_default")]
    statement: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Reasoner for grounded symbols
pub struct Reasoner {
    llm: Arc<dyn LlmClient>,
}

impl Reasoner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Run inference in the requested mode.
    ///
    /// Yields `NeedFacts` only when `request_facts_when_empty` is set and no
    /// conclusion could be drawn.
    pub async fn infer(
        &self,
        parsed: &ParsedIntent,
        grounded: &GroundedSymbols,
        options: &ReasoningOptions,
    ) -> StageOutput<InferenceResult> {
        let result = match options.mode {
            InferenceMode::RuleBased => Self::rule_based(parsed, grounded, options),
            InferenceMode::LlmGuided => self.llm_guided(parsed, grounded, options).await,
            InferenceMode::Hybrid => self.hybrid(parsed, grounded, options).await,
        };

        tracing::info!(
            mode = result.mode.as_str(),
            conclusions = result.conclusions.len(),
            confidence = result.confidence,
            "Inference finished"
        );

        if options.request_facts_when_empty && result.conclusions.is_empty() {
            return StageOutput::Yield(PendingContext::NeedFacts {
                reason: "no conclusions could be drawn from the grounded symbols".to_string(),
                parsed: parsed.clone(),
                grounded: grounded.clone(),
            });
        }

        StageOutput::Ready(result)
    }

    /// Forward-chain over facts extracted from the grounding
    pub fn rule_based(
        parsed: &ParsedIntent,
        grounded: &GroundedSymbols,
        options: &ReasoningOptions,
    ) -> InferenceResult {
        let grounding_facts = Self::extract_facts(parsed, grounded);
        let background_facts: BTreeSet<Fact> = options
            .background_facts
            .iter()
            .filter_map(|raw| match raw.parse::<Fact>() {
                Ok(fact) => Some(fact),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unparseable background fact");
                    None
                }
            })
            .collect();

        let chain = forward_chain(
            grounding_facts.iter().chain(background_facts.iter()).cloned(),
            BUILTIN_RULES,
            options.max_depth,
        );

        let mut conclusions = Vec::with_capacity(chain.facts.len());
        let mut given_steps = Vec::new();
        let mut inference_steps = Vec::new();
        let mut rules_used: Vec<&'static str> = Vec::new();

        for (fact, origin) in &chain.facts {
            let statement = fact.to_string();
            match origin {
                Origin::Given => {
                    let source = if grounding_facts.contains(fact) { "grounding" } else { "background" };
                    conclusions.push(Conclusion {
                        statement: statement.clone(),
                        confidence: DIRECT_CONFIDENCE,
                        derivation: vec![source.to_string()],
                    });
                    given_steps.push(statement);
                }
                Origin::Derived { rule, kind, premise, iteration } => {
                    let confidence = match kind {
                        DerivationKind::Type => DERIVED_TYPE_CONFIDENCE,
                        DerivationKind::Property => DERIVED_PROPERTY_CONFIDENCE,
                    };
                    conclusions.push(Conclusion {
                        statement: statement.clone(),
                        confidence,
                        derivation: vec![
                            format!("rule:{}", rule),
                            format!("from:{}", premise),
                            format!("depth:{}", iteration),
                        ],
                    });
                    if !rules_used.contains(rule) {
                        rules_used.push(*rule);
                    }
                    inference_steps.push((*iteration, format!("{} from {} via {}", statement, premise, rule)));
                }
            }
        }

        // Stable sort keeps fact order within equal confidence
        conclusions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        inference_steps.sort_by_key(|(iteration, _)| *iteration);

        let rule_steps = BUILTIN_RULES
            .iter()
            .filter(|r| rules_used.contains(&r.name))
            .map(|r| format!("{}: {}", r.name, r.description));

        let proof_steps = given_steps
            .into_iter()
            .map(|s| (ProofStepKind::Fact, s))
            .chain(rule_steps.map(|s| (ProofStepKind::Rule, s)))
            .chain(inference_steps.into_iter().map(|(_, s)| (ProofStepKind::Inference, s)))
            .enumerate()
            .map(|(i, (kind, statement))| ProofStep {
                step: i as u32 + 1,
                statement,
                kind,
            })
            .collect();

        let derived = chain.derived().count();
        let mut notes = format!(
            "Forward chaining over {} facts derived {} more in {} iteration(s)",
            chain.facts.len() - derived,
            derived,
            chain.iterations
        );
        if !chain.reached_fixed_point {
            notes.push_str("; depth limit reached before a fixed point");
        }

        InferenceResult {
            confidence: mean_confidence(&conclusions),
            conclusions,
            proof_steps,
            reasoning_notes: Some(notes),
            mode: InferenceMode::RuleBased,
        }
    }

    /// Ask the LLM for conclusions, falling back to rules on any failure
    pub async fn llm_guided(
        &self,
        parsed: &ParsedIntent,
        grounded: &GroundedSymbols,
        options: &ReasoningOptions,
    ) -> InferenceResult {
        match self.try_llm(parsed, grounded, options).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "LLM-guided inference failed, using rule-based inference");
                metrics::record_fallback("reasoning");
                Self::rule_based(parsed, grounded, options)
            }
        }
    }

    /// Rules first; the LLM only when the rule-based result is not confident enough
    pub async fn hybrid(
        &self,
        parsed: &ParsedIntent,
        grounded: &GroundedSymbols,
        options: &ReasoningOptions,
    ) -> InferenceResult {
        let rules = Self::rule_based(parsed, grounded, options);
        if rules.confidence > options.hybrid_threshold {
            tracing::debug!(confidence = rules.confidence, "Rule-based result confident, skipping LLM");
            return rules;
        }

        match self.try_llm(parsed, grounded, options).await {
            Ok(llm) => Self::merge(rules, llm),
            Err(e) => {
                tracing::warn!(error = %e, "LLM-guided inference failed, keeping rule-based result");
                metrics::record_fallback("reasoning");
                rules
            }
        }
    }

    /// Union both results, one conclusion per statement (highest confidence wins)
    pub fn merge(rules: InferenceResult, llm: InferenceResult) -> InferenceResult {
        let confidence = rules.confidence.max(llm.confidence);
        let conclusions = dedupe(rules.conclusions.into_iter().chain(llm.conclusions));

        let proof_steps = if llm.proof_steps.is_empty() {
            rules.proof_steps
        } else {
            llm.proof_steps
        };

        InferenceResult {
            conclusions,
            proof_steps,
            confidence,
            reasoning_notes: llm.reasoning_notes.or(rules.reasoning_notes),
            mode: InferenceMode::Hybrid,
        }
    }

    async fn try_llm(
        &self,
        parsed: &ParsedIntent,
        grounded: &GroundedSymbols,
        options: &ReasoningOptions,
    ) -> Result<InferenceResult> {
        let request = GenerateRequest::new(ModelProfile::General, Self::build_prompt(parsed, grounded, options))
            .with_temperature(0.2)
            .with_max_tokens(1024);

        let text = self.llm.generate(&request).await?;
        let raw: RawInference = decode_json_object(&text)?;

        let conclusions = dedupe(raw.conclusions.into_iter().flatten().filter_map(|c| {
            let statement = c.statement.trim().to_string();
            if statement.is_empty() {
                return None;
            }
            Some(Conclusion {
                statement,
                confidence: clamp_confidence(c.confidence.unwrap_or(DEFAULT_LLM_CONFIDENCE)),
                derivation: if c.derivation.is_empty() {
                    vec!["llm".to_string()]
                } else {
                    c.derivation
                },
            })
        }));

        let proof_steps = raw
            .proof_steps
            .into_iter()
            .flatten()
            .map(|s| (s.statement.trim().to_string(), s.kind))
            .filter(|(statement, _)| !statement.is_empty())
            .enumerate()
            .map(|(i, (statement, kind))| ProofStep {
                step: i as u32 + 1,
                statement,
                kind: kind.as_deref().map(step_kind).unwrap_or_default(),
            })
            .collect();

        let confidence = raw
            .confidence
            .map(clamp_confidence)
            .unwrap_or_else(|| mean_confidence(&conclusions));

        Ok(InferenceResult {
            conclusions,
            proof_steps,
            confidence,
            reasoning_notes: raw.reasoning_notes.filter(|n| !n.trim().is_empty()),
            mode: InferenceMode::LlmGuided,
        })
    }

    fn build_prompt(parsed: &ParsedIntent, grounded: &GroundedSymbols, options: &ReasoningOptions) -> String {
        let entities: Vec<String> = grounded
            .entities
            .iter()
            .map(|(text, e)| format!("{} -> {} ({:?}, confidence {:.2})", text, e.id, e.kind, e.confidence))
            .collect();
        let predicates: Vec<String> = grounded
            .predicates
            .iter()
            .map(|(text, p)| format!("{} -> {} ({:?}/{})", text, p.id, p.kind, p.arity))
            .collect();

        format!(
            "You are a careful logical reasoner.\n\
             Intent: {:?}\nQuestion: {}\n\
             Entities:\n{}\nPredicates:\n{}\nKnown facts:\n{}\n\n\
             Draw conclusions and explain each step.\n\
             Respond with a single JSON object:\n\
             {{\"conclusions\": [{{\"statement\": string, \"confidence\": number, \"derivation\": [string]}}],\n \
              \"proof_steps\": [{{\"step\": number, \"statement\": string, \"type\": \"fact\"|\"rule\"|\"inference\"}}],\n \
              \"confidence\": number, \"reasoning_notes\": string}}\n",
            parsed.intent,
            parsed.raw_query,
            bullet_list(&entities),
            bullet_list(&predicates),
            bullet_list(&options.background_facts),
        )
    }

    /// Facts implied directly by the grounding and the parsed relations
    fn extract_facts(parsed: &ParsedIntent, grounded: &GroundedSymbols) -> BTreeSet<Fact> {
        let mut facts = BTreeSet::new();

        for (text, entity) in &grounded.entities {
            facts.insert(Fact::Instance(entity.id.clone()));
            let type_name = slugify(text);
            if !type_name.is_empty() {
                facts.insert(Fact::Type(entity.id.clone(), type_name));
            }
        }

        let entity_id = |text: &str| {
            grounded
                .entities
                .get(text)
                .map(|e| e.id.clone())
                .unwrap_or_else(|| format!("entity:{}", slugify(text)))
        };

        for relation in &parsed.relations {
            let subject = entity_id(&relation.subject);
            let predicate = slugify(&relation.predicate);
            let object = slugify(&relation.object);
            if predicate.is_empty() || object.is_empty() {
                continue;
            }

            if TYPE_PREDICATES.contains(&predicate.as_str()) {
                facts.insert(Fact::Type(subject, object));
            } else if PROPERTY_PREDICATES.contains(&predicate.as_str()) {
                facts.insert(Fact::Property(subject, object));
            } else {
                facts.insert(Fact::Relation(subject, predicate, entity_id(&relation.object)));
            }
        }

        // A lone entity carries every property predicate of the query
        if let [(_, entity)] = grounded.entities.iter().collect::<Vec<_>>().as_slice() {
            for (text, predicate) in &grounded.predicates {
                let name = slugify(text);
                if predicate.kind == PredicateKind::Property && !name.is_empty() {
                    facts.insert(Fact::Property(entity.id.clone(), name));
                }
            }
        }

        facts
    }
}

fn dedupe(conclusions: impl IntoIterator<Item = Conclusion>) -> Vec<Conclusion> {
    let mut merged: Vec<Conclusion> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for conclusion in conclusions {
        match index.get(&conclusion.statement) {
            Some(&i) => {
                if conclusion.confidence > merged[i].confidence {
                    merged[i] = conclusion;
                }
            }
            None => {
                index.insert(conclusion.statement.clone(), merged.len());
                merged.push(conclusion);
            }
        }
    }

    merged.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    merged
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        DEFAULT_LLM_CONFIDENCE
    }
}

fn step_kind(label: &str) -> ProofStepKind {
    match label.trim().to_lowercase().as_str() {
        "fact" => ProofStepKind::Fact,
        "rule" => ProofStepKind::Rule,
        _ => ProofStepKind::Inference,
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items.iter().map(|i| format!("- {}", i)).collect::<Vec<_>>().join("\n")
}
