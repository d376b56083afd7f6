//! Reasoning sessions
//!
//! A session tracks one query through the pipeline. Sessions live in the
//! [`SessionRegistry`], are mutated only by its coordinator task, and are
//! driven by the [`Orchestrator`].

mod orchestrator;
mod registry;

pub use orchestrator::{Orchestrator, ReasoningRequest};
pub use registry::SessionRegistry;

use crate::config::ReasoningConfig;
use crate::reasoning::{
    GroundedSymbols, InferenceResult, ParsedIntent, PendingContext, ReasoningOptions, Stage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Pipeline position of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Parsing,
    Grounding,
    Reasoning,
    Explaining,
    Complete,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Parsing => "parsing",
            SessionState::Grounding => "grounding",
            SessionState::Reasoning => "reasoning",
            SessionState::Explaining => "explaining",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Stage> for SessionState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Parsing => SessionState::Parsing,
            Stage::Grounding => SessionState::Grounding,
            Stage::Reasoning => SessionState::Reasoning,
            Stage::Explaining => SessionState::Explaining,
        }
    }
}

/// A stage result, or the marker of a stage waiting for caller input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot<T> {
    Ready(T),
    Pending(PendingContext),
}

impl<T> Slot<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Slot::Ready(value) => Some(value),
            Slot::Pending(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingContext> {
        match self {
            Slot::Ready(_) => None,
            Slot::Pending(pending) => Some(pending),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTransition {
    pub state: SessionState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Registry updates issued by pipeline tasks
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    Parsed(ParsedIntent),
    Grounded(GroundedSymbols),
    Inferred(InferenceResult),
    Suspended(PendingContext),
    Explained(String),
    Failed(String),
}

/// How long finished and suspended sessions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub terminal_ttl: Duration,
    pub suspended_ttl: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &ReasoningConfig) -> Self {
        Self {
            terminal_ttl: Duration::from_secs(config.terminal_ttl_secs),
            suspended_ttl: Duration::from_secs(config.suspended_ttl_secs),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&ReasoningConfig::default())
    }
}

/// Result of a completed synchronous reasoning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningOutcome {
    pub session_id: Uuid,
    pub query: String,
    pub parsed: ParsedIntent,
    pub grounded: GroundedSymbols,
    pub inference: InferenceResult,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub query: String,
    pub options: ReasoningOptions,
    pub state: SessionState,
    pub parsed: Option<ParsedIntent>,
    pub grounded: Option<Slot<GroundedSymbols>>,
    pub inference: Option<Slot<InferenceResult>>,
    pub explanation: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<SessionTransition>,
}

impl Session {
    pub fn new(id: Uuid, query: impl Into<String>, options: ReasoningOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            query: query.into(),
            options,
            state: SessionState::Idle,
            parsed: None,
            grounded: None,
            inference: None,
            explanation: None,
            error: None,
            started_at: now,
            updated_at: now,
            history: vec![SessionTransition {
                state: SessionState::Idle,
                at: now,
                note: None,
            }],
        }
    }

    /// The marker of the stage waiting for caller input, if any
    pub fn pending(&self) -> Option<&PendingContext> {
        if self.state.is_terminal() {
            return None;
        }
        self.grounded
            .as_ref()
            .and_then(Slot::pending)
            .or_else(|| self.inference.as_ref().and_then(Slot::pending))
    }

    pub fn is_suspended(&self) -> bool {
        self.pending().is_some()
    }

    /// Apply a pipeline event. Terminal sessions ignore further events.
    pub fn apply(&mut self, event: SessionEvent) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        let (state, note) = match event {
            SessionEvent::Started => (SessionState::Parsing, None),
            SessionEvent::Parsed(parsed) => {
                self.parsed = Some(parsed);
                (SessionState::Grounding, None)
            }
            SessionEvent::Grounded(grounded) => {
                self.grounded = Some(Slot::Ready(grounded));
                (SessionState::Reasoning, None)
            }
            SessionEvent::Inferred(inference) => {
                self.inference = Some(Slot::Ready(inference));
                (SessionState::Explaining, None)
            }
            SessionEvent::Suspended(pending) => {
                let note = Some(pending.describe());
                match pending {
                    PendingContext::NeedClarification { .. } => {
                        self.grounded = Some(Slot::Pending(pending));
                        (SessionState::Grounding, note)
                    }
                    PendingContext::NeedFacts { .. } => {
                        self.inference = Some(Slot::Pending(pending));
                        (SessionState::Reasoning, note)
                    }
                }
            }
            SessionEvent::Explained(explanation) => {
                self.explanation = Some(explanation);
                (SessionState::Complete, None)
            }
            SessionEvent::Failed(message) => {
                self.explanation = None;
                self.error = Some(message.clone());
                (SessionState::Failed, Some(message))
            }
        };

        self.transition(state, note);
        true
    }

    /// Claim the pending marker for a resume.
    ///
    /// Clears the suspended slot and appends `facts` to the background facts.
    /// Returns the marker and the options the continuation should run with.
    pub fn take_pending(&mut self, facts: &[String]) -> Option<(PendingContext, ReasoningOptions)> {
        if self.state.is_terminal() {
            return None;
        }

        let pending = if let Some(Slot::Pending(_)) = &self.grounded {
            match self.grounded.take() {
                Some(Slot::Pending(pending)) => pending,
                _ => return None,
            }
        } else if let Some(Slot::Pending(_)) = &self.inference {
            match self.inference.take() {
                Some(Slot::Pending(pending)) => pending,
                _ => return None,
            }
        } else {
            return None;
        };

        self.options.background_facts.extend(facts.iter().cloned());
        let note = match facts.len() {
            0 => "resumed".to_string(),
            n => format!("resumed with {} fact(s)", n),
        };
        self.transition(self.state, Some(note));

        Some((pending, self.options.clone()))
    }

    pub fn is_expired(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> bool {
        let ttl = if self.state.is_terminal() {
            policy.terminal_ttl
        } else if self.is_suspended() {
            policy.suspended_ttl
        } else {
            return false;
        };

        now.signed_duration_since(self.updated_at)
            .to_std()
            .map(|age| age >= ttl)
            .unwrap_or(false)
    }

    /// Everything a complete session produced
    pub fn outcome(&self) -> Option<ReasoningOutcome> {
        if self.state != SessionState::Complete {
            return None;
        }

        Some(ReasoningOutcome {
            session_id: self.id,
            query: self.query.clone(),
            parsed: self.parsed.clone()?,
            grounded: self.grounded.as_ref()?.value()?.clone(),
            inference: self.inference.as_ref()?.value()?.clone(),
            explanation: self.explanation.clone()?,
        })
    }

    fn transition(&mut self, state: SessionState, note: Option<String>) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        self.history.push(SessionTransition { state, at: now, note });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::{Reasoner, SemanticParser, SymbolGrounder};

    fn fixture() -> (ParsedIntent, GroundedSymbols, InferenceResult) {
        let parsed = SemanticParser::heuristic_parse("Is this function safe to use?");
        let grounded = SymbolGrounder::heuristic_ground(&parsed);
        let inference = Reasoner::rule_based(&parsed, &grounded, &ReasoningOptions::default());
        (parsed, grounded, inference)
    }

    fn session() -> Session {
        Session::new(Uuid::new_v4(), "Is this function safe to use?", ReasoningOptions::default())
    }

    #[test]
    fn test_full_lifecycle() {
        let (parsed, grounded, inference) = fixture();
        let mut session = session();

        assert!(session.apply(SessionEvent::Started));
        assert!(session.apply(SessionEvent::Parsed(parsed)));
        assert_eq!(session.state, SessionState::Grounding);
        assert!(session.apply(SessionEvent::Grounded(grounded)));
        assert!(session.apply(SessionEvent::Inferred(inference)));
        assert!(session.apply(SessionEvent::Explained("done".into())));

        assert_eq!(session.state, SessionState::Complete);
        let states: Vec<SessionState> = session.history.iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![
                SessionState::Idle,
                SessionState::Parsing,
                SessionState::Grounding,
                SessionState::Reasoning,
                SessionState::Explaining,
                SessionState::Complete,
            ]
        );
        let outcome = session.outcome().unwrap();
        assert_eq!(outcome.explanation, "done");
        assert!(session.updated_at >= session.started_at);
    }

    #[test]
    fn test_terminal_sessions_ignore_events() {
        let mut session = session();
        session.apply(SessionEvent::Started);
        session.apply(SessionEvent::Failed("boom".into()));

        assert!(!session.apply(SessionEvent::Explained("late".into())));
        assert_eq!(session.state, SessionState::Failed);
        assert_eq!(session.error.as_deref(), Some("boom"));
        assert!(session.explanation.is_none());
        assert!(session.outcome().is_none());
    }

    #[test]
    fn test_take_pending_is_single_use() {
        let (parsed, grounded, _) = fixture();
        let mut session = session();
        session.apply(SessionEvent::Started);
        session.apply(SessionEvent::Parsed(parsed.clone()));
        session.apply(SessionEvent::Suspended(PendingContext::NeedClarification {
            ambiguous: vec!["use".into()],
            partial: grounded,
            parsed,
        }));

        assert!(session.is_suspended());
        assert_eq!(session.state, SessionState::Grounding);

        let facts = vec!["property(x, tested)".to_string()];
        let (pending, options) = session.take_pending(&facts).unwrap();
        assert!(matches!(pending, PendingContext::NeedClarification { .. }));
        assert_eq!(options.background_facts, facts);
        assert!(session.grounded.is_none());
        assert!(!session.is_suspended());
        assert!(session.take_pending(&[]).is_none());
    }

    #[test]
    fn test_need_facts_suspends_reasoning() {
        let (parsed, grounded, _) = fixture();
        let mut session = session();
        session.apply(SessionEvent::Started);
        session.apply(SessionEvent::Parsed(parsed.clone()));
        session.apply(SessionEvent::Grounded(grounded.clone()));
        session.apply(SessionEvent::Suspended(PendingContext::NeedFacts {
            reason: "nothing known".into(),
            parsed,
            grounded,
        }));

        assert_eq!(session.state, SessionState::Reasoning);
        assert!(matches!(session.pending(), Some(PendingContext::NeedFacts { .. })));
        assert!(session.grounded.as_ref().unwrap().value().is_some());
    }

    #[test]
    fn test_retention() {
        let policy = RetentionPolicy::default();
        let mut session = session();
        let now = Utc::now();

        session.apply(SessionEvent::Started);
        assert!(!session.is_expired(&policy, now + chrono::Duration::hours(2)));

        session.apply(SessionEvent::Explained("done".into()));
        assert!(!session.is_expired(&policy, now + chrono::Duration::minutes(5)));
        assert!(session.is_expired(&policy, now + chrono::Duration::minutes(16)));
    }

    #[test]
    fn test_suspended_retention() {
        let (parsed, grounded, _) = fixture();
        let policy = RetentionPolicy::default();
        let mut session = session();
        session.apply(SessionEvent::Started);
        session.apply(SessionEvent::Parsed(parsed.clone()));
        session.apply(SessionEvent::Suspended(PendingContext::NeedClarification {
            ambiguous: vec!["function".into()],
            partial: grounded,
            parsed,
        }));
        assert!(session.is_suspended());

        let suspended_at = session.updated_at;
        assert!(!session.is_expired(&policy, suspended_at + chrono::Duration::minutes(30)));
        assert!(!session.is_expired(&policy, suspended_at + chrono::Duration::minutes(59)));
        assert!(session.is_expired(&policy, suspended_at + chrono::Duration::minutes(61)));
    }

    #[test]
    fn test_session_serializes_slots() {
        let (parsed, grounded, _) = fixture();
        let mut session = session();
        session.apply(SessionEvent::Started);
        session.apply(SessionEvent::Parsed(parsed.clone()));
        session.apply(SessionEvent::Suspended(PendingContext::NeedClarification {
            ambiguous: vec!["use".into()],
            partial: grounded,
            parsed,
        }));

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"], "grounding");
        assert_eq!(json["grounded"]["pending"]["kind"], "need_clarification");
        assert_eq!(json["history"][3]["note"], "awaiting clarification for: use");
    }
}
