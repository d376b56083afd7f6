//! Orchestrator - Public session API
//!
//! Starts, inspects, resumes and cancels reasoning sessions. Every session's
//! pipeline runs on its own tokio task; the task reports each stage result
//! to the registry and stops when the session completes, fails, suspends
//! or is removed.

use super::{ReasoningOutcome, RetentionPolicy, Session, SessionEvent, SessionRegistry, SessionState};
use crate::config::{AppConfig, ReasoningConfig};
use crate::errors::{AppError, Result};
use crate::knowledge::create_knowledge_base;
use crate::llm::create_llm_client;
use crate::reasoning::{
    Fact, PendingContext, Pipeline, ReasoningOptions, ResumeInput, StageInput, Step,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;
use validator::Validate;

/// Floor for the synchronous status poll
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A validated request to start reasoning
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReasoningRequest {
    #[validate(length(min = 1, max = 4000, message = "Query must be 1-4000 characters"))]
    pub query: String,

    #[serde(default)]
    #[validate(nested)]
    pub options: ReasoningOptions,
}

impl ReasoningRequest {
    pub fn new(query: impl Into<String>, options: ReasoningOptions) -> Self {
        Self {
            query: query.into(),
            options,
        }
    }

    fn check(&self) -> Result<()> {
        self.validate()?;
        if self.query.trim().is_empty() {
            return Err(AppError::Validation {
                message: "Query must not be blank".to_string(),
                field: Some("query".to_string()),
            });
        }
        check_facts(&self.options.background_facts)
    }
}

fn check_facts(facts: &[String]) -> Result<()> {
    for fact in facts {
        fact.parse::<Fact>()?;
    }
    Ok(())
}

/// Entry point for reasoning sessions
#[derive(Clone)]
pub struct Orchestrator {
    registry: SessionRegistry,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    sync_timeout: Duration,
    sweep_interval: Duration,
    retention: RetentionPolicy,
}

impl Orchestrator {
    /// Create an orchestrator around `pipeline`. Must be called inside a tokio runtime.
    pub fn new(pipeline: Pipeline, config: &ReasoningConfig) -> Self {
        Self {
            registry: SessionRegistry::spawn(),
            pipeline: Arc::new(pipeline),
            poll_interval: config.poll_interval().max(MIN_POLL_INTERVAL),
            sync_timeout: config.sync_timeout(),
            sweep_interval: config.sweep_interval(),
            retention: RetentionPolicy::from_config(config),
        }
    }

    /// Build the LLM and knowledge clients from configuration
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let llm = create_llm_client(&config.llm)?;
        let knowledge = create_knowledge_base(&config.knowledge)?;
        Ok(Self::new(Pipeline::new(llm, knowledge), &config.reasoning))
    }

    /// Start a session and return its id immediately
    pub async fn begin_reasoning(&self, query: impl Into<String>, options: ReasoningOptions) -> Result<Uuid> {
        let request = ReasoningRequest::new(query, options);
        request.check()?;

        let id = Uuid::new_v4();
        let query = request.query.trim().to_string();
        self.registry
            .insert(Session::new(id, query.clone(), request.options.clone()))
            .await?;

        tracing::info!(session_id = %id, mode = request.options.mode.as_str(), "Session started");
        self.spawn_pipeline(id, StageInput::Parse { query }, request.options, true)
            .await?;

        Ok(id)
    }

    /// Current snapshot of a session
    pub async fn status(&self, id: Uuid) -> Result<Session> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })
    }

    /// Continue a suspended session with caller input
    pub async fn resume(&self, id: Uuid, input: ResumeInput) -> Result<Session> {
        check_facts(&input.facts)?;

        let (pending, options) = self.registry.take_pending(id, input.facts).await?;
        let next = match pending {
            PendingContext::NeedClarification { partial, parsed, .. } => StageInput::Clarify {
                parsed,
                partial,
                clarifications: input.clarifications,
            },
            PendingContext::NeedFacts { parsed, grounded, .. } => StageInput::Reason { parsed, grounded },
        };

        tracing::info!(session_id = %id, stage = next.stage().as_str(), "Session resumed");
        self.spawn_pipeline(id, next, options, false).await?;
        self.status(id).await
    }

    /// Remove a session and stop its pipeline
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        if self.registry.remove(id).await? {
            Ok(())
        } else {
            Err(AppError::SessionNotFound { id: id.to_string() })
        }
    }

    /// Every session currently held, oldest first
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.registry.list().await
    }

    /// Run a session to completion with the configured deadline
    pub async fn reason_sync(&self, query: impl Into<String>, options: ReasoningOptions) -> Result<ReasoningOutcome> {
        self.reason_sync_with_timeout(query, options, self.sync_timeout).await
    }

    /// Run a session to completion, polling its status until `timeout`.
    ///
    /// A session that times out keeps running and can still be inspected.
    pub async fn reason_sync_with_timeout(
        &self,
        query: impl Into<String>,
        options: ReasoningOptions,
        timeout: Duration,
    ) -> Result<ReasoningOutcome> {
        let id = self.begin_reasoning(query, options).await?;
        // Timeouts too large for the clock never expire
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let session = self.status(id).await?;
            match session.state {
                SessionState::Complete => {
                    return session.outcome().ok_or_else(|| AppError::Internal {
                        message: format!("Session {} completed without a result", id),
                    });
                }
                SessionState::Failed => {
                    return Err(AppError::ReasoningFailed {
                        id: id.to_string(),
                        message: session.error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                _ => {}
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => {
                    tracing::warn!(session_id = %id, state = %session.state, "Synchronous reasoning timed out");
                    return Err(AppError::SessionTimeout {
                        id: id.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Some(deadline) => self.poll_interval.min(deadline - now),
                None => self.poll_interval,
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Drop sessions whose retention expired
    pub async fn evict_expired(&self) -> Result<usize> {
        let evicted = self.registry.evict(Utc::now(), self.retention).await?;
        if evicted > 0 {
            tracing::info!(evicted, "Expired sessions evicted");
        }
        Ok(evicted)
    }

    /// Periodically evict expired sessions
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.sweep_interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.evict_expired().await {
                    tracing::error!(error = %e, "Session sweep failed, stopping sweeper");
                    return;
                }
            }
        })
    }

    /// Spawn the task driving `id` from `input`, plus a supervisor that
    /// fails the session if that task panics.
    async fn spawn_pipeline(&self, id: Uuid, input: StageInput, options: ReasoningOptions, fresh: bool) -> Result<()> {
        let task = tokio::spawn(drive(
            self.registry.clone(),
            self.pipeline.clone(),
            id,
            input,
            options,
            fresh,
        ));
        self.registry.attach(id, task.abort_handle()).await?;

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let Err(e) = task.await else { return };
            if !e.is_panic() {
                return;
            }

            let payload = e.into_panic();
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());

            tracing::error!(session_id = %id, reason = %reason, "Pipeline task panicked");
            let failed = SessionEvent::Failed(format!("pipeline task panicked: {}", reason));
            if let Err(e) = registry.apply(id, failed).await {
                tracing::error!(session_id = %id, error = %e, "Registry unavailable, panicked session not marked failed");
            }
        });

        Ok(())
    }
}

/// Run stages until the session finishes, suspends, or disappears
async fn drive(
    registry: SessionRegistry,
    pipeline: Arc<Pipeline>,
    id: Uuid,
    mut input: StageInput,
    options: ReasoningOptions,
    fresh: bool,
) {
    if fresh && !matches!(registry.apply(id, SessionEvent::Started).await, Ok(true)) {
        return;
    }

    loop {
        let step = pipeline.step(input, &options).await;

        let (event, next) = match step {
            Step::Continue(next) => {
                let event = match &next {
                    StageInput::Ground { parsed } => SessionEvent::Parsed(parsed.clone()),
                    StageInput::Reason { grounded, .. } => SessionEvent::Grounded(grounded.clone()),
                    StageInput::Explain { inference, .. } => SessionEvent::Inferred(inference.clone()),
                    StageInput::Parse { .. } | StageInput::Clarify { .. } => {
                        SessionEvent::Failed("pipeline produced an out-of-order stage".to_string())
                    }
                };
                (event, Some(next))
            }
            Step::Suspended(pending) => (SessionEvent::Suspended(pending), None),
            Step::Done(explanation) => (SessionEvent::Explained(explanation), None),
            Step::Failed(message) => (SessionEvent::Failed(message), None),
        };

        let stop = matches!(event, SessionEvent::Failed(_));
        match registry.apply(id, event).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(session_id = %id, "Session gone, stopping pipeline");
                return;
            }
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Registry unavailable, stopping pipeline");
                return;
            }
        }

        match next {
            Some(next) if !stop => input = next,
            _ => return,
        }
    }
}
