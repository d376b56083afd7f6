//! Session registry
//!
//! One coordinator task owns every session. Handles talk to it over an mpsc
//! channel and receive replies on oneshot channels, so each command is
//! applied atomically with respect to all others.

use super::{RetentionPolicy, Session, SessionEvent, SessionState};
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::reasoning::{PendingContext, ReasoningOptions};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use uuid::Uuid;

const COMMAND_BUFFER: usize = 256;

type Claim = Result<(PendingContext, ReasoningOptions)>;

enum Command {
    Insert {
        session: Session,
        reply: oneshot::Sender<()>,
    },
    Get {
        id: Uuid,
        reply: oneshot::Sender<Option<Session>>,
    },
    Apply {
        id: Uuid,
        event: SessionEvent,
        reply: oneshot::Sender<bool>,
    },
    TakePending {
        id: Uuid,
        facts: Vec<String>,
        reply: oneshot::Sender<Claim>,
    },
    Attach {
        id: Uuid,
        task: AbortHandle,
    },
    Remove {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<Session>>,
    },
    Evict {
        now: DateTime<Utc>,
        policy: RetentionPolicy,
        reply: oneshot::Sender<usize>,
    },
}

struct Entry {
    session: Session,
    task: Option<AbortHandle>,
}

/// Handle to the session coordinator
#[derive(Clone)]
pub struct SessionRegistry {
    tx: mpsc::Sender<Command>,
}

impl SessionRegistry {
    /// Spawn the coordinator task. Must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(Coordinator::default().run(rx));
        Self { tx }
    }

    pub async fn insert(&self, session: Session) -> Result<()> {
        self.request(|reply| Command::Insert { session, reply }).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Apply a pipeline event; false when the session is gone or already terminal
    pub async fn apply(&self, id: Uuid, event: SessionEvent) -> Result<bool> {
        self.request(|reply| Command::Apply { id, event, reply }).await
    }

    /// Atomically claim a suspended session's pending marker
    pub async fn take_pending(&self, id: Uuid, facts: Vec<String>) -> Claim {
        self.request(|reply| Command::TakePending { id, facts, reply }).await?
    }

    /// Record the task currently driving `id`
    pub async fn attach(&self, id: Uuid, task: AbortHandle) -> Result<()> {
        self.tx
            .send(Command::Attach { id, task })
            .await
            .map_err(|_| Self::unavailable())
    }

    /// Remove a session and abort its pipeline task
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        self.request(|reply| Command::Remove { id, reply }).await
    }

    /// Snapshot of every session, oldest first
    pub async fn list(&self) -> Result<Vec<Session>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Drop sessions whose retention expired at `now`
    pub async fn evict(&self, now: DateTime<Utc>, policy: RetentionPolicy) -> Result<usize> {
        self.request(|reply| Command::Evict { now, policy, reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Self::unavailable())?;
        rx.await.map_err(|_| Self::unavailable())
    }

    fn unavailable() -> AppError {
        AppError::Internal {
            message: "session registry is not running".to_string(),
        }
    }
}

#[derive(Default)]
struct Coordinator {
    sessions: HashMap<Uuid, Entry>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }

        for entry in self.sessions.values() {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
        tracing::debug!("Session registry stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Insert { session, reply } => {
                metrics::record_session_started();
                self.sessions.insert(session.id, Entry { session, task: None });
                self.publish_active();
                let _ = reply.send(());
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.sessions.get(&id).map(|e| e.session.clone()));
            }
            Command::Apply { id, event, reply } => {
                let _ = reply.send(self.apply(id, event));
            }
            Command::TakePending { id, facts, reply } => {
                let _ = reply.send(self.take_pending(id, &facts));
            }
            Command::Attach { id, task } => match self.sessions.get_mut(&id) {
                Some(entry) => entry.task = Some(task),
                // Cancelled before its task was recorded
                None => task.abort(),
            },
            Command::Remove { id, reply } => {
                let removed = match self.sessions.remove(&id) {
                    Some(entry) => {
                        if let Some(task) = entry.task {
                            task.abort();
                        }
                        if !entry.session.state.is_terminal() {
                            metrics::record_session_finished("cancelled");
                        }
                        tracing::info!(session_id = %id, state = %entry.session.state, "Session cancelled");
                        true
                    }
                    None => false,
                };
                self.publish_active();
                let _ = reply.send(removed);
            }
            Command::List { reply } => {
                let mut sessions: Vec<Session> = self.sessions.values().map(|e| e.session.clone()).collect();
                sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
                let _ = reply.send(sessions);
            }
            Command::Evict { now, policy, reply } => {
                let before = self.sessions.len();
                self.sessions.retain(|id, entry| {
                    if !entry.session.is_expired(&policy, now) {
                        return true;
                    }
                    if let Some(task) = &entry.task {
                        task.abort();
                    }
                    tracing::debug!(session_id = %id, state = %entry.session.state, "Session evicted");
                    false
                });
                self.publish_active();
                let _ = reply.send(before - self.sessions.len());
            }
        }
    }

    fn apply(&mut self, id: Uuid, event: SessionEvent) -> bool {
        let Some(entry) = self.sessions.get_mut(&id) else {
            tracing::debug!(session_id = %id, "Update for unknown session ignored");
            return false;
        };

        if !entry.session.apply(event) {
            tracing::debug!(session_id = %id, state = %entry.session.state, "Update for finished session ignored");
            return false;
        }

        report_transition(id, &entry.session);
        if entry.session.state.is_terminal() {
            self.publish_active();
        }

        true
    }

    fn take_pending(&mut self, id: Uuid, facts: &[String]) -> Claim {
        let entry = self.sessions.get_mut(&id).ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })?;

        entry.session.take_pending(facts).ok_or_else(|| AppError::InvalidSessionState {
            id: id.to_string(),
            state: entry.session.state.to_string(),
            expected: "suspended".to_string(),
        })
    }

    fn publish_active(&self) {
        let active = self
            .sessions
            .values()
            .filter(|e| !e.session.state.is_terminal())
            .count();
        metrics::set_active_sessions(active);
    }
}

/// Log and count a session that just finished or suspended
fn report_transition(id: Uuid, session: &Session) {
    let state = session.state;
    if state.is_terminal() {
        metrics::record_session_finished(state.as_str());
        match state {
            SessionState::Failed => tracing::warn!(
                session_id = %id,
                error = session.error.as_deref().unwrap_or_default(),
                "Session failed"
            ),
            _ => tracing::info!(session_id = %id, "Session complete"),
        }
    } else if session.is_suspended() {
        metrics::record_session_suspended(state.as_str());
        tracing::info!(session_id = %id, state = %state, "Session suspended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::{SemanticParser, SymbolGrounder};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio_test::assert_ok;

    fn new_session() -> Session {
        Session::new(Uuid::new_v4(), "what is a function?", ReasoningOptions::default())
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::spawn();
        let session = new_session();
        let id = session.id;

        assert_ok!(registry.insert(session).await);
        assert_eq!(registry.get(id).await.unwrap().unwrap().state, SessionState::Idle);

        assert!(registry.remove(id).await.unwrap());
        assert!(registry.get(id).await.unwrap().is_none());
        assert!(!registry.remove(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_to_missing_session_is_noop() {
        let registry = SessionRegistry::spawn();
        assert!(!registry.apply(Uuid::new_v4(), SessionEvent::Started).await.unwrap());
    }

    #[tokio::test]
    async fn test_take_pending_errors() {
        let registry = SessionRegistry::spawn();

        let missing = registry.take_pending(Uuid::new_v4(), vec![]).await.unwrap_err();
        assert!(matches!(missing, AppError::SessionNotFound { .. }));

        let session = new_session();
        let id = session.id;
        registry.insert(session).await.unwrap();
        registry.apply(id, SessionEvent::Started).await.unwrap();

        match registry.take_pending(id, vec![]).await.unwrap_err() {
            AppError::InvalidSessionState { state, expected, .. } => {
                assert_eq!(state, "parsing");
                assert_eq!(expected, "suspended");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let registry = SessionRegistry::spawn();
        let session = new_session();
        let id = session.id;
        let parsed = SemanticParser::heuristic_parse("the bank and the river");
        let partial = SymbolGrounder::heuristic_ground(&parsed);

        registry.insert(session).await.unwrap();
        registry.apply(id, SessionEvent::Started).await.unwrap();
        registry
            .apply(
                id,
                SessionEvent::Suspended(PendingContext::NeedClarification {
                    ambiguous: vec!["bank".into()],
                    partial,
                    parsed,
                }),
            )
            .await
            .unwrap();

        let claims = futures::future::join_all((0..8).map(|_| {
            let registry = registry.clone();
            async move { registry.take_pending(id, vec![]).await }
        }))
        .await;

        assert_eq!(claims.iter().filter(|c| c.is_ok()).count(), 1);
    }

    #[tokio::test]
    async fn test_remove_aborts_attached_task() {
        let registry = SessionRegistry::spawn();
        let session = new_session();
        let id = session.id;
        registry.insert(session).await.unwrap();

        let task = tokio::spawn(std::future::pending::<()>());
        registry.attach(id, task.abort_handle()).await.unwrap();
        registry.remove(id).await.unwrap();

        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let registry = SessionRegistry::spawn();
        let finished = new_session();
        let running = new_session();
        let (finished_id, running_id) = (finished.id, running.id);

        registry.insert(finished).await.unwrap();
        registry.insert(running).await.unwrap();
        registry.apply(finished_id, SessionEvent::Started).await.unwrap();
        registry.apply(finished_id, SessionEvent::Failed("boom".into())).await.unwrap();
        registry.apply(running_id, SessionEvent::Started).await.unwrap();

        let policy = RetentionPolicy::default();
        assert_eq!(registry.evict(Utc::now(), policy).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(16);
        assert_eq!(registry.evict(later, policy).await.unwrap(), 1);
        assert!(registry.get(finished_id).await.unwrap().is_none());
        assert!(registry.get(running_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_evict_expired_suspended() {
        let registry = SessionRegistry::spawn();
        let session = new_session();
        let id = session.id;
        let parsed = SemanticParser::heuristic_parse("the bank and the river");
        let grounded = SymbolGrounder::heuristic_ground(&parsed);

        registry.insert(session).await.unwrap();
        registry.apply(id, SessionEvent::Started).await.unwrap();
        registry
            .apply(
                id,
                SessionEvent::Suspended(PendingContext::NeedFacts {
                    reason: "nothing to conclude".into(),
                    parsed,
                    grounded,
                }),
            )
            .await
            .unwrap();

        let policy = RetentionPolicy::default();
        let now = Utc::now();
        assert_eq!(registry.evict(now + chrono::Duration::minutes(30), policy).await.unwrap(), 0);
        assert!(registry.get(id).await.unwrap().is_some());

        assert_eq!(registry.evict(now + chrono::Duration::minutes(61), policy).await.unwrap(), 1);
        assert!(registry.get(id).await.unwrap().is_none());
    }

    #[test]
    fn test_suspension_counted_apart_from_outcomes() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let mut session = new_session();
        let id = session.id;
        let parsed = SemanticParser::heuristic_parse("the bank and the river");
        let partial = SymbolGrounder::heuristic_ground(&parsed);

        ::metrics::with_local_recorder(&recorder, || {
            for event in [
                SessionEvent::Started,
                SessionEvent::Suspended(PendingContext::NeedClarification {
                    ambiguous: vec!["bank".into()],
                    partial,
                    parsed,
                }),
            ] {
                assert!(session.apply(event));
                report_transition(id, &session);
            }
            assert!(session.take_pending(&[]).is_some());
            assert!(session.apply(SessionEvent::Explained("done".into())));
            report_transition(id, &session);
        });

        let rendered = handle.render();
        assert!(rendered.contains("docforge_sessions_suspended_total{stage=\"grounding\"} 1"), "{rendered}");
        assert!(rendered.contains("docforge_sessions_finished_total{outcome=\"complete\"} 1"), "{rendered}");
        assert!(!rendered.contains("outcome=\"suspended\""), "{rendered}");
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_start() {
        let registry = SessionRegistry::spawn();
        let first = new_session();
        let mut second = new_session();
        second.started_at = first.started_at + chrono::Duration::seconds(1);
        let (first_id, second_id) = (first.id, second.id);

        registry.insert(second).await.unwrap();
        registry.insert(first).await.unwrap();

        let ids: Vec<Uuid> = registry.list().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first_id, second_id]);
    }
}
