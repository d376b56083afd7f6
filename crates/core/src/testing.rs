//! Test doubles shared by unit tests

use crate::errors::{AppError, Result};
use crate::llm::{GenerateRequest, LlmClient, ModelProfile};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Replays canned responses in call order; unavailable once exhausted
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(AppError::LlmUnavailable {
                    message: "script exhausted".to_string(),
                })
            })
    }

    fn model_for(&self, _profile: ModelProfile) -> &str {
        "scripted"
    }
}

/// Fails the first `fail_first` calls, then never answers
pub struct StallingLlm {
    fail_first: usize,
    calls: AtomicUsize,
    waiting: AtomicUsize,
    abandoned: Arc<AtomicUsize>,
}

impl StallingLlm {
    pub fn new(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Calls that reached the never-answering wait
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Waiting calls whose future was dropped
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

struct AbandonGuard(Arc<AtomicUsize>);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmClient for StallingLlm {
    async fn generate(&self, _request: &GenerateRequest) -> Result<String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            return Err(AppError::LlmUnavailable {
                message: "connection refused".to_string(),
            });
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = AbandonGuard(self.abandoned.clone());
        std::future::pending().await
    }

    fn model_for(&self, _profile: ModelProfile) -> &str {
        "stalling"
    }
}

/// Panics on every call
pub struct PanickingLlm;

#[async_trait]
impl LlmClient for PanickingLlm {
    async fn generate(&self, _request: &GenerateRequest) -> Result<String> {
        panic!("backend client bug")
    }

    fn model_for(&self, _profile: ModelProfile) -> &str {
        "panicking"
    }
}
