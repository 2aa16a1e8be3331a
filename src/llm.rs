//! LLM completion provider access
//!
//! All completion traffic goes through a two-class priority scheduler:
//! `high` (user-facing, unbatched, 30 s deadline) and `low` (background,
//! batched in a short window, 120 s deadline). Low-priority work only
//! runs while the system is idle, and observed rate limits impose a
//! cooldown on low-priority traffic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::error::{LimbicError, Result};

/// Deadline for high-priority requests
pub const HIGH_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for low-priority requests
pub const LOW_DEADLINE: Duration = Duration::from_secs(120);

/// Batch window for low-priority requests
const LOW_BATCH_WINDOW: Duration = Duration::from_secs(1);

/// Maximum low-priority batch size
const LOW_MAX_BATCH: usize = 5;

/// Idle means no high-priority activity for this long
const IDLE_AFTER: Duration = Duration::from_secs(30);

/// Cooldown applied to low-priority traffic after a rate limit
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Chat-style completion provider returning a content string
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str, expect_json: bool) -> Result<String>;
}

/// HTTP chat-completions provider
pub struct HttpCompletionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpCompletionProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, prompt: &str, expect_json: bool) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if expect_json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(LimbicError::ProviderRateLimited(
                RATE_LIMIT_COOLDOWN.as_secs(),
            ));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LimbicError::Completion(format!(
                "provider error {}: {}",
                status, text
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LimbicError::Completion("missing content in response".to_string()))?;
        Ok(content.to_string())
    }
}

struct SchedulerState {
    last_high_activity: Option<Instant>,
    low_cooldown_until: Option<Instant>,
}

struct LowRequest {
    prompt: String,
    expect_json: bool,
    reply: oneshot::Sender<Result<String>>,
}

/// Two-class priority scheduler over one completion provider
pub struct LlmScheduler {
    provider: Arc<dyn CompletionProvider>,
    state: Arc<Mutex<SchedulerState>>,
    low_tx: mpsc::UnboundedSender<LowRequest>,
}

impl LlmScheduler {
    /// Start the scheduler and its low-priority batch worker
    pub fn start(provider: Arc<dyn CompletionProvider>) -> Arc<Self> {
        let state = Arc::new(Mutex::new(SchedulerState {
            last_high_activity: None,
            low_cooldown_until: None,
        }));
        let (low_tx, low_rx) = mpsc::unbounded_channel::<LowRequest>();

        let scheduler = Arc::new(Self {
            provider: provider.clone(),
            state: state.clone(),
            low_tx,
        });

        tokio::spawn(low_worker(provider, state, low_rx));

        scheduler
    }

    /// True iff no high-priority activity was seen recently
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        match state.last_high_activity {
            Some(last) => last.elapsed() >= IDLE_AFTER,
            None => true,
        }
    }

    fn note_rate_limit(state: &Mutex<SchedulerState>) {
        state.lock().low_cooldown_until = Some(Instant::now() + RATE_LIMIT_COOLDOWN);
    }

    /// User-facing completion: unbatched, 30 s deadline
    pub async fn complete_high(&self, prompt: &str, expect_json: bool) -> Result<String> {
        self.state.lock().last_high_activity = Some(Instant::now());

        let result = tokio::time::timeout(HIGH_DEADLINE, self.provider.complete(prompt, expect_json))
            .await
            .map_err(|_| LimbicError::Completion("high-priority deadline exceeded".to_string()))?;

        if let Err(LimbicError::ProviderRateLimited(_)) = &result {
            Self::note_rate_limit(&self.state);
        }
        result
    }

    /// Background completion: batched, idle-gated, 120 s deadline
    pub async fn complete_low(&self, prompt: &str, expect_json: bool) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.low_tx
            .send(LowRequest {
                prompt: prompt.to_string(),
                expect_json,
                reply: reply_tx,
            })
            .map_err(|_| LimbicError::Completion("scheduler stopped".to_string()))?;

        match tokio::time::timeout(LOW_DEADLINE, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LimbicError::Completion("scheduler dropped request".to_string())),
            Err(_) => Err(LimbicError::Completion(
                "low-priority deadline exceeded".to_string(),
            )),
        }
    }
}

/// Low-priority worker: collects a batch, waits for idleness and
/// cooldowns, then runs requests back-to-back
async fn low_worker(
    provider: Arc<dyn CompletionProvider>,
    state: Arc<Mutex<SchedulerState>>,
    mut rx: mpsc::UnboundedReceiver<LowRequest>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let window_end = Instant::now() + LOW_BATCH_WINDOW;
        while batch.len() < LOW_MAX_BATCH {
            let remaining = window_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(request)) => batch.push(request),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        // Gate on idleness and any active rate-limit cooldown
        loop {
            let wait = {
                let state = state.lock();
                let mut wait = Duration::ZERO;
                if let Some(until) = state.low_cooldown_until {
                    wait = wait.max(until.saturating_duration_since(Instant::now()));
                }
                if let Some(last) = state.last_high_activity {
                    let idle_at = last + IDLE_AFTER;
                    wait = wait.max(idle_at.saturating_duration_since(Instant::now()));
                }
                wait
            };
            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait.min(Duration::from_secs(5))).await;
        }

        for request in batch {
            let result = provider.complete(&request.prompt, request.expect_json).await;
            if let Err(LimbicError::ProviderRateLimited(_)) = &result {
                LlmScheduler::note_rate_limit(&state);
            }
            let _ = request.reply.send(result);
        }
    }
}
