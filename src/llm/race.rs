use crate::config::ModelDescriptor;
use crate::guardrails::Validator;
use crate::llm::{ChatMessage, Completion, LlmError, ProviderClient};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fixed backoff schedule per provider: a request gets this many retries on
/// transport failure before its trial is marked failed. Retries are local to
/// one provider and never delay its siblings.
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(400),
    Duration::from_millis(800),
    Duration::from_millis(1600),
];

/// One model's completed (or terminally failed) run in a race. Immutable once
/// created. Failed providers still yield a trial - with empty text, zero cost
/// and a floor score - so ranking stays total.
#[derive(Debug, Clone, Serialize)]
pub struct Trial {
    pub model_id: String,
    pub raw_text: String,
    pub latency_ms: u64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub score: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trial {
    fn from_completion(model: &ModelDescriptor, completion: Completion, elapsed: Duration) -> Self {
        let cost = completion.prompt_tokens as f64 / 1000.0 * model.input_price_per_1k
            + completion.completion_tokens as f64 / 1000.0 * model.output_price_per_1k;
        Self {
            model_id: model.id.clone(),
            raw_text: completion.text,
            latency_ms: elapsed.as_millis() as u64,
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            cost_usd: (cost * 1e6).round() / 1e6,
            score: 0,
            error: None,
        }
    }

    fn failed(model_id: &str, elapsed: Duration, error: String) -> Self {
        Self {
            model_id: model_id.to_string(),
            raw_text: String::new(),
            latency_ms: elapsed.as_millis() as u64,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            score: 0,
            error: Some(error),
        }
    }
}

/// Tie-break policy for winner selection; score always ranks first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinnerPolicy {
    /// score desc, cost asc, latency asc
    #[default]
    Cheapest,
    /// score desc, latency asc, cost asc
    Fastest,
}

/// Every configured provider exhausted its retry budget.
#[derive(Debug)]
pub struct RaceError {
    pub detail: String,
    pub trials: Vec<Trial>,
}

impl fmt::Display for RaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all providers failed: {}", self.detail)
    }
}

impl std::error::Error for RaceError {}

/// Issues one request per configured model concurrently, scores every answer
/// for groundedness, and picks a winner. The join waits for every provider:
/// ranking needs the full trial list, so a fast answer never short-circuits a
/// slow sibling.
pub struct RaceCoordinator {
    client: Arc<dyn ProviderClient>,
    models: Vec<ModelDescriptor>,
    validator: Arc<Validator>,
    max_tokens: u32,
    temperature: f32,
}

impl RaceCoordinator {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        models: Vec<ModelDescriptor>,
        validator: Arc<Validator>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client,
            models,
            validator,
            max_tokens,
            temperature,
        }
    }

    pub async fn run(
        &self,
        messages: &[ChatMessage],
        policy: WinnerPolicy,
    ) -> Result<(Trial, Vec<Trial>), RaceError> {
        let mut handles = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let client = Arc::clone(&self.client);
            let model = model.clone();
            let messages = messages.to_vec();
            let max_tokens = self.max_tokens;
            let temperature = self.temperature;
            let id = model.id.clone();
            let handle = tokio::spawn(async move {
                run_one(client, model, messages, max_tokens, temperature).await
            });
            handles.push((id, handle));
        }

        let mut trials = Vec::with_capacity(handles.len());
        for (model_id, handle) in handles {
            match handle.await {
                Ok(trial) => trials.push(trial),
                Err(e) => trials.push(Trial::failed(
                    &model_id,
                    Duration::ZERO,
                    format!("race task panicked: {e}"),
                )),
            }
        }

        for trial in &mut trials {
            if trial.error.is_none() {
                trial.score = self.validator.grounding_score(&trial.raw_text);
            }
        }

        if trials.iter().all(|t| t.error.is_some()) {
            let detail = trials
                .iter()
                .filter_map(|t| t.error.as_deref())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RaceError { detail, trials });
        }

        // Winner selection is a pure function of the settled trial list.
        let winner = pick_winner(&trials, policy)
            .cloned()
            .expect("non-empty trial list has a winner");
        info!(
            model = %winner.model_id,
            score = winner.score,
            cost_usd = winner.cost_usd,
            latency_ms = winner.latency_ms,
            "race winner selected"
        );
        Ok((winner, trials))
    }
}

async fn run_one(
    client: Arc<dyn ProviderClient>,
    model: ModelDescriptor,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
) -> Trial {
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        match client
            .send(&model.id, &messages, max_tokens, temperature)
            .await
        {
            Ok(completion) => {
                return Trial::from_completion(&model, completion, started.elapsed());
            }
            Err(LlmError::Transport(msg)) if attempt < BACKOFF.len() => {
                warn!(model = %model.id, attempt, "transport error, backing off: {msg}");
                tokio::time::sleep(BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(model = %model.id, "provider failed terminally: {e}");
                return Trial::failed(&model.id, started.elapsed(), e.to_string());
            }
        }
    }
}

/// Lexicographic ordering per policy; failed trials always rank last. Ties
/// resolve to the earliest trial in configuration order, so selection is
/// deterministic given identical inputs.
pub fn pick_winner(trials: &[Trial], policy: WinnerPolicy) -> Option<&Trial> {
    trials.iter().min_by(|a, b| rank(a, b, policy))
}

fn rank(a: &Trial, b: &Trial, policy: WinnerPolicy) -> Ordering {
    let score = |t: &Trial| -> i16 {
        if t.error.is_some() { -1 } else { t.score as i16 }
    };
    let by_score = score(b).cmp(&score(a));
    match policy {
        WinnerPolicy::Cheapest => by_score
            .then(a.cost_usd.total_cmp(&b.cost_usd))
            .then(a.latency_ms.cmp(&b.latency_ms)),
        WinnerPolicy::Fastest => by_score
            .then(a.latency_ms.cmp(&b.latency_ms))
            .then(a.cost_usd.total_cmp(&b.cost_usd)),
    }
}
