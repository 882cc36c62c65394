//! LLM interaction: the client seam, the provider-backed client, and the
//! per-run context every stage calls through.
//!
//! Stages never talk to a provider directly. They build a prompt (all prompt
//! text lives in [`crate::prompts`]) and go through [`request_json`] or
//! [`request_text`], which handle the standard → strict retry, decoding,
//! usage accounting, and the diagnostics trace.
//!
//! ## Retry Strategy
//!
//! Two independent layers:
//!
//! * **Transport** ([`ProviderClient`]): timeouts and provider errors are
//!   retried with exponential backoff (`retry_backoff_ms * 2^attempt`, capped
//!   at one minute). With 500 ms base and 3 retries the wait sequence is
//!   500 ms → 1 s → 2 s. Authentication, permission and request-size errors
//!   fail immediately; retrying cannot fix them.
//! * **Content** ([`request_json`]): output that cannot be decoded is retried
//!   exactly once with the strict-JSON prompt variant.

use crate::config::{GenerationConfig, GenerationMode, ALLOWED_MODELS, MAX_BACKOFF_MS};
use crate::error::{LlmCallError, StageFailure, StudyGenError};
use crate::pipeline::diagnostics::{Diagnostics, StageAttempt};
use crate::pipeline::schema::Decoded;
use crate::prompts::{strict_variant, JSON_SYSTEM_SUFFIX, SYSTEM_PROMPT};
use crate::types::ChunkRange;
use async_trait::async_trait;
use chrono::Utc;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

// ── Request / response ───────────────────────────────────────────────────

/// Which stage (and which slide range) a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPurpose {
    ChunkExtract { range: ChunkRange },
    Derive,
    Plan,
    Outline,
    Pack,
    Rewrite,
    GateRewrite,
    Redraft,
    Review,
}

impl CallPurpose {
    pub fn stage(&self) -> &'static str {
        match self {
            CallPurpose::ChunkExtract { .. } => "extract",
            CallPurpose::Derive => "derive",
            CallPurpose::Plan => "plan",
            CallPurpose::Outline => "outline",
            CallPurpose::Pack => "pack",
            CallPurpose::Rewrite => "rewrite",
            CallPurpose::GateRewrite => "gate_rewrite",
            CallPurpose::Redraft => "redraft",
            CallPurpose::Review => "review",
        }
    }

    /// Step A calls (chunk extraction and derive).
    pub fn is_step_a(&self) -> bool {
        matches!(self, CallPurpose::ChunkExtract { .. } | CallPurpose::Derive)
    }
}

impl fmt::Display for CallPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallPurpose::ChunkExtract { range } => write!(f, "extract {range}"),
            other => f.write_str(other.stage()),
        }
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub purpose: CallPurpose,
    pub model: String,
    pub prompt: String,
    pub max_tokens: usize,
    pub expects_json: bool,
    /// Second attempt with the strict-JSON suffix.
    pub strict: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Anything that can answer an [`LlmRequest`].
///
/// [`ProviderClient`] is the production implementation; tests script
/// responses per [`CallPurpose`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError>;
}

// ── Provider-backed client ───────────────────────────────────────────────

/// [`LlmClient`] backed by `edgequake-llm` providers, one per model id.
pub struct ProviderClient {
    providers: BTreeMap<String, Arc<dyn LLMProvider>>,
    temperature: f32,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout_secs: u64,
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderClient")
            .field("models", &self.providers.keys().collect::<Vec<_>>())
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl ProviderClient {
    /// Resolve one provider for every model the config uses.
    pub async fn from_config(config: &GenerationConfig) -> Result<Self, StudyGenError> {
        config.validate_models()?;
        let mut providers = BTreeMap::new();
        for model in config.models() {
            let provider = resolve_provider(config, &model).await?;
            debug!("Resolved provider for model {}", model);
            providers.insert(model, provider);
        }
        Ok(Self {
            providers,
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout_secs: config.api_timeout_secs,
        })
    }

    fn options(&self, max_tokens: usize) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LlmClient for ProviderClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
        if !ALLOWED_MODELS.contains(&request.model.as_str()) {
            return Err(LlmCallError::DisallowedModel(request.model.clone()));
        }
        let provider = self
            .providers
            .get(&request.model)
            .ok_or_else(|| LlmCallError::DisallowedModel(request.model.clone()))?;

        let system = if request.expects_json {
            format!("{SYSTEM_PROMPT}{JSON_SYSTEM_SUFFIX}")
        } else {
            SYSTEM_PROMPT.to_string()
        };
        let messages = vec![ChatMessage::system(&system), ChatMessage::user(&request.prompt)];
        let options = self.options(request.max_tokens);
        let limit = Duration::from_secs(self.api_timeout_secs.max(1));

        let mut last_err: Option<LlmCallError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = backoff_ms(self.retry_backoff_ms, attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    request.purpose, attempt, self.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match timeout(limit, provider.chat(&messages, Some(&options))).await {
                Ok(Ok(response)) => {
                    return Ok(LlmResponse {
                        text: response.content,
                        input_tokens: response.prompt_tokens as usize,
                        output_tokens: response.completion_tokens as usize,
                    });
                }
                Ok(Err(e)) => {
                    let detail = e.to_string();
                    warn!("{}: attempt {} failed: {}", request.purpose, attempt + 1, detail);
                    let retryable = is_retryable(&detail);
                    let err = LlmCallError::Failed {
                        retries: attempt,
                        detail,
                    };
                    if !retryable {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
                Err(_) => {
                    warn!(
                        "{}: attempt {} timed out after {}s",
                        request.purpose,
                        attempt + 1,
                        limit.as_secs()
                    );
                    last_err = Some(LlmCallError::Timeout { secs: limit.as_secs() });
                }
            }
        }

        Err(last_err.unwrap_or(LlmCallError::Failed {
            retries: self.max_retries,
            detail: "Unknown error".to_string(),
        }))
    }
}

const NON_RETRYABLE_MARKERS: [&str; 7] = [
    "401",
    "403",
    "unauthorized",
    "invalid api key",
    "invalid_api_key",
    "permission",
    "context_length_exceeded",
];

/// `false` for provider errors another attempt cannot fix.
fn is_retryable(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    !NON_RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Delay before transport retry `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at [`MAX_BACKOFF_MS`].
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, StudyGenError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        StudyGenError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider for `model`, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is for every model.
/// 2. **Named provider** (`config.provider_name`).
/// 3. **`EDGEQUAKE_LLM_PROVIDER`** from the environment.
/// 4. **`OPENAI_API_KEY`** present → `openai`.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
///
/// The model id always comes from the config so the allow-list holds
/// regardless of which provider answers.
async fn resolve_provider(
    config: &GenerationConfig,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, StudyGenError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let Ok(prov) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !prov.is_empty() {
            return create_provider(&prov, model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| StudyGenError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

// ── Run context ──────────────────────────────────────────────────────────

/// Token and call counters for one run.
#[derive(Debug, Default)]
pub struct Usage {
    pub llm_calls: AtomicUsize,
    pub step_a_calls: AtomicUsize,
    pub input_tokens: AtomicUsize,
    pub output_tokens: AtomicUsize,
}

impl Usage {
    fn add(&self, purpose: CallPurpose, response: Option<&LlmResponse>) {
        self.llm_calls.fetch_add(1, Ordering::Relaxed);
        if purpose.is_step_a() {
            self.step_a_calls.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(r) = response {
            self.input_tokens.fetch_add(r.input_tokens, Ordering::Relaxed);
            self.output_tokens.fetch_add(r.output_tokens, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> usize {
        self.llm_calls.load(Ordering::Relaxed)
    }

    pub fn step_a(&self) -> usize {
        self.step_a_calls.load(Ordering::Relaxed)
    }
}

/// Everything a stage needs for one run. Created per request; nothing in it
/// outlives the run.
pub struct RunContext<'a> {
    pub request_id: String,
    pub client: &'a dyn LlmClient,
    pub config: &'a GenerationConfig,
    pub mode: GenerationMode,
    pub diagnostics: Diagnostics,
    pub usage: Usage,
    started: Instant,
    /// `None` when the budget is too large to represent as an `Instant`.
    deadline: Option<Instant>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        request_id: impl Into<String>,
        doc_id: &str,
        client: &'a dyn LlmClient,
        config: &'a GenerationConfig,
        mode: GenerationMode,
    ) -> Self {
        let request_id = request_id.into();
        let started = Instant::now();
        Self {
            diagnostics: Diagnostics::new(request_id.clone(), doc_id, mode.as_str()),
            request_id,
            client,
            config,
            mode,
            usage: Usage::default(),
            started,
            deadline: started.checked_add(Duration::from_secs(config.time_budget_secs)),
        }
    }

    pub fn time_exhausted(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn stage(&self, stage: &str) {
        info!(request_id = %self.request_id, stage, "Stage started");
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage(stage);
        }
    }

    /// One raw call, recorded in usage. Diagnostics are the caller's job.
    async fn call(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
        let result = self.client.complete(request).await;
        self.usage.add(request.purpose, result.as_ref().ok());
        result
    }
}

/// A decoded JSON reply plus how many attempts it took.
#[derive(Debug, Clone)]
pub struct JsonReply<T> {
    pub value: T,
    pub repaired: bool,
    pub attempts: u32,
}

/// Call once with the standard prompt, then once more with the strict
/// variant if the first reply cannot be decoded.
pub async fn request_json<T, F>(
    ctx: &RunContext<'_>,
    purpose: CallPurpose,
    model: &str,
    prompt: &str,
    max_tokens: usize,
    decode: F,
) -> Result<JsonReply<T>, StageFailure>
where
    F: Fn(&str) -> Result<Decoded<T>, StageFailure>,
{
    match attempt_json(ctx, purpose, model, prompt, max_tokens, false, &decode).await {
        Ok(d) => Ok(JsonReply {
            value: d.value,
            repaired: d.repaired,
            attempts: 1,
        }),
        Err(first) => {
            debug!("{}: {} on first attempt, retrying strict", purpose, first.kind);
            let strict = strict_variant(prompt);
            attempt_json(ctx, purpose, model, &strict, max_tokens, true, &decode)
                .await
                .map(|d| JsonReply {
                    value: d.value,
                    repaired: d.repaired,
                    attempts: 2,
                })
        }
    }
}

/// A single JSON attempt with no retry.
pub async fn attempt_json<T, F>(
    ctx: &RunContext<'_>,
    purpose: CallPurpose,
    model: &str,
    prompt: &str,
    max_tokens: usize,
    strict: bool,
    decode: &F,
) -> Result<Decoded<T>, StageFailure>
where
    F: Fn(&str) -> Result<Decoded<T>, StageFailure>,
{
    let request = LlmRequest {
        purpose,
        model: model.to_string(),
        prompt: prompt.to_string(),
        max_tokens,
        expects_json: true,
        strict,
    };
    let started = Instant::now();
    let response = ctx.call(&request).await;

    let (output_chars, result) = match response {
        Ok(r) => (r.text.chars().count(), decode(&r.text)),
        Err(e) => (0, Err(StageFailure::from(e))),
    };

    let (outcome, failure_kind, repairs, validation_failures) = match &result {
        Ok(d) if d.repaired => {
            info!(
                request_id = %ctx.request_id,
                "{}: accepted provisional repaired JSON ({})",
                purpose,
                d.repairs.join(", ")
            );
            ("repaired", None, d.repairs.iter().map(|r| r.to_string()).collect(), Vec::new())
        }
        Ok(_) => ("ok", None, Vec::new(), Vec::new()),
        Err(f) => {
            warn!(request_id = %ctx.request_id, kind = %f.kind, "{}: {}", purpose, f.detail);
            ("failed", Some(f.kind), Vec::new(), vec![f.detail.clone()])
        }
    };

    ctx.diagnostics.record(StageAttempt {
        stage: purpose.stage().to_string(),
        label: purpose.to_string(),
        model: model.to_string(),
        strict,
        input_chars: prompt.chars().count(),
        output_chars,
        outcome: outcome.to_string(),
        failure_kind,
        repairs,
        validation_failures,
        duration_ms: started.elapsed().as_millis() as u64,
        at: Utc::now(),
    });

    result
}

/// Plain-text call (the outline). Empty output is a failure.
pub async fn request_text(
    ctx: &RunContext<'_>,
    purpose: CallPurpose,
    model: &str,
    prompt: &str,
    max_tokens: usize,
) -> Result<String, StageFailure> {
    let request = LlmRequest {
        purpose,
        model: model.to_string(),
        prompt: prompt.to_string(),
        max_tokens,
        expects_json: false,
        strict: false,
    };
    let started = Instant::now();
    let result = match ctx.call(&request).await {
        Ok(r) if r.text.trim().is_empty() => Err(StageFailure::new(
            crate::error::FailureKind::Extract,
            "empty model output",
        )),
        Ok(r) => Ok(r.text.trim().to_string()),
        Err(e) => Err(StageFailure::from(e)),
    };

    ctx.diagnostics.record(StageAttempt {
        stage: purpose.stage().to_string(),
        label: purpose.to_string(),
        model: model.to_string(),
        strict: false,
        input_chars: prompt.chars().count(),
        output_chars: result.as_ref().map(|t| t.chars().count()).unwrap_or(0),
        outcome: if result.is_ok() { "ok" } else { "failed" }.to_string(),
        failure_kind: result.as_ref().err().map(|f| f.kind),
        repairs: Vec::new(),
        validation_failures: result.as_ref().err().map(|f| vec![f.detail.clone()]).unwrap_or_default(),
        duration_ms: started.elapsed().as_millis() as u64,
        at: Utc::now(),
    });

    result
}

// ── Test double ──────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = dyn Fn(&LlmRequest) -> Result<String, LlmCallError> + Send + Sync;

    /// Answers each request with a closure and logs `(purpose, strict)`.
    pub struct ScriptedClient {
        responder: Box<Responder>,
        calls: Mutex<Vec<(CallPurpose, bool)>>,
    }

    impl ScriptedClient {
        pub fn new(
            responder: impl Fn(&LlmRequest) -> Result<String, LlmCallError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<(CallPurpose, bool)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&CallPurpose) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|(p, _)| pred(p)).count()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmCallError> {
            self.calls.lock().unwrap().push((request.purpose, request.strict));
            (self.responder)(request).map(|text| LlmResponse {
                text,
                input_tokens: request.prompt.len() / 4,
                output_tokens: 10,
            })
        }
    }

    /// A valid extraction for every slide in `range`.
    pub fn chunk_json(range: ChunkRange) -> String {
        let slides: Vec<serde_json::Value> = (range.start..=range.end)
            .map(|n| {
                serde_json::json!({
                    "slide_number": n,
                    "page_label": format!("Slide {n}"),
                    "title": format!("Topic {n}"),
                    "sections": [{"heading": "Key points", "facts": [format!("Fact from slide {n}")]}],
                    "tables": [],
                    "exam_clues": []
                })
            })
            .collect();
        serde_json::json!({"lecture_title": "Test Lecture", "slides": slides}).to_string()
    }

    pub const TRUNCATED: &str = r#"{"lecture_title": "Test Lecture", "slides": [{"slide_number": 1, "title": "Cut"#;
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::error::FailureKind;
    use crate::pipeline::schema::decode_chunk_output;

    fn ctx<'a>(client: &'a dyn LlmClient, config: &'a GenerationConfig) -> RunContext<'a> {
        RunContext::new("req-test", "doc", client, config, GenerationMode::StudyGuide)
    }

    #[test]
    fn purpose_labels() {
        let p = CallPurpose::ChunkExtract {
            range: ChunkRange::new(13, 18),
        };
        assert_eq!(p.to_string(), "extract 13\u{2013}18");
        assert!(p.is_step_a());
        assert!(!CallPurpose::Plan.is_step_a());
        assert_eq!(CallPurpose::GateRewrite.stage(), "gate_rewrite");
    }

    #[tokio::test]
    async fn json_request_succeeds_first_time() {
        let range = ChunkRange::new(1, 3);
        let client = ScriptedClient::new(move |_| Ok(chunk_json(range)));
        let config = GenerationConfig::default();
        let ctx = ctx(&client, &config);

        let reply = request_json(
            &ctx,
            CallPurpose::ChunkExtract { range },
            "gpt-4.1-mini",
            "prompt",
            1000,
            |raw| decode_chunk_output(raw, range, &[]),
        )
        .await
        .unwrap();

        assert_eq!(reply.attempts, 1);
        assert_eq!(reply.value.slides.len(), 3);
        assert_eq!(ctx.usage.calls(), 1);
        assert_eq!(ctx.usage.step_a(), 1);
        assert_eq!(ctx.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn strict_retry_after_bad_output() {
        let range = ChunkRange::new(1, 2);
        let client = ScriptedClient::new(move |req| {
            if req.strict {
                Ok(chunk_json(range))
            } else {
                Ok("Sure! Here are the facts.".to_string())
            }
        });
        let config = GenerationConfig::default();
        let ctx = ctx(&client, &config);

        let reply = request_json(
            &ctx,
            CallPurpose::ChunkExtract { range },
            "gpt-4.1-mini",
            "prompt",
            1000,
            |raw| decode_chunk_output(raw, range, &[]),
        )
        .await
        .unwrap();
        assert_eq!(reply.attempts, 2);
        assert_eq!(client.calls().iter().map(|(_, s)| *s).collect::<Vec<_>>(), [false, true]);
    }

    #[tokio::test]
    async fn two_failures_return_last_kind() {
        let range = ChunkRange::new(1, 2);
        let client = ScriptedClient::new(|_| Ok(TRUNCATED.to_string()));
        let config = GenerationConfig::default();
        let ctx = ctx(&client, &config);

        let err = request_json(
            &ctx,
            CallPurpose::ChunkExtract { range },
            "gpt-4.1-mini",
            "prompt",
            1000,
            |raw| decode_chunk_output(raw, range, &[]),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, FailureKind::Truncated);
        assert_eq!(ctx.usage.calls(), 2);
        let snap = ctx.diagnostics.snapshot();
        assert!(snap.attempts.iter().all(|a| a.failure_kind == Some(FailureKind::Truncated)));
    }

    #[tokio::test]
    async fn transport_error_is_extract() {
        let client = ScriptedClient::new(|_| {
            Err(LlmCallError::Failed {
                retries: 3,
                detail: "503".into(),
            })
        });
        let config = GenerationConfig::default();
        let ctx = ctx(&client, &config);
        let err = request_text(&ctx, CallPurpose::Outline, "gpt-4.1", "p", 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Extract);
    }

    #[tokio::test]
    async fn empty_text_is_extract_failure() {
        let client = ScriptedClient::new(|_| Ok("   ".into()));
        let config = GenerationConfig::default();
        let ctx = ctx(&client, &config);
        assert!(request_text(&ctx, CallPurpose::Outline, "gpt-4.1", "p", 100).await.is_err());
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(backoff_ms(500, 1), 500);
        assert_eq!(backoff_ms(500, 2), 1000);
        assert_eq!(backoff_ms(500, 3), 2000);
        assert_eq!(backoff_ms(500, 200), MAX_BACKOFF_MS);
        assert_eq!(backoff_ms(u64::MAX, 2), MAX_BACKOFF_MS);
    }

    #[test]
    fn auth_and_size_errors_are_not_retried() {
        assert!(is_retryable("HTTP 429 Too Many Requests"));
        assert!(is_retryable("503 Service Unavailable"));
        assert!(is_retryable("connection reset by peer"));
        assert!(!is_retryable("API error 401: Incorrect API key provided"));
        assert!(!is_retryable("Invalid API key"));
        assert!(!is_retryable("error code: context_length_exceeded"));
    }

        #[test]
    fn unbounded_budget_does_not_overflow() {
        let client = ScriptedClient::new(|_| Ok(String::new()));
        let mut config = GenerationConfig::default();
        config.time_budget_secs = u64::MAX;
        let ctx = ctx(&client, &config);
        assert!(!ctx.time_exhausted());
    }

        #[test]
    fn zero_budget_context_is_exhausted() {
        let client = ScriptedClient::new(|_| Ok(String::new()));
        let mut config = GenerationConfig::default();
        config.time_budget_secs = 0;
        let ctx = ctx(&client, &config);
        assert!(ctx.time_exhausted());
    }
}
