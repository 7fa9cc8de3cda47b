//! Human handoff: live transfer when agents are online, asynchronous
//! ticket (with uploaded recording) when they are not.
//!
//! A session is monitored three ways: keyword scan of each user
//! transcript, a turn ceiling, and an explicit `request_handoff` function
//! call. Whatever fires first wins; once a handoff result is recorded the
//! session suppresses further triggers.

pub mod storage;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aho_corasick::{AhoCorasick, MatchKind};
use serde_json::{json, Value};

use crate::session::TranscriptEntry;
use storage::RecordingUploader;

pub type BoxedFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Speak a short message to the caller (via `provider.send_text`).
pub type SpeakFn = Arc<dyn Fn(String) -> BoxedFuture<()> + Send + Sync>;

/// Attended-transfer the caller to an agent dial string; Ok carries the
/// dial string actually used.
pub type AgentTransferFn =
    Arc<dyn Fn(String) -> BoxedFuture<Result<String, String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub enabled: bool,
    pub keywords: Vec<String>,
    pub max_ai_turns: u32,
    pub fallback_queue_id: Option<i64>,
    pub secretary_id: Option<String>,
    pub company_id: Option<i64>,
    /// Substitute number when the caller id is an internal extension;
    /// empty disables handoff for extensions entirely.
    pub dev_test_number: Option<String>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords: vec![
                "atendente".into(),
                "humano".into(),
                "pessoa".into(),
                "operador".into(),
                "falar com alguém".into(),
            ],
            max_ai_turns: 20,
            fallback_queue_id: None,
            secretary_id: None,
            company_id: None,
            dev_test_number: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffAction {
    Transferred,
    TicketCreated,
    Abandoned,
    Error,
}

impl HandoffAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transferred => "transferred",
            Self::TicketCreated => "ticket_created",
            Self::Abandoned => "abandoned",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub success: bool,
    pub action: HandoffAction,
    pub reason: String,
    pub ticket_id: Option<i64>,
    pub ticket_uuid: Option<String>,
    pub transferred_to: Option<String>,
    pub error: Option<String>,
}

/// Everything the handler needs about the call at trigger time.
pub struct HandoffContext {
    pub reason: String,
    pub caller_number: String,
    pub provider: String,
    pub language: String,
    pub duration_seconds: u64,
    pub avg_latency_ms: Option<f64>,
    pub transcript: Vec<TranscriptEntry>,
    /// Raw recording bytes, if the session captured any.
    pub audio_data: Option<Vec<u8>>,
    /// Pre-uploaded recording, if the platform already has one.
    pub recording_url: Option<String>,
}

/// Answer from the online-agents endpoint.
#[derive(Debug, Clone, Default)]
pub struct AgentsOnline {
    pub has_online_agents: bool,
    pub agent_count: u32,
    pub dial_string: Option<String>,
}

/// HTTP client for the human-agent orchestration API.
pub struct OrchestratorClient {
    base_url: String,
    service_token: Option<String>,
    http: reqwest::Client,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>, service_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            service_token,
            http,
        }
    }

    fn request(
        &self,
        builder: reqwest::RequestBuilder,
        company_id: Option<i64>,
    ) -> reqwest::RequestBuilder {
        let mut builder = builder
            .header("Content-Type", "application/json")
            .header("X-Service-Name", "voice-ai-realtime");
        if let Some(token) = &self.service_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(company) = company_id {
            builder = builder.header("X-Company-Id", company.to_string());
        }
        builder
    }

    /// `GET /api/voice/agents/online` — defaults to nobody-online when
    /// the API is unreachable, so handoff degrades to a ticket.
    pub async fn check_online_agents(
        &self,
        queue_id: Option<i64>,
        company_id: Option<i64>,
    ) -> AgentsOnline {
        let url = format!("{}/api/voice/agents/online", self.base_url);
        let mut builder = self.request(self.http.get(&url), company_id);
        if let Some(queue) = queue_id {
            builder = builder.query(&[("queue_id", queue)]);
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<Value>().await {
                    Ok(data) => AgentsOnline {
                        has_online_agents: data
                            .get("has_online_agents")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                        agent_count: data
                            .get("agent_count")
                            .and_then(Value::as_u64)
                            .unwrap_or(0) as u32,
                        dial_string: data
                            .get("dial_string")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "agents-online response unreadable");
                        AgentsOnline::default()
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "agents-online check failed");
                AgentsOnline::default()
            }
            Err(e) => {
                tracing::error!(error = %e, url = %url, "agents-online request error");
                AgentsOnline::default()
            }
        }
    }

    /// `POST /api/tickets/realtime-handoff`.
    pub async fn create_handoff_ticket(
        &self,
        payload: &Value,
        company_id: Option<i64>,
    ) -> Result<(Option<i64>, Option<String>), String> {
        let url = format!("{}/api/tickets/realtime-handoff", self.base_url);
        let response = self
            .request(self.http.post(&url), company_id)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !(status.is_success()) {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("API error: {status} - {body}"));
        }
        let data: Value = response.json().await.map_err(|e| e.to_string())?;
        Ok((
            data.get("ticket_id").and_then(Value::as_i64),
            data.get("ticket_uuid")
                .and_then(Value::as_str)
                .map(str::to_owned),
        ))
    }
}

pub struct HandoffHandler {
    domain_id: String,
    call_id: String,
    config: HandoffConfig,
    orchestrator: Arc<OrchestratorClient>,
    uploader: Arc<RecordingUploader>,
    keyword_matcher: Option<AhoCorasick>,
    turn_count: AtomicU32,
    initiated: AtomicBool,
}

impl HandoffHandler {
    pub fn new(
        domain_id: impl Into<String>,
        call_id: impl Into<String>,
        config: HandoffConfig,
        orchestrator: Arc<OrchestratorClient>,
        uploader: Arc<RecordingUploader>,
    ) -> Self {
        let keyword_matcher = if config.keywords.is_empty() {
            None
        } else {
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostFirst)
                .build(config.keywords.iter().map(|k| k.to_lowercase()))
                .ok()
        };
        Self {
            domain_id: domain_id.into(),
            call_id: call_id.into(),
            config,
            orchestrator,
            uploader,
            keyword_matcher,
            turn_count: AtomicU32::new(0),
            initiated: AtomicBool::new(false),
        }
    }

    pub fn increment_turn(&self) {
        self.turn_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count.load(Ordering::SeqCst)
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Whether the turn ceiling should be evaluated this turn: after the
    /// 5th user turn every 3rd turn, and always at the hard ceiling.
    pub fn should_check_handoff(&self) -> bool {
        if !self.config.enabled || self.is_initiated() {
            return false;
        }
        let turns = self.turn_count();
        if turns >= 5 && turns % 3 == 0 {
            return true;
        }
        turns >= self.config.max_ai_turns
    }

    /// Turn ceiling reached outright.
    pub fn over_turn_limit(&self) -> bool {
        self.turn_count() >= self.config.max_ai_turns
    }

    /// First configured keyword present in the text, if any.
    pub fn detect_keyword(&self, text: &str) -> Option<String> {
        if !self.config.enabled || self.is_initiated() {
            return None;
        }
        let matcher = self.keyword_matcher.as_ref()?;
        let lower = text.to_lowercase();
        let found = matcher.find(&lower)?;
        Some(self.config.keywords.get(found.pattern().as_usize())?.clone())
    }

    /// Normalise a Brazilian number to E.164 digits (55 + DDD + number).
    /// Extensions and foreign numbers come back cleaned but unchanged.
    pub fn normalize_brazilian_number(number: &str) -> String {
        let clean: String = number.chars().filter(char::is_ascii_digit).collect();
        if clean.starts_with("55") && (clean.len() == 12 || clean.len() == 13) {
            return clean;
        }
        if clean.len() == 10 || clean.len() == 11 {
            return format!("55{clean}");
        }
        clean
    }

    /// Internal extensions are short (≤4 digits) and not dialable outside.
    pub fn is_internal_extension(number: &str) -> bool {
        let clean: String = number.chars().filter(char::is_ascii_digit).collect();
        clean.len() <= 4
    }

    /// One-line ticket summary without an LLM round trip.
    pub fn simple_summary(&self, transcript: &[TranscriptEntry]) -> String {
        let turns = self.turn_count();
        let last_user = transcript
            .iter()
            .rev()
            .find(|entry| entry.role == "user")
            .map(|entry| entry.text.as_str());
        match last_user {
            Some(text) => {
                let truncated: String = if text.chars().count() > 150 {
                    let cut: String = text.chars().take(150).collect();
                    format!("{cut}...")
                } else {
                    text.to_owned()
                };
                format!("Conversa via voz ({turns} turnos). Última mensagem: \"{truncated}\"")
            }
            None if transcript.is_empty() => "Conversa via voz - ver transcrição completa".into(),
            None => format!("Conversa via voz ({turns} turnos) - ver transcrição completa"),
        }
    }

    /// Run the handoff flow. At most one per session: subsequent calls
    /// report an error result without side effects.
    pub async fn initiate(
        &self,
        ctx: HandoffContext,
        speak: SpeakFn,
        transfer: Option<AgentTransferFn>,
    ) -> HandoffResult {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!(call_id = %self.call_id, "handoff already initiated");
            return HandoffResult {
                success: false,
                action: HandoffAction::Error,
                reason: ctx.reason,
                ticket_id: None,
                ticket_uuid: None,
                transferred_to: None,
                error: Some("handoff already initiated".into()),
            };
        }

        // Internal extensions either borrow the test number or abort.
        let caller_number = if Self::is_internal_extension(&ctx.caller_number) {
            match self.config.dev_test_number.clone().filter(|n| !n.is_empty()) {
                Some(test_number) => {
                    tracing::info!(
                        call_id = %self.call_id,
                        original = %ctx.caller_number,
                        test_number = %test_number,
                        "internal extension, substituting test number"
                    );
                    test_number
                }
                None => {
                    tracing::info!(
                        call_id = %self.call_id,
                        caller = %ctx.caller_number,
                        "handoff skipped for internal extension"
                    );
                    return HandoffResult {
                        success: false,
                        action: HandoffAction::Abandoned,
                        reason: ctx.reason,
                        ticket_id: None,
                        ticket_uuid: None,
                        transferred_to: None,
                        error: Some("internal extension".into()),
                    };
                }
            }
        } else {
            Self::normalize_brazilian_number(&ctx.caller_number)
        };

        tracing::info!(
            domain = %self.domain_id,
            call_id = %self.call_id,
            reason = %ctx.reason,
            turns = self.turn_count(),
            caller = %caller_number,
            "initiating handoff"
        );

        let agents = self
            .orchestrator
            .check_online_agents(self.config.fallback_queue_id, self.config.company_id)
            .await;

        if agents.has_online_agents {
            if let (Some(dial_string), Some(transfer)) = (agents.dial_string.clone(), &transfer) {
                speak.as_ref()("Um momento, estou transferindo para um atendente...".into())
                    .await;
                match transfer.as_ref()(dial_string.clone()).await {
                    Ok(target) => {
                        tracing::info!(
                            call_id = %self.call_id,
                            dial_string = %target,
                            "handoff transfer completed"
                        );
                        return HandoffResult {
                            success: true,
                            action: HandoffAction::Transferred,
                            reason: ctx.reason,
                            ticket_id: None,
                            ticket_uuid: None,
                            transferred_to: Some(target),
                            error: None,
                        };
                    }
                    Err(e) => {
                        tracing::error!(call_id = %self.call_id, error = %e, "handoff transfer failed");
                        let reason = format!("{}:transfer_failed", ctx.reason);
                        return self
                            .create_ticket(&ctx, &caller_number, reason, speak)
                            .await;
                    }
                }
            }
        }

        speak.as_ref()(
            "No momento não temos atendentes disponíveis. \
             Vou registrar sua solicitação e entraremos em contato em breve."
                .into(),
        )
        .await;
        let reason = ctx.reason.clone();
        self.create_ticket(&ctx, &caller_number, reason, speak).await
    }

    async fn create_ticket(
        &self,
        ctx: &HandoffContext,
        caller_number: &str,
        reason: String,
        _speak: SpeakFn,
    ) -> HandoffResult {
        // Recording first, so the ticket can link it.
        let recording_url = match &ctx.recording_url {
            Some(url) => Some(url.clone()),
            None => match &ctx.audio_data {
                Some(audio) if !audio.is_empty() => {
                    self.upload_recording(audio.clone()).await
                }
                _ => None,
            },
        };

        let transcript: Vec<Value> = ctx
            .transcript
            .iter()
            .map(|entry| {
                json!({
                    "role": entry.role.clone(),
                    "text": entry.text.clone(),
                    "timestamp": (entry.timestamp * 1000.0) as i64,
                })
            })
            .collect();

        let payload = json!({
            "call_uuid": self.call_id.clone(),
            "caller_id": caller_number,
            "transcript": transcript,
            "summary": self.simple_summary(&ctx.transcript),
            "provider": ctx.provider.clone(),
            "language": ctx.language.clone(),
            "duration_seconds": ctx.duration_seconds,
            "turns": self.turn_count(),
            "avg_latency_ms": ctx.avg_latency_ms,
            "handoff_reason": reason.clone(),
            "queue_id": self.config.fallback_queue_id,
            "secretary_uuid": self.config.secretary_id.clone(),
            "recording_url": recording_url.clone(),
        });

        match self
            .orchestrator
            .create_handoff_ticket(&payload, self.config.company_id)
            .await
        {
            Ok((ticket_id, ticket_uuid)) => {
                tracing::info!(
                    domain = %self.domain_id,
                    call_id = %self.call_id,
                    ticket_id = ?ticket_id,
                    has_recording = recording_url.is_some(),
                    "handoff ticket created"
                );
                HandoffResult {
                    success: true,
                    action: HandoffAction::TicketCreated,
                    reason,
                    ticket_id,
                    ticket_uuid,
                    transferred_to: None,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(call_id = %self.call_id, error = %e, "handoff ticket failed");
                HandoffResult {
                    success: false,
                    action: HandoffAction::Error,
                    reason,
                    ticket_id: None,
                    ticket_uuid: None,
                    transferred_to: None,
                    error: Some(e),
                }
            }
        }
    }

    async fn upload_recording(&self, audio: Vec<u8>) -> Option<String> {
        let company_id = match self.config.company_id {
            Some(id) => id,
            None => {
                tracing::warn!(
                    call_id = %self.call_id,
                    "recording upload skipped: company id not configured"
                );
                return None;
            }
        };
        if !self.uploader.is_available() {
            tracing::warn!(call_id = %self.call_id, "recording upload skipped: storage unavailable");
            return None;
        }

        let metadata = vec![
            ("domain-uuid".to_owned(), self.domain_id.clone()),
            (
                "secretary-uuid".to_owned(),
                self.config.secretary_id.clone().unwrap_or_default(),
            ),
        ];
        match self
            .uploader
            .upload_recording(audio, &self.call_id, company_id, "audio/mpeg", &metadata)
            .await
        {
            Ok(result) => Some(result.url),
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, error = %e, "recording upload failed");
                None
            }
        }
    }
}
