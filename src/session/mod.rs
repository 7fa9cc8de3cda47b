//! Per-call session: the state machine tying provider, audio plane,
//! transcript, transfer and handoff together.
//!
//! ```text
//! Starting ──connect+configure──▸ Active ──fatal/hangup/timeout──▸ Ending ──▸ Ended
//! ```
//!
//! A live session owns one provider connection exclusively, a resampler
//! pair matched to that provider's rates, an optional echo canceller, and
//! a bundle of tasks: the provider event loop and the idle watchdog.
//! Audio output toward the media server flows through an mpsc channel
//! owned by whichever transport (WebSocket or RTP) created the session.

pub mod manager;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::audio::{EchoCanceller, ResamplerPair};
use crate::config::Settings;
use crate::esl::command::EslCommandInterface;
use crate::handoff::{
    AgentTransferFn, HandoffAction, HandoffConfig, HandoffContext, HandoffHandler, HandoffResult,
    SpeakFn,
};
use crate::providers::{
    build_transfer_context, ProviderEvent, ProviderSessionConfig, RealtimeProvider, VadMode,
};
use crate::services::Services;
use crate::store::{ConversationRecord, SecretaryRecord, TransferRule};
use crate::transfer::{TransferDestination, TransferManager, TransferSettings};

/// Watchdog poll period.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Provider connect deadline.
const PROVIDER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before ending the call after `end_call`, so the farewell plays.
const FUNCTION_END_DELAY: Duration = Duration::from_secs(2);

/// Delay before ending after a handoff outcome, for the spoken notice.
const HANDOFF_END_DELAY: Duration = Duration::from_secs(3);

/// Cap on the in-memory caller recording (~5 minutes @16 kHz PCM16).
const MAX_RECORDING_BYTES: usize = 16_000 * 2 * 300;

/// One committed transcript line. Timestamps are epoch seconds and never
/// decrease within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Ending,
    Ended,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session limit exceeded for domain {domain}")]
    TenantLimit { domain: String },
    #[error("global session limit exceeded")]
    GlobalLimit,
    #[error("session already exists: {call_id}")]
    Duplicate { call_id: String },
    #[error("session start failed: {0}")]
    Start(String),
}

/// Immutable per-session configuration snapshot.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub domain_id: String,
    pub call_id: String,
    pub caller_id: String,
    pub secretary_id: String,
    pub secretary_name: String,
    pub provider_name: String,
    pub system_prompt: String,
    pub greeting: Option<String>,
    pub farewell: Option<String>,
    pub voice: String,
    pub language: String,
    pub vad: Option<VadMode>,
    pub media_sample_rate: u32,
    pub idle_timeout: Duration,
    pub max_duration: Duration,
    pub fallback_providers: Vec<String>,
    pub barge_in_enabled: bool,
    pub audio_warmup_ms: u32,
    pub echo_cancel_enabled: bool,
    pub record_call: bool,
    pub tools: Vec<Value>,
    pub max_response_output_tokens: Option<u32>,
    pub handoff: HandoffConfig,
    pub transfer: TransferSettings,
}

impl SessionConfig {
    /// Materialise a session config from a secretary record plus the
    /// tenant's transfer rules (rendered into the prompt).
    pub fn from_secretary(
        record: &SecretaryRecord,
        call_id: &str,
        caller_id: &str,
        rules: &[TransferRule],
        settings: &Settings,
    ) -> Self {
        let mut system_prompt = record.system_prompt.clone();
        system_prompt.push_str(&build_transfer_context(rules, &record.language));

        Self {
            domain_id: record.domain_id.clone(),
            call_id: call_id.to_owned(),
            caller_id: caller_id.to_owned(),
            secretary_id: record.secretary_id.clone(),
            secretary_name: record.name.clone(),
            provider_name: record
                .realtime_provider
                .clone()
                .unwrap_or_else(|| "openai".into()),
            system_prompt,
            greeting: Some(record.greeting_message.clone()).filter(|g| !g.is_empty()),
            farewell: Some(record.farewell_message.clone()).filter(|f| !f.is_empty()),
            voice: record.voice.clone(),
            language: record.language.clone(),
            vad: None,
            media_sample_rate: settings.media_sample_rate,
            idle_timeout: Duration::from_secs(record.idle_timeout_seconds),
            max_duration: Duration::from_secs(record.max_duration_seconds),
            fallback_providers: record.fallback_providers.clone(),
            barge_in_enabled: true,
            audio_warmup_ms: record.audio_warmup_ms,
            echo_cancel_enabled: false,
            record_call: true,
            tools: Vec::new(),
            max_response_output_tokens: Some(4096),
            handoff: HandoffConfig {
                keywords: settings.handoff_keywords.clone(),
                max_ai_turns: record.max_turns,
                secretary_id: Some(record.secretary_id.clone()),
                dev_test_number: settings.dev_test_number.clone(),
                ..HandoffConfig::default()
            },
            transfer: TransferSettings {
                default_timeout_seconds: settings.transfer_default_timeout,
                music_on_hold: settings.transfer_music_on_hold.clone(),
                announce_enabled: settings.transfer_announce_enabled,
                ..TransferSettings::default()
            },
        }
    }
}

/// CPU-side audio state, owned by the session and never shared.
struct AudioPlane {
    pair: ResamplerPair,
    aec: Option<EchoCanceller>,
}

/// Outcome of handling one provider event.
enum Flow {
    Continue,
    /// Provider was swapped (fallback/rotation); re-enter the loop.
    Swapped,
    Stop,
}

struct SessionShared {
    config: SessionConfig,
    services: Arc<Services>,
    esl: Arc<dyn EslCommandInterface>,
    provider: tokio::sync::RwLock<Option<Arc<dyn RealtimeProvider>>>,
    current_provider_name: parking_lot::Mutex<String>,
    audio: parking_lot::Mutex<Option<AudioPlane>>,
    state: parking_lot::Mutex<SessionState>,
    assistant_speaking: AtomicBool,
    user_speaking: AtomicBool,
    transcript: parking_lot::Mutex<Vec<TranscriptEntry>>,
    partial_assistant: parking_lot::Mutex<String>,
    started_at: chrono::DateTime<Utc>,
    started_instant: Instant,
    last_activity: parking_lot::Mutex<Instant>,
    speech_started_at: parking_lot::Mutex<Option<Instant>>,
    audio_out: mpsc::Sender<Vec<u8>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    fallback_index: AtomicUsize,
    fallback_active: AtomicBool,
    handoff: Arc<HandoffHandler>,
    handoff_result: parking_lot::Mutex<Option<HandoffResult>>,
    transfer: Arc<TransferManager>,
    recording: parking_lot::Mutex<Vec<u8>>,
    ended_tx: mpsc::UnboundedSender<(String, String)>,
    stop_reason: parking_lot::Mutex<Option<String>>,
}

/// Cheap cloneable handle; the manager holds one per live call.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.config.call_id)
            .finish_non_exhaustive()
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Session {
    pub fn new(
        config: SessionConfig,
        services: Arc<Services>,
        esl: Arc<dyn EslCommandInterface>,
        audio_out: mpsc::Sender<Vec<u8>>,
        ended_tx: mpsc::UnboundedSender<(String, String)>,
    ) -> Self {
        let handoff = Arc::new(HandoffHandler::new(
            config.domain_id.clone(),
            config.call_id.clone(),
            config.handoff.clone(),
            Arc::clone(&services.orchestrator),
            Arc::clone(&services.uploader),
        ));
        let transfer = Arc::new(TransferManager::new(
            config.domain_id.clone(),
            config.call_id.clone(),
            config.caller_id.clone(),
            Some(config.secretary_id.clone()),
            Arc::clone(&esl),
            Arc::clone(&services.config),
            config.transfer.clone(),
            Some(Arc::clone(&services.announce_tts)),
            Some(config.voice.clone()),
        ));

        Self {
            shared: Arc::new(SessionShared {
                current_provider_name: parking_lot::Mutex::new(config.provider_name.clone()),
                config,
                services,
                esl,
                provider: tokio::sync::RwLock::new(None),
                audio: parking_lot::Mutex::new(None),
                state: parking_lot::Mutex::new(SessionState::Starting),
                assistant_speaking: AtomicBool::new(false),
                user_speaking: AtomicBool::new(false),
                transcript: parking_lot::Mutex::new(Vec::new()),
                partial_assistant: parking_lot::Mutex::new(String::new()),
                started_at: Utc::now(),
                started_instant: Instant::now(),
                last_activity: parking_lot::Mutex::new(Instant::now()),
                speech_started_at: parking_lot::Mutex::new(None),
                audio_out,
                tasks: parking_lot::Mutex::new(Vec::new()),
                fallback_index: AtomicUsize::new(0),
                fallback_active: AtomicBool::new(false),
                handoff,
                handoff_result: parking_lot::Mutex::new(None),
                transfer,
                recording: parking_lot::Mutex::new(Vec::new()),
                ended_tx,
                stop_reason: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.shared.config.call_id
    }

    pub fn domain_id(&self) -> &str {
        &self.shared.config.domain_id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), SessionState::Active)
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.transcript.lock().clone()
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.shared.stop_reason.lock().clone()
    }

    pub fn idle_for(&self) -> Duration {
        self.shared.last_activity.lock().elapsed()
    }

    pub fn transfer_manager(&self) -> Arc<TransferManager> {
        Arc::clone(&self.shared.transfer)
    }

    pub fn handoff_result(&self) -> Option<HandoffResult> {
        self.shared.handoff_result.lock().clone()
    }

    /// Connect and configure the provider, then bring up the task bundle.
    pub async fn start(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        if !matches!(*shared.state.lock(), SessionState::Starting) {
            return Ok(());
        }

        shared.services.metrics.session_started(
            &shared.config.domain_id,
            &shared.config.call_id,
            &shared.config.provider_name,
        );

        match shared.connect_provider(&shared.config.provider_name.clone()).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!(
                    call_id = %shared.config.call_id,
                    error = %e,
                    "session start failed"
                );
                self.stop("error").await;
                return Err(SessionError::Start(e));
            }
        }

        *shared.state.lock() = SessionState::Active;

        let loop_shared = Arc::clone(shared);
        let watchdog_shared = Arc::clone(shared);
        let mut tasks = shared.tasks.lock();
        tasks.push(tokio::spawn(async move {
            SessionShared::event_loop(loop_shared).await;
        }));
        tasks.push(tokio::spawn(async move {
            SessionShared::watchdog(watchdog_shared).await;
        }));
        drop(tasks);

        tracing::info!(
            call_id = %shared.config.call_id,
            domain = %shared.config.domain_id,
            provider = %shared.config.provider_name,
            "realtime session started"
        );
        Ok(())
    }

    /// Caller PCM from the media transport.
    pub async fn handle_audio_input(&self, audio: &[u8]) {
        let shared = &self.shared;
        if !self.is_active() || audio.is_empty() {
            return;
        }
        *shared.last_activity.lock() = Instant::now();
        shared
            .services
            .metrics
            .record_audio(&shared.config.call_id, "in", audio.len());

        let processed = {
            let mut plane = shared.audio.lock();
            let Some(plane) = plane.as_mut() else {
                return;
            };
            let cleaned = match plane.aec.as_mut() {
                Some(aec) => aec.process(audio),
                None => audio.to_vec(),
            };
            if shared.config.record_call {
                let mut recording = shared.recording.lock();
                if recording.len() < MAX_RECORDING_BYTES {
                    recording.extend_from_slice(&cleaned);
                }
            }
            if plane.pair.input_needs_resample() {
                plane.pair.resample_input(&cleaned)
            } else {
                cleaned
            }
        };

        let provider = shared.provider.read().await.clone();
        if let Some(provider) = provider {
            if let Err(e) = provider.send_audio(&processed).await {
                tracing::warn!(call_id = %shared.config.call_id, error = %e, "audio forward failed");
            }
        }
    }

    /// DTMF relayed from the media transport or the ESL relay.
    pub async fn handle_dtmf(&self, digit: &str) {
        *self.shared.last_activity.lock() = Instant::now();
        tracing::debug!(call_id = %self.shared.config.call_id, digit, "dtmf received");
    }

    /// Caller hangup observed by the media transport or ESL relay.
    pub async fn handle_hangup(&self) {
        self.shared.transfer.handle_caller_hangup().await;
        self.stop("hangup").await;
    }

    /// Terminate the session. Idempotent; the first caller wins.
    pub async fn stop(&self, reason: &str) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, SessionState::Ending | SessionState::Ended) {
                return;
            }
            *state = SessionState::Ending;
        }
        *self.shared.stop_reason.lock() = Some(reason.to_owned());

        let shared = Arc::clone(&self.shared);
        let reason = reason.to_owned();
        // Cleanup runs detached so a session task calling stop() can be
        // aborted without losing the teardown.
        let cleanup = tokio::spawn(async move {
            shared.finish(&reason).await;
        });
        let _ = cleanup.await;
    }
}

impl SessionShared {
    fn is_active(&self) -> bool {
        matches!(*self.state.lock(), SessionState::Active)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Next transcript timestamp: wall clock, clamped monotonic.
    fn next_timestamp(&self) -> f64 {
        let now = epoch_seconds();
        let transcript = self.transcript.lock();
        match transcript.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }

    fn commit_transcript(&self, role: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let entry = TranscriptEntry {
            role: role.to_owned(),
            text: text.to_owned(),
            timestamp: self.next_timestamp(),
        };
        tracing::info!(
            call_id = %self.config.call_id,
            role,
            text = %text.chars().take(120).collect::<String>(),
            "transcript"
        );
        self.transcript.lock().push(entry);
    }

    async fn current_provider(&self) -> Option<Arc<dyn RealtimeProvider>> {
        self.provider.read().await.clone()
    }

    fn provider_session_config(&self) -> ProviderSessionConfig {
        ProviderSessionConfig {
            domain_id: self.config.domain_id.clone(),
            call_id: self.config.call_id.clone(),
            secretary_id: Some(self.config.secretary_id.clone()),
            system_prompt: self.config.system_prompt.clone(),
            first_message: self.config.greeting.clone(),
            voice: self.config.voice.clone(),
            language: self.config.language.clone(),
            vad: self.config.vad.clone(),
            tools: self.config.tools.clone(),
            temperature: None,
            max_response_output_tokens: self.config.max_response_output_tokens,
        }
    }

    /// Create, connect and configure a provider, then install it together
    /// with a freshly matched audio plane. The previous provider (if any)
    /// is disconnected first, so per call there is never more than one
    /// open provider connection.
    async fn connect_provider(&self, provider_name: &str) -> Result<(), String> {
        let credentials = self
            .services
            .config
            .provider_credentials(&self.config.domain_id, "realtime", Some(provider_name))
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("provider '{provider_name}' not configured"))?;

        let factory = self.services.provider_factory.as_ref();
        let mut provider = factory(provider_name, &credentials, self.provider_session_config())
            .map_err(|e| e.to_string())?;

        if let Some(old) = self.provider.write().await.take() {
            old.disconnect().await;
        }

        tokio::time::timeout(PROVIDER_CONNECT_TIMEOUT, provider.connect())
            .await
            .map_err(|_| "provider connect timeout".to_owned())?
            .map_err(|e| e.to_string())?;
        provider.configure().await.map_err(|e| e.to_string())?;

        let input_rate = provider.input_sample_rate();
        let output_rate = provider.output_sample_rate();
        {
            let mut plane = self.audio.lock();
            let aec = if self.config.echo_cancel_enabled {
                Some(EchoCanceller::new(self.config.media_sample_rate, 20, 128, true))
            } else {
                None
            };
            *plane = Some(AudioPlane {
                pair: ResamplerPair::new(
                    self.config.media_sample_rate,
                    input_rate,
                    output_rate,
                    self.config.audio_warmup_ms,
                ),
                aec,
            });
        }

        let provider: Arc<dyn RealtimeProvider> = Arc::from(provider);
        *self.current_provider_name.lock() = provider_name.to_owned();
        *self.provider.write().await = Some(provider);

        tracing::info!(
            call_id = %self.config.call_id,
            provider = provider_name,
            input_rate,
            output_rate,
            "provider connected"
        );
        Ok(())
    }

    async fn event_loop(shared: Arc<Self>) {
        loop {
            let Some(provider) = shared.current_provider().await else {
                return;
            };
            let mut swapped = false;
            while let Some(event) = provider.next_event().await {
                match shared.handle_event(event).await {
                    Flow::Continue => {}
                    Flow::Swapped => {
                        swapped = true;
                        break;
                    }
                    Flow::Stop => return,
                }
                if !shared.is_active() {
                    return;
                }
            }
            if swapped {
                continue;
            }
            // Stream drained without a terminal event: treat as closure.
            if shared.is_active() {
                if shared.try_fallback("provider_closed").await {
                    continue;
                }
                shared.stop_from_task("provider_ended");
            }
            return;
        }
    }

    async fn watchdog(shared: Arc<Self>) {
        let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !shared.is_active() {
                return;
            }
            let idle = shared.last_activity.lock().elapsed();
            if idle > shared.config.idle_timeout {
                tracing::info!(
                    call_id = %shared.config.call_id,
                    idle_seconds = idle.as_secs(),
                    "idle timeout"
                );
                shared.stop_from_task("idle_timeout");
                return;
            }
            if shared.started_instant.elapsed() > shared.config.max_duration {
                tracing::info!(call_id = %shared.config.call_id, "max duration reached");
                shared.stop_from_task("max_duration");
                return;
            }
        }
    }

    /// Initiate termination from inside a session task. The cleanup runs
    /// detached because it aborts the very task that called this.
    fn stop_from_task(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Ending | SessionState::Ended) {
                return;
            }
            *state = SessionState::Ending;
        }
        *self.stop_reason.lock() = Some(reason.to_owned());
        let this = Arc::clone(self);
        let reason = reason.to_owned();
        tokio::spawn(async move {
            this.finish(&reason).await;
        });
    }

    async fn finish(&self, reason: &str) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(provider) = self.provider.write().await.take() {
            provider.disconnect().await;
        }

        self.services
            .metrics
            .session_ended(&self.config.call_id, reason);
        self.persist_conversation(reason).await;

        *self.state.lock() = SessionState::Ended;
        let _ = self
            .ended_tx
            .send((self.config.call_id.clone(), reason.to_owned()));

        tracing::info!(
            call_id = %self.config.call_id,
            domain = %self.config.domain_id,
            reason,
            "realtime session stopped"
        );
    }

    /// Write the conversation header + messages. Failure is logged and
    /// never blocks teardown.
    async fn persist_conversation(&self, reason: &str) {
        let record = ConversationRecord {
            call_id: self.config.call_id.clone(),
            domain_id: self.config.domain_id.clone(),
            secretary_id: self.config.secretary_id.clone(),
            caller_id: self.config.caller_id.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            final_action: reason.to_owned(),
            processing_mode: "realtime".into(),
        };
        let messages = self.transcript.lock().clone();
        if let Err(e) = self
            .services
            .conversations
            .save_conversation(&record, &messages)
            .await
        {
            tracing::error!(
                call_id = %self.config.call_id,
                error = %e,
                "failed to persist conversation"
            );
        }
    }

    // ── Provider event table ─────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, event: ProviderEvent) -> Flow {
        self.touch();

        match event {
            ProviderEvent::ResponseStarted => {
                // Each response turn warms up independently.
                if let Some(plane) = self.audio.lock().as_mut() {
                    plane.pair.reset_output_buffer();
                }
                Flow::Continue
            }

            ProviderEvent::AudioDelta { audio } => {
                self.assistant_speaking.store(true, Ordering::SeqCst);
                if audio.is_empty() {
                    return Flow::Continue;
                }
                let emit = {
                    let mut plane = self.audio.lock();
                    match plane.as_mut() {
                        Some(plane) => {
                            let emit = plane.pair.resample_output(&audio);
                            if !emit.is_empty() {
                                if let Some(aec) = plane.aec.as_mut() {
                                    aec.add_reference(&emit);
                                }
                            }
                            emit
                        }
                        None => audio,
                    }
                };
                if !emit.is_empty() {
                    self.services
                        .metrics
                        .record_audio(&self.config.call_id, "out", emit.len());
                    if self.audio_out.send(emit).await.is_err() {
                        tracing::debug!(call_id = %self.config.call_id, "audio sink closed");
                    }
                }
                Flow::Continue
            }

            ProviderEvent::AudioDone => {
                self.assistant_speaking.store(false, Ordering::SeqCst);
                let residue = {
                    let mut plane = self.audio.lock();
                    match plane.as_mut() {
                        Some(plane) => {
                            let residue = plane.pair.flush_output();
                            if !residue.is_empty() {
                                if let Some(aec) = plane.aec.as_mut() {
                                    aec.add_reference(&residue);
                                }
                            }
                            residue
                        }
                        None => Vec::new(),
                    }
                };
                if !residue.is_empty() {
                    self.services
                        .metrics
                        .record_audio(&self.config.call_id, "out", residue.len());
                    let _ = self.audio_out.send(residue).await;
                }
                Flow::Continue
            }

            ProviderEvent::TranscriptDelta { text } => {
                self.partial_assistant.lock().push_str(&text);
                Flow::Continue
            }

            ProviderEvent::TranscriptDone { text } => {
                let accumulated = std::mem::take(&mut *self.partial_assistant.lock());
                let final_text = if accumulated.is_empty() { text } else { accumulated };
                self.commit_transcript("assistant", &final_text);
                Flow::Continue
            }

            ProviderEvent::UserTranscript { text } => {
                self.commit_transcript("user", &text);
                self.check_handoff_triggers(&text).await;
                Flow::Continue
            }

            ProviderEvent::SpeechStarted => {
                self.user_speaking.store(true, Ordering::SeqCst);
                *self.speech_started_at.lock() = Some(Instant::now());
                if self.assistant_speaking.load(Ordering::SeqCst) {
                    self.barge_in().await;
                }
                Flow::Continue
            }

            ProviderEvent::SpeechStopped => {
                self.user_speaking.store(false, Ordering::SeqCst);
                Flow::Continue
            }

            ProviderEvent::ResponseDone { .. } => {
                if let Some(started) = self.speech_started_at.lock().take() {
                    self.services
                        .metrics
                        .record_latency(&self.config.call_id, started.elapsed().as_secs_f64());
                }
                Flow::Continue
            }

            ProviderEvent::Interrupted => {
                self.assistant_speaking.store(false, Ordering::SeqCst);
                Flow::Continue
            }

            ProviderEvent::FunctionCall {
                name,
                arguments,
                call_id,
            } => {
                self.handle_function_call(&name, arguments, &call_id).await;
                Flow::Continue
            }

            ProviderEvent::SessionExpiring { remaining_seconds } => {
                tracing::warn!(
                    call_id = %self.config.call_id,
                    remaining_seconds,
                    "provider session expiring, rotating"
                );
                let current = self.current_provider_name.lock().clone();
                if self.connect_provider(&current).await.is_ok() {
                    self.clear_speaking_flags();
                    return Flow::Swapped;
                }
                if self.try_fallback("session_expiring").await {
                    return Flow::Swapped;
                }
                self.stop_from_task("provider_expired");
                Flow::Stop
            }

            ProviderEvent::RateLimited { .. } => self.fatal("provider_rate_limited").await,
            ProviderEvent::Error { code, message } => {
                tracing::error!(
                    call_id = %self.config.call_id,
                    code = %code,
                    message = %message,
                    "provider error"
                );
                self.fatal("provider_error").await
            }
            ProviderEvent::SessionEnded { reason } => {
                tracing::info!(call_id = %self.config.call_id, reason = %reason, "provider ended session");
                self.fatal("provider_ended").await
            }
        }
    }

    async fn fatal(self: &Arc<Self>, reason: &str) -> Flow {
        if self.try_fallback(reason).await {
            Flow::Swapped
        } else {
            self.stop_from_task(reason);
            Flow::Stop
        }
    }

    fn clear_speaking_flags(&self) {
        self.assistant_speaking.store(false, Ordering::SeqCst);
        self.user_speaking.store(false, Ordering::SeqCst);
    }

    /// Barge-in: interrupt the provider and break media-server playback.
    async fn barge_in(&self) {
        if let Some(provider) = self.current_provider().await {
            if let Err(e) = provider.interrupt().await {
                tracing::debug!(call_id = %self.config.call_id, error = %e, "interrupt failed");
            }
        }
        if self.config.barge_in_enabled {
            self.esl.uuid_break(&self.config.call_id).await;
        }
        self.services.metrics.record_barge_in(&self.config.call_id);
        tracing::debug!(call_id = %self.config.call_id, "barge-in");
    }

    /// Walk the fallback provider list; true when a replacement is live.
    async fn try_fallback(self: &Arc<Self>, reason: &str) -> bool {
        if self.config.fallback_providers.is_empty() {
            return false;
        }
        if self
            .fallback_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let result = async {
            loop {
                let index = self.fallback_index.fetch_add(1, Ordering::SeqCst);
                let Some(candidate) = self.config.fallback_providers.get(index) else {
                    return false;
                };
                let current = self.current_provider_name.lock().clone();
                if candidate.is_empty() || *candidate == current {
                    continue;
                }

                tracing::warn!(
                    call_id = %self.config.call_id,
                    from = %current,
                    to = %candidate,
                    reason,
                    "attempting provider fallback"
                );

                match self.connect_provider(candidate).await {
                    Ok(()) => {
                        self.clear_speaking_flags();
                        self.services
                            .metrics
                            .update_provider(&self.config.call_id, candidate);
                        tracing::info!(
                            call_id = %self.config.call_id,
                            provider = %candidate,
                            "fallback provider activated"
                        );
                        return true;
                    }
                    Err(e) => {
                        tracing::error!(
                            call_id = %self.config.call_id,
                            provider = %candidate,
                            error = %e,
                            "fallback provider failed"
                        );
                        continue;
                    }
                }
            }
        }
        .await;

        self.fallback_active.store(false, Ordering::SeqCst);
        result
    }

    // ── Function calling ─────────────────────────────────────────────

    async fn handle_function_call(self: &Arc<Self>, name: &str, arguments: Value, call_id: &str) {
        tracing::info!(
            call_id = %self.config.call_id,
            function = name,
            "function call"
        );
        let result = self.execute_function(name, &arguments).await;
        if let Some(provider) = self.current_provider().await {
            if let Err(e) = provider.send_function_result(name, result, call_id).await {
                tracing::warn!(call_id = %self.config.call_id, error = %e, "function result send failed");
            }
        }
    }

    async fn execute_function(self: &Arc<Self>, name: &str, args: &Value) -> Value {
        match name {
            "transfer_call" => self.function_transfer_call(args).await,
            "end_call" => {
                self.schedule_stop(FUNCTION_END_DELAY, "function_end");
                json!({ "status": "ending" })
            }
            "request_handoff" => {
                self.initiate_handoff("llm_intent").await;
                json!({ "status": "handoff_initiated" })
            }
            _ => json!({ "error": format!("Unknown function: {name}") }),
        }
    }

    async fn function_transfer_call(self: &Arc<Self>, args: &Value) -> Value {
        let destination_arg = args
            .get("destination")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_owned();
        let department = args
            .get("department")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_owned();

        // A pure number is dialed directly; anything else resolves
        // through the tenant's transfer rules.
        let destination = if !destination_arg.is_empty()
            && destination_arg.chars().all(|c| c.is_ascii_digit())
        {
            let display = if department.is_empty() {
                destination_arg.clone()
            } else {
                department.clone()
            };
            Ok(TransferDestination::from_extension(
                &destination_arg,
                &display,
                "default",
            ))
        } else {
            let text = if department.is_empty() {
                destination_arg.clone()
            } else {
                department.clone()
            };
            self.transfer.resolve_destination(&text).await
        };

        let destination = match destination {
            Ok(dest) => dest,
            Err(message) => {
                self.speak(&message).await;
                return json!({ "status": "not_found", "message": message });
            }
        };

        let result = if self.config.transfer.announce_enabled {
            let announcement = format!(
                "Tenho {} na linha para {}",
                self.config.caller_id, destination.name
            );
            self.transfer
                .execute_announced_transfer(&destination, &announcement, 30, None)
                .await
        } else {
            self.transfer
                .execute_attended_transfer(&destination, None, true)
                .await
        };

        if result.success() {
            self.schedule_stop(Duration::from_secs(1), "transferred");
            json!({ "status": "transferred", "destination": destination.name })
        } else {
            let message = result.message();
            self.speak(&message).await;
            json!({
                "status": format!("{:?}", result.status).to_lowercase(),
                "message": message,
            })
        }
    }

    fn schedule_stop(self: &Arc<Self>, delay: Duration, reason: &'static str) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.is_active() {
                {
                    let mut state = shared.state.lock();
                    if matches!(*state, SessionState::Ending | SessionState::Ended) {
                        return;
                    }
                    *state = SessionState::Ending;
                }
                *shared.stop_reason.lock() = Some(reason.to_owned());
                shared.finish(reason).await;
            }
        });
    }

    async fn speak(&self, text: &str) {
        if let Some(provider) = self.current_provider().await {
            if let Err(e) = provider.send_text(text).await {
                tracing::debug!(call_id = %self.config.call_id, error = %e, "speak failed");
            }
        }
    }

    // ── Handoff ──────────────────────────────────────────────────────

    async fn check_handoff_triggers(self: &Arc<Self>, user_text: &str) {
        if self.handoff_result.lock().is_some() || !self.config.handoff.enabled {
            return;
        }
        self.handoff.increment_turn();

        if let Some(keyword) = self.handoff.detect_keyword(user_text) {
            tracing::info!(
                call_id = %self.config.call_id,
                keyword = %keyword,
                "handoff keyword detected"
            );
            self.initiate_handoff(&format!("keyword_match:{keyword}")).await;
            return;
        }

        // The cadence gate limits how often the ceiling is evaluated;
        // the ceiling itself decides.
        if self.handoff.should_check_handoff() && self.handoff.over_turn_limit() {
            tracing::info!(call_id = %self.config.call_id, "max ai turns reached");
            self.initiate_handoff("max_turns_exceeded").await;
        }
    }

    async fn initiate_handoff(self: &Arc<Self>, reason: &str) {
        if self.handoff_result.lock().is_some() {
            return;
        }

        let recording = {
            let recording = self.recording.lock();
            if recording.is_empty() {
                None
            } else {
                Some(recording.clone())
            }
        };
        let ctx = HandoffContext {
            reason: reason.to_owned(),
            caller_number: self.config.caller_id.clone(),
            provider: self.current_provider_name.lock().clone(),
            language: self.config.language.clone(),
            duration_seconds: self.started_instant.elapsed().as_secs(),
            avg_latency_ms: self.services.metrics.avg_latency_ms(&self.config.call_id),
            transcript: self.transcript.lock().clone(),
            audio_data: recording,
            recording_url: None,
        };

        let speak_shared = Arc::clone(self);
        let speak: SpeakFn = Arc::new(
            move |text: String| -> crate::handoff::BoxedFuture<()> {
                let shared = Arc::clone(&speak_shared);
                Box::pin(async move {
                    shared.speak(&text).await;
                })
            },
        );

        let transfer_shared = Arc::clone(self);
        let transfer: AgentTransferFn = Arc::new(
            move |dial_string: String| -> crate::handoff::BoxedFuture<Result<String, String>> {
                let shared = Arc::clone(&transfer_shared);
                Box::pin(async move {
                    let destination =
                        TransferDestination::from_dial_string(&dial_string, "Atendente");
                    let result = shared
                        .transfer
                        .execute_attended_transfer(&destination, None, false)
                        .await;
                    if result.success() {
                        Ok(dial_string)
                    } else {
                        Err(result.message())
                    }
                })
            },
        );

        let result = self.handoff.initiate(ctx, speak, Some(transfer)).await;
        tracing::info!(
            call_id = %self.config.call_id,
            action = result.action.as_str(),
            ticket_id = ?result.ticket_id,
            "handoff completed"
        );

        let action = result.action;
        *self.handoff_result.lock() = Some(result);

        match action {
            HandoffAction::Transferred => {
                self.schedule_stop(HANDOFF_END_DELAY, "handoff_transferred");
            }
            HandoffAction::TicketCreated => {
                self.schedule_stop(HANDOFF_END_DELAY, "handoff_ticket_created");
            }
            HandoffAction::Abandoned | HandoffAction::Error => {
                // The call continues; the assistant can try another path.
            }
        }
    }
}
