//! OpenAI Realtime API adapter.
//!
//! ## Protocol
//!
//! 1. **Connect** — WebSocket to `wss://api.openai.com/v1/realtime?model=…`
//!    with bearer auth; the first server frame must be `session.created`.
//! 2. **Configure** — `session.update` with instructions, pcm16 formats,
//!    voice, whisper-1 input transcription, tools and a turn-detection
//!    block (server VAD, semantic VAD, or none for push-to-talk).
//! 3. **Stream** — `input_audio_buffer.append` (base64 PCM16 @24 kHz) in,
//!    `response.output_audio.delta` (base64 PCM16 @24 kHz) out.
//!
//! The provider imposes a 60-minute session ceiling; the adapter tracks
//! elapsed time and emits [`ProviderEvent::SessionExpiring`] when less
//! than a minute remains so the session can rotate preemptively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::credentials::OpenAiCredentials;
use super::{
    EventQueue, ProviderError, ProviderEvent, ProviderResult, ProviderSessionConfig,
    RealtimeProvider, SharedSink, VadMode, WsSource,
};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Handshake read timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider ceiling is 60 minutes; keep a safety margin so rotation
/// happens on our schedule, not the provider's.
const MAX_SESSION_SECONDS: u64 = 55 * 60;

/// Emit `SessionExpiring` when this little time remains.
const EXPIRY_WARNING_SECONDS: u64 = 60;

/// Error codes that occur in normal operation and carry no signal.
const BENIGN_ERROR_CODES: &[&str] = &[
    "response_cancel_not_active",
    "conversation_already_has_active_response",
];

pub struct OpenAiRealtimeProvider {
    credentials: OpenAiCredentials,
    config: ProviderSessionConfig,
    connected: AtomicBool,
    sink: parking_lot::Mutex<Option<SharedSink>>,
    events: EventQueue,
    recv_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    session_id: parking_lot::Mutex<Option<String>>,
    session_started: parking_lot::Mutex<Option<Instant>>,
    expiry_warned: AtomicBool,
}

impl OpenAiRealtimeProvider {
    pub fn new(credentials: OpenAiCredentials, config: ProviderSessionConfig) -> Self {
        Self {
            credentials,
            config,
            connected: AtomicBool::new(false),
            sink: parking_lot::Mutex::new(None),
            events: EventQueue::new(256),
            recv_task: parking_lot::Mutex::new(None),
            session_id: parking_lot::Mutex::new(None),
            session_started: parking_lot::Mutex::new(None),
            expiry_warned: AtomicBool::new(false),
        }
    }

    fn sink_handle(&self) -> ProviderResult<SharedSink> {
        self.sink
            .lock()
            .as_ref()
            .cloned()
            .ok_or(ProviderError::NotConnected)
    }

    async fn send_json(&self, payload: &Value) -> ProviderResult<()> {
        let sink = self.sink_handle()?;
        let text = payload.to_string();
        let result = sink
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()));
        result
    }

    fn remaining_seconds(&self) -> Option<u64> {
        let started = (*self.session_started.lock())?;
        let elapsed = started.elapsed().as_secs();
        Some(MAX_SESSION_SECONDS.saturating_sub(elapsed))
    }

    async fn receive_loop(
        mut source: WsSource,
        events: mpsc::Sender<ProviderEvent>,
        call_id: String,
    ) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    let parsed: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(call_id = %call_id, error = %e, "unparseable openai frame, dropping");
                            continue;
                        }
                    };
                    if let Some(event) = parse_event(&parsed) {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(call_id = %call_id, close_frame = ?frame, "openai connection closed");
                    let _ = events
                        .send(ProviderEvent::SessionEnded {
                            reason: "closed".into(),
                        })
                        .await;
                    return;
                }
                Ok(_) => {
                    // Ping/pong handled by tungstenite; binary unexpected.
                }
                Err(e) => {
                    tracing::error!(call_id = %call_id, error = %e, "openai websocket error");
                    let _ = events
                        .send(ProviderEvent::Error {
                            code: "transport".into(),
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
        let _ = events
            .send(ProviderEvent::SessionEnded {
                reason: "closed".into(),
            })
            .await;
    }
}

#[async_trait]
impl RealtimeProvider for OpenAiRealtimeProvider {
    fn name(&self) -> &'static str {
        "openai_realtime"
    }

    fn input_sample_rate(&self) -> u32 {
        24_000
    }

    fn output_sample_rate(&self) -> u32 {
        24_000
    }

    async fn connect(&mut self) -> ProviderResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = format!("{REALTIME_URL}?model={}", self.credentials.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::Handshake(format!("bad request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.credentials.api_key)
                .parse()
                .map_err(|_| ProviderError::Handshake("invalid auth header".into()))?,
        );
        if self.credentials.model.contains("preview") {
            request.headers_mut().insert(
                "OpenAI-Beta",
                "realtime=v1"
                    .parse()
                    .map_err(|_| ProviderError::Handshake("invalid header".into()))?,
            );
        }

        tracing::info!(
            call_id = %self.config.call_id,
            domain = %self.config.domain_id,
            model = %self.credentials.model,
            "connecting to openai realtime"
        );

        let (mut ws, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| ProviderError::Handshake("connect timeout".into()))?
        .map_err(|e| ProviderError::Handshake(e.to_string()))?;

        // First server frame must be session.created.
        let first = tokio::time::timeout(CONNECT_TIMEOUT, ws.next())
            .await
            .map_err(|_| ProviderError::Handshake("session.created timeout".into()))?
            .ok_or_else(|| ProviderError::Handshake("stream ended before session.created".into()))?
            .map_err(|e| ProviderError::Handshake(e.to_string()))?;

        let created: Value = match &first {
            WsMessage::Text(text) => serde_json::from_str(text)
                .map_err(|e| ProviderError::Handshake(format!("bad session.created: {e}")))?,
            other => {
                return Err(ProviderError::Handshake(format!(
                    "unexpected initial frame: {other:?}"
                )))
            }
        };
        if created.get("type").and_then(Value::as_str) != Some("session.created") {
            return Err(ProviderError::Handshake(format!(
                "unexpected initial event: {:?}",
                created.get("type")
            )));
        }

        *self.session_id.lock() = created
            .pointer("/session/id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        *self.session_started.lock() = Some(Instant::now());

        let (sink, source) = ws.split();
        *self.sink.lock() = Some(Arc::new(Mutex::new(sink)));

        let events = self.events.sender();
        let call_id = self.config.call_id.clone();
        *self.recv_task.lock() = Some(tokio::spawn(async move {
            Self::receive_loop(source, events, call_id).await;
        }));

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            call_id = %self.config.call_id,
            session_id = ?self.session_id.lock(),
            "connected to openai realtime"
        );
        Ok(())
    }

    async fn configure(&mut self) -> ProviderResult<()> {
        let mut session = json!({
            "modalities": ["audio", "text"],
            "voice": if self.config.voice.is_empty() { "alloy" } else { self.config.voice.as_str() },
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "instructions": self.config.system_prompt.clone(),
            "input_audio_transcription": { "model": "whisper-1" },
            "tools": self.config.tools_or_default(),
            "tool_choice": "auto",
            "temperature": self.config.temperature.unwrap_or(0.8),
        });
        if let Some(max) = self.config.max_response_output_tokens {
            session["max_response_output_tokens"] = json!(max);
        }
        // Push-to-talk omits the turn_detection block entirely.
        if let Some(vad) = build_turn_detection(&self.config.vad()) {
            session["turn_detection"] = vad;
        }

        self.send_json(&json!({ "type": "session.update", "session": session }))
            .await?;

        tracing::info!(
            call_id = %self.config.call_id,
            vad = ?self.config.vad(),
            "openai session.update sent"
        );

        if let Some(first) = self.config.first_message.clone() {
            self.send_text(&first).await?;
        }
        Ok(())
    }

    async fn send_audio(&self, pcm: &[u8]) -> ProviderResult<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        let audio = base64::engine::general_purpose::STANDARD.encode(pcm);
        self.send_json(&json!({
            "type": "input_audio_buffer.append",
            "audio": audio,
        }))
        .await
    }

    async fn send_text(&self, text: &str) -> ProviderResult<()> {
        self.send_json(&json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }]
            }
        }))
        .await?;
        self.send_json(&json!({ "type": "response.create" })).await
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        self.send_json(&json!({ "type": "response.cancel" })).await
    }

    async fn send_function_result(
        &self,
        function_name: &str,
        result: Value,
        call_id: &str,
    ) -> ProviderResult<()> {
        self.send_json(&json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": result.to_string(),
            }
        }))
        .await?;
        tracing::debug!(
            call_id = %self.config.call_id,
            function = function_name,
            "function result sent to openai"
        );
        self.send_json(&json!({ "type": "response.create" })).await
    }

    async fn next_event(&self) -> Option<ProviderEvent> {
        if !self.expiry_warned.load(Ordering::SeqCst) {
            if let Some(remaining) = self.remaining_seconds() {
                if remaining <= EXPIRY_WARNING_SECONDS {
                    self.expiry_warned.store(true, Ordering::SeqCst);
                    tracing::warn!(
                        call_id = %self.config.call_id,
                        remaining,
                        "openai session nearing its ceiling"
                    );
                    return Some(ProviderEvent::SessionExpiring {
                        remaining_seconds: remaining,
                    });
                }
            }
        }
        self.events.recv().await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            let _ = sink.lock().await.send(WsMessage::Close(None)).await;
        }
        tracing::info!(
            call_id = %self.config.call_id,
            session_id = ?self.session_id.lock(),
            "disconnected from openai realtime"
        );
    }
}

/// Build the `turn_detection` block, or `None` for push-to-talk.
fn build_turn_detection(vad: &VadMode) -> Option<Value> {
    match vad {
        VadMode::SemanticVad { eagerness } => Some(json!({
            "type": "semantic_vad",
            "eagerness": VadMode::normalized_eagerness(eagerness),
            "create_response": true,
        })),
        VadMode::ServerVad {
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        } => Some(json!({
            "type": "server_vad",
            "threshold": threshold,
            "prefix_padding_ms": prefix_padding_ms,
            "silence_duration_ms": silence_duration_ms,
            "create_response": true,
        })),
        VadMode::Disabled => None,
    }
}

/// Map one OpenAI wire event to the normalised taxonomy.
///
/// Both the legacy (`response.audio.*`) and current
/// (`response.output_audio.*`) audio event names are accepted.
fn parse_event(event: &Value) -> Option<ProviderEvent> {
    let etype = event.get("type").and_then(Value::as_str).unwrap_or("");

    match etype {
        "response.audio.delta" | "response.output_audio.delta" => {
            let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
            let audio = base64::engine::general_purpose::STANDARD
                .decode(delta)
                .unwrap_or_default();
            Some(ProviderEvent::AudioDelta { audio })
        }
        "response.audio.done" | "response.output_audio.done" => Some(ProviderEvent::AudioDone),

        "response.audio_transcript.delta" => Some(ProviderEvent::TranscriptDelta {
            text: event
                .get("delta")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
        }),
        "response.audio_transcript.done" => Some(ProviderEvent::TranscriptDone {
            text: event
                .get("transcript")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
        }),

        "conversation.item.input_audio_transcription.completed" => {
            Some(ProviderEvent::UserTranscript {
                text: event
                    .get("transcript")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
            })
        }
        // A failed STT attempt is not fatal to the call.
        "conversation.item.input_audio_transcription.failed" => None,

        "input_audio_buffer.speech_started" => Some(ProviderEvent::SpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(ProviderEvent::SpeechStopped),

        "response.created" => Some(ProviderEvent::ResponseStarted),
        "response.done" => Some(ProviderEvent::ResponseDone {
            status: event
                .pointer("/response/status")
                .and_then(Value::as_str)
                .unwrap_or("completed")
                .to_owned(),
        }),
        "response.cancelled" => Some(ProviderEvent::Interrupted),

        "response.function_call_arguments.done" => {
            let arguments = event
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            Some(ProviderEvent::FunctionCall {
                name: event
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
                arguments,
                call_id: event
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
            })
        }

        "error" => {
            let error = event.get("error").cloned().unwrap_or_else(|| json!({}));
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_owned();

            if BENIGN_ERROR_CODES.contains(&code.as_str()) {
                tracing::debug!(code = %code, "benign openai error dropped");
                return None;
            }
            if code == "rate_limit_exceeded" {
                return Some(ProviderEvent::RateLimited { info: error });
            }
            Some(ProviderEvent::Error { code, message })
        }

        // Confirmation/bookkeeping events carry nothing the session needs.
        "session.created"
        | "session.updated"
        | "input_audio_buffer.committed"
        | "input_audio_buffer.cleared"
        | "conversation.item.created"
        | "response.content_part.added"
        | "response.content_part.done"
        | "response.output_item.added"
        | "response.output_item.done"
        | "rate_limits.updated" => None,

        _ => {
            tracing::debug!(event_type = etype, "unhandled openai event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_audio_delta_decodes_base64() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([10u8, 20, 30]);
        let event = json!({ "type": "response.output_audio.delta", "delta": b64 });
        match parse_event(&event) {
            Some(ProviderEvent::AudioDelta { audio }) => assert_eq!(audio, vec![10, 20, 30]),
            other => panic!("expected AudioDelta, got {other:?}"),
        }
    }

    #[test]
    fn parse_legacy_audio_delta_name() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([1u8]);
        let event = json!({ "type": "response.audio.delta", "delta": b64 });
        assert!(matches!(
            parse_event(&event),
            Some(ProviderEvent::AudioDelta { .. })
        ));
    }

    #[test]
    fn parse_transcript_events() {
        let delta = json!({ "type": "response.audio_transcript.delta", "delta": "Olá" });
        assert_eq!(
            parse_event(&delta),
            Some(ProviderEvent::TranscriptDelta { text: "Olá".into() })
        );

        let done = json!({ "type": "response.audio_transcript.done", "transcript": "Olá, tudo bem?" });
        assert_eq!(
            parse_event(&done),
            Some(ProviderEvent::TranscriptDone {
                text: "Olá, tudo bem?".into()
            })
        );
    }

    #[test]
    fn parse_user_transcript() {
        let event = json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "quero falar com vendas"
        });
        assert_eq!(
            parse_event(&event),
            Some(ProviderEvent::UserTranscript {
                text: "quero falar com vendas".into()
            })
        );
    }

    #[test]
    fn parse_vad_and_lifecycle() {
        assert_eq!(
            parse_event(&json!({"type": "input_audio_buffer.speech_started"})),
            Some(ProviderEvent::SpeechStarted)
        );
        assert_eq!(
            parse_event(&json!({"type": "input_audio_buffer.speech_stopped"})),
            Some(ProviderEvent::SpeechStopped)
        );
        assert_eq!(
            parse_event(&json!({"type": "response.created"})),
            Some(ProviderEvent::ResponseStarted)
        );
        assert_eq!(
            parse_event(&json!({"type": "response.done", "response": {"status": "completed"}})),
            Some(ProviderEvent::ResponseDone {
                status: "completed".into()
            })
        );
    }

    #[test]
    fn parse_function_call_arguments() {
        let event = json!({
            "type": "response.function_call_arguments.done",
            "name": "transfer_call",
            "call_id": "call-1",
            "arguments": "{\"destination\": \"2000\"}"
        });
        match parse_event(&event) {
            Some(ProviderEvent::FunctionCall {
                name,
                arguments,
                call_id,
            }) => {
                assert_eq!(name, "transfer_call");
                assert_eq!(call_id, "call-1");
                assert_eq!(arguments["destination"], "2000");
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
    }

    #[test]
    fn benign_errors_are_dropped() {
        for code in BENIGN_ERROR_CODES {
            let event = json!({ "type": "error", "error": { "code": code, "message": "x" } });
            assert_eq!(parse_event(&event), None);
        }
    }

    #[test]
    fn rate_limit_error_maps_to_rate_limited() {
        let event = json!({
            "type": "error",
            "error": { "code": "rate_limit_exceeded", "message": "slow down" }
        });
        assert!(matches!(
            parse_event(&event),
            Some(ProviderEvent::RateLimited { .. })
        ));
    }

    #[test]
    fn other_errors_surface() {
        let event = json!({
            "type": "error",
            "error": { "code": "server_error", "message": "boom" }
        });
        assert_eq!(
            parse_event(&event),
            Some(ProviderEvent::Error {
                code: "server_error".into(),
                message: "boom".into()
            })
        );
    }

    #[test]
    fn bookkeeping_events_are_ignored() {
        for etype in [
            "session.created",
            "session.updated",
            "input_audio_buffer.committed",
            "rate_limits.updated",
            "conversation.item.created",
        ] {
            assert_eq!(parse_event(&json!({ "type": etype })), None, "{etype}");
        }
    }

    #[test]
    fn turn_detection_blocks() {
        let semantic = build_turn_detection(&VadMode::SemanticVad {
            eagerness: "high".into(),
        })
        .unwrap();
        assert_eq!(semantic["type"], "semantic_vad");
        assert_eq!(semantic["eagerness"], "high");

        let server = build_turn_detection(&VadMode::ServerVad {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        })
        .unwrap();
        assert_eq!(server["type"], "server_vad");
        assert_eq!(server["silence_duration_ms"], 500);

        assert!(build_turn_detection(&VadMode::Disabled).is_none());
    }

    #[test]
    fn sample_rates_are_24khz() {
        let provider = OpenAiRealtimeProvider::new(
            OpenAiCredentials {
                api_key: "k".into(),
                model: OpenAiCredentials::DEFAULT_MODEL.into(),
            },
            ProviderSessionConfig::default(),
        );
        assert_eq!(provider.input_sample_rate(), 24_000);
        assert_eq!(provider.output_sample_rate(), 24_000);
        assert_eq!(provider.name(), "openai_realtime");
    }
}
