//! ElevenLabs Conversational AI adapter.
//!
//! WebSocket keyed by agent id with `xi-api-key` auth. The first inbound
//! message must be `conversation_initiation_metadata`; anything else is a
//! handshake failure. Prompt/greeting/voice are injected through
//! `conversation_config_override`. Audio both ways is base64 PCM16 at
//! 16 kHz, so the media leg usually needs no resampling at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::credentials::ElevenLabsCredentials;
use super::{
    EventQueue, ProviderError, ProviderEvent, ProviderResult, ProviderSessionConfig,
    RealtimeProvider, SharedSink, WsSource,
};

const CONV_API_URL: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ElevenLabsProvider {
    credentials: ElevenLabsCredentials,
    config: ProviderSessionConfig,
    connected: AtomicBool,
    sink: parking_lot::Mutex<Option<SharedSink>>,
    events: EventQueue,
    recv_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ElevenLabsProvider {
    pub fn new(credentials: ElevenLabsCredentials, config: ProviderSessionConfig) -> Self {
        Self {
            credentials,
            config,
            connected: AtomicBool::new(false),
            sink: parking_lot::Mutex::new(None),
            events: EventQueue::new(256),
            recv_task: parking_lot::Mutex::new(None),
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
        let result = sink
            .lock()
            .await
            .send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()));
        result
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
                            tracing::warn!(call_id = %call_id, error = %e, "unparseable elevenlabs frame, dropping");
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
                    tracing::info!(call_id = %call_id, close_frame = ?frame, "elevenlabs connection closed");
                    let _ = events
                        .send(ProviderEvent::SessionEnded {
                            reason: "closed".into(),
                        })
                        .await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(call_id = %call_id, error = %e, "elevenlabs websocket error");
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
impl RealtimeProvider for ElevenLabsProvider {
    fn name(&self) -> &'static str {
        "elevenlabs_conversational"
    }

    fn input_sample_rate(&self) -> u32 {
        16_000
    }

    fn output_sample_rate(&self) -> u32 {
        16_000
    }

    async fn connect(&mut self) -> ProviderResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = format!("{CONV_API_URL}?agent_id={}", self.credentials.agent_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::Handshake(format!("bad request: {e}")))?;
        request.headers_mut().insert(
            "xi-api-key",
            self.credentials
                .api_key
                .parse()
                .map_err(|_| ProviderError::Handshake("invalid api key header".into()))?,
        );

        tracing::info!(
            call_id = %self.config.call_id,
            domain = %self.config.domain_id,
            agent_id = %self.credentials.agent_id,
            "connecting to elevenlabs conversational"
        );

        let (mut ws, _response) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| ProviderError::Handshake("connect timeout".into()))?
        .map_err(|e| ProviderError::Handshake(e.to_string()))?;

        let first = tokio::time::timeout(CONNECT_TIMEOUT, ws.next())
            .await
            .map_err(|_| ProviderError::Handshake("initiation metadata timeout".into()))?
            .ok_or_else(|| ProviderError::Handshake("stream ended before metadata".into()))?
            .map_err(|e| ProviderError::Handshake(e.to_string()))?;

        let metadata: Value = match &first {
            WsMessage::Text(text) => serde_json::from_str(text)
                .map_err(|e| ProviderError::Handshake(format!("bad metadata frame: {e}")))?,
            other => {
                return Err(ProviderError::Handshake(format!(
                    "unexpected initial frame: {other:?}"
                )))
            }
        };
        if metadata.get("type").and_then(Value::as_str) != Some("conversation_initiation_metadata")
        {
            return Err(ProviderError::Handshake(format!(
                "unexpected initial event: {:?}",
                metadata.get("type")
            )));
        }

        let (sink, source) = ws.split();
        *self.sink.lock() = Some(Arc::new(Mutex::new(sink)));

        let events = self.events.sender();
        let call_id = self.config.call_id.clone();
        *self.recv_task.lock() = Some(tokio::spawn(async move {
            Self::receive_loop(source, events, call_id).await;
        }));

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(call_id = %self.config.call_id, "connected to elevenlabs conversational");
        Ok(())
    }

    async fn configure(&mut self) -> ProviderResult<()> {
        if self.config.system_prompt.is_empty() && self.config.first_message.is_none() {
            return Ok(());
        }
        let voice_id = self
            .credentials
            .voice_id
            .clone()
            .unwrap_or_else(|| self.config.voice.clone());
        self.send_json(&json!({
            "type": "conversation_config_override",
            "conversation_config_override": {
                "agent": {
                    "prompt": { "prompt": self.config.system_prompt.clone() },
                    "first_message": self.config.first_message.clone(),
                },
                "tts": { "voice_id": voice_id },
            },
        }))
        .await
    }

    async fn send_audio(&self, pcm: &[u8]) -> ProviderResult<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        let audio = base64::engine::general_purpose::STANDARD.encode(pcm);
        self.send_json(&json!({
            "type": "user_audio_chunk",
            "user_audio_chunk": audio,
        }))
        .await
    }

    async fn send_text(&self, text: &str) -> ProviderResult<()> {
        self.send_json(&json!({
            "type": "user_transcript",
            "user_transcript": text,
        }))
        .await
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        self.send_json(&json!({ "type": "interrupt" })).await
    }

    async fn send_function_result(
        &self,
        _function_name: &str,
        result: Value,
        call_id: &str,
    ) -> ProviderResult<()> {
        self.send_json(&json!({
            "type": "tool_result",
            "tool_call_id": call_id,
            "result": result.to_string(),
        }))
        .await
    }

    async fn next_event(&self) -> Option<ProviderEvent> {
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
        tracing::info!(call_id = %self.config.call_id, "disconnected from elevenlabs conversational");
    }
}

/// Map one ElevenLabs wire event to the normalised taxonomy.
fn parse_event(event: &Value) -> Option<ProviderEvent> {
    let etype = event.get("type").and_then(Value::as_str).unwrap_or("");

    match etype {
        "audio" => {
            let audio = event
                .get("audio")
                .and_then(Value::as_str)
                .map(|b64| {
                    base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            Some(ProviderEvent::AudioDelta { audio })
        }
        "audio_done" => Some(ProviderEvent::AudioDone),

        "agent_response" => Some(ProviderEvent::TranscriptDone {
            text: event
                .get("agent_response")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
        }),
        "user_transcript" => Some(ProviderEvent::UserTranscript {
            text: event
                .get("user_transcript")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
        }),

        // ElevenLabs reports barge-in as an interruption event; for the
        // session it is the moment the caller started talking.
        "interruption" => Some(ProviderEvent::SpeechStarted),

        "agent_response_started" => Some(ProviderEvent::ResponseStarted),
        "agent_response_done" => Some(ProviderEvent::ResponseDone {
            status: "completed".into(),
        }),

        "tool_use" => {
            let tool = event
                .get("tool_calls")
                .and_then(Value::as_array)
                .and_then(|calls| calls.first())?;
            let arguments = tool
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            Some(ProviderEvent::FunctionCall {
                name: tool
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
                arguments,
                call_id: tool
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
            })
        }

        "conversation_ended" => Some(ProviderEvent::SessionEnded {
            reason: event
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("ended")
                .to_owned(),
        }),

        "error" => Some(ProviderEvent::Error {
            code: "provider".into(),
            message: event
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_owned(),
        }),

        // Keepalives and metadata need no handling.
        "ping" | "conversation_initiation_metadata" => None,

        _ => {
            tracing::debug!(event_type = etype, "unhandled elevenlabs event");
            None
        }
    }
}
