//! Google Gemini Live (BidiGenerateContent) adapter.
//!
//! ## Protocol
//!
//! 1. **Connect** — WebSocket with the API key as a query parameter.
//! 2. **Setup** — first client frame is `{"setup": …}` carrying model,
//!    `responseModalities: ["AUDIO"]`, the prebuilt voice, system
//!    instruction and tool declarations; the server must answer
//!    `setupComplete` within 10 s.
//! 3. **Stream** — PCM16 @16 kHz in as `realtimeInput.audio`; audio out
//!    arrives inside `serverContent.modelTurn.parts[].inlineData` at
//!    24 kHz. Interrupt is `realtimeInput.activityEnd`; `goAway` means the
//!    server is ending the session.
//!
//! Gemini may deliver JSON inside Binary WebSocket frames; both frame
//! kinds are parsed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::credentials::GeminiCredentials;
use super::{
    EventQueue, ProviderError, ProviderEvent, ProviderResult, ProviderSessionConfig,
    RealtimeProvider, SharedSink, WsSource,
};

const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Setup must complete within this window.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Prebuilt voices accepted by the Live API.
const KNOWN_VOICES: &[&str] = &[
    "Aoede", "Charon", "Fenrir", "Kore", "Puck", "Orion", "Leda",
];

pub struct GeminiLiveProvider {
    credentials: GeminiCredentials,
    config: ProviderSessionConfig,
    voice: String,
    connected: AtomicBool,
    setup_complete: AtomicBool,
    sink: parking_lot::Mutex<Option<SharedSink>>,
    /// Read half parked between connect and configure; the receive loop
    /// only starts once setupComplete has been consumed.
    pending_source: parking_lot::Mutex<Option<WsSource>>,
    events: EventQueue,
    recv_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl GeminiLiveProvider {
    pub fn new(credentials: GeminiCredentials, config: ProviderSessionConfig) -> Self {
        let requested = if config.voice.is_empty() {
            "Aoede".to_owned()
        } else {
            config.voice.clone()
        };
        let voice = if KNOWN_VOICES.contains(&requested.as_str()) {
            requested
        } else {
            tracing::warn!(voice = %requested, "unknown gemini voice, using Aoede");
            "Aoede".to_owned()
        };
        Self {
            credentials,
            config,
            voice,
            connected: AtomicBool::new(false),
            setup_complete: AtomicBool::new(false),
            sink: parking_lot::Mutex::new(None),
            pending_source: parking_lot::Mutex::new(None),
            events: EventQueue::new(256),
            recv_task: parking_lot::Mutex::new(None),
        }
    }

    fn sink_handle(&self) -> ProviderResult<SharedSink> {
        if !self.setup_complete.load(Ordering::SeqCst) {
            return Err(ProviderError::NotConnected);
        }
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

    /// Convert OpenAI-style tool entries to Gemini functionDeclarations.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter(|t| t.get("type").and_then(Value::as_str) == Some("function"))
            .map(|t| {
                json!({
                    "functionDeclarations": [{
                        "name": t.get("name").and_then(Value::as_str).unwrap_or(""),
                        "description": t.get("description").and_then(Value::as_str).unwrap_or(""),
                        "parameters": t.get("parameters").cloned().unwrap_or_else(|| json!({})),
                    }]
                })
            })
            .collect()
    }

    async fn receive_loop(
        mut source: WsSource,
        events: mpsc::Sender<ProviderEvent>,
        call_id: String,
    ) {
        while let Some(frame) = source.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                // Gemini sends JSON inside Binary frames too.
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!(call_id = %call_id, "non-utf8 binary frame from gemini, dropping");
                        continue;
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(call_id = %call_id, close_frame = ?frame, "gemini connection closed");
                    let _ = events
                        .send(ProviderEvent::SessionEnded {
                            reason: "closed".into(),
                        })
                        .await;
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(call_id = %call_id, error = %e, "gemini websocket error");
                    let _ = events
                        .send(ProviderEvent::Error {
                            code: "transport".into(),
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let parsed: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(call_id = %call_id, error = %e, "unparseable gemini frame, dropping");
                    continue;
                }
            };
            for event in parse_server_message(&parsed) {
                if events.send(event).await.is_err() {
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
impl RealtimeProvider for GeminiLiveProvider {
    fn name(&self) -> &'static str {
        "gemini_live"
    }

    fn input_sample_rate(&self) -> u32 {
        16_000
    }

    fn output_sample_rate(&self) -> u32 {
        24_000
    }

    async fn connect(&mut self) -> ProviderResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let url = format!("{LIVE_API_URL}?key={}", self.credentials.api_key);

        tracing::info!(
            call_id = %self.config.call_id,
            domain = %self.config.domain_id,
            model = %self.credentials.model,
            voice = %self.voice,
            "connecting to gemini live"
        );

        let (ws, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| ProviderError::Handshake("connect timeout".into()))?
                .map_err(|e| ProviderError::Handshake(e.to_string()))?;

        let (sink, source) = ws.split();
        *self.sink.lock() = Some(Arc::new(Mutex::new(sink)));
        *self.pending_source.lock() = Some(source);

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn configure(&mut self) -> ProviderResult<()> {
        let sink = self
            .sink
            .lock()
            .as_ref()
            .cloned()
            .ok_or(ProviderError::NotConnected)?;
        let mut source = self
            .pending_source
            .lock()
            .take()
            .ok_or(ProviderError::NotConnected)?;

        let mut generation_config = json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": self.voice.clone() }
                }
            }
        });
        if let Some(max) = self.config.max_response_output_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        if let Some(temperature) = self.config.temperature {
            generation_config["temperature"] = json!(temperature);
        }

        let mut setup = json!({
            "model": self.credentials.model.clone(),
            "generationConfig": generation_config,
        });
        if !self.config.system_prompt.is_empty() {
            setup["systemInstruction"] = json!({
                "parts": [{ "text": self.config.system_prompt.clone() }]
            });
        }
        let tools = self.config.tools_or_default();
        if !tools.is_empty() {
            setup["tools"] = json!(Self::convert_tools(&tools));
        }

        sink.lock()
            .await
            .send(WsMessage::Text(json!({ "setup": setup }).to_string()))
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        // The first server frame acknowledges setup; it may arrive as a
        // Text or a Binary frame.
        let complete = tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(WsMessage::Close(frame)) => {
                        return Err(ProviderError::Handshake(format!(
                            "closed before setupComplete: {frame:?}"
                        )))
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(ProviderError::Handshake(e.to_string())),
                };
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if parsed.get("setupComplete").is_some() {
                    return Ok(());
                }
                return Err(ProviderError::Handshake(format!(
                    "setup failed, got: {text}"
                )));
            }
            Err(ProviderError::Handshake(
                "stream ended before setupComplete".into(),
            ))
        })
        .await
        .map_err(|_| ProviderError::Handshake("setup timed out (10s)".into()))?;
        complete?;

        self.setup_complete.store(true, Ordering::SeqCst);
        tracing::info!(call_id = %self.config.call_id, "gemini live setup complete");

        let events = self.events.sender();
        let call_id = self.config.call_id.clone();
        *self.recv_task.lock() = Some(tokio::spawn(async move {
            Self::receive_loop(source, events, call_id).await;
        }));

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
            "realtimeInput": {
                "audio": {
                    "mimeType": INPUT_AUDIO_MIME,
                    "data": audio,
                }
            }
        }))
        .await
    }

    async fn send_text(&self, text: &str) -> ProviderResult<()> {
        self.send_json(&json!({
            "clientContent": {
                "turns": [{
                    "role": "user",
                    "parts": [{ "text": text }]
                }],
                "turnComplete": true,
            }
        }))
        .await
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        // activityEnd is an object, not a boolean flag.
        self.send_json(&json!({
            "realtimeInput": { "activityEnd": {} }
        }))
        .await
    }

    async fn send_function_result(
        &self,
        function_name: &str,
        result: Value,
        call_id: &str,
    ) -> ProviderResult<()> {
        self.send_json(&json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": call_id,
                    "name": function_name,
                    "response": result,
                }]
            }
        }))
        .await
    }

    async fn next_event(&self) -> Option<ProviderEvent> {
        self.events.recv().await
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.setup_complete.store(false, Ordering::SeqCst);
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            let _ = sink.lock().await.send(WsMessage::Close(None)).await;
        }
        tracing::info!(call_id = %self.config.call_id, "disconnected from gemini live");
    }
}

/// One Gemini server message can carry several logical events.
fn parse_server_message(data: &Value) -> Vec<ProviderEvent> {
    let mut events = Vec::new();

    if let Some(content) = data.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            events.push(ProviderEvent::Interrupted);
        }

        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(inline) = part.get("inlineData") {
                    let mime = inline.get("mimeType").and_then(Value::as_str).unwrap_or("");
                    if mime.contains("audio") {
                        if let Some(audio) = inline
                            .get("data")
                            .and_then(Value::as_str)
                            .and_then(|b64| {
                                base64::engine::general_purpose::STANDARD.decode(b64).ok()
                            })
                        {
                            events.push(ProviderEvent::AudioDelta { audio });
                        }
                    }
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(ProviderEvent::TranscriptDelta {
                            text: text.to_owned(),
                        });
                    }
                }
            }
        }

        if content.get("generationComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ProviderEvent::AudioDone);
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ProviderEvent::ResponseDone {
                status: "completed".into(),
            });
        }
    }

    if let Some(text) = data
        .pointer("/inputTranscription/text")
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            events.push(ProviderEvent::UserTranscript {
                text: text.to_owned(),
            });
        }
    }

    if let Some(text) = data
        .pointer("/outputTranscription/text")
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            events.push(ProviderEvent::TranscriptDone {
                text: text.to_owned(),
            });
        }
    }

    if let Some(calls) = data
        .pointer("/toolCall/functionCalls")
        .and_then(Value::as_array)
    {
        if let Some(fc) = calls.first() {
            events.push(ProviderEvent::FunctionCall {
                name: fc
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
                arguments: fc.get("args").cloned().unwrap_or_else(|| json!({})),
                call_id: fc
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned(),
            });
        }
    }

    if data.get("goAway").is_some() {
        events.push(ProviderEvent::SessionEnded {
            reason: "server_goaway".into(),
        });
    }

    if let Some(err) = data.get("error") {
        events.push(ProviderEvent::Error {
            code: "provider".into(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown server error")
                .to_owned(),
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_audio_inside_model_turn() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([10u8, 20, 30]);
        let msg = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{
                        "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": b64 }
                    }]
                }
            }
        });
        let events = parse_server_message(&msg);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProviderEvent::AudioDelta { audio } => assert_eq!(audio, &vec![10, 20, 30]),
            other => panic!("expected AudioDelta, got {other:?}"),
        }
    }

    #[test]
    fn parse_text_part_is_transcript_delta() {
        let msg = json!({
            "serverContent": { "modelTurn": { "parts": [{ "text": "Olá" }] } }
        });
        assert_eq!(
            parse_server_message(&msg),
            vec![ProviderEvent::TranscriptDelta { text: "Olá".into() }]
        );
    }

    #[test]
    fn parse_turn_and_generation_complete() {
        let msg = json!({
            "serverContent": { "generationComplete": true, "turnComplete": true }
        });
        let events = parse_server_message(&msg);
        assert!(events.contains(&ProviderEvent::AudioDone));
        assert!(events.contains(&ProviderEvent::ResponseDone {
            status: "completed".into()
        }));
    }

    #[test]
    fn parse_interrupted() {
        let msg = json!({ "serverContent": { "interrupted": true } });
        assert_eq!(parse_server_message(&msg), vec![ProviderEvent::Interrupted]);
    }

    #[test]
    fn parse_transcriptions() {
        let msg = json!({ "inputTranscription": { "text": "bom dia" } });
        assert_eq!(
            parse_server_message(&msg),
            vec![ProviderEvent::UserTranscript {
                text: "bom dia".into()
            }]
        );

        let msg = json!({ "outputTranscription": { "text": "pois não" } });
        assert_eq!(
            parse_server_message(&msg),
            vec![ProviderEvent::TranscriptDone {
                text: "pois não".into()
            }]
        );

        // Empty transcriptions are suppressed.
        let msg = json!({ "inputTranscription": { "text": "" } });
        assert!(parse_server_message(&msg).is_empty());
    }

    #[test]
    fn parse_tool_call() {
        let msg = json!({
            "toolCall": {
                "functionCalls": [{
                    "id": "fc-1",
                    "name": "transfer_call",
                    "args": { "destination": "Financeiro" }
                }]
            }
        });
        let events = parse_server_message(&msg);
        match &events[0] {
            ProviderEvent::FunctionCall { name, arguments, call_id } => {
                assert_eq!(name, "transfer_call");
                assert_eq!(call_id, "fc-1");
                assert_eq!(arguments["destination"], "Financeiro");
            }
            other => panic!("expected FunctionCall, got {other:?}"),
        }
    }

    #[test]
    fn go_away_ends_session() {
        let msg = json!({ "goAway": {} });
        assert_eq!(
            parse_server_message(&msg),
            vec![ProviderEvent::SessionEnded {
                reason: "server_goaway".into()
            }]
        );
    }

    #[test]
    fn unknown_voice_falls_back_to_aoede() {
        let provider = GeminiLiveProvider::new(
            GeminiCredentials {
                api_key: "k".into(),
                model: GeminiCredentials::DEFAULT_MODEL.into(),
            },
            ProviderSessionConfig {
                voice: "NotAVoice".into(),
                ..Default::default()
            },
        );
        assert_eq!(provider.voice, "Aoede");
    }

    #[test]
    fn tools_convert_to_function_declarations() {
        let tools = vec![json!({
            "type": "function",
            "name": "end_call",
            "description": "ends",
            "parameters": { "type": "object" }
        })];
        let converted = GeminiLiveProvider::convert_tools(&tools);
        assert_eq!(converted.len(), 1);
        assert_eq!(
            converted[0]["functionDeclarations"][0]["name"],
            "end_call"
        );
    }

    #[test]
    fn asymmetric_sample_rates() {
        let provider = GeminiLiveProvider::new(
            GeminiCredentials {
                api_key: "k".into(),
                model: GeminiCredentials::DEFAULT_MODEL.into(),
            },
            ProviderSessionConfig::default(),
        );
        assert_eq!(provider.input_sample_rate(), 16_000);
        assert_eq!(provider.output_sample_rate(), 24_000);
    }
}
