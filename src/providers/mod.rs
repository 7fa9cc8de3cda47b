//! Realtime conversational-AI providers.
//!
//! Every backend is driven through the same surface: connect, configure,
//! stream PCM in, receive a normalised event stream out. Adapters own
//! their WebSocket (or local pipeline) and translate wire events into
//! [`ProviderEvent`]s; the session layer never sees provider-specific
//! JSON.
//!
//! ## Adapter shape
//!
//! ```text
//! send_audio/send_text ─▸ writer half (locked sink) ─▸ provider WS
//! provider WS ─▸ inbound loop ─▸ parse_event() ─▸ mpsc ─▸ next_event()
//! ```
//!
//! Sends are safe while the receive loop runs; the writer half sits
//! behind an async mutex and the receive loop owns the read half.

pub mod elevenlabs;
pub mod gemini;
pub mod openai;
pub mod pipeline;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Shared writer-half type for the WebSocket adapters.
pub(crate) type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Shared reader-half type for the WebSocket adapters.
pub(crate) type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

pub(crate) type SharedSink = Arc<Mutex<WsSink>>;

/// Normalised, provider-independent event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// PCM16 chunk at the provider's declared output rate.
    AudioDelta { audio: Vec<u8> },
    /// Current response audio finished.
    AudioDone,
    /// Partial assistant transcript.
    TranscriptDelta { text: String },
    /// Final assistant transcript for the turn.
    TranscriptDone { text: String },
    /// Final user (STT) transcript.
    UserTranscript { text: String },
    /// Provider VAD: caller started speaking.
    SpeechStarted,
    /// Provider VAD: caller stopped speaking.
    SpeechStopped,
    /// A response turn began.
    ResponseStarted,
    /// A response turn completed.
    ResponseDone { status: String },
    /// The model requested a function execution.
    FunctionCall {
        name: String,
        arguments: Value,
        call_id: String,
    },
    /// The model was interrupted mid-response.
    Interrupted,
    /// Provider rate limiting.
    RateLimited { info: Value },
    /// Provider error surfaced through the event path.
    Error { code: String, message: String },
    /// The provider session is nearing its hard ceiling; reconnect soon.
    SessionExpiring { remaining_seconds: u64 },
    /// The provider ended the session (or the socket closed).
    SessionEnded { reason: String },
}

impl ProviderEvent {
    /// Events after which a session must fall back or terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Error { .. } | Self::RateLimited { .. } | Self::SessionEnded { .. }
        )
    }
}

/// Voice-activity-detection policy handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub enum VadMode {
    /// Silence-based turn detection.
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
    /// Meaning-based turn detection; eagerness in {low, medium, high}.
    SemanticVad { eagerness: String },
    /// No turn detection: push-to-talk.
    Disabled,
}

impl Default for VadMode {
    fn default() -> Self {
        Self::SemanticVad {
            eagerness: "medium".into(),
        }
    }
}

impl VadMode {
    pub fn normalized_eagerness(value: &str) -> &str {
        match value {
            "low" | "medium" | "high" => value,
            _ => "medium",
        }
    }
}

/// Per-session provider configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProviderSessionConfig {
    pub domain_id: String,
    pub call_id: String,
    pub secretary_id: Option<String>,
    pub system_prompt: String,
    /// Spoken greeting injected right after configure.
    pub first_message: Option<String>,
    pub voice: String,
    pub language: String,
    pub vad: Option<VadMode>,
    pub tools: Vec<Value>,
    pub temperature: Option<f64>,
    pub max_response_output_tokens: Option<u32>,
}

impl ProviderSessionConfig {
    pub fn vad(&self) -> VadMode {
        self.vad.clone().unwrap_or_default()
    }

    /// Tool declarations, falling back to the built-in vocabulary.
    pub fn tools_or_default(&self) -> Vec<Value> {
        if self.tools.is_empty() {
            default_tools()
        } else {
            self.tools.clone()
        }
    }
}

/// Built-in function vocabulary understood by the session layer.
pub fn default_tools() -> Vec<Value> {
    vec![
        serde_json::json!({
            "type": "function",
            "name": "transfer_call",
            "description": "Transfere a chamada para outro ramal ou departamento",
            "parameters": {
                "type": "object",
                "properties": {
                    "destination": {"type": "string"},
                    "department": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["destination"]
            }
        }),
        serde_json::json!({
            "type": "function",
            "name": "end_call",
            "description": "Encerra a chamada",
            "parameters": {
                "type": "object",
                "properties": {"reason": {"type": "string"}}
            }
        }),
        serde_json::json!({
            "type": "function",
            "name": "request_handoff",
            "description": "Transfere a conversa para um atendente humano",
            "parameters": {
                "type": "object",
                "properties": {"reason": {"type": "string"}}
            }
        }),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not connected")]
    NotConnected,
    #[error("provider handshake failed: {0}")]
    Handshake(String),
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider configuration invalid: {0}")]
    Config(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Uniform surface over the realtime backends.
///
/// Implementations must tolerate partial messages, surface unexpected
/// socket closure as `SessionEnded {reason: "closed"}`, drop unparseable
/// frames after logging, and accept `send_*` calls concurrently with the
/// receive loop.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// PCM rate this provider expects on input.
    fn input_sample_rate(&self) -> u32;

    /// PCM rate this provider produces on output.
    fn output_sample_rate(&self) -> u32;

    async fn connect(&mut self) -> ProviderResult<()>;

    /// Apply prompt, voice, VAD and tools. Called once after connect.
    async fn configure(&mut self) -> ProviderResult<()>;

    async fn send_audio(&self, pcm: &[u8]) -> ProviderResult<()>;

    async fn send_text(&self, text: &str) -> ProviderResult<()>;

    /// Barge-in: cancel the in-flight response.
    async fn interrupt(&self) -> ProviderResult<()>;

    async fn send_function_result(
        &self,
        function_name: &str,
        result: Value,
        call_id: &str,
    ) -> ProviderResult<()>;

    /// Next normalised event; `None` once the stream is finished.
    async fn next_event(&self) -> Option<ProviderEvent>;

    async fn disconnect(&self);
}

/// Queue half shared by the adapters: receive loop pushes, session pulls.
pub(crate) struct EventQueue {
    tx: mpsc::Sender<ProviderEvent>,
    rx: Mutex<mpsc::Receiver<ProviderEvent>>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<ProviderEvent> {
        self.tx.clone()
    }

    pub async fn recv(&self) -> Option<ProviderEvent> {
        self.rx.lock().await.recv().await
    }
}

/// Typed credential envelopes validated out of the free-form tenant
/// config mapping.
pub mod credentials {
    use super::{ProviderError, ProviderResult};
    use crate::store::ProviderCredentials;

    #[derive(Debug, Clone)]
    pub struct OpenAiCredentials {
        pub api_key: String,
        pub model: String,
    }

    impl OpenAiCredentials {
        pub const DEFAULT_MODEL: &'static str = "gpt-realtime";

        pub fn from_record(record: &ProviderCredentials) -> ProviderResult<Self> {
            let api_key = record
                .config_str("api_key")
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ProviderError::Config("openai api_key missing".into()))?;
            Ok(Self {
                api_key,
                model: record
                    .config_str("model")
                    .unwrap_or_else(|| Self::DEFAULT_MODEL.into()),
            })
        }
    }

    #[derive(Debug, Clone)]
    pub struct ElevenLabsCredentials {
        pub api_key: String,
        pub agent_id: String,
        pub voice_id: Option<String>,
    }

    impl ElevenLabsCredentials {
        pub fn from_record(record: &ProviderCredentials) -> ProviderResult<Self> {
            let api_key = record
                .config_str("api_key")
                .or_else(|| std::env::var("ELEVENLABS_API_KEY").ok())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ProviderError::Config("elevenlabs api_key missing".into()))?;
            let agent_id = record
                .config_str("agent_id")
                .or_else(|| std::env::var("ELEVENLABS_AGENT_ID").ok())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ProviderError::Config("elevenlabs agent_id missing".into()))?;
            Ok(Self {
                api_key,
                agent_id,
                voice_id: record.config_str("voice_id"),
            })
        }
    }

    #[derive(Debug, Clone)]
    pub struct GeminiCredentials {
        pub api_key: String,
        pub model: String,
    }

    impl GeminiCredentials {
        pub const DEFAULT_MODEL: &'static str = "models/gemini-2.5-flash-live";

        pub fn from_record(record: &ProviderCredentials) -> ProviderResult<Self> {
            let api_key = record
                .config_str("api_key")
                .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ProviderError::Config("gemini api_key missing".into()))?;
            Ok(Self {
                api_key,
                model: record
                    .config_str("model")
                    .unwrap_or_else(|| Self::DEFAULT_MODEL.into()),
            })
        }
    }

    #[derive(Debug, Clone)]
    pub struct PipelineCredentials {
        pub stt_url: Option<String>,
        pub stt_api_key: Option<String>,
        pub llm_url: Option<String>,
        pub llm_api_key: Option<String>,
        pub llm_model: String,
        pub tts_url: Option<String>,
        pub tts_api_key: Option<String>,
        pub tts_voice: Option<String>,
    }

    impl PipelineCredentials {
        pub fn from_record(record: &ProviderCredentials) -> ProviderResult<Self> {
            Ok(Self {
                stt_url: record.config_str("stt_url"),
                stt_api_key: record.config_str("stt_api_key"),
                llm_url: record.config_str("llm_url"),
                llm_api_key: record.config_str("llm_api_key"),
                llm_model: record
                    .config_str("llm_model")
                    .unwrap_or_else(|| "llama-3.3-70b-versatile".into()),
                tts_url: record.config_str("tts_url"),
                tts_api_key: record.config_str("tts_api_key"),
                tts_voice: record.config_str("tts_voice"),
            })
        }
    }
}

/// Known provider aliases → canonical adapter names.
pub fn canonical_name(provider_name: &str) -> Option<&'static str> {
    match provider_name {
        "openai" | "openai_realtime" => Some("openai_realtime"),
        "elevenlabs" | "elevenlabs_conversational" => Some("elevenlabs_conversational"),
        "gemini" | "gemini_live" => Some("gemini_live"),
        "custom" | "custom_pipeline" => Some("custom_pipeline"),
        _ => None,
    }
}

pub fn available_providers() -> Vec<&'static str> {
    vec!["openai", "elevenlabs", "gemini", "custom"]
}

/// Build a provider adapter from tenant credentials.
pub fn create_provider(
    provider_name: &str,
    record: &crate::store::ProviderCredentials,
    config: ProviderSessionConfig,
) -> ProviderResult<Box<dyn RealtimeProvider>> {
    let canonical = canonical_name(provider_name).ok_or_else(|| {
        ProviderError::Config(format!(
            "unknown provider: {provider_name} (available: {})",
            available_providers().join(", ")
        ))
    })?;

    tracing::info!(
        provider = canonical,
        domain = %config.domain_id,
        call_id = %config.call_id,
        "creating realtime provider"
    );

    Ok(match canonical {
        "openai_realtime" => Box::new(openai::OpenAiRealtimeProvider::new(
            credentials::OpenAiCredentials::from_record(record)?,
            config,
        )),
        "elevenlabs_conversational" => Box::new(elevenlabs::ElevenLabsProvider::new(
            credentials::ElevenLabsCredentials::from_record(record)?,
            config,
        )),
        "gemini_live" => Box::new(gemini::GeminiLiveProvider::new(
            credentials::GeminiCredentials::from_record(record)?,
            config,
        )),
        "custom_pipeline" => Box::new(pipeline::CustomPipelineProvider::new(
            credentials::PipelineCredentials::from_record(record)?,
            config,
        )),
        _ => unreachable!("canonical_name returned unknown adapter"),
    })
}

/// Factory signature used by the session layer; tests inject fakes.
pub type ProviderFactory = Arc<
    dyn Fn(
            &str,
            &crate::store::ProviderCredentials,
            ProviderSessionConfig,
        ) -> ProviderResult<Box<dyn RealtimeProvider>>
        + Send
        + Sync,
>;

pub fn default_factory() -> ProviderFactory {
    Arc::new(create_provider)
}

/// Render transfer rules into a system-prompt section so the model knows
/// the available departments and how to call `transfer_call`.
pub fn build_transfer_context(rules: &[crate::store::TransferRule], language: &str) -> String {
    if rules.is_empty() {
        return String::new();
    }

    let (header, keywords_label, extension_label, instruction) = if language.starts_with("en") {
        (
            "\n\n## Call Transfer\n\nWhen the customer wants to speak with someone specific or a department, use the `transfer_call` function with the appropriate destination.\n\n### Available Departments:\n",
            "Keywords",
            "Extension",
            "\n### Instructions:\n- Identify the customer's intent based on keywords or context\n- Use `transfer_call(destination=\"EXT\", department=\"NAME\")` to transfer\n- Always confirm the transfer with the customer before executing\n",
        )
    } else {
        (
            "\n\n## Transferência de Chamadas\n\nQuando o cliente quiser falar com alguém específico ou um departamento, use a função `transfer_call` com o destino apropriado.\n\n### Departamentos Disponíveis:\n",
            "Keywords",
            "Ramal",
            "\n### Instruções:\n- Identifique a intenção do cliente baseado nas keywords ou contexto\n- Use `transfer_call(destination=\"RAMAL\", department=\"NOME\")` para transferir\n- Sempre confirme a transferência com o cliente antes de executar\n",
        )
    };

    let mut lines = vec![header.to_owned()];
    for rule in rules {
        let mut keywords: Vec<&str> = rule
            .intent_keywords
            .iter()
            .take(5)
            .map(String::as_str)
            .collect();
        if rule.intent_keywords.len() > 5 {
            keywords.push("...");
        }
        lines.push(format!(
            "- **{}** ({} {})",
            rule.department_name, extension_label, rule.destination_number
        ));
        if !keywords.is_empty() {
            lines.push(format!("  - {}: {}", keywords_label, keywords.join(", ")));
        }
        if let Some(msg) = &rule.transfer_message {
            lines.push(format!("  - Mensagem: \"{msg}\""));
        }
    }
    lines.push(instruction.to_owned());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DestinationType, TransferRule};

    #[test]
    fn canonical_names_cover_aliases() {
        assert_eq!(canonical_name("openai"), Some("openai_realtime"));
        assert_eq!(canonical_name("openai_realtime"), Some("openai_realtime"));
        assert_eq!(
            canonical_name("elevenlabs"),
            Some("elevenlabs_conversational")
        );
        assert_eq!(canonical_name("gemini_live"), Some("gemini_live"));
        assert_eq!(canonical_name("custom"), Some("custom_pipeline"));
        assert_eq!(canonical_name("nope"), None);
    }

    #[test]
    fn default_tools_carry_builtin_vocabulary() {
        let tools = default_tools();
        let names: Vec<&str> = tools
            .iter()
            .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
            .collect();
        assert_eq!(names, vec!["transfer_call", "end_call", "request_handoff"]);
    }

    #[test]
    fn fatal_event_classification() {
        assert!(ProviderEvent::SessionEnded { reason: "x".into() }.is_fatal());
        assert!(ProviderEvent::RateLimited {
            info: serde_json::json!({})
        }
        .is_fatal());
        assert!(!ProviderEvent::AudioDone.is_fatal());
        assert!(!ProviderEvent::SpeechStarted.is_fatal());
    }

    #[test]
    fn eagerness_is_normalised() {
        assert_eq!(VadMode::normalized_eagerness("high"), "high");
        assert_eq!(VadMode::normalized_eagerness("whenever"), "medium");
    }

    #[test]
    fn transfer_context_lists_departments() {
        let rules = vec![TransferRule {
            rule_id: "r1".into(),
            domain_id: "t1".into(),
            secretary_id: None,
            department_name: "Vendas".into(),
            intent_keywords: vec!["comprar".into(), "plano".into()],
            destination_type: DestinationType::Extension,
            destination_number: "1000".into(),
            destination_context: "default".into(),
            transfer_message: Some("Transferindo para vendas".into()),
            priority: 1,
            ring_timeout_seconds: 30,
            max_retries: 2,
            working_hours: None,
            synonyms: Vec::new(),
            is_enabled: true,
        }];
        let ctx = build_transfer_context(&rules, "pt-BR");
        assert!(ctx.contains("Vendas"));
        assert!(ctx.contains("1000"));
        assert!(ctx.contains("transfer_call"));
        assert!(ctx.contains("comprar"));

        assert!(build_transfer_context(&[], "pt-BR").is_empty());
    }
}
