//! Composed STT → LLM → TTS pipeline provider.
//!
//! The cost/offline profile: instead of one realtime socket, speech
//! boundaries are detected locally, the finished utterance is transcribed
//! over HTTP, a chat completion produces the reply, and a TTS call
//! renders it. Results travel through the same event queue as the
//! realtime adapters, so the session layer cannot tell the difference.
//!
//! ```text
//! send_audio ─▸ energy VAD ─▸ utterance buffer ─▸ STT ─▸ LLM ─▸ TTS
//!                                   │                            │
//!                            SpeechStarted/Stopped        AudioDelta/Done
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::credentials::PipelineCredentials;
use super::{
    EventQueue, ProviderError, ProviderEvent, ProviderResult, ProviderSessionConfig,
    RealtimeProvider,
};

/// RMS threshold above which a chunk counts as speech.
const SPEECH_ENERGY_THRESHOLD: f64 = 500.0;

/// Minimum utterance worth transcribing (~100 ms @16 kHz PCM16).
const MIN_UTTERANCE_BYTES: usize = 3_200;

struct PipelineInner {
    credentials: PipelineCredentials,
    config: ProviderSessionConfig,
    http: reqwest::Client,
    events: EventQueue,
    /// Chat history including the system prompt.
    messages: parking_lot::Mutex<Vec<Value>>,
    utterance: parking_lot::Mutex<Vec<u8>>,
    speaking: AtomicBool,
    connected: AtomicBool,
}

pub struct CustomPipelineProvider {
    inner: Arc<PipelineInner>,
}

impl CustomPipelineProvider {
    pub fn new(credentials: PipelineCredentials, config: ProviderSessionConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(PipelineInner {
                credentials,
                config,
                http,
                events: EventQueue::new(256),
                messages: parking_lot::Mutex::new(Vec::new()),
                utterance: parking_lot::Mutex::new(Vec::new()),
                speaking: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// Energy-based speech detection on one PCM16 chunk.
    fn is_speech(pcm: &[u8]) -> bool {
        if pcm.len() < 2 {
            return false;
        }
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for chunk in pcm.chunks_exact(2) {
            let s = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
            sum += s * s;
            count += 1;
        }
        (sum / count as f64).sqrt() > SPEECH_ENERGY_THRESHOLD
    }
}

impl PipelineInner {
    async fn emit(&self, event: ProviderEvent) {
        let _ = self.events.sender().send(event).await;
    }

    /// Run one utterance through STT → LLM → TTS.
    async fn process_utterance(self: Arc<Self>, audio: Vec<u8>) {
        let text = match self.transcribe(&audio).await {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(call_id = %self.config.call_id, error = %e, "pipeline stt failed");
                return;
            }
        };

        self.emit(ProviderEvent::UserTranscript { text: text.clone() })
            .await;
        self.messages
            .lock()
            .push(json!({ "role": "user", "content": text }));

        let reply = match self.complete().await {
            Ok(Some(reply)) if !reply.is_empty() => reply,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(call_id = %self.config.call_id, error = %e, "pipeline llm failed");
                return;
            }
        };

        self.messages
            .lock()
            .push(json!({ "role": "assistant", "content": reply.clone() }));
        self.emit(ProviderEvent::ResponseStarted).await;
        self.emit(ProviderEvent::TranscriptDone { text: reply.clone() })
            .await;

        match self.synthesize(&reply).await {
            Ok(Some(audio)) => {
                self.emit(ProviderEvent::AudioDelta { audio }).await;
                self.emit(ProviderEvent::AudioDone).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(call_id = %self.config.call_id, error = %e, "pipeline tts failed");
            }
        }
        self.emit(ProviderEvent::ResponseDone {
            status: "completed".into(),
        })
        .await;
    }

    /// POST raw PCM to the STT endpoint; expects `{"text": …}`.
    async fn transcribe(&self, audio: &[u8]) -> anyhow::Result<Option<String>> {
        let Some(url) = self.credentials.stt_url.as_deref() else {
            tracing::debug!("pipeline stt endpoint not configured");
            return Ok(None);
        };
        let mut request = self
            .http
            .post(url)
            .header("Content-Type", "audio/l16;rate=16000")
            .body(audio.to_vec());
        if let Some(key) = &self.credentials.stt_api_key {
            request = request.bearer_auth(key);
        }
        let response: Value = request.send().await?.error_for_status()?.json().await?;
        Ok(response
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    /// OpenAI-compatible chat completion over the accumulated history.
    async fn complete(&self) -> anyhow::Result<Option<String>> {
        let Some(url) = self.credentials.llm_url.as_deref() else {
            tracing::debug!("pipeline llm endpoint not configured");
            return Ok(None);
        };
        let messages = self.messages.lock().clone();
        let mut request = self.http.post(url).json(&json!({
            "model": self.credentials.llm_model.clone(),
            "messages": messages,
            "max_tokens": 200,
        }));
        if let Some(key) = &self.credentials.llm_api_key {
            request = request.bearer_auth(key);
        }
        let response: Value = request.send().await?.error_for_status()?.json().await?;
        Ok(response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_owned))
    }

    /// POST text to the TTS endpoint; expects raw PCM16 @16 kHz back.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(url) = self.credentials.tts_url.as_deref() else {
            tracing::debug!("pipeline tts endpoint not configured");
            return Ok(None);
        };
        let mut request = self.http.post(url).json(&json!({
            "text": text,
            "voice": self.credentials.tts_voice.clone(),
            "sample_rate": 16000,
        }));
        if let Some(key) = &self.credentials.tts_api_key {
            request = request.bearer_auth(key);
        }
        let bytes = request.send().await?.error_for_status()?.bytes().await?;
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait]
impl RealtimeProvider for CustomPipelineProvider {
    fn name(&self) -> &'static str {
        "custom_pipeline"
    }

    fn input_sample_rate(&self) -> u32 {
        16_000
    }

    fn output_sample_rate(&self) -> u32 {
        16_000
    }

    async fn connect(&mut self) -> ProviderResult<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            call_id = %self.inner.config.call_id,
            domain = %self.inner.config.domain_id,
            "custom pipeline initialised"
        );
        Ok(())
    }

    async fn configure(&mut self) -> ProviderResult<()> {
        {
            let mut messages = self.inner.messages.lock();
            messages.clear();
            if !self.inner.config.system_prompt.is_empty() {
                messages.push(json!({
                    "role": "system",
                    "content": self.inner.config.system_prompt.clone(),
                }));
            }
        }

        // Greeting renders straight to audio without an LLM round trip.
        if let Some(first) = self.inner.config.first_message.clone() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.emit(ProviderEvent::ResponseStarted).await;
                inner
                    .emit(ProviderEvent::TranscriptDone {
                        text: first.clone(),
                    })
                    .await;
                match inner.synthesize(&first).await {
                    Ok(Some(audio)) => {
                        inner.emit(ProviderEvent::AudioDelta { audio }).await;
                        inner.emit(ProviderEvent::AudioDone).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "pipeline greeting tts failed");
                    }
                }
                inner
                    .emit(ProviderEvent::ResponseDone {
                        status: "completed".into(),
                    })
                    .await;
            });
        }
        Ok(())
    }

    async fn send_audio(&self, pcm: &[u8]) -> ProviderResult<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(ProviderError::NotConnected);
        }
        if pcm.is_empty() {
            return Ok(());
        }

        self.inner.utterance.lock().extend_from_slice(pcm);
        let speech = Self::is_speech(pcm);
        let was_speaking = self.inner.speaking.load(Ordering::SeqCst);

        if speech && !was_speaking {
            self.inner.speaking.store(true, Ordering::SeqCst);
            self.inner.emit(ProviderEvent::SpeechStarted).await;
        }

        if !speech && was_speaking {
            self.inner.speaking.store(false, Ordering::SeqCst);
            self.inner.emit(ProviderEvent::SpeechStopped).await;

            let utterance = std::mem::take(&mut *self.inner.utterance.lock());
            if utterance.len() >= MIN_UTTERANCE_BYTES {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(inner.process_utterance(utterance));
            }
        }
        Ok(())
    }

    async fn send_text(&self, text: &str) -> ProviderResult<()> {
        self.inner
            .messages
            .lock()
            .push(json!({ "role": "user", "content": text }));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let reply = match inner.complete().await {
                Ok(Some(reply)) if !reply.is_empty() => reply,
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "pipeline llm failed for text input");
                    return;
                }
            };
            inner
                .messages
                .lock()
                .push(json!({ "role": "assistant", "content": reply.clone() }));
            inner.emit(ProviderEvent::ResponseStarted).await;
            inner
                .emit(ProviderEvent::TranscriptDone { text: reply.clone() })
                .await;
            if let Ok(Some(audio)) = inner.synthesize(&reply).await {
                inner.emit(ProviderEvent::AudioDelta { audio }).await;
                inner.emit(ProviderEvent::AudioDone).await;
            }
            inner
                .emit(ProviderEvent::ResponseDone {
                    status: "completed".into(),
                })
                .await;
        });
        Ok(())
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        // Drop whatever was buffered; in-flight HTTP work finishes but its
        // audio lands after a warmup reset and is discarded by the session.
        self.inner.utterance.lock().clear();
        Ok(())
    }

    async fn send_function_result(
        &self,
        _function_name: &str,
        _result: Value,
        _call_id: &str,
    ) -> ProviderResult<()> {
        // The composed pipeline has no function-calling surface.
        Ok(())
    }

    async fn next_event(&self) -> Option<ProviderEvent> {
        self.inner.events.recv().await
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        tracing::info!(call_id = %self.inner.config.call_id, "custom pipeline disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn silence_is_not_speech() {
        assert!(!CustomPipelineProvider::is_speech(&pcm(&[0i16; 320])));
        assert!(!CustomPipelineProvider::is_speech(&[]));
    }

    #[test]
    fn loud_signal_is_speech() {
        let loud: Vec<i16> = (0..320)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();
        assert!(CustomPipelineProvider::is_speech(&pcm(&loud)));
    }

    #[tokio::test]
    async fn speech_boundaries_emit_vad_events() {
        let mut provider = CustomPipelineProvider::new(
            PipelineCredentials {
                stt_url: None,
                stt_api_key: None,
                llm_url: None,
                llm_api_key: None,
                llm_model: "m".into(),
                tts_url: None,
                tts_api_key: None,
                tts_voice: None,
            },
            ProviderSessionConfig::default(),
        );
        provider.connect().await.unwrap();

        let loud: Vec<i16> = (0..1600)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();
        provider.send_audio(&pcm(&loud)).await.unwrap();
        assert_eq!(
            provider.next_event().await,
            Some(ProviderEvent::SpeechStarted)
        );

        provider.send_audio(&pcm(&[0i16; 1600])).await.unwrap();
        assert_eq!(
            provider.next_event().await,
            Some(ProviderEvent::SpeechStopped)
        );
    }

    #[tokio::test]
    async fn interrupt_clears_utterance_buffer() {
        let mut provider = CustomPipelineProvider::new(
            PipelineCredentials {
                stt_url: None,
                stt_api_key: None,
                llm_url: None,
                llm_api_key: None,
                llm_model: "m".into(),
                tts_url: None,
                tts_api_key: None,
                tts_voice: None,
            },
            ProviderSessionConfig::default(),
        );
        provider.connect().await.unwrap();
        provider.send_audio(&vec![1u8; 1000]).await.unwrap();
        provider.interrupt().await.unwrap();
        assert!(provider.inner.utterance.lock().is_empty());
    }

    #[test]
    fn rates_match_media_leg() {
        let provider = CustomPipelineProvider::new(
            PipelineCredentials {
                stt_url: None,
                stt_api_key: None,
                llm_url: None,
                llm_api_key: None,
                llm_model: "m".into(),
                tts_url: None,
                tts_api_key: None,
                tts_voice: None,
            },
            ProviderSessionConfig::default(),
        );
        assert_eq!(provider.input_sample_rate(), 16_000);
        assert_eq!(provider.output_sample_rate(), 16_000);
        assert_eq!(provider.name(), "custom_pipeline");
    }
}
