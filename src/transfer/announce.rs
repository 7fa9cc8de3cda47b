//! TTS announcements played to the human side of an announced transfer.
//!
//! The announcement is rendered with the same ElevenLabs voice the
//! secretary uses, written out as a 16 kHz WAV the media server can play
//! with `uuid_broadcast`. When the TTS call fails, the caller falls back
//! to a generic prompt file shipped with the media server.

use std::path::PathBuf;
use std::time::Duration;

/// Stock prompt used when synthesis is unavailable.
pub const FALLBACK_PROMPT: &str =
    "/usr/share/freeswitch/sounds/en/us/callie/ivr/ivr-one_moment_please.wav";

const TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";

pub struct AnnouncementTts {
    api_key: Option<String>,
    http: reqwest::Client,
    scratch_dir: PathBuf,
}

impl AnnouncementTts {
    pub fn new(api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            http,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Render `text` to a playable WAV; `None` when synthesis is not
    /// possible (caller should use [`FALLBACK_PROMPT`]).
    pub async fn generate(&self, text: &str, voice_id: Option<&str>) -> Option<PathBuf> {
        let api_key = self.api_key.as_deref()?;
        let voice = voice_id.unwrap_or(DEFAULT_VOICE);
        let url = format!("{TTS_URL}/{voice}?output_format=pcm_16000");

        let response = self
            .http
            .post(&url)
            .header("xi-api-key", api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": "eleven_multilingual_v2",
            }))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "announcement tts rejected");
            return None;
        }
        let pcm = response.bytes().await.ok()?;
        if pcm.is_empty() {
            return None;
        }

        let path = self
            .scratch_dir
            .join(format!("voxbridge-announce-{}.wav", uuid::Uuid::new_v4()));
        match write_wav(&path, &pcm, 16_000) {
            Ok(()) => {
                tracing::info!(path = %path.display(), bytes = pcm.len(), "announcement rendered");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed writing announcement wav");
                None
            }
        }
    }
}

/// Write PCM16LE mono samples into a WAV container.
fn write_wav(path: &std::path::Path, pcm: &[u8], sample_rate: u32) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()
}
