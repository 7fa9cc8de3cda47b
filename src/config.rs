//! Environment-driven runtime settings.
//!
//! Every deployment knob comes from the process environment; the CLI can
//! override host/port/mode. An unrecognised `AUDIO_MODE` is a startup
//! error, not a fallback.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How call audio reaches this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// mod_audio_stream WebSocket only.
    Websocket,
    /// ESL outbound + direct RTP media.
    Rtp,
    /// Alias kept for older dialplans; same plane as `Rtp`.
    Esl,
    /// WebSocket media + ESL outbound events.
    Dual,
}

impl AudioMode {
    pub fn uses_websocket(self) -> bool {
        matches!(self, Self::Websocket | Self::Dual)
    }

    pub fn uses_esl_server(self) -> bool {
        matches!(self, Self::Rtp | Self::Esl | Self::Dual)
    }

    /// Whether the ESL outbound leg owns media (RTP plane).
    pub fn esl_owns_media(self) -> bool {
        matches!(self, Self::Rtp | Self::Esl)
    }
}

impl FromStr for AudioMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "websocket" => Ok(Self::Websocket),
            "rtp" => Ok(Self::Rtp),
            "esl" => Ok(Self::Esl),
            "dual" => Ok(Self::Dual),
            other => Err(format!(
                "unknown AUDIO_MODE: {other} (valid: websocket, rtp, esl, dual)"
            )),
        }
    }
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Websocket => "websocket",
            Self::Rtp => "rtp",
            Self::Esl => "esl",
            Self::Dual => "dual",
        };
        f.write_str(name)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Object-storage (S3-compatible) settings for call recordings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: String,
    pub region: String,
    pub use_ssl: bool,
    pub public_url: String,
}

impl StorageSettings {
    fn from_env() -> Self {
        let endpoint = env_string("MINIO_ENDPOINT", "storage.local");
        let use_ssl = env_string("MINIO_USE_SSL", "true").to_lowercase() == "true";
        let scheme = if use_ssl { "https" } else { "http" };
        Self {
            public_url: env_opt("MINIO_PUBLIC_URL")
                .unwrap_or_else(|| format!("{scheme}://{endpoint}")),
            access_key: env_opt("MINIO_ACCESS_KEY"),
            secret_key: env_opt("MINIO_SECRET_KEY"),
            bucket: env_string("MINIO_BUCKET", "voice-recordings"),
            region: env_string("MINIO_REGION", "us-east-1"),
            use_ssl,
            endpoint,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.access_key.is_some() && self.secret_key.is_some()
    }
}

/// Process-wide runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub audio_mode: AudioMode,

    // Media WebSocket server.
    pub realtime_host: String,
    pub realtime_port: u16,

    // ESL outbound event-relay server.
    pub esl_server_host: String,
    pub esl_server_port: u16,

    // ESL inbound client.
    pub esl_host: String,
    pub esl_port: u16,
    pub esl_password: String,

    // Session limits.
    pub max_sessions_per_domain: usize,
    pub max_total_sessions: usize,
    pub session_idle_timeout: Duration,
    pub session_max_duration: Duration,

    pub media_sample_rate: u32,

    // Transfer defaults.
    pub transfer_default_timeout: u32,
    pub transfer_music_on_hold: String,
    pub transfer_announce_enabled: bool,

    // Handoff / orchestrator.
    pub orchestrator_api_url: String,
    pub orchestrator_service_token: Option<String>,
    pub handoff_keywords: Vec<String>,
    pub dev_test_number: Option<String>,

    // RTP plane.
    pub rtp_bind_address: String,
    pub rtp_jitter_min_ms: u32,
    pub rtp_jitter_max_ms: u32,
    pub rtp_jitter_target_ms: u32,

    pub storage: StorageSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, String> {
        let audio_mode: AudioMode = env_string("AUDIO_MODE", "websocket").parse()?;

        let handoff_keywords = env_string(
            "HANDOFF_KEYWORDS",
            "atendente,humano,pessoa,operador,falar com alguém",
        )
        .split(',')
        .map(|k| k.trim().to_owned())
        .filter(|k| !k.is_empty())
        .collect();

        Ok(Self {
            audio_mode,
            realtime_host: env_string("REALTIME_HOST", "0.0.0.0"),
            realtime_port: env_parse("REALTIME_PORT", 8085),
            esl_server_host: env_string("ESL_SERVER_HOST", "0.0.0.0"),
            esl_server_port: env_parse("ESL_SERVER_PORT", 8022),
            esl_host: env_string("ESL_HOST", "127.0.0.1"),
            esl_port: env_parse("ESL_PORT", 8021),
            esl_password: env_string("ESL_PASSWORD", "ClueCon"),
            max_sessions_per_domain: env_parse("MAX_SESSIONS_PER_DOMAIN", 10),
            max_total_sessions: env_parse("MAX_TOTAL_SESSIONS", 100),
            session_idle_timeout: Duration::from_secs(env_parse(
                "SESSION_IDLE_TIMEOUT_SECONDS",
                30,
            )),
            session_max_duration: Duration::from_secs(env_parse(
                "SESSION_MAX_DURATION_SECONDS",
                600,
            )),
            media_sample_rate: env_parse("FREESWITCH_SAMPLE_RATE", 16_000),
            transfer_default_timeout: env_parse("TRANSFER_DEFAULT_TIMEOUT", 30),
            transfer_music_on_hold: env_string("TRANSFER_MUSIC_ON_HOLD", "local_stream://moh"),
            transfer_announce_enabled: env_string("TRANSFER_ANNOUNCE_ENABLED", "true")
                .to_lowercase()
                == "true",
            orchestrator_api_url: env_string("OMNIPLAY_API_URL", "http://127.0.0.1:8080"),
            orchestrator_service_token: env_opt("VOICE_AI_SERVICE_TOKEN"),
            handoff_keywords,
            dev_test_number: env_opt("DEV_TEST_NUMBER"),
            rtp_bind_address: env_string("RTP_BIND_ADDRESS", "0.0.0.0"),
            rtp_jitter_min_ms: env_parse("RTP_JITTER_MIN_MS", 60),
            rtp_jitter_max_ms: env_parse("RTP_JITTER_MAX_MS", 200),
            rtp_jitter_target_ms: env_parse("RTP_JITTER_TARGET_MS", 100),
            storage: StorageSettings::from_env(),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audio_mode: AudioMode::Websocket,
            realtime_host: "0.0.0.0".into(),
            realtime_port: 8085,
            esl_server_host: "0.0.0.0".into(),
            esl_server_port: 8022,
            esl_host: "127.0.0.1".into(),
            esl_port: 8021,
            esl_password: "ClueCon".into(),
            max_sessions_per_domain: 10,
            max_total_sessions: 100,
            session_idle_timeout: Duration::from_secs(30),
            session_max_duration: Duration::from_secs(600),
            media_sample_rate: 16_000,
            transfer_default_timeout: 30,
            transfer_music_on_hold: "local_stream://moh".into(),
            transfer_announce_enabled: true,
            orchestrator_api_url: "http://127.0.0.1:8080".into(),
            orchestrator_service_token: None,
            handoff_keywords: vec![
                "atendente".into(),
                "humano".into(),
                "pessoa".into(),
                "operador".into(),
                "falar com alguém".into(),
            ],
            dev_test_number: Some("5518999999999".into()),
            rtp_bind_address: "0.0.0.0".into(),
            rtp_jitter_min_ms: 60,
            rtp_jitter_max_ms: 200,
            rtp_jitter_target_ms: 100,
            storage: StorageSettings {
                endpoint: "storage.local".into(),
                access_key: None,
                secret_key: None,
                bucket: "voice-recordings".into(),
                region: "us-east-1".into(),
                use_ssl: true,
                public_url: "https://storage.local".into(),
            },
        }
    }
}
