//! Prometheus metrics plus a per-call stats mirror.
//!
//! The registry feeds whatever scrape endpoint the deployment wires up;
//! the in-memory [`SessionStats`] mirror exists so handoff payloads can
//! report turns and average latency without querying the registry.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};

/// Latency buckets in seconds, tuned for voice turnaround.
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0];

fn now_epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Live counters for one session.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub domain_id: String,
    pub call_id: String,
    pub provider: String,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub audio_chunks_received: u64,
    pub audio_chunks_sent: u64,
    pub audio_bytes_received: u64,
    pub audio_bytes_sent: u64,
    pub turns_completed: u64,
    pub response_latencies_ms: Vec<f64>,
    pub playback_underruns: u64,
    pub barge_in_count: u64,
    pub health_score: f64,
}

impl SessionStats {
    fn new(domain_id: String, call_id: String, provider: String) -> Self {
        Self {
            domain_id,
            call_id,
            provider,
            started_at: now_epoch_seconds(),
            ended_at: None,
            audio_chunks_received: 0,
            audio_chunks_sent: 0,
            audio_bytes_received: 0,
            audio_bytes_sent: 0,
            turns_completed: 0,
            response_latencies_ms: Vec::new(),
            playback_underruns: 0,
            barge_in_count: 0,
            health_score: 100.0,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.ended_at.unwrap_or_else(now_epoch_seconds) - self.started_at
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.response_latencies_ms.is_empty() {
            return 0.0;
        }
        self.response_latencies_ms.iter().sum::<f64>() / self.response_latencies_ms.len() as f64
    }
}

pub struct BridgeMetrics {
    registry: Registry,
    calls_total: CounterVec,
    audio_chunks: CounterVec,
    audio_bytes: CounterVec,
    response_latency: HistogramVec,
    active_sessions: GaugeVec,
    health_score: GaugeVec,
    sessions: Mutex<HashMap<String, SessionStats>>,
}

impl BridgeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let calls_total = CounterVec::new(
            Opts::new("voice_ai_realtime_calls_total", "Total calls"),
            &["domain", "provider", "outcome"],
        )?;
        let audio_chunks = CounterVec::new(
            Opts::new("voice_ai_realtime_audio_chunks_total", "Audio chunks"),
            &["domain", "direction"],
        )?;
        let audio_bytes = CounterVec::new(
            Opts::new("voice_ai_realtime_audio_bytes_total", "Audio bytes"),
            &["domain", "direction"],
        )?;
        let response_latency = HistogramVec::new(
            HistogramOpts::new(
                "voice_ai_realtime_response_latency_seconds",
                "Response latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["domain", "provider"],
        )?;
        let active_sessions = GaugeVec::new(
            Opts::new("voice_ai_realtime_active_sessions", "Active sessions"),
            &["domain", "provider"],
        )?;
        let health_score = GaugeVec::new(
            Opts::new(
                "voice_ai_realtime_health_score",
                "Realtime health score (0-100)",
            ),
            &["domain", "provider"],
        )?;

        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(audio_chunks.clone()))?;
        registry.register(Box::new(audio_bytes.clone()))?;
        registry.register(Box::new(response_latency.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(health_score.clone()))?;

        Ok(Self {
            registry,
            calls_total,
            audio_chunks,
            audio_bytes,
            response_latency,
            active_sessions,
            health_score,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn session_started(&self, domain_id: &str, call_id: &str, provider: &str) {
        self.sessions.lock().insert(
            call_id.to_owned(),
            SessionStats::new(domain_id.to_owned(), call_id.to_owned(), provider.to_owned()),
        );
        self.active_sessions
            .with_label_values(&[domain_id, provider])
            .inc();
        tracing::info!(domain = domain_id, call_id, provider, "realtime session started");
    }

    pub fn session_ended(&self, call_id: &str, outcome: &str) -> Option<SessionStats> {
        let mut stats = self.sessions.lock().remove(call_id)?;
        stats.ended_at = Some(now_epoch_seconds());

        self.calls_total
            .with_label_values(&[&stats.domain_id, &stats.provider, outcome])
            .inc();
        self.active_sessions
            .with_label_values(&[&stats.domain_id, &stats.provider])
            .dec();
        self.health_score
            .with_label_values(&[&stats.domain_id, &stats.provider])
            .set(stats.health_score);

        tracing::info!(
            domain = %stats.domain_id,
            call_id,
            outcome,
            duration_seconds = stats.duration_seconds(),
            avg_latency_ms = stats.avg_latency_ms(),
            "realtime session ended"
        );
        Some(stats)
    }

    pub fn record_latency(&self, call_id: &str, latency_seconds: f64) {
        let mut sessions = self.sessions.lock();
        if let Some(stats) = sessions.get_mut(call_id) {
            stats.response_latencies_ms.push(latency_seconds * 1000.0);
            stats.turns_completed += 1;
            self.response_latency
                .with_label_values(&[&stats.domain_id, &stats.provider])
                .observe(latency_seconds);
        }
    }

    pub fn record_audio(&self, call_id: &str, direction: &str, byte_count: usize) {
        let mut sessions = self.sessions.lock();
        if let Some(stats) = sessions.get_mut(call_id) {
            if direction == "in" {
                stats.audio_chunks_received += 1;
                stats.audio_bytes_received += byte_count as u64;
            } else {
                stats.audio_chunks_sent += 1;
                stats.audio_bytes_sent += byte_count as u64;
            }
            self.audio_chunks
                .with_label_values(&[&stats.domain_id, direction])
                .inc();
            self.audio_bytes
                .with_label_values(&[&stats.domain_id, direction])
                .inc_by(byte_count as f64);
        }
    }

    pub fn record_playback_underrun(&self, call_id: &str) {
        if let Some(stats) = self.sessions.lock().get_mut(call_id) {
            stats.playback_underruns += 1;
        }
    }

    pub fn record_barge_in(&self, call_id: &str) {
        if let Some(stats) = self.sessions.lock().get_mut(call_id) {
            stats.barge_in_count += 1;
        }
    }

    pub fn update_health_score(&self, call_id: &str, score: f64) {
        let mut sessions = self.sessions.lock();
        if let Some(stats) = sessions.get_mut(call_id) {
            stats.health_score = score.clamp(0.0, 100.0);
            self.health_score
                .with_label_values(&[&stats.domain_id, &stats.provider])
                .set(stats.health_score);
        }
    }

    /// Provider changed mid-call (fallback rotation).
    pub fn update_provider(&self, call_id: &str, provider: &str) {
        if let Some(stats) = self.sessions.lock().get_mut(call_id) {
            stats.provider = provider.to_owned();
        }
    }

    pub fn session_stats(&self, call_id: &str) -> Option<SessionStats> {
        self.sessions.lock().get(call_id).cloned()
    }

    pub fn avg_latency_ms(&self, call_id: &str) -> Option<f64> {
        self.sessions.lock().get(call_id).map(SessionStats::avg_latency_ms)
    }
}
