//! Centralised registry of live sessions with tenant and global caps.
//!
//! A session exists in the manager exactly while it is live: create
//! registers under the manager lock (caps checked there, before any
//! provider connect), and a reaper task removes entries the moment a
//! session reports itself ended, decrementing the tenant count.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::{Session, SessionConfig, SessionError};
use crate::esl::command::EslCommandInterface;
use crate::services::Services;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub total_sessions: usize,
    pub sessions_by_domain: HashMap<String, usize>,
    pub max_per_domain: usize,
    pub max_total: usize,
}

#[derive(Default)]
struct ManagerInner {
    sessions: HashMap<String, Session>,
    domain_counts: HashMap<String, usize>,
}

pub struct SessionManager {
    services: Arc<Services>,
    max_per_domain: usize,
    max_total: usize,
    inner: parking_lot::Mutex<ManagerInner>,
    ended_tx: mpsc::UnboundedSender<(String, String)>,
}

impl SessionManager {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<(String, String)>();
        let max_per_domain = services.settings.max_sessions_per_domain;
        let max_total = services.settings.max_total_sessions;

        let manager = Arc::new(Self {
            services,
            max_per_domain,
            max_total,
            inner: parking_lot::Mutex::new(ManagerInner::default()),
            ended_tx,
        });

        // Reaper: sessions report (call_id, reason) when they finish.
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some((call_id, reason)) = ended_rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                tracing::debug!(call_id = %call_id, reason = %reason, "reaping ended session");
                manager.remove(&call_id);
            }
        });

        manager
    }

    /// Register and start a session. Caps and duplicates are checked
    /// under the lock before the provider is ever contacted; a start
    /// failure removes the registration so no partial state survives.
    pub async fn create(
        &self,
        config: SessionConfig,
        esl: Arc<dyn EslCommandInterface>,
        audio_out: mpsc::Sender<Vec<u8>>,
    ) -> Result<Session, SessionError> {
        let session = {
            let mut inner = self.inner.lock();

            if inner.sessions.len() >= self.max_total {
                return Err(SessionError::GlobalLimit);
            }
            let domain_count = inner
                .domain_counts
                .get(&config.domain_id)
                .copied()
                .unwrap_or(0);
            if domain_count >= self.max_per_domain {
                return Err(SessionError::TenantLimit {
                    domain: config.domain_id.clone(),
                });
            }
            if inner.sessions.contains_key(&config.call_id) {
                return Err(SessionError::Duplicate {
                    call_id: config.call_id.clone(),
                });
            }

            let session = Session::new(
                config.clone(),
                Arc::clone(&self.services),
                esl,
                audio_out,
                self.ended_tx.clone(),
            );
            inner
                .sessions
                .insert(config.call_id.clone(), session.clone());
            *inner
                .domain_counts
                .entry(config.domain_id.clone())
                .or_insert(0) += 1;

            tracing::info!(
                call_id = %config.call_id,
                domain = %config.domain_id,
                active_sessions = inner.sessions.len(),
                "session created"
            );
            session
        };

        if let Err(e) = session.start().await {
            self.remove(session.call_id());
            return Err(e);
        }
        Ok(session)
    }

    pub fn get(&self, call_id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(call_id).cloned()
    }

    /// Drop the registration and decrement the tenant counter. True when
    /// the call was present.
    pub fn remove(&self, call_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.remove(call_id) else {
            return false;
        };
        let domain = session.domain_id().to_owned();
        if let Some(count) = inner.domain_counts.get_mut(&domain) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.domain_counts.remove(&domain);
            }
        }
        true
    }

    pub async fn stop(&self, call_id: &str, reason: &str) -> bool {
        let Some(session) = self.get(call_id) else {
            return false;
        };
        session.stop(reason).await;
        self.remove(call_id);
        true
    }

    pub async fn stop_all(&self, reason: &str) -> usize {
        let call_ids: Vec<String> = self.inner.lock().sessions.keys().cloned().collect();
        let mut count = 0;
        for call_id in call_ids {
            if self.stop(&call_id, reason).await {
                count += 1;
            }
        }
        count
    }

    /// Stop sessions idle past their own configured timeout.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|s| s.idle_for() > self.services.settings.session_idle_timeout)
                .map(|s| s.call_id().to_owned())
                .collect()
        };
        let mut count = 0;
        for call_id in expired {
            if self.stop(&call_id, "expired").await {
                count += 1;
            }
        }
        count
    }

    /// Deliver caller audio to a session; false when there is none live.
    pub async fn route_audio(&self, call_id: &str, audio: &[u8]) -> bool {
        let Some(session) = self.get(call_id) else {
            return false;
        };
        if !session.is_active() {
            return false;
        }
        session.handle_audio_input(audio).await;
        true
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn domain_session_count(&self, domain_id: &str) -> usize {
        self.inner
            .lock()
            .domain_counts
            .get(domain_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> ManagerStats {
        let inner = self.inner.lock();
        ManagerStats {
            total_sessions: inner.sessions.len(),
            sessions_by_domain: inner.domain_counts.clone(),
            max_per_domain: self.max_per_domain,
            max_total: self.max_total,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::providers::{
        ProviderError, ProviderEvent, ProviderResult, ProviderSessionConfig, RealtimeProvider,
    };
    use crate::session::SessionState;
    use crate::store::{MemoryStore, ProviderCredentials, SecretaryRecord};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records every call made against the mock provider.
    #[derive(Debug, Clone, PartialEq)]
    pub enum MockCall {
        Connect,
        Configure,
        Audio(usize),
        Text(String),
        Interrupt,
        FunctionResult(String),
        Disconnect,
    }

    pub struct MockProviderState {
        pub calls: Mutex<Vec<MockCall>>,
        pub events_tx: Mutex<Option<mpsc::Sender<ProviderEvent>>>,
        pub connects: AtomicUsize,
    }

    impl MockProviderState {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                events_tx: Mutex::new(None),
                connects: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().clone()
        }

        pub async fn emit(&self, event: ProviderEvent) {
            let tx = self.events_tx.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(event).await;
            }
        }

        pub fn interrupts(&self) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| matches!(c, MockCall::Interrupt))
                .count()
        }
    }

    pub struct MockProvider {
        state: Arc<MockProviderState>,
        events_rx: tokio::sync::Mutex<mpsc::Receiver<ProviderEvent>>,
        input_rate: u32,
        output_rate: u32,
    }

    impl MockProvider {
        pub fn new(state: Arc<MockProviderState>, input_rate: u32, output_rate: u32) -> Self {
            let (tx, rx) = mpsc::channel(64);
            *state.events_tx.lock() = Some(tx);
            Self {
                state,
                events_rx: tokio::sync::Mutex::new(rx),
                input_rate,
                output_rate,
            }
        }
    }

    #[async_trait]
    impl RealtimeProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn input_sample_rate(&self) -> u32 {
            self.input_rate
        }

        fn output_sample_rate(&self) -> u32 {
            self.output_rate
        }

        async fn connect(&mut self) -> ProviderResult<()> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            self.state.calls.lock().push(MockCall::Connect);
            Ok(())
        }

        async fn configure(&mut self) -> ProviderResult<()> {
            self.state.calls.lock().push(MockCall::Configure);
            Ok(())
        }

        async fn send_audio(&self, pcm: &[u8]) -> ProviderResult<()> {
            self.state.calls.lock().push(MockCall::Audio(pcm.len()));
            Ok(())
        }

        async fn send_text(&self, text: &str) -> ProviderResult<()> {
            self.state.calls.lock().push(MockCall::Text(text.into()));
            Ok(())
        }

        async fn interrupt(&self) -> ProviderResult<()> {
            self.state.calls.lock().push(MockCall::Interrupt);
            Ok(())
        }

        async fn send_function_result(
            &self,
            function_name: &str,
            _result: Value,
            _call_id: &str,
        ) -> ProviderResult<()> {
            self.state
                .calls
                .lock()
                .push(MockCall::FunctionResult(function_name.into()));
            Ok(())
        }

        async fn next_event(&self) -> Option<ProviderEvent> {
            self.events_rx.lock().await.recv().await
        }

        async fn disconnect(&self) {
            self.state.calls.lock().push(MockCall::Disconnect);
            self.state.events_tx.lock().take();
        }
    }

    /// No-op ESL double recording break calls.
    pub struct NullEsl {
        pub breaks: Mutex<Vec<String>>,
    }

    impl NullEsl {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                breaks: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EslCommandInterface for NullEsl {
        fn is_connected(&self) -> bool {
            true
        }
        async fn execute_api(&self, _command: &str) -> Option<String> {
            Some("+OK".into())
        }
        async fn uuid_kill(&self, _uuid: &str, _cause: &str) -> bool {
            true
        }
        async fn uuid_hold(&self, _uuid: &str, _on: bool) -> bool {
            true
        }
        async fn uuid_break(&self, uuid: &str) -> bool {
            self.breaks.lock().push(uuid.to_owned());
            true
        }
        async fn uuid_broadcast(&self, _uuid: &str, _path: &str, _leg: &str) -> bool {
            true
        }
        async fn uuid_exists(&self, _uuid: &str) -> bool {
            true
        }
    }

    pub struct Fixture {
        pub store: Arc<MemoryStore>,
        pub services: Arc<Services>,
        pub manager: Arc<SessionManager>,
        pub esl: Arc<NullEsl>,
        /// Mock state per created provider, in creation order.
        pub provider_states: Arc<Mutex<Vec<Arc<MockProviderState>>>>,
    }

    pub fn fixture_with(settings: Settings) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_provider(ProviderCredentials {
            provider_id: "p1".into(),
            domain_id: "T1".into(),
            provider_type: "realtime".into(),
            provider_name: "openai".into(),
            config: json!({"api_key": "k"}),
            is_default: true,
            is_enabled: true,
            priority: 0,
        });
        store.insert_provider(ProviderCredentials {
            provider_id: "p2".into(),
            domain_id: "T1".into(),
            provider_type: "realtime".into(),
            provider_name: "gemini".into(),
            config: json!({"api_key": "k"}),
            is_default: false,
            is_enabled: true,
            priority: 1,
        });

        let provider_states: Arc<Mutex<Vec<Arc<MockProviderState>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let states_for_factory = Arc::clone(&provider_states);
        let factory: crate::providers::ProviderFactory = Arc::new(
            move |name: &str,
                  _creds: &ProviderCredentials,
                  _config: ProviderSessionConfig|
                  -> ProviderResult<Box<dyn RealtimeProvider>> {
                if name == "broken" {
                    return Err(ProviderError::Config("broken provider".into()));
                }
                let state = MockProviderState::new();
                let (input, output) = if name == "gemini" {
                    (16_000, 24_000)
                } else {
                    (24_000, 24_000)
                };
                let provider = MockProvider::new(Arc::clone(&state), input, output);
                states_for_factory.lock().push(state);
                Ok(Box::new(provider))
            },
        );

        let services =
            Services::with_factory(settings, store.clone(), store.clone(), factory).unwrap();
        let manager = SessionManager::new(Arc::clone(&services));
        Fixture {
            store,
            services,
            manager,
            esl: NullEsl::new(),
            provider_states,
        }
    }

    pub fn fixture() -> Fixture {
        fixture_with(Settings::default())
    }

    pub fn config(call_id: &str) -> SessionConfig {
        let record = SecretaryRecord {
            secretary_id: "sec-1".into(),
            domain_id: "T1".into(),
            realtime_provider: Some("openai".into()),
            greeting_message: "Olá, em que posso ajudar?".into(),
            ..Default::default()
        };
        SessionConfig::from_secretary(
            &record,
            call_id,
            "+5511999999999",
            &[],
            &Settings::default(),
        )
    }

    fn audio_channel() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        mpsc::channel(256)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn create_enforces_duplicate_rejection() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx.clone())
            .await
            .unwrap();
        let err = fx
            .manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn tenant_cap_rejects_and_leaves_no_state() {
        let mut settings = Settings::default();
        settings.max_sessions_per_domain = 2;
        let fx = fixture_with(settings);
        let (tx, _rx) = audio_channel();

        fx.manager
            .create(config("C1"), fx.esl.clone(), tx.clone())
            .await
            .unwrap();
        fx.manager
            .create(config("C2"), fx.esl.clone(), tx.clone())
            .await
            .unwrap();
        let err = fx
            .manager
            .create(config("C3"), fx.esl.clone(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TenantLimit { .. }));
        assert_eq!(fx.manager.active_session_count(), 2);
        assert!(fx.manager.get("C3").is_none());
    }

    #[tokio::test]
    async fn global_cap_applies_across_domains() {
        let mut settings = Settings::default();
        settings.max_total_sessions = 1;
        let fx = fixture_with(settings);
        let (tx, _rx) = audio_channel();

        fx.manager
            .create(config("C1"), fx.esl.clone(), tx.clone())
            .await
            .unwrap();
        let err = fx
            .manager
            .create(config("C2"), fx.esl.clone(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::GlobalLimit));
    }

    #[tokio::test]
    async fn start_failure_removes_registration() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        let mut cfg = config("C1");
        cfg.provider_name = "broken".into();
        // Credentials exist so the factory itself is the failure point.
        fx.store.insert_provider(ProviderCredentials {
            provider_id: "pb".into(),
            domain_id: "T1".into(),
            provider_type: "realtime".into(),
            provider_name: "broken".into(),
            config: json!({}),
            is_default: false,
            is_enabled: true,
            priority: 9,
        });

        let err = fx.manager.create(cfg, fx.esl.clone(), tx).await.unwrap_err();
        assert!(matches!(err, SessionError::Start(_)));
        assert_eq!(fx.manager.active_session_count(), 0);
        assert_eq!(fx.manager.domain_session_count("T1"), 0);
    }

    #[tokio::test]
    async fn tenant_count_decrements_on_stop() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();
        assert_eq!(fx.manager.domain_session_count("T1"), 1);

        assert!(fx.manager.stop("C1", "test").await);
        assert_eq!(fx.manager.domain_session_count("T1"), 0);
        assert_eq!(fx.manager.active_session_count(), 0);
    }

    #[tokio::test]
    async fn route_audio_reaches_provider_resampled() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        // 16k media → 24k provider input: 320 samples become ~480.
        let pcm = vec![0u8; 640];
        assert!(fx.manager.route_audio("C1", &pcm).await);
        settle().await;

        let state = fx.provider_states.lock()[0].clone();
        let sent: Vec<usize> = state
            .calls()
            .iter()
            .filter_map(|c| match c {
                MockCall::Audio(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 1);
        assert!(sent[0] > 640, "input should be upsampled toward 24k");

        assert!(!fx.manager.route_audio("missing", &pcm).await);
    }

    #[tokio::test]
    async fn greeting_transcript_is_committed() {
        let fx = fixture();
        let (tx, mut rx) = audio_channel();
        let session = fx
            .manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        state.emit(ProviderEvent::ResponseStarted).await;
        state
            .emit(ProviderEvent::TranscriptDelta {
                text: "Olá, em que ".into(),
            })
            .await;
        state
            .emit(ProviderEvent::TranscriptDelta {
                text: "posso ajudar?".into(),
            })
            .await;
        state
            .emit(ProviderEvent::TranscriptDone { text: String::new() })
            .await;
        // 400ms of 16k audio fills the 200ms warmup.
        state
            .emit(ProviderEvent::AudioDelta {
                audio: vec![1u8; 12_800],
            })
            .await;
        settle().await;

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, "assistant");
        assert_eq!(transcript[0].text, "Olá, em que posso ajudar?");

        // Audio reached the media sink once warmup filled.
        let emitted = rx.try_recv();
        assert!(emitted.is_ok(), "warmup window should have released audio");
    }

    #[tokio::test]
    async fn transcript_timestamps_are_monotonic() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        let session = fx
            .manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        for i in 0..5 {
            state
                .emit(ProviderEvent::UserTranscript {
                    text: format!("linha {i}"),
                })
                .await;
        }
        settle().await;

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 5);
        for pair in transcript.windows(2) {
            assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[tokio::test]
    async fn barge_in_interrupts_and_breaks_playback() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        state.emit(ProviderEvent::ResponseStarted).await;
        state
            .emit(ProviderEvent::AudioDelta {
                audio: vec![1u8; 640],
            })
            .await;
        state.emit(ProviderEvent::SpeechStarted).await;
        settle().await;

        assert_eq!(state.interrupts(), 1, "provider must be interrupted");
        assert_eq!(fx.esl.breaks.lock().as_slice(), ["C1"]);
    }

    #[tokio::test]
    async fn warmup_buffer_resets_each_response() {
        let fx = fixture();
        let (tx, mut rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        // First turn: enough to complete warmup.
        state.emit(ProviderEvent::ResponseStarted).await;
        state
            .emit(ProviderEvent::AudioDelta {
                audio: vec![1u8; 12_800],
            })
            .await;
        settle().await;
        assert!(rx.try_recv().is_ok());
        while rx.try_recv().is_ok() {}

        // Second turn: a small delta must be absorbed again (warmup armed).
        state.emit(ProviderEvent::AudioDone).await;
        settle().await;
        while rx.try_recv().is_ok() {}
        state.emit(ProviderEvent::ResponseStarted).await;
        state
            .emit(ProviderEvent::AudioDelta {
                audio: vec![1u8; 320],
            })
            .await;
        settle().await;
        assert!(
            rx.try_recv().is_err(),
            "small delta right after response start must still be warming up"
        );
    }

    #[tokio::test]
    async fn fallback_rotates_to_next_provider() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        let mut cfg = config("C1");
        cfg.fallback_providers = vec!["gemini".into()];
        let session = fx.manager.create(cfg, fx.esl.clone(), tx).await.unwrap();

        let first = fx.provider_states.lock()[0].clone();
        first
            .emit(ProviderEvent::Error {
                code: "server_error".into(),
                message: "boom".into(),
            })
            .await;
        settle().await;

        assert!(session.is_active(), "session must survive via fallback");
        // Old provider was disconnected strictly before the new one
        // connected.
        assert!(first.calls().contains(&MockCall::Disconnect));
        let states = fx.provider_states.lock();
        assert_eq!(states.len(), 2, "a second provider was created");
        assert!(states[1].calls().contains(&MockCall::Connect));
    }

    #[tokio::test]
    async fn rate_limited_without_fallback_ends_session() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        let session = fx
            .manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        state
            .emit(ProviderEvent::RateLimited { info: json!({}) })
            .await;
        settle().await;

        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(
            session.stop_reason().as_deref(),
            Some("provider_rate_limited")
        );
    }

    #[tokio::test]
    async fn stop_persists_conversation_with_all_messages() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        let session = fx
            .manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        state
            .emit(ProviderEvent::UserTranscript { text: "oi".into() })
            .await;
        state
            .emit(ProviderEvent::TranscriptDone {
                text: "olá!".into(),
            })
            .await;
        settle().await;

        session.stop("hangup").await;

        let saved = fx.store.saved_conversations();
        assert_eq!(saved.len(), 1);
        let (record, messages) = &saved[0];
        assert_eq!(record.call_id, "C1");
        assert_eq!(record.final_action, "hangup");
        assert_eq!(record.processing_mode, "realtime");
        assert!(record.ended_at >= record.started_at);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn end_call_function_schedules_stop() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        let session = fx
            .manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        state
            .emit(ProviderEvent::FunctionCall {
                name: "end_call".into(),
                arguments: json!({"reason": "resolved"}),
                call_id: "fc1".into(),
            })
            .await;
        settle().await;

        // Result goes back to the provider immediately...
        assert!(state
            .calls()
            .contains(&MockCall::FunctionResult("end_call".into())));
        assert!(session.is_active(), "farewell window keeps the session up");

        // ...and the session ends after the delay.
        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(session.stop_reason().as_deref(), Some("function_end"));
    }

    #[tokio::test]
    async fn unknown_function_reports_error_result() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx)
            .await
            .unwrap();

        let state = fx.provider_states.lock()[0].clone();
        state
            .emit(ProviderEvent::FunctionCall {
                name: "order_pizza".into(),
                arguments: json!({}),
                call_id: "fc1".into(),
            })
            .await;
        settle().await;

        assert!(state
            .calls()
            .contains(&MockCall::FunctionResult("order_pizza".into())));
    }

    #[tokio::test]
    async fn stop_all_drains_every_session() {
        let fx = fixture();
        let (tx, _rx) = audio_channel();
        fx.manager
            .create(config("C1"), fx.esl.clone(), tx.clone())
            .await
            .unwrap();
        fx.manager
            .create(config("C2"), fx.esl.clone(), tx)
            .await
            .unwrap();

        assert_eq!(fx.manager.stop_all("shutdown").await, 2);
        assert_eq!(fx.manager.active_session_count(), 0);
        assert_eq!(fx.manager.stats().total_sessions, 0);
    }
}
