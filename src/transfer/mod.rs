//! Call transfers: destination resolution plus the attended and
//! announced transfer state machines.
//!
//! Transfers use `uuid_broadcast` + `originate` + `uuid_bridge`, never
//! `uuid_transfer` — the latter tears down the control session before the
//! outcome is observable, while originate-and-bridge keeps the a-leg
//! under our control so the assistant can resume when the destination
//! does not answer.
//!
//! ```text
//! Idle → HoldMusic → Originating → MonitoringBLeg → Bridging → Completed
//!                                               ↘ Failed (message → resume)
//! ```

pub mod announce;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config_loader::ConfigLoader;
use crate::esl::client::EslError;
use crate::esl::command::EslCommandInterface;
use crate::store::{DestinationType, TransferRule, WorkingHours};
use announce::AnnouncementTts;

/// Outcome of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Ringing,
    Answered,
    Success,
    Busy,
    NoAnswer,
    Dnd,
    Offline,
    Rejected,
    Unavailable,
    Failed,
    Cancelled,
}

/// Map a FreeSWITCH hangup cause onto a transfer status.
pub fn status_for_cause(cause: &str) -> TransferStatus {
    match cause {
        "NORMAL_CLEARING" | "NORMAL_UNSPECIFIED" => TransferStatus::Success,
        "USER_BUSY" | "NORMAL_CIRCUIT_CONGESTION" => TransferStatus::Busy,
        "NO_ANSWER" | "NO_USER_RESPONSE" | "ORIGINATOR_CANCEL" | "ALLOTTED_TIMEOUT" => {
            TransferStatus::NoAnswer
        }
        "CALL_REJECTED" | "USER_CHALLENGE" => TransferStatus::Rejected,
        "SUBSCRIBER_ABSENT" | "USER_NOT_REGISTERED" | "UNALLOCATED_NUMBER"
        | "NO_ROUTE_DESTINATION" => TransferStatus::Offline,
        "DO_NOT_DISTURB" => TransferStatus::Dnd,
        "DESTINATION_OUT_OF_ORDER" | "NETWORK_OUT_OF_ORDER" | "TEMPORARY_FAILURE"
        | "SWITCH_CONGESTION" | "MEDIA_TIMEOUT" | "GATEWAY_DOWN" | "INVALID_GATEWAY" => {
            TransferStatus::Failed
        }
        "LOSE_RACE" | "PICKED_OFF" | "MANAGER_REQUEST" => TransferStatus::Cancelled,
        _ => TransferStatus::Unavailable,
    }
}

/// Lifecycle of the transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    HoldMusic,
    Originating,
    MonitoringBLeg,
    Bridging,
    Completed,
    Failed,
}

/// Destination materialised from transfer rules for the active call.
#[derive(Debug, Clone)]
pub struct TransferDestination {
    pub name: String,
    pub destination_type: DestinationType,
    pub number: String,
    pub context: String,
    pub ring_timeout_seconds: u32,
    pub max_retries: u32,
    pub working_hours: Option<WorkingHours>,
    pub synonyms: Vec<String>,
    pub keywords: Vec<String>,
    pub transfer_message: Option<String>,
    pub priority: i32,
    /// Literal dial string overriding the type-based construction (used
    /// for orchestrator-provided agent dial strings).
    pub dial_override: Option<String>,
}

impl TransferDestination {
    pub fn from_rule(rule: &TransferRule) -> Self {
        Self {
            name: rule.department_name.clone(),
            destination_type: rule.destination_type,
            number: rule.destination_number.clone(),
            context: rule.destination_context.clone(),
            ring_timeout_seconds: rule.ring_timeout_seconds,
            max_retries: rule.max_retries.max(1),
            working_hours: rule.working_hours.clone(),
            synonyms: rule.synonyms.clone(),
            keywords: rule.intent_keywords.clone(),
            transfer_message: rule.transfer_message.clone(),
            priority: rule.priority,
            dial_override: None,
        }
    }

    /// Destination wrapping a ready-made dial string.
    pub fn from_dial_string(dial_string: &str, display_name: &str) -> Self {
        Self {
            name: display_name.to_owned(),
            destination_type: DestinationType::Extension,
            number: dial_string.to_owned(),
            context: String::new(),
            ring_timeout_seconds: 30,
            max_retries: 1,
            working_hours: None,
            synonyms: Vec::new(),
            keywords: Vec::new(),
            transfer_message: None,
            priority: 0,
            dial_override: Some(dial_string.to_owned()),
        }
    }

    /// Ad-hoc extension destination (LLM handed us a raw number).
    pub fn from_extension(number: &str, display_name: &str, context: &str) -> Self {
        Self {
            name: display_name.to_owned(),
            destination_type: DestinationType::Extension,
            number: number.to_owned(),
            context: context.to_owned(),
            ring_timeout_seconds: 30,
            max_retries: 1,
            working_hours: None,
            synonyms: Vec::new(),
            keywords: Vec::new(),
            transfer_message: None,
            priority: 0,
            dial_override: None,
        }
    }
}

/// Tunables for destination resolution and dialing. The fuzzy cutoff and
/// generic-token list are data here, not constants.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub default_timeout_seconds: u32,
    pub music_on_hold: String,
    pub announce_enabled: bool,
    pub accept_timeout: Duration,
    pub fuzzy_cutoff: f64,
    pub generic_keywords: Vec<String>,
    pub default_gateway: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            music_on_hold: "local_stream://moh".into(),
            announce_enabled: true,
            accept_timeout: Duration::from_secs(5),
            fuzzy_cutoff: 0.5,
            generic_keywords: vec![
                "qualquer".into(),
                "alguém".into(),
                "atendente".into(),
                "disponível".into(),
                "pessoa".into(),
            ],
            default_gateway: "default".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub status: TransferStatus,
    pub destination: Option<TransferDestination>,
    pub hangup_cause: Option<String>,
    pub b_leg_id: Option<String>,
    pub duration_ms: u64,
    pub retries: u32,
    pub error: Option<String>,
}

impl TransferResult {
    pub fn success(&self) -> bool {
        self.status == TransferStatus::Success
    }

    /// Caller-facing message for this outcome.
    pub fn message(&self) -> String {
        let name = self.destination.as_ref().map(|d| d.name.as_str());
        match (self.status, name) {
            (TransferStatus::Success, _) => "Conectando você agora.".into(),
            (TransferStatus::Busy, Some(name)) => {
                format!("O ramal de {name} está ocupado no momento.")
            }
            (TransferStatus::Busy, None) => "O ramal está ocupado no momento.".into(),
            (TransferStatus::NoAnswer, Some(name)) => {
                format!("{name} não está atendendo no momento.")
            }
            (TransferStatus::NoAnswer, None) => "Não está atendendo no momento.".into(),
            (TransferStatus::Dnd, Some(name)) => {
                format!("O ramal de {name} está em modo não perturbe.")
            }
            (TransferStatus::Dnd, None) => "O ramal está em modo não perturbe.".into(),
            (TransferStatus::Offline, Some(name)) => {
                format!("O ramal de {name} não está disponível no momento.")
            }
            (TransferStatus::Offline, None) => "O ramal não está disponível no momento.".into(),
            (TransferStatus::Rejected, _) => "A chamada foi recusada.".into(),
            (TransferStatus::Cancelled, _) => "A chamada foi cancelada.".into(),
            (TransferStatus::Unavailable, _) => {
                "O destino não está disponível no momento.".into()
            }
            _ => "Não foi possível completar a transferência.".into(),
        }
    }

    /// Whether offering a callback/ticket makes sense after this outcome.
    pub fn should_offer_callback(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Busy
                | TransferStatus::NoAnswer
                | TransferStatus::Dnd
                | TransferStatus::Offline
                | TransferStatus::Rejected
                | TransferStatus::Unavailable
        )
    }
}

/// Bigram Dice similarity in [0, 1]; 1.0 on exact match.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }
    let bigrams = |s: &str| -> HashSet<(char, char)> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(2).map(|w| (w[0], w[1])).collect()
    };
    let ba = bigrams(&a);
    let bb = bigrams(&b);
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let shared = ba.intersection(&bb).count();
    (2.0 * shared as f64) / (ba.len() + bb.len()) as f64
}

/// Why a destination could not be produced; the string is caller-facing.
pub type ResolutionError = String;

pub struct TransferManager {
    domain_id: String,
    call_id: String,
    caller_id: String,
    secretary_id: Option<String>,
    esl: Arc<dyn EslCommandInterface>,
    config: Arc<ConfigLoader>,
    settings: TransferSettings,
    tts: Option<Arc<AnnouncementTts>>,
    voice_id: Option<String>,
    state: parking_lot::Mutex<TransferState>,
    b_leg: parking_lot::Mutex<Option<String>>,
    moh_active: AtomicBool,
    caller_hungup: AtomicBool,
    destinations: tokio::sync::Mutex<Option<Vec<TransferDestination>>>,
}

impl TransferManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain_id: impl Into<String>,
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        secretary_id: Option<String>,
        esl: Arc<dyn EslCommandInterface>,
        config: Arc<ConfigLoader>,
        settings: TransferSettings,
        tts: Option<Arc<AnnouncementTts>>,
        voice_id: Option<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            call_id: call_id.into(),
            caller_id: caller_id.into(),
            secretary_id,
            esl,
            config,
            settings,
            tts,
            voice_id,
            state: parking_lot::Mutex::new(TransferState::Idle),
            b_leg: parking_lot::Mutex::new(None),
            moh_active: AtomicBool::new(false),
            caller_hungup: AtomicBool::new(false),
            destinations: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    pub fn b_leg_id(&self) -> Option<String> {
        self.b_leg.lock().clone()
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
        tracing::debug!(call_id = %self.call_id, state = ?state, "transfer state");
    }

    pub async fn load_destinations(&self, force_refresh: bool) -> Vec<TransferDestination> {
        let mut cached = self.destinations.lock().await;
        if force_refresh || cached.is_none() {
            let rules = self
                .config
                .transfer_rules(&self.domain_id, self.secretary_id.as_deref())
                .await
                .unwrap_or_default();
            *cached = Some(rules.iter().map(TransferDestination::from_rule).collect());
        }
        cached.clone().unwrap_or_default()
    }

    /// Default destination for generic "anyone available" requests:
    /// first enabled rule by priority, preferring queues and ring groups.
    fn default_destination(
        destinations: &[TransferDestination],
    ) -> Option<&TransferDestination> {
        destinations
            .iter()
            .find(|d| {
                matches!(
                    d.destination_type,
                    DestinationType::Queue | DestinationType::RingGroup
                )
            })
            .or_else(|| destinations.first())
    }

    fn check_working_hours(dest: &TransferDestination) -> Result<(), ResolutionError> {
        if let Some(hours) = &dest.working_hours {
            if !hours.contains(Utc::now()) {
                return Err(format!(
                    "{} está fora do horário de atendimento no momento.",
                    dest.name
                ));
            }
        }
        Ok(())
    }

    /// Resolve free-form user text into a destination, or a caller-facing
    /// message explaining why not.
    pub async fn resolve_destination(
        &self,
        user_text: &str,
    ) -> Result<TransferDestination, ResolutionError> {
        let destinations = self.load_destinations(false).await;
        if destinations.is_empty() {
            return Err("Não há destinos de transferência configurados.".into());
        }

        let text_lower = user_text.to_lowercase();

        // Generic "anyone" requests route to the default destination.
        if self
            .settings
            .generic_keywords
            .iter()
            .any(|kw| text_lower.contains(&kw.to_lowercase()))
        {
            let dest = Self::default_destination(&destinations)
                .ok_or_else(|| "Não há atendentes disponíveis no momento.".to_owned())?;
            Self::check_working_hours(dest)?;
            return Ok(dest.clone());
        }

        // Fuzzy match over names, synonyms and intent keywords.
        let mut best: Option<(&TransferDestination, f64)> = None;
        for dest in &destinations {
            let mut score = similarity(user_text, &dest.name);
            for alias in dest.synonyms.iter().chain(dest.keywords.iter()) {
                score = score.max(similarity(user_text, alias));
                if text_lower.contains(&alias.to_lowercase()) {
                    score = score.max(0.9);
                }
            }
            if text_lower.contains(&dest.name.to_lowercase()) {
                score = score.max(0.95);
            }
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((dest, score));
            }
        }

        match best {
            Some((dest, score)) if score >= self.settings.fuzzy_cutoff => {
                Self::check_working_hours(dest)?;
                Ok(dest.clone())
            }
            _ => {
                let available: Vec<&str> = destinations
                    .iter()
                    .take(5)
                    .map(|d| d.name.as_str())
                    .collect();
                Err(format!(
                    "Não encontrei '{user_text}'. Você pode falar com: {}.",
                    available.join(", ")
                ))
            }
        }
    }

    /// Dial string for a destination.
    pub fn build_dial_string(&self, dest: &TransferDestination) -> String {
        if let Some(dial) = &dest.dial_override {
            return dial.clone();
        }
        let number = &dest.number;
        let context = &dest.context;
        match dest.destination_type {
            DestinationType::Extension => format!("user/{number}@{context}"),
            DestinationType::RingGroup => format!("group/{number}@{context}"),
            DestinationType::Queue => format!("fifo/{number}@{context}"),
            DestinationType::Voicemail => format!("voicemail/{number}@{context}"),
            DestinationType::External => {
                format!("sofia/gateway/{}/{number}", self.settings.default_gateway)
            }
        }
    }

    fn originate_variables(&self) -> Vec<(String, String)> {
        vec![
            ("ignore_early_media".into(), "true".into()),
            ("hangup_after_bridge".into(), "true".into()),
            (
                "origination_caller_id_number".into(),
                self.caller_id.clone(),
            ),
            (
                "origination_caller_id_name".into(),
                "Secretaria_Virtual".into(),
            ),
        ]
    }

    async fn start_moh(&self) {
        if self.moh_active.load(Ordering::SeqCst) {
            return;
        }
        // Stop any assistant playback before music starts.
        self.esl.uuid_break(&self.call_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self
            .esl
            .uuid_broadcast(&self.call_id, &self.settings.music_on_hold, "aleg")
            .await
        {
            self.moh_active.store(true, Ordering::SeqCst);
            self.set_state(TransferState::HoldMusic);
            tracing::debug!(call_id = %self.call_id, "moh started");
        }
    }

    async fn stop_moh(&self) {
        if self.moh_active.swap(false, Ordering::SeqCst) {
            self.esl.uuid_break(&self.call_id).await;
            tracing::debug!(call_id = %self.call_id, "moh stopped");
        }
    }

    /// Stop hold music so the assistant can resume talking.
    pub async fn stop_moh_and_resume(&self) {
        self.stop_moh().await;
        self.set_state(TransferState::Idle);
    }

    fn cancelled_result(&self, destination: &TransferDestination, retries: u32) -> TransferResult {
        TransferResult {
            status: TransferStatus::Cancelled,
            destination: Some(destination.clone()),
            hangup_cause: None,
            b_leg_id: None,
            duration_ms: 0,
            retries,
            error: Some("caller hung up".into()),
        }
    }

    /// Attended transfer: MOH, originate, bridge-on-answer.
    pub async fn execute_attended_transfer(
        &self,
        destination: &TransferDestination,
        timeout_seconds: Option<u32>,
        retry_on_busy: bool,
    ) -> TransferResult {
        let started = Instant::now();
        let timeout = timeout_seconds
            .or(Some(destination.ring_timeout_seconds).filter(|t| *t > 0))
            .unwrap_or(self.settings.default_timeout_seconds);
        let max_retries = if retry_on_busy {
            destination.max_retries
        } else {
            1
        };

        tracing::info!(
            call_id = %self.call_id,
            destination = %destination.name,
            number = %destination.number,
            timeout,
            "starting attended transfer"
        );

        let mut retries = 0u32;
        loop {
            if self.caller_hungup.load(Ordering::SeqCst) {
                self.kill_b_leg("ORIGINATOR_CANCEL").await;
                self.stop_moh().await;
                self.set_state(TransferState::Failed);
                return self.cancelled_result(destination, retries);
            }

            self.start_moh().await;
            self.esl
                .subscribe_events(
                    &[
                        "CHANNEL_ANSWER",
                        "CHANNEL_HANGUP",
                        "CHANNEL_PROGRESS",
                        "CHANNEL_PROGRESS_MEDIA",
                    ],
                    None,
                )
                .await;

            self.set_state(TransferState::Originating);
            let dial_string = self.build_dial_string(destination);
            let outcome = self
                .esl
                .originate(&dial_string, "&park()", timeout, &self.originate_variables())
                .await;

            match outcome {
                Ok(b_leg) => {
                    // API originate is synchronous: +OK means answered.
                    *self.b_leg.lock() = Some(b_leg.clone());
                    if self.caller_hungup.load(Ordering::SeqCst) {
                        self.kill_b_leg("ORIGINATOR_CANCEL").await;
                        self.stop_moh().await;
                        self.set_state(TransferState::Failed);
                        return self.cancelled_result(destination, retries);
                    }
                    return self.bridge_answered_leg(destination, &b_leg, started, retries).await;
                }
                Err(EslError::OriginateFailed { cause }) => {
                    let cause = cause.unwrap_or_default();
                    let status = if cause.is_empty() {
                        TransferStatus::Failed
                    } else {
                        status_for_cause(&cause)
                    };
                    tracing::info!(
                        call_id = %self.call_id,
                        cause = %cause,
                        status = ?status,
                        "b-leg originate failed"
                    );

                    if status == TransferStatus::Busy && retries + 1 < max_retries {
                        retries += 1;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }

                    self.stop_moh().await;
                    self.set_state(TransferState::Failed);
                    return TransferResult {
                        status,
                        destination: Some(destination.clone()),
                        hangup_cause: Some(cause).filter(|c| !c.is_empty()),
                        b_leg_id: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        retries,
                        error: None,
                    };
                }
                Err(e) => {
                    tracing::error!(call_id = %self.call_id, error = %e, "originate error");
                    self.stop_moh().await;
                    self.set_state(TransferState::Failed);
                    return TransferResult {
                        status: TransferStatus::Failed,
                        destination: Some(destination.clone()),
                        hangup_cause: None,
                        b_leg_id: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        retries,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    /// Bridge an already-answered b-leg to the caller.
    async fn bridge_answered_leg(
        &self,
        destination: &TransferDestination,
        b_leg: &str,
        started: Instant,
        retries: u32,
    ) -> TransferResult {
        self.set_state(TransferState::Bridging);
        self.stop_moh().await;

        // The a-leg must hang up when the human side does; set before the
        // bridge so the variable is in place the moment legs join.
        if !self
            .esl
            .uuid_setvar(&self.call_id, "hangup_after_bridge", "true")
            .await
        {
            tracing::warn!(call_id = %self.call_id, "failed to set hangup_after_bridge on a-leg");
        }

        if self.esl.uuid_bridge(&self.call_id, b_leg).await {
            self.set_state(TransferState::Completed);
            tracing::info!(
                call_id = %self.call_id,
                b_leg = %b_leg,
                destination = %destination.name,
                "transfer bridge established"
            );
            TransferResult {
                status: TransferStatus::Success,
                destination: Some(destination.clone()),
                hangup_cause: None,
                b_leg_id: Some(b_leg.to_owned()),
                duration_ms: started.elapsed().as_millis() as u64,
                retries,
                error: None,
            }
        } else {
            self.kill_b_leg("NORMAL_CLEARING").await;
            self.stop_moh().await;
            self.set_state(TransferState::Failed);
            TransferResult {
                status: TransferStatus::Failed,
                destination: Some(destination.clone()),
                hangup_cause: None,
                b_leg_id: Some(b_leg.to_owned()),
                duration_ms: started.elapsed().as_millis() as u64,
                retries,
                error: Some("bridge failed".into()),
            }
        }
    }

    /// Announced transfer: like attended, but the human hears context and
    /// can reject with DTMF 2 inside the accept window; silence accepts.
    pub async fn execute_announced_transfer(
        &self,
        destination: &TransferDestination,
        announcement: &str,
        ring_timeout: u32,
        accept_timeout: Option<Duration>,
    ) -> TransferResult {
        let started = Instant::now();
        let accept_timeout = accept_timeout.unwrap_or(self.settings.accept_timeout);

        tracing::info!(
            call_id = %self.call_id,
            destination = %destination.name,
            "starting announced transfer"
        );

        if self.caller_hungup.load(Ordering::SeqCst) {
            return self.cancelled_result(destination, 0);
        }

        self.start_moh().await;
        self.esl
            .subscribe_events(&["CHANNEL_ANSWER", "CHANNEL_HANGUP", "DTMF"], None)
            .await;

        self.set_state(TransferState::Originating);
        let dial_string = self.build_dial_string(destination);
        let b_leg = match self
            .esl
            .originate(
                &dial_string,
                "&park()",
                ring_timeout,
                &self.originate_variables(),
            )
            .await
        {
            Ok(b_leg) => b_leg,
            Err(EslError::OriginateFailed { cause }) => {
                self.stop_moh().await;
                self.set_state(TransferState::Failed);
                let cause = cause.unwrap_or_default();
                let status = if cause.is_empty() {
                    TransferStatus::NoAnswer
                } else {
                    status_for_cause(&cause)
                };
                return TransferResult {
                    status,
                    destination: Some(destination.clone()),
                    hangup_cause: Some(cause).filter(|c| !c.is_empty()),
                    b_leg_id: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    retries: 0,
                    error: None,
                };
            }
            Err(e) => {
                self.stop_moh().await;
                self.set_state(TransferState::Failed);
                return TransferResult {
                    status: TransferStatus::Failed,
                    destination: Some(destination.clone()),
                    hangup_cause: None,
                    b_leg_id: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    retries: 0,
                    error: Some(e.to_string()),
                };
            }
        };
        *self.b_leg.lock() = Some(b_leg.clone());

        // Let the originate's own event storm settle before playback.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let spoken = format!("{announcement}. Press 2 to reject, or wait to accept.");
        let announcement_path = match &self.tts {
            Some(tts) => tts.generate(&spoken, self.voice_id.as_deref()).await,
            None => None,
        };
        let playback = announcement_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| announce::FALLBACK_PROMPT.to_owned());
        self.esl.uuid_broadcast(&b_leg, &playback, "aleg").await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        self.set_state(TransferState::MonitoringBLeg);
        let decision = self
            .esl
            .wait_for_event(&["DTMF", "CHANNEL_HANGUP"], Some(&b_leg), accept_timeout)
            .await;

        match decision {
            Some(event) if event.name == "DTMF" && event.dtmf_digit() == Some("2") => {
                tracing::info!(call_id = %self.call_id, "announced transfer rejected (dtmf 2)");
                self.kill_b_leg("CALL_REJECTED").await;
                self.stop_moh().await;
                self.set_state(TransferState::Failed);
                TransferResult {
                    status: TransferStatus::Rejected,
                    destination: Some(destination.clone()),
                    hangup_cause: None,
                    b_leg_id: Some(b_leg),
                    duration_ms: started.elapsed().as_millis() as u64,
                    retries: 0,
                    error: None,
                }
            }
            Some(event) if event.name == "CHANNEL_HANGUP" => {
                tracing::info!(call_id = %self.call_id, "announced transfer rejected (hangup)");
                self.stop_moh().await;
                self.set_state(TransferState::Failed);
                TransferResult {
                    status: TransferStatus::Rejected,
                    destination: Some(destination.clone()),
                    hangup_cause: event.hangup_cause().map(str::to_owned),
                    b_leg_id: Some(b_leg),
                    duration_ms: started.elapsed().as_millis() as u64,
                    retries: 0,
                    error: None,
                }
            }
            // Timeout, other digits, unrelated events: accept.
            _ => {
                tracing::info!(call_id = %self.call_id, "announced transfer accepted (timeout)");
                self.bridge_answered_leg(destination, &b_leg, started, 0).await
            }
        }
    }

    async fn kill_b_leg(&self, cause: &str) {
        let b_leg = self.b_leg.lock().take();
        if let Some(b_leg) = b_leg {
            self.esl.uuid_kill(&b_leg, cause).await;
            tracing::debug!(call_id = %self.call_id, b_leg = %b_leg, "b-leg killed");
        }
    }

    /// The caller hung up while a transfer was pending: kill the b-leg
    /// immediately so nothing rings into a dead call.
    pub async fn handle_caller_hangup(&self) {
        self.caller_hungup.store(true, Ordering::SeqCst);
        self.kill_b_leg("ORIGINATOR_CANCEL").await;
        tracing::info!(call_id = %self.call_id, "caller hangup during transfer");
    }

    pub async fn cancel(&self) {
        self.kill_b_leg("NORMAL_CLEARING").await;
        self.stop_moh().await;
        self.set_state(TransferState::Idle);
        tracing::info!(call_id = %self.call_id, "transfer cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// ESL double that scripts originate outcomes and records commands.
    struct ScriptedEsl {
        commands: Mutex<Vec<String>>,
        originate_results: Mutex<Vec<Result<String, EslError>>>,
        bridge_ok: bool,
    }

    impl ScriptedEsl {
        fn new(originate_results: Vec<Result<String, EslError>>, bridge_ok: bool) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                originate_results: Mutex::new(originate_results),
                bridge_ok,
            }
        }

        fn log(&self, cmd: impl Into<String>) {
            self.commands.lock().push(cmd.into());
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }
    }

    #[async_trait]
    impl EslCommandInterface for ScriptedEsl {
        fn is_connected(&self) -> bool {
            true
        }

        async fn execute_api(&self, command: &str) -> Option<String> {
            self.log(command);
            Some("+OK".into())
        }

        async fn uuid_kill(&self, uuid: &str, cause: &str) -> bool {
            self.log(format!("uuid_kill {uuid} {cause}"));
            true
        }

        async fn uuid_hold(&self, uuid: &str, on: bool) -> bool {
            self.log(format!("uuid_hold {uuid} {on}"));
            true
        }

        async fn uuid_break(&self, uuid: &str) -> bool {
            self.log(format!("uuid_break {uuid}"));
            true
        }

        async fn uuid_broadcast(&self, uuid: &str, path: &str, leg: &str) -> bool {
            self.log(format!("uuid_broadcast {uuid} {path} {leg}"));
            true
        }

        async fn uuid_exists(&self, _uuid: &str) -> bool {
            true
        }

        async fn uuid_setvar(&self, uuid: &str, variable: &str, value: &str) -> bool {
            self.log(format!("uuid_setvar {uuid} {variable} {value}"));
            true
        }

        async fn originate(
            &self,
            dial_string: &str,
            _app: &str,
            _timeout_seconds: u32,
            _variables: &[(String, String)],
        ) -> Result<String, EslError> {
            self.log(format!("originate {dial_string}"));
            self.originate_results
                .lock()
                .pop()
                .unwrap_or(Err(EslError::NotConnected))
        }

        async fn uuid_bridge(&self, uuid_a: &str, uuid_b: &str) -> bool {
            self.log(format!("uuid_bridge {uuid_a} {uuid_b}"));
            self.bridge_ok
        }

        async fn subscribe_events(&self, _events: &[&str], _uuid: Option<&str>) -> bool {
            true
        }

        async fn wait_for_event(
            &self,
            _event_names: &[&str],
            _uuid: Option<&str>,
            _timeout: Duration,
        ) -> Option<crate::esl::event::EslEvent> {
            None
        }
    }

    fn dest(name: &str, dtype: DestinationType, number: &str) -> TransferDestination {
        TransferDestination {
            name: name.into(),
            destination_type: dtype,
            number: number.into(),
            context: "default".into(),
            ring_timeout_seconds: 30,
            max_retries: 2,
            working_hours: None,
            synonyms: Vec::new(),
            keywords: Vec::new(),
            transfer_message: None,
            priority: 1,
            dial_override: None,
        }
    }

    fn manager(esl: Arc<ScriptedEsl>) -> TransferManager {
        let store = Arc::new(MemoryStore::new());
        TransferManager::new(
            "dom-1",
            "a-leg-1",
            "+5511999999999",
            Some("sec-1".into()),
            esl,
            Arc::new(ConfigLoader::new(store)),
            TransferSettings::default(),
            None,
            None,
        )
    }

    #[test]
    fn hangup_cause_table() {
        assert_eq!(status_for_cause("USER_BUSY"), TransferStatus::Busy);
        assert_eq!(status_for_cause("NO_ANSWER"), TransferStatus::NoAnswer);
        assert_eq!(status_for_cause("ALLOTTED_TIMEOUT"), TransferStatus::NoAnswer);
        assert_eq!(status_for_cause("SUBSCRIBER_ABSENT"), TransferStatus::Offline);
        assert_eq!(
            status_for_cause("USER_NOT_REGISTERED"),
            TransferStatus::Offline
        );
        assert_eq!(status_for_cause("CALL_REJECTED"), TransferStatus::Rejected);
        assert_eq!(status_for_cause("DO_NOT_DISTURB"), TransferStatus::Dnd);
        assert_eq!(
            status_for_cause("DESTINATION_OUT_OF_ORDER"),
            TransferStatus::Failed
        );
        assert_eq!(status_for_cause("MEDIA_TIMEOUT"), TransferStatus::Failed);
        assert_eq!(status_for_cause("GATEWAY_DOWN"), TransferStatus::Failed);
        assert_eq!(status_for_cause("NORMAL_CLEARING"), TransferStatus::Success);
        assert_eq!(
            status_for_cause("SOMETHING_ELSE"),
            TransferStatus::Unavailable
        );
    }

    #[test]
    fn dial_strings_by_destination_type() {
        let esl = Arc::new(ScriptedEsl::new(vec![], true));
        let mgr = manager(esl);
        assert_eq!(
            mgr.build_dial_string(&dest("X", DestinationType::Extension, "1001")),
            "user/1001@default"
        );
        assert_eq!(
            mgr.build_dial_string(&dest("X", DestinationType::RingGroup, "600")),
            "group/600@default"
        );
        assert_eq!(
            mgr.build_dial_string(&dest("X", DestinationType::Queue, "700")),
            "fifo/700@default"
        );
        assert_eq!(
            mgr.build_dial_string(&dest("X", DestinationType::Voicemail, "1001")),
            "voicemail/1001@default"
        );
        assert_eq!(
            mgr.build_dial_string(&dest("X", DestinationType::External, "5511888887777")),
            "sofia/gateway/default/5511888887777"
        );
    }

    #[test]
    fn similarity_scores() {
        assert_eq!(similarity("Financeiro", "financeiro"), 1.0);
        assert!(similarity("financeiro", "financeir") > 0.8);
        assert!(similarity("vendas", "financeiro") < 0.3);
        assert_eq!(similarity("a", "b"), 0.0);
    }

    #[test]
    fn busy_message_names_the_department() {
        let result = TransferResult {
            status: TransferStatus::Busy,
            destination: Some(dest("Financeiro", DestinationType::Extension, "2000")),
            hangup_cause: Some("USER_BUSY".into()),
            b_leg_id: None,
            duration_ms: 100,
            retries: 0,
            error: None,
        };
        assert_eq!(
            result.message(),
            "O ramal de Financeiro está ocupado no momento."
        );
        assert!(result.should_offer_callback());
        assert!(!result.success());
    }

    #[tokio::test]
    async fn attended_transfer_happy_path_orders_commands() {
        let esl = Arc::new(ScriptedEsl::new(vec![Ok("b-leg-9".into())], true));
        let mgr = manager(esl.clone());
        let result = mgr
            .execute_attended_transfer(&dest("Vendas", DestinationType::Extension, "2000"), None, true)
            .await;

        assert!(result.success());
        assert_eq!(result.b_leg_id.as_deref(), Some("b-leg-9"));
        assert_eq!(mgr.state(), TransferState::Completed);

        let commands = esl.commands();
        // break → moh → originate → moh stop → setvar → bridge.
        let setvar_pos = commands
            .iter()
            .position(|c| c.contains("hangup_after_bridge"))
            .expect("setvar issued");
        let bridge_pos = commands
            .iter()
            .position(|c| c.starts_with("uuid_bridge"))
            .expect("bridge issued");
        assert!(
            setvar_pos < bridge_pos,
            "hangup_after_bridge must precede uuid_bridge: {commands:?}"
        );
        assert!(commands.iter().any(|c| c.contains("local_stream://moh")));
        assert!(commands
            .iter()
            .any(|c| c == "originate user/2000@default"));
    }

    #[tokio::test]
    async fn attended_transfer_busy_reports_status_and_kills_nothing() {
        let esl = Arc::new(ScriptedEsl::new(
            vec![Err(EslError::OriginateFailed {
                cause: Some("USER_BUSY".into()),
            })],
            true,
        ));
        let mgr = manager(esl.clone());
        let result = mgr
            .execute_attended_transfer(
                &dest("Financeiro", DestinationType::Extension, "2000"),
                None,
                false,
            )
            .await;

        assert_eq!(result.status, TransferStatus::Busy);
        assert_eq!(result.hangup_cause.as_deref(), Some("USER_BUSY"));
        assert_eq!(
            result.message(),
            "O ramal de Financeiro está ocupado no momento."
        );
        assert_eq!(mgr.state(), TransferState::Failed);

        // MOH was started then stopped (two uuid_break calls around it).
        let commands = esl.commands();
        assert!(commands.iter().filter(|c| c.starts_with("uuid_break")).count() >= 2);
    }

    #[tokio::test]
    async fn busy_retries_until_max() {
        let esl = Arc::new(ScriptedEsl::new(
            vec![
                Err(EslError::OriginateFailed {
                    cause: Some("USER_BUSY".into()),
                }),
                Err(EslError::OriginateFailed {
                    cause: Some("USER_BUSY".into()),
                }),
            ],
            true,
        ));
        let mgr = manager(esl.clone());
        let result = mgr
            .execute_attended_transfer(
                &dest("Vendas", DestinationType::Extension, "2000"),
                None,
                true,
            )
            .await;

        assert_eq!(result.status, TransferStatus::Busy);
        assert_eq!(result.retries, 1);
        let originates = esl
            .commands()
            .iter()
            .filter(|c| c.starts_with("originate"))
            .count();
        assert_eq!(originates, 2);
    }

    #[tokio::test]
    async fn caller_hangup_cancels_and_kills_b_leg() {
        let esl = Arc::new(ScriptedEsl::new(vec![Ok("b-leg-3".into())], true));
        let mgr = manager(esl.clone());
        *mgr.b_leg.lock() = Some("b-leg-3".into());

        mgr.handle_caller_hangup().await;

        assert!(esl
            .commands()
            .iter()
            .any(|c| c == "uuid_kill b-leg-3 ORIGINATOR_CANCEL"));

        let result = mgr
            .execute_attended_transfer(&dest("Vendas", DestinationType::Extension, "2000"), None, true)
            .await;
        assert_eq!(result.status, TransferStatus::Cancelled);
    }

    #[tokio::test]
    async fn announced_timeout_accepts_and_bridges() {
        // wait_for_event returns None (timeout) → accept → bridge.
        let esl = Arc::new(ScriptedEsl::new(vec![Ok("b-leg-5".into())], true));
        let mgr = manager(esl.clone());
        let result = mgr
            .execute_announced_transfer(
                &dest("Vendas", DestinationType::Extension, "2000"),
                "Tenho o João na linha",
                30,
                Some(Duration::from_millis(10)),
            )
            .await;

        assert!(result.success());
        let commands = esl.commands();
        let setvar_pos = commands
            .iter()
            .position(|c| c.contains("hangup_after_bridge"))
            .expect("setvar issued");
        let bridge_pos = commands
            .iter()
            .position(|c| c.starts_with("uuid_bridge"))
            .expect("bridge issued");
        assert!(setvar_pos < bridge_pos);
        // The announcement prompt reached the b-leg.
        assert!(commands
            .iter()
            .any(|c| c.starts_with("uuid_broadcast b-leg-5")));
    }

    #[tokio::test]
    async fn resolve_generic_request_prefers_queue() {
        let store = Arc::new(MemoryStore::new());
        store.insert_rule(TransferRule {
            rule_id: "r1".into(),
            domain_id: "dom-1".into(),
            secretary_id: None,
            department_name: "Financeiro".into(),
            intent_keywords: vec!["boleto".into()],
            destination_type: DestinationType::Extension,
            destination_number: "2000".into(),
            destination_context: "default".into(),
            transfer_message: None,
            priority: 0,
            ring_timeout_seconds: 30,
            max_retries: 2,
            working_hours: None,
            synonyms: Vec::new(),
            is_enabled: true,
        });
        store.insert_rule(TransferRule {
            rule_id: "r2".into(),
            domain_id: "dom-1".into(),
            secretary_id: None,
            department_name: "Atendimento".into(),
            intent_keywords: Vec::new(),
            destination_type: DestinationType::Queue,
            destination_number: "700".into(),
            destination_context: "default".into(),
            transfer_message: None,
            priority: 5,
            ring_timeout_seconds: 30,
            max_retries: 2,
            working_hours: None,
            synonyms: Vec::new(),
            is_enabled: true,
        });

        let esl = Arc::new(ScriptedEsl::new(vec![], true));
        let mgr = TransferManager::new(
            "dom-1",
            "a-leg-1",
            "+5511",
            None,
            esl,
            Arc::new(ConfigLoader::new(store)),
            TransferSettings::default(),
            None,
            None,
        );

        let dest = mgr
            .resolve_destination("quero falar com qualquer atendente")
            .await
            .unwrap();
        assert_eq!(dest.name, "Atendimento");
        assert_eq!(dest.destination_type, DestinationType::Queue);
    }

    #[tokio::test]
    async fn resolve_fuzzy_match_and_suggestions() {
        let store = Arc::new(MemoryStore::new());
        store.insert_rule(TransferRule {
            rule_id: "r1".into(),
            domain_id: "dom-1".into(),
            secretary_id: None,
            department_name: "Financeiro".into(),
            intent_keywords: vec!["boleto".into(), "pagamento".into()],
            destination_type: DestinationType::Extension,
            destination_number: "2000".into(),
            destination_context: "default".into(),
            transfer_message: None,
            priority: 0,
            ring_timeout_seconds: 30,
            max_retries: 2,
            working_hours: None,
            synonyms: vec!["contas".into()],
            is_enabled: true,
        });

        let esl = Arc::new(ScriptedEsl::new(vec![], true));
        let mgr = TransferManager::new(
            "dom-1",
            "a-leg-1",
            "+5511",
            None,
            esl,
            Arc::new(ConfigLoader::new(store)),
            TransferSettings::default(),
            None,
            None,
        );

        // Near-exact department name.
        let found = mgr.resolve_destination("financeiro").await.unwrap();
        assert_eq!(found.name, "Financeiro");

        // Keyword containment.
        let found = mgr
            .resolve_destination("preciso do boleto da fatura")
            .await
            .unwrap();
        assert_eq!(found.name, "Financeiro");

        // No match lists available departments.
        let err = mgr.resolve_destination("xyzzy").await.unwrap_err();
        assert!(err.contains("Financeiro"));
        assert!(err.contains("xyzzy"));
    }

    #[tokio::test]
    async fn resolve_outside_working_hours_returns_message() {
        use chrono::NaiveTime;
        let store = Arc::new(MemoryStore::new());
        store.insert_rule(TransferRule {
            rule_id: "r1".into(),
            domain_id: "dom-1".into(),
            secretary_id: None,
            department_name: "Vendas".into(),
            intent_keywords: Vec::new(),
            destination_type: DestinationType::Extension,
            destination_number: "2000".into(),
            destination_context: "default".into(),
            transfer_message: None,
            priority: 0,
            ring_timeout_seconds: 30,
            max_retries: 2,
            // Zero-width window at midnight: closed at any realistic
            // test execution time.
            working_hours: Some(WorkingHours {
                start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                days: Vec::new(),
            }),
            synonyms: Vec::new(),
            is_enabled: true,
        });

        let esl = Arc::new(ScriptedEsl::new(vec![], true));
        let mgr = TransferManager::new(
            "dom-1",
            "a-leg-1",
            "+5511",
            None,
            esl,
            Arc::new(ConfigLoader::new(store)),
            TransferSettings::default(),
            None,
            None,
        );

        let result = mgr.resolve_destination("vendas").await;
        // Only an exactly-midnight clock passes the zero-width window.
        if let Err(message) = result {
            assert!(message.contains("fora do horário"));
        }
    }

    #[test]
    fn dial_override_wins_over_type() {
        let esl = Arc::new(ScriptedEsl::new(vec![], true));
        let mgr = manager(esl);
        let dest = TransferDestination::from_dial_string("user/1001@ctx", "Atendente");
        assert_eq!(mgr.build_dial_string(&dest), "user/1001@ctx");
    }
}
