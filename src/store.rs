//! Configuration and conversation storage contracts.
//!
//! The relational backends (tenant config tables, conversation history)
//! live outside this service; the bridge only depends on the two traits
//! below. [`MemoryStore`] implements both for tests and for deployments
//! that feed configuration in at startup.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::session::TranscriptEntry;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Immutable per-tenant secretary definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretaryRecord {
    pub secretary_id: String,
    pub domain_id: String,
    pub name: String,
    pub extension: String,
    /// `turn_based`, `realtime` or `auto`.
    pub processing_mode: String,
    pub system_prompt: String,
    pub greeting_message: String,
    pub farewell_message: String,
    pub realtime_provider: Option<String>,
    pub fallback_providers: Vec<String>,
    pub voice: String,
    pub language: String,
    pub max_turns: u32,
    pub idle_timeout_seconds: u64,
    pub max_duration_seconds: u64,
    /// Output warmup window in milliseconds.
    pub audio_warmup_ms: u32,
    pub jitter_buffer_min_ms: u32,
    pub jitter_buffer_max_ms: u32,
    pub stream_buffer_ms: u32,
    pub default_transfer_extension: String,
    pub is_enabled: bool,
}

impl Default for SecretaryRecord {
    fn default() -> Self {
        Self {
            secretary_id: String::new(),
            domain_id: String::new(),
            name: "Secretary".into(),
            extension: String::new(),
            processing_mode: "realtime".into(),
            system_prompt: String::new(),
            greeting_message: "Olá! Como posso ajudar?".into(),
            farewell_message: "Foi um prazer ajudar!".into(),
            realtime_provider: None,
            fallback_providers: Vec::new(),
            voice: "alloy".into(),
            language: "pt-BR".into(),
            max_turns: 20,
            idle_timeout_seconds: 30,
            max_duration_seconds: 600,
            audio_warmup_ms: 200,
            jitter_buffer_min_ms: 100,
            jitter_buffer_max_ms: 300,
            stream_buffer_ms: 20,
            default_transfer_extension: "200".into(),
            is_enabled: true,
        }
    }
}

impl SecretaryRecord {
    pub fn supports_realtime(&self) -> bool {
        self.is_enabled && matches!(self.processing_mode.as_str(), "realtime" | "auto")
    }
}

/// Tenant-scoped provider credentials: a free-form config mapping plus
/// routing metadata. Adapters validate the mapping into typed configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub provider_id: String,
    pub domain_id: String,
    /// `realtime`, `stt`, `tts`, `llm`.
    pub provider_type: String,
    pub provider_name: String,
    pub config: serde_json::Value,
    pub is_default: bool,
    pub is_enabled: bool,
    pub priority: i32,
}

impl ProviderCredentials {
    pub fn config_str(&self, key: &str) -> Option<String> {
        self.config.get(key).and_then(|v| v.as_str()).map(str::to_owned)
    }
}

/// Daily window during which a destination accepts transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Empty means every day.
    pub days: Vec<Weekday>,
}

impl WorkingHours {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        use chrono::{Datelike, Timelike};
        if !self.days.is_empty() && !self.days.contains(&now.weekday()) {
            return false;
        }
        let t = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
            .unwrap_or(self.start);
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            // Overnight window.
            t >= self.start || t <= self.end
        }
    }
}

/// Kind of endpoint a transfer rule dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    Extension,
    RingGroup,
    Queue,
    Voicemail,
    External,
}

impl DestinationType {
    pub fn parse(value: &str) -> Self {
        match value {
            "ring_group" | "ring-group" | "group" => Self::RingGroup,
            "queue" | "fifo" => Self::Queue,
            "voicemail" => Self::Voicemail,
            "external" | "gateway" => Self::External,
            _ => Self::Extension,
        }
    }
}

/// Tenant- and optionally secretary-scoped transfer routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRule {
    pub rule_id: String,
    pub domain_id: String,
    pub secretary_id: Option<String>,
    pub department_name: String,
    pub intent_keywords: Vec<String>,
    pub destination_type: DestinationType,
    pub destination_number: String,
    pub destination_context: String,
    pub transfer_message: Option<String>,
    /// Lower value = higher priority.
    pub priority: i32,
    pub ring_timeout_seconds: u32,
    pub max_retries: u32,
    pub working_hours: Option<WorkingHours>,
    pub synonyms: Vec<String>,
    pub is_enabled: bool,
}

impl TransferRule {
    /// Keywords arrive from three historical storage formats: a real JSON
    /// array, a JSON string wrapping an array, or a comma-separated
    /// string. All three are accepted.
    pub fn parse_keywords(raw: &serde_json::Value) -> Vec<String> {
        match raw {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect(),
            serde_json::Value::String(s) => {
                if let Ok(serde_json::Value::Array(items)) =
                    serde_json::from_str::<serde_json::Value>(s)
                {
                    return items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|x| x.trim().to_owned())
                        .filter(|x| !x.is_empty())
                        .collect();
                }
                s.split(',')
                    .map(|k| k.trim().to_owned())
                    .filter(|k| !k.is_empty())
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn matches_text(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.intent_keywords
            .iter()
            .any(|kw| lower.contains(&kw.to_lowercase()))
    }
}

/// Header row persisted for every completed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub call_id: String,
    pub domain_id: String,
    pub secretary_id: String,
    pub caller_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_action: String,
    pub processing_mode: String,
}

/// Read access to tenant configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn secretary_by_extension(
        &self,
        domain_id: &str,
        extension: &str,
    ) -> StoreResult<Option<SecretaryRecord>>;

    async fn secretary_by_id(
        &self,
        domain_id: &str,
        secretary_id: &str,
    ) -> StoreResult<Option<SecretaryRecord>>;

    /// The realtime-capable secretary answering calls for a tenant.
    async fn default_secretary(&self, domain_id: &str) -> StoreResult<Option<SecretaryRecord>>;

    async fn provider_credentials(
        &self,
        domain_id: &str,
        provider_type: &str,
        provider_name: Option<&str>,
    ) -> StoreResult<Option<ProviderCredentials>>;

    /// Enabled rules for a secretary (specific + tenant-global), ordered by
    /// (priority asc, department name asc).
    async fn transfer_rules(
        &self,
        domain_id: &str,
        secretary_id: Option<&str>,
    ) -> StoreResult<Vec<TransferRule>>;
}

/// Write access for completed-call transcripts.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist the conversation header and its ordered messages in one
    /// transaction.
    async fn save_conversation(
        &self,
        record: &ConversationRecord,
        messages: &[TranscriptEntry],
    ) -> StoreResult<()>;
}

/// In-memory implementation of both store contracts.
#[derive(Default)]
pub struct MemoryStore {
    secretaries: RwLock<Vec<SecretaryRecord>>,
    providers: RwLock<Vec<ProviderCredentials>>,
    rules: RwLock<Vec<TransferRule>>,
    conversations: RwLock<Vec<(ConversationRecord, Vec<TranscriptEntry>)>>,
    /// Per-(domain, kind) fetch counter, used by cache tests.
    fetches: RwLock<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_secretary(&self, record: SecretaryRecord) {
        self.secretaries.write().push(record);
    }

    pub fn insert_provider(&self, record: ProviderCredentials) {
        self.providers.write().push(record);
    }

    pub fn insert_rule(&self, rule: TransferRule) {
        self.rules.write().push(rule);
    }

    pub fn saved_conversations(&self) -> Vec<(ConversationRecord, Vec<TranscriptEntry>)> {
        self.conversations.read().clone()
    }

    pub fn fetch_count(&self, key: &str) -> u64 {
        self.fetches.read().get(key).copied().unwrap_or(0)
    }

    fn count_fetch(&self, key: &str) {
        *self.fetches.write().entry(key.to_owned()).or_insert(0) += 1;
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn secretary_by_extension(
        &self,
        domain_id: &str,
        extension: &str,
    ) -> StoreResult<Option<SecretaryRecord>> {
        self.count_fetch(&format!("secretary:{domain_id}:{extension}"));
        Ok(self
            .secretaries
            .read()
            .iter()
            .find(|s| s.domain_id == domain_id && s.extension == extension && s.is_enabled)
            .cloned())
    }

    async fn secretary_by_id(
        &self,
        domain_id: &str,
        secretary_id: &str,
    ) -> StoreResult<Option<SecretaryRecord>> {
        self.count_fetch(&format!("secretary_id:{domain_id}:{secretary_id}"));
        Ok(self
            .secretaries
            .read()
            .iter()
            .find(|s| s.domain_id == domain_id && s.secretary_id == secretary_id)
            .cloned())
    }

    async fn default_secretary(&self, domain_id: &str) -> StoreResult<Option<SecretaryRecord>> {
        self.count_fetch(&format!("default_secretary:{domain_id}"));
        Ok(self
            .secretaries
            .read()
            .iter()
            .find(|s| s.domain_id == domain_id && s.supports_realtime())
            .cloned())
    }

    async fn provider_credentials(
        &self,
        domain_id: &str,
        provider_type: &str,
        provider_name: Option<&str>,
    ) -> StoreResult<Option<ProviderCredentials>> {
        self.count_fetch(&format!(
            "provider:{domain_id}:{provider_type}:{}",
            provider_name.unwrap_or("default")
        ));
        let providers = self.providers.read();
        let matching = providers.iter().filter(|p| {
            p.domain_id == domain_id && p.provider_type == provider_type && p.is_enabled
        });
        Ok(match provider_name {
            Some(name) => matching.into_iter().find(|p| p.provider_name == name).cloned(),
            None => matching
                .filter(|p| p.is_default)
                .min_by_key(|p| p.priority)
                .cloned(),
        })
    }

    async fn transfer_rules(
        &self,
        domain_id: &str,
        secretary_id: Option<&str>,
    ) -> StoreResult<Vec<TransferRule>> {
        self.count_fetch(&format!(
            "rules:{domain_id}:{}",
            secretary_id.unwrap_or("global")
        ));
        let mut rules: Vec<TransferRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| {
                r.domain_id == domain_id
                    && r.is_enabled
                    && match secretary_id {
                        Some(sid) => {
                            r.secretary_id.is_none() || r.secretary_id.as_deref() == Some(sid)
                        }
                        None => r.secretary_id.is_none(),
                    }
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.department_name.cmp(&b.department_name))
        });
        Ok(rules)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn save_conversation(
        &self,
        record: &ConversationRecord,
        messages: &[TranscriptEntry],
    ) -> StoreResult<()> {
        self.conversations
            .write()
            .push((record.clone(), messages.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn rule(domain: &str, secretary: Option<&str>, dept: &str, priority: i32) -> TransferRule {
        TransferRule {
            rule_id: format!("r-{dept}"),
            domain_id: domain.into(),
            secretary_id: secretary.map(str::to_owned),
            department_name: dept.into(),
            intent_keywords: vec![dept.to_lowercase()],
            destination_type: DestinationType::Extension,
            destination_number: "2000".into(),
            destination_context: "default".into(),
            transfer_message: None,
            priority,
            ring_timeout_seconds: 30,
            max_retries: 2,
            working_hours: None,
            synonyms: Vec::new(),
            is_enabled: true,
        }
    }

    #[test]
    fn keywords_accept_json_array() {
        let parsed = TransferRule::parse_keywords(&json!(["vendas", " compras "]));
        assert_eq!(parsed, vec!["vendas", "compras"]);
    }

    #[test]
    fn keywords_accept_json_encoded_string() {
        let parsed = TransferRule::parse_keywords(&json!("[\"vendas\",\"compras\"]"));
        assert_eq!(parsed, vec!["vendas", "compras"]);
    }

    #[test]
    fn keywords_accept_comma_separated_string() {
        let parsed = TransferRule::parse_keywords(&json!("vendas, compras , suporte"));
        assert_eq!(parsed, vec!["vendas", "compras", "suporte"]);
    }

    #[test]
    fn keywords_other_shapes_yield_empty() {
        assert!(TransferRule::parse_keywords(&json!(42)).is_empty());
        assert!(TransferRule::parse_keywords(&json!(null)).is_empty());
    }

    #[tokio::test]
    async fn rules_are_ordered_by_priority_then_name() {
        let store = MemoryStore::new();
        store.insert_rule(rule("t1", None, "Vendas", 5));
        store.insert_rule(rule("t1", Some("s1"), "Financeiro", 1));
        store.insert_rule(rule("t1", None, "Atendimento", 5));

        let rules = store.transfer_rules("t1", Some("s1")).await.unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.department_name.as_str()).collect();
        assert_eq!(names, vec!["Financeiro", "Atendimento", "Vendas"]);
    }

    #[tokio::test]
    async fn specific_secretary_gets_global_rules_too() {
        let store = MemoryStore::new();
        store.insert_rule(rule("t1", Some("other"), "Oculto", 0));
        store.insert_rule(rule("t1", None, "Global", 1));
        store.insert_rule(rule("t1", Some("s1"), "Mine", 2));

        let rules = store.transfer_rules("t1", Some("s1")).await.unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.department_name.as_str()).collect();
        assert_eq!(names, vec!["Global", "Mine"]);
    }

    #[tokio::test]
    async fn default_provider_prefers_lowest_priority() {
        let store = MemoryStore::new();
        for (name, priority, default) in [("openai", 10, true), ("gemini", 1, true), ("el", 0, false)] {
            store.insert_provider(ProviderCredentials {
                provider_id: name.into(),
                domain_id: "t1".into(),
                provider_type: "realtime".into(),
                provider_name: name.into(),
                config: json!({}),
                is_default: default,
                is_enabled: true,
                priority,
            });
        }
        let found = store
            .provider_credentials("t1", "realtime", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.provider_name, "gemini");
    }

    #[test]
    fn working_hours_overnight_window() {
        let wh = WorkingHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            days: Vec::new(),
        };
        let late = Utc.with_ymd_and_hms(2025, 6, 2, 23, 30, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2025, 6, 3, 5, 0, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap();
        assert!(wh.contains(late));
        assert!(wh.contains(morning));
        assert!(!wh.contains(midday));
    }
}
