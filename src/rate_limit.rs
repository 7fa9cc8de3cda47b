//! Per-tenant endpoint rate limits.
//!
//! Every batch-style endpoint (transcribe, synthesize, chat, documents)
//! gets sliding minute/hour/day counters keyed by tenant. Decisions carry
//! the remaining quota and, when refused, a retry-after hint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub requests_per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            requests_per_day: 10_000,
        }
    }
}

/// Built-in per-endpoint defaults; tenants may override.
pub fn default_limits(endpoint: &str) -> RateLimitConfig {
    match endpoint {
        "transcribe" => RateLimitConfig {
            requests_per_minute: 30,
            requests_per_hour: 500,
            requests_per_day: 5000,
        },
        "documents" => RateLimitConfig {
            requests_per_minute: 10,
            requests_per_hour: 100,
            requests_per_day: 500,
        },
        // synthesize, chat and anything else share the base profile.
        _ => RateLimitConfig::default(),
    }
}

#[derive(Debug)]
struct WindowState {
    minute_count: u32,
    hour_count: u32,
    day_count: u32,
    minute_reset: Instant,
    hour_reset: Instant,
    day_reset: Instant,
}

impl WindowState {
    fn new(now: Instant) -> Self {
        Self {
            minute_count: 0,
            hour_count: 0,
            day_count: 0,
            minute_reset: now + Duration::from_secs(60),
            hour_reset: now + Duration::from_secs(3600),
            day_reset: now + Duration::from_secs(86_400),
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.minute_reset {
            self.minute_count = 0;
            self.minute_reset = now + Duration::from_secs(60);
        }
        if now >= self.hour_reset {
            self.hour_count = 0;
            self.hour_reset = now + Duration::from_secs(3600);
        }
        if now >= self.day_reset {
            self.day_count = 0;
            self.day_reset = now + Duration::from_secs(86_400);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining_minute: i64,
    pub remaining_hour: i64,
    pub remaining_day: i64,
    /// Seconds until retry makes sense; set only when refused.
    pub retry_after_seconds: Option<u64>,
    /// Which window refused ("minute" | "hour" | "day").
    pub limit_type: Option<&'static str>,
}

pub struct TenantRateLimiter {
    default_config: RateLimitConfig,
    configs: Mutex<HashMap<String, RateLimitConfig>>,
    states: Mutex<HashMap<(String, String), WindowState>>,
}

impl TenantRateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            configs: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_config(&self, domain_id: &str, config: RateLimitConfig) {
        self.configs.lock().insert(domain_id.to_owned(), config);
        tracing::info!(
            domain = domain_id,
            rpm = config.requests_per_minute,
            "rate limit config updated"
        );
    }

    pub fn config_for(&self, domain_id: &str) -> RateLimitConfig {
        self.configs
            .lock()
            .get(domain_id)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Check and count one request against the tenant's windows.
    pub fn check(&self, domain_id: &str, endpoint: &str) -> RateLimitDecision {
        self.check_at(domain_id, endpoint, Instant::now())
    }

    fn check_at(&self, domain_id: &str, endpoint: &str, now: Instant) -> RateLimitDecision {
        let config = self
            .configs
            .lock()
            .get(domain_id)
            .copied()
            .unwrap_or_else(|| default_limits(endpoint));

        let mut states = self.states.lock();
        let state = states
            .entry((domain_id.to_owned(), endpoint.to_owned()))
            .or_insert_with(|| WindowState::new(now));
        state.roll(now);

        let remaining = |limit: u32, count: u32| limit as i64 - count as i64;

        let refuse = |state: &WindowState, limit_type, reset: Instant| {
            let retry = reset.saturating_duration_since(now).as_secs().max(1);
            tracing::warn!(
                domain = domain_id,
                endpoint,
                limit_type,
                "rate limit exceeded"
            );
            RateLimitDecision {
                allowed: false,
                remaining_minute: remaining(config.requests_per_minute, state.minute_count),
                remaining_hour: remaining(config.requests_per_hour, state.hour_count),
                remaining_day: remaining(config.requests_per_day, state.day_count),
                retry_after_seconds: Some(retry),
                limit_type: Some(limit_type),
            }
        };

        if state.minute_count >= config.requests_per_minute {
            return refuse(state, "minute", state.minute_reset);
        }
        if state.hour_count >= config.requests_per_hour {
            return refuse(state, "hour", state.hour_reset);
        }
        if state.day_count >= config.requests_per_day {
            return refuse(state, "day", state.day_reset);
        }

        state.minute_count += 1;
        state.hour_count += 1;
        state.day_count += 1;

        RateLimitDecision {
            allowed: true,
            remaining_minute: remaining(config.requests_per_minute, state.minute_count),
            remaining_hour: remaining(config.requests_per_hour, state.hour_count),
            remaining_day: remaining(config.requests_per_day, state.day_count),
            retry_after_seconds: None,
            limit_type: None,
        }
    }

    /// Drop counters for a tenant (all endpoints, or one).
    pub fn reset(&self, domain_id: &str, endpoint: Option<&str>) {
        let mut states = self.states.lock();
        match endpoint {
            Some(ep) => {
                states.remove(&(domain_id.to_owned(), ep.to_owned()));
            }
            None => states.retain(|(domain, _), _| domain != domain_id),
        }
        tracing::info!(domain = domain_id, endpoint = ?endpoint, "rate limits reset");
    }
}

impl Default for TenantRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
