//! Command interface over the media server, with three adapters.
//!
//! - [`OutboundCommandAdapter`] — rides the per-call outbound ESL socket
//!   registered by the event relay (dual mode: zero extra connections).
//! - [`InboundCommandAdapter`] — uses the persistent inbound client.
//! - [`HybridCommandAdapter`] — outbound first, inbound fallback; the
//!   advanced operations (originate, bridge, subscriptions, waits)
//!   always go inbound because the outbound socket cannot perform them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::client::{EslClient, EslError, EslResult};
use super::event::EslEvent;
use super::relay::RelayRegistry;
use crate::config::AudioMode;

/// Uniform surface for driving control commands into the media server.
#[async_trait]
pub trait EslCommandInterface: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Raw API command; `None` when the transport could not deliver it.
    async fn execute_api(&self, command: &str) -> Option<String>;

    async fn uuid_kill(&self, uuid: &str, cause: &str) -> bool;

    async fn uuid_hold(&self, uuid: &str, on: bool) -> bool;

    async fn uuid_break(&self, uuid: &str) -> bool;

    async fn uuid_broadcast(&self, uuid: &str, path: &str, leg: &str) -> bool;

    async fn uuid_exists(&self, uuid: &str) -> bool;

    async fn uuid_setvar(&self, uuid: &str, variable: &str, value: &str) -> bool {
        self.execute_api(&format!("uuid_setvar {uuid} {variable} {value}"))
            .await
            .map(|r| r.contains("+OK"))
            .unwrap_or(false)
    }

    // Advanced operations: only the inbound transport implements these.

    async fn originate(
        &self,
        _dial_string: &str,
        _app: &str,
        _timeout_seconds: u32,
        _variables: &[(String, String)],
    ) -> EslResult<String> {
        Err(EslError::Unsupported)
    }

    async fn uuid_bridge(&self, _uuid_a: &str, _uuid_b: &str) -> bool {
        false
    }

    async fn subscribe_events(&self, _events: &[&str], _uuid: Option<&str>) -> bool {
        false
    }

    async fn wait_for_event(
        &self,
        _event_names: &[&str],
        _uuid: Option<&str>,
        _timeout: Duration,
    ) -> Option<EslEvent> {
        None
    }
}

/// Commands dispatched on the call's own outbound ESL socket.
pub struct OutboundCommandAdapter {
    call_id: String,
    registry: Arc<RelayRegistry>,
}

impl OutboundCommandAdapter {
    pub fn new(call_id: impl Into<String>, registry: Arc<RelayRegistry>) -> Self {
        Self {
            call_id: call_id.into(),
            registry,
        }
    }
}

#[async_trait]
impl EslCommandInterface for OutboundCommandAdapter {
    fn is_connected(&self) -> bool {
        self.registry
            .get(&self.call_id)
            .map(|relay| relay.is_connected())
            .unwrap_or(false)
    }

    async fn execute_api(&self, command: &str) -> Option<String> {
        let relay = self.registry.get(&self.call_id)?;
        relay.execute_api(command).await
    }

    async fn uuid_kill(&self, uuid: &str, cause: &str) -> bool {
        self.execute_api(&format!("uuid_kill {uuid} {cause}"))
            .await
            .map(|r| r.contains("+OK"))
            .unwrap_or(false)
    }

    async fn uuid_hold(&self, uuid: &str, on: bool) -> bool {
        let cmd = if on {
            format!("uuid_hold {uuid}")
        } else {
            format!("uuid_hold off {uuid}")
        };
        self.execute_api(&cmd)
            .await
            .map(|r| r.contains("+OK"))
            .unwrap_or(false)
    }

    async fn uuid_break(&self, uuid: &str) -> bool {
        self.execute_api(&format!("uuid_break {uuid}"))
            .await
            .map(|r| r.contains("+OK"))
            .unwrap_or(false)
    }

    async fn uuid_broadcast(&self, uuid: &str, path: &str, leg: &str) -> bool {
        self.execute_api(&format!("uuid_broadcast {uuid} {path} {leg}"))
            .await
            .map(|r| r.contains("+OK") || r.contains("Success"))
            .unwrap_or(false)
    }

    async fn uuid_exists(&self, _uuid: &str) -> bool {
        // uuid_exists replies are not reliably delivered on outbound
        // sockets; report false so the hybrid adapter retries inbound.
        false
    }
}

/// Commands over the persistent inbound client.
pub struct InboundCommandAdapter {
    client: Arc<EslClient>,
}

impl InboundCommandAdapter {
    pub fn new(client: Arc<EslClient>) -> Self {
        Self { client }
    }

    async fn ensure_connected(&self) -> bool {
        if self.client.is_connected() {
            return true;
        }
        match self.client.connect().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "esl inbound connection failed");
                false
            }
        }
    }
}

#[async_trait]
impl EslCommandInterface for InboundCommandAdapter {
    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn execute_api(&self, command: &str) -> Option<String> {
        if !self.ensure_connected().await {
            return None;
        }
        match self.client.execute_api(command).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(command = %command, error = %e, "esl inbound api failed");
                None
            }
        }
    }

    async fn uuid_kill(&self, uuid: &str, cause: &str) -> bool {
        self.ensure_connected().await && self.client.uuid_kill(uuid, cause).await
    }

    async fn uuid_hold(&self, uuid: &str, on: bool) -> bool {
        self.ensure_connected().await && self.client.uuid_hold(uuid, on).await
    }

    async fn uuid_break(&self, uuid: &str) -> bool {
        self.ensure_connected().await && self.client.uuid_break(uuid, false).await
    }

    async fn uuid_broadcast(&self, uuid: &str, path: &str, leg: &str) -> bool {
        self.ensure_connected().await && self.client.uuid_broadcast(uuid, path, leg).await
    }

    async fn uuid_exists(&self, uuid: &str) -> bool {
        self.ensure_connected().await && self.client.uuid_exists(uuid).await
    }

    async fn originate(
        &self,
        dial_string: &str,
        app: &str,
        timeout_seconds: u32,
        variables: &[(String, String)],
    ) -> EslResult<String> {
        if !self.ensure_connected().await {
            return Err(EslError::NotConnected);
        }
        self.client
            .originate(dial_string, app, timeout_seconds, variables)
            .await
    }

    async fn uuid_bridge(&self, uuid_a: &str, uuid_b: &str) -> bool {
        self.ensure_connected().await && self.client.uuid_bridge(uuid_a, uuid_b).await
    }

    async fn subscribe_events(&self, events: &[&str], uuid: Option<&str>) -> bool {
        self.ensure_connected().await
            && self.client.subscribe_events(events, uuid).await.is_ok()
    }

    async fn wait_for_event(
        &self,
        event_names: &[&str],
        uuid: Option<&str>,
        timeout: Duration,
    ) -> Option<EslEvent> {
        if !self.ensure_connected().await {
            return None;
        }
        self.client.wait_for_event(event_names, uuid, timeout).await
    }
}

/// Outbound first, inbound as fallback.
pub struct HybridCommandAdapter {
    outbound: OutboundCommandAdapter,
    inbound: InboundCommandAdapter,
}

impl HybridCommandAdapter {
    pub fn new(
        call_id: impl Into<String>,
        registry: Arc<RelayRegistry>,
        client: Arc<EslClient>,
    ) -> Self {
        Self {
            outbound: OutboundCommandAdapter::new(call_id, registry),
            inbound: InboundCommandAdapter::new(client),
        }
    }
}

#[async_trait]
impl EslCommandInterface for HybridCommandAdapter {
    fn is_connected(&self) -> bool {
        self.outbound.is_connected() || self.inbound.is_connected()
    }

    async fn execute_api(&self, command: &str) -> Option<String> {
        if self.outbound.is_connected() {
            if let Some(result) = self.outbound.execute_api(command).await {
                return Some(result);
            }
        }
        self.inbound.execute_api(command).await
    }

    async fn uuid_kill(&self, uuid: &str, cause: &str) -> bool {
        if self.outbound.is_connected() && self.outbound.uuid_kill(uuid, cause).await {
            tracing::debug!(uuid = %uuid, "uuid_kill via outbound");
            return true;
        }
        self.inbound.uuid_kill(uuid, cause).await
    }

    async fn uuid_hold(&self, uuid: &str, on: bool) -> bool {
        if self.outbound.is_connected() && self.outbound.uuid_hold(uuid, on).await {
            return true;
        }
        self.inbound.uuid_hold(uuid, on).await
    }

    async fn uuid_break(&self, uuid: &str) -> bool {
        if self.outbound.is_connected() && self.outbound.uuid_break(uuid).await {
            tracing::debug!(uuid = %uuid, "uuid_break via outbound");
            return true;
        }
        self.inbound.uuid_break(uuid).await
    }

    async fn uuid_broadcast(&self, uuid: &str, path: &str, leg: &str) -> bool {
        if self.outbound.is_connected() && self.outbound.uuid_broadcast(uuid, path, leg).await {
            return true;
        }
        self.inbound.uuid_broadcast(uuid, path, leg).await
    }

    async fn uuid_exists(&self, uuid: &str) -> bool {
        if self.outbound.is_connected() && self.outbound.uuid_exists(uuid).await {
            return true;
        }
        self.inbound.uuid_exists(uuid).await
    }

    async fn originate(
        &self,
        dial_string: &str,
        app: &str,
        timeout_seconds: u32,
        variables: &[(String, String)],
    ) -> EslResult<String> {
        self.inbound
            .originate(dial_string, app, timeout_seconds, variables)
            .await
    }

    async fn uuid_bridge(&self, uuid_a: &str, uuid_b: &str) -> bool {
        self.inbound.uuid_bridge(uuid_a, uuid_b).await
    }

    async fn subscribe_events(&self, events: &[&str], uuid: Option<&str>) -> bool {
        self.inbound.subscribe_events(events, uuid).await
    }

    async fn wait_for_event(
        &self,
        event_names: &[&str],
        uuid: Option<&str>,
        timeout: Duration,
    ) -> Option<EslEvent> {
        self.inbound.wait_for_event(event_names, uuid, timeout).await
    }
}

/// Pick the adapter matching the configured audio mode.
pub fn adapter_for_mode(
    mode: AudioMode,
    call_id: &str,
    registry: Arc<RelayRegistry>,
    client: Arc<EslClient>,
) -> Arc<dyn EslCommandInterface> {
    match mode {
        AudioMode::Dual => {
            tracing::debug!(call_id = %call_id, "using hybrid esl adapter");
            Arc::new(HybridCommandAdapter::new(call_id, registry, client))
        }
        _ => {
            tracing::debug!(call_id = %call_id, "using inbound esl adapter");
            Arc::new(InboundCommandAdapter::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_adapter_without_relay_reports_disconnected() {
        let registry = Arc::new(RelayRegistry::new());
        let adapter = OutboundCommandAdapter::new("missing-call", registry);
        assert!(!adapter.is_connected());
        assert!(adapter.execute_api("uuid_break x").await.is_none());
        assert!(!adapter.uuid_break("x").await);
    }

    #[tokio::test]
    async fn outbound_uuid_exists_always_defers() {
        let registry = Arc::new(RelayRegistry::new());
        let adapter = OutboundCommandAdapter::new("c1", registry);
        assert!(!adapter.uuid_exists("c1").await);
    }

    #[tokio::test]
    async fn default_advanced_ops_are_unsupported() {
        let registry = Arc::new(RelayRegistry::new());
        let adapter = OutboundCommandAdapter::new("c1", registry);
        assert!(matches!(
            adapter.originate("user/1@d", "&park()", 5, &[]).await,
            Err(EslError::Unsupported)
        ));
        assert!(!adapter.uuid_bridge("a", "b").await);
        assert!(adapter
            .wait_for_event(&["CHANNEL_ANSWER"], None, Duration::from_millis(1))
            .await
            .is_none());
    }
}
