//! Outbound ESL server: one TCP connection per live call, pushed to us
//! by the media server's dialplan.
//!
//! In **dual** mode the connection is an event relay only — hangup and
//! DTMF are correlated with the WebSocket-owned session through the
//! session manager, and the registered [`OutboundRelayHandle`] lets the
//! hybrid command adapter ride this socket for control commands. Media
//! never flows here.
//!
//! In **rtp** mode the connection additionally owns the call: it answers
//! the channel, creates the session itself, and bridges media through the
//! UDP RTP plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::event::{read_frame, ChannelVars, EslEvent, EslFrame};
use super::rtp::{RtpBridge, RtpBridgeConfig};
use crate::config::AudioMode;
use crate::esl::command::adapter_for_mode;
use crate::services::Services;
use crate::session::manager::SessionManager;
use crate::session::SessionConfig;

/// How long to keep retrying session correlation (the WebSocket leg may
/// connect after the ESL leg).
const CORRELATION_TIMEOUT: Duration = Duration::from_secs(5);
const CORRELATION_RETRY: Duration = Duration::from_millis(500);

/// Reply deadline for commands on the outbound socket.
const OUTBOUND_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands ride the per-call outbound socket; replies are routed back
/// from the connection's read loop.
pub struct OutboundRelayHandle {
    call_id: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    command_lock: tokio::sync::Mutex<()>,
    pending_reply: parking_lot::Mutex<Option<oneshot::Sender<EslFrame>>>,
    connected: AtomicBool,
}

impl OutboundRelayHandle {
    fn new(call_id: String, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            writer: tokio::sync::Mutex::new(writer),
            command_lock: tokio::sync::Mutex::new(()),
            pending_reply: parking_lot::Mutex::new(None),
            connected: AtomicBool::new(true),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.pending_reply.lock().take();
    }

    fn deliver_reply(&self, frame: EslFrame) {
        if let Some(tx) = self.pending_reply.lock().take() {
            let _ = tx.send(frame);
        }
    }

    /// Run an API command on this call's socket.
    pub async fn execute_api(&self, command: &str) -> Option<String> {
        if !self.is_connected() {
            return None;
        }
        let _guard = self.command_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.pending_reply.lock() = Some(tx);

        {
            let mut writer = self.writer.lock().await;
            if writer
                .write_all(format!("api {command}\n\n").as_bytes())
                .await
                .is_err()
            {
                self.pending_reply.lock().take();
                return None;
            }
        }

        match tokio::time::timeout(OUTBOUND_COMMAND_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Some(frame.response_text()),
            _ => {
                self.pending_reply.lock().take();
                tracing::warn!(call_id = %self.call_id, command, "outbound command timed out");
                None
            }
        }
    }

    pub async fn hangup(&self, cause: &str) -> bool {
        self.execute_api(&format!("uuid_kill {} {cause}", self.call_id))
            .await
            .map(|r| r.contains("+OK"))
            .unwrap_or(false)
    }
}

/// Live outbound connections keyed by call id.
#[derive(Default)]
pub struct RelayRegistry {
    relays: parking_lot::Mutex<HashMap<String, Arc<OutboundRelayHandle>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_id: &str, handle: Arc<OutboundRelayHandle>) {
        self.relays.lock().insert(call_id.to_owned(), handle);
    }

    pub fn unregister(&self, call_id: &str) {
        self.relays.lock().remove(call_id);
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<OutboundRelayHandle>> {
        self.relays.lock().get(call_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.relays.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.lock().is_empty()
    }
}

/// Accept loop for the outbound ESL port.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    services: Arc<Services>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, mode = %services.settings.audio_mode, "esl outbound server listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::info!(peer = %peer, "esl outbound connection accepted");
                let manager = Arc::clone(&manager);
                let services = Arc::clone(&services);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, manager, services).await {
                        tracing::warn!(error = %e, "esl outbound connection failed");
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("esl outbound server shutting down");
                return Ok(());
            }
        }
    }
}

struct OutboundHandshake {
    reader: BufReader<OwnedReadHalf>,
    handle: Arc<OutboundRelayHandle>,
    vars: ChannelVars,
}

/// Outbound protocol: `connect` returns the full channel-variable block,
/// then `myevents` scopes the event stream to this channel and `linger`
/// keeps it open through hangup.
async fn outbound_handshake(stream: TcpStream) -> Result<OutboundHandshake, String> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"connect\n\n")
        .await
        .map_err(|e| e.to_string())?;
    let channel_data = read_frame(&mut reader)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("closed during connect")?;
    let vars = ChannelVars::from_headers(&channel_data.headers);
    let call_id = vars.call_id.clone().ok_or("no Unique-ID in channel data")?;

    for command in ["myevents plain\n\n", "linger\n\n"] {
        write_half
            .write_all(command.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        read_frame(&mut reader)
            .await
            .map_err(|e| e.to_string())?
            .ok_or("closed during handshake")?;
    }

    tracing::info!(
        call_id = %call_id,
        caller = ?vars.caller_id,
        domain = ?vars.domain_id,
        remote_media = ?vars.remote_media_ip,
        "esl outbound session established"
    );

    Ok(OutboundHandshake {
        reader,
        handle: OutboundRelayHandle::new(call_id, write_half),
        vars,
    })
}

async fn handle_connection(
    stream: TcpStream,
    manager: Arc<SessionManager>,
    services: Arc<Services>,
) -> Result<(), String> {
    let OutboundHandshake {
        mut reader,
        handle,
        vars,
    } = outbound_handshake(stream).await?;
    let call_id = vars.call_id.clone().unwrap_or_default();

    services.relays.register(&call_id, Arc::clone(&handle));

    let result = if services.settings.audio_mode.esl_owns_media() {
        run_rtp_call(&mut reader, &handle, &vars, &manager, &services).await
    } else {
        run_event_relay(&mut reader, &handle, &vars, &manager).await
    };

    handle.mark_disconnected();
    services.relays.unregister(&call_id);
    tracing::info!(call_id = %call_id, "esl outbound session closed");
    result
}

/// Dual mode: relay channel events into the WebSocket-owned session.
/// Media is never touched here.
async fn run_event_relay(
    reader: &mut BufReader<OwnedReadHalf>,
    handle: &Arc<OutboundRelayHandle>,
    vars: &ChannelVars,
    manager: &Arc<SessionManager>,
) -> Result<(), String> {
    let call_id = vars.call_id.clone().unwrap_or_default();

    loop {
        let frame = match read_frame(reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e.to_string()),
        };

        if frame.is_command_reply() {
            handle.deliver_reply(frame);
            continue;
        }
        if frame.is_disconnect_notice() {
            dispatch_hangup(manager, &call_id).await;
            return Ok(());
        }
        let Some(event) = EslEvent::from_frame(&frame) else {
            continue;
        };

        match event.name.as_str() {
            "CHANNEL_HANGUP" | "CHANNEL_HANGUP_COMPLETE" => {
                tracing::info!(
                    call_id = %call_id,
                    cause = ?event.hangup_cause(),
                    "hangup relayed from esl"
                );
                dispatch_hangup(manager, &call_id).await;
                return Ok(());
            }
            "DTMF" => {
                if let Some(digit) = event.dtmf_digit() {
                    if let Some(session) = manager.get(&call_id) {
                        session.handle_dtmf(digit).await;
                    }
                }
            }
            "CHANNEL_ANSWER" => {
                tracing::debug!(call_id = %call_id, "channel answered");
            }
            other => {
                tracing::trace!(call_id = %call_id, event = other, "esl event ignored");
            }
        }
    }
}

/// The WebSocket leg may lag the ESL leg; retry correlation briefly
/// before giving up on delivering the hangup.
async fn dispatch_hangup(manager: &Arc<SessionManager>, call_id: &str) {
    let deadline = tokio::time::Instant::now() + CORRELATION_TIMEOUT;
    loop {
        if let Some(session) = manager.get(call_id) {
            session.handle_hangup().await;
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::debug!(call_id, "no session to correlate hangup with");
            return;
        }
        tokio::time::sleep(CORRELATION_RETRY).await;
    }
}

/// RTP mode: this connection owns the call end-to-end.
async fn run_rtp_call(
    reader: &mut BufReader<OwnedReadHalf>,
    handle: &Arc<OutboundRelayHandle>,
    vars: &ChannelVars,
    manager: &Arc<SessionManager>,
    services: &Arc<Services>,
) -> Result<(), String> {
    let call_id = vars.call_id.clone().unwrap_or_default();
    let domain_id = vars
        .domain_id
        .clone()
        .ok_or("no domain id in channel variables")?;

    handle.execute_api(&format!("uuid_answer {call_id}")).await;

    // Secretary by explicit id when the dialplan names one, else the
    // tenant default.
    let secretary = match &vars.secretary_id {
        Some(secretary_id) => services
            .config
            .secretary_by_id(&domain_id, secretary_id)
            .await
            .map_err(|e| e.to_string())?,
        None => services
            .config
            .default_secretary(&domain_id)
            .await
            .map_err(|e| e.to_string())?,
    }
    .ok_or_else(|| format!("no secretary configured for domain {domain_id}"))?;

    let rules = services
        .config
        .transfer_rules(&domain_id, Some(&secretary.secretary_id))
        .await
        .unwrap_or_default();

    let caller_id = vars.caller_id.clone().unwrap_or_default();
    let mut config =
        SessionConfig::from_secretary(&secretary, &call_id, &caller_id, &rules, &services.settings);
    // The RTP plane runs at the telephony rate.
    config.media_sample_rate = 8000;

    let bridge = RtpBridge::bind(RtpBridgeConfig {
        local_address: services.settings.rtp_bind_address.clone(),
        remote_address: vars.remote_media_ip.clone().unwrap_or_default(),
        remote_port: vars
            .remote_media_port
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        jitter_min_ms: services.settings.rtp_jitter_min_ms,
        jitter_max_ms: services.settings.rtp_jitter_max_ms,
        jitter_target_ms: services.settings.rtp_jitter_target_ms,
    })
    .await
    .map_err(|e| e.to_string())?;

    let esl = adapter_for_mode(
        AudioMode::Rtp,
        &call_id,
        Arc::clone(&services.relays),
        Arc::clone(&services.esl_client),
    );
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(256);
    let session = manager
        .create(config, esl, audio_tx)
        .await
        .map_err(|e| e.to_string())?;

    // Caller RTP → session.
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Vec<u8>>(256);
    bridge.start(inbound_tx);
    let inbound_session = session.clone();
    let inbound_task = tokio::spawn(async move {
        while let Some(pcm) = inbound_rx.recv().await {
            inbound_session.handle_audio_input(&pcm).await;
        }
    });

    // Session audio → RTP toward the media server.
    let bridge = Arc::new(bridge);
    let outbound_bridge = Arc::clone(&bridge);
    let outbound_task = tokio::spawn(async move {
        let mut talking = false;
        loop {
            match tokio::time::timeout(Duration::from_millis(200), audio_rx.recv()).await {
                Ok(Some(pcm)) => {
                    let marker = !talking;
                    talking = true;
                    if outbound_bridge.send_audio(&pcm, marker).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                // Silence gap: next audio starts a fresh talk spurt.
                Err(_) => talking = false,
            }
        }
    });

    // Keep reading channel events until hangup.
    let relay_result = run_event_relay(reader, handle, vars, manager).await;

    bridge.stop();
    inbound_task.abort();
    outbound_task.abort();
    if session.is_active() {
        session.stop("hangup").await;
    }
    relay_result
}
