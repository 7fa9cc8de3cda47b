//! Media WebSocket server: the accepted side of the FreeSWITCH
//! mod_audio_stream connection.
//!
//! ## Protocol
//!
//! 1. FreeSWITCH connects to `/stream/{tenant}/{call}`.
//! 2. First client text frame should be `{"type":"metadata","caller_id":…}`;
//!    a missing metadata frame falls back to an empty caller id.
//! 3. The server announces `{"type":"rawAudio","data":{"sampleRate":N}}`
//!    and then streams provider audio as binary PCM16LE frames.
//! 4. Client binary frames are caller PCM; client text frames carry
//!    `{"type":"dtmf","digit":…}` and `{"type":"hangup"}` control.
//! 5. `/health` accepts the handshake and closes with code 1000. Any
//!    other path closes with 1008.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::esl::command::adapter_for_mode;
use crate::session::manager::SessionManager;
use crate::session::{Session, SessionConfig};
use crate::services::Services;

/// WebSocket close code for a path that matched nothing.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

const CLOSE_NORMAL: u16 = 1000;

#[derive(Clone)]
pub struct MediaServerState {
    pub manager: Arc<SessionManager>,
    pub services: Arc<Services>,
}

pub fn router(state: MediaServerState) -> Router {
    Router::new()
        .route("/stream/:domain/:call", get(handle_stream))
        .route("/health", get(handle_health))
        .fallback(handle_unknown)
        // Upgrade requests are tiny; cap the handshake phase. The
        // upgraded stream itself is not subject to these layers.
        .layer(tower_http::limit::RequestBodyLimitLayer::new(64 * 1024))
        .layer(tower_http::timeout::TimeoutLayer::new(
            std::time::Duration::from_secs(30),
        ))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: MediaServerState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "media websocket server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_stream(
    State(state): State<MediaServerState>,
    Path((domain_id, call_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::info!(domain = %domain_id, call_id = %call_id, "media connection received");
    ws.on_upgrade(move |socket| handle_media_connection(socket, state, domain_id, call_id))
}

async fn handle_health(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: "OK".into(),
            })))
            .await;
    })
}

/// Upgrade-then-refuse so clients see a policy close, not an HTTP error.
async fn handle_unknown(ws: Option<WebSocketUpgrade>) -> axum::response::Response {
    match ws {
        Some(ws) => ws
            .on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: "Invalid path".into(),
                    })))
                    .await;
            })
            .into_response(),
        None => (axum::http::StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Create the session for this call from tenant configuration.
async fn create_session(
    state: &MediaServerState,
    domain_id: &str,
    call_id: &str,
    caller_id: &str,
    audio_tx: mpsc::Sender<Vec<u8>>,
) -> Result<Session, String> {
    let secretary = state
        .services
        .config
        .default_secretary(domain_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no realtime secretary configured for domain {domain_id}"))?;

    let rules = state
        .services
        .config
        .transfer_rules(domain_id, Some(&secretary.secretary_id))
        .await
        .unwrap_or_default();

    let config = SessionConfig::from_secretary(
        &secretary,
        call_id,
        caller_id,
        &rules,
        &state.services.settings,
    );

    let esl = adapter_for_mode(
        state.services.settings.audio_mode,
        call_id,
        Arc::clone(&state.services.relays),
        Arc::clone(&state.services.esl_client),
    );

    state
        .manager
        .create(config, esl, audio_tx)
        .await
        .map_err(|e| e.to_string())
}

async fn handle_media_connection(
    socket: WebSocket,
    state: MediaServerState,
    domain_id: String,
    call_id: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(256);

    // Phase 1: the first frame settles the caller id. A missing or
    // non-metadata first frame still gets a session, with an empty id.
    let first = match ws_receiver.next().await {
        Some(Ok(message)) => message,
        _ => {
            tracing::info!(call_id = %call_id, "media connection closed before any frame");
            return;
        }
    };

    let mut caller_id = String::new();
    let mut leftover: Option<Message> = None;
    match &first {
        Message::Text(text) => {
            match serde_json::from_str::<Value>(text) {
                Ok(value) if value.get("type").and_then(Value::as_str) == Some("metadata") => {
                    caller_id = value
                        .get("caller_id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_owned();
                }
                _ => leftover = Some(first.clone()),
            }
        }
        Message::Close(_) => return,
        _ => leftover = Some(first.clone()),
    }

    let session =
        match create_session(&state, &domain_id, &call_id, &caller_id, audio_tx.clone()).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(
                    domain = %domain_id,
                    call_id = %call_id,
                    error = %e,
                    "session creation failed"
                );
                let _ = ws_sender.send(Message::Close(None)).await;
                return;
            }
        };

    // Announce the playback rate before any binary audio goes out.
    let announce = json!({
        "type": "rawAudio",
        "data": { "sampleRate": state.services.settings.media_sample_rate }
    });
    if ws_sender
        .send(Message::Text(announce.to_string()))
        .await
        .is_err()
    {
        session.stop("connection_closed").await;
        return;
    }

    // Provider audio → binary frames, on a dedicated writer task.
    let writer_call = call_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(pcm) = audio_rx.recv().await {
            if ws_sender.send(Message::Binary(pcm)).await.is_err() {
                tracing::debug!(call_id = %writer_call, "media writer closed");
                return;
            }
        }
    });

    // Phase 2: pump frames into the session.
    let mut pending = leftover;
    loop {
        let message = match pending.take() {
            Some(message) => message,
            None => match ws_receiver.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::info!(call_id = %call_id, error = %e, "media websocket error");
                    break;
                }
                None => break,
            },
        };

        match message {
            Message::Binary(pcm) => {
                state.manager.route_audio(&call_id, &pcm).await;
            }
            Message::Text(text) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match value.get("type").and_then(Value::as_str) {
                    Some("dtmf") => {
                        let digit = value.get("digit").and_then(Value::as_str).unwrap_or("");
                        session.handle_dtmf(digit).await;
                    }
                    Some("hangup") => {
                        tracing::info!(call_id = %call_id, "hangup frame received");
                        session.stop("hangup").await;
                        break;
                    }
                    Some("metadata") => {
                        // Late or duplicate metadata frames carry nothing new.
                    }
                    other => {
                        tracing::debug!(call_id = %call_id, kind = ?other, "unknown control frame");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if session.is_active() {
        session.stop("connection_closed").await;
    }
    writer_task.abort();
    tracing::info!(call_id = %call_id, "media connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderEvent;
    use crate::session::manager::tests::fixture;
    use crate::store::SecretaryRecord;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    async fn spawn_server(state: MediaServerState) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = serve(listener, state, std::future::pending()).await;
        });
        port
    }

    fn media_state() -> (crate::session::manager::tests::Fixture, MediaServerState) {
        let fx = fixture();
        fx.store.insert_secretary(SecretaryRecord {
            secretary_id: "sec-1".into(),
            domain_id: "T1".into(),
            realtime_provider: Some("openai".into()),
            greeting_message: "Olá, em que posso ajudar?".into(),
            ..Default::default()
        });
        let state = MediaServerState {
            manager: fx.manager.clone(),
            services: fx.services.clone(),
        };
        (fx, state)
    }

    #[tokio::test]
    async fn health_endpoint_closes_normally() {
        let (_fx, state) = media_state();
        let port = spawn_server(state).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        match ws.next().await {
            Some(Ok(ClientMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1000);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_path_closes_with_policy_violation() {
        let (_fx, state) = media_state();
        let port = spawn_server(state).await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/nowhere"))
                .await
                .unwrap();
        match ws.next().await {
            Some(Ok(ClientMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1008);
            }
            other => panic!("expected 1008 close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_greeting_flow() {
        let (fx, state) = media_state();
        let port = spawn_server(state).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://127.0.0.1:{port}/stream/T1/C1"
        ))
        .await
        .unwrap();

        ws.send(ClientMessage::Text(
            serde_json::json!({"type": "metadata", "caller_id": "+5511999999999"}).to_string(),
        ))
        .await
        .unwrap();

        // First server frame announces the playback rate.
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let ClientMessage::Text(text) = frame else {
            panic!("expected rawAudio text frame, got {frame:?}");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "rawAudio");
        assert_eq!(value["data"]["sampleRate"], 16_000);

        // Drive the greeting through the mock provider.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let provider = fx.provider_states.lock()[0].clone();
        provider.emit(ProviderEvent::ResponseStarted).await;
        provider
            .emit(ProviderEvent::TranscriptDelta {
                text: "Olá, em que posso ajudar?".into(),
            })
            .await;
        provider
            .emit(ProviderEvent::TranscriptDone { text: String::new() })
            .await;
        provider
            .emit(ProviderEvent::AudioDelta {
                audio: vec![7u8; 12_800],
            })
            .await;

        // Binary PCM follows once the warmup window fills.
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(
            matches!(frame, ClientMessage::Binary(ref b) if !b.is_empty()),
            "expected binary PCM, got {frame:?}"
        );

        let session = fx.manager.get("C1").expect("session registered");
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, "assistant");
        assert_eq!(transcript[0].text, "Olá, em que posso ajudar?");
    }

    #[tokio::test]
    async fn missing_metadata_creates_default_session() {
        let (fx, state) = media_state();
        let port = spawn_server(state).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://127.0.0.1:{port}/stream/T1/C2"
        ))
        .await
        .unwrap();

        // Straight to binary audio, no metadata frame.
        ws.send(ClientMessage::Binary(vec![0u8; 640])).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, ClientMessage::Text(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.manager.get("C2").is_some(), "session exists without metadata");
    }

    #[tokio::test]
    async fn hangup_frame_stops_session() {
        let (fx, state) = media_state();
        let port = spawn_server(state).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://127.0.0.1:{port}/stream/T1/C3"
        ))
        .await
        .unwrap();
        ws.send(ClientMessage::Text(
            serde_json::json!({"type": "metadata", "caller_id": "x"}).to_string(),
        ))
        .await
        .unwrap();
        let _ = ws.next().await; // rawAudio announce

        tokio::time::sleep(Duration::from_millis(100)).await;
        let session = fx.manager.get("C3").unwrap();
        assert!(session.is_active());

        ws.send(ClientMessage::Text(
            serde_json::json!({"type": "hangup"}).to_string(),
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(session.stop_reason().as_deref(), Some("hangup"));
        assert!(fx.manager.get("C3").is_none(), "reaper removed the session");
    }
}

