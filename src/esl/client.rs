//! Inbound ESL client: a persistent authenticated connection to the
//! media server for API commands, event subscription and event waiting.
//!
//! One reader task owns the socket's read half and routes frames:
//! command/api replies go to the single pending-command slot, channel
//! events go to a broadcast queue feeding `wait_for_event` callers. A
//! command lock keeps at most one command/reply pair in flight, so
//! replies can never race events. Reconnection is automatic with bounded
//! retries and an exponential delay; subscriptions are restored after a
//! reconnect.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};

use super::event::{read_frame, EslEvent, EslFrame};

pub const DEFAULT_ESL_PORT: u16 = 8021;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Buffered channel events kept for `wait_for_event` subscribers.
const EVENT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EslError {
    #[error("esl connection failed: {0}")]
    Connect(String),
    #[error("esl authentication rejected")]
    AuthFailed,
    #[error("not connected to esl")]
    NotConnected,
    #[error("esl i/o error: {0}")]
    Io(String),
    #[error("esl command timed out")]
    Timeout,
    #[error("esl command failed: {0}")]
    CommandFailed(String),
    #[error("originate failed (cause: {cause:?})")]
    OriginateFailed { cause: Option<String> },
    #[error("operation not supported on this adapter")]
    Unsupported,
}

pub type EslResult<T> = Result<T, EslError>;

struct ClientShared {
    /// Write half; replaced on reconnect.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// At most one command awaits its reply at any time.
    pending_reply: parking_lot::Mutex<Option<oneshot::Sender<EslFrame>>>,
    connected: AtomicBool,
    events: broadcast::Sender<EslEvent>,
}

impl ClientShared {
    fn deliver_reply(&self, frame: EslFrame) {
        if let Some(tx) = self.pending_reply.lock().take() {
            let _ = tx.send(frame);
        } else {
            tracing::debug!(reply = %frame.response_text(), "unsolicited esl reply dropped");
        }
    }
}

pub struct EslClient {
    host: String,
    port: u16,
    password: String,
    shared: Arc<ClientShared>,
    /// Serialises command/reply pairs.
    command_lock: Mutex<()>,
    connect_lock: Mutex<()>,
    reconnecting: AtomicBool,
    subscribed: parking_lot::Mutex<HashSet<String>>,
    reader_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EslClient {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self {
            host: host.into(),
            port,
            password: password.into(),
            shared: Arc::new(ClientShared {
                writer: Mutex::new(None),
                pending_reply: parking_lot::Mutex::new(None),
                connected: AtomicBool::new(false),
                events,
            }),
            command_lock: Mutex::new(()),
            connect_lock: Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            subscribed: parking_lot::Mutex::new(HashSet::new()),
            reader_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to the raw channel-event stream.
    pub fn event_stream(&self) -> broadcast::Receiver<EslEvent> {
        self.shared.events.subscribe()
    }

    pub async fn connect(&self) -> EslResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| EslError::Connect(format!("timeout connecting to {addr}")))?
            .map_err(|e| EslError::Connect(e.to_string()))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Banner, then authenticate.
        let banner = read_frame(&mut reader)
            .await?
            .ok_or_else(|| EslError::Connect("closed before auth request".into()))?;
        if !banner.is_auth_request() {
            return Err(EslError::Connect(format!(
                "unexpected banner: {}",
                banner.content_type()
            )));
        }

        write_half
            .write_all(format!("auth {}\n\n", self.password).as_bytes())
            .await
            .map_err(|e| EslError::Io(e.to_string()))?;
        let reply = read_frame(&mut reader)
            .await?
            .ok_or_else(|| EslError::Connect("closed during auth".into()))?;
        if !reply.is_reply_ok() {
            tracing::error!(reply = %reply.response_text(), "esl authentication failed");
            return Err(EslError::AuthFailed);
        }

        *self.shared.writer.lock().await = Some(write_half);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        *self.reader_task.lock() = Some(tokio::spawn(async move {
            Self::reader_loop(reader, shared).await;
        }));

        tracing::info!(host = %self.host, port = self.port, "connected to freeswitch esl");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.write_all(b"exit\n\n").await;
            let _ = writer.shutdown().await;
        }
        tracing::info!("disconnected from esl");
    }

    async fn reader_loop(mut reader: BufReader<OwnedReadHalf>, shared: Arc<ClientShared>) {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if frame.is_event() {
                        if let Some(event) = EslEvent::from_frame(&frame) {
                            // Lagging receivers just lose the oldest events.
                            let _ = shared.events.send(event);
                        }
                    } else if frame.is_command_reply() {
                        shared.deliver_reply(frame);
                    } else if frame.is_disconnect_notice() {
                        tracing::warn!("esl server sent disconnect notice");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if shared.connected.load(Ordering::SeqCst) {
                        tracing::error!(error = %e, "esl reader error");
                    }
                    break;
                }
            }
        }
        shared.connected.store(false, Ordering::SeqCst);
        // Fail any command still waiting for its reply.
        shared.pending_reply.lock().take();
    }

    /// Bounded reconnect with exponential delay; restores subscriptions.
    pub async fn reconnect(&self) -> EslResult<()> {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EslError::Connect("reconnect already in progress".into()));
        }

        let result = async {
            let mut delay = RECONNECT_BASE_DELAY;
            for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
                tracing::info!(attempt, max = MAX_RECONNECT_ATTEMPTS, "esl reconnect attempt");
                self.disconnect().await;
                tokio::time::sleep(delay).await;
                delay *= 2;

                if self.connect().await.is_ok() {
                    // Restore subscriptions on the fresh connection. The
                    // unlocked send is safe here: either the caller holds
                    // the command lock already, or the reconnecting flag
                    // is the only writer.
                    let events: Vec<String> = {
                        let mut subscribed = self.subscribed.lock();
                        subscribed.drain().collect()
                    };
                    for name in events {
                        match self
                            .send_command_unlocked(
                                &format!("event plain {name}"),
                                COMMAND_TIMEOUT,
                            )
                            .await
                        {
                            Ok(_) => {
                                self.subscribed.lock().insert(name);
                            }
                            Err(e) => {
                                tracing::warn!(event = %name, error = %e, "failed to resubscribe");
                            }
                        }
                    }
                    return Ok(());
                }
            }
            tracing::error!("esl reconnect failed after max attempts");
            Err(EslError::Connect("reconnect exhausted".into()))
        }
        .await;

        self.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    async fn ensure_connected(&self) -> EslResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.connect().await.is_ok() {
            return Ok(());
        }
        self.reconnect().await
    }

    async fn write_raw(&self, data: &str) -> EslResult<()> {
        let mut writer = self.shared.writer.lock().await;
        let writer = writer.as_mut().ok_or(EslError::NotConnected)?;
        writer
            .write_all(data.as_bytes())
            .await
            .map_err(|e| EslError::Io(e.to_string()))
    }

    /// Send one command and await its reply frame, serialised against
    /// every other command.
    async fn send_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> EslResult<EslFrame> {
        let _guard = self.command_lock.lock().await;
        self.ensure_connected().await?;
        self.send_command_unlocked(command, timeout).await
    }

    /// Raw command/reply exchange. Callers must hold the command lock or
    /// otherwise guarantee exclusivity.
    async fn send_command_unlocked(
        &self,
        command: &str,
        timeout: Duration,
    ) -> EslResult<EslFrame> {
        let (tx, rx) = oneshot::channel();
        *self.shared.pending_reply.lock() = Some(tx);

        if let Err(e) = self.write_raw(&format!("{command}\n\n")).await {
            self.shared.pending_reply.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(EslError::NotConnected),
            Err(_) => {
                self.shared.pending_reply.lock().take();
                Err(EslError::Timeout)
            }
        }
    }

    async fn send_command(&self, command: &str) -> EslResult<EslFrame> {
        self.send_command_with_timeout(command, COMMAND_TIMEOUT).await
    }

    /// Execute a FreeSWITCH API command, returning the response text.
    pub async fn execute_api(&self, command: &str) -> EslResult<String> {
        let frame = self.send_command(&format!("api {command}")).await?;
        Ok(frame.response_text())
    }

    /// Execute a command in the background; returns the Job-UUID.
    pub async fn execute_bgapi(&self, command: &str) -> EslResult<String> {
        let frame = self.send_command(&format!("bgapi {command}")).await?;
        let text = frame.response_text();
        if let Some(job) = frame.headers.get("Job-UUID") {
            return Ok(job.clone());
        }
        text.lines()
            .find_map(|line| line.strip_prefix("Job-UUID:").map(|j| j.trim().to_owned()))
            .ok_or_else(|| EslError::CommandFailed(text))
    }

    /// Subscribe to plain events, optionally filtering by channel uuid.
    pub async fn subscribe_events(
        &self,
        events: &[&str],
        uuid: Option<&str>,
    ) -> EslResult<()> {
        for name in events {
            if self.subscribed.lock().contains(*name) {
                continue;
            }
            self.send_command(&format!("event plain {name}")).await?;
            self.subscribed.lock().insert((*name).to_owned());
        }
        if let Some(uuid) = uuid {
            self.send_command(&format!("filter Unique-ID {uuid}")).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_filter(&self, uuid: &str) -> EslResult<()> {
        self.send_command(&format!("filter delete Unique-ID {uuid}"))
            .await?;
        Ok(())
    }

    /// Wait for one of the named events, optionally scoped to a channel.
    pub async fn wait_for_event(
        &self,
        event_names: &[&str],
        uuid: Option<&str>,
        timeout: Duration,
    ) -> Option<EslEvent> {
        let mut rx = self.event_stream();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())?
                .min(Duration::from_secs(1));
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event_names.contains(&event.name.as_str())
                        && (uuid.is_none() || event.uuid.as_deref() == uuid)
                    {
                        return Some(event);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "esl event waiter lagged");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        return None;
                    }
                }
            }
        }
    }

    // ── High-level channel commands ──────────────────────────────────

    pub async fn uuid_broadcast(&self, uuid: &str, audio: &str, leg: &str) -> bool {
        match self.execute_api(&format!("uuid_broadcast {uuid} {audio} {leg}")).await {
            Ok(result) if result.contains("+OK") || result.contains("Success") => true,
            Ok(result) => {
                tracing::warn!(uuid = %uuid, result = %result, "uuid_broadcast failed");
                false
            }
            Err(e) => {
                tracing::error!(uuid = %uuid, error = %e, "uuid_broadcast error");
                false
            }
        }
    }

    pub async fn uuid_break(&self, uuid: &str, all: bool) -> bool {
        let cmd = if all {
            format!("uuid_break {uuid} all")
        } else {
            format!("uuid_break {uuid}")
        };
        matches!(self.execute_api(&cmd).await, Ok(result) if result.contains("+OK"))
    }

    pub async fn uuid_bridge(&self, uuid_a: &str, uuid_b: &str) -> bool {
        match self.execute_api(&format!("uuid_bridge {uuid_a} {uuid_b}")).await {
            Ok(result) if result.contains("+OK") => {
                tracing::info!(a_leg = %uuid_a, b_leg = %uuid_b, "uuid_bridge established");
                true
            }
            Ok(result) => {
                tracing::warn!(result = %result, "uuid_bridge failed");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "uuid_bridge error");
                false
            }
        }
    }

    pub async fn uuid_kill(&self, uuid: &str, cause: &str) -> bool {
        matches!(
            self.execute_api(&format!("uuid_kill {uuid} {cause}")).await,
            Ok(result) if result.contains("+OK")
        )
    }

    pub async fn uuid_hold(&self, uuid: &str, on: bool) -> bool {
        let cmd = if on {
            format!("uuid_hold {uuid}")
        } else {
            format!("uuid_hold off {uuid}")
        };
        matches!(self.execute_api(&cmd).await, Ok(result) if result.contains("+OK"))
    }

    pub async fn uuid_exists(&self, uuid: &str) -> bool {
        matches!(
            self.execute_api(&format!("uuid_exists {uuid}")).await,
            Ok(result) if result.to_lowercase().contains("true")
        )
    }

    pub async fn uuid_getvar(&self, uuid: &str, variable: &str) -> Option<String> {
        match self.execute_api(&format!("uuid_getvar {uuid} {variable}")).await {
            Ok(result) if !result.starts_with("-ERR") => Some(result.trim().to_owned()),
            _ => None,
        }
    }

    pub async fn uuid_setvar(&self, uuid: &str, variable: &str, value: &str) -> bool {
        matches!(
            self.execute_api(&format!("uuid_setvar {uuid} {variable} {value}")).await,
            Ok(result) if result.contains("+OK")
        )
    }

    /// Attach or detach a media stream on a channel (mod_audio_stream).
    pub async fn uuid_audio_stream(&self, uuid: &str, action: &str, args: &str) -> bool {
        let cmd = if args.is_empty() {
            format!("uuid_audio_stream {uuid} {action}")
        } else {
            format!("uuid_audio_stream {uuid} {action} {args}")
        };
        matches!(self.execute_api(&cmd).await, Ok(result) if result.contains("+OK"))
    }

    /// Originate a b-leg. The API form blocks until the destination
    /// answers (or fails), so `+OK` means the new channel is live.
    pub async fn originate(
        &self,
        dial_string: &str,
        app: &str,
        timeout_seconds: u32,
        variables: &[(String, String)],
    ) -> EslResult<String> {
        let new_uuid = uuid::Uuid::new_v4().to_string();
        let mut vars = variables.to_vec();
        vars.push(("origination_uuid".to_owned(), new_uuid.clone()));
        vars.push((
            "originate_timeout".to_owned(),
            timeout_seconds.to_string(),
        ));
        let var_string = super::event::format_originate_vars(&vars);
        let command = format!("originate {var_string}{dial_string} {app}");

        tracing::info!(dial_string = %dial_string, b_leg = %new_uuid, "originating");

        // Block for up to the ring timeout plus protocol slack.
        let frame = self
            .send_command_with_timeout(
                &format!("api {command}"),
                Duration::from_secs(timeout_seconds as u64 + 10),
            )
            .await?;
        let result = frame.response_text();

        if result.contains("+OK") {
            tracing::info!(b_leg = %new_uuid, "originate answered");
            Ok(new_uuid)
        } else {
            let cause = result
                .trim()
                .strip_prefix("-ERR")
                .map(|c| c.trim().to_owned())
                .filter(|c| !c.is_empty());
            tracing::warn!(result = %result.trim(), "originate failed");
            Err(EslError::OriginateFailed { cause })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal scripted ESL server: authenticates, then answers each api
    /// command with a canned response and pushes one event.
    async fn spawn_mock_esl(responses: Vec<&'static str>) -> (String, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"Content-Type: auth/request\n\n")
                .await
                .unwrap();

            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("auth"));
            socket
                .write_all(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
                .await
                .unwrap();

            for response in responses {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                socket.write_all(response.as_bytes()).await.unwrap();
            }
            // Hold the socket open so the reader task stays alive.
            let _ = socket.read(&mut buf).await;
        });
        ("127.0.0.1".to_owned(), port)
    }

    #[tokio::test]
    async fn connects_and_authenticates() {
        let (host, port) = spawn_mock_esl(vec![]).await;
        let client = EslClient::new(host, port, "ClueCon");
        client.connect().await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn execute_api_returns_body() {
        let (host, port) = spawn_mock_esl(vec![
            "Content-Type: api/response\nContent-Length: 4\n\n+OK\n",
        ])
        .await;
        let client = EslClient::new(host, port, "ClueCon");
        client.connect().await.unwrap();

        let result = client.execute_api("uuid_exists abc").await.unwrap();
        assert!(result.contains("+OK"));
    }

    #[tokio::test]
    async fn uuid_helpers_interpret_replies() {
        let (host, port) = spawn_mock_esl(vec![
            "Content-Type: api/response\nContent-Length: 3\n\n+OK",
            "Content-Type: api/response\nContent-Length: 4\n\ntrue",
            "Content-Type: api/response\nContent-Length: 14\n\n-ERR not found",
        ])
        .await;
        let client = EslClient::new(host, port, "ClueCon");
        client.connect().await.unwrap();

        assert!(client.uuid_kill("abc", "NORMAL_CLEARING").await);
        assert!(client.uuid_exists("abc").await);
        assert!(client.uuid_getvar("abc", "foo").await.is_none());
    }

    #[tokio::test]
    async fn originate_failure_carries_cause() {
        let (host, port) = spawn_mock_esl(vec![
            "Content-Type: api/response\nContent-Length: 14\n\n-ERR USER_BUSY",
        ])
        .await;
        let client = EslClient::new(host, port, "ClueCon");
        client.connect().await.unwrap();

        let err = client
            .originate("user/2000@default", "&park()", 30, &[])
            .await
            .unwrap_err();
        match err {
            EslError::OriginateFailed { cause } => {
                assert_eq!(cause.as_deref(), Some("USER_BUSY"));
            }
            other => panic!("expected OriginateFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_reach_waiters() {
        let (host, port) = spawn_mock_esl(vec![
            "Content-Type: command/reply\nReply-Text: +OK event listener enabled\n\n",
        ])
        .await;
        let client = Arc::new(EslClient::new(host, port, "ClueCon"));
        client.connect().await.unwrap();
        client
            .subscribe_events(&["CHANNEL_ANSWER"], None)
            .await
            .unwrap();

        // Start the waiter first so its broadcast subscription exists
        // before the event is injected.
        let waiter_client = Arc::clone(&client);
        let waiter = tokio::spawn(async move {
            waiter_client
                .wait_for_event(&["CHANNEL_ANSWER"], Some("b-leg-1"), Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = EslEvent::from_plain_body(
            "Event-Name: CHANNEL_ANSWER\nUnique-ID: b-leg-1\nAnswer-State: up\n",
        )
        .unwrap();
        let _ = client.shared.events.send(event);

        let event = waiter.await.unwrap().expect("event should arrive");
        assert_eq!(event.name, "CHANNEL_ANSWER");
        assert_eq!(event.uuid.as_deref(), Some("b-leg-1"));
    }
}
