//! Event Socket wire format: frames and parsed channel events.
//!
//! ESL speaks header blocks terminated by a blank line, with an optional
//! body sized by `Content-Length`. Event payloads (`text/event-plain`)
//! carry their own header block inside the body, with URL-encoded values.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

use super::client::EslError;

/// One raw protocol frame: the outer header block plus optional body.
#[derive(Debug, Clone, Default)]
pub struct EslFrame {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl EslFrame {
    pub fn content_type(&self) -> &str {
        self.headers
            .get("Content-Type")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn reply_text(&self) -> &str {
        self.headers
            .get("Reply-Text")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn is_reply_ok(&self) -> bool {
        self.reply_text().starts_with("+OK")
    }

    /// Body for api responses, reply text otherwise.
    pub fn response_text(&self) -> String {
        match &self.body {
            Some(body) if !body.is_empty() => body.clone(),
            _ => self.reply_text().to_owned(),
        }
    }

    pub fn is_event(&self) -> bool {
        self.content_type() == "text/event-plain"
    }

    pub fn is_command_reply(&self) -> bool {
        matches!(self.content_type(), "command/reply" | "api/response")
    }

    pub fn is_disconnect_notice(&self) -> bool {
        self.content_type() == "text/disconnect-notice"
    }

    pub fn is_auth_request(&self) -> bool {
        self.content_type() == "auth/request"
    }
}

/// Read one frame from a buffered stream. Returns `Ok(None)` on a clean
/// EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut BufReader<R>) -> Result<Option<EslFrame>, EslError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut headers = HashMap::new();
    let mut line = String::new();
    let mut saw_any = false;

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| EslError::Io(e.to_string()))?;
        if n == 0 {
            if saw_any {
                return Err(EslError::Io("connection closed mid-frame".into()));
            }
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if headers.is_empty() {
                // Blank separators between frames.
                continue;
            }
            break;
        }
        saw_any = true;
        if let Some((key, value)) = trimmed.split_once(':') {
            headers.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }

    let mut body = None;
    if let Some(length) = headers
        .get("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > 0 {
            let mut buf = vec![0u8; length];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(|e| EslError::Io(e.to_string()))?;
            body = Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }

    Ok(Some(EslFrame { headers, body }))
}

/// A parsed FreeSWITCH channel event.
#[derive(Debug, Clone)]
pub struct EslEvent {
    pub name: String,
    pub uuid: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl EslEvent {
    /// Decode a `text/event-plain` frame body. Event header values are
    /// URL-encoded; an inner `Content-Length` marks a trailing event body.
    pub fn from_plain_body(raw: &str) -> Option<Self> {
        let mut headers = HashMap::new();
        let mut body = None;
        let mut lines = raw.lines();

        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                let decoded = urlencoding::decode(value.trim())
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.trim().to_owned());
                headers.insert(key.trim().to_owned(), decoded);
            }
        }

        if headers
            .get("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            .is_some()
        {
            let rest: Vec<&str> = lines.collect();
            if !rest.is_empty() {
                body = Some(rest.join("\n"));
            }
        }

        let name = headers.get("Event-Name")?.clone();
        let uuid = headers.get("Unique-ID").cloned();
        Some(Self {
            name,
            uuid,
            headers,
            body,
        })
    }

    pub fn from_frame(frame: &EslFrame) -> Option<Self> {
        if !frame.is_event() {
            return None;
        }
        Self::from_plain_body(frame.body.as_deref()?)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn hangup_cause(&self) -> Option<&str> {
        self.header("Hangup-Cause")
    }

    pub fn channel_state(&self) -> Option<&str> {
        self.header("Channel-State")
    }

    pub fn caller_id_number(&self) -> Option<&str> {
        self.header("Caller-Caller-ID-Number")
    }

    pub fn dtmf_digit(&self) -> Option<&str> {
        self.header("DTMF-Digit")
    }
}

/// Channel variables handed over on an outbound ESL connect. The dialplan
/// sets them under several historical spellings; all are accepted.
#[derive(Debug, Clone, Default)]
pub struct ChannelVars {
    pub call_id: Option<String>,
    pub caller_id: Option<String>,
    pub domain_id: Option<String>,
    pub secretary_id: Option<String>,
    pub remote_media_ip: Option<String>,
    pub remote_media_port: Option<String>,
    pub local_media_ip: Option<String>,
    pub local_media_port: Option<String>,
}

impl ChannelVars {
    /// Try `name`, `NAME`, `variable_name`, `variable_NAME`, plus any
    /// extra aliases verbatim.
    fn lookup(headers: &HashMap<String, String>, name: &str, aliases: &[&str]) -> Option<String> {
        let candidates = [
            name.to_owned(),
            name.to_uppercase(),
            format!("variable_{name}"),
            format!("variable_{}", name.to_uppercase()),
        ];
        for key in candidates.iter().map(String::as_str).chain(aliases.iter().copied()) {
            if let Some(value) = headers.get(key) {
                if !value.is_empty() {
                    return Some(value.clone());
                }
            }
        }
        None
    }

    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        Self {
            call_id: Self::lookup(headers, "Unique-ID", &["Channel-Unique-ID"]),
            caller_id: Self::lookup(headers, "Caller-Caller-ID-Number", &[]),
            domain_id: Self::lookup(
                headers,
                "domain_uuid",
                &[
                    "variable_VOICE_AI_DOMAIN_UUID",
                    "variable_voiceai_domain_uuid",
                ],
            ),
            secretary_id: Self::lookup(
                headers,
                "secretary_uuid",
                &[
                    "variable_VOICE_AI_SECRETARY_UUID",
                    "variable_voiceai_secretary_uuid",
                ],
            ),
            remote_media_ip: Self::lookup(headers, "remote_media_ip", &[]),
            remote_media_port: Self::lookup(headers, "remote_media_port", &[]),
            local_media_ip: Self::lookup(headers, "local_media_ip", &[]),
            local_media_port: Self::lookup(headers, "local_media_port", &[]),
        }
    }
}

/// Render originate channel variables as `{k=v,k2=v2}`.
pub fn format_originate_vars(vars: &[(String, String)]) -> String {
    if vars.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = vars.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", joined.join(","))
}
