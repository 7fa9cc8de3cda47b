//! S3-compatible recording uploads.
//!
//! Call recordings and transcripts land in the shared object store under
//! deterministic paths (`company_{id}/voice/{YYYY}/{MM}/{DD}/{call}.ext`)
//! with call/company/timestamp metadata, and the returned public URL goes
//! into the handoff ticket. Requests are signed with AWS Signature V4.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StorageSettings;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub url: String,
    pub object_name: String,
    pub size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("object storage not configured")]
    NotConfigured,
    #[error("nothing to upload")]
    EmptyBody,
    #[error("upload request failed: {0}")]
    Request(String),
    #[error("object store answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Extension for a content type, mirroring what the ticketing side
/// expects to find at the end of the object name.
fn extension_for(content_type: &str) -> &'static str {
    if content_type.contains("wav") {
        "wav"
    } else if content_type.contains("ogg") {
        "ogg"
    } else if content_type.contains("webm") {
        "webm"
    } else if content_type.contains("text") {
        "txt"
    } else {
        "mp3"
    }
}

/// Deterministic object path for a call recording.
pub fn recording_object_name(
    company_id: i64,
    call_id: &str,
    content_type: &str,
    when: DateTime<Utc>,
) -> String {
    format!(
        "company_{company_id}/voice/{}/{call_id}.{}",
        when.format("%Y/%m/%d"),
        extension_for(content_type)
    )
}

/// Deterministic object path for a transcript.
pub fn transcript_object_name(company_id: i64, call_id: &str, when: DateTime<Utc>) -> String {
    format!(
        "company_{company_id}/transcripts/{}/{call_id}.txt",
        when.format("%Y/%m/%d")
    )
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// AWS SigV4 pieces, kept separate so signing stays testable.
pub(crate) struct SigV4 {
    pub canonical_request: String,
    pub string_to_sign: String,
    pub authorization: String,
    pub amz_date: String,
    pub payload_hash: String,
}

pub(crate) fn sign_put(
    settings: &StorageSettings,
    object_name: &str,
    body: &[u8],
    content_type: &str,
    extra_headers: &[(String, String)],
    when: DateTime<Utc>,
) -> Option<SigV4> {
    let access_key = settings.access_key.as_deref()?;
    let secret_key = settings.secret_key.as_deref()?;

    let amz_date = when.format("%Y%m%dT%H%M%SZ").to_string();
    let date = when.format("%Y%m%d").to_string();
    let payload_hash = hex::encode(Sha256::digest(body));

    let canonical_uri = format!(
        "/{}/{}",
        settings.bucket,
        object_name
            .split('/')
            .map(|part| urlencoding::encode(part).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    );

    // Headers must be sorted by lowercase name.
    let mut headers: Vec<(String, String)> = vec![
        ("content-type".into(), content_type.to_owned()),
        ("host".into(), settings.endpoint.clone()),
        ("x-amz-content-sha256".into(), payload_hash.clone()),
        ("x-amz-date".into(), amz_date.clone()),
    ];
    for (key, value) in extra_headers {
        headers.push((key.to_lowercase(), value.clone()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "PUT\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let scope = format!("{date}/{}/s3/aws4_request", settings.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, settings.region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{scope},SignedHeaders={signed_headers},Signature={signature}"
    );

    Some(SigV4 {
        canonical_request,
        string_to_sign,
        authorization,
        amz_date,
        payload_hash,
    })
}

/// Process-wide uploader; internally concurrent via the shared client.
pub struct RecordingUploader {
    settings: StorageSettings,
    http: reqwest::Client,
}

impl RecordingUploader {
    pub fn new(settings: StorageSettings) -> Self {
        if !settings.is_configured() {
            tracing::warn!("object storage credentials missing, uploads disabled");
        }
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.settings.is_configured()
    }

    pub fn public_url(&self, object_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.settings.public_url.trim_end_matches('/'),
            self.settings.bucket,
            object_name
        )
    }

    async fn put_object(
        &self,
        object_name: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<UploadResult, UploadError> {
        if !self.is_available() {
            return Err(UploadError::NotConfigured);
        }
        if body.is_empty() {
            return Err(UploadError::EmptyBody);
        }

        let now = Utc::now();
        let meta_headers: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{k}"), v.clone()))
            .collect();

        let signed = sign_put(
            &self.settings,
            object_name,
            &body,
            content_type,
            &meta_headers,
            now,
        )
        .ok_or(UploadError::NotConfigured)?;

        let scheme = if self.settings.use_ssl { "https" } else { "http" };
        let url = format!(
            "{scheme}://{}/{}/{}",
            self.settings.endpoint, self.settings.bucket, object_name
        );

        let size = body.len();
        let mut request = self
            .http
            .put(&url)
            .header("Content-Type", content_type)
            .header("Host", self.settings.endpoint.as_str())
            .header("x-amz-date", signed.amz_date.as_str())
            .header("x-amz-content-sha256", signed.payload_hash.as_str())
            .header("Authorization", signed.authorization.as_str())
            .body(body);
        for (key, value) in &meta_headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let url = self.public_url(object_name);
        tracing::info!(object = object_name, size, url = %url, "upload complete");
        Ok(UploadResult {
            url,
            object_name: object_name.to_owned(),
            size,
        })
    }

    /// Upload a call recording under the deterministic voice path.
    pub async fn upload_recording(
        &self,
        audio: Vec<u8>,
        call_id: &str,
        company_id: i64,
        content_type: &str,
        metadata: &[(String, String)],
    ) -> Result<UploadResult, UploadError> {
        let object_name = recording_object_name(company_id, call_id, content_type, Utc::now());
        let mut all_meta = vec![
            ("call-uuid".to_owned(), call_id.to_owned()),
            ("company-id".to_owned(), company_id.to_string()),
            ("uploaded-at".to_owned(), Utc::now().to_rfc3339()),
        ];
        all_meta.extend_from_slice(metadata);
        self.put_object(&object_name, audio, content_type, &all_meta)
            .await
    }

    /// Upload a plain-text transcript alongside the recording tree.
    pub async fn upload_transcript(
        &self,
        transcript: String,
        call_id: &str,
        company_id: i64,
    ) -> Result<UploadResult, UploadError> {
        let object_name = transcript_object_name(company_id, call_id, Utc::now());
        let metadata = vec![
            ("call-uuid".to_owned(), call_id.to_owned()),
            ("company-id".to_owned(), company_id.to_string()),
        ];
        self.put_object(
            &object_name,
            transcript.into_bytes(),
            "text/plain; charset=utf-8",
            &metadata,
        )
        .await
    }
}
