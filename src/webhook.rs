//! HubSpot v3 webhook signature verification.
//!
//! Signed string: `METHOD + "https://" + host + path[?query] + payload + timestamp`,
//! HMAC-SHA256 with the shared secret, base64 encoded.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, request::Parts, Method},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    error::{AppError, Result},
    AppState,
};

pub const SIGNATURE_HEADER: &str = "x-hubspot-signature-v3";
pub const TIMESTAMP_HEADER: &str = "x-hubspot-request-timestamp";

/// Replay window for signed requests.
pub const MAX_ALLOWED_TIMESTAMP_MILLIS: i64 = 300_000;

const MAX_WEBHOOK_BODY_BYTES: usize = 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureRejection {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("missing host")]
    MissingHost,
    #[error("unparseable timestamp")]
    BadTimestamp,
    #[error("timestamp outside the replay window")]
    Stale,
    #[error("invalid signing key")]
    BadKey,
    #[error("signature mismatch")]
    Mismatch,
}

/// Everything the signature covers, captured from one inbound request.
#[derive(Debug, Clone)]
pub struct WebhookSignatureContext {
    pub method: String,
    pub host: Option<String>,
    pub path_and_query: String,
    pub raw_body: Bytes,
    pub timestamp: Option<String>,
    pub provided_signature: Option<String>,
}

impl WebhookSignatureContext {
    pub fn from_parts(parts: &Parts, raw_body: Bytes) -> Self {
        let header_value = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let host = header_value(header::HOST.as_str())
            .or_else(|| parts.uri.authority().map(|a| a.to_string()));

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        Self {
            method: parts.method.as_str().to_string(),
            host,
            path_and_query,
            raw_body,
            timestamp: header_value(TIMESTAMP_HEADER),
            provided_signature: header_value(SIGNATURE_HEADER),
        }
    }

    pub fn full_url(&self) -> Option<String> {
        self.host
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(|host| format!("https://{}{}", host, self.path_and_query))
    }
}

/// Re-serializes JSON compactly; anything that is not JSON is signed as sent.
pub fn normalize_payload(raw: &[u8]) -> String {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return String::new();
    }

    match serde_json::from_slice::<serde_json::Value>(raw) {
        Ok(value) => value.to_string(),
        Err(e) => {
            debug!("Payload is not JSON, signing raw bytes: {}", e);
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

pub fn string_to_sign(method: &str, full_url: &str, payload: &str, timestamp: &str) -> String {
    format!("{}{}{}{}", method, full_url, payload, timestamp)
}

pub fn compute_signature(secret: &str, data: &str) -> std::result::Result<String, SignatureRejection> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureRejection::BadKey)?;
    mac.update(data.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    max_age_millis: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            max_age_millis: MAX_ALLOWED_TIMESTAMP_MILLIS,
        }
    }

    pub fn verify(&self, ctx: &WebhookSignatureContext) -> bool {
        self.verify_at(ctx, Utc::now().timestamp_millis())
    }

    pub fn verify_at(&self, ctx: &WebhookSignatureContext, now_millis: i64) -> bool {
        match self.check(ctx, now_millis) {
            Ok(()) => true,
            Err(reason) => {
                warn!(
                    "Webhook signature rejected for {} {}: {}",
                    ctx.method, ctx.path_and_query, reason
                );
                false
            }
        }
    }

    pub fn check(
        &self,
        ctx: &WebhookSignatureContext,
        now_millis: i64,
    ) -> std::result::Result<(), SignatureRejection> {
        let provided = ctx
            .provided_signature
            .as_deref()
            .ok_or(SignatureRejection::MissingSignature)?;
        let timestamp = ctx
            .timestamp
            .as_deref()
            .ok_or(SignatureRejection::MissingTimestamp)?;

        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureRejection::BadTimestamp)?;
        let age = now_millis.saturating_sub(sent_at);
        if age > self.max_age_millis || age < -self.max_age_millis {
            return Err(SignatureRejection::Stale);
        }

        let full_url = ctx.full_url().ok_or(SignatureRejection::MissingHost)?;
        let payload = normalize_payload(&ctx.raw_body);
        let data = string_to_sign(&ctx.method, &full_url, &payload, timestamp);
        let computed = compute_signature(&self.secret, &data)?;

        if bool::from(computed.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(SignatureRejection::Mismatch)
        }
    }
}

/// Route middleware guarding webhook ingestion. Only POSTs are signed by the
/// provider; other methods pass through untouched.
pub async fn verify_hubspot_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    if *request.method() != Method::POST {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let raw_body = to_bytes(body, MAX_WEBHOOK_BODY_BYTES).await.map_err(|e| {
        warn!("Failed to buffer webhook body: {}", e);
        AppError::SignatureInvalid
    })?;

    let ctx = WebhookSignatureContext::from_parts(&parts, raw_body.clone());
    if !state.webhook_verifier.verify(&ctx) {
        return Err(AppError::SignatureInvalid);
    }

    debug!("Webhook signature verified");
    Ok(next.run(Request::from_parts(parts, Body::from(raw_body))).await)
}
