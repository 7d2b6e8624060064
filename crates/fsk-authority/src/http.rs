//! HTTPS transport to the authority endpoint.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET  /v1/health`: probe; any 2xx is healthy.
//! - `POST /v1/receipts`: submit; 2xx returns a [`SubmitAck`], 409 means
//!   the receipt is already on file and is treated as success.
//!
//! Authentication: HTTP basic auth (`user_id`, `pin`) plus the
//! `X-Participant-Id` and `X-Device-Id` headers. The PIN is never logged.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{AuthorityCredentials, AuthorityError, AuthorityTransport, SignedReceipt, SubmitAck};

#[derive(Debug, Clone)]
pub struct HttpAuthority {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthorityError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AuthorityError::Config(format!(
                "authority base_url must be http(s): {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthorityError::Config(format!("http client build failed: {e}")))?;
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, rb: reqwest::RequestBuilder, creds: &AuthorityCredentials) -> reqwest::RequestBuilder {
        rb.basic_auth(&creds.user_id, Some(creds.pin.expose()))
            .header("X-Participant-Id", &creds.participant_id)
            .header("X-Device-Id", &creds.device_id)
    }
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    receipt_id: Uuid,
    order_id: &'a str,
    participant_id: &'a str,
    signature: &'a str,
    signed_by: &'a crate::SigningIdentity,
    signed_at: chrono::DateTime<chrono::Utc>,
    payload: &'a fsk_schemas::Receipt,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

fn transport_err(e: reqwest::Error) -> AuthorityError {
    AuthorityError::Transport(e.to_string())
}

async fn api_error(resp: reqwest::Response) -> AuthorityError {
    let code = resp.status().as_u16();
    let message = resp
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| "no message".to_string());
    AuthorityError::Api {
        code: Some(code),
        message,
    }
}

#[async_trait::async_trait]
impl AuthorityTransport for HttpAuthority {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn probe(&self, creds: &AuthorityCredentials) -> Result<(), AuthorityError> {
        let resp = self
            .authed(self.http.get(self.url("/v1/health")), creds)
            .send()
            .await
            .map_err(transport_err)?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(api_error(resp).await)
        }
    }

    async fn submit(
        &self,
        creds: &AuthorityCredentials,
        receipt: &SignedReceipt,
    ) -> Result<SubmitAck, AuthorityError> {
        let body = SubmitBody {
            receipt_id: receipt.receipt.receipt_id,
            order_id: &receipt.receipt.order_id,
            participant_id: &creds.participant_id,
            signature: &receipt.signature,
            signed_by: &receipt.signed_by,
            signed_at: receipt.signed_at,
            payload: &receipt.receipt,
        };

        let resp = self
            .authed(self.http.post(self.url("/v1/receipts")), creds)
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            debug!(receipt_id = %body.receipt_id, "authority already holds receipt");
            return Ok(SubmitAck {
                receipt_id: body.receipt_id,
                authority_ref: String::new(),
                duplicate: true,
            });
        }
        if !status.is_success() {
            return Err(api_error(resp).await);
        }

        resp.json::<SubmitAck>()
            .await
            .map_err(|e| AuthorityError::Decode(format!("submit ack: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sign_receipt, SigningIdentity};
    use chrono::Utc;
    use fsk_schemas::{CompletedOrder, Receipt, SecretString, SigningDevice};
    use httpmock::prelude::*;
    use serde_json::json;

    fn creds() -> AuthorityCredentials {
        AuthorityCredentials {
            participant_id: "ATU12345678".to_string(),
            user_id: "kassa1".to_string(),
            pin: SecretString::new("4711"),
            device_id: "REG-01".to_string(),
        }
    }

    fn signed() -> SignedReceipt {
        let r = Receipt::from_order(&CompletedOrder {
            order_id: "ord-77".to_string(),
            table: Some("2".to_string()),
            lines: vec![],
            completed_at: Utc::now(),
        }).unwrap();
        sign_receipt(
            &r,
            SigningIdentity {
                device: SigningDevice::HardwareToken,
                reference: "REG-01".to_string(),
            },
            &SecretString::new("key"),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = HttpAuthority::new("ftp://x", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AuthorityError::Config(_)));
    }

    #[tokio::test]
    async fn probe_ok_sends_participant_header() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/health")
                    .header("X-Participant-Id", "ATU12345678");
                then.status(200);
            })
            .await;

        let t = HttpAuthority::new(server.base_url(), Duration::from_secs(2)).unwrap();
        t.probe(&creds()).await.unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn probe_maps_http_error_to_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/health");
                then.status(503).json_body(json!({"message": "maintenance"}));
            })
            .await;

        let t = HttpAuthority::new(server.base_url(), Duration::from_secs(2)).unwrap();
        let err = t.probe(&creds()).await.unwrap_err();
        assert_eq!(
            err,
            AuthorityError::Api {
                code: Some(503),
                message: "maintenance".to_string()
            }
        );
    }

    #[tokio::test]
    async fn submit_decodes_ack() {
        let s = signed();
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/receipts");
                then.status(201).json_body(json!({
                    "receipt_id": s.receipt.receipt_id,
                    "authority_ref": "AT-2026-000123"
                }));
            })
            .await;

        let t = HttpAuthority::new(server.base_url(), Duration::from_secs(2)).unwrap();
        let ack = t.submit(&creds(), &s).await.unwrap();
        assert_eq!(ack.authority_ref, "AT-2026-000123");
        assert!(!ack.duplicate);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn submit_conflict_is_duplicate_success() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/receipts");
                then.status(409);
            })
            .await;

        let t = HttpAuthority::new(server.base_url(), Duration::from_secs(2)).unwrap();
        let ack = t.submit(&creds(), &signed()).await.unwrap();
        assert!(ack.duplicate);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        // Port 9 (discard) on localhost is not served by anything in CI.
        let t = HttpAuthority::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = t.probe(&creds()).await.unwrap_err();
        assert!(matches!(err, AuthorityError::Transport(_)), "got {err:?}");
    }
}
