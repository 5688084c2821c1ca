//! HTTP Events API transport: signed `POST /slack/events` deliveries.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use super::slack_events::normalize_event_callback;
use super::SlackBridge;
use crate::slack_helpers::current_unix_timestamp;

pub const SLACK_EVENTS_PATH: &str = "/slack/events";

const HEADER_REQUEST_TIMESTAMP: &str = "x-slack-request-timestamp";
const HEADER_SIGNATURE: &str = "x-slack-signature";
const SIGNATURE_VERSION: &str = "v0";
const MAX_REQUEST_AGE_SECONDS: u64 = 60 * 5;

struct SlackEventsState {
    bridge: Arc<SlackBridge>,
    signing_secret: String,
}

/// Router serving the Events API endpoint. Requests must carry a valid
/// Slack signature made with `signing_secret`.
pub fn slack_events_router(bridge: Arc<SlackBridge>, signing_secret: String) -> Router {
    let state = Arc::new(SlackEventsState {
        bridge,
        signing_secret,
    });
    Router::new()
        .route(SLACK_EVENTS_PATH, post(handle_slack_events))
        .with_state(state)
}

async fn handle_slack_events(
    State(state): State<Arc<SlackEventsState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(error) = verify_slack_signature(
        &state.signing_secret,
        header_value(&headers, HEADER_REQUEST_TIMESTAMP),
        header_value(&headers, HEADER_SIGNATURE),
        &body,
        current_unix_timestamp(),
    ) {
        warn!(error = %error, "rejecting unsigned slack event delivery");
        return error_response(StatusCode::UNAUTHORIZED, "invalid_signature", &error);
    }

    let payload = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                &anyhow!("request body is not valid json: {error}"),
            );
        }
    };

    match payload.get("type").and_then(Value::as_str) {
        Some("url_verification") => {
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .unwrap_or_default();
            (StatusCode::OK, Json(json!({ "challenge": challenge }))).into_response()
        }
        Some("event_callback") => {
            match normalize_event_callback(&payload, state.bridge.bot_user_id()) {
                Ok(Some(event)) => {
                    state.bridge.dispatch(event);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "dropping malformed slack event");
                }
            }
            StatusCode::OK.into_response()
        }
        other => {
            debug!(
                callback_type = other.unwrap_or("missing"),
                "ignoring slack http delivery"
            );
            StatusCode::OK.into_response()
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn error_response(status: StatusCode, code: &str, error: &anyhow::Error) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": error.to_string(),
            }
        })),
    )
        .into_response()
}

/// Checks a `v0=<hex>` Slack request signature over `v0:{timestamp}:{body}`
/// and rejects timestamps more than five minutes away from `now_unix`.
pub fn verify_slack_signature(
    signing_secret: &str,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now_unix: u64,
) -> Result<()> {
    let timestamp = timestamp
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing {HEADER_REQUEST_TIMESTAMP} header"))?;
    let signature = signature
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("missing {HEADER_SIGNATURE} header"))?;

    let issued_at = timestamp
        .parse::<u64>()
        .with_context(|| format!("invalid request timestamp '{timestamp}'"))?;
    if now_unix.abs_diff(issued_at) > MAX_REQUEST_AGE_SECONDS {
        bail!("request timestamp is outside the allowed window");
    }

    let digest_hex = signature
        .strip_prefix("v0=")
        .ok_or_else(|| anyhow!("signature must use v0=<hex> format"))?;
    let signature_bytes = decode_hex(digest_hex)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes())
        .context("failed to initialize hmac verifier")?;
    mac.update(SIGNATURE_VERSION.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&signature_bytes)
        .map_err(|_| anyhow!("signature verification failed"))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("signature digest cannot be empty");
    }
    if !trimmed.is_ascii() || !trimmed.len().is_multiple_of(2) {
        bail!("signature digest must be an even number of hex characters");
    }
    trimmed
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let chunk = std::str::from_utf8(pair).context("signature digest is not utf-8")?;
            u8::from_str_radix(chunk, 16)
                .with_context(|| format!("invalid hex byte '{chunk}' in signature digest"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::ServiceExt;

    use super::{slack_events_router, verify_slack_signature, SLACK_EVENTS_PATH};
    use crate::slack_helpers::current_unix_timestamp;
    use crate::slack_runtime::message_listeners::PING_REPLY;
    use crate::slack_runtime::tests::test_bridge;

    const SECRET: &str = "signing-secret";

    fn sign(secret: &str, timestamp: &str, body: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac");
        mac.update(format!("v0:{timestamp}:{body}").as_bytes());
        let digest = mac.finalize().into_bytes();
        let hex = digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        format!("v0={hex}")
    }

    fn signed_request(body: &str) -> Request<Body> {
        let timestamp = current_unix_timestamp().to_string();
        Request::builder()
            .method("POST")
            .uri(SLACK_EVENTS_PATH)
            .header("content-type", "application/json")
            .header("x-slack-request-timestamp", &timestamp)
            .header("x-slack-signature", sign(SECRET, &timestamp, body))
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[test]
    fn unit_verify_slack_signature_accepts_valid_digest() {
        let body = br#"{"type":"event_callback"}"#;
        let signature = sign(SECRET, "1700000000", r#"{"type":"event_callback"}"#);
        verify_slack_signature(
            SECRET,
            Some("1700000000"),
            Some(&signature),
            body,
            1_700_000_100,
        )
        .expect("valid signature");
    }

    #[test]
    fn regression_verify_slack_signature_rejects_tampering_and_stale_requests() {
        let signature = sign(SECRET, "1700000000", "original");
        let tampered = verify_slack_signature(
            SECRET,
            Some("1700000000"),
            Some(&signature),
            b"tampered",
            1_700_000_000,
        )
        .expect_err("tampered body");
        assert!(tampered.to_string().contains("verification failed"));

        let stale = verify_slack_signature(
            SECRET,
            Some("1700000000"),
            Some(&signature),
            b"original",
            1_700_000_301,
        )
        .expect_err("stale request");
        assert!(stale.to_string().contains("outside the allowed window"));

        let missing = verify_slack_signature(SECRET, None, Some(&signature), b"original", 0)
            .expect_err("missing timestamp");
        assert!(missing.to_string().contains("x-slack-request-timestamp"));

        let malformed = verify_slack_signature(
            SECRET,
            Some("1700000000"),
            Some("v0=zz"),
            b"original",
            1_700_000_000,
        )
        .expect_err("malformed digest");
        assert!(malformed.to_string().contains("invalid hex byte"));

        let non_ascii = verify_slack_signature(
            SECRET,
            Some("1700000000"),
            Some("v0=éa"),
            b"original",
            1_700_000_000,
        )
        .expect_err("non-ascii digest");
        assert!(non_ascii.to_string().contains("hex characters"));
    }

    #[tokio::test]
    async fn functional_router_answers_url_verification_challenge() {
        let slack = MockServer::start_async().await;
        let app = slack_events_router(test_bridge(&slack).await, SECRET.to_string());

        let body = r#"{"type":"url_verification","challenge":"abc123"}"#;
        let response = app.oneshot(signed_request(body)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let parsed: Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(parsed, json!({"challenge": "abc123"}));
    }

    #[tokio::test]
    async fn regression_router_rejects_bad_signature_and_bad_json() {
        let slack = MockServer::start_async().await;
        let bridge = test_bridge(&slack).await;

        let unsigned = Request::builder()
            .method("POST")
            .uri(SLACK_EVENTS_PATH)
            .header("x-slack-request-timestamp", current_unix_timestamp().to_string())
            .header("x-slack-signature", "v0=00")
            .body(Body::from("{}"))
            .expect("request");
        let response = slack_events_router(bridge.clone(), SECRET.to_string())
            .oneshot(unsigned)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = slack_events_router(bridge, SECRET.to_string())
            .oneshot(signed_request("not json"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn integration_router_dispatches_event_callbacks() {
        let slack = MockServer::start_async().await;
        let reply = slack.mock(|when, then| {
            when.method(POST)
                .path("/chat.postMessage")
                .json_body_includes(json!({"channel": "C1", "text": PING_REPLY}).to_string());
            then.status(200)
                .json_body(json!({"ok": true, "channel": "C1", "ts": "2.0"}));
        });
        let app = slack_events_router(test_bridge(&slack).await, SECRET.to_string());

        let body = json!({
            "type": "event_callback",
            "event_id": "Ev9",
            "event": {"type": "message", "user": "U1", "channel": "C1", "text": "ping", "ts": "1.0"}
        })
        .to_string();
        let response = app.oneshot(signed_request(&body)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..100 {
            if reply.calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        reply.assert_calls(1);
    }
}
