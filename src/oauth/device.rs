//! OAuth 2.0 device-code flow (RFC 8628), for browser-less deployments.
//!
//! The user gets a short code to type at a verification URL on some other
//! device; we poll the token endpoint until the grant lands, slows us down,
//! or dies.

use super::{OAuthError, TokenPayload};
use crate::store::TokenRecord;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// What one poll of the token endpoint told us to do.
#[derive(Debug, PartialEq, Eq)]
enum PollVerdict {
    /// Keep polling at the current interval.
    Pending,
    /// Double the interval, then keep polling.
    SlowDown,
    /// Terminal failure.
    Fatal(OAuthError),
}

fn classify_device_error(error: &DeviceTokenError) -> PollVerdict {
    match error.error.as_str() {
        "authorization_pending" => PollVerdict::Pending,
        "slow_down" => PollVerdict::SlowDown,
        "expired_token" => PollVerdict::Fatal(OAuthError::Expired(
            "device code expired before the user approved".to_string(),
        )),
        "access_denied" => PollVerdict::Fatal(OAuthError::Denied(
            error
                .error_description
                .clone()
                .unwrap_or_else(|| "user denied the request".to_string()),
        )),
        other => PollVerdict::Fatal(OAuthError::TokenExchange(format!(
            "device token poll failed: {other}"
        ))),
    }
}

/// Run the whole flow: request a device code, tell the user, poll to
/// completion.
pub async fn device_code_flow(
    http: &reqwest::Client,
    device_endpoint: &str,
    token_endpoint: &str,
    client_id: &str,
    scopes: &[String],
) -> Result<TokenRecord, OAuthError> {
    let scope = scopes.join(" ");
    let mut form = vec![("client_id", client_id.to_string())];
    if !scope.is_empty() {
        form.push(("scope", scope));
    }

    let response = http
        .post(device_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| OAuthError::TokenExchange(format!("device authorization failed: {e}")))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenExchange(format!(
            "device authorization rejected with {status}: {body}"
        )));
    }
    let authorization: DeviceAuthorization = response
        .json()
        .await
        .map_err(|e| OAuthError::TokenExchange(format!("device authorization unparseable: {e}")))?;

    // Notification channels beyond the log (tray, webhook) hang off the
    // event stream; the log line is the floor.
    info!(
        user_code = %authorization.user_code,
        verification_uri = %authorization.verification_uri,
        "device authorization pending: enter the code at the verification URL"
    );

    let deadline = Instant::now() + Duration::from_secs(authorization.expires_in);
    let mut interval = Duration::from_secs(authorization.interval.unwrap_or(5).max(1));

    loop {
        if Instant::now() >= deadline {
            return Err(OAuthError::Expired(
                "device code expired before the user approved".to_string(),
            ));
        }
        tokio::time::sleep(interval).await;

        let response = http
            .post(token_endpoint)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", &authorization.device_code),
                ("client_id", client_id),
            ])
            .send()
            .await
            .map_err(|e| OAuthError::TokenExchange(format!("device token poll failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let payload: TokenPayload = response.json().await.map_err(|e| {
                OAuthError::TokenExchange(format!("device token response unparseable: {e}"))
            })?;
            return Ok(payload.into_record());
        }

        if status == reqwest::StatusCode::BAD_REQUEST {
            let error: DeviceTokenError = response.json().await.map_err(|e| {
                OAuthError::TokenExchange(format!("device token error unparseable: {e}"))
            })?;
            match classify_device_error(&error) {
                PollVerdict::Pending => {
                    debug!("device authorization still pending");
                }
                PollVerdict::SlowDown => {
                    interval *= 2;
                    debug!(interval_secs = interval.as_secs(), "server asked to slow down");
                }
                PollVerdict::Fatal(err) => return Err(err),
            }
            continue;
        }

        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenExchange(format!(
            "device token poll rejected with {status}: {body}"
        )));
    }
}
