//! Dynamic Client Registration (RFC 7591).
//!
//! Some authorization servers hand out client ids on demand; when a
//! registration endpoint is known we POST our metadata and adopt whatever
//! credentials come back. Loopback deployments register as `native`
//! applications with token endpoint auth `none`.

use super::{Deployment, OAuthError};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: &'a [String],
    grant_types: &'a [&'a str],
    response_types: &'a [&'a str],
    application_type: &'a str,
    token_endpoint_auth_method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Register with the authorization server; returns the issued credentials.
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    redirect_uris: &[String],
    scopes: &[String],
    deployment: Deployment,
) -> Result<RegisteredClient, OAuthError> {
    let application_type = match deployment {
        Deployment::Remote => "web",
        Deployment::Local | Deployment::Headless => "native",
    };
    let scope = if scopes.is_empty() {
        None
    } else {
        Some(scopes.join(" "))
    };

    let request = RegistrationRequest {
        client_name: "mcpherd",
        redirect_uris,
        grant_types: &["authorization_code", "refresh_token", "urn:ietf:params:oauth:grant-type:device_code"],
        response_types: &["code"],
        application_type,
        token_endpoint_auth_method: "none",
        scope,
    };

    let response = http
        .post(registration_endpoint)
        .json(&request)
        .send()
        .await
        .map_err(|e| OAuthError::Registration(format!("registration request failed: {e}")))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::Registration(format!(
            "registration rejected with {status}: {body}"
        )));
    }

    let registered: RegisteredClient = response
        .json()
        .await
        .map_err(|e| OAuthError::Registration(format!("registration response unparseable: {e}")))?;

    info!(client_id = %registered.client_id, "dynamic client registration succeeded");
    Ok(registered)
}
