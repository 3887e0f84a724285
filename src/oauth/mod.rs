//! OAuth 2.0 engine for upstreams that gate MCP behind authorization.
//!
//! One engine per server, stateless across flows: endpoints come from
//! static config topped up by discovery, client credentials from config or
//! dynamic registration, tokens go into the [`TokenStore`]. The heavy
//! protocol lifting (PKCE, CSRF state, code exchange, refresh grant) rides
//! the `oauth2` crate.

pub mod callback;
pub mod device;
pub mod discovery;
pub mod register;

use crate::config::{FlowType, OAuthConfig};
use crate::store::{now_ms, TokenRecord, TokenStore};
use discovery::ResolvedEndpoints;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge, RedirectUrl,
    RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Refresh when the token expires within this window.
pub const REFRESH_LEEWAY: Duration = Duration::from_secs(300);

/// How long we wait on the user before abandoning an interactive flow.
pub const FLOW_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    #[error("oauth configuration error: {0}")]
    Config(String),
    #[error("client registration failed: {0}")]
    Registration(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("authorization expired: {0}")]
    Expired(String),
    #[error("callback error: {0}")]
    Callback(String),
    #[error("state parameter mismatch")]
    StateMismatch,
    #[error("timed out waiting for authorization")]
    Timeout,
    #[error("token storage error: {0}")]
    Storage(String),
}

/// Where this daemon is running, for flow selection and DCR metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    /// Interactive session with a browser at hand.
    Local,
    /// Reachable at a configured public URL.
    Remote,
    /// Linux box with no display; browsers are someone else's problem.
    Headless,
}

/// Classify the running deployment. Cached per engine after first use.
pub fn classify_deployment() -> Deployment {
    if std::env::var("MCPHERD_PUBLIC_URL").is_ok() {
        return Deployment::Remote;
    }
    if cfg!(target_os = "linux")
        && std::env::var("DISPLAY").is_err()
        && std::env::var("WAYLAND_DISPLAY").is_err()
    {
        return Deployment::Headless;
    }
    Deployment::Local
}

/// The flow actually executed after resolving `FlowType::Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedFlow {
    AuthorizationCode,
    DeviceCode,
}

fn select_flow(flow_type: FlowType, deployment: Deployment) -> ResolvedFlow {
    match flow_type {
        FlowType::AuthorizationCode => ResolvedFlow::AuthorizationCode,
        FlowType::DeviceCode => ResolvedFlow::DeviceCode,
        FlowType::Auto => match deployment {
            Deployment::Local | Deployment::Remote => ResolvedFlow::AuthorizationCode,
            Deployment::Headless => ResolvedFlow::DeviceCode,
        },
    }
}

/// Wire shape of a token endpoint response, for the raw-HTTP paths.
#[derive(Debug, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenPayload {
    pub fn into_record(self) -> TokenRecord {
        let mut record = TokenRecord::new(self.access_token);
        record.token_type = self.token_type;
        record.refresh_token = self.refresh_token;
        record.expires_at = self
            .expires_in
            .map(|secs| now_ms() + (secs as i64) * 1000);
        record
    }
}

fn record_from_token_response(response: &oauth2::basic::BasicTokenResponse) -> TokenRecord {
    let mut record = TokenRecord::new(response.access_token().secret().clone());
    record.refresh_token = response.refresh_token().map(|t| t.secret().clone());
    record.expires_at = response
        .expires_in()
        .map(|d| now_ms() + d.as_millis() as i64);
    record
}

/// A refresh response often omits the refresh token; keep the old one.
fn merged_refresh(mut new: TokenRecord, previous: &TokenRecord) -> TokenRecord {
    if new.refresh_token.is_none() {
        new.refresh_token = previous.refresh_token.clone();
    }
    if new.display_name.is_none() {
        new.display_name = previous.display_name.clone();
    }
    new
}

/// OAuth driver for one upstream server.
pub struct OAuthEngine {
    server_name: String,
    server_url: String,
    config: OAuthConfig,
    store: Arc<TokenStore>,
    http: reqwest::Client,
    endpoints: tokio::sync::Mutex<Option<ResolvedEndpoints>>,
    deployment: OnceLock<Deployment>,
    /// Credentials issued by dynamic registration this process lifetime.
    registered: RwLock<Option<(String, Option<String>)>>,
}

impl OAuthEngine {
    pub fn new(
        server_name: impl Into<String>,
        server_url: impl Into<String>,
        config: Option<&OAuthConfig>,
        store: Arc<TokenStore>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            server_url: server_url.into(),
            config: config.cloned().unwrap_or_default(),
            store,
            // Discovery against a dead host should fail, not hang.
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            endpoints: tokio::sync::Mutex::new(None),
            deployment: OnceLock::new(),
            registered: RwLock::new(None),
        }
    }

    pub fn deployment(&self) -> Deployment {
        *self.deployment.get_or_init(classify_deployment)
    }

    async fn endpoints(&self) -> Result<ResolvedEndpoints, OAuthError> {
        let mut cached = self.endpoints.lock().await;
        if let Some(endpoints) = cached.as_ref() {
            return Ok(endpoints.clone());
        }
        let endpoints = discovery::discover(&self.http, &self.server_url, &self.config).await?;
        *cached = Some(endpoints.clone());
        Ok(endpoints)
    }

    fn cached_registration(&self) -> Option<(String, Option<String>)> {
        self.registered
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn remember_registration(&self, client_id: String, client_secret: Option<String>) {
        *self
            .registered
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some((client_id, client_secret));
    }

    /// Run the appropriate flow to completion, persist the token, and
    /// signal completion through the store.
    pub async fn authorize(&self) -> Result<TokenRecord, OAuthError> {
        let endpoints = self.endpoints().await?;
        let flow = select_flow(self.config.flow_type, self.deployment());
        info!(
            server = %self.server_name,
            flow = ?flow,
            "starting oauth authorization"
        );

        let record = match flow {
            ResolvedFlow::AuthorizationCode => self.authorization_code_flow(&endpoints).await?,
            ResolvedFlow::DeviceCode => self.device_code_flow(&endpoints).await?,
        };

        self.store
            .save(&self.server_name, &self.server_url, &record)
            .map_err(|e| OAuthError::Storage(e.to_string()))?;
        self.store
            .publish_completion(&self.server_name, now_ms())
            .map_err(|e| OAuthError::Storage(e.to_string()))?;
        info!(server = %self.server_name, "oauth authorization complete");
        Ok(record)
    }

    async fn authorization_code_flow(
        &self,
        endpoints: &ResolvedEndpoints,
    ) -> Result<TokenRecord, OAuthError> {
        let auth_endpoint = endpoints
            .authorization
            .clone()
            .ok_or_else(|| OAuthError::Config("no authorization endpoint".to_string()))?;
        let token_endpoint = endpoints
            .token
            .clone()
            .ok_or_else(|| OAuthError::Config("no token endpoint".to_string()))?;

        let server = callback::CallbackServer::bind().await?;
        let redirect_uri = server.redirect_uri().to_string();

        // Some authorization servers enforce exact-match redirect URIs, and
        // our loopback port is fresh every flow: locally, re-register with
        // this exact URI whenever registration is available.
        let (client_id, client_secret) = if endpoints.registration.is_some()
            && self.deployment() == Deployment::Local
        {
            let registered = register::register_client(
                &self.http,
                endpoints.registration.as_deref().unwrap_or_default(),
                std::slice::from_ref(&redirect_uri),
                &self.config.scopes,
                self.deployment(),
            )
            .await?;
            self.remember_registration(registered.client_id.clone(), registered.client_secret.clone());
            (registered.client_id, registered.client_secret)
        } else {
            self.client_credentials(endpoints, std::slice::from_ref(&redirect_uri))
                .await?
        };

        let mut client = BasicClient::new(ClientId::new(client_id))
            .set_auth_uri(
                AuthUrl::new(auth_endpoint)
                    .map_err(|e| OAuthError::Config(format!("invalid authorization endpoint: {e}")))?,
            )
            .set_token_uri(
                TokenUrl::new(token_endpoint)
                    .map_err(|e| OAuthError::Config(format!("invalid token endpoint: {e}")))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri)
                    .map_err(|e| OAuthError::Config(format!("invalid redirect uri: {e}")))?,
            );
        if let Some(secret) = client_secret.clone() {
            client = client.set_client_secret(ClientSecret::new(secret));
        }

        // PKCE is mandatory on this path: public clients have no secret,
        // and explicit opt-ins land here too.
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = client.authorize_url(|| CsrfToken::new_random_len(32));
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (auth_url, csrf_state) = request.set_pkce_challenge(pkce_challenge).url();

        info!(
            server = %self.server_name,
            "authorize by opening this URL in your browser: {auth_url}"
        );
        if webbrowser::open(auth_url.as_str()).is_err() {
            warn!("browser launch failed; copy the URL manually");
        }

        let auth_callback = server.wait(FLOW_TIMEOUT).await?;
        if auth_callback.state != *csrf_state.secret() {
            return Err(OAuthError::StateMismatch);
        }

        let token = client
            .exchange_code(AuthorizationCode::new(auth_callback.code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.http)
            .await
            .map_err(|e| OAuthError::TokenExchange(e.to_string()))?;

        Ok(record_from_token_response(&token))
    }

    async fn device_code_flow(
        &self,
        endpoints: &ResolvedEndpoints,
    ) -> Result<TokenRecord, OAuthError> {
        let device_endpoint = endpoints
            .device
            .clone()
            .ok_or_else(|| OAuthError::Config("no device authorization endpoint".to_string()))?;
        let token_endpoint = endpoints
            .token
            .clone()
            .ok_or_else(|| OAuthError::Config("no token endpoint".to_string()))?;

        let (client_id, _) = self
            .client_credentials(endpoints, &self.config.redirect_uris)
            .await?;

        device::device_code_flow(
            &self.http,
            &device_endpoint,
            &token_endpoint,
            &client_id,
            &self.config.scopes,
        )
        .await
    }

    /// Resolve client credentials: static config, then this process's
    /// registration, then fresh dynamic registration.
    async fn client_credentials(
        &self,
        endpoints: &ResolvedEndpoints,
        redirect_uris: &[String],
    ) -> Result<(String, Option<String>), OAuthError> {
        if let Some(client_id) = self.config.client_id.clone() {
            return Ok((client_id, self.config.client_secret.clone()));
        }
        if let Some(cached) = self.cached_registration() {
            return Ok(cached);
        }
        let registration_endpoint = endpoints.registration.clone().ok_or_else(|| {
            OAuthError::Config(
                "no client_id configured and the server offers no registration endpoint"
                    .to_string(),
            )
        })?;
        let registered = register::register_client(
            &self.http,
            &registration_endpoint,
            redirect_uris,
            &self.config.scopes,
            self.deployment(),
        )
        .await?;
        self.remember_registration(registered.client_id.clone(), registered.client_secret.clone());
        Ok((registered.client_id, registered.client_secret))
    }

    /// Refresh `record` if it is inside the leeway window and refreshable.
    ///
    /// Returns the replacement record after persisting it, or `None` when
    /// no refresh was needed. The caller must force any open transport
    /// closed afterwards so the next request carries fresh credentials.
    pub async fn refresh_if_needed(
        &self,
        record: &TokenRecord,
    ) -> Result<Option<TokenRecord>, OAuthError> {
        if !record.expires_within(REFRESH_LEEWAY) {
            return Ok(None);
        }
        let Some(refresh_token) = record.refresh_token.clone() else {
            return Ok(None);
        };

        let endpoints = self.endpoints().await?;
        let token_endpoint = endpoints
            .token
            .ok_or_else(|| OAuthError::Refresh("no token endpoint".to_string()))?;
        let (client_id, client_secret) = match self.config.client_id.clone() {
            Some(id) => (id, self.config.client_secret.clone()),
            None => self
                .cached_registration()
                .ok_or_else(|| OAuthError::Refresh("no client credentials for refresh".to_string()))?,
        };

        let mut client = BasicClient::new(ClientId::new(client_id)).set_token_uri(
            TokenUrl::new(token_endpoint)
                .map_err(|e| OAuthError::Config(format!("invalid token endpoint: {e}")))?,
        );
        if let Some(secret) = client_secret {
            client = client.set_client_secret(ClientSecret::new(secret));
        }

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(&self.http)
            .await
            .map_err(|e| OAuthError::Refresh(e.to_string()))?;

        let refreshed = merged_refresh(record_from_token_response(&token), record);
        self.store
            .save(&self.server_name, &self.server_url, &refreshed)
            .map_err(|e| OAuthError::Storage(e.to_string()))?;
        info!(server = %self.server_name, "access token refreshed");
        Ok(Some(refreshed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_flow_selection_matrix() {
        use Deployment::*;
        assert_eq!(
            select_flow(FlowType::AuthorizationCode, Headless),
            ResolvedFlow::AuthorizationCode
        );
        assert_eq!(
            select_flow(FlowType::DeviceCode, Local),
            ResolvedFlow::DeviceCode
        );
        assert_eq!(
            select_flow(FlowType::Auto, Local),
            ResolvedFlow::AuthorizationCode
        );
        assert_eq!(
            select_flow(FlowType::Auto, Remote),
            ResolvedFlow::AuthorizationCode
        );
        assert_eq!(
            select_flow(FlowType::Auto, Headless),
            ResolvedFlow::DeviceCode
        );
    }

    #[test]
    fn test_deployment_remote_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("MCPHERD_PUBLIC_URL", "https://proxy.example.com");
        assert_eq!(classify_deployment(), Deployment::Remote);
        std::env::remove_var("MCPHERD_PUBLIC_URL");
    }

    #[test]
    fn test_token_payload_into_record() {
        let payload: TokenPayload = serde_json::from_value(serde_json::json!({
            "access_token": "at",
            "token_type": "Bearer",
            "refresh_token": "rt",
            "expires_in": 3600
        }))
        .unwrap();
        let record = payload.into_record();
        assert_eq!(record.access_token, "at");
        assert_eq!(record.refresh_token.as_deref(), Some("rt"));

        let expires_at = record.expires_at.unwrap();
        let expected = now_ms() + 3_600_000;
        assert!((expires_at - expected).abs() < 5_000);
    }

    #[test]
    fn test_token_payload_defaults() {
        let payload: TokenPayload =
            serde_json::from_value(serde_json::json!({ "access_token": "at" })).unwrap();
        let record = payload.into_record();
        assert_eq!(record.token_type, "Bearer");
        assert!(record.refresh_token.is_none());
        assert!(record.expires_at.is_none());
    }

    #[test]
    fn test_merged_refresh_preserves_refresh_token() {
        let mut previous = TokenRecord::new("old-at");
        previous.refresh_token = Some("old-rt".to_string());
        previous.display_name = Some("Server".to_string());

        let new = TokenRecord::new("new-at");
        let merged = merged_refresh(new, &previous);
        assert_eq!(merged.access_token, "new-at");
        assert_eq!(merged.refresh_token.as_deref(), Some("old-rt"));
        assert_eq!(merged.display_name.as_deref(), Some("Server"));

        // A rotated refresh token is kept, not clobbered.
        let mut rotated = TokenRecord::new("new-at");
        rotated.refresh_token = Some("new-rt".to_string());
        let merged = merged_refresh(rotated, &previous);
        assert_eq!(merged.refresh_token.as_deref(), Some("new-rt"));
    }

    #[tokio::test]
    async fn test_refresh_not_needed_far_from_expiry() {
        let store = Arc::new(TokenStore::in_memory().unwrap());
        let engine = OAuthEngine::new("s1", "https://a", None, store);

        let mut record = TokenRecord::new("at");
        record.refresh_token = Some("rt".to_string());
        record.expires_at = Some(now_ms() + 3_600_000);

        let refreshed = engine.refresh_if_needed(&record).await.unwrap();
        assert!(refreshed.is_none());
    }

    #[tokio::test]
    async fn test_refresh_skipped_without_refresh_token() {
        let store = Arc::new(TokenStore::in_memory().unwrap());
        let engine = OAuthEngine::new("s1", "https://a", None, store);

        let mut record = TokenRecord::new("at");
        record.expires_at = Some(now_ms() + 1_000);

        let refreshed = engine.refresh_if_needed(&record).await.unwrap();
        assert!(refreshed.is_none());
    }
}
