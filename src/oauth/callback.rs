//! Ephemeral loopback listener for the authorization-code redirect.
//!
//! RFC 8252 loopback pattern: bind `127.0.0.1:0`, hand the resulting
//! `http://127.0.0.1:<port>/oauth/callback` to the authorization server,
//! and wait for the browser to bounce back with `code` and `state`.

use super::OAuthError;
use axum::{extract::Query, response::Html, routing::get, Router};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Raw query parameters from the redirect.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A successfully parsed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCallback {
    pub code: String,
    pub state: String,
}

/// Turn the raw query into a callback or a terminal flow error.
fn interpret(query: CallbackQuery) -> Result<AuthCallback, OAuthError> {
    if let Some(error) = query.error {
        let detail = query
            .error_description
            .map(|d| format!("{error}: {d}"))
            .unwrap_or(error);
        return Err(OAuthError::Denied(detail));
    }
    match (query.code, query.state) {
        (Some(code), Some(state)) => Ok(AuthCallback { code, state }),
        _ => Err(OAuthError::Callback(
            "callback missing code or state".to_string(),
        )),
    }
}

/// Running loopback server for one flow.
pub struct CallbackServer {
    redirect_uri: String,
    rx: Option<oneshot::Receiver<CallbackQuery>>,
    task: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Bind an ephemeral port on the loopback interface and start serving.
    pub async fn bind() -> Result<Self, OAuthError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| OAuthError::Callback(format!("failed to bind loopback: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| OAuthError::Callback(format!("no local addr: {e}")))?;
        let redirect_uri = format!("http://{addr}/oauth/callback");

        let (tx, rx) = oneshot::channel::<CallbackQuery>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let app = Router::new().route(
            "/oauth/callback",
            get(move |Query(query): Query<CallbackQuery>| {
                let tx = tx.clone();
                async move {
                    if let Some(sender) = tx
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .take()
                    {
                        let _ = sender.send(query);
                    }
                    Html("Authorization complete. You may close this window.")
                }
            }),
        );

        debug!(%redirect_uri, "oauth callback listener bound");
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::warn!("oauth callback server error: {err}");
            }
        });

        Ok(Self {
            redirect_uri,
            rx: Some(rx),
            task,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Wait for the browser redirect, bounded by user-inaction `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<AuthCallback, OAuthError> {
        let rx = self.rx.take().expect("rx taken only once");
        let result = tokio::time::timeout(timeout, rx).await;
        self.task.abort();
        match result {
            Err(_) => Err(OAuthError::Timeout),
            Ok(Err(_)) => Err(OAuthError::Callback("callback channel closed".to_string())),
            Ok(Ok(query)) => interpret(query),
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
