//! OAuth endpoint auto-discovery.
//!
//! Given an upstream base URL, walk the well-known metadata documents in
//! order and fill in whatever endpoints the static config left empty. If
//! discovery produced an authorization endpoint but no device endpoint, try
//! provider-specific patterns and then probe a few conventional paths.

use super::OAuthError;
use crate::config::OAuthConfig;
use serde::Deserialize;
use tracing::debug;

/// Endpoints after merging static config with discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub authorization: Option<String>,
    pub token: Option<String>,
    pub device: Option<String>,
    pub registration: Option<String>,
}

impl ResolvedEndpoints {
    pub fn from_config(config: &OAuthConfig) -> Self {
        Self {
            authorization: config.authorization_endpoint.clone(),
            token: config.token_endpoint.clone(),
            device: config.device_endpoint.clone(),
            registration: config.registration_endpoint.clone(),
        }
    }

    fn is_complete(&self) -> bool {
        self.authorization.is_some()
            && self.token.is_some()
            && self.device.is_some()
            && self.registration.is_some()
    }
}

/// Well-known paths, in the order the metadata spec family introduced them.
const WELL_KNOWN_PATHS: &[&str] = &[
    "/.well-known/oauth-protected-resource",
    "/.well-known/openid-configuration",
    "/.well-known/oauth-authorization-server",
];

/// Subset of RFC 8414 / OIDC discovery metadata we care about.
#[derive(Debug, Default, Deserialize)]
struct MetadataDoc {
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
    #[serde(default)]
    device_authorization_endpoint: Option<String>,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

/// Fill holes in `endpoints` from one metadata document. Earlier documents
/// win: a populated field is never overwritten.
fn merge_metadata(doc: &MetadataDoc, endpoints: &mut ResolvedEndpoints) {
    if endpoints.authorization.is_none() {
        endpoints.authorization = doc.authorization_endpoint.clone();
    }
    if endpoints.token.is_none() {
        endpoints.token = doc.token_endpoint.clone();
    }
    if endpoints.device.is_none() {
        endpoints.device = doc.device_authorization_endpoint.clone();
    }
    if endpoints.registration.is_none() {
        endpoints.registration = doc.registration_endpoint.clone();
    }
}

/// Device-code endpoints for providers that publish them out of band.
fn well_known_device_endpoint(authorization_endpoint: &str) -> Option<String> {
    let url = reqwest::Url::parse(authorization_endpoint).ok()?;
    let host = url.host_str()?;
    if host == "github.com" || host.ends_with(".github.com") {
        Some("https://github.com/login/device/code".to_string())
    } else if host.contains("google") {
        Some("https://oauth2.googleapis.com/device/code".to_string())
    } else if host.contains("microsoft") {
        Some("https://login.microsoftonline.com/common/oauth2/v2.0/devicecode".to_string())
    } else {
        None
    }
}

/// Conventional device-endpoint paths to probe with HEAD.
const DEVICE_PROBE_PATHS: &[&str] = &[
    "/device/code",
    "/oauth/device/code",
    "/oauth2/device/code",
    "/connect/deviceauthorization",
];

fn base_origin(url_str: &str) -> Option<String> {
    let url = reqwest::Url::parse(url_str).ok()?;
    let origin = url.origin();
    Some(origin.ascii_serialization())
}

/// Resolve endpoints for `base_url`, starting from the static config.
pub async fn discover(
    http: &reqwest::Client,
    base_url: &str,
    config: &OAuthConfig,
) -> Result<ResolvedEndpoints, OAuthError> {
    let mut endpoints = ResolvedEndpoints::from_config(config);
    if endpoints.is_complete() {
        return Ok(endpoints);
    }

    let origin = base_origin(base_url)
        .ok_or_else(|| OAuthError::Config(format!("cannot parse server url: {base_url}")))?;

    for path in WELL_KNOWN_PATHS {
        if endpoints.is_complete() {
            break;
        }
        let url = format!("{origin}{path}");
        match http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<MetadataDoc>().await {
                    Ok(doc) => {
                        debug!(%url, "discovery document fetched");
                        merge_metadata(&doc, &mut endpoints);
                    }
                    Err(err) => debug!(%url, "discovery document unparseable: {err}"),
                }
            }
            Ok(response) => debug!(%url, status = %response.status(), "discovery miss"),
            Err(err) => debug!(%url, "discovery fetch failed: {err}"),
        }
    }

    // Infer a device endpoint from the provider, then probe common paths.
    if endpoints.device.is_none() {
        if let Some(auth) = endpoints.authorization.clone() {
            endpoints.device = well_known_device_endpoint(&auth);
            if endpoints.device.is_none() {
                endpoints.device = probe_device_endpoint(http, &auth).await;
            }
        }
    }

    Ok(endpoints)
}

/// HEAD-probe conventional paths on the authorization server's origin.
/// 200 and 405 both count as existence (many servers reject HEAD).
async fn probe_device_endpoint(http: &reqwest::Client, authorization_endpoint: &str) -> Option<String> {
    let origin = base_origin(authorization_endpoint)?;
    for path in DEVICE_PROBE_PATHS {
        let url = format!("{origin}{path}");
        match http.head(&url).send().await {
            Ok(response)
                if response.status().is_success()
                    || response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED =>
            {
                debug!(%url, "device endpoint probe hit");
                return Some(url);
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_does_not_overwrite() {
        let mut endpoints = ResolvedEndpoints {
            token: Some("https://a/token".into()),
            ..Default::default()
        };
        let doc = MetadataDoc {
            authorization_endpoint: Some("https://a/authorize".into()),
            token_endpoint: Some("https://b/token".into()),
            device_authorization_endpoint: None,
            registration_endpoint: Some("https://a/register".into()),
        };
        merge_metadata(&doc, &mut endpoints);

        assert_eq!(endpoints.authorization.as_deref(), Some("https://a/authorize"));
        // The earlier value stands.
        assert_eq!(endpoints.token.as_deref(), Some("https://a/token"));
        assert_eq!(endpoints.registration.as_deref(), Some("https://a/register"));
        assert!(endpoints.device.is_none());
    }

    #[test]
    fn test_config_seeds_endpoints() {
        let config = OAuthConfig {
            authorization_endpoint: Some("https://c/auth".into()),
            token_endpoint: Some("https://c/token".into()),
            ..Default::default()
        };
        let endpoints = ResolvedEndpoints::from_config(&config);
        assert_eq!(endpoints.authorization.as_deref(), Some("https://c/auth"));
        assert!(!endpoints.is_complete());
    }

    #[test]
    fn test_provider_device_endpoints() {
        assert_eq!(
            well_known_device_endpoint("https://github.com/login/oauth/authorize").as_deref(),
            Some("https://github.com/login/device/code")
        );
        assert_eq!(
            well_known_device_endpoint("https://accounts.google.com/o/oauth2/v2/auth").as_deref(),
            Some("https://oauth2.googleapis.com/device/code")
        );
        assert_eq!(
            well_known_device_endpoint(
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
            )
            .as_deref(),
            Some("https://login.microsoftonline.com/common/oauth2/v2.0/devicecode")
        );
        assert!(well_known_device_endpoint("https://auth.example.com/authorize").is_none());
    }

    #[test]
    fn test_base_origin() {
        assert_eq!(
            base_origin("https://a.example.com/mcp/v1?x=1").as_deref(),
            Some("https://a.example.com")
        );
        assert_eq!(
            base_origin("http://127.0.0.1:8080/mcp").as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert!(base_origin("not a url").is_none());
    }
}
