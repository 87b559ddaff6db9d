use async_trait::async_trait;
use mcstats_core::{clamp_name, PlayerId};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::{IdentityService, LookupError, ResolveError, ResolverConfig};

/// Lookup result for a non-200 response. Throttling and server errors are
/// transient; any other status means the service has no name to give.
pub fn status_error(status: StatusCode) -> LookupError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        LookupError::Transient(format!("http status {status}"))
    } else {
        LookupError::NotFound
    }
}

/// Timeouts and broken connections are transient; anything else is permanent.
pub fn request_error(err: reqwest::Error) -> LookupError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        LookupError::Transient(err.to_string())
    } else {
        LookupError::NotFound
    }
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    name: Option<String>,
}

/// Current name from a session-server profile body.
pub fn parse_profile_name(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ProfileBody>(body)
        .ok()
        .and_then(|profile| profile.name)
        .filter(|name| !name.is_empty())
        .map(|name| clamp_name(&name))
}

/// Names from a name-history body, oldest first.
pub fn parse_name_history(body: &[u8]) -> Vec<String> {
    serde_json::from_slice::<Vec<HistoryEntry>>(body)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| entry.name)
        .filter(|name| !name.is_empty())
        .map(|name| clamp_name(&name))
        .collect()
}

/// HTTP client for the public profile and name-history endpoints.
#[derive(Debug, Clone)]
pub struct MojangClient {
    client: reqwest::Client,
    profile_url: String,
    history_url: String,
}

impl MojangClient {
    pub fn new(config: &ResolverConfig) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.http_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(ResolveError::Client)?;
        Ok(Self {
            client,
            profile_url: config.profile_url.trim_end_matches('/').to_string(),
            history_url: config.history_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_body(&self, url: &str) -> Result<Vec<u8>, LookupError> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        debug!(url, status = status.as_u16(), "identity service response");
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound);
        }
        if status != StatusCode::OK {
            return Err(status_error(status));
        }
        let body = response.bytes().await.map_err(request_error)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl IdentityService for MojangClient {
    async fn resolve_current_name(&self, player: PlayerId) -> Result<String, LookupError> {
        let url = format!("{}/{}", self.profile_url, player.simple_hex());
        let body = self.get_body(&url).await?;
        parse_profile_name(&body).ok_or(LookupError::NotFound)
    }

    async fn fetch_name_history(&self, player: PlayerId) -> Result<Vec<String>, LookupError> {
        let url = format!("{}/{}/names", self.history_url, player.simple_hex());
        let body = self.get_body(&url).await?;
        Ok(parse_name_history(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_lookup_errors() {
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS),
            LookupError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY),
            LookupError::Transient(_)
        ));
        assert_eq!(status_error(StatusCode::BAD_REQUEST), LookupError::NotFound);
        assert_eq!(status_error(StatusCode::FORBIDDEN), LookupError::NotFound);
    }

    #[test]
    fn profile_body_yields_clamped_name() {
        let body = br#"{"id":"069a79f444e94726a5befca90e38aaf5","name":"Notch","properties":[]}"#;
        assert_eq!(parse_profile_name(body).as_deref(), Some("Notch"));
        assert_eq!(
            parse_profile_name(br#"{"name":"ABCDEFGHIJKLMNOPQRSTU"}"#).as_deref(),
            Some("ABCDEFGHIJKLMNOP")
        );
        assert_eq!(parse_profile_name(br#"{"name":""}"#), None);
        assert_eq!(parse_profile_name(b"<html>"), None);
    }

    #[test]
    fn history_body_keeps_order() {
        let body = br#"[{"name":"First"},{"name":"Second","changedToAt":1423059891000}]"#;
        assert_eq!(parse_name_history(body), vec!["First", "Second"]);
        assert!(parse_name_history(b"{}").is_empty());
    }

    #[test]
    fn client_builds_from_default_config() {
        let client = MojangClient::new(&ResolverConfig::default()).expect("client");
        assert_eq!(client.profile_url, crate::config::DEFAULT_PROFILE_URL);
    }
}
