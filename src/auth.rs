//! Exchange of SDK credentials for a streaming token.
use std::{
    collections::BTreeSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use reqwest::Url;
use serde::Deserialize;

use crate::{error::AuthError, token::StreamingToken, Error, Result};

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// `true` if the auth service answered with a usable payload.
    pub success: bool,
    /// `false` when the server turned streaming off for this SDK key.
    pub push_enabled: bool,
    /// Classification of the failure, if any.
    pub error: Option<AuthError>,
    /// Parsed token, present only when streaming is enabled.
    pub token: Option<StreamingToken>,
    /// Wait requested by the server before connecting.
    pub connection_delay: Duration,
    /// Status of the auth response, if one was received.
    pub http_status: Option<u16>,
}

impl AuthResult {
    /// Successful authentication with streaming allowed.
    pub fn enabled(token: StreamingToken) -> AuthResult {
        AuthResult {
            success: true,
            push_enabled: true,
            error: None,
            connection_delay: token.connection_delay,
            token: Some(token),
            http_status: Some(200),
        }
    }

    /// Successful authentication, but the server-side kill switch is on.
    pub fn disabled() -> AuthResult {
        AuthResult {
            success: true,
            push_enabled: false,
            error: None,
            token: None,
            connection_delay: Duration::ZERO,
            http_status: Some(200),
        }
    }

    /// Failed authentication.
    pub fn failed(recoverable: bool, http_status: Option<u16>) -> AuthResult {
        AuthResult {
            success: false,
            push_enabled: false,
            error: Some(AuthError {
                recoverable,
                http_status,
            }),
            token: None,
            connection_delay: Duration::ZERO,
            http_status,
        }
    }

    /// `true` if the caller may retry after a backoff.
    pub fn is_recoverable(&self) -> bool {
        self.error.map_or(false, |error| error.recoverable)
    }
}

/// Exchanges credentials for a [`StreamingToken`] scoped to the given subscriber keys.
pub trait Authenticator: Send + Sync {
    /// Blocking call. Never panics, every failure is classified in the result.
    fn authenticate(&self, keys: &BTreeSet<String>) -> AuthResult;
}

/// Subscriber keys to include in every authentication request.
///
/// Registering or removing a key does not re-authenticate by itself, the new set is picked up by
/// the next authentication.
#[derive(Debug, Clone, Default)]
pub struct SubscriberKeys {
    keys: Arc<RwLock<BTreeSet<String>>>,
}

impl SubscriberKeys {
    /// Create an empty key set.
    pub fn new() -> SubscriberKeys {
        SubscriberKeys::default()
    }

    /// Returns `false` if the key was already registered.
    pub fn register(&self, key: &str) -> bool {
        self.keys
            .write()
            .map(|mut keys| keys.insert(key.to_owned()))
            .unwrap_or(false)
    }

    /// Returns `false` if the key was not registered.
    pub fn unregister(&self, key: &str) -> bool {
        self.keys
            .write()
            .map(|mut keys| keys.remove(key))
            .unwrap_or(false)
    }

    /// Copy of the keys currently registered.
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.keys.read().map(|keys| keys.clone()).unwrap_or_default()
    }
}

/// Configuration for [`HttpAuthenticator`].
pub struct HttpAuthenticatorConfig {
    /// Base URL of the auth service.
    pub auth_url: String,
    /// SDK key sent as bearer credentials.
    pub api_key: String,
}

const AUTH_ENDPOINT: &str = "/auth";
const SPEC_VERSION: &str = "1.1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    push_enabled: bool,
    token: Option<String>,
    conn_delay: Option<u64>,
}

/// [`Authenticator`] backed by the auth service.
pub struct HttpAuthenticator {
    client: reqwest::blocking::Client,
    config: HttpAuthenticatorConfig,
}

impl HttpAuthenticator {
    /// Create an authenticator for `config`.
    pub fn new(config: HttpAuthenticatorConfig) -> HttpAuthenticator {
        HttpAuthenticator {
            client: reqwest::blocking::Client::new(),
            config,
        }
    }

    fn url(&self, keys: &BTreeSet<String>) -> Result<Url> {
        let params = std::iter::once(("s", SPEC_VERSION))
            .chain(keys.iter().map(|key| ("users", key.as_str())));
        Url::parse_with_params(&format!("{}{}", self.config.auth_url, AUTH_ENDPOINT), params)
            .map_err(Error::InvalidBaseUrl)
    }
}

impl Authenticator for HttpAuthenticator {
    fn authenticate(&self, keys: &BTreeSet<String>) -> AuthResult {
        let url = match self.url(keys) {
            Ok(url) => url,
            Err(err) => {
                log::error!(target: "flagsync", "cannot build auth url: {err}");
                return AuthResult::failed(false, None);
            }
        };

        log::debug!(target: "flagsync", subscribers = keys.len(); "authenticating for streaming");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()
            .and_then(|response| {
                let status = response.status().as_u16();
                response.text().map(|body| (status, body))
            });

        match response {
            Ok((status, body)) => interpret_response(status, &body),
            Err(err) => {
                log::warn!(target: "flagsync", "streaming auth request failed: {:?}", Error::from(err));
                AuthResult::failed(true, None)
            }
        }
    }
}

/// Classify an auth service response.
fn interpret_response(status: u16, body: &str) -> AuthResult {
    match status {
        200..=299 => {}
        400..=499 => {
            log::error!(target: "flagsync", status; "streaming auth rejected, streaming disabled for this session");
            return AuthResult::failed(false, Some(status));
        }
        _ => {
            log::warn!(target: "flagsync", status; "streaming auth failed with a server error");
            return AuthResult::failed(true, Some(status));
        }
    }

    let response: AuthResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(err) => {
            log::warn!(target: "flagsync", "unexpected streaming auth response: {err}");
            return AuthResult::failed(true, Some(status));
        }
    };

    if !response.push_enabled {
        log::info!(target: "flagsync", "streaming is disabled for this SDK key");
        return AuthResult::disabled();
    }

    let connection_delay = Duration::from_secs(response.conn_delay.unwrap_or(0));
    let token = response
        .token
        .ok_or(Error::InvalidToken("missing token"))
        .and_then(|raw| StreamingToken::parse(&raw, connection_delay));
    match token {
        Ok(token) => AuthResult::enabled(token),
        Err(err) => {
            log::warn!(target: "flagsync", "unusable streaming token: {err}");
            AuthResult::failed(true, Some(status))
        }
    }
}
