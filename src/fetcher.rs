//! An HTTP client that fetches full rule and membership snapshots from the server.
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::{
    storage::{RulesDelta, SubscriberSegments},
    Error, Result,
};

/// Both membership domains of one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships {
    /// Regular segments.
    pub segments: SubscriberSegments,
    /// Large segments.
    pub large_segments: SubscriberSegments,
}

/// Source of full snapshots, used by polling and by notification-triggered refetches.
pub trait Fetcher: Send + Sync {
    /// Fetch rule changes after `since`. `till` asks the server to bypass caches until that
    /// version is served.
    fn fetch_rules_since(&self, since: i64, till: Option<i64>) -> Result<RulesDelta>;

    /// Fetch memberships of one subscriber.
    fn fetch_subscriber_segments(&self, key: &str) -> Result<Memberships>;
}

/// Configuration for [`HttpFetcher`].
pub struct HttpFetcherConfig {
    /// Base URL of the SDK API.
    pub sdk_url: String,
    /// SDK key sent as bearer credentials.
    pub api_key: String,
}

const RULES_ENDPOINT: &str = "/splitChanges";
const MEMBERSHIPS_ENDPOINT: &str = "/memberships";
const SPEC_VERSION: &str = "1.1";

#[derive(Debug, Deserialize)]
struct MembershipsResponse {
    #[serde(default)]
    ms: SegmentList,
    #[serde(default)]
    ls: SegmentList,
}

#[derive(Debug, Default, Deserialize)]
struct SegmentList {
    #[serde(default)]
    k: Vec<SegmentName>,
    cn: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SegmentName {
    n: String,
}

impl From<SegmentList> for SubscriberSegments {
    fn from(value: SegmentList) -> Self {
        SubscriberSegments::new(value.k.into_iter().map(|it| it.n), value.cn)
    }
}

/// [`Fetcher`] talking to the SDK API over blocking HTTP.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    config: HttpFetcherConfig,
    /// A 401 means the API key is not valid. Cached so we don't issue additional requests.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    /// Create a fetcher for `config`.
    pub fn new(config: HttpFetcherConfig) -> HttpFetcher {
        HttpFetcher {
            client: reqwest::blocking::Client::new(),
            config,
            unauthorized: AtomicBool::new(false),
        }
    }

    fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()?;

        match response.status() {
            status if status.is_success() => Ok(response.json()?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "flagsync", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Err(Error::Unauthorized)
            }
            status => {
                log::warn!(target: "flagsync", status = status.as_u16(); "received non-200 response while fetching");
                Err(Error::HttpStatus(status.as_u16()))
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_rules_since(&self, since: i64, till: Option<i64>) -> Result<RulesDelta> {
        let since = since.to_string();
        let till = till.map(|till| till.to_string());
        let mut params = vec![("s", SPEC_VERSION), ("since", since.as_str())];
        if let Some(till) = &till {
            params.push(("till", till.as_str()));
        }

        let url = Url::parse_with_params(
            &format!("{}{}", self.config.sdk_url, RULES_ENDPOINT),
            &params,
        )
        .map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "flagsync", since = since.as_str(); "fetching rule changes");
        let delta: RulesDelta = self.get(url)?;
        log::debug!(target: "flagsync", till = delta.till, rules = delta.rules.len(); "fetched rule changes");
        Ok(delta)
    }

    fn fetch_subscriber_segments(&self, key: &str) -> Result<Memberships> {
        let mut url = Url::parse(&format!("{}{}", self.config.sdk_url, MEMBERSHIPS_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .push(key);

        log::debug!(target: "flagsync", "fetching subscriber memberships");
        let response: MembershipsResponse = self.get(url)?;
        Ok(Memberships {
            segments: response.ms.into(),
            large_segments: response.ls.into(),
        })
    }
}
