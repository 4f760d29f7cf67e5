use std::{sync::Arc, time::Duration};

use crate::{
    auth::{HttpAuthenticator, HttpAuthenticatorConfig},
    backoff::BackoffConfig,
    codec::ErrorCodeRanges,
    events::{NoopSyncListener, SyncListener},
    fetcher::{HttpFetcher, HttpFetcherConfig},
    scheduler::ThreadScheduler,
    storage::{Cache, InMemoryCache},
    synchronizer::{SyncDependencies, SyncOrchestrator, SyncSettings},
    telemetry::{NoopTelemetry, TelemetrySink},
    transport::{HttpStreamingTransport, HttpStreamingTransportConfig},
    Result,
};

/// Configuration for [`SyncOrchestrator`].
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) sdk_url: String,
    pub(crate) auth_url: String,
    pub(crate) streaming_url: String,
    pub(crate) settings: SyncSettings,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) listener: Arc<dyn SyncListener + Send + Sync>,
}

impl ClientConfig {
    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagsync::ClientConfig;
    /// ClientConfig::from_api_key("sdk-key");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            sdk_url: ClientConfig::DEFAULT_SDK_URL.to_owned(),
            auth_url: ClientConfig::DEFAULT_AUTH_URL.to_owned(),
            streaming_url: ClientConfig::DEFAULT_STREAMING_URL.to_owned(),
            settings: SyncSettings::default(),
            cache: Arc::new(InMemoryCache::new()),
            telemetry: Arc::new(NoopTelemetry),
            listener: Arc::new(NoopSyncListener),
        }
    }

    /// Default base URL for full-sync fetches.
    pub const DEFAULT_SDK_URL: &'static str = "https://sdk.split.io/api";
    /// Default base URL of the streaming auth service.
    pub const DEFAULT_AUTH_URL: &'static str = "https://auth.split.io/api/v2";
    /// Default streaming endpoint.
    pub const DEFAULT_STREAMING_URL: &'static str = "https://streaming.split.io/sse";

    /// Override base URL for full-sync fetches. Clients should use the default setting in most
    /// cases.
    pub fn sdk_url(&mut self, sdk_url: impl Into<String>) -> &mut Self {
        self.sdk_url = sdk_url.into();
        self
    }

    /// Override base URL of the streaming auth service.
    pub fn auth_url(&mut self, auth_url: impl Into<String>) -> &mut Self {
        self.auth_url = auth_url.into();
        self
    }

    /// Override the streaming endpoint.
    pub fn streaming_url(&mut self, streaming_url: impl Into<String>) -> &mut Self {
        self.streaming_url = streaming_url.into();
        self
    }

    /// Enable or disable streaming. With streaming disabled the cache is kept fresh by polling
    /// only.
    pub fn streaming_enabled(&mut self, streaming_enabled: bool) -> &mut Self {
        self.settings.streaming_enabled = streaming_enabled;
        self
    }

    /// Interval of the rules fallback poller.
    pub fn rules_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.rules_polling.interval = interval;
        self
    }

    /// Interval of the subscriber segments fallback poller.
    pub fn segments_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.settings.segments_polling.interval = interval;
        self
    }

    /// Random jitter added to every poll.
    pub fn poll_jitter(&mut self, jitter: Duration) -> &mut Self {
        self.settings.rules_polling.jitter = jitter;
        self.settings.segments_polling.jitter = jitter;
        self
    }

    /// Backoff between streaming authentication attempts.
    pub fn auth_backoff(&mut self, backoff: BackoffConfig) -> &mut Self {
        self.settings.connection.auth_backoff = backoff;
        self
    }

    /// Backoff between streaming reconnections.
    pub fn connection_backoff(&mut self, backoff: BackoffConfig) -> &mut Self {
        self.settings.connection.connection_backoff = backoff;
        self
    }

    /// Authentication retries before streaming is given up for the session.
    pub fn max_auth_retries(&mut self, retries: u32) -> &mut Self {
        self.settings.connection.max_auth_retries = retries;
        self
    }

    /// Silence after which the streaming link is considered dead.
    pub fn keep_alive_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.settings.connection.keep_alive_timeout = timeout;
        self
    }

    /// How long before token expiration the streaming token is renewed.
    pub fn token_refresh_margin(&mut self, margin: Duration) -> &mut Self {
        self.settings.connection.token_refresh_margin = margin;
        self
    }

    /// How long the streaming link survives after [`SyncOrchestrator::pause`].
    pub fn background_disconnect_grace(&mut self, grace: Duration) -> &mut Self {
        self.settings.connection.background_disconnect_grace = grace;
        self
    }

    /// Background time after which [`SyncOrchestrator::resume`] issues a catch-up fetch.
    pub fn resume_fetch_threshold(&mut self, threshold: Duration) -> &mut Self {
        self.settings.resume_fetch_threshold = threshold;
        self
    }

    /// Retries of a failed full-sync fetch, and the delay between them.
    pub fn sync_retries(&mut self, attempts: u32, backoff: BackoffConfig) -> &mut Self {
        self.settings.sync_retry_attempts = attempts;
        self.settings.sync_retry_backoff = backoff;
        self
    }

    /// Override how streaming protocol error codes are classified.
    pub fn error_code_ranges(&mut self, ranges: ErrorCodeRanges) -> &mut Self {
        self.settings.connection.error_code_ranges = ranges;
        self
    }

    /// Use `cache` instead of the default in-memory cache.
    pub fn cache(&mut self, cache: Arc<dyn Cache>) -> &mut Self {
        self.cache = cache;
        self
    }

    /// Report streaming and sync telemetry to `telemetry`.
    pub fn telemetry(&mut self, telemetry: Arc<dyn TelemetrySink>) -> &mut Self {
        self.telemetry = telemetry;
        self
    }

    /// Set a listener to be notified of mode changes and cache updates.
    ///
    /// ```
    /// # use flagsync::ClientConfig;
    /// let config = ClientConfig::from_api_key("sdk-key").listener(|event| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn listener(&mut self, listener: impl SyncListener + Send + Sync + 'static) -> &mut Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Create a new [`SyncOrchestrator`] talking to the configured endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler thread or the HTTP clients cannot be started.
    ///
    /// ```no_run
    /// # use flagsync::ClientConfig;
    /// let sync = ClientConfig::from_api_key("sdk-key").to_synchronizer()?;
    /// sync.start();
    /// # Ok::<(), flagsync::Error>(())
    /// ```
    pub fn to_synchronizer(&self) -> Result<SyncOrchestrator> {
        let scheduler = Arc::new(ThreadScheduler::start()?);
        let fetcher = HttpFetcher::new(HttpFetcherConfig {
            sdk_url: self.sdk_url.clone(),
            api_key: self.api_key.clone(),
        });
        let authenticator = HttpAuthenticator::new(HttpAuthenticatorConfig {
            auth_url: self.auth_url.clone(),
            api_key: self.api_key.clone(),
        });
        let transport = HttpStreamingTransport::new(
            HttpStreamingTransportConfig {
                streaming_url: self.streaming_url.clone(),
                read_timeout: self.settings.connection.keep_alive_timeout,
            },
            scheduler.clone(),
        )?;

        Ok(SyncOrchestrator::new(
            self.settings.clone(),
            SyncDependencies {
                scheduler,
                cache: Arc::clone(&self.cache),
                fetcher: Arc::new(fetcher),
                authenticator: Arc::new(authenticator),
                transport: Arc::new(transport),
                telemetry: Arc::clone(&self.telemetry),
                listener: Arc::clone(&self.listener),
            },
        ))
    }
}
