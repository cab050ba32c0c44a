use std::{sync::Arc, time::Duration};

use crate::{
    cache::ConfigCache, configuration_fetcher::Transport, Client, ConfigChangedHook,
    EvaluationContext, EvaluationDetails, FlagEvaluatedHook, Result,
};

/// How the client keeps its configuration fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    /// Refresh in a background thread every `interval`, plus a random delay of up to `jitter`.
    AutoPoll {
        /// Time between refreshes.
        interval: Duration,
        /// Upper bound of the random delay added to every interval.
        jitter: Duration,
    },
    /// Refresh synchronously on evaluation once the configuration is older than `ttl`.
    LazyLoad {
        /// Maximum age of the configuration.
        ttl: Duration,
    },
    /// Refresh only when [`Client::refresh`] is called.
    Manual,
}

impl Default for PollingMode {
    fn default() -> Self {
        PollingMode::AutoPoll {
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(3),
        }
    }
}

impl PollingMode {
    /// Short identifier reported in the user agent.
    pub(crate) fn identifier(&self) -> &'static str {
        match self {
            PollingMode::AutoPoll { .. } => "a",
            PollingMode::LazyLoad { .. } => "l",
            PollingMode::Manual => "m",
        }
    }
}

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) base_url: String,
    pub(crate) base_url_overridden: bool,
    pub(crate) polling_mode: PollingMode,
    pub(crate) http_timeout: Duration,
    pub(crate) cache: Option<Arc<dyn ConfigCache>>,
    pub(crate) offline: bool,
    pub(crate) default_user: Option<Arc<dyn EvaluationContext>>,
    pub(crate) on_flag_evaluated: Option<FlagEvaluatedHook>,
    pub(crate) on_config_changed: Option<ConfigChangedHook>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
}

impl ClientConfig {
    /// Default base URL for configuration downloads.
    pub const DEFAULT_BASE_URL: &'static str = "https://cdn-global.configcat.com";

    /// Base URL that keeps configuration downloads within the EU.
    pub const EU_BASE_URL: &'static str = "https://cdn-eu.configcat.com";

    /// Default timeout of a single configuration download.
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use remote_flags::ClientConfig;
    /// ClientConfig::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            base_url_overridden: false,
            polling_mode: PollingMode::default(),
            http_timeout: ClientConfig::DEFAULT_HTTP_TIMEOUT,
            cache: None,
            offline: false,
            default_user: None,
            on_flag_evaluated: None,
            on_config_changed: None,
            transport: None,
        }
    }

    /// Override base URL for configuration downloads. Clients should use the default setting in
    /// most cases.
    ///
    /// An overridden base URL takes precedence over "should redirect" hints sent by the server.
    pub fn base_url(&mut self, base_url: impl Into<String>) -> &mut Self {
        self.base_url = base_url.into();
        self.base_url_overridden = true;
        self
    }

    /// Choose how the configuration is refreshed.
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use remote_flags::{ClientConfig, PollingMode};
    /// let mut config = ClientConfig::from_sdk_key("sdk-key");
    /// config.polling_mode(PollingMode::LazyLoad { ttl: Duration::from_secs(300) });
    /// ```
    pub fn polling_mode(&mut self, polling_mode: PollingMode) -> &mut Self {
        self.polling_mode = polling_mode;
        self
    }

    /// Timeout of a single configuration download.
    pub fn http_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.http_timeout = timeout;
        self
    }

    /// Persist fetched configurations, e.g. to survive restarts or share them between
    /// processes.
    pub fn cache(&mut self, cache: Arc<dyn ConfigCache>) -> &mut Self {
        self.cache = Some(cache);
        self
    }

    /// Start in offline mode: the network is not touched until [`Client::set_online`].
    pub fn offline(&mut self, offline: bool) -> &mut Self {
        self.offline = offline;
        self
    }

    /// Evaluation context used when an evaluation call does not supply one.
    pub fn default_user(&mut self, user: impl EvaluationContext + 'static) -> &mut Self {
        self.default_user = Some(Arc::new(user));
        self
    }

    /// Called with the details of every evaluation.
    ///
    /// ```
    /// # use remote_flags::ClientConfig;
    /// let mut config = ClientConfig::from_sdk_key("sdk-key");
    /// config.on_flag_evaluated(|details| {
    ///     println!("{} = {:?}", details.key, details.value);
    /// });
    /// ```
    pub fn on_flag_evaluated(
        &mut self,
        hook: impl Fn(&EvaluationDetails) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_flag_evaluated = Some(Arc::new(hook));
        self
    }

    /// Called after a refresh brought different configuration content.
    pub fn on_config_changed(
        &mut self,
        hook: impl Fn(&crate::Configuration) + Send + Sync + 'static,
    ) -> &mut Self {
        self.on_config_changed = Some(Arc::new(hook));
        self
    }

    /// Replace the HTTP transport.
    pub fn transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transport = Some(transport);
        self
    }

    /// Value of the `User-Agent` header.
    pub(crate) fn user_agent(&self) -> String {
        format!(
            "remote-flags/{}-{}",
            self.polling_mode.identifier(),
            env!("CARGO_PKG_VERSION")
        )
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use remote_flags::{ClientConfig, PollingMode};
    /// let client = ClientConfig::from_sdk_key("sdk-key")
    ///     .polling_mode(PollingMode::Manual)
    ///     .offline(true)
    ///     .to_client()?;
    /// # Ok::<(), remote_flags::Error>(())
    /// ```
    pub fn to_client(&mut self) -> Result<Client> {
        Client::new(std::mem::replace(self, ClientConfig::from_sdk_key("")))
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("base_url_overridden", &self.base_url_overridden)
            .field("polling_mode", &self.polling_mode)
            .field("http_timeout", &self.http_timeout)
            .field("offline", &self.offline)
            .field("default_user", &self.default_user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::from_sdk_key("key");
        assert_eq!(config.base_url, ClientConfig::DEFAULT_BASE_URL);
        assert!(!config.base_url_overridden);
        assert_eq!(config.polling_mode, PollingMode::default());
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(
            config.user_agent(),
            format!("remote-flags/a-{}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn base_url_marks_override() {
        let mut config = ClientConfig::from_sdk_key("key");
        config
            .base_url(ClientConfig::EU_BASE_URL)
            .polling_mode(PollingMode::Manual);
        assert!(config.base_url_overridden);
        assert!(config.user_agent().starts_with("remote-flags/m-"));
    }

    #[test]
    fn debug_hides_sdk_key() {
        let config = ClientConfig::from_sdk_key("secret-sdk-key");
        assert!(!format!("{config:?}").contains("secret-sdk-key"));
    }
}
