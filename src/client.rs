use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    cache::cache_key,
    config::PollingMode,
    configuration_fetcher::{ConfigurationFetcher, HttpTransport, Transport},
    synchronizer::{older_than, Synchronizer, SynchronizerOptions},
    ClientConfig, Configuration, EvaluationContext, EvaluationDetails, FlagEvaluatedHook, Result,
    Snapshot, Value,
};

/// A client for evaluating remotely configured feature flags and settings.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```
/// # use remote_flags::{Client, ClientConfig, PollingMode};
/// let mut config = ClientConfig::from_sdk_key("sdk-key");
/// config.polling_mode(PollingMode::Manual);
/// let client = Client::new(config)?;
/// assert_eq!(client.get_value("flag", None), None);
/// # Ok::<(), remote_flags::Error>(())
/// ```
pub struct Client {
    synchronizer: Synchronizer,
    polling_mode: PollingMode,
    default_user: Option<Arc<dyn EvaluationContext>>,
    on_flag_evaluated: Option<FlagEvaluatedHook>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// In auto-poll mode this starts the background poller thread.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let user_agent = config.user_agent();
        let transport: Arc<dyn Transport> = match config.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.http_timeout)?),
        };
        let fetcher = ConfigurationFetcher::new(
            transport,
            config.sdk_key.clone(),
            user_agent,
            config.base_url,
            config.base_url_overridden,
        )?;

        let synchronizer = Synchronizer::new(SynchronizerOptions {
            fetcher,
            cache: config.cache,
            cache_key: cache_key(&config.sdk_key),
            offline: config.offline,
            on_config_changed: config.on_config_changed,
        });

        if let PollingMode::AutoPoll { interval, jitter } = config.polling_mode {
            log::debug!(target: "remote_flags", interval:debug = interval; "starting poller thread");
            synchronizer.start_polling(interval, jitter)?;
        }

        Ok(Client {
            synchronizer,
            polling_mode: config.polling_mode,
            default_user: config.default_user,
            on_flag_evaluated: config.on_flag_evaluated,
        })
    }

    /// Bind the current configuration to `user` (or the default user).
    ///
    /// Evaluations through one snapshot are consistent with each other even if the client
    /// refreshes in the meantime. In lazy-load mode a stale configuration is refreshed first.
    pub fn snapshot(&self, user: Option<Arc<dyn EvaluationContext>>) -> Snapshot {
        if let PollingMode::LazyLoad { ttl } = self.polling_mode {
            if let Err(err) = self.synchronizer.refresh_if_older(older_than(ttl), true) {
                log::warn!(target: "remote_flags", "failed to refresh stale configuration: {err}");
            }
        }

        let user = user.or_else(|| self.default_user.clone());
        Snapshot::new(self.synchronizer.configuration(), user)
            .with_hook(self.on_flag_evaluated.clone())
    }

    /// Current configuration generation.
    pub fn configuration(&self) -> Arc<Configuration> {
        self.synchronizer.configuration()
    }

    /// Get the value of `key` for `user`. `None` if the key does not exist.
    ///
    /// Evaluation problems never surface as errors here; they are logged and the best available
    /// value is returned. Use [`Client::get_value_details`] to inspect them.
    pub fn get_value(&self, key: &str, user: Option<Arc<dyn EvaluationContext>>) -> Option<Value> {
        self.snapshot(user).get_value(key)
    }

    /// Get the value of `key` for `user` together with an explanation of how it was chosen.
    pub fn get_value_details(
        &self,
        key: &str,
        user: Option<Arc<dyn EvaluationContext>>,
    ) -> EvaluationDetails {
        self.snapshot(user).get_value_details(key)
    }

    /// Evaluate every setting for `user`.
    pub fn get_all_values(&self, user: Option<Arc<dyn EvaluationContext>>) -> HashMap<String, Value> {
        self.snapshot(user).get_all_values()
    }

    /// Keys of all settings, sorted.
    pub fn get_all_keys(&self) -> Vec<String> {
        self.snapshot(None)
            .keys()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Find the setting key and value that `variation_id` stands for.
    pub fn get_key_and_value(&self, variation_id: &str) -> Option<(String, Value)> {
        let snapshot = self.snapshot(None);
        let (key, value) = snapshot.get_key_and_value(variation_id)?;
        Some((key.to_owned(), value.clone()))
    }

    /// Fetch the configuration now and wait for the outcome.
    pub fn refresh(&self) -> Result<()> {
        self.synchronizer.refresh()
    }

    /// Fetch the configuration now, waiting at most `timeout`.
    ///
    /// On [`Error::RefreshTimeout`](crate::Error::RefreshTimeout) the fetch keeps running in the
    /// background and still updates the configuration.
    pub fn refresh_with_timeout(&self, timeout: Duration) -> Result<()> {
        self.synchronizer.refresh_with_timeout(timeout)
    }

    /// Resume network access.
    pub fn set_online(&self) {
        self.synchronizer.set_online();
    }

    /// Stop network access. Refreshes only read the cache while offline.
    pub fn set_offline(&self) {
        self.synchronizer.set_offline();
    }

    /// Return `true` if the client is in offline mode.
    pub fn is_offline(&self) -> bool {
        self.synchronizer.is_offline()
    }

    /// Block until the first refresh finished (successfully or not) or `timeout` elapsed.
    /// Returns `false` on timeout.
    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        self.synchronizer.wait_for_ready(timeout)
    }

    /// Stop background polling and wait for outstanding refreshes to finish.
    ///
    /// Must not be called from a hook.
    pub fn close(&self) -> Result<()> {
        self.synchronizer.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use reqwest::StatusCode;

    use super::*;
    use crate::{
        configuration_fetcher::{FetchRequest, FetchResponse},
        User,
    };

    const BODY: &str = r#"{"f": {
        "flag": {"t": 0, "v": {"b": false}, "r": [
            {"c": [{"u": {"a": "Country", "c": 0, "l": ["US"]}}], "s": {"v": {"b": true}, "i": "on"}}
        ]}
    }}"#;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        user_agents: Mutex<Vec<String>>,
    }

    impl Transport for Counting {
        fn get(&self, request: &FetchRequest) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.user_agents
                .lock()
                .unwrap()
                .push(request.user_agent.clone());
            Ok(FetchResponse {
                status: StatusCode::OK,
                etag: None,
                body: BODY.as_bytes().to_vec(),
            })
        }
    }

    fn client(mode: PollingMode, transport: Arc<Counting>) -> Client {
        let mut config = ClientConfig::from_sdk_key("sdk-key");
        config.polling_mode(mode).transport(transport);
        Client::new(config).unwrap()
    }

    #[test]
    fn manual_mode_never_refreshes_implicitly() {
        let transport = Arc::new(Counting::default());
        let client = client(PollingMode::Manual, transport.clone());

        assert_eq!(client.get_value("flag", None), None);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        client.refresh().unwrap();
        assert_eq!(client.get_value("flag", None), Some(Value::Bool(false)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(transport.user_agents.lock().unwrap()[0].starts_with("remote-flags/m-"));
    }

    #[test]
    fn lazy_load_refreshes_when_stale() {
        let transport = Arc::new(Counting::default());
        let client = client(
            PollingMode::LazyLoad {
                ttl: Duration::from_secs(3600),
            },
            transport.clone(),
        );

        let us: Arc<dyn EvaluationContext> = Arc::new(User::new("u").with_country("US"));
        assert_eq!(client.get_value("flag", Some(us.clone())), Some(Value::Bool(true)));
        assert_eq!(client.get_value("flag", Some(us)), Some(Value::Bool(true)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auto_poll_fetches_in_background() {
        let transport = Arc::new(Counting::default());
        let client = client(PollingMode::default(), transport.clone());

        assert!(client.wait_for_ready(Duration::from_secs(5)));
        assert_eq!(client.get_all_keys(), vec!["flag".to_owned()]);
        assert!(transport.user_agents.lock().unwrap()[0].starts_with("remote-flags/a-"));
        client.close().unwrap();
    }

    #[test]
    fn default_user_is_used_without_context() {
        let transport = Arc::new(Counting::default());
        let mut config = ClientConfig::from_sdk_key("sdk-key");
        config
            .polling_mode(PollingMode::Manual)
            .transport(transport)
            .default_user(User::new("default").with_country("US"));
        let client = Client::new(config).unwrap();
        client.refresh().unwrap();

        assert_eq!(client.get_value("flag", None), Some(Value::Bool(true)));
        let de: Arc<dyn EvaluationContext> = Arc::new(User::new("u").with_country("DE"));
        assert_eq!(client.get_value("flag", Some(de)), Some(Value::Bool(false)));
        assert_eq!(
            client.get_key_and_value("on"),
            Some(("flag".to_owned(), Value::Bool(true)))
        );
    }
}
