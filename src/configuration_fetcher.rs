//! HTTP side of configuration synchronization: the transport seam and the redirect protocol.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use reqwest::{
    header::{ETAG, IF_NONE_MATCH, USER_AGENT},
    StatusCode, Url,
};

use crate::{cache::CONFIG_FILE_NAME, settings::RedirectMode, Configuration, Error, Result};

/// Maximum number of base URL hops a single fetch follows.
const MAX_REDIRECTS: usize = 3;

/// A single configuration download request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Full URL of the configuration file.
    pub url: Url,
    /// Entity tag of the configuration currently held, sent as `If-None-Match`.
    pub etag: Option<String>,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
}

/// What the server answered.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// `ETag` response header.
    pub etag: Option<String>,
    /// Response body. Empty for `304 Not Modified`.
    pub body: Vec<u8>,
}

/// Performs configuration downloads. [`HttpTransport`] is the default; tests and exotic
/// environments can plug in their own.
pub trait Transport: Send + Sync {
    /// Issue one `GET` request.
    fn get(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// [`Transport`] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<HttpTransport> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpTransport { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let mut builder = self
            .client
            .get(request.url.clone())
            .header(USER_AGENT, &request.user_agent);
        if let Some(etag) = &request.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }

        let response = builder.send()?;
        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes()?.to_vec();

        Ok(FetchResponse { status, etag, body })
    }
}

/// Result of a successful fetch.
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    Fetched(Configuration),
    NotModified,
}

pub(crate) struct ConfigurationFetcher {
    transport: Arc<dyn Transport>,
    sdk_key: String,
    user_agent: String,
    /// Base URL used by the next fetch. Updated by redirects.
    base_url: Mutex<String>,
    /// Set when the caller chose the base URL explicitly.
    url_overridden: bool,
}

impl ConfigurationFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        sdk_key: String,
        user_agent: String,
        base_url: String,
        url_overridden: bool,
    ) -> Result<ConfigurationFetcher> {
        // Fail early on a base URL that can never work.
        config_url(&base_url, &sdk_key)?;
        Ok(ConfigurationFetcher {
            transport,
            sdk_key,
            user_agent,
            base_url: Mutex::new(base_url),
            url_overridden,
        })
    }

    pub fn base_url(&self) -> String {
        match self.base_url.lock() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_base_url(&self, url: &str) {
        let mut base_url = match self.base_url.lock() {
            Ok(base_url) => base_url,
            Err(poisoned) => poisoned.into_inner(),
        };
        *base_url = url.to_owned();
    }

    /// Fetch the configuration, following redirect preferences.
    ///
    /// `previous` supplies the entity tag for a conditional request.
    pub fn fetch(&self, previous: &Configuration) -> Result<FetchOutcome> {
        let etag = (!previous.is_empty())
            .then(|| previous.etag().map(str::to_owned))
            .flatten();
        let mut base_url = self.base_url();

        for _ in 0..MAX_REDIRECTS {
            let configuration = match self.fetch_once(&base_url, etag.clone())? {
                FetchOutcome::Fetched(configuration) => configuration,
                FetchOutcome::NotModified => return Ok(FetchOutcome::NotModified),
            };

            let preferences = configuration.preferences();
            let Some(new_url) = preferences
                .base_url
                .as_deref()
                .filter(|url| !url.is_empty() && url.trim_end_matches('/') != base_url.trim_end_matches('/'))
            else {
                return Ok(FetchOutcome::Fetched(configuration));
            };

            match preferences.redirect {
                RedirectMode::NoRedirect => {
                    if !self.url_overridden {
                        log::debug!(target: "remote_flags", base_url = new_url; "switching base URL for next fetch");
                        self.set_base_url(new_url);
                    }
                    return Ok(FetchOutcome::Fetched(configuration));
                }
                RedirectMode::ShouldRedirect if self.url_overridden => {
                    log::warn!(target: "remote_flags",
                               base_url = new_url;
                               "the configuration asks to redirect, but a custom base URL is set; \
                                keeping the custom base URL. Check that the SDK key matches the data governance setting");
                    return Ok(FetchOutcome::Fetched(configuration));
                }
                RedirectMode::ShouldRedirect | RedirectMode::ForceRedirect => {
                    if preferences.redirect == RedirectMode::ShouldRedirect {
                        log::warn!(target: "remote_flags",
                                   base_url = new_url;
                                   "redirecting to another base URL. Check that the SDK key matches the data governance setting");
                    }
                    let new_url = new_url.to_owned();
                    config_url(&new_url, &self.sdk_key)?;
                    self.set_base_url(&new_url);
                    base_url = new_url;
                }
            }
        }

        log::error!(target: "remote_flags", "redirection loop detected while fetching configuration");
        Err(Error::RedirectLoopDetected)
    }

    fn fetch_once(&self, base_url: &str, etag: Option<String>) -> Result<FetchOutcome> {
        let request = FetchRequest {
            url: config_url(base_url, &self.sdk_key)?,
            etag,
            user_agent: self.user_agent.clone(),
        };
        log::debug!(target: "remote_flags", url:display = request.url; "fetching configuration");

        let response = self.transport.get(&request)?;
        match response.status {
            StatusCode::OK => {
                let body = String::from_utf8(response.body).map_err(|_| {
                    Error::InvalidConfiguration("configuration body is not UTF-8".into())
                })?;
                let configuration =
                    Configuration::parse(body, response.etag.as_deref(), Utc::now())?;
                log::debug!(target: "remote_flags", etag:debug = response.etag; "fetched configuration");
                Ok(FetchOutcome::Fetched(configuration))
            }
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "remote_flags", "configuration not modified");
                Ok(FetchOutcome::NotModified)
            }
            status @ (StatusCode::FORBIDDEN | StatusCode::NOT_FOUND) => {
                log::error!(target: "remote_flags",
                            status:display = status;
                            "configuration file not found. Check your SDK key");
                Err(Error::UnexpectedStatus(status))
            }
            status => {
                log::warn!(target: "remote_flags",
                           status:display = status;
                           "unexpected response while fetching configuration");
                Err(Error::UnexpectedStatus(status))
            }
        }
    }
}

/// `{base}/configuration-files/{sdk key}/config_v6.json`
fn config_url(base_url: &str, sdk_key: &str) -> Result<Url> {
    Url::parse(&format!(
        "{}/configuration-files/{}/{}",
        base_url.trim_end_matches('/'),
        sdk_key,
        CONFIG_FILE_NAME
    ))
    .map_err(Error::InvalidBaseUrl)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Serves canned responses by base URL host and records requests.
    #[derive(Default)]
    struct Scripted {
        responses: Vec<(&'static str, u16, String)>,
        requests: Mutex<Vec<FetchRequest>>,
    }

    impl Scripted {
        fn respond(mut self, host: &'static str, status: u16, body: impl Into<String>) -> Self {
            self.responses.push((host, status, body.into()));
            self
        }

        fn hosts(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.url.host_str().unwrap().to_owned())
                .collect()
        }
    }

    impl Transport for Scripted {
        fn get(&self, request: &FetchRequest) -> Result<FetchResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let host = request.url.host_str().unwrap_or_default();
            let (_, status, body) = self
                .responses
                .iter()
                .find(|(h, _, _)| *h == host)
                .expect("unexpected host");
            Ok(FetchResponse {
                status: StatusCode::from_u16(*status).unwrap(),
                etag: Some(format!("etag-{host}")),
                body: body.clone().into_bytes(),
            })
        }
    }

    fn redirecting_to(host: &str, mode: u8) -> String {
        format!(r#"{{"p": {{"u": "https://{host}", "r": {mode}}}, "f": {{}}}}"#)
    }

    fn fetcher(transport: Arc<Scripted>, base_url: &str, overridden: bool) -> ConfigurationFetcher {
        ConfigurationFetcher::new(
            transport,
            "sdk-key".to_owned(),
            "remote-flags/m-test".to_owned(),
            base_url.to_owned(),
            overridden,
        )
        .unwrap()
    }

    #[test]
    fn builds_request() {
        let transport = Arc::new(Scripted::default().respond("a.test", 200, r#"{"f": {}}"#));
        let fetcher = fetcher(transport.clone(), "https://a.test/", false);

        let previous = Configuration::parse(r#"{"f": {}}"#, Some("old"), Utc::now()).unwrap();
        let outcome = fetcher.fetch(&previous).unwrap();

        let FetchOutcome::Fetched(configuration) = outcome else {
            panic!("expected a configuration");
        };
        assert_eq!(configuration.etag(), Some("etag-a.test"));

        let requests = transport.requests.lock().unwrap();
        assert_eq!(
            requests[0].url.as_str(),
            "https://a.test/configuration-files/sdk-key/config_v6.json"
        );
        assert_eq!(requests[0].etag.as_deref(), Some("old"));
        assert_eq!(requests[0].user_agent, "remote-flags/m-test");
    }

    #[test]
    fn not_modified() {
        let transport = Arc::new(Scripted::default().respond("a.test", 304, ""));
        let fetcher = fetcher(transport, "https://a.test", false);
        assert!(matches!(
            fetcher.fetch(&Configuration::empty()),
            Ok(FetchOutcome::NotModified)
        ));
    }

    #[test]
    fn unexpected_status() {
        let transport = Arc::new(Scripted::default().respond("a.test", 404, ""));
        let fetcher = fetcher(transport, "https://a.test", false);
        assert!(matches!(
            fetcher.fetch(&Configuration::empty()),
            Err(Error::UnexpectedStatus(StatusCode::NOT_FOUND))
        ));
    }

    #[test]
    fn force_redirect_refetches() {
        let transport = Arc::new(
            Scripted::default()
                .respond("a.test", 200, redirecting_to("b.test", 2))
                .respond("b.test", 200, redirecting_to("b.test", 0)),
        );
        let fetcher = fetcher(transport.clone(), "https://a.test", true);

        assert!(matches!(
            fetcher.fetch(&Configuration::empty()),
            Ok(FetchOutcome::Fetched(_))
        ));
        assert_eq!(transport.hosts(), vec!["a.test", "b.test"]);
        assert_eq!(fetcher.base_url(), "https://b.test");
    }

    #[test]
    fn should_redirect_is_ignored_under_custom_url() {
        let transport =
            Arc::new(Scripted::default().respond("a.test", 200, redirecting_to("b.test", 1)));
        let fetcher = fetcher(transport.clone(), "https://a.test", true);

        assert!(matches!(
            fetcher.fetch(&Configuration::empty()),
            Ok(FetchOutcome::Fetched(_))
        ));
        assert_eq!(transport.hosts(), vec!["a.test"]);
        assert_eq!(fetcher.base_url(), "https://a.test");
    }

    #[test]
    fn should_redirect_is_followed_by_default() {
        let transport = Arc::new(
            Scripted::default()
                .respond("a.test", 200, redirecting_to("b.test", 1))
                .respond("b.test", 200, r#"{"f": {}}"#),
        );
        let fetcher = fetcher(transport.clone(), "https://a.test", false);

        fetcher.fetch(&Configuration::empty()).unwrap();
        assert_eq!(transport.hosts(), vec!["a.test", "b.test"]);
    }

    #[test]
    fn no_redirect_switches_url_for_next_fetch() {
        let transport = Arc::new(
            Scripted::default()
                .respond("a.test", 200, redirecting_to("b.test", 0))
                .respond("b.test", 200, redirecting_to("b.test", 0)),
        );
        let fetcher = fetcher(transport.clone(), "https://a.test", false);

        fetcher.fetch(&Configuration::empty()).unwrap();
        assert_eq!(transport.hosts(), vec!["a.test"]);
        fetcher.fetch(&Configuration::empty()).unwrap();
        assert_eq!(transport.hosts(), vec!["a.test", "b.test"]);
    }

    #[test]
    fn redirect_loop_is_detected() {
        let transport = Arc::new(
            Scripted::default()
                .respond("a.test", 200, redirecting_to("b.test", 2))
                .respond("b.test", 200, redirecting_to("a.test", 2)),
        );
        let fetcher = fetcher(transport.clone(), "https://a.test", false);

        assert!(matches!(
            fetcher.fetch(&Configuration::empty()),
            Err(Error::RedirectLoopDetected)
        ));
        assert_eq!(transport.hosts().len(), MAX_REDIRECTS);
    }

    #[test]
    fn rejects_invalid_base_url() {
        let transport = Arc::new(Scripted::default());
        assert!(matches!(
            ConfigurationFetcher::new(
                transport,
                "sdk-key".to_owned(),
                String::new(),
                "not a url".to_owned(),
                true,
            ),
            Err(Error::InvalidBaseUrl(_))
        ));
    }
}
