use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    settings::{CompiledConfig, ConfigDocument, Preferences},
    Result,
};

/// One compiled configuration generation together with the raw body it was built from.
///
/// A `Configuration` is immutable. Refreshing produces a new one which replaces the previous
/// generation atomically; evaluations that already hold the old one keep using it.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) compiled: Arc<CompiledConfig>,
    body: Arc<str>,
    etag: Option<Arc<str>>,
    fetch_time: DateTime<Utc>,
}

impl Configuration {
    /// Placeholder held before anything was fetched or loaded. Older than any real
    /// configuration.
    pub fn empty() -> Configuration {
        Configuration {
            compiled: Arc::default(),
            body: "".into(),
            etag: None,
            fetch_time: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Decode and compile a configuration body.
    ///
    /// ```
    /// # use remote_flags::Configuration;
    /// let config = Configuration::parse(
    ///     r#"{"f": {"flag": {"t": 0, "v": {"b": true}}}}"#,
    ///     None,
    ///     chrono::Utc::now(),
    /// )?;
    /// assert_eq!(config.keys(), vec!["flag"]);
    /// # Ok::<(), remote_flags::Error>(())
    /// ```
    pub fn parse(
        body: impl Into<Arc<str>>,
        etag: Option<&str>,
        fetch_time: DateTime<Utc>,
    ) -> Result<Configuration> {
        let body = body.into();
        let document = ConfigDocument::from_json(body.as_bytes())?;
        Ok(Configuration {
            compiled: Arc::new(CompiledConfig::compile(document)),
            body,
            etag: etag.map(Into::into),
            fetch_time,
        })
    }

    /// Same content, refreshed fetch time. Used when the server reports "not modified".
    pub(crate) fn with_fetch_time(&self, fetch_time: DateTime<Utc>) -> Configuration {
        Configuration {
            fetch_time,
            ..self.clone()
        }
    }

    /// Return `true` if nothing was fetched or loaded yet.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Raw configuration body.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Entity tag the server returned with the body.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// When the body was fetched (or last confirmed unchanged).
    pub fn fetch_time(&self) -> DateTime<Utc> {
        self.fetch_time
    }

    /// Server-side preferences carried by the configuration.
    pub fn preferences(&self) -> &Preferences {
        &self.compiled.preferences
    }

    /// Keys of all settings, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.compiled.settings.keys().map(|key| &**key).collect();
        keys.sort_unstable();
        keys
    }

    /// Return `true` if both generations were built from the same body.
    pub(crate) fn same_content(&self, other: &Configuration) -> bool {
        self.body == other.body
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::empty()
    }
}
