//! Persistent storage for the last fetched configuration.
use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};

use crate::{Configuration, Error, Result};

/// Name of the configuration file served by the CDN.
pub const CONFIG_FILE_NAME: &str = "config_v6.json";

/// Version of the cache entry format. Part of the cache key so that incompatible entries are
/// never read back.
pub const CACHE_FORMAT_VERSION: &str = "v2";

/// A key-value store for serialized configurations.
///
/// Implementations may be shared between processes (a file, Redis, ...). Errors are logged and
/// treated as a cache miss; they never stop the client from working.
pub trait ConfigCache: Send + Sync {
    /// Read the entry stored under `key`. `Ok(None)` means there is no entry.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous entry.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// A [`ConfigCache`] that keeps entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> InMemoryCache {
        InMemoryCache::default()
    }
}

impl ConfigCache for InMemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::CacheReadFailed("cache lock poisoned".to_owned()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::CacheWriteFailed("cache lock poisoned".to_owned()))?;
        entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

/// Cache key for `sdk_key`: `sha1(sdk_key + "_" + file name + "_" + format version)`, hex.
pub fn cache_key(sdk_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sdk_key.as_bytes());
    hasher.update(b"_");
    hasher.update(CONFIG_FILE_NAME.as_bytes());
    hasher.update(b"_");
    hasher.update(CACHE_FORMAT_VERSION.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize as `fetch time millis \n etag \n body`.
pub fn serialize_entry(configuration: &Configuration) -> Vec<u8> {
    let mut entry = format!(
        "{}\n{}\n",
        configuration.fetch_time().timestamp_millis(),
        configuration.etag().unwrap_or_default()
    )
    .into_bytes();
    entry.extend_from_slice(configuration.body().as_bytes());
    entry
}

/// Parse an entry written by [`serialize_entry`]. Everything after the second newline is the
/// body, verbatim.
pub fn parse_entry(entry: &[u8]) -> Result<Configuration> {
    let invalid = |reason: &str| Error::CacheReadFailed(reason.to_owned());

    let mut parts = entry.splitn(3, |b| *b == b'\n');
    let (Some(time), Some(etag), Some(body)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid("cache entry has fewer than three parts"));
    };

    let millis = std::str::from_utf8(time)
        .ok()
        .and_then(|time| time.trim().parse::<i64>().ok())
        .ok_or_else(|| invalid("cache entry has an invalid fetch time"))?;
    let fetch_time = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| invalid("cache entry fetch time is out of range"))?;
    let etag = std::str::from_utf8(etag).map_err(|_| invalid("cache entry etag is not UTF-8"))?;
    let body = std::str::from_utf8(body).map_err(|_| invalid("cache entry body is not UTF-8"))?;
    if body.is_empty() {
        return Err(invalid("cache entry body is empty"));
    }

    let etag = (!etag.is_empty()).then_some(etag);
    Configuration::parse(body, etag, fetch_time)
        .map_err(|err| Error::CacheReadFailed(format!("cache entry body is invalid: {err}")))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    const BODY: &str = r#"{"p": {"s": "salt"}, "f": {"flag": {"t": 0, "v": {"b": true}}}}"#;

    #[test]
    fn cache_key_is_stable() {
        let key = cache_key("sdk-key");
        assert_eq!(key.len(), 40);
        assert_eq!(key, cache_key("sdk-key"));
        assert_ne!(key, cache_key("other-key"));
    }

    #[test]
    fn entry_round_trip() {
        let fetch_time = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let config = Configuration::parse(BODY, Some("W/\"etag\""), fetch_time).unwrap();

        let entry = serialize_entry(&config);
        assert!(entry.starts_with(b"1700000000123\nW/\"etag\"\n{"));

        let parsed = parse_entry(&entry).unwrap();
        assert_eq!(parsed.fetch_time(), fetch_time);
        assert_eq!(parsed.etag(), Some("W/\"etag\""));
        assert_eq!(parsed.body(), BODY);
    }

    #[test]
    fn body_may_contain_newlines() {
        let body = "{\n\"f\": {}\n}";
        let config = Configuration::parse(body, None, Utc::now()).unwrap();
        let parsed = parse_entry(&serialize_entry(&config)).unwrap();
        assert_eq!(parsed.body(), body);
        assert_eq!(parsed.etag(), None);
    }

    #[test]
    fn rejects_malformed_entries() {
        for entry in [&b""[..], b"123", b"123\netag", b"abc\netag\n{}", b"123\netag\n", b"1\n\n{"] {
            assert!(
                matches!(parse_entry(entry), Err(Error::CacheReadFailed(_))),
                "{:?}",
                String::from_utf8_lossy(entry)
            );
        }
    }

    #[test]
    fn in_memory_cache() {
        let cache = InMemoryCache::new();
        assert_eq!(cache.get("k").unwrap(), None);
        cache.set("k", b"value").unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some(&b"value"[..]));
    }
}
