use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::Configuration;

/// `ConfigurationStore` publishes the current configuration generation to concurrent readers.
///
/// Reads never block and never observe a partially built configuration; a refresh replaces the
/// whole generation with a single atomic swap.
pub(crate) struct ConfigurationStore {
    configuration: ArcSwap<Configuration>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self {
            configuration: ArcSwap::from_pointee(Configuration::empty()),
        }
    }

    pub fn get_configuration(&self) -> Arc<Configuration> {
        self.configuration.load_full()
    }

    /// Set new configuration, returning the previous one.
    pub fn set_configuration(&self, configuration: Configuration) -> Arc<Configuration> {
        self.configuration.swap(Arc::new(configuration))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::ConfigurationStore;
    use crate::Configuration;

    #[test]
    fn starts_empty() {
        assert!(ConfigurationStore::new().get_configuration().is_empty());
    }

    #[test]
    fn can_set_configuration_from_another_thread() {
        let store = Arc::new(ConfigurationStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                let config = Configuration::parse(r#"{"f": {}}"#, None, Utc::now()).unwrap();
                store.set_configuration(config);
            })
            .join();
        }

        assert!(!store.get_configuration().is_empty());
    }

    #[test]
    fn readers_keep_their_generation() {
        let store = ConfigurationStore::new();
        let first = Configuration::parse(r#"{"f": {"a": {"t": 0, "v": {"b": true}}}}"#, None, Utc::now()).unwrap();
        store.set_configuration(first);
        let held = store.get_configuration();

        let second = Configuration::parse(r#"{"f": {}}"#, None, Utc::now()).unwrap();
        let previous = store.set_configuration(second);

        assert!(Arc::ptr_eq(&held, &previous));
        assert_eq!(held.keys(), vec!["a"]);
        assert!(store.get_configuration().keys().is_empty());
    }
}
