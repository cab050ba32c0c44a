use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    settings::{CompiledSetting, ValueId},
    Configuration, EvaluationContext, EvaluationDetails, EvaluationError, Value,
};

/// Callback invoked once per terminal evaluation.
pub type FlagEvaluatedHook = Arc<dyn Fn(&EvaluationDetails) + Send + Sync>;

/// An immutable view of one configuration generation bound to one evaluation context.
///
/// Values are computed lazily and remembered, so asking for the same key again is a single
/// atomic load. A snapshot never observes a refresh: it keeps evaluating the generation it was
/// created with.
///
/// ```
/// # use std::sync::Arc;
/// # use remote_flags::{Configuration, Snapshot, User, Value};
/// let config = Configuration::parse(
///     r#"{"f": {"flag": {"t": 0, "v": {"b": false}, "r": [
///         {"c": [{"u": {"a": "Country", "c": 0, "l": ["US"]}}], "s": {"v": {"b": true}}}
///     ]}}}"#,
///     None,
///     chrono::Utc::now(),
/// )?;
/// let snapshot = Snapshot::new(Arc::new(config), Some(Arc::new(User::new("u1").with_country("US"))));
/// assert_eq!(snapshot.get_value("flag"), Some(Value::Bool(true)));
/// # Ok::<(), remote_flags::Error>(())
/// ```
pub struct Snapshot {
    configuration: Arc<Configuration>,
    user: Option<Arc<dyn EvaluationContext>>,
    /// Memoized value ids by key id. `0` means not evaluated yet.
    values: Box<[AtomicU32]>,
    on_flag_evaluated: Option<FlagEvaluatedHook>,
}

impl Snapshot {
    /// Bind `configuration` to `user`.
    pub fn new(
        configuration: Arc<Configuration>,
        user: Option<Arc<dyn EvaluationContext>>,
    ) -> Snapshot {
        let values = (0..configuration.compiled.evaluators.len())
            .map(|_| AtomicU32::new(0))
            .collect();
        Snapshot {
            configuration,
            user,
            values,
            on_flag_evaluated: None,
        }
    }

    pub(crate) fn with_hook(mut self, hook: Option<FlagEvaluatedHook>) -> Snapshot {
        self.on_flag_evaluated = hook;
        self
    }

    /// Configuration generation this snapshot evaluates.
    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.configuration
    }

    /// Evaluation context this snapshot is bound to.
    pub fn user(&self) -> Option<&Arc<dyn EvaluationContext>> {
        self.user.as_ref()
    }

    /// Get the value of `key`.
    ///
    /// Returns `None` if the key does not exist. If evaluation fails (e.g., the setting takes
    /// part in a circular dependency) the error is logged and the setting's default value is
    /// returned.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        if self.on_flag_evaluated.is_some() {
            return self.get_value_details(key).value;
        }

        let compiled = &self.configuration.compiled;
        let key_id = *compiled.settings.get(key)?;
        let cached = self.values.get(key_id)?.load(Ordering::Relaxed);
        if cached != 0 {
            return compiled.value(cached).cloned();
        }

        let setting = compiled.setting(key)?;
        let value_id = match setting.evaluate(compiled, self.user.as_deref()) {
            Ok(evaluation) => {
                self.remember(key_id, evaluation.selection.value_id);
                evaluation.selection.value_id
            }
            Err(err) => {
                log::error!(target: "remote_flags", key; "failed to evaluate setting: {err}");
                setting.default.value_id
            }
        };
        compiled.value(value_id).cloned()
    }

    /// Get the value of `key` together with an explanation of how it was chosen.
    pub fn get_value_details(&self, key: &str) -> EvaluationDetails {
        let details = self.evaluate_details(key);

        log::trace!(target: "remote_flags",
                    key,
                    value:serde = details.value,
                    variation_id:debug = details.variation_id;
                    "evaluated a setting");

        if let Some(hook) = &self.on_flag_evaluated {
            hook(&details);
        }
        details
    }

    fn evaluate_details(&self, key: &str) -> EvaluationDetails {
        let compiled = &self.configuration.compiled;
        let fetch_time = self.configuration.fetch_time();

        let Some(setting) = compiled.setting(key) else {
            let error = if self.configuration.is_empty() {
                EvaluationError::ConfigurationMissing
            } else {
                EvaluationError::KeyNotFound {
                    key: key.to_owned(),
                }
            };
            log::error!(target: "remote_flags",
                        key,
                        available_keys:debug = self.keys();
                        "failed to evaluate setting: {error}");
            return EvaluationDetails::from_error(key, error, self.user.clone(), fetch_time);
        };

        let (value_id, variation_id, error, matched_rule, matched_option) =
            match setting.evaluate(compiled, self.user.as_deref()) {
                Ok(evaluation) => {
                    self.remember_setting(setting, evaluation.selection.value_id);
                    (
                        evaluation.selection.value_id,
                        evaluation.selection.variation_id.clone(),
                        evaluation.diagnostic,
                        evaluation.matched_rule,
                        evaluation.matched_option,
                    )
                }
                Err(err) => {
                    log::error!(target: "remote_flags", key; "failed to evaluate setting: {err}");
                    (
                        setting.default.value_id,
                        setting.default.variation_id.clone(),
                        Some(err),
                        None,
                        None,
                    )
                }
            };

        EvaluationDetails {
            key: key.to_owned(),
            value: compiled.value(value_id).cloned(),
            variation_id: variation_id.map(|id| id.to_string()),
            user: self.user.clone(),
            is_default_value: matched_rule.is_none() && matched_option.is_none(),
            error,
            fetch_time,
            matched_targeting_rule: matched_rule,
            matched_percentage_option: matched_option,
        }
    }

    /// Keys of all settings, sorted.
    pub fn keys(&self) -> Vec<&str> {
        self.configuration.keys()
    }

    /// Evaluate every setting. Keys that fail to produce a value are left out.
    pub fn get_all_values(&self) -> HashMap<String, Value> {
        self.keys()
            .into_iter()
            .filter_map(|key| Some((key.to_owned(), self.get_value(key)?)))
            .collect()
    }

    /// Find the setting key and value that a variation id stands for.
    pub fn get_key_and_value(&self, variation_id: &str) -> Option<(&str, &Value)> {
        let compiled = &self.configuration.compiled;
        let &(key_id, value_id) = compiled.variations.get(variation_id)?;
        let setting = compiled.evaluators.get(key_id)?.as_ref()?;
        Some((&*setting.key, compiled.value(value_id)?))
    }

    fn remember_setting(&self, setting: &CompiledSetting, value_id: ValueId) {
        if let Some(&key_id) = self.configuration.compiled.settings.get(&setting.key) {
            self.remember(key_id, value_id);
        }
    }

    /// Racing writers store the same id.
    fn remember(&self, key_id: usize, value_id: ValueId) {
        if let Some(slot) = self.values.get(key_id) {
            slot.store(value_id, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("fetch_time", &self.configuration.fetch_time())
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
