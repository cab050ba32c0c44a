use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{EvaluationContext, EvaluationError, Value};

/// Explains how a setting's value was chosen.
///
/// Produced by [`Snapshot::get_value_details`](crate::Snapshot::get_value_details) and delivered
/// to the flag-evaluated hook.
#[derive(Debug, Clone)]
pub struct EvaluationDetails {
    /// Setting key.
    pub key: String,
    /// Served value. `None` only when the key does not exist or no configuration is available.
    pub value: Option<Value>,
    /// Variation that produced the value, if the configuration names one.
    pub variation_id: Option<String>,
    /// Context the setting was evaluated for.
    pub user: Option<Arc<dyn EvaluationContext>>,
    /// `true` if neither a targeting rule nor a percentage option produced the value.
    pub is_default_value: bool,
    /// Why the value may not be what the caller expects. Also set for problems that only caused
    /// a targeting rule to be ignored.
    pub error: Option<EvaluationError>,
    /// Fetch time of the configuration used.
    pub fetch_time: DateTime<Utc>,
    /// Index of the targeting rule that matched.
    pub matched_targeting_rule: Option<usize>,
    /// Index of the percentage option that was selected.
    pub matched_percentage_option: Option<usize>,
}

impl EvaluationDetails {
    pub(crate) fn from_error(
        key: &str,
        error: EvaluationError,
        user: Option<Arc<dyn EvaluationContext>>,
        fetch_time: DateTime<Utc>,
    ) -> EvaluationDetails {
        EvaluationDetails {
            key: key.to_owned(),
            value: None,
            variation_id: None,
            user,
            is_default_value: true,
            error: Some(error),
            fetch_time,
            matched_targeting_rule: None,
            matched_percentage_option: None,
        }
    }
}
