//! A feature flag and remote configuration evaluation engine.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that keeps a remotely hosted configuration document in
//! sync and evaluates its settings for an evaluation context (a "user"). Every evaluation yields
//! a typed [`Value`]: a boolean, a string, an integer or a float.
//!
//! A setting is evaluated by walking its targeting rules in order. A rule matches when all of its
//! conditions hold: conditions on user attributes, on reusable segments, or on the value of
//! another setting. The first matching rule serves a value or splits users by percentage. Users
//! are placed into percentage buckets by a salted hash of their identifier, so that the same user
//! always receives the same value.
//!
//! [`Client::snapshot`] binds the current configuration to a user. All evaluations through one
//! [`Snapshot`] see the same configuration even if the client refreshes in the meantime.
//!
//! # Refreshing
//!
//! The configuration is refreshed according to [`PollingMode`]: by a background thread, lazily on
//! evaluation once it grows stale, or only on explicit [`Client::refresh`] calls. Concurrent
//! refresh requests are coalesced into a single download. A [`ConfigCache`] may be supplied to
//! persist fetched configurations across restarts or share them between processes.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Evaluation itself never fails: problems such as a
//! missing attribute are reported through [`EvaluationDetails::error`] and the best available value
//! is returned.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages under
//! the `remote_flags` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into configuration refreshes and evaluation problems.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod cache;
mod client;
mod config;
mod configuration;
mod configuration_fetcher;
mod configuration_store;
mod error;
mod evaluation_details;
mod poller;
mod settings;
mod sharder;
mod snapshot;
mod synchronizer;

pub use attributes::{
    AttributeValue, Attributes, EvaluationContext, Record, RecordContext, User,
    COUNTRY_ATTRIBUTE, EMAIL_ATTRIBUTE, IDENTIFIER_ATTRIBUTE,
};
pub use cache::{cache_key, ConfigCache, InMemoryCache, CACHE_FORMAT_VERSION, CONFIG_FILE_NAME};
pub use client::Client;
pub use config::{ClientConfig, PollingMode};
pub use configuration::Configuration;
pub use configuration_fetcher::{FetchRequest, FetchResponse, HttpTransport, Transport};
pub use error::{Error, EvaluationError, Result};
pub use evaluation_details::EvaluationDetails;
pub use settings::{
    ComparisonValue, Condition, ConfigDocument, PercentageOption, Preferences,
    PrerequisiteFlagComparator, PrerequisiteFlagCondition, RedirectMode, RuleOutcome, Segment,
    SegmentComparator, SegmentCondition, Setting, SettingType, TargetingRule, UserComparator,
    UserCondition, Value,
};
pub use sharder::{bucket, sensitive_hash, TOTAL_BUCKETS};
pub use snapshot::{FlagEvaluatedHook, Snapshot};
pub use synchronizer::ConfigChangedHook;
