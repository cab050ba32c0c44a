use std::{borrow::Cow, collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use derive_more::From;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::EvaluationError;

mod record;

pub use record::{Record, RecordContext};

/// Name of the attribute that identifies an evaluation context. Percentage options bucket by it
/// unless a setting says otherwise.
pub const IDENTIFIER_ATTRIBUTE: &str = "Identifier";
/// Name of the well-known email attribute.
pub const EMAIL_ATTRIBUTE: &str = "Email";
/// Name of the well-known country attribute.
pub const COUNTRY_ATTRIBUTE: &str = "Country";

/// Type alias for a HashMap representing key-value pairs of attributes.
///
/// # Examples
/// ```
/// # use remote_flags::{Attributes, AttributeValue};
/// let attributes = [
///     ("Identifier".to_owned(), "user-42".into()),
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of an attribute of an evaluation context.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, `bool`,
/// `DateTime<Utc>` and `Vec<String>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A point in time. Compared as (fractional) POSIX seconds.
    DateTime(DateTime<Utc>),
    /// A list of strings, used by the array comparators.
    StringList(Vec<String>),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl AttributeValue {
    /// Return the value as text. Numbers are printed in plain decimal notation, dates as POSIX
    /// seconds and lists as a JSON array. `Null` has no text representation.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        Some(match self {
            AttributeValue::String(s) => Cow::Borrowed(s.as_str()),
            AttributeValue::Number(n) => Cow::Owned(number_to_text(*n)),
            AttributeValue::Boolean(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
            AttributeValue::DateTime(t) => Cow::Owned(number_to_text(unix_seconds(t))),
            AttributeValue::StringList(list) => Cow::Owned(serde_json::to_string(list).ok()?),
            AttributeValue::Null => return None,
        })
    }

    /// Return the value as a number.
    ///
    /// Text is trimmed and accepts both `.` and `,` as decimal separator.
    pub fn to_number(&self) -> Result<f64, String> {
        match self {
            AttributeValue::Number(n) => Ok(*n),
            AttributeValue::String(s) => parse_number(s),
            AttributeValue::DateTime(t) => Ok(unix_seconds(t)),
            other => Err(format!("{} is not a number", other.type_name())),
        }
    }

    /// Return the value as POSIX seconds. Numbers and numeric text are taken as seconds.
    pub fn to_unix_seconds(&self) -> Result<f64, String> {
        match self {
            AttributeValue::DateTime(t) => Ok(unix_seconds(t)),
            AttributeValue::Number(n) => Ok(*n),
            AttributeValue::String(s) => parse_number(s),
            other => Err(format!("{} is not a date/time", other.type_name())),
        }
    }

    /// Return the value as a semantic version.
    pub fn to_semver(&self) -> Result<Version, String> {
        match self {
            AttributeValue::String(s) => {
                Version::parse(s.trim()).map_err(|err| format!("{s:?} is not a valid semantic version: {err}"))
            }
            other => Err(format!("{} is not a semantic version", other.type_name())),
        }
    }

    /// Return the value as a list of strings. Text is accepted when it holds a JSON array of
    /// strings.
    pub fn to_string_list(&self) -> Result<Cow<'_, [String]>, String> {
        match self {
            AttributeValue::StringList(list) => Ok(Cow::Borrowed(list.as_slice())),
            AttributeValue::String(s) => serde_json::from_str::<Vec<String>>(s)
                .map(Cow::Owned)
                .map_err(|_| format!("{s:?} is not a JSON array of strings")),
            other => Err(format!("{} is not a string list", other.type_name())),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::String(_) => "string",
            AttributeValue::Number(_) => "number",
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::DateTime(_) => "date/time",
            AttributeValue::StringList(_) => "string list",
            AttributeValue::Null => "null",
        }
    }
}

fn unix_seconds(t: &DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

/// Format a number without exponent or digit grouping.
pub(crate) fn number_to_text(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_owned()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else {
        n.to_string()
    }
}

/// Parse a number leniently: surrounding whitespace is ignored and `,` works as a decimal
/// separator, so comparison values authored under different locales behave the same.
pub(crate) fn parse_number(text: &str) -> Result<f64, String> {
    let trimmed = text.trim();
    match trimmed {
        "Infinity" | "+Infinity" => return Ok(f64::INFINITY),
        "-Infinity" => return Ok(f64::NEG_INFINITY),
        "NaN" => return Ok(f64::NAN),
        _ => {}
    }
    trimmed
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| format!("{text:?} is not a valid decimal number"))
}

/// Capability of an evaluation context ("user"): look up a named attribute.
///
/// Implemented for [`User`], for plain [`Attributes`] maps and, through [`RecordContext`], for
/// any user-defined [`Record`].
pub trait EvaluationContext: fmt::Debug + Send + Sync {
    /// Get attribute by its (case-sensitive) name.
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttributeValue>>;
}

impl EvaluationContext for Attributes {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttributeValue>> {
        self.get(name).map(Cow::Borrowed)
    }
}

/// The built-in evaluation context: an identifier, two well-known attributes and a bag of custom
/// attributes.
///
/// ```
/// # use remote_flags::User;
/// let user = User::new("user-42")
///     .with_email("someone@example.com")
///     .with_country("DE")
///     .with_custom("plan", "enterprise");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    country: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    custom: Attributes,
}

impl User {
    /// Create a user with the given identifier.
    pub fn new(identifier: impl Into<String>) -> User {
        User {
            identifier: identifier.into(),
            ..User::default()
        }
    }

    #[allow(missing_docs)]
    pub fn with_email(mut self, email: impl Into<String>) -> User {
        self.email = Some(email.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_country(mut self, country: impl Into<String>) -> User {
        self.country = Some(country.into());
        self
    }

    /// Add a custom attribute. Well-known attribute names are shadowed by the dedicated fields.
    pub fn with_custom(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> User {
        self.custom.insert(name.into(), value.into());
        self
    }

    #[allow(missing_docs)]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl EvaluationContext for User {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttributeValue>> {
        let owned = |s: &Option<String>| s.clone().map(|s| Cow::Owned(AttributeValue::String(s)));
        match name {
            IDENTIFIER_ATTRIBUTE => Some(Cow::Owned(AttributeValue::String(self.identifier.clone()))),
            EMAIL_ATTRIBUTE => owned(&self.email),
            COUNTRY_ATTRIBUTE => owned(&self.country),
            _ => self.custom.get(name).map(Cow::Borrowed),
        }
    }
}

/// Typed access to the attributes of an evaluation context. Every accessor reports
/// [`EvaluationError::AttributeMissing`] or [`EvaluationError::AttributeInvalid`] instead of
/// panicking.
#[derive(Clone, Copy)]
pub(crate) struct AttributeAccessor<'a> {
    context: &'a dyn EvaluationContext,
}

impl<'a> AttributeAccessor<'a> {
    pub fn new(context: &'a dyn EvaluationContext) -> Self {
        AttributeAccessor { context }
    }

    fn get(&self, name: &str) -> Result<Cow<'a, AttributeValue>, EvaluationError> {
        match self.context.attribute(name) {
            Some(value) if !matches!(*value, AttributeValue::Null) => Ok(value),
            _ => Err(missing(name)),
        }
    }

    pub fn text(&self, name: &str) -> Result<String, EvaluationError> {
        let value = self.get(name)?;
        value
            .to_text()
            .map(Cow::into_owned)
            .ok_or_else(|| invalid(name, "value has no text representation".to_owned()))
    }

    pub fn number(&self, name: &str) -> Result<f64, EvaluationError> {
        self.get(name)?.to_number().map_err(|reason| invalid(name, reason))
    }

    pub fn unix_seconds(&self, name: &str) -> Result<f64, EvaluationError> {
        self.get(name)?
            .to_unix_seconds()
            .map_err(|reason| invalid(name, reason))
    }

    pub fn semver(&self, name: &str) -> Result<Version, EvaluationError> {
        self.get(name)?.to_semver().map_err(|reason| invalid(name, reason))
    }

    pub fn string_list(&self, name: &str) -> Result<Vec<String>, EvaluationError> {
        self.get(name)?
            .to_string_list()
            .map(Cow::into_owned)
            .map_err(|reason| invalid(name, reason))
    }

    /// Bytes used for percentage bucketing.
    ///
    /// The identifier buckets as the empty string both when it is explicitly empty and when the
    /// context has no identifier attribute at all (e.g. a plain [`Attributes`] map). Any other
    /// missing attribute is an error.
    pub fn bucketing_bytes(&self, name: &str) -> Result<Vec<u8>, EvaluationError> {
        match self.text(name) {
            Ok(text) => Ok(text.into_bytes()),
            Err(EvaluationError::AttributeMissing { .. }) if name == IDENTIFIER_ATTRIBUTE => {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

fn missing(name: &str) -> EvaluationError {
    EvaluationError::AttributeMissing {
        attribute: name.to_owned(),
    }
}

fn invalid(name: &str, reason: String) -> EvaluationError {
    EvaluationError::AttributeInvalid {
        attribute: name.to_owned(),
        reason,
    }
}
