use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Type of a setting's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8")]
#[allow(missing_docs)]
pub enum SettingType {
    Bool,
    String,
    Int,
    Float,
}

impl TryFrom<u8> for SettingType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match value {
            0 => SettingType::Bool,
            1 => SettingType::String,
            2 => SettingType::Int,
            3 => SettingType::Float,
            other => return Err(format!("unknown setting type {other}")),
        })
    }
}

/// A typed setting value.
///
/// Floats compare by bit pattern so that values can be deduplicated and used as map keys.
#[derive(Debug, Clone, Serialize, From)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum Value {
    Bool(bool),
    String(String),
    Int(i64),
    Float(f64),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::String(s) => s.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl Value {
    /// Type of the value.
    pub fn setting_type(&self) -> SettingType {
        match self {
            Value::Bool(_) => SettingType::Bool,
            Value::String(_) => SettingType::String,
            Value::Int(_) => SettingType::Int,
            Value::Float(_) => SettingType::Float,
        }
    }

    #[allow(missing_docs)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// How the server wants the client to treat the base URL it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Keep this response; use the returned base URL from the next fetch on.
    #[default]
    NoRedirect,
    /// Re-fetch from the returned base URL unless the caller set a custom one.
    ShouldRedirect,
    /// Always re-fetch from the returned base URL.
    ForceRedirect,
}

/// Server-side preferences sent along with the settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    #[allow(missing_docs)]
    pub base_url: Option<String>,
    #[allow(missing_docs)]
    pub redirect: RedirectMode,
    /// Salt mixed into every hashed comparison.
    pub salt: String,
}

/// A named, typed feature flag or configuration value.
#[derive(Debug, Clone)]
pub struct Setting {
    #[allow(missing_docs)]
    pub key: Arc<str>,
    #[allow(missing_docs)]
    pub setting_type: SettingType,
    /// Attribute used for percentage bucketing. `None` means the identifier attribute.
    pub percentage_attribute: Option<String>,
    /// Ordered rules; the first matching one wins.
    pub targeting_rules: Vec<TargetingRule>,
    /// Used when no targeting rule matches.
    pub percentage_options: Vec<PercentageOption>,
    /// Value served when nothing else applies.
    pub value: Value,
    #[allow(missing_docs)]
    pub variation_id: Option<String>,
}

/// Ordered AND of conditions guarding a served value or a percentage split.
#[derive(Debug, Clone)]
pub struct TargetingRule {
    #[allow(missing_docs)]
    pub conditions: Vec<Condition>,
    #[allow(missing_docs)]
    pub outcome: RuleOutcome,
}

/// What a matching [`TargetingRule`] serves.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum RuleOutcome {
    Served {
        value: Value,
        variation_id: Option<String>,
    },
    PercentageOptions(Vec<PercentageOption>),
}

/// A deterministic rollout slice.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct PercentageOption {
    pub percentage: u8,
    pub value: Value,
    pub variation_id: Option<String>,
}

/// Exactly one kind of condition.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum Condition {
    User(UserCondition),
    Segment(SegmentCondition),
    PrerequisiteFlag(PrerequisiteFlagCondition),
}

/// Compares one attribute of the evaluation context.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct UserCondition {
    pub attribute: String,
    pub comparator: UserComparator,
    pub comparison_value: ComparisonValue,
}

/// Operand of a [`UserCondition`]. Which variant is expected depends on the comparator.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ComparisonValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
}

/// A reusable, named set of user conditions (ANDed).
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct Segment {
    pub name: Arc<str>,
    pub conditions: Vec<UserCondition>,
}

#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct SegmentCondition {
    pub segment: Arc<Segment>,
    pub comparator: SegmentComparator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SegmentComparator {
    IsIn,
    IsNotIn,
}

#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct PrerequisiteFlagCondition {
    pub flag_key: String,
    pub comparator: PrerequisiteFlagComparator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PrerequisiteFlagComparator {
    Equals,
    NotEquals,
}

/// The closed set of attribute comparators. Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum UserComparator {
    IsOneOf = 0,
    IsNotOneOf = 1,
    ContainsAnyOf = 2,
    NotContainsAnyOf = 3,
    SemVerIsOneOf = 4,
    SemVerIsNotOneOf = 5,
    SemVerLess = 6,
    SemVerLessOrEquals = 7,
    SemVerGreater = 8,
    SemVerGreaterOrEquals = 9,
    NumberEquals = 10,
    NumberNotEquals = 11,
    NumberLess = 12,
    NumberLessOrEquals = 13,
    NumberGreater = 14,
    NumberGreaterOrEquals = 15,
    SensitiveIsOneOf = 16,
    SensitiveIsNotOneOf = 17,
    DateTimeBefore = 18,
    DateTimeAfter = 19,
    HashedEquals = 20,
    HashedNotEquals = 21,
    HashedStartsWithAnyOf = 22,
    HashedNotStartsWithAnyOf = 23,
    HashedEndsWithAnyOf = 24,
    HashedNotEndsWithAnyOf = 25,
    HashedArrayContainsAnyOf = 26,
    HashedArrayNotContainsAnyOf = 27,
    Equals = 28,
    NotEquals = 29,
    StartsWithAnyOf = 30,
    NotStartsWithAnyOf = 31,
    EndsWithAnyOf = 32,
    NotEndsWithAnyOf = 33,
    ArrayContainsAnyOf = 34,
    ArrayNotContainsAnyOf = 35,
}

impl TryFrom<u8> for UserComparator {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        use UserComparator::*;
        const ALL: [UserComparator; 36] = [
            IsOneOf,
            IsNotOneOf,
            ContainsAnyOf,
            NotContainsAnyOf,
            SemVerIsOneOf,
            SemVerIsNotOneOf,
            SemVerLess,
            SemVerLessOrEquals,
            SemVerGreater,
            SemVerGreaterOrEquals,
            NumberEquals,
            NumberNotEquals,
            NumberLess,
            NumberLessOrEquals,
            NumberGreater,
            NumberGreaterOrEquals,
            SensitiveIsOneOf,
            SensitiveIsNotOneOf,
            DateTimeBefore,
            DateTimeAfter,
            HashedEquals,
            HashedNotEquals,
            HashedStartsWithAnyOf,
            HashedNotStartsWithAnyOf,
            HashedEndsWithAnyOf,
            HashedNotEndsWithAnyOf,
            HashedArrayContainsAnyOf,
            HashedArrayNotContainsAnyOf,
            Equals,
            NotEquals,
            StartsWithAnyOf,
            NotStartsWithAnyOf,
            EndsWithAnyOf,
            NotEndsWithAnyOf,
            ArrayContainsAnyOf,
            ArrayNotContainsAnyOf,
        ];
        ALL.get(usize::from(value))
            .copied()
            .ok_or_else(|| format!("unknown comparator {value}"))
    }
}

/// A decoded configuration document.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    #[allow(missing_docs)]
    pub preferences: Preferences,
    #[allow(missing_docs)]
    pub settings: HashMap<Arc<str>, Setting>,
}

impl ConfigDocument {
    /// Decode the compact JSON representation served by the CDN.
    pub fn from_json(json: &[u8]) -> Result<ConfigDocument> {
        let wire: ConfigWire = serde_json::from_slice(json)?;
        ConfigDocument::try_from(wire).map_err(|err| Error::InvalidConfiguration(err.into()))
    }
}

// Wire format. Field names are single letters to keep the document small.

#[derive(Debug, Deserialize)]
struct ConfigWire {
    #[serde(rename = "p", default)]
    preferences: Option<PreferencesWire>,
    #[serde(rename = "s", default)]
    segments: Vec<SegmentWire>,
    #[serde(rename = "f", default)]
    settings: HashMap<String, SettingWire>,
}

#[derive(Debug, Deserialize)]
struct PreferencesWire {
    #[serde(rename = "u", default)]
    base_url: Option<String>,
    #[serde(rename = "r", default)]
    redirect: Option<u8>,
    #[serde(rename = "s", default)]
    salt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentWire {
    #[serde(rename = "n")]
    name: String,
    #[serde(rename = "r", default)]
    conditions: Vec<UserConditionWire>,
}

#[derive(Debug, Deserialize)]
struct SettingWire {
    #[serde(rename = "t")]
    setting_type: SettingType,
    #[serde(rename = "a", default)]
    percentage_attribute: Option<String>,
    #[serde(rename = "r", default)]
    targeting_rules: Vec<TargetingRuleWire>,
    #[serde(rename = "p", default)]
    percentage_options: Vec<PercentageOptionWire>,
    #[serde(rename = "v")]
    value: ValueWire,
    #[serde(rename = "i", default)]
    variation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TargetingRuleWire {
    #[serde(rename = "c", default)]
    conditions: Vec<ConditionWire>,
    #[serde(rename = "s", default)]
    served: Option<ServedValueWire>,
    #[serde(rename = "p", default)]
    percentage_options: Option<Vec<PercentageOptionWire>>,
}

#[derive(Debug, Deserialize)]
struct ServedValueWire {
    #[serde(rename = "v")]
    value: ValueWire,
    #[serde(rename = "i", default)]
    variation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PercentageOptionWire {
    #[serde(rename = "p")]
    percentage: u8,
    #[serde(rename = "v")]
    value: ValueWire,
    #[serde(rename = "i", default)]
    variation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConditionWire {
    #[serde(rename = "u", default)]
    user: Option<UserConditionWire>,
    #[serde(rename = "s", default)]
    segment: Option<SegmentConditionWire>,
    #[serde(rename = "p", default)]
    prerequisite: Option<PrerequisiteWire>,
}

#[derive(Debug, Deserialize)]
struct UserConditionWire {
    #[serde(rename = "a")]
    attribute: String,
    #[serde(rename = "c")]
    comparator: u8,
    #[serde(rename = "s", default)]
    text: Option<String>,
    #[serde(rename = "d", default)]
    number: Option<f64>,
    #[serde(rename = "l", default)]
    list: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SegmentConditionWire {
    #[serde(rename = "s")]
    index: usize,
    #[serde(rename = "c")]
    comparator: u8,
}

#[derive(Debug, Deserialize)]
struct PrerequisiteWire {
    #[serde(rename = "f")]
    flag_key: String,
    #[serde(rename = "c")]
    comparator: u8,
    #[serde(rename = "v")]
    value: ValueWire,
}

#[derive(Debug, Deserialize)]
struct ValueWire {
    #[serde(rename = "b", default)]
    bool: Option<bool>,
    #[serde(rename = "s", default)]
    string: Option<String>,
    #[serde(rename = "i", default)]
    int: Option<i64>,
    #[serde(rename = "d", default)]
    float: Option<f64>,
}

impl ValueWire {
    /// Convert to a value of the expected type.
    fn into_typed(self, ty: SettingType) -> std::result::Result<Value, String> {
        let value = self.into_untyped()?;
        if value.setting_type() == ty {
            Ok(value)
        } else {
            Err(format!("value {value:?} does not match setting type {ty:?}"))
        }
    }

    /// Convert a value whose type is not known from context. Exactly one field must be set.
    fn into_untyped(self) -> std::result::Result<Value, String> {
        let candidates = [
            self.bool.map(Value::Bool),
            self.string.map(Value::String),
            self.int.map(Value::Int),
            self.float.map(Value::Float),
        ];
        let mut set = candidates.into_iter().flatten();
        match (set.next(), set.next()) {
            (Some(value), None) => Ok(value),
            (None, _) => Err("setting value is empty".to_owned()),
            (Some(_), Some(_)) => Err("setting value has more than one field set".to_owned()),
        }
    }
}

impl TryFrom<ConfigWire> for ConfigDocument {
    type Error = String;

    fn try_from(wire: ConfigWire) -> std::result::Result<Self, Self::Error> {
        let preferences = match wire.preferences {
            Some(p) => Preferences {
                base_url: p.base_url.filter(|url| !url.is_empty()),
                redirect: match p.redirect.unwrap_or(0) {
                    0 => RedirectMode::NoRedirect,
                    1 => RedirectMode::ShouldRedirect,
                    2 => RedirectMode::ForceRedirect,
                    other => return Err(format!("unknown redirect mode {other}")),
                },
                salt: p.salt.unwrap_or_default(),
            },
            None => Preferences::default(),
        };

        let segments = wire
            .segments
            .into_iter()
            .map(|segment| {
                Ok(Arc::new(Segment {
                    name: segment.name.into(),
                    conditions: segment
                        .conditions
                        .into_iter()
                        .map(UserCondition::try_from)
                        .collect::<std::result::Result<_, String>>()?,
                }))
            })
            .collect::<std::result::Result<Vec<_>, String>>()?;

        let settings = wire
            .settings
            .into_iter()
            .map(|(key, setting)| {
                let key: Arc<str> = key.into();
                let setting = convert_setting(key.clone(), setting, &segments)
                    .map_err(|err| format!("setting {key:?}: {err}"))?;
                Ok((key, setting))
            })
            .collect::<std::result::Result<_, String>>()?;

        Ok(ConfigDocument {
            preferences,
            settings,
        })
    }
}

fn convert_setting(
    key: Arc<str>,
    wire: SettingWire,
    segments: &[Arc<Segment>],
) -> std::result::Result<Setting, String> {
    let ty = wire.setting_type;
    let targeting_rules = wire
        .targeting_rules
        .into_iter()
        .map(|rule| convert_rule(rule, ty, segments))
        .collect::<std::result::Result<_, _>>()?;
    Ok(Setting {
        key,
        setting_type: ty,
        percentage_attribute: wire.percentage_attribute,
        targeting_rules,
        percentage_options: convert_options(wire.percentage_options, ty)?,
        value: wire.value.into_typed(ty)?,
        variation_id: wire.variation_id,
    })
}

fn convert_rule(
    wire: TargetingRuleWire,
    ty: SettingType,
    segments: &[Arc<Segment>],
) -> std::result::Result<TargetingRule, String> {
    let conditions = wire
        .conditions
        .into_iter()
        .map(|condition| convert_condition(condition, segments))
        .collect::<std::result::Result<_, _>>()?;
    let outcome = match (wire.served, wire.percentage_options) {
        (Some(served), None) => RuleOutcome::Served {
            value: served.value.into_typed(ty)?,
            variation_id: served.variation_id,
        },
        (None, Some(options)) => RuleOutcome::PercentageOptions(convert_options(options, ty)?),
        _ => {
            return Err(
                "targeting rule must have either a served value or percentage options".to_owned(),
            )
        }
    };
    Ok(TargetingRule {
        conditions,
        outcome,
    })
}

fn convert_options(
    wire: Vec<PercentageOptionWire>,
    ty: SettingType,
) -> std::result::Result<Vec<PercentageOption>, String> {
    wire.into_iter()
        .map(|option| {
            Ok(PercentageOption {
                percentage: option.percentage,
                value: option.value.into_typed(ty)?,
                variation_id: option.variation_id,
            })
        })
        .collect()
}

fn convert_condition(
    wire: ConditionWire,
    segments: &[Arc<Segment>],
) -> std::result::Result<Condition, String> {
    match (wire.user, wire.segment, wire.prerequisite) {
        (Some(user), None, None) => Ok(Condition::User(user.try_into()?)),
        (None, Some(segment), None) => Ok(Condition::Segment(SegmentCondition {
            segment: segments
                .get(segment.index)
                .cloned()
                .ok_or_else(|| format!("segment index {} is out of range", segment.index))?,
            comparator: match segment.comparator {
                0 => SegmentComparator::IsIn,
                1 => SegmentComparator::IsNotIn,
                other => return Err(format!("unknown segment comparator {other}")),
            },
        })),
        (None, None, Some(prerequisite)) => {
            Ok(Condition::PrerequisiteFlag(PrerequisiteFlagCondition {
                flag_key: prerequisite.flag_key,
                comparator: match prerequisite.comparator {
                    0 => PrerequisiteFlagComparator::Equals,
                    1 => PrerequisiteFlagComparator::NotEquals,
                    other => return Err(format!("unknown prerequisite comparator {other}")),
                },
                value: prerequisite.value.into_untyped()?,
            }))
        }
        _ => Err("condition must have exactly one of user, segment or prerequisite".to_owned()),
    }
}

impl TryFrom<UserConditionWire> for UserCondition {
    type Error = String;

    fn try_from(wire: UserConditionWire) -> std::result::Result<Self, Self::Error> {
        let comparison_value = match (wire.text, wire.number, wire.list) {
            (Some(text), None, None) => ComparisonValue::Text(text),
            (None, Some(number), None) => ComparisonValue::Number(number),
            (None, None, Some(list)) => ComparisonValue::List(list),
            _ => {
                return Err(format!(
                    "condition on {:?} must have exactly one comparison value",
                    wire.attribute
                ))
            }
        };
        Ok(UserCondition {
            attribute: wire.attribute,
            comparator: wire.comparator.try_into()?,
            comparison_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_document() {
        let json = br#"{
            "p": {"u": "https://cdn.example.com", "r": 0, "s": "salt"},
            "s": [{"n": "Beta", "r": [{"a": "Email", "c": 2, "l": ["@example.com"]}]}],
            "f": {
                "flag": {
                    "t": 0,
                    "v": {"b": false},
                    "i": "v-off",
                    "r": [
                        {"c": [{"u": {"a": "Country", "c": 0, "l": ["US"]}}], "s": {"v": {"b": true}, "i": "v-on"}},
                        {"c": [{"s": {"s": 0, "c": 0}}], "p": [{"p": 100, "v": {"b": true}, "i": "v-p"}]},
                        {"c": [{"p": {"f": "other", "c": 1, "v": {"s": "x"}}}], "s": {"v": {"b": true}}}
                    ]
                },
                "other": {"t": 1, "v": {"s": "x"}}
            }
        }"#;

        let doc = ConfigDocument::from_json(json).unwrap();
        assert_eq!(doc.preferences.salt, "salt");
        assert_eq!(doc.preferences.redirect, RedirectMode::NoRedirect);

        let flag = &doc.settings["flag"];
        assert_eq!(flag.setting_type, SettingType::Bool);
        assert_eq!(flag.value, Value::Bool(false));
        assert_eq!(flag.targeting_rules.len(), 3);
        assert!(matches!(
            &flag.targeting_rules[1].conditions[0],
            Condition::Segment(SegmentCondition { segment, comparator: SegmentComparator::IsIn })
                if &*segment.name == "Beta"
        ));
        assert!(matches!(
            &flag.targeting_rules[2].conditions[0],
            Condition::PrerequisiteFlag(PrerequisiteFlagCondition { value: Value::String(s), .. })
                if s == "x"
        ));
    }

    #[test]
    fn rejects_value_of_wrong_type() {
        let json = br#"{"f": {"flag": {"t": 0, "v": {"s": "oops"}}}}"#;
        assert!(matches!(
            ConfigDocument::from_json(json),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_ambiguous_condition() {
        let json = br#"{"f": {"flag": {"t": 0, "v": {"b": true}, "r": [
            {"c": [{"u": {"a": "A", "c": 28, "s": "x"}, "p": {"f": "y", "c": 0, "v": {"b": true}}}],
             "s": {"v": {"b": false}}}
        ]}}}"#;
        assert!(ConfigDocument::from_json(json).is_err());
    }

    #[test]
    fn rejects_unknown_comparator() {
        assert!(UserComparator::try_from(36).is_err());
        assert_eq!(
            UserComparator::try_from(35),
            Ok(UserComparator::ArrayNotContainsAnyOf)
        );
    }

    #[test]
    fn float_values_dedup_by_bits() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(1.0), Value::Int(1));
    }
}
