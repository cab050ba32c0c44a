use std::{cmp::Ordering, collections::HashSet};

use semver::Version;

use crate::{
    attributes::AttributeAccessor,
    settings::{ComparisonValue, UserComparator, UserCondition},
    sharder::sensitive_hash,
    EvaluationError,
};

/// Everything a [`UserMatcher`] needs at evaluation time.
#[derive(Clone, Copy)]
pub(crate) struct MatchContext<'a> {
    pub accessor: Option<AttributeAccessor<'a>>,
    pub config_salt: &'a str,
    /// Setting key, or segment name while evaluating a segment.
    pub context_salt: &'a str,
}

/// A [`UserCondition`] with its comparison operand pre-parsed for its comparator family.
#[derive(Debug)]
pub(crate) struct UserMatcher {
    attribute: String,
    comparator: UserComparator,
    operand: Operand,
}

#[derive(Debug)]
enum Operand {
    Text(String),
    Texts(Vec<String>),
    TextSet(HashSet<String>),
    /// `(length, hash of the prefix/suffix of that length)`.
    HashedAffixes(Vec<(usize, String)>),
    Version(Version),
    Versions(Vec<Version>),
    Number(f64),
    /// The operand is malformed; matching always reports it.
    Invalid(String),
}

impl UserMatcher {
    pub fn compile(condition: &UserCondition) -> UserMatcher {
        use UserComparator::*;

        let operand = match (condition.comparator, &condition.comparison_value) {
            (
                IsOneOf
                | IsNotOneOf
                | SensitiveIsOneOf
                | SensitiveIsNotOneOf
                | ArrayContainsAnyOf
                | ArrayNotContainsAnyOf
                | HashedArrayContainsAnyOf
                | HashedArrayNotContainsAnyOf,
                ComparisonValue::List(list),
            ) => Operand::TextSet(list.iter().cloned().collect()),

            (
                ContainsAnyOf | NotContainsAnyOf | StartsWithAnyOf | NotStartsWithAnyOf
                | EndsWithAnyOf | NotEndsWithAnyOf,
                ComparisonValue::List(list),
            ) => Operand::Texts(list.clone()),

            (
                HashedStartsWithAnyOf | HashedNotStartsWithAnyOf | HashedEndsWithAnyOf
                | HashedNotEndsWithAnyOf,
                ComparisonValue::List(list),
            ) => list
                .iter()
                .map(|item| parse_hashed_affix(item))
                .collect::<Result<_, _>>()
                .map_or_else(Operand::Invalid, Operand::HashedAffixes),

            (SemVerIsOneOf | SemVerIsNotOneOf, ComparisonValue::List(list)) => list
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(parse_version)
                .collect::<Result<_, _>>()
                .map_or_else(Operand::Invalid, Operand::Versions),

            (
                SemVerLess | SemVerLessOrEquals | SemVerGreater | SemVerGreaterOrEquals,
                ComparisonValue::Text(text),
            ) => parse_version(text.trim()).map_or_else(Operand::Invalid, Operand::Version),

            (
                NumberEquals | NumberNotEquals | NumberLess | NumberLessOrEquals | NumberGreater
                | NumberGreaterOrEquals | DateTimeBefore | DateTimeAfter,
                ComparisonValue::Number(n),
            ) => Operand::Number(*n),

            (Equals | NotEquals | HashedEquals | HashedNotEquals, ComparisonValue::Text(text)) => {
                Operand::Text(text.clone())
            }

            (comparator, value) => Operand::Invalid(format!(
                "comparator {comparator:?} cannot use comparison value {value:?}"
            )),
        };

        UserMatcher {
            attribute: condition.attribute.clone(),
            comparator: condition.comparator,
            operand,
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Evaluate the condition. Never panics on bad data: missing or invalid attributes and
    /// malformed operands are reported as errors for the caller to log.
    pub fn matches(&self, ctx: &MatchContext) -> Result<bool, EvaluationError> {
        use UserComparator::*;

        let accessor = ctx.accessor.ok_or(EvaluationError::NoEvaluationContext)?;
        let name = self.attribute.as_str();
        let hash = |value: &[u8]| sensitive_hash(value, ctx.config_salt, ctx.context_salt);

        let matched = match (&self.operand, self.comparator) {
            (Operand::Invalid(reason), _) => {
                return Err(EvaluationError::ComparisonValueInvalid(reason.clone()))
            }

            (Operand::TextSet(set), IsOneOf | IsNotOneOf) => set.contains(&accessor.text(name)?),
            (Operand::TextSet(set), SensitiveIsOneOf | SensitiveIsNotOneOf) => {
                set.contains(&hash(accessor.text(name)?.as_bytes()))
            }
            (Operand::TextSet(set), ArrayContainsAnyOf | ArrayNotContainsAnyOf) => accessor
                .string_list(name)?
                .iter()
                .any(|item| set.contains(item)),
            (Operand::TextSet(set), _) => accessor
                .string_list(name)?
                .iter()
                .any(|item| set.contains(&hash(item.as_bytes()))),

            (Operand::Texts(items), ContainsAnyOf | NotContainsAnyOf) => {
                let text = accessor.text(name)?;
                items.iter().any(|item| text.contains(item.as_str()))
            }
            (Operand::Texts(items), StartsWithAnyOf | NotStartsWithAnyOf) => {
                let text = accessor.text(name)?;
                items.iter().any(|item| text.starts_with(item.as_str()))
            }
            (Operand::Texts(items), _) => {
                let text = accessor.text(name)?;
                items.iter().any(|item| text.ends_with(item.as_str()))
            }

            (Operand::HashedAffixes(items), comparator) => {
                let text = accessor.text(name)?;
                let bytes = text.as_bytes();
                let prefix = matches!(comparator, HashedStartsWithAnyOf | HashedNotStartsWithAnyOf);
                items.iter().any(|(len, expected)| {
                    if *len > bytes.len() {
                        return false;
                    }
                    let part = if prefix {
                        &bytes[..*len]
                    } else {
                        &bytes[bytes.len() - len..]
                    };
                    hash(part) == *expected
                })
            }

            (Operand::Versions(versions), _) => {
                let version = accessor.semver(name)?;
                versions
                    .iter()
                    .any(|v| compare_versions(&version, v) == Ordering::Equal)
            }
            (Operand::Version(expected), comparator) => {
                let ordering = compare_versions(&accessor.semver(name)?, expected);
                match comparator {
                    SemVerLess => ordering == Ordering::Less,
                    SemVerLessOrEquals => ordering != Ordering::Greater,
                    SemVerGreater => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }

            (Operand::Number(expected), DateTimeBefore) => accessor.unix_seconds(name)? < *expected,
            (Operand::Number(expected), DateTimeAfter) => accessor.unix_seconds(name)? > *expected,
            (Operand::Number(expected), comparator) => {
                let n = accessor.number(name)?;
                // IEEE semantics: NaN is never ordered and never equal.
                match comparator {
                    NumberEquals => n == *expected,
                    NumberNotEquals => n != *expected,
                    NumberLess => n < *expected,
                    NumberLessOrEquals => n <= *expected,
                    NumberGreater => n > *expected,
                    _ => n >= *expected,
                }
            }

            (Operand::Text(expected), Equals | NotEquals) => accessor.text(name)? == *expected,
            (Operand::Text(expected), _) => hash(accessor.text(name)?.as_bytes()) == *expected,
        };

        Ok(matched != is_negated(self.comparator))
    }
}

fn is_negated(comparator: UserComparator) -> bool {
    use UserComparator::*;
    matches!(
        comparator,
        IsNotOneOf
            | NotContainsAnyOf
            | SemVerIsNotOneOf
            | SensitiveIsNotOneOf
            | HashedNotEquals
            | HashedNotStartsWithAnyOf
            | HashedNotEndsWithAnyOf
            | HashedArrayNotContainsAnyOf
            | NotEquals
            | NotStartsWithAnyOf
            | NotEndsWithAnyOf
            | ArrayNotContainsAnyOf
    )
}

fn parse_version(text: &str) -> Result<Version, String> {
    Version::parse(text).map_err(|err| format!("{text:?} is not a valid semantic version: {err}"))
}

/// Semantic version precedence: build metadata does not participate.
fn compare_versions(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch, &a.pre).cmp(&(b.major, b.minor, b.patch, &b.pre))
}

fn parse_hashed_affix(item: &str) -> Result<(usize, String), String> {
    let (len, hash) = item
        .split_once('_')
        .ok_or_else(|| format!("{item:?} is not in <length>_<hash> format"))?;
    let len = len
        .trim()
        .parse()
        .map_err(|_| format!("{item:?} has an invalid length prefix"))?;
    Ok((len, hash.to_owned()))
}
