use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, OnceLock, RwLock},
};

use crate::{
    attributes::IDENTIFIER_ATTRIBUTE,
    settings::{
        rules::UserMatcher, Condition, ConfigDocument, PercentageOption,
        PrerequisiteFlagComparator, Preferences, RuleOutcome, SegmentComparator, Setting,
        SettingType, Value,
    },
    EvaluationError,
};

/// 1-based index into [`CompiledConfig::values`]. `0` means "not evaluated".
pub(crate) type ValueId = u32;

/// Process-wide, append-only mapping from setting key to a dense integer id.
///
/// Ids are never reused or shrunk, so an id obtained from one configuration generation is valid
/// for every later one.
fn key_registry() -> &'static RwLock<HashMap<Arc<str>, usize>> {
    static REGISTRY: OnceLock<RwLock<HashMap<Arc<str>, usize>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Register `keys`, returning their ids and the number of ids assigned so far.
fn register_keys<'a>(keys: impl Iterator<Item = &'a Arc<str>>) -> (HashMap<Arc<str>, usize>, usize) {
    // Poisoning is impossible here: nothing panics while holding the lock.
    let mut registry = match key_registry().write() {
        Ok(registry) => registry,
        Err(poisoned) => poisoned.into_inner(),
    };
    let ids = keys
        .map(|key| {
            let next = registry.len();
            let id = *registry.entry(key.clone()).or_insert(next);
            (key.clone(), id)
        })
        .collect();
    (ids, registry.len())
}

/// One served outcome: a deduplicated value plus the variation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Selection {
    pub value_id: ValueId,
    pub variation_id: Option<Arc<str>>,
}

/// A compiled configuration generation. Immutable once built.
#[derive(Debug, Default)]
pub(crate) struct CompiledConfig {
    pub preferences: Preferences,
    /// Setting key to key id.
    pub settings: HashMap<Arc<str>, usize>,
    /// Indexed by key id. `None` for keys registered by other generations.
    pub evaluators: Box<[Option<CompiledSetting>]>,
    /// Distinct values; `ValueId` `n` lives at index `n - 1`.
    pub values: Box<[Value]>,
    /// Variation id to the key id and value id that first produced it.
    pub variations: HashMap<Arc<str>, (usize, ValueId)>,
}

/// A setting compiled into a directly evaluable form.
#[derive(Debug)]
pub(crate) struct CompiledSetting {
    pub key: Arc<str>,
    pub setting_type: SettingType,
    pub percentage_attribute: String,
    pub rules: Box<[CompiledRule]>,
    pub percentage_options: Box<[CompiledOption]>,
    pub default: Selection,
    /// Set when the setting takes part in a prerequisite cycle.
    pub cycle: Option<String>,
}

#[derive(Debug)]
pub(crate) struct CompiledRule {
    pub conditions: Box<[CompiledCondition]>,
    pub outcome: CompiledOutcome,
}

#[derive(Debug)]
pub(crate) enum CompiledOutcome {
    Served(Selection),
    PercentageOptions(Box<[CompiledOption]>),
}

#[derive(Debug)]
pub(crate) struct CompiledOption {
    pub percentage: u32,
    pub selection: Selection,
}

#[derive(Debug)]
pub(crate) enum CompiledCondition {
    User(UserMatcher),
    Segment {
        name: Arc<str>,
        matchers: Box<[UserMatcher]>,
        comparator: SegmentComparator,
    },
    Prerequisite {
        key: Arc<str>,
        /// Key id of the prerequisite and the value id it is compared against.
        target: Result<(usize, ValueId), EvaluationError>,
        comparator: PrerequisiteFlagComparator,
    },
}

#[derive(Default)]
struct ValueTable {
    values: Vec<Value>,
    ids: HashMap<Value, ValueId>,
    variations: HashMap<Arc<str>, (usize, ValueId)>,
}

impl ValueTable {
    fn intern(&mut self, value: &Value) -> ValueId {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        self.values.push(value.clone());
        let id = self.values.len() as ValueId;
        self.ids.insert(value.clone(), id);
        id
    }

    fn select(&mut self, key_id: usize, value: &Value, variation_id: Option<&str>) -> Selection {
        let value_id = self.intern(value);
        let variation_id: Option<Arc<str>> = variation_id.map(Into::into);
        if let Some(variation) = &variation_id {
            self.variations
                .entry(variation.clone())
                .or_insert((key_id, value_id));
        }
        Selection {
            value_id,
            variation_id,
        }
    }
}

impl CompiledConfig {
    /// Compile a decoded document. Keys get process-wide ids, values get deduplicated, and
    /// settings taking part in prerequisite cycles are compiled into failing evaluators.
    pub fn compile(doc: ConfigDocument) -> CompiledConfig {
        let (settings, key_count) = register_keys(doc.settings.keys());
        let cycles = find_cycles(&doc.settings);

        let mut table = ValueTable::default();
        let mut evaluators: Vec<Option<CompiledSetting>> = (0..key_count).map(|_| None).collect();

        // Sorted so that "first seen" in the variation table is deterministic.
        let mut keys: Vec<&Arc<str>> = doc.settings.keys().collect();
        keys.sort();

        for key in keys {
            let setting = &doc.settings[key];
            let key_id = settings[key];
            let compiled = compile_setting(
                setting,
                key_id,
                &settings,
                &doc.settings,
                cycles.get(key).cloned(),
                &mut table,
            );
            evaluators[key_id] = Some(compiled);
        }

        CompiledConfig {
            preferences: doc.preferences,
            settings,
            evaluators: evaluators.into_boxed_slice(),
            values: table.values.into_boxed_slice(),
            variations: table.variations,
        }
    }

    pub fn setting(&self, key: &str) -> Option<&CompiledSetting> {
        let id = *self.settings.get(key)?;
        self.evaluators.get(id)?.as_ref()
    }

    pub fn value(&self, value_id: ValueId) -> Option<&Value> {
        self.values.get((value_id as usize).checked_sub(1)?)
    }
}

fn compile_setting(
    setting: &Setting,
    key_id: usize,
    key_ids: &HashMap<Arc<str>, usize>,
    all: &HashMap<Arc<str>, Setting>,
    cycle: Option<String>,
    table: &mut ValueTable,
) -> CompiledSetting {
    let options = |list: &[PercentageOption], table: &mut ValueTable| {
        list.iter()
            .map(|option| CompiledOption {
                percentage: u32::from(option.percentage),
                selection: table.select(key_id, &option.value, option.variation_id.as_deref()),
            })
            .collect::<Box<[_]>>()
    };

    let rules = setting
        .targeting_rules
        .iter()
        .map(|rule| CompiledRule {
            conditions: rule
                .conditions
                .iter()
                .map(|condition| compile_condition(condition, key_ids, all, table))
                .collect(),
            outcome: match &rule.outcome {
                RuleOutcome::Served {
                    value,
                    variation_id,
                } => CompiledOutcome::Served(table.select(
                    key_id,
                    value,
                    variation_id.as_deref(),
                )),
                RuleOutcome::PercentageOptions(list) => {
                    CompiledOutcome::PercentageOptions(options(list, table))
                }
            },
        })
        .collect();

    CompiledSetting {
        key: setting.key.clone(),
        setting_type: setting.setting_type,
        percentage_attribute: setting
            .percentage_attribute
            .clone()
            .unwrap_or_else(|| IDENTIFIER_ATTRIBUTE.to_owned()),
        rules,
        percentage_options: options(&setting.percentage_options, table),
        default: table.select(key_id, &setting.value, setting.variation_id.as_deref()),
        cycle,
    }
}

fn compile_condition(
    condition: &Condition,
    key_ids: &HashMap<Arc<str>, usize>,
    all: &HashMap<Arc<str>, Setting>,
    table: &mut ValueTable,
) -> CompiledCondition {
    match condition {
        Condition::User(user) => CompiledCondition::User(UserMatcher::compile(user)),
        Condition::Segment(segment) => CompiledCondition::Segment {
            name: segment.segment.name.clone(),
            matchers: segment
                .segment
                .conditions
                .iter()
                .map(UserMatcher::compile)
                .collect(),
            comparator: segment.comparator,
        },
        Condition::PrerequisiteFlag(prerequisite) => {
            let key: Arc<str> = prerequisite.flag_key.as_str().into();
            let target = match all.get(&key) {
                None => Err(EvaluationError::PrerequisiteNotFound {
                    key: prerequisite.flag_key.clone(),
                }),
                Some(target) if target.setting_type != prerequisite.value.setting_type() => {
                    Err(EvaluationError::PrerequisiteTypeMismatch {
                        key: prerequisite.flag_key.clone(),
                    })
                }
                // A value no variation serves still gets an id; it simply never compares equal.
                Some(_) => Ok((key_ids[&key], table.intern(&prerequisite.value))),
            };
            CompiledCondition::Prerequisite {
                key,
                target,
                comparator: prerequisite.comparator,
            }
        }
    }
}

/// Find every setting that lies on a prerequisite cycle, mapped to a readable cycle path.
fn find_cycles(settings: &HashMap<Arc<str>, Setting>) -> HashMap<Arc<str>, String> {
    let edges: HashMap<&str, Vec<&str>> = settings
        .iter()
        .map(|(key, setting)| {
            let targets = setting
                .targeting_rules
                .iter()
                .flat_map(|rule| rule.conditions.iter())
                .filter_map(|condition| match condition {
                    Condition::PrerequisiteFlag(p) if settings.contains_key(p.flag_key.as_str()) => {
                        Some(p.flag_key.as_str())
                    }
                    _ => None,
                })
                .collect();
            (&**key, targets)
        })
        .collect();

    settings
        .keys()
        .filter_map(|key| {
            let path = cycle_through(key, &edges)?;
            Some((key.clone(), path.join(" -> ")))
        })
        .collect()
}

/// Return a path `start -> ... -> start` if `start` can reach itself.
fn cycle_through<'a>(start: &'a str, edges: &HashMap<&'a str, Vec<&'a str>>) -> Option<Vec<&'a str>> {
    let mut visited = HashSet::new();
    // Stack of (node, index of the next edge to follow).
    let mut stack: Vec<(&str, usize)> = vec![(start, 0)];

    while let Some((node, next_edge)) = stack.last_mut() {
        let Some(&next) = edges.get(*node).and_then(|targets| targets.get(*next_edge)) else {
            stack.pop();
            continue;
        };
        *next_edge += 1;

        if next == start {
            let mut path: Vec<&str> = stack.iter().map(|(node, _)| *node).collect();
            path.push(start);
            return Some(path);
        }
        if visited.insert(next) {
            stack.push((next, 0));
        }
    }
    None
}
