use crate::{
    attributes::{AttributeAccessor, EvaluationContext},
    settings::{
        compiled::{
            CompiledCondition, CompiledConfig, CompiledOption, CompiledOutcome, CompiledRule,
            CompiledSetting, Selection,
        },
        rules::MatchContext,
        PrerequisiteFlagComparator, SegmentComparator,
    },
    sharder, EvaluationError,
};

/// Outcome of evaluating one setting for one context.
#[derive(Debug, Clone)]
pub(crate) struct Evaluation<'a> {
    pub selection: &'a Selection,
    /// Index of the targeting rule that produced the value.
    pub matched_rule: Option<usize>,
    /// Index of the percentage option that produced the value, within the matched rule if any.
    pub matched_option: Option<usize>,
    /// First non-fatal problem met on the way. The value is still valid.
    pub diagnostic: Option<EvaluationError>,
}

impl CompiledConfig {
    /// Evaluate `key` for `context`.
    pub fn evaluate<'a>(
        &'a self,
        key: &str,
        context: Option<&dyn EvaluationContext>,
    ) -> Result<(&'a CompiledSetting, Evaluation<'a>), EvaluationError> {
        let setting = self.setting(key).ok_or_else(|| EvaluationError::KeyNotFound {
            key: key.to_owned(),
        })?;
        let evaluation = setting.evaluate(self, context)?;
        Ok((setting, evaluation))
    }
}

impl CompiledSetting {
    /// Walk targeting rules, then percentage options, then fall back to the default value.
    ///
    /// Only a circular dependency is returned as an error. Every other problem makes the rule
    /// (or percentage options) it occurred in ignored and is reported through
    /// [`Evaluation::diagnostic`].
    pub fn evaluate<'a>(
        &'a self,
        config: &CompiledConfig,
        context: Option<&dyn EvaluationContext>,
    ) -> Result<Evaluation<'a>, EvaluationError> {
        if let Some(path) = &self.cycle {
            return Err(EvaluationError::CircularDependency { path: path.clone() });
        }

        let accessor = context.map(AttributeAccessor::new);
        let ctx = MatchContext {
            accessor,
            config_salt: &config.preferences.salt,
            context_salt: &self.key,
        };
        let mut diagnostic = None;

        for (index, rule) in self.rules.iter().enumerate() {
            match rule.matches(config, context, &ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!(target: "remote_flags",
                               key:display = self.key,
                               rule = index;
                               "targeting rule ignored: {err}");
                    diagnostic.get_or_insert(err);
                    continue;
                }
            }

            match &rule.outcome {
                CompiledOutcome::Served(selection) => {
                    return Ok(Evaluation {
                        selection,
                        matched_rule: Some(index),
                        matched_option: None,
                        diagnostic,
                    })
                }
                CompiledOutcome::PercentageOptions(options) => {
                    match self.select_option(options, accessor) {
                        Ok(Some((option, selection))) => {
                            return Ok(Evaluation {
                                selection,
                                matched_rule: Some(index),
                                matched_option: Some(option),
                                diagnostic,
                            })
                        }
                        // Falls through to the next rule, not to the default value.
                        Ok(None) => {}
                        Err(err) => {
                            log::warn!(target: "remote_flags",
                                       key:display = self.key,
                                       rule = index;
                                       "percentage options of targeting rule skipped: {err}");
                            diagnostic.get_or_insert(err);
                        }
                    }
                }
            }
        }

        if !self.percentage_options.is_empty() {
            match self.select_option(&self.percentage_options, accessor) {
                Ok(Some((option, selection))) => {
                    return Ok(Evaluation {
                        selection,
                        matched_rule: None,
                        matched_option: Some(option),
                        diagnostic,
                    })
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!(target: "remote_flags",
                               key:display = self.key;
                               "percentage options skipped: {err}");
                    diagnostic.get_or_insert(err);
                }
            }
        }

        Ok(Evaluation {
            selection: &self.default,
            matched_rule: None,
            matched_option: None,
            diagnostic,
        })
    }

    /// Pick the first option whose cumulative percentage exceeds the context's bucket.
    fn select_option<'s>(
        &self,
        options: &'s [CompiledOption],
        accessor: Option<AttributeAccessor>,
    ) -> Result<Option<(usize, &'s Selection)>, EvaluationError> {
        let accessor = accessor.ok_or(EvaluationError::NoEvaluationContext)?;
        let attribute = accessor.bucketing_bytes(&self.percentage_attribute)?;
        let bucket = sharder::bucket(self.key.as_bytes(), attribute);

        let mut cumulative = 0;
        for (index, option) in options.iter().enumerate() {
            cumulative += option.percentage;
            if bucket < cumulative {
                return Ok(Some((index, &option.selection)));
            }
        }
        Ok(None)
    }
}

impl CompiledRule {
    /// Conditions are ANDed and evaluated left to right; the first `false` or error stops.
    fn matches(
        &self,
        config: &CompiledConfig,
        context: Option<&dyn EvaluationContext>,
        ctx: &MatchContext,
    ) -> Result<bool, EvaluationError> {
        for condition in self.conditions.iter() {
            if !condition.matches(config, context, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl CompiledCondition {
    fn matches(
        &self,
        config: &CompiledConfig,
        context: Option<&dyn EvaluationContext>,
        ctx: &MatchContext,
    ) -> Result<bool, EvaluationError> {
        match self {
            CompiledCondition::User(matcher) => matcher.matches(ctx),
            CompiledCondition::Segment {
                name,
                matchers,
                comparator,
            } => {
                if ctx.accessor.is_none() {
                    return Err(EvaluationError::NoEvaluationContext);
                }
                let ctx = MatchContext {
                    context_salt: name,
                    ..*ctx
                };
                let mut in_segment = true;
                for matcher in matchers.iter() {
                    if !matcher.matches(&ctx)? {
                        in_segment = false;
                        break;
                    }
                }
                Ok(match comparator {
                    SegmentComparator::IsIn => in_segment,
                    SegmentComparator::IsNotIn => !in_segment,
                })
            }
            CompiledCondition::Prerequisite {
                key,
                target,
                comparator,
            } => {
                let (key_id, expected) = target.clone()?;
                let setting = config
                    .evaluators
                    .get(key_id)
                    .and_then(Option::as_ref)
                    .ok_or_else(|| EvaluationError::PrerequisiteNotFound {
                        key: key.to_string(),
                    })?;
                let actual = setting.evaluate(config, context)?.selection.value_id;
                Ok(match comparator {
                    PrerequisiteFlagComparator::Equals => actual == expected,
                    PrerequisiteFlagComparator::NotEquals => actual != expected,
                })
            }
        }
    }
}
