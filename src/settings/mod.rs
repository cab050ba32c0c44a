//! Settings model, compilation into evaluators, and evaluation.
mod compiled;
mod eval;
mod models;
mod rules;

pub(crate) use compiled::{CompiledConfig, CompiledSetting, ValueId};
pub use models::*;
