//! Evaluation contexts backed by user-defined record types.
use std::{
    any::TypeId,
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock, RwLock},
};

use super::{AttributeValue, Attributes, EvaluationContext};

/// A record-like type whose named fields act as attributes.
///
/// Field names are declared once per type and compared case-sensitively with the attribute names
/// used in conditions. Names that match no field are looked up in [`Record::extra`].
///
/// ```
/// # use remote_flags::{AttributeValue, Record, RecordContext};
/// #[derive(Debug)]
/// struct Customer {
///     id: String,
///     plan: String,
///     seats: u32,
/// }
///
/// impl Record for Customer {
///     fn field_names() -> &'static [&'static str] {
///         &["Identifier", "Plan", "Seats"]
///     }
///
///     fn field(&self, index: usize) -> Option<AttributeValue> {
///         match index {
///             0 => Some(self.id.as_str().into()),
///             1 => Some(self.plan.as_str().into()),
///             2 => Some(f64::from(self.seats).into()),
///             _ => None,
///         }
///     }
/// }
///
/// let context = RecordContext(Customer { id: "c-1".into(), plan: "pro".into(), seats: 5 });
/// ```
pub trait Record: fmt::Debug + Send + Sync + 'static {
    /// Attribute names of the fields, in the order [`Record::field`] indexes them.
    fn field_names() -> &'static [&'static str]
    where
        Self: Sized;

    /// Value of the field at `index`.
    fn field(&self, index: usize) -> Option<AttributeValue>;

    /// Untyped attributes for names that are not declared fields.
    fn extra(&self) -> Option<&Attributes> {
        None
    }
}

/// Adapts a [`Record`] to the [`EvaluationContext`] capability.
#[derive(Debug, Clone)]
pub struct RecordContext<T>(pub T);

type FieldTable = HashMap<&'static str, usize>;

/// Per-type field tables. Append-only for the lifetime of the process.
fn field_tables() -> &'static RwLock<HashMap<TypeId, Arc<FieldTable>>> {
    static TABLES: OnceLock<RwLock<HashMap<TypeId, Arc<FieldTable>>>> = OnceLock::new();
    TABLES.get_or_init(Default::default)
}

fn field_table<T: Record>() -> Arc<FieldTable> {
    let type_id = TypeId::of::<T>();
    if let Some(table) = field_tables()
        .read()
        .ok()
        .and_then(|tables| tables.get(&type_id).cloned())
    {
        return table;
    }

    // Built outside of the write lock; a concurrent builder for the same type produces an
    // identical table, and the first one to insert wins.
    let table: FieldTable = T::field_names()
        .iter()
        .enumerate()
        .map(|(index, name)| (*name, index))
        .collect();
    let table = Arc::new(table);

    match field_tables().write() {
        Ok(mut tables) => tables.entry(type_id).or_insert(table).clone(),
        Err(_) => table,
    }
}

impl<T: Record> EvaluationContext for RecordContext<T> {
    fn attribute(&self, name: &str) -> Option<Cow<'_, AttributeValue>> {
        match field_table::<T>().get(name) {
            Some(&index) => self.0.field(index).map(Cow::Owned),
            None => self.0.extra()?.get(name).map(Cow::Borrowed),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::attributes::AttributeAccessor;

    #[derive(Debug)]
    struct Account {
        id: String,
        balance: f64,
        created: chrono::DateTime<Utc>,
        extra: Attributes,
    }

    impl Record for Account {
        fn field_names() -> &'static [&'static str] {
            &["Identifier", "Balance", "Created"]
        }

        fn field(&self, index: usize) -> Option<AttributeValue> {
            match index {
                0 => Some(self.id.as_str().into()),
                1 => Some(self.balance.into()),
                2 => Some(self.created.into()),
                _ => None,
            }
        }

        fn extra(&self) -> Option<&Attributes> {
            Some(&self.extra)
        }
    }

    fn account() -> RecordContext<Account> {
        RecordContext(Account {
            id: "acc-1".to_owned(),
            balance: 1234.5,
            created: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            extra: [("Tier".to_owned(), "gold".into())].into(),
        })
    }

    #[test]
    fn reads_declared_fields() {
        let context = account();
        let accessor = AttributeAccessor::new(&context);

        assert_eq!(accessor.text("Identifier").unwrap(), "acc-1");
        assert_eq!(accessor.text("Balance").unwrap(), "1234.5");
        assert_eq!(accessor.unix_seconds("Created").unwrap(), 1_600_000_000.0);
    }

    #[test]
    fn field_names_are_case_sensitive() {
        let context = account();
        assert!(context.attribute("identifier").is_none());
    }

    #[test]
    fn falls_back_to_extra_attributes() {
        let context = account();
        let accessor = AttributeAccessor::new(&context);
        assert_eq!(accessor.text("Tier").unwrap(), "gold");
        assert!(accessor.text("Unknown").is_err());
    }

    #[test]
    fn field_table_is_cached_per_type() {
        let first = field_table::<Account>();
        let second = field_table::<Account>();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
