//! Typed access to entities.

use crate::Result;
use crate::row::Row;
use crate::value::Value;

/// A Rust type that maps onto one registered table.
///
/// Sessions store entities as column maps; a `Model` converts to and from
/// that representation so callers can work with plain structs.
///
/// ```ignore
/// struct Account { id: Option<i64>, owner: String, balance: f64 }
///
/// impl Model for Account {
///     const TABLE_NAME: &'static str = "accounts";
///
///     fn to_values(&self) -> Vec<(&'static str, Value)> {
///         vec![
///             ("id", self.id.into()),
///             ("owner", self.owner.clone().into()),
///             ("balance", self.balance.into()),
///         ]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_named("id")?,
///             owner: row.get_named("owner")?,
///             balance: row.get_named("balance")?,
///         })
///     }
/// }
/// ```
pub trait Model: Sized {
    /// The registered table this type maps to.
    const TABLE_NAME: &'static str;

    /// Column values. A NULL auto-increment key is left for the store to fill.
    fn to_values(&self) -> Vec<(&'static str, Value)>;

    /// Build from a row holding every column of the table.
    fn from_row(row: &Row) -> Result<Self>;
}
