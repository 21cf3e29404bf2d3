use std::collections::BTreeMap;

use crate::error::ServerFault;
use crate::protocol::{CellValue, RowVersion};

/// Row identity. Positive ids are persisted server records; negative ids are
/// locally created rows that have not been saved yet.
pub type RowId = i64;

/// Snapshot of one mirrored row.
///
/// Rows handed out by a table are detached copies: edit the snapshot with
/// [`Row::set`] and pass it back to `Table::save` to persist the change. The
/// `values` map holds the current (possibly dirty) cells; `orig` holds the
/// last server-confirmed state.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) id: RowId,
    pub(crate) version: RowVersion,
    pub(crate) values: BTreeMap<String, CellValue>,
    pub(crate) orig: BTreeMap<String, CellValue>,
    pub(crate) last_error: Option<ServerFault>,
}

impl Row {
    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn version(&self) -> &RowVersion {
        &self.version
    }

    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }

    /// The current value of a column, or `None` if no value has been set.
    /// A column with no value is distinct from one explicitly set to
    /// [`CellValue::Null`].
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }

    pub fn set(&mut self, column: &str, value: CellValue) {
        self.values.insert(column.to_string(), value);
    }

    /// Remove a column's value so a subsequent insert falls back to the
    /// server default.
    pub fn clear(&mut self, column: &str) {
        self.values.remove(column);
    }

    /// The last server-confirmed value of a column.
    pub fn original(&self, column: &str) -> Option<&CellValue> {
        self.orig.get(column)
    }

    pub fn values(&self) -> &BTreeMap<String, CellValue> {
        &self.values
    }

    pub fn is_dirty(&self) -> bool {
        self.values != self.orig
    }

    /// The managed fault of the most recent failed action on this row.
    pub fn last_error(&self) -> Option<&ServerFault> {
        self.last_error.as_ref()
    }
}
