//! Row reconciliation.
//!
//! `merge_rows` folds a decoded server response into the cached row set,
//! either as the initial snapshot (`requery_ids` is `None`) or as a delta
//! merge after a change notification. The invariants enforced here carry the
//! whole engine: one row per id, versions never move backwards, and stale
//! responses are discarded without a trace.

use std::collections::HashMap;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{CellValue, ColumnMeta, Record, RowVersion, ID_FIELD, VERSION_FIELD};

use super::row::{Row, RowId};

/// A cached row plus its action guard. At most one save/delete may be in
/// flight per row; the guard rejects a second rather than queuing it. The
/// guard carries the ticket of the action that armed it, so a finishing
/// action only releases its own guard.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub row: Row,
    pub pending: Option<u64>,
}

/// The authoritative client-side row set: an ordered sequence plus an
/// id index that are kept consistent at all times.
#[derive(Debug, Default)]
pub(crate) struct RowSet {
    order: Vec<RowId>,
    entries: HashMap<RowId, CacheEntry>,
}

/// One observed cache mutation, reported to change listeners as
/// (old-or-none, new-or-none).
#[derive(Debug)]
pub(crate) struct RowChange {
    pub old: Option<Row>,
    pub new: Option<Row>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, id: RowId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: RowId) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: RowId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&id)
    }

    pub fn push(&mut self, row: Row) {
        let id = row.id;
        self.order.push(id);
        self.entries.insert(id, CacheEntry { row, pending: None });
    }

    pub fn insert_at(&mut self, position: usize, row: Row) {
        let id = row.id;
        self.order.insert(position.min(self.order.len()), id);
        self.entries.insert(id, CacheEntry { row, pending: None });
    }

    /// Replace the row cached under `id` in place, keeping its position and
    /// an armed action guard: a merge landing during an in-flight save must
    /// not admit a second action on the row.
    pub fn replace(&mut self, id: RowId, row: Row) -> Option<Row> {
        match self.entries.get_mut(&id) {
            Some(entry) => Some(std::mem::replace(&mut entry.row, row)),
            None => {
                self.entries.insert(id, CacheEntry { row, pending: None });
                None
            }
        }
    }

    /// Remove a row, returning it and the position it held.
    pub fn remove(&mut self, id: RowId) -> Option<(usize, Row)> {
        let entry = self.entries.remove(&id)?;
        let position = self
            .order
            .iter()
            .position(|&other| other == id)
            .expect("row order out of sync with index");
        self.order.remove(position);
        Some((position, entry.row))
    }

    pub fn snapshot(&self) -> Vec<Row> {
        self.order
            .iter()
            .map(|id| self.entries[id].row.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Validate one wire row and detach it from the raw record: the reserved
/// identity/version fields are lifted out and every visible column must be
/// present.
pub(crate) fn parse_wire_row(mut record: Record, columns: &[ColumnMeta]) -> SyncResult<Row> {
    let id = match record.remove(ID_FIELD) {
        Some(CellValue::Int(id)) if id >= 1 => id,
        _ => return Err(SyncError::InvalidData("invalid row id found".to_string())),
    };
    let version = match record.remove(VERSION_FIELD) {
        Some(CellValue::Text(s)) => RowVersion::parse(&s)
            .map_err(|_| SyncError::InvalidData("invalid row version found".to_string()))?,
        _ => return Err(SyncError::InvalidData("invalid row version found".to_string())),
    };

    let mut values = std::collections::BTreeMap::new();
    for column in columns {
        let value = record.remove(&column.name).ok_or_else(|| {
            SyncError::InvalidData(format!("value for column '{}' not found", column.name))
        })?;
        values.insert(column.name.clone(), value);
    }

    Ok(Row {
        id,
        version,
        orig: values.clone(),
        values,
        last_error: None,
    })
}

/// Fold incoming rows into the set.
///
/// Initial load (`requery_ids` is `None`): every id must be new.
///
/// Delta merge: every incoming id must be listed in `requery_ids` and is
/// consumed from it; an incoming row whose version is not strictly greater
/// than the cached one is discarded as stale. Ids left over in `requery_ids`
/// were re-queried but not returned, which means they were deleted (or never
/// visible through the filter) and are removed from the cache.
pub(crate) fn merge_rows(
    set: &mut RowSet,
    incoming: Vec<Row>,
    mut requery_ids: Option<Vec<RowId>>,
) -> SyncResult<Vec<RowChange>> {
    let mut changes = Vec::new();

    for row in incoming {
        let id = row.id;
        match requery_ids.as_mut() {
            None => {
                if set.contains(id) {
                    return Err(SyncError::InvalidData(format!("duplicate id #{} found", id)));
                }
                set.push(row.clone());
                changes.push(RowChange {
                    old: None,
                    new: Some(row),
                });
            }
            Some(expected) => {
                let position = expected.iter().position(|&e| e == id).ok_or_else(|| {
                    SyncError::InvalidData(format!("duplicate or unrequested id #{} found", id))
                })?;
                expected.swap_remove(position);

                match set.get(id) {
                    Some(existing) => {
                        if existing.row.version >= row.version {
                            // Stale response, drop it silently.
                            continue;
                        }
                        let old = set.replace(id, row.clone());
                        changes.push(RowChange {
                            old,
                            new: Some(row),
                        });
                    }
                    None => {
                        set.push(row.clone());
                        changes.push(RowChange {
                            old: None,
                            new: Some(row),
                        });
                    }
                }
            }
        }
    }

    if let Some(deleted) = requery_ids {
        for id in deleted {
            if let Some((_, old)) = set.remove(id) {
                changes.push(RowChange {
                    old: Some(old),
                    new: None,
                });
            }
        }
    }

    Ok(changes)
}
