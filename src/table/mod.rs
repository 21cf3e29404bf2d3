//! Table Cache.
//!
//! One `Table` mirrors a named server table (optionally restricted by a row
//! filter) on the client: it queries the column metadata once, loads the row
//! snapshot, subscribes to the notification bus, and reconciles local
//! optimistic edits, server confirmations and externally-pushed version
//! updates into one consistent row set.

mod merge;
mod row;

pub use row::{Row, RowId};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::command::{CommandExecutor, Statement};
use crate::error::{ServerFault, SyncError, SyncResult};
use crate::notify::{NotificationBus, Subscription, SubscriptionId};
use crate::protocol::{
    CellValue, ChangeEvents, ColumnMeta, Record, RowVersion, ID_COLUMN, ID_FIELD, VERSION_COLUMN,
};

use merge::{merge_rows, parse_wire_row, RowChange, RowSet};

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+$").unwrap());
static WHERE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*WHERE(\s|$)").unwrap());

const COLUMN_METADATA_QUERY: &str = "SELECT\n  \
     c.column_id AS id,\n  \
     c.name,\n  \
     t.name AS type,\n  \
     c.max_length AS maxLength,\n  \
     c.precision,\n  \
     c.scale,\n  \
     CASE WHEN c.is_nullable = 1 THEN 0 ELSE 1 END AS required,\n  \
     object_definition(c.default_object_id) AS defaultValue,\n  \
     CASE WHEN HAS_PERMS_BY_NAME(@Table,'OBJECT','UPDATE',c.name,'COLUMN') = 1 THEN 0 ELSE 1 END AS readOnly,\n  \
     OBJECT_NAME(f.referenced_object_id) AS referencedTable\n\
     FROM\n  \
     sys.columns AS c\n  \
     JOIN\n  \
     sys.types AS t ON c.user_type_id = t.user_type_id\n  \
     LEFT OUTER JOIN\n  \
     sys.foreign_key_columns AS f ON f.parent_object_id = c.object_id AND f.parent_column_id = c.column_id\n\
     WHERE\n  \
     c.object_id = OBJECT_ID(@Table) AND\n  \
     HAS_PERMS_BY_NAME(@Table,'OBJECT','SELECT',c.name,'COLUMN') = 1 AND\n  \
     c.is_computed = 0\n\
     ORDER BY c.column_id";

/// Message carried by the optimistic-concurrency conflict fault.
const CONFLICT_MESSAGE: &str = "row changed or already deleted";

const FILTER_VIOLATION_MESSAGE: &str = "the row violates the table filter";

type ChangeListener = Arc<dyn Fn(Option<Row>, Option<Row>) + Send + Sync>;

/// Handle identifying one registered change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

#[derive(Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(SyncError),
}

struct TableState {
    disposed: bool,
    columns: Vec<ColumnMeta>,
    base_query: String,
    next_local_id: RowId,
    next_action_id: u64,
    rows: RowSet,
    listeners: Vec<(u64, ChangeListener)>,
    next_listener_id: u64,
    subscription: Option<SubscriptionId>,
}

struct TableShared {
    name: String,
    filter: Option<String>,
    executor: Arc<CommandExecutor>,
    bus: NotificationBus,
    dispose: CancelToken,
    ready_tx: watch::Sender<ReadyState>,
    ready_rx: watch::Receiver<ReadyState>,
    state: Mutex<TableState>,
}

/// Live, editable mirror of one server table.
#[derive(Clone)]
pub struct Table {
    shared: Arc<TableShared>,
}

impl Table {
    /// Create a table mirror and start its construction protocol in the
    /// background. Await [`Table::ready`] before reading rows.
    pub fn open(
        executor: Arc<CommandExecutor>,
        bus: &NotificationBus,
        name: &str,
        filter: Option<&str>,
    ) -> SyncResult<Self> {
        if !NAME_RE.is_match(name) {
            return Err(SyncError::argument(
                "name",
                "the table name must be a simple identifier",
            ));
        }
        if let Some(filter) = filter {
            if filter.is_empty() || WHERE_PREFIX_RE.is_match(filter) {
                return Err(SyncError::argument(
                    "filter",
                    "the filter must be a predicate without a WHERE prefix",
                ));
            }
        }

        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        let shared = Arc::new(TableShared {
            name: name.to_string(),
            filter: filter.map(|f| f.to_string()),
            executor,
            bus: bus.clone(),
            dispose: CancelToken::new(),
            ready_tx,
            ready_rx,
            state: Mutex::new(TableState {
                disposed: false,
                columns: Vec::new(),
                base_query: String::new(),
                next_local_id: -1,
                next_action_id: 1,
                rows: RowSet::default(),
                listeners: Vec::new(),
                next_listener_id: 0,
                subscription: None,
            }),
        });

        let init = shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = init.dispose.cancelled() => return,
                _ = init.bus.ready() => {}
            }
            match initialize(&init).await {
                Ok(()) => {
                    debug!(table = %init.name, "table ready");
                    let _ = init.ready_tx.send(ReadyState::Ready);
                }
                Err(err) => {
                    if !init.dispose.is_cancelled() {
                        error!(table = %init.name, "table initialization failed: {}", err);
                    }
                    let _ = init.ready_tx.send(ReadyState::Failed(err));
                }
            }
        });

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn filter(&self) -> Option<&str> {
        self.shared.filter.as_deref()
    }

    /// Resolves once the initial snapshot is merged and all events buffered
    /// during construction are replayed, or with the construction error.
    pub async fn ready(&self) -> SyncResult<()> {
        let mut rx = self.shared.ready_rx.clone();
        let state = rx
            .wait_for(|state| !matches!(state, ReadyState::Pending))
            .await
            .map_err(|_| SyncError::ObjectDisposed(format!("table {}", self.shared.name)))?;
        match &*state {
            ReadyState::Ready => Ok(()),
            ReadyState::Failed(err) => Err(err.clone()),
            ReadyState::Pending => unreachable!(),
        }
    }

    /// The visible column descriptors, invariant once the table is ready.
    pub fn columns(&self) -> SyncResult<Vec<ColumnMeta>> {
        let state = self.guarded()?;
        Ok(state.columns.clone())
    }

    /// Snapshot of the current row sequence.
    pub fn rows(&self) -> SyncResult<Vec<Row>> {
        let state = self.guarded()?;
        Ok(state.rows.snapshot())
    }

    pub fn get_by_id(&self, id: RowId) -> SyncResult<Option<Row>> {
        let state = self.guarded()?;
        Ok(state.rows.get(id).map(|entry| entry.row.clone()))
    }

    /// Create a local row with a temporary negative id. The row exists only
    /// client-side until it is saved.
    pub fn new_row(&self, template: Option<BTreeMap<String, CellValue>>) -> SyncResult<Row> {
        let mut state = self.guarded_mut()?;

        let values = template.unwrap_or_default();
        for column in values.keys() {
            if !state.columns.iter().any(|c| &c.name == column) {
                return Err(SyncError::argument(
                    "template",
                    format!("unknown column '{}'", column),
                ));
            }
        }

        let id = state.next_local_id;
        state.next_local_id -= 1;

        let row = Row {
            id,
            version: RowVersion::zero(),
            values,
            orig: BTreeMap::new(),
            last_error: None,
        };
        state.rows.push(row.clone());
        let listeners = listeners_of(&state);
        drop(state);

        dispatch(
            &listeners,
            vec![RowChange {
                old: None,
                new: Some(row.clone()),
            }],
        );
        Ok(row)
    }

    /// Persist a row: an insert for never-saved rows (negative id), an
    /// optimistic-concurrency update otherwise. Returns the row as confirmed.
    pub async fn save(&self, row: &Row) -> SyncResult<Row> {
        let begun = self.begin_action(row)?;
        if row.id < 0 {
            self.insert_row(row, begun).await
        } else {
            self.update_row(row, begun).await
        }
    }

    /// Delete a row. Never-persisted rows are removed locally; persisted rows
    /// go through an optimistic-concurrency delete. With `keep_error`, a
    /// managed fault is recorded on the cached row for display.
    pub async fn delete(&self, row: &Row, keep_error: bool) -> SyncResult<()> {
        let begun = self.begin_action(row)?;

        if row.id < 0 {
            let mut state = self.shared.state.lock().unwrap();
            let removed = state.rows.remove(row.id).map(|(_, old)| old);
            let listeners = listeners_of(&state);
            drop(state);
            if let Some(old) = removed {
                dispatch(
                    &listeners,
                    vec![RowChange {
                        old: Some(old),
                        new: None,
                    }],
                );
            }
            return Ok(());
        }

        let statement = Statement::new(
            format!("delete row from table {}", self.shared.name),
            format!(
                "DELETE FROM dbo.{} WHERE ID = @ID AND Version = @Version",
                self.shared.name
            ),
        )
        .param("ID", CellValue::Int(row.id))
        .param("Version", CellValue::Text(begun.version.as_str().to_string()))
        .allow_review()
        .allow_error()
        .cancel_on(self.shared.dispose.clone());

        match self.shared.executor.non_query(statement).await {
            Ok(affected) if affected != 0 => {
                let mut state = self.shared.state.lock().unwrap();
                if state.disposed {
                    return Ok(());
                }
                // The cached row may have been replaced by a merge in the
                // meantime; whatever currently holds this id is gone now.
                let removed = state.rows.remove(row.id).map(|(_, old)| old);
                let listeners = listeners_of(&state);
                drop(state);
                if let Some(old) = removed {
                    dispatch(
                        &listeners,
                        vec![RowChange {
                            old: Some(old),
                            new: None,
                        }],
                    );
                }
                Ok(())
            }
            Ok(_) => {
                let fault = ServerFault::local(
                    CONFLICT_MESSAGE,
                    Some(self.shared.name.clone()),
                    None,
                );
                self.finish_action(row.id, begun.ticket, keep_error.then(|| fault.clone()));
                Err(SyncError::Server(fault))
            }
            Err(err) => {
                let fault = match (&err, keep_error) {
                    (SyncError::Server(fault), true) => Some(fault.clone()),
                    _ => None,
                };
                self.finish_action(row.id, begun.ticket, fault);
                Err(err)
            }
        }
    }

    /// Register a change listener. Listeners are invoked on a fresh scheduler
    /// tick with (old-or-none, new-or-none) snapshots, independently of one
    /// another.
    pub fn add_change_listener<F>(&self, listener: F) -> SyncResult<ListenerHandle>
    where
        F: Fn(Option<Row>, Option<Row>) + Send + Sync + 'static,
    {
        let mut state = self.guarded_mut()?;
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        Ok(ListenerHandle(id))
    }

    /// Remove a change listener. Returns false if the handle is unknown.
    pub fn remove_change_listener(&self, handle: ListenerHandle) -> SyncResult<bool> {
        let mut state = self.guarded_mut()?;
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != handle.0);
        Ok(state.listeners.len() != before)
    }

    /// Dispose the table: cancel in-flight statements, unsubscribe from the
    /// bus and discard the row index. All further calls fault with
    /// [`SyncError::ObjectDisposed`].
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.disposed {
            return;
        }
        state.disposed = true;
        let subscription = state.subscription.take();
        state.rows.clear();
        state.listeners.clear();
        state.columns.clear();
        drop(state);

        self.shared.dispose.cancel("the table is no longer in use");
        if let Some(id) = subscription {
            self.shared.bus.unsubscribe(id);
        }
        debug!(table = %self.shared.name, "table disposed");
    }

    fn guarded(&self) -> SyncResult<std::sync::MutexGuard<'_, TableState>> {
        let state = self.shared.state.lock().unwrap();
        if state.disposed {
            return Err(SyncError::ObjectDisposed(format!(
                "table {}",
                self.shared.name
            )));
        }
        Ok(state)
    }

    fn guarded_mut(&self) -> SyncResult<std::sync::MutexGuard<'_, TableState>> {
        self.guarded()
    }

    /// Validate a row handle and arm its action guard. The returned ticket
    /// identifies the action; only its holder may release the guard again.
    fn begin_action(&self, row: &Row) -> SyncResult<BegunAction> {
        let mut state = self.guarded_mut()?;
        let name = self.shared.name.clone();
        let ticket = state.next_action_id;
        state.next_action_id += 1;
        let entry = state.rows.get_mut(row.id).ok_or_else(|| {
            SyncError::argument("row", "the row is not (or no longer) in the table")
        })?;
        if entry.pending.is_some() {
            return Err(SyncError::InvalidOperation(
                "another action is already active for this row".to_string(),
            ));
        }
        entry.pending = Some(ticket);
        // Expose the caller's edits as the row's current (dirty) values.
        entry.row.values = row.values.clone();
        let begun = BegunAction {
            ticket,
            version: entry.row.version.clone(),
            orig: entry.row.orig.clone(),
            columns: state.columns.clone(),
        };
        debug!(table = %name, row = row.id, "row action started");
        Ok(begun)
    }

    /// Clear the action guard, if the finishing action still owns it, and
    /// optionally record a managed fault on the cached row. The entry under
    /// this id may have been deleted and re-created by a merge in the
    /// meantime; a guard armed by someone else stays armed.
    fn finish_action(&self, id: RowId, ticket: u64, fault: Option<ServerFault>) {
        let mut state = self.shared.state.lock().unwrap();
        if state.disposed {
            return;
        }
        if let Some(entry) = state.rows.get_mut(id) {
            if entry.pending == Some(ticket) {
                entry.pending = None;
                if fault.is_some() {
                    entry.row.last_error = fault;
                }
            }
        }
    }

    async fn insert_row(&self, row: &Row, begun: BegunAction) -> SyncResult<Row> {
        let name = &self.shared.name;

        // Columns with an explicit value are written; the rest must fall back
        // to a server default.
        let mut written: Vec<String> = Vec::new();
        for column in &begun.columns {
            if row.values.contains_key(&column.name) {
                written.push(column.name.clone());
            } else if column.required && !column.has_default {
                let fault = ServerFault::local(
                    format!("column '{}' requires a value", column.name),
                    Some(name.clone()),
                    Some(column.name.clone()),
                );
                self.finish_action(row.id, begun.ticket, Some(fault.clone()));
                return Err(SyncError::Server(fault));
            }
        }

        let values_clause = if written.is_empty() {
            "DEFAULT VALUES".to_string()
        } else {
            format!(
                "({})\nVALUES (@{})",
                written.join(", "),
                written.join(", @")
            )
        };
        let filter_check = match &self.shared.filter {
            Some(filter) => format!(
                "    IF NOT EXISTS (SELECT * FROM dbo.{} WHERE ID = SCOPE_IDENTITY() AND ({})) RAISERROR('{} [APP][{}]', 16, 1)\n",
                name, filter, FILTER_VIOLATION_MESSAGE, name
            ),
            None => String::new(),
        };
        let text = format!(
            "INSERT INTO dbo.{} {}\nIF @@ERROR = 0\nBEGIN\n    SELECT SCOPE_IDENTITY() AS [$id]\n{}END",
            name, values_clause, filter_check
        );

        let mut statement = Statement::new(format!("insert row into table {}", name), text)
            .single_result_set()
            .allow_review()
            .allow_error()
            .cancel_on(self.shared.dispose.clone());
        for column in &written {
            statement = statement.param(column, row.values[column].clone());
        }

        match self.shared.executor.batch(statement).await {
            Ok(sets) => {
                let set = &sets[0];
                if set.affected_rows == 0 {
                    self.finish_action(row.id, begun.ticket, None);
                    return Err(SyncError::InvalidOperation(
                        "the row was not written despite a successful statement".to_string(),
                    ));
                }
                let new_id = set
                    .rows
                    .first()
                    .and_then(|record| record.get(ID_FIELD))
                    .and_then(CellValue::as_int)
                    .filter(|&id| id >= 1)
                    .ok_or_else(|| {
                        self.finish_action(row.id, begun.ticket, None);
                        SyncError::InvalidData(
                            "the generated identity value is invalid".to_string(),
                        )
                    })?;

                let mut state = self.shared.state.lock().unwrap();
                if state.disposed {
                    return Err(SyncError::ObjectDisposed(format!("table {}", name)));
                }

                let mut changes = Vec::new();
                let position = match state.rows.remove(row.id) {
                    Some((position, old)) => {
                        changes.push(RowChange {
                            old: Some(old),
                            new: None,
                        });
                        position
                    }
                    None => state.rows.len(),
                };

                // Advance the confirmed snapshot for the written columns; the
                // version catches up through the change feed.
                let mut orig = begun.orig;
                for column in &written {
                    orig.insert(column.clone(), row.values[column].clone());
                }
                let saved = Row {
                    id: new_id,
                    version: row.version.clone(),
                    values: row.values.clone(),
                    orig,
                    last_error: None,
                };

                // A racing notification may already have materialized the row
                // under its final id; in that case the merged row wins.
                let result = if state.rows.contains(new_id) {
                    state.rows.get(new_id).unwrap().row.clone()
                } else {
                    state.rows.insert_at(position, saved.clone());
                    changes.push(RowChange {
                        old: None,
                        new: Some(saved.clone()),
                    });
                    saved
                };

                let listeners = listeners_of(&state);
                drop(state);
                dispatch(&listeners, changes);
                Ok(result)
            }
            Err(err) => {
                let fault = match &err {
                    SyncError::Server(fault) => Some(fault.clone()),
                    _ => None,
                };
                self.finish_action(row.id, begun.ticket, fault);
                Err(err)
            }
        }
    }

    async fn update_row(&self, row: &Row, begun: BegunAction) -> SyncResult<Row> {
        let name = &self.shared.name;

        let changed: Vec<String> = begun
            .columns
            .iter()
            .filter(|column| {
                row.values.get(&column.name).is_some()
                    && row.values.get(&column.name) != begun.orig.get(&column.name)
            })
            .map(|column| column.name.clone())
            .collect();

        if changed.is_empty() {
            // Nothing to persist, but listeners still observe a self change.
            let mut state = self.shared.state.lock().unwrap();
            let snapshot = match state.rows.get_mut(row.id) {
                Some(entry) => {
                    if entry.pending == Some(begun.ticket) {
                        entry.pending = None;
                        entry.row.last_error = None;
                    }
                    entry.row.clone()
                }
                None => row.clone(),
            };
            let listeners = listeners_of(&state);
            drop(state);
            dispatch(
                &listeners,
                vec![RowChange {
                    old: Some(snapshot.clone()),
                    new: Some(snapshot.clone()),
                }],
            );
            return Ok(snapshot);
        }

        let assignments: Vec<String> = changed
            .iter()
            .map(|column| format!("{} = @{}", column, column))
            .collect();
        let filter_check = match &self.shared.filter {
            Some(filter) => format!(
                ";\nIF @@ROWCOUNT > 0 AND NOT EXISTS (SELECT * FROM dbo.{} WHERE ID = @ID AND ({})) RAISERROR('{} [APP][{}]', 16, 1)",
                name, filter, FILTER_VIOLATION_MESSAGE, name
            ),
            None => String::new(),
        };
        let text = format!(
            "UPDATE dbo.{}\nSET {}\nWHERE ID = @ID AND Version = @Version{}",
            name,
            assignments.join(", "),
            filter_check
        );

        let mut statement = Statement::new(format!("update row in table {}", name), text)
            .param("ID", CellValue::Int(row.id))
            .param("Version", CellValue::Text(begun.version.as_str().to_string()))
            .allow_review()
            .allow_error()
            .cancel_on(self.shared.dispose.clone());
        for column in &changed {
            statement = statement.param(column, row.values[column].clone());
        }

        match self.shared.executor.non_query(statement).await {
            Ok(affected) if affected != 0 => {
                let mut state = self.shared.state.lock().unwrap();
                if state.disposed {
                    return Err(SyncError::ObjectDisposed(format!("table {}", name)));
                }
                let mut change = None;
                let snapshot = match state.rows.get_mut(row.id) {
                    // Only touch the cached row if it is still the one we
                    // sent; a newer merged row must not be overwritten.
                    Some(entry) if entry.row.version == begun.version => {
                        for column in &changed {
                            entry
                                .row
                                .orig
                                .insert(column.clone(), row.values[column].clone());
                        }
                        entry.row.last_error = None;
                        if entry.pending == Some(begun.ticket) {
                            entry.pending = None;
                        }
                        let snapshot = entry.row.clone();
                        change = Some(RowChange {
                            old: Some(snapshot.clone()),
                            new: Some(snapshot.clone()),
                        });
                        snapshot
                    }
                    Some(entry) => {
                        if entry.pending == Some(begun.ticket) {
                            entry.pending = None;
                        }
                        entry.row.clone()
                    }
                    None => row.clone(),
                };
                let listeners = listeners_of(&state);
                drop(state);
                if let Some(change) = change {
                    dispatch(&listeners, vec![change]);
                }
                Ok(snapshot)
            }
            Ok(_) => {
                let fault = ServerFault::local(
                    CONFLICT_MESSAGE,
                    Some(name.clone()),
                    None,
                );
                self.finish_action(row.id, begun.ticket, Some(fault.clone()));
                Err(SyncError::Server(fault))
            }
            Err(err) => {
                let fault = match &err {
                    SyncError::Server(fault) => Some(fault.clone()),
                    _ => None,
                };
                self.finish_action(row.id, begun.ticket, fault);
                Err(err)
            }
        }
    }
}

/// Data captured under the state lock when a row action starts.
struct BegunAction {
    ticket: u64,
    version: RowVersion,
    orig: BTreeMap<String, CellValue>,
    columns: Vec<ColumnMeta>,
}

fn listeners_of(state: &TableState) -> Vec<ChangeListener> {
    state.listeners.iter().map(|(_, l)| l.clone()).collect()
}

/// Deliver changes to listeners on fresh scheduler ticks, one task per
/// listener per change, never synchronously inside the triggering call.
fn dispatch(listeners: &[ChangeListener], changes: Vec<RowChange>) {
    for change in changes {
        for listener in listeners {
            let listener = listener.clone();
            let old = change.old.clone();
            let new = change.new.clone();
            tokio::spawn(async move {
                listener(old, new);
            });
        }
    }
}

/// Construction protocol, run once the bus has seen its first sync.
async fn initialize(shared: &Arc<TableShared>) -> SyncResult<()> {
    let name = &shared.name;

    // Column metadata is fetched once and invariant thereafter.
    let records = shared
        .executor
        .query(
            Statement::new(
                format!("query column definitions of table {}", name),
                COLUMN_METADATA_QUERY,
            )
            .param("Table", CellValue::Text(format!("dbo.{}", name)))
            .cancel_on(shared.dispose.clone()),
        )
        .await?;

    if records.is_empty() {
        return Err(SyncError::Unauthorized(format!(
            "no visible columns in table {}",
            name
        )));
    }
    let all_columns: Vec<ColumnMeta> = records
        .into_iter()
        .map(parse_column_meta)
        .collect::<SyncResult<_>>()?;
    if all_columns.first().map(|c| c.name.as_str()) != Some(ID_COLUMN) {
        return Err(SyncError::InvalidData(format!(
            "the first visible column of {} is not '{}'",
            name, ID_COLUMN
        )));
    }
    if all_columns.last().map(|c| c.name.as_str()) != Some(VERSION_COLUMN) {
        return Err(SyncError::InvalidData(format!(
            "the last visible column of {} is not '{}'",
            name, VERSION_COLUMN
        )));
    }
    let columns: Vec<ColumnMeta> = all_columns[1..all_columns.len() - 1].to_vec();

    let column_list = columns
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut base_query = format!(
        "SELECT {}{}ID AS [$id], Version AS [$version]\nFROM dbo.{}",
        column_list,
        if column_list.is_empty() { "" } else { ", " },
        name
    );
    if let Some(filter) = &shared.filter {
        base_query.push_str(&format!("\nWHERE ({})", filter));
    }

    // Subscribe before the initial row query; events received in between are
    // buffered in the subscription channel and replayed afterwards.
    let subscription = shared.bus.subscribe();
    {
        let mut state = shared.state.lock().unwrap();
        if state.disposed {
            shared.bus.unsubscribe(subscription.id);
            return Err(SyncError::ObjectDisposed(format!("table {}", name)));
        }
        state.subscription = Some(subscription.id);
        state.columns = columns.clone();
        state.base_query = base_query.clone();
    }

    let records = shared
        .executor
        .query(
            Statement::new(
                format!(
                    "query {} rows of table {}",
                    if shared.filter.is_some() { "filtered" } else { "all" },
                    name
                ),
                base_query,
            )
            .cancel_on(shared.dispose.clone()),
        )
        .await?;

    let incoming = records
        .into_iter()
        .map(|record| parse_wire_row(record, &columns))
        .collect::<SyncResult<Vec<_>>>()?;

    {
        let mut state = shared.state.lock().unwrap();
        if state.disposed {
            return Err(SyncError::ObjectDisposed(format!("table {}", name)));
        }
        let changes = merge_rows(&mut state.rows, incoming, None)?;
        let listeners = listeners_of(&state);
        drop(state);
        dispatch(&listeners, changes);
    }

    let events = shared.clone();
    tokio::spawn(async move {
        handle_events(events, subscription).await;
    });

    Ok(())
}

fn parse_column_meta(mut record: Record) -> SyncResult<ColumnMeta> {
    let invalid =
        |field: &str| SyncError::InvalidData(format!("column descriptor field '{}' is invalid", field));

    let mut int_field = |field: &str| -> SyncResult<i64> {
        record
            .remove(field)
            .and_then(|v| v.as_int())
            .ok_or_else(|| invalid(field))
    };
    let id = int_field("id")?;
    let max_length = int_field("maxLength")?;
    let precision = int_field("precision")?;
    let scale = int_field("scale")?;

    let mut flag_field = |field: &str| -> SyncResult<bool> {
        record
            .remove(field)
            .and_then(|v| v.as_flag())
            .ok_or_else(|| invalid(field))
    };
    let required = flag_field("required")?;
    let read_only = flag_field("readOnly")?;

    let name = match record.remove("name") {
        Some(CellValue::Text(s)) => s,
        _ => return Err(invalid("name")),
    };
    let column_type = match record.remove("type") {
        Some(CellValue::Text(s)) => s,
        _ => return Err(invalid("type")),
    };
    let has_default = match record.remove("defaultValue") {
        Some(value) => !value.is_null(),
        None => return Err(invalid("defaultValue")),
    };
    let referenced_table = match record.remove("referencedTable") {
        Some(CellValue::Text(s)) => Some(s),
        Some(CellValue::Null) => None,
        _ => return Err(invalid("referencedTable")),
    };

    Ok(ColumnMeta {
        id,
        name,
        column_type,
        max_length,
        precision,
        scale,
        required,
        has_default,
        read_only,
        referenced_table,
    })
}

/// Consume change-feed payloads for this table: coalesce every immediately
/// available event per id, re-query the affected rows in one batch, and merge
/// the response so rows that came back empty count as deletions.
async fn handle_events(shared: Arc<TableShared>, mut subscription: Subscription) {
    loop {
        let first = tokio::select! {
            _ = shared.dispose.cancelled() => return,
            payload = subscription.events.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
        };

        let mut announced: HashMap<RowId, Option<RowVersion>> = HashMap::new();
        coalesce(&mut announced, &shared.name, &first);
        while let Ok(payload) = subscription.events.try_recv() {
            coalesce(&mut announced, &shared.name, &payload);
        }
        if announced.is_empty() {
            continue;
        }

        let requery_ids: Vec<RowId> = {
            let state = shared.state.lock().unwrap();
            if state.disposed {
                return;
            }
            announced
                .iter()
                .filter(|(id, version)| match version {
                    // Deleted or unknown: re-check only rows we hold.
                    None => state.rows.contains(**id),
                    // Re-query if the row is missing locally or older than
                    // announced.
                    Some(version) => match state.rows.get(**id) {
                        Some(entry) => entry.row.version < *version,
                        None => true,
                    },
                })
                .map(|(id, _)| *id)
                .collect()
        };
        if requery_ids.is_empty() {
            continue;
        }

        let (base_query, columns) = {
            let state = shared.state.lock().unwrap();
            (state.base_query.clone(), state.columns.clone())
        };
        let id_list = requery_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let text = format!(
            "{}{}ID IN ({})",
            base_query,
            if shared.filter.is_some() { " AND " } else { "\nWHERE " },
            id_list
        );

        let result = shared
            .executor
            .query(
                Statement::new(
                    format!("query changed rows of table {}", shared.name),
                    text,
                )
                .cancel_on(shared.dispose.clone()),
            )
            .await;

        let records = match result {
            Ok(records) => records,
            Err(SyncError::Cancelled(_)) => return,
            Err(err) => {
                error!(table = %shared.name, "re-query of changed rows failed: {}", err);
                return;
            }
        };

        let merged = (|| -> SyncResult<()> {
            let incoming = records
                .into_iter()
                .map(|record| parse_wire_row(record, &columns))
                .collect::<SyncResult<Vec<_>>>()?;
            let mut state = shared.state.lock().unwrap();
            if state.disposed {
                return Ok(());
            }
            let changes = merge_rows(&mut state.rows, incoming, Some(requery_ids))?;
            let listeners = listeners_of(&state);
            drop(state);
            dispatch(&listeners, changes);
            Ok(())
        })();

        if let Err(err) = merged {
            error!(table = %shared.name, "merge of changed rows failed: {}", err);
            return;
        }
    }
}

/// Fold one bus payload into the announced-version map. A null announcement
/// (re-check) always wins; otherwise only a strictly newer version replaces
/// an earlier announcement.
fn coalesce(
    announced: &mut HashMap<RowId, Option<RowVersion>>,
    table: &str,
    payload: &ChangeEvents,
) {
    let Some(source) = payload.get(table) else {
        return;
    };
    for (id, version) in source {
        if let Some(new_version) = version {
            if let Some(Some(existing)) = announced.get(id) {
                if new_version <= existing {
                    continue;
                }
            } else if announced.contains_key(id) {
                // Already marked for re-check.
                continue;
            }
        }
        announced.insert(*id, version.clone());
    }
}
