//! Shared in-process fake of the query and change-feed endpoints.
//!
//! The fake serves one table, `Orders`, with the visible columns `Subject`
//! (nvarchar, required) and `Quantity` (int, optional). Change-feed polls
//! block until the test pushes a feed with [`FakeServer::notify`]; the first
//! poll is answered immediately so the bus reaches readiness on its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};

use livetable::protocol::{decode_change_feed, decode_query_payload, ChangeFeed, QueryOutcome};
use livetable::{SyncResult, Transport};

pub struct ServerRow {
    pub version: u64,
    pub subject: String,
    pub quantity: i64,
}

pub struct FakeServer {
    rows: Mutex<BTreeMap<i64, ServerRow>>,
    next_id: AtomicI64,
    next_version: AtomicI64,
    next_event_id: AtomicI64,
    seen: Mutex<Vec<String>>,
    changed_row_queries: AtomicUsize,
    feed_tx: mpsc::UnboundedSender<ChangeFeed>,
    feed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChangeFeed>>,
    write_gate: Semaphore,
    // Rows with Quantity >= max are outside the table filter.
    max_quantity: Option<i64>,
    omit_version_column: bool,
    hide_columns: bool,
}

pub fn hex_version(v: u64) -> String {
    format!("0x{:016X}", v)
}

static TRACING: Once = Once::new();

/// Route engine logs through the test harness, honoring `RUST_LOG`.
fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

impl FakeServer {
    pub fn new() -> Self {
        init_tracing();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        feed_tx
            .send(
                decode_change_feed(json!({"lastEventId": 0, "events": {}}))
                    .expect("initial feed"),
            )
            .expect("initial feed queued");
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            next_version: AtomicI64::new(1),
            next_event_id: AtomicI64::new(1),
            seen: Mutex::new(Vec::new()),
            changed_row_queries: AtomicUsize::new(0),
            feed_tx,
            feed_rx: tokio::sync::Mutex::new(feed_rx),
            write_gate: Semaphore::new(Semaphore::MAX_PERMITS),
            max_quantity: None,
            omit_version_column: false,
            hide_columns: false,
        }
    }

    /// Treat rows with `Quantity >= max` as outside the table filter.
    pub fn with_filter(mut self, max: i64) -> Self {
        self.max_quantity = Some(max);
        self
    }

    /// Serve a metadata response whose last column is not `Version`.
    pub fn without_version_column(mut self) -> Self {
        self.omit_version_column = true;
        self
    }

    /// Serve an empty metadata response, as for a caller without permissions.
    pub fn with_hidden_columns(mut self) -> Self {
        self.hide_columns = true;
        self
    }

    /// Hold every write until [`FakeServer::release_write`] is called.
    pub fn with_gated_writes(self) -> Self {
        Self {
            write_gate: Semaphore::new(0),
            ..self
        }
    }

    pub fn release_write(&self) {
        self.write_gate.add_permits(1);
    }

    pub fn seed(&self, subject: &str, quantity: i64) -> (i64, u64) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) as u64;
        self.rows.lock().unwrap().insert(
            id,
            ServerRow {
                version,
                subject: subject.to_string(),
                quantity,
            },
        );
        (id, version)
    }

    /// Bump a row's version without going through the client, as a competing
    /// writer would.
    pub fn touch(&self, id: i64) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst) as u64;
        let mut rows = self.rows.lock().unwrap();
        rows.get_mut(&id).expect("row exists").version = version;
        version
    }

    pub fn set_subject(&self, id: i64, subject: &str) -> u64 {
        let version = self.touch(id);
        self.rows.lock().unwrap().get_mut(&id).unwrap().subject = subject.to_string();
        version
    }

    pub fn set_quantity(&self, id: i64, quantity: i64) -> u64 {
        let version = self.touch(id);
        self.rows.lock().unwrap().get_mut(&id).unwrap().quantity = quantity;
        version
    }

    pub fn remove_row(&self, id: i64) {
        self.rows.lock().unwrap().remove(&id);
    }

    pub fn row_version(&self, id: i64) -> u64 {
        self.rows.lock().unwrap()[&id].version
    }

    pub fn subject(&self, id: i64) -> String {
        self.rows.lock().unwrap()[&id].subject.clone()
    }

    pub fn has_row(&self, id: i64) -> bool {
        self.rows.lock().unwrap().contains_key(&id)
    }

    /// Push a change feed announcing `(id, version)` pairs for `Orders`.
    /// A `None` version announces a deletion.
    pub fn notify(&self, entries: &[(i64, Option<u64>)]) {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let mut events = serde_json::Map::new();
        for (id, version) in entries {
            events.insert(
                id.to_string(),
                match version {
                    Some(v) => json!(hex_version(*v)),
                    None => json!(null),
                },
            );
        }
        let feed = decode_change_feed(json!({
            "lastEventId": event_id,
            "events": {"Orders": events},
        }))
        .expect("valid feed");
        self.feed_tx.send(feed).expect("feed queued");
    }

    /// Whether any received statement starts with `prefix`. Prefix matching,
    /// not substring: the column-metadata query quotes permission names like
    /// 'UPDATE' in its body and must not count as a write.
    pub fn saw(&self, prefix: &str) -> bool {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .any(|statement| statement.starts_with(prefix))
    }

    pub fn changed_row_queries(&self) -> usize {
        self.changed_row_queries.load(Ordering::SeqCst)
    }

    fn visible(&self, row: &ServerRow) -> bool {
        self.max_quantity.map_or(true, |max| row.quantity < max)
    }

    fn metadata_outcome(&self) -> QueryOutcome {
        let mut columns = Vec::new();
        if !self.hide_columns {
            columns.push(json!({
                "id": 1, "name": "ID", "type": "int", "maxLength": 4,
                "precision": 10, "scale": 0, "required": 1,
                "defaultValue": null, "readOnly": 1, "referencedTable": null,
            }));
            columns.push(json!({
                "id": 2, "name": "Subject", "type": "nvarchar", "maxLength": 200,
                "precision": 0, "scale": 0, "required": 1,
                "defaultValue": null, "readOnly": 0, "referencedTable": null,
            }));
            columns.push(json!({
                "id": 3, "name": "Quantity", "type": "int", "maxLength": 4,
                "precision": 10, "scale": 0, "required": 0,
                "defaultValue": "((0))", "readOnly": 0, "referencedTable": null,
            }));
            if !self.omit_version_column {
                columns.push(json!({
                    "id": 4, "name": "Version", "type": "timestamp", "maxLength": 8,
                    "precision": 0, "scale": 0, "required": 1,
                    "defaultValue": null, "readOnly": 1, "referencedTable": null,
                }));
            }
        }
        decode_query_payload(json!([{
            "affectedRowCount": 0, "rows": columns, "dateColumns": [],
        }]))
        .expect("valid metadata payload")
    }

    fn select_outcome(&self, statement: &str) -> QueryOutcome {
        let requested: Option<Vec<i64>> = statement.find("ID IN (").map(|at| {
            let rest = &statement[at + 7..];
            let end = rest.find(')').expect("closed id list");
            rest[..end]
                .split(',')
                .map(|s| s.trim().parse().expect("numeric id"))
                .collect()
        });
        if requested.is_some() {
            self.changed_row_queries.fetch_add(1, Ordering::SeqCst);
        }

        let rows = self.rows.lock().unwrap();
        let payload: Vec<_> = rows
            .iter()
            .filter(|(id, row)| {
                self.visible(row)
                    && requested
                        .as_ref()
                        .map_or(true, |requested| requested.contains(id))
            })
            .map(|(id, row)| {
                json!({
                    "Subject": row.subject,
                    "Quantity": row.quantity,
                    "$id": id,
                    "$version": hex_version(row.version),
                })
            })
            .collect();
        decode_query_payload(json!([{
            "affectedRowCount": 0, "rows": payload, "dateColumns": [],
        }]))
        .expect("valid row payload")
    }

    fn filter_fault() -> QueryOutcome {
        decode_query_payload(json!({
            "commandIndex": 2,
            "message": "the row violates the table filter [APP][Orders]",
        }))
        .expect("valid fault payload")
    }

    fn insert_outcome(&self, statement: &str, parameters: &[(String, String)]) -> QueryOutcome {
        let subject = param(parameters, "Subject").unwrap_or_default();
        let quantity = param(parameters, "Quantity")
            .map(|v| v.parse().expect("numeric quantity"))
            .unwrap_or(0);

        let row = ServerRow {
            version: self.next_version.fetch_add(1, Ordering::SeqCst) as u64,
            subject,
            quantity,
        };
        if statement.contains("RAISERROR") && !self.visible(&row) {
            return Self::filter_fault();
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().unwrap().insert(id, row);
        decode_query_payload(json!([{
            "affectedRowCount": 1, "rows": [{"$id": id}], "dateColumns": [],
        }]))
        .expect("valid insert payload")
    }

    fn update_outcome(&self, statement: &str, parameters: &[(String, String)]) -> QueryOutcome {
        let id: i64 = param(parameters, "ID").unwrap().parse().unwrap();
        let sent_version = param(parameters, "Version").unwrap();

        let mut rows = self.rows.lock().unwrap();
        let affected = match rows.get_mut(&id) {
            Some(row) if hex_version(row.version) == sent_version => {
                if let Some(subject) = param(parameters, "Subject") {
                    row.subject = subject;
                }
                if let Some(quantity) = param(parameters, "Quantity") {
                    row.quantity = quantity.parse().expect("numeric quantity");
                }
                row.version = self.next_version.fetch_add(1, Ordering::SeqCst) as u64;
                if statement.contains("RAISERROR") && !self.visible(row) {
                    return Self::filter_fault();
                }
                1
            }
            _ => 0,
        };
        drop(rows);
        decode_query_payload(json!([{
            "affectedRowCount": affected, "rows": [], "dateColumns": [],
        }]))
        .expect("valid update payload")
    }

    fn delete_outcome(&self, parameters: &[(String, String)]) -> QueryOutcome {
        let id: i64 = param(parameters, "ID").unwrap().parse().unwrap();
        let sent_version = param(parameters, "Version").unwrap();

        let mut rows = self.rows.lock().unwrap();
        let affected = match rows.get(&id) {
            Some(row) if hex_version(row.version) == sent_version => {
                rows.remove(&id);
                1
            }
            _ => 0,
        };
        drop(rows);
        decode_query_payload(json!([{
            "affectedRowCount": affected, "rows": [], "dateColumns": [],
        }]))
        .expect("valid delete payload")
    }
}

fn param(parameters: &[(String, String)], name: &str) -> Option<String> {
    parameters
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

#[async_trait]
impl Transport for FakeServer {
    async fn query(
        &self,
        statement: &str,
        parameters: &[(String, String)],
    ) -> SyncResult<QueryOutcome> {
        self.seen.lock().unwrap().push(statement.to_string());

        let is_write = statement.starts_with("INSERT")
            || statement.starts_with("UPDATE")
            || statement.starts_with("DELETE");
        if is_write {
            self.write_gate.acquire().await.expect("gate open").forget();
        }

        if statement.contains("sys.columns") {
            Ok(self.metadata_outcome())
        } else if statement.starts_with("INSERT INTO dbo.Orders") {
            Ok(self.insert_outcome(statement, parameters))
        } else if statement.starts_with("UPDATE dbo.Orders") {
            Ok(self.update_outcome(statement, parameters))
        } else if statement.starts_with("DELETE FROM dbo.Orders") {
            Ok(self.delete_outcome(parameters))
        } else {
            Ok(self.select_outcome(statement))
        }
    }

    async fn poll_changes(&self, _last_event_id: i64) -> SyncResult<ChangeFeed> {
        let mut rx = self.feed_rx.lock().await;
        match rx.recv().await {
            Some(feed) => Ok(feed),
            // The sender lives in self, so this cannot happen; park anyway.
            None => std::future::pending().await,
        }
    }
}

/// Poll `condition` until it holds or a 2s budget runs out.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not met in time");
}
