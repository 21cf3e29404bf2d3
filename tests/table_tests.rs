//! Table lifecycle tests: construction, editing, optimistic concurrency and
//! disposal against an in-process fake server.

mod common;

use std::sync::Arc;

use livetable::{CellValue, CommandExecutor, NotificationBus, RowVersion, SyncError, Table};

use common::{hex_version, wait_until, FakeServer};

fn engine(server: &Arc<FakeServer>) -> (Arc<CommandExecutor>, NotificationBus) {
    (
        Arc::new(CommandExecutor::new(server.clone())),
        NotificationBus::start(server.clone()),
    )
}

async fn open_orders(server: &Arc<FakeServer>, filter: Option<&str>) -> Table {
    let (executor, bus) = engine(server);
    let table = Table::open(executor, &bus, "Orders", filter).unwrap();
    table.ready().await.unwrap();
    table
}

#[tokio::test]
async fn test_table_loads_initial_snapshot() {
    let server = Arc::new(FakeServer::new());
    let (first, v1) = server.seed("Widget", 5);
    let (second, _) = server.seed("Gadget", 9);

    let table = open_orders(&server, None).await;

    let columns = table.columns().unwrap();
    assert_eq!(
        columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["Subject", "Quantity"]
    );
    assert!(columns[0].required);
    assert!(!columns[1].required);
    assert!(columns[1].has_default);

    let rows = table.rows().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id(), first);
    assert_eq!(rows[0].version().as_str(), hex_version(v1));
    assert_eq!(
        rows[0].get("Subject"),
        Some(&CellValue::Text("Widget".to_string()))
    );
    assert_eq!(rows[1].id(), second);
    assert!(!rows[0].is_dirty());
}

#[tokio::test]
async fn test_open_rejects_bad_arguments() {
    let server = Arc::new(FakeServer::new());
    let (executor, bus) = engine(&server);

    let err = Table::open(executor.clone(), &bus, "Orders; DROP", None)
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::Argument { name: "name", .. }));

    let err = Table::open(executor.clone(), &bus, "Orders", Some("WHERE Quantity < 5"))
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::Argument { name: "filter", .. }));

    let err = Table::open(executor, &bus, "Orders", Some("")).err().unwrap();
    assert!(matches!(err, SyncError::Argument { name: "filter", .. }));
}

#[tokio::test]
async fn test_metadata_without_version_column_fails_construction() {
    let server = Arc::new(FakeServer::new().without_version_column());
    let (executor, bus) = engine(&server);
    let table = Table::open(executor, &bus, "Orders", None).unwrap();
    let err = table.ready().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidData(_)));
}

#[tokio::test]
async fn test_hidden_columns_fail_as_unauthorized() {
    let server = Arc::new(FakeServer::new().with_hidden_columns());
    let (executor, bus) = engine(&server);
    let table = Table::open(executor, &bus, "Orders", None).unwrap();
    let err = table.ready().await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));
}

#[tokio::test]
async fn test_insert_round_trip() {
    let server = Arc::new(FakeServer::new());
    let table = open_orders(&server, None).await;

    let mut row = table.new_row(None).unwrap();
    assert!(row.id() < 0);
    assert!(!row.is_persisted());

    row.set("Subject", CellValue::Text("Widget".to_string()));
    row.set("Quantity", CellValue::Int(5));
    let saved = table.save(&row).await.unwrap();

    assert!(saved.is_persisted());
    assert!(server.has_row(saved.id()));
    assert_eq!(server.subject(saved.id()), "Widget");
    assert_eq!(
        saved.original("Subject"),
        Some(&CellValue::Text("Widget".to_string()))
    );
    assert!(!saved.is_dirty());

    // The temporary id is gone; the confirmed row took its place.
    let rows = table.rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id(), saved.id());

    // The version stays at zero until the change feed announces it.
    assert_eq!(saved.version(), &RowVersion::zero());
    let id = saved.id();
    let announced = server.row_version(id);
    server.notify(&[(id, Some(announced))]);
    wait_until(|| {
        table.get_by_id(id).unwrap().unwrap().version().as_str() == hex_version(announced)
    })
    .await;
}

#[tokio::test]
async fn test_insert_requires_required_columns() {
    let server = Arc::new(FakeServer::new());
    let table = open_orders(&server, None).await;

    let mut row = table.new_row(None).unwrap();
    row.set("Quantity", CellValue::Int(5));

    let err = table.save(&row).await.unwrap_err();
    match err {
        SyncError::Server(fault) => {
            assert_eq!(fault.column.as_deref(), Some("Subject"));
            assert_eq!(fault.table.as_deref(), Some("Orders"));
        }
        other => panic!("unexpected error: {}", other),
    }
    // Nothing was sent; the unsaved row stays cached with the fault attached.
    assert!(!server.saw("INSERT"));
    let cached = table.get_by_id(row.id()).unwrap().unwrap();
    assert!(cached.last_error().is_some());

    // Fixing the row and saving again succeeds.
    row.set("Subject", CellValue::Text("Widget".to_string()));
    let saved = table.save(&row).await.unwrap();
    assert!(saved.is_persisted());
    assert!(saved.last_error().is_none());
}

#[tokio::test]
async fn test_insert_violating_filter_is_rejected() {
    let server = Arc::new(FakeServer::new().with_filter(100));
    let table = open_orders(&server, Some("Quantity < 100")).await;

    let mut row = table.new_row(None).unwrap();
    row.set("Subject", CellValue::Text("Oversized".to_string()));
    row.set("Quantity", CellValue::Int(150));

    let err = table.save(&row).await.unwrap_err();
    match err {
        SyncError::Server(fault) => {
            assert!(fault.message.contains("violates the table filter"));
            assert_eq!(fault.table.as_deref(), Some("Orders"));
        }
        other => panic!("unexpected error: {}", other),
    }
    let cached = table.get_by_id(row.id()).unwrap().unwrap();
    assert!(cached.last_error().is_some());
}

#[tokio::test]
async fn test_update_round_trip() {
    let server = Arc::new(FakeServer::new());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let mut row = table.get_by_id(id).unwrap().unwrap();
    row.set("Subject", CellValue::Text("Renamed".to_string()));
    assert!(row.is_dirty());

    let saved = table.save(&row).await.unwrap();
    assert_eq!(server.subject(id), "Renamed");
    assert_eq!(
        saved.original("Subject"),
        Some(&CellValue::Text("Renamed".to_string()))
    );
    assert!(!saved.is_dirty());
}

#[tokio::test]
async fn test_save_without_changes_sends_nothing() {
    let server = Arc::new(FakeServer::new());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let row = table.get_by_id(id).unwrap().unwrap();
    let saved = table.save(&row).await.unwrap();
    assert_eq!(saved.id(), id);
    assert!(!server.saw("UPDATE"));
}

#[tokio::test]
async fn test_update_conflict_surfaces_managed_fault() {
    let server = Arc::new(FakeServer::new());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    // A competing writer bumps the version behind our back.
    server.touch(id);

    let mut row = table.get_by_id(id).unwrap().unwrap();
    row.set("Subject", CellValue::Text("Renamed".to_string()));
    let err = table.save(&row).await.unwrap_err();
    match err {
        SyncError::Server(fault) => {
            assert_eq!(fault.message, "row changed or already deleted");
            assert_eq!(fault.table.as_deref(), Some("Orders"));
        }
        other => panic!("unexpected error: {}", other),
    }
    // The server row is untouched and the fault is recorded on the cache.
    assert_eq!(server.subject(id), "Widget");
    let cached = table.get_by_id(id).unwrap().unwrap();
    assert!(cached.last_error().is_some());
}

#[tokio::test]
async fn test_delete_round_trip() {
    let server = Arc::new(FakeServer::new());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let row = table.get_by_id(id).unwrap().unwrap();
    table.delete(&row, false).await.unwrap();
    assert!(!server.has_row(id));
    assert!(table.get_by_id(id).unwrap().is_none());
}

#[tokio::test]
async fn test_delete_unsaved_row_is_local() {
    let server = Arc::new(FakeServer::new());
    let table = open_orders(&server, None).await;

    let row = table.new_row(None).unwrap();
    table.delete(&row, false).await.unwrap();
    assert!(table.get_by_id(row.id()).unwrap().is_none());
    assert!(!server.saw("DELETE"));
}

#[tokio::test]
async fn test_delete_conflict_keeps_error_on_request() {
    let server = Arc::new(FakeServer::new());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let row = table.get_by_id(id).unwrap().unwrap();
    server.touch(id);

    let err = table.delete(&row, true).await.unwrap_err();
    assert!(matches!(err, SyncError::Server(_)));
    assert!(server.has_row(id));
    let cached = table.get_by_id(id).unwrap().unwrap();
    assert_eq!(
        cached.last_error().unwrap().message,
        "row changed or already deleted"
    );
}

#[tokio::test]
async fn test_second_action_on_same_row_is_rejected() {
    let server = Arc::new(FakeServer::new().with_gated_writes());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let mut row = table.get_by_id(id).unwrap().unwrap();
    row.set("Subject", CellValue::Text("Renamed".to_string()));

    let first_table = table.clone();
    let first_row = row.clone();
    let first = tokio::spawn(async move { first_table.save(&first_row).await });

    wait_until(|| server.saw("UPDATE")).await;

    let err = table.save(&row).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidOperation(_)));
    let err = table.delete(&row, false).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidOperation(_)));

    server.release_write();
    first.await.unwrap().unwrap();
    assert_eq!(server.subject(id), "Renamed");
}

#[tokio::test]
async fn test_action_guard_survives_concurrent_merge() {
    let server = Arc::new(FakeServer::new().with_gated_writes());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let mut row = table.get_by_id(id).unwrap().unwrap();
    row.set("Subject", CellValue::Text("Renamed".to_string()));

    let first_table = table.clone();
    let first_row = row.clone();
    let first = tokio::spawn(async move { first_table.save(&first_row).await });
    wait_until(|| server.saw("UPDATE")).await;

    // A competing writer lands and the change feed merges the newer row
    // while the save is still held at the server.
    let newer = server.set_subject(id, "External");
    server.notify(&[(id, Some(newer))]);
    wait_until(|| {
        table.get_by_id(id).unwrap().unwrap().version().as_str() == hex_version(newer)
    })
    .await;

    // The merged row replaced the cached one, but the in-flight save still
    // owns the row: a second action stays rejected.
    let err = table.save(&row).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidOperation(_)));

    // Released, the first save loses the optimistic-concurrency race and the
    // guard is freed for the next action.
    server.release_write();
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Server(_)));

    server.release_write();
    let mut fresh = table.get_by_id(id).unwrap().unwrap();
    fresh.set("Subject", CellValue::Text("Renamed".to_string()));
    let saved = table.save(&fresh).await.unwrap();
    assert_eq!(server.subject(id), "Renamed");
    assert!(!saved.is_dirty());
}

#[tokio::test]
async fn test_dispose_cancels_in_flight_save() {
    let server = Arc::new(FakeServer::new().with_gated_writes());
    let (id, _) = server.seed("Widget", 5);
    let table = open_orders(&server, None).await;

    let mut row = table.get_by_id(id).unwrap().unwrap();
    row.set("Subject", CellValue::Text("Renamed".to_string()));

    let save_table = table.clone();
    let save_row = row.clone();
    let save = tokio::spawn(async move { save_table.save(&save_row).await });
    wait_until(|| server.saw("UPDATE")).await;

    table.dispose();
    let err = save.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Cancelled(_)));

    // Everything faults after disposal, and disposing again is a no-op.
    assert!(matches!(
        table.rows().unwrap_err(),
        SyncError::ObjectDisposed(_)
    ));
    assert!(matches!(
        table.new_row(None).unwrap_err(),
        SyncError::ObjectDisposed(_)
    ));
    table.dispose();
}

#[tokio::test]
async fn test_new_row_rejects_unknown_columns() {
    let server = Arc::new(FakeServer::new());
    let table = open_orders(&server, None).await;

    let mut template = std::collections::BTreeMap::new();
    template.insert("NoSuchColumn".to_string(), CellValue::Int(1));
    let err = table.new_row(Some(template)).unwrap_err();
    assert!(matches!(err, SyncError::Argument { name: "template", .. }));
}

#[tokio::test]
async fn test_change_listeners_observe_local_edits() {
    let server = Arc::new(FakeServer::new());
    let table = open_orders(&server, None).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = table
        .add_change_listener(move |old, new| {
            let _ = tx.send((old.map(|r| r.id()), new.map(|r| r.id())));
        })
        .unwrap();

    let row = table.new_row(None).unwrap();
    let (old, new) = rx.recv().await.unwrap();
    assert_eq!(old, None);
    assert_eq!(new, Some(row.id()));

    table.delete(&row, false).await.unwrap();
    let (old, new) = rx.recv().await.unwrap();
    assert_eq!(old, Some(row.id()));
    assert_eq!(new, None);

    assert!(table.remove_change_listener(handle).unwrap());
    assert!(!table.remove_change_listener(handle).unwrap());
}
