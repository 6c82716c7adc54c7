// tests/prompt_and_cursor.rs

use std::sync::Arc;
use std::time::SystemTime;

use fieldgen::engine::prompt::{referenced_columns, render_prompt};
use fieldgen::engine::{PagedCursor, RowCursor, RowSource};
use fieldgen::store::{
    MemoryScheduledUpdates, MemoryTable, RowFilter, ScheduledRowSource, ScheduledUpdateStore,
    TableRowSource, TableStore,
};
use fieldgen::types::RowId;
use fieldgen_test_utils::builders::{id_snapshot, snapshot};

const FIELD: u64 = 1;

async fn drain<C: RowCursor>(cursor: &mut C) -> Vec<RowId> {
    let mut ids = Vec::new();
    while let Some(request) = cursor.next_request().await.expect("cursor should not fail") {
        ids.push(request.row_id);
    }
    ids
}

fn table(ids: impl IntoIterator<Item = RowId>) -> Arc<MemoryTable> {
    Arc::new(MemoryTable::from_rows(
        ids.into_iter().map(|id| (id, id_snapshot(id))),
    ))
}

#[test]
fn prompt_placeholders_take_row_values() {
    let row = snapshot(&[("title", "Rust"), ("lang", "en")]);
    assert_eq!(
        render_prompt("Summarise {title} in {lang}.", &row),
        "Summarise Rust in en."
    );
}

#[test]
fn unknown_columns_render_empty_and_braces_escape() {
    let row = snapshot(&[("title", "Rust")]);
    assert_eq!(render_prompt("[{missing}]", &row), "[]");
    assert_eq!(render_prompt("{{title}} is {title}", &row), "{title} is Rust");
    assert_eq!(render_prompt("{ title }", &row), "Rust");
}

#[test]
fn referenced_columns_are_listed_in_order() {
    assert_eq!(
        referenced_columns("{b} and {a} but not {{c}}, then {b}"),
        vec!["b", "a", "b"]
    );
    assert!(referenced_columns("no placeholders").is_empty());
}

#[tokio::test]
async fn paged_cursor_walks_every_page() {
    let table = table(1..=10);
    let source = TableRowSource::new(table, FIELD, RowFilter::all());
    let mut cursor = PagedCursor::new(source, 3);

    assert_eq!(drain(&mut cursor).await, (1..=10).collect::<Vec<_>>());
    assert!(cursor.next_request().await.unwrap().is_none());
}

#[tokio::test]
async fn only_empty_skips_rows_with_values() {
    let table = table(1..=5);
    table.update_value(FIELD, 2, "done").await.unwrap();
    table.update_value(FIELD, 4, "  ").await.unwrap();
    table.update_value(FIELD + 1, 3, "other field").await.unwrap();

    let source = TableRowSource::new(table, FIELD, RowFilter::all().only_empty(true));
    let mut cursor = PagedCursor::new(source, 2);

    assert_eq!(drain(&mut cursor).await, vec![1, 3, 4, 5]);
}

#[tokio::test]
async fn row_filter_restricts_to_listed_rows() {
    let table = table(1..=6);
    let source = TableRowSource::new(table, FIELD, RowFilter::rows([6, 2, 42]));
    let mut cursor = PagedCursor::new(source, 4);

    assert_eq!(drain(&mut cursor).await, vec![2, 6]);
}

#[tokio::test]
async fn scheduled_rows_come_with_their_snapshot() {
    let table = table(1..=8);
    let updates = Arc::new(MemoryScheduledUpdates::new());
    updates
        .upsert(FIELD, &[7, 3, 5], SystemTime::now())
        .await
        .unwrap();
    updates
        .upsert(FIELD + 1, &[1], SystemTime::now())
        .await
        .unwrap();

    let source = ScheduledRowSource::new(updates, table, FIELD);
    let mut cursor = PagedCursor::new(source, 2);
    let first = cursor.next_request().await.unwrap().expect("row 3 is scheduled");
    assert_eq!(first.row_id, 3);
    assert_eq!(first.snapshot, id_snapshot(3));

    assert_eq!(drain(&mut cursor).await, vec![5, 7]);
}

#[tokio::test]
async fn scheduled_rows_missing_from_the_table_are_left_out() {
    let table = table(1..=8);
    let updates = Arc::new(MemoryScheduledUpdates::new());
    updates
        .upsert(FIELD, &[1, 2, 3, 4, 5], SystemTime::now())
        .await
        .unwrap();
    table.remove_row(1);
    table.remove_row(2);

    let source = ScheduledRowSource::new(updates.clone(), table, FIELD);
    let first_page = source.fetch_page(None, 2).await.unwrap();
    assert!(first_page.requests.is_empty());
    assert_eq!(first_page.next_after, Some(2));

    let mut cursor = PagedCursor::new(source, 2);
    assert_eq!(drain(&mut cursor).await, vec![3, 4, 5]);
    // Records of vanished rows stay until the sweep collects them.
    assert_eq!(updates.rows_for(FIELD), vec![1, 2, 3, 4, 5]);
}
