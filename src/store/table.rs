// src/store/table.rs

//! Table rows and the values generated for them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::engine::{GenerationRequest, Page, RowSource};
use crate::errors::{ApplyError, StoreError};
use crate::store::lock;
use crate::types::{BoxFuture, FieldId, RowId, RowSnapshot};

/// Which rows a page should include.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    /// Restrict to these rows; `None` means every row.
    pub ids: Option<BTreeSet<RowId>>,
    /// Skip rows that already have a non-empty value for the field.
    pub only_empty: bool,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn rows(ids: impl IntoIterator<Item = RowId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            only_empty: false,
        }
    }

    pub fn only_empty(mut self, only_empty: bool) -> Self {
        self.only_empty = only_empty;
        self
    }
}

pub trait TableStore: Send + Sync {
    /// Up to `limit` rows with an id greater than `after` that match `filter`,
    /// ascending by id.
    fn page<'a>(
        &'a self,
        field: FieldId,
        after: Option<RowId>,
        limit: usize,
        filter: &'a RowFilter,
    ) -> BoxFuture<'a, Result<Page, StoreError>>;

    /// Store the generated `value` of `field` on `row`.
    fn update_value<'a>(
        &'a self,
        field: FieldId,
        row: RowId,
        value: &'a str,
    ) -> BoxFuture<'a, Result<(), ApplyError>>;

    /// Every row id, ascending.
    fn row_ids(&self) -> BoxFuture<'_, Result<Vec<RowId>, StoreError>>;
}

/// One row as stored by [`MemoryTable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRow {
    pub id: RowId,
    pub values: RowSnapshot,
    pub generated: BTreeMap<FieldId, String>,
}

#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: Mutex<BTreeMap<RowId, TableRow>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (RowId, RowSnapshot)>) -> Self {
        let table = Self::new();
        for (id, values) in rows {
            table.insert_row(id, values);
        }
        table
    }

    /// Insert or replace the input values of a row, keeping generated ones.
    pub fn insert_row(&self, id: RowId, values: RowSnapshot) {
        lock(&self.rows)
            .entry(id)
            .and_modify(|row| row.values = values.clone())
            .or_insert_with(|| TableRow {
                id,
                values,
                generated: BTreeMap::new(),
            });
    }

    pub fn remove_row(&self, id: RowId) -> bool {
        lock(&self.rows).remove(&id).is_some()
    }

    pub fn value(&self, field: FieldId, row: RowId) -> Option<String> {
        lock(&self.rows)
            .get(&row)
            .and_then(|r| r.generated.get(&field).cloned())
    }

    /// Copy of every row, ascending by id.
    pub fn dump(&self) -> Vec<TableRow> {
        lock(&self.rows).values().cloned().collect()
    }
}

impl TableStore for MemoryTable {
    fn page<'a>(
        &'a self,
        field: FieldId,
        after: Option<RowId>,
        limit: usize,
        filter: &'a RowFilter,
    ) -> BoxFuture<'a, Result<Page, StoreError>> {
        let rows = lock(&self.rows);
        let mut requests = Vec::new();
        let mut next_after = None;

        let candidates = rows
            .values()
            .filter(|row| after.is_none_or(|a| row.id > a))
            .filter(|row| filter.ids.as_ref().is_none_or(|ids| ids.contains(&row.id)))
            .filter(|row| {
                !filter.only_empty
                    || row
                        .generated
                        .get(&field)
                        .is_none_or(|v| v.trim().is_empty())
            });

        for row in candidates {
            if requests.len() == limit {
                next_after = requests.last().map(|r: &GenerationRequest| r.row_id);
                break;
            }
            requests.push(GenerationRequest::new(row.id, row.values.clone()));
        }

        Box::pin(std::future::ready(Ok(Page {
            requests,
            next_after,
        })))
    }

    fn update_value<'a>(
        &'a self,
        field: FieldId,
        row: RowId,
        value: &'a str,
    ) -> BoxFuture<'a, Result<(), ApplyError>> {
        let result = match lock(&self.rows).get_mut(&row) {
            Some(r) => {
                r.generated.insert(field, value.to_string());
                Ok(())
            }
            None => Err(ApplyError::RowGone(row)),
        };
        Box::pin(std::future::ready(result))
    }

    fn row_ids(&self) -> BoxFuture<'_, Result<Vec<RowId>, StoreError>> {
        let ids = lock(&self.rows).keys().copied().collect();
        Box::pin(std::future::ready(Ok(ids)))
    }
}

/// Table rows of a manual generation job.
pub struct TableRowSource {
    table: Arc<dyn TableStore>,
    field: FieldId,
    filter: RowFilter,
}

impl TableRowSource {
    pub fn new(table: Arc<dyn TableStore>, field: FieldId, filter: RowFilter) -> Self {
        Self {
            table,
            field,
            filter,
        }
    }
}

impl RowSource for TableRowSource {
    fn fetch_page(
        &self,
        after: Option<RowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        self.table.page(self.field, after, limit, &self.filter)
    }
}
