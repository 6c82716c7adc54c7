// src/store/scheduled.rs

//! Rows waiting to be regenerated, keyed by `(field, row)`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::debug;

use crate::engine::{Page, RowSource};
use crate::errors::StoreError;
use crate::store::lock;
use crate::store::table::{RowFilter, TableStore};
use crate::types::{BoxFuture, FieldId, RowId};

/// Durable record of scheduled updates.
///
/// One record per `(field, row)`; re-scheduling a row only moves its
/// `updated_on` forward.
pub trait ScheduledUpdateStore: Send + Sync {
    /// Insert or touch the records of `rows`; the latest `at` wins.
    fn upsert<'a>(
        &'a self,
        field: FieldId,
        rows: &'a [RowId],
        at: SystemTime,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Up to `limit` scheduled row ids of `field` greater than `after`, ascending.
    fn scheduled_row_ids(
        &self,
        field: FieldId,
        after: Option<RowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RowId>, StoreError>>;

    /// Delete the record only if it was not touched after `run_start`.
    ///
    /// Returns `true` if a record was deleted.
    fn remove_if_untouched(
        &self,
        field: FieldId,
        row: RowId,
        run_start: SystemTime,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Delete every record with `updated_on <= cutoff`.
    fn delete_older_than(&self, cutoff: SystemTime) -> BoxFuture<'_, Result<usize, StoreError>>;

    fn delete_for_field(&self, field: FieldId) -> BoxFuture<'_, Result<usize, StoreError>>;

    /// Distinct fields that still have records, ascending.
    fn pending_fields(&self) -> BoxFuture<'_, Result<Vec<FieldId>, StoreError>>;

    fn has_pending(&self, field: FieldId) -> BoxFuture<'_, Result<bool, StoreError>>;
}

#[derive(Debug, Default)]
pub struct MemoryScheduledUpdates {
    records: Mutex<BTreeMap<(FieldId, RowId), SystemTime>>,
}

impl MemoryScheduledUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// `updated_on` of one record, if present.
    pub fn updated_on(&self, field: FieldId, row: RowId) -> Option<SystemTime> {
        lock(&self.records).get(&(field, row)).copied()
    }

    /// All scheduled rows of `field`, ascending.
    pub fn rows_for(&self, field: FieldId) -> Vec<RowId> {
        lock(&self.records)
            .range((field, RowId::MIN)..=(field, RowId::MAX))
            .map(|((_, row), _)| *row)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ScheduledUpdateStore for MemoryScheduledUpdates {
    fn upsert<'a>(
        &'a self,
        field: FieldId,
        rows: &'a [RowId],
        at: SystemTime,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let mut records = lock(&self.records);
        for row in rows {
            let updated_on = records.entry((field, *row)).or_insert(at);
            if *updated_on < at {
                *updated_on = at;
            }
        }
        debug!(field, rows = rows.len(), "scheduled updates upserted");
        Box::pin(std::future::ready(Ok(())))
    }

    fn scheduled_row_ids(
        &self,
        field: FieldId,
        after: Option<RowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RowId>, StoreError>> {
        let start = match after {
            Some(row) if row == RowId::MAX => {
                return Box::pin(std::future::ready(Ok(Vec::new())));
            }
            Some(row) => row + 1,
            None => RowId::MIN,
        };
        let ids = lock(&self.records)
            .range((field, start)..=(field, RowId::MAX))
            .take(limit)
            .map(|((_, row), _)| *row)
            .collect();
        Box::pin(std::future::ready(Ok(ids)))
    }

    fn remove_if_untouched(
        &self,
        field: FieldId,
        row: RowId,
        run_start: SystemTime,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let mut records = lock(&self.records);
        let removed = match records.get(&(field, row)) {
            Some(updated_on) if *updated_on <= run_start => {
                records.remove(&(field, row));
                true
            }
            _ => false,
        };
        Box::pin(std::future::ready(Ok(removed)))
    }

    fn delete_older_than(&self, cutoff: SystemTime) -> BoxFuture<'_, Result<usize, StoreError>> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|_, updated_on| *updated_on > cutoff);
        Box::pin(std::future::ready(Ok(before - records.len())))
    }

    fn delete_for_field(&self, field: FieldId) -> BoxFuture<'_, Result<usize, StoreError>> {
        let mut records = lock(&self.records);
        let before = records.len();
        records.retain(|(f, _), _| *f != field);
        Box::pin(std::future::ready(Ok(before - records.len())))
    }

    fn pending_fields(&self) -> BoxFuture<'_, Result<Vec<FieldId>, StoreError>> {
        let fields: BTreeSet<FieldId> = lock(&self.records).keys().map(|(f, _)| *f).collect();
        Box::pin(std::future::ready(Ok(fields.into_iter().collect())))
    }

    fn has_pending(&self, field: FieldId) -> BoxFuture<'_, Result<bool, StoreError>> {
        let pending = lock(&self.records)
            .range((field, RowId::MIN)..=(field, RowId::MAX))
            .next()
            .is_some();
        Box::pin(std::future::ready(Ok(pending)))
    }
}

/// Rows of `field` that have a scheduled update, with their table snapshot.
///
/// Scheduled rows that no longer exist in the table are left out; their
/// records are collected by the periodic sweep.
pub struct ScheduledRowSource {
    updates: Arc<dyn ScheduledUpdateStore>,
    table: Arc<dyn TableStore>,
    field: FieldId,
}

impl ScheduledRowSource {
    pub fn new(
        updates: Arc<dyn ScheduledUpdateStore>,
        table: Arc<dyn TableStore>,
        field: FieldId,
    ) -> Self {
        Self {
            updates,
            table,
            field,
        }
    }
}

impl RowSource for ScheduledRowSource {
    fn fetch_page(
        &self,
        after: Option<RowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Page, StoreError>> {
        Box::pin(async move {
            let ids = self
                .updates
                .scheduled_row_ids(self.field, after, limit)
                .await?;
            let Some(&last) = ids.last() else {
                return Ok(Page::default());
            };

            let next_after = (ids.len() >= limit).then_some(last);
            let filter = RowFilter::rows(ids);
            let page = self
                .table
                .page(self.field, after, limit, &filter)
                .await?;

            Ok(Page {
                requests: page.requests,
                next_after,
            })
        })
    }
}
