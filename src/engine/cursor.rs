// src/engine/cursor.rs

//! Lazy row feeds for a generation run.
//!
//! The engine only ever asks for "the next request". A [`RowSource`] is the
//! restartable, finite producer behind it (a table, or the rows scheduled
//! for a field), fetched a page at a time by [`PagedCursor`] so a run never
//! holds the whole result set in memory.

use std::collections::VecDeque;

use crate::engine::GenerationRequest;
use crate::errors::StoreError;
use crate::types::{BoxFuture, RowId};

/// Sequential, lazily evaluated stream of requests for one run.
///
/// A row id yielded again while that row is still in flight is not
/// dispatched a second time; the run counts it in
/// [`RunSummary::skipped`](crate::engine::RunSummary::skipped) rather than
/// as finished.
pub trait RowCursor: Send {
    /// Next request in source order, or `None` once exhausted.
    fn next_request(&mut self) -> BoxFuture<'_, Result<Option<GenerationRequest>, StoreError>>;
}

/// One page of rows, ordered by ascending row id.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub requests: Vec<GenerationRequest>,
    /// Cursor position for the following page; `None` when this was the last.
    ///
    /// This may be set while `requests` is empty, e.g. when every row of a
    /// page was filtered out.
    pub next_after: Option<RowId>,
}

/// Paged producer of requests, restartable from any position.
pub trait RowSource: Send + Sync {
    /// Fetch up to `limit` rows with an id strictly greater than `after`.
    fn fetch_page(
        &self,
        after: Option<RowId>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Page, StoreError>>;
}

/// [`RowCursor`] that pulls pages from a [`RowSource`] on demand.
#[derive(Debug)]
pub struct PagedCursor<S> {
    source: S,
    page_size: usize,
    buffer: VecDeque<GenerationRequest>,
    after: Option<RowId>,
    exhausted: bool,
}

impl<S: RowSource> PagedCursor<S> {
    pub fn new(source: S, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        }
    }
}

impl<S: RowSource> RowCursor for PagedCursor<S> {
    fn next_request(&mut self) -> BoxFuture<'_, Result<Option<GenerationRequest>, StoreError>> {
        Box::pin(async move {
            loop {
                if let Some(request) = self.buffer.pop_front() {
                    return Ok(Some(request));
                }
                if self.exhausted {
                    return Ok(None);
                }

                let page = self.source.fetch_page(self.after, self.page_size).await?;
                self.buffer.extend(page.requests);

                match page.next_after {
                    // A source that does not move forward would loop forever.
                    Some(next) if Some(next) != self.after => self.after = Some(next),
                    _ => self.exhausted = true,
                }
            }
        })
    }
}

/// [`RowCursor`] over an in-memory iterator.
#[derive(Debug)]
pub struct IterCursor<I> {
    inner: I,
}

impl<I> IterCursor<I>
where
    I: Iterator<Item = GenerationRequest> + Send,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            inner: iter.into_iter(),
        }
    }
}

impl<I> RowCursor for IterCursor<I>
where
    I: Iterator<Item = GenerationRequest> + Send,
{
    fn next_request(&mut self) -> BoxFuture<'_, Result<Option<GenerationRequest>, StoreError>> {
        let next = self.inner.next();
        Box::pin(std::future::ready(Ok(next)))
    }
}
