//! Page-at-a-time read cursor shared by all stores.

use std::collections::VecDeque;

use chronicle_events::RecordedEvent;

use super::r#trait::EventStoreError;

/// Which position a cursor pages by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKey {
    /// Per-aggregate sequence number (`read_stream`).
    Sequence,
    /// Store-wide position (`read_all`).
    Global,
}

impl CursorKey {
    fn of(self, envelope: &RecordedEvent) -> u64 {
        match self {
            CursorKey::Sequence => envelope.sequence_number(),
            CursorKey::Global => envelope.global_position(),
        }
    }
}

type FetchPage<'a> =
    Box<dyn FnMut(u64, usize) -> Result<Vec<RecordedEvent>, EventStoreError> + Send + 'a>;

/// Keyset-paginated cursor.
///
/// `fetch(after, limit)` must return up to `limit` envelopes whose key is
/// strictly greater than `after`, ascending. The cursor calls it lazily, one
/// page at a time, and stops at `upper_bound` (the high-water mark when the
/// read started) so a stream being appended to concurrently still ends.
///
/// A fetch error is yielded once and ends the cursor.
pub struct PagedCursor<'a> {
    fetch: FetchPage<'a>,
    key: CursorKey,
    after: u64,
    upper_bound: u64,
    page_size: usize,
    buffer: VecDeque<RecordedEvent>,
    done: bool,
}

impl<'a> PagedCursor<'a> {
    pub fn new<F>(key: CursorKey, after: u64, upper_bound: u64, page_size: usize, fetch: F) -> Self
    where
        F: FnMut(u64, usize) -> Result<Vec<RecordedEvent>, EventStoreError> + Send + 'a,
    {
        Self {
            fetch: Box::new(fetch),
            key,
            after,
            upper_bound,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            done: after >= upper_bound,
        }
    }

    fn fill(&mut self) -> Result<(), EventStoreError> {
        let page = (self.fetch)(self.after, self.page_size)?;
        if page.len() < self.page_size {
            self.done = true;
        }
        for envelope in page {
            if self.key.of(&envelope) > self.upper_bound {
                self.done = true;
                break;
            }
            self.buffer.push_back(envelope);
        }
        Ok(())
    }
}

impl Iterator for PagedCursor<'_> {
    type Item = Result<RecordedEvent, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let envelope = self.buffer.pop_front()?;
        self.after = self.key.of(&envelope);
        if self.after >= self.upper_bound {
            self.done = true;
        }
        Some(Ok(envelope))
    }
}

impl core::fmt::Debug for PagedCursor<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PagedCursor")
            .field("key", &self.key)
            .field("after", &self.after)
            .field("upper_bound", &self.upper_bound)
            .field("buffered", &self.buffer.len())
            .field("done", &self.done)
            .finish()
    }
}
