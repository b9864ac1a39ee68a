//! Per-search state: deadline, cancellation scope and collected results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::categorize::CategorizedRecords;
use crate::error::{SourceError, SourceErrorKind};
use crate::models::{CrossReference, Record, Subject};
use crate::source::{AdapterOutput, QueryContext, QueryOptions};
use crate::util::deadline_after;

/// Session-level bookkeeping reported with every response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchMetadata {
    pub sources_attempted: Vec<String>,
    pub sources_succeeded: Vec<String>,
    /// Sources the deadline or a cancellation cut off.
    pub sources_incomplete: Vec<String>,
    /// Set when any source failed or the deadline truncated a phase.
    pub partial: bool,
    pub errors: Vec<SourceError>,
    pub expansions_performed: usize,
    /// Cross-references dropped by the expansion cap or already covered.
    pub expansions_skipped: usize,
    pub records_before_dedup: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Final output of one search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub subject: Subject,
    pub records: CategorizedRecords,
    pub metadata: SearchMetadata,
}

impl SearchResponse {
    pub fn is_partial(&self) -> bool {
        self.metadata.partial
    }
}

/// One in-progress search.
///
/// Owns a cancellation token derived from the caller's, so cancelling the
/// caller cancels every adapter and fetch started by the session.
#[derive(Debug)]
pub struct SearchSession {
    query: String,
    started: Instant,
    started_at: DateTime<Utc>,
    deadline: Instant,
    cancel: CancellationToken,
    options: QueryOptions,
    records: Vec<Record>,
    cross_references: Vec<CrossReference>,
    metadata: SearchMetadata,
}

impl SearchSession {
    pub fn new(query: impl Into<String>, budget: Duration, parent: &CancellationToken) -> Self {
        let started = Instant::now();
        Self {
            query: query.into(),
            started,
            started_at: Utc::now(),
            deadline: deadline_after(budget),
            cancel: parent.child_token(),
            options: QueryOptions::default(),
            records: Vec::new(),
            cross_references: Vec::new(),
            metadata: SearchMetadata::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Context spanning the whole session. Adapter calls narrow it with
    /// [`QueryContext::child`].
    pub fn base_context(&self) -> QueryContext {
        QueryContext::new(self.deadline, self.cancel.clone(), self.options.clone())
    }

    /// A context for one adapter call, bounded by both `timeout` and the
    /// session deadline.
    pub fn context(&self, timeout: Duration) -> QueryContext {
        self.base_context().child(timeout)
    }

    pub fn attempt(&mut self, source: &str) {
        push_unique(&mut self.metadata.sources_attempted, source);
    }

    /// Take in an adapter's output. The source counts as succeeded only if
    /// it reported no errors.
    pub fn absorb(&mut self, source: &str, output: AdapterOutput) {
        self.records.extend(output.records);
        self.cross_references.extend(output.cross_references);
        if output.errors.is_empty() {
            push_unique(&mut self.metadata.sources_succeeded, source);
        }
        for error in output.errors {
            self.record_error(error);
        }
    }

    pub fn add_records(&mut self, records: impl IntoIterator<Item = Record>) {
        self.records.extend(records);
    }

    pub fn record_success(&mut self, source: &str) {
        push_unique(&mut self.metadata.sources_succeeded, source);
    }

    /// A source with any error, including a later expansion cut off by the
    /// deadline, no longer counts as succeeded.
    pub fn record_error(&mut self, error: SourceError) {
        self.metadata.sources_succeeded.retain(|s| *s != error.source);
        if error.is_incomplete() {
            push_unique(&mut self.metadata.sources_incomplete, &error.source);
        }
        self.metadata.partial = true;
        self.metadata.errors.push(error);
    }

    /// Mark a source the deadline cut off.
    pub fn mark_incomplete(&mut self, source: &str, reason: &str) {
        tracing::warn!(source, reason, "Source did not finish");
        self.record_error(SourceError::new(source, SourceErrorKind::Incomplete, reason));
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn take_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }

    pub fn take_cross_references(&mut self) -> Vec<CrossReference> {
        std::mem::take(&mut self.cross_references)
    }

    pub fn note_expansions(&mut self, performed: usize, skipped: usize) {
        self.metadata.expansions_performed += performed;
        self.metadata.expansions_skipped += skipped;
    }

    pub fn note_records_before_dedup(&mut self, count: usize) {
        self.metadata.records_before_dedup = count;
    }

    pub fn metadata(&self) -> &SearchMetadata {
        &self.metadata
    }

    /// Close the session and cancel anything it still has running.
    pub fn finish(self, subject: Subject, records: CategorizedRecords) -> SearchResponse {
        self.cancel.cancel();
        let mut metadata = self.metadata;
        metadata.started_at = self.started_at;
        metadata.elapsed_ms = self.started.elapsed().as_millis() as u64;
        SearchResponse {
            query: self.query,
            subject,
            records,
            metadata,
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}
