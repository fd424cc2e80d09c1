use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;


/// How many row-level problems of each kind are logged individually before
/// the sink falls back to counting alone.
const LOGGED_PER_KIND: u64 = 20;


/// Row-level problem counters summarized in the stats document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Rows that could not be parsed and were skipped.
    pub parse_errors: u64,
    /// Rows dropped by canonicalization because a required field was empty.
    pub dropped_invalid: u64,
    /// Edges referencing an id that never materialized as a node.
    pub dangling_refs: u64,
    /// Sources refused entirely, with the reason.
    pub refused_sources: Vec<RefusedSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefusedSource {
    pub name: String,
    pub reason: String,
}


/// Shared write-only sink for worker diagnostics. All workers funnel their
/// counts through [`DiagnosticBatch`] so the mutex is taken once per batch
/// rather than once per row.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    totals: Mutex<Diagnostics>,
}

impl DiagnosticSink {
    pub fn new() -> DiagnosticSink {
        DiagnosticSink::default()
    }

    pub fn refuse_source(&self, name: &str, reason: String) {
        warn!(source = name, reason, "Refusing source");
        let mut totals = self.totals.lock().unwrap();
        totals.refused_sources.push(RefusedSource {
            name: name.to_string(),
            reason,
        });
    }

    pub fn add_dangling_refs(&self, count: u64) {
        self.totals.lock().unwrap().dangling_refs += count;
    }

    pub fn flush(&self, batch: &mut DiagnosticBatch) {
        let mut totals = self.totals.lock().unwrap();
        totals.parse_errors += batch.parse_errors;
        totals.dropped_invalid += batch.dropped_invalid;
        batch.parse_errors = 0;
        batch.dropped_invalid = 0;
    }

    pub fn snapshot(&self) -> Diagnostics {
        self.totals.lock().unwrap().clone()
    }

    pub fn refused_count(&self) -> usize {
        self.totals.lock().unwrap().refused_sources.len()
    }
}


/// Worker-local diagnostic counts, merged into the sink in coarse batches.
#[derive(Debug, Default)]
pub struct DiagnosticBatch {
    parse_errors: u64,
    dropped_invalid: u64,
}

impl DiagnosticBatch {
    pub fn new() -> DiagnosticBatch {
        DiagnosticBatch::default()
    }

    pub fn parse_error(&mut self, path: &str, line: u64, message: &str) {
        if self.parse_errors < LOGGED_PER_KIND {
            warn!(path, line, message, "Skipping unparseable row");
        }
        self.parse_errors += 1;
    }

    pub fn dropped_invalid(&mut self, path: &str, line: u64, field: &str) {
        if self.dropped_invalid < LOGGED_PER_KIND {
            warn!(path, line, field, "Dropping row with empty required field");
        }
        self.dropped_invalid += 1;
    }
}
