//! In-memory source and destination used by the pipeline tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobsync_core::{JobPosting, JobRow, NaturalKey};
use jobsync_source::{JobSource, SourceError};
use jobsync_storage::{JobDestination, NullKeyPolicy, StoreError};

#[derive(Default)]
struct SourceState {
    postings: VecDeque<JobPosting>,
    served: usize,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
    stalled: bool,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new(postings: Vec<JobPosting>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                postings: postings.into(),
                ..Default::default()
            })),
        }
    }

    /// The cursor breaks after `served` postings.
    pub fn failing_after(self, served: usize) -> Self {
        self.state.lock().unwrap().fail_after = Some(served);
        self
    }

    /// The cursor hangs after `served` postings until the run is dropped.
    pub fn stalling_after(self, served: usize) -> Self {
        self.state.lock().unwrap().stall_after = Some(served);
        self
    }

    pub fn is_stalled(&self) -> bool {
        self.state.lock().unwrap().stalled
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl JobSource for MemorySource {
    async fn next_posting(&mut self) -> Result<Option<JobPosting>, SourceError> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            if state.fail_after == Some(state.served) {
                return Err(SourceError::Scan {
                    collection: "jobs".to_string(),
                    source: io::Error::new(io::ErrorKind::ConnectionReset, "cursor lost").into(),
                });
            }
            let stall = state.stall_after == Some(state.served);
            state.stalled |= stall;
            stall
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        let next = state.postings.pop_front();
        if next.is_some() {
            state.served += 1;
        }
        Ok(next)
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.postings.clear();
        state.closed = true;
    }
}

#[derive(Default)]
struct DestinationState {
    committed: Vec<JobRow>,
    pending: Option<Vec<JobRow>>,
    commits: usize,
    lookups: usize,
    closed: bool,
}

/// Mirrors the relational store: lookups see the open transaction's own
/// writes, rollbacks discard them, and `rejecting` plays a constraint.
#[derive(Clone)]
pub struct MemoryDestination {
    state: Arc<Mutex<DestinationState>>,
    null_keys: NullKeyPolicy,
    reject: Option<fn(&JobRow) -> bool>,
    fail_lookup: Option<usize>,
}

impl MemoryDestination {
    pub fn new(null_keys: NullKeyPolicy) -> Self {
        Self::with_rows(null_keys, Vec::new())
    }

    pub fn with_rows(null_keys: NullKeyPolicy, rows: Vec<JobRow>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DestinationState {
                committed: rows,
                ..Default::default()
            })),
            null_keys,
            reject: None,
            fail_lookup: None,
        }
    }

    pub fn rejecting(mut self, reject: fn(&JobRow) -> bool) -> Self {
        self.reject = Some(reject);
        self
    }

    /// The `nth` existence check (1-based) fails.
    pub fn failing_lookup(mut self, nth: usize) -> Self {
        self.fail_lookup = Some(nth);
        self
    }

    /// Committed rows only.
    pub fn rows(&self) -> Vec<JobRow> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// `IS NOT DISTINCT FROM` for null-safe, SQL `=` for strict.
fn key_matches(policy: NullKeyPolicy, wanted: &NaturalKey, stored: &NaturalKey) -> bool {
    fn eq(a: &Option<String>, b: &Option<String>) -> bool {
        matches!((a, b), (Some(a), Some(b)) if a == b)
    }
    match policy {
        NullKeyPolicy::NullSafe => wanted == stored,
        NullKeyPolicy::Strict => {
            eq(&wanted.title, &stored.title)
                && eq(&wanted.company, &stored.company)
                && eq(&wanted.posted_date, &stored.posted_date)
        }
    }
}

#[async_trait]
impl JobDestination for MemoryDestination {
    async fn begin(&mut self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.pending.is_none() {
            state.pending = Some(Vec::new());
        }
        Ok(())
    }

    async fn exists(&mut self, key: &NaturalKey) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.lookups += 1;
        if self.fail_lookup == Some(state.lookups) {
            return Err(StoreError::Sql(sqlx::Error::Protocol(
                "connection reset during lookup".to_string(),
            )));
        }
        let found = state
            .committed
            .iter()
            .chain(state.pending.iter().flatten())
            .any(|row| key_matches(self.null_keys, key, &row.natural_key()));
        Ok(found)
    }

    async fn insert(&mut self, row: &JobRow) -> Result<(), StoreError> {
        if self.reject.is_some_and(|reject| reject(row)) {
            return Err(StoreError::Sql(sqlx::Error::Protocol(
                "new row violates check constraint".to_string(),
            )));
        }
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.pending.as_mut() {
            Some(pending) => pending.push(row.clone()),
            None => state.committed.push(row.clone()),
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let pending = state.pending.take().ok_or(StoreError::NoTransaction)?;
        state.committed.extend(pending);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.state.lock().unwrap().pending = None;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        state.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(title: &str, company: &str, posted_date: Option<&str>) -> NaturalKey {
        NaturalKey {
            title: Some(title.to_string()),
            company: Some(company.to_string()),
            posted_date: posted_date.map(str::to_string),
        }
    }

    #[test]
    fn null_components_match_only_when_null_safe() {
        let undated = key("Engineer", "Acme", None);
        assert!(key_matches(NullKeyPolicy::NullSafe, &undated, &undated));
        assert!(!key_matches(NullKeyPolicy::Strict, &undated, &undated));
    }

    #[test]
    fn matching_is_case_sensitive_under_both_policies() {
        let stored = key("Engineer", "Acme", Some("2024-01-01"));
        let shouted = key("Engineer", "ACME", Some("2024-01-01"));
        for policy in [NullKeyPolicy::NullSafe, NullKeyPolicy::Strict] {
            assert!(key_matches(policy, &stored, &stored));
            assert!(!key_matches(policy, &shouted, &stored));
        }
    }
}
