use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use donau_core::{JobId, JobOutcome, JobRecord};
use tokio::sync::Mutex;

/// Shared handle to one record. Each record is locked on its own.
pub type RecordHandle = Arc<Mutex<JobRecord>>;

/// Every job the executor currently tracks.
///
/// The outer lock is held only long enough to insert or look up a handle,
/// never across an await.
#[derive(Debug, Default)]
pub struct JobTable {
    records: RwLock<HashMap<JobId, RecordHandle>>,
    /// Ids with a submission in progress.
    reserved: std::sync::Mutex<HashSet<JobId>>,
}

/// Claim on a job id while its submission runs. Dropping it frees the id.
#[derive(Debug)]
pub struct Reservation<'a> {
    table: &'a JobTable,
    job_id: JobId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.table
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job_id` for one submission. `None` if it is already tracked or
    /// another submission holds it.
    pub fn reserve(&self, job_id: JobId) -> Option<Reservation<'_>> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if self.contains(job_id) || !reserved.insert(job_id) {
            return None;
        }
        Some(Reservation { table: self, job_id })
    }

    /// Track a new record. Returns `false` if the id is already tracked.
    pub fn insert(&self, record: JobRecord) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(&record.job_id) {
            return false;
        }
        records.insert(record.job_id, Arc::new(Mutex::new(record)));
        true
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&job_id)
    }

    pub fn get(&self, job_id: JobId) -> Option<RecordHandle> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
    }

    /// All handles, ordered by job id.
    pub fn handles(&self) -> Vec<RecordHandle> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&JobId> = records.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| Arc::clone(&records[id])).collect()
    }

    /// Copies of every record, ordered by job id.
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        let mut out = Vec::new();
        for handle in self.handles() {
            out.push(handle.lock().await.clone());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a terminal record and hand back its outcome. Non-terminal
    /// records stay tracked.
    pub async fn take_finished(&self, job_id: JobId) -> Option<JobOutcome> {
        let handle = self.get(job_id)?;
        let outcome = handle.lock().await.outcome()?;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donau_core::JobState;
    use std::path::PathBuf;

    fn record(id: u64) -> JobRecord {
        JobRecord::new(JobId(id), "r", vec![], PathBuf::from("/l"), 0)
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let table = JobTable::new();
        assert!(table.insert(record(1)));
        assert!(!table.insert(record(1)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reservations_are_exclusive_until_dropped() {
        let table = JobTable::new();
        let slot = table.reserve(JobId(4)).unwrap();
        assert!(table.reserve(JobId(4)).is_none());
        assert!(table.reserve(JobId(5)).is_some());
        drop(slot);

        let slot = table.reserve(JobId(4)).unwrap();
        assert!(table.insert(record(4)));
        drop(slot);
        assert!(table.reserve(JobId(4)).is_none());
    }

    #[tokio::test]
    async fn only_terminal_records_are_taken() {
        let table = JobTable::new();
        table.insert(record(2));
        table.insert(record(1));
        assert!(table.take_finished(JobId(1)).await.is_none());
        assert!(table.contains(JobId(1)));

        table.get(JobId(1)).unwrap().lock().await.cancel(5);
        let outcome = table.take_finished(JobId(1)).await.unwrap();
        assert_eq!(outcome.state, JobState::Cancelled);
        assert!(!table.contains(JobId(1)));

        let ids: Vec<JobId> = table.snapshot().await.iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec![JobId(2)]);
    }
}
