//! In-memory store used by the test suite
//!
//! Implements all three store traits over plain maps and vectors, with a
//! couple of knobs the pipeline tests need: a failure switch for exercising
//! the drop-from-memory flush policy and a lookup counter for the credential
//! cache's hit-path assertions.

use crate::auth::context::ProjectRole;
use crate::record::LogRecord;
use crate::store::{
    CredentialStore, LogStore, ProjectCredential, ProjectDirectory, SearchRequest, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<LogRecord>>,
    credentials: Mutex<HashMap<String, ProjectCredential>>,
    roles: Mutex<HashMap<(i32, i32), ProjectRole>>,
    retention_days: Mutex<HashMap<i32, i64>>,
    fail_loads: AtomicBool,
    credential_lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_credential(&self, api_key: &str, credential: ProjectCredential) {
        self.credentials
            .lock()
            .insert(api_key.to_string(), credential);
    }

    pub fn grant_role(&self, project_id: i32, user_id: i32, role: ProjectRole) {
        self.roles.lock().insert((project_id, user_id), role);
    }

    pub fn set_retention_days(&self, project_id: i32, days: i64) {
        self.retention_days.lock().insert(project_id, days);
    }

    /// Make every subsequent `bulk_load` fail until switched back.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// How many credential rows have been fetched.
    pub fn credential_lookups(&self) -> usize {
        self.credential_lookups.load(Ordering::SeqCst)
    }

    /// Snapshot of everything loaded so far, in load order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn bulk_load(&self, records: &[LogRecord]) -> Result<(), StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("test failure switch".to_string()));
        }
        self.records.lock().extend_from_slice(records);
        Ok(())
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.records.lock().iter().map(|r| r.timestamp).max())
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<LogRecord>, StoreError> {
        let mut hits: Vec<LogRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.project_id == request.project_id && r.timestamp >= request.since)
            .filter(|r| match &request.text {
                Some(text) => {
                    r.message.contains(text.as_str())
                        || r.level.contains(text.as_str())
                        || r.service.contains(text.as_str())
                }
                None => true,
            })
            .cloned()
            .collect();

        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(hits
            .into_iter()
            .skip(request.offset.max(0) as usize)
            .take(request.limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credential_by_key(
        &self,
        api_key: &str,
    ) -> Result<Option<ProjectCredential>, StoreError> {
        self.credential_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.lock().get(api_key).cloned())
    }
}

#[async_trait]
impl ProjectDirectory for MemoryStore {
    async fn role(
        &self,
        project_id: i32,
        user_id: i32,
    ) -> Result<Option<ProjectRole>, StoreError> {
        Ok(self.roles.lock().get(&(project_id, user_id)).copied())
    }

    async fn retention_days(&self, project_id: i32) -> Result<i64, StoreError> {
        Ok(self
            .retention_days
            .lock()
            .get(&project_id)
            .copied()
            .unwrap_or(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(project_id: i32, message: &str, age_secs: i64) -> LogRecord {
        LogRecord {
            timestamp: Utc::now() - Duration::seconds(age_secs),
            level: "info".to_string(),
            message: message.to_string(),
            service: "svc".to_string(),
            project_id,
            data: None,
            segment_id: 0,
        }
    }

    #[tokio::test]
    async fn search_scopes_to_project_and_window() {
        let store = MemoryStore::new();
        store
            .bulk_load(&[
                record(1, "connection reset", 10),
                record(1, "old entry", 120),
                record(2, "connection reset", 10),
            ])
            .await
            .unwrap();

        let hits = store
            .search(&SearchRequest {
                project_id: 1,
                text: Some("connection".to_string()),
                limit: 100,
                offset: 0,
                since: Utc::now() - Duration::seconds(60),
            })
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].project_id, 1);
    }

    #[tokio::test]
    async fn search_orders_newest_first_and_paginates() {
        let store = MemoryStore::new();
        store
            .bulk_load(&[record(1, "a", 30), record(1, "b", 20), record(1, "c", 10)])
            .await
            .unwrap();

        let hits = store
            .search(&SearchRequest {
                project_id: 1,
                text: None,
                limit: 2,
                offset: 1,
                since: Utc::now() - Duration::seconds(300),
            })
            .await
            .unwrap();

        let messages: Vec<_> = hits.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn latest_timestamp_tracks_high_water_mark() {
        let store = MemoryStore::new();
        assert!(store.latest_timestamp().await.unwrap().is_none());

        let newest = record(1, "new", 0);
        let ts = newest.timestamp;
        store
            .bulk_load(&[record(1, "old", 100), newest])
            .await
            .unwrap();

        assert_eq!(store.latest_timestamp().await.unwrap(), Some(ts));
    }
}
