use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use dirpack_core::DownloadHandleId;

use super::types::DownloadHandle;

pub trait DownloadStore: Send + Sync {
    fn create(&self, handle: DownloadHandle) -> Result<(), DownloadStoreError>;

    fn get(&self, id: DownloadHandleId) -> Result<Option<DownloadHandle>, DownloadStoreError>;

    /// Attach the finished bundle. Returns `false` if the handle is unknown.
    fn complete(
        &self,
        id: DownloadHandleId,
        download_url: &str,
        bundle_name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DownloadStoreError>;

    /// Expire the handle at `now` so sweepers reclaim its file.
    fn expire_now(&self, id: DownloadHandleId, now: DateTime<Utc>) -> Result<bool, DownloadStoreError>;

    /// Expired handles still naming a bundle file, soonest expiry first.
    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DownloadHandle>, DownloadStoreError>;

    /// Drop the bundle reference of a handle that expired by `now`, once its
    /// file is gone. Returns `false` if the handle is unknown or live again.
    fn release_bundle(&self, id: DownloadHandleId, now: DateTime<Utc>) -> Result<bool, DownloadStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadStoreError {
    #[error("download handle already exists: {0}")]
    AlreadyExists(DownloadHandleId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
pub struct InMemoryDownloadStore {
    handles: RwLock<HashMap<DownloadHandleId, DownloadHandle>>,
}

impl InMemoryDownloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DownloadStore for InMemoryDownloadStore {
    fn create(&self, handle: DownloadHandle) -> Result<(), DownloadStoreError> {
        let mut handles = self.handles.write().unwrap();
        if handles.contains_key(&handle.id) {
            return Err(DownloadStoreError::AlreadyExists(handle.id));
        }
        handles.insert(handle.id, handle);
        Ok(())
    }

    fn get(&self, id: DownloadHandleId) -> Result<Option<DownloadHandle>, DownloadStoreError> {
        Ok(self.handles.read().unwrap().get(&id).cloned())
    }

    fn complete(
        &self,
        id: DownloadHandleId,
        download_url: &str,
        bundle_name: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DownloadStoreError> {
        let mut handles = self.handles.write().unwrap();
        let Some(handle) = handles.get_mut(&id) else {
            return Ok(false);
        };
        handle.download_url = Some(download_url.to_string());
        handle.bundle_name = Some(bundle_name.to_string());
        handle.expires_at = Some(expires_at);
        handle.updated_at = Utc::now();
        Ok(true)
    }

    fn expire_now(&self, id: DownloadHandleId, now: DateTime<Utc>) -> Result<bool, DownloadStoreError> {
        let mut handles = self.handles.write().unwrap();
        let Some(handle) = handles.get_mut(&id) else {
            return Ok(false);
        };
        handle.expires_at = Some(now);
        handle.updated_at = now;
        Ok(true)
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DownloadHandle>, DownloadStoreError> {
        let mut expired: Vec<DownloadHandle> = self
            .handles
            .read()
            .unwrap()
            .values()
            .filter(|h| h.bundle_name.is_some() && h.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|h| h.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    fn release_bundle(&self, id: DownloadHandleId, now: DateTime<Utc>) -> Result<bool, DownloadStoreError> {
        let mut handles = self.handles.write().unwrap();
        let Some(handle) = handles.get_mut(&id) else {
            return Ok(false);
        };
        if !handle.is_expired(now) {
            return Ok(false);
        }
        handle.bundle_name = None;
        handle.download_url = None;
        handle.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirpack_core::{JobId, OwnerId};

    #[test]
    fn complete_then_expire() {
        let store = InMemoryDownloadStore::new();
        let handle = DownloadHandle::pending(DownloadHandleId::new(), JobId::new(), OwnerId::new());
        let id = handle.id;
        store.create(handle.clone()).unwrap();
        assert_eq!(store.create(handle), Err(DownloadStoreError::AlreadyExists(id)));

        let later = Utc::now() + chrono::Duration::hours(24);
        assert!(store.complete(id, "http://x/download-dir?name=a&jobId=1", "a", later).unwrap());
        let now = Utc::now();
        assert!(!store.get(id).unwrap().unwrap().is_expired(now));

        assert!(store.expire_now(id, now).unwrap());
        let stored = store.get(id).unwrap().unwrap();
        assert!(stored.is_expired(now));
        assert_eq!(stored.bundle_name.as_deref(), Some("a"));

        assert!(!store.expire_now(DownloadHandleId::new(), now).unwrap());
    }

    #[test]
    fn only_expired_handles_with_a_bundle_are_listed() {
        let store = InMemoryDownloadStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (bundle, expires_at) in [
            (Some("late.tar.gz"), now - chrono::Duration::minutes(1)),
            (Some("early.tar.gz"), now - chrono::Duration::hours(1)),
            (Some("live.tar.gz"), now + chrono::Duration::hours(1)),
            (None, now - chrono::Duration::hours(2)),
        ] {
            let mut handle = DownloadHandle::pending(DownloadHandleId::new(), JobId::new(), OwnerId::new());
            handle.bundle_name = bundle.map(str::to_string);
            handle.expires_at = Some(expires_at);
            ids.push(handle.id);
            store.create(handle).unwrap();
        }

        let expired = store.list_expired(now, 10).unwrap();
        let names: Vec<_> = expired.iter().filter_map(|h| h.bundle_name.as_deref()).collect();
        assert_eq!(names, vec!["early.tar.gz", "late.tar.gz"]);
        assert_eq!(store.list_expired(now, 1).unwrap().len(), 1);

        assert!(store.release_bundle(ids[0], now).unwrap());
        assert!(!store.release_bundle(ids[2], now).unwrap());
        assert_eq!(store.list_expired(now, 10).unwrap().len(), 1);
        assert_eq!(store.get(ids[0]).unwrap().unwrap().download_url, None);
    }
}
