//! In-process stores backed by `DashMap`. Nothing survives a restart.

use super::{check_update, key_in_prefix};
use crate::models::{BackupId, BackupRecord, ScheduleState};
use crate::ports::{Admission, BlobStore, RecordFilter, RecordStore, ScheduleStateStore};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<BackupId, BackupRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_if_absent(&self, record: BackupRecord) -> Result<Admission> {
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(existing) => Ok(Admission::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(Admission::Created(record))
            }
        }
    }

    async fn get(&self, id: &BackupId) -> Result<Option<BackupRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &BackupRecord) -> Result<()> {
        let mut current = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| EngineError::NotFound(format!("backup {}", record.id)))?;
        check_update(current.value(), record)?;
        *current.value_mut() = record.clone();
        Ok(())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn remove(&self, id: &BackupId) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryScheduleStates {
    states: DashMap<String, ScheduleState>,
}

impl MemoryScheduleStates {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStateStore for MemoryScheduleStates {
    async fn load(&self, schedule: &str) -> Result<Option<ScheduleState>> {
        Ok(self.states.get(schedule).map(|s| s.value().clone()))
    }

    async fn store(&self, schedule: &str, state: &ScheduleState) -> Result<()> {
        self.states.insert(schedule.to_string(), state.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: DashMap<(String, String), Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<String> {
        self.objects.insert((bucket.to_string(), key.to_string()), data);
        Ok(format!("mem://{bucket}/{key}"))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|data| data.value().clone())
            .ok_or_else(|| EngineError::NotFound(format!("{bucket}/{key}")))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .remove(&(bucket.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("{bucket}/{key}")))
    }

    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket && key_in_prefix(&entry.key().1, prefix))
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        stream::iter(keys.into_iter().map(Ok)).boxed()
    }
}
