//! Process-local instance registry
//!
//! Maps instance id to the observed [`InstanceRecord`]. Single writer,
//! many readers; traversal takes an explicit snapshot under the read lock so
//! no guard is held across awaits.

use crate::instance::InstanceRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Concurrent-safe id → record map, retired with the process.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    records: Arc<RwLock<HashMap<String, InstanceRecord>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, overwriting any previous record with the same id.
    pub async fn add(&self, record: InstanceRecord) {
        let mut records = self.records.write().await;
        records.insert(record.instance_id.clone(), record);
    }

    pub async fn get(&self, instance_id: &str) -> Option<InstanceRecord> {
        let records = self.records.read().await;
        records.get(instance_id).cloned()
    }

    pub async fn count(&self) -> usize {
        let records = self.records.read().await;
        records.len()
    }

    /// Consistent snapshot of every record, collected under the read lock.
    ///
    /// Returned in instance-id order so traversals are deterministic.
    pub async fn snapshot(&self) -> Vec<InstanceRecord> {
        let records = self.records.read().await;
        let mut out: Vec<InstanceRecord> = records.values().cloned().collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    /// Drop all records.
    pub async fn reset(&self) {
        let mut records = self.records.write().await;
        records.clear();
    }

    /// Debug dump of the current contents.
    pub async fn dump(&self) -> String {
        let records = self.records.read().await;
        format!("{:#?}", *records)
    }
}

impl Clone for InstanceRegistry {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}
