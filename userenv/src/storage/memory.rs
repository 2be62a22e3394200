//! In-process object store with real compare-and-swap semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{ObjectStore, PutCondition, StoredObject};

/// Object store held in memory. Used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    next_etag: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    fn mint_etag(&self) -> String {
        let n = self.next_etag.fetch_add(1, Ordering::Relaxed) + 1;
        format!("\"{:016x}\"", n)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &str) -> UserEnvResult<Option<StoredObject>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition<'_>,
    ) -> UserEnvResult<String> {
        let mut objects = self.objects.lock();
        match (condition, objects.get(key)) {
            (PutCondition::Always, _) => {}
            (PutCondition::IfAbsent, None) => {}
            (PutCondition::IfAbsent, Some(_)) => {
                return Err(UserEnvError::PreconditionFailed(format!(
                    "{}: object already exists",
                    key
                )));
            }
            (PutCondition::IfMatch(expected), Some(current)) if current.etag == expected => {}
            (PutCondition::IfMatch(expected), Some(current)) => {
                return Err(UserEnvError::PreconditionFailed(format!(
                    "{}: etag {} does not match {}",
                    key, current.etag, expected
                )));
            }
            (PutCondition::IfMatch(_), None) => {
                return Err(UserEnvError::PreconditionFailed(format!(
                    "{}: object does not exist",
                    key
                )));
            }
        }
        let etag = self.mint_etag();
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> UserEnvResult<()> {
        self.objects.lock().remove(key);
        Ok(())
    }
}
