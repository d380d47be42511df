use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-document write locks scoped to one index.
///
/// Writers to the same `(kb_id, doc_id)` queue up; writers to other
/// documents and all readers proceed without waiting.
#[derive(Default)]
pub struct DocLocks {
    inner: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl DocLocks {
    pub async fn lock(&self, kb_id: &str, doc_id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock();
            // Entries nobody holds or waits on can go.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry((kb_id.to_string(), doc_id.to_string())).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
