//! Keyed persistence of fiche loop state for suspend/resume.
//!
//! Checkpoints are keyed by thread id. The durable backend rides on the
//! thread's `fiche_state` column; the memory saver backs tests. The
//! checkpoint carries loop bookkeeping only; conversation state lives in
//! the thread messages themselves, which is what makes continuation a
//! fresh task instead of a resumed stack.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::Database;
use crate::error::DatabaseError;

#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn load(&self, thread_id: i64) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn save(&self, thread_id: i64, state: &serde_json::Value) -> Result<(), DatabaseError>;

    async fn clear(&self, thread_id: i64) -> Result<(), DatabaseError>;
}

/// Durable checkpoints stored on the thread row.
pub struct DbCheckpointer {
    db: Arc<dyn Database>,
}

impl DbCheckpointer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Checkpointer for DbCheckpointer {
    async fn load(&self, thread_id: i64) -> Result<Option<serde_json::Value>, DatabaseError> {
        self.db.get_thread_state(thread_id).await
    }

    async fn save(&self, thread_id: i64, state: &serde_json::Value) -> Result<(), DatabaseError> {
        self.db.set_thread_state(thread_id, Some(state)).await
    }

    async fn clear(&self, thread_id: i64) -> Result<(), DatabaseError> {
        self.db.set_thread_state(thread_id, None).await
    }
}

/// Fast in-memory checkpoints for tests.
#[derive(Default)]
pub struct MemoryCheckpointer {
    states: Mutex<HashMap<i64, serde_json::Value>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn load(&self, thread_id: i64) -> Result<Option<serde_json::Value>, DatabaseError> {
        Ok(self.states.lock().await.get(&thread_id).cloned())
    }

    async fn save(&self, thread_id: i64, state: &serde_json::Value) -> Result<(), DatabaseError> {
        self.states.lock().await.insert(thread_id, state.clone());
        Ok(())
    }

    async fn clear(&self, thread_id: i64) -> Result<(), DatabaseError> {
        self.states.lock().await.remove(&thread_id);
        Ok(())
    }
}
