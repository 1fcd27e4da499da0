//! Session-scoped execution context

use broadcast::ExecutionHub;
use chrono::{DateTime, Utc};
use execution::ExecutionArray;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use types::{ExecutionId, SessionId};

/// Everything one client session owns: its hub and its executions
pub struct SessionContext {
    session_id: SessionId,
    hub: ExecutionHub,
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionArray>>>,
    created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        let session_id = session_id.into();
        Self {
            hub: ExecutionHub::new(session_id.clone()),
            session_id,
            executions: RwLock::new(HashMap::new()),
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn hub(&self) -> &ExecutionHub {
        &self.hub
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Track an array and start publishing its mutations
    pub async fn register(&self, array: Arc<ExecutionArray>) {
        self.hub.attach(&array);
        self.executions.write().await.insert(array.execution_id(), array);
    }

    pub async fn execution(&self, execution_id: &ExecutionId) -> Option<Arc<ExecutionArray>> {
        self.executions.read().await.get(execution_id).cloned()
    }

    pub async fn execution_ids(&self) -> Vec<ExecutionId> {
        self.executions.read().await.keys().copied().collect()
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }

    /// Discard idle executions untouched for longer than `retention`
    pub async fn prune(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or_else(Utc::now);

        let expired: Vec<ExecutionId> = {
            let mut executions = self.executions.write().await;
            let expired: Vec<ExecutionId> = executions
                .iter()
                .filter(|(_, array)| {
                    let state = array.snapshot();
                    !state.is_executing && state.updated_at < cutoff
                })
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                executions.remove(id);
            }
            expired
        };

        for id in &expired {
            self.hub.detach(id);
        }
        if !expired.is_empty() {
            info!(session_id = %self.session_id, removed = expired.len(), "Pruned finished executions");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ExecutionItem, ItemPayload};
    use uuid::Uuid;

    fn array(session: &str) -> Arc<ExecutionArray> {
        let array = ExecutionArray::new(Uuid::new_v4(), session.to_string());
        array
            .seed(vec![ExecutionItem::new(
                "a",
                0,
                "a",
                ItemPayload::DataFetch { data: serde_json::json!(1) },
            )])
            .unwrap();
        Arc::new(array)
    }

    #[tokio::test]
    async fn test_register_attaches_to_hub() {
        let session = SessionContext::new("s1");
        let array = array("s1");
        session.register(array.clone()).await;

        assert_eq!(session.execution_count().await, 1);
        assert!(session.hub().latest(&array.execution_id()).is_some());
        assert_eq!(array.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_prune_skips_running_executions() {
        let session = SessionContext::new("s1");
        let idle = array("s1");
        let running = array("s1");
        running.begin_execution().unwrap();
        session.register(idle.clone()).await;
        session.register(running.clone()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = session.prune(Duration::from_millis(5)).await;

        assert_eq!(removed, 1);
        assert!(session.execution(&idle.execution_id()).await.is_none());
        assert!(session.execution(&running.execution_id()).await.is_some());
        assert_eq!(idle.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_executions() {
        let session = SessionContext::new("s1");
        session.register(array("s1")).await;
        assert_eq!(session.prune(Duration::from_secs(3600)).await, 0);
    }
}
