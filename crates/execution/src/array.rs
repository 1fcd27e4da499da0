//! Execution array: ordered, observable item state
//!
//! The array owns the state of one execution. Every mutation bumps the
//! snapshot version and notifies observers synchronously, in mutation order,
//! before the mutating call returns. The array does no I/O.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use types::{
    ArrayEvent, ExecutionArrayState, ExecutionId, ExecutionItem, ExecutionResult, ExecutionStatus,
    ExecutorError, ItemPayload, PlanError, Result, SessionId,
};

/// Handle returned by `subscribe`
pub type ObserverId = u64;

type Observer = Arc<dyn Fn(&ArrayEvent) + Send + Sync>;

/// Observable container of one execution's items
///
/// Observers run while mutations are serialized, so they must not mutate
/// the array themselves. Reading a snapshot from an observer is fine.
pub struct ExecutionArray {
    state: Mutex<ExecutionArrayState>,
    observers: Mutex<BTreeMap<ObserverId, Observer>>,
    /// Held across mutate + notify so deliveries keep mutation order
    ordering: Mutex<()>,
    next_observer: AtomicU64,
    paused: watch::Sender<bool>,
}

impl ExecutionArray {
    pub fn new(execution_id: ExecutionId, session_id: SessionId) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(ExecutionArrayState::new(execution_id, session_id)),
            observers: Mutex::new(BTreeMap::new()),
            ordering: Mutex::new(()),
            next_observer: AtomicU64::new(1),
            paused,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.lock_state().execution_id
    }

    pub fn session_id(&self) -> SessionId {
        self.lock_state().session_id.clone()
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> ExecutionArrayState {
        self.lock_state().clone()
    }

    pub fn item(&self, id: &str) -> Option<ExecutionItem> {
        self.lock_state().item(id).cloned()
    }

    pub fn is_executing(&self) -> bool {
        self.lock_state().is_executing
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Initialize with planned items, only while empty and idle
    pub fn seed(&self, items: Vec<ExecutionItem>) -> Result<()> {
        if items.is_empty() {
            return Err(PlanError::Empty.into());
        }

        self.mutate(|state| {
            if state.is_executing || !state.items.is_empty() {
                return Err(PlanError::NotIdle.into());
            }

            {
                let mut seen = std::collections::HashSet::new();
                if let Some(dup) = items.iter().find(|item| !seen.insert(item.id.as_str())) {
                    return Err(PlanError::DuplicateId { id: dup.id.clone() }.into());
                }
            }

            let now = Utc::now();
            state.items = items
                .into_iter()
                .enumerate()
                .map(|(index, mut item)| {
                    item.index = index;
                    item.status = ExecutionStatus::Pending;
                    item.result = None;
                    item.updated_at = now;
                    item
                })
                .collect();
            state.current_index = None;
            Ok(())
        })
    }

    /// Items still `pending`, in index order
    pub fn ready_items(&self) -> Vec<ExecutionItem> {
        self.items_by_status(ExecutionStatus::Pending)
    }

    /// Items currently in `status`, in index order
    pub fn items_by_status(&self, status: ExecutionStatus) -> Vec<ExecutionItem> {
        self.lock_state()
            .items
            .iter()
            .filter(|item| item.status == status)
            .cloned()
            .collect()
    }

    pub fn set_current_index(&self, index: Option<usize>) -> Result<()> {
        self.mutate(|state| {
            if let Some(i) = index {
                if i >= state.items.len() {
                    return Err(ExecutorError::State(format!(
                        "index {} out of range for {} items",
                        i,
                        state.items.len()
                    )));
                }
            }
            state.current_index = index;
            Ok(())
        })
    }

    pub fn set_executing(&self, executing: bool) -> Result<()> {
        self.mutate(|state| {
            state.is_executing = executing;
            Ok(())
        })
    }

    /// Flip `is_executing` on, failing if a run is already in progress
    pub fn begin_execution(&self) -> Result<()> {
        self.mutate(|state| {
            if state.is_executing {
                return Err(ExecutorError::AlreadyExecuting {
                    execution_id: state.execution_id.to_string(),
                });
            }
            state.is_executing = true;
            Ok(())
        })
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.mutate(|state| {
            state.is_paused = paused;
            Ok(())
        })?;
        self.paused.send_replace(paused);
        Ok(())
    }

    /// Resolves immediately when not paused, otherwise once resumed
    pub async fn wait_until_resumed(&self) {
        let mut rx = self.paused.subscribe();
        // The sender lives as long as the array, so this cannot fail
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Move an item along the state graph
    pub fn update_status(&self, id: &str, status: ExecutionStatus, error: Option<String>) -> Result<()> {
        self.mutate(|state| {
            let item = find_item(state, id)?;
            transition(item, status)?;
            if let Some(error) = error {
                if item.result.is_none() {
                    item.result = Some(ExecutionResult::failure(error));
                }
            }
            Ok(())
        })
    }

    /// Attach a result; a terminal item's result is set at most once
    pub fn update_result(&self, id: &str, result: ExecutionResult) -> Result<()> {
        self.mutate(|state| {
            let item = find_item(state, id)?;
            if item.status.is_terminal() && item.result.is_some() {
                return Err(ExecutorError::ItemTerminal {
                    item_id: item.id.clone(),
                    status: item.status.to_string(),
                });
            }
            item.result = Some(result);
            item.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Move to a terminal status and attach its result in one notification
    pub fn finish(&self, id: &str, status: ExecutionStatus, result: ExecutionResult) -> Result<()> {
        if !status.is_terminal() {
            return Err(ExecutorError::State(format!("{} is not a terminal status", status)));
        }
        self.mutate(|state| {
            let item = find_item(state, id)?;
            transition(item, status)?;
            item.result = Some(result);
            Ok(())
        })
    }

    /// Move forward to `target` unless the item is already there or beyond
    ///
    /// Returns whether the status changed.
    pub fn advance(&self, id: &str, target: ExecutionStatus) -> Result<bool> {
        let current = self
            .item(id)
            .map(|item| item.status)
            .ok_or_else(|| not_found(id))?;
        if current.rank() >= target.rank() {
            return Ok(false);
        }

        // Pending -> Signing goes through Ready
        if current == ExecutionStatus::Pending && target == ExecutionStatus::Signing {
            self.update_status(id, ExecutionStatus::Ready, None)?;
        }
        self.update_status(id, target, None)?;
        Ok(true)
    }

    /// Complete a `user_input` item with the value the user supplied
    pub fn resolve_user_input(&self, id: &str, value: serde_json::Value) -> Result<()> {
        self.mutate(|state| {
            let item = find_item(state, id)?;
            match &mut item.payload {
                ItemPayload::UserInput { value: slot, .. } => {
                    *slot = Some(value.clone());
                }
                _ => {
                    return Err(ExecutorError::State(format!(
                        "item {} is {}, not user_input",
                        id,
                        item.execution_type().as_str()
                    )))
                }
            }
            transition(item, ExecutionStatus::Completed)?;
            item.result = Some(ExecutionResult::with_data(value));
            Ok(())
        })
    }

    /// Register a synchronous observer
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&ArrayEvent) + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.lock_observers().insert(id, Arc::new(observer));
        id
    }

    /// Observer forwarding events into an unbounded channel
    pub fn subscribe_channel(&self) -> (ObserverId, mpsc::UnboundedReceiver<ArrayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Returns whether the observer was registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.lock_observers().remove(&id).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.lock_observers().len()
    }

    /// Fire the end-of-run notification
    pub fn notify_completed(&self, success: bool, error: Option<String>) {
        let _order = self.lock_ordering();
        let state = self.snapshot();
        self.notify(&ArrayEvent::Completed { state, success, error });
    }

    fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ExecutionArrayState) -> Result<R>,
    {
        let _order = self.lock_ordering();
        let (value, snapshot) = {
            let mut state = self.lock_state();
            let value = f(&mut state)?;
            state.version += 1;
            state.updated_at = Utc::now();
            state.recount();
            (value, state.clone())
        };
        debug!(
            execution_id = %snapshot.execution_id,
            version = snapshot.version,
            "Execution array updated"
        );
        self.notify(&ArrayEvent::Updated(snapshot));
        Ok(value)
    }

    fn notify(&self, event: &ArrayEvent) {
        let observers: Vec<Observer> = self.lock_observers().values().cloned().collect();
        for observer in observers {
            observer(event);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ExecutionArrayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_observers(&self) -> MutexGuard<'_, BTreeMap<ObserverId, Observer>> {
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_ordering(&self) -> MutexGuard<'_, ()> {
        self.ordering.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(id: &str) -> ExecutorError {
    ExecutorError::NotFound {
        resource: format!("item {}", id),
    }
}

fn find_item<'a>(state: &'a mut ExecutionArrayState, id: &str) -> Result<&'a mut ExecutionItem> {
    state
        .items
        .iter_mut()
        .find(|item| item.id == id)
        .ok_or_else(|| not_found(id))
}

fn transition(item: &mut ExecutionItem, next: ExecutionStatus) -> Result<()> {
    if item.status.is_terminal() {
        return Err(ExecutorError::ItemTerminal {
            item_id: item.id.clone(),
            status: item.status.to_string(),
        });
    }
    if !item.status.can_transition_to(next) {
        return Err(ExecutorError::InvalidTransition {
            item_id: item.id.clone(),
            from: item.status.to_string(),
            to: next.to_string(),
        });
    }
    item.status = next;
    item.updated_at = Utc::now();
    Ok(())
}
