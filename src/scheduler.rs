//! Debounced, per-key writes.
//!
//! Each storage key has at most one pending write. Scheduling a key again
//! replaces its payload and restarts its timer, so only the last snapshot of
//! a burst reaches storage. A `DebouncedWriter` owns its timers: dropping or
//! disposing it aborts them, and timer tasks only hold a weak reference back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::RecordCodec;
use crate::storage::TieredStorage;

/// Host lifecycle signals that force pending writes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Hidden,
    Visible,
    Unload,
}

struct PendingWrite {
    payload: Value,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct WriterState {
    pending: HashMap<String, PendingWrite>,
    next_generation: u64,
    disposed: bool,
    listener: Option<JoinHandle<()>>,
}

struct Shared {
    tab_id: String,
    storage: TieredStorage,
    codec: RecordCodec,
    state: Mutex<WriterState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, key: &str, payload: Value) {
        match self.codec.encode_value(payload) {
            Ok(raw) => {
                if self.storage.set(key, &raw) {
                    debug!(tab = %self.tab_id, key, "flushed debounced write");
                } else {
                    warn!(tab = %self.tab_id, key, "debounced write dropped");
                }
            }
            Err(e) => warn!(tab = %self.tab_id, key, "could not encode snapshot: {}", e),
        }
    }

    // Writes happen with the state lock held. `cancel` takes the same lock,
    // so once it returns no timer can still land a write for that key.
    fn fire(&self, key: &str, generation: u64) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        // A stale timer that lost the race to a reschedule is a no-op.
        let current = state
            .pending
            .get(key)
            .map_or(false, |pending| pending.generation == generation);
        if !current {
            return;
        }
        if let Some(pending) = state.pending.remove(key) {
            self.write(key, pending.payload);
        }
    }

    fn flush_all(&self) -> usize {
        let mut state = self.lock();
        if state.disposed {
            return 0;
        }
        let drained: Vec<(String, PendingWrite)> = state.pending.drain().collect();
        let count = drained.len();
        for (key, pending) in drained {
            pending.timer.abort();
            self.write(&key, pending.payload);
        }
        count
    }
}

pub struct DebouncedWriter {
    shared: Arc<Shared>,
}

impl DebouncedWriter {
    /// A writer with a fresh random tab isolation key.
    pub fn new(storage: TieredStorage, codec: RecordCodec) -> Self {
        Self::with_tab_id(storage, codec, &Uuid::new_v4().simple().to_string())
    }

    pub fn with_tab_id(storage: TieredStorage, codec: RecordCodec, tab_id: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                tab_id: tab_id.to_string(),
                storage,
                codec,
                state: Mutex::new(WriterState::default()),
            }),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.shared.tab_id
    }

    /// Replaces any pending payload for `key` and restarts its timer. Outside
    /// a tokio runtime there is nothing to debounce on, so the write happens
    /// immediately.
    pub fn schedule(&self, key: &str, payload: Value, delay: Duration) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                if !self.is_disposed() {
                    self.shared.write(key, payload);
                }
                return;
            }
        };

        let mut state = self.shared.lock();
        if state.disposed {
            debug!(tab = %self.shared.tab_id, key, "ignoring write after dispose");
            return;
        }
        state.next_generation += 1;
        let generation = state.next_generation;

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let timer_key = key.to_string();
        let timer = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire(&timer_key, generation);
            }
        });

        if let Some(previous) = state.pending.insert(
            key.to_string(),
            PendingWrite {
                payload,
                generation,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    /// Drops the pending write for `key`, if any. A write of `key` already
    /// under way finishes before this returns.
    pub fn cancel(&self, key: &str) -> bool {
        let mut state = self.shared.lock();
        match state.pending.remove(key) {
            Some(pending) => {
                pending.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Writes every pending snapshot now. Returns how many were written.
    pub fn flush(&self) -> usize {
        self.shared.flush_all()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.lock().pending.contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.lock().pending.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// Force-flushes whenever the host reports `Hidden` or `Unload`.
    /// Replaces any previously attached listener.
    pub fn attach_lifecycle(&self, mut events: broadcast::Receiver<LifecycleEvent>) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(tab = %self.shared.tab_id, "no runtime, lifecycle listener not attached");
                return;
            }
        };

        let mut state = self.shared.lock();
        if state.disposed {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let listener = handle.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::Hidden) | Ok(LifecycleEvent::Unload) => {
                        let Some(shared) = weak.upgrade() else { break };
                        let flushed = shared.flush_all();
                        debug!(tab = %shared.tab_id, flushed, "lifecycle flush");
                    }
                    Ok(LifecycleEvent::Visible) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = state.listener.replace(listener) {
            previous.abort();
        }
    }

    /// Cancels every armed timer, discards their payloads and detaches the
    /// lifecycle listener. Safe to call more than once.
    pub fn dispose(&self) {
        let mut state = self.shared.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        for (_, pending) in state.pending.drain() {
            pending.timer.abort();
        }
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        debug!(tab = %self.shared.tab_id, "writer disposed");
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DebouncedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedWriter")
            .field("tab_id", &self.shared.tab_id)
            .field("pending", &self.pending_keys())
            .finish()
    }
}
