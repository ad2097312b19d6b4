use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::action::{PersistTrigger, QuizAction};
use crate::keys;
use crate::quiz::AuthRedirectState;
use crate::scheduler::{DebouncedWriter, LifecycleEvent};
use crate::service::QuizStorageService;
use crate::store::QuizSlice;

/// Watches the quiz action stream and persists snapshots. It never emits
/// actions of its own; restoration goes through
/// `QuizStorageService::check_stored_auth_redirect_state`.
#[derive(Debug)]
pub struct PersistenceMiddleware {
    service: Arc<QuizStorageService>,
    writer: DebouncedWriter,
}

impl PersistenceMiddleware {
    pub fn new(service: Arc<QuizStorageService>) -> Self {
        let writer = DebouncedWriter::new(service.storage().clone(), service.codec().clone());
        Self { service, writer }
    }

    pub fn with_tab_id(service: Arc<QuizStorageService>, tab_id: &str) -> Self {
        let writer = DebouncedWriter::with_tab_id(
            service.storage().clone(),
            service.codec().clone(),
            tab_id,
        );
        Self { service, writer }
    }

    pub fn service(&self) -> &QuizStorageService {
        &self.service
    }

    pub fn writer(&self) -> &DebouncedWriter {
        &self.writer
    }

    /// Called after the container has applied `action`; `before` and
    /// `after` are the slices on either side of it.
    pub fn observe(&self, action: &QuizAction, before: &QuizSlice, after: &QuizSlice) {
        match action.trigger() {
            PersistTrigger::Ignore => {}
            PersistTrigger::StartAttempt => {
                let Some(state) = &after.state else { return };
                self.service.supersede_result(&state.slug);
                self.schedule(
                    &keys::quiz_state(&state.slug),
                    state,
                    self.service.config().state_debounce(),
                );
            }
            PersistTrigger::SaveState => {
                let Some(state) = &after.state else { return };
                self.schedule(
                    &keys::quiz_state(&state.slug),
                    state,
                    self.service.config().state_debounce(),
                );
            }
            PersistTrigger::SaveAuthRedirect => {
                let Some(state) = &after.state else {
                    debug!("auth required with no quiz in progress, nothing to keep");
                    return;
                };
                let redirect = AuthRedirectState::from_state(state, after.redirect_path.clone());
                self.schedule(
                    keys::AUTH_REDIRECT_KEY,
                    &redirect,
                    self.service.config().auth_debounce(),
                );
            }
            PersistTrigger::Complete => {
                let Some(result) = &after.result else {
                    warn!("quiz completed without a result, nothing to persist");
                    return;
                };
                self.writer.cancel(&keys::quiz_state(&result.slug));
                self.service.complete_quiz(result);
            }
            PersistTrigger::Clear => {
                let slug = before.state.as_ref().map(|s| s.slug.as_str());
                if let Some(slug) = slug {
                    self.writer.cancel(&keys::quiz_state(slug));
                }
                self.writer.cancel(keys::AUTH_REDIRECT_KEY);
                self.service.clear_persisted_quiz_state(slug);
            }
        }
    }

    fn schedule<T: Serialize>(&self, key: &str, payload: &T, delay: std::time::Duration) {
        match serde_json::to_value(payload) {
            Ok(value) => self.writer.schedule(key, value, delay),
            Err(e) => warn!("could not snapshot {}: {}", key, e),
        }
    }

    /// Writes whatever is pending right now.
    pub fn flush(&self) -> usize {
        self.writer.flush()
    }

    pub fn attach_lifecycle(&self, events: broadcast::Receiver<LifecycleEvent>) {
        self.writer.attach_lifecycle(events);
    }

    pub fn dispose(&self) {
        self.writer.dispose();
    }
}
