use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{ActionDispatcher, QuizAction};
use crate::clock::SharedClock;
use crate::codec::{Record, RecordCodec, RecordError, VersionedRecord};
use crate::config::PersistenceConfig;
use crate::keys;
use crate::quiz::{AuthRedirectState, QuizResult, QuizState};
use crate::storage::TieredStorage;

/// Read/write access to persisted quiz records. Construct one per storage
/// root and hand it to whatever needs it.
#[derive(Debug, Clone)]
pub struct QuizStorageService {
    storage: TieredStorage,
    codec: RecordCodec,
}

impl QuizStorageService {
    pub fn new(storage: TieredStorage, config: PersistenceConfig, clock: SharedClock) -> Self {
        Self {
            storage,
            codec: RecordCodec::new(config, clock),
        }
    }

    pub fn storage(&self) -> &TieredStorage {
        &self.storage
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    pub fn config(&self) -> &PersistenceConfig {
        self.codec.config()
    }

    fn save_record<T: Serialize>(&self, key: &str, payload: &T) -> bool {
        match self.codec.encode(payload) {
            Ok(raw) => self.storage.set(key, &raw),
            Err(e) => {
                warn!("failed to encode record for {}: {}", key, e);
                false
            }
        }
    }

    fn load_record<T: Record>(&self, key: &str) -> Result<VersionedRecord<T>, RecordError> {
        let raw = self.storage.get(key).ok_or(RecordError::Empty)?;
        self.codec.decode::<T>(&raw).map_err(|e| {
            if e.should_remove() {
                warn!("discarding {} record: {}", T::KIND, e.clone().into_error(key));
                self.storage.remove(key);
            }
            e
        })
    }

    pub fn save_quiz_state(&self, state: &QuizState) -> bool {
        self.save_record(&keys::quiz_state(&state.slug), state)
    }

    pub fn load_quiz_state(&self, slug: &str) -> Option<QuizState> {
        let mut state = self
            .load_record::<QuizState>(&keys::quiz_state(slug))
            .ok()?
            .payload;
        if state.slug.is_empty() {
            state.slug = slug.to_string();
        }
        Some(state)
    }

    pub fn save_quiz_results(&self, result: &QuizResult) -> bool {
        self.save_record(&keys::quiz_results(&result.slug), result)
    }

    pub fn load_quiz_results(&self, slug: &str) -> Option<QuizResult> {
        let mut result = self
            .load_record::<QuizResult>(&keys::quiz_results(slug))
            .ok()?
            .payload;
        if result.slug.is_empty() {
            result.slug = slug.to_string();
        }
        Some(result)
    }

    pub fn save_auth_redirect(&self, redirect: &AuthRedirectState) -> bool {
        self.save_record(keys::AUTH_REDIRECT_KEY, redirect)
    }

    /// Reads the pending auth redirect without consuming it.
    pub fn peek_auth_redirect(&self) -> Option<VersionedRecord<AuthRedirectState>> {
        self.load_record(keys::AUTH_REDIRECT_KEY).ok()
    }

    /// Consumes the stored auth-redirect snapshot. A valid snapshot is
    /// dispatched once as a restore action; the key is removed either way.
    /// Returns whether an action was dispatched.
    pub fn check_stored_auth_redirect_state(&self, dispatcher: &dyn ActionDispatcher) -> bool {
        if self.storage.get(keys::AUTH_REDIRECT_KEY).is_none() {
            return false;
        }
        match self.load_record::<AuthRedirectState>(keys::AUTH_REDIRECT_KEY) {
            Ok(record) => {
                info!(
                    "restoring {} at question {} after sign-in",
                    record.payload.slug, record.payload.current_question
                );
                dispatcher.dispatch(QuizAction::RestoreFromAuthRedirect(record));
                self.storage.remove(keys::AUTH_REDIRECT_KEY);
                true
            }
            Err(e) => {
                debug!("no usable auth redirect: {}", e);
                self.storage.remove(keys::AUTH_REDIRECT_KEY);
                false
            }
        }
    }

    /// Writes the result, removes the in-progress state and sets the
    /// completion marker. Every step runs even if an earlier one failed.
    pub fn complete_quiz(&self, result: &QuizResult) -> bool {
        let saved = self.save_quiz_results(result);
        self.storage.remove(&keys::quiz_state(&result.slug));
        self.mark_completed(&result.slug);
        saved
    }

    pub fn mark_completed(&self, slug: &str) -> bool {
        self.storage.set(&keys::quiz_completed(slug), "true")
    }

    pub fn is_quiz_completed(&self, slug: &str) -> bool {
        self.storage.get(&keys::quiz_completed(slug)).as_deref() == Some("true")
    }

    /// Drops the finished result and completion marker for `slug` so a new
    /// attempt does not sit next to the old outcome. Returns whether a
    /// result was removed.
    pub fn supersede_result(&self, slug: &str) -> bool {
        let results_key = keys::quiz_results(slug);
        let had_result = self.storage.contains(&results_key);
        if had_result {
            info!("new attempt on {}, retiring previous result", slug);
            self.storage.remove(&results_key);
        }
        self.storage.remove(&keys::quiz_completed(slug));
        had_result
    }

    /// With a slug, removes that quiz's state, results and completion marker
    /// plus the shared auth-redirect key. Without one, only the auth-redirect key.
    pub fn clear_persisted_quiz_state(&self, slug: Option<&str>) {
        if let Some(slug) = slug {
            self.storage.remove(&keys::quiz_state(slug));
            self.storage.remove(&keys::quiz_results(slug));
            self.storage.remove(&keys::quiz_completed(slug));
        }
        self.storage.remove(keys::AUTH_REDIRECT_KEY);
    }

    /// Removes every `quiz_` key in every tier.
    pub fn clear_all_quiz_keys(&self) -> usize {
        let keys = self.storage.keys_with_prefix(keys::QUIZ_PREFIX);
        for key in &keys {
            self.storage.remove(key);
        }
        keys.len()
    }

    pub fn guest_results(&self) -> Vec<QuizResult> {
        let Some(raw) = self.storage.get(keys::GUEST_RESULTS_KEY) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<QuizResult>>(&raw) {
            Ok(results) => results,
            Err(e) => {
                warn!("discarding unreadable guest results: {}", e);
                self.storage.remove(keys::GUEST_RESULTS_KEY);
                Vec::new()
            }
        }
    }

    /// Appends a result for a signed-out user, replacing any earlier result
    /// for the same quiz.
    pub fn save_guest_result(&self, result: &QuizResult) -> bool {
        let mut results = self.guest_results();
        results.retain(|existing| existing.quiz_id != result.quiz_id);
        results.push(result.clone());
        match serde_json::to_string(&results) {
            Ok(raw) => self.storage.set(keys::GUEST_RESULTS_KEY, &raw),
            Err(e) => {
                warn!("failed to encode guest results: {}", e);
                false
            }
        }
    }

    pub fn clear_guest_results(&self) {
        self.storage.remove(keys::GUEST_RESULTS_KEY);
    }

    pub fn set_pending_result(&self, result: &QuizResult) -> bool {
        self.save_record(keys::PENDING_RESULT_KEY, result)
    }

    /// Returns the result waiting for a post-sign-in save and removes it.
    pub fn take_pending_result(&self) -> Option<QuizResult> {
        let record = self.load_record::<QuizResult>(keys::PENDING_RESULT_KEY).ok();
        self.storage.remove(keys::PENDING_RESULT_KEY);
        record.map(|r| r.payload)
    }
}
