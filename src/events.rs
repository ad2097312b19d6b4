use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{Record, RecordCodec};
use crate::config::PersistenceConfig;
use crate::keys;
use crate::replay::{self, Projections};
use crate::storage::TieredStorage;
use crate::sync::EventSync;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgressEventType {
    CourseStarted,
    CourseProgressUpdated,
    QuizStarted,
    QuestionAnswered,
    QuizCompleted,
    CourseCompleted,
    VideoWatched,
    ChapterCompleted,
    /// A type this build does not know. Kept verbatim and skipped by replay.
    Other(String),
}

impl ProgressEventType {
    pub fn as_str(&self) -> &str {
        match self {
            ProgressEventType::CourseStarted => "COURSE_STARTED",
            ProgressEventType::CourseProgressUpdated => "COURSE_PROGRESS_UPDATED",
            ProgressEventType::QuizStarted => "QUIZ_STARTED",
            ProgressEventType::QuestionAnswered => "QUESTION_ANSWERED",
            ProgressEventType::QuizCompleted => "QUIZ_COMPLETED",
            ProgressEventType::CourseCompleted => "COURSE_COMPLETED",
            ProgressEventType::VideoWatched => "VIDEO_WATCHED",
            ProgressEventType::ChapterCompleted => "CHAPTER_COMPLETED",
            ProgressEventType::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "COURSE_STARTED" => ProgressEventType::CourseStarted,
            "COURSE_PROGRESS_UPDATED" => ProgressEventType::CourseProgressUpdated,
            "QUIZ_STARTED" => ProgressEventType::QuizStarted,
            "QUESTION_ANSWERED" => ProgressEventType::QuestionAnswered,
            "QUIZ_COMPLETED" => ProgressEventType::QuizCompleted,
            "COURSE_COMPLETED" => ProgressEventType::CourseCompleted,
            "VIDEO_WATCHED" => ProgressEventType::VideoWatched,
            "CHAPTER_COMPLETED" => ProgressEventType::ChapterCompleted,
            other => ProgressEventType::Other(other.to_string()),
        }
    }
}

impl Serialize for ProgressEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProgressEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ProgressEventType::parse(&name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Course,
    Quiz,
    Question,
    Chapter,
    #[serde(other)]
    Other,
}

/// An immutable progress fact. Corrections are new events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub id: String,
    pub user_id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourseProgressMeta {
    pub progress: f64,
    pub completed_chapters: Vec<String>,
    pub current_chapter: Option<String>,
    pub time_spent: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizStartedMeta {
    pub course_id: Option<String>,
    pub total_questions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuestionAnsweredMeta {
    pub quiz_id: String,
    pub answer: Value,
    pub is_correct: Option<bool>,
    pub time_spent: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizCompletedMeta {
    pub score: f64,
    pub total_questions: usize,
    pub correct_answers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoWatchedMeta {
    pub course_id: Option<String>,
    pub progress: f64,
    pub played_seconds: f64,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChapterCompletedMeta {
    pub course_id: Option<String>,
}

fn to_metadata<T: Serialize>(meta: &T) -> Map<String, Value> {
    match serde_json::to_value(meta) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

impl ProgressEvent {
    pub fn new(
        user_id: &str,
        event_type: ProgressEventType,
        entity_id: &str,
        entity_type: EntityType,
        metadata: Map<String, Value>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            timestamp,
            event_type,
            entity_id: entity_id.to_string(),
            entity_type,
            metadata,
        }
    }

    /// Reads the metadata as `T`, `None` if it does not fit.
    pub fn metadata_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(Value::Object(self.metadata.clone())).ok()
    }

    pub fn course_started(user_id: &str, course_id: &str, timestamp: i64) -> Self {
        Self::new(
            user_id,
            ProgressEventType::CourseStarted,
            course_id,
            EntityType::Course,
            Map::new(),
            timestamp,
        )
    }

    pub fn course_progress_updated(
        user_id: &str,
        course_id: &str,
        meta: &CourseProgressMeta,
        timestamp: i64,
    ) -> Self {
        Self::new(
            user_id,
            ProgressEventType::CourseProgressUpdated,
            course_id,
            EntityType::Course,
            to_metadata(meta),
            timestamp,
        )
    }

    pub fn quiz_started(
        user_id: &str,
        quiz_id: &str,
        meta: &QuizStartedMeta,
        timestamp: i64,
    ) -> Self {
        Self::new(
            user_id,
            ProgressEventType::QuizStarted,
            quiz_id,
            EntityType::Quiz,
            to_metadata(meta),
            timestamp,
        )
    }

    pub fn question_answered(
        user_id: &str,
        question_id: &str,
        meta: &QuestionAnsweredMeta,
        timestamp: i64,
    ) -> Self {
        Self::new(
            user_id,
            ProgressEventType::QuestionAnswered,
            question_id,
            EntityType::Question,
            to_metadata(meta),
            timestamp,
        )
    }

    pub fn quiz_completed(
        user_id: &str,
        quiz_id: &str,
        meta: &QuizCompletedMeta,
        timestamp: i64,
    ) -> Self {
        Self::new(
            user_id,
            ProgressEventType::QuizCompleted,
            quiz_id,
            EntityType::Quiz,
            to_metadata(meta),
            timestamp,
        )
    }

    pub fn course_completed(user_id: &str, course_id: &str, timestamp: i64) -> Self {
        Self::new(
            user_id,
            ProgressEventType::CourseCompleted,
            course_id,
            EntityType::Course,
            Map::new(),
            timestamp,
        )
    }

    pub fn video_watched(
        user_id: &str,
        chapter_id: &str,
        meta: &VideoWatchedMeta,
        timestamp: i64,
    ) -> Self {
        Self::new(
            user_id,
            ProgressEventType::VideoWatched,
            chapter_id,
            EntityType::Chapter,
            to_metadata(meta),
            timestamp,
        )
    }

    pub fn chapter_completed(
        user_id: &str,
        chapter_id: &str,
        meta: &ChapterCompletedMeta,
        timestamp: i64,
    ) -> Self {
        Self::new(
            user_id,
            ProgressEventType::ChapterCompleted,
            chapter_id,
            EntityType::Chapter,
            to_metadata(meta),
            timestamp,
        )
    }
}

/// What the event log persists about itself. `baseline` holds the
/// projections of events already folded out of `events`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogRecord {
    pub events: Vec<ProgressEvent>,
    #[serde(default)]
    pub synced_ids: Vec<String>,
    #[serde(default)]
    pub baseline: Projections,
}

impl Record for EventLogRecord {
    const KIND: &'static str = "progress event log";
    const SIGNATURE_FIELDS: &'static [&'static str] = &["events"];

    fn ttl_ms(_config: &PersistenceConfig) -> Option<u64> {
        None
    }

    fn backfill(fields: &mut Map<String, Value>, _stamped_at: i64) {
        if !fields.contains_key("syncedIds") {
            fields.insert("syncedIds".to_string(), Value::Array(Vec::new()));
        }
    }
}

#[derive(Default)]
struct LogState {
    baseline: Projections,
    events: Vec<ProgressEvent>,
    synced: HashSet<String>,
    in_flight: HashSet<String>,
    sync_generation: u64,
    sync_timer: Option<JoinHandle<()>>,
}

struct LogShared {
    storage: TieredStorage,
    codec: RecordCodec,
    sync: Arc<dyn EventSync>,
    state: Mutex<LogState>,
}

impl LogShared {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &LogState) {
        let mut synced_ids: Vec<String> = state.synced.iter().cloned().collect();
        synced_ids.sort();
        let record = EventLogRecord {
            events: state.events.clone(),
            synced_ids,
            baseline: state.baseline.clone(),
        };
        match self.codec.encode(&record) {
            Ok(raw) => {
                self.storage.set(keys::PROGRESS_EVENTS_KEY, &raw);
            }
            Err(e) => warn!("failed to encode progress events: {}", e),
        }
    }

    /// Folds synced events older than the retention horizon into the
    /// baseline. Only events older than every retained one are folded, so
    /// replaying what is left on top of the baseline matches a full replay.
    fn compact(&self, state: &mut LogState) {
        let Some(retention) = self.codec.config().event_retention_ms else {
            return;
        };
        let cutoff = self.codec.now_ms().saturating_sub(retention as i64);
        let events = std::mem::take(&mut state.events);
        let foldable =
            |event: &ProgressEvent| state.synced.contains(&event.id) && event.timestamp < cutoff;
        let boundary = events
            .iter()
            .filter(|event| !foldable(event))
            .map(|event| event.timestamp)
            .min();
        let (folded, kept): (Vec<ProgressEvent>, Vec<ProgressEvent>) =
            events.into_iter().partition(|event| {
                foldable(event) && boundary.map_or(true, |limit| event.timestamp < limit)
            });

        state.events = kept;
        if folded.is_empty() {
            return;
        }
        state.baseline = replay::replay_onto(std::mem::take(&mut state.baseline), &folded);
        for event in &folded {
            state.synced.remove(&event.id);
        }
        debug!("folded {} synced progress events into the baseline", folded.len());
    }

    /// Sends every event that is neither synced nor already on its way.
    async fn sync_pending(&self) -> crate::Result<usize> {
        let batch: Vec<ProgressEvent> = {
            let mut state = self.lock();
            let batch: Vec<ProgressEvent> = state
                .events
                .iter()
                .filter(|e| !state.synced.contains(&e.id) && !state.in_flight.contains(&e.id))
                .cloned()
                .collect();
            for event in &batch {
                state.in_flight.insert(event.id.clone());
            }
            batch
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let outcome = self.sync.sync(&batch).await;

        let mut state = self.lock();
        for event in &batch {
            state.in_flight.remove(&event.id);
        }
        match outcome {
            Ok(()) => {
                for event in &batch {
                    state.synced.insert(event.id.clone());
                }
                self.compact(&mut state);
                self.persist(&state);
                debug!("synced {} progress events", batch.len());
                Ok(batch.len())
            }
            Err(e) => {
                warn!("progress sync failed, {} events stay pending: {}", batch.len(), e);
                Err(e)
            }
        }
    }
}

/// Append-only progress log for one user. Appends are persisted at once;
/// server sync runs after a quiet period and batches everything unsynced.
pub struct EventLog {
    user_id: String,
    sync_debounce: Duration,
    shared: Arc<LogShared>,
}

impl EventLog {
    /// Opens the log persisted in `storage`, dropping it if it is unreadable.
    pub fn open(
        user_id: &str,
        storage: TieredStorage,
        codec: RecordCodec,
        sync: Arc<dyn EventSync>,
    ) -> Self {
        let mut state = LogState::default();
        if let Some(raw) = storage.get(keys::PROGRESS_EVENTS_KEY) {
            match codec.decode::<EventLogRecord>(&raw) {
                Ok(record) => {
                    state.baseline = record.payload.baseline;
                    state.synced = record.payload.synced_ids.into_iter().collect();
                    state.events = record.payload.events;
                }
                Err(e) => {
                    if e.should_remove() {
                        warn!("discarding progress event log: {}", e);
                        storage.remove(keys::PROGRESS_EVENTS_KEY);
                    }
                }
            }
        }

        Self {
            user_id: user_id.to_string(),
            sync_debounce: codec.config().event_sync_debounce(),
            shared: Arc::new(LogShared {
                storage,
                codec,
                sync,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn now_ms(&self) -> i64 {
        self.shared.codec.now_ms()
    }

    /// Appends `event` unless an event with the same id is already logged,
    /// persists the log and re-arms the sync timer. Returns whether it was appended.
    pub fn dispatch(&self, event: ProgressEvent) -> bool {
        {
            let mut state = self.shared.lock();
            if state.events.iter().any(|e| e.id == event.id) {
                debug!("event {} already logged", event.id);
                return false;
            }
            debug!(
                "logging {} for {} {}",
                event.event_type.as_str(),
                event.entity_id,
                self.user_id
            );
            state.events.push(event);
            self.shared.compact(&mut state);
            self.shared.persist(&state);
        }
        self.schedule_sync();
        true
    }

    fn schedule_sync(&self) {
        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime, progress sync deferred until flush_sync");
            return;
        };
        let mut state = self.shared.lock();
        state.sync_generation += 1;
        let generation = state.sync_generation;
        let delay = self.sync_debounce;
        let weak = Arc::downgrade(&self.shared);
        let timer = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.lock().sync_generation != generation {
                return;
            }
            let _ = shared.sync_pending().await;
        });
        // Older timers see a stale generation when they wake, so an already
        // running sync is never cut off.
        state.sync_timer = Some(timer);
    }

    /// Syncs everything unsynced right away.
    pub async fn flush_sync(&self) -> crate::Result<usize> {
        self.shared.lock().sync_generation += 1;
        self.shared.sync_pending().await
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.shared.lock().events.clone()
    }

    pub fn unsynced(&self) -> Vec<ProgressEvent> {
        let state = self.shared.lock();
        state
            .events
            .iter()
            .filter(|e| !state.synced.contains(&e.id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replays the retained events on top of the folded baseline.
    pub fn projections(&self) -> Projections {
        let state = self.shared.lock();
        replay::replay_onto(state.baseline.clone(), &state.events)
    }

    /// Drops the whole log, local and persisted.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        if let Some(timer) = state.sync_timer.take() {
            timer.abort();
        }
        state.sync_generation += 1;
        state.baseline = Projections::default();
        state.events.clear();
        state.synced.clear();
        self.shared.storage.remove(keys::PROGRESS_EVENTS_KEY);
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.lock().sync_timer.take() {
            timer.abort();
        }
    }
}
