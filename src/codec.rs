//! Versioned record envelopes.
//!
//! Every record is stored as its payload's JSON object with two extra keys,
//! `timestamp` (epoch milliseconds) and `version` (schema version string).
//! Decoding classifies a raw string as usable, corrupted, empty, expired or
//! malformed, and upgrades unversioned legacy records in place.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::clock::SharedClock;
use crate::config::PersistenceConfig;
use crate::error::QuizKeepError;
use crate::quiz::{AuthRedirectState, QuizResult, QuizState, QuizType};
use crate::scoring;

const TIMESTAMP_FIELD: &str = "timestamp";
const VERSION_FIELD: &str = "version";

/// A payload together with its envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord<T> {
    #[serde(flatten)]
    pub payload: T,
    pub timestamp: i64,
    pub version: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("record is not valid JSON")]
    Corrupted,
    #[error("record holds no usable fields")]
    Empty,
    #[error("record expired {age_ms} ms after being written")]
    Expired { age_ms: i64 },
    #[error("record has an invalid shape: {0}")]
    InvalidShape(String),
}

impl RecordError {
    /// Whether the stored key should be deleted. Empty records are left alone.
    pub fn should_remove(&self) -> bool {
        !matches!(self, RecordError::Empty)
    }

    pub fn into_error(self, key: &str) -> QuizKeepError {
        match self {
            RecordError::Corrupted => QuizKeepError::CorruptedRecord(key.to_string()),
            RecordError::Empty => QuizKeepError::EmptyRecord(key.to_string()),
            RecordError::Expired { .. } => QuizKeepError::ExpiredRecord(key.to_string()),
            RecordError::InvalidShape(reason) => {
                QuizKeepError::InvalidShape(format!("{}: {}", key, reason))
            }
        }
    }
}

/// A payload type that can live inside a versioned envelope.
pub trait Record: Serialize + DeserializeOwned {
    /// Short name used in logs.
    const KIND: &'static str;

    /// If none of these are present the record is treated as empty.
    const SIGNATURE_FIELDS: &'static [&'static str];

    fn ttl_ms(config: &PersistenceConfig) -> Option<u64>;

    /// Fills absent fields with defaults. `stamped_at` is the envelope
    /// timestamp, or the current time for records written without one.
    fn backfill(_fields: &mut Map<String, Value>, _stamped_at: i64) {}

    /// Rejects records missing fields that cannot be defaulted.
    fn validate(_fields: &Map<String, Value>) -> Result<(), RecordError> {
        Ok(())
    }

    /// Brings an otherwise valid payload back within its invariants.
    fn normalize(self) -> Self {
        self
    }
}

fn fill(fields: &mut Map<String, Value>, name: &str, value: Value) {
    match fields.get(name) {
        Some(Value::Null) | None => {
            fields.insert(name.to_string(), value);
        }
        Some(_) => {}
    }
}

// Older writers stored ids as numbers.
fn stringify_id(fields: &mut Map<String, Value>, name: &str) {
    if let Some(Value::Number(n)) = fields.get(name) {
        let text = n.to_string();
        fields.insert(name.to_string(), Value::String(text));
    }
}

fn default_quiz_type() -> Value {
    Value::String(QuizType::default().as_str().to_string())
}

impl Record for QuizState {
    const KIND: &'static str = "quiz state";
    const SIGNATURE_FIELDS: &'static [&'static str] = &[
        "quizId",
        "quizType",
        "slug",
        "currentQuestion",
        "totalQuestions",
        "startTime",
        "userAnswers",
    ];

    fn ttl_ms(config: &PersistenceConfig) -> Option<u64> {
        Some(config.quiz_state_ttl_ms)
    }

    fn backfill(fields: &mut Map<String, Value>, stamped_at: i64) {
        stringify_id(fields, "quizId");
        fill(fields, "quizId", Value::String(String::new()));
        fill(fields, "quizType", default_quiz_type());
        fill(fields, "slug", Value::String(String::new()));
        fill(fields, "currentQuestion", Value::from(0));
        fill(fields, "userAnswers", Value::Array(Vec::new()));
        fill(fields, "startTime", Value::from(stamped_at));
        fill(fields, "isCompleted", Value::Bool(false));

        let current = fields
            .get("currentQuestion")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let answered = fields
            .get("userAnswers")
            .and_then(Value::as_array)
            .map(|a| a.len() as u64)
            .unwrap_or(0);
        fill(fields, "totalQuestions", Value::from((current + 1).max(answered)));
    }

    fn normalize(mut self) -> Self {
        self.clamp_current_question();
        self
    }
}

impl Record for QuizResult {
    const KIND: &'static str = "quiz result";
    const SIGNATURE_FIELDS: &'static [&'static str] =
        &["quizId", "quizType", "slug", "score", "answers"];

    fn ttl_ms(config: &PersistenceConfig) -> Option<u64> {
        Some(config.quiz_result_ttl_ms)
    }

    fn backfill(fields: &mut Map<String, Value>, stamped_at: i64) {
        stringify_id(fields, "quizId");
        fill(fields, "quizId", Value::String(String::new()));
        fill(fields, "quizType", default_quiz_type());
        fill(fields, "slug", Value::String(String::new()));
        fill(fields, "score", Value::from(0));
        fill(fields, "answers", Value::Array(Vec::new()));
        fill(fields, "totalTime", Value::from(0));
        fill(fields, "createdAt", Value::from(stamped_at));
        fill(fields, "isCompleted", Value::Bool(true));
    }

    fn normalize(mut self) -> Self {
        self.score = scoring::clamp_score(self.quiz_type, self.score);
        self
    }
}

impl Record for AuthRedirectState {
    const KIND: &'static str = "auth redirect";
    const SIGNATURE_FIELDS: &'static [&'static str] =
        &["slug", "quizType", "quizId", "currentQuestion", "answers"];

    fn ttl_ms(config: &PersistenceConfig) -> Option<u64> {
        config.auth_redirect_ttl_ms
    }

    fn backfill(fields: &mut Map<String, Value>, _stamped_at: i64) {
        stringify_id(fields, "quizId");
        fill(fields, "currentQuestion", Value::from(0));
        fill(fields, "answers", Value::Array(Vec::new()));
    }

    fn validate(fields: &Map<String, Value>) -> Result<(), RecordError> {
        match fields.get("slug") {
            Some(Value::String(slug)) if !slug.is_empty() => {}
            _ => return Err(RecordError::InvalidShape("missing slug".to_string())),
        }
        match fields.get("quizType") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(RecordError::InvalidShape("missing quiz type".to_string())),
        }
    }
}

/// Encodes and decodes versioned records against one clock and config.
#[derive(Clone)]
pub struct RecordCodec {
    config: PersistenceConfig,
    clock: SharedClock,
}

impl RecordCodec {
    pub fn new(config: PersistenceConfig, clock: SharedClock) -> Self {
        Self { config, clock }
    }

    pub fn version(&self) -> &str {
        &self.config.schema_version
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Serializes `payload` with a fresh timestamp and the current schema
    /// version, replacing any envelope fields the payload already carried.
    pub fn encode<T: Serialize>(&self, payload: &T) -> crate::Result<String> {
        let value = serde_json::to_value(payload)?;
        self.encode_value(value)
    }

    pub fn encode_value(&self, value: Value) -> crate::Result<String> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(QuizKeepError::InvalidShape(format!(
                    "only objects can be versioned, got {}",
                    other
                )))
            }
        };
        fields.insert(TIMESTAMP_FIELD.to_string(), Value::from(self.clock.now_ms()));
        fields.insert(
            VERSION_FIELD.to_string(),
            Value::String(self.config.schema_version.clone()),
        );
        Ok(serde_json::to_string(&Value::Object(fields))?)
    }

    pub fn decode<T: Record>(&self, raw: &str) -> Result<VersionedRecord<T>, RecordError> {
        let mut fields = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(fields)) => fields,
            Ok(Value::Null) => return Err(RecordError::Empty),
            _ => return Err(RecordError::Corrupted),
        };

        if !T::SIGNATURE_FIELDS
            .iter()
            .any(|name| matches!(fields.get(*name), Some(v) if !v.is_null()))
        {
            return Err(RecordError::Empty);
        }

        let now = self.clock.now_ms();
        let stamped_at = match fields.remove(TIMESTAMP_FIELD) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| RecordError::InvalidShape("timestamp out of range".to_string()))?,
            Some(Value::Null) | None => now,
            Some(_) => return Err(RecordError::InvalidShape("timestamp is not a number".to_string())),
        };

        if let Some(ttl) = T::ttl_ms(&self.config) {
            let age_ms = now - stamped_at;
            if age_ms > ttl as i64 {
                return Err(RecordError::Expired { age_ms });
            }
        }

        let version = match fields.remove(VERSION_FIELD) {
            Some(Value::String(version)) => version,
            _ => {
                info!(
                    "upgrading unversioned {} record to {}",
                    T::KIND,
                    self.config.schema_version
                );
                self.config.schema_version.clone()
            }
        };

        T::validate(&fields)?;
        T::backfill(&mut fields, stamped_at);

        let payload: T = serde_json::from_value(Value::Object(fields))
            .map_err(|e| RecordError::InvalidShape(e.to_string()))?;

        Ok(VersionedRecord {
            payload: payload.normalize(),
            timestamp: stamped_at,
            version,
        })
    }
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("version", &self.config.schema_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quiz::{QuizAnswer, UserAnswer};
    use std::sync::Arc;

    const HOUR_MS: i64 = 60 * 60 * 1000;
    const NOW: i64 = 1_700_000_000_000;

    fn codec() -> (RecordCodec, ManualClock) {
        let clock = ManualClock::new(NOW);
        (
            RecordCodec::new(PersistenceConfig::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    fn sample_state() -> QuizState {
        let mut state = QuizState::new("42", QuizType::MultipleChoice, "test-quiz", 10, NOW - 5_000);
        state.set_current_question(3);
        state.record_answer(QuizAnswer::new(1, "b").with_time_spent(4));
        state
    }

    #[test]
    fn test_round_trip_refreshes_envelope_only() {
        let (codec, _) = codec();
        let state = sample_state();
        let raw = codec.encode(&state).unwrap();
        let record: VersionedRecord<QuizState> = codec.decode(&raw).unwrap();
        assert_eq!(record.payload, state);
        assert_eq!(record.timestamp, NOW);
        assert_eq!(record.version, "1.0.0");
    }

    #[test]
    fn test_encode_overwrites_stale_envelope_fields() {
        let (codec, _) = codec();
        let stale = serde_json::json!({ "slug": "s", "timestamp": 1, "version": "0.1.0" });
        let raw = codec.encode_value(stale).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["timestamp"], NOW);
        assert_eq!(value["version"], "1.0.0");
    }

    #[test]
    fn test_encode_rejects_non_objects() {
        let (codec, _) = codec();
        assert!(codec.encode(&vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_ttl_boundary() {
        let (codec, clock) = codec();
        let raw = codec.encode(&sample_state()).unwrap();

        clock.advance(23 * HOUR_MS);
        assert!(codec.decode::<QuizState>(&raw).is_ok());

        clock.advance(2 * HOUR_MS);
        let err = codec.decode::<QuizState>(&raw).unwrap_err();
        assert!(matches!(err, RecordError::Expired { .. }));
        assert!(err.should_remove());
    }

    #[test]
    fn test_legacy_partial_record_is_migrated() {
        let (codec, _) = codec();
        let record: VersionedRecord<QuizState> =
            codec.decode(r#"{ "currentQuestion": 2 }"#).unwrap();
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.timestamp, NOW);
        assert_eq!(record.payload.current_question, 2);
        assert_eq!(record.payload.total_questions, 3);
        assert!(record.payload.user_answers.is_empty());
        assert_eq!(record.payload.start_time, NOW);
        assert!(!record.payload.is_completed);
    }

    #[test]
    fn test_null_optional_fields_are_backfilled() {
        let (codec, _) = codec();
        let record: VersionedRecord<QuizState> = codec
            .decode(r#"{ "quizId": 9, "slug": "s", "userAnswers": null, "quizData": null, "version": "1.0.0" }"#)
            .unwrap();
        assert_eq!(record.payload.quiz_id, "9");
        assert!(record.payload.user_answers.is_empty());
    }

    #[test]
    fn test_corrupted_and_empty_are_distinct() {
        let (codec, _) = codec();
        let corrupted = codec.decode::<QuizState>("{not json").unwrap_err();
        assert_eq!(corrupted, RecordError::Corrupted);
        assert!(corrupted.should_remove());

        let empty = codec.decode::<QuizState>("{}").unwrap_err();
        assert_eq!(empty, RecordError::Empty);
        assert!(!empty.should_remove());

        assert_eq!(
            codec.decode::<QuizState>("[1,2]").unwrap_err(),
            RecordError::Corrupted
        );
    }

    #[test]
    fn test_auth_redirect_requires_slug_and_type() {
        let (codec, _) = codec();
        let missing_slug = codec
            .decode::<AuthRedirectState>(r#"{ "quizType": "code", "currentQuestion": 1 }"#)
            .unwrap_err();
        assert!(matches!(missing_slug, RecordError::InvalidShape(_)));

        let missing_type = codec
            .decode::<AuthRedirectState>(r#"{ "slug": "s", "currentQuestion": 1 }"#)
            .unwrap_err();
        assert!(matches!(missing_type, RecordError::InvalidShape(_)));

        let ok: VersionedRecord<AuthRedirectState> = codec
            .decode(r#"{ "slug": "s", "quizType": "blanks", "answers": [{ "questionId": 1, "userAnswer": "x" }] }"#)
            .unwrap();
        assert_eq!(ok.payload.quiz_type, QuizType::FillBlank);
        assert_eq!(ok.payload.answers[0].user_answer, UserAnswer::from("x"));
    }

    #[test]
    fn test_result_score_is_clamped() {
        let (codec, _) = codec();
        let record: VersionedRecord<QuizResult> = codec
            .decode(r#"{ "slug": "s", "quizType": "essay", "score": 140 }"#)
            .unwrap();
        assert_eq!(record.payload.score, 100.0);
        assert!(record.payload.is_completed);
    }

    #[test]
    fn test_versioned_record_serializes_flat() {
        let record = VersionedRecord {
            payload: serde_json::json!({ "slug": "s" }),
            timestamp: 5,
            version: "1.0.0".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, serde_json::json!({ "slug": "s", "timestamp": 5, "version": "1.0.0" }));
    }
}
