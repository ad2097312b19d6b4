//! Folds progress events into per-entity projections.
//!
//! Events are stably sorted by timestamp before folding, so call order does
//! not matter but insertion order breaks ties. Each step takes the
//! accumulated projections by value and returns the next ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::events::{
    ChapterCompletedMeta, CourseProgressMeta, ProgressEvent, ProgressEventType,
    QuestionAnsweredMeta, QuizCompletedMeta, QuizStartedMeta, VideoWatchedMeta,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseProgress {
    pub course_id: String,
    pub is_started: bool,
    pub started_at: Option<i64>,
    pub progress: f64,
    pub completed_chapters: Vec<String>,
    pub current_chapter: Option<String>,
    pub time_spent: u64,
    pub is_completed: bool,
    pub completed_at: Option<i64>,
    pub last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsweredQuestion {
    pub question_id: String,
    pub answer: Value,
    pub is_correct: Option<bool>,
    pub time_spent: u32,
    pub answered_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizProgress {
    pub quiz_id: String,
    pub course_id: Option<String>,
    pub started_at: i64,
    pub total_questions: usize,
    pub answers: BTreeMap<String, AnsweredQuestion>,
    pub is_completed: bool,
    pub score: Option<f64>,
    pub correct_answers: Option<usize>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterProgress {
    pub chapter_id: String,
    pub course_id: Option<String>,
    pub progress: f64,
    pub played_seconds: f64,
    pub duration: Option<f64>,
    pub is_completed: bool,
    pub completed_at: Option<i64>,
    pub last_watched_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projections {
    pub course_progress: BTreeMap<String, CourseProgress>,
    pub quiz_progress: BTreeMap<String, QuizProgress>,
    pub chapter_progress: BTreeMap<String, ChapterProgress>,
}

pub fn replay(events: &[ProgressEvent]) -> Projections {
    replay_onto(Projections::default(), events)
}

/// Continues a fold from `base`. Replaying a timestamp-ordered log in two
/// pieces gives the same result as replaying it whole.
pub fn replay_onto(base: Projections, events: &[ProgressEvent]) -> Projections {
    sorted(events)
        .into_iter()
        .fold(base, |projections, event| projections.apply(event))
}

pub fn sorted(events: &[ProgressEvent]) -> Vec<&ProgressEvent> {
    let mut ordered: Vec<&ProgressEvent> = events.iter().collect();
    ordered.sort_by_key(|event| event.timestamp);
    ordered
}

impl Projections {
    /// Applies one event. Events that refer to a projection that does not
    /// exist yet, carry unreadable metadata, or have an unknown type are skipped.
    pub fn apply(mut self, event: &ProgressEvent) -> Self {
        let id = event.entity_id.clone();
        let at = event.timestamp;

        match &event.event_type {
            ProgressEventType::CourseStarted => {
                let course = self
                    .course_progress
                    .entry(id.clone())
                    .or_insert_with(|| CourseProgress {
                        course_id: id,
                        ..CourseProgress::default()
                    });
                if !course.is_started {
                    course.is_started = true;
                    course.started_at = Some(at);
                    course.last_updated = at;
                }
            }
            ProgressEventType::CourseProgressUpdated => {
                let Some(meta) = event.metadata_as::<CourseProgressMeta>() else {
                    return self.skip(event, "unreadable metadata");
                };
                let course = self
                    .course_progress
                    .entry(id.clone())
                    .or_insert_with(|| CourseProgress {
                        course_id: id,
                        ..CourseProgress::default()
                    });
                course.progress = meta.progress;
                course.completed_chapters = meta.completed_chapters;
                course.current_chapter = meta.current_chapter;
                course.time_spent = meta.time_spent;
                course.last_updated = at;
            }
            ProgressEventType::QuizStarted => {
                let meta = event.metadata_as::<QuizStartedMeta>().unwrap_or_default();
                self.quiz_progress
                    .entry(id.clone())
                    .or_insert_with(|| QuizProgress {
                        quiz_id: id,
                        course_id: meta.course_id,
                        started_at: at,
                        total_questions: meta.total_questions,
                        ..QuizProgress::default()
                    });
            }
            ProgressEventType::QuestionAnswered => {
                let Some(meta) = event.metadata_as::<QuestionAnsweredMeta>() else {
                    return self.skip(event, "unreadable metadata");
                };
                let Some(quiz) = self.quiz_progress.get_mut(&meta.quiz_id) else {
                    return self.skip(event, "quiz not started");
                };
                quiz.answers.insert(
                    id.clone(),
                    AnsweredQuestion {
                        question_id: id,
                        answer: meta.answer,
                        is_correct: meta.is_correct,
                        time_spent: meta.time_spent,
                        answered_at: at,
                    },
                );
            }
            ProgressEventType::QuizCompleted => {
                let meta = event.metadata_as::<QuizCompletedMeta>().unwrap_or_default();
                let Some(quiz) = self.quiz_progress.get_mut(&id) else {
                    return self.skip(event, "quiz not started");
                };
                quiz.is_completed = true;
                quiz.score = Some(meta.score);
                quiz.correct_answers = Some(meta.correct_answers);
                if meta.total_questions > 0 {
                    quiz.total_questions = meta.total_questions;
                }
                quiz.completed_at = Some(at);
            }
            ProgressEventType::CourseCompleted => {
                let Some(course) = self.course_progress.get_mut(&id) else {
                    return self.skip(event, "course not started");
                };
                course.is_completed = true;
                course.completed_at = Some(at);
                course.progress = 100.0;
                course.last_updated = at;
            }
            ProgressEventType::VideoWatched => {
                let Some(meta) = event.metadata_as::<VideoWatchedMeta>() else {
                    return self.skip(event, "unreadable metadata");
                };
                let chapter = self
                    .chapter_progress
                    .entry(id.clone())
                    .or_insert_with(|| ChapterProgress {
                        chapter_id: id,
                        ..ChapterProgress::default()
                    });
                // Rewinding never lowers recorded progress.
                chapter.progress = chapter.progress.max(meta.progress);
                chapter.played_seconds = chapter.played_seconds.max(meta.played_seconds);
                if meta.duration.is_some() {
                    chapter.duration = meta.duration;
                }
                if meta.course_id.is_some() {
                    chapter.course_id = meta.course_id;
                }
                chapter.last_watched_at = chapter.last_watched_at.max(at);
            }
            ProgressEventType::ChapterCompleted => {
                let meta = event
                    .metadata_as::<ChapterCompletedMeta>()
                    .unwrap_or_default();
                let Some(chapter) = self.chapter_progress.get_mut(&id) else {
                    return self.skip(event, "chapter never watched");
                };
                chapter.is_completed = true;
                chapter.completed_at = Some(at);
                if meta.course_id.is_some() {
                    chapter.course_id = meta.course_id;
                }
            }
            ProgressEventType::Other(_) => return self.skip(event, "unknown event type"),
        }
        self
    }

    fn skip(self, event: &ProgressEvent, reason: &str) -> Self {
        trace!(
            "skipping {} {} during replay: {}",
            event.event_type.as_str(),
            event.id,
            reason
        );
        self
    }

    pub fn course(&self, course_id: &str) -> Option<&CourseProgress> {
        self.course_progress.get(course_id)
    }

    pub fn quiz(&self, quiz_id: &str) -> Option<&QuizProgress> {
        self.quiz_progress.get(quiz_id)
    }

    pub fn chapter(&self, chapter_id: &str) -> Option<&ChapterProgress> {
        self.chapter_progress.get(chapter_id)
    }

    /// Chapters belonging to `course_id` that have been marked complete.
    pub fn completed_chapters_for(&self, course_id: &str) -> Vec<&ChapterProgress> {
        self.chapter_progress
            .values()
            .filter(|c| c.is_completed && c.course_id.as_deref() == Some(course_id))
            .collect()
    }

    pub fn answered_count(&self, quiz_id: &str) -> usize {
        self.quiz(quiz_id).map_or(0, |q| q.answers.len())
    }
}
