use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::action::{ActionDispatcher, QuizAction};
use crate::clock::SharedClock;
use crate::codec::VersionedRecord;
use crate::config::SimilarityThresholds;
use crate::middleware::PersistenceMiddleware;
use crate::quiz::{AuthRedirectState, QuizResult, QuizState};
use crate::scoring;

/// The quiz-taking slice of application state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuizSlice {
    pub state: Option<QuizState>,
    pub result: Option<QuizResult>,
    pub auth_required: bool,
    pub redirect_path: Option<String>,
    /// Seconds on the current attempt. Counted from ticks, never persisted.
    pub elapsed_seconds: u64,
}

pub struct ReduceContext {
    pub now_ms: i64,
    pub thresholds: SimilarityThresholds,
}

pub fn reduce(mut slice: QuizSlice, action: &QuizAction, ctx: &ReduceContext) -> QuizSlice {
    match action {
        QuizAction::StartQuiz(state) => QuizSlice {
            state: Some(state.clone()),
            ..QuizSlice::default()
        },
        QuizAction::SetCurrentQuestion(index) => {
            if let Some(state) = slice.state.as_mut() {
                state.set_current_question(*index);
            }
            slice
        }
        QuizAction::SubmitAnswer(answer) => {
            if let Some(state) = slice.state.as_mut() {
                state.record_answer(answer.clone());
            }
            slice
        }
        QuizAction::TimerTick => {
            if slice.state.is_some() {
                slice.elapsed_seconds += 1;
            }
            slice
        }
        QuizAction::CompleteQuiz(result) => {
            let result = result.clone().or_else(|| {
                slice
                    .state
                    .as_ref()
                    .map(|s| scoring::result_from_state(s, ctx.now_ms, &ctx.thresholds))
            });
            if let Some(state) = slice.state.as_mut() {
                state.is_completed = true;
            }
            slice.result = result;
            slice
        }
        QuizAction::RequireAuth { redirect_path } => {
            slice.auth_required = true;
            slice.redirect_path = redirect_path.clone();
            if let Some(state) = slice.state.as_mut() {
                state.redirect_path = redirect_path.clone();
            }
            slice
        }
        QuizAction::RestoreFromAuthRedirect(record) => {
            let restored = state_from_redirect(record, slice.state.as_ref());
            QuizSlice {
                redirect_path: record.payload.redirect_path.clone(),
                state: Some(restored),
                ..QuizSlice::default()
            }
        }
        QuizAction::ResetQuiz => QuizSlice::default(),
    }
}

fn state_from_redirect(
    record: &VersionedRecord<AuthRedirectState>,
    existing: Option<&QuizState>,
) -> QuizState {
    let redirect = &record.payload;
    let same_quiz = existing.filter(|s| s.slug == redirect.slug);
    let total_questions = same_quiz
        .map(|s| s.total_questions)
        .unwrap_or(0)
        .max(redirect.current_question + 1)
        .max(redirect.answers.len());

    let mut state = QuizState::new(
        redirect.quiz_id.as_deref().unwrap_or_default(),
        redirect.quiz_type,
        &redirect.slug,
        total_questions,
        same_quiz.map(|s| s.start_time).unwrap_or(record.timestamp),
    );
    state.user_answers = redirect.answers.clone();
    state.redirect_path = redirect.redirect_path.clone();
    state.set_current_question(redirect.current_question);
    state
}

/// A small dispatch/get-state container for the quiz slice, with an
/// optional persistence middleware observing every action.
pub struct QuizStore {
    slice: Mutex<QuizSlice>,
    clock: SharedClock,
    thresholds: SimilarityThresholds,
    middleware: Option<Arc<PersistenceMiddleware>>,
}

impl QuizStore {
    pub fn new(clock: SharedClock, thresholds: SimilarityThresholds) -> Self {
        Self {
            slice: Mutex::new(QuizSlice::default()),
            clock,
            thresholds,
            middleware: None,
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<PersistenceMiddleware>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    pub fn get_state(&self) -> QuizSlice {
        self.slice
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn middleware(&self) -> Option<&Arc<PersistenceMiddleware>> {
        self.middleware.as_ref()
    }
}

impl ActionDispatcher for QuizStore {
    fn dispatch(&self, action: QuizAction) {
        let ctx = ReduceContext {
            now_ms: self.clock.now_ms(),
            thresholds: self.thresholds,
        };
        let (before, after) = {
            let mut guard = self
                .slice
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = guard.clone();
            *guard = reduce(before.clone(), &action, &ctx);
            (before, guard.clone())
        };
        debug!("dispatched {}", action.type_name());
        if let Some(middleware) = &self.middleware {
            middleware.observe(&action, &before, &after);
        }
    }
}
