use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::codec::VersionedRecord;
use crate::quiz::{AuthRedirectState, QuizAnswer, QuizResult, QuizState};

pub const RESTORE_FROM_AUTH_REDIRECT: &str = "quiz/restoreFromAuthRedirect";

/// Actions flowing through the quiz state container. Serialized as
/// `{ "type": ..., "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum QuizAction {
    #[serde(rename = "quiz/startQuiz")]
    StartQuiz(QuizState),
    #[serde(rename = "quiz/setCurrentQuestion")]
    SetCurrentQuestion(usize),
    #[serde(rename = "quiz/submitAnswer")]
    SubmitAnswer(QuizAnswer),
    #[serde(rename = "quiz/tick")]
    TimerTick,
    /// `None` asks the container to score the current state itself.
    #[serde(rename = "quiz/completeQuiz")]
    CompleteQuiz(Option<QuizResult>),
    #[serde(rename = "quiz/requireAuth", rename_all = "camelCase")]
    RequireAuth { redirect_path: Option<String> },
    #[serde(rename = "quiz/restoreFromAuthRedirect")]
    RestoreFromAuthRedirect(VersionedRecord<AuthRedirectState>),
    #[serde(rename = "quiz/resetQuiz")]
    ResetQuiz,
}

/// What the persistence layer does in response to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTrigger {
    Ignore,
    /// A new attempt: supersede any finished result, then save the state.
    StartAttempt,
    SaveState,
    SaveAuthRedirect,
    Complete,
    Clear,
}

impl QuizAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            QuizAction::StartQuiz(_) => "quiz/startQuiz",
            QuizAction::SetCurrentQuestion(_) => "quiz/setCurrentQuestion",
            QuizAction::SubmitAnswer(_) => "quiz/submitAnswer",
            QuizAction::TimerTick => "quiz/tick",
            QuizAction::CompleteQuiz(_) => "quiz/completeQuiz",
            QuizAction::RequireAuth { .. } => "quiz/requireAuth",
            QuizAction::RestoreFromAuthRedirect(_) => RESTORE_FROM_AUTH_REDIRECT,
            QuizAction::ResetQuiz => "quiz/resetQuiz",
        }
    }

    pub fn trigger(&self) -> PersistTrigger {
        match self {
            QuizAction::StartQuiz(_) => PersistTrigger::StartAttempt,
            QuizAction::SetCurrentQuestion(_) | QuizAction::SubmitAnswer(_) => {
                PersistTrigger::SaveState
            }
            // Ticks fire every second; persisting them would be a write storm.
            QuizAction::TimerTick => PersistTrigger::Ignore,
            QuizAction::CompleteQuiz(_) => PersistTrigger::Complete,
            QuizAction::RequireAuth { .. } => PersistTrigger::SaveAuthRedirect,
            // Emitted by the persistence layer itself.
            QuizAction::RestoreFromAuthRedirect(_) => PersistTrigger::Ignore,
            QuizAction::ResetQuiz => PersistTrigger::Clear,
        }
    }
}

/// The dispatch half of the state container.
pub trait ActionDispatcher {
    fn dispatch(&self, action: QuizAction);
}

/// Collects dispatched actions instead of acting on them.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    actions: Mutex<Vec<QuizAction>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<QuizAction> {
        self.actions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl ActionDispatcher for RecordingDispatcher {
    fn dispatch(&self, action: QuizAction) {
        if let Ok(mut guard) = self.actions.lock() {
            guard.push(action);
        }
    }
}
