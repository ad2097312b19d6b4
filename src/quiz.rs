use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuizType {
    Code,
    #[default]
    #[serde(alias = "mcq")]
    MultipleChoice,
    #[serde(alias = "openended")]
    Essay,
    #[serde(alias = "blanks")]
    FillBlank,
}

impl QuizType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuizType::Code => "code",
            QuizType::MultipleChoice => "multiple-choice",
            QuizType::Essay => "essay",
            QuizType::FillBlank => "fill-blank",
        }
    }
}

impl std::fmt::Display for QuizType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QuizType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown quiz type: {}", s))
    }
}

/// Question ids arrive as strings from some quiz sources and as numbers from others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for QuestionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuestionId::Number(n) => write!(f, "{}", n),
            QuestionId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for QuestionId {
    fn from(n: i64) -> Self {
        QuestionId::Number(n)
    }
}

impl From<&str> for QuestionId {
    fn from(s: &str) -> Self {
        QuestionId::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserAnswer {
    Text(String),
    Choices(Vec<String>),
}

impl Default for UserAnswer {
    fn default() -> Self {
        UserAnswer::Text(String::new())
    }
}

impl From<&str> for UserAnswer {
    fn from(s: &str) -> Self {
        UserAnswer::Text(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAnswer {
    pub question_id: QuestionId,
    #[serde(default, alias = "answer")]
    pub user_answer: UserAnswer,
    /// Seconds.
    #[serde(default)]
    pub time_spent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    /// 0-100, present for fuzzy-graded answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl QuizAnswer {
    pub fn new(question_id: impl Into<QuestionId>, user_answer: impl Into<UserAnswer>) -> Self {
        Self {
            question_id: question_id.into(),
            user_answer: user_answer.into(),
            time_spent: 0,
            is_correct: None,
            similarity: None,
        }
    }

    pub fn with_time_spent(mut self, seconds: u32) -> Self {
        self.time_spent = seconds;
        self
    }

    pub fn with_correct(mut self, correct: bool) -> Self {
        self.is_correct = Some(correct);
        self
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.similarity = Some(similarity.clamp(0.0, 100.0));
        self
    }
}

/// Inserts `answer`, replacing any earlier answer to the same question.
pub(crate) fn upsert_answer(answers: &mut Vec<QuizAnswer>, answer: QuizAnswer) {
    match answers
        .iter_mut()
        .find(|existing| existing.question_id == answer.question_id)
    {
        Some(existing) => *existing = answer,
        None => answers.push(answer),
    }
}

/// In-progress quiz snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizState {
    pub quiz_id: String,
    pub quiz_type: QuizType,
    pub slug: String,
    pub current_question: usize,
    pub total_questions: usize,
    /// Epoch milliseconds.
    pub start_time: i64,
    pub is_completed: bool,
    pub user_answers: Vec<QuizAnswer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,
}

impl QuizState {
    pub fn new(
        quiz_id: &str,
        quiz_type: QuizType,
        slug: &str,
        total_questions: usize,
        start_time: i64,
    ) -> Self {
        Self {
            quiz_id: quiz_id.to_string(),
            quiz_type,
            slug: slug.to_string(),
            current_question: 0,
            total_questions,
            start_time,
            is_completed: false,
            user_answers: Vec::new(),
            redirect_path: None,
        }
    }

    /// Moves to `index`, clamped to the last question.
    pub fn set_current_question(&mut self, index: usize) {
        self.current_question = index;
        self.clamp_current_question();
    }

    pub fn record_answer(&mut self, answer: QuizAnswer) {
        upsert_answer(&mut self.user_answers, answer);
    }

    pub(crate) fn clamp_current_question(&mut self) {
        if self.total_questions > 0 && self.current_question >= self.total_questions {
            self.current_question = self.total_questions - 1;
        }
    }
}

/// Terminal snapshot of a completed quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub quiz_id: String,
    pub slug: String,
    pub quiz_type: QuizType,
    pub score: f64,
    pub answers: Vec<QuizAnswer>,
    /// Seconds.
    pub total_time: u64,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,
}

/// Everything needed to resume a quiz after a sign-in detour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRedirectState {
    pub slug: String,
    pub quiz_type: QuizType,
    #[serde(default)]
    pub current_question: usize,
    #[serde(default)]
    pub answers: Vec<QuizAnswer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_path: Option<String>,
}

impl AuthRedirectState {
    pub fn from_state(state: &QuizState, redirect_path: Option<String>) -> Self {
        Self {
            slug: state.slug.clone(),
            quiz_type: state.quiz_type,
            current_question: state.current_question,
            answers: state.user_answers.clone(),
            temp_results: None,
            quiz_id: Some(state.quiz_id.clone()),
            redirect_path: redirect_path.or_else(|| state.redirect_path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiz_type_accepts_legacy_names() {
        let parsed: Vec<QuizType> =
            serde_json::from_str(r#"["mcq", "openended", "blanks", "code", "fill-blank"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                QuizType::MultipleChoice,
                QuizType::Essay,
                QuizType::FillBlank,
                QuizType::Code,
                QuizType::FillBlank
            ]
        );
        assert_eq!(
            serde_json::to_string(&QuizType::MultipleChoice).unwrap(),
            "\"multiple-choice\""
        );
        assert_eq!("essay".parse::<QuizType>().unwrap(), QuizType::Essay);
        assert!("trivia".parse::<QuizType>().is_err());
    }

    #[test]
    fn test_answer_accepts_numeric_and_string_ids() {
        let answers: Vec<QuizAnswer> = serde_json::from_str(
            r#"[
                { "questionId": 7, "userAnswer": "b", "timeSpent": 12 },
                { "questionId": "q-2", "answer": ["x", "y"] }
            ]"#,
        )
        .unwrap();
        assert_eq!(answers[0].question_id, QuestionId::Number(7));
        assert_eq!(answers[0].time_spent, 12);
        assert_eq!(answers[1].question_id, QuestionId::Text("q-2".into()));
        assert_eq!(
            answers[1].user_answer,
            UserAnswer::Choices(vec!["x".into(), "y".into()])
        );
    }

    #[test]
    fn test_current_question_stays_in_range() {
        let mut state = QuizState::new("q1", QuizType::Code, "rust-basics", 5, 0);
        state.set_current_question(3);
        assert_eq!(state.current_question, 3);
        state.set_current_question(9);
        assert_eq!(state.current_question, 4);
    }

    #[test]
    fn test_record_answer_replaces_same_question() {
        let mut state = QuizState::new("q1", QuizType::MultipleChoice, "s", 3, 0);
        state.record_answer(QuizAnswer::new(1, "a"));
        state.record_answer(QuizAnswer::new(2, "b"));
        state.record_answer(QuizAnswer::new(1, "c"));
        assert_eq!(state.user_answers.len(), 2);
        assert_eq!(state.user_answers[0].user_answer, UserAnswer::from("c"));
    }
}
