use crate::config::SimilarityThresholds;
use crate::quiz::{QuizAnswer, QuizResult, QuizState, QuizType};

/// How an individual answer is judged for a given quiz type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradingRule {
    /// Only an explicit correctness flag counts.
    Exact,
    /// An explicit flag wins; otherwise similarity must exceed the threshold.
    Similarity { threshold: f64 },
}

/// How a quiz's percentage is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBasis {
    /// The raw score already is a 0-100 percentage.
    Percentage,
    /// Percentage of correct answers over total questions.
    CorrectCount,
}

pub fn grading_rule(quiz_type: QuizType, thresholds: &SimilarityThresholds) -> GradingRule {
    match quiz_type {
        QuizType::Code | QuizType::MultipleChoice => GradingRule::Exact,
        QuizType::FillBlank => GradingRule::Similarity {
            threshold: thresholds.fill_blank_threshold,
        },
        QuizType::Essay => GradingRule::Similarity {
            threshold: thresholds.essay_threshold,
        },
    }
}

pub fn score_basis(quiz_type: QuizType) -> ScoreBasis {
    match quiz_type {
        QuizType::Essay | QuizType::FillBlank => ScoreBasis::Percentage,
        QuizType::Code | QuizType::MultipleChoice => ScoreBasis::CorrectCount,
    }
}

/// Every quiz type currently scores on 0-100.
pub fn clamp_score(quiz_type: QuizType, score: f64) -> f64 {
    let (low, high) = match quiz_type {
        QuizType::Code | QuizType::MultipleChoice | QuizType::Essay | QuizType::FillBlank => {
            (0.0, 100.0)
        }
    };
    if score.is_nan() {
        return low;
    }
    score.clamp(low, high)
}

pub fn is_correct_enough(answer: &QuizAnswer, rule: GradingRule) -> bool {
    match (answer.is_correct, rule) {
        (Some(flag), _) => flag,
        (None, GradingRule::Exact) => false,
        (None, GradingRule::Similarity { threshold }) => {
            answer.similarity.map_or(false, |s| s > threshold)
        }
    }
}

pub fn correct_count(
    quiz_type: QuizType,
    answers: &[QuizAnswer],
    thresholds: &SimilarityThresholds,
) -> usize {
    let rule = grading_rule(quiz_type, thresholds);
    answers
        .iter()
        .filter(|answer| is_correct_enough(answer, rule))
        .count()
}

/// Percentage score in 0-100. `raw_score` is used as-is (clamped) for
/// percentage-based quiz types and ignored for count-based ones.
pub fn percentage(
    quiz_type: QuizType,
    raw_score: f64,
    answers: &[QuizAnswer],
    total_questions: usize,
    thresholds: &SimilarityThresholds,
) -> f64 {
    match score_basis(quiz_type) {
        ScoreBasis::Percentage => clamp_score(quiz_type, raw_score),
        ScoreBasis::CorrectCount => {
            if total_questions == 0 {
                return 0.0;
            }
            let correct = correct_count(quiz_type, answers, thresholds);
            clamp_score(quiz_type, correct as f64 / total_questions as f64 * 100.0)
        }
    }
}

/// Builds the terminal result for a finished quiz. For percentage-based
/// types the mean answer similarity stands in for the raw score.
pub fn result_from_state(
    state: &QuizState,
    finished_at: i64,
    thresholds: &SimilarityThresholds,
) -> QuizResult {
    let raw_score = match score_basis(state.quiz_type) {
        ScoreBasis::Percentage => {
            let sims: Vec<f64> = state
                .user_answers
                .iter()
                .map(|a| match (a.similarity, a.is_correct) {
                    (Some(s), _) => s,
                    (None, Some(true)) => 100.0,
                    (None, _) => 0.0,
                })
                .collect();
            if state.total_questions == 0 {
                0.0
            } else {
                sims.iter().sum::<f64>() / state.total_questions as f64
            }
        }
        ScoreBasis::CorrectCount => 0.0,
    };

    let total_time: u64 = state.user_answers.iter().map(|a| a.time_spent as u64).sum();

    QuizResult {
        quiz_id: state.quiz_id.clone(),
        slug: state.slug.clone(),
        quiz_type: state.quiz_type,
        score: percentage(
            state.quiz_type,
            raw_score,
            &state.user_answers,
            state.total_questions,
            thresholds,
        ),
        answers: state.user_answers.clone(),
        total_time,
        created_at: finished_at,
        is_completed: true,
        redirect_path: state.redirect_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> SimilarityThresholds {
        SimilarityThresholds::default()
    }

    #[test]
    fn test_similarity_thresholds_by_type() {
        let answer = QuizAnswer::new(1, "close").with_similarity(75.0);
        assert!(is_correct_enough(
            &answer,
            grading_rule(QuizType::Essay, &thresholds())
        ));
        assert!(!is_correct_enough(
            &answer,
            grading_rule(QuizType::FillBlank, &thresholds())
        ));
        assert!(!is_correct_enough(
            &answer,
            grading_rule(QuizType::MultipleChoice, &thresholds())
        ));
    }

    #[test]
    fn test_threshold_is_strict() {
        let answer = QuizAnswer::new(1, "x").with_similarity(80.0);
        assert!(!is_correct_enough(
            &answer,
            grading_rule(QuizType::FillBlank, &thresholds())
        ));
    }

    #[test]
    fn test_explicit_flag_wins() {
        let answer = QuizAnswer::new(1, "x").with_similarity(10.0).with_correct(true);
        assert!(is_correct_enough(
            &answer,
            grading_rule(QuizType::FillBlank, &thresholds())
        ));
    }

    #[test]
    fn test_configurable_thresholds() {
        let custom = SimilarityThresholds {
            fill_blank_threshold: 50.0,
            essay_threshold: 90.0,
        };
        let answer = QuizAnswer::new(1, "x").with_similarity(60.0);
        assert!(is_correct_enough(&answer, grading_rule(QuizType::FillBlank, &custom)));
        assert!(!is_correct_enough(&answer, grading_rule(QuizType::Essay, &custom)));
    }

    #[test]
    fn test_percentage_by_basis() {
        let answers = vec![
            QuizAnswer::new(1, "a").with_correct(true),
            QuizAnswer::new(2, "b").with_correct(false),
            QuizAnswer::new(3, "c").with_correct(true),
        ];
        let mcq = percentage(QuizType::MultipleChoice, 0.0, &answers, 4, &thresholds());
        assert_eq!(mcq, 50.0);

        assert_eq!(percentage(QuizType::Essay, 120.0, &answers, 4, &thresholds()), 100.0);
        assert_eq!(percentage(QuizType::FillBlank, -3.0, &answers, 4, &thresholds()), 0.0);
        assert_eq!(percentage(QuizType::Code, 0.0, &answers, 0, &thresholds()), 0.0);
    }

    #[test]
    fn test_result_from_state() {
        let mut state = QuizState::new("7", QuizType::Essay, "essays", 2, 1_000);
        state.record_answer(QuizAnswer::new(1, "x").with_similarity(90.0).with_time_spent(30));
        state.record_answer(QuizAnswer::new(2, "y").with_similarity(50.0).with_time_spent(15));

        let result = result_from_state(&state, 9_000, &thresholds());
        assert_eq!(result.score, 70.0);
        assert_eq!(result.total_time, 45);
        assert_eq!(result.created_at, 9_000);
        assert!(result.is_completed);
        assert_eq!(result.answers.len(), 2);
    }
}
