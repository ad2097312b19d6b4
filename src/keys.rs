//! Storage key names. These strings are shared with data already on disk and
//! must not change.

pub const QUIZ_PREFIX: &str = "quiz_";
pub const AUTH_REDIRECT_KEY: &str = "quiz_auth_redirect";
pub const GUEST_RESULTS_KEY: &str = "quiz_guest_results";
pub const PENDING_RESULT_KEY: &str = "quiz_pending_result";
pub const PROGRESS_EVENTS_KEY: &str = "progress_events";

pub fn quiz_state(slug: &str) -> String {
    format!("quiz_state_{}", slug)
}

pub fn quiz_results(slug: &str) -> String {
    format!("quiz_results_{}", slug)
}

pub fn quiz_completed(slug: &str) -> String {
    format!("quiz_{}_completed", slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_patterns() {
        assert_eq!(quiz_state("test-quiz"), "quiz_state_test-quiz");
        assert_eq!(quiz_results("test-quiz"), "quiz_results_test-quiz");
        assert_eq!(quiz_completed("test-quiz"), "quiz_test-quiz_completed");
        assert!(quiz_state("x").starts_with(QUIZ_PREFIX));
    }
}
