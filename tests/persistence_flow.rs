use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use quizkeep::{
    keys, ActionDispatcher, LifecycleEvent, ManualClock, MemoryBackend, PersistenceConfig,
    PersistenceMiddleware, QuizAction, QuizAnswer, QuizKeepError, QuizState, QuizStorageService,
    QuizStore, QuizType, RecordingDispatcher, StorageBackend, TieredStorage,
};
use serde_json::Value;

const NOW: i64 = 1_700_000_000_000;

/// Counts writes per key on top of an in-memory map.
#[derive(Clone, Default)]
struct CountingBackend {
    inner: MemoryBackend,
    writes: Arc<Mutex<HashMap<String, usize>>>,
}

impl CountingBackend {
    fn writes(&self, key: &str) -> usize {
        self.writes.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

impl StorageBackend for CountingBackend {
    fn get(&self, key: &str) -> Result<Option<String>, QuizKeepError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), QuizKeepError> {
        *self.writes.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), QuizKeepError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, QuizKeepError> {
        self.inner.keys()
    }
}

/// Parks the first write of one key until the test releases it.
struct GatedBackend {
    inner: MemoryBackend,
    gated_key: String,
    armed: AtomicBool,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl StorageBackend for GatedBackend {
    fn get(&self, key: &str) -> Result<Option<String>, QuizKeepError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), QuizKeepError> {
        if key == self.gated_key && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), QuizKeepError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, QuizKeepError> {
        self.inner.keys()
    }
}

struct Harness {
    backend: CountingBackend,
    service: Arc<QuizStorageService>,
    middleware: Arc<PersistenceMiddleware>,
    store: QuizStore,
}

fn harness() -> Harness {
    let backend = CountingBackend::default();
    let storage = TieredStorage::with_backends(
        Arc::new(backend.clone()),
        Arc::new(MemoryBackend::new()),
    );
    let config = PersistenceConfig::default();
    let clock = Arc::new(ManualClock::new(NOW));
    let service = Arc::new(QuizStorageService::new(storage, config.clone(), clock.clone()));
    let middleware = Arc::new(PersistenceMiddleware::with_tab_id(service.clone(), "tab-1"));
    let store = QuizStore::new(clock, config.similarity).with_middleware(middleware.clone());
    Harness {
        backend,
        service,
        middleware,
        store,
    }
}

fn start(store: &QuizStore, slug: &str) {
    store.dispatch(QuizAction::StartQuiz(QuizState::new(
        "42",
        QuizType::MultipleChoice,
        slug,
        10,
        NOW,
    )));
}

fn raw_json(backend: &CountingBackend, key: &str) -> Option<Value> {
    backend
        .get(key)
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_save_then_load_cycle() {
    let h = harness();
    start(&h.store, "test-quiz");
    h.store.dispatch(QuizAction::SetCurrentQuestion(3));

    tokio::time::sleep(Duration::from_millis(350)).await;

    let stored = raw_json(&h.backend, "quiz_state_test-quiz").unwrap();
    assert_eq!(stored["currentQuestion"], 3);
    assert_eq!(stored["version"], "1.0.0");
    assert_eq!(stored["timestamp"], NOW);

    let loaded = h.service.load_quiz_state("test-quiz").unwrap();
    assert_eq!(loaded.current_question, 3);
}

#[tokio::test(start_paused = true)]
async fn test_burst_coalesces_into_one_write() {
    let h = harness();
    start(&h.store, "test-quiz");
    for question in 1..=3 {
        h.store.dispatch(QuizAction::SetCurrentQuestion(question));
    }
    h.store.dispatch(QuizAction::TimerTick);

    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(h.backend.writes("quiz_state_test-quiz"), 1);
    let stored = raw_json(&h.backend, "quiz_state_test-quiz").unwrap();
    assert_eq!(stored["currentQuestion"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_completion_writes_result_and_removes_state() {
    let h = harness();
    start(&h.store, "test-quiz");
    h.store
        .dispatch(QuizAction::SubmitAnswer(QuizAnswer::new(1, "a").with_correct(true)));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(h.backend.get("quiz_state_test-quiz").unwrap().is_some());

    // A navigation still pending when the quiz completes must not resurrect the state.
    h.store.dispatch(QuizAction::SetCurrentQuestion(9));
    h.store.dispatch(QuizAction::CompleteQuiz(None));
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(h.backend.get("quiz_state_test-quiz").unwrap().is_none());
    let result = h.service.load_quiz_results("test-quiz").unwrap();
    assert_eq!(result.score, 10.0);
    assert!(h.service.is_quiz_completed("test-quiz"));
}

#[tokio::test(start_paused = true)]
async fn test_new_attempt_retires_previous_result() {
    let h = harness();
    start(&h.store, "test-quiz");
    h.store
        .dispatch(QuizAction::SubmitAnswer(QuizAnswer::new(1, "a").with_correct(true)));
    h.store.dispatch(QuizAction::CompleteQuiz(None));
    assert!(h.service.load_quiz_results("test-quiz").is_some());
    assert!(h.service.is_quiz_completed("test-quiz"));

    start(&h.store, "test-quiz");
    h.store.dispatch(QuizAction::SetCurrentQuestion(2));
    tokio::time::sleep(Duration::from_millis(400)).await;

    let state = h.service.load_quiz_state("test-quiz").unwrap();
    assert_eq!(state.current_question, 2);
    assert!(state.user_answers.is_empty());
    assert_eq!(h.service.load_quiz_results("test-quiz"), None);
    assert!(!h.service.is_quiz_completed("test-quiz"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_waits_for_a_write_in_flight() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let persistent = MemoryBackend::new();
    let gated = GatedBackend {
        inner: persistent.clone(),
        gated_key: "quiz_state_race".to_string(),
        armed: AtomicBool::new(true),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let storage = TieredStorage::with_backends(Arc::new(gated), Arc::new(MemoryBackend::new()));
    let config = PersistenceConfig {
        state_debounce_ms: 20,
        ..PersistenceConfig::default()
    };
    let clock = Arc::new(ManualClock::new(NOW));
    let service = Arc::new(QuizStorageService::new(storage, config.clone(), clock.clone()));
    let middleware = Arc::new(PersistenceMiddleware::new(service.clone()));
    let store = Arc::new(QuizStore::new(clock, config.similarity).with_middleware(middleware));

    start(&store, "race");

    // The debounce timer is now inside the storage write.
    tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();

    let completer = {
        let store = store.clone();
        std::thread::spawn(move || store.dispatch(QuizAction::CompleteQuiz(None)))
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    release_tx.send(()).unwrap();
    tokio::task::spawn_blocking(move || completer.join())
        .await
        .unwrap()
        .unwrap();

    assert!(persistent.get("quiz_state_race").unwrap().is_none());
    assert!(persistent.get("quiz_results_race").unwrap().is_some());
    assert_eq!(service.load_quiz_state("race"), None);
}

#[tokio::test(start_paused = true)]
async fn test_completion_without_pending_state() {
    let h = harness();
    start(&h.store, "fresh");
    h.middleware.writer().cancel("quiz_state_fresh");
    h.store.dispatch(QuizAction::CompleteQuiz(None));

    assert!(h.backend.get("quiz_state_fresh").unwrap().is_none());
    assert!(h.backend.get("quiz_results_fresh").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_auth_detour_restores_exactly_once() {
    let h = harness();
    start(&h.store, "test-quiz");
    h.store.dispatch(QuizAction::SetCurrentQuestion(4));
    h.store
        .dispatch(QuizAction::SubmitAnswer(QuizAnswer::new(1, "b").with_time_spent(20)));
    h.store.dispatch(QuizAction::RequireAuth {
        redirect_path: Some("/dashboard/quiz/test-quiz".to_string()),
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.backend.get(keys::AUTH_REDIRECT_KEY).unwrap().is_some());

    // The page comes back with a fresh store.
    let fresh = QuizStore::new(Arc::new(ManualClock::new(NOW)), Default::default());
    assert!(h.service.check_stored_auth_redirect_state(&fresh));
    let slice = fresh.get_state();
    let state = slice.state.unwrap();
    assert_eq!(state.slug, "test-quiz");
    assert_eq!(state.current_question, 4);
    assert_eq!(state.user_answers.len(), 1);
    assert_eq!(slice.redirect_path.as_deref(), Some("/dashboard/quiz/test-quiz"));

    let second = RecordingDispatcher::new();
    assert!(!h.service.check_stored_auth_redirect_state(&second));
    assert!(second.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_persisted_quiz() {
    let h = harness();
    start(&h.store, "test-quiz");
    h.middleware.flush();
    assert!(h.backend.get("quiz_state_test-quiz").unwrap().is_some());

    h.store.dispatch(QuizAction::ResetQuiz);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(h.backend.get("quiz_state_test-quiz").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_tab_hidden_flushes_before_debounce() {
    let h = harness();
    let (tx, rx) = tokio::sync::broadcast::channel(4);
    h.middleware.attach_lifecycle(rx);

    start(&h.store, "test-quiz");
    h.store.dispatch(QuizAction::SetCurrentQuestion(2));
    tx.send(LifecycleEvent::Hidden).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let stored = raw_json(&h.backend, "quiz_state_test-quiz").unwrap();
    assert_eq!(stored["currentQuestion"], 2);
    assert_eq!(h.backend.writes("quiz_state_test-quiz"), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.backend.writes("quiz_state_test-quiz"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tabs_debounce_independently() {
    let h = harness();
    let other_tab = Arc::new(PersistenceMiddleware::with_tab_id(h.service.clone(), "tab-2"));
    let other_store = QuizStore::new(Arc::new(ManualClock::new(NOW)), Default::default())
        .with_middleware(other_tab.clone());

    start(&h.store, "test-quiz");
    start(&other_store, "test-quiz");
    h.store.dispatch(QuizAction::SetCurrentQuestion(1));
    tokio::time::sleep(Duration::from_millis(200)).await;
    other_store.dispatch(QuizAction::SetCurrentQuestion(7));

    // Tab 1 fires at 300 ms even though tab 2 kept writing.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        raw_json(&h.backend, "quiz_state_test-quiz").unwrap()["currentQuestion"],
        1
    );

    // Last writer wins.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        raw_json(&h.backend, "quiz_state_test-quiz").unwrap()["currentQuestion"],
        7
    );
}

#[tokio::test(start_paused = true)]
async fn test_storage_failure_does_not_reach_caller() {
    let persistent = MemoryBackend::new();
    let session = MemoryBackend::new();
    persistent.set_disabled(true);
    session.set_disabled(true);
    let storage =
        TieredStorage::with_backends(Arc::new(persistent.clone()), Arc::new(session.clone()));
    let clock = Arc::new(ManualClock::new(NOW));
    let service = Arc::new(QuizStorageService::new(
        storage,
        PersistenceConfig::default(),
        clock.clone(),
    ));
    let middleware = Arc::new(PersistenceMiddleware::new(service.clone()));
    let store = QuizStore::new(clock, Default::default()).with_middleware(middleware);

    start(&store, "test-quiz");
    store.dispatch(QuizAction::SetCurrentQuestion(2));
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(store.get_state().state.unwrap().current_question, 2);
    assert_eq!(service.load_quiz_state("test-quiz"), None);

    persistent.set_disabled(false);
    store.dispatch(QuizAction::SetCurrentQuestion(3));
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(service.load_quiz_state("test-quiz").unwrap().current_question, 3);
}
