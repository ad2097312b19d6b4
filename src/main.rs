use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use quizkeep::{
    clock::system_clock,
    config::PersistenceConfig,
    error::QuizKeepError,
    events::ProgressEvent,
    keys,
    middleware::PersistenceMiddleware,
    quiz::{QuizState, QuizType},
    replay,
    service::QuizStorageService,
    storage::TieredStorage,
    store::QuizStore,
    ActionDispatcher, QuizAction,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "quizkeep")]
#[command(about = "Inspect and maintain persisted quiz progress")]
#[command(version)]
struct Cli {
    /// Directory holding storage.json
    #[arg(short, long, default_value = ".quizkeep")]
    data_dir: PathBuf,

    /// JSON config file overriding the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored keys
    Keys {
        /// Only keys starting with this prefix
        #[arg(short, long, default_value = "")]
        prefix: String,
    },
    /// Show the persisted state and result for a quiz
    Show { slug: String },
    /// Clear persisted quiz data
    Clear {
        /// Quiz slug; without it only the auth-redirect key is removed
        #[arg(short, long)]
        slug: Option<String>,
        /// Remove every quiz_ key
        #[arg(long, conflicts_with = "slug")]
        all: bool,
    },
    /// Fold a JSON array of progress events and print the projections
    Replay { events: PathBuf },
    /// Save a quiz through the debounced middleware and read it back
    Demo {
        #[arg(default_value = "test-quiz")]
        slug: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), QuizKeepError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PersistenceConfig::from_file(path)?,
        None => PersistenceConfig::default(),
    };

    match cli.command {
        Commands::Keys { prefix } => list_keys(&cli.data_dir, config, &prefix)?,
        Commands::Show { slug } => show(&cli.data_dir, config, &slug)?,
        Commands::Clear { slug, all } => clear(&cli.data_dir, config, slug.as_deref(), all)?,
        Commands::Replay { events } => replay_file(&events)?,
        Commands::Demo { slug } => demo(&cli.data_dir, config, &slug).await?,
    }

    Ok(())
}

fn open_service(
    data_dir: &std::path::Path,
    config: PersistenceConfig,
) -> Result<QuizStorageService, QuizKeepError> {
    let storage = TieredStorage::with_file(data_dir.join("storage.json"))?;
    Ok(QuizStorageService::new(storage, config, system_clock()))
}

fn list_keys(
    data_dir: &std::path::Path,
    config: PersistenceConfig,
    prefix: &str,
) -> Result<(), QuizKeepError> {
    let service = open_service(data_dir, config)?;
    for key in service.storage().keys_with_prefix(prefix) {
        println!("{}", key);
    }
    Ok(())
}

fn show(
    data_dir: &std::path::Path,
    config: PersistenceConfig,
    slug: &str,
) -> Result<(), QuizKeepError> {
    let service = open_service(data_dir, config)?;

    match service.load_quiz_state(slug) {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("no in-progress state for {}", slug),
    }
    match service.load_quiz_results(slug) {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!("no result for {}", slug),
    }
    println!("completed: {}", service.is_quiz_completed(slug));
    if let Some(redirect) = service.peek_auth_redirect() {
        println!("pending auth redirect for {}", redirect.payload.slug);
    }
    Ok(())
}

fn clear(
    data_dir: &std::path::Path,
    config: PersistenceConfig,
    slug: Option<&str>,
    all: bool,
) -> Result<(), QuizKeepError> {
    let service = open_service(data_dir, config)?;
    if all {
        let removed = service.clear_all_quiz_keys();
        println!("removed {} keys", removed);
    } else {
        service.clear_persisted_quiz_state(slug);
        match slug {
            Some(slug) => println!("cleared {} and {}", slug, keys::AUTH_REDIRECT_KEY),
            None => println!("cleared {}", keys::AUTH_REDIRECT_KEY),
        }
    }
    Ok(())
}

fn replay_file(path: &std::path::Path) -> Result<(), QuizKeepError> {
    let data = std::fs::read_to_string(path)?;
    let events: Vec<ProgressEvent> = serde_json::from_str(&data)?;
    info!("replaying {} events from {}", events.len(), path.display());
    let projections = replay::replay(&events);
    println!("{}", serde_json::to_string_pretty(&projections)?);
    Ok(())
}

async fn demo(
    data_dir: &std::path::Path,
    config: PersistenceConfig,
    slug: &str,
) -> Result<(), QuizKeepError> {
    let debounce = config.state_debounce();
    let thresholds = config.similarity;
    let service = Arc::new(open_service(data_dir, config)?);
    let middleware = Arc::new(PersistenceMiddleware::new(service.clone()));
    let store = QuizStore::new(system_clock(), thresholds).with_middleware(middleware.clone());

    let start = service.codec().now_ms();
    store.dispatch(QuizAction::StartQuiz(QuizState::new(
        "demo",
        QuizType::MultipleChoice,
        slug,
        5,
        start,
    )));
    for question in 1..=3 {
        store.dispatch(QuizAction::SetCurrentQuestion(question));
    }

    tokio::time::sleep(debounce + Duration::from_millis(50)).await;
    middleware.dispose();

    match service.load_quiz_state(slug) {
        Some(state) => println!(
            "{} saved at question {} of {}",
            slug, state.current_question, state.total_questions
        ),
        None => println!("{} was not saved", slug),
    }
    Ok(())
}
