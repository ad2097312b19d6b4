pub mod action;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod middleware;
pub mod quiz;
pub mod replay;
pub mod scheduler;
pub mod scoring;
pub mod service;
pub mod storage;
pub mod store;
pub mod sync;

pub use action::{ActionDispatcher, QuizAction, RecordingDispatcher};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{RecordCodec, RecordError, VersionedRecord};
pub use config::PersistenceConfig;
pub use error::QuizKeepError;
pub use events::{EntityType, EventLog, ProgressEvent, ProgressEventType};
pub use middleware::PersistenceMiddleware;
pub use quiz::{AuthRedirectState, QuestionId, QuizAnswer, QuizResult, QuizState, QuizType, UserAnswer};
pub use replay::{replay, replay_onto, Projections};
pub use scheduler::{DebouncedWriter, LifecycleEvent};
pub use service::QuizStorageService;
pub use storage::{FileBackend, MemoryBackend, StorageBackend, StorageTier, TieredStorage};
pub use store::{QuizSlice, QuizStore};
pub use sync::{EventSync, NoopSync, RecordingSync};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, QuizKeepError>;
