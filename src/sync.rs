use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::QuizKeepError;
use crate::events::ProgressEvent;

/// Ships batches of progress events to a server. The wire format belongs to
/// the implementation.
#[async_trait]
pub trait EventSync: Send + Sync {
    async fn sync(&self, events: &[ProgressEvent]) -> crate::Result<()>;
}

/// Accepts everything and sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

#[async_trait]
impl EventSync for NoopSync {
    async fn sync(&self, _events: &[ProgressEvent]) -> crate::Result<()> {
        Ok(())
    }
}

/// Keeps every batch it receives; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingSync {
    batches: Mutex<Vec<Vec<ProgressEvent>>>,
    failing: AtomicBool,
}

impl RecordingSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<ProgressEvent>> {
        self.batches
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSync for RecordingSync {
    async fn sync(&self, events: &[ProgressEvent]) -> crate::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QuizKeepError::Sync("server unavailable".to_string()));
        }
        let mut guard = self
            .batches
            .lock()
            .map_err(|e| QuizKeepError::Sync(e.to_string()))?;
        guard.push(events.to_vec());
        Ok(())
    }
}

/// POSTs `{ "events": [...] }` as JSON to a fixed endpoint.
#[cfg(feature = "http-sync")]
pub struct HttpEventSync {
    client: reqwest::Client,
    endpoint: String,
}

#[cfg(feature = "http-sync")]
impl HttpEventSync {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[cfg(feature = "http-sync")]
#[async_trait]
impl EventSync for HttpEventSync {
    async fn sync(&self, events: &[ProgressEvent]) -> crate::Result<()> {
        let body = serde_json::json!({ "events": events });
        self.client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| QuizKeepError::Sync(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EntityType, ProgressEventType};

    #[test]
    fn test_recording_sync_collects_batches() {
        let sync = RecordingSync::new();
        let event = ProgressEvent::new(
            "u1",
            ProgressEventType::CourseStarted,
            "c1",
            EntityType::Course,
            serde_json::Map::new(),
            1,
        );
        tokio_test::block_on(sync.sync(&[event.clone()])).unwrap();
        sync.set_failing(true);
        assert!(tokio_test::block_on(sync.sync(&[event])).is_err());
        assert_eq!(sync.batches().len(), 1);
    }
}
