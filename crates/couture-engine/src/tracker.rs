use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use couture_contracts::error::error_chain_text;
use couture_contracts::events::EventWriter;
use couture_contracts::sessions::{
    GenerationKind, GenerationSession, SessionStatus, DEFAULT_FAILURE_ERROR,
};
use couture_contracts::{StudioError, StudioResult};
use serde_json::json;

use crate::backend::{GenerationBackend, GenerationRequest};
use crate::config::StudioConfig;
use crate::map_object;
use crate::store::{PollApplied, WorkspaceStore};

const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Cooperative stop signal for a wait loop. The remote job keeps running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn from_config(config: &StudioConfig) -> Self {
        Self {
            interval: config.poll_interval,
            timeout: config.poll_timeout,
        }
    }
}

/// Result of a single status call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollProgress {
    Pending,
    Terminal(SessionStatus),
    /// A newer session replaced this one; the response was ignored.
    Superseded,
    /// Transport trouble; the next tick retries.
    TransientError(String),
}

/// Drives one generation session from submit to a terminal state.
#[derive(Clone)]
pub struct GenerationTracker {
    store: WorkspaceStore,
    backend: Arc<dyn GenerationBackend>,
    events: EventWriter,
    settings: PollSettings,
}

impl GenerationTracker {
    pub fn new(
        store: WorkspaceStore,
        backend: Arc<dyn GenerationBackend>,
        events: EventWriter,
        settings: PollSettings,
    ) -> Self {
        Self {
            store,
            backend,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Starts a job for the active version and current prompt.
    pub fn submit(&self, kind: GenerationKind) -> StudioResult<String> {
        let kind = match kind {
            GenerationKind::Images { count: 0 } => {
                return Err(StudioError::validation("Choose at least one image to generate."))
            }
            GenerationKind::Images { count } => GenerationKind::images(count),
            GenerationKind::Video => GenerationKind::Video,
        };
        let Some((source, prompt)) = self.store.generation_inputs() else {
            return Err(StudioError::validation("Load an image first."));
        };
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(StudioError::validation("Prompt is empty."));
        }

        let submission = self.store.begin_submit(kind);
        let request = GenerationRequest {
            source_ref: source.image_url,
            source_hash: source.hash,
            prompt,
            kind,
        };
        match self.backend.start_generation(&request) {
            Ok(session_id) => {
                let attached = self.store.mark_polling(submission, &session_id);
                self.events.record(
                    "generation_submitted",
                    map_object(json!({
                        "session_id": session_id,
                        "superseded": !attached,
                        "kind": kind.as_str(),
                        "slots": kind.slot_count(),
                        "source_version_id": source.version_id,
                        "prompt": request.prompt,
                    })),
                );
                Ok(session_id)
            }
            Err(err) => {
                let message = error_chain_text(&err, 1024);
                self.store.fail_submit(submission, &message);
                self.events.record(
                    "generation_finished",
                    map_object(json!({
                        "session_id": null,
                        "kind": kind.as_str(),
                        "status": "failed",
                        "error": message,
                    })),
                );
                Err(StudioError::remote("generation", message))
            }
        }
    }

    pub fn poll_once(&self, session_id: &str) -> PollProgress {
        let response = match self.backend.poll_generation_status(session_id) {
            Ok(response) => response,
            Err(err) => {
                let message = error_chain_text(&err, 512);
                self.events.record(
                    "generation_poll_error",
                    map_object(json!({
                        "session_id": session_id,
                        "error": message,
                    })),
                );
                return PollProgress::TransientError(message);
            }
        };
        match self.store.apply_poll(session_id, &response) {
            PollApplied::Superseded => PollProgress::Superseded,
            PollApplied::Applied { terminal } => {
                let session = self.store.session();
                let (pending, succeeded, failed) = session.counts();
                self.events.record(
                    "generation_poll",
                    map_object(json!({
                        "session_id": session_id,
                        "remote_status": response.overall_status,
                        "pending": pending,
                        "succeeded": succeeded,
                        "failed": failed,
                    })),
                );
                if terminal {
                    PollProgress::Terminal(session.status)
                } else {
                    PollProgress::Pending
                }
            }
        }
    }

    /// Polls until the session is terminal, the timeout passes, or `cancel` fires.
    ///
    /// Returns `Completed` or `Abandoned`; a failed or timed out session is
    /// reported as `RemoteOperation`.
    pub fn wait(&self, session_id: &str, cancel: &CancelToken) -> StudioResult<SessionStatus> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                self.store.abandon_session(session_id);
                self.finished(session_id, SessionStatus::Abandoned);
                return Ok(SessionStatus::Abandoned);
            }
            match self.poll_once(session_id) {
                PollProgress::Terminal(status) => {
                    self.finished(session_id, status);
                    return match status {
                        SessionStatus::Failed => Err(self.failure(session_id)),
                        other => Ok(other),
                    };
                }
                PollProgress::Superseded => return Ok(SessionStatus::Abandoned),
                PollProgress::Pending | PollProgress::TransientError(_) => {}
            }
            if started.elapsed() >= self.settings.timeout {
                let message = format!(
                    "Generation timed out after {:.1}s.",
                    self.settings.timeout.as_secs_f64()
                );
                if self.store.expire_session(session_id, &message) {
                    self.finished(session_id, SessionStatus::Failed);
                }
                return Err(StudioError::remote("generation", message));
            }
            sleep_unless_cancelled(self.settings.interval, cancel);
        }
    }

    /// Submits and waits; returns the session as it ended.
    pub fn run(
        &self,
        kind: GenerationKind,
        cancel: &CancelToken,
    ) -> StudioResult<GenerationSession> {
        let session_id = self.submit(kind)?;
        self.wait(&session_id, cancel)?;
        Ok(self.store.session())
    }

    fn failure(&self, session_id: &str) -> StudioError {
        let session = self.store.session();
        let message = session
            .error
            .filter(|_| session.session_id.as_deref() == Some(session_id))
            .unwrap_or_else(|| DEFAULT_FAILURE_ERROR.to_string());
        StudioError::remote("generation", message)
    }

    fn finished(&self, session_id: &str, status: SessionStatus) {
        let session = self.store.session();
        let (pending, succeeded, failed) = session.counts();
        self.events.record(
            "generation_finished",
            map_object(json!({
                "session_id": session_id,
                "kind": session.kind.as_str(),
                "status": status,
                "pending": pending,
                "succeeded": succeeded,
                "failed": failed,
                "outputs": session.urls(),
                "error": session.error,
            })),
        );
    }
}

fn sleep_unless_cancelled(duration: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
            return;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use couture_contracts::sessions::{PollResponse, SlotResult, INCOMPLETE_SLOT_ERROR};
    use couture_contracts::versions::Dimensions;

    use super::*;

    /// Replays canned answers; an exhausted script keeps reporting pending.
    #[derive(Default)]
    struct ScriptedBackend {
        start_error: Option<String>,
        polls: Mutex<VecDeque<Result<PollResponse, String>>>,
        requests: Mutex<Vec<GenerationRequest>>,
        poll_count: Mutex<usize>,
    }

    impl ScriptedBackend {
        fn with_polls(polls: Vec<Result<PollResponse, String>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                ..Self::default()
            }
        }
    }

    impl GenerationBackend for ScriptedBackend {
        fn start_generation(&self, request: &GenerationRequest) -> Result<String> {
            if let Some(error) = &self.start_error {
                return Err(anyhow!(error.clone()));
            }
            let mut requests = self.requests.lock().map_err(|_| anyhow!("poisoned"))?;
            requests.push(request.clone());
            Ok(format!("job-{}", requests.len()))
        }

        fn poll_generation_status(&self, _session_id: &str) -> Result<PollResponse> {
            *self.poll_count.lock().map_err(|_| anyhow!("poisoned"))? += 1;
            let next = self
                .polls
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .pop_front();
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(error)) => Err(anyhow!(error)),
                None => Ok(PollResponse::pending(Vec::new())),
            }
        }
    }

    fn ok(url: &str) -> Option<SlotResult> {
        Some(SlotResult::success(url))
    }

    fn settings(timeout_ms: u64) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn tracker(
        backend: Arc<ScriptedBackend>,
        timeout_ms: u64,
    ) -> (WorkspaceStore, GenerationTracker) {
        let store = WorkspaceStore::new(100);
        store.set_original("/img/garment.png", "hash-0", Dimensions::new(400, 500));
        let tracker = GenerationTracker::new(
            store.clone(),
            backend,
            EventWriter::disabled("test"),
            settings(timeout_ms),
        );
        (store, tracker)
    }

    #[test]
    fn slots_fill_across_polls_and_missing_ones_fail() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::with_polls(vec![
            Ok(PollResponse::pending(vec![ok("url1"), None, None])),
            Ok(PollResponse::pending(vec![ok("url1"), ok("url2"), None])),
            Ok(PollResponse::completed(vec![ok("url1"), ok("url2"), None])),
        ]));
        let (_store, tracker) = tracker(backend.clone(), 5_000);
        let session = tracker.run(GenerationKind::images(3), &CancelToken::new())?;

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.urls(), vec!["url1", "url2"]);
        assert_eq!(session.slots[2].error(), Some(INCOMPLETE_SLOT_ERROR));
        let requests = backend.requests.lock().map_err(|_| anyhow!("poisoned"))?;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].source_ref, "/img/garment.png");
        assert!(requests[0].prompt.starts_with("Professional fashion photo"));
        Ok(())
    }

    #[test]
    fn transient_poll_errors_are_retried() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::with_polls(vec![
            Err("connection reset".to_string()),
            Ok(PollResponse::completed(vec![ok("url1")])),
        ]));
        let (_store, tracker) = tracker(backend.clone(), 5_000);
        let session_id = tracker.submit(GenerationKind::images(1))?;
        assert!(matches!(
            tracker.poll_once(&session_id),
            PollProgress::TransientError(message) if message.contains("connection reset")
        ));
        assert_eq!(
            tracker.wait(&session_id, &CancelToken::new())?,
            SessionStatus::Completed
        );
        Ok(())
    }

    #[test]
    fn failed_job_is_a_remote_error() {
        let backend = Arc::new(ScriptedBackend::with_polls(vec![
            Ok(PollResponse::pending(vec![ok("url1"), None])),
            Ok(PollResponse::failed("content policy")),
        ]));
        let (store, tracker) = tracker(backend, 5_000);
        let result = tracker.run(GenerationKind::images(2), &CancelToken::new());
        assert_eq!(
            result,
            Err(StudioError::remote("generation", "content policy"))
        );
        let session = store.session();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.counts(), (0, 0, 2));
    }

    #[test]
    fn submit_failure_fails_every_slot() {
        let backend = Arc::new(ScriptedBackend {
            start_error: Some("quota exceeded".to_string()),
            ..ScriptedBackend::default()
        });
        let (store, tracker) = tracker(backend, 5_000);
        let result = tracker.submit(GenerationKind::images(2));
        assert!(matches!(result, Err(StudioError::RemoteOperation { .. })));
        let session = store.session();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.slots[1].error(), Some("quota exceeded"));
    }

    #[test]
    fn timeout_fails_pending_slots() {
        let backend = Arc::new(ScriptedBackend::with_polls(vec![Ok(PollResponse::pending(
            vec![ok("url1"), None],
        ))]));
        let (store, tracker) = tracker(backend, 20);
        let result = tracker.run(GenerationKind::images(2), &CancelToken::new());
        assert!(matches!(result, Err(StudioError::RemoteOperation { .. })));
        let session = store.session();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.slots[0].url(), Some("url1"));
        assert!(session.slots[1]
            .error()
            .map(|error| error.contains("timed out"))
            .unwrap_or(false));
    }

    #[test]
    fn cancelled_wait_abandons_without_polling() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::default());
        let (store, tracker) = tracker(backend.clone(), 5_000);
        let session_id = tracker.submit(GenerationKind::Video)?;
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(tracker.wait(&session_id, &cancel)?, SessionStatus::Abandoned);
        assert_eq!(store.session().status, SessionStatus::Abandoned);
        assert_eq!(*backend.poll_count.lock().map_err(|_| anyhow!("poisoned"))?, 0);
        Ok(())
    }

    #[test]
    fn newer_submission_supersedes_older_wait() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::default());
        let (store, tracker) = tracker(backend, 5_000);
        let first = tracker.submit(GenerationKind::images(1))?;
        let second = tracker.submit(GenerationKind::images(2))?;
        assert_ne!(first, second);
        assert_eq!(tracker.poll_once(&first), PollProgress::Superseded);
        assert_eq!(tracker.wait(&first, &CancelToken::new())?, SessionStatus::Abandoned);
        assert_eq!(store.session().session_id.as_deref(), Some(second.as_str()));
        assert_eq!(store.session().status, SessionStatus::Polling);
        Ok(())
    }

    #[test]
    fn submit_validates_inputs() {
        let backend = Arc::new(ScriptedBackend::default());
        let store = WorkspaceStore::new(100);
        let tracker = GenerationTracker::new(
            store.clone(),
            backend,
            EventWriter::disabled("test"),
            settings(100),
        );
        assert!(matches!(
            tracker.submit(GenerationKind::images(1)),
            Err(StudioError::Validation(_))
        ));

        store.set_original("/img/a.png", "h", Dimensions::new(1, 1));
        store.set_manual_prompt("   ");
        assert!(matches!(
            tracker.submit(GenerationKind::images(1)),
            Err(StudioError::Validation(_))
        ));
        assert!(matches!(
            tracker.submit(GenerationKind::Images { count: 0 }),
            Err(StudioError::Validation(_))
        ));
        assert_eq!(store.session().status, SessionStatus::Idle);
    }

    #[test]
    fn oversized_batch_is_clamped() -> anyhow::Result<()> {
        let backend = Arc::new(ScriptedBackend::default());
        let (store, tracker) = tracker(backend, 5_000);
        tracker.submit(GenerationKind::Images { count: 20 })?;
        assert_eq!(store.session().slots.len(), 8);
        Ok(())
    }
}
