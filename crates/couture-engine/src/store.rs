//! Single owner of the workspace state.
//!
//! Every mutation is one short lock scope with no backend call inside; the
//! resulting [`WorkspaceSnapshot`] is handed to subscribers after the lock
//! is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use couture_contracts::history::HistoryRecord;
use couture_contracts::prompt::{PromptComposer, PromptParams};
use couture_contracts::sessions::{
    GenerationKind, GenerationSession, PollResponse, SessionStatus,
};
use couture_contracts::versions::{
    AspectRatio, CropSelection, Dimensions, GraphSnapshot, VersionDraft, VersionGraph,
};
use couture_contracts::{StudioError, StudioResult};

use crate::backend::TransformOutput;

pub type SubscriptionId = u64;
/// Identifies one `begin_submit` call.
pub type SubmissionId = u64;
type Listener = Arc<dyn Fn(&WorkspaceSnapshot) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Workspace {
    pub graph: VersionGraph,
    pub session: GenerationSession,
    pub prompt: PromptComposer,
    submission: SubmissionId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptView {
    pub text: String,
    pub derived: String,
    pub manual: bool,
    pub stale: bool,
    pub params: PromptParams,
}

impl PromptView {
    fn of(composer: &PromptComposer) -> Self {
        Self {
            text: composer.text().to_string(),
            derived: composer.derived_text().to_string(),
            manual: composer.is_manual(),
            stale: composer.is_override_stale(),
            params: composer.params().clone(),
        }
    }
}

/// Immutable read model published after every mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceSnapshot {
    pub graph: GraphSnapshot,
    pub session: GenerationSession,
    pub prompt: PromptView,
}

impl WorkspaceSnapshot {
    fn of(workspace: &Workspace) -> Self {
        Self {
            graph: workspace.graph.snapshot(),
            session: workspace.session.clone(),
            prompt: PromptView::of(&workspace.prompt),
        }
    }
}

/// The image an in-flight operation reads from, captured in one lock scope
/// together with the view state that applies to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImage {
    pub version_id: String,
    pub image_url: String,
    pub hash: String,
    pub dimensions: Option<Dimensions>,
    pub crop_selection: Option<CropSelection>,
}

/// Ticket for an operation whose placeholder is already in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub placeholder_id: String,
    pub label: String,
    pub source: SourceImage,
    pub epoch: u64,
}

/// What a status response did to the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollApplied {
    Applied { terminal: bool },
    /// The response belongs to a session that is no longer current.
    Superseded,
}

#[derive(Clone)]
pub struct WorkspaceStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<Workspace>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl WorkspaceStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(Workspace {
                    graph: VersionGraph::with_history_limit(history_limit),
                    session: GenerationSession::default(),
                    prompt: PromptComposer::default(),
                    submission: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&WorkspaceSnapshot) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener)>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, Workspace> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: &WorkspaceSnapshot) {
        let listeners = self
            .listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(snapshot);
        }
    }

    /// Applies `f` under the lock, then notifies when `changed` says so.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Workspace) -> T,
        changed: impl Fn(&T) -> bool,
    ) -> T {
        let (result, snapshot) = {
            let mut state = self.state();
            let result = f(&mut state);
            let snapshot = changed(&result).then(|| WorkspaceSnapshot::of(&state));
            (result, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.publish(&snapshot);
        }
        result
    }

    pub fn read<T>(&self, f: impl FnOnce(&Workspace) -> T) -> T {
        f(&self.state())
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.read(WorkspaceSnapshot::of)
    }

    // =========================================================================
    // VERSION GRAPH
    // =========================================================================

    /// Roots a fresh graph at a newly loaded image; the session goes idle.
    pub fn set_original(&self, image_url: &str, hash: &str, dimensions: Dimensions) -> String {
        self.mutate(
            |ws| {
                ws.session = GenerationSession::default();
                ws.graph.set_original(image_url, hash, Some(dimensions))
            },
            |_| true,
        )
    }

    pub fn add_version(&self, draft: VersionDraft) -> StudioResult<String> {
        self.mutate(
            |ws| {
                let source_ok = ws
                    .graph
                    .get(&draft.source_version_id)
                    .map(|source| !source.is_processing())
                    .unwrap_or(false);
                if !source_ok {
                    return Err(StudioError::inconsistent(format!(
                        "source version '{}' is not in the graph",
                        draft.source_version_id
                    )));
                }
                Ok(ws.graph.add_version(draft))
            },
            Result::is_ok,
        )
    }

    pub fn set_active_version(&self, id: &str) -> bool {
        self.mutate(|ws| ws.graph.set_active_version(id), |changed| *changed)
    }

    pub fn undo(&self) -> bool {
        self.mutate(|ws| ws.graph.undo(), |changed| *changed)
    }

    pub fn redo(&self) -> bool {
        self.mutate(|ws| ws.graph.redo(), |changed| *changed)
    }

    /// Clears graph, session and prompt.
    pub fn reset(&self) {
        self.mutate(
            |ws| {
                ws.graph.reset();
                ws.session = GenerationSession::default();
                ws.prompt = PromptComposer::default();
            },
            |_| true,
        )
    }

    pub fn record_natural_dimensions(&self, version_id: &str, dimensions: Dimensions) -> bool {
        self.mutate(
            |ws| ws.graph.record_natural_dimensions(version_id, dimensions),
            |changed| *changed,
        )
    }

    pub fn set_crop_selection(&self, selection: Option<CropSelection>) -> bool {
        self.mutate(
            |ws| ws.graph.set_crop_selection(selection),
            |changed| *changed,
        )
    }

    pub fn set_aspect_ratio(&self, ratio: Option<AspectRatio>) -> bool {
        self.mutate(|ws| ws.graph.set_aspect_ratio(ratio), |changed| *changed)
    }

    pub fn set_comparison(&self, left: &str, right: &str) -> bool {
        self.mutate(
            |ws| ws.graph.set_comparison(left, right),
            |changed| *changed,
        )
    }

    pub fn clear_comparison(&self) {
        self.mutate(|ws| ws.graph.clear_comparison(), |_| true)
    }

    // =========================================================================
    // OPTIMISTIC OPERATIONS
    // =========================================================================

    /// Inserts a placeholder derived from the active version.
    pub fn begin_operation(&self, label: &str) -> StudioResult<PendingOperation> {
        self.mutate(
            |ws| {
                let Some(active) = ws.graph.active_version().cloned() else {
                    return Err(StudioError::validation("Load an image first."));
                };
                if active.is_processing() {
                    return Err(StudioError::validation(
                        "The active version is still processing.",
                    ));
                }
                let Some(placeholder) = ws.graph.insert_placeholder(&active.id, label) else {
                    return Err(StudioError::inconsistent(format!(
                        "active version '{}' cannot be used as a source",
                        active.id
                    )));
                };
                Ok(PendingOperation {
                    placeholder_id: placeholder.id,
                    label: label.to_string(),
                    source: SourceImage {
                        dimensions: ws.graph.active_natural_dimensions(),
                        crop_selection: ws.graph.view().crop_selection,
                        version_id: active.id,
                        image_url: active.image_url,
                        hash: active.hash,
                    },
                    epoch: ws.graph.epoch(),
                })
            },
            Result::is_ok,
        )
    }

    /// Swaps the placeholder for a complete version in one step.
    ///
    /// Returns `None` when the graph was reset or the source vanished while
    /// the operation was in flight; the placeholder is removed either way.
    pub fn commit_operation(
        &self,
        pending: &PendingOperation,
        output: &TransformOutput,
    ) -> Option<String> {
        self.mutate(
            |ws| {
                ws.graph.discard_placeholder(&pending.placeholder_id);
                if !ws
                    .graph
                    .is_live_source(pending.epoch, &pending.source.version_id)
                {
                    return None;
                }
                Some(ws.graph.add_version(VersionDraft {
                    image_url: output.result_ref.clone(),
                    label: pending.label.clone(),
                    source_version_id: pending.source.version_id.clone(),
                    hash: output.result_hash.clone(),
                    dimensions: output.dimensions,
                }))
            },
            |_| true,
        )
    }

    pub fn discard_placeholder(&self, placeholder_id: &str) -> bool {
        self.mutate(
            |ws| ws.graph.discard_placeholder(placeholder_id),
            |changed| *changed,
        )
    }

    // =========================================================================
    // GENERATION SESSION
    // =========================================================================

    /// Source image and prompt a generation would use right now.
    pub fn generation_inputs(&self) -> Option<(SourceImage, String)> {
        self.read(|ws| {
            let active = ws.graph.active_version()?;
            if active.is_processing() {
                return None;
            }
            Some((
                SourceImage {
                    version_id: active.id.clone(),
                    image_url: active.image_url.clone(),
                    hash: active.hash.clone(),
                    dimensions: ws.graph.active_natural_dimensions(),
                    crop_selection: ws.graph.view().crop_selection,
                },
                ws.prompt.text().to_string(),
            ))
        })
    }

    /// Resets the session to `Submitting`; the ticket names this submission.
    pub fn begin_submit(&self, kind: GenerationKind) -> SubmissionId {
        self.mutate(
            |ws| {
                ws.submission += 1;
                ws.session.begin_submit(kind);
                ws.submission
            },
            |_| true,
        )
    }

    fn is_submitting(ws: &Workspace, submission: SubmissionId) -> bool {
        ws.submission == submission && ws.session.status == SessionStatus::Submitting
    }

    /// Fails every slot of a submission that never got a session id.
    ///
    /// A newer submission or a reset in between leaves the session alone.
    pub fn fail_submit(&self, submission: SubmissionId, error: &str) -> bool {
        self.mutate(
            |ws| {
                if !Self::is_submitting(ws, submission) {
                    return false;
                }
                ws.session.fail_all(error);
                true
            },
            |changed| *changed,
        )
    }

    /// Attaches the remote session id, unless the submission was superseded.
    pub fn mark_polling(&self, submission: SubmissionId, session_id: &str) -> bool {
        self.mutate(
            |ws| {
                if !Self::is_submitting(ws, submission) {
                    return false;
                }
                ws.session.mark_polling(session_id);
                true
            },
            |changed| *changed,
        )
    }

    pub fn apply_poll(&self, session_id: &str, response: &PollResponse) -> PollApplied {
        self.mutate(
            |ws| {
                if ws.session.session_id.as_deref() != Some(session_id) {
                    return PollApplied::Superseded;
                }
                PollApplied::Applied {
                    terminal: ws.session.apply_poll(response),
                }
            },
            |applied| *applied != PollApplied::Superseded,
        )
    }

    /// Times out the session if it is still the current one.
    pub fn expire_session(&self, session_id: &str, error: &str) -> bool {
        self.mutate(
            |ws| {
                if ws.session.session_id.as_deref() != Some(session_id) {
                    return false;
                }
                ws.session.expire(error);
                true
            },
            |changed| *changed,
        )
    }

    pub fn abandon_session(&self, session_id: &str) -> bool {
        self.mutate(
            |ws| {
                if ws.session.session_id.as_deref() != Some(session_id) {
                    return false;
                }
                ws.session.abandon();
                true
            },
            |changed| *changed,
        )
    }

    pub fn session(&self) -> GenerationSession {
        self.read(|ws| ws.session.clone())
    }

    // =========================================================================
    // PROMPT
    // =========================================================================

    pub fn set_params(&self, params: PromptParams) {
        self.mutate(|ws| ws.prompt.on_params_changed(params), |_| true)
    }

    /// Applies `key=value` pairs to the current params; returns how many applied.
    pub fn apply_assignments(&self, assignments: &[String]) -> usize {
        self.mutate(
            |ws| {
                let mut params = ws.prompt.params().clone();
                let applied = params.apply_assignments(assignments.iter().map(String::as_str));
                if applied > 0 {
                    ws.prompt.on_params_changed(params);
                }
                applied
            },
            |applied| *applied > 0,
        )
    }

    pub fn set_manual_prompt(&self, text: &str) {
        self.mutate(|ws| ws.prompt.set_manual_text(text), |_| true)
    }

    pub fn reset_prompt(&self) {
        self.mutate(|ws| ws.prompt.reset_to_auto(), |_| true)
    }

    pub fn prompt(&self) -> PromptComposer {
        self.read(|ws| ws.prompt.clone())
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Captures the current workspace as a history record.
    pub fn history_record(&self) -> StudioResult<HistoryRecord> {
        self.read(|ws| {
            if ws.graph.is_empty() {
                return Err(StudioError::validation("Nothing to save yet."));
            }
            let session = (ws.session.status != SessionStatus::Idle).then(|| ws.session.clone());
            Ok(HistoryRecord::new(
                ws.prompt.text(),
                ws.prompt.is_manual(),
                ws.prompt.params().clone(),
                ws.graph.to_state(),
                session,
            ))
        })
    }

    /// Replaces the workspace with a saved record.
    ///
    /// A session that was still running when saved comes back abandoned.
    pub fn restore(&self, record: &HistoryRecord) -> StudioResult<()> {
        self.mutate(
            |ws| {
                ws.graph.restore(record.graph.clone())?;
                let mut prompt = PromptComposer::new(record.params.clone());
                if record.manual_prompt {
                    prompt.set_manual_text(record.prompt.clone());
                }
                ws.prompt = prompt;
                let mut session = record.session.clone().unwrap_or_default();
                session.abandon();
                ws.session = session;
                Ok(())
            },
            Result::is_ok,
        )
    }
}
