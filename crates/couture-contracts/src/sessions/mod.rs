//! Generation sessions: per-slot progress for one image batch or video.

use serde::{Deserialize, Serialize};

pub const MAX_IMAGE_BATCH: usize = 8;
pub const INCOMPLETE_SLOT_ERROR: &str = "Generation finished without a result for this slot.";
pub const DEFAULT_FAILURE_ERROR: &str = "Generation failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationKind {
    Images { count: usize },
    Video,
}

impl GenerationKind {
    /// Image batches are clamped into `1..=MAX_IMAGE_BATCH`.
    pub fn images(count: usize) -> Self {
        Self::Images {
            count: count.clamp(1, MAX_IMAGE_BATCH),
        }
    }

    pub fn slot_count(&self) -> usize {
        match self {
            Self::Images { count } => *count,
            Self::Video => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Images { .. } => "images",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Pending,
    Succeeded { url: String },
    Failed { error: String },
}

impl SlotState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Succeeded { url } => Some(url.as_str()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Submitting,
    Polling,
    Completed,
    Failed,
    /// The caller stopped waiting; the remote job may still finish.
    Abandoned,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    #[serde(alias = "queued", alias = "processing", alias = "running")]
    Pending,
    #[serde(alias = "succeeded", alias = "complete")]
    Completed,
    #[serde(alias = "error", alias = "canceled")]
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotResult {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SlotResult {
    pub fn success(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            url: None,
            error: Some(error.into()),
        }
    }

    fn to_state(&self) -> Option<SlotState> {
        if let Some(url) = non_empty(self.url.as_deref()) {
            return Some(SlotState::Succeeded { url });
        }
        non_empty(self.error.as_deref()).map(|error| SlotState::Failed { error })
    }
}

/// One answer from the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub overall_status: RemoteStatus,
    #[serde(default)]
    pub slots: Vec<Option<SlotResult>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PollResponse {
    pub fn pending(slots: Vec<Option<SlotResult>>) -> Self {
        Self {
            overall_status: RemoteStatus::Pending,
            slots,
            error: None,
        }
    }

    pub fn completed(slots: Vec<Option<SlotResult>>) -> Self {
        Self {
            overall_status: RemoteStatus::Completed,
            slots,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            overall_status: RemoteStatus::Failed,
            slots: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub session_id: Option<String>,
    pub kind: GenerationKind,
    pub status: SessionStatus,
    pub slots: Vec<SlotState>,
    pub error: Option<String>,
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self {
            session_id: None,
            kind: GenerationKind::images(1),
            status: SessionStatus::Idle,
            slots: Vec::new(),
            error: None,
        }
    }
}

impl GenerationSession {
    /// Resets to `Submitting` with every slot pending.
    pub fn begin_submit(&mut self, kind: GenerationKind) {
        *self = Self {
            session_id: None,
            kind,
            status: SessionStatus::Submitting,
            slots: vec![SlotState::Pending; kind.slot_count()],
            error: None,
        };
    }

    pub fn mark_polling(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
        self.status = SessionStatus::Polling;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Folds a status response into the slots. Returns true once terminal.
    ///
    /// Filled slots are never overwritten by later partial results; only an
    /// explicit `failed` for the whole session replaces them.
    pub fn apply_poll(&mut self, response: &PollResponse) -> bool {
        if self.status != SessionStatus::Polling {
            return self.is_terminal();
        }
        match response.overall_status {
            RemoteStatus::Pending => {
                self.merge_slots(&response.slots);
            }
            RemoteStatus::Completed => {
                self.merge_slots(&response.slots);
                self.fail_pending(INCOMPLETE_SLOT_ERROR);
                self.status = SessionStatus::Completed;
            }
            RemoteStatus::Failed => {
                let error = non_empty(response.error.as_deref())
                    .unwrap_or_else(|| DEFAULT_FAILURE_ERROR.to_string());
                self.fail_all(&error);
            }
        }
        self.is_terminal()
    }

    /// Fills pending slots from a partial result array; returns how many changed.
    pub fn merge_slots(&mut self, results: &[Option<SlotResult>]) -> usize {
        let mut filled = 0;
        for (slot, result) in self.slots.iter_mut().zip(results) {
            if !slot.is_pending() {
                continue;
            }
            if let Some(state) = result.as_ref().and_then(SlotResult::to_state) {
                *slot = state;
                filled += 1;
            }
        }
        filled
    }

    pub fn fail_pending(&mut self, error: &str) {
        for slot in self.slots.iter_mut().filter(|slot| slot.is_pending()) {
            *slot = SlotState::Failed {
                error: error.to_string(),
            };
        }
    }

    pub fn fail_all(&mut self, error: &str) {
        for slot in self.slots.iter_mut() {
            *slot = SlotState::Failed {
                error: error.to_string(),
            };
        }
        self.error = Some(error.to_string());
        self.status = SessionStatus::Failed;
    }

    /// Gives up on slots still pending; filled slots are kept.
    pub fn expire(&mut self, error: &str) {
        if self.is_terminal() {
            return;
        }
        self.fail_pending(error);
        self.error = Some(error.to_string());
        self.status = SessionStatus::Failed;
    }

    /// Only an in-flight session can be abandoned.
    pub fn abandon(&mut self) {
        if matches!(self.status, SessionStatus::Submitting | SessionStatus::Polling) {
            self.status = SessionStatus::Abandoned;
        }
    }

    /// `(pending, succeeded, failed)` slot counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.slots
            .iter()
            .fold((0, 0, 0), |(pending, ok, failed), slot| match slot {
                SlotState::Pending => (pending + 1, ok, failed),
                SlotState::Succeeded { .. } => (pending, ok + 1, failed),
                SlotState::Failed { .. } => (pending, ok, failed + 1),
            })
    }

    pub fn urls(&self) -> Vec<&str> {
        self.slots.iter().filter_map(SlotState::url).collect()
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
