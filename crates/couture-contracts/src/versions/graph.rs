use std::collections::{HashMap, HashSet};

use chrono::Utc;
use indexmap::IndexMap;
use uuid::Uuid;

use super::crop::{AspectRatio, CropSelection, Dimensions};
use super::model::{
    GraphSnapshot, GraphState, ImageVersion, VersionDraft, VersionStatus, ViewState,
};
use crate::error::{StudioError, StudioResult};

pub const ORIGINAL_VERSION_ID: &str = "original";
pub const ORIGINAL_LABEL: &str = "Original";
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Image versions of one workspace plus a linear activation log.
///
/// Versions form a tree through `source_version_id`; the log is flat and
/// behaves like a text editor's undo stack. Every activation change clears
/// the [`ViewState`], because crop rectangles and cached dimensions only
/// make sense against the pixel grid they were measured on.
///
/// Invariant: when `history_index` is set, `history[history_index]` is the
/// active version id.
#[derive(Debug, Clone)]
pub struct VersionGraph {
    versions: IndexMap<String, ImageVersion>,
    active_version_id: Option<String>,
    history: Vec<String>,
    history_index: Option<usize>,
    view: ViewState,
    epoch: u64,
    history_limit: usize,
    last_created_at: i64,
}

impl Default for VersionGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionGraph {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Caps the activation log; the oldest entries fall off first.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            versions: IndexMap::new(),
            active_version_id: None,
            history: Vec::new(),
            history_index: None,
            view: ViewState::default(),
            epoch: 0,
            history_limit: limit.max(2),
            last_created_at: 0,
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Starts a fresh graph rooted at a newly loaded image.
    pub fn set_original(
        &mut self,
        image_url: impl Into<String>,
        hash: impl Into<String>,
        dimensions: Option<Dimensions>,
    ) -> String {
        self.reset();
        let original = ImageVersion {
            id: ORIGINAL_VERSION_ID.to_string(),
            image_url: image_url.into(),
            label: ORIGINAL_LABEL.to_string(),
            source_version_id: None,
            created_at: self.next_timestamp(),
            hash: hash.into(),
            status: VersionStatus::Complete,
            dimensions,
        };
        self.versions.insert(original.id.clone(), original);
        self.history.push(ORIGINAL_VERSION_ID.to_string());
        self.history_index = Some(0);
        self.active_version_id = Some(ORIGINAL_VERSION_ID.to_string());
        self.view.natural_dimensions = dimensions;
        ORIGINAL_VERSION_ID.to_string()
    }

    /// Drops every version and the whole log.
    pub fn reset(&mut self) {
        self.versions.clear();
        self.active_version_id = None;
        self.history.clear();
        self.history_index = None;
        self.view = ViewState::default();
        self.epoch += 1;
    }

    /// Identifies the current graph instance; bumped by every reset.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    // =========================================================================
    // VERSIONS
    // =========================================================================

    /// Records a completed edit and makes it active.
    ///
    /// The caller guarantees `draft.source_version_id` names a known version.
    pub fn add_version(&mut self, draft: VersionDraft) -> String {
        let id = Uuid::new_v4().to_string();
        let version = ImageVersion {
            id: id.clone(),
            image_url: draft.image_url,
            label: draft.label,
            source_version_id: Some(draft.source_version_id),
            created_at: self.next_timestamp(),
            hash: draft.hash,
            status: VersionStatus::Complete,
            dimensions: draft.dimensions,
        };
        self.versions.insert(id.clone(), version);
        self.push_activation(&id);
        id
    }

    /// Inserts a `processing` stand-in derived from `source_version_id`.
    ///
    /// Placeholders live in the versions map only; they never enter the log
    /// and never become active.
    pub fn insert_placeholder(
        &mut self,
        source_version_id: &str,
        label: &str,
    ) -> Option<ImageVersion> {
        let (source_id, image_url, hash, dimensions) = self
            .versions
            .get(source_version_id)
            .filter(|version| !version.is_processing())
            .map(|source| {
                (
                    source.id.clone(),
                    source.image_url.clone(),
                    source.hash.clone(),
                    source.dimensions,
                )
            })?;
        let placeholder = ImageVersion {
            id: format!("pending-{}", Uuid::new_v4()),
            image_url,
            label: format!("{label}..."),
            source_version_id: Some(source_id),
            created_at: self.next_timestamp(),
            hash,
            status: VersionStatus::Processing,
            dimensions,
        };
        self.versions
            .insert(placeholder.id.clone(), placeholder.clone());
        Some(placeholder)
    }

    /// Removes a placeholder. Complete versions are never removed here.
    pub fn discard_placeholder(&mut self, id: &str) -> bool {
        let is_placeholder = self
            .versions
            .get(id)
            .map(ImageVersion::is_processing)
            .unwrap_or(false);
        if is_placeholder {
            self.versions.shift_remove(id);
        }
        is_placeholder
    }

    pub fn get(&self, id: &str) -> Option<&ImageVersion> {
        self.versions.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.versions.contains_key(id)
    }

    /// True when `id` is a complete version of the graph identified by `epoch`.
    pub fn is_live_source(&self, epoch: u64, id: &str) -> bool {
        self.epoch == epoch
            && self
                .versions
                .get(id)
                .map(|version| !version.is_processing())
                .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn versions(&self) -> impl Iterator<Item = &ImageVersion> {
        self.versions.values()
    }

    /// Versions derived directly from `id`.
    pub fn children(&self, id: &str) -> Vec<&ImageVersion> {
        self.versions
            .values()
            .filter(|version| version.source_version_id.as_deref() == Some(id))
            .collect()
    }

    // =========================================================================
    // ACTIVATION / UNDO / REDO
    // =========================================================================

    pub fn active_version_id(&self) -> Option<&str> {
        self.active_version_id.as_deref()
    }

    pub fn active_version(&self) -> Option<&ImageVersion> {
        self.active_version_id
            .as_deref()
            .and_then(|id| self.versions.get(id))
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn history_index(&self) -> Option<usize> {
        self.history_index
    }

    /// Activates a known, complete version.
    ///
    /// Switching counts as an activation event in the log, so undo returns
    /// to the previously active version. The view state is cleared even
    /// when `id` is already active.
    pub fn set_active_version(&mut self, id: &str) -> bool {
        let selectable = self
            .versions
            .get(id)
            .map(|version| !version.is_processing())
            .unwrap_or(false);
        if !selectable {
            return false;
        }
        if self.active_version_id.as_deref() == Some(id) {
            self.view = ViewState::default();
        } else {
            self.push_activation(id);
        }
        true
    }

    pub fn can_undo(&self) -> bool {
        matches!(self.history_index, Some(idx) if idx > 0)
    }

    pub fn can_redo(&self) -> bool {
        matches!(self.history_index, Some(idx) if idx + 1 < self.history.len())
    }

    pub fn undo(&mut self) -> bool {
        match self.history_index {
            Some(idx) if idx > 0 => {
                self.activate_at(idx - 1);
                true
            }
            _ => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.history_index {
            Some(idx) if idx + 1 < self.history.len() => {
                self.activate_at(idx + 1);
                true
            }
            _ => false,
        }
    }

    fn activate_at(&mut self, idx: usize) {
        self.history_index = Some(idx);
        self.active_version_id = Some(self.history[idx].clone());
        self.view = ViewState::default();
    }

    fn push_activation(&mut self, id: &str) {
        match self.history_index {
            Some(idx) => self.history.truncate(idx + 1),
            None => self.history.clear(),
        }
        self.history.push(id.to_string());
        if self.history.len() > self.history_limit {
            let overflow = self.history.len() - self.history_limit;
            self.history.drain(..overflow);
        }
        self.activate_at(self.history.len() - 1);
    }

    // =========================================================================
    // VIEW STATE
    // =========================================================================

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    /// Records the natural size a renderer measured for `version_id`.
    ///
    /// Measurements of anything but the active version are stale and dropped.
    pub fn record_natural_dimensions(&mut self, version_id: &str, dimensions: Dimensions) -> bool {
        if self.active_version_id.as_deref() != Some(version_id) {
            return false;
        }
        self.view.natural_dimensions = Some(dimensions);
        true
    }

    /// Natural size of the active version as far as it is known.
    pub fn active_natural_dimensions(&self) -> Option<Dimensions> {
        self.view
            .natural_dimensions
            .or_else(|| self.active_version().and_then(|version| version.dimensions))
    }

    pub fn set_crop_selection(&mut self, selection: Option<CropSelection>) -> bool {
        if self.active_version_id.is_none() {
            return false;
        }
        self.view.crop_selection = selection.map(|selection| self.constrained(selection));
        true
    }

    pub fn set_aspect_ratio(&mut self, ratio: Option<AspectRatio>) -> bool {
        if self.active_version_id.is_none() {
            return false;
        }
        self.view.aspect_ratio = ratio;
        if let Some(selection) = self.view.crop_selection {
            self.view.crop_selection = Some(self.constrained(selection));
        }
        true
    }

    fn constrained(&self, selection: CropSelection) -> CropSelection {
        match (self.view.aspect_ratio, self.active_natural_dimensions()) {
            (Some(ratio), Some(natural)) => selection.constrain(ratio, natural),
            _ => selection,
        }
    }

    /// Pairs two complete versions for side-by-side display.
    pub fn set_comparison(&mut self, left: &str, right: &str) -> bool {
        let complete = |id: &str| {
            self.versions
                .get(id)
                .map(|version| !version.is_processing())
                .unwrap_or(false)
        };
        if !complete(left) || !complete(right) {
            return false;
        }
        self.view.comparison = Some((left.to_string(), right.to_string()));
        true
    }

    pub fn clear_comparison(&mut self) {
        self.view.comparison = None;
    }

    // =========================================================================
    // READ MODEL / PERSISTENCE
    // =========================================================================

    pub fn snapshot(&self) -> GraphSnapshot {
        let mut versions = self.versions.values().cloned().collect::<Vec<_>>();
        versions.sort_by_key(|version| version.created_at);
        GraphSnapshot {
            epoch: self.epoch,
            active: self.active_version().cloned(),
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            versions,
            history: self.history.clone(),
            history_index: self.history_index,
            view: self.view.clone(),
        }
    }

    /// Complete versions and the log, without placeholders.
    pub fn to_state(&self) -> GraphState {
        GraphState {
            versions: self
                .versions
                .values()
                .filter(|version| !version.is_processing())
                .cloned()
                .collect(),
            active_version_id: self.active_version_id.clone(),
            history: self.history.clone(),
            history_index: self.history_index,
        }
    }

    /// Replaces the graph with a saved state.
    ///
    /// The state is validated first; on error the graph is left untouched.
    pub fn restore(&mut self, state: GraphState) -> StudioResult<()> {
        let versions = state
            .versions
            .into_iter()
            .filter(|version| !version.is_processing())
            .collect::<Vec<_>>();
        let mut ids = HashSet::new();
        for version in &versions {
            if !ids.insert(version.id.as_str()) {
                return Err(StudioError::validation(format!(
                    "Saved workspace repeats version '{}'.",
                    version.id
                )));
            }
        }
        let roots = versions.iter().filter(|version| version.is_original()).count();
        if roots != 1 {
            return Err(StudioError::validation(format!(
                "Saved workspace must have exactly one original image (found {roots})."
            )));
        }
        for version in &versions {
            if let Some(source) = version.source_version_id.as_deref() {
                if !ids.contains(source) {
                    return Err(StudioError::validation(format!(
                        "Version '{}' derives from unknown version '{source}'.",
                        version.id
                    )));
                }
            }
        }
        let parents = versions
            .iter()
            .filter_map(|version| {
                let source = version.source_version_id.as_deref()?;
                Some((version.id.as_str(), source))
            })
            .collect::<HashMap<_, _>>();
        for version in &versions {
            let mut seen = HashSet::new();
            let mut cursor = version.id.as_str();
            while let Some(&parent) = parents.get(cursor) {
                if !seen.insert(cursor) {
                    return Err(StudioError::validation(format!(
                        "Version '{}' is part of a derivation cycle.",
                        version.id
                    )));
                }
                cursor = parent;
            }
        }
        if let Some(missing) = state
            .history
            .iter()
            .find(|id| !ids.contains(id.as_str()))
        {
            return Err(StudioError::validation(format!(
                "Saved history references unknown version '{missing}'."
            )));
        }

        let active = match state.active_version_id {
            Some(active) if ids.contains(active.as_str()) => active,
            Some(active) => {
                return Err(StudioError::validation(format!(
                    "Saved active version '{active}' does not exist."
                )))
            }
            None => state
                .history_index
                .and_then(|idx| state.history.get(idx).cloned())
                .or_else(|| {
                    versions
                        .iter()
                        .find(|version| version.is_original())
                        .map(|version| version.id.clone())
                })
                .unwrap_or_default(),
        };

        let (history, history_index) = match state.history_index {
            Some(idx) if state.history.get(idx) == Some(&active) => (state.history, Some(idx)),
            _ if state.history.is_empty() => (vec![active.clone()], Some(0)),
            _ => {
                return Err(StudioError::validation(
                    "Saved history position does not match the active version.",
                ))
            }
        };

        self.reset();
        self.last_created_at = versions
            .iter()
            .map(|version| version.created_at)
            .max()
            .unwrap_or(0);
        self.versions = versions
            .into_iter()
            .map(|version| (version.id.clone(), version))
            .collect();
        self.history = history;
        self.history_index = history_index;
        self.active_version_id = Some(active);
        if self.history.len() > self.history_limit {
            let overflow = self.history.len() - self.history_limit;
            self.history.drain(..overflow);
            self.history_index = self.history_index.map(|idx| idx.saturating_sub(overflow));
            let idx = self.history_index.unwrap_or(0);
            self.active_version_id = Some(self.history[idx].clone());
        }
        self.view.natural_dimensions = self.active_version().and_then(|version| version.dimensions);
        Ok(())
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_created_at = now.max(self.last_created_at + 1);
        self.last_created_at
    }
}
