use serde::{Deserialize, Serialize};

use super::crop::{AspectRatio, CropSelection, Dimensions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Placeholder for an operation still in flight.
    Processing,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageVersion {
    pub id: String,
    pub image_url: String,
    pub label: String,
    /// `None` only for the original upload.
    pub source_version_id: Option<String>,
    /// Milliseconds since the epoch, strictly increasing within a graph.
    pub created_at: i64,
    pub hash: String,
    pub status: VersionStatus,
    #[serde(default)]
    pub dimensions: Option<Dimensions>,
}

impl ImageVersion {
    pub fn is_original(&self) -> bool {
        self.source_version_id.is_none()
    }

    pub fn is_processing(&self) -> bool {
        self.status == VersionStatus::Processing
    }
}

/// A completed edit waiting to be recorded by [`super::VersionGraph::add_version`].
#[derive(Debug, Clone, PartialEq)]
pub struct VersionDraft {
    pub image_url: String,
    pub label: String,
    pub source_version_id: String,
    pub hash: String,
    pub dimensions: Option<Dimensions>,
}

/// Transient state tied to the pixel grid of the active version.
///
/// Everything here is cleared whenever the active version changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub crop_selection: Option<CropSelection>,
    pub aspect_ratio: Option<AspectRatio>,
    pub natural_dimensions: Option<Dimensions>,
    pub comparison: Option<(String, String)>,
}

impl ViewState {
    pub fn is_clear(&self) -> bool {
        *self == Self::default()
    }
}

/// Serializable form of a graph, used for history records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub versions: Vec<ImageVersion>,
    pub active_version_id: Option<String>,
    pub history: Vec<String>,
    pub history_index: Option<usize>,
}

/// Read model handed to renderers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub epoch: u64,
    pub active: Option<ImageVersion>,
    pub can_undo: bool,
    pub can_redo: bool,
    /// Ordered by `created_at`, placeholders included.
    pub versions: Vec<ImageVersion>,
    pub history: Vec<String>,
    pub history_index: Option<usize>,
    pub view: ViewState,
}

impl GraphSnapshot {
    pub fn active_version_id(&self) -> Option<&str> {
        self.active.as_ref().map(|version| version.id.as_str())
    }

    pub fn pending_count(&self) -> usize {
        self.versions
            .iter()
            .filter(|version| version.is_processing())
            .count()
    }
}
