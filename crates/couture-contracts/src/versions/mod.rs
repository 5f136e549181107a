mod crop;
mod graph;
mod model;

pub use crop::{AspectRatio, CropSelection, Dimensions, PixelRect};
pub use graph::{VersionGraph, DEFAULT_HISTORY_LIMIT, ORIGINAL_LABEL, ORIGINAL_VERSION_ID};
pub use model::{
    GraphSnapshot, GraphState, ImageVersion, VersionDraft, VersionStatus, ViewState,
};
