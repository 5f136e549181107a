//! Couture studio engine: the workspace store, optimistic edits, generation
//! tracking, and the backends they call.

pub mod backend;
pub mod config;
pub mod runner;
pub mod store;
pub mod studio;
pub mod tracker;

use serde_json::{Map, Value};

pub use backend::{
    Backends, DryrunBackend, GenerationBackend, HistoryBackend, HttpBackend, ImageBackend,
    LocalHistoryBackend, TransformKind,
};
pub use config::{BackendKind, StudioConfig};
pub use runner::{OperationOutcome, OptimisticRunner};
pub use store::{WorkspaceSnapshot, WorkspaceStore};
pub use studio::Studio;
pub use tracker::{CancelToken, GenerationTracker, PollProgress, PollSettings};

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
