use anyhow::Result;
use couture_contracts::events::EventWriter;
use couture_contracts::{StudioError, StudioResult};
use serde_json::json;

use crate::backend::TransformOutput;
use crate::map_object;
use crate::store::{SourceImage, WorkspaceStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Committed { version_id: String },
    /// The graph moved on while the operation ran; its result was dropped.
    Abandoned,
}

impl OperationOutcome {
    pub fn version_id(&self) -> Option<&str> {
        match self {
            Self::Committed { version_id } => Some(version_id),
            Self::Abandoned => None,
        }
    }
}

/// Runs a remote edit with an optimistic placeholder in the graph.
///
/// The placeholder appears before the backend call and is gone afterwards
/// whatever happened, including a panic inside the operation. An operation
/// that fails with a [`StudioError`] is reported as is; any other error is a
/// remote failure.
#[derive(Clone)]
pub struct OptimisticRunner {
    store: WorkspaceStore,
    events: EventWriter,
}

impl OptimisticRunner {
    pub fn new(store: WorkspaceStore, events: EventWriter) -> Self {
        Self { store, events }
    }

    pub fn run<F>(&self, operation: &str, label: &str, op: F) -> StudioResult<OperationOutcome>
    where
        F: FnOnce(&SourceImage) -> Result<TransformOutput>,
    {
        let pending = self.store.begin_operation(label)?;
        let mut guard = PlaceholderGuard {
            store: &self.store,
            placeholder_id: pending.placeholder_id.clone(),
            armed: true,
        };
        self.events.record(
            "operation_started",
            map_object(json!({
                "operation": operation,
                "placeholder_id": pending.placeholder_id,
                "source_version_id": pending.source.version_id,
            })),
        );

        let output = match op(&pending.source) {
            Ok(output) => output,
            Err(err) => {
                drop(guard);
                let error = match err.downcast::<StudioError>() {
                    Ok(error) => error,
                    Err(err) => StudioError::from_remote(operation, &err),
                };
                self.events.record(
                    "operation_failed",
                    map_object(json!({
                        "operation": operation,
                        "source_version_id": pending.source.version_id,
                        "error": error.to_string(),
                    })),
                );
                return Err(error);
            }
        };

        let committed = self.store.commit_operation(&pending, &output);
        guard.armed = false;
        match committed {
            Some(version_id) => {
                self.events.record(
                    "version_created",
                    map_object(json!({
                        "operation": operation,
                        "version_id": version_id,
                        "source_version_id": pending.source.version_id,
                        "image_url": output.result_ref,
                        "hash": output.result_hash,
                    })),
                );
                Ok(OperationOutcome::Committed { version_id })
            }
            None => {
                self.events.record(
                    "operation_abandoned",
                    map_object(json!({
                        "operation": operation,
                        "source_version_id": pending.source.version_id,
                        "reason": StudioError::inconsistent(format!(
                            "source version '{}' vanished while {operation} was running",
                            pending.source.version_id
                        ))
                        .to_string(),
                    })),
                );
                Ok(OperationOutcome::Abandoned)
            }
        }
    }
}

struct PlaceholderGuard<'a> {
    store: &'a WorkspaceStore,
    placeholder_id: String,
    armed: bool,
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.discard_placeholder(&self.placeholder_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::mpsc;
    use std::thread;

    use anyhow::bail;
    use couture_contracts::versions::{Dimensions, ORIGINAL_VERSION_ID};

    use super::*;

    fn setup() -> (WorkspaceStore, OptimisticRunner) {
        let store = WorkspaceStore::new(100);
        store.set_original("/img/original.png", "hash-0", Dimensions::new(400, 500));
        let runner = OptimisticRunner::new(store.clone(), EventWriter::disabled("test"));
        (store, runner)
    }

    fn output(url: &str) -> TransformOutput {
        TransformOutput {
            result_ref: url.to_string(),
            result_hash: format!("hash-{url}"),
            dimensions: None,
        }
    }

    #[test]
    fn placeholder_is_visible_while_running_then_replaced() -> anyhow::Result<()> {
        let (store, runner) = setup();
        let outcome = runner.run("background_removal", "Background Removed", |source| {
            assert_eq!(source.version_id, ORIGINAL_VERSION_ID);
            assert_eq!(source.image_url, "/img/original.png");
            let during = store.snapshot().graph;
            assert_eq!(during.pending_count(), 1);
            let placeholder = during
                .versions
                .iter()
                .find(|version| version.is_processing())
                .map(|version| version.label.clone());
            assert_eq!(placeholder.as_deref(), Some("Background Removed..."));
            assert_eq!(during.active_version_id(), Some(ORIGINAL_VERSION_ID));
            Ok(output("/img/nobg.png"))
        })?;

        let version_id = outcome.version_id().map(str::to_string);
        let graph = store.snapshot().graph;
        assert_eq!(graph.pending_count(), 0);
        assert_eq!(graph.versions.len(), 2);
        assert_eq!(graph.active_version_id(), version_id.as_deref());
        let active = graph.active.as_ref().map(|version| version.label.as_str());
        assert_eq!(active, Some("Background Removed"));
        assert_eq!(graph.history.len(), 2);
        Ok(())
    }

    #[test]
    fn failure_leaves_graph_unchanged() {
        let (store, runner) = setup();
        let before = store.snapshot().graph;
        let result = runner.run("upscale", "Upscaled", |_| bail!("service unavailable"));
        match result {
            Err(StudioError::RemoteOperation { operation, message }) => {
                assert_eq!(operation, "upscale");
                assert!(message.contains("service unavailable"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.snapshot().graph, before);
    }

    #[test]
    fn studio_errors_from_the_operation_keep_their_kind() {
        let (store, runner) = setup();
        let before = store.snapshot().graph;
        let result = runner.run("crop", "Cropped", |_| {
            Err(StudioError::validation("Select an area to crop first.").into())
        });
        assert_eq!(
            result,
            Err(StudioError::validation("Select an area to crop first."))
        );
        assert_eq!(store.snapshot().graph, before);
    }

    #[test]
    fn missing_image_is_a_validation_error() {
        let store = WorkspaceStore::new(100);
        let runner = OptimisticRunner::new(store.clone(), EventWriter::disabled("test"));
        let mut called = false;
        let result = runner.run("rotate", "Rotated", |_| {
            called = true;
            Ok(output("/img/never.png"))
        });
        assert!(matches!(result, Err(StudioError::Validation(_))));
        assert!(!called);
    }

    #[test]
    fn reset_during_operation_abandons_result() -> anyhow::Result<()> {
        let (store, runner) = setup();
        let outcome = runner.run("flip", "Flipped", |_| {
            store.set_original("/img/other.png", "hash-9", Dimensions::new(10, 10));
            Ok(output("/img/flipped.png"))
        })?;
        assert_eq!(outcome, OperationOutcome::Abandoned);
        let graph = store.snapshot().graph;
        assert_eq!(graph.versions.len(), 1);
        assert_eq!(graph.pending_count(), 0);
        assert_eq!(
            graph.active.map(|version| version.image_url),
            Some("/img/other.png".to_string())
        );
        Ok(())
    }

    #[test]
    fn panic_inside_operation_removes_placeholder() {
        let (store, runner) = setup();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = runner.run("face_detail", "Face Detailed", |_| -> Result<TransformOutput> {
                panic!("decoder exploded")
            });
        }));
        assert!(result.is_err());
        let graph = store.snapshot().graph;
        assert_eq!(graph.pending_count(), 0);
        assert_eq!(graph.versions.len(), 1);
    }

    #[test]
    fn concurrent_runs_keep_both_versions_and_last_wins() -> anyhow::Result<()> {
        let (store, runner) = setup();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let slow_runner = runner.clone();
        let slow = thread::spawn(move || {
            slow_runner.run("upscale", "Upscaled", |_| {
                started_tx.send(()).ok();
                release_rx.recv().ok();
                Ok(output("/img/up.png"))
            })
        });

        started_rx.recv()?;
        let fast = runner.run("rotate", "Rotated", |_| Ok(output("/img/rot.png")))?;
        assert_eq!(store.snapshot().graph.pending_count(), 1);
        release_tx.send(())?;
        let slow = slow
            .join()
            .map_err(|_| anyhow::anyhow!("slow operation panicked"))??;

        let graph = store.snapshot().graph;
        assert_eq!(graph.pending_count(), 0);
        assert_eq!(graph.versions.len(), 3);
        assert_ne!(fast.version_id(), slow.version_id());
        assert_eq!(graph.active_version_id(), slow.version_id());
        for version in graph.versions.iter().filter(|version| !version.is_original()) {
            assert_eq!(
                version.source_version_id.as_deref(),
                Some(ORIGINAL_VERSION_ID)
            );
        }
        Ok(())
    }
}
