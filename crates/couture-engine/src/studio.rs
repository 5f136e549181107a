use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use couture_contracts::events::EventWriter;
use couture_contracts::history::{HistoryPage, HistoryRecord};
use couture_contracts::prompt::PromptParams;
use couture_contracts::sessions::{GenerationKind, GenerationSession};
use couture_contracts::versions::{AspectRatio, CropSelection, Dimensions, PixelRect};
use couture_contracts::{StudioError, StudioResult};
use serde_json::json;

use crate::backend::{Backends, TransformKind, TransformOutput, TransformRequest};
use crate::config::StudioConfig;
use crate::map_object;
use crate::runner::{OperationOutcome, OptimisticRunner};
use crate::store::{SourceImage, WorkspaceSnapshot, WorkspaceStore};
use crate::tracker::{CancelToken, GenerationTracker, PollSettings};

const UNKNOWN_DIMENSIONS: &str = "Image dimensions are unknown; cannot crop.";
const NO_SELECTION: &str = "Select an area to crop first.";

/// Where a crop finds its selection.
#[derive(Debug, Clone, Copy)]
enum CropArea {
    Given(CropSelection),
    /// The selection held in the view state of the source version.
    View,
}

/// One editing workspace: a loaded garment, its versions, the prompt, and
/// the generation session, wired to a set of backends.
pub struct Studio {
    store: WorkspaceStore,
    backends: Backends,
    runner: OptimisticRunner,
    tracker: GenerationTracker,
    events: EventWriter,
    transform_cache: Arc<Mutex<HashMap<String, TransformOutput>>>,
}

impl Studio {
    pub fn new(config: &StudioConfig, backends: Backends, events: EventWriter) -> Self {
        let store = WorkspaceStore::new(config.history_limit);
        let runner = OptimisticRunner::new(store.clone(), events.clone());
        let tracker = GenerationTracker::new(
            store.clone(),
            backends.generation.clone(),
            events.clone(),
            PollSettings::from_config(config),
        );
        events.record(
            "studio_started",
            map_object(json!({
                "backend": backends.images.name(),
                "history_limit": config.history_limit,
                "poll_interval_s": config.poll_interval.as_secs_f64(),
                "poll_timeout_s": config.poll_timeout.as_secs_f64(),
            })),
        );
        Self {
            store,
            backends,
            runner,
            tracker,
            events,
            transform_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.store.snapshot()
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Uploads a garment image and roots a fresh graph at it.
    pub fn load_image(&self, path: &Path) -> StudioResult<String> {
        if !path.is_file() {
            return Err(StudioError::validation(format!(
                "Image not found: {}",
                path.display()
            )));
        }
        let uploaded = self
            .backends
            .images
            .upload_and_prepare(path)
            .map_err(|err| StudioError::from_remote("upload", &err))?;
        if uploaded.dimensions.is_empty() {
            return Err(StudioError::validation("The uploaded image has no pixels."));
        }
        let id = self
            .store
            .set_original(&uploaded.image_ref, &uploaded.hash, uploaded.dimensions);
        self.events.record(
            "image_loaded",
            map_object(json!({
                "path": path.to_string_lossy(),
                "image_url": uploaded.image_ref,
                "hash": uploaded.hash,
                "width": uploaded.dimensions.width,
                "height": uploaded.dimensions.height,
            })),
        );
        Ok(id)
    }

    // =========================================================================
    // TRANSFORMS
    // =========================================================================

    pub fn remove_background(&self) -> StudioResult<OperationOutcome> {
        self.transform(TransformKind::BackgroundRemoval)
    }

    pub fn upscale(&self) -> StudioResult<OperationOutcome> {
        self.transform(TransformKind::Upscale)
    }

    pub fn face_detail(&self) -> StudioResult<OperationOutcome> {
        self.transform(TransformKind::FaceDetail)
    }

    pub fn rotate(&self) -> StudioResult<OperationOutcome> {
        self.transform(TransformKind::Rotate)
    }

    pub fn flip(&self) -> StudioResult<OperationOutcome> {
        self.transform(TransformKind::Flip)
    }

    /// Applies any transform except crop, which needs a selection.
    pub fn transform(&self, kind: TransformKind) -> StudioResult<OperationOutcome> {
        if kind == TransformKind::Crop {
            return self.crop_current();
        }
        self.run_transform(kind, None)
    }

    /// Crops the active version to `selection` (fractions of its natural size).
    ///
    /// The pixel rectangle is computed from the size of the version the
    /// operation actually reads, never from an earlier read of the store.
    pub fn crop(&self, selection: CropSelection) -> StudioResult<OperationOutcome> {
        self.check_croppable(false)?;
        self.run_transform(TransformKind::Crop, Some(CropArea::Given(selection)))
    }

    /// Crops to the selection held in the view state.
    pub fn crop_current(&self) -> StudioResult<OperationOutcome> {
        self.check_croppable(true)?;
        self.run_transform(TransformKind::Crop, Some(CropArea::View))
    }

    fn check_croppable(&self, needs_selection: bool) -> StudioResult<()> {
        let (loaded, natural, selection) = self.store.read(|ws| {
            (
                ws.graph.active_version().is_some(),
                ws.graph.active_natural_dimensions(),
                ws.graph.view().crop_selection,
            )
        });
        if !loaded {
            return Err(StudioError::validation("Load an image first."));
        }
        if natural.is_none() {
            return Err(StudioError::validation(UNKNOWN_DIMENSIONS));
        }
        if needs_selection && selection.is_none() {
            return Err(StudioError::validation(NO_SELECTION));
        }
        Ok(())
    }

    pub fn set_crop_selection(&self, selection: Option<CropSelection>) -> bool {
        self.store.set_crop_selection(selection)
    }

    pub fn set_aspect_ratio(&self, ratio: Option<AspectRatio>) -> bool {
        self.store.set_aspect_ratio(ratio)
    }

    pub fn record_natural_dimensions(&self, version_id: &str, dimensions: Dimensions) -> bool {
        self.store.record_natural_dimensions(version_id, dimensions)
    }

    fn run_transform(
        &self,
        kind: TransformKind,
        crop: Option<CropArea>,
    ) -> StudioResult<OperationOutcome> {
        let images = self.backends.images.clone();
        let cache = self.transform_cache.clone();
        let events = self.events.clone();
        self.runner.run(kind.slug(), kind.label(), move |source| {
            let mut request = TransformRequest::new(kind, &source.image_url, &source.hash);
            if let Some(area) = crop {
                request = request.with_crop(crop_rect(area, source)?);
            }
            let key = request.cache_key();
            let cached = cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&key)
                .cloned();
            if let Some(output) = cached {
                events.record(
                    "transform_cache_hit",
                    map_object(json!({
                        "operation": kind.slug(),
                        "source_version_id": source.version_id,
                        "image_url": output.result_ref,
                    })),
                );
                return Ok(output);
            }
            let output = images.transform(&request)?;
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, output.clone());
            Ok(output)
        })
    }

    // =========================================================================
    // NAVIGATION
    // =========================================================================

    pub fn undo(&self) -> bool {
        self.store.undo()
    }

    pub fn redo(&self) -> bool {
        self.store.redo()
    }

    /// Activates `id`. The switch is recorded like an edit, so any redo
    /// branch past the current position is lost.
    pub fn select_version(&self, id: &str) -> bool {
        self.store.set_active_version(id)
    }

    pub fn compare(&self, left: &str, right: &str) -> bool {
        self.store.set_comparison(left, right)
    }

    pub fn clear_comparison(&self) {
        self.store.clear_comparison()
    }

    // =========================================================================
    // PROMPT
    // =========================================================================

    pub fn set_params(&self, params: PromptParams) {
        self.store.set_params(params)
    }

    pub fn apply_assignments(&self, assignments: &[String]) -> usize {
        self.store.apply_assignments(assignments)
    }

    pub fn set_prompt_text(&self, text: &str) {
        self.store.set_manual_prompt(text)
    }

    pub fn reset_prompt(&self) {
        self.store.reset_prompt()
    }

    // =========================================================================
    // GENERATION
    // =========================================================================

    pub fn generate_images(
        &self,
        count: usize,
        cancel: &CancelToken,
    ) -> StudioResult<GenerationSession> {
        self.tracker.run(GenerationKind::Images { count }, cancel)
    }

    /// Generates a clip; the prompt gets the motion clause while it runs.
    pub fn generate_video(&self, cancel: &CancelToken) -> StudioResult<GenerationSession> {
        let params = self.store.prompt().params().clone();
        let switched = !params.video;
        if switched {
            self.store.set_params(params.clone().with_video(true));
        }
        let result = self.tracker.run(GenerationKind::Video, cancel);
        if switched {
            let mut restored = self.store.prompt().params().clone();
            restored.video = false;
            self.store.set_params(restored);
        }
        result
    }

    pub fn tracker(&self) -> &GenerationTracker {
        &self.tracker
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    pub fn save_history(&self) -> StudioResult<HistoryRecord> {
        let record = self.store.history_record()?;
        self.backends
            .history
            .save_history_record(&record)
            .map_err(|err| StudioError::from_remote("history save", &err))?;
        self.events.record(
            "history_saved",
            map_object(json!({
                "record_id": record.id,
                "versions": record.graph.versions.len(),
                "outputs": record.summary().output_count,
            })),
        );
        Ok(record)
    }

    pub fn load_history(&self, id: &str) -> StudioResult<HistoryRecord> {
        let record = self
            .backends
            .history
            .load_history_record(id)
            .map_err(|err| StudioError::from_remote("history load", &err))?;
        self.store.restore(&record)?;
        self.events.record(
            "history_loaded",
            map_object(json!({
                "record_id": record.id,
                "versions": record.graph.versions.len(),
                "active_version_id": record.graph.active_version_id,
            })),
        );
        Ok(record)
    }

    pub fn list_history(&self, page: usize, per_page: usize) -> StudioResult<HistoryPage> {
        self.backends
            .history
            .list_history(page, per_page)
            .map_err(|err| StudioError::from_remote("history list", &err))
    }

    pub fn reset(&self) {
        self.store.reset()
    }
}

/// Pixel rectangle of a crop on `source`, measured on its own pixel grid.
fn crop_rect(area: CropArea, source: &SourceImage) -> StudioResult<PixelRect> {
    let selection = match area {
        CropArea::Given(selection) => selection,
        CropArea::View => source
            .crop_selection
            .ok_or_else(|| StudioError::validation(NO_SELECTION))?,
    };
    let natural = source
        .dimensions
        .ok_or_else(|| StudioError::validation(UNKNOWN_DIMENSIONS))?;
    selection.to_pixels(natural)
}
