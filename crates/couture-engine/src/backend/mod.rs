//! Collaborator contracts: uploads, image transforms, generation jobs and
//! the history service. Every call may block and may fail.

mod dryrun;
mod http;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use couture_contracts::history::{HistoryPage, HistoryRecord};
use couture_contracts::sessions::{GenerationKind, PollResponse};
use couture_contracts::versions::{Dimensions, PixelRect};
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, StudioConfig};

pub use dryrun::{DryrunBackend, LocalHistoryBackend};
pub use http::HttpBackend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub image_ref: String,
    pub hash: String,
    pub dimensions: Dimensions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    BackgroundRemoval,
    Upscale,
    FaceDetail,
    Crop,
    Rotate,
    Flip,
}

impl TransformKind {
    pub const ALL: [TransformKind; 6] = [
        Self::BackgroundRemoval,
        Self::Upscale,
        Self::FaceDetail,
        Self::Crop,
        Self::Rotate,
        Self::Flip,
    ];

    /// Label of the version the transform produces.
    pub fn label(&self) -> &'static str {
        match self {
            Self::BackgroundRemoval => "Background Removed",
            Self::Upscale => "Upscaled",
            Self::FaceDetail => "Face Detailed",
            Self::Crop => "Cropped",
            Self::Rotate => "Rotated",
            Self::Flip => "Flipped",
        }
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Self::BackgroundRemoval => "background_removal",
            Self::Upscale => "upscale",
            Self::FaceDetail => "face_detail",
            Self::Crop => "crop",
            Self::Rotate => "rotate",
            Self::Flip => "flip",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "background_removal" | "remove_background" | "bg" => Some(Self::BackgroundRemoval),
            "upscale" => Some(Self::Upscale),
            "face_detail" | "face" => Some(Self::FaceDetail),
            "crop" => Some(Self::Crop),
            "rotate" => Some(Self::Rotate),
            "flip" => Some(Self::Flip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub kind: TransformKind,
    pub source_ref: String,
    pub source_hash: String,
    /// Source-pixel rectangle, only for [`TransformKind::Crop`].
    pub crop: Option<PixelRect>,
}

impl TransformRequest {
    pub fn new(kind: TransformKind, source_ref: &str, source_hash: &str) -> Self {
        Self {
            kind,
            source_ref: source_ref.to_string(),
            source_hash: source_hash.to_string(),
            crop: None,
        }
    }

    pub fn with_crop(mut self, rect: PixelRect) -> Self {
        self.crop = Some(rect);
        self
    }

    /// Identifies requests that must produce identical bytes.
    pub fn cache_key(&self) -> String {
        let params = self
            .crop
            .map(|rect| format!("{}:{}:{}x{}", rect.x, rect.y, rect.width, rect.height))
            .unwrap_or_default();
        format!("{}|{}|{}", self.kind.slug(), self.source_hash, params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub result_ref: String,
    pub result_hash: String,
    pub dimensions: Option<Dimensions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub source_ref: String,
    pub source_hash: String,
    pub prompt: String,
    pub kind: GenerationKind,
}

pub trait ImageBackend: Send + Sync {
    fn name(&self) -> &str;
    fn upload_and_prepare(&self, path: &Path) -> Result<UploadedImage>;
    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput>;
}

pub trait GenerationBackend: Send + Sync {
    /// Starts a job and returns its session id; generation itself is async.
    fn start_generation(&self, request: &GenerationRequest) -> Result<String>;
    fn poll_generation_status(&self, session_id: &str) -> Result<PollResponse>;
}

pub trait HistoryBackend: Send + Sync {
    fn load_history_record(&self, id: &str) -> Result<HistoryRecord>;
    fn save_history_record(&self, record: &HistoryRecord) -> Result<()>;
    fn list_history(&self, page: usize, per_page: usize) -> Result<HistoryPage>;
}

/// The collaborator set a studio runs against.
#[derive(Clone)]
pub struct Backends {
    pub images: Arc<dyn ImageBackend>,
    pub generation: Arc<dyn GenerationBackend>,
    pub history: Arc<dyn HistoryBackend>,
}

impl Backends {
    pub fn dryrun(work_dir: &Path) -> Result<Self> {
        let backend = Arc::new(DryrunBackend::new(work_dir)?);
        Ok(Self {
            images: backend.clone(),
            generation: backend,
            history: Arc::new(LocalHistoryBackend::new(work_dir.join("history.json"))),
        })
    }

    pub fn http(config: &StudioConfig) -> Result<Self> {
        let backend = Arc::new(HttpBackend::new(config)?);
        Ok(Self {
            images: backend.clone(),
            generation: backend.clone(),
            history: backend,
        })
    }

    pub fn from_config(config: &StudioConfig, work_dir: &Path) -> Result<Self> {
        match config.backend {
            BackendKind::Dryrun => Self::dryrun(work_dir),
            BackendKind::Http => Self::http(config),
        }
    }
}
