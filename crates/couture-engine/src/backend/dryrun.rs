use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use couture_contracts::history::{HistoryPage, HistoryRecord, HistoryStore};
use couture_contracts::sessions::{GenerationKind, PollResponse, SlotResult};
use couture_contracts::versions::Dimensions;
use image::codecs::gif::GifEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Frame, ImageFormat, Rgba, RgbaImage};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{
    GenerationBackend, GenerationRequest, HistoryBackend, ImageBackend, TransformKind,
    TransformOutput, TransformRequest, UploadedImage,
};

const MAX_UPSCALE_EDGE: u32 = 8192;
const KEY_COLOR_TOLERANCE: i32 = 40;
const PREVIEW_EDGE: u32 = 256;
const VIDEO_FRAMES: u32 = 6;

/// Local stand-in for the AI providers.
///
/// Transforms really run on the pixels with the `image` crate. Generation
/// jobs reveal one slot per poll and then report `completed`; a prompt
/// containing "fail" makes the job report `failed` instead. A job is
/// forgotten once it has reported a terminal status.
pub struct DryrunBackend {
    work_dir: PathBuf,
    jobs: Mutex<HashMap<String, DryrunJob>>,
}

#[derive(Debug, Clone)]
struct DryrunJob {
    request: GenerationRequest,
    polls: usize,
    outputs: Vec<String>,
}

impl DryrunBackend {
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("failed creating {}", work_dir.display()))?;
        Ok(Self {
            work_dir,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn write_png(
        &self,
        folder: &str,
        stem: &str,
        image: &DynamicImage,
    ) -> Result<(PathBuf, String)> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("failed encoding PNG")?;
        let hash = sha256_hex(&bytes);
        let dir = self.work_dir.join(folder);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{stem}-{}.png", &hash[..16]));
        fs::write(&path, &bytes).with_context(|| format!("failed writing {}", path.display()))?;
        Ok((path, hash))
    }

    fn render_slot(&self, job: &DryrunJob, session_id: &str, idx: usize) -> Result<String> {
        let source = image::open(&job.request.source_ref)
            .with_context(|| format!("failed opening {}", job.request.source_ref))?;
        let preview = source.thumbnail(PREVIEW_EDGE, PREVIEW_EDGE).to_rgba8();
        let tint = color_from_prompt(&job.request.prompt, idx as u64);
        let stem = format!("{session_id}-{idx:02}");
        match job.request.kind {
            GenerationKind::Images { .. } => {
                let frame = tinted(&preview, tint, 0.35);
                let (path, _) =
                    self.write_png("generations", &stem, &DynamicImage::ImageRgba8(frame))?;
                Ok(path.to_string_lossy().to_string())
            }
            GenerationKind::Video => {
                let dir = self.work_dir.join("generations");
                fs::create_dir_all(&dir)?;
                let path = dir.join(format!("{stem}.gif"));
                let file = fs::File::create(&path)
                    .with_context(|| format!("failed creating {}", path.display()))?;
                let mut encoder = GifEncoder::new(file);
                let frames = (0..VIDEO_FRAMES).map(|step| {
                    let strength = 0.15 + 0.5 * step as f32 / VIDEO_FRAMES as f32;
                    Frame::new(tinted(&preview, tint, strength))
                });
                encoder
                    .encode_frames(frames)
                    .context("failed encoding dryrun video")?;
                Ok(path.to_string_lossy().to_string())
            }
        }
    }
}

impl ImageBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn upload_and_prepare(&self, path: &Path) -> Result<UploadedImage> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let hash = sha256_hex(&bytes);
        let (width, height) = image::image_dimensions(path)
            .with_context(|| format!("{} is not a readable image", path.display()))?;
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "png".to_string());
        let dir = self.work_dir.join("uploads");
        fs::create_dir_all(&dir)?;
        let stored = dir.join(format!("{}.{ext}", &hash[..16]));
        fs::write(&stored, &bytes)
            .with_context(|| format!("failed writing {}", stored.display()))?;
        Ok(UploadedImage {
            image_ref: stored.to_string_lossy().to_string(),
            hash,
            dimensions: Dimensions::new(width, height),
        })
    }

    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput> {
        let source = image::open(&request.source_ref)
            .with_context(|| format!("failed opening {}", request.source_ref))?;
        let result = match request.kind {
            TransformKind::BackgroundRemoval => DynamicImage::ImageRgba8(remove_background(&source)),
            TransformKind::Upscale => {
                let (width, height) = (source.width() * 2, source.height() * 2);
                if width > MAX_UPSCALE_EDGE || height > MAX_UPSCALE_EDGE {
                    bail!("image is too large to upscale ({}x{})", source.width(), source.height());
                }
                source.resize_exact(width, height, FilterType::Lanczos3)
            }
            TransformKind::FaceDetail => source.unsharpen(1.2, 4),
            TransformKind::Crop => {
                let rect = request
                    .crop
                    .ok_or_else(|| anyhow!("crop request is missing its rectangle"))?;
                if rect.width == 0
                    || rect.height == 0
                    || rect.x + rect.width > source.width()
                    || rect.y + rect.height > source.height()
                {
                    bail!(
                        "crop {}x{}+{}+{} is outside the {}x{} image",
                        rect.width,
                        rect.height,
                        rect.x,
                        rect.y,
                        source.width(),
                        source.height()
                    );
                }
                source.crop_imm(rect.x, rect.y, rect.width, rect.height)
            }
            TransformKind::Rotate => source.rotate90(),
            TransformKind::Flip => source.fliph(),
        };
        let (path, hash) = self.write_png("versions", request.kind.slug(), &result)?;
        Ok(TransformOutput {
            result_ref: path.to_string_lossy().to_string(),
            result_hash: hash,
            dimensions: Some(Dimensions::new(result.width(), result.height())),
        })
    }
}

impl GenerationBackend for DryrunBackend {
    fn start_generation(&self, request: &GenerationRequest) -> Result<String> {
        if !Path::new(&request.source_ref).exists() {
            bail!("source image not found ({})", request.source_ref);
        }
        let session_id = format!("dryrun-{}", Uuid::new_v4().simple());
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow!("dryrun job table poisoned"))?;
        jobs.insert(
            session_id.clone(),
            DryrunJob {
                request: request.clone(),
                polls: 0,
                outputs: Vec::new(),
            },
        );
        Ok(session_id)
    }

    fn poll_generation_status(&self, session_id: &str) -> Result<PollResponse> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow!("dryrun job table poisoned"))?;
        let job = jobs
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown generation session '{session_id}'"))?;
        job.polls += 1;
        if job.request.prompt.to_ascii_lowercase().contains("fail") {
            jobs.remove(session_id);
            return Ok(PollResponse::failed("dryrun provider rejected the prompt"));
        }

        let total = job.request.kind.slot_count();
        let target = job.polls.min(total);
        while job.outputs.len() < target {
            let idx = job.outputs.len();
            let snapshot = job.clone();
            let url = self.render_slot(&snapshot, session_id, idx)?;
            job.outputs.push(url);
        }

        let slots = (0..total)
            .map(|idx| job.outputs.get(idx).map(SlotResult::success))
            .collect::<Vec<_>>();
        if job.outputs.len() == total {
            jobs.remove(session_id);
            Ok(PollResponse::completed(slots))
        } else {
            Ok(PollResponse::pending(slots))
        }
    }
}

/// History kept in a local `history.json`.
pub struct LocalHistoryBackend {
    store: Mutex<HistoryStore>,
}

impl LocalHistoryBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: Mutex::new(HistoryStore::new(path)),
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut HistoryStore) -> Result<T>) -> Result<T> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("history store lock poisoned"))?;
        f(&mut store)
    }
}

impl HistoryBackend for LocalHistoryBackend {
    fn load_history_record(&self, id: &str) -> Result<HistoryRecord> {
        self.with_store(|store| {
            store
                .get(id)?
                .ok_or_else(|| anyhow!("history record '{id}' not found"))
        })
    }

    fn save_history_record(&self, record: &HistoryRecord) -> Result<()> {
        self.with_store(|store| store.put(record))
    }

    fn list_history(&self, page: usize, per_page: usize) -> Result<HistoryPage> {
        self.with_store(|store| Ok(store.list(page, per_page)))
    }
}

/// Clears pixels close to the top-left corner colour.
fn remove_background(source: &DynamicImage) -> RgbaImage {
    let mut image = source.to_rgba8();
    let Some(key) = image.get_pixel_checked(0, 0).copied() else {
        return image;
    };
    for pixel in image.pixels_mut() {
        let distance = (0..3)
            .map(|channel| (i32::from(pixel[channel]) - i32::from(key[channel])).abs())
            .max()
            .unwrap_or(0);
        if distance <= KEY_COLOR_TOLERANCE {
            pixel[3] = 0;
        }
    }
    image
}

fn tinted(image: &RgbaImage, tint: (u8, u8, u8), strength: f32) -> RgbaImage {
    let mut out = image.clone();
    let tint = [tint.0, tint.1, tint.2];
    for pixel in out.pixels_mut() {
        let Rgba([r, g, b, a]) = *pixel;
        let mix = |value: u8, target: u8| {
            (f32::from(value) * (1.0 - strength) + f32::from(target) * strength).round() as u8
        };
        *pixel = Rgba([mix(r, tint[0]), mix(g, tint[1]), mix(b, tint[2]), a]);
    }
    out
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use couture_contracts::sessions::RemoteStatus;
    use couture_contracts::versions::PixelRect;
    use image::{Rgb, RgbImage};

    use super::*;

    /// White canvas with a dark 4x4 square in the middle.
    fn sample_image(dir: &Path) -> Result<PathBuf> {
        let mut image = RgbImage::from_pixel(12, 8, Rgb([255, 255, 255]));
        for x in 4..8 {
            for y in 2..6 {
                image.put_pixel(x, y, Rgb([20, 30, 40]));
            }
        }
        let path = dir.join("garment.png");
        image.save(&path)?;
        Ok(path)
    }

    fn uploaded(backend: &DryrunBackend, dir: &Path) -> Result<UploadedImage> {
        backend.upload_and_prepare(&sample_image(dir)?)
    }

    #[test]
    fn upload_hashes_and_measures() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        assert_eq!(upload.dimensions, Dimensions::new(12, 8));
        assert_eq!(upload.hash.len(), 64);
        assert!(Path::new(&upload.image_ref).exists());
        Ok(())
    }

    #[test]
    fn transforms_change_geometry_as_expected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        let request = |kind| TransformRequest::new(kind, &upload.image_ref, &upload.hash);

        let rotated = backend.transform(&request(TransformKind::Rotate))?;
        assert_eq!(rotated.dimensions, Some(Dimensions::new(8, 12)));

        let upscaled = backend.transform(&request(TransformKind::Upscale))?;
        assert_eq!(upscaled.dimensions, Some(Dimensions::new(24, 16)));

        let cropped = backend.transform(&request(TransformKind::Crop).with_crop(PixelRect {
            x: 4,
            y: 2,
            width: 4,
            height: 4,
        }))?;
        assert_eq!(cropped.dimensions, Some(Dimensions::new(4, 4)));
        assert_ne!(cropped.result_hash, upload.hash);
        Ok(())
    }

    #[test]
    fn background_removal_clears_corner_colour() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        let output = backend.transform(&TransformRequest::new(
            TransformKind::BackgroundRemoval,
            &upload.image_ref,
            &upload.hash,
        ))?;
        let image = image::open(&output.result_ref)?.to_rgba8();
        assert_eq!(image.get_pixel(0, 0)[3], 0);
        assert_eq!(image.get_pixel(5, 3)[3], 255);
        Ok(())
    }

    #[test]
    fn crop_outside_image_fails() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        let request = TransformRequest::new(TransformKind::Crop, &upload.image_ref, &upload.hash)
            .with_crop(PixelRect {
                x: 10,
                y: 0,
                width: 5,
                height: 5,
            });
        assert!(backend.transform(&request).is_err());
        let missing = TransformRequest::new(TransformKind::Crop, &upload.image_ref, &upload.hash);
        assert!(backend.transform(&missing).is_err());
        Ok(())
    }

    #[test]
    fn generation_reveals_one_slot_per_poll() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        let session_id = backend.start_generation(&GenerationRequest {
            source_ref: upload.image_ref.clone(),
            source_hash: upload.hash.clone(),
            prompt: "red trench coat".to_string(),
            kind: GenerationKind::images(2),
        })?;

        let first = backend.poll_generation_status(&session_id)?;
        assert_eq!(first.overall_status, RemoteStatus::Pending);
        assert!(first.slots[0].is_some());
        assert!(first.slots[1].is_none());

        let second = backend.poll_generation_status(&session_id)?;
        assert_eq!(second.overall_status, RemoteStatus::Completed);
        assert_eq!(second.slots[0], first.slots[0]);
        assert!(second.slots[1].is_some());
        assert!(backend.poll_generation_status(&session_id).is_err());
        Ok(())
    }

    #[test]
    fn generation_with_fail_prompt_reports_failure() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        let session_id = backend.start_generation(&GenerationRequest {
            source_ref: upload.image_ref,
            source_hash: upload.hash,
            prompt: "please FAIL".to_string(),
            kind: GenerationKind::Video,
        })?;
        let response = backend.poll_generation_status(&session_id)?;
        assert_eq!(response.overall_status, RemoteStatus::Failed);
        assert!(backend.poll_generation_status(&session_id).is_err());
        assert!(backend.poll_generation_status("nope").is_err());
        Ok(())
    }

    #[test]
    fn video_generation_writes_animation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let backend = DryrunBackend::new(temp.path().join("work"))?;
        let upload = uploaded(&backend, temp.path())?;
        let session_id = backend.start_generation(&GenerationRequest {
            source_ref: upload.image_ref,
            source_hash: upload.hash,
            prompt: "runway walk".to_string(),
            kind: GenerationKind::Video,
        })?;
        let response = backend.poll_generation_status(&session_id)?;
        assert_eq!(response.overall_status, RemoteStatus::Completed);
        let url = response.slots[0]
            .as_ref()
            .and_then(|slot| slot.url.clone())
            .unwrap_or_default();
        assert!(url.ends_with(".gif"));
        assert!(Path::new(&url).exists());
        Ok(())
    }
}
