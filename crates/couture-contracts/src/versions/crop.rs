use serde::{Deserialize, Serialize};

use crate::error::{StudioError, StudioResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Absolute crop rectangle in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Crop selection stored as fractions of the natural image size.
///
/// Keeping one coordinate system means a selection never has to be
/// rescaled between the rendered preview and the source pixels; on-screen
/// rectangles are converted in once via [`CropSelection::from_display_pixels`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropSelection {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropSelection {
    /// Builds a selection, clamping every edge into the unit square.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        let x = unit(x);
        let y = unit(y);
        Self {
            x,
            y,
            width: unit(width).min(1.0 - x),
            height: unit(height).min(1.0 - y),
        }
    }

    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    pub fn from_percent(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x / 100.0, y / 100.0, width / 100.0, height / 100.0)
    }

    /// Converts a rectangle drawn over the rendered preview.
    pub fn from_display_pixels(
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        displayed: Dimensions,
    ) -> StudioResult<Self> {
        if displayed.is_empty() {
            return Err(StudioError::validation(
                "Preview has no size yet; cannot place a crop.",
            ));
        }
        let dw = f64::from(displayed.width);
        let dh = f64::from(displayed.height);
        Ok(Self::new(x / dw, y / dh, width / dw, height / dh))
    }

    pub fn is_empty(&self) -> bool {
        self.width <= f64::EPSILON || self.height <= f64::EPSILON
    }

    /// Maps the selection onto the natural pixel grid of the image.
    pub fn to_pixels(&self, natural: Dimensions) -> StudioResult<PixelRect> {
        if self.is_empty() {
            return Err(StudioError::validation("Crop area is empty."));
        }
        if natural.is_empty() {
            return Err(StudioError::validation(
                "Image dimensions are unknown; cannot crop.",
            ));
        }
        let nw = f64::from(natural.width);
        let nh = f64::from(natural.height);
        let x = ((self.x * nw).round() as u32).min(natural.width - 1);
        let y = ((self.y * nh).round() as u32).min(natural.height - 1);
        let width = ((self.width * nw).round() as u32)
            .max(1)
            .min(natural.width - x);
        let height = ((self.height * nh).round() as u32)
            .max(1)
            .min(natural.height - y);
        Ok(PixelRect {
            x,
            y,
            width,
            height,
        })
    }

    /// Shrinks the selection around its centre until it matches `ratio`
    /// in natural pixel space.
    pub fn constrain(&self, ratio: AspectRatio, natural: Dimensions) -> Self {
        let Some(target) = ratio.value() else {
            return *self;
        };
        if natural.is_empty() || self.is_empty() {
            return *self;
        }
        let nw = f64::from(natural.width);
        let nh = f64::from(natural.height);
        let mut w_px = self.width * nw;
        let mut h_px = self.height * nh;
        if w_px / h_px > target {
            w_px = h_px * target;
        } else {
            h_px = w_px / target;
        }
        let cx = self.x + self.width / 2.0;
        let cy = self.y + self.height / 2.0;
        let width = w_px / nw;
        let height = h_px / nh;
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    Free,
    Square,
    Portrait4x5,
    Portrait3x4,
    Story9x16,
    Landscape16x9,
}

impl AspectRatio {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" | "none" => Some(Self::Free),
            "1:1" | "square" => Some(Self::Square),
            "4:5" => Some(Self::Portrait4x5),
            "3:4" => Some(Self::Portrait3x4),
            "9:16" | "story" => Some(Self::Story9x16),
            "16:9" | "wide" => Some(Self::Landscape16x9),
            _ => None,
        }
    }

    /// Width over height, `None` for a free selection.
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Free => None,
            Self::Square => Some(1.0),
            Self::Portrait4x5 => Some(4.0 / 5.0),
            Self::Portrait3x4 => Some(3.0 / 4.0),
            Self::Story9x16 => Some(9.0 / 16.0),
            Self::Landscape16x9 => Some(16.0 / 9.0),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Square => "1:1",
            Self::Portrait4x5 => "4:5",
            Self::Portrait3x4 => "3:4",
            Self::Story9x16 => "9:16",
            Self::Landscape16x9 => "16:9",
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
