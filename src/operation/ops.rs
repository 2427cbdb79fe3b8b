//! Individual image operations.
//!
//! Every operation knows two things about itself: whether it changes the
//! output bytes at all (`has_effect`), and how to render itself into the
//! canonical key (`Display`).

use std::fmt;
use std::str::FromStr;

use crate::codec::OutputFormat;
use crate::error::ImageError;

use super::types::{format_number, Dimension, Rectangle};

// =============================================================================
// Crop
// =============================================================================

/// Region of the (virtual) full image to extract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Crop {
    /// The whole image.
    Full,
    /// The largest centered square.
    Square,
    /// Absolute pixel rectangle.
    Pixels(Rectangle),
    /// Percentages (0-100) of the full width and height.
    Percent {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
}

impl Crop {
    pub fn has_effect(&self) -> bool {
        match self {
            Crop::Full => false,
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => !(*x == 0.0 && *y == 0.0 && *width >= 100.0 && *height >= 100.0),
            _ => true,
        }
    }

    /// Resolve to a pixel rectangle within `full`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` when the region lies entirely outside the
    /// image or has zero area.
    pub fn rectangle(&self, full: Dimension) -> Result<Rectangle, ImageError> {
        let rect = match *self {
            Crop::Full => Rectangle::full(full),
            Crop::Square => {
                let side = full.width.min(full.height);
                Rectangle::new(
                    (full.width - side) / 2,
                    (full.height - side) / 2,
                    side,
                    side,
                )
            }
            Crop::Pixels(rect) => rect,
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => {
                let fw = full.width as f64;
                let fh = full.height as f64;
                Rectangle::new(
                    (fw * x / 100.0).round() as u32,
                    (fh * y / 100.0).round() as u32,
                    (fw * width / 100.0).round() as u32,
                    (fh * height / 100.0).round() as u32,
                )
            }
        };
        rect.clipped_to(full).ok_or_else(|| {
            ImageError::invalid(format!("Region {} is outside the image ({})", rect, full))
        })
    }
}

impl fmt::Display for Crop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crop::Full => write!(f, "crop:full"),
            Crop::Square => write!(f, "crop:square"),
            Crop::Pixels(rect) => write!(f, "crop:{}", rect),
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => write!(
                f,
                "crop:pct:{},{},{},{}",
                format_number(*x),
                format_number(*y),
                format_number(*width),
                format_number(*height)
            ),
        }
    }
}

// =============================================================================
// Redact
// =============================================================================

/// Regions blanked out of the image, in full-image (upright) coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redact {
    regions: Vec<Rectangle>,
}

impl Redact {
    pub fn new(mut regions: Vec<Rectangle>) -> Self {
        regions.retain(|r| r.width > 0 && r.height > 0);
        regions.sort();
        regions.dedup();
        Self { regions }
    }

    pub fn regions(&self) -> &[Rectangle] {
        &self.regions
    }

    pub fn has_effect(&self) -> bool {
        !self.regions.is_empty()
    }
}

impl fmt::Display for Redact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regions: Vec<String> = self.regions.iter().map(|r| r.to_string()).collect();
        write!(f, "redact:{}", regions.join(";"))
    }
}

// =============================================================================
// Scale
// =============================================================================

/// How the cropped region is resized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleMode {
    /// Largest size permitted; identity here.
    Max,
    /// Scale to this width, preserving aspect ratio.
    Width(u32),
    /// Scale to this height, preserving aspect ratio.
    Height(u32),
    /// Scale by a percentage.
    Percent(f64),
    /// Best fit inside the box, preserving aspect ratio.
    Fit(u32, u32),
    /// Exactly this size, distorting if needed.
    Exact(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub mode: ScaleMode,
    /// Whether the result may exceed the size of the cropped region.
    pub upscale: bool,
}

impl Scale {
    pub fn new(mode: ScaleMode, upscale: bool) -> Self {
        Self { mode, upscale }
    }

    pub fn has_effect(&self) -> bool {
        match self.mode {
            ScaleMode::Max => false,
            ScaleMode::Percent(p) => p != 100.0,
            _ => true,
        }
    }

    /// Size of `input` after scaling.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the result would be empty, or larger
    /// than `input` without `upscale`.
    pub fn target_size(&self, input: Dimension) -> Result<Dimension, ImageError> {
        let (w, h) = (input.width as f64, input.height as f64);
        let target = match self.mode {
            ScaleMode::Max => input,
            ScaleMode::Width(tw) => {
                Dimension::new(tw, (h * tw as f64 / w).round().max(1.0) as u32)
            }
            ScaleMode::Height(th) => {
                Dimension::new((w * th as f64 / h).round().max(1.0) as u32, th)
            }
            ScaleMode::Percent(p) => Dimension::new(
                (w * p / 100.0).round().max(1.0) as u32,
                (h * p / 100.0).round().max(1.0) as u32,
            ),
            ScaleMode::Fit(bw, bh) => {
                let mut factor = (bw as f64 / w).min(bh as f64 / h);
                if !self.upscale {
                    factor = factor.min(1.0);
                }
                Dimension::new(
                    (w * factor).round().max(1.0) as u32,
                    (h * factor).round().max(1.0) as u32,
                )
            }
            ScaleMode::Exact(tw, th) => Dimension::new(tw, th),
        };

        if target.is_empty() {
            return Err(ImageError::invalid("Requested size is empty"));
        }
        if !self.upscale && (target.width > input.width || target.height > input.height) {
            return Err(ImageError::invalid(format!(
                "Requested size {} exceeds region size {} (use ^ to upscale)",
                target, input
            )));
        }
        Ok(target)
    }

    /// The same scale expressed in a coordinate space rotated by 90°.
    pub fn transposed(&self) -> Scale {
        let mode = match self.mode {
            ScaleMode::Width(w) => ScaleMode::Height(w),
            ScaleMode::Height(h) => ScaleMode::Width(h),
            ScaleMode::Fit(w, h) => ScaleMode::Fit(h, w),
            ScaleMode::Exact(w, h) => ScaleMode::Exact(h, w),
            other => other,
        };
        Scale::new(mode, self.upscale)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let up = if self.upscale { "^" } else { "" };
        match self.mode {
            ScaleMode::Max => write!(f, "scale:{}max", up),
            ScaleMode::Width(w) => write!(f, "scale:{}{},", up, w),
            ScaleMode::Height(h) => write!(f, "scale:{},{}", up, h),
            ScaleMode::Percent(p) => write!(f, "scale:{}pct:{}", up, format_number(p)),
            ScaleMode::Fit(w, h) => write!(f, "scale:{}!{},{}", up, w, h),
            ScaleMode::Exact(w, h) => write!(f, "scale:{}{},{}", up, w, h),
        }
    }
}

// =============================================================================
// Rotate
// =============================================================================

/// Clockwise rotation in multiples of 90°, optionally preceded by a
/// horizontal mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rotate {
    degrees: u16,
    mirror: bool,
}

impl Rotate {
    /// # Errors
    ///
    /// Returns `InvalidRequest` for angles that are not multiples of 90°.
    pub fn new(degrees: f64, mirror: bool) -> Result<Self, ImageError> {
        if !degrees.is_finite() || degrees < 0.0 || degrees > 360.0 {
            return Err(ImageError::invalid(format!(
                "Rotation {} is out of range",
                degrees
            )));
        }
        if degrees % 90.0 != 0.0 {
            return Err(ImageError::invalid(format!(
                "Rotation {} is not a multiple of 90",
                degrees
            )));
        }
        Ok(Self {
            degrees: (degrees as u16) % 360,
            mirror,
        })
    }

    pub(crate) fn from_parts(degrees: u16, mirror: bool) -> Self {
        Self {
            degrees: degrees % 360,
            mirror,
        }
    }

    pub fn degrees(&self) -> u16 {
        self.degrees
    }

    pub fn mirror(&self) -> bool {
        self.mirror
    }

    pub fn has_effect(&self) -> bool {
        self.degrees != 0 || self.mirror
    }

    pub fn resulting_size(&self, input: Dimension) -> Dimension {
        if self.degrees % 180 == 90 {
            input.swapped()
        } else {
            input
        }
    }
}

impl fmt::Display for Rotate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mirror = if self.mirror { "!" } else { "" };
        write!(f, "rotate:{}{}", mirror, self.degrees)
    }
}

// =============================================================================
// Color Transform
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorTransform {
    Gray,
    Bitonal,
}

impl fmt::Display for ColorTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorTransform::Gray => write!(f, "color:gray"),
            ColorTransform::Bitonal => write!(f, "color:bitonal"),
        }
    }
}

// =============================================================================
// Overlay
// =============================================================================

/// Anchor of an overlay image on the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    LeftCenter,
    Center,
    RightCenter,
    BottomLeft,
    BottomCenter,
    BottomRight,
    /// Tile the overlay across the whole output.
    Repeat,
}

impl Position {
    pub fn as_str(&self) -> &'static str {
        match self {
            Position::TopLeft => "top-left",
            Position::TopCenter => "top-center",
            Position::TopRight => "top-right",
            Position::LeftCenter => "left-center",
            Position::Center => "center",
            Position::RightCenter => "right-center",
            Position::BottomLeft => "bottom-left",
            Position::BottomCenter => "bottom-center",
            Position::BottomRight => "bottom-right",
            Position::Repeat => "repeat",
        }
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '_'], "-");
        let position = match normalized.as_str() {
            "top-left" => Position::TopLeft,
            "top-center" | "top" => Position::TopCenter,
            "top-right" => Position::TopRight,
            "left-center" | "left" => Position::LeftCenter,
            "center" => Position::Center,
            "right-center" | "right" => Position::RightCenter,
            "bottom-left" => Position::BottomLeft,
            "bottom-center" | "bottom" => Position::BottomCenter,
            "bottom-right" => Position::BottomRight,
            "repeat" => Position::Repeat,
            _ => return Err(format!("unknown overlay position: {}", s)),
        };
        Ok(position)
    }
}

/// An image composited onto the output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Overlay {
    /// Filesystem path of the overlay image.
    pub image: String,
    pub position: Position,
    /// Distance in pixels from the anchored edges.
    pub inset: u32,
}

impl fmt::Display for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "overlay:{}:{}:{}",
            self.image,
            self.position.as_str(),
            self.inset
        )
    }
}

// =============================================================================
// Encode
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Encode {
    pub format: OutputFormat,
    /// JPEG quality (1-100); ignored by lossless formats.
    pub quality: u8,
}

impl Encode {
    pub fn new(format: OutputFormat, quality: u8) -> Self {
        Self {
            format,
            quality: quality.clamp(1, 100),
        }
    }
}

impl fmt::Display for Encode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Quality only reaches the key for formats that use it.
        match self.format {
            OutputFormat::Jpg => write!(f, "encode:{}:q{}", self.format, self.quality),
            _ => write!(f, "encode:{}", self.format),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Any single step of an operation list.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Crop(Crop),
    Redact(Redact),
    Scale(Scale),
    Rotate(Rotate),
    ColorTransform(ColorTransform),
    Overlay(Overlay),
    Encode(Encode),
}

impl Operation {
    /// Position in the canonical application order.
    pub fn rank(&self) -> u8 {
        match self {
            Operation::Crop(_) => 0,
            Operation::Redact(_) => 1,
            Operation::Scale(_) => 2,
            Operation::Rotate(_) => 3,
            Operation::ColorTransform(_) => 4,
            Operation::Overlay(_) => 5,
            Operation::Encode(_) => 6,
        }
    }

    pub fn has_effect(&self) -> bool {
        match self {
            Operation::Crop(op) => op.has_effect(),
            Operation::Redact(op) => op.has_effect(),
            Operation::Scale(op) => op.has_effect(),
            Operation::Rotate(op) => op.has_effect(),
            Operation::ColorTransform(_) => true,
            Operation::Overlay(_) => true,
            Operation::Encode(_) => true,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Crop(op) => op.fmt(f),
            Operation::Redact(op) => op.fmt(f),
            Operation::Scale(op) => op.fmt(f),
            Operation::Rotate(op) => op.fmt(f),
            Operation::ColorTransform(op) => op.fmt(f),
            Operation::Overlay(op) => op.fmt(f),
            Operation::Encode(op) => op.fmt(f),
        }
    }
}

macro_rules! impl_from_op {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Operation {
                fn from(op: $ty) -> Self {
                    Operation::$ty(op)
                }
            }
        )*
    };
}

impl_from_op!(Crop, Redact, Scale, Rotate, ColorTransform, Overlay, Encode);
