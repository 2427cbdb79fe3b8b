//! Geometry and identity value types shared by the operation list, the
//! info cache and the codecs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ImageError;

// =============================================================================
// Identifier
// =============================================================================

/// Opaque name of a source image.
///
/// Interpretation is up to the source resolver (a relative path for the
/// filesystem resolver, an object key for S3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Dimension / Rectangle
// =============================================================================

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// The same dimensions with width and height exchanged.
    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle covering the whole of `size`.
    pub const fn full(size: Dimension) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }

    /// Clip this rectangle to `bounds`. Returns `None` when nothing remains.
    pub fn clipped_to(&self, bounds: Dimension) -> Option<Rectangle> {
        if self.x >= bounds.width || self.y >= bounds.height {
            return None;
        }
        let width = self.width.min(bounds.width - self.x);
        let height = self.height.min(bounds.height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Rectangle::new(self.x, self.y, width, height))
    }

    /// Intersect with `other`, expressed relative to `other`'s origin.
    pub fn relative_to(&self, other: &Rectangle) -> Option<Rectangle> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rectangle::new(x0 - other.x, y0 - other.y, x1 - x0, y1 - y0))
    }

    /// Multiply every coordinate by `factor`, rounding outward so that a
    /// scaled region never loses edge pixels.
    pub fn scaled(&self, factor: f64) -> Rectangle {
        let x = (self.x as f64 * factor).floor();
        let y = (self.y as f64 * factor).floor();
        let right = ((self.x + self.width) as f64 * factor).ceil();
        let bottom = ((self.y + self.height) as f64 * factor).ceil();
        Rectangle::new(
            x as u32,
            y as u32,
            ((right - x) as u32).max(1),
            ((bottom - y) as u32).max(1),
        )
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

// =============================================================================
// Orientation
// =============================================================================

/// Orientation embedded in a source image (EXIF/TIFF orientation tag).
///
/// Only the rotational orientations are honored; mirrored tag values are
/// treated as upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// Map an EXIF orientation tag value.
    pub fn from_exif(value: u16) -> Self {
        match value {
            6 => Orientation::Rotate90,
            3 => Orientation::Rotate180,
            8 => Orientation::Rotate270,
            _ => Orientation::Rotate0,
        }
    }

    /// Clockwise rotation that turns the stored pixels upright.
    pub const fn degrees(&self) -> u16 {
        match self {
            Orientation::Rotate0 => 0,
            Orientation::Rotate90 => 90,
            Orientation::Rotate180 => 180,
            Orientation::Rotate270 => 270,
        }
    }

    /// Size of the upright image given the stored size.
    pub fn oriented_size(&self, raw: Dimension) -> Dimension {
        match self {
            Orientation::Rotate90 | Orientation::Rotate270 => raw.swapped(),
            _ => raw,
        }
    }

    /// Map a rectangle in upright coordinates back into the stored pixel
    /// space of a container whose stored size is `raw`.
    pub fn rect_to_raw(&self, rect: Rectangle, raw: Dimension) -> Rectangle {
        let Rectangle {
            x,
            y,
            width,
            height,
        } = rect;
        match self {
            Orientation::Rotate0 => rect,
            Orientation::Rotate90 => Rectangle::new(
                y,
                raw.height.saturating_sub(x + width),
                height,
                width,
            ),
            Orientation::Rotate180 => Rectangle::new(
                raw.width.saturating_sub(x + width),
                raw.height.saturating_sub(y + height),
                width,
                height,
            ),
            Orientation::Rotate270 => Rectangle::new(
                raw.width.saturating_sub(y + height),
                x,
                height,
                width,
            ),
        }
    }
}

// =============================================================================
// Scale Constraint
// =============================================================================

/// A rational "virtual" sub-resolution view of the source.
///
/// A constraint of 1:2 makes the server behave as though the source were
/// half its real size. Stored in lowest terms so that 2:4 and 1:2 produce
/// the same cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleConstraint {
    numerator: u32,
    denominator: u32,
}

impl ScaleConstraint {
    pub const IDENTITY: ScaleConstraint = ScaleConstraint {
        numerator: 1,
        denominator: 1,
    };

    pub fn new(numerator: u32, denominator: u32) -> Result<Self, ImageError> {
        if numerator == 0 || denominator == 0 {
            return Err(ImageError::invalid(
                "Scale constraint terms must be positive",
            ));
        }
        if numerator > denominator {
            return Err(ImageError::invalid(
                "Scale constraint numerator must not exceed denominator",
            ));
        }
        let divisor = gcd(numerator, denominator);
        Ok(Self {
            numerator: numerator / divisor,
            denominator: denominator / divisor,
        })
    }

    pub fn numerator(&self) -> u32 {
        self.numerator
    }

    pub fn denominator(&self) -> u32 {
        self.denominator
    }

    pub fn has_effect(&self) -> bool {
        self.numerator != self.denominator
    }

    pub fn rational(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Size of the virtual image exposed under this constraint.
    pub fn constrained_size(&self, full: Dimension) -> Dimension {
        let scale = |v: u32| -> u32 {
            ((v as u64 * self.numerator as u64) / self.denominator as u64).max(1) as u32
        };
        Dimension::new(scale(full.width), scale(full.height))
    }
}

impl Default for ScaleConstraint {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Display for ScaleConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.numerator, self.denominator)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Format a float without a trailing `.0` and with at most six decimals.
pub(crate) fn format_number(value: f64) -> String {
    let rounded = (value * 1_000_000.0).round() / 1_000_000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        let text = format!("{:.6}", rounded);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
