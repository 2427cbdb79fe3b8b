//! The immutable operation list and its canonical key.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::codec::OutputFormat;
use crate::error::ImageError;

use super::ops::{ColorTransform, Crop, Encode, Operation, Overlay, Redact, Rotate, Scale};
use super::types::{Dimension, Identifier, Orientation, Rectangle, ScaleConstraint};

// =============================================================================
// Builder
// =============================================================================

/// Accumulates operations for an [`OperationList`].
///
/// The list produced by [`build`](Self::build) has no mutators; deriving a
/// different list means starting a new builder (see
/// [`OperationList::to_builder`]).
#[derive(Debug, Clone)]
pub struct OperationListBuilder {
    identifier: Identifier,
    scale_constraint: ScaleConstraint,
    operations: Vec<Operation>,
}

impl OperationListBuilder {
    pub fn new(identifier: impl Into<Identifier>) -> Self {
        Self {
            identifier: identifier.into(),
            scale_constraint: ScaleConstraint::IDENTITY,
            operations: Vec::new(),
        }
    }

    /// Append an operation. Insertion order only matters between operations
    /// of the same kind.
    pub fn add(mut self, operation: impl Into<Operation>) -> Self {
        self.operations.push(operation.into());
        self
    }

    /// Append an operation if present.
    pub fn add_opt(self, operation: Option<impl Into<Operation>>) -> Self {
        match operation {
            Some(op) => self.add(op),
            None => self,
        }
    }

    pub fn scale_constraint(mut self, constraint: ScaleConstraint) -> Self {
        self.scale_constraint = constraint;
        self
    }

    /// Freeze into an immutable list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if no `Encode` operation was added, or more
    /// than one was.
    pub fn build(mut self) -> Result<OperationList, ImageError> {
        let encodes = self
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Encode(_)))
            .count();
        if encodes != 1 {
            return Err(ImageError::invalid(
                "An operation list needs exactly one output format",
            ));
        }

        // Stable: same-kind operations keep their relative order.
        self.operations.sort_by_key(Operation::rank);

        let canonical = canonical_string(&self.identifier, self.scale_constraint, &self.operations);
        let key = hex::encode(Sha256::digest(canonical.as_bytes()));

        Ok(OperationList {
            identifier: self.identifier,
            scale_constraint: self.scale_constraint,
            operations: self.operations,
            canonical,
            key,
        })
    }
}

fn canonical_string(
    identifier: &Identifier,
    constraint: ScaleConstraint,
    operations: &[Operation],
) -> String {
    // Escaped so an identifier containing `/` cannot imitate operations.
    let mut parts = vec![urlencoding::encode(identifier.as_str()).into_owned()];
    if constraint.has_effect() {
        parts.push(format!("sc:{}", constraint));
    }
    parts.extend(
        operations
            .iter()
            .filter(|op| op.has_effect())
            .map(|op| op.to_string()),
    );
    parts.join("/")
}

// =============================================================================
// OperationList
// =============================================================================

/// A frozen, canonically ordered list of operations against one source.
///
/// Two lists that differ only in insertion order or in operations without
/// visible effect have equal [`canonical`](Self::canonical) strings and
/// equal [`key`](Self::key)s.
#[derive(Debug, Clone)]
pub struct OperationList {
    identifier: Identifier,
    scale_constraint: ScaleConstraint,
    operations: Vec<Operation>,
    canonical: String,
    key: String,
}

impl PartialEq for OperationList {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for OperationList {}

impl OperationList {
    pub fn builder(identifier: impl Into<Identifier>) -> OperationListBuilder {
        OperationListBuilder::new(identifier)
    }

    /// Start a new builder pre-populated with this list's contents.
    pub fn to_builder(&self) -> OperationListBuilder {
        OperationListBuilder {
            identifier: self.identifier.clone(),
            scale_constraint: self.scale_constraint,
            operations: self.operations.clone(),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn scale_constraint(&self) -> ScaleConstraint {
        self.scale_constraint
    }

    /// All operations, in canonical order, including no-ops.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Deterministic textual form of every effective operation.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// SHA-256 of the canonical string, hex encoded.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn encode(&self) -> Encode {
        self.operations
            .iter()
            .find_map(|op| match op {
                Operation::Encode(e) => Some(*e),
                _ => None,
            })
            .unwrap_or(Encode::new(OutputFormat::Jpg, 80))
    }

    pub fn output_format(&self) -> OutputFormat {
        self.encode().format
    }

    fn crops(&self) -> impl Iterator<Item = &Crop> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Crop(c) => Some(c),
            _ => None,
        })
    }

    fn scales(&self) -> impl Iterator<Item = &Scale> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Scale(s) => Some(s),
            _ => None,
        })
    }

    fn rotation(&self) -> Rotate {
        // Successive rotations compose; mirrors toggle.
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Rotate(r) => Some(*r),
                _ => None,
            })
            .fold(Rotate::from_parts(0, false), |acc, r| {
                let degrees = if r.mirror() {
                    (360 - acc.degrees()) % 360 + r.degrees()
                } else {
                    acc.degrees() + r.degrees()
                };
                Rotate::from_parts(degrees, acc.mirror() ^ r.mirror())
            })
    }

    pub fn redactions(&self) -> Vec<Rectangle> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::Redact(r) => Some(r.regions().iter().copied()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn color_transform(&self) -> Option<ColorTransform> {
        self.operations.iter().rev().find_map(|op| match op {
            Operation::ColorTransform(c) => Some(*c),
            _ => None,
        })
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.operations.iter().rev().find_map(|op| match op {
            Operation::Overlay(o) => Some(o),
            _ => None,
        })
    }

    /// Whether any operation would alter pixels of the source.
    pub fn has_pixel_effect(&self) -> bool {
        self.scale_constraint.has_effect()
            || self
                .operations
                .iter()
                .any(|op| !matches!(op, Operation::Encode(_)) && op.has_effect())
    }

    /// Output dimensions for an upright source of size `full_size`.
    ///
    /// Folds the scale constraint, every crop, every scale and the rotation
    /// in canonical order.
    pub fn resulting_size(&self, full_size: Dimension) -> Result<Dimension, ImageError> {
        let (_, scaled) = self.crop_and_scale(full_size)?;
        Ok(self.rotation().resulting_size(scaled))
    }

    /// Region (in the upright, unconstrained full image) and scaled size.
    fn crop_and_scale(&self, full_size: Dimension) -> Result<(Rectangle, Dimension), ImageError> {
        let virtual_size = self.scale_constraint.constrained_size(full_size);
        let mut region = Rectangle::full(virtual_size);
        for crop in self.crops() {
            let inner = crop.rectangle(region.size())?;
            region = Rectangle::new(
                region.x + inner.x,
                region.y + inner.y,
                inner.width,
                inner.height,
            );
        }

        let mut size = region.size();
        for scale in self.scales() {
            size = scale.target_size(size)?;
        }

        let full_region = if self.scale_constraint.has_effect() {
            region
                .scaled(1.0 / self.scale_constraint.rational())
                .clipped_to(full_size)
                .unwrap_or(Rectangle::full(full_size))
        } else {
            region
        };
        Ok((full_region, size))
    }

    /// Translate this list into concrete processing instructions for a
    /// source stored at `raw_size` pixels with embedded `orientation`.
    ///
    /// Orientation is folded in here: the region is mapped back into stored
    /// pixel coordinates and the compensating rotation is merged with the
    /// requested one, so decoders never need to rotate.
    pub fn apply_orientation(
        &self,
        raw_size: Dimension,
        orientation: Orientation,
    ) -> Result<ProcessingPlan, ImageError> {
        let oriented_size = orientation.oriented_size(raw_size);
        let (oriented_region, scaled) = self.crop_and_scale(oriented_size)?;
        let rotate = self.rotation();
        let output_size = rotate.resulting_size(scaled);

        let region = orientation.rect_to_raw(oriented_region, raw_size);
        let raw_target = orientation.oriented_size(scaled);
        let raw_degrees = if rotate.mirror() {
            (rotate.degrees() + 360 - orientation.degrees()) % 360
        } else {
            (rotate.degrees() + orientation.degrees()) % 360
        };

        let redactions = self
            .redactions()
            .iter()
            .filter_map(|r| r.relative_to(&oriented_region))
            .collect();

        Ok(ProcessingPlan {
            orientation,
            raw_size,
            region,
            oriented_region,
            redactions,
            raw_target,
            oriented_target: scaled,
            raw_rotation: Rotate::from_parts(raw_degrees, rotate.mirror()),
            rotation: rotate,
            color: self.color_transform(),
            overlay: self.overlay().cloned(),
            encode: self.encode(),
            output_size,
        })
    }
}

impl fmt::Display for OperationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

// =============================================================================
// ProcessingPlan
// =============================================================================

/// Concrete pixel instructions derived from an [`OperationList`] and the
/// structure of one source.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingPlan {
    pub orientation: Orientation,
    /// Stored (pre-orientation) full size.
    pub raw_size: Dimension,
    /// Region to read, in stored full-resolution coordinates.
    pub region: Rectangle,
    /// The same region in upright coordinates.
    pub oriented_region: Rectangle,
    /// Redactions relative to `oriented_region`.
    pub redactions: Vec<Rectangle>,
    /// Size after scaling when working in stored orientation.
    pub raw_target: Dimension,
    /// Size after scaling when working upright.
    pub oriented_target: Dimension,
    /// Rotation to apply to a raster still in stored orientation.
    pub raw_rotation: Rotate,
    /// Rotation to apply to an upright raster.
    pub rotation: Rotate,
    pub color: Option<ColorTransform>,
    pub overlay: Option<Overlay>,
    pub encode: Encode,
    pub output_size: Dimension,
}

impl ProcessingPlan {
    /// Ratio of scaled to full-resolution width.
    pub fn scale_factor(&self) -> f64 {
        self.oriented_target.width as f64 / self.oriented_region.width.max(1) as f64
    }

    /// Largest of the horizontal and vertical scale ratios.
    pub fn max_axis_scale(&self) -> f64 {
        let vertical =
            self.oriented_target.height as f64 / self.oriented_region.height.max(1) as f64;
        self.scale_factor().max(vertical)
    }

    /// Power-of-two halvings a decoder may apply without losing needed
    /// detail, capped by the number of resolutions it has.
    pub fn reduction_factor(&self, num_resolutions: u32) -> u8 {
        let max = num_resolutions.saturating_sub(1).min(u8::MAX as u32) as u8;
        let mut factor = 0u8;
        let mut scale = self.scale_factor();
        while factor < max && scale <= 0.5 {
            scale *= 2.0;
            factor += 1;
        }
        factor
    }
}
