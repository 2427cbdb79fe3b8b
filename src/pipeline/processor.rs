//! Pixel processing between decode and encode.
//!
//! Runs on a blocking thread. The decoder's hints decide which coordinate
//! space the raster is in and which transforms still have to be done here:
//!
//! ```text
//! decoded ─► crop (IgnoredRegion) ─► redact ─► resize ─► mirror/rotate ─► color ─► overlay
//! ```

use image::imageops::{self, FilterType};
use image::{DynamicImage, Luma, Rgba, RgbaImage};

use crate::codec::{DecodeHint, DecodedImage};
use crate::error::{CodecError, ImageError};
use crate::operation::{
    ColorTransform, Dimension, Orientation, Overlay, Position, ProcessingPlan, Rectangle, Rotate,
};

/// Threshold separating black from white in bitonal output.
const BITONAL_THRESHOLD: u8 = 128;

/// Apply everything in `plan` the decoder did not already do.
pub fn process(decoded: DecodedImage, plan: &ProcessingPlan) -> Result<DynamicImage, ImageError> {
    let upright = decoded.has_hint(DecodeHint::AlreadyOriented);
    let ignored_region = decoded.has_hint(DecodeHint::IgnoredRegion);
    let (full, region, target, rotation) = if upright {
        (
            plan.orientation.oriented_size(plan.raw_size),
            plan.oriented_region,
            plan.oriented_target,
            plan.rotation,
        )
    } else {
        (plan.raw_size, plan.region, plan.raw_target, plan.raw_rotation)
    };

    let mut image = decoded.image;

    if ignored_region {
        image = crop_ignored_region(image, full, region)?;
    }

    if !plan.redactions.is_empty() {
        let orientation = if upright {
            Orientation::Rotate0
        } else {
            plan.orientation
        };
        image = redact(image, &plan.redactions, orientation, region.size());
    }

    if image.width() != target.width || image.height() != target.height {
        image = image.resize_exact(target.width, target.height, FilterType::CatmullRom);
    }

    image = rotate(image, rotation);

    if let Some(color) = plan.color {
        image = transform_color(image, color);
    }

    if let Some(overlay) = &plan.overlay {
        image = draw_overlay(image, overlay)?;
    }

    Ok(image)
}

fn crop_ignored_region(
    image: DynamicImage,
    full: Dimension,
    region: Rectangle,
) -> Result<DynamicImage, ImageError> {
    // The raster may be a reduced version of the full image.
    let ratio = image.width() as f64 / full.width.max(1) as f64;
    let bounds = Dimension::new(image.width(), image.height());
    let crop = region.scaled(ratio).clipped_to(bounds).ok_or_else(|| {
        ImageError::Codec(CodecError::Decode(format!(
            "region {} outside decoded raster {}",
            region, bounds
        )))
    })?;
    if crop == Rectangle::full(bounds) {
        return Ok(image);
    }
    Ok(image.crop_imm(crop.x, crop.y, crop.width, crop.height))
}

/// Black out `redactions` (upright, relative to the region) on a raster
/// covering a region of `region_size` stored pixels.
fn redact(
    image: DynamicImage,
    redactions: &[Rectangle],
    orientation: Orientation,
    region_size: Dimension,
) -> DynamicImage {
    let mut canvas = image.to_rgba8();
    let ratio = canvas.width() as f64 / region_size.width.max(1) as f64;
    let bounds = Dimension::new(canvas.width(), canvas.height());
    let black = Rgba([0, 0, 0, 255]);

    for rect in redactions {
        let raw = orientation.rect_to_raw(*rect, region_size);
        let Some(area) = raw.scaled(ratio).clipped_to(bounds) else {
            continue;
        };
        for y in area.y..area.y + area.height {
            for x in area.x..area.x + area.width {
                canvas.put_pixel(x, y, black);
            }
        }
    }
    DynamicImage::ImageRgba8(canvas)
}

fn rotate(image: DynamicImage, rotation: Rotate) -> DynamicImage {
    let image = if rotation.mirror() { image.fliph() } else { image };
    match rotation.degrees() {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    }
}

fn transform_color(image: DynamicImage, color: ColorTransform) -> DynamicImage {
    let mut gray = image.to_luma8();
    if color == ColorTransform::Bitonal {
        for pixel in gray.pixels_mut() {
            let value = if pixel.0[0] >= BITONAL_THRESHOLD { 255 } else { 0 };
            *pixel = Luma([value]);
        }
    }
    DynamicImage::ImageLuma8(gray)
}

/// Top-left corner of an overlay of `top` size on a `base`-sized image.
pub fn overlay_origin(
    position: Position,
    inset: u32,
    base: Dimension,
    top: Dimension,
) -> (i64, i64) {
    let inset = inset as i64;
    let (bw, bh) = (base.width as i64, base.height as i64);
    let (tw, th) = (top.width as i64, top.height as i64);
    let left = inset;
    let right = bw - tw - inset;
    let top_edge = inset;
    let bottom = bh - th - inset;
    let center_x = (bw - tw) / 2;
    let center_y = (bh - th) / 2;

    match position {
        Position::TopLeft | Position::Repeat => (left, top_edge),
        Position::TopCenter => (center_x, top_edge),
        Position::TopRight => (right, top_edge),
        Position::LeftCenter => (left, center_y),
        Position::Center => (center_x, center_y),
        Position::RightCenter => (right, center_y),
        Position::BottomLeft => (left, bottom),
        Position::BottomCenter => (center_x, bottom),
        Position::BottomRight => (right, bottom),
    }
}

fn draw_overlay(image: DynamicImage, overlay: &Overlay) -> Result<DynamicImage, ImageError> {
    let mark = image::open(&overlay.image)
        .map_err(|e| {
            ImageError::Codec(CodecError::Decode(format!(
                "overlay {}: {}",
                overlay.image, e
            )))
        })?
        .to_rgba8();
    Ok(DynamicImage::ImageRgba8(composite(
        image.to_rgba8(),
        &mark,
        overlay.position,
        overlay.inset,
    )))
}

fn composite(mut base: RgbaImage, mark: &RgbaImage, position: Position, inset: u32) -> RgbaImage {
    let base_size = Dimension::new(base.width(), base.height());
    let mark_size = Dimension::new(mark.width(), mark.height());
    if mark_size.is_empty() {
        return base;
    }

    if position == Position::Repeat {
        let step_x = (mark.width() + inset) as usize;
        let step_y = (mark.height() + inset) as usize;
        for y in (0..base.height()).step_by(step_y) {
            for x in (0..base.width()).step_by(step_x) {
                imageops::overlay(&mut base, mark, x as i64, y as i64);
            }
        }
    } else {
        let (x, y) = overlay_origin(position, inset, base_size, mark_size);
        imageops::overlay(&mut base, mark, x, y);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OutputFormat;
    use crate::operation::{Crop, Encode, OperationList, OperationListBuilder, Redact, Scale, ScaleMode};
    use image::{GenericImageView, RgbImage};
    use std::collections::HashSet;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, 200])
        }))
    }

    fn decoded(image: DynamicImage, hints: &[DecodeHint]) -> DecodedImage {
        DecodedImage {
            image,
            hints: hints.iter().copied().collect::<HashSet<_>>(),
            reduction_factor: 0,
        }
    }

    fn plan(
        builder: OperationListBuilder,
        raw: Dimension,
        orientation: Orientation,
    ) -> ProcessingPlan {
        builder
            .add(Encode::new(OutputFormat::Png, 90))
            .build()
            .unwrap()
            .apply_orientation(raw, orientation)
            .unwrap()
    }

    #[test]
    fn test_ignored_region_is_cropped_and_scaled() {
        let plan = plan(
            OperationList::builder("a")
                .add(Crop::Pixels(Rectangle::new(10, 10, 20, 10)))
                .add(Scale::new(ScaleMode::Percent(50.0), false)),
            Dimension::new(40, 30),
            Orientation::Rotate0,
        );
        let out = process(
            decoded(gradient(40, 30), &[DecodeHint::IgnoredRegion]),
            &plan,
        )
        .unwrap();
        assert_eq!(out.dimensions(), (10, 5));
    }

    #[test]
    fn test_unoriented_raster_is_turned_upright() {
        // Stored 40x20 with a 90° orientation is 20x40 upright.
        let plan = plan(
            OperationList::builder("a"),
            Dimension::new(40, 20),
            Orientation::Rotate90,
        );
        let out = process(decoded(gradient(40, 20), &[]), &plan).unwrap();
        assert_eq!(out.dimensions(), (20, 40));

        let upright = process(
            decoded(gradient(20, 40), &[DecodeHint::AlreadyOriented]),
            &plan,
        )
        .unwrap();
        assert_eq!(upright.dimensions(), (20, 40));
    }

    #[test]
    fn test_rotation_and_mirror() {
        let plan = plan(
            OperationList::builder("a").add(Rotate::new(90.0, true).unwrap()),
            Dimension::new(30, 10),
            Orientation::Rotate0,
        );
        let mut source = RgbImage::new(30, 10);
        source.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let out = process(decoded(DynamicImage::ImageRgb8(source), &[]), &plan).unwrap();
        assert_eq!(out.dimensions(), (10, 30));
        // Mirrored to the top-right, then rotated to the bottom-right.
        assert_eq!(out.to_rgb8().get_pixel(9, 29).0, [255, 0, 0]);
    }

    #[test]
    fn test_redaction_painted_black() {
        let plan = plan(
            OperationList::builder("a").add(Redact::new(vec![Rectangle::new(0, 0, 5, 5)])),
            Dimension::new(20, 20),
            Orientation::Rotate0,
        );
        let out = process(decoded(gradient(20, 20), &[]), &plan)
            .unwrap()
            .to_rgba8();
        assert_eq!(out.get_pixel(2, 2).0, [0, 0, 0, 255]);
        assert_ne!(out.get_pixel(10, 10).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_redaction_follows_orientation() {
        // Upright top-left corner of a source stored rotated by 90°.
        let plan = plan(
            OperationList::builder("a").add(Redact::new(vec![Rectangle::new(0, 0, 4, 4)])),
            Dimension::new(20, 10),
            Orientation::Rotate90,
        );
        let out = process(decoded(gradient(20, 10), &[]), &plan)
            .unwrap()
            .to_rgba8();
        assert_eq!(out.dimensions(), (10, 20));
        assert_eq!(out.get_pixel(1, 1).0, [0, 0, 0, 255]);
        assert_ne!(out.get_pixel(8, 18).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_bitonal_is_black_or_white() {
        let plan = plan(
            OperationList::builder("a").add(ColorTransform::Bitonal),
            Dimension::new(16, 16),
            Orientation::Rotate0,
        );
        let out = process(decoded(gradient(16, 16), &[]), &plan).unwrap();
        let gray = out.as_luma8().unwrap();
        assert!(gray.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn test_overlay_origin() {
        let base = Dimension::new(100, 80);
        let mark = Dimension::new(10, 20);
        assert_eq!(overlay_origin(Position::TopLeft, 5, base, mark), (5, 5));
        assert_eq!(overlay_origin(Position::BottomRight, 5, base, mark), (85, 55));
        assert_eq!(overlay_origin(Position::Center, 5, base, mark), (45, 30));
        assert_eq!(overlay_origin(Position::TopCenter, 0, base, mark), (45, 0));
    }

    #[test]
    fn test_composite_repeat_tiles_the_image() {
        let base = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        let mark = RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        let out = composite(base, &mark, Position::Repeat, 2);
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(4, 4).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(2, 2).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_missing_overlay_file_is_an_error() {
        let overlay = Overlay {
            image: "/nonexistent/mark.png".to_string(),
            position: Position::Center,
            inset: 0,
        };
        assert!(draw_overlay(gradient(4, 4), &overlay).is_err());
    }
}
