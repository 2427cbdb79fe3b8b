//! IIIF Image API 3.0 request parsing.
//!
//! ```text
//! {identifier}/{region}/{size}/{rotation}/{quality}.{format}
//! ```

use std::str::FromStr;

use crate::codec::OutputFormat;
use crate::error::ImageError;
use crate::operation::{
    ColorTransform, Crop, Encode, Identifier, OperationListBuilder, Rectangle, Rotate, Scale,
    ScaleMode,
};

/// The `quality` path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Default,
    Color,
    Gray,
    Bitonal,
}

impl Quality {
    pub fn color_transform(&self) -> Option<ColorTransform> {
        match self {
            Quality::Default | Quality::Color => None,
            Quality::Gray => Some(ColorTransform::Gray),
            Quality::Bitonal => Some(ColorTransform::Bitonal),
        }
    }
}

impl FromStr for Quality {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Quality::Default),
            "color" => Ok(Quality::Color),
            "gray" => Ok(Quality::Gray),
            "bitonal" => Ok(Quality::Bitonal),
            other => Err(ImageError::invalid(format!("Unknown quality: {}", other))),
        }
    }
}

/// A parsed image request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub identifier: Identifier,
    pub region: Crop,
    pub size: Scale,
    pub rotation: Rotate,
    pub quality: Quality,
    pub format: OutputFormat,
}

impl ImageRequest {
    /// Parse the four parameter segments of an image request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for any malformed segment.
    pub fn parse(
        identifier: impl Into<Identifier>,
        region: &str,
        size: &str,
        rotation: &str,
        quality_format: &str,
    ) -> Result<Self, ImageError> {
        let (quality, format) = quality_format
            .rsplit_once('.')
            .ok_or_else(|| ImageError::invalid("Missing format extension"))?;
        let format = OutputFormat::from_str(format).map_err(ImageError::invalid)?;

        Ok(Self {
            identifier: identifier.into(),
            region: parse_region(region)?,
            size: parse_size(size)?,
            rotation: parse_rotation(rotation)?,
            quality: quality.parse()?,
            format,
        })
    }

    /// Parse a request path relative to the IIIF prefix, e.g.
    /// `cat.jpg/full/max/0/default.jpg`. The identifier may contain `/`.
    pub fn parse_path(path: &str) -> Result<Self, ImageError> {
        let mut parts = path.trim_start_matches('/').rsplitn(5, '/');
        let quality_format = parts.next();
        let rotation = parts.next();
        let size = parts.next();
        let region = parts.next();
        let identifier = parts.next();
        match (identifier, region, size, rotation, quality_format) {
            (Some(id), Some(region), Some(size), Some(rotation), Some(qf)) if !id.is_empty() => {
                Self::parse(id, region, size, rotation, qf)
            }
            _ => Err(ImageError::invalid(format!("Malformed image path: {}", path))),
        }
    }

    /// Operations this request asks for. Policy-driven operations
    /// (overlay, redaction, scale constraint) are added by the caller.
    pub fn operations(&self, jpeg_quality: u8) -> OperationListBuilder {
        OperationListBuilder::new(self.identifier.clone())
            .add(self.region)
            .add(self.size)
            .add(self.rotation)
            .add_opt(self.quality.color_transform())
            .add(Encode::new(self.format, jpeg_quality))
    }
}

fn parse_u32(value: &str, what: &str) -> Result<u32, ImageError> {
    value
        .parse::<u32>()
        .map_err(|_| ImageError::invalid(format!("Invalid {}: {}", what, value)))
}

fn parse_f64(value: &str, what: &str) -> Result<f64, ImageError> {
    let parsed = value
        .parse::<f64>()
        .map_err(|_| ImageError::invalid(format!("Invalid {}: {}", what, value)))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(ImageError::invalid(format!("Invalid {}: {}", what, value)));
    }
    Ok(parsed)
}

fn four<'a>(value: &'a str, what: &str) -> Result<[&'a str; 4], ImageError> {
    let parts: Vec<&str> = value.split(',').collect();
    match parts.as_slice() {
        [a, b, c, d] => Ok([a, b, c, d]),
        _ => Err(ImageError::invalid(format!("Invalid {}: {}", what, value))),
    }
}

pub(crate) fn parse_region(region: &str) -> Result<Crop, ImageError> {
    match region {
        "full" => Ok(Crop::Full),
        "square" => Ok(Crop::Square),
        _ => {
            if let Some(pct) = region.strip_prefix("pct:") {
                let [x, y, w, h] = four(pct, "region")?;
                let crop = Crop::Percent {
                    x: parse_f64(x, "region")?,
                    y: parse_f64(y, "region")?,
                    width: parse_f64(w, "region")?,
                    height: parse_f64(h, "region")?,
                };
                if let Crop::Percent { width, height, .. } = crop {
                    if width == 0.0 || height == 0.0 {
                        return Err(ImageError::invalid("Region has zero area"));
                    }
                }
                return Ok(crop);
            }
            let [x, y, w, h] = four(region, "region")?;
            let rect = Rectangle::new(
                parse_u32(x, "region")?,
                parse_u32(y, "region")?,
                parse_u32(w, "region")?,
                parse_u32(h, "region")?,
            );
            if rect.width == 0 || rect.height == 0 {
                return Err(ImageError::invalid("Region has zero area"));
            }
            Ok(Crop::Pixels(rect))
        }
    }
}

pub(crate) fn parse_size(size: &str) -> Result<Scale, ImageError> {
    let (upscale, rest) = match size.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, size),
    };

    let mode = if rest == "max" || rest == "full" {
        ScaleMode::Max
    } else if let Some(pct) = rest.strip_prefix("pct:") {
        let pct = parse_f64(pct, "size")?;
        if pct == 0.0 {
            return Err(ImageError::invalid("Size percentage must be positive"));
        }
        ScaleMode::Percent(pct)
    } else {
        let (fit, dims) = match rest.strip_prefix('!') {
            Some(dims) => (true, dims),
            None => (false, rest),
        };
        let (w, h) = dims
            .split_once(',')
            .ok_or_else(|| ImageError::invalid(format!("Invalid size: {}", size)))?;
        let nonzero = |v: &str| -> Result<u32, ImageError> {
            let n = parse_u32(v, "size")?;
            if n == 0 {
                return Err(ImageError::invalid("Size must be positive"));
            }
            Ok(n)
        };
        match (w.is_empty(), h.is_empty(), fit) {
            (false, true, false) => ScaleMode::Width(nonzero(w)?),
            (true, false, false) => ScaleMode::Height(nonzero(h)?),
            (false, false, false) => ScaleMode::Exact(nonzero(w)?, nonzero(h)?),
            (false, false, true) => ScaleMode::Fit(nonzero(w)?, nonzero(h)?),
            _ => return Err(ImageError::invalid(format!("Invalid size: {}", size))),
        }
    };
    Ok(Scale::new(mode, upscale))
}

pub(crate) fn parse_rotation(rotation: &str) -> Result<Rotate, ImageError> {
    let (mirror, degrees) = match rotation.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, rotation),
    };
    Rotate::new(parse_f64(degrees, "rotation")?, mirror)
}
