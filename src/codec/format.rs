//! Source and output format identification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// SourceFormat
// =============================================================================

/// Format of a source image, detected from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Jpeg,
    Png,
    Gif,
    Tiff,
    Webp,
    Bmp,
}

impl SourceFormat {
    /// Every format the default registry can decode.
    pub const ALL: [SourceFormat; 6] = [
        SourceFormat::Jpeg,
        SourceFormat::Png,
        SourceFormat::Gif,
        SourceFormat::Tiff,
        SourceFormat::Webp,
        SourceFormat::Bmp,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Png => "png",
            SourceFormat::Gif => "gif",
            SourceFormat::Tiff => "tiff",
            SourceFormat::Webp => "webp",
            SourceFormat::Bmp => "bmp",
        }
    }

    pub(crate) fn image_format(&self) -> image::ImageFormat {
        match self {
            SourceFormat::Jpeg => image::ImageFormat::Jpeg,
            SourceFormat::Png => image::ImageFormat::Png,
            SourceFormat::Gif => image::ImageFormat::Gif,
            SourceFormat::Tiff => image::ImageFormat::Tiff,
            SourceFormat::Webp => image::ImageFormat::WebP,
            SourceFormat::Bmp => image::ImageFormat::Bmp,
        }
    }

    /// Identify a format from its leading magic bytes.
    pub fn from_magic(bytes: &[u8]) -> Option<SourceFormat> {
        match bytes {
            [0xFF, 0xD8, 0xFF, ..] => Some(SourceFormat::Jpeg),
            [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(SourceFormat::Png),
            [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(SourceFormat::Gif),
            [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => {
                Some(SourceFormat::Tiff)
            }
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => {
                Some(SourceFormat::Webp)
            }
            [b'B', b'M', ..] => Some(SourceFormat::Bmp),
            _ => None,
        }
    }

    /// Identify a format from a file name extension.
    pub fn from_extension(name: &str) -> Option<SourceFormat> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "jpe" => Some(SourceFormat::Jpeg),
            "png" => Some(SourceFormat::Png),
            "gif" => Some(SourceFormat::Gif),
            "tif" | "tiff" | "ptif" => Some(SourceFormat::Tiff),
            "webp" => Some(SourceFormat::Webp),
            "bmp" => Some(SourceFormat::Bmp),
            _ => None,
        }
    }

    /// Magic bytes first; the identifier's extension breaks ties when the
    /// content is unrecognizable.
    pub fn detect(bytes: &[u8], identifier: &str) -> Option<SourceFormat> {
        Self::from_magic(bytes).or_else(|| Self::from_extension(identifier))
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// OutputFormat
// =============================================================================

/// Format of a derivative image, named by its IIIF extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpg,
    Png,
    Gif,
    Tif,
    Webp,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Jpg,
        OutputFormat::Png,
        OutputFormat::Gif,
        OutputFormat::Tif,
        OutputFormat::Webp,
    ];

    pub const fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::Tif => "tif",
            OutputFormat::Webp => "webp",
        }
    }

    pub const fn media_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Gif => "image/gif",
            OutputFormat::Tif => "image/tiff",
            OutputFormat::Webp => "image/webp",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpg),
            "png" => Ok(OutputFormat::Png),
            "gif" => Ok(OutputFormat::Gif),
            "tif" | "tiff" => Ok(OutputFormat::Tif),
            "webp" => Ok(OutputFormat::Webp),
            other => Err(format!("unsupported output format: {}", other)),
        }
    }
}
