//! Default codecs built on the `image` crate.
//!
//! The decoder honors the requested region natively but always reads at
//! full resolution, reporting `IgnoredScale` so the pipeline resizes. It
//! reports EXIF orientation in metadata and never applies it.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::metadata::Orientation as ExifOrientation;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder, ImageReader};

use super::{DecodeHint, DecodeRequest, DecodedImage, Decoder, Encoder, Metadata};
use super::{OutputFormat, SourceFormat};
use crate::error::CodecError;
use crate::operation::{Dimension, Encode, Orientation};

// =============================================================================
// Decoder
// =============================================================================

/// Decoder for every raster format the `image` crate reads.
pub struct RasterDecoder {
    format: SourceFormat,
    data: Bytes,
    size: Option<Dimension>,
    raster: Option<DynamicImage>,
}

impl RasterDecoder {
    pub fn new(format: SourceFormat, data: Bytes) -> Self {
        Self {
            format,
            data,
            size: None,
            raster: None,
        }
    }

    fn reader(&self) -> ImageReader<Cursor<&[u8]>> {
        ImageReader::with_format(Cursor::new(&self.data[..]), self.format.image_format())
    }

    fn full_raster(&mut self) -> Result<&DynamicImage, CodecError> {
        if self.raster.is_none() {
            let raster = self
                .reader()
                .decode()
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            self.raster = Some(raster);
        }
        self.raster
            .as_ref()
            .ok_or_else(|| CodecError::Decode("raster unavailable".to_string()))
    }

    fn check_index(image_index: usize) -> Result<(), CodecError> {
        if image_index != 0 {
            return Err(CodecError::Decode(format!(
                "image index {} out of range",
                image_index
            )));
        }
        Ok(())
    }
}

impl Decoder for RasterDecoder {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn size(&mut self, image_index: usize) -> Result<Dimension, CodecError> {
        Self::check_index(image_index)?;
        if let Some(size) = self.size {
            return Ok(size);
        }
        let (width, height) = self
            .reader()
            .into_dimensions()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let size = Dimension::new(width, height);
        self.size = Some(size);
        Ok(size)
    }

    fn read_metadata(&mut self, image_index: usize) -> Result<Metadata, CodecError> {
        Self::check_index(image_index)?;
        let mut decoder = self
            .reader()
            .into_decoder()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        // Formats without EXIF support report no transform.
        let orientation = match decoder.orientation() {
            Ok(ExifOrientation::Rotate90) => Orientation::Rotate90,
            Ok(ExifOrientation::Rotate180) => Orientation::Rotate180,
            Ok(ExifOrientation::Rotate270) => Orientation::Rotate270,
            _ => Orientation::Rotate0,
        };
        Ok(Metadata { orientation })
    }

    fn decode(
        &mut self,
        image_index: usize,
        request: &DecodeRequest,
    ) -> Result<DecodedImage, CodecError> {
        Self::check_index(image_index)?;
        let raster = self.full_raster()?;
        let full = Dimension::new(raster.width(), raster.height());

        let image = match request.region.clipped_to(full) {
            Some(region) if region.size() != full || region.x != 0 || region.y != 0 => {
                raster.crop_imm(region.x, region.y, region.width, region.height)
            }
            Some(_) => raster.clone(),
            None => {
                return Err(CodecError::Decode(format!(
                    "region {} outside image {}",
                    request.region, full
                )))
            }
        };

        let mut hints = HashSet::new();
        hints.insert(DecodeHint::IgnoredScale);

        Ok(DecodedImage {
            image,
            hints,
            reduction_factor: 0,
        })
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Encoder for every output format.
#[derive(Debug, Clone, Copy)]
pub struct RasterEncoder {
    format: OutputFormat,
}

impl RasterEncoder {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn buffered(
        image: &DynamicImage,
        format: image::ImageFormat,
        out: &mut dyn Write,
    ) -> Result<(), CodecError> {
        // These encoders need `Seek`, so they go through memory first.
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, format)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        out.write_all(buffer.get_ref())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

impl Encoder for RasterEncoder {
    fn encode(
        &mut self,
        image: &DynamicImage,
        encode: &Encode,
        out: &mut dyn Write,
    ) -> Result<(), CodecError> {
        let (width, height) = (image.width(), image.height());
        match self.format {
            OutputFormat::Jpg => {
                let encoder = JpegEncoder::new_with_quality(out, encode.quality);
                let result = match image {
                    DynamicImage::ImageLuma8(gray) => {
                        encoder.write_image(gray.as_raw(), width, height, ExtendedColorType::L8)
                    }
                    other => {
                        let rgb = other.to_rgb8();
                        encoder.write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                    }
                };
                result.map_err(|e| CodecError::Encode(e.to_string()))
            }
            OutputFormat::Png => {
                let encoder = PngEncoder::new(out);
                let result = match image {
                    DynamicImage::ImageLuma8(gray) => {
                        encoder.write_image(gray.as_raw(), width, height, ExtendedColorType::L8)
                    }
                    other => {
                        let rgba = other.to_rgba8();
                        encoder.write_image(rgba.as_raw(), width, height, ExtendedColorType::Rgba8)
                    }
                };
                result.map_err(|e| CodecError::Encode(e.to_string()))
            }
            OutputFormat::Gif => Self::buffered(
                &DynamicImage::ImageRgba8(image.to_rgba8()),
                image::ImageFormat::Gif,
                out,
            ),
            OutputFormat::Tif => Self::buffered(image, image::ImageFormat::Tiff, out),
            OutputFormat::Webp => Self::buffered(
                &DynamicImage::ImageRgba8(image.to_rgba8()),
                image::ImageFormat::WebP,
                out,
            ),
        }
    }
}
