//! Decoder and encoder abstraction.
//!
//! Codecs are selected at runtime through a [`CodecRegistry`] built once at
//! startup and shared immutably afterwards:
//!
//! ```text
//!  source bytes ──► SourceFormat::detect ──► DecoderFactory ──► Box<dyn Decoder>
//!  OutputFormat ─────────────────────────► EncoderFactory ──► Box<dyn Encoder>
//! ```
//!
//! Decoders and encoders are created per request and never shared between
//! threads; only the factories are.

mod format;
mod raster;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;

use crate::error::CodecError;
use crate::operation::{Dimension, Encode, Orientation, Rectangle};

pub use format::{OutputFormat, SourceFormat};
pub use raster::{RasterDecoder, RasterEncoder};

// =============================================================================
// Decoder
// =============================================================================

/// What a decoder did (or did not do) with a [`DecodeRequest`].
///
/// The pipeline compensates for every transform the decoder reports as
/// ignored, and skips orientation when the decoder already applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeHint {
    /// The raster is already rotated into its upright orientation.
    AlreadyOriented,
    /// The full image was returned instead of the requested region.
    IgnoredRegion,
    /// The raster was not reduced toward the requested scale.
    IgnoredScale,
}

/// Parameters of one decode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeRequest {
    /// Region to read, in stored full-resolution pixel coordinates.
    pub region: Rectangle,
    /// Final scale relative to full resolution that the pipeline will
    /// produce; decoders may use it to pick a sub-resolution.
    pub scale: f64,
    /// Suggested number of power-of-two halvings.
    pub reduction_factor: u8,
}

/// A decoded raster plus the hints describing it.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub hints: HashSet<DecodeHint>,
    /// Halvings actually applied to the raster.
    pub reduction_factor: u8,
}

impl DecodedImage {
    pub fn has_hint(&self, hint: DecodeHint) -> bool {
        self.hints.contains(&hint)
    }
}

/// Metadata read from a source that contributes to its `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    pub orientation: Orientation,
}

/// Reads one source image.
pub trait Decoder: Send {
    /// Detected format of the source.
    fn format(&self) -> SourceFormat;

    /// Number of sub-images (pages) in the source.
    fn num_images(&self) -> usize {
        1
    }

    /// Stored full-resolution size of a sub-image.
    fn size(&mut self, image_index: usize) -> Result<Dimension, CodecError>;

    /// Native tile size of a sub-image; untiled sources report their size.
    fn tile_size(&mut self, image_index: usize) -> Result<Dimension, CodecError> {
        self.size(image_index)
    }

    /// Number of resolution levels available natively.
    fn num_resolutions(&mut self) -> Result<u32, CodecError> {
        Ok(1)
    }

    fn read_metadata(&mut self, image_index: usize) -> Result<Metadata, CodecError>;

    fn decode(
        &mut self,
        image_index: usize,
        request: &DecodeRequest,
    ) -> Result<DecodedImage, CodecError>;
}

/// Creates decoders for one or more source formats.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, format: SourceFormat, data: Bytes) -> Result<Box<dyn Decoder>, CodecError>;
}

impl<F> DecoderFactory for F
where
    F: Fn(SourceFormat, Bytes) -> Result<Box<dyn Decoder>, CodecError> + Send + Sync,
{
    fn create(&self, format: SourceFormat, data: Bytes) -> Result<Box<dyn Decoder>, CodecError> {
        self(format, data)
    }
}

// =============================================================================
// Encoder
// =============================================================================

/// Writes a raster in one output format.
pub trait Encoder: Send {
    fn encode(
        &mut self,
        image: &DynamicImage,
        encode: &Encode,
        out: &mut dyn Write,
    ) -> Result<(), CodecError>;
}

/// Creates encoders for one or more output formats.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, format: OutputFormat) -> Box<dyn Encoder>;
}

impl<F> EncoderFactory for F
where
    F: Fn(OutputFormat) -> Box<dyn Encoder> + Send + Sync,
{
    fn create(&self, format: OutputFormat) -> Box<dyn Encoder> {
        self(format)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Format → codec factory mapping.
///
/// Populated during startup, then wrapped in an `Arc` and never mutated.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    decoders: HashMap<SourceFormat, Arc<dyn DecoderFactory>>,
    encoders: HashMap<OutputFormat, Arc<dyn EncoderFactory>>,
}

impl CodecRegistry {
    /// A registry with no codecs.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with the `image`-crate backed codecs for every format.
    pub fn with_defaults() -> Self {
        let decoder: Arc<dyn DecoderFactory> = Arc::new(
            |format: SourceFormat, data: Bytes| -> Result<Box<dyn Decoder>, CodecError> {
                Ok(Box::new(RasterDecoder::new(format, data)))
            },
        );
        let encoder: Arc<dyn EncoderFactory> =
            Arc::new(|format: OutputFormat| -> Box<dyn Encoder> {
                Box::new(RasterEncoder::new(format))
            });

        let mut registry = Self::empty();
        for format in SourceFormat::ALL {
            registry.decoders.insert(format, Arc::clone(&decoder));
        }
        for format in OutputFormat::ALL {
            registry.encoders.insert(format, Arc::clone(&encoder));
        }
        registry
    }

    /// Register (or replace) the decoder for a format.
    pub fn register_decoder(
        &mut self,
        format: SourceFormat,
        factory: impl DecoderFactory + 'static,
    ) -> &mut Self {
        self.decoders.insert(format, Arc::new(factory));
        self
    }

    /// Register (or replace) the encoder for a format.
    pub fn register_encoder(
        &mut self,
        format: OutputFormat,
        factory: impl EncoderFactory + 'static,
    ) -> &mut Self {
        self.encoders.insert(format, Arc::new(factory));
        self
    }

    pub fn supports_output(&self, format: OutputFormat) -> bool {
        self.encoders.contains_key(&format)
    }

    /// Detect the format of `data` and create a decoder for it.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSourceFormat` if the format cannot be detected or
    /// has no registered decoder.
    pub fn decoder_for(
        &self,
        identifier: &str,
        data: Bytes,
    ) -> Result<Box<dyn Decoder>, CodecError> {
        let format = SourceFormat::detect(&data, identifier).ok_or_else(|| {
            CodecError::UnsupportedSourceFormat(format!("unrecognized content of {}", identifier))
        })?;
        let factory = self
            .decoders
            .get(&format)
            .ok_or_else(|| CodecError::UnsupportedSourceFormat(format.to_string()))?;
        factory.create(format, data)
    }

    /// Create an encoder for an output format.
    pub fn encoder_for(&self, format: OutputFormat) -> Result<Box<dyn Encoder>, CodecError> {
        self.encoders
            .get(&format)
            .map(|factory| factory.create(format))
            .ok_or_else(|| CodecError::UnsupportedOutputFormat(format.to_string()))
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .field("encoders", &self.encoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
