//! Photo normalization before storage

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageFormat;
use tracing::{debug, warn};

use crate::model::Provenance;

/// Bytes ready to store, with their MIME type
#[derive(Debug, Clone, PartialEq)]
pub struct Annotated {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Transforms a raw capture into the binary that is stored and uploaded.
///
/// Provenance is passed so implementations can burn it into the image; the
/// structured copy is stored alongside the blob either way.
pub trait EvidenceAnnotator: Send + Sync {
    fn annotate(&self, raw: &[u8], provenance: &Provenance) -> Annotated;
}

/// Stores the capture untouched
pub struct Passthrough;

impl EvidenceAnnotator for Passthrough {
    fn annotate(&self, raw: &[u8], _provenance: &Provenance) -> Annotated {
        Annotated {
            bytes: raw.to_vec(),
            content_type: sniff_content_type(raw),
        }
    }
}

fn sniff_content_type(raw: &[u8]) -> String {
    image::guess_format(raw)
        .map(|f| f.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string())
}

/// Downscales oversized photos and re-encodes non-JPEG input as JPEG
pub struct JpegNormalizer {
    pub max_dimension: u32,
    pub quality: u8,
}

impl JpegNormalizer {
    pub fn new(max_dimension: u32, quality: u8) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    fn normalize(&self, raw: &[u8]) -> Result<Option<Vec<u8>>, image::ImageError> {
        let format = image::guess_format(raw)?;
        let img = image::load_from_memory(raw)?;
        let oversized = img.width() > self.max_dimension || img.height() > self.max_dimension;

        if format == ImageFormat::Jpeg && !oversized {
            return Ok(None);
        }

        let img = if oversized {
            debug!(
                width = img.width(),
                height = img.height(),
                max = self.max_dimension,
                "Downscaling capture"
            );
            img.resize(self.max_dimension, self.max_dimension, FilterType::Triangle)
        } else {
            img
        };

        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
        encoder.encode_image(&img.to_rgb8())?;
        Ok(Some(out))
    }
}

impl EvidenceAnnotator for JpegNormalizer {
    fn annotate(&self, raw: &[u8], provenance: &Provenance) -> Annotated {
        match self.normalize(raw) {
            Ok(Some(bytes)) => Annotated {
                bytes,
                content_type: "image/jpeg".to_string(),
            },
            Ok(None) => Annotated {
                bytes: raw.to_vec(),
                content_type: "image/jpeg".to_string(),
            },
            Err(e) => {
                // Keep the evidence even if it cannot be decoded here
                warn!(captured_at = %provenance.captured_at, "Storing capture unprocessed: {}", e);
                Passthrough.annotate(raw, provenance)
            }
        }
    }
}
