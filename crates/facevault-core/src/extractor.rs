//! Feature extraction: face region to embedding.
//!
//! [`FeatureExtractor`] is the pluggable seam; [`ArcFaceExtractor`] runs the
//! w600k_r50 ArcFace model through ONNX Runtime and produces 512-dimensional
//! unit-norm embeddings.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Embedding, FaceRegion, Frame};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike detector models
const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "arcface-w600k_r50";

/// Smallest face side, in pixels, that yields a usable embedding.
pub const DEFAULT_MIN_FACE_SIZE: u32 = 40;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("face region does not lie within the {frame_width}x{frame_height} frame")]
    NoFaceInRegion { frame_width: u32, frame_height: u32 },
    #[error("face region {width:.0}x{height:.0} is smaller than {min}x{min}")]
    RegionTooSmall { width: f32, height: f32, min: u32 },
    #[error("model file not found: {0}; download w600k_r50.onnx from insightface")]
    ModelNotFound(String),
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one detected face into an embedding.
///
/// Implementations must be deterministic for a fixed frame, region and
/// [`version`](Self::version), and must tag every embedding with that version.
pub trait FeatureExtractor: Send {
    fn version(&self) -> &str;

    fn extract(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractError>;
}

/// Reject regions the extractor cannot produce a meaningful embedding from.
pub fn validate_region(frame: &Frame, region: &FaceRegion, min_size: u32) -> Result<(), ExtractError> {
    if !region.fits_within(frame.width(), frame.height()) {
        return Err(ExtractError::NoFaceInRegion {
            frame_width: frame.width(),
            frame_height: frame.height(),
        });
    }
    let min = min_size as f32;
    if region.width < min || region.height < min {
        return Err(ExtractError::RegionTooSmall {
            width: region.width,
            height: region.height,
            min: min_size,
        });
    }
    Ok(())
}

/// ArcFace-based feature extractor.
pub struct ArcFaceExtractor {
    session: Session,
    min_face_size: u32,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, min_face_size: u32) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            min_face_size,
        })
    }

    /// Aligned 112x112 grayscale crop → NCHW float tensor, gray replicated to RGB.
    fn preprocess(aligned: &GrayImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned.enumerate_pixels() {
            let normalized = (pixel[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }

        tensor
    }
}

impl FeatureExtractor for ArcFaceExtractor {
    fn version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn extract(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractError> {
        validate_region(frame, region, self.min_face_size)?;

        let aligned = alignment::align_face(&frame.image, region);
        let input = Self::preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::ExtractionFailure(format!("embedding tensor: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractError::ExtractionFailure(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(ExtractError::ExtractionFailure(
                "embedding has non-finite values".into(),
            ));
        }

        Ok(Embedding::new(raw.to_vec(), ARCFACE_MODEL_VERSION).normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(GrayImage::from_pixel(w, h, Luma([128])))
    }

    fn region(x: f32, y: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_validate_region_accepts_inner_box() {
        assert!(validate_region(&frame(640, 480), &region(100.0, 80.0, 120.0, 150.0), 40).is_ok());
    }

    #[test]
    fn test_validate_region_too_small() {
        let err = validate_region(&frame(640, 480), &region(10.0, 10.0, 39.0, 80.0), 40).unwrap_err();
        assert!(matches!(err, ExtractError::RegionTooSmall { min: 40, .. }));
    }

    #[test]
    fn test_validate_region_out_of_bounds() {
        let err = validate_region(&frame(640, 480), &region(600.0, 10.0, 80.0, 80.0), 40).unwrap_err();
        assert!(matches!(err, ExtractError::NoFaceInRegion { frame_width: 640, .. }));
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let aligned = GrayImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Luma([128]));
        let tensor = ArcFaceExtractor::preprocess(&aligned);
        let size = ALIGNED_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, size, size]);

        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let aligned = GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| Luma([((x + y) % 256) as u8]));
        let tensor = ArcFaceExtractor::preprocess(&aligned);
        for y in 0..ALIGNED_SIZE as usize {
            for x in 0..ALIGNED_SIZE as usize {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_load_missing_model() {
        let err = ArcFaceExtractor::load(Path::new("/nonexistent/w600k_r50.onnx"), 40)
            .err()
            .unwrap();
        assert!(matches!(err, ExtractError::ModelNotFound(_)));
    }
}
