//! Boundary with the camera and face-detector collaborators.

use crate::types::{FaceRegion, Frame};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("capture failed: {0}")]
pub struct CaptureError(pub String);

#[derive(Error, Debug, Clone, PartialEq)]
#[error("detection failed: {0}")]
pub struct DetectError(pub String);

/// One-shot still capture.
pub trait CaptureSource: Send {
    fn capture_still(&mut self) -> Result<Frame, CaptureError>;
}

/// Locates faces in a frame. Each call is independent of previous frames.
pub trait FaceDetector: Send {
    /// Zero or more faces, in pixel coordinates of `frame`.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectError>;
}

/// Treats the whole frame as one face, for pre-cropped portraits.
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, DetectError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![FaceRegion::full_frame(frame.width(), frame.height())])
    }
}

/// Primary-subject policy: the face with the largest bounding box.
pub fn largest_face(faces: Vec<FaceRegion>) -> Option<FaceRegion> {
    faces
        .into_iter()
        .reduce(|best, face| if face.area() > best.area() { face } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn face(x: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion { x, y: 0.0, width: w, height: h, confidence: 0.5, landmarks: None }
    }

    #[test]
    fn test_largest_face_by_area() {
        let faces = vec![face(0.0, 50.0, 50.0), face(100.0, 90.0, 40.0), face(200.0, 60.0, 70.0)];
        assert_eq!(largest_face(faces).unwrap().x, 100.0);
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = vec![face(0.0, 50.0, 50.0), face(100.0, 50.0, 50.0)];
        assert_eq!(largest_face(faces).unwrap().x, 0.0);
    }

    #[test]
    fn test_largest_face_none() {
        assert!(largest_face(Vec::new()).is_none());
    }

    #[test]
    fn test_full_frame_detector() {
        let frame = Frame::new(GrayImage::new(120, 160));
        let faces = FullFrameDetector.detect(&frame).unwrap();
        assert_eq!(faces, vec![FaceRegion::full_frame(120, 160)]);

        let empty = Frame::new(GrayImage::new(0, 0));
        assert!(FullFrameDetector.detect(&empty).unwrap().is_empty());
    }
}
