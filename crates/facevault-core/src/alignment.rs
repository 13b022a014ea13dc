//! Face normalization to the canonical 112×112 recognizer crop.
//!
//! With landmarks, the face is warped by a 4-DOF similarity transform
//! (scale, rotation, translation) fitted onto the InsightFace reference
//! points. Without landmarks, the bounding box is cropped and resized.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

/// Side length of the aligned crop.
pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// Maps `(x, y)` to `(a·x − b·y + tx, b·x + a·y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SimilarityTransform {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl SimilarityTransform {
    /// Least-squares fit of `src → dst`, closed form over centered point sets.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }
        if energy < 1e-6 {
            return None;
        }

        let a = dot / energy;
        let b = cross / energy;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    #[cfg(test)]
    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn invert_apply(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Bilinear sample; pixels outside the image read as black.
fn sample_bilinear(frame: &GrayImage, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let at = |px: f32, py: f32| -> f32 {
        if px < 0.0 || py < 0.0 || px >= frame.width() as f32 || py >= frame.height() as f32 {
            0.0
        } else {
            frame.get_pixel(px as u32, py as u32)[0] as f32
        }
    };

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1.0, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1.0) * (1.0 - fx) * fy
        + at(x0 + 1.0, y0 + 1.0) * fx * fy
}

fn warp(frame: &GrayImage, transform: &SimilarityTransform) -> GrayImage {
    GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let value = transform
            .invert_apply((ox as f32, oy as f32))
            .map(|(sx, sy)| sample_bilinear(frame, sx, sy))
            .unwrap_or(0.0);
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

/// Crop the bounding box and resize it to the aligned size.
fn crop_resize(frame: &GrayImage, region: &FaceRegion) -> GrayImage {
    let x = region.x.max(0.0).floor() as u32;
    let y = region.y.max(0.0).floor() as u32;
    let w = (region.width.round() as u32).clamp(1, frame.width().saturating_sub(x).max(1));
    let h = (region.height.round() as u32).clamp(1, frame.height().saturating_sub(y).max(1));
    let crop = imageops::crop_imm(frame, x, y, w, h).to_image();
    imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
}

/// Produce the 112×112 grayscale crop fed to the recognizer.
pub fn align_face(frame: &GrayImage, region: &FaceRegion) -> GrayImage {
    let fitted = region
        .landmarks
        .as_ref()
        .and_then(|lms| SimilarityTransform::fit(lms, &REFERENCE_LANDMARKS_112));
    match fitted {
        Some(transform) => warp(frame, &transform),
        None => crop_resize(frame, region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_with(landmarks: Option<[(f32, f32); 5]>) -> FaceRegion {
        FaceRegion {
            x: 60.0,
            y: 40.0,
            width: 80.0,
            height: 100.0,
            confidence: 0.9,
            landmarks,
        }
    }

    #[test]
    fn test_fit_identity() {
        let t = SimilarityTransform::fit(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-2, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-2, "ty = {}", t.ty);
    }

    #[test]
    fn test_fit_recovers_scale_and_rotation() {
        // dst = 0.5 * R(30°) * src + (10, -4)
        let (sin, cos) = 30f32.to_radians().sin_cos();
        let truth = SimilarityTransform { a: 0.5 * cos, b: 0.5 * sin, tx: 10.0, ty: -4.0 };
        let src = [(80.0, 60.0), (120.0, 62.0), (100.0, 85.0), (85.0, 110.0), (115.0, 111.0)];
        let dst = src.map(|p| truth.apply(p));

        let t = SimilarityTransform::fit(&src, &dst).unwrap();
        assert!((t.a - truth.a).abs() < 1e-4);
        assert!((t.b - truth.b).abs() < 1e-4);
        assert!((t.tx - truth.tx).abs() < 1e-2);
        assert!((t.ty - truth.ty).abs() < 1e-2);
    }

    #[test]
    fn test_fit_degenerate_points() {
        let same = [(5.0, 5.0); 5];
        assert!(SimilarityTransform::fit(&same, &REFERENCE_LANDMARKS_112).is_none());
    }

    #[test]
    fn test_invert_round_trip() {
        let t = SimilarityTransform { a: 0.8, b: -0.3, tx: 4.0, ty: 7.5 };
        let p = (33.0, -12.0);
        let (x, y) = t.invert_apply(t.apply(p)).unwrap();
        assert!((x - p.0).abs() < 1e-3 && (y - p.1).abs() < 1e-3);
    }

    #[test]
    fn test_output_size_both_paths() {
        let frame = GrayImage::from_pixel(200, 200, Luma([128]));
        let landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for region in [region_with(Some(landmarks)), region_with(None)] {
            let aligned = align_face(&frame, &region);
            assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        }
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut frame = GrayImage::new(200, 200);
        let landmarks = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        // 5x5 bright patch on the left eye survives bilinear interpolation.
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Luma([255]));
            }
        }

        let aligned = align_face(&frame, &region_with(Some(landmarks)));

        let (rx, ry) = REFERENCE_LANDMARKS_112[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "expected bright patch near ({rx}, {ry}), max = {brightest}");
    }

    #[test]
    fn test_crop_resize_keeps_uniform_content() {
        let frame = GrayImage::from_pixel(300, 300, Luma([90]));
        let aligned = align_face(&frame, &region_with(None));
        assert!(aligned.pixels().all(|p| p[0] == 90));
    }
}
