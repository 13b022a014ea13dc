use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an enrolled identity.
pub type IdentityId = Uuid;

/// A captured still, reduced to 8-bit grayscale.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: GrayImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// A face located in a frame by the detector.
///
/// All coordinates are in pixel units of the source frame, origin top-left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    /// Region covering a whole `width` x `height` frame.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// True if the box lies entirely inside a `width` x `height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= width as f32
            && self.y + self.height <= height as f32
    }
}

/// Face embedding vector, tagged with the extractor version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub extractor_version: String,
}

impl Embedding {
    pub fn new(vector: Vec<f32>, extractor_version: impl Into<String>) -> Self {
        Self {
            vector,
            extractor_version: extractor_version.into(),
        }
    }

    /// Same embedding scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.vector.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes every dimension; a zero vector scores 0.0 against anything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.vector.iter().zip(other.vector.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// An enrolled subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: IdentityId,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub embeddings: Vec<Embedding>,
}

impl Identity {
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id,
            label: self.label.clone(),
            created_at: self.created_at,
            embedding_count: self.embeddings.len(),
        }
    }
}

/// Listing view of an identity, without its embeddings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub embedding_count: usize,
}

/// Point-in-time set of enrolled identities, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Embedding dimension shared by the gallery, if anything is enrolled.
    pub fn dimension(&self) -> Option<usize> {
        self.first_embedding().map(Embedding::dimension)
    }

    /// Extractor version shared by the gallery, if anything is enrolled.
    pub fn extractor_version(&self) -> Option<&str> {
        self.first_embedding().map(|e| e.extractor_version.as_str())
    }

    /// Earliest enrolled embedding; every other embedding must agree with its
    /// dimension and extractor version.
    pub fn first_embedding(&self) -> Option<&Embedding> {
        self.identities.iter().flat_map(|i| i.embeddings.iter()).next()
    }

    pub(crate) fn identities_mut(&mut self) -> &mut Vec<Identity> {
        &mut self.identities
    }
}

/// One identity's standing for a probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub identity_id: IdentityId,
    pub label: String,
    /// Best cosine similarity over the identity's embeddings, in [-1, 1].
    pub score: f32,
}

/// Outcome of one match attempt against a gallery snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    pub id: Uuid,
    pub probed_at: DateTime<Utc>,
    pub success: bool,
    /// Top-ranked candidate; present only when `success`.
    pub matched: Option<Candidate>,
    /// Top cosine similarity, 0.0 for an empty gallery.
    pub score: f32,
    pub threshold: f32,
    pub margin: f32,
    /// Every identity considered, best first.
    pub ranked: Vec<Candidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec(), "test")
    }

    #[test]
    fn test_similarity_identical() {
        let a = emb(&[0.3, -0.2, 0.9]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let s = emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0]));
        assert!((s + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_similarity_symmetric() {
        let a = emb(&[0.1, 0.7, -0.4]);
        let b = emb(&[0.5, -0.1, 0.2]);
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = emb(&[3.0, 4.0]).normalized();
        assert!((e.vector[0] - 0.6).abs() < 1e-6);
        assert!((e.vector[1] - 0.8).abs() < 1e-6);
        assert_eq!(emb(&[0.0, 0.0]).normalized().vector, vec![0.0, 0.0]);
    }

    #[test]
    fn test_region_fits_within() {
        let r = FaceRegion::full_frame(100, 80);
        assert!(r.fits_within(100, 80));
        assert!(!r.fits_within(99, 80));

        let neg = FaceRegion { x: -1.0, ..FaceRegion::full_frame(10, 10) };
        assert!(!neg.fits_within(100, 100));
    }

    #[test]
    fn test_embedding_serde_field_names() {
        let json = serde_json::to_value(emb(&[1.0])).unwrap();
        assert!(json.get("vector").is_some());
        assert_eq!(json["extractorVersion"], "test");
    }

    #[test]
    fn test_gallery_dimension_and_version() {
        assert_eq!(Gallery::default().dimension(), None);
        let g = Gallery::new(vec![Identity {
            id: Uuid::new_v4(),
            label: "a".into(),
            created_at: Utc::now(),
            embeddings: vec![emb(&[1.0, 0.0, 0.0])],
        }]);
        assert_eq!(g.dimension(), Some(3));
        assert_eq!(g.extractor_version(), Some("test"));
    }
}
