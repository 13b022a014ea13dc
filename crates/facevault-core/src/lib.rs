//! Face enrollment, matching and verification engine.
//!
//! ArcFace embeddings are extracted via ONNX Runtime, stored in a versioned
//! JSON gallery behind a key-value store, and compared by cosine similarity
//! under a single-in-flight verification session.

pub mod alignment;
pub mod capture;
pub mod config;
pub mod engine;
pub mod extractor;
pub mod history;
pub mod matcher;
pub mod session;
pub mod store;
pub mod types;

pub use capture::{CaptureError, CaptureSource, DetectError, FaceDetector, FullFrameDetector};
pub use config::{ConfigError, EngineConfig};
pub use engine::{EngineError, EngineHandle};
pub use extractor::{ArcFaceExtractor, ExtractError, FeatureExtractor};
pub use matcher::{CosineMatcher, MatchError, MatchPolicy, MatchResult, Matcher};
pub use session::{SessionController, SessionError, SessionState, VerificationOutcome};
pub use store::{EnrollMode, EnrollmentStore, FileKvStore, KvError, KvStore, MemoryKvStore, StoreError};
pub use types::{
    Candidate, Embedding, FaceRegion, Frame, Gallery, Identity, IdentityId, IdentitySummary,
    VerificationResult,
};
