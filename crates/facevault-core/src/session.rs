//! Verification session controller.
//!
//! Drives one capture → detect → extract → match cycle at a time through an
//! explicit state machine and records every outcome in a bounded history.
//! Overlapping requests are rejected with
//! [`SessionError::VerificationInProgress`], never queued.

use crate::capture::{self, CaptureError, CaptureSource, DetectError, FaceDetector};
use crate::config::EngineConfig;
use crate::extractor::{ExtractError, FeatureExtractor};
use crate::history::History;
use crate::matcher::{CosineMatcher, MatchError, MatchPolicy, MatchResult, Matcher};
use crate::store::{EnrollMode, EnrollmentStore, KvError, StoreError};
use crate::types::{Embedding, Frame, Gallery, IdentityId, IdentitySummary, VerificationResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("a capture cycle is already in progress")]
    VerificationInProgress,
    #[error(transparent)]
    CaptureFailure(#[from] CaptureError),
    #[error(transparent)]
    DetectionFailure(#[from] DetectError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face region does not lie within the {frame_width}x{frame_height} frame")]
    NoFaceInRegion { frame_width: u32, frame_height: u32 },
    #[error("face region {width:.0}x{height:.0} is smaller than {min}x{min}")]
    RegionTooSmall { width: f32, height: f32, min: u32 },
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("probe has {probe} dimensions, gallery has {gallery}")]
    DimensionMismatch { probe: usize, gallery: usize },
    #[error("probe from extractor {probe:?} cannot be compared with gallery from {gallery:?}")]
    IncompatibleEmbeddingVersion { probe: String, gallery: String },
    #[error("label is empty")]
    EmptyLabel,
    #[error("write failure: {0}")]
    WriteFailure(KvError),
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("match did not finish within {0:?}")]
    MatchTimeout(Duration),
    #[error("match failed: {0}")]
    MatchFailure(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<ExtractError> for SessionError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NoFaceInRegion {
                frame_width,
                frame_height,
            } => Self::NoFaceInRegion {
                frame_width,
                frame_height,
            },
            ExtractError::RegionTooSmall { width, height, min } => {
                Self::RegionTooSmall { width, height, min }
            }
            other => Self::ExtractionFailure(other.to_string()),
        }
    }
}

impl From<MatchError> for SessionError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::DimensionMismatch { probe, gallery } => {
                Self::DimensionMismatch { probe, gallery }
            }
            MatchError::IncompatibleEmbeddingVersion { probe, gallery } => {
                Self::IncompatibleEmbeddingVersion { probe, gallery }
            }
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EmptyLabel => Self::EmptyLabel,
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::WriteFailure(kv) => Self::WriteFailure(kv),
            StoreError::DimensionMismatch { expected, actual } => Self::DimensionMismatch {
                probe: actual,
                gallery: expected,
            },
            StoreError::IncompatibleEmbeddingVersion { expected, actual } => {
                Self::IncompatibleEmbeddingVersion {
                    probe: actual,
                    gallery: expected,
                }
            }
            other => Self::Store(other),
        }
    }
}

/// Where the controller is in its capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Detecting,
    Extracting,
    Matching,
    Resulted,
}

impl SessionState {
    /// States from which a new cycle may start.
    pub fn accepts_request(self) -> bool {
        matches!(self, Self::Idle | Self::Resulted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Detecting => "detecting",
            Self::Extracting => "extracting",
            Self::Matching => "matching",
            Self::Resulted => "resulted",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of one verification cycle, as recorded in history.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Completed(VerificationResult),
    NoFaceDetected { at: DateTime<Utc> },
    Failed { at: DateTime<Utc>, error: SessionError },
}

impl VerificationOutcome {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Completed(result) => result.probed_at,
            Self::NoFaceDetected { at } | Self::Failed { at, .. } => *at,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(result) if result.success)
    }
}

struct Pipeline {
    capture: Box<dyn CaptureSource>,
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn FeatureExtractor>,
}

pub struct SessionController {
    pipeline: Mutex<Pipeline>,
    store: Arc<EnrollmentStore>,
    matcher: Arc<dyn Matcher>,
    policy: MatchPolicy,
    match_timeout: Duration,
    state: Mutex<SessionState>,
    history: Mutex<History<VerificationOutcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the machine to `Idle` if a cycle unwinds before reaching a terminal state.
struct CycleGuard<'a> {
    state: &'a Mutex<SessionState>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        if !state.accepts_request() {
            tracing::warn!(state = %*state, "capture cycle aborted; resetting to idle");
            *state = SessionState::Idle;
        }
    }
}

impl SessionController {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        detector: Box<dyn FaceDetector>,
        extractor: Box<dyn FeatureExtractor>,
        store: Arc<EnrollmentStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pipeline: Mutex::new(Pipeline {
                capture,
                detector,
                extractor,
            }),
            store,
            matcher: Arc::new(CosineMatcher),
            policy: config.match_policy(),
            match_timeout: config.match_timeout(),
            state: Mutex::new(SessionState::Idle),
            history: Mutex::new(History::new(config.history_capacity)),
        }
    }

    /// Replace the default cosine matcher.
    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Verification outcomes, most recent first.
    pub fn history(&self) -> Vec<VerificationOutcome> {
        lock(&self.history).recent()
    }

    pub fn list_identities(&self) -> Vec<IdentitySummary> {
        self.store.list()
    }

    pub fn remove_identity(&self, id: IdentityId) -> Result<(), SessionError> {
        Ok(self.store.remove(id)?)
    }

    /// Drop every recorded outcome. The session state is untouched.
    pub fn clear_history(&self) {
        lock(&self.history).clear();
        tracing::debug!("verification history cleared");
    }

    /// Leave `Resulted` once the caller has consumed the outcome.
    pub fn acknowledge(&self) {
        let mut state = lock(&self.state);
        if *state == SessionState::Resulted {
            *state = SessionState::Idle;
            tracing::debug!("result acknowledged");
        }
    }

    /// Run one full verification cycle against the current gallery.
    ///
    /// Only an overlapping request is an `Err`. Every other failure ends the
    /// cycle in `Resulted` and comes back as [`VerificationOutcome::Failed`].
    pub fn verify(&self) -> Result<VerificationOutcome, SessionError> {
        self.begin()?;
        let _guard = CycleGuard { state: &self.state };

        let outcome = {
            let mut pipeline = lock(&self.pipeline);
            self.run_verify(&mut pipeline)
        }
        .unwrap_or_else(|error| VerificationOutcome::Failed {
            at: Utc::now(),
            error,
        });

        match &outcome {
            VerificationOutcome::Completed(result) => tracing::info!(
                success = result.success,
                matched = result.matched.as_ref().map(|c| c.label.as_str()),
                score = result.score,
                candidates = result.ranked.len(),
                "verification completed"
            ),
            VerificationOutcome::NoFaceDetected { .. } => tracing::info!("no face detected"),
            VerificationOutcome::Failed { error, .. } => {
                tracing::warn!(error = %error, "verification failed")
            }
        }

        lock(&self.history).push(outcome.clone());
        self.transition(SessionState::Resulted);
        Ok(outcome)
    }

    /// Capture a face and enroll it under `label`.
    ///
    /// Shares the single-in-flight guard with [`verify`](Self::verify) but is
    /// not recorded in history; the machine returns straight to `Idle`.
    pub fn enroll(&self, label: &str, mode: EnrollMode) -> Result<IdentityId, SessionError> {
        if label.trim().is_empty() {
            return Err(SessionError::EmptyLabel);
        }
        self.begin()?;
        let _guard = CycleGuard { state: &self.state };

        let result = {
            let mut pipeline = lock(&self.pipeline);
            self.capture_embedding(&mut pipeline)
        }
        .and_then(|embedding| match embedding {
            Some(embedding) => Ok(self.store.enroll(label, embedding, mode)?),
            None => Err(SessionError::NoFaceDetected),
        });

        self.transition(SessionState::Idle);
        if let Err(e) = &result {
            tracing::warn!(label, error = %e, "enrollment failed");
        }
        result
    }

    fn begin(&self) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        if !state.accepts_request() {
            tracing::warn!(state = %*state, "rejecting overlapping capture request");
            return Err(SessionError::VerificationInProgress);
        }
        *state = SessionState::Capturing;
        tracing::debug!("state -> capturing");
        Ok(())
    }

    fn transition(&self, next: SessionState) {
        *lock(&self.state) = next;
        tracing::debug!(state = %next, "state -> {next}");
    }

    /// Capture, detect and extract. `None` when the frame holds no face.
    fn capture_embedding(&self, pipeline: &mut Pipeline) -> Result<Option<Embedding>, SessionError> {
        let frame: Frame = pipeline.capture.capture_still()?;

        self.transition(SessionState::Detecting);
        let faces = pipeline.detector.detect(&frame)?;
        let count = faces.len();
        let Some(face) = capture::largest_face(faces) else {
            return Ok(None);
        };
        if count > 1 {
            tracing::debug!(count, area = face.area(), "several faces; using the largest");
        }

        self.transition(SessionState::Extracting);
        let embedding = pipeline.extractor.extract(&frame, &face)?;
        Ok(Some(embedding))
    }

    fn run_verify(&self, pipeline: &mut Pipeline) -> Result<VerificationOutcome, SessionError> {
        let probed_at = Utc::now();
        let Some(probe) = self.capture_embedding(pipeline)? else {
            return Ok(VerificationOutcome::NoFaceDetected { at: probed_at });
        };

        self.transition(SessionState::Matching);
        let result = self.match_with_timeout(probe, self.store.snapshot())?;

        Ok(VerificationOutcome::Completed(VerificationResult {
            id: Uuid::new_v4(),
            probed_at,
            success: result.matched,
            matched: result.best_match().cloned(),
            score: result.top_score(),
            threshold: result.policy.threshold,
            margin: result.policy.margin,
            ranked: result.ranked,
        }))
    }

    /// Run the matcher on a worker thread, bounded by the configured timeout.
    fn match_with_timeout(
        &self,
        probe: Embedding,
        gallery: Arc<Gallery>,
    ) -> Result<MatchResult, SessionError> {
        let (tx, rx) = mpsc::channel();
        let matcher = Arc::clone(&self.matcher);
        let policy = self.policy;

        std::thread::Builder::new()
            .name("facevault-match".into())
            .spawn(move || {
                let _ = tx.send(matcher.compare(&probe, &gallery, &policy));
            })
            .map_err(|e| SessionError::MatchFailure(format!("spawn match worker: {e}")))?;

        match rx.recv_timeout(self.match_timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::MatchTimeout(self.match_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::MatchFailure(
                "match worker exited without a result".into(),
            )),
        }
    }
}
