use facevault_core::{CaptureError, CaptureSource, Frame};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Capture source fed with image files.
///
/// Holds at most one staged image; staging replaces whatever an earlier,
/// rejected request left behind, and each capture consumes it.
#[derive(Clone, Default)]
pub struct StagedImageCapture {
    staged: Arc<Mutex<Option<PathBuf>>>,
}

impl StagedImageCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the image the next capture will read.
    pub fn stage(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if let Some(stale) = self.slot().replace(path) {
            tracing::debug!(path = %stale.display(), "discarding unconsumed image");
        }
    }

    /// Drop a staged image that no capture consumed.
    pub fn clear(&self) {
        self.slot().take();
    }

    fn slot(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureSource for StagedImageCapture {
    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        let path = self
            .slot()
            .take()
            .ok_or_else(|| CaptureError("no image staged".into()))?;

        let image = image::open(&path)
            .map_err(|e| CaptureError(format!("{}: {e}", path.display())))?
            .to_luma8();
        tracing::debug!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "captured still"
        );
        Ok(Frame::new(image))
    }
}
