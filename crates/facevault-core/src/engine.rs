use crate::session::{SessionController, SessionError, SessionState, VerificationOutcome};
use crate::store::EnrollMode;
use crate::types::{IdentityId, IdentitySummary};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("engine worker exited before replying")]
    WorkerLost,
}

/// Clone-safe async handle over a [`SessionController`].
///
/// Blocking pipeline work runs on the tokio blocking pool, so UI tasks stay
/// responsive while a capture cycle is in flight. Overlapping requests are
/// rejected by the controller, not queued here.
#[derive(Clone)]
pub struct EngineHandle {
    controller: Arc<SessionController>,
}

impl EngineHandle {
    pub fn new(controller: SessionController) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    /// Enroll the captured face as a new identity.
    pub async fn enroll(&self, label: &str) -> Result<IdentityId, EngineError> {
        self.run_enroll(label, EnrollMode::NewIdentity).await
    }

    /// Add the captured face to the identity with this label, creating it if absent.
    pub async fn enroll_multi_shot(&self, label: &str) -> Result<IdentityId, EngineError> {
        self.run_enroll(label, EnrollMode::MultiShot).await
    }

    pub async fn verify(&self) -> Result<VerificationOutcome, EngineError> {
        self.blocking(|controller| controller.verify()).await
    }

    pub async fn remove_identity(&self, id: IdentityId) -> Result<(), EngineError> {
        self.blocking(move |controller| controller.remove_identity(id))
            .await
    }

    pub fn list_identities(&self) -> Vec<IdentitySummary> {
        self.controller.list_identities()
    }

    /// Most recent verification outcomes, newest first.
    pub fn history(&self) -> Vec<VerificationOutcome> {
        self.controller.history()
    }

    pub fn clear_history(&self) {
        self.controller.clear_history();
    }

    pub fn acknowledge(&self) {
        self.controller.acknowledge();
    }

    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    async fn run_enroll(&self, label: &str, mode: EnrollMode) -> Result<IdentityId, EngineError> {
        let label = label.to_string();
        self.blocking(move |controller| controller.enroll(&label, mode))
            .await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&SessionController) -> Result<T, SessionError> + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        let joined = tokio::task::spawn_blocking(move || op(&controller)).await;
        match joined {
            Ok(result) => Ok(result?),
            Err(e) => {
                tracing::error!(error = %e, "engine worker failed");
                Err(EngineError::WorkerLost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{emb, rig};

    #[tokio::test]
    async fn test_enroll_then_verify() {
        let rig = rig();
        rig.queue_probe(emb(&[1.0, 0.0, 0.0]));
        rig.queue_probe(emb(&[0.99, 0.1, 0.0]));
        let engine = EngineHandle::new(rig.controller);

        let id = engine.enroll("Alice").await.unwrap();
        assert_eq!(engine.list_identities()[0].id, id);

        let outcome = engine.verify().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(engine.state(), SessionState::Resulted);
        assert_eq!(engine.history().len(), 1);

        engine.acknowledge();
        assert_eq!(engine.state(), SessionState::Idle);

        engine.clear_history();
        assert!(engine.history().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_multi_shot_accumulates() {
        let rig = rig();
        rig.queue_probe(emb(&[1.0, 0.0, 0.0]));
        rig.queue_probe(emb(&[0.0, 1.0, 0.0]));
        let engine = EngineHandle::new(rig.controller);

        let first = engine.enroll_multi_shot("Alice").await.unwrap();
        let second = engine.enroll_multi_shot("Alice").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.list_identities()[0].embedding_count, 2);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let rig = rig();
        let engine = EngineHandle::new(rig.controller);

        assert_eq!(
            engine.enroll("").await.unwrap_err(),
            EngineError::Session(SessionError::EmptyLabel)
        );
        let missing = uuid::Uuid::new_v4();
        assert_eq!(
            engine.remove_identity(missing).await.unwrap_err(),
            EngineError::Session(SessionError::NotFound(missing))
        );
    }
}
