//! Probe-vs-gallery decision: best-shot cosine scoring, deterministic ranking,
//! threshold plus ambiguity-margin policy.

use crate::types::{Candidate, Embedding, Gallery, Identity};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe has {probe} dimensions, gallery has {gallery}")]
    DimensionMismatch { probe: usize, gallery: usize },
    #[error("probe from extractor {probe:?} cannot be compared with gallery from {gallery:?}")]
    IncompatibleEmbeddingVersion { probe: String, gallery: String },
}

/// Decision parameters for one match call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    /// Minimum top score (cosine, [-1, 1]) for a positive match.
    pub threshold: f32,
    /// Minimum lead of the top candidate over the runner-up; 0 disables the guard.
    pub margin: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            margin: 0.0,
        }
    }
}

/// Ranked outcome of comparing a probe against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Every identity, best first. Empty for an empty gallery.
    pub ranked: Vec<Candidate>,
    pub policy: MatchPolicy,
}

impl MatchResult {
    /// Top similarity, or 0.0 when nothing was compared.
    pub fn top_score(&self) -> f32 {
        self.ranked.first().map(|c| c.score).unwrap_or(0.0)
    }

    /// Top candidate, only when the policy accepted it.
    pub fn best_match(&self) -> Option<&Candidate> {
        if self.matched {
            self.ranked.first()
        } else {
            None
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        policy: &MatchPolicy,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher with best-shot scoring per identity.
///
/// Every embedding of every identity is scored; there is no early exit.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        policy: &MatchPolicy,
    ) -> Result<MatchResult, MatchError> {
        check_compatible(probe, gallery)?;

        let mut scored: Vec<(&Identity, f32)> = gallery
            .identities()
            .iter()
            .map(|identity| (identity, best_shot(probe, identity)))
            .collect();

        // Stable sort: equal scores and timestamps keep insertion order.
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let ranked: Vec<Candidate> = scored
            .into_iter()
            .map(|(identity, score)| Candidate {
                identity_id: identity.id,
                label: identity.label.clone(),
                score,
            })
            .collect();

        let matched = decide(&ranked, policy);

        if let Some(top) = ranked.first() {
            tracing::debug!(
                label = %top.label,
                score = top.score,
                runner_up = ranked.get(1).map(|c| c.score),
                threshold = policy.threshold,
                margin = policy.margin,
                matched,
                "match decision"
            );
        }

        Ok(MatchResult {
            matched,
            ranked,
            policy: *policy,
        })
    }
}

/// Every gallery embedding must share the probe's dimension and extractor version.
fn check_compatible(probe: &Embedding, gallery: &Gallery) -> Result<(), MatchError> {
    for embedding in gallery.identities().iter().flat_map(|i| &i.embeddings) {
        if embedding.dimension() != probe.dimension() {
            return Err(MatchError::DimensionMismatch {
                probe: probe.dimension(),
                gallery: embedding.dimension(),
            });
        }
        if embedding.extractor_version != probe.extractor_version {
            return Err(MatchError::IncompatibleEmbeddingVersion {
                probe: probe.extractor_version.clone(),
                gallery: embedding.extractor_version.clone(),
            });
        }
    }
    Ok(())
}

fn best_shot(probe: &Embedding, identity: &Identity) -> f32 {
    identity
        .embeddings
        .iter()
        .map(|e| probe.similarity(e))
        .fold(f32::NEG_INFINITY, f32::max)
}

fn decide(ranked: &[Candidate], policy: &MatchPolicy) -> bool {
    let Some(top) = ranked.first() else {
        return false;
    };
    if top.score < policy.threshold {
        return false;
    }
    match ranked.get(1) {
        Some(second) if policy.margin > 0.0 => top.score - second.score >= policy.margin,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    const V: &str = "test-v1";

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec(), V).normalized()
    }

    /// Unit vector at `cos` similarity to [1, 0, 0].
    fn at_cos(cos: f32) -> Embedding {
        emb(&[cos, (1.0 - cos * cos).sqrt(), 0.0])
    }

    fn identity(label: &str, order: i64, embeddings: Vec<Embedding>) -> Identity {
        Identity {
            id: Uuid::new_v4(),
            label: label.into(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(order),
            embeddings,
        }
    }

    fn policy(threshold: f32, margin: f32) -> MatchPolicy {
        MatchPolicy { threshold, margin }
    }

    #[test]
    fn test_self_match_is_maximal() {
        let e = emb(&[0.2, 0.5, -0.1, 0.8]);
        let gallery = Gallery::new(vec![identity("self", 0, vec![e.clone()])]);
        let result = CosineMatcher.compare(&e, &gallery, &MatchPolicy::default()).unwrap();
        assert!(result.matched);
        assert!((result.top_score() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_alice_bob_scenario() {
        // Probe sits at 0.95 to A. B has no y component, so cosine(probe, B) = 0.95 * B.x = 0.2.
        let a = emb(&[1.0, 0.0, 0.0]);
        let probe = at_cos(0.95);
        let bx = 0.2f32 / 0.95;
        let b = emb(&[bx, 0.0, (1.0 - bx * bx).sqrt()]);

        let gallery = Gallery::new(vec![
            identity("Alice", 0, vec![a.clone()]),
            identity("Bob", 1, vec![b.clone()]),
        ]);
        assert!(a.similarity(&b) < 0.6);

        let result = CosineMatcher.compare(&probe, &gallery, &MatchPolicy::default()).unwrap();
        assert!(result.matched);
        let best = result.best_match().unwrap();
        assert_eq!(best.label, "Alice");
        assert!((best.score - 0.95).abs() < 1e-4, "score = {}", best.score);
        assert!((result.ranked[1].score - 0.2).abs() < 1e-4, "bob = {}", result.ranked[1].score);
    }

    #[test]
    fn test_dissimilar_probe_keeps_ranked_list() {
        let gallery = Gallery::new(vec![
            identity("Alice", 0, vec![emb(&[0.0, 1.0, 0.0])]),
            identity("Bob", 1, vec![emb(&[0.0, 0.0, 1.0])]),
        ]);
        let probe = emb(&[1.0, 0.1, 0.05]);
        let result = CosineMatcher.compare(&probe, &gallery, &MatchPolicy::default()).unwrap();
        assert!(!result.matched);
        assert!(result.best_match().is_none());
        assert_eq!(result.ranked.len(), 2);
        assert!(result.ranked.iter().all(|c| c.score < 0.6));
        assert!(result.ranked[0].score >= result.ranked[1].score);
    }

    #[test]
    fn test_margin_guard_rejects_ambiguous_match() {
        let gallery = Gallery::new(vec![
            identity("first", 0, vec![at_cos(0.81)]),
            identity("second", 1, vec![at_cos(0.80)]),
        ]);
        let probe = emb(&[1.0, 0.0, 0.0]);

        let guarded = CosineMatcher.compare(&probe, &gallery, &policy(0.6, 0.05)).unwrap();
        assert!(!guarded.matched);
        assert!(guarded.top_score() >= 0.6);

        let unguarded = CosineMatcher.compare(&probe, &gallery, &policy(0.6, 0.0)).unwrap();
        assert!(unguarded.matched);
        assert_eq!(unguarded.best_match().unwrap().label, "first");
    }

    #[test]
    fn test_margin_guard_ignored_for_single_identity() {
        let gallery = Gallery::new(vec![identity("only", 0, vec![at_cos(0.9)])]);
        let result = CosineMatcher
            .compare(&emb(&[1.0, 0.0, 0.0]), &gallery, &policy(0.6, 0.5))
            .unwrap();
        assert!(result.matched);
    }

    #[test]
    fn test_best_shot_uses_max_embedding() {
        let gallery = Gallery::new(vec![identity(
            "multi",
            0,
            vec![at_cos(0.1), at_cos(0.92), at_cos(0.3)],
        )]);
        let result = CosineMatcher
            .compare(&emb(&[1.0, 0.0, 0.0]), &gallery, &MatchPolicy::default())
            .unwrap();
        assert!((result.top_score() - 0.92).abs() < 1e-4);
    }

    #[test]
    fn test_ties_break_by_creation_time() {
        let later = identity("later", 5, vec![at_cos(0.7)]);
        let earlier = identity("earlier", 1, vec![at_cos(0.7)]);
        let gallery = Gallery::new(vec![later, earlier]);
        let result = CosineMatcher
            .compare(&emb(&[1.0, 0.0, 0.0]), &gallery, &MatchPolicy::default())
            .unwrap();
        assert_eq!(result.ranked[0].label, "earlier");
        assert_eq!(result.ranked[1].label, "later");
    }

    #[test]
    fn test_threshold_monotonic() {
        let gallery = Gallery::new(vec![
            identity("a", 0, vec![at_cos(0.75)]),
            identity("b", 1, vec![at_cos(0.4)]),
        ]);
        let probe = emb(&[1.0, 0.0, 0.0]);
        let mut was_matched = true;
        for step in 0..=20 {
            let t = -1.0 + step as f32 * 0.1;
            let matched = CosineMatcher.compare(&probe, &gallery, &policy(t, 0.0)).unwrap().matched;
            assert!(was_matched || !matched, "failure turned into success at T={t}");
            was_matched = matched;
        }
        assert!(!was_matched);
    }

    #[test]
    fn test_empty_gallery_fails_closed() {
        let result = CosineMatcher
            .compare(&emb(&[1.0, 0.0]), &Gallery::default(), &policy(-1.0, 0.0))
            .unwrap();
        assert!(!result.matched);
        assert!(result.ranked.is_empty());
        assert_eq!(result.top_score(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let gallery = Gallery::new(vec![identity("a", 0, vec![emb(&[1.0, 0.0, 0.0])])]);
        let err = CosineMatcher
            .compare(&emb(&[1.0, 0.0]), &gallery, &MatchPolicy::default())
            .unwrap_err();
        assert_eq!(err, MatchError::DimensionMismatch { probe: 2, gallery: 3 });
    }

    #[test]
    fn test_incompatible_version() {
        let gallery = Gallery::new(vec![identity("a", 0, vec![emb(&[1.0, 0.0])])]);
        let probe = Embedding::new(vec![1.0, 0.0], "other-v2");
        let err = CosineMatcher
            .compare(&probe, &gallery, &MatchPolicy::default())
            .unwrap_err();
        assert!(matches!(err, MatchError::IncompatibleEmbeddingVersion { .. }));
    }
}
