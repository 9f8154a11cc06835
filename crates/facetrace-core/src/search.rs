//! Gallery face search with iterative prototype refinement.
//!
//! The selfie embedding seeds a search; confident (tier 1) hits are averaged
//! into a prototype that is searched again, widening recall for the same
//! person across poses and lighting. Results are reported per media item.

use crate::batch::StoreError;
use crate::types::{l2_normalize, Embedding, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub cosine_weight: f32,
    pub l2_weight: f32,
    /// Decay applied to the L2 distance term.
    pub gamma: f32,
    pub tier1_threshold: f32,
    pub tier2_threshold: f32,
    pub refinement_cycles: usize,
    pub max_candidates: usize,
    /// Selfies detected below this confidence are not searched.
    pub min_selfie_confidence: f32,
    pub embedding_dim: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cosine_weight: 0.80,
            l2_weight: 0.20,
            gamma: 0.5,
            tier1_threshold: 0.40,
            tier2_threshold: 0.29,
            refinement_cycles: 3,
            max_candidates: 200,
            min_selfie_confidence: 0.5,
            embedding_dim: EMBEDDING_DIM,
        }
    }
}

impl SearchConfig {
    /// Weighted blend of cosine similarity and a decayed L2 distance.
    pub fn combined_score(&self, query: &Embedding, candidate: &Embedding) -> f32 {
        let cosine = query.similarity(candidate);
        let l2 = query.euclidean_distance(candidate);
        self.cosine_weight * cosine + self.l2_weight * (-self.gamma * l2).exp()
    }

    /// Gate a selfie before it is used as a search query.
    pub fn check_query(&self, embedding: &Embedding, confidence: f32) -> Result<(), QueryRejection> {
        if confidence.is_nan() || confidence < self.min_selfie_confidence {
            return Err(QueryRejection::LowConfidence(confidence));
        }
        if embedding.values.len() != self.embedding_dim || embedding.values.iter().any(|v| !v.is_finite()) {
            return Err(QueryRejection::InvalidEmbedding);
        }
        Ok(())
    }
}

/// Why a selfie was not usable as a search query.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum QueryRejection {
    #[error("face detection confidence {0} is too low")]
    LowConfidence(f32),
    #[error("selfie embedding is not a valid face embedding")]
    InvalidEmbedding,
}

/// A stored face returned by a [`FaceIndex`] query, scored against it.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCandidate {
    pub face_id: String,
    pub media_id: String,
    pub embedding: Embedding,
    pub score: f32,
}

/// Nearest-neighbour lookup over stored gallery embeddings.
pub trait FaceIndex {
    /// Faces of `event_id` scoring at least `threshold` against `query`,
    /// best first, at most `max_results`.
    fn search(
        &self,
        query: &Embedding,
        event_id: &str,
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<FaceCandidate>, StoreError>;
}

impl<T: FaceIndex + ?Sized> FaceIndex for Box<T> {
    fn search(
        &self,
        query: &Embedding,
        event_id: &str,
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<FaceCandidate>, StoreError> {
        (**self).search(query, event_id, threshold, max_results)
    }
}

/// Match confidence band, serialized as the number `1` or `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Tier {
    High,
    Low,
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> u8 {
        match tier {
            Tier::High => 1,
            Tier::Low => 2,
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(Tier::High),
            2 => Ok(Tier::Low),
            other => Err(format!("unknown tier {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub media_id: String,
    pub score: f32,
    pub tier: Tier,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub tier1: Vec<FaceMatch>,
    pub tier2: Vec<FaceMatch>,
}

/// Mean of the given embeddings, L2-normalized. `None` when empty.
pub fn build_prototype(embeddings: &[&Embedding]) -> Option<Embedding> {
    let first = embeddings.first()?;
    let dim = first.values.len();
    let mut mean = vec![0.0f32; dim];
    for e in embeddings {
        for (m, v) in mean.iter_mut().zip(&e.values) {
            *m += v;
        }
    }
    let n = embeddings.len() as f32;
    for m in &mut mean {
        *m /= n;
    }
    Some(Embedding {
        values: l2_normalize(mean),
        model_version: first.model_version.clone(),
    })
}

struct Tracker<'a> {
    config: &'a SearchConfig,
    best: HashMap<String, (String, f32)>,
    tier1_ids: HashSet<String>,
    tier1_embeddings: Vec<Embedding>,
}

impl Tracker<'_> {
    /// Record a candidate; returns true when it newly joined tier 1.
    fn observe(&mut self, c: FaceCandidate) -> bool {
        match self.best.get_mut(&c.face_id) {
            Some((_, score)) if *score >= c.score => {}
            Some((_, score)) => *score = c.score,
            None => {
                self.best.insert(c.face_id.clone(), (c.media_id.clone(), c.score));
            }
        }

        if c.score >= self.config.tier1_threshold && !self.tier1_ids.contains(&c.face_id) {
            self.tier1_ids.insert(c.face_id);
            self.tier1_embeddings.push(c.embedding);
            return true;
        }
        false
    }

    fn prototype(&self) -> Option<Embedding> {
        let refs: Vec<&Embedding> = self.tier1_embeddings.iter().collect();
        build_prototype(&refs)
    }
}

/// Search `event_id` for the person in `query`.
pub fn refined_search<I: FaceIndex + ?Sized>(
    index: &I,
    query: &Embedding,
    event_id: &str,
    config: &SearchConfig,
) -> Result<SearchResult, StoreError> {
    let search = |q: &Embedding| index.search(q, event_id, config.tier2_threshold, config.max_candidates);

    let mut tracker = Tracker {
        config,
        best: HashMap::new(),
        tier1_ids: HashSet::new(),
        tier1_embeddings: Vec::new(),
    };

    for c in search(query)? {
        tracker.observe(c);
    }

    let mut prototype: Option<Embedding> = None;
    for cycle in 0..config.refinement_cycles {
        let Some(proto) = tracker.prototype() else {
            break;
        };
        let mut added = 0usize;
        for c in search(&proto)? {
            if tracker.observe(c) {
                added += 1;
            }
        }
        prototype = Some(proto);
        tracing::debug!(cycle, added, tier1 = tracker.tier1_ids.len(), "refinement cycle");
        if added == 0 {
            break;
        }
    }

    if let Some(proto) = &prototype {
        for c in search(proto)? {
            if let Some((_, score)) = tracker.best.get_mut(&c.face_id) {
                if c.score > *score {
                    *score = c.score;
                }
            } else {
                tracker.best.insert(c.face_id, (c.media_id, c.score));
            }
        }
    }

    // Per media: best score, tier 1 if any of its faces reached tier 1.
    let mut per_media: HashMap<String, (f32, bool)> = HashMap::new();
    for (face_id, (media_id, score)) in &tracker.best {
        let is_tier1 = tracker.tier1_ids.contains(face_id);
        let entry = per_media.entry(media_id.clone()).or_insert((*score, is_tier1));
        entry.0 = entry.0.max(*score);
        entry.1 |= is_tier1;
    }

    let mut result = SearchResult::default();
    for (media_id, (score, is_tier1)) in per_media {
        if is_tier1 {
            result.tier1.push(FaceMatch { media_id, score, tier: Tier::High });
        } else {
            result.tier2.push(FaceMatch { media_id, score, tier: Tier::Low });
        }
    }
    for list in [&mut result.tier1, &mut result.tier2] {
        list.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.media_id.cmp(&b.media_id)));
    }

    tracing::info!(
        event_id,
        tier1 = result.tier1.len(),
        tier2 = result.tier2.len(),
        refined = prototype.is_some(),
        "face search finished"
    );
    Ok(result)
}
