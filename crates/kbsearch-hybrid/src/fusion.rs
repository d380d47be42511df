//! Merging per-source candidate lists into one fused ranking.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use kbsearch_core::config::{FusionSettings, FusionStrategy, SingleSourceScoring};
use kbsearch_core::types::{cmp_scored, CandidateKey, RetrievalCandidate, SourceKind};

struct Slot {
    candidate: RetrievalCandidate,
    lexical_rank: Option<usize>,
    vector_rank: Option<usize>,
}

/// Sort one source's list by its own score and keep the best hit per key.
pub fn rank_source(mut list: Vec<RetrievalCandidate>, source: SourceKind) -> Vec<RetrievalCandidate> {
    let score = |c: &RetrievalCandidate| c.source_score(source).unwrap_or(0.0);
    list.sort_by(|a, b| cmp_scored(score(a), a, score(b), b));
    let mut seen = HashSet::new();
    list.retain(|c| seen.insert(c.key()));
    list
}

/// Fuse lexical and vector candidates gathered from every knowledge base.
///
/// Candidates sharing an identity key merge into one, carrying both source
/// scores. Output is sorted by fused score, ties broken by identity key.
pub fn fuse(lexical: Vec<RetrievalCandidate>, vector: Vec<RetrievalCandidate>, settings: &FusionSettings) -> Vec<RetrievalCandidate> {
    let mut slots: BTreeMap<CandidateKey, Slot> = BTreeMap::new();
    for (rank, c) in rank_source(lexical, SourceKind::Lexical).into_iter().enumerate() {
        slots.insert(c.key(), Slot { candidate: c, lexical_rank: Some(rank + 1), vector_rank: None });
    }
    for (rank, c) in rank_source(vector, SourceKind::Vector).into_iter().enumerate() {
        match slots.entry(c.key()) {
            Entry::Occupied(mut e) => {
                let slot = e.get_mut();
                slot.candidate.vector_score = c.vector_score;
                slot.vector_rank = Some(rank + 1);
            }
            Entry::Vacant(e) => {
                e.insert(Slot { candidate: c, lexical_rank: None, vector_rank: Some(rank + 1) });
            }
        }
    }

    let mut fused: Vec<RetrievalCandidate> = slots
        .into_values()
        .map(|slot| {
            let score = match settings.strategy {
                FusionStrategy::Weighted => weighted_score(&slot.candidate, settings),
                FusionStrategy::Rrf => rrf_score(&slot, settings.rrf_k),
            };
            let mut c = slot.candidate;
            c.fused_score = score;
            c.final_score = score;
            c
        })
        .collect();
    fused.sort_by(|a, b| cmp_scored(a.fused_score, a, b.fused_score, b));
    fused
}

pub fn weighted_score(c: &RetrievalCandidate, settings: &FusionSettings) -> f64 {
    match (c.lexical_score, c.vector_score) {
        (Some(l), Some(v)) => settings.vector_weight * v + settings.lexical_weight * l,
        (Some(l), None) => single(l, settings.lexical_weight, settings.single_source),
        (None, Some(v)) => single(v, settings.vector_weight, settings.single_source),
        (None, None) => 0.0,
    }
}

fn single(score: f64, weight: f64, scoring: SingleSourceScoring) -> f64 {
    match scoring {
        SingleSourceScoring::Weighted => weight * score,
        SingleSourceScoring::Renormalized => score,
    }
}

fn rrf_score(slot: &Slot, k: f64) -> f64 {
    [slot.lexical_rank, slot.vector_rank]
        .into_iter()
        .flatten()
        .map(|rank| 1.0 / (k + rank as f64))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbsearch_core::types::ChunkRecord;

    fn hit(id: &str, index: u32, source: SourceKind, score: f64) -> RetrievalCandidate {
        let chunk = ChunkRecord {
            chunk_id: id.into(),
            kb_id: "kb".into(),
            doc_id: "doc".into(),
            filename: "doc.txt".into(),
            chunk_index: index,
            content: id.into(),
            ingest_generation: "g".into(),
        };
        RetrievalCandidate::from_chunk(&chunk, source, score)
    }

    fn weighted(single_source: SingleSourceScoring) -> FusionSettings {
        FusionSettings { strategy: FusionStrategy::Weighted, single_source, ..FusionSettings::default() }
    }

    #[test]
    fn weighted_blend_uses_both_scores() {
        let out = fuse(vec![hit("a", 0, SourceKind::Lexical, 1.0)], vec![hit("a", 0, SourceKind::Vector, 0.5)], &weighted(SingleSourceScoring::Weighted));
        assert_eq!(out.len(), 1);
        assert!((out[0].fused_score - (0.7 * 0.5 + 0.3 * 1.0)).abs() < 1e-12);
        assert_eq!(out[0].lexical_score, Some(1.0));
        assert_eq!(out[0].vector_score, Some(0.5));
    }

    #[test]
    fn single_source_scoring_is_configurable() {
        let lex = || vec![hit("a", 0, SourceKind::Lexical, 0.8)];
        let zeroed = fuse(lex(), Vec::new(), &weighted(SingleSourceScoring::Weighted));
        assert!((zeroed[0].fused_score - 0.3 * 0.8).abs() < 1e-12);
        let renorm = fuse(lex(), Vec::new(), &weighted(SingleSourceScoring::Renormalized));
        assert!((renorm[0].fused_score - 0.8).abs() < 1e-12);
    }

    #[test]
    fn rrf_rewards_agreement() {
        let settings = FusionSettings::default();
        let out = fuse(
            vec![hit("a", 0, SourceKind::Lexical, 0.9), hit("b", 1, SourceKind::Lexical, 0.8)],
            vec![hit("b", 1, SourceKind::Vector, 0.9), hit("c", 2, SourceKind::Vector, 0.1)],
            &settings,
        );
        let ids: Vec<&str> = out.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!((out[0].fused_score - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
    }

    #[test]
    fn equal_scores_order_by_identity_key() {
        let out = fuse(
            vec![hit("z", 5, SourceKind::Lexical, 0.5), hit("y", 2, SourceKind::Lexical, 0.5)],
            Vec::new(),
            &weighted(SingleSourceScoring::Renormalized),
        );
        assert_eq!(out[0].chunk_index, 2);
    }

    #[test]
    fn duplicate_keys_within_a_source_keep_the_best() {
        let ranked = rank_source(vec![hit("old", 1, SourceKind::Vector, 0.2), hit("new", 1, SourceKind::Vector, 0.6)], SourceKind::Vector);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, "new");
    }
}
