use std::collections::{HashMap, HashSet};

use kbsearch_core::types::{DocIdentity, RetrievalCandidate};

/// Keep the first candidate for each identity key; order is preserved.
pub fn dedup(mut candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.key()));
    candidates
}

/// Keep at most `max_per_doc` candidates per `(kb_id, document)`, earliest
/// first. A cap of 0 leaves the list untouched.
pub fn cap_per_document(mut candidates: Vec<RetrievalCandidate>, max_per_doc: usize) -> Vec<RetrievalCandidate> {
    if max_per_doc == 0 {
        return candidates;
    }
    let mut taken: HashMap<(String, DocIdentity), usize> = HashMap::new();
    candidates.retain(|c| {
        let n = taken.entry((c.kb_id.clone(), c.doc_identity())).or_default();
        *n += 1;
        *n <= max_per_doc
    });
    candidates
}
