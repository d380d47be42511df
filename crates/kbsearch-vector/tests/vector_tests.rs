use std::sync::Arc;

use kbsearch_core::config::{StorageSettings, VectorBackendKind};
use kbsearch_core::error::Error;
use kbsearch_core::traits::VectorIndex;
use kbsearch_core::types::ChunkRecord;
use kbsearch_vector::{open_vector_index, LanceVectorIndex, MemoryVectorIndex};
use tempfile::TempDir;

fn chunk(id: &str, index: u32, content: &str) -> ChunkRecord {
    ChunkRecord {
        chunk_id: id.to_string(),
        kb_id: String::new(),
        doc_id: String::new(),
        filename: String::new(),
        chunk_index: index,
        content: content.to_string(),
        ingest_generation: String::new(),
    }
}

fn unit(dim: usize, hot: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[hot % dim] = 1.0;
    v
}

async fn seed(idx: &dyn VectorIndex) {
    let chunks = [chunk("c1", 0, "approval workflow"), chunk("c2", 1, "approval rules"), chunk("c3", 2, "payment runs")];
    let vectors = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.8, 0.6, 0.0, 0.0], vec![0.0, 0.0, 1.0, 0.0]];
    idx.upsert("kb1", "doc", "doc.txt", "g1", &chunks, &vectors).await.expect("upsert");
}

async fn lance(tmp: &TempDir) -> LanceVectorIndex {
    LanceVectorIndex::open(&tmp.path().join("vectors")).await.expect("open lance")
}

fn ids(hits: &[kbsearch_core::types::RetrievalCandidate]) -> Vec<String> {
    hits.iter().map(|h| h.chunk_id.clone()).collect()
}

#[tokio::test]
async fn accelerated_and_software_paths_agree() {
    let tmp = TempDir::new().unwrap();
    let fast = lance(&tmp).await;
    seed(&fast).await;
    let slow = lance(&tmp).await.with_accelerated(false);
    let mem = MemoryVectorIndex::new();
    seed(&mem).await;

    let q = [0.9, 0.3, 0.1, 0.0];
    let a = fast.search("kb1", &q, 3).await.expect("native");
    let b = slow.search("kb1", &q, 3).await.expect("scan");
    let c = mem.search("kb1", &q, 3).await.expect("memory");
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(ids(&b), ids(&c));
    assert_eq!(ids(&a)[0], "c1");
    for (x, y) in a.iter().zip(&b) {
        let (sx, sy) = (x.vector_score.unwrap_or_default(), y.vector_score.unwrap_or_default());
        assert!((sx - sy).abs() < 1e-4, "{} native {sx} vs software {sy}", x.chunk_id);
    }
}

#[tokio::test]
async fn dimensionalities_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let idx = lance(&tmp).await;
    idx.upsert("kb", "small", "s.txt", "g1", &[chunk("s1", 0, "small")], &[unit(384, 1)]).await.expect("384");
    idx.upsert("kb", "large", "l.txt", "g1", &[chunk("l1", 0, "large")], &[unit(768, 1)]).await.expect("768");

    let small = idx.search("kb", &unit(384, 1), 10).await.expect("search 384");
    assert_eq!(ids(&small), vec!["s1"]);
    let large = idx.search("kb", &unit(768, 1), 10).await.expect("search 768");
    assert_eq!(ids(&large), vec!["l1"]);
    assert!(idx.search("kb", &unit(512, 1), 10).await.expect("search 512").is_empty());
    assert_eq!(idx.count("kb").await.expect("count"), 2);
}

#[tokio::test]
async fn re_embedding_at_new_dimensionality_moves_the_row() {
    let tmp = TempDir::new().unwrap();
    let idx = lance(&tmp).await;
    idx.upsert("kb", "d", "d.txt", "g1", &[chunk("c", 0, "text")], &[unit(4, 0)]).await.expect("dim 4");
    idx.upsert("kb", "d", "d.txt", "g2", &[chunk("c", 0, "text")], &[unit(8, 0)]).await.expect("dim 8");
    assert_eq!(idx.count("kb").await.expect("count"), 1);
    assert!(idx.search("kb", &unit(4, 0), 5).await.expect("search").is_empty());
}

#[tokio::test]
async fn generation_swap_keeps_old_rows_until_stale_delete() {
    for idx in backends().await {
        seed(idx.as_ref()).await;
        let next = [chunk("n1", 0, "new first"), chunk("n2", 1, "new second")];
        idx.upsert("kb1", "doc", "doc.txt", "g2", &next, &[vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]])
            .await
            .expect("upsert g2");
        assert_eq!(idx.count("kb1").await.expect("count"), 5, "{}: both generations visible", idx.backend_name());

        let keep = vec!["n1".to_string(), "n2".to_string()];
        let removed = idx.delete_stale_generation("kb1", "doc", &keep).await.expect("stale");
        assert_eq!(removed, 3);
        let rows = idx.read_range("kb1", "doc", 0..=10).await.expect("range");
        assert_eq!(rows.iter().map(|r| r.chunk_id.as_str()).collect::<Vec<_>>(), vec!["n1", "n2"]);
        assert!(rows.iter().all(|r| r.ingest_generation == "g2"));
    }
}

#[tokio::test]
async fn upsert_is_idempotent() {
    for idx in backends().await {
        seed(idx.as_ref()).await;
        seed(idx.as_ref()).await;
        assert_eq!(idx.count("kb1").await.expect("count"), 3, "{}", idx.backend_name());
    }
}

#[tokio::test]
async fn zero_norm_query_scores_zero() {
    for idx in backends().await {
        seed(idx.as_ref()).await;
        let hits = idx.search("kb1", &[0.0; 4], 3).await.expect("search");
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.vector_score == Some(0.0)), "{}", idx.backend_name());
    }
}

#[tokio::test]
async fn deletes_are_scoped() {
    for idx in backends().await {
        seed(idx.as_ref()).await;
        idx.upsert("kb2", "doc", "doc.txt", "g1", &[chunk("c1", 0, "same id, other base")], &[unit(4, 0)])
            .await
            .expect("kb2");

        let removed = idx.delete_chunks("kb1", &["c1".to_string(), "missing".to_string()]).await.expect("chunks");
        assert_eq!(removed, 1);
        assert_eq!(idx.count("kb2").await.expect("count"), 1, "{}: kb2 untouched", idx.backend_name());

        idx.delete_document("kb1", "doc").await.expect("doc");
        assert_eq!(idx.count("kb1").await.expect("count"), 0);
        idx.delete_collection("kb2").await.expect("kb");
        assert_eq!(idx.count("kb2").await.expect("count"), 0);
    }
}

#[tokio::test]
async fn mismatched_batches_are_rejected() {
    for idx in backends().await {
        let two = [chunk("a", 0, "a"), chunk("b", 1, "b")];
        assert!(idx.upsert("kb", "d", "d", "g", &two, &[unit(4, 0)]).await.is_err());
        let err = idx.upsert("kb", "d", "d", "g", &[chunk("a", 0, "a"), chunk("a", 1, "b")], &[unit(4, 0), unit(4, 1)]).await;
        assert!(err.is_err(), "{}: duplicate chunk ids", idx.backend_name());
    }
}

#[tokio::test]
async fn factory_honours_backend_choice() {
    let tmp = TempDir::new().unwrap();
    let mut settings = StorageSettings { vector_backend: VectorBackendKind::Memory, ..Default::default() };
    let mem = open_vector_index(&settings, tmp.path()).await.expect("memory");
    assert_eq!(mem.backend_name(), "memory");
    settings.vector_backend = VectorBackendKind::Lance;
    let lance = open_vector_index(&settings, &tmp.path().join("lance")).await.expect("lance");
    assert_eq!(lance.backend_name(), "lance");
}

async fn backends() -> Vec<Arc<dyn VectorIndex>> {
    // Leaked so the Lance directory outlives the returned handle.
    let tmp = Box::leak(Box::new(TempDir::new().unwrap()));
    vec![Arc::new(lance(tmp).await), Arc::new(MemoryVectorIndex::new())]
}

#[tokio::test]
async fn fetch_returns_stored_rows_with_vectors() {
    for idx in backends().await {
        seed(idx.as_ref()).await;
        let wanted = vec!["c2".to_string(), "missing".to_string()];
        let rows = idx.fetch_chunks("kb1", &wanted).await.expect("fetch");
        assert_eq!(rows.len(), 1, "{}", idx.backend_name());
        assert_eq!(rows[0].0.chunk_id, "c2");
        assert_eq!(rows[0].0.ingest_generation, "g1");
        assert_eq!(rows[0].1, vec![0.8, 0.6, 0.0, 0.0]);
        assert!(idx.fetch_chunks("kb2", &wanted).await.expect("other kb").is_empty());
    }
}

#[tokio::test]
async fn rows_without_a_document_survive_document_scoped_deletes() {
    for idx in backends().await {
        idx.upsert("kb", "", "a.txt", "g1", &[chunk("a1", 0, "loose a")], &[unit(4, 0)]).await.expect("a");
        idx.upsert("kb", "", "b.txt", "g1", &[chunk("b1", 0, "loose b")], &[unit(4, 1)]).await.expect("b");
        let removed = idx.delete_stale_generation("kb", "", &["b1".to_string()]).await.expect("stale");
        assert_eq!(removed, 0, "{}", idx.backend_name());
        let err = idx.delete_document("kb", "").await.expect_err("empty doc id");
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(idx.count("kb").await.expect("count"), 2);
    }
}
