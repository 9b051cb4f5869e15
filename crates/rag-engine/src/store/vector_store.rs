use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::chunk::ChunkMetadata;
use crate::store::index::FlatIndex;
use crate::utils::error::{EngineError, Result};

const INDEX_FILE: &str = "index.bin";
const META_FILE: &str = "meta.bin";

/// Result from a vector search.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub score: f32,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Default)]
struct StoreInner {
    index: Option<FlatIndex>,
    texts: HashMap<i64, String>,
    metadata: HashMap<i64, ChunkMetadata>,
    /// Internal slot -> chunk_id, append-only between rebuilds.
    id_map: Vec<i64>,
    next_id: i64,
}

#[derive(Serialize, Deserialize)]
struct PersistedMeta {
    texts: HashMap<i64, String>,
    metadata: HashMap<i64, ChunkMetadata>,
    id_map: Vec<i64>,
    next_id: i64,
    dimension: usize,
}

/// Persistent inner-product vector store with per-chunk text and metadata.
///
/// Readers share access; mutations (`add`, `delete_by_doc`, `persist`,
/// `clear`) take the write lock and exclude them.
pub struct VectorStore {
    persist_dir: PathBuf,
    inner: RwLock<StoreInner>,
}

impl VectorStore {
    /// Open a store rooted at `persist_dir`, loading any previously persisted
    /// state. Partial or corrupt state is treated as an empty store.
    pub fn open(persist_dir: impl Into<PathBuf>) -> Self {
        let persist_dir = persist_dir.into();
        if let Err(e) = fs::create_dir_all(&persist_dir) {
            warn!("Failed to create persist dir {:?}: {}", persist_dir, e);
        }

        let inner = match load_state(&persist_dir) {
            Ok(Some(inner)) => {
                info!(
                    "Loaded vector store with {} vectors from {:?}",
                    inner.id_map.len(),
                    persist_dir
                );
                inner
            }
            Ok(None) => StoreInner::default(),
            Err(e) => {
                warn!("Failed to load vector store, starting empty: {}", e);
                StoreInner::default()
            }
        };

        Self {
            persist_dir,
            inner: RwLock::new(inner),
        }
    }

    /// Add embeddings with their texts and metadata. Returns the assigned
    /// chunk ids, honoring any ids supplied by the caller.
    pub fn add(
        &self,
        embeddings: &[Vec<f32>],
        texts: &[String],
        metadatas: &[ChunkMetadata],
    ) -> Result<Vec<i64>> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        if embeddings.len() != texts.len() || embeddings.len() != metadatas.len() {
            return Err(EngineError::InvalidInput(
                "embeddings, texts, and metadatas must have the same length".to_string(),
            ));
        }

        let mut inner = self.inner.write();

        let dim = embeddings[0].len();
        if dim == 0 {
            return Err(EngineError::InvalidInput("empty embedding vector".to_string()));
        }

        // Dimension is fixed once the index holds vectors.
        let index_dim = inner.index.as_ref().map(|i| i.dimension());
        match index_dim {
            Some(expected) if !inner.index.as_ref().unwrap().is_empty() && expected != dim => {
                return Err(EngineError::DimensionMismatch {
                    expected,
                    actual: dim,
                });
            }
            _ => {}
        }

        // Validate every row before mutating so a failed add leaves the
        // store unchanged.
        for row in embeddings {
            if row.len() != dim {
                return Err(EngineError::DimensionMismatch {
                    expected: dim,
                    actual: row.len(),
                });
            }
        }

        if inner.index.as_ref().map_or(true, |i| i.is_empty()) {
            inner.index = Some(FlatIndex::new(dim));
        }

        let mut chunk_ids = Vec::with_capacity(embeddings.len());
        for ((row, text), meta) in embeddings.iter().zip(texts).zip(metadatas) {
            let chunk_id = meta.chunk_id.unwrap_or(inner.next_id);
            inner.next_id = inner.next_id.max(chunk_id + 1);

            let mut stored = meta.clone();
            stored.chunk_id = Some(chunk_id);

            inner.index.as_mut().unwrap().add(row)?;
            inner.id_map.push(chunk_id);
            inner.texts.insert(chunk_id, text.clone());
            inner.metadata.insert(chunk_id, stored);
            chunk_ids.push(chunk_id);
        }

        debug!(
            "Added {} vectors, store now holds {}",
            embeddings.len(),
            inner.id_map.len()
        );

        Ok(chunk_ids)
    }

    /// Top-k search with optional document filter and score floor. When a
    /// filter is supplied the index is over-fetched (3k) before filtering.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        doc_filter: Option<&[i64]>,
        min_score: f32,
    ) -> Result<Vec<SearchResult>> {
        let inner = self.inner.read();

        let index = match inner.index.as_ref() {
            Some(index) if !index.is_empty() => index,
            _ => return Ok(Vec::new()),
        };

        let search_k = if doc_filter.is_some() { k * 3 } else { k };
        let search_k = search_k.min(index.len());

        let hits = index.search(query, search_k)?;

        let mut results = Vec::new();
        for (slot, score) in hits {
            let Some(&chunk_id) = inner.id_map.get(slot) else {
                continue;
            };
            let Some(metadata) = inner.metadata.get(&chunk_id) else {
                continue;
            };
            if score < min_score {
                continue;
            }
            if let Some(filter) = doc_filter {
                if !filter.contains(&metadata.doc_id) {
                    continue;
                }
            }

            results.push(SearchResult {
                chunk_id,
                doc_id: metadata.doc_id,
                score,
                text: inner.texts.get(&chunk_id).cloned().unwrap_or_default(),
                metadata: metadata.clone(),
            });

            if results.len() >= k {
                break;
            }
        }

        Ok(results)
    }

    /// Delete all vectors belonging to a document. The underlying index has
    /// no in-place deletion, so the remaining vectors are rebuilt into a
    /// fresh index; chunk ids are preserved. Returns the number removed.
    pub fn delete_by_doc(&self, doc_id: i64) -> usize {
        let mut inner = self.inner.write();

        let Some(index) = inner.index.as_ref() else {
            return 0;
        };
        if index.is_empty() {
            return 0;
        }

        let keep: HashSet<i64> = inner
            .metadata
            .iter()
            .filter(|(_, meta)| meta.doc_id != doc_id)
            .map(|(id, _)| *id)
            .collect();
        if keep.len() == inner.metadata.len() {
            return 0;
        }
        let removed = inner.metadata.len() - keep.len();

        let dimension = index.dimension();
        let mut new_index = FlatIndex::new(dimension);
        let mut new_id_map = Vec::with_capacity(keep.len());

        for (slot, &chunk_id) in inner.id_map.iter().enumerate() {
            if keep.contains(&chunk_id) {
                if let Some(row) = index.reconstruct(slot) {
                    // Row dimension is the index dimension; cannot fail.
                    let _ = new_index.add(row);
                    new_id_map.push(chunk_id);
                }
            }
        }

        inner.index = Some(new_index);
        inner.id_map = new_id_map;
        inner.texts.retain(|id, _| keep.contains(id));
        inner.metadata.retain(|id, _| keep.contains(id));

        info!("Deleted {} vectors for doc_id={}", removed, doc_id);
        removed
    }

    /// Persist the index and metadata atomically: each file is written to a
    /// temp path in the same directory and renamed into place, under the
    /// write lock so concurrent readers observe pre- or post-state only.
    pub fn persist(&self) -> Result<()> {
        let inner = self.inner.write();

        let (dimension, rows): (usize, &[f32]) = match inner.index.as_ref() {
            Some(index) => (index.dimension(), index.as_rows()),
            None => (0, &[]),
        };

        let mut index_bytes = Vec::with_capacity(4 + rows.len() * 4);
        index_bytes.extend_from_slice(&(dimension as u32).to_le_bytes());
        for value in rows {
            index_bytes.extend_from_slice(&value.to_le_bytes());
        }
        write_atomic(&self.persist_dir.join(INDEX_FILE), &index_bytes)?;

        let meta = PersistedMeta {
            texts: inner.texts.clone(),
            metadata: inner.metadata.clone(),
            id_map: inner.id_map.clone(),
            next_id: inner.next_id,
            dimension,
        };
        let meta_bytes = serde_json::to_vec(&meta)
            .map_err(|e| EngineError::Persistence(format!("serialize metadata: {}", e)))?;
        write_atomic(&self.persist_dir.join(META_FILE), &meta_bytes)?;

        info!("Persisted vector store with {} vectors", inner.id_map.len());
        Ok(())
    }

    /// Drop all vectors and remove the persisted files.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = StoreInner::default();

        for file in [INDEX_FILE, META_FILE] {
            let path = self.persist_dir.join(file);
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove {:?}: {}", path, e);
                }
            }
        }
        info!("Vector store cleared");
    }

    pub fn count(&self) -> usize {
        self.inner.read().id_map.len()
    }

    pub fn count_for_doc(&self, doc_id: i64) -> usize {
        self.inner
            .read()
            .metadata
            .values()
            .filter(|meta| meta.doc_id == doc_id)
            .count()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.inner.read().index.as_ref().map(|i| i.dimension())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, bytes)
        .map_err(|e| EngineError::Persistence(format!("write {:?}: {}", tmp, e)))?;
    fs::rename(&tmp, path)
        .map_err(|e| EngineError::Persistence(format!("rename {:?}: {}", path, e)))?;
    Ok(())
}

fn load_state(persist_dir: &Path) -> Result<Option<StoreInner>> {
    let index_path = persist_dir.join(INDEX_FILE);
    let meta_path = persist_dir.join(META_FILE);
    if !index_path.exists() || !meta_path.exists() {
        return Ok(None);
    }

    let index_bytes = fs::read(&index_path)
        .map_err(|e| EngineError::Persistence(format!("read {:?}: {}", index_path, e)))?;
    if index_bytes.len() < 4 {
        return Err(EngineError::Persistence("index file truncated".to_string()));
    }
    let dimension = u32::from_le_bytes([
        index_bytes[0],
        index_bytes[1],
        index_bytes[2],
        index_bytes[3],
    ]) as usize;

    let meta_bytes = fs::read(&meta_path)
        .map_err(|e| EngineError::Persistence(format!("read {:?}: {}", meta_path, e)))?;
    let meta: PersistedMeta = serde_json::from_slice(&meta_bytes)
        .map_err(|e| EngineError::Persistence(format!("parse metadata: {}", e)))?;

    if dimension == 0 {
        return Ok(Some(StoreInner {
            index: None,
            texts: meta.texts,
            metadata: meta.metadata,
            id_map: meta.id_map,
            next_id: meta.next_id,
        }));
    }

    let payload = &index_bytes[4..];
    if payload.len() % 4 != 0 {
        return Err(EngineError::Persistence("index payload misaligned".to_string()));
    }
    let rows: Vec<f32> = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let index = FlatIndex::from_rows(dimension, rows)?;

    if index.len() != meta.id_map.len() {
        return Err(EngineError::Persistence(format!(
            "index holds {} vectors but id map has {}",
            index.len(),
            meta.id_map.len()
        )));
    }

    Ok(Some(StoreInner {
        index: Some(index),
        texts: meta.texts,
        metadata: meta.metadata,
        id_map: meta.id_map,
        next_id: meta.next_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chunk::ChunkType;
    use tempfile::TempDir;

    fn meta(doc_id: i64, chunk_index: usize) -> ChunkMetadata {
        ChunkMetadata {
            doc_id,
            chunk_id: None,
            chunk_index,
            page_number: None,
            chunk_type: ChunkType::Text,
            section_title: None,
            token_count: 10,
        }
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_add_and_search() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());

        let embeddings = vec![unit(4, 0), unit(4, 1), unit(4, 2)];
        let texts = vec!["first".to_string(), "second".to_string(), "third".to_string()];
        let metadatas = vec![meta(1, 0), meta(1, 1), meta(2, 0)];

        let ids = store.add(&embeddings, &texts, &metadatas).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(store.count(), 3);

        let results = store.search(&unit(4, 1), 2, None, 0.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, 1);
        assert_eq!(results[0].text, "second");
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn test_search_respects_k_and_min_score() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());

        let embeddings = vec![unit(2, 0), vec![0.6, 0.8], unit(2, 1)];
        let texts = vec!["a".into(), "b".into(), "c".into()];
        let metadatas = vec![meta(1, 0), meta(1, 1), meta(1, 2)];
        store.add(&embeddings, &texts, &metadatas).unwrap();

        let results = store.search(&unit(2, 0), 10, None, 0.5).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score >= 0.5));

        let results = store.search(&unit(2, 0), 1, None, 0.0).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_doc_filter() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());

        let embeddings = vec![unit(4, 0), unit(4, 1), unit(4, 2), unit(4, 3), vec![0.5; 4]];
        let texts = (0..5).map(|i| format!("chunk {}", i)).collect::<Vec<_>>();
        let metadatas = vec![meta(1, 0), meta(2, 0), meta(2, 1), meta(3, 0), meta(3, 1)];
        store.add(&embeddings, &texts, &metadatas).unwrap();

        let results = store.search(&unit(4, 1), 5, Some(&[2]), 0.0).unwrap();
        assert!(!results.is_empty());
        assert!(results.len() <= 5);
        assert!(results.iter().all(|r| r.doc_id == 2));

        let results = store.search(&unit(4, 1), 1, Some(&[2]), 0.0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, 2);
    }

    #[test]
    fn test_supplied_ids_advance_next_id() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());

        let mut supplied = meta(1, 0);
        supplied.chunk_id = Some(100);
        store
            .add(&[unit(2, 0)], &["a".into()], &[supplied])
            .unwrap();

        let ids = store.add(&[unit(2, 1)], &["b".into()], &[meta(1, 1)]).unwrap();
        assert_eq!(ids, vec![101]);
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());

        store
            .add(&[unit(4, 0)], &["a".into()], &[meta(1, 0)])
            .unwrap();

        let err = store
            .add(&[unit(3, 0)], &["b".into()], &[meta(1, 1)])
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 4, actual: 3 }));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_delete_by_doc() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());

        let embeddings = vec![unit(4, 0), unit(4, 1), unit(4, 2)];
        let texts = vec!["a".into(), "b".into(), "c".into()];
        let metadatas = vec![meta(1, 0), meta(1, 1), meta(2, 0)];
        let ids = store.add(&embeddings, &texts, &metadatas).unwrap();

        let removed = store.delete_by_doc(1);
        assert_eq!(removed, 2);
        assert_eq!(store.count(), 1);
        assert_eq!(store.count_for_doc(1), 0);
        assert_eq!(store.count_for_doc(2), 1);

        // Surviving chunk keeps its id and remains searchable.
        let results = store.search(&unit(4, 2), 5, None, 0.0).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, ids[2]);
        assert!(results.iter().all(|r| r.doc_id != 1));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let query = vec![0.6, 0.8];

        let (count, scores): (usize, Vec<(i64, f32)>) = {
            let store = VectorStore::open(dir.path());
            let embeddings = vec![unit(2, 0), unit(2, 1), vec![0.8, 0.6]];
            let texts = vec!["a".into(), "b".into(), "c".into()];
            let mut m0 = meta(1, 0);
            m0.page_number = Some(3);
            m0.section_title = Some("Intro".into());
            let metadatas = vec![m0, meta(1, 1), meta(2, 0)];
            store.add(&embeddings, &texts, &metadatas).unwrap();
            store.persist().unwrap();

            let results = store.search(&query, 3, None, -1.0).unwrap();
            (
                store.count(),
                results.iter().map(|r| (r.chunk_id, r.score)).collect(),
            )
        };

        let reloaded = VectorStore::open(dir.path());
        assert_eq!(reloaded.count(), count);
        assert_eq!(reloaded.dimension(), Some(2));

        let results = reloaded.search(&query, 3, None, -1.0).unwrap();
        let reloaded_scores: Vec<(i64, f32)> =
            results.iter().map(|r| (r.chunk_id, r.score)).collect();
        assert_eq!(reloaded_scores, scores);

        let intro = results.iter().find(|r| r.chunk_id == 0).unwrap();
        assert_eq!(intro.metadata.page_number, Some(3));
        assert_eq!(intro.metadata.section_title.as_deref(), Some("Intro"));

        // New ids continue after the reloaded next_id.
        let ids = reloaded
            .add(&[unit(2, 0)], &["d".into()], &[meta(3, 0)])
            .unwrap();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_corrupt_state_loads_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"xx").unwrap();
        fs::write(dir.path().join(META_FILE), b"not json").unwrap();

        let store = VectorStore::open(dir.path());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_clear_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());
        store
            .add(&[unit(2, 0)], &["a".into()], &[meta(1, 0)])
            .unwrap();
        store.persist().unwrap();
        assert!(dir.path().join(INDEX_FILE).exists());

        store.clear();
        assert_eq!(store.count(), 0);
        assert!(!dir.path().join(INDEX_FILE).exists());
        assert!(!dir.path().join(META_FILE).exists());
    }

    #[test]
    fn test_search_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(dir.path());
        let results = store.search(&[1.0, 0.0], 5, None, 0.0).unwrap();
        assert!(results.is_empty());
    }
}
