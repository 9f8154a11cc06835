//! SQLite persistence for face embeddings, job statuses and media face counts.

use chrono::Utc;
use facetrace_core::search::{FaceCandidate, FaceIndex, SearchConfig};
use facetrace_core::{Embedding, FaceResult, FaceStore, JobUpdate, StoreError};
use rusqlite::{params, Connection};
#[cfg(test)]
use rusqlite::OptionalExtension;
use std::path::Path;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS face_embeddings (
    id          TEXT PRIMARY KEY,
    media_id    TEXT NOT NULL,
    event_id    TEXT NOT NULL,
    face_index  INTEGER NOT NULL,
    embedding   BLOB NOT NULL,
    confidence  REAL NOT NULL,
    bbox_x1     INTEGER NOT NULL,
    bbox_y1     INTEGER NOT NULL,
    bbox_x2     INTEGER NOT NULL,
    bbox_y2     INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_face_embeddings_event ON face_embeddings(event_id);

CREATE TABLE IF NOT EXISTS face_processing_jobs (
    media_id      TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    faces_found   INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    completed_at  TEXT,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS media (
    id          TEXT PRIMARY KEY,
    face_count  INTEGER NOT NULL DEFAULT 0
);
";

const SCHEMA_VERSION: u32 = 1;

pub struct SqliteStore {
    conn: Connection,
    scoring: SearchConfig,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(path = %parent.display(), error = %e, "could not create database directory");
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        let version: u32 = conn.query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA_V1)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            tracing::info!(from = version, to = SCHEMA_VERSION, "database schema migrated");
        }
        Ok(Self {
            conn,
            scoring: SearchConfig::default(),
        })
    }
}

/// f32 little-endian, 4 bytes per component.
fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl FaceStore for SqliteStore {
    fn insert_face_embeddings(
        &mut self,
        event_id: &str,
        media_id: &str,
        faces: &[FaceResult],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(StoreError::backend)?;
        let now = Utc::now().to_rfc3339();
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO face_embeddings
                     (id, media_id, event_id, face_index, embedding, confidence,
                      bbox_x1, bbox_y1, bbox_x2, bbox_y2, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )
                .map_err(StoreError::backend)?;
            for face in faces {
                let [x1, y1, x2, y2] = face.bbox;
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    media_id,
                    event_id,
                    face.face_index as i64,
                    encode_embedding(&face.embedding.values),
                    face.confidence as f64,
                    x1,
                    y1,
                    x2,
                    y2,
                    now,
                ])
                .map_err(StoreError::backend)?;
            }
        }
        tx.commit().map_err(StoreError::backend)?;
        tracing::debug!(media_id, event_id, count = faces.len(), "face embeddings stored");
        Ok(())
    }

    fn update_job_status(&mut self, media_id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO face_processing_jobs
                 (media_id, status, faces_found, error_message, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(media_id) DO UPDATE SET
                    status = excluded.status,
                    faces_found = excluded.faces_found,
                    error_message = excluded.error_message,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at",
                params![
                    media_id,
                    update.status.as_str(),
                    update.faces_found as i64,
                    update.error_message,
                    update.completed_at.map(|t| t.to_rfc3339()),
                    update.updated_at.to_rfc3339(),
                ],
            )
            .map_err(StoreError::backend)?;
        Ok(())
    }

    fn update_face_count(&mut self, media_id: &str, face_count: usize) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO media (id, face_count) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET face_count = excluded.face_count",
                params![media_id, face_count as i64],
            )
            .map_err(StoreError::backend)?;
        Ok(())
    }
}

impl FaceIndex for SqliteStore {
    fn search(
        &self,
        query: &Embedding,
        event_id: &str,
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<FaceCandidate>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, media_id, embedding FROM face_embeddings WHERE event_id = ?1")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(StoreError::backend)?;

        let mut candidates = Vec::new();
        for row in rows {
            let (face_id, media_id, blob) = row.map_err(StoreError::backend)?;
            let embedding = Embedding {
                values: decode_embedding(&blob),
                model_version: None,
            };
            let score = self.scoring.combined_score(query, &embedding);
            if score >= threshold {
                candidates.push(FaceCandidate {
                    face_id,
                    media_id,
                    embedding,
                    score,
                });
            }
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(max_results);
        Ok(candidates)
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Status string recorded for a media item, if any.
    pub fn job_status(&self, media_id: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row(
                "SELECT status FROM face_processing_jobs WHERE media_id = ?1",
                params![media_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::backend)
    }

    pub fn face_count(&self, media_id: &str) -> Result<Option<usize>, StoreError> {
        self.conn
            .query_row("SELECT face_count FROM media WHERE id = ?1", params![media_id], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map(|n| n.map(|n| n as usize))
            .map_err(StoreError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrace_core::search::refined_search;

    fn face(idx: usize, values: Vec<f32>) -> FaceResult {
        FaceResult {
            face_index: idx,
            embedding: Embedding::normalized(values, None),
            confidence: 0.87,
            bbox: [1, 2, 30, 40],
        }
    }

    #[test]
    fn test_migration_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.conn;
        // Running init again on a migrated connection is a no-op.
        let store = SqliteStore::init(conn).unwrap();
        let version: u32 = store
            .conn
            .query_row("SELECT user_version FROM pragma_user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_embedding_blob_layout() {
        let bytes = encode_embedding(&[1.0, -2.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&bytes), vec![1.0, -2.5]);
    }

    #[test]
    fn test_insert_and_search_embeddings() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_face_embeddings("evt", "m1", &[face(0, vec![1.0, 0.0, 0.0]), face(1, vec![0.0, 1.0, 0.0])])
            .unwrap();
        store.insert_face_embeddings("other", "m2", &[face(0, vec![1.0, 0.0, 0.0])]).unwrap();

        let query = Embedding::normalized(vec![1.0, 0.0, 0.0], None);
        let hits = store.search(&query, "evt", 0.29, 200).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].media_id, "m1");
        assert!((hits[0].score - 1.0).abs() < 1e-5);

        let (x1, conf): (i64, f64) = store
            .conn
            .query_row(
                "SELECT bbox_x1, confidence FROM face_embeddings WHERE media_id = 'm1' AND face_index = 0",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(x1, 1);
        assert!((conf - 0.87).abs() < 1e-6);
    }

    #[test]
    fn test_job_status_upsert() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.update_job_status("m1", &JobUpdate::failed("boom".into())).unwrap();
        assert_eq!(store.job_status("m1").unwrap().as_deref(), Some("failed"));

        store.update_job_status("m1", &JobUpdate::completed(3)).unwrap();
        assert_eq!(store.job_status("m1").unwrap().as_deref(), Some("completed"));

        let err: Option<String> = store
            .conn
            .query_row("SELECT error_message FROM face_processing_jobs WHERE media_id = 'm1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(err.is_none());
        assert!(store.job_status("missing").unwrap().is_none());
    }

    #[test]
    fn test_face_count_upsert() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.update_face_count("m1", 2).unwrap();
        store.update_face_count("m1", 0).unwrap();
        assert_eq!(store.face_count("m1").unwrap(), Some(0));
    }

    #[test]
    fn test_refined_search_over_store() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.insert_face_embeddings("evt", "m1", &[face(0, vec![1.0, 0.05, 0.0])]).unwrap();
        store.insert_face_embeddings("evt", "m2", &[face(0, vec![0.0, 0.0, 1.0])]).unwrap();

        let query = Embedding::normalized(vec![1.0, 0.0, 0.0], None);
        let result = refined_search(&store, &query, "evt", &SearchConfig::default()).unwrap();
        assert_eq!(result.tier1.len(), 1);
        assert_eq!(result.tier1[0].media_id, "m1");
        assert!(result.tier2.is_empty());
    }
}
