//! Gallery batch orchestration.
//!
//! Items are processed sequentially. Every item ends in exactly one of
//! `processed` (completed or no_faces) or `failed`; failures never escape
//! [`process_gallery`].

use crate::pipeline::{ImagePipeline, PipelineError};
use crate::types::FaceResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest error message recorded per failed item, in characters.
pub const MAX_ERROR_CHARS: usize = 500;

/// One gallery image: identity plus where to fetch it from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub media_id: String,
    #[serde(alias = "r2_url")]
    pub source_url: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("download failed: HTTP {0}")]
    Status(u16),
    #[error("download failed: {0}")]
    Transport(String),
}

/// Where gallery image bytes come from.
pub trait ImageSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

impl<T: ImageSource + ?Sized> ImageSource for Box<T> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(url)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    NoFaces,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Completed => "completed",
            JobStatus::NoFaces => "no_faces",
            JobStatus::Failed => "failed",
        }
    }
}

/// Terminal job-status record for one media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub faces_found: usize,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobUpdate {
    pub fn completed(faces_found: usize) -> Self {
        let now = Utc::now();
        Self {
            status: JobStatus::Completed,
            faces_found,
            error_message: None,
            completed_at: Some(now),
            updated_at: now,
        }
    }

    pub fn no_faces() -> Self {
        let now = Utc::now();
        Self {
            status: JobStatus::NoFaces,
            faces_found: 0,
            error_message: None,
            completed_at: Some(now),
            updated_at: now,
        }
    }

    pub fn failed(error_message: String) -> Self {
        Self {
            status: JobStatus::Failed,
            faces_found: 0,
            error_message: Some(error_message),
            completed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// The three logical writes the orchestrator performs.
pub trait FaceStore {
    fn insert_face_embeddings(&mut self, event_id: &str, media_id: &str, faces: &[FaceResult])
        -> Result<(), StoreError>;
    fn update_job_status(&mut self, media_id: &str, update: &JobUpdate) -> Result<(), StoreError>;
    fn update_face_count(&mut self, media_id: &str, face_count: usize) -> Result<(), StoreError>;
}

impl<T: FaceStore + ?Sized> FaceStore for Box<T> {
    fn insert_face_embeddings(
        &mut self,
        event_id: &str,
        media_id: &str,
        faces: &[FaceResult],
    ) -> Result<(), StoreError> {
        (**self).insert_face_embeddings(event_id, media_id, faces)
    }

    fn update_job_status(&mut self, media_id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        (**self).update_job_status(media_id, update)
    }

    fn update_face_count(&mut self, media_id: &str, face_count: usize) -> Result<(), StoreError> {
        (**self).update_face_count(media_id, face_count)
    }
}

/// Unrecovered per-item failure.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { faces: usize },
    NoFaces,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub media_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub total: usize,
    pub processed: usize,
    pub faces_found: usize,
    pub no_faces: usize,
    pub failed: usize,
    pub errors: Vec<ItemFailure>,
}

impl ProcessingSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, media_id: &str, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed { faces } => {
                self.processed += 1;
                self.faces_found += faces;
            }
            ItemOutcome::NoFaces => {
                self.processed += 1;
                self.no_faces += 1;
            }
            ItemOutcome::Failed { error } => {
                self.failed += 1;
                self.errors.push(ItemFailure {
                    media_id: media_id.to_string(),
                    error: error.clone(),
                });
            }
        }
    }
}

/// Keep at most [`MAX_ERROR_CHARS`] characters, cutting on a char boundary.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_CHARS).collect()
}

/// Fetch once, and once more if the first attempt fails.
pub fn fetch_with_retry<S: ImageSource + ?Sized>(source: &S, url: &str) -> Result<Vec<u8>, FetchError> {
    match source.fetch(url) {
        Ok(bytes) => Ok(bytes),
        Err(first) => {
            tracing::debug!(url, error = %first, "fetch failed, retrying once");
            source.fetch(url)
        }
    }
}

fn run_item<P, S>(pipeline: &mut P, source: &S, item: &MediaItem) -> Result<Vec<FaceResult>, ItemError>
where
    P: ImagePipeline + ?Sized,
    S: ImageSource + ?Sized,
{
    let bytes = fetch_with_retry(source, &item.source_url)?;
    Ok(pipeline.process_single_image(&bytes)?)
}

/// Process one item end to end and write its terminal status.
///
/// Store failures are logged and never change the outcome.
pub fn process_item<P, S, W>(
    pipeline: &mut P,
    source: &S,
    store: &mut W,
    event_id: &str,
    item: &MediaItem,
) -> ItemOutcome
where
    P: ImagePipeline + ?Sized,
    S: ImageSource + ?Sized,
    W: FaceStore + ?Sized,
{
    let media_id = item.media_id.as_str();

    let faces = match run_item(pipeline, source, item) {
        Ok(faces) => faces,
        Err(e) => {
            let error = truncate_error(&e.to_string());
            tracing::error!(media_id, error = %error, "error processing media");
            if let Err(store_err) = store.update_job_status(media_id, &JobUpdate::failed(error.clone())) {
                tracing::warn!(media_id, error = %store_err, "failed to record failed status");
            }
            return ItemOutcome::Failed { error };
        }
    };

    if faces.is_empty() {
        if let Err(e) = store.update_job_status(media_id, &JobUpdate::no_faces()) {
            tracing::warn!(media_id, error = %e, "failed to record no_faces status");
        }
        if let Err(e) = store.update_face_count(media_id, 0) {
            tracing::warn!(media_id, error = %e, "failed to update face count");
        }
        tracing::info!(media_id, "no faces found");
        return ItemOutcome::NoFaces;
    }

    let count = faces.len();
    if let Err(e) = store.insert_face_embeddings(event_id, media_id, &faces) {
        tracing::warn!(media_id, error = %e, "failed to insert face embeddings");
    }
    if let Err(e) = store.update_job_status(media_id, &JobUpdate::completed(count)) {
        tracing::warn!(media_id, error = %e, "failed to record completed status");
    }
    if let Err(e) = store.update_face_count(media_id, count) {
        tracing::warn!(media_id, error = %e, "failed to update face count");
    }
    tracing::info!(media_id, faces = count, "media processed");
    ItemOutcome::Completed { faces: count }
}

/// Run every item in order and summarize.
pub fn process_gallery<P, S, W>(
    pipeline: &mut P,
    source: &S,
    store: &mut W,
    event_id: &str,
    items: &[MediaItem],
) -> ProcessingSummary
where
    P: ImagePipeline + ?Sized,
    S: ImageSource + ?Sized,
    W: FaceStore + ?Sized,
{
    let mut summary = ProcessingSummary::new(items.len());
    for item in items {
        let outcome = process_item(pipeline, source, store, event_id, item);
        summary.record(&item.media_id, &outcome);
    }

    tracing::info!(
        event_id,
        total = summary.total,
        processed = summary.processed,
        faces_found = summary.faces_found,
        no_faces = summary.no_faces,
        failed = summary.failed,
        "gallery batch finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeError;
    use crate::types::Embedding;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn face_result(idx: usize) -> FaceResult {
        FaceResult {
            face_index: idx,
            embedding: Embedding::normalized(vec![1.0; 4], None),
            confidence: 0.9,
            bbox: [0, 0, 10, 10],
        }
    }

    /// Maps image bytes (the "decoded" content) to a canned face count.
    struct CannedPipeline {
        calls: usize,
    }

    impl ImagePipeline for CannedPipeline {
        fn process_single_image(&mut self, bytes: &[u8]) -> Result<Vec<FaceResult>, PipelineError> {
            self.calls += 1;
            match bytes {
                b"bad" => Err(PipelineError::Decode(DecodeError::Empty)),
                _ => {
                    let n = bytes.first().map(|b| (*b - b'0') as usize).unwrap_or(0);
                    Ok((0..n).map(face_result).collect())
                }
            }
        }
    }

    /// Serves bytes per URL; `fail_times` counts down failures per URL.
    struct MapSource {
        bodies: HashMap<String, Vec<u8>>,
        fail_times: RefCell<HashMap<String, usize>>,
        calls: RefCell<Vec<String>>,
    }

    impl MapSource {
        fn new(bodies: &[(&str, &[u8])]) -> Self {
            Self {
                bodies: bodies.iter().map(|(u, b)| (u.to_string(), b.to_vec())).collect(),
                fail_times: RefCell::new(HashMap::new()),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn failing(self, url: &str, times: usize) -> Self {
            self.fail_times.borrow_mut().insert(url.to_string(), times);
            self
        }
    }

    impl ImageSource for MapSource {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.borrow_mut().push(url.to_string());
            if let Some(left) = self.fail_times.borrow_mut().get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::Status(503));
                }
            }
            self.bodies.get(url).cloned().ok_or(FetchError::Status(404))
        }
    }

    #[derive(Default)]
    struct MemStore {
        embeddings: Vec<(String, String, usize)>,
        statuses: HashMap<String, JobUpdate>,
        face_counts: HashMap<String, usize>,
        fail_status_writes: bool,
    }

    impl FaceStore for MemStore {
        fn insert_face_embeddings(
            &mut self,
            event_id: &str,
            media_id: &str,
            faces: &[FaceResult],
        ) -> Result<(), StoreError> {
            for f in faces {
                self.embeddings.push((event_id.into(), media_id.into(), f.face_index));
            }
            Ok(())
        }

        fn update_job_status(&mut self, media_id: &str, update: &JobUpdate) -> Result<(), StoreError> {
            if self.fail_status_writes {
                return Err(StoreError::backend(std::io::Error::other("db down")));
            }
            self.statuses.insert(media_id.into(), update.clone());
            Ok(())
        }

        fn update_face_count(&mut self, media_id: &str, face_count: usize) -> Result<(), StoreError> {
            self.face_counts.insert(media_id.into(), face_count);
            Ok(())
        }
    }

    fn item(id: &str) -> MediaItem {
        MediaItem {
            media_id: id.into(),
            source_url: format!("https://cdn/{id}"),
        }
    }

    #[test]
    fn test_failed_fetch_is_isolated_to_its_item() {
        let source = MapSource::new(&[("https://cdn/m1", b"2"), ("https://cdn/m3", b"0")]);
        let mut pipeline = CannedPipeline { calls: 0 };
        let mut store = MemStore::default();

        let summary = process_gallery(
            &mut pipeline,
            &source,
            &mut store,
            "evt",
            &[item("m1"), item("m2"), item("m3")],
        );

        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.faces_found, 2);
        assert_eq!(summary.no_faces, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].media_id, "m2");
        assert_eq!(summary.errors[0].error, "download failed: HTTP 404");

        // m2 was fetched twice, the pipeline never saw it.
        let m2_fetches = source.calls.borrow().iter().filter(|u| u.ends_with("m2")).count();
        assert_eq!(m2_fetches, 2);
        assert_eq!(pipeline.calls, 2);

        assert_eq!(store.statuses["m1"].status, JobStatus::Completed);
        assert_eq!(store.statuses["m1"].faces_found, 2);
        assert_eq!(store.statuses["m2"].status, JobStatus::Failed);
        assert_eq!(store.statuses["m3"].status, JobStatus::NoFaces);
        assert_eq!(store.face_counts["m1"], 2);
        assert_eq!(store.face_counts["m3"], 0);
        assert!(!store.face_counts.contains_key("m2"));
        assert_eq!(
            store.embeddings,
            vec![("evt".into(), "m1".into(), 0), ("evt".into(), "m1".into(), 1)]
        );
    }

    #[test]
    fn test_fetch_retry_recovers_after_one_failure() {
        let source = MapSource::new(&[("https://cdn/m1", b"1")]).failing("https://cdn/m1", 1);
        let mut store = MemStore::default();
        let summary = process_gallery(&mut CannedPipeline { calls: 0 }, &source, &mut store, "evt", &[item("m1")]);

        assert_eq!(summary.failed, 0);
        assert_eq!(summary.faces_found, 1);
        assert_eq!(source.calls.borrow().len(), 2);
    }

    #[test]
    fn test_fetch_gives_up_after_second_failure() {
        let source = MapSource::new(&[("https://cdn/m1", b"1")]).failing("https://cdn/m1", 2);
        let err = fetch_with_retry(&source, "https://cdn/m1").unwrap_err();
        assert_eq!(err, FetchError::Status(503));
        assert_eq!(source.calls.borrow().len(), 2);
    }

    #[test]
    fn test_decode_failure_counts_as_failed() {
        let source = MapSource::new(&[("https://cdn/m1", b"bad")]);
        let mut store = MemStore::default();
        let summary = process_gallery(&mut CannedPipeline { calls: 0 }, &source, &mut store, "evt", &[item("m1")]);

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 0);
        assert!(summary.errors[0].error.contains("decode"));
        assert_eq!(store.statuses["m1"].error_message, Some(summary.errors[0].error.clone()));
    }

    #[test]
    fn test_status_write_failure_is_swallowed() {
        let source = MapSource::new(&[("https://cdn/m2", b"1")]);
        let mut store = MemStore {
            fail_status_writes: true,
            ..MemStore::default()
        };
        let summary = process_gallery(
            &mut CannedPipeline { calls: 0 },
            &source,
            &mut store,
            "evt",
            &[item("m1"), item("m2")],
        );

        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.faces_found, 1);
        assert!(store.statuses.is_empty());
    }

    #[test]
    fn test_truncate_error_exactly_500_chars() {
        let long = "x".repeat(1200);
        assert_eq!(truncate_error(&long).chars().count(), 500);
        assert_eq!(truncate_error("short"), "short");

        let wide = "é".repeat(600);
        let cut = truncate_error(&wide);
        assert_eq!(cut.chars().count(), 500);
    }

    #[test]
    fn test_summary_records_truncated_message() {
        struct LongFailure;
        impl ImageSource for LongFailure {
            fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
                Err(FetchError::Transport("e".repeat(900)))
            }
        }
        let summary = process_gallery(
            &mut CannedPipeline { calls: 0 },
            &LongFailure,
            &mut MemStore::default(),
            "evt",
            &[item("m1")],
        );
        assert_eq!(summary.errors[0].error.chars().count(), 500);
    }

    #[test]
    fn test_empty_batch() {
        let summary = process_gallery(
            &mut CannedPipeline { calls: 0 },
            &MapSource::new(&[]),
            &mut MemStore::default(),
            "evt",
            &[],
        );
        assert_eq!(summary, ProcessingSummary::new(0));
    }

    #[test]
    fn test_media_item_accepts_r2_url_alias() {
        let item: MediaItem = serde_json::from_str(r#"{"media_id":"a","r2_url":"https://x/a.jpg"}"#).unwrap();
        assert_eq!(item.source_url, "https://x/a.jpg");
        let item: MediaItem = serde_json::from_str(r#"{"media_id":"a","source_url":"https://x/b.jpg"}"#).unwrap();
        assert_eq!(item.source_url, "https://x/b.jpg");
    }

    #[test]
    fn test_summary_serializes_field_names() {
        let mut summary = ProcessingSummary::new(1);
        summary.record("m1", &ItemOutcome::Failed { error: "boom".into() });
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["errors"][0]["media_id"], "m1");
        assert_eq!(json["errors"][0]["error"], "boom");
    }
}
