use crate::config::Config;
use crate::fetch::HttpImageSource;
use crate::store::SqliteStore;
use facetrace_core::search::{refined_search, FaceIndex, QueryRejection, SearchConfig, SearchResult};
use facetrace_core::selfie::{embed_selfie, SelfieOutcome};
use facetrace_core::{
    process_gallery, FaceStore, ImagePipeline, ImageSource, MediaItem, PipelineConfig, PipelineError,
    ProcessingSummary, StoreError,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model loading failed: {0}")]
    Load(#[from] facetrace_core::LoadError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Persistence the engine needs: job writes plus the search index.
pub trait GalleryStore: FaceStore + FaceIndex {}

impl<T: FaceStore + FaceIndex> GalleryStore for T {}

/// Everything the engine thread owns for its whole life.
pub struct EngineParts {
    pub pipeline: Box<dyn ImagePipeline + Send>,
    pub source: Box<dyn ImageSource + Send>,
    pub store: Box<dyn GalleryStore + Send>,
    pub search: SearchConfig,
}

/// Result of a gallery search for one selfie.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Matches { face_count: usize, result: SearchResult },
    /// The selfie's face was found but is not fit to search with.
    LowQuality(QueryRejection),
    NoFace,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    ProcessGallery {
        event_id: String,
        items: Vec<MediaItem>,
        reply: oneshot::Sender<ProcessingSummary>,
    },
    EmbedSelfie {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<SelfieOutcome, EngineError>>,
    },
    SearchFaces {
        image: Vec<u8>,
        event_id: String,
        reply: oneshot::Sender<Result<SearchOutcome, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Process a gallery batch. Per-item failures are inside the summary.
    pub async fn process_gallery(
        &self,
        event_id: String,
        items: Vec<MediaItem>,
    ) -> Result<ProcessingSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ProcessGallery {
                event_id,
                items,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Embed the largest face of a selfie.
    pub async fn embed_selfie(&self, image: Vec<u8>) -> Result<SelfieOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::EmbedSelfie { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Embed a selfie and search the event's gallery with it.
    pub async fn search_faces(&self, image: Vec<u8>, event_id: String) -> Result<SearchOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::SearchFaces {
                image,
                event_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load models, open the database and build the HTTP client. Fails fast if
/// any of them is unavailable.
pub fn load_parts(config: &Config) -> Result<EngineParts, EngineError> {
    let pipeline = facetrace_core::load_pipeline(
        &config.model_dir,
        config.intra_threads,
        PipelineConfig {
            crop_padding: config.crop_padding,
        },
    )?;

    let store = SqliteStore::open(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let source = HttpImageSource::new(Duration::from_secs(config.fetch_timeout_secs))?;

    Ok(EngineParts {
        pipeline: Box::new(pipeline),
        source: Box::new(source),
        store: Box::new(store),
        search: SearchConfig::default(),
    })
}

/// Spawn the engine on a dedicated OS thread.
///
/// Requests are served one at a time, in arrival order.
pub fn spawn_engine(parts: EngineParts) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    let EngineParts {
        mut pipeline,
        source,
        mut store,
        search,
    } = parts;

    std::thread::Builder::new()
        .name("facetrace-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ProcessGallery { event_id, items, reply } => {
                        let summary = process_gallery(&mut pipeline, &source, &mut store, &event_id, &items);
                        let _ = reply.send(summary);
                    }
                    EngineRequest::EmbedSelfie { image, reply } => {
                        let result = embed_selfie(&mut pipeline, &image).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::SearchFaces { image, event_id, reply } => {
                        let result = run_search(&mut pipeline, &store, &search, &image, &event_id);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_search<P, I>(
    pipeline: &mut P,
    index: &I,
    config: &SearchConfig,
    image: &[u8],
    event_id: &str,
) -> Result<SearchOutcome, EngineError>
where
    P: ImagePipeline + ?Sized,
    I: FaceIndex + ?Sized,
{
    match embed_selfie(pipeline, image)? {
        SelfieOutcome::NoFace => Ok(SearchOutcome::NoFace),
        SelfieOutcome::Face {
            embedding,
            confidence,
            face_count,
        } => {
            if let Err(rejection) = config.check_query(&embedding, confidence) {
                tracing::info!(event_id, confidence, reason = %rejection, "selfie rejected for search");
                return Ok(SearchOutcome::LowQuality(rejection));
            }
            let result = refined_search(index, &embedding, event_id, config)?;
            Ok(SearchOutcome::Matches { face_count, result })
        }
    }
}
