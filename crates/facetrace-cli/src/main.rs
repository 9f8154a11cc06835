use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use facetrace_core::pipeline::FaceOutcome;
use facetrace_core::{MediaItem, PipelineConfig};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facetrace", about = "facetrace face embedding CLI")]
struct Cli {
    /// Base URL of the facetraced worker
    #[arg(long, env = "FACETRACE_URL", default_value = "http://127.0.0.1:8000", global = true)]
    url: String,

    /// Shared secret sent with every request
    #[arg(long, env = "FACETRACE_SECRET", default_value = "", hide_env_values = true, global = true)]
    secret: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a gallery batch from a JSON manifest of {media_id, source_url}
    Gallery {
        #[arg(long)]
        event_id: String,
        manifest: PathBuf,
    },
    /// Embed the largest face in a selfie
    Selfie { image: PathBuf },
    /// Search an event's gallery for the person in a selfie
    Search {
        #[arg(long)]
        event_id: String,
        image: PathBuf,
    },
    /// Show worker status
    Status,
    /// Run the pipeline in-process on an image (no worker needed)
    Local {
        image: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
        #[arg(long, default_value_t = facetrace_core::alignment::FACE_CROP_PADDING)]
        padding: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let output = match cli.command {
        Commands::Gallery { event_id, manifest } => {
            let items = read_manifest(&manifest)?;
            eprintln!("Submitting {} media items for event {event_id}", items.len());
            let body = json!({ "media_items": items, "event_id": event_id, "secret": cli.secret });
            post(&client, &cli.url, "/process-gallery", &body).await?
        }
        Commands::Selfie { image } => {
            let body = json!({ "image_base64": encode_file(&image)?, "secret": cli.secret });
            post(&client, &cli.url, "/embed-selfie", &body).await?
        }
        Commands::Search { event_id, image } => {
            let body = json!({
                "image_base64": encode_file(&image)?,
                "event_id": event_id,
                "secret": cli.secret,
            });
            post(&client, &cli.url, "/search-faces", &body).await?
        }
        Commands::Status => {
            let url = endpoint(&cli.url, "/status");
            let response = client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("facetraced not reachable at {url}"))?;
            response.json::<Value>().await?
        }
        Commands::Local {
            image,
            model_dir,
            padding,
        } => {
            let model_dir = model_dir.unwrap_or_else(facetrace_core::default_model_dir);
            tokio::task::spawn_blocking(move || run_local(&image, &model_dir, padding)).await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

fn read_manifest(path: &Path) -> Result<Vec<MediaItem>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_manifest(&text)
}

fn parse_manifest(text: &str) -> Result<Vec<MediaItem>> {
    let items: Vec<MediaItem> = serde_json::from_str(text).context("manifest must be a JSON array of media items")?;
    if items.is_empty() {
        bail!("manifest contains no media items");
    }
    Ok(items)
}

fn encode_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

async fn post(client: &reqwest::Client, base: &str, path: &str, body: &Value) -> Result<Value> {
    let url = endpoint(base, path);
    tracing::debug!(url = %url, "sending request");
    let response = client
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("facetraced not reachable at {url}"))?;

    let status = response.status();
    let value: Value = response.json().await.context("invalid response body")?;
    if !status.is_success() {
        let message = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
        bail!("{path} failed ({status}): {message}");
    }
    Ok(value)
}

/// Load the models and report every detected face's outcome.
fn run_local(image: &Path, model_dir: &Path, padding: f64) -> Result<Value> {
    let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let mut pipeline = facetrace_core::load_pipeline(model_dir, 2, PipelineConfig { crop_padding: padding })?;
    let outcomes = pipeline.analyze(&bytes)?;

    let faces: Vec<Value> = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            FaceOutcome::Embedded(face) => json!({
                "face_index": face.face_index,
                "status": "embedded",
                "confidence": face.confidence,
                "bbox": face.bbox,
                "embedding_norm": face.embedding.norm(),
                "embedding_head": face.embedding.values.iter().take(8).collect::<Vec<_>>(),
            }),
            FaceOutcome::Skipped { face_index, reason } => json!({
                "face_index": face_index,
                "status": "skipped",
                "reason": reason.to_string(),
            }),
            FaceOutcome::Failed { face_index, error } => json!({
                "face_index": face_index,
                "status": "failed",
                "error": error.to_string(),
            }),
        })
        .collect();

    Ok(json!({ "image": image.display().to_string(), "faces": faces }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_join() {
        assert_eq!(endpoint("http://h:8000/", "/status"), "http://h:8000/status");
        assert_eq!(endpoint("http://h:8000", "/status"), "http://h:8000/status");
    }

    #[test]
    fn test_parse_manifest_accepts_both_url_keys() {
        let items = parse_manifest(
            r#"[{"media_id":"a","source_url":"https://x/a.jpg"},{"media_id":"b","r2_url":"https://x/b.jpg"}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].source_url, "https://x/b.jpg");
    }

    #[test]
    fn test_parse_manifest_rejects_empty() {
        assert!(parse_manifest("[]").is_err());
        assert!(parse_manifest("{}").is_err());
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["facetrace", "search", "--event-id", "e1", "me.jpg", "--secret", "s"]).unwrap();
        assert_eq!(cli.secret, "s");
        assert!(matches!(cli.command, Commands::Search { ref event_id, .. } if event_id == "e1"));
    }
}
