use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Worker configuration.
///
/// Layered: defaults, then the TOML file named by `FACETRACE_CONFIG` (if
/// set), then `FACETRACE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared secret every request must carry.
    pub secret: String,
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Timeout for a single image download.
    pub fetch_timeout_secs: u64,
    /// Fraction of the face box added on each side before alignment.
    pub crop_padding: f64,
    /// Largest accepted decoded selfie payload.
    pub max_selfie_bytes: usize,
    /// ONNX Runtime intra-op threads per model.
    pub intra_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: String::new(),
            listen_addr: "0.0.0.0:8000".to_string(),
            model_dir: facetrace_core::default_model_dir(),
            db_path: facetrace_core::data_dir().join("faces.db"),
            fetch_timeout_secs: 30,
            crop_padding: facetrace_core::alignment::FACE_CROP_PADDING,
            max_selfie_bytes: 5 * 1024 * 1024,
            intra_threads: 2,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("FACETRACE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env_overrides(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACETRACE_*` overrides. Unparseable values keep the prior one.
    fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = var("FACETRACE_SECRET") {
            self.secret = v;
        }
        if let Some(v) = var("FACETRACE_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = var("FACETRACE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACETRACE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.fetch_timeout_secs = parse_or(&var, "FACETRACE_FETCH_TIMEOUT_SECS", self.fetch_timeout_secs);
        self.crop_padding = parse_or(&var, "FACETRACE_CROP_PADDING", self.crop_padding);
        self.max_selfie_bytes = parse_or(&var, "FACETRACE_MAX_SELFIE_BYTES", self.max_selfie_bytes);
        self.intra_threads = parse_or(&var, "FACETRACE_INTRA_THREADS", self.intra_threads);
        self
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.listen_addr, "0.0.0.0:8000");
        assert_eq!(c.fetch_timeout_secs, 30);
        assert!((c.crop_padding - 0.2).abs() < 1e-12);
        assert_eq!(c.max_selfie_bytes, 5 * 1024 * 1024);
        assert!(c.secret.is_empty());
        assert!(c.model_dir.ends_with("facetrace/models"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml_str(
            r#"
            secret = "s3cret"
            model_dir = "/opt/models"
            "#,
        )
        .unwrap();
        assert_eq!(c.secret, "s3cret");
        assert_eq!(c.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(c.intra_threads, 2);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(matches!(
            Config::from_toml_str("fetch_timeout_secs = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let c = Config::from_toml_str("secret = \"file\"\nintra_threads = 4")
            .unwrap()
            .with_env_overrides(env(&[
                ("FACETRACE_SECRET", "env"),
                ("FACETRACE_CROP_PADDING", "0.25"),
                ("FACETRACE_INTRA_THREADS", "not-a-number"),
            ]));
        assert_eq!(c.secret, "env");
        assert!((c.crop_padding - 0.25).abs() < 1e-12);
        assert_eq!(c.intra_threads, 4);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::from_file(Path::new("/nonexistent/facetrace.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
