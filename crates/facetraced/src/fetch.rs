use facetrace_core::{FetchError, ImageSource};
use std::time::Duration;

/// Downloads gallery images over HTTP(S).
///
/// Blocking client: only ever called from the engine thread.
pub struct HttpImageSource {
    client: reqwest::blocking::Client,
}

impl HttpImageSource {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("facetraced/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().map_err(|e| FetchError::Transport(e.to_string()))?;
        tracing::debug!(url, bytes = bytes.len(), "image fetched");
        Ok(bytes.to_vec())
    }
}
