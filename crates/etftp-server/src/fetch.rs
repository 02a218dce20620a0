//! Payload source backed by HTTP: the request filename is a URL.

use std::time::Duration;

use etftp_transfer::{PayloadSource, SourceError};
use reqwest::StatusCode;
use reqwest::blocking::Client;

pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("etftp-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpSource { client })
    }
}

impl PayloadSource for HttpSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_builder() {
                // Not a URL we can request at all.
                SourceError::NotFound(format!("{url}: {e}"))
            } else {
                SourceError::Unavailable(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(SourceError::NotFound(format!("{url}: {status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("{url}: upstream returned {status}")));
        }

        let body = response
            .bytes()
            .map_err(|e| SourceError::Unavailable(format!("{url}: {e}")))?;
        if body.is_empty() {
            return Err(SourceError::NotFound(format!("{url}: empty body")));
        }

        tracing::debug!(url, bytes = body.len(), "fetched payload");
        Ok(body.to_vec())
    }
}
