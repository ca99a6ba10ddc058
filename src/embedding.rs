//! Blocking HTTP client for an externally-hosted embedding service.
//!
//! Shared by [`crate::vector`] (local) and [`crate::cloud`] (remote-curated)
//! so the `"passage: "`/`"query: "` prefix convention can't drift between
//! the two callers.

use std::time::Duration;

use serde::Serialize;

use crate::error::{HmError, Result};

pub const PASSAGE_PREFIX: &str = "passage: ";
pub const QUERY_PREFIX: &str = "query: ";
pub const DIM_PROBE_INPUT: &str = "dim-probe";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
}

type EmbedResponse = Vec<Vec<f32>>;

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(HmError::Http)?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), http })
    }

    /// Embed a batch of already-prefixed strings. Order of the result
    /// mirrors the order of `inputs`.
    pub fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .http
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { inputs })
            .send()
            .map_err(HmError::Http)?;
        let resp = resp.error_for_status().map_err(HmError::Http)?;
        let body: EmbedResponse = resp.json().map_err(HmError::Http)?;
        if body.len() != inputs.len() {
            return Err(HmError::Embedding(format!(
                "embedding service returned {} vectors for {} inputs",
                body.len(),
                inputs.len()
            )));
        }
        Ok(body)
    }

    pub fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{PASSAGE_PREFIX}{t}")).collect();
        self.embed(&prefixed)
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let prefixed = vec![format!("{QUERY_PREFIX}{text}")];
        let mut v = self.embed(&prefixed)?;
        v.pop().ok_or_else(|| HmError::Embedding("embedding service returned no vectors".into()))
    }

    /// Probe the configured model's output dimensionality with a fixed
    /// sentinel input, so callers don't have to hardcode it per model.
    pub fn probe_dims(&self) -> Result<usize> {
        let v = self.embed(&[DIM_PROBE_INPUT.to_string()])?;
        Ok(v.first().map(|e| e.len()).unwrap_or(0))
    }

    pub fn health(&self) -> Result<bool> {
        match self.http.get(format!("{}/health", self.base_url)).send() {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passage_and_query_prefixes_are_distinct() {
        assert_ne!(PASSAGE_PREFIX, QUERY_PREFIX);
    }

    #[test]
    fn client_rejects_empty_batch_without_network_call() {
        let client = EmbeddingClient::new("http://127.0.0.1:1").unwrap();
        assert_eq!(client.embed(&[]).unwrap(), Vec::<Vec<f32>>::new());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = EmbeddingClient::new("http://example.invalid/").unwrap();
        assert_eq!(client.base_url, "http://example.invalid");
    }
}
