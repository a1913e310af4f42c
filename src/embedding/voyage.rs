//! Remote embedding backend: Voyage AI (§4.E).
//!
//! `POST https://api.voyageai.com/v1/embeddings`, bearer auth, 1024
//! dimensions (`voyage-3` family). Retried up to
//! [`Config::max_retries`]-worth of attempts with exponential backoff on
//! network errors and 5xx responses; a 429 honors the server's
//! `Retry-After` header instead of the backoff schedule.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::error::EmbeddingError;

use super::{EmbedKind, EmbeddingProvider};

pub const VOYAGE_DIMS: usize = 1024;
const ENDPOINT: &str = "https://api.voyageai.com/v1/embeddings";
const DOCUMENT_MODEL: &str = "voyage-3";
const QUERY_MODEL: &str = "voyage-3-lite";
/// Per-request timeout, fixed independently of the vector-store timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct VoyageProvider {
    client: Client,
    api_key: String,
}

impl VoyageProvider {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, api_key }
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageProvider {
    async fn embed(&self, texts: &[String], kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (input_type, model) = match kind {
            EmbedKind::Document => ("document", DOCUMENT_MODEL),
            EmbedKind::Query => ("query", QUERY_MODEL),
        };

        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let body = json!({
                "input": texts,
                "model": model,
                "input_type": input_type,
            });

            let resp = self
                .client
                .post(ENDPOINT)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(EmbeddingError::Request)?;
                        return parse_response(&json);
                    }

                    if status.as_u16() == 429 {
                        let retry_after = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(1);
                        if attempt >= MAX_ATTEMPTS {
                            return Err(EmbeddingError::RateLimited { retry_after_secs: retry_after });
                        }
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }

                    if status.is_server_error() && attempt < MAX_ATTEMPTS {
                        backoff(attempt).await;
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    return Err(EmbeddingError::BadResponse(format!("{status}: {text}")));
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(EmbeddingError::Request(e));
                    }
                    backoff(attempt).await;
                }
            }
        }
    }

    fn dims(&self) -> usize {
        VOYAGE_DIMS
    }

    fn suffix(&self) -> &'static str {
        "voyage"
    }
}

async fn backoff(attempt: u32) {
    let delay = Duration::from_millis(500 * (1u64 << attempt.min(4)));
    tokio::time::sleep(delay).await;
}

fn parse_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::BadResponse("missing data array".to_string()))?;

    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbeddingError::BadResponse("missing embedding field".to_string()))?;
        let vec: Vec<f32> = embedding.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect();
        out.push(vec);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_data_embedding_array_in_order() {
        let body = json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]}
            ]
        });
        let out = parse_response(&body).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![0.1, 0.2]);
        assert_eq!(out[1], vec![0.3, 0.4]);
    }

    #[test]
    fn missing_data_array_is_a_bad_response_error() {
        let body = json!({"error": "nope"});
        assert!(matches!(parse_response(&body), Err(EmbeddingError::BadResponse(_))));
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let provider = VoyageProvider::new("key".to_string());
        let out = provider.embed(&[], EmbedKind::Document).await.unwrap();
        assert!(out.is_empty());
    }
}
