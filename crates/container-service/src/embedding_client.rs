//! Concrete embedding providers (C2).
//!
//! Follows the teacher's `embedding::{embed_openai, embed_ollama}` retry
//! shape: exponential backoff on 429/5xx and network errors, immediate
//! failure on other 4xx. `container_core::embedding::EmbeddingProvider` only
//! carries model metadata; the actual batched call stays a free function so
//! it can be async without forcing the trait into `#[async_trait]`.

use std::time::Duration;

use anyhow::{bail, Result};
use container_core::embedding::{l2_normalize, EmbeddingProvider};

use crate::config::EmbeddingConfig;

pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

pub struct OpenAiProvider {
    model: String,
    dims: usize,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for openai provider"))?;
        if config.api_key.is_none() && std::env::var("OPENAI_API_KEY").is_err() {
            bail!("embedding.api_key or OPENAI_API_KEY must be set for the openai provider");
        }
        Ok(Self { model, dims: config.dims })
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self { model, dims: config.dims, url })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Instantiate the configured provider. `"disabled"` always succeeds;
/// other providers fail fast if required fields are missing so a
/// misconfigured deployment fails at startup rather than on first search
/// (§6 Exit conditions).
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        "local" => bail!(
            "local embedding provider is not compiled into this build; use openai, ollama, or disabled"
        ),
        other => bail!("unknown embedding provider: {other}"),
    }
}

const MAX_RETRIES: u32 = 5;

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(5))
}

/// Embed a batch of texts, L2-normalizing each vector before returning it
/// (§4.2: stored and compared vectors are always unit-normalized). Callers
/// translate any error into the `VECTOR_DOWN` issue code and fall back to
/// [`container_core::embedding::zero_vector`] rather than failing the
/// surrounding ingestion or search request.
pub async fn embed_texts(
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let mut vectors = match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await?,
        "ollama" => embed_ollama(config, texts).await?,
        "disabled" => bail!("embedding provider is disabled"),
        other => bail!("unknown embedding provider: {other}"),
    };
    for v in vectors.iter_mut() {
        l2_normalize(v);
    }
    Ok(vectors)
}

pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_texts(config, std::slice::from_ref(&text.to_string())).await?;
    vectors.pop().ok_or_else(|| anyhow::anyhow!("empty embedding response"))
}

/// Embed raw image bytes via the image embedder (§4.6: "Image embedding is
/// a separate endpoint"). L2-normalized like [`embed_texts`] so cosine
/// search works the same way across modalities. Callers translate any
/// error into `VECTOR_DOWN` and fall back to
/// [`container_core::embedding::zero_vector`], same as the text path.
pub async fn embed_image(config: &EmbeddingConfig, bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() {
        bail!("cannot embed an empty image");
    }
    let mut vector = match config.provider.as_str() {
        "openai" => embed_image_openai(config, bytes).await?,
        "ollama" => embed_image_ollama(config, bytes).await?,
        "disabled" => bail!("embedding provider is disabled"),
        other => bail!("unknown embedding provider: {other}"),
    };
    l2_normalize(&mut vector);
    Ok(vector)
}

async fn embed_image_openai(config: &EmbeddingConfig, bytes: &[u8]) -> Result<Vec<f32>> {
    use base64::Engine;

    let api_key = config
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .ok_or_else(|| anyhow::anyhow!("no OpenAI API key configured"))?;
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()?;

    let image_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    let body = serde_json::json!({ "model": model, "image": image_b64 });
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let resp = client
            .post("https://api.openai.com/v1/images/embeddings")
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_data_embeddings(&json)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("empty image embedding response"));
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("openai image embeddings error {status}"));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("openai image embeddings error {status}: {body_text}");
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("openai image embeddings failed after retries")))
}

async fn embed_image_ollama(config: &EmbeddingConfig, bytes: &[u8]) -> Result<Vec<f32>> {
    use base64::Engine;

    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()?;
    let image_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    let body = serde_json::json!({ "model": model, "input": "", "images": [image_b64] });
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let resp = client
            .post(format!("{url}/api/embed"))
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_embeddings_field(&json)?
                        .into_iter()
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("empty image embedding response"));
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("ollama image embeddings error {status}"));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("ollama image embeddings error {status}: {body_text}");
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("ollama connection error at {url}: {e}"));
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("ollama image embeddings failed after retries")))
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key = config
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .ok_or_else(|| anyhow::anyhow!("no OpenAI API key configured"))?;
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()?;

    let body = serde_json::json!({ "model": model, "input": texts });
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let resp = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_data_embeddings(&json);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("openai embeddings error {status}"));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("openai embeddings error {status}: {body_text}");
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("openai embeddings failed after retries")))
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()?;
    let body = serde_json::json!({ "model": model, "input": texts });
    let mut last_err = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
        }
        let resp = client
            .post(format!("{url}/api/embed"))
            .json(&body)
            .send()
            .await;
        match resp {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_embeddings_field(&json);
                }
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("ollama embeddings error {status}"));
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                bail!("ollama embeddings error {status}: {body_text}");
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("ollama connection error at {url}: {e}"));
                continue;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("ollama embeddings failed after retries")))
}

fn parse_data_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing data array in embeddings response"))?;
    data.iter()
        .map(|item| {
            let arr = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow::anyhow!("missing embedding in response item"))?;
            Ok(arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
        })
        .collect()
}

fn parse_embeddings_field(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let arr = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing embeddings array in response"))?;
    arr.iter()
        .map(|embedding| {
            let inner = embedding
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("embedding entry is not an array"))?;
            Ok(inner.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_provider_reports_zero_dims() {
        let p = DisabledProvider;
        assert_eq!(p.dims(), 0);
        assert_eq!(p.model_name(), "disabled");
    }

    #[test]
    fn create_provider_rejects_unknown_name() {
        let cfg = EmbeddingConfig {
            provider: "bogus".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&cfg).is_err());
    }

    #[test]
    fn openai_provider_requires_model() {
        let cfg = EmbeddingConfig {
            provider: "openai".into(),
            api_key: Some("sk-test".into()),
            ..EmbeddingConfig::default()
        };
        assert!(OpenAiProvider::new(&cfg).is_err());
    }

    #[test]
    fn parse_data_embeddings_extracts_vectors_in_order() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [1.0, 2.0]},
                {"embedding": [3.0, 4.0]},
            ]
        });
        let vectors = parse_data_embeddings(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
    }

    #[tokio::test]
    async fn embed_image_rejects_empty_bytes() {
        let cfg = EmbeddingConfig { provider: "openai".into(), ..EmbeddingConfig::default() };
        assert!(embed_image(&cfg, &[]).await.is_err());
    }

    #[tokio::test]
    async fn embed_image_fails_fast_when_disabled() {
        let cfg = EmbeddingConfig { provider: "disabled".into(), ..EmbeddingConfig::default() };
        assert!(embed_image(&cfg, &[1, 2, 3]).await.is_err());
    }
}
