//! Pre-flight model inspection: token budget and structured-output support.

use serde::Deserialize;
use tracing::{debug, warn};

/// Metadata resolved once per session, before the first decision.
#[derive(Debug, Clone, Copy)]
pub struct ModelMetadata {
    pub max_tokens: u32,
    pub supports_structured: bool,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            supports_structured: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    supported_parameters: Option<Vec<String>>,
}

pub struct ModelInspector {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ModelInspector {
    pub fn new(http: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            http,
            api_key,
            base_url,
        }
    }

    /// Resolves metadata for `model`. Inspection failures never block a
    /// session; they fall back to conservative defaults.
    pub async fn inspect(&self, model: &str) -> ModelMetadata {
        match self.fetch(model).await {
            Ok(Some(metadata)) => {
                debug!(
                    "Model metadata for {}: max_tokens={}, supports_structured={}",
                    model, metadata.max_tokens, metadata.supports_structured
                );
                metadata
            }
            Ok(None) => {
                warn!("Model {} not found in listing, using defaults", model);
                ModelMetadata::default()
            }
            Err(e) => {
                warn!("Model inspection failed for {}: {}, using defaults", model, e);
                ModelMetadata::default()
            }
        }
    }

    async fn fetch(&self, model: &str) -> anyhow::Result<Option<ModelMetadata>> {
        let url = format!("{}/models", self.base_url);
        let listing: ModelListing = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(listing.data.into_iter().find(|m| m.id == model).map(|entry| {
            // A quarter of the context window is plenty for one decision,
            // clamped into the supported budget range.
            let max_tokens = entry
                .context_length
                .map(|cl| (cl / 4).clamp(512, 8192))
                .unwrap_or(2048);
            let supports_structured = entry
                .supported_parameters
                .unwrap_or_default()
                .iter()
                .any(|p| p == "structured_outputs" || p == "response_format");
            ModelMetadata {
                max_tokens,
                supports_structured,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_metadata() {
        let metadata = ModelMetadata::default();
        assert_eq!(metadata.max_tokens, 2048);
        assert!(!metadata.supports_structured);
    }

    #[test]
    fn test_listing_deserializes() {
        let json = r#"{"data":[{"id":"openai/gpt-4o","context_length":128000,
            "supported_parameters":["structured_outputs","temperature"]}]}"#;
        let listing: ModelListing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.data[0].id, "openai/gpt-4o");
        assert_eq!(listing.data[0].context_length, Some(128000));
    }
}
