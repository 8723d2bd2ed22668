//! # HTTP Capability Provider
//!
//! Implements the engine's capability traits against a remote service:
//!
//! | Trait method | Request |
//! |---|---|
//! | `Embedder::embed` | `POST /embed` |
//! | `Classifier::classify_preliminary` | `POST /classify/preliminary` |
//! | `Classifier::classify_detailed` | `POST /classify/detailed` |
//! | `ContentSynthesizer::synthesize` | `POST /synthesize` |
//!
//! Response bodies are model output and go through
//! [`strata_core::capability::decode`], so fenced or slightly malformed JSON
//! is repaired once before being rejected.
//!
//! The traits are synchronous. Calls block on the runtime handle captured at
//! construction, so they must be made from blocking threads
//! (`spawn_blocking` or threads spawned from one), never from async tasks.

use crate::config::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_core::capability::{PreliminaryAnswer, decode};
use strata_core::{
    CapabilityError, Classifier, ContentSynthesizer, DetailedVerdict, Embedder, EntityId,
    EntityVersion, PreliminaryVerdict, RelationId, RelationVersion,
};
use tokio::runtime::Handle;

#[derive(Serialize)]
struct EntityPayload<'a> {
    entity_id: EntityId,
    name: &'a str,
    content: &'a str,
}

impl<'a> From<&'a EntityVersion> for EntityPayload<'a> {
    fn from(entity: &'a EntityVersion) -> Self {
        Self {
            entity_id: entity.entity_id,
            name: &entity.name,
            content: &entity.content,
        }
    }
}

#[derive(Serialize)]
struct RelationPayload<'a> {
    relation_id: RelationId,
    content: &'a str,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct PreliminaryRequest<'a> {
    entity: EntityPayload<'a>,
    candidates: Vec<EntityPayload<'a>>,
}

#[derive(Serialize)]
struct DetailedRequest<'a> {
    entity: EntityPayload<'a>,
    candidate: EntityPayload<'a>,
    existing_relations: Vec<RelationPayload<'a>>,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    old: &'a str,
    fragments: &'a [String],
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    content: String,
}

/// HTTP client for the capability service.
#[derive(Clone)]
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    handle: Handle,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.api_key.is_some())
            .finish()
    }
}

impl HttpProvider {
    /// Create a provider bound to `handle`.
    pub fn new(config: &ProviderConfig, handle: Handle) -> Result<Self, CapabilityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CapabilityError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key(),
            handle,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` to `path` and return the raw response text.
    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<String, CapabilityError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("{}: {}", url, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("{}: {}", url, e)))?;
        if !status.is_success() {
            return Err(CapabilityError::Unavailable(format!(
                "{} returned {}: {}",
                url,
                status.as_u16(),
                text.trim()
            )));
        }
        Ok(text)
    }

    fn call<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CapabilityError> {
        let raw = self.handle.block_on(self.post(path, body))?;
        let decoded = decode(&raw);
        if let Err(ref e) = decoded {
            tracing::warn!(path, error = %e, "provider answer rejected");
        }
        decoded
    }
}

impl Embedder for HttpProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let answer: EmbedResponse = self.call("/embed", &EmbedRequest { text })?;
        Ok(answer.embedding)
    }
}

impl Classifier for HttpProvider {
    fn classify_preliminary(
        &self,
        entity: &EntityVersion,
        candidates: &[EntityVersion],
    ) -> Result<Vec<(EntityId, PreliminaryVerdict)>, CapabilityError> {
        let request = PreliminaryRequest {
            entity: entity.into(),
            candidates: candidates.iter().map(EntityPayload::from).collect(),
        };
        let answer: PreliminaryAnswer = self.call("/classify/preliminary", &request)?;
        Ok(answer.into())
    }

    fn classify_detailed(
        &self,
        entity: &EntityVersion,
        candidate: &EntityVersion,
        existing_relations: &[RelationVersion],
    ) -> Result<DetailedVerdict, CapabilityError> {
        let request = DetailedRequest {
            entity: entity.into(),
            candidate: candidate.into(),
            existing_relations: existing_relations
                .iter()
                .map(|r| RelationPayload {
                    relation_id: r.relation_id,
                    content: &r.content,
                })
                .collect(),
        };
        self.call("/classify/detailed", &request)
    }
}

impl ContentSynthesizer for HttpProvider {
    fn synthesize(&self, old: &str, fragments: &[String]) -> Result<String, CapabilityError> {
        let answer: SynthesizeResponse =
            self.call("/synthesize", &SynthesizeRequest { old, fragments })?;
        Ok(answer.content)
    }
}
