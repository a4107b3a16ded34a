use async_trait::async_trait;
use google_cloud_bigquery::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_bigquery::client::google_cloud_auth::project::Config as AuthConfig;
use google_cloud_bigquery::client::google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::LanguageModel;
use crate::config::LlmConfig;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    top_p: f32,
    top_k: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

const CLOUD_PLATFORM_SCOPES: [&str; 1] = ["https://www.googleapis.com/auth/cloud-platform"];

enum Authorization {
    /// Configured token, sent as-is and never refreshed.
    Static(String),
    /// Service-account or application default credentials. The source
    /// caches its token and fetches a new one shortly before expiry.
    Refreshing(Arc<dyn TokenSource>),
}

impl Authorization {
    async fn header_value(&self) -> Result<String> {
        match self {
            Authorization::Static(token) => Ok(format!("Bearer {}", token)),
            Authorization::Refreshing(source) => source
                .token()
                .await
                .map_err(|e| Error::LanguageModel(format!("Failed to obtain access token: {}", e))),
        }
    }
}

/// Vertex AI `generateContent` client for Gemini models.
pub struct VertexAiClient {
    http: reqwest::Client,
    url: String,
    auth: Authorization,
    generation: GenerationConfig,
    model: String,
}

impl VertexAiClient {
    /// Authenticates with `llm.access_token` when one is configured, otherwise
    /// with the credentials file at `credentials_path` or application default
    /// credentials.
    pub async fn connect(
        config: &LlmConfig,
        project_id: &str,
        credentials_path: Option<&Path>,
    ) -> Result<Self> {
        if let Some(token) = config.access_token.clone() {
            info!("Using the configured Vertex AI access token");
            return Self::build(config, project_id, Authorization::Static(token));
        }

        let auth_config = AuthConfig::default().with_scopes(&CLOUD_PLATFORM_SCOPES);
        let provider = match credentials_path {
            Some(path) => {
                let credentials = CredentialsFile::new_from_file(path.to_string_lossy().to_string())
                    .await
                    .map_err(|e| {
                        Error::Config(format!("Failed to read credentials {}: {}", path.display(), e))
                    })?;
                DefaultTokenSourceProvider::new_with_credentials(auth_config, Box::new(credentials))
                    .await
            }
            None => DefaultTokenSourceProvider::new(auth_config).await,
        }
        .map_err(|e| Error::Config(format!("Failed to load Vertex AI credentials: {}", e)))?;

        Self::build(
            config,
            project_id,
            Authorization::Refreshing(provider.token_source()),
        )
    }

    /// Client with a fixed bearer token, e.g. for a local endpoint.
    pub fn with_static_token(
        config: &LlmConfig,
        project_id: &str,
        token: impl Into<String>,
    ) -> Result<Self> {
        Self::build(config, project_id, Authorization::Static(token.into()))
    }

    fn build(config: &LlmConfig, project_id: &str, auth: Authorization) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::LanguageModel(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: endpoint_url(config, project_id),
            auth,
            generation: GenerationConfig {
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
                top_p: config.top_p,
                top_k: config.top_k,
            },
            model: config.model.clone(),
        })
    }
}

fn endpoint_url(config: &LlmConfig, project_id: &str) -> String {
    let base = config
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", config.location));
    format!(
        "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
        base.trim_end_matches('/'),
        project_id,
        config.location,
        config.model
    )
}

fn response_text(response: GenerateContentResponse) -> Result<String> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::LanguageModel("No candidates in model response".into()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(Error::LanguageModel(format!(
            "Empty model response (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(text)
}

#[async_trait]
impl LanguageModel for VertexAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: self.generation,
        };

        let authorization = self.auth.header_value().await?;
        let response = self
            .http
            .post(&self.url)
            .header(AUTHORIZATION, authorization)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::LanguageModel(format!("Vertex AI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::LanguageModel(format!(
                "Vertex AI returned {}: {}",
                status, detail
            )));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| Error::LanguageModel(format!("Failed to parse model response: {}", e)))?;

        let text = response_text(parsed)?;
        debug!(model = %self.model, chars = text.len(), "Model response received");
        Ok(text)
    }
}
