//! Product description generation through an OpenAI-compatible
//! chat-completions API.

use crate::config::LlmConfig;
use crate::external::ExternalError;
use crate::observability::MetricsRecorder;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionLength {
    Short,
    #[default]
    Medium,
    Extensive,
}

impl DescriptionLength {
    fn word_range(&self) -> &'static str {
        match self {
            DescriptionLength::Short => "50 to 100",
            DescriptionLength::Medium => "150 to 250",
            DescriptionLength::Extensive => "350 to 500",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    Url,
    Barcode,
    #[default]
    Manual,
}

/// Body of a generation request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionRequest {
    pub user_id: String,
    pub product_url: Option<String>,
    pub product_info: Option<String>,
    pub brand_tone: Option<String>,
    #[serde(default)]
    pub description_length: DescriptionLength,
    pub language: Option<String>,
    pub target_audience: Option<String>,
    #[serde(default)]
    pub key_features: Vec<String>,
    #[serde(default)]
    pub input_mode: InputMode,
}

impl DescriptionRequest {
    /// Either a product URL or product details must be present
    pub fn validate(&self) -> Result<(), String> {
        let has = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.trim().is_empty());
        if !has(&self.product_url) && !has(&self.product_info) {
            return Err("productUrl or productInfo is required".to_string());
        }
        if self.key_features.len() > 20 {
            return Err("keyFeatures accepts up to 20 entries".to_string());
        }
        Ok(())
    }
}

#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    async fn generate(&self, request: &DescriptionRequest) -> Result<String, ExternalError>;
}

/// Assemble the user prompt from the request fields
pub fn build_prompt(request: &DescriptionRequest) -> String {
    let mut prompt = format!(
        "Write a {} product description of {} words",
        request.brand_tone.as_deref().unwrap_or("professional"),
        request.description_length.word_range()
    );
    if let Some(language) = request.language.as_deref().filter(|l| !l.is_empty()) {
        prompt.push_str(&format!(" in {}", language));
    }
    prompt.push_str(".\n");

    if let Some(audience) = request.target_audience.as_deref().filter(|a| !a.is_empty()) {
        prompt.push_str(&format!("Target audience: {}\n", audience));
    }
    match request.input_mode {
        InputMode::Url => {
            if let Some(url) = &request.product_url {
                prompt.push_str(&format!("Product page: {}\n", url));
            }
        }
        InputMode::Barcode => prompt.push_str("The product was identified from its barcode.\n"),
        InputMode::Manual => {}
    }
    if let Some(info) = request.product_info.as_deref().filter(|i| !i.is_empty()) {
        prompt.push_str(&format!("Product details: {}\n", info));
    }
    if !request.key_features.is_empty() {
        prompt.push_str("Key features:\n");
        for feature in &request.key_features {
            prompt.push_str(&format!("- {}\n", feature));
        }
    }
    prompt
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

const SYSTEM_PROMPT: &str =
    "You write accurate, persuasive e-commerce product descriptions. Return only the description text.";

pub struct OpenAiGenerator {
    config: LlmConfig,
    http: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, http }
    }
}

#[async_trait]
impl DescriptionGenerator for OpenAiGenerator {
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    async fn generate(&self, request: &DescriptionRequest) -> Result<String, ExternalError> {
        if self.config.api_key.is_empty() {
            return Err(ExternalError::NotConfigured("LLM API key".to_string()));
        }

        let prompt = build_prompt(request);
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                MetricsRecorder::record_external_call("llm", "error");
                error!(error = %e, "LLM request failed");
                ExternalError::Llm(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            MetricsRecorder::record_external_call("llm", "error");
            error!(status = %status, "LLM API error");
            return Err(ExternalError::Llm(format!("LLM API returned {}", status)));
        }

        let reply = response
            .json::<ChatResponse>()
            .await
            .map_err(|e| ExternalError::Llm(format!("unreadable LLM response: {}", e)))?;
        let description = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ExternalError::Llm("empty completion".to_string()))?;

        MetricsRecorder::record_external_call("llm", "ok");
        debug!(chars = description.len(), "Description generated");
        Ok(description)
    }
}
