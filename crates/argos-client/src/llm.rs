use std::sync::Arc;

use argos_core::ai_fallback::AiFallbackDecider;
use argos_core::error::AppError;
use argos_core::extraction::{AiBudget, ProviderSpec, TargetSchema};
use argos_core::traits::ExtractionProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a data extraction assistant for pharmaceutical documents. Extract the requested fields from the provided content. Respond ONLY with a JSON object matching the requested schema. Use null for any field the content does not state; never guess.";

/// Extraction provider for any OpenAI-compatible chat completions API.
///
/// Asks for a JSON object and puts the target schema in the prompt, which
/// every compatible endpoint understands. The raw message content is
/// returned as a JSON string; the fallback decider parses and validates it.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: Client,
    spec: ProviderSpec,
    base_url: String,
    api_key: String,
    system_prompt: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(spec: ProviderSpec, api_key: &str, base_url: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(spec.timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            spec,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

// ---- Chat completions API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait]
impl ExtractionProvider for OpenAiCompatibleProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn extract(
        &self,
        content: &str,
        schema: &TargetSchema,
        _budget: &AiBudget,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.spec.model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user",
                    content: format!(
                        "Extract a {} record according to this JSON schema:\n```json\n{}\n```\n\nFrom the following content:\n\n{}",
                        schema.name(),
                        serde_json::to_string_pretty(&schema.json_schema())?,
                        content
                    ),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.spec.timeout)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status_code}: {body}"));

            return Err(AppError::LlmError {
                message,
                status_code,
                retryable: status_code == 429 || status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .map(serde_json::Value::String)
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".into(),
                status_code: 200,
                retryable: false,
            })
    }
}

// ---------------------------------------------------------------------------
// Provider table
// ---------------------------------------------------------------------------

/// A provider the engine knows how to configure.
#[derive(Debug, Clone, Copy)]
pub struct ProviderEntry {
    pub name: &'static str,
    /// `<PREFIX>_API_KEY`, `<PREFIX>_MODEL` and `<PREFIX>_BASE_URL` are read.
    pub env_prefix: &'static str,
    pub base_url: &'static str,
    pub model: &'static str,
    pub cost_per_million_tokens: f64,
    pub priority: u32,
}

/// Built-in providers, cheapest first.
pub const DEFAULT_PROVIDERS: [ProviderEntry; 4] = [
    ProviderEntry {
        name: "groq-free",
        env_prefix: "GROQ",
        base_url: "https://api.groq.com/openai/v1",
        model: "llama-3.3-70b-versatile",
        cost_per_million_tokens: 0.0,
        priority: 0,
    },
    ProviderEntry {
        name: "xai",
        env_prefix: "XAI",
        base_url: "https://api.x.ai/v1",
        model: "grok-3-mini",
        cost_per_million_tokens: 0.50,
        priority: 1,
    },
    ProviderEntry {
        name: "openai",
        env_prefix: "OPENAI",
        base_url: "https://api.openai.com/v1",
        model: "gpt-4o-mini",
        cost_per_million_tokens: 2.50,
        priority: 2,
    },
    ProviderEntry {
        name: "anthropic",
        env_prefix: "ANTHROPIC",
        base_url: "https://api.anthropic.com/v1",
        model: "claude-3-5-haiku-latest",
        cost_per_million_tokens: 3.00,
        priority: 3,
    },
];

/// The extraction providers that have credentials in the environment.
#[derive(Clone, Default)]
pub struct ProviderTable {
    providers: Vec<OpenAiCompatibleProvider>,
}

impl ProviderTable {
    /// Configure every built-in provider whose `<PREFIX>_API_KEY` is set.
    ///
    /// `<PREFIX>_MODEL` and `<PREFIX>_BASE_URL` override the defaults. A
    /// base URL that does not parse is a configuration error.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(&DEFAULT_PROVIDERS, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        entries: &[ProviderEntry],
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, AppError> {
        let mut providers = Vec::new();

        for entry in entries {
            let prefix = entry.env_prefix;
            let Some(api_key) = lookup(&format!("{prefix}_API_KEY"))
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
            else {
                tracing::debug!(provider = entry.name, "No API key, provider disabled");
                continue;
            };

            let model = lookup(&format!("{prefix}_MODEL")).unwrap_or_else(|| entry.model.to_string());
            let base_url =
                lookup(&format!("{prefix}_BASE_URL")).unwrap_or_else(|| entry.base_url.to_string());
            Url::parse(&base_url).map_err(|e| {
                AppError::ConfigError(format!("Invalid {prefix}_BASE_URL '{base_url}': {e}"))
            })?;

            let spec = ProviderSpec::new(entry.name, entry.priority, entry.cost_per_million_tokens)
                .with_model(model);
            providers.push(OpenAiCompatibleProvider::new(spec, &api_key, &base_url)?);
        }

        Ok(Self { providers })
    }

    pub fn with_provider(mut self, provider: OpenAiCompatibleProvider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.spec.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn into_decider(self, budget: AiBudget) -> AiFallbackDecider {
        let providers = self
            .providers
            .into_iter()
            .map(|p| Arc::new(p) as Arc<dyn ExtractionProvider>)
            .collect();
        AiFallbackDecider::new(providers, budget)
    }
}
