use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use sidecar_core::{Addon, InvokeError, ModelInvoker};
use sidecar_settings::LlmSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Model invoker for OpenAI-compatible `/chat/completions` endpoints.
///
/// Each add-on names a provider; the provider resolves to a base URL through
/// the configured endpoint table.
pub struct HttpInvoker {
    client: Client,
    endpoints: BTreeMap<String, String>,
    api_key: Option<SecretString>,
    timeout: Duration,
    max_tokens: u32,
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
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl HttpInvoker {
    pub fn new(settings: &LlmSettings) -> Result<Self, InvokeError> {
        let api_key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        Self::with_key(settings, api_key)
    }

    pub fn with_key(settings: &LlmSettings, api_key: Option<SecretString>) -> Result<Self, InvokeError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InvokeError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoints: settings.endpoints.clone(),
            api_key,
            timeout: Duration::from_millis(settings.request_timeout_ms),
            max_tokens: settings.max_tokens,
        })
    }

    fn endpoint(&self, provider: &str) -> Result<String, InvokeError> {
        let base = self
            .endpoints
            .get(provider)
            .ok_or_else(|| InvokeError::UnknownProvider(provider.to_string()))?;
        Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
    }

    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    async fn complete(&self, provider: &str, model: &str, prompt: &str) -> Result<String, InvokeError> {
        let url = self.endpoint(provider)?;
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
        };

        let mut req = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::from_status(status.as_u16(), text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| InvokeError::MalformedResponse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InvokeError::MalformedResponse("response has no choices".into()))?;

        debug!(provider, model, response_len = content.len(), "completion received");
        Ok(content)
    }

    fn classify(&self, e: reqwest::Error) -> InvokeError {
        if e.is_timeout() {
            InvokeError::Timeout(self.timeout)
        } else {
            InvokeError::NetworkError(e.to_string())
        }
    }
}

#[async_trait]
impl ModelInvoker for HttpInvoker {
    async fn invoke(&self, addon: &Addon, prompt: &str) -> Result<String, InvokeError> {
        self.complete(&addon.provider, &addon.model, prompt).await
    }

    async fn invoke_batch(&self, addons: &[Addon], prompt: &str) -> Result<String, InvokeError> {
        let first = addons
            .first()
            .ok_or_else(|| InvokeError::InvalidRequest("empty batch".into()))?;
        self.complete(&first.provider, &first.model, prompt).await
    }
}
