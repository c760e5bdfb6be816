use crate::config::ModelsConfig;
use crate::llm::{LlmError, ModelInvoker, ModelRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_ENDPOINT: &str = "http://localhost:8000";
const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Invokes Claude-family models through a Bedrock-compatible runtime
/// gateway. The gateway handles request signing; this client only needs the
/// region for routing diagnostics.
pub struct BedrockInvoker {
    client: reqwest::Client,
    endpoint: String,
    region: Option<String>,
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    anthropic_version: &'static str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct InvokeResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl BedrockInvoker {
    pub fn new(config: &ModelsConfig) -> Result<Self, LlmError> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let client = reqwest::Client::builder()
            .timeout(INVOKE_TIMEOUT)
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            region: std::env::var("AWS_DEFAULT_REGION").ok(),
        })
    }
}

#[async_trait]
impl ModelInvoker for BedrockInvoker {
    async fn invoke(&self, request: &ModelRequest) -> Result<String, LlmError> {
        let url = format!("{}/model/{}/invoke", self.endpoint, request.model_id);
        debug!("Invoking model {} via {}", request.model_id, url);

        let body = InvokeBody {
            anthropic_version: "bedrock-2023-05-31",
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let mut builder = self.client.post(&url).json(&body);
        if let Some(region) = &self.region {
            builder = builder.header("X-Amzn-Bedrock-Region", region);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            error!("Model service responded with status {}: {}", status, error_body);
            return Err(LlmError::ResponseError(format!(
                "model service responded with status {}: {}",
                status, error_body
            )));
        }

        let invoke_response: InvokeResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        let text = invoke_response
            .content
            .first()
            .map(|block| block.text.clone())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(LlmError::ResponseError(
                "model returned an empty completion".to_string(),
            ));
        }

        Ok(text)
    }
}
