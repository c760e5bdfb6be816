pub mod providers;

use crate::config::ModelsConfig;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// One model-service call: a model id, a system directive, a user message,
/// a temperature and an output bound.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model_id: String,
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: &ModelRequest) -> Result<String, LlmError>;
}

pub struct LlmManager {
    invoker: Box<dyn ModelInvoker + Send + Sync>,
}

impl LlmManager {
    pub fn new(config: &ModelsConfig) -> Result<Self, LlmError> {
        let invoker: Box<dyn ModelInvoker + Send + Sync> = match config.backend.as_str() {
            "bedrock" => Box::new(providers::bedrock::BedrockInvoker::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported model backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self { invoker })
    }

    /// Wraps an arbitrary invoker; the seam the tests mock through.
    pub fn with_invoker(invoker: Box<dyn ModelInvoker + Send + Sync>) -> Self {
        Self { invoker }
    }

    pub async fn invoke(&self, request: &ModelRequest) -> Result<String, LlmError> {
        self.invoker.invoke(request).await
    }
}
