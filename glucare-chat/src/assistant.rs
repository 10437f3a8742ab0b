//! Relay to the external diabetes assistant service.
//!
//! The assistant is an opaque HTTP collaborator: a question goes out as
//! `POST {endpoint}/ai-chat` and a `{ "response": ... }` document comes back.
//! Nothing here generates replies.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::config::chat::AssistantConfig;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

const CHAT_PATH: &str = "ai-chat";

/// Errors raised while asking the assistant.
#[derive(Debug, Error)]
pub enum AssistantError {
    /// No endpoint is configured.
    #[error("assistant endpoint is not configured")]
    NotConfigured,
    /// The endpoint URL cannot be extended with the chat path.
    #[error("invalid assistant endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    /// Transport failure or undecodable response.
    #[error("assistant request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Non-success HTTP status.
    #[error("assistant responded with status {0}")]
    Status(u16),
    /// The service answered without any text.
    #[error("assistant returned an empty reply")]
    EmptyReply,
}

/// Question relayed to the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantRequest {
    /// The user's message.
    pub message: String,
    /// Asking user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Free-form conversation context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl AssistantRequest {
    /// Request carrying only the question.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: None,
            context: None,
        }
    }

    /// Attaches the asking user.
    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// Attaches conversation context.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Reply document of the assistant service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantReply {
    /// Reply text.
    pub response: String,
    /// Service's confidence in the reply, between 0 and 1.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Topic the service filed the question under, e.g. `glucose`.
    #[serde(default)]
    pub category: Option<String>,
    /// Follow-up prompts suggested by the service.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Something that answers chat questions.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Produces a reply to `request`.
    async fn reply(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError>;
}

/// [`Assistant`] backed by the HTTP assistant service.
#[derive(Debug, Clone)]
pub struct HttpAssistant {
    client: reqwest::Client,
    chat_url: Url,
}

impl HttpAssistant {
    /// Client for the service rooted at `endpoint`.
    ///
    /// # Errors
    /// Returns an error if the chat URL cannot be derived from `endpoint` or
    /// the HTTP client cannot be built.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, AssistantError> {
        let mut base = endpoint;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            chat_url: base.join(CHAT_PATH)?,
        })
    }

    /// Client configured from [`AssistantConfig`].
    ///
    /// # Errors
    /// [`AssistantError::NotConfigured`] when no endpoint is set, otherwise as
    /// [`Self::new`].
    pub fn from_config(config: &AssistantConfig) -> Result<Self, AssistantError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or(AssistantError::NotConfigured)?;
        Self::new(endpoint, config.timeout())
    }

    /// URL questions are posted to.
    #[must_use]
    pub fn chat_url(&self) -> &Url {
        &self.chat_url
    }
}

#[async_trait]
impl Assistant for HttpAssistant {
    #[instrument(name = "chat.assistant_reply", skip(self, request), fields(url = %self.chat_url), err)]
    async fn reply(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        let response = self.client.post(self.chat_url.clone()).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssistantError::Status(status.as_u16()));
        }

        let reply: AssistantReply = response.json().await?;
        if reply.response.trim().is_empty() {
            return Err(AssistantError::EmptyReply);
        }
        debug!(category = ?reply.category, "assistant replied");
        Ok(reply)
    }
}
