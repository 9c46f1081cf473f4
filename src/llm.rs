use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result, Service};

const SYSTEM_PROMPT: &str = "Responda como se você fosse o melhor advogado do Brasil utilizando termos jurídicos. \
Cite qual a lei e quais os artigos. \
Use o contexto dos documentos fornecidos para responder às perguntas do usuário da forma mais precisa possível. \
Se a pergunta do usuário estiver pouco clara ou ambígua, faça uma ou duas perguntas curtas de esclarecimento antes de responder. \
Se o contexto dos documentos não for suficiente para responder completamente à pergunta, combine-o com seu conhecimento geral. \
Se sua resposta contiver informações que não estejam nos documentos, identifique claramente como \"Baseado em conhecimento geral\".";

pub struct LLMConfig {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One completed exchange in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

/// Produces the next assistant message for a conversation.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct LLM {
    client: Client,
    endpoint: String,
    config: LLMConfig,
}

impl LLM {
    pub fn new(api_key: &str, base_url: &str, config: LLMConfig, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RagError::config("missing OpenAI API key"));
        }
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| RagError::config("invalid OpenAI API key"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::config(format!("failed to build OpenAI HTTP client: {err}")))?;
        Ok(LLM {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            config,
        })
    }
}

#[async_trait]
impl ChatModel for LLM {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| RagError::from_reqwest(Service::ChatCompletion, err))?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::from_status(Service::ChatCompletion, status, text));
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| RagError::malformed(Service::ChatCompletion, err.to_string()))?;
        parsed.into_answer()
    }
}

/// Assembles the prompt: instructions, retrieved context, prior turns, then the new message.
pub fn build_messages(context: &str, history: &[Turn], user_input: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new(Role::System, SYSTEM_PROMPT)];

    if !context.trim().is_empty() {
        messages.push(ChatMessage::new(
            Role::System,
            format!("Relevant document context (extracted from local files):\n{context}"),
        ));
    }

    for turn in history {
        messages.push(ChatMessage::new(Role::User, turn.user.as_str()));
        messages.push(ChatMessage::new(Role::Assistant, turn.assistant.as_str()));
    }

    messages.push(ChatMessage::new(Role::User, user_input));
    messages
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl ChatResponse {
    fn into_answer(self) -> Result<String> {
        self.choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| {
                RagError::malformed(Service::ChatCompletion, "response contained no message")
            })
    }
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
