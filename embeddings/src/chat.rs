//! Chat generation providers and token streaming.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};
use crate::provider::OpenAIProvider;

/// Capacity of the channel between a streaming producer and its consumer.
const STREAM_BUFFER: usize = 64;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Sampling parameters for one completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Model override; the provider default is used when unset.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.2,
            max_tokens: 1024,
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A finished, non-streamed completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

/// One event of a streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of generated text.
    Token(String),
    /// Generation finished normally.
    Done,
    /// Generation failed; no further events follow.
    Error(String),
}

/// Receiving half of a streamed answer.
///
/// Dropping the stream cancels the producer at its next send.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TokenStream {
    /// Create a connected sender/stream pair.
    pub fn channel() -> (mpsc::Sender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (tx, Self { rx })
    }

    /// Receive the next event, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into a single string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(event) = self.recv().await {
            match event {
                StreamEvent::Token(token) => text.push_str(&token),
                StreamEvent::Done => break,
                StreamEvent::Error(message) => return Err(ProviderError::Stream(message)),
            }
        }
        Ok(text)
    }
}

/// Trait for text generation providers.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Whether [`GenerationProvider::stream_chat_completion`] streams natively.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Produce a full completion for the given conversation.
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatCompletion>;

    /// Produce a completion as a stream of tokens.
    ///
    /// Providers without native streaming emit the full answer as one token.
    async fn stream_chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<TokenStream> {
        let completion = self.chat_completion(messages, params).await?;
        let (tx, stream) = TokenStream::channel();
        // Fresh channel with spare capacity; both sends succeed.
        let _ = tx.try_send(StreamEvent::Token(completion.content));
        let _ = tx.try_send(StreamEvent::Done);
        Ok(stream)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    model: String,
    choices: Vec<OpenAIChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

impl OpenAIProvider {
    async fn send_chat(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let model = params.model.as_deref().unwrap_or(&self.chat_model);

        debug!("Requesting chat completion with model: {model} (stream: {stream})");

        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": stream,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }
}

#[async_trait]
impl GenerationProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatCompletion> {
        let response = self.send_chat(messages, params, false).await?;
        let result: OpenAIChatResponse = response.json().await?;

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices returned".to_string()))?;

        Ok(ChatCompletion {
            content: choice.message.content,
            model: result.model,
            usage: result.usage,
            finish_reason: choice.finish_reason,
        })
    }

    async fn stream_chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<TokenStream> {
        let response = self.send_chat(messages, params, true).await?;
        let (tx, stream) = TokenStream::channel();

        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Chat stream failed: {e}");
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                if event.data.trim() == "[DONE]" {
                    break;
                }

                let chunk: OpenAIStreamChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                let tokens = chunk
                    .choices
                    .into_iter()
                    .filter_map(|choice| choice.delta.content)
                    .filter(|token| !token.is_empty());
                for token in tokens {
                    if tx.send(StreamEvent::Token(token)).await.is_err() {
                        debug!("Stream consumer went away, stopping generation");
                        return;
                    }
                }
            }
            let _ = tx.send(StreamEvent::Done).await;
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct EchoProvider;

    #[async_trait]
    impl GenerationProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn chat_completion(
            &self,
            messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> Result<ChatCompletion> {
            Ok(ChatCompletion {
                content: messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
                model: "echo".to_string(),
                usage: None,
                finish_reason: Some("stop".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_default_stream_emits_single_token() {
        let provider = EchoProvider;
        let mut stream = provider
            .stream_chat_completion(&[ChatMessage::user("hello")], &CompletionParams::default())
            .await
            .unwrap();

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Token("hello".to_string()))
        );
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_openai_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {"role": "assistant", "content": "Paris."},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("test-key")
            .with_base_url(server.uri());

        let completion = provider
            .chat_completion(
                &[ChatMessage::user("Capital of France?")],
                &CompletionParams::default(),
            )
            .await
            .unwrap();

        assert_eq!(completion.content, "Paris.");
        assert_eq!(completion.usage.map(|u| u.total_tokens), Some(12));
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_openai_streaming() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let provider = OpenAIProvider::new()
            .with_api_key("test-key")
            .with_base_url(server.uri());

        let stream = provider
            .stream_chat_completion(&[ChatMessage::user("hi")], &CompletionParams::default())
            .await
            .unwrap();

        assert_eq!(stream.collect_text().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_collect_text_surfaces_errors() {
        let (tx, stream) = TokenStream::channel();
        tx.send(StreamEvent::Token("partial".to_string()))
            .await
            .unwrap();
        tx.send(StreamEvent::Error("boom".to_string())).await.unwrap();
        drop(tx);

        let err = stream.collect_text().await.unwrap_err();
        assert!(matches!(err, ProviderError::Stream(_)));
    }
}
