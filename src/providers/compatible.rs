//! OpenAI-compatible chat completions provider.
//! Works against any endpoint that speaks `/v1/chat/completions`, streaming or not.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use super::traits::{ChatMessage, ChatModel};
use crate::config::ProviderConfig;

pub struct OpenAiCompatibleProvider {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    model: String,
    temperature: f64,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<&str>,
        model: &str,
        temperature: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            model: model.to_string(),
            temperature,
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            "openai-compatible",
            &config.base_url,
            config.api_key.as_deref(),
            &config.model,
            config.temperature,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Build the full URL for chat completions, detecting if base_url already includes the path.
    fn chat_completions_url(&self) -> String {
        let has_full_endpoint = reqwest::Url::parse(&self.base_url)
            .map(|url| {
                url.path()
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            })
            .unwrap_or_else(|_| {
                self.base_url
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            });

        if has_full_endpoint {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> anyhow::Result<reqwest::RequestBuilder> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "{} API key not set. Set provider.api_key in config.toml or VERSA_API_KEY.",
                self.name
            )
        })?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages
                .iter()
                .map(|m| Message {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: self.temperature,
            stream: Some(stream),
        };

        Ok(self
            .client
            .post(self.chat_completions_url())
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&request))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ══════════════════════════════════════════════════════════
// SSE streaming types for OpenAI-compatible chat completions
// ══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct StreamChatResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Parse complete SSE lines from a buffer and extract `data:` payloads.
/// Returns (payloads, remaining_buffer); an unterminated trailing line is
/// returned as the remainder and not parsed.
fn parse_sse_lines(buffer: &str) -> (Vec<String>, String) {
    let (complete, remaining) = match buffer.rfind('\n') {
        Some(idx) => (&buffer[..idx], &buffer[idx + 1..]),
        None => ("", buffer),
    };

    let payloads = complete
        .split('\n')
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty() && *data != "[DONE]")
        .map(ToString::to_string)
        .collect();

    (payloads, remaining.to_string())
}

/// Split every complete line off the raw byte buffer and decode it. Cutting
/// at `\n` before decoding keeps a multi-byte character that straddles two
/// network chunks intact until both halves have arrived.
fn drain_complete_lines(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.iter().rposition(|&b| b == b'\n')?;
    let complete: Vec<u8> = buffer.drain(..=end).collect();
    Some(String::from_utf8_lossy(&complete).into_owned())
}

fn forward_payloads(
    payloads: Vec<String>,
    content_buf: &mut String,
    tx: &mpsc::UnboundedSender<String>,
) {
    for payload in payloads {
        let Ok(chunk) = serde_json::from_str::<StreamChatResponse>(&payload) else {
            tracing::debug!(payload = %payload, "Skipping unparseable stream payload");
            continue;
        };
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if content.is_empty() {
                    continue;
                }
                content_buf.push_str(&content);
                let _ = tx.send(content);
            }
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let response = self.request(messages, false)?.send().await?;
        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }

        let chat_response: ApiChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| anyhow::anyhow!("No response from {}", self.name))
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<String> {
        let response = self.request(messages, true)?.send().await?;
        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }

        let mut content_buf = String::new();
        let mut sse_buf: Vec<u8> = Vec::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result?;
            sse_buf.extend_from_slice(&bytes);

            if let Some(lines) = drain_complete_lines(&mut sse_buf) {
                let (payloads, _) = parse_sse_lines(&lines);
                forward_payloads(payloads, &mut content_buf, &tx);
            }
        }

        // Process any remaining SSE data
        if !sse_buf.is_empty() {
            sse_buf.push(b'\n');
            if let Some(lines) = drain_complete_lines(&mut sse_buf) {
                let (payloads, _) = parse_sse_lines(&lines);
                forward_payloads(payloads, &mut content_buf, &tx);
            }
        }

        Ok(content_buf)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, routing::post, Router};

    fn make_provider(url: &str, key: Option<&str>) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new("test", url, key, "gpt-test", 0.2, Duration::from_secs(5))
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    #[test]
    fn strips_trailing_slash() {
        let p = make_provider("https://example.com/v1/", None);
        assert_eq!(p.base_url, "https://example.com/v1");
        assert_eq!(p.chat_completions_url(), "https://example.com/v1/chat/completions");
    }

    #[test]
    fn chat_completions_url_custom_full_endpoint() {
        let p = make_provider("https://ark.example.com/api/coding/v3/chat/completions", None);
        assert_eq!(
            p.chat_completions_url(),
            "https://ark.example.com/api/coding/v3/chat/completions"
        );
    }

    #[tokio::test]
    async fn stream_fails_without_key() {
        let p = make_provider("https://example.com/v1", None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = p.stream(&[ChatMessage::user("hi")], tx).await.unwrap_err();
        assert!(err.to_string().contains("API key not set"));
    }

    #[test]
    fn request_serializes_correctly() {
        let req = ChatRequest {
            model: "gpt-test".into(),
            messages: vec![Message {
                role: "user".into(),
                content: "hello".into(),
            }],
            temperature: 0.4,
            stream: Some(true),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"model\":\"gpt-test\""));
        assert!(json.contains("\"stream\":true"));
    }

    // ══════════════════════════════════════════════════════════
    // SSE streaming tests
    // ══════════════════════════════════════════════════════════

    #[test]
    fn parse_sse_lines_basic() {
        let input = "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n";
        let (payloads, remaining) = parse_sse_lines(input);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("Hello"));
        assert!(remaining.is_empty());
    }

    #[test]
    fn parse_sse_lines_done_event() {
        let (payloads, _) = parse_sse_lines("data: [DONE]\n\n");
        assert!(payloads.is_empty());
    }

    #[test]
    fn parse_sse_lines_keeps_incomplete_tail() {
        let input = "data: {\"a\":1}\ndata: {\"choices\":[{\"delta\":{\"content\":\"pa";
        let (payloads, remaining) = parse_sse_lines(input);
        assert_eq!(payloads, vec!["{\"a\":1}"]);
        assert!(remaining.starts_with("data: {\"choices\""));
    }

    #[test]
    fn parse_sse_lines_handles_crlf() {
        let (payloads, _) = parse_sse_lines("data: {\"x\":1}\r\n\r\n");
        assert_eq!(payloads, vec!["{\"x\":1}"]);
    }

    #[test]
    fn stream_chunk_deserializes() {
        let json = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        let chunk: StreamChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hello"));
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[tokio::test]
    async fn stream_forwards_deltas_from_server() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\\nworld\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || async move { ([(header::CONTENT_TYPE, "text/event-stream")], body) }),
        );
        let url = serve(router).await;

        let p = make_provider(&url, Some("sk-test"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let full = p.stream(&[ChatMessage::user("hi")], tx).await.unwrap();

        assert_eq!(full, "Hello\nworld");
        assert_eq!(rx.recv().await.as_deref(), Some("Hel"));
        assert_eq!(rx.recv().await.as_deref(), Some("lo\nworld"));
    }

    #[test]
    fn complete_lines_wait_for_split_characters() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"Xin chào\"}}]}\n".as_bytes();
        let cut = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut buffer = line[..cut].to_vec();
        assert!(drain_complete_lines(&mut buffer).is_none());
        buffer.extend_from_slice(&line[cut..]);
        let text = drain_complete_lines(&mut buffer).unwrap();
        assert!(buffer.is_empty());
        assert!(text.contains("Xin chào"));
        assert!(!text.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn stream_decodes_characters_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Xin chào\"}}]}\n\ndata: [DONE]\n\n";
        let cut = body.as_bytes().iter().position(|&b| b == 0xC3).unwrap() + 1;
        let parts = vec![body.as_bytes()[..cut].to_vec(), body.as_bytes()[cut..].to_vec()];

        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let parts = parts.clone();
                async move {
                    let chunks =
                        futures_util::stream::unfold(parts.into_iter(), |mut rest| async move {
                            let next = rest.next()?;
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Some((Ok::<_, std::io::Error>(next), rest))
                        });
                    (
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        axum::body::Body::from_stream(chunks),
                    )
                }
            }),
        );
        let url = serve(router).await;

        let p = make_provider(&url, Some("sk-test"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let full = p.stream(&[ChatMessage::user("hi")], tx).await.unwrap();

        assert_eq!(full, "Xin chào");
        assert_eq!(rx.recv().await.as_deref(), Some("Xin chào"));
    }

    #[tokio::test]
    async fn complete_reads_first_choice() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                axum::Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "Quarterly Report"}}]
                }))
            }),
        );
        let url = serve(router).await;

        let p = make_provider(&url, Some("sk-test"));
        let title = p.complete(&[ChatMessage::user("title?")]).await.unwrap();
        assert_eq!(title, "Quarterly Report");
    }

    #[tokio::test]
    async fn error_status_is_sanitized() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    "invalid key sk-abcdef123456",
                )
            }),
        );
        let url = serve(router).await;

        let p = make_provider(&url, Some("sk-test"));
        let err = p.complete(&[ChatMessage::user("hi")]).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("401"));
        assert!(text.contains("[REDACTED]"));
        assert!(!text.contains("abcdef123456"));
    }
}
