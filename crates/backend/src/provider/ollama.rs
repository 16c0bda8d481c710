mod input;
mod output;

use std::sync::OnceLock;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;

use self::input::OllamaChatRequest;
use self::output::OllamaChatResponse;
use crate::error::{BackendError, BackendResult};
use crate::http_client::build_http_client;
use crate::messages::ChatOutcome;
use crate::provider::{Backend, ChatParams, FrameStream, ProjectedTool, RequestHook, project_tools, run_hook};
use crate::retry::with_retries;

const BACKEND_NAME: &str = "ollama";

/// Native-dialect adapter: `POST /api/chat`, newline-delimited JSON
/// streaming with a `done: true` terminator.
pub(crate) struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
    read_timeout: Duration,
    retry_attempts: u32,
    retry_initial_delay: Duration,
    hook: Option<RequestHook>,
    projected_tools: OnceLock<Vec<ProjectedTool>>,
}

impl OllamaBackend {
    pub(crate) fn new(config: &config::BackendConfig, hook: Option<RequestHook>) -> Self {
        Self {
            client: build_http_client(config.connect_timeout()),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            read_timeout: config.read_timeout(),
            retry_attempts: config.retry_attempts,
            retry_initial_delay: config.retry_initial_delay(),
            hook,
            projected_tools: OnceLock::new(),
        }
    }

    fn tools_for(&self, params: &ChatParams<'_>) -> Option<&[ProjectedTool]> {
        if params.tools.is_empty() {
            return None;
        }

        Some(self.projected_tools.get_or_init(|| project_tools(params.tools)))
    }

    async fn send(&self, params: ChatParams<'_>, stream: bool) -> BackendResult<reqwest::Response> {
        let url = format!("{}/api/chat", self.endpoint);
        let model = params.model_override.unwrap_or(&self.model);
        let request = OllamaChatRequest::build(model, &params, self.tools_for(&params), stream);

        let payload = serde_json::to_value(&request)
            .map_err(|e| BackendError::Protocol(format!("failed to serialize request: {e}")))?;

        run_hook(self.hook.as_ref(), BACKEND_NAME, &payload);

        with_retries(self.retry_attempts, self.retry_initial_delay, || {
            let client = &self.client;
            let url = &url;
            let payload = &payload;
            let read_timeout = self.read_timeout;

            async move {
                let response = client
                    .post(url)
                    .timeout(read_timeout)
                    .json(payload)
                    .send()
                    .await
                    .map_err(|e| BackendError::from_reqwest(e, "sending chat request to ollama"))?;

                let status = response.status();

                if !status.is_success() {
                    let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
                    log::error!("Ollama API error ({status}): {body}");

                    return Err(BackendError::Api {
                        status: status.as_u16(),
                        message: body,
                    });
                }

                Ok(response)
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl Backend for OllamaBackend {
    async fn chat(&self, params: ChatParams<'_>) -> BackendResult<ChatOutcome> {
        let response = self.send(params, false).await?;

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, "reading ollama response body"))?;

        let decoded: OllamaChatResponse = serde_json::from_str(&body).map_err(|e| {
            log::error!("Unparseable ollama response: {e}; body: {}", truncate_body(&body));
            BackendError::Protocol(format!("invalid ollama chat response: {e}"))
        })?;

        Ok(decoded.into_outcome())
    }

    async fn chat_stream(&self, params: ChatParams<'_>) -> BackendResult<FrameStream> {
        let response = self.send(params, true).await?;

        // One JSON frame per line; tool calls arrive complete, so the
        // fragment index is a running counter across frames.
        let frames = ndjson_lines(response.bytes_stream())
            .scan(0usize, |next_call_index, line| {
                let item = line.and_then(|line| {
                    let decoded: OllamaChatResponse = serde_json::from_str(&line)
                        .map_err(|e| BackendError::Protocol(format!("invalid ollama stream frame: {e}")))?;

                    Ok(decoded.into_frame(next_call_index))
                });

                futures::future::ready(Some(item))
            })
            .boxed();

        Ok(frames)
    }

    async fn health(&self) -> BackendResult<()> {
        let url = format!("{}/api/tags", self.endpoint);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unreachable(format!(
                "listing endpoint returned {}",
                response.status()
            )));
        }

        let listing: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid model listing: {e}")))?;

        let has_models = listing
            .get("models")
            .and_then(Value::as_array)
            .is_some_and(|models| !models.is_empty());

        if !has_models {
            return Err(BackendError::NoModelLoaded);
        }

        Ok(())
    }

    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

fn truncate_body(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(512)
        .map(|(index, _)| index)
        .unwrap_or(body.len());
    &body[..end]
}

/// Split a byte stream into newline-terminated JSON lines, skipping
/// blanks. Transport errors pass through as connection errors.
fn ndjson_lines<S>(bytes: S) -> impl futures::Stream<Item = BackendResult<String>>
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>>,
{
    bytes
        .scan(String::new(), |buffer, chunk| {
            let lines: Vec<BackendResult<String>> = match chunk {
                Ok(chunk) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    let mut lines = Vec::new();
                    while let Some(newline) = buffer.find('\n') {
                        let line = buffer[..newline].trim().to_string();
                        buffer.drain(..=newline);

                        if !line.is_empty() {
                            lines.push(Ok(line));
                        }
                    }
                    lines
                }
                Err(e) => vec![Err(BackendError::from_reqwest(e, "reading ollama stream"))],
            };

            futures::future::ready(Some(futures::stream::iter(lines)))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn ndjson_reassembles_split_lines() {
        let chunks: Vec<reqwest::Result<bytes::Bytes>> = vec![
            Ok(bytes::Bytes::from_static(b"{\"a\":")),
            Ok(bytes::Bytes::from_static(b"1}\n{\"b\":2}\n")),
        ];

        let lines: Vec<String> = ndjson_lines(futures::stream::iter(chunks))
            .map(|line| line.unwrap())
            .collect()
            .await;

        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }
}
