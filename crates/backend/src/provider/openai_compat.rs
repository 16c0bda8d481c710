mod input;
mod output;

use std::sync::OnceLock;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;

use self::input::OpenAiChatRequest;
use self::output::{OpenAiChatResponse, OpenAiStreamChunk};
use crate::error::{BackendError, BackendResult};
use crate::http_client::build_http_client;
use crate::messages::ChatOutcome;
use crate::provider::{Backend, ChatParams, FrameStream, ProjectedTool, RequestHook, project_tools, run_hook};
use crate::retry::with_retries;

const BACKEND_NAME: &str = "openai";

/// OpenAI-compatible adapter: `POST /v1/chat/completions`, SSE streaming
/// terminated by a `[DONE]` sentinel.
pub(crate) struct OpenAiCompatBackend {
    client: Client,
    endpoint: String,
    model: String,
    read_timeout: Duration,
    retry_attempts: u32,
    retry_initial_delay: Duration,
    hook: Option<RequestHook>,
    projected_tools: OnceLock<Vec<ProjectedTool>>,
}

impl OpenAiCompatBackend {
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
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let model = params.model_override.unwrap_or(&self.model);
        let request = OpenAiChatRequest::build(model, &params, self.tools_for(&params), stream);

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
                    .map_err(|e| BackendError::from_reqwest(e, "sending chat request to openai backend"))?;

                let status = response.status();

                if !status.is_success() {
                    let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
                    log::error!("OpenAI-compatible API error ({status}): {body}");

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
impl Backend for OpenAiCompatBackend {
    async fn chat(&self, params: ChatParams<'_>) -> BackendResult<ChatOutcome> {
        let response = self.send(params, false).await?;

        let body = response
            .text()
            .await
            .map_err(|e| BackendError::from_reqwest(e, "reading openai response body"))?;

        let decoded: OpenAiChatResponse = serde_json::from_str(&body).map_err(|e| {
            log::error!("Unparseable openai response: {e}; body: {}", truncate_body(&body));
            BackendError::Protocol(format!("invalid chat completion response: {e}"))
        })?;

        decoded.into_outcome()
    }

    async fn chat_stream(&self, params: ChatParams<'_>) -> BackendResult<FrameStream> {
        let response = self.send(params, true).await?;

        let frames = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        return Some(Err(BackendError::Protocol(format!("SSE parse error: {e}"))));
                    }
                };

                if event.data.trim() == "[DONE]" {
                    return None;
                }

                match serde_json::from_str::<OpenAiStreamChunk>(&event.data) {
                    Ok(chunk) => Some(Ok(chunk.into_frame())),
                    Err(e) => {
                        log::warn!("Skipping unparseable stream chunk: {e}");
                        None
                    }
                }
            })
            .boxed();

        Ok(frames)
    }

    async fn health(&self) -> BackendResult<()> {
        let url = format!("{}/v1/models", self.endpoint);

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
            .get("data")
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
