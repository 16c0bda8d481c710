//! OpenAI-compatible request surface and tool orchestration.

#![deny(missing_docs)]

mod error;
mod orchestrator;
mod system_prompt;
pub mod wire;

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Sse, sse::Event},
    routing::{get, post},
};
use backend::Backend;
pub use error::{GatewayError, GatewayResult};
use futures::StreamExt;
pub use orchestrator::{CompletionOutcome, Orchestrator, StreamHandle};
use ragdocs::DocsIndex;
pub use system_prompt::SystemPromptCache;
use tools::ToolRegistry;

use crate::wire::{ChatCompletionResponse, ChunkEmitter, Model, ModelsResponse};

/// Shared per-process state behind the HTTP surface.
pub struct GatewayState {
    orchestrator: Arc<Orchestrator>,
    backend: Arc<dyn Backend>,
    model_name: String,
}

impl GatewayState {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<ToolRegistry>,
        chat_config: config::ChatConfig,
        rag: Option<Arc<DocsIndex>>,
    ) -> Self {
        let model_name = backend.default_model().to_string();
        let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&backend), registry, chat_config, rag));

        Self {
            orchestrator,
            backend,
            model_name,
        }
    }
}

/// The gateway's three endpoints.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .with_state(state)
}

/// Handle chat completion requests, streaming and non-streaming.
async fn chat_completions(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> GatewayResult<axum::response::Response> {
    let request = wire::parse_request(&body)?;

    log::debug!(
        "Chat request: {} messages, stream={}, model_override={:?}",
        request.messages.len(),
        request.stream,
        request.model
    );

    if request.stream {
        // The orchestrator hands back a live channel; each delta of the
        // terminal response becomes one SSE event as it arrives.
        let StreamHandle { model, deltas } = Arc::clone(&state.orchestrator).run_stream(request);

        let emitter = ChunkEmitter::new(model);
        let opener = emitter.opener();
        let stop_emitter = emitter.clone();

        let delta_chunks = futures::stream::unfold(deltas, |mut deltas| async move {
            deltas.recv().await.map(|content| (content, deltas))
        })
        .map(move |content| emitter.delta(content));

        let chunks = futures::stream::once(async move { opener })
            .chain(delta_chunks)
            .chain(futures::stream::once(async move { stop_emitter.stop() }));

        let event_stream = chunks
            .map(|chunk| {
                let json = serde_json::to_string(&chunk).unwrap_or_else(|e| {
                    log::error!("Failed to serialize chunk: {e}");
                    r#"{"error":"serialization failed"}"#.to_string()
                });

                Ok::<_, Infallible>(Event::default().data(json))
            })
            .chain(futures::stream::once(async {
                Ok::<_, Infallible>(Event::default().data("[DONE]"))
            }));

        return Ok(Sse::new(event_stream).into_response());
    }

    let outcome = state.orchestrator.run(&request).await;
    let response = ChatCompletionResponse::new(outcome.model, outcome.content);

    Ok(Json(response).into_response())
}

/// List the single configured model.
async fn list_models(State(state): State<Arc<GatewayState>>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        object: "list",
        data: vec![Model {
            id: state.model_name.clone(),
            object: "model",
            created: 0,
            owned_by: "toolgate",
        }],
    })
}

/// Liveness probe backed by the backend's listing endpoint.
async fn health(State(state): State<Arc<GatewayState>>) -> axum::response::Response {
    match state.backend.health().await {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "backend": state.backend.name(),
            "model": state.model_name,
        }))
        .into_response(),
        Err(err) => {
            log::warn!("Health probe failed: {err}");

            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unavailable",
                    "detail": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}
