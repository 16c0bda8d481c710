//! The tool-calling orchestrator.
//!
//! A single-task per-request iteration bounded by an iteration budget
//! and a wall-clock budget. Tool calls are dispatched in order and their
//! results spliced back as tool messages; budget exhaustion falls off to
//! one final-synthesis call with tools disabled. Backend failures never
//! surface as transport errors: the caller always receives completion
//! text.
//!
//! Streaming requests run the same loop, but non-terminal iteration
//! responses are consumed without forwarding anything; only the terminal
//! response's tokens go to the caller, as deltas over a channel. The
//! final-synthesis call streams through [`ThinkerGate`], which forwards
//! tokens as they arrive once the thinker marker has passed, and holds
//! content otherwise so malformed output can still be retried before
//! anything reaches the wire.

use std::sync::Arc;
use std::time::Instant;

use backend::{Backend, BackendError, ChatMessage, ChatOutcome, ChatParams, StreamAccumulator, ToolChoice};
use futures::StreamExt;
use ragdocs::DocsIndex;
use tokio::sync::mpsc;
use tools::ToolRegistry;

use crate::system_prompt::SystemPromptCache;
use crate::wire::ChatRequest;

/// Nudge appended when `required` produced no tool call.
const REQUIRED_NUDGE: &str =
    "You must use one of the provided tools to answer this request. Call the most appropriate tool now.";

/// Stern instruction prepended when final synthesis emitted raw
/// role/channel markers.
const CLEAN_OUTPUT_INSTRUCTION: &str = "Respond with plain, clean text only. Do not emit internal role or channel \
    markers such as <|start|> or <|channel|>; produce the final answer directly.";

/// Returned when final synthesis itself fails.
const SYNTHESIS_APOLOGY: &str =
    "I'm sorry, I was unable to produce a final answer from the gathered tool results. Please try again.";

/// Returned when malformed output survived the retry.
const MALFORMED_FALLBACK: &str = "I'm sorry, the model produced malformed output for this request. Please try again.";

/// Literal substrings marking internal role/channel leakage.
const MALFORMED_MARKERS: &[&str] = &["<|start|>", "<|channel|>", "<|message|>", "<|constrain|>", "<|end|>"];

/// Marker separating thinking from the final answer in "thinker" models.
const FINAL_RESPONSE_MARKER: &str = "[BEGIN FINAL RESPONSE]";

/// Delta channel depth; backpressure onto the backend read.
const STREAM_CHANNEL_DEPTH: usize = 32;

/// The per-request iteration engine. Shared across requests behind an
/// `Arc`; owns no per-request state.
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    registry: Arc<ToolRegistry>,
    chat_config: config::ChatConfig,
    system_prompt: SystemPromptCache,
    rag: Option<Arc<DocsIndex>>,
}

/// Final result of one non-streaming request.
#[derive(Debug)]
pub struct CompletionOutcome {
    /// Final assistant text.
    pub content: String,
    /// Model name the caller should see.
    pub model: String,
}

/// Live handle to one streaming request: the terminal response arrives
/// as content deltas; the channel closes when generation is done.
pub struct StreamHandle {
    /// Model name the caller should see.
    pub model: String,
    /// Terminal-response content deltas, in order.
    pub deltas: mpsc::Receiver<String>,
}

enum TerminalOutcome {
    /// The terminal content went to the caller.
    Forwarded,
    /// Malformed markers were detected before anything was forwarded.
    Malformed,
}

impl Orchestrator {
    /// Build the engine.
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<ToolRegistry>,
        chat_config: config::ChatConfig,
        rag: Option<Arc<DocsIndex>>,
    ) -> Self {
        let system_prompt = SystemPromptCache::new(
            chat_config.system_prompt_path.clone(),
            chat_config.system_prompt_default.clone(),
        );

        Self {
            backend,
            registry,
            chat_config,
            system_prompt,
            rag,
        }
    }

    /// Run one non-streaming request to completion.
    pub async fn run(&self, request: &ChatRequest) -> CompletionOutcome {
        // Advisory: background index work yields while this guard lives.
        // Dropped on every exit path, panics included.
        let _pause = self.rag.as_ref().map(|index| index.pause_guard());

        let model = self.visible_model(request);

        let content = match self.run_loop(request, None).await {
            Ok(Some(content)) => content,
            Ok(None) => String::new(),
            Err(err) => {
                log::error!("Request failed against the backend: {err}");
                synthesized_error_content(&err)
            }
        };

        CompletionOutcome { content, model }
    }

    /// Run one streaming request. Non-terminal iterations are consumed
    /// without forwarding; the terminal response's tokens flow through
    /// the returned channel as they become available.
    pub fn run_stream(self: Arc<Self>, request: ChatRequest) -> StreamHandle {
        let model = self.visible_model(&request);
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);

        tokio::spawn(async move {
            let _pause = self.rag.as_ref().map(|index| index.pause_guard());

            match self.run_loop(&request, Some(&tx)).await {
                Ok(_) => {}
                Err(err) => {
                    log::error!("Streaming request failed against the backend: {err}");
                    let _ = tx.send(synthesized_error_content(&err)).await;
                }
            }
        });

        StreamHandle { model, deltas: rx }
    }

    fn visible_model(&self, request: &ChatRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.backend.default_model().to_string())
    }

    /// The iteration loop. With a sink the streaming transport is used
    /// and the terminal content is forwarded as deltas (returning
    /// `None`); without one the terminal content is returned whole.
    async fn run_loop(
        &self,
        request: &ChatRequest,
        sink: Option<&mpsc::Sender<String>>,
    ) -> Result<Option<String>, BackendError> {
        let started = Instant::now();
        let budget = self.chat_config.tool_loop_timeout();

        let mut messages = self.seed_messages(request).await;

        let temperature = request.temperature.unwrap_or(self.chat_config.default_temperature);

        // The override is threaded through each call's parameters and
        // never touches shared state.
        let model_override = request
            .model
            .as_deref()
            .filter(|model| *model != self.backend.default_model());

        let first_choice = request
            .tool_choice
            .unwrap_or_else(|| self.chat_config.first_iteration_tool_choice.into());

        let mut iteration = 0u32;
        let mut nudge_used = false;

        while iteration < self.chat_config.max_tool_iterations {
            if budget.is_some_and(|b| started.elapsed() >= b) {
                log::info!("Tool loop wall-clock budget exhausted after {iteration} iterations");
                break;
            }

            let tool_choice = if iteration == 0 { first_choice } else { ToolChoice::Auto };

            let (outcome, content_frames) = self
                .call_backend(&messages, true, temperature, tool_choice, model_override, sink.is_some())
                .await?;

            // Verbatim append, tool calls included, so the next call
            // sees consistent history.
            messages.push(outcome.message.clone());

            if !outcome.has_tool_calls() {
                if tool_choice == ToolChoice::Required && !nudge_used && !self.registry.is_empty() {
                    log::debug!("tool_choice=required produced no tool call; nudging once");
                    nudge_used = true;
                    messages.push(ChatMessage::user(REQUIRED_NUDGE));
                    continue;
                }

                // Normal exit: this response is the answer. Streaming
                // callers get it replayed frame by frame through the
                // marker gate; it could not be forwarded earlier because
                // tool calls may arrive at any point of a stream.
                let Some(tx) = sink else {
                    return Ok(Some(outcome.message.content));
                };

                forward_frames(content_frames, tx).await;
                return Ok(None);
            }

            for call in outcome.tool_calls() {
                // The wall clock aborts between dispatches, never
                // mid-call.
                if budget.is_some_and(|b| started.elapsed() >= b) {
                    log::info!("Wall-clock budget exhausted mid-iteration; skipping remaining tool calls");
                    break;
                }

                let result = self
                    .registry
                    .dispatch(&call.name, call.arguments.clone(), self.chat_config.max_tool_result_chars)
                    .await;

                messages.push(ChatMessage::tool(call.id.clone(), result));
            }

            iteration += 1;
        }

        match sink {
            Some(tx) => {
                self.stream_final_synthesis(&messages, temperature, model_override, tx)
                    .await?;
                Ok(None)
            }
            None => self
                .final_synthesis(&messages, temperature, model_override)
                .await
                .map(Some),
        }
    }

    /// One terminal call with tools disabled, forcing a natural-language
    /// answer from the gathered tool results. Raw tool output is never
    /// the final answer.
    async fn final_synthesis(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        model_override: Option<&str>,
    ) -> Result<String, BackendError> {
        let outcome = match self
            .call_backend(messages, false, temperature, ToolChoice::None, model_override, false)
            .await
        {
            Ok((outcome, _)) => outcome,
            Err(err) => {
                log::error!("Final synthesis failed: {err}");
                return Ok(SYNTHESIS_APOLOGY.to_string());
            }
        };

        if !contains_malformed_markers(&outcome.message.content) {
            return Ok(outcome.message.content);
        }

        log::warn!("Final synthesis emitted internal markers; retrying once");

        match self.retry_final_synthesis(messages, temperature, model_override).await {
            Some(content) => Ok(content),
            None => Ok(SYNTHESIS_APOLOGY.to_string()),
        }
    }

    /// Final synthesis for streaming callers. The call streams through
    /// the marker gate: tokens after a thinker marker are forwarded as
    /// they arrive; without a marker the content is held until stream
    /// end, scanned, and flushed frame by frame. Either way nothing
    /// malformed reaches the caller before the retry has had its chance.
    async fn stream_final_synthesis(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        model_override: Option<&str>,
        tx: &mpsc::Sender<String>,
    ) -> Result<(), BackendError> {
        match self.stream_terminal_call(messages, temperature, model_override, tx).await {
            Ok(TerminalOutcome::Forwarded) => Ok(()),
            Ok(TerminalOutcome::Malformed) => {
                let content = self
                    .retry_final_synthesis(messages, temperature, model_override)
                    .await
                    .unwrap_or_else(|| SYNTHESIS_APOLOGY.to_string());

                let _ = tx.send(content).await;
                Ok(())
            }
            Err(err) => {
                log::error!("Final synthesis failed: {err}");
                let _ = tx.send(SYNTHESIS_APOLOGY.to_string()).await;
                Ok(())
            }
        }
    }

    /// Stream one final-synthesis call through the marker gate,
    /// forwarding deltas onward as the gate releases them.
    async fn stream_terminal_call(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        model_override: Option<&str>,
        tx: &mpsc::Sender<String>,
    ) -> Result<TerminalOutcome, BackendError> {
        let params = ChatParams {
            messages,
            tools: &[],
            temperature,
            tool_choice: ToolChoice::None,
            model_override,
        };

        let mut stream = self.backend.chat_stream(params).await?;
        let mut gate = ThinkerGate::new();

        while let Some(frame) = stream.next().await {
            let frame = frame?;

            let Some(content) = frame.content else {
                continue;
            };

            match gate.feed(content) {
                GateAction::Hold => {}
                GateAction::Open(first) => {
                    // The held preamble is scanned before the first
                    // token goes out; nothing has been forwarded yet.
                    if contains_malformed_markers(gate.held()) {
                        log::warn!("Final synthesis emitted internal markers; retrying once");
                        return Ok(TerminalOutcome::Malformed);
                    }

                    if !first.is_empty() && tx.send(first).await.is_err() {
                        return Ok(TerminalOutcome::Forwarded);
                    }
                }
                GateAction::Forward(delta) => {
                    if tx.send(delta).await.is_err() {
                        return Ok(TerminalOutcome::Forwarded);
                    }
                }
            }
        }

        if gate.is_live() {
            return Ok(TerminalOutcome::Forwarded);
        }

        // No marker: the whole response is still held. Scan it, then
        // flush with the original frame granularity (no content loss).
        if contains_malformed_markers(gate.held()) {
            log::warn!("Final synthesis emitted internal markers; retrying once");
            return Ok(TerminalOutcome::Malformed);
        }

        for frame in gate.into_frames() {
            if tx.send(frame).await.is_err() {
                break;
            }
        }

        Ok(TerminalOutcome::Forwarded)
    }

    /// One stern retry after malformed output; `None` means the retry
    /// failed outright and the apology applies.
    async fn retry_final_synthesis(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        model_override: Option<&str>,
    ) -> Option<String> {
        let mut retry_messages = Vec::with_capacity(messages.len() + 1);
        retry_messages.push(ChatMessage::system(CLEAN_OUTPUT_INSTRUCTION));
        retry_messages.extend_from_slice(messages);

        match self
            .call_backend(&retry_messages, false, temperature, ToolChoice::None, model_override, false)
            .await
        {
            Ok((retry, _)) if !contains_malformed_markers(&retry.message.content) => {
                Some(strip_thinker_preamble(&retry.message.content).to_string())
            }
            Ok(_) => {
                log::error!("Final synthesis still malformed after retry; returning fallback");
                Some(MALFORMED_FALLBACK.to_string())
            }
            Err(err) => {
                log::error!("Final synthesis retry failed: {err}");
                None
            }
        }
    }

    /// One backend call. With `use_stream` the streaming transport is
    /// consumed into the same normalised outcome, and the content frames
    /// are kept so a terminal response can be replayed delta by delta.
    async fn call_backend(
        &self,
        messages: &[ChatMessage],
        offer_tools: bool,
        temperature: f32,
        tool_choice: ToolChoice,
        model_override: Option<&str>,
        use_stream: bool,
    ) -> Result<(ChatOutcome, Vec<String>), BackendError> {
        let tools = if offer_tools { self.registry.descriptors() } else { &[] };

        let params = ChatParams {
            messages,
            tools,
            temperature,
            tool_choice,
            model_override,
        };

        if !use_stream {
            return Ok((self.backend.chat(params).await?, Vec::new()));
        }

        let mut stream = self.backend.chat_stream(params).await?;
        let mut accumulator = StreamAccumulator::new();
        let mut content_frames = Vec::new();

        while let Some(frame) = stream.next().await {
            let frame = frame?;

            if let Some(content) = &frame.content {
                content_frames.push(content.clone());
            }

            accumulator.feed(frame);
        }

        Ok((accumulator.finish(), content_frames))
    }

    /// Inject the resolved system prompt unless the caller opened with
    /// its own system message.
    async fn seed_messages(&self, request: &ChatRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        let caller_has_system = request
            .messages
            .first()
            .is_some_and(|m| m.role == backend::Role::System);

        if !caller_has_system {
            messages.push(ChatMessage::system(self.system_prompt.resolve().await));
        }

        messages.extend(request.messages.iter().cloned());
        messages
    }
}

/// Replay a terminal response's content frames through the marker gate.
async fn forward_frames(frames: Vec<String>, tx: &mpsc::Sender<String>) {
    let mut gate = ThinkerGate::new();

    for frame in frames {
        match gate.feed(frame) {
            GateAction::Hold => {}
            GateAction::Open(first) => {
                if !first.is_empty() && tx.send(first).await.is_err() {
                    return;
                }
            }
            GateAction::Forward(delta) => {
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
        }
    }

    if !gate.is_live() {
        for frame in gate.into_frames() {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    }
}

/// What the gate wants done with one fed frame.
enum GateAction {
    /// Keep holding; nothing to forward yet.
    Hold,
    /// Marker found: forward this post-marker text, then go live.
    Open(String),
    /// Live: forward as-is.
    Forward(String),
}

/// Thinker-marker filter over a content stream.
///
/// Content is held until the marker appears; the marker may arrive split
/// across frames, so detection is a string search over the accumulating
/// buffer. Once it passes, everything after it forwards as it arrives.
/// A stream that never emits the marker keeps its full content in the
/// gate, recoverable via [`ThinkerGate::into_frames`].
struct ThinkerGate {
    held: String,
    frames: Vec<String>,
    live: bool,
}

impl ThinkerGate {
    fn new() -> Self {
        Self {
            held: String::new(),
            frames: Vec::new(),
            live: false,
        }
    }

    fn feed(&mut self, content: String) -> GateAction {
        if self.live {
            return GateAction::Forward(content);
        }

        self.held.push_str(&content);
        self.frames.push(content);

        match self.held.find(FINAL_RESPONSE_MARKER) {
            Some(position) => {
                self.live = true;
                let after = self.held[position + FINAL_RESPONSE_MARKER.len()..].trim_start().to_string();
                GateAction::Open(after)
            }
            None => GateAction::Hold,
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }

    /// Everything held so far (preamble and marker included).
    fn held(&self) -> &str {
        &self.held
    }

    /// The held frames, for the no-marker flush at stream end.
    fn into_frames(self) -> Vec<String> {
        self.frames
    }
}

fn contains_malformed_markers(content: &str) -> bool {
    MALFORMED_MARKERS.iter().any(|marker| content.contains(marker))
}

fn synthesized_error_content(err: &BackendError) -> String {
    match err {
        BackendError::Connection(_) | BackendError::Unreachable(_) => format!(
            "The inference backend could not be reached after retries. \
            Verify that it is running and that the endpoint is correct. ({err})"
        ),
        BackendError::Timeout(_) => {
            "The inference backend timed out while generating a response. \
            The model may be overloaded; try again or increase the read timeout."
                .to_string()
        }
        BackendError::NoModelLoaded => {
            "The inference backend is reachable but reports no loaded model. Load a model and retry.".to_string()
        }
        BackendError::Api { status, .. } => {
            format!("The inference backend rejected the request (HTTP {status}). Check the gateway logs for details.")
        }
        BackendError::Protocol(_) => {
            "The inference backend returned a response the gateway could not decode. \
            Check the gateway logs for the raw payload."
                .to_string()
        }
    }
}

/// Strip the thinker-marker preamble from a complete text: text before
/// the marker is suppressed; with no marker, the whole text is the
/// answer.
pub(crate) fn strip_thinker_preamble(content: &str) -> &str {
    match content.find(FINAL_RESPONSE_MARKER) {
        Some(position) => content[position + FINAL_RESPONSE_MARKER.len()..].trim_start(),
        None => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_detection_matches_signatures() {
        assert!(contains_malformed_markers("<|start|>assistant<|channel|>final"));
        assert!(!contains_malformed_markers("a normal answer with <tags>"));
    }

    #[test]
    fn thinker_preamble_is_suppressed() {
        let content = "thinking out loud...[BEGIN FINAL RESPONSE]  the answer";
        assert_eq!(strip_thinker_preamble(content), "the answer");
    }

    #[test]
    fn missing_marker_keeps_everything() {
        assert_eq!(strip_thinker_preamble("plain answer"), "plain answer");
    }

    #[test]
    fn gate_holds_until_stream_end_without_marker() {
        let mut gate = ThinkerGate::new();

        assert!(matches!(gate.feed("hello ".to_string()), GateAction::Hold));
        assert!(matches!(gate.feed("world".to_string()), GateAction::Hold));
        assert!(!gate.is_live());

        assert_eq!(gate.into_frames(), vec!["hello ".to_string(), "world".to_string()]);
    }

    #[test]
    fn gate_goes_live_after_the_marker() {
        let mut gate = ThinkerGate::new();

        assert!(matches!(gate.feed("thinking...".to_string()), GateAction::Hold));

        let GateAction::Open(first) = gate.feed("[BEGIN FINAL RESPONSE] answer".to_string()) else {
            unreachable!("marker should open the gate");
        };
        assert_eq!(first, "answer");

        let GateAction::Forward(next) = gate.feed(" continues".to_string()) else {
            unreachable!("gate should be live");
        };
        assert_eq!(next, " continues");
    }

    #[test]
    fn gate_finds_markers_split_across_frames() {
        let mut gate = ThinkerGate::new();

        assert!(matches!(gate.feed("preamble [BEGIN FINAL".to_string()), GateAction::Hold));

        let GateAction::Open(first) = gate.feed(" RESPONSE]clean".to_string()) else {
            unreachable!("split marker should still open the gate");
        };
        assert_eq!(first, "clean");
        assert!(gate.is_live());
    }

    #[test]
    fn gate_preamble_is_scannable_before_anything_forwards() {
        let mut gate = ThinkerGate::new();

        gate.feed("<|channel|>garbage".to_string());
        assert!(contains_malformed_markers(gate.held()));
    }
}
