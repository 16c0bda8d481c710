//! End-to-end orchestrator scenarios against a scripted backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backend::{
    Backend, BackendError, BackendResult, ChatMessage, ChatOutcome, ChatParams, FinishReason, FrameStream, Role,
    StreamFrame, ToolCallFragment, ToolCallRequest, ToolChoice,
};
use gateway::{Orchestrator, wire};
use tools::ToolRegistry;

#[derive(Debug, Clone)]
struct RecordedCall {
    tool_choice: ToolChoice,
    tools_offered: usize,
    model: String,
    messages: Vec<ChatMessage>,
}

struct ScriptedBackend {
    replies: Mutex<VecDeque<ChatOutcome>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    fn new(replies: Vec<ChatOutcome>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record_and_pop(&self, params: &ChatParams<'_>) -> BackendResult<ChatOutcome> {
        self.calls.lock().unwrap().push(RecordedCall {
            tool_choice: params.tool_choice,
            tools_offered: params.tools.len(),
            model: params.model_override.unwrap_or("default-model").to_string(),
            messages: params.messages.to_vec(),
        });

        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BackendError::Connection("script exhausted".to_string()))
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn chat(&self, params: ChatParams<'_>) -> BackendResult<ChatOutcome> {
        self.record_and_pop(&params)
    }

    async fn chat_stream(&self, params: ChatParams<'_>) -> BackendResult<FrameStream> {
        let outcome = self.record_and_pop(&params)?;

        // Replay the scripted outcome as delta frames: content split in
        // two, tool-call arguments split across fragments.
        let mut frames: Vec<BackendResult<StreamFrame>> = Vec::new();

        let content = outcome.message.content.clone();
        let mid = content.len() / 2;
        let (head, tail) = content.split_at(content.char_indices().nth(mid / 2).map(|(i, _)| i).unwrap_or(0));

        for part in [head, tail] {
            if !part.is_empty() {
                frames.push(Ok(StreamFrame {
                    content: Some(part.to_string()),
                    ..Default::default()
                }));
            }
        }

        for (index, call) in outcome.message.tool_calls.iter().enumerate() {
            let arguments = call.arguments.to_string();
            let split = arguments.len() / 2;

            frames.push(Ok(StreamFrame {
                tool_calls: vec![ToolCallFragment {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.name.clone()),
                    arguments: arguments[..split].to_string(),
                }],
                ..Default::default()
            }));
            frames.push(Ok(StreamFrame {
                tool_calls: vec![ToolCallFragment {
                    index,
                    id: None,
                    name: None,
                    arguments: arguments[split..].to_string(),
                }],
                ..Default::default()
            }));
        }

        frames.push(Ok(StreamFrame {
            finish_reason: Some(if outcome.message.tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }),
            ..Default::default()
        }));

        Ok(Box::pin(futures::stream::iter(frames)))
    }

    async fn health(&self) -> BackendResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "default-model"
    }
}

fn assistant(content: &str) -> ChatOutcome {
    ChatOutcome {
        message: ChatMessage::assistant(content),
        finish_reason: Some(FinishReason::Stop),
    }
}

fn assistant_with_call(id: &str, name: &str, arguments: serde_json::Value) -> ChatOutcome {
    let mut message = ChatMessage::assistant("");
    message.tool_calls.push(ToolCallRequest {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    });

    ChatOutcome {
        message,
        finish_reason: Some(FinishReason::ToolCalls),
    }
}

fn registry_with_echo() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(tools::EchoTool)).unwrap();
    Arc::new(registry)
}

fn chat_config(max_iterations: u32) -> config::ChatConfig {
    let mut chat: config::ChatConfig = toml::from_str("").unwrap();
    chat.max_tool_iterations = max_iterations;
    chat.system_prompt_path = "/nonexistent/prompt.txt".to_string();
    chat.system_prompt_default = "test system prompt".to_string();
    chat
}

fn request(body: &str) -> wire::ChatRequest {
    wire::parse_request(body.as_bytes()).unwrap()
}

fn orchestrator(backend: &Arc<ScriptedBackend>, max_iterations: u32) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        backend.clone() as Arc<dyn Backend>,
        registry_with_echo(),
        chat_config(max_iterations),
        None,
    ))
}

/// Drain a streaming run's delta channel to completion.
async fn collect_deltas(orchestrator: &Arc<Orchestrator>, request: gateway::wire::ChatRequest) -> Vec<String> {
    let mut handle = Arc::clone(orchestrator).run_stream(request);

    let mut deltas = Vec::new();
    while let Some(delta) = handle.deltas.recv().await {
        deltas.push(delta);
    }

    deltas
}

/// Every tool message must answer a call id emitted by the immediately
/// preceding assistant message.
fn assert_tool_call_correspondence(messages: &[ChatMessage]) {
    for (position, message) in messages.iter().enumerate() {
        if message.role != Role::Tool {
            continue;
        }

        let call_id = message.tool_call_id.as_ref().expect("tool messages carry a call id");

        let preceding_assistant = messages[..position]
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .expect("a tool message follows an assistant message");

        assert!(
            preceding_assistant.tool_calls.iter().any(|call| &call.id == call_id),
            "tool message references call id '{call_id}' the preceding assistant never emitted"
        );
    }
}

#[tokio::test]
async fn pure_text_answers_in_one_call() {
    let backend = ScriptedBackend::new(vec![assistant("hello")]);
    let orchestrator = orchestrator(&backend, 5);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"Say hi."}]}"#))
        .await;

    assert_eq!(outcome.content, "hello");

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tool_choice, ToolChoice::Auto);
    assert_eq!(calls[0].messages[0].role, Role::System);
    assert_eq!(calls[0].messages[0].content, "test system prompt");
}

#[tokio::test]
async fn single_tool_call_round_trip() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "echo", serde_json::json!({"text": "ping"})),
        assistant("pong: ping"),
    ]);
    let orchestrator = orchestrator(&backend, 5);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"echo ping"}]}"#))
        .await;

    assert_eq!(outcome.content, "pong: ping");

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);

    // The second call sees the assistant tool-call message verbatim and
    // the tool result spliced in with the matching id.
    let history = &calls[1].messages;
    let len = history.len();
    assert_eq!(history[len - 2].role, Role::Assistant);
    assert_eq!(history[len - 2].tool_calls[0].id, "c1");
    assert_eq!(history[len - 1].role, Role::Tool);
    assert_eq!(history[len - 1].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(history[len - 1].content, "ping");

    assert_tool_call_correspondence(history);
}

#[tokio::test]
async fn required_with_no_tool_use_nudges_once() {
    let backend = ScriptedBackend::new(vec![
        assistant("sure"),
        assistant_with_call("c1", "echo", serde_json::json!({"text": "ok"})),
        assistant("done"),
    ]);
    let orchestrator = orchestrator(&backend, 5);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"go"}],"tool_choice":"required"}"#))
        .await;

    assert_eq!(outcome.content, "done");

    let calls = backend.calls();
    assert_eq!(calls.len(), 3);

    // The nudge retry re-runs the first iteration with required.
    assert_eq!(calls[0].tool_choice, ToolChoice::Required);
    assert_eq!(calls[1].tool_choice, ToolChoice::Required);
    assert_eq!(calls[2].tool_choice, ToolChoice::Auto);

    // The nudge user message is the last thing the retry saw.
    let nudge = calls[1].messages.last().unwrap();
    assert_eq!(nudge.role, Role::User);
    assert!(nudge.content.contains("must use"));
}

#[tokio::test]
async fn iteration_exhaustion_falls_off_to_final_synthesis() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "echo", serde_json::json!({"text": "a"})),
        assistant_with_call("c2", "echo", serde_json::json!({"text": "b"})),
        assistant("summary"),
    ]);
    let orchestrator = orchestrator(&backend, 2);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"loop"}]}"#))
        .await;

    assert_eq!(outcome.content, "summary");

    let calls = backend.calls();
    assert_eq!(calls.len(), 3);

    // Final synthesis disables tools entirely.
    assert_eq!(calls[2].tool_choice, ToolChoice::None);
    assert_eq!(calls[2].tools_offered, 0);

    // Iteration calls offered the registry.
    assert_eq!(calls[0].tools_offered, 1);
    assert_eq!(calls[1].tools_offered, 1);

    assert_tool_call_correspondence(&calls[2].messages);
}

#[tokio::test]
async fn malformed_final_output_is_retried_once() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "echo", serde_json::json!({"text": "x"})),
        assistant("<|start|>assistant<|channel|>garbage"),
        assistant("clean answer"),
    ]);
    let orchestrator = orchestrator(&backend, 1);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"go"}]}"#))
        .await;

    assert_eq!(outcome.content, "clean answer");

    let calls = backend.calls();
    assert_eq!(calls.len(), 3);

    // The retry prepends a stern system instruction.
    assert_eq!(calls[2].messages[0].role, Role::System);
    assert!(calls[2].messages[0].content.contains("plain, clean text"));
}

#[tokio::test]
async fn malformed_output_twice_returns_fixed_fallback() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "echo", serde_json::json!({"text": "x"})),
        assistant("<|channel|>bad"),
        assistant("<|channel|>still bad"),
    ]);
    let orchestrator = orchestrator(&backend, 1);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"go"}]}"#))
        .await;

    assert!(outcome.content.contains("malformed output"));
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test]
async fn unknown_tool_becomes_a_tool_error_message() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "missing_tool", serde_json::json!({})),
        assistant("recovered"),
    ]);
    let orchestrator = orchestrator(&backend, 5);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"go"}]}"#))
        .await;

    assert_eq!(outcome.content, "recovered");

    let calls = backend.calls();
    let tool_message = calls[1].messages.last().unwrap();
    assert_eq!(tool_message.role, Role::Tool);
    assert_eq!(tool_message.content, "Error: tool missing_tool not registered");
}

#[tokio::test]
async fn backend_failure_synthesizes_a_completion() {
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = orchestrator(&backend, 5);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
        .await;

    assert!(outcome.content.contains("could not be reached"));
    assert_eq!(outcome.model, "default-model");
}

#[tokio::test]
async fn model_override_is_scoped_to_one_request() {
    let backend = ScriptedBackend::new(vec![assistant("first"), assistant("second")]);
    let orchestrator = orchestrator(&backend, 5);

    let overridden = orchestrator
        .run(&request(r#"{"model":"other-model","messages":[{"role":"user","content":"a"}]}"#))
        .await;
    assert_eq!(overridden.model, "other-model");

    let default = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"b"}]}"#))
        .await;
    assert_eq!(default.model, "default-model");

    let calls = backend.calls();
    assert_eq!(calls[0].model, "other-model");
    assert_eq!(calls[1].model, "default-model");
}

#[tokio::test]
async fn caller_system_prompt_wins_over_the_configured_one() {
    let backend = ScriptedBackend::new(vec![assistant("ok")]);
    let orchestrator = orchestrator(&backend, 5);

    orchestrator
        .run(&request(r#"{"messages":[{"role":"system","content":"caller prompt"},{"role":"user","content":"hi"}]}"#))
        .await;

    let calls = backend.calls();
    assert_eq!(calls[0].messages[0].content, "caller prompt");
    assert_eq!(calls[0].messages.iter().filter(|m| m.role == Role::System).count(), 1);
}

#[tokio::test]
async fn streaming_forwards_the_terminal_response_as_deltas() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "echo", serde_json::json!({"text": "ping"})),
        assistant("pong: ping"),
    ]);
    let orchestrator = orchestrator(&backend, 5);

    let deltas = collect_deltas(
        &orchestrator,
        request(r#"{"messages":[{"role":"user","content":"echo ping"}],"stream":true}"#),
    )
    .await;

    // The non-terminal tool iteration forwards nothing; the terminal
    // response arrives with its frame granularity intact.
    assert!(deltas.len() >= 2);
    assert_eq!(deltas.concat(), "pong: ping");
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn streaming_suppresses_the_thinker_preamble() {
    let backend = ScriptedBackend::new(vec![assistant(
        "reasoning about the question [BEGIN FINAL RESPONSE]the answer",
    )]);
    let orchestrator = orchestrator(&backend, 5);

    let deltas = collect_deltas(
        &orchestrator,
        request(r#"{"messages":[{"role":"user","content":"hi"}],"stream":true}"#),
    )
    .await;

    assert_eq!(deltas.concat(), "the answer");
}

#[tokio::test]
async fn streaming_final_synthesis_retries_malformed_output() {
    let backend = ScriptedBackend::new(vec![
        assistant_with_call("c1", "echo", serde_json::json!({"text": "x"})),
        assistant("<|start|>assistant<|channel|>garbage"),
        assistant("clean answer"),
    ]);
    let orchestrator = orchestrator(&backend, 1);

    let deltas = collect_deltas(
        &orchestrator,
        request(r#"{"messages":[{"role":"user","content":"go"}],"stream":true}"#),
    )
    .await;

    // Nothing malformed reached the channel; the stern retry's clean
    // text did.
    assert_eq!(deltas.concat(), "clean answer");
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test]
async fn streaming_backend_failure_synthesizes_an_explanation() {
    let backend = ScriptedBackend::new(vec![]);
    let orchestrator = orchestrator(&backend, 5);

    let deltas = collect_deltas(
        &orchestrator,
        request(r#"{"messages":[{"role":"user","content":"hi"}],"stream":true}"#),
    )
    .await;

    assert!(deltas.concat().contains("could not be reached"));
}

#[tokio::test]
async fn iteration_budget_bounds_backend_calls() {
    // A model that asks for another tool call on every iteration; the
    // reply after the budget is the final-synthesis answer.
    let replies: Vec<ChatOutcome> = (0..3)
        .map(|i| assistant_with_call(&format!("c{i}"), "echo", serde_json::json!({"text": "x"})))
        .chain([assistant("capped")])
        .collect();

    let backend = ScriptedBackend::new(replies);
    let orchestrator = orchestrator(&backend, 3);

    let outcome = orchestrator
        .run(&request(r#"{"messages":[{"role":"user","content":"go"}]}"#))
        .await;

    // max_iterations tool calls, then exactly one final synthesis.
    assert_eq!(backend.calls().len(), 4);
    assert_eq!(outcome.content, "capped");
}
