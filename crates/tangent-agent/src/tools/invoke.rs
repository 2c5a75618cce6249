//! The tool invoker: hook gating, confirmation gating, execution and
//! parallel/sequential dispatch.

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use tangent::error::BackendError;
use tangent::{ToolCall, Usage};

use crate::agent::{AgentInput, RunParams};
use crate::confirmation::{
    ConfirmationRequest, DECLINED_RESULT, PENDING_CONFIRMATION, confirmation_id,
};
use crate::context::AgentRunContext;
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::hooks::{HookChain, HookDecision};
use crate::tools::{ToolCallResult, ToolDescriptor, ToolKind, ToolRegistry};

/// Capacity of the queue the dispatcher funnels tool events through.
const DISPATCH_QUEUE_CAPACITY: usize = 64;

/// One emission from a tool invocation.
#[derive(Debug)]
pub(crate) enum ToolEvent {
    /// A finished (or short-circuited) invocation. When the tool was a
    /// nested agent, `usage` carries its final usage so the loop can fold it
    /// into the run context at drain time.
    Result {
        result: ToolCallResult,
        usage: Option<Usage>,
    },
    /// A gated tool is waiting for approval.
    Confirmation(ConfirmationRequest),
    /// A nested agent's event, ready for re-emission.
    Downstream { agent_id: String, event: AgentEvent },
}

type ToolEventSender = mpsc::Sender<Result<ToolEvent, AgentError>>;

/// Dispatch a turn's tool calls on a background task.
///
/// Sequential mode invokes calls in emission order, one at a time; parallel
/// mode spawns one task per call and forwards events in completion order.
/// Either way the events arrive on the returned bounded queue, and an error
/// terminates the dispatch.
pub(crate) fn spawn_dispatch(
    calls: Vec<ToolCall>,
    registry: ToolRegistry,
    hooks: HookChain,
    context: AgentRunContext,
    parallel: bool,
) -> mpsc::Receiver<Result<ToolEvent, AgentError>> {
    let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
    tokio::spawn(async move {
        if parallel {
            let mut handles = Vec::with_capacity(calls.len());
            for call in calls {
                let tx = tx.clone();
                let registry = registry.clone();
                let hooks = hooks.clone();
                let context = context.clone();
                handles.push(tokio::spawn(async move {
                    if let Err(e) = invoke_tool(call, &registry, &hooks, &context, &tx).await {
                        let _ = tx.send(Err(e)).await;
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        } else {
            for call in calls {
                // A closed queue means the run was cancelled; stop before the
                // next side effect.
                if tx.is_closed() {
                    break;
                }
                if let Err(e) = invoke_tool(call, &registry, &hooks, &context, &tx).await {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    rx
}

/// Run one tool call through validation, the hook chain, confirmation gating
/// and execution, emitting events on `tx`.
async fn invoke_tool(
    mut call: ToolCall,
    registry: &ToolRegistry,
    hooks: &HookChain,
    context: &AgentRunContext,
    tx: &ToolEventSender,
) -> Result<(), AgentError> {
    if call.call_type != "function" {
        return Err(AgentError::ToolNotSupported(call.call_type.clone()));
    }
    let Some(tool) = registry.find(&call.function.name).cloned() else {
        return Err(AgentError::ToolNotAvailable(call.function.name.clone()));
    };

    match hooks.run_before(&call, context).await {
        HookDecision::Allow(arguments) => call.function.arguments = arguments,
        HookDecision::Deny(reason) => {
            tracing::warn!(tool = %call.function.name, %reason, "tool denied by hook");
            send_result(tx, &call, Value::String(reason), None, None).await;
            return Ok(());
        }
        HookDecision::Ask(request) => {
            let _ = tx.send(Ok(ToolEvent::Confirmation(request))).await;
            send_result(
                tx,
                &call,
                Value::String("Hook requires user confirmation".to_string()),
                None,
                None,
            )
            .await;
            return Ok(());
        }
    }

    if tool.requires_confirmation() {
        let id = confirmation_id(&call.function.name, &call.function.arguments);
        match context.take_decision(&id) {
            None => {
                send_result(
                    tx,
                    &call,
                    Value::String(PENDING_CONFIRMATION.to_string()),
                    None,
                    None,
                )
                .await;
                let request = ConfirmationRequest::new(
                    call.function.name.clone(),
                    tool.description(),
                    call.function.arguments.clone(),
                );
                let _ = tx.send(Ok(ToolEvent::Confirmation(request))).await;
                return Ok(());
            }
            Some(false) => {
                send_result(tx, &call, Value::String(DECLINED_RESULT.to_string()), None, None)
                    .await;
                return Ok(());
            }
            Some(true) => {}
        }
    }

    match tool.kind() {
        ToolKind::Function(callable) => {
            let context_arg = tool.takes_context().then(|| context.clone());
            let outcome = callable(call.function.arguments.clone(), context_arg).await;
            finish_invocation(&call, hooks, outcome, None, None, tx).await
        }
        ToolKind::Agent(nested) => invoke_agent_tool(&call, &tool, nested, hooks, context, tx).await,
    }
}

/// Run the post-tool hook chain on the outcome, then either emit the result
/// or re-raise the error wrapped as a tool-execution failure.
async fn finish_invocation(
    call: &ToolCall,
    hooks: &HookChain,
    outcome: anyhow::Result<Value>,
    metadata: Option<Map<String, Value>>,
    usage: Option<Usage>,
    tx: &ToolEventSender,
) -> Result<(), AgentError> {
    match outcome {
        Ok(value) => {
            let replaced = hooks.run_after(call, Some(&value), None).await;
            send_result(tx, call, replaced.unwrap_or(value), metadata, usage).await;
            Ok(())
        }
        Err(error) => {
            hooks.run_after(call, None, Some(&error)).await;
            Err(AgentError::ToolExecution {
                tool: call.function.name.clone(),
                source: error,
            })
        }
    }
}

/// Invoke a nested agent as a tool: stream its run, re-emit its events when
/// downstream passthrough is enabled, and fold its final usage into the
/// parent at drain time.
async fn invoke_agent_tool(
    call: &ToolCall,
    tool: &ToolDescriptor,
    nested: &crate::agent::Agent,
    hooks: &HookChain,
    context: &AgentRunContext,
    tx: &ToolEventSender,
) -> Result<(), AgentError> {
    context.register_agent(nested);

    let input = match call.function.arguments.get("input") {
        Some(Value::String(text)) => AgentInput::Text(text.clone()),
        Some(other) => AgentInput::Structured(other.clone()),
        None => AgentInput::None,
    };

    let child_context = AgentRunContext::new();
    child_context.set_stream_downstream_events(context.stream_downstream_events());

    let mut stream = match nested
        .run_streaming_with(input, RunParams::new().with_context(child_context))
    {
        Ok(stream) => stream,
        Err(e) => {
            let error = anyhow::Error::new(e);
            hooks.run_after(call, None, Some(&error)).await;
            return Err(AgentError::ToolExecution {
                tool: tool.name().to_string(),
                source: error,
            });
        }
    };

    let forward = context.stream_downstream_events();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if forward {
                    let _ = tx
                        .send(Ok(ToolEvent::Downstream {
                            agent_id: nested.id().to_string(),
                            event,
                        }))
                        .await;
                }
            }
            Err(e) => {
                let error = anyhow::Error::new(e);
                hooks.run_after(call, None, Some(&error)).await;
                return Err(AgentError::ToolExecution {
                    tool: tool.name().to_string(),
                    source: error,
                });
            }
        }
    }

    let usage = stream.usage();
    let mut metadata = Map::new();
    metadata.insert(
        "usage".to_string(),
        serde_json::to_value(usage).map_err(BackendError::from)?,
    );
    metadata.insert(
        "tool_calls".to_string(),
        serde_json::to_value(stream.tool_calls()).map_err(BackendError::from)?,
    );

    let value = Value::String(stream.content().to_string());
    finish_invocation(call, hooks, Ok(value), Some(metadata), Some(usage), tx).await
}

async fn send_result(
    tx: &ToolEventSender,
    call: &ToolCall,
    result: Value,
    metadata: Option<Map<String, Value>>,
    usage: Option<Usage>,
) {
    let _ = tx
        .send(Ok(ToolEvent::Result {
            result: ToolCallResult {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                result,
                metadata,
            },
            usage,
        }))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirmation::ConfirmationDecision;
    use crate::hooks::ToolHook;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn echo_tool() -> ToolDescriptor {
        ToolDescriptor::function(
            "echo",
            "Echoes x back.",
            json!({"type": "object", "properties": {"x": {"type": "string"}}}),
            |args| async move {
                let x = args.get("x").and_then(Value::as_str).unwrap_or_default();
                Ok(json!(format!("echo returned {x}")))
            },
        )
    }

    fn failing_tool() -> ToolDescriptor {
        ToolDescriptor::function("boom", "Always fails.", json!({}), |_| async {
            anyhow::bail!("kaput")
        })
    }

    fn sleepy_tool(name: &str, millis: u64) -> ToolDescriptor {
        ToolDescriptor::function(name, "Sleeps.", json!({}), move |_| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!(millis))
        })
    }

    async fn drain(
        mut rx: mpsc::Receiver<Result<ToolEvent, AgentError>>,
    ) -> Result<Vec<ToolEvent>, AgentError> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event?);
        }
        Ok(events)
    }

    fn dispatch_one(call: ToolCall, tool: ToolDescriptor) -> mpsc::Receiver<Result<ToolEvent, AgentError>> {
        dispatch_one_with(call, tool, AgentRunContext::new(), HookChain::new())
    }

    fn dispatch_one_with(
        call: ToolCall,
        tool: ToolDescriptor,
        context: AgentRunContext,
        hooks: HookChain,
    ) -> mpsc::Receiver<Result<ToolEvent, AgentError>> {
        let registry = ToolRegistry::from_descriptors(vec![tool]).expect("unique names");
        spawn_dispatch(vec![call], registry, hooks, context, false)
    }

    #[tokio::test]
    async fn plain_invocation_emits_one_result() {
        let call = ToolCall::function("t1", "echo", args(&[("x", json!("hello"))]));
        let events = drain(dispatch_one(call, echo_tool())).await.unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            ToolEvent::Result { result, usage } => {
                assert_eq!(result.id, "t1");
                assert_eq!(result.result, json!("echo returned hello"));
                assert!(usage.is_none());
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_function_call_types_are_rejected() {
        let mut call = ToolCall::function("t1", "echo", Map::new());
        call.call_type = "retrieval".to_string();

        let err = drain(dispatch_one(call, echo_tool())).await.expect_err("unsupported");
        assert!(matches!(err, AgentError::ToolNotSupported(t) if t == "retrieval"));
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        let call = ToolCall::function("t1", "missing", Map::new());
        let err = drain(dispatch_one(call, echo_tool())).await.expect_err("not available");
        assert!(matches!(err, AgentError::ToolNotAvailable(n) if n == "missing"));
    }

    #[tokio::test]
    async fn gated_tool_emits_pending_result_then_request() {
        let call = ToolCall::function("t1", "echo", args(&[("x", json!("hello"))]));
        let events = drain(dispatch_one(call, echo_tool().with_confirmation(true)))
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        match &events[0] {
            ToolEvent::Result { result, .. } => {
                assert_eq!(result.result, json!(PENDING_CONFIRMATION));
            }
            other => panic!("expected pending result, got {other:?}"),
        }
        match &events[1] {
            ToolEvent::Confirmation(request) => {
                assert_eq!(request.tool_name, "echo");
                assert_eq!(request.confirmation_id.len(), 16);
            }
            other => panic!("expected confirmation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn approved_confirmation_runs_the_tool_once() {
        let arguments = args(&[("x", json!("hello"))]);
        let id = confirmation_id("echo", &arguments);
        let context = AgentRunContext::new();
        context.add_confirmation(ConfirmationDecision::approve(&id));

        let call = ToolCall::function("t1", "echo", arguments.clone());
        let events = drain(dispatch_one_with(
            call,
            echo_tool().with_confirmation(true),
            context.clone(),
            HookChain::new(),
        ))
        .await
        .unwrap();

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ToolEvent::Result { result, .. } if result.result == json!("echo returned hello")
        ));

        // The decision was consumed; the same call asks again.
        let call = ToolCall::function("t2", "echo", arguments);
        let events = drain(dispatch_one_with(
            call,
            echo_tool().with_confirmation(true),
            context,
            HookChain::new(),
        ))
        .await
        .unwrap();
        assert!(matches!(&events[1], ToolEvent::Confirmation(_)));
    }

    #[tokio::test]
    async fn declined_confirmation_skips_the_side_effect() {
        let arguments = args(&[("x", json!("hello"))]);
        let id = confirmation_id("echo", &arguments);
        let context = AgentRunContext::new();
        context.add_confirmation(ConfirmationDecision::decline(&id));

        let call = ToolCall::function("t1", "echo", arguments);
        let events = drain(dispatch_one_with(
            call,
            echo_tool().with_confirmation(true),
            context,
            HookChain::new(),
        ))
        .await
        .unwrap();

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ToolEvent::Result { result, .. }
                if result.result.as_str().is_some_and(|s| s.to_lowercase().contains("declined"))
        ));
    }

    struct DenyHook;

    #[async_trait]
    impl ToolHook for DenyHook {
        async fn before_tool(&self, _call: &ToolCall, _context: &AgentRunContext) -> HookDecision {
            HookDecision::Deny("blocked by policy".to_string())
        }
    }

    #[tokio::test]
    async fn hook_denial_short_circuits_with_a_synthetic_result() {
        let mut hooks = HookChain::new();
        hooks.add(Arc::new(DenyHook));

        let call = ToolCall::function("t1", "echo", args(&[("x", json!("hello"))]));
        let events = drain(dispatch_one_with(
            call,
            echo_tool(),
            AgentRunContext::new(),
            hooks,
        ))
        .await
        .unwrap();

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ToolEvent::Result { result, .. } if result.result == json!("blocked by policy")
        ));
    }

    struct RewriteHook;

    #[async_trait]
    impl ToolHook for RewriteHook {
        async fn before_tool(&self, call: &ToolCall, _context: &AgentRunContext) -> HookDecision {
            let mut arguments = call.function.arguments.clone();
            arguments.insert("x".to_string(), json!("rewritten"));
            HookDecision::Allow(arguments)
        }
    }

    #[tokio::test]
    async fn hook_mutations_reach_the_tool_and_the_result() {
        let mut hooks = HookChain::new();
        hooks.add(Arc::new(RewriteHook));

        let call = ToolCall::function("t1", "echo", args(&[("x", json!("original"))]));
        let events = drain(dispatch_one_with(
            call,
            echo_tool(),
            AgentRunContext::new(),
            hooks,
        ))
        .await
        .unwrap();

        match &events[0] {
            ToolEvent::Result { result, .. } => {
                assert_eq!(result.result, json!("echo returned rewritten"));
                assert_eq!(result.arguments["x"], "rewritten");
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    struct SawError(std::sync::atomic::AtomicBool);

    #[async_trait]
    impl ToolHook for SawError {
        async fn after_tool(
            &self,
            _call: &ToolCall,
            outcome: Result<&Value, &anyhow::Error>,
        ) -> Option<Value> {
            if outcome.is_err() {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            None
        }
    }

    #[tokio::test]
    async fn errors_run_post_hooks_then_wrap() {
        let saw_error = Arc::new(SawError(std::sync::atomic::AtomicBool::new(false)));
        let mut hooks = HookChain::new();
        hooks.add(saw_error.clone());

        let call = ToolCall::function("t1", "boom", Map::new());
        let err = drain(dispatch_one_with(
            call,
            failing_tool(),
            AgentRunContext::new(),
            hooks,
        ))
        .await
        .expect_err("tool failure");

        assert!(matches!(err, AgentError::ToolExecution { tool, .. } if tool == "boom"));
        assert!(saw_error.0.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn parallel_results_arrive_in_completion_order() {
        let registry = ToolRegistry::from_descriptors(vec![
            sleepy_tool("slow", 80),
            sleepy_tool("fast", 5),
        ])
        .unwrap();
        let calls = vec![
            ToolCall::function("t1", "slow", Map::new()),
            ToolCall::function("t2", "fast", Map::new()),
        ];

        let rx = spawn_dispatch(
            calls,
            registry,
            HookChain::new(),
            AgentRunContext::new(),
            true,
        );
        let events = drain(rx).await.unwrap();
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ToolEvent::Result { result, .. } => Some(result.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["t2", "t1"]);
    }

    #[tokio::test]
    async fn sequential_results_arrive_in_emission_order() {
        let registry = ToolRegistry::from_descriptors(vec![
            sleepy_tool("slow", 40),
            sleepy_tool("fast", 5),
        ])
        .unwrap();
        let calls = vec![
            ToolCall::function("t1", "slow", Map::new()),
            ToolCall::function("t2", "fast", Map::new()),
        ];

        let rx = spawn_dispatch(
            calls,
            registry,
            HookChain::new(),
            AgentRunContext::new(),
            false,
        );
        let events = drain(rx).await.unwrap();
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ToolEvent::Result { result, .. } => Some(result.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }
}
