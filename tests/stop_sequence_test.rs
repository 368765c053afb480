//! Stop-sequence disambiguation: false positives, split matches, caps.

mod common;

use common::{MockBackend, ScriptedIteration};
use midstream::{
    Message, Middleware, Request, StopReason, StreamCallbacks, StreamOptions, ToolDefinition,
    ToolResultBlock,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn request() -> Request {
    Request::builder()
        .model("mock-model")
        .message(Message::text("User", "show me the chat log"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn false_positive_stop_inside_result_region_resumes() {
    // The software scan catches "\nUser:" inside an open tool-result
    // region; the orchestrator re-appends it and issues a second
    // round-trip whose prefill ends in the reconstructed region.
    let backend = Arc::new(MockBackend::new(vec![
        ScriptedIteration::text(&[
            "<function_results><result tool_use_id=\"x\">chatlog:\nUser: hi\nBot: hello</result>",
        ]),
        ScriptedIteration::text(&[" hi\nBot: hello</result></function_results>done"]),
    ]));
    let middleware = Middleware::from_arc(backend.clone());

    let outcome = middleware
        .stream(&request(), StreamOptions::new())
        .await
        .unwrap();
    let response = outcome.expect_complete();

    assert_eq!(response.iterations, 2);
    // The final stop reason reflects the final iteration, not the
    // false positive.
    assert_eq!(response.stop_reason, StopReason::EndTurn);

    let requests = backend.recorded();
    assert_eq!(requests.len(), 2);
    let prefill = requests[1].messages.last().unwrap().content.text();
    assert!(
        prefill.ends_with("chatlog:\nUser:"),
        "prefill should end in the reconstructed region, got {:?}",
        prefill
    );

    assert!(response
        .raw_assistant_text
        .contains("chatlog:\nUser: hi\nBot: hello"));
}

#[tokio::test]
async fn backend_reported_stop_inside_region_also_resumes() {
    // Phase 2: the backend consumed the stop itself. Same verdict.
    let backend = Arc::new(MockBackend::new(vec![
        ScriptedIteration::stopped(
            &["<function_results><result tool_use_id=\"x\">log:"],
            "\nUser:",
        ),
        ScriptedIteration::text(&[" hi</result></function_results>ok"]),
    ]));
    let middleware = Middleware::from_arc(backend.clone());

    let outcome = middleware
        .stream(&request(), StreamOptions::new())
        .await
        .unwrap();
    let response = outcome.expect_complete();

    assert_eq!(response.iterations, 2);
    assert!(response.raw_assistant_text.contains("log:\nUser: hi"));
}

#[tokio::test]
async fn stop_split_across_chunk_boundaries_is_detected() {
    let backend = MockBackend::new(vec![ScriptedIteration::text(&["abc\nUs", "er: trailing"])]);
    let middleware = Middleware::from_arc(Arc::new(backend));

    let collected = Arc::new(Mutex::new(String::new()));
    let sink = collected.clone();
    let callbacks = StreamCallbacks::new().on_chunk(move |piece| {
        sink.lock().unwrap().push_str(&piece.text);
    });

    let outcome = middleware
        .stream(&request(), StreamOptions::new().callbacks(callbacks))
        .await
        .unwrap();
    let response = outcome.expect_complete();

    // Outside any structural region, the match is terminal.
    assert_eq!(response.stop_reason, StopReason::StopSequence);
    assert_eq!(response.stop_sequence.as_deref(), Some("\nUser:"));
    // Nothing past (or of) the stop ever reached the consumer: the
    // holdback kept "\nUs" away from the parser until disambiguation.
    assert_eq!(*collected.lock().unwrap(), "abc");
    assert_eq!(response.raw_assistant_text, "abc");
}

#[tokio::test]
async fn stop_outside_any_block_is_terminal() {
    let backend = MockBackend::new(vec![ScriptedIteration::text(&[
        "I think\nUser: should not continue",
    ])]);
    let middleware = Middleware::from_arc(Arc::new(backend));

    let outcome = middleware
        .stream(&request(), StreamOptions::new())
        .await
        .unwrap();
    let response = outcome.expect_complete();

    assert_eq!(response.iterations, 1);
    assert_eq!(response.stop_reason, StopReason::StopSequence);
    assert_eq!(response.raw_assistant_text, "I think");
}

#[tokio::test]
async fn embedded_stop_does_not_resume_past_depth_bound() {
    // Every iteration false-positives; the bound converts the loop into a
    // successful completion instead of spinning forever.
    let backend = MockBackend::new(vec![
        ScriptedIteration::text(&["<function_results><result tool_use_id=\"x\">a\nUser: x"]),
        ScriptedIteration::text(&["b\nUser: y"]),
        ScriptedIteration::text(&["c\nUser: z"]),
    ]);
    let middleware = Middleware::from_arc(Arc::new(backend));

    let outcome = middleware
        .stream(&request(), StreamOptions::new().max_tool_depth(2))
        .await
        .unwrap();
    let response = outcome.expect_complete();

    // Two resumes consumed the budget; the third match terminates.
    assert_eq!(response.iterations, 3);
    assert_eq!(response.stop_reason, StopReason::StopSequence);
    assert_eq!(response.stop_sequence.as_deref(), Some("\nUser:"));
}

#[tokio::test]
async fn stop_set_is_capped_preferring_the_close_tag() {
    let request = Request::builder()
        .model("mock-model")
        .assistant_name("Bot")
        .message(Message::text("Alice", "a"))
        .message(Message::text("Bob", "b"))
        .message(Message::text("Carol", "c"))
        .message(Message::text("Dave", "d"))
        .tool(ToolDefinition::new("t", "tool", json!({"type": "object"})))
        .build()
        .unwrap();

    let backend = Arc::new(
        MockBackend::new(vec![ScriptedIteration::text(&["Bot: hi"])]).with_max_stops(Some(4)),
    );
    let middleware = Middleware::from_arc(backend.clone());

    let callbacks = StreamCallbacks::new()
        .on_tool_calls(|_calls, _ctx| async move { Ok(Vec::new()) });
    middleware
        .stream(&request, StreamOptions::new().callbacks(callbacks))
        .await
        .unwrap();

    let requests = backend.recorded();
    let stops = &requests[0].stop_sequences;
    assert_eq!(stops.len(), 4);
    assert_eq!(stops[0], "</function_calls>");
    assert_eq!(stops[1], "\nAlice:");
    assert_eq!(stops[2], "\nBob:");
    assert_eq!(stops[3], "\nCarol:");
    // "\nDave:" was the truncation victim.
}

#[tokio::test]
async fn tools_without_handler_do_not_arm_the_close_stop() {
    let request = Request::builder()
        .model("mock-model")
        .message(Message::text("User", "hi"))
        .tool(ToolDefinition::new("t", "tool", json!({"type": "object"})))
        .build()
        .unwrap();

    let backend = Arc::new(MockBackend::new(vec![ScriptedIteration::text(&["ok"])]));
    let middleware = Middleware::from_arc(backend.clone());

    // No on_tool_calls handler: structural interception stays off.
    middleware
        .stream(&request, StreamOptions::new())
        .await
        .unwrap();

    let stops = &backend.recorded()[0].stop_sequences;
    assert!(!stops.contains(&"</function_calls>".to_string()));
    assert_eq!(stops, &vec!["\nUser:".to_string()]);
}

#[tokio::test]
async fn tool_results_containing_stop_like_text_survive_one_round() {
    // A chat-log tool returns text that looks like a turn boundary; the
    // result region is injected by the formatter (not streamed), so it
    // must never trigger the scanner at all.
    let region = "<function_calls><invoke name=\"log\"></invoke>";
    let backend = Arc::new(MockBackend::new(vec![
        ScriptedIteration::stopped(&[region], "</function_calls>"),
        ScriptedIteration::text(&["summarized"]),
    ]));
    let middleware = Middleware::from_arc(backend.clone());

    let request = Request::builder()
        .model("mock-model")
        .message(Message::text("User", "log?"))
        .tool(ToolDefinition::new("log", "chat log", json!({"type": "object"})))
        .build()
        .unwrap();

    let callbacks = StreamCallbacks::new().on_tool_calls(|calls, _ctx| async move {
        Ok(calls
            .iter()
            .map(|c| ToolResultBlock::new(&c.id, "User: hi\nUser: there"))
            .collect())
    });

    let outcome = middleware
        .stream(&request, StreamOptions::new().callbacks(callbacks))
        .await
        .unwrap();
    let response = outcome.expect_complete();

    assert_eq!(response.iterations, 2);
    assert!(response.raw_assistant_text.contains("User: hi\nUser: there"));
    assert_eq!(response.stop_reason, StopReason::EndTurn);
}
