//! Split-turn image injection: image-bearing tool results break the
//! assistant turn around a synthetic user message.

mod common;

use common::{MockBackend, ScriptedIteration};
use midstream::{
    BackendContent, ContentBlock, ImageBlock, Message, Middleware, Request, Role,
    StreamCallbacks, StreamOptions, ToolDefinition, ToolResultBlock,
};
use serde_json::json;
use std::sync::Arc;

fn chart_request() -> Request {
    Request::builder()
        .model("mock-model")
        .message(Message::text("User", "plot it"))
        .tool(ToolDefinition::new("plot", "plot data", json!({"type": "object"})))
        .build()
        .unwrap()
}

fn image_result_callbacks() -> StreamCallbacks {
    StreamCallbacks::new().on_tool_calls(|calls, _ctx| async move {
        Ok(calls
            .iter()
            .map(|c| {
                ToolResultBlock::new(
                    &c.id,
                    vec![
                        ContentBlock::text("see chart"),
                        ContentBlock::Image(ImageBlock::new("image/png", "aGk=").unwrap()),
                    ],
                )
            })
            .collect())
    })
}

#[tokio::test]
async fn image_result_splits_the_continuation_request() {
    let region = "<function_calls><invoke name=\"plot\"></invoke>";
    let backend = Arc::new(MockBackend::new(vec![
        ScriptedIteration::stopped(&[region], "</function_calls>"),
        ScriptedIteration::text(&["The chart shows growth."]),
    ]));
    let middleware = Middleware::from_arc(backend.clone());

    let outcome = middleware
        .stream(
            &chart_request(),
            StreamOptions::new().callbacks(image_result_callbacks()),
        )
        .await
        .unwrap();
    let response = outcome.expect_complete();

    let requests = backend.recorded();
    assert_eq!(requests.len(), 2);

    // The continuation round-trip ends with: assistant (mid-region, after
    // the textual portion), user (images only), assistant (closing the
    // region).
    let messages = &requests[1].messages;
    let n = messages.len();
    assert!(n >= 3);

    let first = &messages[n - 3];
    assert_eq!(first.role, Role::Assistant);
    assert!(first.content.text().ends_with("see chart"));
    assert!(first.content.text().contains("<result tool_use_id=\"call_1\">"));
    assert!(!first.content.text().contains("</result>"));

    let image_turn = &messages[n - 2];
    assert_eq!(image_turn.role, Role::User);
    match &image_turn.content {
        BackendContent::Blocks(blocks) => {
            assert_eq!(blocks.len(), 1);
            match &blocks[0] {
                ContentBlock::Image(image) => assert_eq!(image.media_type, "image/png"),
                other => panic!("expected image, got {:?}", other),
            }
        }
        other => panic!("expected typed blocks, got {:?}", other),
    }

    let closing = &messages[n - 1];
    assert_eq!(closing.role, Role::Assistant);
    assert!(closing.content.text().contains("</result>"));
    assert!(closing.content.text().ends_with("</function_results>"));

    // The accumulated text carries both the textual portion and the
    // synthetic closing, so the prefill invariant holds at resume time.
    assert!(response.raw_assistant_text.contains("see chart"));
    assert!(response.raw_assistant_text.contains("</function_results>"));
    assert!(response
        .raw_assistant_text
        .ends_with("The chart shows growth."));
}

#[tokio::test]
async fn split_survives_subsequent_iterations() {
    // A second tool round after the split must keep the image turn in
    // place in the next continuation request.
    let region1 = "<function_calls><invoke name=\"plot\"></invoke>";
    let region2 = "and another<function_calls><invoke name=\"plot\"></invoke>";
    let backend = Arc::new(MockBackend::new(vec![
        ScriptedIteration::stopped(&[region1], "</function_calls>"),
        ScriptedIteration::stopped(&[region2], "</function_calls>"),
        ScriptedIteration::text(&["done"]),
    ]));
    let middleware = Middleware::from_arc(backend.clone());

    let calls_seen = Arc::new(std::sync::Mutex::new(0u32));
    let counter = calls_seen.clone();
    let callbacks = StreamCallbacks::new().on_tool_calls(move |calls, _ctx| {
        let first = {
            let mut count = counter.lock().unwrap();
            *count += 1;
            *count == 1
        };
        async move {
            Ok(calls
                .iter()
                .map(|c| {
                    if first {
                        ToolResultBlock::new(
                            &c.id,
                            vec![
                                ContentBlock::text("img"),
                                ContentBlock::Image(
                                    ImageBlock::new("image/png", "aGk=").unwrap(),
                                ),
                            ],
                        )
                    } else {
                        ToolResultBlock::new(&c.id, "plain")
                    }
                })
                .collect())
        }
    });

    middleware
        .stream(&chart_request(), StreamOptions::new().callbacks(callbacks))
        .await
        .unwrap();

    let requests = backend.recorded();
    assert_eq!(requests.len(), 3);

    // The third round-trip still has the image turn embedded between
    // assistant segments.
    let messages = &requests[2].messages;
    let image_turns: Vec<_> = messages
        .iter()
        .filter(|m| {
            m.role == Role::User
                && matches!(
                    &m.content,
                    BackendContent::Blocks(blocks)
                        if blocks.iter().any(|b| matches!(b, ContentBlock::Image(_)))
                )
        })
        .collect();
    assert_eq!(image_turns.len(), 1);

    // And the final assistant segment carries everything after the split,
    // including the second tool round.
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.text().contains("and another"));
    assert!(last.content.text().contains("plain"));
}

#[tokio::test]
async fn text_only_results_do_not_split() {
    let region = "<function_calls><invoke name=\"plot\"></invoke>";
    let backend = Arc::new(MockBackend::new(vec![
        ScriptedIteration::stopped(&[region], "</function_calls>"),
        ScriptedIteration::text(&["ok"]),
    ]));
    let middleware = Middleware::from_arc(backend.clone());

    let callbacks = StreamCallbacks::new().on_tool_calls(|calls, _ctx| async move {
        Ok(calls
            .iter()
            .map(|c| ToolResultBlock::new(&c.id, "numbers"))
            .collect())
    });

    middleware
        .stream(&chart_request(), StreamOptions::new().callbacks(callbacks))
        .await
        .unwrap();

    let requests = backend.recorded();
    // Continuation is a single assistant prefill; no synthetic user turn.
    let messages = &requests[1].messages;
    assert_eq!(messages.last().unwrap().role, Role::Assistant);
    let user_turns = messages.iter().filter(|m| m.role == Role::User).count();
    assert_eq!(user_turns, 1); // just the original conversation turn
}
