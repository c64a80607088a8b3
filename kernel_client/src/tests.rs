// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{
    ExecutionStatus, KernelMessage, Observed, OutputAggregator, ResultKind,
};

const MSG_ID: &str = "msg-under-test";

fn message(json: serde_json::Value) -> KernelMessage {
    serde_json::from_value(json).unwrap()
}

fn stream(parent: &str, text: &str) -> KernelMessage {
    message(serde_json::json!({
        "header": {"msg_id": "reply"},
        "parent_header": {"msg_id": parent},
        "msg_type": "stream",
        "content": {"name": "stdout", "text": text},
    }))
}

fn idle(parent: &str) -> KernelMessage {
    message(serde_json::json!({
        "header": {"msg_id": "reply"},
        "parent_header": {"msg_id": parent},
        "msg_type": "status",
        "content": {"execution_state": "idle"},
    }))
}

#[test]
fn concatenates_stream_output() {
    let mut aggregator = OutputAggregator::default();
    assert_eq!(aggregator.observe(&stream(MSG_ID, "2"), MSG_ID), Observed::Continue);
    assert_eq!(aggregator.observe(&stream(MSG_ID, "0"), MSG_ID), Observed::Continue);
    assert_eq!(aggregator.observe(&stream(MSG_ID, "0\n"), MSG_ID), Observed::Continue);
    assert_eq!(aggregator.observe(&idle(MSG_ID), MSG_ID), Observed::Done);

    let result = aggregator.finish();
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.kind, ResultKind::Text);
    assert_eq!(result.value.as_deref(), Some("200\n"));
}

#[test]
fn execute_result_text_plain_is_collected() {
    let mut aggregator = OutputAggregator::default();
    let reply = message(serde_json::json!({
        "parent_header": {"msg_id": MSG_ID},
        "msg_type": "execute_result",
        "content": {"data": {"text/plain": "42"}},
    }));
    aggregator.observe(&reply, MSG_ID);
    aggregator.observe(&idle(MSG_ID), MSG_ID);
    let result = aggregator.finish();
    assert_eq!(result.value.as_deref(), Some("42"));
}

#[test]
fn image_wins_over_text() {
    let mut aggregator = OutputAggregator::default();
    aggregator.observe(&stream(MSG_ID, "drawing...\n"), MSG_ID);
    let display = message(serde_json::json!({
        "parent_header": {"msg_id": MSG_ID},
        "msg_type": "display_data",
        "content": {"data": {"image/png": "aGVsbG8=", "text/plain": "<Figure>"}},
    }));
    aggregator.observe(&display, MSG_ID);
    aggregator.observe(&idle(MSG_ID), MSG_ID);

    let result = aggregator.finish();
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.kind, ResultKind::ImagePngBase64);
    assert_eq!(result.value.as_deref(), Some("aGVsbG8="));
}

#[test]
fn later_image_overwrites_earlier() {
    let mut aggregator = OutputAggregator::default();
    for payload in ["Zmlyc3Q=", "c2Vjb25k"] {
        let display = message(serde_json::json!({
            "parent_header": {"msg_id": MSG_ID},
            "msg_type": "display_data",
            "content": {"data": {"image/png": payload}},
        }));
        aggregator.observe(&display, MSG_ID);
    }
    aggregator.observe(&idle(MSG_ID), MSG_ID);
    assert_eq!(aggregator.finish().value.as_deref(), Some("c2Vjb25k"));
}

#[test]
fn error_ends_the_loop_and_beats_other_output() {
    let mut aggregator = OutputAggregator::default();
    aggregator.observe(&stream(MSG_ID, "partial"), MSG_ID);
    let error = message(serde_json::json!({
        "parent_header": {"msg_id": MSG_ID},
        "msg_type": "error",
        "content": {"ename": "ZeroDivisionError", "evalue": "division by zero"},
    }));
    assert_eq!(aggregator.observe(&error, MSG_ID), Observed::Done);

    let result = aggregator.finish();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.kind, ResultKind::ExecutionError);
    assert_eq!(
        result.value.as_deref(),
        Some("ZeroDivisionError: division by zero")
    );
}

#[test]
fn foreign_parent_messages_are_discarded() {
    let mut aggregator = OutputAggregator::default();
    assert_eq!(
        aggregator.observe(&stream("someone-else", "noise"), MSG_ID),
        Observed::Continue
    );
    // Even a foreign idle must not end our loop.
    assert_eq!(aggregator.observe(&idle("someone-else"), MSG_ID), Observed::Continue);
    aggregator.observe(&idle(MSG_ID), MSG_ID);
    assert_eq!(aggregator.finish().value.as_deref(), Some(""));
}

#[test]
fn dead_execution_state_ends_the_session() {
    let mut aggregator = OutputAggregator::default();
    // Dead is terminal no matter whose request the message belongs to.
    let dead = message(serde_json::json!({
        "parent_header": {"msg_id": "someone-else"},
        "msg_type": "status",
        "content": {"execution_state": "dead"},
    }));
    assert_eq!(aggregator.observe(&dead, MSG_ID), Observed::Dead);
}

#[test]
fn busy_status_does_not_end_the_loop() {
    let mut aggregator = OutputAggregator::default();
    let busy = message(serde_json::json!({
        "parent_header": {"msg_id": MSG_ID},
        "msg_type": "status",
        "content": {"execution_state": "busy"},
    }));
    assert_eq!(aggregator.observe(&busy, MSG_ID), Observed::Continue);
}

#[test]
fn display_data_without_png_is_ignored() {
    let mut aggregator = OutputAggregator::default();
    let display = message(serde_json::json!({
        "parent_header": {"msg_id": MSG_ID},
        "msg_type": "display_data",
        "content": {"data": {"text/html": "<b>hi</b>"}},
    }));
    aggregator.observe(&display, MSG_ID);
    aggregator.observe(&idle(MSG_ID), MSG_ID);
    let result = aggregator.finish();
    assert_eq!(result.kind, ResultKind::Text);
}

#[test]
fn envelope_parses_with_missing_fields() {
    // Kernels omit fields freely; the envelope must tolerate a bare frame.
    let parsed: KernelMessage = serde_json::from_str("{}").unwrap();
    assert_eq!(parsed.msg_type, "");
    assert_eq!(parsed.parent_header.msg_id, "");
    assert!(parsed.content.execution_state.is_none());
}
