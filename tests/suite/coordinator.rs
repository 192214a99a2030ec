//! End-to-end coordinator behavior: gating, pooling, usage, structured calls.

use std::sync::Arc;
use std::time::Duration;

use envoy_core::{CallOptions, CallOutcome, CoordinatorError, caller_fn};
use envoy_providers::{ProviderError, TokenUsage};

use crate::common::{SlowEchoProvider, coordinator_with, fixed_reply};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_models_never_overlap() {
    let provider = Arc::new(SlowEchoProvider::new(Duration::from_millis(40)));
    let counter = Arc::clone(&provider.counter);
    let (_dir, coordinator) = coordinator_with(provider);
    let coordinator = Arc::new(coordinator);

    let a = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .call_text("one", "local/modelA", "FRANCE", CallOptions::default())
                .await
        })
    };
    let b = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .call_text("two", "local/modelB", "ENGLAND", CallOptions::default())
                .await
        })
    };

    assert_eq!(a.await.unwrap().unwrap(), "local/modelA: one");
    assert_eq!(b.await.unwrap().unwrap(), "local/modelB: two");
    assert_eq!(counter.calls(), 2);
    assert_eq!(counter.peak(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_models_overlap() {
    let provider = Arc::new(SlowEchoProvider::new(Duration::from_millis(200)));
    let counter = Arc::clone(&provider.counter);
    let (_dir, coordinator) = coordinator_with(provider);

    let (a, b) = tokio::join!(
        coordinator.call_text("one", "remote-1", "FRANCE", CallOptions::default()),
        coordinator.call_text("two", "remote-2", "ENGLAND", CallOptions::default()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(counter.peak(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_local_and_remote_do_not_block_each_other() {
    let provider = Arc::new(SlowEchoProvider::new(Duration::from_millis(200)));
    let counter = Arc::clone(&provider.counter);
    let (_dir, coordinator) = coordinator_with(provider);

    let (a, b) = tokio::join!(
        coordinator.call_text("one", "ollama/llama3", "FRANCE", CallOptions::default()),
        coordinator.call_text("two", "gpt-4o", "ENGLAND", CallOptions::default()),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(counter.peak(), 2);
}

#[tokio::test]
async fn usage_is_recorded_per_call() {
    let provider = Arc::new(SlowEchoProvider::new(Duration::from_millis(1)));
    let (_dir, coordinator) = coordinator_with(provider);

    let options = || CallOptions::default().with_game("g1").with_phase("S1901M");
    coordinator
        .call_text("abcd", "gpt-4o", "FRANCE", options())
        .await
        .unwrap();
    coordinator
        .call_text("ab", "ollama/llama3", "FRANCE", options())
        .await
        .unwrap();
    coordinator
        .call_text("abcdef", "gpt-4o", "ENGLAND", options())
        .await
        .unwrap();
    assert_eq!(coordinator.drain_pending_writes().await, 3);

    let totals = coordinator.ledger().total_stats("g1");
    assert_eq!(totals.calls, 3);
    assert_eq!(totals.input_tokens, 12);
    assert_eq!(totals.output_tokens, 15);

    let by_agent = coordinator.ledger().stats_by_agent("g1");
    let france = &by_agent["FRANCE"];
    assert_eq!(france.calls, 2);
    assert_eq!(france.models, vec!["gpt-4o".to_string(), "ollama/llama3".to_string()]);
    assert_eq!(by_agent["ENGLAND"].input_tokens, 6);
}

#[tokio::test]
async fn missing_usage_leaves_ledger_unchanged() {
    let (_dir, coordinator) = coordinator_with(fixed_reply("hello", None));
    let text = coordinator
        .call_text("hi", "gpt-4o", "FRANCE", CallOptions::default().with_game("g2"))
        .await
        .unwrap();
    assert_eq!(text, "hello");
    assert_eq!(coordinator.drain_pending_writes().await, 0);
    assert_eq!(coordinator.ledger().total_stats("g2").calls, 0);
}

#[tokio::test]
async fn call_json_with_required_fields() {
    let reply = "Sure.\n```json\n{\"orders\": [\"A PAR H\"]}\n```";
    let (_dir, coordinator) = coordinator_with(fixed_reply(reply, Some(TokenUsage::new(50, 9))));

    let map = coordinator
        .call_json(
            "orders?",
            "gpt-4o",
            "FRANCE",
            CallOptions::default().with_expected_fields(["orders"]),
        )
        .await
        .unwrap();
    assert_eq!(map["orders"], serde_json::json!(["A PAR H"]));

    let err = coordinator
        .call_json(
            "orders?",
            "gpt-4o",
            "FRANCE",
            CallOptions::default().with_expected_fields(["orders", "diary_entry"]),
        )
        .await
        .unwrap_err();
    let CoordinatorError::InvalidResponse {
        outcome, message, ..
    } = &err
    else {
        panic!("expected InvalidResponse, got {err:?}");
    };
    assert_eq!(*outcome, CallOutcome::ValidationFailed);
    assert!(message.contains("diary_entry"));
    assert!(!message.contains("orders"));

    // Both calls reached the model, so both are billed.
    assert_eq!(coordinator.drain_pending_writes().await, 2);
}

#[tokio::test]
async fn call_json_without_object_is_parse_failure() {
    let (_dir, coordinator) = coordinator_with(fixed_reply("I hold.", None));
    let err = coordinator
        .call_json("orders?", "gpt-4o", "FRANCE", CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::InvalidResponse {
            outcome: CallOutcome::ParseFailed,
            ..
        }
    ));
    assert_eq!(err.raw_response(), Some("I hold."));
}

#[tokio::test]
async fn resolution_error_propagates_as_transport() {
    let provider = Arc::new(SlowEchoProvider::new(Duration::from_millis(1)));
    let (_dir, coordinator) = coordinator_with(provider);
    let err = coordinator
        .call_text("hi", "missing/model", "FRANCE", CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_transport(),
        Some(ProviderError::UnknownModel { model }) if model == "missing/model"
    ));
    assert!(coordinator.pool().is_empty());
}

#[tokio::test]
async fn request_carries_log_id_to_override() {
    let (_dir, coordinator) = coordinator_with(fixed_reply("unused", None));
    let caller = caller_fn(|request| {
        let answer = format!("{}@{}", request.log_id(), request.phase_id());
        async move { Ok::<_, ProviderError>(answer) }
    });
    let request = coordinator
        .new_request("p", "gpt-4o")
        .with_phase("F1901M")
        .with_log_id("trace-42")
        .with_caller(caller);
    assert_eq!(coordinator.request(request).await.unwrap(), "trace-42@F1901M");
    assert!(coordinator.pool().is_empty());
}

#[tokio::test]
async fn cancelled_local_call_releases_gate() {
    let provider = Arc::new(SlowEchoProvider::new(Duration::from_secs(30)));
    let counter = Arc::clone(&provider.counter);
    let (_dir, coordinator) = coordinator_with(provider);

    let stalled = tokio::time::timeout(
        Duration::from_millis(50),
        coordinator.call_text("slow", "local/modelA", "FRANCE", CallOptions::default()),
    )
    .await;
    assert!(stalled.is_err());
    assert_eq!(counter.calls(), 1);

    // The second local call gets past the gate and into the model.
    let second = tokio::time::timeout(
        Duration::from_millis(50),
        coordinator.call_text("again", "local/modelB", "FRANCE", CallOptions::default()),
    )
    .await;
    assert!(second.is_err());
    assert_eq!(counter.calls(), 2);
}
