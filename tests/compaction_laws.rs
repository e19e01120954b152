//! Cross-module compaction laws: the literal seed scenarios plus the
//! universal properties (system preservation, determinism, retention
//! bands, rollback fidelity, quality monotonicity).

use context_engine::compaction::CompactionEngine;
use context_engine::threads::{detect_boundaries, identify_threads, BoundaryKind};
use context_engine::tokenizer::CharEstimateTokenizer;
use context_engine::{CompactionLevel, CompactionOptions, Message, PreservationRule, Role};
use std::sync::Arc;

fn engine() -> CompactionEngine {
    CompactionEngine::new(Arc::new(CharEstimateTokenizer))
}

fn conversation(n: usize) -> Vec<Message> {
    (0..n)
        .map(|i| {
            if i % 2 == 0 {
                Message::new(Role::User, format!("how does component {} handle input {i}?", i / 4))
            } else {
                Message::new(Role::Assistant, format!("component {} validates input {i}", i / 4))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Seed scenarios
// ---------------------------------------------------------------------------

#[test]
fn seed_empty_transcript_yields_empty_result() {
    let result = engine().compact(&[], &CompactionOptions::default()).unwrap();
    assert!(result.messages.is_empty());
    assert_eq!(result.original_count, 0);
    assert_eq!(result.metrics.compression_ratio, 0.0);
    assert_eq!(result.metrics.token_reduction, 0.0);
    assert_eq!(result.metrics.information_preservation, 0.0);
    assert_eq!(result.metrics.effectiveness_score, 0.0);
}

#[test]
fn seed_three_messages_with_system_pass_through() {
    let messages = vec![
        Message::new(Role::System, "you are a coding assistant"),
        Message::new(Role::User, "what is a closure?"),
        Message::new(Role::Assistant, "a function capturing its environment"),
    ];
    let result = engine().compact(&messages, &CompactionOptions::default()).unwrap();
    assert_eq!(result.messages, messages);
    assert_eq!(result.metrics.compression_ratio, 0.0);
}

#[test]
fn seed_aggressive_twenty_messages_keeps_code_block() {
    let mut messages = conversation(20);
    messages[11] =
        Message::new(Role::User, "try this: ```js\nconst total = items.reduce(sum);\n```");

    let options =
        CompactionOptions { level: Some(CompactionLevel::Aggressive), ..Default::default() };
    let result = engine().compact(&messages, &options).unwrap();

    assert!(
        (5..=8).contains(&result.messages.len()),
        "expected 5..=8 messages, got {}",
        result.messages.len()
    );
    assert!(result.messages.iter().any(|m| m.content.contains("```js")));
}

#[test]
fn seed_greeting_at_index_ten_is_conversation_restart() {
    let mut messages = Vec::new();
    for i in 0..5 {
        messages.push(Message::new(Role::User, format!("parser question number {i}")));
        messages.push(Message::new(Role::Assistant, format!("parser answer number {i}")));
    }
    messages.push(Message::new(Role::User, "Hello again! one more parser question"));
    messages.push(Message::new(Role::Assistant, "sure, go ahead with the parser question"));

    let boundaries = detect_boundaries(&messages);
    assert!(
        boundaries.contains(&(10, BoundaryKind::ConversationRestart)),
        "boundaries: {boundaries:?}"
    );
}

#[test]
fn seed_rollback_restores_deep_equal_original() {
    let messages = conversation(24);
    let options = CompactionOptions {
        level: Some(CompactionLevel::Aggressive),
        enable_rollback: true,
        ..Default::default()
    };
    let e = engine();
    let result = e.compact(&messages, &options).unwrap();
    assert!(result.messages.len() < messages.len());

    let restored = e.rollback(result.rollback_token.as_deref().unwrap()).unwrap();
    assert_eq!(restored, messages);
}

// ---------------------------------------------------------------------------
// Universal laws
// ---------------------------------------------------------------------------

#[test]
fn system_messages_are_subset_of_output() {
    for level in [CompactionLevel::Light, CompactionLevel::Moderate, CompactionLevel::Aggressive] {
        let mut messages = conversation(36);
        messages.insert(0, Message::new(Role::System, "rules of engagement"));
        messages.insert(20, Message::new(Role::System, "updated instruction"));

        let options = CompactionOptions { level: Some(level), ..Default::default() };
        let result = engine().compact(&messages, &options).unwrap();
        let kept_systems =
            result.messages.iter().filter(|m| m.role == Role::System).count();
        assert_eq!(kept_systems, 2, "{level:?} dropped a system message");
    }
}

#[test]
fn code_block_rule_keeps_every_fenced_message() {
    let mut messages = conversation(30);
    for &i in &[2, 13, 27] {
        messages[i] = Message::new(Role::Assistant, format!("snippet ```rust\nlet x = {i};\n```"));
    }
    let options = CompactionOptions {
        level: Some(CompactionLevel::Aggressive),
        preservation_rules: vec![PreservationRule::CodeBlocks],
        ..Default::default()
    };
    let result = engine().compact(&messages, &options).unwrap();
    assert_eq!(result.messages.iter().filter(|m| m.has_code_block()).count(), 3);
}

#[test]
fn compaction_is_deterministic_across_engines() {
    let messages = conversation(40);
    let options =
        CompactionOptions { level: Some(CompactionLevel::Moderate), ..Default::default() };
    let a = engine().compact(&messages, &options).unwrap();
    let b = engine().compact(&messages, &options).unwrap();
    assert_eq!(a.messages, b.messages);
    assert_eq!(a.metrics.compression_ratio, b.metrics.compression_ratio);
}

#[test]
fn retention_bands_hold_within_tolerance() {
    let messages = conversation(60);
    for level in [CompactionLevel::Light, CompactionLevel::Moderate, CompactionLevel::Aggressive] {
        let options = CompactionOptions { level: Some(level), ..Default::default() };
        let result = engine().compact(&messages, &options).unwrap();
        let retention = result.messages.len() as f64 / messages.len() as f64;
        assert!(
            (retention - level.retention_rate()).abs() <= 0.05,
            "{level:?} retention {retention} outside band"
        );
    }
}

#[test]
fn rollback_token_expiry_is_reported() {
    let messages = conversation(24);
    let options = CompactionOptions {
        level: Some(CompactionLevel::Moderate),
        enable_rollback: true,
        rollback_ttl: Some(std::time::Duration::from_millis(0)),
        ..Default::default()
    };
    let e = engine();
    let result = e.compact(&messages, &options).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let err = e.rollback(result.rollback_token.as_deref().unwrap()).unwrap_err();
    assert_eq!(err.kind(), "expired");
}

#[test]
fn information_preservation_grows_with_retention() {
    let messages = conversation(48);
    let e = engine();
    let mut previous = -1.0;
    for level in [CompactionLevel::Aggressive, CompactionLevel::Moderate, CompactionLevel::Light] {
        let options = CompactionOptions { level: Some(level), ..Default::default() };
        let result = e.compact(&messages, &options).unwrap();
        assert!(
            result.metrics.information_preservation >= previous,
            "{level:?} regressed information preservation"
        );
        previous = result.metrics.information_preservation;
    }
}

#[test]
fn thread_partition_covers_non_system_transcript() {
    let mut messages = conversation(25);
    messages.insert(5, Message::new(Role::System, "mid-stream system note"));
    let threads = identify_threads(&messages);

    let mut covered: Vec<usize> =
        threads.iter().flat_map(|t| t.message_indices.clone()).collect();
    covered.sort_unstable();
    let expected: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != Role::System)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(covered, expected, "threads must partition the non-system transcript");

    // Disjointness: no index appears twice.
    let mut dedup = covered.clone();
    dedup.dedup();
    assert_eq!(covered, dedup);
}

#[test]
fn token_reduction_uses_shared_estimator() {
    let messages = conversation(30);
    let options =
        CompactionOptions { level: Some(CompactionLevel::Aggressive), ..Default::default() };
    let result = engine().compact(&messages, &options).unwrap();

    let tok = CharEstimateTokenizer;
    let original: usize =
        messages.iter().map(|m| context_engine::Tokenizer::count_tokens(&tok, &m.content)).sum();
    let kept: usize = result
        .messages
        .iter()
        .map(|m| context_engine::Tokenizer::count_tokens(&tok, &m.content))
        .sum();
    let expected = 1.0 - kept as f64 / original as f64;
    assert!((result.metrics.token_reduction - expected).abs() < 1e-9);
}
