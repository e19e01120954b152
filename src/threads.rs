//! Thread detection over conversation transcripts.
//!
//! Threads are a contiguous partition of the non-system subsequence: every
//! non-system message lands in exactly one thread, in original order.
//! System messages never participate in boundaries or membership.

use crate::semantic;
use crate::types::{ConversationThread, Message, Role};
use serde::Serialize;
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Boundaries
// ---------------------------------------------------------------------------

/// Why a new thread starts at a given transcript index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    /// Closure tokens in the previous message and a new-topic opener in
    /// the current one.
    NaturalBreak,
    /// Near-zero content-word overlap on a user message with no follow-up
    /// cue.
    TopicSwitch,
    /// A user greeting right after an assistant turn.
    ConversationRestart,
}

/// Detect thread boundaries. Returned indices are positions in the
/// original transcript where a new thread begins. Predicates are applied
/// in declaration order; the first match wins.
pub fn detect_boundaries(messages: &[Message]) -> Vec<(usize, BoundaryKind)> {
    let mut boundaries = Vec::new();
    let mut prev: Option<(usize, &Message)> = None;

    for (i, msg) in messages.iter().enumerate() {
        if msg.is_system() {
            continue;
        }
        if let Some((_, prev_msg)) = prev {
            if let Some(kind) = boundary_between(prev_msg, msg) {
                boundaries.push((i, kind));
            }
        }
        prev = Some((i, msg));
    }

    boundaries
}

fn boundary_between(prev: &Message, cur: &Message) -> Option<BoundaryKind> {
    if semantic::contains_closure(&prev.content) && semantic::starts_new_topic(&cur.content) {
        return Some(BoundaryKind::NaturalBreak);
    }
    if cur.role == Role::User
        && semantic::word_overlap(&prev.content, &cur.content) < 0.1
        && !semantic::starts_with_follow_up(&cur.content)
    {
        return Some(BoundaryKind::TopicSwitch);
    }
    if cur.role == Role::User
        && prev.role == Role::Assistant
        && semantic::starts_with_greeting(&cur.content)
    {
        return Some(BoundaryKind::ConversationRestart);
    }
    None
}

// ---------------------------------------------------------------------------
// Thread identification
// ---------------------------------------------------------------------------

/// Partition the non-system transcript into contiguous threads. Thread ids
/// are deterministic (`thread-1`, `thread-2`, …) so repeated runs over the
/// same transcript agree.
pub fn identify_threads(messages: &[Message]) -> Vec<ConversationThread> {
    let non_system: Vec<usize> =
        messages.iter().enumerate().filter(|(_, m)| !m.is_system()).map(|(i, _)| i).collect();
    if non_system.is_empty() {
        return Vec::new();
    }

    let boundary_set: BTreeSet<usize> =
        detect_boundaries(messages).into_iter().map(|(i, _)| i).collect();

    let mut groups: Vec<Vec<usize>> = Vec::new();
    for idx in non_system {
        let start_new = groups.is_empty() || boundary_set.contains(&idx);
        if start_new {
            groups.push(Vec::new());
        }
        groups.last_mut().expect("group pushed above").push(idx);
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(n, indices)| {
            let members: Vec<&Message> = indices.iter().map(|&i| &messages[i]).collect();
            let owned: Vec<Message> = members.iter().map(|m| (*m).clone()).collect();
            let keywords = semantic::identify_topics(&owned);
            let topic = keywords.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
            let importance = thread_importance(&members);
            ConversationThread {
                id: format!("thread-{}", n + 1),
                topic,
                start_index: indices[0],
                end_index: *indices.last().expect("non-empty group"),
                message_indices: indices,
                importance,
                keywords,
            }
        })
        .collect()
}

/// 0.05 per message (cap 0.3) + 0.15 per question (cap 0.3) + 0.25 for any
/// code fence + 0.15 for problem-resolution vocabulary, capped at 1.0.
fn thread_importance(members: &[&Message]) -> f64 {
    let size_score = (members.len() as f64 * 0.05).min(0.3);
    let questions = members.iter().filter(|m| semantic::is_question(&m.content)).count();
    let question_score = (questions as f64 * 0.15).min(0.3);
    let code_score =
        if members.iter().any(|m| m.has_code_block()) { 0.25 } else { 0.0 };
    let resolution_score = if members
        .iter()
        .any(|m| semantic::has_solution_language(&m.content) || semantic::has_error_vocabulary(&m.content))
    {
        0.15
    } else {
        0.0
    };
    (size_score + question_score + code_score + resolution_score).min(1.0)
}

/// Balance of user↔assistant pairing in [0.2, 1.0]. A thread carried by a
/// single role is weakly coherent but never zeroed out.
pub fn thread_coherence(thread: &ConversationThread, messages: &[Message]) -> f64 {
    let mut users = 0usize;
    let mut assistants = 0usize;
    for &i in &thread.message_indices {
        match messages[i].role {
            Role::User => users += 1,
            Role::Assistant => assistants += 1,
            _ => {}
        }
    }
    let max = users.max(assistants);
    if max == 0 {
        return 0.2;
    }
    let balance = users.min(assistants) as f64 / max as f64;
    balance.max(0.2)
}

/// A thread is complete when it ends with closure vocabulary or has at
/// least three messages.
pub fn is_thread_complete(thread: &ConversationThread, messages: &[Message]) -> bool {
    if thread.message_indices.len() >= 3 {
        return true;
    }
    thread
        .message_indices
        .last()
        .is_some_and(|&i| semantic::contains_closure(&messages[i].content))
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

const DEPENDENCY_PHRASES: &[&str] =
    &["now that", "after", "since", "based on", "using the", "with the"];

/// Directed dependency edges `(dependent, prerequisite)` as indices into
/// the thread list. A later thread depends on an earlier one when it
/// explicitly references prior work and shares keywords or topic terms.
pub fn thread_dependencies(
    threads: &[ConversationThread],
    messages: &[Message],
) -> Vec<(usize, usize)> {
    let mut deps = Vec::new();

    for (t_idx, thread) in threads.iter().enumerate() {
        let references_prior = thread.message_indices.iter().any(|&i| {
            let lower = messages[i].content.to_lowercase();
            DEPENDENCY_PHRASES.iter().any(|p| lower.contains(p))
        });
        if !references_prior {
            continue;
        }

        let own: BTreeSet<&str> = thread.keywords.iter().map(|s| s.as_str()).collect();
        for (s_idx, earlier) in threads[..t_idx].iter().enumerate() {
            let shared = earlier.keywords.iter().any(|k| own.contains(k.as_str()))
                || earlier.topic.split(' ').any(|t| !t.is_empty() && own.contains(t));
            if shared {
                deps.push((t_idx, s_idx));
            }
        }
    }

    deps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> Message {
        Message::new(Role::User, content)
    }

    fn assistant(content: &str) -> Message {
        Message::new(Role::Assistant, content)
    }

    fn system(content: &str) -> Message {
        Message::new(Role::System, content)
    }

    #[test]
    fn partition_covers_non_system_exactly() {
        let messages = vec![
            system("you are helpful"),
            user("my database query is slow"),
            assistant("add an index to the database table"),
            user("what about the authentication flow?"),
            assistant("the authentication flow uses tokens"),
        ];
        let threads = identify_threads(&messages);

        let mut covered: Vec<usize> =
            threads.iter().flat_map(|t| t.message_indices.clone()).collect();
        covered.sort();
        assert_eq!(covered, vec![1, 2, 3, 4]);

        // Contiguous and disjoint.
        for t in &threads {
            let w: Vec<usize> = t.message_indices.clone();
            assert!(w.windows(2).all(|p| p[0] < p[1]));
            assert_eq!(t.start_index, w[0]);
            assert_eq!(t.end_index, *w.last().unwrap());
        }
    }

    #[test]
    fn greeting_after_assistant_is_restart() {
        let mut messages = Vec::new();
        for i in 0..5 {
            messages.push(user(&format!("question about the parser {i}")));
            messages.push(assistant(&format!("answer about the parser {i}")));
        }
        // Index 10: greeting that still mentions the running topic, so the
        // overlap predicate stays quiet and the restart rule is what fires.
        messages.push(user("Hi again, the parser answer helped"));
        messages.push(assistant("hello, what do you need next?"));

        let boundaries = detect_boundaries(&messages);
        let restart = boundaries.iter().find(|(i, _)| *i == 10);
        assert_eq!(restart, Some(&(10, BoundaryKind::ConversationRestart)), "{boundaries:?}");
    }

    #[test]
    fn natural_break_needs_closure_then_new_topic() {
        let messages = vec![
            user("the cache bug is gone, thanks, that works"),
            user("now let's look at the deploy pipeline"),
        ];
        let boundaries = detect_boundaries(&messages);
        assert_eq!(boundaries, vec![(1, BoundaryKind::NaturalBreak)]);
    }

    #[test]
    fn follow_up_suppresses_topic_switch() {
        let messages = vec![
            user("the tokenizer panics on empty input"),
            user("and here is some totally different wording"),
        ];
        let boundaries = detect_boundaries(&messages);
        assert!(boundaries.is_empty(), "boundaries: {boundaries:?}");
    }

    #[test]
    fn importance_rewards_code_and_questions() {
        let plain = identify_threads(&[user("short note"), assistant("ok")]);
        let rich = identify_threads(&[
            user("how do I fix this error?"),
            assistant("```rust\nfix()\n```"),
            user("why does that work?"),
            assistant("because the fix resolves the root cause"),
        ]);
        assert!(rich[0].importance > plain[0].importance);
        assert!(rich[0].importance <= 1.0);
    }

    #[test]
    fn coherence_balanced_vs_one_sided() {
        let balanced = identify_threads(&[
            user("question one about caching"),
            assistant("answer one about caching"),
        ]);
        let one_sided = identify_threads(&[
            user("note one about caching"),
            user("note two about caching"),
        ]);
        let messages_a = vec![
            user("question one about caching"),
            assistant("answer one about caching"),
        ];
        let messages_b =
            vec![user("note one about caching"), user("note two about caching")];
        assert_eq!(thread_coherence(&balanced[0], &messages_a), 1.0);
        assert_eq!(thread_coherence(&one_sided[0], &messages_b), 0.2);
    }

    #[test]
    fn dependencies_need_phrase_and_overlap() {
        let messages = vec![
            user("set up the database schema for users"),
            assistant("schema created with a users table"),
            user("what about the frontend styling?"),
            assistant("use css modules"),
            user("now that the database schema exists, add a query layer"),
            assistant("query layer added on top of the schema"),
        ];
        let threads = identify_threads(&messages);
        assert!(threads.len() >= 2, "threads: {}", threads.len());
        let deps = thread_dependencies(&threads, &messages);
        // The last thread must depend on the schema thread (index 0).
        assert!(deps.iter().any(|&(d, p)| p == 0 && d == threads.len() - 1), "deps: {deps:?}");
    }
}
