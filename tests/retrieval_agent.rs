//! Retrieval agent turns against the in-memory collaborators.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use wiki_kb::agent::{AgentSettings, AgentState, RetrievalAgent};
use wiki_kb::content::placeholder_token;
use wiki_kb::error::KbError;
use wiki_kb::in_memory::{InMemoryIndex, InMemoryMemory, InMemoryObjectStore, ScriptedModel};
use wiki_kb::models::{ImageBinding, NormalizedDocument, Role};
use wiki_kb::render::CitationRenderer;
use wiki_kb::traits::KnowledgeIndex;

const DIAGRAM_KEY: &str = "imgs/1/att1/0123456789abcdef-rotation.png";

struct Harness {
    index: Arc<InMemoryIndex>,
    memory: Arc<InMemoryMemory>,
    model: Arc<ScriptedModel>,
    agent: RetrievalAgent,
}

fn doc(page_id: &str, title: &str, text: &str, images: Vec<ImageBinding>) -> NormalizedDocument {
    NormalizedDocument {
        id: NormalizedDocument::id_for_page(page_id),
        space_key: "DOCS".to_string(),
        page_id: page_id.to_string(),
        title: title.to_string(),
        url: format!("https://wiki.test/wiki/spaces/DOCS/pages/{}", page_id),
        text: text.to_string(),
        images,
        version: 1,
        last_modified: Utc::now(),
    }
}

async fn harness(replies: &[&str]) -> Harness {
    let index = Arc::new(InMemoryIndex::new());
    index
        .upsert(&doc(
            "1",
            "Key rotation",
            &format!(
                "Rotate signing keys every quarter.\n\n![Rotation flow](kb-image:{})",
                DIAGRAM_KEY
            ),
            vec![ImageBinding {
                token: placeholder_token(1),
                key: DIAGRAM_KEY.to_string(),
            }],
        ))
        .await
        .unwrap();
    index
        .upsert(&doc(
            "2",
            "Signing ceremony",
            "Keys are signed in a ceremony held offsite.",
            Vec::new(),
        ))
        .await
        .unwrap();

    let memory = Arc::new(InMemoryMemory::new());
    let model = Arc::new(ScriptedModel::new(replies.iter().copied()));
    let renderer = CitationRenderer::new(
        Arc::new(InMemoryObjectStore::new()),
        Duration::from_secs(900),
        Duration::from_secs(5),
    );
    let agent = RetrievalAgent::new(
        index.clone(),
        memory.clone(),
        model.clone(),
        renderer,
        AgentSettings {
            top_n: 3,
            history_turns: 3,
            call_timeout: Duration::from_secs(5),
        },
    );

    Harness {
        index,
        memory,
        model,
        agent,
    }
}

#[tokio::test]
async fn test_cited_document_is_expanded_inline() {
    let h = harness(&[
        r#"{"search": true, "query": "rotate signing keys"}"#,
        r#"Keys are rotated **quarterly**. <article ref="1"/>"#,
    ])
    .await;

    let answer = h
        .agent
        .handle_turn("user-42", "How do we rotate signing keys?")
        .await
        .unwrap();

    assert_eq!(h.index.queries(), vec!["rotate signing keys".to_string()]);
    assert!(answer.markup.contains("<strong>quarterly</strong>"));
    assert!(answer.markup.contains(r#"<div class="cited-document">"#));
    assert!(answer.markup.contains("<h4>Key rotation</h4>"));
    assert!(answer.markup.contains("Rotate signing keys every quarter."));
    assert!(!answer.markup.contains("ceremony"));
    assert!(!answer.markup.contains("<article"));
    assert!(answer
        .markup
        .contains(&format!("https://objects.test/{}?expires=900", DIAGRAM_KEY)));
    assert!(!answer.markup.contains("kb-image:"));
    assert_eq!(answer.dropped_fragments, 0);

    // Both documents were offered to the model, numbered by rank.
    let prompts = h.model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].system.contains("[1] Key rotation"));
    assert!(prompts[1].system.contains("[2] Signing ceremony"));

    let turns = h.memory.turns("user-42");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "How do we rotate signing keys?");
    assert_eq!(turns[1].role, Role::Assistant);
    assert!(turns[1].text.contains(r#"<article ref="1"/>"#));
}

#[tokio::test]
async fn test_small_talk_skips_search() {
    let h = harness(&[r#"{"search": false, "query": ""}"#, "Hello! How can I help?"]).await;

    let answer = h.agent.handle_turn("s1", "hi there").await.unwrap();

    assert_eq!(answer.markup, "<p>Hello! How can I help?</p>");
    assert!(h.index.queries().is_empty());
    let prompts = h.model.prompts();
    assert!(!prompts[1].system.contains("Documents:"));
    assert_eq!(h.memory.turns("s1").len(), 2);
}

#[tokio::test]
async fn test_out_of_range_citation_expands_to_nothing() {
    let h = harness(&[
        r#"{"search": true, "query": "ceremony"}"#,
        r#"See the ceremony notes. <article ref="5"/>"#,
    ])
    .await;

    let answer = h.agent.handle_turn("s1", "ceremony?").await.unwrap();
    assert!(answer.markup.contains("See the ceremony notes."));
    assert!(!answer.markup.contains("cited-document"));
}

#[tokio::test]
async fn test_model_markup_cannot_inject_html() {
    let h = harness(&[
        r#"{"search": false}"#,
        r#"Sure <script>alert(1)</script><img src=x onerror=alert(1)> [click](javascript:alert(1))"#,
    ])
    .await;

    let answer = h.agent.handle_turn("s1", "show me").await.unwrap();
    assert!(!answer.markup.contains("<script"));
    assert!(!answer.markup.contains("<img"));
    assert!(!answer.markup.contains("href=\"javascript"));
    assert!(answer.markup.contains("&lt;script&gt;"));
}

#[tokio::test]
async fn test_image_links_are_signed_fresh_each_turn() {
    let h = harness(&[
        r#"{"search": true, "query": "rotation"}"#,
        r#"Flow: <article ref="1"/>"#,
        r#"{"search": true, "query": "rotation"}"#,
        r#"Flow: <article ref="1"/>"#,
    ])
    .await;

    let first = h.agent.handle_turn("s1", "rotation flow?").await.unwrap();
    let second = h.agent.handle_turn("s1", "again please").await.unwrap();
    assert!(first.markup.contains(DIAGRAM_KEY));
    assert!(second.markup.contains(DIAGRAM_KEY));
    assert_ne!(first.markup, second.markup);
}

#[tokio::test]
async fn test_unavailable_history_degrades_to_empty() {
    let h = harness(&[r#"{"search": false}"#, "Fine."]).await;
    h.memory.fail_reads();

    let answer = h.agent.handle_turn("s1", "status?").await.unwrap();
    assert_eq!(answer.markup, "<p>Fine.</p>");
    let prompts = h.model.prompts();
    assert_eq!(prompts[0].messages.len(), 1);
    assert_eq!(prompts[0].messages[0].content, "status?");
}

#[tokio::test]
async fn test_model_failure_leaves_memory_untouched() {
    let h = harness(&[r#"{"search": true, "query": "rotation"}"#]).await;
    h.model
        .push_error(KbError::TransientIo("connection reset".to_string()));

    let err = h
        .agent
        .handle_turn("s1", "rotation?")
        .await
        .expect_err("turn should fail");
    assert_eq!(err.kind, "transient_io");
    assert!(err.retryable);
    assert_eq!(err.state, AgentState::ComposeAnswer);
    assert!(h.memory.turns("s1").is_empty());
}

#[tokio::test]
async fn test_invalid_session_is_rejected_before_any_call() {
    let h = harness(&[]).await;

    let err = h
        .agent
        .handle_turn("bad session/id", "hello")
        .await
        .expect_err("should reject");
    assert_eq!(err.kind, "invalid_request");
    assert!(!err.retryable);
    assert!(h.model.prompts().is_empty());

    let err = h.agent.handle_turn("s1", "   ").await.expect_err("should reject");
    assert_eq!(err.kind, "invalid_request");
}

#[tokio::test]
async fn test_follow_up_uses_previous_question_as_context() {
    let h = harness(&[
        r#"{"search": true, "query": "signing key rotation"}"#,
        r#"Quarterly. <article ref="1"/>"#,
        r#"{"search": true, "query": ""}"#,
        "Yes, by the security team.",
    ])
    .await;

    h.agent
        .handle_turn("s1", "How do we rotate signing keys?")
        .await
        .unwrap();
    h.agent.handle_turn("s1", "who does it?").await.unwrap();

    let queries = h.index.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1], "How do we rotate signing keys? who does it?");

    // The second decision saw the first exchange.
    let prompts = h.model.prompts();
    assert_eq!(prompts[2].messages.len(), 3);
    assert_eq!(h.memory.turns("s1").len(), 4);
}

#[tokio::test]
async fn test_unparseable_decision_searches_literal_text() {
    let h = harness(&["I think we should search.", "Quarterly."]).await;

    h.agent.handle_turn("s1", "  rotation cadence  ").await.unwrap();
    assert_eq!(h.index.queries(), vec!["rotation cadence".to_string()]);
}
