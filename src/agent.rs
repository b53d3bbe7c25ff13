//! Retrieval agent: one conversational turn as an explicit state machine.
//!
//! ```text
//! Start ─▶ LoadHistory ─▶ DecideRetrieval ─┬▶ Search ─────┬▶ ComposeAnswer ─▶ Render ─▶ Done
//!                                          └▶ SkipSearch ─┘
//!                        (any error after LoadHistory) ─▶ Failed
//! ```
//!
//! History loading is best-effort: a memory failure degrades to an empty
//! history. Every later failure ends the turn with an [`AgentError`] and no
//! partial answer. The user and assistant turns are appended to memory only
//! after rendering succeeds, so a cancelled or failed turn leaves memory
//! untouched.
//!
//! Whether to search, and with what query, is decided by a pluggable
//! [`RetrievalPolicy`]. The default [`ModelRetrievalPolicy`] asks the
//! language model, giving it the recent history so follow-up questions
//! ("and how often do we rotate them?") become standalone queries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::RetrievalConfig;
use crate::error::{KbError, Result};
use crate::models::{
    ComposedAnswer, ConversationTurn, Prompt, RenderedAnswer, RetrievedDocument, Role,
};
use crate::render::CitationRenderer;
use crate::retry::with_timeout;
use crate::traits::{ConversationMemory, KnowledgeIndex, LanguageModel};

const MAX_SESSION_ID_LEN: usize = 128;
const MAX_TEXT_CHARS: usize = 16_000;

const DECISION_INSTRUCTIONS: &str = "\
You decide whether answering the user's latest message requires searching the \
company knowledge base. Reply with a single line of JSON and nothing else:
{\"search\": true, \"query\": \"...\"} or {\"search\": false, \"query\": \"\"}
When searching, write a standalone search query: resolve pronouns and references \
to earlier messages so the query makes sense on its own.";

const ANSWER_INSTRUCTIONS: &str = "\
You answer questions using the company knowledge base. Answer directly and concisely. \
After any statement drawn from a numbered document, cite it with <article ref=\"N\"/> \
where N is the document number. Only cite numbers that are listed. Use markdown for \
headings, lists and emphasis.";

/// Observable states of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Start,
    LoadHistory,
    DecideRetrieval,
    Search,
    SkipSearch,
    ComposeAnswer,
    Render,
    Done,
    Failed,
}

/// Structured failure returned to the caller of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind} during {state:?}: {message}")]
pub struct AgentError {
    pub kind: String,
    pub message: String,
    /// Whether repeating the same turn may succeed.
    pub retryable: bool,
    /// State the turn was in when it failed.
    pub state: AgentState,
}

impl AgentError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: "invalid_request".to_string(),
            message: message.into(),
            retryable: false,
            state: AgentState::Start,
        }
    }

    fn at(state: AgentState, err: KbError) -> Self {
        Self {
            kind: err.kind().to_string(),
            retryable: err.is_retryable(),
            message: err.to_string(),
            state,
        }
    }
}

// ============ Retrieval policy ============

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetrievalDecision {
    pub search: bool,
    #[serde(default)]
    pub query: String,
}

#[async_trait]
pub trait RetrievalPolicy: Send + Sync {
    async fn decide(&self, history: &[ConversationTurn], text: &str) -> Result<RetrievalDecision>;
}

/// Asks the language model for a JSON decision.
///
/// A reply that is not valid JSON counts as "search with the literal
/// message"; a search decision with an empty query falls back to
/// [`contextual_query`].
pub struct ModelRetrievalPolicy {
    model: Arc<dyn LanguageModel>,
}

impl ModelRetrievalPolicy {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl RetrievalPolicy for ModelRetrievalPolicy {
    async fn decide(&self, history: &[ConversationTurn], text: &str) -> Result<RetrievalDecision> {
        let mut prompt = Prompt::new(DECISION_INSTRUCTIONS);
        for turn in history {
            prompt.push(turn.role, turn.text.clone());
        }
        prompt.push(Role::User, text);

        let reply = self.model.complete(&prompt).await?;
        let Some(mut decision) = parse_decision(&reply) else {
            debug!(reply = %reply, "unparseable retrieval decision, searching");
            return Ok(RetrievalDecision {
                search: true,
                query: text.trim().to_string(),
            });
        };
        if decision.search && decision.query.trim().is_empty() {
            decision.query = contextual_query(history, text);
        }
        Ok(decision)
    }
}

fn parse_decision(reply: &str) -> Option<RetrievalDecision> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

/// The previous user message followed by the current one.
pub fn contextual_query(history: &[ConversationTurn], text: &str) -> String {
    match history.iter().rev().find(|t| t.role == Role::User) {
        Some(prev) => format!("{} {}", prev.text.trim(), text.trim()),
        None => text.trim().to_string(),
    }
}

// ============ Agent ============

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub top_n: usize,
    /// Prior exchanges (user + assistant) loaded as history.
    pub history_turns: usize,
    pub call_timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_n: config.top_n,
            history_turns: config.history_turns,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

/// Result of the generation half of a turn, before rendering.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    NoRetrieval {
        answer: ComposedAnswer,
    },
    Retrieved {
        docs: Vec<RetrievedDocument>,
        answer: ComposedAnswer,
    },
}

impl PipelineOutcome {
    fn parts(&self) -> (&ComposedAnswer, &[RetrievedDocument]) {
        match self {
            PipelineOutcome::NoRetrieval { answer } => (answer, &[] as &[RetrievedDocument]),
            PipelineOutcome::Retrieved { docs, answer } => (answer, docs.as_slice()),
        }
    }
}

enum Step {
    Start,
    LoadHistory,
    DecideRetrieval {
        history: Vec<ConversationTurn>,
    },
    Search {
        history: Vec<ConversationTurn>,
        query: String,
    },
    SkipSearch {
        history: Vec<ConversationTurn>,
    },
    ComposeAnswer {
        history: Vec<ConversationTurn>,
        docs: Option<Vec<RetrievedDocument>>,
    },
    Render {
        outcome: PipelineOutcome,
    },
    Done {
        outcome: PipelineOutcome,
        rendered: RenderedAnswer,
    },
}

impl Step {
    fn state(&self) -> AgentState {
        match self {
            Step::Start => AgentState::Start,
            Step::LoadHistory => AgentState::LoadHistory,
            Step::DecideRetrieval { .. } => AgentState::DecideRetrieval,
            Step::Search { .. } => AgentState::Search,
            Step::SkipSearch { .. } => AgentState::SkipSearch,
            Step::ComposeAnswer { .. } => AgentState::ComposeAnswer,
            Step::Render { .. } => AgentState::Render,
            Step::Done { .. } => AgentState::Done,
        }
    }
}

pub struct RetrievalAgent {
    index: Arc<dyn KnowledgeIndex>,
    memory: Arc<dyn ConversationMemory>,
    model: Arc<dyn LanguageModel>,
    policy: Arc<dyn RetrievalPolicy>,
    renderer: CitationRenderer,
    settings: AgentSettings,
}

impl RetrievalAgent {
    pub fn new(
        index: Arc<dyn KnowledgeIndex>,
        memory: Arc<dyn ConversationMemory>,
        model: Arc<dyn LanguageModel>,
        renderer: CitationRenderer,
        settings: AgentSettings,
    ) -> Self {
        let policy = Arc::new(ModelRetrievalPolicy::new(model.clone()));
        Self {
            index,
            memory,
            model,
            policy,
            renderer,
            settings,
        }
    }

    /// Replace the retrieval decision policy.
    pub fn with_policy(mut self, policy: Arc<dyn RetrievalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Run one turn end to end.
    #[instrument(skip_all, fields(session = %session_id))]
    pub async fn handle_turn(
        &self,
        session_id: &str,
        text: &str,
    ) -> std::result::Result<RenderedAnswer, AgentError> {
        validate_session_id(session_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::invalid_request("text is empty"));
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(AgentError::invalid_request(format!(
                "text exceeds {} characters",
                MAX_TEXT_CHARS
            )));
        }

        let mut step = Step::Start;
        loop {
            let state = step.state();
            debug!(?state, "agent step");
            step = match step {
                Step::Start => Step::LoadHistory,
                Step::LoadHistory => Step::DecideRetrieval {
                    history: self.load_history(session_id).await,
                },
                Step::DecideRetrieval { history } => {
                    let decision = self
                        .call(self.policy.decide(&history, text), "retrieval decision")
                        .await
                        .map_err(|e| self.fail(state, e))?;
                    if decision.search {
                        Step::Search {
                            history,
                            query: decision.query,
                        }
                    } else {
                        Step::SkipSearch { history }
                    }
                }
                Step::Search { history, query } => {
                    let hits = self
                        .call(self.index.query(&query, self.settings.top_n), "index query")
                        .await
                        .map_err(|e| self.fail(state, e))?;
                    let docs: Vec<RetrievedDocument> = hits
                        .into_iter()
                        .take(self.settings.top_n)
                        .enumerate()
                        .map(|(i, hit)| RetrievedDocument {
                            rank: i + 1,
                            id: hit.id,
                            title: hit.title,
                            text: hit.text,
                            image_keys: hit.image_keys,
                        })
                        .collect();
                    info!(query = %query, hits = docs.len(), "knowledge base searched");
                    Step::ComposeAnswer {
                        history,
                        docs: Some(docs),
                    }
                }
                Step::SkipSearch { history } => Step::ComposeAnswer {
                    history,
                    docs: None,
                },
                Step::ComposeAnswer { history, docs } => {
                    let prompt = compose_prompt(&history, text, docs.as_deref());
                    let reply = self
                        .call(self.model.complete(&prompt), "answer composition")
                        .await
                        .map_err(|e| self.fail(state, e))?;
                    let answer = ComposedAnswer { text: reply };
                    Step::Render {
                        outcome: match docs {
                            Some(docs) => PipelineOutcome::Retrieved { docs, answer },
                            None => PipelineOutcome::NoRetrieval { answer },
                        },
                    }
                }
                Step::Render { outcome } => {
                    let (answer, docs) = outcome.parts();
                    let rendered = self
                        .renderer
                        .render(answer, docs)
                        .await
                        .map_err(|e| self.fail(state, e))?;
                    Step::Done { outcome, rendered }
                }
                Step::Done { outcome, rendered } => {
                    let (answer, _) = outcome.parts();
                    self.remember(session_id, text, &answer.text).await;
                    if rendered.dropped_fragments > 0 {
                        warn!(
                            dropped = rendered.dropped_fragments,
                            "unsafe fragments removed from answer"
                        );
                    }
                    return Ok(rendered);
                }
            };
        }
    }

    async fn call<T, F>(&self, fut: F, what: &str) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        with_timeout(self.settings.call_timeout, what, fut).await
    }

    fn fail(&self, state: AgentState, err: KbError) -> AgentError {
        warn!(?state, error = %err, "turn failed");
        AgentError::at(state, err)
    }

    async fn load_history(&self, session_id: &str) -> Vec<ConversationTurn> {
        let k = self.settings.history_turns * 2;
        if k == 0 {
            return Vec::new();
        }
        match self
            .call(self.memory.last_turns(session_id, k), "history load")
            .await
        {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "conversation history unavailable, continuing without it");
                Vec::new()
            }
        }
    }

    async fn remember(&self, session_id: &str, text: &str, answer: &str) {
        let turns = [
            ConversationTurn::user(text),
            ConversationTurn::assistant(answer),
        ];
        if let Err(e) = self
            .call(self.memory.append(session_id, &turns), "history append")
            .await
        {
            warn!(error = %e, "failed to record turn in conversation memory");
        }
    }
}

fn validate_session_id(session_id: &str) -> std::result::Result<(), AgentError> {
    if session_id.is_empty() {
        return Err(AgentError::invalid_request("session_id is empty"));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(AgentError::invalid_request(format!(
            "session_id exceeds {} bytes",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(AgentError::invalid_request(
            "session_id may only contain letters, digits, '-', '_', '.' and ':'",
        ));
    }
    Ok(())
}

/// Instructions, numbered documents, history, then the new message.
pub fn compose_prompt(
    history: &[ConversationTurn],
    text: &str,
    docs: Option<&[RetrievedDocument]>,
) -> Prompt {
    let mut system = ANSWER_INSTRUCTIONS.to_string();
    match docs {
        Some(docs) if !docs.is_empty() => {
            system.push_str("\n\nDocuments:");
            for doc in docs {
                system.push_str(&format!("\n\n[{}] {}\n{}", doc.rank, doc.title, doc.text));
            }
        }
        Some(_) => system.push_str("\n\nThe knowledge base search returned no documents."),
        None => {}
    }

    let mut prompt = Prompt::new(system);
    for turn in history {
        prompt.push(turn.role, turn.text.clone());
    }
    prompt.push(Role::User, text);
    prompt
}
