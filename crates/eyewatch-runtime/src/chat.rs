//! Chat resolver: FAQ corpus first, generative fallback second, canned reply
//! last. Keeps one bounded transcript per conversation id, and a bounded
//! number of conversations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use eyewatch_core::transcript::DEFAULT_TRANSCRIPT_CAPACITY;
use eyewatch_core::{AnswerSource, ChatMessage, FaqCorpus, Transcript};

use crate::generator::TextGenerator;

pub const FALLBACK_REPLY: &str = "Sorry, I couldn't fetch a response.";
pub const DEFAULT_CONVERSATION: &str = "default";

/// Conversations kept in memory before the least recently used is dropped.
pub const DEFAULT_MAX_CONVERSATIONS: usize = 1_000;

/// Longest accepted chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("message is longer than {limit} characters")]
    MessageTooLong { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub reply: String,
    pub source: AnswerSource,
    pub conversation_id: String,
}

/// Transcripts by conversation id, ordered by last use.
#[derive(Default)]
struct Conversations {
    transcripts: HashMap<String, Transcript>,
    recency: VecDeque<String>,
}

impl Conversations {
    fn push(&mut self, id: &str, message: ChatMessage, capacity: usize, max: usize) {
        if let Some(transcript) = self.transcripts.get_mut(id) {
            transcript.push(message);
            if let Some(pos) = self.recency.iter().position(|c| c == id) {
                if let Some(id) = self.recency.remove(pos) {
                    self.recency.push_back(id);
                }
            }
            return;
        }

        while self.transcripts.len() >= max {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.transcripts.remove(&oldest);
            tracing::debug!(conversation = %oldest, "dropped least recently used transcript");
        }
        let mut transcript = Transcript::with_capacity(capacity);
        transcript.push(message);
        self.transcripts.insert(id.to_string(), transcript);
        self.recency.push_back(id.to_string());
    }
}

pub struct ChatService {
    corpus: FaqCorpus,
    generator: Option<Arc<dyn TextGenerator>>,
    conversations: Mutex<Conversations>,
    transcript_capacity: usize,
    max_conversations: usize,
}

impl ChatService {
    pub fn new(corpus: FaqCorpus, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self {
            corpus,
            generator,
            conversations: Mutex::new(Conversations::default()),
            transcript_capacity: DEFAULT_TRANSCRIPT_CAPACITY,
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
        }
    }

    #[must_use]
    pub fn with_transcript_capacity(mut self, capacity: usize) -> Self {
        self.transcript_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_conversations(mut self, max: usize) -> Self {
        self.max_conversations = max.max(1);
        self
    }

    /// Answer `message` and record both sides in the conversation.
    pub async fn ask(
        &self,
        conversation_id: Option<&str>,
        message: &str,
    ) -> Result<ChatReply, ChatError> {
        let query = message.trim();
        if query.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if query.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::MessageTooLong {
                limit: MAX_MESSAGE_CHARS,
            });
        }
        let conversation_id = conversation_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CONVERSATION)
            .to_string();

        self.record(&conversation_id, ChatMessage::user(query, Utc::now()))
            .await;

        let (reply, source) = self.resolve(query).await;

        self.record(
            &conversation_id,
            ChatMessage::bot(reply.clone(), source, Utc::now()),
        )
        .await;

        Ok(ChatReply {
            reply,
            source,
            conversation_id,
        })
    }

    async fn resolve(&self, query: &str) -> (String, AnswerSource) {
        if let Some(hit) = self.corpus.best_match(query) {
            tracing::debug!(index = hit.index, score = hit.score, "faq hit");
            return (hit.entry.answer.clone(), AnswerSource::Faq);
        }

        let Some(generator) = self.generator.as_ref() else {
            tracing::debug!("faq miss and no generator configured");
            return (FALLBACK_REPLY.to_string(), AnswerSource::Fallback);
        };

        match generator.generate(query).await {
            Ok(text) => (text, AnswerSource::Generative),
            Err(e) => {
                tracing::warn!(generator = generator.name(), "generation failed: {e}");
                (FALLBACK_REPLY.to_string(), AnswerSource::Fallback)
            }
        }
    }

    async fn record(&self, conversation_id: &str, message: ChatMessage) {
        self.conversations.lock().await.push(
            conversation_id,
            message,
            self.transcript_capacity,
            self.max_conversations,
        );
    }

    /// Messages of one conversation, oldest first. Unknown ids are empty.
    pub async fn transcript(&self, conversation_id: Option<&str>) -> Vec<ChatMessage> {
        let id = conversation_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CONVERSATION);
        self.conversations
            .lock()
            .await
            .transcripts
            .get(id)
            .map(Transcript::to_vec)
            .unwrap_or_default()
    }
}
