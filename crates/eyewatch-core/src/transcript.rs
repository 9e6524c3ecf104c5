use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages kept per conversation before the oldest are dropped.
pub const DEFAULT_TRANSCRIPT_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// Where a bot answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    /// Local corpus hit.
    Faq,
    /// Remote text generation.
    Generative,
    /// Canned reply after the generator failed or was not configured.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AnswerSource>,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            source: None,
            at,
        }
    }

    pub fn bot(text: impl Into<String>, source: AnswerSource, at: DateTime<Utc>) -> Self {
        Self {
            sender: Sender::Bot,
            text: text.into(),
            source: Some(source),
            at,
        }
    }
}

/// Linear, bounded conversation log.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRANSCRIPT_CAPACITY)
    }
}

impl Transcript {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }
}
