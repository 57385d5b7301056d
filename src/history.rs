//! Bounded conversation history
//!
//! Exchanges are kept in insertion order and truncated oldest-first. The
//! system prompt is never stored; [`History::as_context`] prepends it on
//! every call.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of retained exchanges
pub const DEFAULT_MAX_HISTORY: usize = 10;

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub role: Role,
    pub content: String,
}

impl Exchange {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only log capped at `max` entries
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Exchange>,
    max: usize,
    system_prompt: String,
}

impl History {
    #[must_use]
    pub fn new(system_prompt: impl Into<String>, max: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max + 2),
            max,
            system_prompt: system_prompt.into(),
        }
    }

    /// Append one exchange, dropping the oldest beyond the cap
    pub fn append(&mut self, exchange: Exchange) {
        self.entries.push_back(exchange);
        self.truncate(self.max);
    }

    /// Commit a user prompt and its reply together
    pub fn append_pair(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.entries.push_back(Exchange::user(user));
        self.entries.push_back(Exchange::assistant(assistant));
        self.truncate(self.max);
        tracing::debug!(entries = self.entries.len(), "history updated");
    }

    /// Keep only the most recent `max_count` entries
    pub fn truncate(&mut self, max_count: usize) {
        while self.entries.len() > max_count {
            self.entries.pop_front();
        }
    }

    /// System prelude followed by retained entries, oldest first
    #[must_use]
    pub fn as_context(&self) -> Vec<Exchange> {
        std::iter::once(Exchange::system(self.system_prompt.clone()))
            .chain(self.entries.iter().cloned())
            .collect()
    }

    /// Forget every exchange
    pub fn reset(&mut self) {
        self.entries.clear();
        tracing::info!("conversation history cleared");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retained entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &Exchange> {
        self.entries.iter()
    }
}
