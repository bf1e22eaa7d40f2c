//! Conversation domain types.
//!
//! A conversation is an append-only log of turns owned by exactly one owner.
//! Turns are immutable once persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the user who owns conversations and notes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The LLM
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parse the stored lowercase form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single persisted message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique turn ID
    pub turn_id: String,

    /// The conversation this turn belongs to
    pub conversation_id: ConversationId,

    /// Who wrote this turn
    pub role: Role,

    /// The text content
    pub text: String,

    /// Strictly increasing within a conversation
    pub created_at: DateTime<Utc>,

    /// Estimated token count of `text`
    pub token_count: usize,

    /// Backend the turn was sent to or answered by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
}

impl ConversationTurn {
    /// Build a turn stamped with the current time.
    ///
    /// Stores may bump `created_at` to keep it strictly increasing.
    pub fn new(conversation_id: ConversationId, role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count = crate::token::estimate_tokens(&text);
        Self {
            turn_id: Uuid::new_v4().to_string(),
            conversation_id,
            role,
            text,
            created_at: Utc::now(),
            token_count,
            llm_provider: None,
            llm_model: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<&TurnOrigin>) -> Self {
        if let Some(origin) = origin {
            self.llm_provider = Some(origin.llm_provider.clone());
            self.llm_model = Some(origin.llm_model.clone());
        }
        self
    }
}

/// Which provider and model a turn was exchanged with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOrigin {
    pub llm_provider: String,
    pub llm_model: String,
}

impl TurnOrigin {
    pub fn new(llm_provider: impl Into<String>, llm_model: impl Into<String>) -> Self {
        Self {
            llm_provider: llm_provider.into(),
            llm_model: llm_model.into(),
        }
    }
}

/// Conversation header: who owns it and when it started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(conversation_id: ConversationId, owner_id: OwnerId) -> Self {
        Self {
            conversation_id,
            owner_id,
            created_at: Utc::now(),
        }
    }
}
