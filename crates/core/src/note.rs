//! User-authored notes, the main source of retrievable knowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::OwnerId;

/// A mutable note. Any change to `title` or `body` requires re-embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_id: String,
    pub owner_id: OwnerId,
    pub title: String,
    pub body: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Where the note's content came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Free-form remarks kept alongside the body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,

    /// Set once the note has been indexed
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,

    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(owner_id: OwnerId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            note_id: Uuid::new_v4().to_string(),
            owner_id,
            title: title.into(),
            body: body.into(),
            tags: Vec::new(),
            url: None,
            comments: None,
            embedding: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// The text that gets embedded and shown as context.
    ///
    /// Title, body and comments; the URL is metadata only.
    pub fn indexed_text(&self) -> String {
        let mut text = if self.title.trim().is_empty() {
            self.body.clone()
        } else {
            format!("{}\n{}", self.title, self.body)
        };
        if let Some(comments) = self.comments.as_deref().filter(|c| !c.trim().is_empty()) {
            text.push('\n');
            text.push_str(comments);
        }
        text
    }
}

/// Fields a caller may change on an existing note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteUpdate {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Change notification emitted by a note store.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteEvent {
    Upserted(Note),
    Deleted { note_id: String, owner_id: OwnerId },
}
