//! Conversation, memory, and message types shared by the engine and handlers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier assigned by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who produced a conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The external user
    User,

    /// The catch-all conversation agent
    Agent,

    /// A feature handler
    Handler,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
            Role::Handler => "handler",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "agent" => Some(Role::Agent),
            "handler" => Some(Role::Handler),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable entry in a user's conversation stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    /// Assigned before the write so retried writes stay idempotent
    pub id: String,
    pub user_id: UserId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub handler_name: Option<String>,
}

impl ConversationTurn {
    /// Create a turn written by the user
    pub fn user(user_id: UserId, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            role: Role::User,
            text: text.into(),
            timestamp,
            handler_name: None,
        }
    }

    /// Create a turn written on the user's behalf by a handler or the agent
    pub fn reply(
        user_id: UserId,
        role: Role,
        handler_name: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            role,
            text: text.into(),
            timestamp,
            handler_name: Some(handler_name.into()),
        }
    }
}

/// Declared importance of a memory fact, lowest first
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Importance {
    /// Ordinal level stored in the database
    pub fn level(&self) -> i64 {
        match self {
            Importance::Low => 0,
            Importance::Normal => 1,
            Importance::High => 2,
            Importance::Critical => 3,
        }
    }

    pub fn from_level(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Importance::Low,
            1 => Importance::Normal,
            2 => Importance::High,
            _ => Importance::Critical,
        }
    }

    /// Normalized weight in 0.0..=1.0
    pub fn weight(&self) -> f64 {
        self.level() as f64 / 3.0
    }
}

/// A durable piece of long-term information about a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryFact {
    pub id: i64,
    pub user_id: UserId,
    pub category: String,
    pub text: String,
    pub importance: Importance,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A fact a handler asks the orchestrator to remember
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactNote {
    pub category: String,
    pub text: String,
    pub importance: Importance,
}

impl FactNote {
    pub fn new(category: impl Into<String>, text: impl Into<String>, importance: Importance) -> Self {
        Self {
            category: category.into(),
            text: text.into(),
            importance,
        }
    }
}

/// Intent label returned by the reasoning service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Classification {
    pub intent: Option<String>,
    pub confidence: f64,
    /// True when the reasoning service could not be consulted
    #[serde(default)]
    pub degraded: bool,
}

impl Classification {
    pub fn new(intent: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: Some(intent.into()),
            confidence: confidence.clamp(0.0, 1.0),
            degraded: false,
        }
    }

    /// Empty classification used when the reasoning service is unavailable
    pub fn degraded() -> Self {
        Self {
            intent: None,
            confidence: 0.0,
            degraded: true,
        }
    }

    /// Intent label if the confidence reaches `threshold`
    pub fn confident_intent(&self, threshold: f64) -> Option<&str> {
        match &self.intent {
            Some(intent) if !self.degraded && self.confidence >= threshold => Some(intent),
            _ => None,
        }
    }
}

/// Media delivered alongside an inbound message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    /// photo, voice, document, ...
    pub kind: String,
    /// Transport-local reference (file id or path)
    pub reference: String,
    pub caption: Option<String>,
}

/// A message delivered by the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl InboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Text used for routing: the message body followed by attachment captions
    pub fn routing_text(&self) -> String {
        let mut text = self.text.clone();
        for attachment in &self.attachments {
            if let Some(caption) = &attachment.caption {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(caption);
            }
        }
        text
    }
}

/// An outbound message produced by a periodic handler action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledAction {
    pub user_id: UserId,
    pub handler_name: String,
    pub text: String,
}
