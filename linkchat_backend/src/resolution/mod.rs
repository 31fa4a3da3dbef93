//! Recursive link resolution.
//!
//! A message's `[[links]]` are resolved against a [`FileStore`](crate::store::FileStore):
//! plain notes and sections are inlined (recursively), images and audio become
//! media fragments, and linked chats that still await a reply are executed and
//! replaced by the reply. [`tree`] tracks the ancestor chain and the shared
//! cache for one top-level resolution; [`resolver`] does the work.

pub mod resolver;
pub mod tree;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use resolver::ContentResolver;
pub use tree::{NodeId, ResolutionContext, ResolutionNode};

/// One typed unit of resolved message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedFragment {
    Text { text: String },
    Image { url: String },
    Audio { data: String, format: String },
}

impl ResolvedFragment {
    pub fn text(text: impl Into<String>) -> Self {
        ResolvedFragment::Text { text: text.into() }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ResolvedFragment::Text { .. })
    }
}

/// The payload for one outbound message: a flat string, or ordered typed
/// parts when the message is made of links only and carries media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedContent {
    Text(String),
    Fragments(Vec<ResolvedFragment>),
}

pub fn circular_marker(path: &str) -> String {
    format!("(Error: Circular dependency: {})", path)
}

pub fn error_marker(error: &anyhow::Error) -> String {
    format!("(Error: {:#})", error)
}

/// Progress report emitted while a resolution tree grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionEvent {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: ResolutionEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResolutionEventKind {
    NodeEntered {
        node: NodeId,
        parent: Option<NodeId>,
        path: String,
        depth: usize,
    },
    CacheHit {
        node: NodeId,
        key: String,
    },
    CycleDetected {
        node: NodeId,
        path: String,
    },
    DepthLimited {
        node: NodeId,
        path: String,
    },
    ChatExecuted {
        node: NodeId,
        path: String,
    },
    NodeFailed {
        node: NodeId,
        path: String,
        error: String,
    },
    IntermediateWritten {
        path: String,
    },
}
