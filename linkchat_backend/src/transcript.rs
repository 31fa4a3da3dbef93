//! Markdown chat transcripts.
//!
//! A transcript is a sequence of `# role: <role>` headed sections (any heading
//! level). Leading YAML frontmatter is skipped. Text before the first role
//! heading is ignored, so a note without any role heading has no messages.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Returns the role named by a heading line such as `## role: assistant`.
/// `Err` carries the unrecognised role name.
fn role_heading(line: &str) -> Option<std::result::Result<Role, String>> {
    let trimmed = line.trim();
    let rest = trimmed.trim_start_matches('#');
    if rest.len() == trimmed.len() || !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let (label, value) = rest.trim().split_once(':')?;
    if !label.trim().eq_ignore_ascii_case("role") {
        return None;
    }
    let value = value.trim();
    Some(Role::parse(value).ok_or_else(|| value.to_string()))
}

fn strip_frontmatter(text: &str) -> &str {
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return text;
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == "---" {
            return &rest[offset..];
        }
    }
    text
}

pub fn parse_transcript(text: &str) -> Result<Vec<ChatMessage>> {
    let body = strip_frontmatter(text);
    let mut messages: Vec<ChatMessage> = Vec::new();
    let mut current: Option<(Role, Vec<&str>)> = None;

    for line in body.lines() {
        match role_heading(line) {
            Some(Ok(role)) => {
                if let Some((role, lines)) = current.take() {
                    messages.push(finish_message(role, &lines));
                }
                current = Some((role, Vec::new()));
            }
            Some(Err(unknown)) => {
                anyhow::bail!("Unknown chat role '{}'", unknown);
            }
            None => {
                if let Some((_, lines)) = current.as_mut() {
                    lines.push(line);
                }
            }
        }
    }

    if let Some((role, lines)) = current.take() {
        messages.push(finish_message(role, &lines));
    }

    Ok(messages)
}

fn finish_message(role: Role, lines: &[&str]) -> ChatMessage {
    ChatMessage {
        role,
        content: lines.join("\n").trim().to_string(),
    }
}

/// A transcript awaits a reply when its last message comes from the user.
pub fn is_pending(messages: &[ChatMessage]) -> bool {
    messages
        .last()
        .map(|message| message.role == Role::User)
        .unwrap_or(false)
}

/// Append an assistant reply and an empty user turn to a transcript.
pub fn append_reply(markdown: &str, reply: &str) -> String {
    let mut out = markdown.trim_end().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("# role: assistant\n");
    out.push_str(reply.trim());
    out.push_str("\n\n# role: user\n");
    out
}
