//! Decides what a link target is before it gets resolved.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::media::{media_kind_for_extension, MediaKind};
use crate::store::{FileHandle, FileStore};
use crate::transcript::{self, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Text,
    Section,
    Image,
    Audio,
    PendingChat,
    /// Media linked from a message role that cannot carry it; stays a link.
    Reference,
}

/// A classified link target, carrying whatever had to be read to classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Text { content: String },
    Section { excerpt: String },
    Image { extension: String },
    Audio { extension: String },
    PendingChat { content: String },
    Reference,
    /// The subpath names a heading or block the file does not have.
    MissingSection,
}

impl Classified {
    pub fn category(&self) -> Option<Category> {
        match self {
            Classified::Text { .. } => Some(Category::Text),
            Classified::Section { .. } => Some(Category::Section),
            Classified::Image { .. } => Some(Category::Image),
            Classified::Audio { .. } => Some(Category::Audio),
            Classified::PendingChat { .. } => Some(Category::PendingChat),
            Classified::Reference => Some(Category::Reference),
            Classified::MissingSection => None,
        }
    }
}

/// Category from the file name, link subpath and requesting role alone.
/// Text files may still turn out to be pending chats once read.
pub fn category_for(file: &FileHandle, subpath: Option<&str>, role: Role) -> Category {
    match media_kind_for_extension(&file.extension()) {
        Some(_) if role != Role::User => Category::Reference,
        Some(MediaKind::Image) => Category::Image,
        Some(MediaKind::Audio) => Category::Audio,
        None if subpath.is_some() => Category::Section,
        None => Category::Text,
    }
}

/// Whether `content` is a chat transcript awaiting a reply. Unparseable
/// transcripts are not pending.
pub fn is_pending_chat(content: &str) -> bool {
    transcript::parse_transcript(content)
        .map(|messages| transcript::is_pending(&messages))
        .unwrap_or(false)
}

pub async fn classify(
    store: &dyn FileStore,
    file: &FileHandle,
    subpath: Option<&str>,
    role: Role,
) -> Result<Classified> {
    let extension = file.extension();
    let classified = match category_for(file, subpath, role) {
        Category::Reference => Classified::Reference,
        Category::Image => Classified::Image { extension },
        Category::Audio => Classified::Audio { extension },
        Category::Section => {
            let subpath = subpath.unwrap_or_default();
            match store.resolve_section(file, subpath).await? {
                Some((start, end)) => {
                    let text = store.read_text(file).await?;
                    let excerpt = text
                        .get(start..end)
                        .ok_or_else(|| {
                            anyhow::anyhow!("Section '#{}' of '{}' is out of range", subpath, file.path)
                        })?
                        .to_string();
                    Classified::Section { excerpt }
                }
                None => Classified::MissingSection,
            }
        }
        Category::Text | Category::PendingChat => {
            let content = store.read_text(file).await?;
            if is_pending_chat(&content) {
                Classified::PendingChat { content }
            } else {
                Classified::Text { content }
            }
        }
    };

    tracing::debug!(
        "Classified '{}'{} as {:?}",
        file.path,
        subpath.map(|s| format!("#{}", s)).unwrap_or_default(),
        classified.category()
    );
    Ok(classified)
}
