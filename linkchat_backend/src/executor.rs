//! Executing linked chats that still await a reply.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;

use crate::llm_client::{ContentPart, ImageUrl, InputAudio, LlmCompletion, Message, MessageContent};
use crate::resolution::{ContentResolver, ResolutionContext, ResolvedContent, ResolvedFragment};
use crate::store::FileHandle;
use crate::transcript::{self, ChatMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub newest_reply: String,
    /// The file's transcript with the reply and a fresh user turn appended.
    pub full_transcript_markdown: String,
}

#[async_trait]
pub trait ChatExecutor: Send + Sync {
    /// Run the pending chat in `file`. `ctx` names the node for `file`, so
    /// links inside the chat resolve as its children.
    async fn execute_pending_chat(
        &self,
        resolver: &ContentResolver,
        file: &FileHandle,
        ctx: &ResolutionContext,
    ) -> Result<ChatReply>;
}

/// Sends pending chats to a language model.
pub struct LlmChatExecutor {
    llm: Arc<dyn LlmCompletion>,
}

impl LlmChatExecutor {
    pub fn new(llm: Arc<dyn LlmCompletion>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ChatExecutor for LlmChatExecutor {
    async fn execute_pending_chat(
        &self,
        resolver: &ContentResolver,
        file: &FileHandle,
        ctx: &ResolutionContext,
    ) -> Result<ChatReply> {
        let markdown = resolver.store().read_text(file).await?;
        let messages = transcript::parse_transcript(&markdown)
            .with_context(|| format!("Cannot parse chat '{}'", file.path))?;
        if !transcript::is_pending(&messages) {
            anyhow::bail!("Chat '{}' is not awaiting a reply", file.path);
        }

        let outbound = resolve_messages(resolver, &messages, file, ctx).await;
        if outbound.is_empty() {
            anyhow::bail!("Chat '{}' has nothing to send", file.path);
        }

        let reply = self.llm.complete(&outbound).await?;
        let reply = reply.trim().to_string();
        tracing::debug!("Chat '{}' replied with {} chars", file.path, reply.len());

        Ok(ChatReply {
            full_transcript_markdown: transcript::append_reply(&markdown, &reply),
            newest_reply: reply,
        })
    }
}

/// Resolve every message of a transcript concurrently, keeping their order.
/// Messages that resolve to nothing are dropped.
pub async fn resolve_messages(
    resolver: &ContentResolver,
    messages: &[ChatMessage],
    source: &FileHandle,
    ctx: &ResolutionContext,
) -> Vec<Message> {
    let resolved = join_all(messages.iter().map(|message| async move {
        let content = resolver
            .resolve(&message.content, source, message.role, ctx)
            .await;
        Message {
            role: message.role,
            content: to_message_content(content),
        }
    }))
    .await;

    resolved
        .into_iter()
        .filter(|message| match &message.content {
            MessageContent::Text(text) => !text.trim().is_empty(),
            MessageContent::Parts(parts) => !parts.is_empty(),
        })
        .collect()
}

pub fn to_message_content(content: ResolvedContent) -> MessageContent {
    match content {
        ResolvedContent::Text(text) => MessageContent::Text(text),
        ResolvedContent::Fragments(fragments) => MessageContent::Parts(
            fragments
                .into_iter()
                .map(|fragment| match fragment {
                    ResolvedFragment::Text { text } => ContentPart::Text { text },
                    ResolvedFragment::Image { url } => ContentPart::ImageUrl {
                        image_url: ImageUrl { url },
                    },
                    ResolvedFragment::Audio { data, format } => ContentPart::InputAudio {
                        input_audio: InputAudio { data, format },
                    },
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::store::MemoryStore;
    use crate::transcript::Role;
    use std::sync::Mutex;

    /// Records what it was sent and answers with a fixed reply.
    struct EchoModel {
        reply: String,
        sent: Mutex<Vec<Vec<Message>>>,
    }

    impl EchoModel {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmCompletion for EchoModel {
        async fn complete(&self, messages: &[Message]) -> Result<String> {
            self.sent.lock().unwrap().push(messages.to_vec());
            Ok(self.reply.clone())
        }
    }

    fn setup(store: MemoryStore, model: Arc<EchoModel>) -> ContentResolver {
        let executor = Arc::new(LlmChatExecutor::new(model));
        ContentResolver::new(Arc::new(store), executor, ResolutionConfig::default())
    }

    #[tokio::test]
    async fn nested_chat_messages_are_resolved_before_sending() {
        let store = MemoryStore::with_files([
            (
                "Research.md",
                "# role: system\nBe terse.\n# role: user\nSummarise [[Paper]]",
            ),
            ("Paper.md", "Cats sleep a lot."),
        ]);
        let model = Arc::new(EchoModel::new("  They nap.  "));
        let resolver = setup(store, model.clone());

        let root = FileHandle::new("Root.md");
        let ctx = resolver.create_context(&root);
        let child = ctx.child("Research.md", "Research.md");
        let reply = LlmChatExecutor::new(model.clone())
            .execute_pending_chat(&resolver, &FileHandle::new("Research.md"), &child)
            .await
            .unwrap();

        assert_eq!(reply.newest_reply, "They nap.");
        assert!(reply
            .full_transcript_markdown
            .ends_with("# role: assistant\nThey nap.\n\n# role: user\n"));

        let sent = model.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            vec![
                Message::text(Role::System, "Be terse."),
                Message::text(Role::User, "Summarise Cats sleep a lot."),
            ]
        );
    }

    #[tokio::test]
    async fn answered_chat_is_refused() {
        let store = MemoryStore::with_files([("Done.md", "# role: user\nq\n# role: assistant\na")]);
        let model = Arc::new(EchoModel::new("x"));
        let resolver = setup(store, model.clone());
        let file = FileHandle::new("Done.md");
        let ctx = resolver.create_context(&file);

        let err = LlmChatExecutor::new(model)
            .execute_pending_chat(&resolver, &file, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not awaiting a reply"));
    }

    #[tokio::test]
    async fn empty_turns_are_not_sent() {
        let store = MemoryStore::with_files([(
            "Chat.md",
            "# role: user\nhello\n# role: assistant\nhi\n# role: user\n",
        )]);
        let model = Arc::new(EchoModel::new("again?"));
        let resolver = setup(store, model.clone());
        let file = FileHandle::new("Chat.md");
        let ctx = resolver.create_context(&file);

        LlmChatExecutor::new(model.clone())
            .execute_pending_chat(&resolver, &file, &ctx)
            .await
            .unwrap();
        assert_eq!(model.sent.lock().unwrap()[0].len(), 2);
    }

    #[test]
    fn fragments_map_to_wire_parts() {
        let content = to_message_content(ResolvedContent::Fragments(vec![
            ResolvedFragment::text("look"),
            ResolvedFragment::Image {
                url: "data:image/png;base64,AA==".to_string(),
            },
            ResolvedFragment::Audio {
                data: "AA==".to_string(),
                format: "mp3".to_string(),
            },
        ]));
        let MessageContent::Parts(parts) = content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[1], ContentPart::ImageUrl { image_url } if image_url.url.ends_with("AA==")));
        assert!(matches!(&parts[2], ContentPart::InputAudio { input_audio } if input_audio.format == "mp3"));
    }
}
