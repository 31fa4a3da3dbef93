//! The user-facing chat completion for one root file.

use anyhow::{Context, Result};
use flume::Sender;
use std::sync::Arc;

use crate::executor::resolve_messages;
use crate::llm_client::{LlmCompletion, Message};
use crate::resolution::{ContentResolver, ResolutionContext, ResolutionEvent};
use crate::store::FileHandle;
use crate::transcript::{self, ChatMessage, Role};

pub struct ChatSession {
    resolver: ContentResolver,
    llm: Arc<dyn LlmCompletion>,
    events: Option<Sender<ResolutionEvent>>,
}

/// A root file read as a transcript.
struct RootChat {
    /// Markdown the reply gets appended to.
    markdown: String,
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(resolver: ContentResolver, llm: Arc<dyn LlmCompletion>) -> Self {
        Self {
            resolver,
            llm,
            events: None,
        }
    }

    /// Report resolution progress of every run on `events`.
    pub fn with_events(mut self, events: Sender<ResolutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn resolver(&self) -> &ContentResolver {
        &self.resolver
    }

    fn context(&self, file: &FileHandle) -> ResolutionContext {
        match &self.events {
            Some(events) => ResolutionContext::root_with_events(file.path.clone(), events.clone()),
            None => self.resolver.create_context(file),
        }
    }

    async fn load(&self, file: &FileHandle) -> Result<RootChat> {
        let markdown = self.resolver.store().read_text(file).await?;
        let messages = transcript::parse_transcript(&markdown)
            .with_context(|| format!("Cannot parse chat '{}'", file.path))?;
        if !messages.is_empty() {
            return Ok(RootChat { markdown, messages });
        }

        // A note without role headings is one user message.
        let body = markdown.trim();
        if body.is_empty() {
            anyhow::bail!("'{}' is empty", file.path);
        }
        Ok(RootChat {
            markdown: format!("# role: user\n{}", body),
            messages: vec![ChatMessage {
                role: Role::User,
                content: body.to_string(),
            }],
        })
    }

    /// Resolve every message of `file` without contacting the model.
    pub async fn preview(&self, file: &FileHandle) -> Result<Vec<Message>> {
        let chat = self.load(file).await?;
        let ctx = self.context(file);
        Ok(resolve_messages(&self.resolver, &chat.messages, file, &ctx).await)
    }

    /// Resolve `file`, send it to the model and append the reply to it.
    pub async fn complete(&self, file: &FileHandle) -> Result<String> {
        match self.run(file).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                tracing::error!("Chat completion for '{}' failed: {:#}", file.path, e);
                Err(e)
            }
        }
    }

    async fn run(&self, file: &FileHandle) -> Result<String> {
        let chat = self.load(file).await?;
        if !transcript::is_pending(&chat.messages) {
            anyhow::bail!("'{}' already ends with a reply", file.path);
        }

        let ctx = self.context(file);
        let outbound = resolve_messages(&self.resolver, &chat.messages, file, &ctx).await;
        tracing::info!(
            "Sending '{}' ({} message(s), {} resolution node(s))",
            file.path,
            outbound.len(),
            ctx.nodes().len()
        );

        let reply = self
            .llm
            .complete(&outbound)
            .await
            .context("Model request failed")?;
        let reply = reply.trim().to_string();

        self.resolver
            .store()
            .write_text(file, &transcript::append_reply(&chat.markdown, &reply))
            .await?;
        tracing::info!("Appended reply to '{}'", file.path);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::executor::LlmChatExecutor;
    use crate::llm_client::MessageContent;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers each request with the next canned reply.
    struct QueueModel {
        replies: Mutex<Vec<String>>,
        sent: Mutex<Vec<Vec<Message>>>,
    }

    impl QueueModel {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmCompletion for QueueModel {
        async fn complete(&self, messages: &[Message]) -> Result<String> {
            self.sent.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("model exhausted"))
        }
    }

    fn session(store: Arc<MemoryStore>, model: Arc<QueueModel>) -> ChatSession {
        let executor = Arc::new(LlmChatExecutor::new(model.clone()));
        let resolver = ContentResolver::new(store, executor, ResolutionConfig::default());
        ChatSession::new(resolver, model)
    }

    #[tokio::test]
    async fn complete_runs_nested_chats_first() {
        let store = Arc::new(MemoryStore::with_files([
            ("Root.md", "# role: user\n[[Child.md]]"),
            ("Child.md", "# role: user\nHello"),
        ]));
        let model = QueueModel::new(&["Hi there", "Nice to meet you"]);
        let session = session(store.clone(), model.clone());

        let reply = session.complete(&FileHandle::new("Root.md")).await.unwrap();
        assert_eq!(reply, "Nice to meet you");

        let sent = model.sent.lock().unwrap();
        assert_eq!(sent[0], vec![Message::text(Role::User, "Hello")]);
        assert_eq!(sent[1], vec![Message::text(Role::User, "Hi there")]);

        assert_eq!(
            store.text("Root.md").await.unwrap(),
            "# role: user\n[[Child.md]]\n\n# role: assistant\nNice to meet you\n\n# role: user\n"
        );
        assert_eq!(store.text("Child.md").await.unwrap(), "# role: user\nHello");
    }

    #[tokio::test]
    async fn headingless_note_is_one_user_message() {
        let store = Arc::new(MemoryStore::with_files([("Note.md", "What is 2+2?\n")]));
        let model = QueueModel::new(&["4"]);
        let session = session(store.clone(), model);

        session.complete(&FileHandle::new("Note.md")).await.unwrap();
        assert_eq!(
            store.text("Note.md").await.unwrap(),
            "# role: user\nWhat is 2+2?\n\n# role: assistant\n4\n\n# role: user\n"
        );
    }

    #[tokio::test]
    async fn answered_root_is_rejected() {
        let store = Arc::new(MemoryStore::with_files([(
            "Root.md",
            "# role: user\nq\n# role: assistant\na",
        )]));
        let model = QueueModel::new(&[]);
        let session = session(store, model.clone());

        assert!(session.complete(&FileHandle::new("Root.md")).await.is_err());
        assert!(model.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_leaves_root_untouched() {
        let store = Arc::new(MemoryStore::with_files([("Root.md", "# role: user\nhi")]));
        let model = QueueModel::new(&[]);
        let session = session(store.clone(), model);

        let err = session.complete(&FileHandle::new("Root.md")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("model exhausted"));
        assert_eq!(store.text("Root.md").await.unwrap(), "# role: user\nhi");
    }

    #[tokio::test]
    async fn preview_reports_events() {
        let store = Arc::new(MemoryStore::with_files([
            ("Root.md", "# role: system\nsys\n# role: user\nsee [[Note]]"),
            ("Note.md", "details"),
        ]));
        let (tx, rx) = flume::unbounded();
        let session = session(store, QueueModel::new(&[])).with_events(tx);

        let messages = session.preview(&FileHandle::new("Root.md")).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[1].content,
            MessageContent::Text("see details".to_string())
        );
        assert!(rx.try_iter().count() >= 2);
    }
}
