use anyhow::{Context, Result};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use std::sync::Arc;

use super::tree::{CacheClaim, ResolutionResult};
use super::{
    circular_marker, error_marker, ResolutionContext, ResolutionEventKind, ResolvedContent,
    ResolvedFragment,
};
use crate::classify::{self, Category, Classified};
use crate::config::ResolutionConfig;
use crate::executor::ChatExecutor;
use crate::links::{self, LinkOccurrence};
use crate::media::{self, AudioDecoder, FfmpegAudioDecoder};
use crate::store::{FileHandle, FileStore};
use crate::transcript::Role;

/// Link targets whose resolution produces text.
#[derive(Clone)]
enum Textual {
    Text(String),
    Section(String),
    PendingChat(String),
}

impl Textual {
    fn raw(&self) -> &str {
        match self {
            Textual::Text(content) | Textual::Section(content) | Textual::PendingChat(content) => {
                content
            }
        }
    }
}

/// Resolves the links in chat messages. Cheap to clone; clones share the
/// store, executor and decoder.
#[derive(Clone)]
pub struct ContentResolver {
    store: Arc<dyn FileStore>,
    executor: Arc<dyn ChatExecutor>,
    audio: Arc<dyn AudioDecoder>,
    config: ResolutionConfig,
}

impl ContentResolver {
    pub fn new(
        store: Arc<dyn FileStore>,
        executor: Arc<dyn ChatExecutor>,
        config: ResolutionConfig,
    ) -> Self {
        Self {
            store,
            executor,
            audio: Arc::new(FfmpegAudioDecoder::new()),
            config,
        }
    }

    pub fn with_audio_decoder(mut self, decoder: Arc<dyn AudioDecoder>) -> Self {
        self.audio = decoder;
        self
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn FileStore {
        self.store.as_ref()
    }

    /// Start a new top-level resolution rooted at `root`.
    pub fn create_context(&self, root: &FileHandle) -> ResolutionContext {
        ResolutionContext::root(root.path.clone())
    }

    /// Resolve one outbound message. Without a context, a fresh top-level
    /// resolution rooted at `source` is started.
    pub async fn resolve_message_content(
        &self,
        text: &str,
        source: &FileHandle,
        role: Role,
        ctx: Option<&ResolutionContext>,
    ) -> ResolvedContent {
        match ctx {
            Some(ctx) => self.resolve(text, source, role, ctx).await,
            None => {
                let ctx = self.create_context(source);
                self.resolve(text, source, role, &ctx).await
            }
        }
    }

    /// Resolve `text` found in `source` at the position `ctx` names.
    pub fn resolve<'a>(
        &'a self,
        text: &'a str,
        source: &'a FileHandle,
        role: Role,
        ctx: &'a ResolutionContext,
    ) -> BoxFuture<'a, ResolvedContent> {
        async move {
            let occurrences = links::scan(text, self.config.link_syntax);
            if occurrences.is_empty() {
                return ResolvedContent::Text(text.to_string());
            }

            if ctx.depth() >= self.config.effective_max_depth() {
                tracing::debug!(
                    "Depth limit reached in '{}'; leaving {} link(s) unresolved",
                    source.path,
                    occurrences.len()
                );
                ctx.mark_branch_dependent(None);
            ctx.emit(ResolutionEventKind::DepthLimited {
                    node: ctx.node_id(),
                    path: source.path.clone(),
                });
                return ResolvedContent::Text(text.to_string());
            }

            ctx.note_links();
            let prose = has_prose(text, &occurrences);
            let media_allowed = role == Role::User && !prose;

            // All links start together; results come back in link order.
            let fragments = join_all(occurrences.iter().map(|occurrence| {
                self.resolve_occurrence(occurrence, source, role, media_allowed, ctx)
            }))
            .await;

            merge(text, &occurrences, fragments, prose)
        }
        .boxed()
    }

    async fn resolve_occurrence(
        &self,
        occurrence: &LinkOccurrence,
        source: &FileHandle,
        role: Role,
        media_allowed: bool,
        ctx: &ResolutionContext,
    ) -> ResolvedFragment {
        let raw = || ResolvedFragment::text(occurrence.raw.clone());
        let subpath = occurrence.subpath.as_deref();

        let Some(file) = self
            .store
            .resolve_link(&occurrence.target, subpath, &source.path)
            .await
        else {
            tracing::debug!("Unresolved link {} in '{}'", occurrence.raw, source.path);
            return raw();
        };

        if ctx.is_ancestor(&file.path) {
            tracing::warn!(
                "Circular link to '{}' from '{}' (chain: {:?})",
                file.path,
                source.path,
                ctx.ancestors()
            );
            ctx.mark_branch_dependent(Some(&file.path));
            ctx.emit(ResolutionEventKind::CycleDetected {
                node: ctx.node_id(),
                path: file.path.clone(),
            });
            return ResolvedFragment::text(circular_marker(&file.path));
        }

        let category = classify::category_for(&file, subpath, role);
        if matches!(category, Category::Image | Category::Audio) && !media_allowed {
            return raw();
        }

        let classified = match classify::classify(self.store.as_ref(), &file, subpath, role).await
        {
            Ok(classified) => classified,
            Err(e) => return self.failed(ctx, &file, &e),
        };

        let textual = match classified {
            Classified::Reference | Classified::MissingSection => return raw(),
            Classified::Image { extension } => {
                return match self.encode_image(&file, &extension).await {
                    Ok(fragment) => fragment,
                    Err(e) => self.failed(ctx, &file, &e),
                };
            }
            Classified::Audio { extension } => {
                return match self.encode_audio(&file, &extension).await {
                    Ok(fragment) => fragment,
                    Err(e) => self.failed(ctx, &file, &e),
                };
            }
            Classified::Text { content } => Textual::Text(content),
            Classified::Section { excerpt } => Textual::Section(excerpt),
            Classified::PendingChat { content } => Textual::PendingChat(content),
        };

        if !self.config.enabled {
            return ResolvedFragment::text(textual.raw());
        }

        let key = cache_key(&file, subpath, &textual, role);
        self.resolve_textual(file, key, textual, role, ctx).await
    }

    async fn resolve_textual(
        &self,
        file: FileHandle,
        key: String,
        textual: Textual,
        role: Role,
        ctx: &ResolutionContext,
    ) -> ResolvedFragment {
        let child = ctx.child(file.path.clone(), key.clone());
        // A chat reply is the same wherever the chat is linked from.
        let always_shared = matches!(textual, Textual::PendingChat(_));
        let work = || self.textual_work(file.clone(), textual.clone(), role, child.clone());

        let result = if self.config.enable_caching {
            let make = &work;
            let claim = ctx.claim(&key, move |eviction| {
                let work = make();
                async move {
                    let result = work.await;
                    let keep = match &result {
                        Ok(resolved) => always_shared || !resolved.branch_dependent,
                        Err(_) => false,
                    };
                    if !keep {
                        eviction.evict();
                    }
                    result
                }
                .boxed()
            });

            match claim {
                CacheClaim::Fresh(future) => {
                    let result = future.await;
                    ctx.release(&key);
                    result
                }
                CacheClaim::Joined(future) => {
                    let result = future.await;
                    ctx.release(&key);
                    match result {
                        Ok(resolved)
                            if !always_shared
                                && !ctx.can_reuse(&resolved, self.config.effective_max_depth()) =>
                        {
                            tracing::debug!(
                                "Shared result for '{}' does not fit here; resolving again",
                                key
                            );
                            work().await
                        }
                        result => {
                            tracing::debug!("Reusing resolution of '{}'", key);
                            child.emit(ResolutionEventKind::CacheHit {
                                node: child.node_id(),
                                key: key.clone(),
                            });
                            result
                        }
                    }
                }
                CacheClaim::Cycle => {
                    tracing::debug!(
                        "'{}' is waiting on '{}'; resolving it separately",
                        key,
                        ctx.path()
                    );
                    work().await
                }
            }
        } else {
            work().await
        };

        match result {
            Ok(resolved) => {
                ctx.absorb(&resolved);
                ResolvedFragment::text(resolved.text)
            }
            Err(e) => self.failed(&child, &file, &e),
        }
    }

    /// The owned computation behind one textual link, suitable for caching.
    fn textual_work(
        &self,
        file: FileHandle,
        textual: Textual,
        role: Role,
        child: ResolutionContext,
    ) -> BoxFuture<'static, ResolutionResult> {
        let resolver = self.clone();
        async move {
            let text = match textual {
                Textual::Section(excerpt) => {
                    let resolved = resolver.resolve(&excerpt, &file, role, &child).await;
                    match resolved {
                        ResolvedContent::Text(text) => text,
                        // Media cannot be spliced into the parent's text.
                        ResolvedContent::Fragments(_) => excerpt,
                    }
                }
                Textual::Text(content) => {
                    let resolved = resolver.resolve(&content, &file, role, &child).await;
                    match resolved {
                        ResolvedContent::Text(text) => text,
                        ResolvedContent::Fragments(_) => String::new(),
                    }
                }
                Textual::PendingChat(_) => match resolver.execute_chat(&file, &child).await {
                    Ok(reply) => reply,
                    Err(e) => return Err(Arc::new(e)),
                },
            };
            Ok(child.finish(text))
        }
        .boxed()
    }

    async fn execute_chat(&self, file: &FileHandle, child: &ResolutionContext) -> Result<String> {
        tracing::info!("Executing linked chat '{}' (depth {})", file.path, child.depth());
        let reply = self
            .executor
            .execute_pending_chat(self, file, child)
            .await
            .with_context(|| format!("Chat '{}' failed", file.path))?;
        child.emit(ResolutionEventKind::ChatExecuted {
            node: child.node_id(),
            path: file.path.clone(),
        });

        if self.config.write_intermediate_results {
            if file.path == child.root_path() {
                tracing::debug!("Not persisting reply into root file '{}'", file.path);
            } else {
                match self
                    .store
                    .write_text(file, &reply.full_transcript_markdown)
                    .await
                {
                    Ok(()) => {
                        tracing::info!("Wrote intermediate reply to '{}'", file.path);
                        child.emit(ResolutionEventKind::IntermediateWritten {
                            path: file.path.clone(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to persist reply to '{}': {:#}", file.path, e);
                    }
                }
            }
        }

        Ok(reply.newest_reply)
    }

    async fn encode_image(&self, file: &FileHandle, extension: &str) -> Result<ResolvedFragment> {
        let bytes = self.store.read_binary(file).await?;
        Ok(ResolvedFragment::Image {
            url: media::encode_data_url(&bytes, media::mime_type_for_extension(extension)),
        })
    }

    async fn encode_audio(&self, file: &FileHandle, extension: &str) -> Result<ResolvedFragment> {
        let bytes = self.store.read_binary(file).await?;
        let (bytes, format) = if extension == "m4a" {
            let wav = media::m4a_to_wav(self.audio.as_ref(), &bytes)
                .await
                .with_context(|| format!("Cannot transcode '{}'", file.path))?;
            (wav, "wav".to_string())
        } else {
            (bytes, extension.to_string())
        };
        Ok(ResolvedFragment::Audio {
            data: media::encode_base64_chunked(&bytes),
            format,
        })
    }

    fn failed(
        &self,
        ctx: &ResolutionContext,
        file: &FileHandle,
        error: &anyhow::Error,
    ) -> ResolvedFragment {
        tracing::warn!("Failed to resolve '{}': {:#}", file.path, error);
        ctx.emit(ResolutionEventKind::NodeFailed {
            node: ctx.node_id(),
            path: file.path.clone(),
            error: format!("{:#}", error),
        });
        ResolvedFragment::text(error_marker(error))
    }
}

/// Cache key for a textual link. Text and sections only carry nested media
/// under user messages, so the role is part of their key.
fn cache_key(file: &FileHandle, subpath: Option<&str>, textual: &Textual, role: Role) -> String {
    let base = match subpath {
        Some(subpath) => format!("{}#{}", file.path, subpath),
        None => file.path.clone(),
    };
    match textual {
        Textual::PendingChat(_) => base,
        _ if role == Role::User => format!("{}@media", base),
        _ => format!("{}@text", base),
    }
}

/// Whether anything other than whitespace surrounds the links.
fn has_prose(text: &str, occurrences: &[LinkOccurrence]) -> bool {
    let mut cursor = 0;
    for occurrence in occurrences {
        if !text[cursor..occurrence.span.start].trim().is_empty() {
            return true;
        }
        cursor = occurrence.span.end;
    }
    !text[cursor..].trim().is_empty()
}

fn merge(
    text: &str,
    occurrences: &[LinkOccurrence],
    fragments: Vec<ResolvedFragment>,
    prose: bool,
) -> ResolvedContent {
    if !prose && fragments.iter().any(|fragment| !fragment.is_text()) {
        return ResolvedContent::Fragments(coalesce(fragments));
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (occurrence, fragment) in occurrences.iter().zip(fragments) {
        out.push_str(&text[cursor..occurrence.span.start]);
        match fragment {
            ResolvedFragment::Text { text } => out.push_str(&text),
            _ => out.push_str(&occurrence.raw),
        }
        cursor = occurrence.span.end;
    }
    out.push_str(&text[cursor..]);
    ResolvedContent::Text(out)
}

/// Drop blank text fragments and join runs of text with newlines.
fn coalesce(fragments: Vec<ResolvedFragment>) -> Vec<ResolvedFragment> {
    let mut parts: Vec<ResolvedFragment> = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        match fragment {
            ResolvedFragment::Text { text } => {
                if text.trim().is_empty() {
                    continue;
                }
                if let Some(ResolvedFragment::Text { text: previous }) = parts.last_mut() {
                    previous.push('\n');
                    previous.push_str(&text);
                } else {
                    parts.push(ResolvedFragment::Text { text });
                }
            }
            media => parts.push(media),
        }
    }
    parts
}
