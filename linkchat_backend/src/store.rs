//! File access for link resolution.
//!
//! The resolver only ever talks to a [`FileStore`]. [`VaultStore`] backs it with
//! a directory on disk; [`MemoryStore`] keeps everything in a map and is what
//! embedders and tests use when there is no vault.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

use crate::outline;

/// A resolved file, identified by its vault-relative path (`/`-separated).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub path: String,
}

impl FileHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Lowercased extension, empty when there is none.
    pub fn extension(&self) -> String {
        Path::new(&self.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    fn parent_dir(&self) -> &str {
        self.path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Resolve `target` as written in a link inside `source_path`. An empty
    /// target refers to the source file itself.
    async fn resolve_link(
        &self,
        target: &str,
        subpath: Option<&str>,
        source_path: &str,
    ) -> Option<FileHandle>;

    async fn read_text(&self, file: &FileHandle) -> Result<String>;

    async fn read_binary(&self, file: &FileHandle) -> Result<Vec<u8>>;

    async fn write_text(&self, file: &FileHandle, text: &str) -> Result<()>;

    /// Byte range of `subpath` within the file's text.
    async fn resolve_section(
        &self,
        file: &FileHandle,
        subpath: &str,
    ) -> Result<Option<(usize, usize)>> {
        let text = self.read_text(file).await?;
        Ok(outline::find_section(&text, subpath))
    }
}

/// Candidate vault-relative paths for a link target, in lookup order.
fn link_candidates(target: &str, source_path: &str) -> Vec<String> {
    let target = target.trim().trim_start_matches("./");
    let mut names = vec![target.to_string()];
    if !target.to_ascii_lowercase().ends_with(".md") {
        names.push(format!("{}.md", target));
    }

    let source_dir = FileHandle::new(source_path).parent_dir().to_string();
    let mut candidates = Vec::new();
    for name in &names {
        if let Some(rooted) = name.strip_prefix('/') {
            candidates.extend(normalize_relative(rooted));
            continue;
        }
        if !source_dir.is_empty() {
            candidates.extend(normalize_relative(&format!("{}/{}", source_dir, name)));
        }
        candidates.extend(normalize_relative(name));
    }
    candidates.dedup();
    candidates
}

/// Collapse `.`/`..` segments; `None` if the path escapes the vault.
fn normalize_relative(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Whether `path` ends with all components of `suffix`.
fn path_ends_with(path: &str, suffix: &str) -> bool {
    let suffix = suffix.trim_start_matches('/');
    path == suffix || path.ends_with(&format!("/{}", suffix))
}

// ============================================================================
// VaultStore
// ============================================================================

/// A directory of markdown notes and attachments.
pub struct VaultStore {
    root: PathBuf,
}

impl VaultStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())
            .with_context(|| format!("Cannot open vault '{}'", root.as_ref().display()))?;
        if !root.is_dir() {
            anyhow::bail!("Vault root '{}' is not a directory", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Vault-relative handle for a path given on the command line.
    pub fn handle_for(&self, path: impl AsRef<Path>) -> Result<FileHandle> {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let absolute = std::fs::canonicalize(&absolute)
            .with_context(|| format!("Cannot access '{}'", path.display()))?;
        let relative = absolute.strip_prefix(&self.root).with_context(|| {
            format!(
                "'{}' is outside the vault '{}'",
                absolute.display(),
                self.root.display()
            )
        })?;
        Ok(FileHandle::new(to_slash_path(relative)))
    }

    fn absolute(&self, file: &FileHandle) -> PathBuf {
        self.root.join(&file.path)
    }

    async fn is_file(&self, relative: &str) -> bool {
        tokio::fs::metadata(self.root.join(relative))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// All vault files, sorted, skipping hidden directories.
    async fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to list '{}'", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        files.push(to_slash_path(relative));
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

fn to_slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl FileStore for VaultStore {
    async fn resolve_link(
        &self,
        target: &str,
        _subpath: Option<&str>,
        source_path: &str,
    ) -> Option<FileHandle> {
        if target.trim().is_empty() {
            return Some(FileHandle::new(source_path));
        }

        let candidates = link_candidates(target, source_path);
        for candidate in &candidates {
            if self.is_file(candidate).await {
                return Some(FileHandle::new(candidate.clone()));
            }
        }

        let files = match self.list_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::debug!("Vault scan failed while resolving '{}': {:#}", target, e);
                return None;
            }
        };

        let trimmed = target.trim().trim_start_matches("./");
        let suffixes = [trimmed.to_string(), format!("{}.md", trimmed)];
        files
            .into_iter()
            .find(|file| suffixes.iter().any(|suffix| path_ends_with(file, suffix)))
            .map(FileHandle::new)
    }

    async fn read_text(&self, file: &FileHandle) -> Result<String> {
        tokio::fs::read_to_string(self.absolute(file))
            .await
            .with_context(|| format!("Failed to read '{}'", file.path))
    }

    async fn read_binary(&self, file: &FileHandle) -> Result<Vec<u8>> {
        tokio::fs::read(self.absolute(file))
            .await
            .with_context(|| format!("Failed to read '{}'", file.path))
    }

    async fn write_text(&self, file: &FileHandle, text: &str) -> Result<()> {
        tokio::fs::write(self.absolute(file), text)
            .await
            .with_context(|| format!("Failed to write '{}'", file.path))
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// An in-memory vault keyed by vault-relative path.
#[derive(Default)]
pub struct MemoryStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, P, C>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<Vec<u8>>,
    {
        Self {
            files: RwLock::new(
                files
                    .into_iter()
                    .map(|(path, content)| (path.into(), content.into()))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.write().await.insert(path.into(), content.into());
    }

    pub async fn text(&self, path: &str) -> Option<String> {
        self.files
            .read()
            .await
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    async fn get(&self, file: &FileHandle) -> Result<Vec<u8>> {
        self.files
            .read()
            .await
            .get(&file.path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such file '{}'", file.path))
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn resolve_link(
        &self,
        target: &str,
        _subpath: Option<&str>,
        source_path: &str,
    ) -> Option<FileHandle> {
        if target.trim().is_empty() {
            return Some(FileHandle::new(source_path));
        }

        let files = self.files.read().await;
        if let Some(found) = link_candidates(target, source_path)
            .into_iter()
            .find(|candidate| files.contains_key(candidate))
        {
            return Some(FileHandle::new(found));
        }

        let trimmed = target.trim().trim_start_matches("./");
        let suffixes = [trimmed.to_string(), format!("{}.md", trimmed)];
        files
            .keys()
            .find(|path| suffixes.iter().any(|suffix| path_ends_with(path, suffix)))
            .map(|path| FileHandle::new(path.clone()))
    }

    async fn read_text(&self, file: &FileHandle) -> Result<String> {
        let bytes = self.get(file).await?;
        String::from_utf8(bytes).with_context(|| format!("'{}' is not valid UTF-8", file.path))
    }

    async fn read_binary(&self, file: &FileHandle) -> Result<Vec<u8>> {
        self.get(file).await
    }

    async fn write_text(&self, file: &FileHandle, text: &str) -> Result<()> {
        self.insert(file.path.clone(), text.as_bytes().to_vec()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_prefer_source_folder() {
        assert_eq!(
            link_candidates("Child", "notes/Root.md"),
            vec!["notes/Child", "Child", "notes/Child.md", "Child.md"]
        );
        assert_eq!(link_candidates("pic.png", "Root.md"), vec!["pic.png", "pic.png.md"]);
    }

    #[test]
    fn candidates_never_escape_vault() {
        assert!(link_candidates("../../etc/passwd", "Root.md").is_empty());
        assert_eq!(
            link_candidates("../Other", "a/b/Root.md"),
            vec!["a/Other", "a/Other.md"]
        );
    }

    #[test]
    fn handle_helpers() {
        let handle = FileHandle::new("media/Diagram.PNG");
        assert_eq!(handle.extension(), "png");
        assert_eq!(handle.basename(), "Diagram.PNG");
        assert_eq!(handle.parent_dir(), "media");
        assert_eq!(FileHandle::new("Root.md").parent_dir(), "");
    }

    #[tokio::test]
    async fn vault_resolves_relative_then_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("notes/deep")).unwrap();
        std::fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        std::fs::write(dir.path().join("notes/Root.md"), "root").unwrap();
        std::fs::write(dir.path().join("notes/Sibling.md"), "sibling").unwrap();
        std::fs::write(dir.path().join("notes/deep/Far.md"), "far").unwrap();
        std::fs::write(dir.path().join(".obsidian/Far.md"), "hidden").unwrap();

        let store = VaultStore::open(dir.path()).unwrap();

        let sibling = store.resolve_link("Sibling", None, "notes/Root.md").await.unwrap();
        assert_eq!(sibling.path, "notes/Sibling.md");

        let far = store.resolve_link("Far", None, "notes/Root.md").await.unwrap();
        assert_eq!(far.path, "notes/deep/Far.md");
        assert_eq!(store.read_text(&far).await.unwrap(), "far");

        assert!(store.resolve_link("Missing", None, "notes/Root.md").await.is_none());

        let itself = store.resolve_link("", Some("Intro"), "notes/Root.md").await.unwrap();
        assert_eq!(itself.path, "notes/Root.md");
    }

    #[tokio::test]
    async fn vault_sections_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Doc.md"), "# A\none\n# B\ntwo\n").unwrap();

        let store = VaultStore::open(dir.path()).unwrap();
        let doc = store.resolve_link("Doc", None, "Root.md").await.unwrap();
        assert_eq!(store.resolve_section(&doc, "B").await.unwrap(), Some((8, 16)));

        store.write_text(&doc, "replaced").await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("Doc.md")).unwrap(), "replaced");
    }

    #[tokio::test]
    async fn vault_handle_for_rejects_outside_paths() {
        let vault = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(vault.path().join("In.md"), "").unwrap();
        std::fs::write(outside.path().join("Out.md"), "").unwrap();

        let store = VaultStore::open(vault.path()).unwrap();
        assert_eq!(store.handle_for(vault.path().join("In.md")).unwrap().path, "In.md");
        assert!(store.handle_for(outside.path().join("Out.md")).is_err());
    }

    #[tokio::test]
    async fn memory_store_resolution() {
        let store = MemoryStore::with_files([
            ("Root.md", "root"),
            ("people/Ada.md", "ada"),
            ("img/cat.png", "png"),
        ]);

        assert_eq!(
            store.resolve_link("Ada", None, "Root.md").await.unwrap().path,
            "people/Ada.md"
        );
        assert_eq!(
            store.resolve_link("cat.png", None, "Root.md").await.unwrap().path,
            "img/cat.png"
        );
        assert!(store.resolve_link("Nobody", None, "Root.md").await.is_none());

        let root = FileHandle::new("Root.md");
        store.write_text(&root, "updated").await.unwrap();
        assert_eq!(store.text("Root.md").await.as_deref(), Some("updated"));
    }
}
