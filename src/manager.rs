//! The store façade.
//!
//! A [`Manager`] owns one store directory: its markdown files, the index
//! database under `.index/`, the embedded git repository, an embedding
//! provider, and an optional reranker. All public mutation methods follow
//! the branch-scoped protocol:
//!
//! 1. acquire the on-disk store lock,
//! 2. check out the target branch when it differs from the current one,
//! 3. apply the filesystem mutation,
//! 4. sync the index for every touched path, but only when the target is
//!    the default branch (the index mirrors the default branch only),
//! 5. auto-commit (a clean tree is success),
//! 6. restore the original branch on every exit path.
//!
//! Reads are unlocked; ref-qualified reads go through the git adapter
//! instead of the filesystem. Index access is additionally guarded by an
//! in-process read/write latch which is never held across subprocess or
//! network calls.

use chrono::Utc;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::chunk;
use crate::config::EmbeddingConfig;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::frontmatter;
use crate::git::{BranchInfo, GitRepo, HistoryEntry, MergeStrategy};
use crate::lock::StoreLock;
use crate::migrate;
use crate::rerank::Reranker;
use crate::search::{self, SearchOptions, SearchResult};

/// Relative directory of the index database inside a store.
pub const INDEX_DB_PATH: &str = ".index/memory.db";

/// Directory whose files are pinned into agent context.
pub const SYSTEM_DIR: &str = "system";

/// Construction options for [`Manager::open`].
#[derive(Default)]
pub struct StoreOptions {
    pub embedding: EmbeddingConfig,
    pub reranker: Option<Arc<dyn Reranker>>,
}

/// Metadata for one store file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileEntry {
    pub path: String,
    pub size: i64,
    /// Absent for ref-qualified listings (refs carry no filesystem mtime).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
}

/// [`FileEntry`] plus frontmatter-derived presentation fields.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_system: bool,
}

pub struct Manager {
    root: PathBuf,
    pool: SqlitePool,
    repo: GitRepo,
    lock: StoreLock,
    embedding_cfg: EmbeddingConfig,
    provider: Box<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    latch: RwLock<()>,
}

impl Manager {
    /// Open (creating if needed) the store at `root`.
    pub async fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let repo = GitRepo::new(&root);
        repo.init()?;

        let pool = db::connect(&root.join(INDEX_DB_PATH)).await?;
        migrate::run_migrations(&pool).await?;

        let provider = embedding::create_provider(&options.embedding)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let lock = StoreLock::new(&repo.git_dir());

        Ok(Self {
            root,
            pool,
            repo,
            lock,
            embedding_cfg: options.embedding,
            provider,
            reranker: options.reranker,
            latch: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }

    /// Release the database handle.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Branch-scoped mutation protocol ============

    async fn mutate<T, F>(&self, branch: Option<&str>, message: &str, op: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<(T, Vec<String>)>,
    {
        let _guard = self.lock.acquire().await?;

        let default = self.repo.default_branch()?;
        let target = match branch {
            Some(b) if !b.is_empty() => b.to_string(),
            _ => default.clone(),
        };
        let original = self.repo.current_branch()?;
        let switched = original != target;

        if switched {
            self.repo.checkout(&target)?;
        }

        let result = self.mutate_on_branch(&target, &default, message, op).await;

        if switched {
            if let Err(e) = self.repo.checkout(&original) {
                warn!(branch = %original, error = %e, "failed to restore branch");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }

        result
    }

    async fn mutate_on_branch<T, F>(
        &self,
        target: &str,
        default: &str,
        message: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<(T, Vec<String>)>,
    {
        let (value, touched) = op(&self.root)?;

        if target == default {
            for path in &touched {
                self.sync(path).await?;
            }
        }

        match self.repo.auto_commit(message) {
            Ok(()) | Err(Error::NoChanges) => {}
            Err(e) => return Err(e),
        }

        Ok(value)
    }

    // ============ Writes ============

    /// Append `content` to `file` (today's date file when unset) on the
    /// default branch. Returns the path written.
    pub async fn write(&self, content: &str, file: Option<&str>) -> Result<String> {
        self.write_with_message_on_branch(content, file, None, None)
            .await
    }

    /// Append `content` on a given branch with an explicit commit message.
    pub async fn write_with_message_on_branch(
        &self,
        content: &str,
        file: Option<&str>,
        message: Option<&str>,
        branch: Option<&str>,
    ) -> Result<String> {
        let path = match file {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => today_filename(),
        };
        validate_rel_path(&path)?;

        let default_message = format!("memory: update {}", path);
        let message = message.filter(|m| !m.is_empty()).unwrap_or(&default_message);

        let content = content.to_string();
        let op_path = path.clone();
        self.mutate(branch, message, move |root| {
            append_to_file(root, &op_path, &content, false)?;
            Ok(((), vec![op_path]))
        })
        .await?;

        Ok(path)
    }

    /// Overwrite `path` with `content` on the default branch.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        message: Option<&str>,
    ) -> Result<()> {
        self.write_file_on_branch(path, content, message, None).await
    }

    pub async fn write_file_on_branch(
        &self,
        path: &str,
        content: &str,
        message: Option<&str>,
        branch: Option<&str>,
    ) -> Result<()> {
        validate_rel_path(path)?;

        let default_message = format!("memory: update {}", path);
        let message = message.filter(|m| !m.is_empty()).unwrap_or(&default_message);

        let content = content.to_string();
        let op_path = path.to_string();
        self.mutate(branch, message, move |root| {
            let full = root.join(&op_path);
            ensure_writable(&full, &op_path)?;
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, &content)?;
            Ok(((), vec![op_path]))
        })
        .await
    }

    /// Append to an existing file.
    pub async fn append(&self, path: &str, content: &str) -> Result<()> {
        self.append_on_branch(path, content, None).await
    }

    pub async fn append_on_branch(
        &self,
        path: &str,
        content: &str,
        branch: Option<&str>,
    ) -> Result<()> {
        validate_rel_path(path)?;

        let message = format!("memory: append {}", path);
        let content = content.to_string();
        let op_path = path.to_string();
        self.mutate(branch, &message, move |root| {
            append_to_file(root, &op_path, &content, true)?;
            Ok(((), vec![op_path]))
        })
        .await
    }

    /// Rename `from` to `to`, creating target parent directories.
    pub async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        self.move_on_branch(from, to, None).await
    }

    pub async fn move_on_branch(
        &self,
        from: &str,
        to: &str,
        branch: Option<&str>,
    ) -> Result<()> {
        validate_rel_path(from)?;
        validate_rel_path(to)?;

        let message = format!("memory: move {} -> {}", from, to);
        let op_from = from.to_string();
        let op_to = to.to_string();
        self.mutate(branch, &message, move |root| {
            let src = root.join(&op_from);
            if !src.exists() {
                return Err(Error::NotFound(op_from.clone()));
            }
            let dst = root.join(&op_to);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&src, &dst)?;
            Ok(((), vec![op_from, op_to]))
        })
        .await
    }

    /// Remove a file and its index rows.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.delete_on_branch(path, None).await
    }

    pub async fn delete_on_branch(&self, path: &str, branch: Option<&str>) -> Result<()> {
        validate_rel_path(path)?;

        let message = format!("memory: delete {}", path);
        let op_path = path.to_string();
        self.mutate(branch, &message, move |root| {
            let full = root.join(&op_path);
            if !full.exists() {
                return Err(Error::NotFound(op_path.clone()));
            }
            std::fs::remove_file(&full)?;
            Ok(((), vec![op_path]))
        })
        .await
    }

    /// Move `path` under `system/` so it is always injected into context.
    /// Returns the new path.
    pub async fn pin(&self, path: &str, branch: Option<&str>) -> Result<String> {
        validate_rel_path(path)?;
        if path.starts_with(&format!("{}/", SYSTEM_DIR)) {
            return Err(Error::AlreadyPinned(path.to_string()));
        }
        let basename = path.rsplit('/').next().unwrap_or(path);
        let target = format!("{}/{}", SYSTEM_DIR, basename);
        self.move_on_branch(path, &target, branch).await?;
        Ok(target)
    }

    /// Inverse of [`Manager::pin`]. Returns the new path.
    pub async fn unpin(&self, path: &str, branch: Option<&str>) -> Result<String> {
        validate_rel_path(path)?;
        let Some(basename) = path.strip_prefix(&format!("{}/", SYSTEM_DIR)) else {
            return Err(Error::NotPinned(path.to_string()));
        };
        self.move_on_branch(path, basename, branch).await?;
        Ok(basename.to_string())
    }

    // ============ Reads ============

    /// Read a file's body (frontmatter stripped), from disk or at a ref.
    pub async fn read(&self, path: &str, at: Option<&str>) -> Result<String> {
        validate_rel_path(path)?;
        let raw = self.read_raw(path, at)?;
        let (_, body) = frontmatter::parse(&raw);
        Ok(body.to_string())
    }

    fn read_raw(&self, path: &str, at: Option<&str>) -> Result<String> {
        match at.filter(|r| !r.is_empty()) {
            Some(refname) => self.repo.read_file_at_ref(refname, path),
            None => {
                let full = self.root.join(path);
                if !full.exists() {
                    return Err(Error::NotFound(path.to_string()));
                }
                Ok(std::fs::read_to_string(&full)?)
            }
        }
    }

    /// Line-slice access: `from` is 1-based (0 means from the beginning),
    /// `lines` of 0 means all remaining lines.
    pub async fn get(
        &self,
        path: &str,
        from: i64,
        lines: i64,
        at: Option<&str>,
    ) -> Result<String> {
        let body = self.read(path, at).await?;
        let skip = if from <= 1 { 0 } else { (from - 1) as usize };
        let take = if lines <= 0 {
            usize::MAX
        } else {
            lines as usize
        };
        let selected: Vec<&str> = body.lines().skip(skip).take(take).collect();
        Ok(selected.join("\n"))
    }

    /// Metadata for every `.md` file in the store.
    pub async fn list(&self, at: Option<&str>) -> Result<Vec<FileEntry>> {
        match at.filter(|r| !r.is_empty()) {
            Some(refname) => {
                let entries = self.repo.list_markdown_files_at_ref(refname)?;
                Ok(entries
                    .into_iter()
                    .map(|(path, size)| FileEntry {
                        path,
                        size,
                        mtime_ms: None,
                    })
                    .collect())
            }
            None => self.list_on_disk(),
        }
    }

    fn list_on_disk(&self) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();

        let walker = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                if name == ".git" || name == crate::git::INDEX_DIR_NAME {
                    return false;
                }
                // Nested stores (per-repo stores under `repos/`) own their
                // files; they are not part of this store's listing.
                !e.path().join(".git").exists()
            });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let rel = path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            let meta = entry.metadata().map_err(|e| Error::Internal(e.to_string()))?;
            entries.push(FileEntry {
                path: rel,
                size: meta.len() as i64,
                mtime_ms: Some(mtime_millis(&meta)),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Like [`Manager::list`] but with frontmatter descriptions and the
    /// pinned flag.
    pub async fn tree(&self, at: Option<&str>) -> Result<Vec<TreeEntry>> {
        let files = self.list(at).await?;
        let mut entries = Vec::with_capacity(files.len());

        for f in files {
            let description = self
                .read_raw(&f.path, at)
                .ok()
                .and_then(|raw| frontmatter::parse(&raw).0.description);
            let is_system = f.path.starts_with(&format!("{}/", SYSTEM_DIR));
            entries.push(TreeEntry {
                path: f.path,
                size: f.size,
                description,
                is_system,
            });
        }

        Ok(entries)
    }

    // ============ Search ============

    /// Hybrid search (see the `search` module). The read latch is released
    /// before the reranker subprocess runs.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        let mut limit = opts.max_results.saturating_mul(2);
        if self.reranker.is_some() {
            limit = limit.max(20);
        }
        let now_ms = Utc::now().timestamp_millis();

        let merged = {
            let _read = self.latch.read().await;
            search::hybrid_candidates(
                &self.pool,
                &self.embedding_cfg,
                self.provider.dims(),
                query,
                limit,
                self.reranker.is_some(),
                now_ms,
            )
            .await?
        };

        let ranked = match &self.reranker {
            Some(r) => r.rerank(query, merged).await,
            None => merged,
        };

        Ok(ranked
            .into_iter()
            .filter(|r| r.score >= opts.min_score)
            .take(opts.max_results)
            .collect())
    }

    // ============ Sync ============

    /// Bring the index in line with the on-disk content of `path`.
    ///
    /// No-op when the stored content hash matches; otherwise the file's
    /// chunk rows are replaced (with FTS delete sentinels first) and each
    /// chunk embedded through the cache. Per-chunk embedding failures are
    /// non-fatal.
    pub async fn sync(&self, path: &str) -> Result<()> {
        let _write = self.latch.write().await;

        let full = self.root.join(path);
        if !full.exists() {
            return self.remove_index_rows(path).await;
        }

        let raw = std::fs::read_to_string(&full)?;
        let hash = chunk::content_hash(&raw);

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT id, content_hash FROM files WHERE path = ?")
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((_, ref stored)) = existing {
            if *stored == hash {
                return Ok(());
            }
        }

        let meta = std::fs::metadata(&full)?;
        let mtime_ms = mtime_millis(&meta);

        let (_, body) = frontmatter::parse(&raw);
        let chunks = chunk::chunk_markdown(body);

        let mut tx = self.pool.begin().await?;

        if let Some((file_id, _)) = existing {
            delete_chunks_with_sentinels(&mut tx, file_id).await?;
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        }

        let file_id: i64 =
            sqlx::query("INSERT INTO files (path, mtime, content_hash) VALUES (?, ?, ?)")
                .bind(path)
                .bind(mtime_ms)
                .bind(&hash)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

        let mut inserted: Vec<(i64, String, String)> = Vec::with_capacity(chunks.len());
        for c in &chunks {
            let chunk_id: i64 = sqlx::query(
                "INSERT INTO chunks (file_id, start_line, end_line, text) VALUES (?, ?, ?, ?)",
            )
            .bind(file_id)
            .bind(c.start_line)
            .bind(c.end_line)
            .bind(&c.text)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            sqlx::query("INSERT INTO chunks_fts (rowid, text) VALUES (?, ?)")
                .bind(chunk_id)
                .bind(&c.text)
                .execute(&mut *tx)
                .await?;

            inserted.push((chunk_id, c.hash.clone(), c.text.clone()));
        }

        tx.commit().await?;
        debug!(path, chunks = inserted.len(), "synced");

        if self.provider.dims() > 0 {
            self.embed_chunks(&inserted).await;
        }

        Ok(())
    }

    /// Embed freshly inserted chunks through the cache. Failures skip only
    /// the chunk involved.
    async fn embed_chunks(&self, chunks: &[(i64, String, String)]) {
        for (chunk_id, text_hash, text) in chunks {
            let cached: Option<Vec<u8>> =
                sqlx::query_scalar("SELECT embedding FROM embedding_cache WHERE text_hash = ?")
                    .bind(text_hash)
                    .fetch_optional(&self.pool)
                    .await
                    .unwrap_or(None);

            let blob = match cached {
                Some(blob) => blob,
                None => {
                    let vec = match embedding::embed_texts(
                        &self.embedding_cfg,
                        std::slice::from_ref(text),
                    )
                    .await
                    {
                        Ok(mut vecs) if !vecs.is_empty() => vecs.remove(0),
                        Ok(_) => {
                            warn!(chunk_id, "empty embedding batch, skipping chunk");
                            continue;
                        }
                        Err(e) => {
                            warn!(chunk_id, error = %e, "chunk embedding failed, keyword-only");
                            continue;
                        }
                    };
                    let blob = embedding::vec_to_blob(&vec);

                    let insert = sqlx::query(
                        "INSERT OR REPLACE INTO embedding_cache \
                         (text_hash, embedding, provider, model, created) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(text_hash)
                    .bind(&blob)
                    .bind(self.provider.name())
                    .bind(self.provider.model_name())
                    .bind(Utc::now().timestamp_millis())
                    .execute(&self.pool)
                    .await;
                    if let Err(e) = insert {
                        warn!(chunk_id, error = %e, "embedding cache insert failed");
                    }
                    blob
                }
            };

            let insert =
                sqlx::query("INSERT OR REPLACE INTO chunks_vec (chunk_id, embedding) VALUES (?, ?)")
                    .bind(chunk_id)
                    .bind(&blob)
                    .execute(&self.pool)
                    .await;
            if let Err(e) = insert {
                warn!(chunk_id, error = %e, "chunk vector insert failed");
            }
        }
    }

    async fn remove_index_rows(&self, path: &str) -> Result<()> {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        let Some(file_id) = existing else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        delete_chunks_with_sentinels(&mut tx, file_id).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ============ History and branches ============

    pub async fn history(&self, path: Option<&str>, count: usize) -> Result<Vec<HistoryEntry>> {
        self.history_with_branch(path, count, None).await
    }

    pub async fn history_with_branch(
        &self,
        path: Option<&str>,
        count: usize,
        branch: Option<&str>,
    ) -> Result<Vec<HistoryEntry>> {
        self.repo.log_with_branch(path, count, branch)
    }

    pub fn branch_info(&self) -> Result<BranchInfo> {
        self.repo.branch_info()
    }

    pub async fn create_branch(&self, name: &str, from_ref: Option<&str>) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.repo.create_branch(name, from_ref)
    }

    pub async fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.repo.delete_branch(name, force)
    }

    /// Merge `source` into `target` (default branch when unset). When the
    /// effective target is the default branch, the index is resynced for
    /// every changed markdown file.
    pub async fn merge_branch(
        &self,
        source: &str,
        target: Option<&str>,
        strategy: MergeStrategy,
    ) -> Result<Vec<String>> {
        let _guard = self.lock.acquire().await?;

        let default = self.repo.default_branch()?;
        let effective = match target {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => default.clone(),
        };

        let changed = self.repo.merge_branch(source, Some(&effective), strategy)?;

        if effective == default {
            for path in &changed {
                if let Err(e) = self.sync(path).await {
                    warn!(path = %path, error = %e, "post-merge sync failed");
                }
            }
        }

        Ok(changed)
    }

    pub fn diff_refs(&self, base: &str, head: &str, path: Option<&str>) -> Result<String> {
        self.repo.diff_refs(base, head, path)
    }

    /// Stage-and-commit everything, serialized under the store lock. A
    /// clean tree is success. Used by the watcher and external callers.
    pub async fn auto_commit(&self, message: &str) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        match self.repo.auto_commit(message) {
            Ok(()) | Err(Error::NoChanges) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ============ Helpers ============

fn today_filename() -> String {
    format!("{}.md", Utc::now().format("%Y-%m-%d"))
}

/// Reject absolute paths, parent traversal, and writes into the reserved
/// directories.
fn validate_rel_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("path must not be empty".into()));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "path must be store-relative: {}",
            path
        )));
    }
    for component in p.components() {
        match component {
            std::path::Component::ParentDir => {
                return Err(Error::InvalidArgument(format!(
                    "path must not contain '..': {}",
                    path
                )));
            }
            std::path::Component::Normal(name) => {
                let name = name.to_string_lossy();
                if name == ".git" || name == crate::git::INDEX_DIR_NAME {
                    return Err(Error::InvalidArgument(format!(
                        "path is reserved: {}",
                        path
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Append with a blank-line separator iff the file was non-empty. With
/// `must_exist`, an absent file is an error instead of being created.
fn append_to_file(root: &Path, path: &str, content: &str, must_exist: bool) -> Result<()> {
    let full = root.join(path);

    let existing = if full.exists() {
        std::fs::read_to_string(&full)?
    } else {
        if must_exist {
            return Err(Error::NotFound(path.to_string()));
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        String::new()
    };

    ensure_writable(&full, path)?;

    let mut updated = existing;
    if !updated.is_empty() {
        if !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push('\n');
    }
    updated.push_str(content);
    if !updated.ends_with('\n') {
        updated.push('\n');
    }

    std::fs::write(&full, updated)?;
    Ok(())
}

/// Refuse mutation when the existing file's frontmatter says `read-only`.
fn ensure_writable(full: &Path, path: &str) -> Result<()> {
    if !full.exists() {
        return Ok(());
    }
    let raw = std::fs::read_to_string(full)?;
    let (fm, _) = frontmatter::parse(&raw);
    if fm.read_only {
        return Err(Error::ReadOnly(path.to_string()));
    }
    Ok(())
}

/// Issue FTS delete sentinels for every chunk of `file_id` before the rows
/// cascade away. External-content FTS5 requires the old text at delete time.
async fn delete_chunks_with_sentinels(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    file_id: i64,
) -> Result<()> {
    let old: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, text FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .fetch_all(&mut **tx)
            .await?;

    for (chunk_id, text) in old {
        sqlx::query("INSERT INTO chunks_fts (chunks_fts, rowid, text) VALUES ('delete', ?, ?)")
            .bind(chunk_id)
            .bind(text)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Manager) {
        let tmp = TempDir::new().unwrap();
        let mgr = Manager::open(tmp.path(), StoreOptions::default())
            .await
            .unwrap();
        (tmp, mgr)
    }

    #[tokio::test]
    async fn test_write_creates_and_appends() {
        let (_tmp, mgr) = open_store().await;

        let path = mgr.write("first note", Some("notes.md")).await.unwrap();
        assert_eq!(path, "notes.md");
        assert_eq!(mgr.read("notes.md", None).await.unwrap(), "first note\n");

        mgr.write("second note", Some("notes.md")).await.unwrap();
        assert_eq!(
            mgr.read("notes.md", None).await.unwrap(),
            "first note\n\nsecond note\n"
        );
    }

    #[tokio::test]
    async fn test_write_defaults_to_dated_file() {
        let (_tmp, mgr) = open_store().await;
        let path = mgr.write("daily", None).await.unwrap();
        assert!(search::is_dated_filename(&path));
        assert!(mgr.root().join(&path).exists());
    }

    #[tokio::test]
    async fn test_write_file_overwrites() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("a.md", "v1", None).await.unwrap();
        mgr.write_file("a.md", "v2", None).await.unwrap();
        assert_eq!(mgr.read("a.md", None).await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_read_only_refused() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("locked.md", "---\nread-only: true\n---\nfrozen", None)
            .await
            .unwrap();

        let err = mgr.write_file("locked.md", "new", None).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));

        let err = mgr.append("locked.md", "more").await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_read_strips_frontmatter() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("d.md", "---\ndescription: has header\n---\nthe body", None)
            .await
            .unwrap();
        assert_eq!(mgr.read("d.md", None).await.unwrap(), "the body");
    }

    #[tokio::test]
    async fn test_append_requires_existing_file() {
        let (_tmp, mgr) = open_store().await;
        let err = mgr.append("missing.md", "x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_line_slices() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("l.md", "one\ntwo\nthree\nfour", None)
            .await
            .unwrap();

        assert_eq!(mgr.get("l.md", 0, 0, None).await.unwrap(), "one\ntwo\nthree\nfour");
        assert_eq!(mgr.get("l.md", 2, 2, None).await.unwrap(), "two\nthree");
        assert_eq!(mgr.get("l.md", 4, 0, None).await.unwrap(), "four");
    }

    #[tokio::test]
    async fn test_move_and_delete() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("a.md", "content", None).await.unwrap();

        mgr.move_file("a.md", "sub/b.md").await.unwrap();
        assert!(!mgr.root().join("a.md").exists());
        assert_eq!(mgr.read("sub/b.md", None).await.unwrap(), "content");

        mgr.delete("sub/b.md").await.unwrap();
        assert!(matches!(
            mgr.read("sub/b.md", None).await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            mgr.delete("sub/b.md").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_pin_and_unpin() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("prefs.md", "likes rust", None).await.unwrap();

        let pinned = mgr.pin("prefs.md", None).await.unwrap();
        assert_eq!(pinned, "system/prefs.md");
        assert!(matches!(
            mgr.pin("system/prefs.md", None).await.unwrap_err(),
            Error::AlreadyPinned(_)
        ));

        let unpinned = mgr.unpin("system/prefs.md", None).await.unwrap();
        assert_eq!(unpinned, "prefs.md");
        assert!(matches!(
            mgr.unpin("prefs.md", None).await.unwrap_err(),
            Error::NotPinned(_)
        ));
    }

    #[tokio::test]
    async fn test_list_and_tree() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("a.md", "alpha", None).await.unwrap();
        mgr.write_file("system/pinned.md", "---\ndescription: always on\n---\nbody", None)
            .await
            .unwrap();

        let list = mgr.list(None).await.unwrap();
        let paths: Vec<&str> = list.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "system/pinned.md"]);
        assert!(list[0].mtime_ms.is_some());

        let tree = mgr.tree(None).await.unwrap();
        let pinned = tree.iter().find(|t| t.path == "system/pinned.md").unwrap();
        assert!(pinned.is_system);
        assert_eq!(pinned.description.as_deref(), Some("always on"));
        assert!(!tree.iter().find(|t| t.path == "a.md").unwrap().is_system);
    }

    #[tokio::test]
    async fn test_sync_hash_convergence_and_idempotence() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_file("s.md", "# Heading\n\nsome text", None)
            .await
            .unwrap();

        let hash: String = sqlx::query_scalar("SELECT content_hash FROM files WHERE path = 's.md'")
            .fetch_one(&mgr.pool)
            .await
            .unwrap();
        let on_disk = std::fs::read_to_string(mgr.root().join("s.md")).unwrap();
        assert_eq!(hash, chunk::content_hash(&on_disk));

        // Double sync leaves the same rows.
        let count_before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&mgr.pool)
            .await
            .unwrap();
        mgr.sync("s.md").await.unwrap();
        let count_after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&mgr.pool)
            .await
            .unwrap();
        assert_eq!(count_before, count_after);
    }

    #[tokio::test]
    async fn test_search_keyword_only() {
        let (_tmp, mgr) = open_store().await;
        mgr.write("The user prefers Go over Python.", Some("prefs.md"))
            .await
            .unwrap();
        mgr.write("Deploys happen from the main branch.", Some("deploy.md"))
            .await
            .unwrap();

        let results = mgr
            .search("Go language preference", &SearchOptions::default())
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results[0].snippet.contains("Go"));
        assert_eq!(results[0].path, "prefs.md");
    }

    #[tokio::test]
    async fn test_history_records_commits() {
        let (_tmp, mgr) = open_store().await;
        mgr.write_with_message_on_branch("note", Some("h.md"), Some("custom message"), None)
            .await
            .unwrap();

        let history = mgr.history(None, 10).await.unwrap();
        assert!(!history.is_empty());
        assert_eq!(history[0].message, "custom message");
        assert!(history[0].files.contains(&"h.md".to_string()));
    }

    #[tokio::test]
    async fn test_validate_rel_path() {
        assert!(validate_rel_path("notes/a.md").is_ok());
        assert!(validate_rel_path("../escape.md").is_err());
        assert!(validate_rel_path("/abs.md").is_err());
        assert!(validate_rel_path(".git/hook.md").is_err());
        assert!(validate_rel_path(".index/x.md").is_err());
        assert!(validate_rel_path("").is_err());
    }
}
