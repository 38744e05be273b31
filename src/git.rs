//! Git repository adapter for a memory store.
//!
//! Wraps the repository embedded in the store directory with the operations
//! the manager needs: init, staged auto-commits, history reads, branch
//! management, merges, diffs, and content-at-ref access. Everything shells
//! out to the `git` binary; no libgit2 binding is linked.
//!
//! # History parsing
//!
//! `git log` output is parsed with non-printable separators (`\x1e` between
//! records, `\x1f` between fields) so arbitrary commit subjects survive,
//! plus `--numstat` for per-file additions/deletions.
//!
//! # Error classification
//!
//! Git reports failures as free-form stderr text. [`classify_git_error`]
//! maps the known phrases onto the crate error taxonomy (RefLookup,
//! NotFound, NoChanges) so no caller ever matches raw strings.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Committer identity for all store commits.
pub const COMMITTER_NAME: &str = "Memory";
pub const COMMITTER_EMAIL: &str = "memory@local";

/// Name of the index directory excluded from version control.
pub const INDEX_DIR_NAME: &str = ".index";

/// Upper bound on history reads.
const MAX_LOG_COUNT: usize = 1000;

/// One parsed commit from `git log`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Store scope tag, filled in by the tool layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_sha: Option<String>,
    pub message: String,
    /// Author date, RFC 3339.
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    pub additions: i64,
    pub deletions: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub files: Vec<String>,
}

/// Branch overview returned by [`GitRepo::branch_info`].
#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub current: String,
    pub default: String,
    pub branches: Vec<String>,
}

/// Merge strategies supported by [`GitRepo::merge_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    FfOnly,
    NoFf,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "ff-only" => Ok(MergeStrategy::FfOnly),
            "no-ff" => Ok(MergeStrategy::NoFf),
            other => Err(Error::InvalidArgument(format!(
                "unknown merge strategy '{}' (use ff-only or no-ff)",
                other
            ))),
        }
    }
}

/// Classify git stderr into the crate error taxonomy.
pub fn classify_git_error(stderr: &str) -> Error {
    let text = stderr.trim();
    let lower = text.to_lowercase();

    const NO_CHANGES: &[&str] = &[
        "nothing to commit",
        "no changes added to commit",
        "working tree clean",
    ];
    const REF_LOOKUP: &[&str] = &[
        "unknown revision",
        "bad revision",
        "ambiguous argument",
        "not a valid ref",
        "not a valid object name",
        "bad object",
        "invalid object name",
        "invalid reference",
        "did not match any file(s) known to git",
    ];
    const NOT_FOUND: &[&str] = &["does not exist", "exists on disk, but not in"];

    if NO_CHANGES.iter().any(|p| lower.contains(p)) {
        return Error::NoChanges;
    }
    if REF_LOOKUP.iter().any(|p| lower.contains(p)) {
        return Error::RefLookup(text.to_string());
    }
    if NOT_FOUND.iter().any(|p| lower.contains(p)) {
        return Error::NotFound(text.to_string());
    }
    Error::Git(text.to_string())
}

/// Handle to the git repository embedded in one store directory.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    // ============ Subprocess helpers ============

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(repo = %self.root.display(), ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::Internal(format!("failed to execute git: {}", e)))
    }

    /// Run git, classify stderr on failure, return stdout on success.
    fn run_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_error(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_quiet_success(&self, args: &[&str]) -> bool {
        self.run(args).map(|o| o.status.success()).unwrap_or(false)
    }

    // ============ Init ============

    /// Idempotently initialize the repository: create if absent, set the
    /// committer identity, and make sure `.gitignore` excludes the index
    /// directory.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;

        if !self.git_dir().exists() {
            self.run_ok(&["init", "--initial-branch=main"])?;
        }

        self.run_ok(&["config", "user.name", COMMITTER_NAME])?;
        self.run_ok(&["config", "user.email", COMMITTER_EMAIL])?;

        let gitignore = self.root.join(".gitignore");
        let ignore_line = format!("{}/", INDEX_DIR_NAME);
        let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
        if !existing.lines().any(|l| l.trim() == ignore_line) {
            let mut content = existing;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&ignore_line);
            content.push('\n');
            std::fs::write(&gitignore, content)?;
        }

        Ok(())
    }

    // ============ Commits ============

    /// Stage all changes and commit. Returns [`Error::NoChanges`] when the
    /// working tree is clean.
    pub fn auto_commit(&self, message: &str) -> Result<()> {
        self.run_ok(&["add", "-A"])?;

        let status = self.run_ok(&["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Err(Error::NoChanges);
        }

        self.run_ok(&["commit", "-m", message])?;
        Ok(())
    }

    pub fn has_commits(&self) -> bool {
        self.run_quiet_success(&["rev-parse", "--verify", "--quiet", "HEAD"])
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_ok(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    // ============ Branches ============

    pub fn current_branch(&self) -> Result<String> {
        let output = self.run(&["symbolic-ref", "--short", "-q", "HEAD"])?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        // Detached HEAD.
        Ok(self
            .run_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Resolve the store's designated mainline: the remote HEAD symref if
    /// present, else `main` if it exists, else `master`, else the current
    /// branch; an empty store falls back to `main`.
    pub fn default_branch(&self) -> Result<String> {
        let output = self.run(&["symbolic-ref", "refs/remotes/origin/HEAD"])?;
        if output.status.success() {
            let full = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if let Some(name) = full.strip_prefix("refs/remotes/origin/") {
                return Ok(name.to_string());
            }
        }

        for candidate in ["main", "master"] {
            if self.branch_exists(candidate) {
                return Ok(candidate.to_string());
            }
        }

        if self.has_commits() {
            return self.current_branch();
        }

        Ok("main".to_string())
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.run_quiet_success(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{}", name),
        ])
    }

    pub fn branches(&self) -> Result<Vec<String>> {
        let output = self.run_ok(&["branch", "--format=%(refname:short)"])?;
        Ok(output
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn branch_info(&self) -> Result<BranchInfo> {
        Ok(BranchInfo {
            current: self.current_branch()?,
            default: self.default_branch()?,
            branches: self.branches()?,
        })
    }

    /// Create a branch, optionally from a given ref.
    ///
    /// On an unborn HEAD the branch cannot be pointed at a commit; the name
    /// is checked out and the prior HEAD restored, so the branch is born at
    /// its first commit.
    pub fn create_branch(&self, name: &str, from_ref: Option<&str>) -> Result<()> {
        let valid = self.run_quiet_success(&["check-ref-format", "--branch", name]);
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "invalid branch name: {}",
                name
            )));
        }

        if self.has_commits() {
            match from_ref {
                Some(from) if !from.is_empty() => self.run_ok(&["branch", name, from])?,
                _ => self.run_ok(&["branch", name])?,
            };
            return Ok(());
        }

        // Unborn HEAD: check out the new name, then restore the prior HEAD.
        let prior = self.current_branch()?;
        self.run_ok(&["checkout", "-b", name])?;
        self.run_ok(&["symbolic-ref", "HEAD", &format!("refs/heads/{}", prior)])?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        if self.current_branch()? == name {
            return Err(Error::InvalidArgument(format!(
                "cannot delete the current branch '{}'",
                name
            )));
        }
        let flag = if force { "-D" } else { "-d" };
        self.run_ok(&["branch", flag, name])?;
        Ok(())
    }

    pub fn checkout(&self, refname: &str) -> Result<()> {
        self.run_ok(&["checkout", refname])?;
        Ok(())
    }

    /// Merge `source` into `target` (default branch when unset).
    ///
    /// Temporarily checks out the target, aborts a failed merge, restores
    /// the original branch on every exit path, and returns the markdown
    /// files whose content changed between the pre- and post-merge HEAD.
    pub fn merge_branch(
        &self,
        source: &str,
        target: Option<&str>,
        strategy: MergeStrategy,
    ) -> Result<Vec<String>> {
        let target = match target {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => self.default_branch()?,
        };
        let original = self.current_branch()?;

        if original != target {
            self.checkout(&target)?;
        }

        let result = self.merge_on_current(source, strategy);

        if original != target {
            // Restore even when the merge failed.
            let restore = self.checkout(&original);
            if result.is_ok() {
                restore?;
            }
        }

        result
    }

    fn merge_on_current(&self, source: &str, strategy: MergeStrategy) -> Result<Vec<String>> {
        let pre = self.head_sha()?;

        let merge_result = match strategy {
            MergeStrategy::FfOnly => self.run_ok(&["merge", "--ff-only", source]),
            MergeStrategy::NoFf => {
                let message = format!("Merge branch '{}'", source);
                self.run_ok(&["merge", "--no-ff", "-m", &message, source])
            }
        };

        if let Err(e) = merge_result {
            let _ = self.run(&["merge", "--abort"]);
            return Err(e);
        }

        let post = self.head_sha()?;
        if pre == post {
            return Ok(Vec::new());
        }

        let diff = self.run_ok(&["diff", "--name-only", &pre, &post])?;
        Ok(diff
            .lines()
            .map(str::trim)
            .filter(|l| l.ends_with(".md"))
            .map(str::to_string)
            .collect())
    }

    // ============ Diffs and ref reads ============

    /// Unified diff between two refs, optionally restricted to one path.
    pub fn diff_refs(&self, base: &str, head: &str, path: Option<&str>) -> Result<String> {
        let mut args = vec!["diff", base, head];
        if let Some(p) = path {
            args.push("--");
            args.push(p);
        }
        self.run_ok(&args)
    }

    /// Read a file's content as of `refname`.
    pub fn read_file_at_ref(&self, refname: &str, path: &str) -> Result<String> {
        self.run_ok(&["show", &format!("{}:{}", refname, path)])
    }

    /// List `.md` files (path and blob size) as of `refname`.
    pub fn list_markdown_files_at_ref(&self, refname: &str) -> Result<Vec<(String, i64)>> {
        let output = self.run_ok(&["ls-tree", "-r", "-l", refname])?;
        let mut entries = Vec::new();
        for line in output.lines() {
            let Some((meta, path)) = line.split_once('\t') else {
                continue;
            };
            if !path.ends_with(".md") {
                continue;
            }
            let size = meta
                .split_whitespace()
                .nth(3)
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            entries.push((path.to_string(), size));
        }
        Ok(entries)
    }

    // ============ History ============

    /// Read the most recent commits from `branch` (or HEAD).
    ///
    /// Empty repositories return an empty list. `count` is clamped to
    /// [`MAX_LOG_COUNT`].
    pub fn log_with_branch(
        &self,
        path: Option<&str>,
        count: usize,
        branch: Option<&str>,
    ) -> Result<Vec<HistoryEntry>> {
        let count = count.clamp(1, MAX_LOG_COUNT);
        let max_count = format!("--max-count={}", count);

        let mut args: Vec<&str> = vec!["log"];
        if let Some(b) = branch {
            if !b.is_empty() {
                args.push(b);
            }
        }
        args.push(&max_count);
        args.push("--date=iso-strict");
        args.push("--format=%x1e%H%x1f%P%x1f%s%x1f%ad%x1f%an%x1f%ae");
        args.push("--numstat");
        if let Some(p) = path {
            args.push("--");
            args.push(p);
        }

        let output = self.run(&args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("does not have any commits yet")
                || stderr.contains("bad default revision")
            {
                return Ok(Vec::new());
            }
            return Err(classify_git_error(&String::from_utf8_lossy(&output.stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_log_output(&stdout, branch))
    }
}

/// Parse `git log` output produced with the control-character format above.
fn parse_log_output(stdout: &str, branch: Option<&str>) -> Vec<HistoryEntry> {
    let mut entries = Vec::new();

    for record in stdout.split('\x1e') {
        let record = record.trim_start_matches('\n');
        if record.trim().is_empty() {
            continue;
        }

        let (head_line, body) = record.split_once('\n').unwrap_or((record, ""));
        let fields: Vec<&str> = head_line.split('\x1f').collect();
        if fields.len() < 6 {
            continue;
        }

        let parent_sha = fields[1]
            .split_whitespace()
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut additions = 0i64;
        let mut deletions = 0i64;
        let mut files = Vec::new();
        for line in body.lines() {
            let mut parts = line.split('\t');
            let (Some(a), Some(d), Some(file)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            // Binary files report "-" in numstat.
            additions += a.trim().parse::<i64>().unwrap_or(0);
            deletions += d.trim().parse::<i64>().unwrap_or(0);
            files.push(file.to_string());
        }

        entries.push(HistoryEntry {
            scope: None,
            sha: fields[0].to_string(),
            parent_sha,
            message: fields[2].to_string(),
            date: fields[3].to_string(),
            author_name: Some(fields[4].to_string()).filter(|s| !s.is_empty()),
            author_email: Some(fields[5].trim().to_string()).filter(|s| !s.is_empty()),
            additions,
            deletions,
            branch: branch.filter(|b| !b.is_empty()).map(str::to_string),
            files,
        });
    }

    entries
}
