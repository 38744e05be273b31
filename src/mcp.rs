//! MCP tool surface.
//!
//! Exposes the memory stores to external agent processes over the MCP
//! JSON-RPC protocol, on stdio (primary) or streamable HTTP. Tools are thin
//! shims: validate arguments, route through the [`StoreRegistry`], call the
//! manager, shape the result as text or JSON, and wrap errors with a short
//! prefix and a usage hint.
//!
//! `HIVEMIND_TIER` gates registration: tier 1 serves read-only tools, tier 2
//! adds write tools, tier 3 (default) adds branch management.

use std::sync::Arc;

use rmcp::handler::server::{tool::ToolRouter, wrapper::Parameters};
use rmcp::model::*;
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{tool, tool_router, ErrorData as McpError, ServerHandler};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{stdin, stdout};
use tracing::debug;

use crate::error::Error;
use crate::git::MergeStrategy;
use crate::scope::{Scope, StoreRegistry};
use crate::search::SearchOptions;

/// Tools requiring tier 2.
const WRITE_TOOLS: &[&str] = &[
    "memory_write",
    "memory_append",
    "memory_move",
    "memory_delete",
    "memory_pin",
    "memory_unpin",
];

/// Tools requiring tier 3.
const BRANCH_TOOLS: &[&str] = &[
    "memory_branch_create",
    "memory_branch_delete",
    "memory_branch_merge",
];

/// Tools clients may treat as safe.
const READ_ONLY_TOOLS: &[&str] = &[
    "memory_read",
    "memory_get",
    "memory_list",
    "memory_tree",
    "memory_history",
    "memory_search",
    "memory_branches",
    "memory_diff",
];

fn tool_allowed(tier: u8, name: &str) -> bool {
    if BRANCH_TOOLS.contains(&name) {
        return tier >= 3;
    }
    if WRITE_TOOLS.contains(&name) {
        return tier >= 2;
    }
    true
}

// ============ Parameter types ============

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadParams {
    /// Store-relative markdown path (e.g. "prefs.md", "repos/api/notes.md")
    pub path: String,
    /// Optional git ref (branch, tag, or commit SHA) to read at
    pub r#ref: Option<String>,
    /// Store scope: "global", "repo", or unset for automatic routing
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetParams {
    /// Store-relative markdown path
    pub path: String,
    /// First line to return, 1-based (0 = from the beginning)
    pub from: Option<i64>,
    /// Number of lines to return (0 = all remaining)
    pub lines: Option<i64>,
    /// Optional git ref to read at
    pub r#ref: Option<String>,
    /// Store scope: "global", "repo", or unset
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListParams {
    /// Optional git ref to list at
    pub r#ref: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HistoryParams {
    /// Restrict history to one path
    pub path: Option<String>,
    /// Store scope: "global", "repo", or unset for both
    pub scope: Option<String>,
    /// Maximum entries to return (default 20)
    pub count: Option<i64>,
    /// Branch to read history from
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Search query
    pub query: String,
    /// Maximum results to return (default 8)
    pub max_results: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BranchesParams {
    /// Store scope: "global", "repo", or unset for all stores
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DiffParams {
    /// Base ref of the diff
    pub base_ref: String,
    /// Head ref of the diff
    pub head_ref: String,
    /// Restrict the diff to one path
    pub path: Option<String>,
    /// Store scope: "global", "repo", or unset
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteParams {
    /// Markdown content to record
    pub content: String,
    /// Target file; defaults to today's dated note (YYYY-MM-DD.md)
    pub file: Option<String>,
    /// Store scope: "global", "repo", or unset for automatic routing
    pub scope: Option<String>,
    /// Commit message override
    pub commit_message: Option<String>,
    /// Branch to write on (default branch when unset)
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AppendParams {
    /// Existing store-relative markdown path
    pub path: String,
    /// Markdown content to append
    pub content: String,
    /// Branch to write on
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MoveParams {
    /// Current store-relative path
    pub from: String,
    /// New store-relative path
    pub to: String,
    /// Branch to write on
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteParams {
    /// Store-relative path to delete
    pub path: String,
    /// Branch to write on
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PinParams {
    /// Store-relative path to pin or unpin
    pub path: String,
    /// Branch to write on
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BranchCreateParams {
    /// Branch name to create
    pub name: String,
    /// Ref to branch from (HEAD when unset)
    pub from_ref: Option<String>,
    /// Store scope: "global", "repo", or unset
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BranchDeleteParams {
    /// Branch name to delete
    pub name: String,
    /// Delete even when unmerged
    pub force: Option<bool>,
    /// Store scope: "global", "repo", or unset
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BranchMergeParams {
    /// Source branch to merge
    pub source: String,
    /// Target branch (default branch when unset)
    pub target: Option<String>,
    /// Merge strategy: "ff-only" (default) or "no-ff"
    pub strategy: Option<String>,
    /// Store scope: "global", "repo", or unset
    pub scope: Option<String>,
}

// ============ Error shaping ============

/// Missing-parameter error with a one-line usage example.
fn missing_param(name: &str, example: &str) -> McpError {
    McpError::invalid_params(
        format!("missing required parameter '{}'", name),
        Some(json!({ "example": example })),
    )
}

fn require<'a>(value: &'a str, name: &str, example: &str) -> Result<&'a str, McpError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(missing_param(name, example));
    }
    Ok(trimmed)
}

/// Wrap a manager error with a short prefix and an optional usage hint.
fn wrap_err(prefix: &str, e: Error, hint: Option<&str>) -> McpError {
    let data = hint.map(|h| json!({ "hint": h }));
    let message = format!("{}: {}", prefix, e);
    match e {
        Error::InvalidArgument(_)
        | Error::NotFound(_)
        | Error::RefLookup(_)
        | Error::ReadOnly(_)
        | Error::AlreadyPinned(_)
        | Error::NotPinned(_) => McpError::invalid_params(message, data),
        Error::Busy { .. } => {
            McpError::new(ErrorCode::INTERNAL_ERROR, format!("{} (retry later)", message), data)
        }
        _ => McpError::new(ErrorCode::INTERNAL_ERROR, message, data),
    }
}

fn ok_text(text: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text.into())])
}

fn ok_json(value: &impl serde::Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None))?;
    Ok(ok_text(text))
}

fn parse_scope(scope: &Option<String>) -> Result<Scope, McpError> {
    Scope::parse(scope.as_deref().unwrap_or(""))
        .map_err(|e| wrap_err("scope", e, Some("scope is \"global\", \"repo\", or unset")))
}

// ============ Service ============

/// The MCP service: one per connection, all sharing the registry.
#[derive(Clone)]
pub struct MemoryService {
    registry: Arc<StoreRegistry>,
    tool_router: ToolRouter<Self>,
    tier: u8,
}

impl MemoryService {
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self::with_tier(registry, crate::config::tier())
    }

    pub fn with_tier(registry: Arc<StoreRegistry>, tier: u8) -> Self {
        Self {
            registry,
            tool_router: Self::tool_router(),
            tier,
        }
    }
}

#[tool_router]
impl MemoryService {
    // ---- Read-only tools ----

    #[tool(
        description = "Read a memory file's body (frontmatter stripped), optionally at a git ref. Falls back from the resolved store to the repo and legacy stores."
    )]
    async fn memory_read(
        &self,
        params: Parameters<ReadParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let path = require(&p.path, "path", "memory_read(path=\"prefs.md\")")?;
        let scope = parse_scope(&p.scope)?;
        let refname = p.r#ref.as_deref();

        let mut last_err = Error::NotFound(path.to_string());
        for candidate in self.registry.read_candidates(scope, path) {
            match candidate.manager.read(&candidate.path, refname).await {
                Ok(body) => return Ok(ok_text(body)),
                Err(e) if e.is_fallback_eligible() => last_err = e,
                Err(e) => return Err(wrap_err("read failed", e, None)),
            }
        }
        Err(wrap_err(
            "read failed",
            last_err,
            Some("use memory_list to see available files"),
        ))
    }

    #[tool(description = "Read a line slice of a memory file. `from` is 1-based; 0 means from the beginning, and `lines` of 0 means all remaining lines.")]
    async fn memory_get(
        &self,
        params: Parameters<GetParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let path = require(&p.path, "path", "memory_get(path=\"prefs.md\", from=10, lines=5)")?;
        let scope = parse_scope(&p.scope)?;
        let refname = p.r#ref.as_deref();
        let from = p.from.unwrap_or(0);
        let lines = p.lines.unwrap_or(0);

        let mut last_err = Error::NotFound(path.to_string());
        for candidate in self.registry.read_candidates(scope, path) {
            match candidate
                .manager
                .get(&candidate.path, from, lines, refname)
                .await
            {
                Ok(slice) => return Ok(ok_text(slice)),
                Err(e) if e.is_fallback_eligible() => last_err = e,
                Err(e) => return Err(wrap_err("get failed", e, None)),
            }
        }
        Err(wrap_err("get failed", last_err, None))
    }

    #[tool(
        description = "List memory files across the global and repo stores with size and modification time, deduplicated by scope and path."
    )]
    async fn memory_list(
        &self,
        params: Parameters<ListParams>,
    ) -> Result<CallToolResult, McpError> {
        let refname = params.0.r#ref.as_deref();

        let mut rows = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (label, manager) in self.registry.all_stores() {
            let entries = match manager.list(refname).await {
                Ok(entries) => entries,
                // A store without the requested ref contributes nothing.
                Err(e) if e.is_fallback_eligible() => continue,
                Err(e) => return Err(wrap_err("list failed", e, None)),
            };
            for entry in entries {
                if !seen.insert((label, entry.path.clone())) {
                    continue;
                }
                rows.push(json!({
                    "scope": label,
                    "path": entry.path,
                    "size": entry.size,
                    "mtime_ms": entry.mtime_ms,
                }));
            }
        }
        ok_json(&rows)
    }

    #[tool(
        description = "List memory files with frontmatter descriptions and the pinned (system) flag."
    )]
    async fn memory_tree(
        &self,
        params: Parameters<ListParams>,
    ) -> Result<CallToolResult, McpError> {
        let refname = params.0.r#ref.as_deref();

        let mut rows = Vec::new();
        for (label, manager) in self.registry.all_stores() {
            let entries = match manager.tree(refname).await {
                Ok(entries) => entries,
                Err(e) if e.is_fallback_eligible() => continue,
                Err(e) => return Err(wrap_err("tree failed", e, None)),
            };
            for entry in entries {
                rows.push(json!({
                    "scope": label,
                    "path": entry.path,
                    "size": entry.size,
                    "description": entry.description,
                    "is_system": entry.is_system,
                }));
            }
        }
        ok_json(&rows)
    }

    #[tool(
        description = "Commit history across stores, newest first, deduplicated by scope and SHA. Optionally restricted to one path, scope, or branch."
    )]
    async fn memory_history(
        &self,
        params: Parameters<HistoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let scope = parse_scope(&p.scope)?;
        let count = p.count.unwrap_or(20).clamp(1, 1000) as usize;
        let path = p.path.as_deref().filter(|s| !s.is_empty());
        let branch = p.branch.as_deref().filter(|s| !s.is_empty());

        let stores = match scope {
            Scope::Auto => self.registry.all_stores(),
            _ => {
                let resolved = self.registry.store_for_scope(scope);
                vec![(resolved.label, resolved.manager)]
            }
        };

        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (label, manager) in stores {
            let history = manager
                .history_with_branch(path, count, branch)
                .await
                .map_err(|e| wrap_err("history failed", e, None))?;
            for mut entry in history {
                if !seen.insert((label, entry.sha.clone())) {
                    continue;
                }
                entry.scope = Some(label.to_string());
                entries.push(entry);
            }
        }

        // RFC 3339 strings order chronologically.
        entries.sort_by(|a, b| b.date.cmp(&a.date));
        entries.truncate(count);
        ok_json(&entries)
    }

    #[tool(
        description = "Hybrid keyword/semantic search across the global and repo stores. Returns ranked snippets with path and line span."
    )]
    async fn memory_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let query = require(&p.query, "query", "memory_search(query=\"database migrations\")")?;
        let max_results = p.max_results.unwrap_or(8).clamp(1, 50) as usize;

        let opts = SearchOptions {
            max_results,
            min_score: 0.0,
        };

        let mut results = Vec::new();
        for (_, manager) in self.registry.all_stores() {
            match manager.search(query, &opts).await {
                Ok(mut found) => results.append(&mut found),
                Err(e) => debug!(error = %e, "store search failed"),
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(max_results);
        ok_json(&results)
    }

    #[tool(description = "Current, default, and all branches for each store.")]
    async fn memory_branches(
        &self,
        params: Parameters<BranchesParams>,
    ) -> Result<CallToolResult, McpError> {
        let scope = parse_scope(&params.0.scope)?;

        let stores = match scope {
            Scope::Auto => self.registry.all_stores(),
            _ => {
                let resolved = self.registry.store_for_scope(scope);
                vec![(resolved.label, resolved.manager)]
            }
        };

        let mut rows = Vec::new();
        for (label, manager) in stores {
            let info = manager
                .branch_info()
                .map_err(|e| wrap_err("branches failed", e, None))?;
            rows.push(json!({
                "scope": label,
                "current": info.current,
                "default": info.default,
                "branches": info.branches,
            }));
        }
        ok_json(&rows)
    }

    #[tool(description = "Unified git diff between two refs, optionally restricted to one path.")]
    async fn memory_diff(
        &self,
        params: Parameters<DiffParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let base = require(&p.base_ref, "base_ref", "memory_diff(base_ref=\"main\", head_ref=\"feature/x\")")?;
        let head = require(&p.head_ref, "head_ref", "memory_diff(base_ref=\"main\", head_ref=\"feature/x\")")?;
        let scope = parse_scope(&p.scope)?;
        let path = p.path.as_deref().filter(|s| !s.is_empty());

        let resolved = self.registry.store_for_scope(scope);
        let diff = resolved
            .manager
            .diff_refs(base, head, path)
            .map_err(|e| wrap_err("diff failed", e, Some("refs must exist in the store")))?;
        Ok(ok_text(if diff.is_empty() {
            "(no differences)".to_string()
        } else {
            diff
        }))
    }

    // ---- Write tools ----

    #[tool(
        description = "Record memory content. Appends to the target file (today's dated note when `file` is unset), reindexes, and commits."
    )]
    async fn memory_write(
        &self,
        params: Parameters<WriteParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let content = require(&p.content, "content", "memory_write(content=\"prefers tabs\")")?;
        let scope = parse_scope(&p.scope)?;
        let file = p.file.as_deref().unwrap_or("");

        let resolved = self.registry.resolve(scope, file);
        let file_arg = (!resolved.path.is_empty()).then_some(resolved.path.as_str());
        let path = resolved
            .manager
            .write_with_message_on_branch(
                content,
                file_arg,
                p.commit_message.as_deref(),
                p.branch.as_deref(),
            )
            .await
            .map_err(|e| wrap_err("write failed", e, None))?;

        Ok(ok_text(format!("wrote {}:{}", resolved.label, path)))
    }

    #[tool(description = "Append content to an existing memory file, reindex, and commit.")]
    async fn memory_append(
        &self,
        params: Parameters<AppendParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let path = require(&p.path, "path", "memory_append(path=\"prefs.md\", content=\"...\")")?;
        let content = require(&p.content, "content", "memory_append(path=\"prefs.md\", content=\"...\")")?;

        let resolved = self.registry.resolve(Scope::Auto, path);
        resolved
            .manager
            .append_on_branch(&resolved.path, content, p.branch.as_deref())
            .await
            .map_err(|e| {
                wrap_err(
                    "append failed",
                    e,
                    Some("the file must already exist; use memory_write to create it"),
                )
            })?;

        Ok(ok_text(format!("appended to {}:{}", resolved.label, resolved.path)))
    }

    #[tool(description = "Rename a memory file within its store. Cross-store moves fail.")]
    async fn memory_move(
        &self,
        params: Parameters<MoveParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let from = require(&p.from, "from", "memory_move(from=\"a.md\", to=\"notes/a.md\")")?;
        let to = require(&p.to, "to", "memory_move(from=\"a.md\", to=\"notes/a.md\")")?;

        let src = self.registry.resolve(Scope::Auto, from);
        let dst = self.registry.resolve(Scope::Auto, to);
        if src.label != dst.label {
            return Err(McpError::invalid_params(
                format!(
                    "cross-scope move ({} -> {}) is not supported",
                    src.label, dst.label
                ),
                Some(json!({
                    "hint": "read the file and memory_write it into the other store instead"
                })),
            ));
        }

        src.manager
            .move_on_branch(&src.path, &dst.path, p.branch.as_deref())
            .await
            .map_err(|e| wrap_err("move failed", e, None))?;

        Ok(ok_text(format!("moved {} -> {}", from, to)))
    }

    #[tool(description = "Delete a memory file and its index entries, then commit.")]
    async fn memory_delete(
        &self,
        params: Parameters<DeleteParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let path = require(&p.path, "path", "memory_delete(path=\"stale.md\")")?;

        let resolved = self.registry.resolve(Scope::Auto, path);
        resolved
            .manager
            .delete_on_branch(&resolved.path, p.branch.as_deref())
            .await
            .map_err(|e| wrap_err("delete failed", e, None))?;

        Ok(ok_text(format!("deleted {}:{}", resolved.label, resolved.path)))
    }

    #[tool(
        description = "Pin a file: move it under system/ so it is always injected into agent context."
    )]
    async fn memory_pin(
        &self,
        params: Parameters<PinParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let path = require(&p.path, "path", "memory_pin(path=\"setup.md\")")?;

        let resolved = self.registry.resolve(Scope::Auto, path);
        let pinned = resolved
            .manager
            .pin(&resolved.path, p.branch.as_deref())
            .await
            .map_err(|e| wrap_err("pin failed", e, None))?;

        Ok(ok_text(format!("pinned as {}", pinned)))
    }

    #[tool(description = "Unpin a file: move it out of system/.")]
    async fn memory_unpin(
        &self,
        params: Parameters<PinParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let path = require(&p.path, "path", "memory_unpin(path=\"system/setup.md\")")?;

        let resolved = self.registry.resolve(Scope::Auto, path);
        let unpinned = resolved
            .manager
            .unpin(&resolved.path, p.branch.as_deref())
            .await
            .map_err(|e| wrap_err("unpin failed", e, None))?;

        Ok(ok_text(format!("unpinned as {}", unpinned)))
    }

    // ---- Branch tools ----

    #[tool(description = "Create a branch in the selected store.")]
    async fn memory_branch_create(
        &self,
        params: Parameters<BranchCreateParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let name = require(&p.name, "name", "memory_branch_create(name=\"feature/memory\")")?;
        let scope = parse_scope(&p.scope)?;

        let resolved = self.registry.store_for_scope(scope);
        resolved
            .manager
            .create_branch(name, p.from_ref.as_deref())
            .await
            .map_err(|e| wrap_err("branch create failed", e, None))?;

        Ok(ok_text(format!("created branch {} in {}", name, resolved.label)))
    }

    #[tool(description = "Delete a branch in the selected store. Refuses the current branch.")]
    async fn memory_branch_delete(
        &self,
        params: Parameters<BranchDeleteParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let name = require(&p.name, "name", "memory_branch_delete(name=\"feature/memory\")")?;
        let scope = parse_scope(&p.scope)?;

        let resolved = self.registry.store_for_scope(scope);
        resolved
            .manager
            .delete_branch(name, p.force.unwrap_or(false))
            .await
            .map_err(|e| {
                wrap_err(
                    "branch delete failed",
                    e,
                    Some("pass force=true for unmerged branches"),
                )
            })?;

        Ok(ok_text(format!("deleted branch {}", name)))
    }

    #[tool(
        description = "Merge a branch (ff-only by default, or no-ff) into the target branch and reindex changed files."
    )]
    async fn memory_branch_merge(
        &self,
        params: Parameters<BranchMergeParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let source = require(&p.source, "source", "memory_branch_merge(source=\"feature/memory\")")?;
        let scope = parse_scope(&p.scope)?;
        let strategy = MergeStrategy::parse(p.strategy.as_deref().unwrap_or(""))
            .map_err(|e| wrap_err("merge failed", e, None))?;

        let resolved = self.registry.store_for_scope(scope);
        let changed = resolved
            .manager
            .merge_branch(source, p.target.as_deref(), strategy)
            .await
            .map_err(|e| {
                wrap_err(
                    "merge failed",
                    e,
                    Some("ff-only merges require the target to be an ancestor of the source"),
                )
            })?;

        ok_json(&json!({
            "merged": source,
            "changed_files": changed,
        }))
    }
}

impl ServerHandler for MemoryService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "hivemind-memory".to_string(),
                title: Some("Hivemind Memory".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Persistent, searchable, git-backed memory shared by your agent fleet. \
                 Use memory_search before asking the user for context, memory_read to \
                 fetch files, and memory_write/memory_append to record durable facts. \
                 Branch tools stage speculative notes away from the default branch."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tool_router
            .list_all()
            .into_iter()
            .filter(|t| tool_allowed(self.tier, &t.name))
            .map(|mut t| {
                let read_only = READ_ONLY_TOOLS.contains(&&*t.name);
                t.annotations = Some(ToolAnnotations::new().read_only(read_only));
                t
            })
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if !tool_allowed(self.tier, &request.name) {
            return Err(McpError::invalid_request(
                format!(
                    "tool '{}' is not available at tier {} (set HIVEMIND_TIER)",
                    request.name, self.tier
                ),
                None,
            ));
        }

        let tool_context = rmcp::handler::server::tool::ToolCallContext::new(self, request, context);
        self.tool_router.call(tool_context).await
    }
}

// ============ Serving ============

/// Serve MCP over stdio. Logs must go to stderr in this mode.
pub async fn run_stdio(registry: Arc<StoreRegistry>) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    tracing::info!("starting memory MCP server (stdio)");
    let service = MemoryService::new(registry);
    let server = service.serve((stdin(), stdout())).await?;
    let quit_reason = server.waiting().await?;
    tracing::info!(?quit_reason, "memory MCP server stopped");
    Ok(())
}

/// Serve MCP over streamable HTTP at `bind`.
pub async fn run_http(registry: Arc<StoreRegistry>, bind: &str) -> anyhow::Result<()> {
    use rmcp::transport::streamable_http_server::{
        session::local::LocalSessionManager,
        tower::{StreamableHttpServerConfig, StreamableHttpService},
    };

    let addr: std::net::SocketAddr = bind.parse()?;
    tracing::info!(%addr, "starting memory MCP server (HTTP)");

    let session_manager = Arc::new(LocalSessionManager::default());
    let config = StreamableHttpServerConfig::default();
    let service = MemoryService::new(registry);
    let mcp_service =
        StreamableHttpService::new(move || Ok(service.clone()), session_manager, config);

    let app = axum::Router::new().route("/mcp", axum::routing::any_service(mcp_service));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, shutting down");
}
