//! Context injection into a worktree's `CLAUDE.md`.
//!
//! Composes a memory section for an agent starting work in a worktree: the
//! global store's file tree, every pinned (`system/`) file under a character
//! budget, and top search results from the global and per-repo stores. The
//! section is delimited by sentinel comments and upserted idempotently, so
//! repeated injections replace rather than accumulate.

use std::path::Path;
use tracing::debug;

use crate::error::Result;
use crate::manager::{Manager, TreeEntry};
use crate::search::SearchOptions;

pub const MEMORY_START: &str = "<!-- hivemind-memory-start -->";
pub const MEMORY_END: &str = "<!-- hivemind-memory-end -->";

/// Total character budget for pinned file bodies.
const PINNED_BUDGET: usize = 4000;

/// Coarse query used against the global store.
const GLOBAL_QUERY: &str = "global setup preferences environment hardware OS";

/// One-line snippet cap in the rendered result lists.
const LINE_SNIPPET_CHARS: usize = 200;

/// Compose the memory section and upsert it into `<worktree>/CLAUDE.md`.
pub async fn inject_context(
    worktree: &Path,
    global: &Manager,
    repo: Option<&Manager>,
    count: usize,
) -> Result<()> {
    let tree = global.tree(None).await?;

    let pinned = read_pinned(global, &tree).await;

    let opts = SearchOptions {
        max_results: count,
        min_score: 0.0,
    };
    let global_results = global.search(GLOBAL_QUERY, &opts).await.unwrap_or_default();

    let repo_results = match repo {
        Some(repo_mgr) => {
            let basename = worktree
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let query = format!("project {} architecture decisions conventions", basename);
            repo_mgr.search(&query, &opts).await.unwrap_or_default()
        }
        None => Vec::new(),
    };

    let section = compose_section(&tree, &pinned, &global_results, &repo_results);
    upsert_block(&worktree.join("CLAUDE.md"), &section)?;
    debug!(worktree = %worktree.display(), "context injected");
    Ok(())
}

/// Read pinned file bodies, skipping any file that would push the total
/// over the budget.
async fn read_pinned(global: &Manager, tree: &[TreeEntry]) -> Vec<(String, String)> {
    let mut pinned = Vec::new();
    let mut used = 0usize;

    for entry in tree.iter().filter(|e| e.is_system) {
        let Ok(body) = global.read(&entry.path, None).await else {
            continue;
        };
        if used + body.len() > PINNED_BUDGET {
            continue;
        }
        used += body.len();
        pinned.push((entry.path.clone(), body));
    }

    pinned
}

fn compose_section(
    tree: &[TreeEntry],
    pinned: &[(String, String)],
    global_results: &[crate::search::SearchResult],
    repo_results: &[crate::search::SearchResult],
) -> String {
    let mut out = String::new();
    out.push_str(MEMORY_START);
    out.push_str("\n## Hivemind Memory\n\n");

    out.push_str("### Rules\n");
    out.push_str(
        "- Consult memory before asking the user to repeat themselves.\n\
         - Record durable facts as you learn them; keep entries short and factual.\n\
         - Daily working notes go to dated files; lasting knowledge goes to named files.\n\
         - Never edit files under `system/` without being asked to.\n\n",
    );

    out.push_str("### Tools\n");
    out.push_str(
        "Memory is served over MCP: `memory_search` to look things up, \
         `memory_read`/`memory_get` to fetch files, `memory_write`/`memory_append` \
         to record, `memory_pin` to keep a file always in context. Paths are \
         store-relative markdown files.\n\n",
    );

    out.push_str("### Files\n```\n");
    out.push_str(&render_tree(tree));
    out.push_str("```\n\n");

    if !pinned.is_empty() {
        out.push_str("### Pinned\n");
        for (path, body) in pinned {
            out.push_str(&format!("#### {}\n{}\n", path, body.trim_end()));
            out.push('\n');
        }
    }

    out.push_str("### Global memory\n");
    out.push_str(&render_results(global_results));
    out.push('\n');

    out.push_str("### Project memory\n");
    out.push_str(&render_results(repo_results));

    out.push('\n');
    out.push_str(MEMORY_END);
    out.push('\n');
    out
}

/// Compact ASCII listing of the store tree, grouped by directory.
fn render_tree(tree: &[TreeEntry]) -> String {
    if tree.is_empty() {
        return "(empty store)\n".to_string();
    }

    let mut out = String::new();
    let mut last_dir = "";

    for entry in tree {
        let (dir, name) = match entry.path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", entry.path.as_str()),
        };

        if dir != last_dir {
            out.push_str(&format!("{}/\n", dir));
            last_dir = dir;
        }

        let indent = if dir.is_empty() { "" } else { "  " };
        match &entry.description {
            Some(d) => out.push_str(&format!("{}{} - {}\n", indent, name, d)),
            None => out.push_str(&format!("{}{}\n", indent, name)),
        }
    }

    out
}

fn render_results(results: &[crate::search::SearchResult]) -> String {
    if results.is_empty() {
        return "(no memory yet)\n".to_string();
    }

    let mut out = String::new();
    for r in results {
        let snippet: String = r
            .snippet
            .replace('\n', " ")
            .chars()
            .take(LINE_SNIPPET_CHARS)
            .collect();
        out.push_str(&format!("[{} L{}] {}\n", r.path, r.start_line, snippet));
    }
    out
}

/// Replace the sentinel-delimited span in `target`, or append the section
/// with a separating blank line. The write is atomic (temp file + rename).
fn upsert_block(target: &Path, section: &str) -> Result<()> {
    let existing = if target.exists() {
        std::fs::read_to_string(target)?
    } else {
        String::new()
    };

    let updated = match (existing.find(MEMORY_START), existing.find(MEMORY_END)) {
        (Some(start), Some(end_idx)) if end_idx >= start => {
            let mut end = end_idx + MEMORY_END.len();
            // Swallow the trailing newline of the old block.
            if existing[end..].starts_with('\n') {
                end += 1;
            }
            format!("{}{}{}", &existing[..start], section, &existing[end..])
        }
        _ => {
            if existing.is_empty() {
                section.to_string()
            } else {
                let mut updated = existing;
                if !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push('\n');
                updated.push_str(section);
                updated
            }
        }
    };

    write_atomic(target, &updated)
}

fn write_atomic(target: &Path, content: &str) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "CLAUDE.md".to_string()),
        std::process::id()
    ));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, target)?;
    Ok(())
}
