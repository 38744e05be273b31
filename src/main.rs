//! `hivemind`: CLI host for the memory stores.
//!
//! Most callers are MCP clients attached via `hivemind serve`; the remaining
//! subcommands are thin Manager wrappers for scripting and smoke-testing a
//! store from a shell.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use hivemind_memory::config::{self, Config};
use hivemind_memory::git::MergeStrategy;
use hivemind_memory::inject;
use hivemind_memory::mcp;
use hivemind_memory::scope::{Scope, StoreRegistry};
use hivemind_memory::search::SearchOptions;
use hivemind_memory::watcher::Watcher;

#[derive(Parser)]
#[command(
    name = "hivemind",
    about = "Hivemind Memory: git-backed, searchable memory for agent fleets",
    version
)]
struct Cli {
    /// Path to configuration file (default: ~/.hivemind/hivemind.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the MCP tool surface over stdio (or HTTP with --http)
    Serve {
        /// Bind address for streamable HTTP instead of stdio
        #[arg(long)]
        http: Option<String>,

        /// Disable the filesystem watcher
        #[arg(long)]
        no_watch: bool,
    },

    /// Compose the memory block into a worktree's CLAUDE.md
    Inject {
        /// Worktree directory (default: HIVEMIND_REPO_PATH or cwd)
        #[arg(long)]
        worktree: Option<PathBuf>,

        /// Search results per store
        #[arg(long, default_value_t = 5)]
        count: usize,
    },

    /// Record memory content
    Write {
        /// Markdown content
        content: String,

        /// Target file (default: today's dated note)
        #[arg(long)]
        file: Option<String>,

        /// Scope: global, repo, or unset for automatic routing
        #[arg(long, default_value = "")]
        scope: String,

        /// Commit message override
        #[arg(long)]
        message: Option<String>,

        /// Branch to write on
        #[arg(long)]
        branch: Option<String>,
    },

    /// Print a memory file's body
    Read {
        path: String,

        /// Git ref to read at
        #[arg(long = "ref")]
        at: Option<String>,
    },

    /// List files across stores
    List,

    /// Search memory
    Search {
        query: String,

        /// Maximum results
        #[arg(long, default_value_t = 8)]
        limit: usize,
    },

    /// Show commit history
    History {
        /// Restrict to one path
        #[arg(long)]
        path: Option<String>,

        #[arg(long, default_value_t = 20)]
        count: usize,
    },

    /// Reindex one path in the resolved store
    Sync { path: String },

    /// Pin a file under system/ so it is always injected into context
    Pin { path: String },

    /// Move a pinned file back out of system/
    Unpin { path: String },

    /// Delete a memory file
    Delete { path: String },

    /// Branch management for a store
    Branch {
        #[command(subcommand)]
        action: BranchAction,

        /// Scope: global, repo, or unset for automatic routing
        #[arg(long, default_value = "", global = true)]
        scope: String,
    },

    /// Unified diff between two refs
    Diff {
        base_ref: String,
        head_ref: String,

        /// Restrict to one path
        #[arg(long)]
        path: Option<String>,

        /// Scope: global, repo, or unset
        #[arg(long, default_value = "")]
        scope: String,
    },
}

#[derive(Subcommand)]
enum BranchAction {
    /// List current, default, and all branches
    List,

    /// Create a branch
    Create {
        name: String,

        /// Ref to branch from (HEAD when unset)
        #[arg(long)]
        from: Option<String>,
    },

    /// Delete a branch
    Delete {
        name: String,

        #[arg(long)]
        force: bool,
    },

    /// Merge a branch into the target (default branch when unset)
    Merge {
        source: String,

        #[arg(long)]
        target: Option<String>,

        /// Strategy: ff-only (default) or no-ff
        #[arg(long, default_value = "ff-only")]
        strategy: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // MCP stdio transport owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let base = config::base_dir();
    let worktree = config::repo_path();
    let registry = Arc::new(StoreRegistry::open(&base, worktree.as_deref(), &config).await?);

    match cli.command {
        Commands::Serve { http, no_watch } => {
            if let Some(instance) = config::instance_id() {
                tracing::info!(instance = %instance, tier = config::tier(), "serving memory stores");
            }

            let mut watchers = Vec::new();
            if config.watcher.enabled && !no_watch {
                let debounce = std::time::Duration::from_millis(config.watcher.debounce_ms);
                watchers.push(Watcher::start(registry.global.clone(), debounce)?);
                if let Some(repo) = &registry.repo {
                    watchers.push(Watcher::start(repo.manager.clone(), debounce)?);
                }
            }

            let served = match http {
                Some(bind) => mcp::run_http(registry.clone(), &bind).await,
                None => mcp::run_stdio(registry.clone()).await,
            };

            for watcher in watchers {
                watcher.stop().await;
            }
            served?;
        }

        Commands::Inject { worktree: wt, count } => {
            let worktree = wt
                .or_else(config::repo_path)
                .unwrap_or(std::env::current_dir()?);
            let repo_mgr = registry.repo.as_ref().map(|r| r.manager.as_ref());
            inject::inject_context(&worktree, &registry.global, repo_mgr, count).await?;
            println!("injected memory block into {}", worktree.join("CLAUDE.md").display());
        }

        Commands::Write {
            content,
            file,
            scope,
            message,
            branch,
        } => {
            let scope = Scope::parse(&scope)?;
            let resolved = registry.resolve(scope, file.as_deref().unwrap_or(""));
            let file_arg = (!resolved.path.is_empty()).then_some(resolved.path.as_str());
            let path = resolved
                .manager
                .write_with_message_on_branch(
                    &content,
                    file_arg,
                    message.as_deref(),
                    branch.as_deref(),
                )
                .await?;
            println!("wrote {}:{}", resolved.label, path);
        }

        Commands::Read { path, at } => {
            let mut last_err: Option<hivemind_memory::Error> = None;
            let mut printed = false;
            for candidate in registry.read_candidates(Scope::Auto, &path) {
                match candidate.manager.read(&candidate.path, at.as_deref()).await {
                    Ok(body) => {
                        print!("{}", body);
                        printed = true;
                        break;
                    }
                    Err(e) if e.is_fallback_eligible() => last_err = Some(e),
                    Err(e) => return Err(e.into()),
                }
            }
            if !printed {
                if let Some(e) = last_err {
                    return Err(e.into());
                }
            }
        }

        Commands::List => {
            for (label, manager) in registry.all_stores() {
                for entry in manager.list(None).await? {
                    println!("{}\t{}\t{}", label, entry.size, entry.path);
                }
            }
        }

        Commands::Search { query, limit } => {
            let opts = SearchOptions {
                max_results: limit,
                min_score: config.retrieval.min_score,
            };
            let mut results = Vec::new();
            for (_, manager) in registry.all_stores() {
                results.extend(manager.search(&query, &opts).await?);
            }
            results.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            results.truncate(limit);

            if results.is_empty() {
                println!("No results.");
            }
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} L{}-{}",
                    i + 1,
                    r.score,
                    r.path,
                    r.start_line,
                    r.end_line
                );
                println!("    {}", r.snippet.replace('\n', " ").trim());
            }
        }

        Commands::History { path, count } => {
            for (label, manager) in registry.all_stores() {
                let entries = manager.history(path.as_deref(), count).await?;
                for e in entries {
                    println!(
                        "{}\t{}\t{}\t{}",
                        label,
                        &e.sha[..e.sha.len().min(10)],
                        e.date,
                        e.message
                    );
                }
            }
        }

        Commands::Sync { path } => {
            let resolved = registry.resolve(Scope::Auto, &path);
            resolved.manager.sync(&resolved.path).await?;
            println!("synced {}:{}", resolved.label, resolved.path);
        }

        Commands::Pin { path } => {
            let resolved = registry.resolve(Scope::Auto, &path);
            let pinned = resolved.manager.pin(&resolved.path, None).await?;
            println!("pinned as {}", pinned);
        }

        Commands::Unpin { path } => {
            let resolved = registry.resolve(Scope::Auto, &path);
            let unpinned = resolved.manager.unpin(&resolved.path, None).await?;
            println!("unpinned as {}", unpinned);
        }

        Commands::Delete { path } => {
            let resolved = registry.resolve(Scope::Auto, &path);
            resolved.manager.delete(&resolved.path).await?;
            println!("deleted {}:{}", resolved.label, resolved.path);
        }

        Commands::Branch { action, scope } => {
            let scope = Scope::parse(&scope)?;
            let resolved = registry.store_for_scope(scope);
            match action {
                BranchAction::List => {
                    let info = resolved.manager.branch_info()?;
                    println!("current: {}", info.current);
                    println!("default: {}", info.default);
                    for branch in info.branches {
                        println!("  {}", branch);
                    }
                }
                BranchAction::Create { name, from } => {
                    resolved.manager.create_branch(&name, from.as_deref()).await?;
                    println!("created branch {} in {}", name, resolved.label);
                }
                BranchAction::Delete { name, force } => {
                    resolved.manager.delete_branch(&name, force).await?;
                    println!("deleted branch {}", name);
                }
                BranchAction::Merge {
                    source,
                    target,
                    strategy,
                } => {
                    let strategy = MergeStrategy::parse(&strategy)?;
                    let changed = resolved
                        .manager
                        .merge_branch(&source, target.as_deref(), strategy)
                        .await?;
                    println!("merged {} ({} files changed)", source, changed.len());
                    for file in changed {
                        println!("  {}", file);
                    }
                }
            }
        }

        Commands::Diff {
            base_ref,
            head_ref,
            path,
            scope,
        } => {
            let scope = Scope::parse(&scope)?;
            let resolved = registry.store_for_scope(scope);
            let diff = resolved
                .manager
                .diff_refs(&base_ref, &head_ref, path.as_deref())?;
            if diff.is_empty() {
                println!("(no differences)");
            } else {
                print!("{}", diff);
            }
        }
    }

    Ok(())
}
