//! Scope resolution: routing tool calls to the right store.
//!
//! Every request targets either the global store or the caller's per-repo
//! store. The [`StoreRegistry`] holds both (plus a read-only legacy store
//! during slug migration) and resolves requests by, in order:
//!
//! 1. an explicit `scope` argument (`global` / `repo`),
//! 2. a `repos/<slug>/…` path prefix,
//! 3. filename heuristics: dated (`YYYY-MM-DD.md`) or empty filenames go to
//!    the per-repo store when one exists; other named files go global.
//!
//! Reads on bare paths additionally get an ordered candidate list so a miss
//! in the resolved store falls back to the per-repo and legacy stores.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manager::{Manager, StoreOptions};
use crate::rerank::{CommandReranker, Reranker};
use crate::search;

/// Requested routing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Repo,
    Auto,
}

impl Scope {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(Scope::Global),
            "repo" => Ok(Scope::Repo),
            "" | "auto" => Ok(Scope::Auto),
            other => Err(Error::InvalidArgument(format!(
                "unknown scope '{}' (use global, repo, or leave unset)",
                other
            ))),
        }
    }
}

/// A store selected for one request, with the path rebased into it.
#[derive(Clone)]
pub struct ResolvedStore {
    /// `"global"`, `"repo"`, or `"legacy"`.
    pub label: &'static str,
    pub manager: Arc<Manager>,
    pub path: String,
}

/// The per-repo store and its migration leftovers.
pub struct RepoStore {
    pub slug: String,
    pub manager: Arc<Manager>,
    /// Old-naming-scheme store kept read-accessible until callers move on.
    pub legacy: Option<Arc<Manager>>,
}

/// All stores a host process serves, threaded explicitly into every tool
/// handler and the context injector.
pub struct StoreRegistry {
    pub global: Arc<Manager>,
    pub repo: Option<RepoStore>,
}

impl StoreRegistry {
    /// Open the global store under `base` and, when `worktree` names a
    /// source repository, its per-repo store (migrating legacy directories
    /// in place).
    pub async fn open(base: &Path, worktree: Option<&Path>, config: &Config) -> Result<Self> {
        let global_dir = base.join("memory");
        let global = Arc::new(Manager::open(&global_dir, store_options(config)).await?);

        let repo = match worktree {
            Some(worktree) => {
                let (canonical, legacy_dir) = resolve_repo_store_paths(&global_dir, worktree)?;
                let manager = Arc::new(Manager::open(&canonical, store_options(config)).await?);
                let legacy = match legacy_dir {
                    Some(dir) => {
                        Some(Arc::new(Manager::open(&dir, store_options(config)).await?))
                    }
                    None => None,
                };
                Some(RepoStore {
                    slug: repo_slug(worktree),
                    manager,
                    legacy,
                })
            }
            None => None,
        };

        Ok(Self { global, repo })
    }

    /// Build a registry from already-open managers (tests, embedding hosts).
    pub fn from_managers(global: Arc<Manager>, repo: Option<(String, Arc<Manager>)>) -> Self {
        Self {
            global,
            repo: repo.map(|(slug, manager)| RepoStore {
                slug,
                manager,
                legacy: None,
            }),
        }
    }

    /// Route one request to a single store (the write-side resolution).
    pub fn resolve(&self, scope: Scope, path: &str) -> ResolvedStore {
        match scope {
            Scope::Global => self.global_store(path),
            Scope::Repo => match &self.repo {
                Some(r) => ResolvedStore {
                    label: "repo",
                    manager: r.manager.clone(),
                    path: path.to_string(),
                },
                None => self.global_store(path),
            },
            Scope::Auto => self.resolve_auto(path),
        }
    }

    fn resolve_auto(&self, path: &str) -> ResolvedStore {
        // A `repos/<slug>/…` prefix addresses a per-repo store directly.
        if let Some(rest) = path.strip_prefix("repos/") {
            if let Some((slug, remainder)) = rest.split_once('/') {
                if let Some(r) = &self.repo {
                    if r.slug == slug {
                        return ResolvedStore {
                            label: "repo",
                            manager: r.manager.clone(),
                            path: remainder.to_string(),
                        };
                    }
                    if let Some(legacy) = &r.legacy {
                        if legacy_slug_matches(legacy.root(), slug) {
                            return ResolvedStore {
                                label: "legacy",
                                manager: legacy.clone(),
                                path: remainder.to_string(),
                            };
                        }
                    }
                }
            }
        }

        // Dated or unnamed files are working notes and belong to the repo
        // store when one exists; named files are global knowledge.
        let dated_or_empty = path.is_empty() || search::is_dated_filename(path);
        match (&self.repo, dated_or_empty) {
            (Some(r), true) => ResolvedStore {
                label: "repo",
                manager: r.manager.clone(),
                path: path.to_string(),
            },
            _ => self.global_store(path),
        }
    }

    fn global_store(&self, path: &str) -> ResolvedStore {
        ResolvedStore {
            label: "global",
            manager: self.global.clone(),
            path: path.to_string(),
        }
    }

    /// Ordered candidates for a read: the resolved store first, then the
    /// per-repo store, then any legacy store. Only bare paths (no explicit
    /// scope, no `repos/` prefix) fan out.
    pub fn read_candidates(&self, scope: Scope, path: &str) -> Vec<ResolvedStore> {
        let resolved = self.resolve(scope, path);

        if scope != Scope::Auto || path.starts_with("repos/") {
            return vec![resolved];
        }

        let mut candidates = vec![resolved];
        if let Some(r) = &self.repo {
            if !candidates.iter().any(|c| c.label == "repo") {
                candidates.push(ResolvedStore {
                    label: "repo",
                    manager: r.manager.clone(),
                    path: path.to_string(),
                });
            }
            if let Some(legacy) = &r.legacy {
                candidates.push(ResolvedStore {
                    label: "legacy",
                    manager: legacy.clone(),
                    path: path.to_string(),
                });
            }
        }
        candidates
    }

    /// Stores participating in merged reads (list, tree, search, history):
    /// global, per-repo, and the read-only legacy store.
    pub fn all_stores(&self) -> Vec<(&'static str, Arc<Manager>)> {
        let mut stores = vec![("global", self.global.clone())];
        if let Some(r) = &self.repo {
            stores.push(("repo", r.manager.clone()));
            if let Some(legacy) = &r.legacy {
                stores.push(("legacy", legacy.clone()));
            }
        }
        stores
    }

    /// The store an explicit scope names, for branch operations.
    pub fn store_for_scope(&self, scope: Scope) -> ResolvedStore {
        self.resolve(scope, "")
    }
}

/// Store options derived from configuration: embedding settings plus the
/// subprocess reranker when one is configured.
pub fn store_options(config: &Config) -> StoreOptions {
    let reranker: Option<Arc<dyn Reranker>> = config.reranker.command.as_ref().map(|command| {
        Arc::new(CommandReranker::new(
            command.clone(),
            config.reranker.args.clone(),
            config.reranker.timeout_secs,
        )) as Arc<dyn Reranker>
    });

    StoreOptions {
        embedding: config.embedding.clone(),
        reranker,
    }
}

/// Canonical slug for a worktree: lowercased basename with every
/// non-alphanumeric run collapsed to `-`.
pub fn repo_slug(worktree: &Path) -> String {
    let basename = worktree
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());

    let mut slug = String::with_capacity(basename.len());
    let mut last_dash = false;
    for c in basename.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "repo".to_string()
    } else {
        slug
    }
}

fn legacy_slug_matches(legacy_root: &Path, slug: &str) -> bool {
    legacy_root
        .file_name()
        .map(|n| n.to_string_lossy() == slug)
        .unwrap_or(false)
}

/// Locate (and migrate) the per-repo store directories for `worktree`.
///
/// Returns `(canonical_dir, legacy_dir)`. When only the legacy directory
/// (named after the raw worktree basename) exists, it is moved to the
/// canonical location and no legacy path is returned. When both exist, the
/// canonical one wins and the legacy one is retained as a read-only
/// fallback.
pub fn resolve_repo_store_paths(
    global_dir: &Path,
    worktree: &Path,
) -> Result<(PathBuf, Option<PathBuf>)> {
    let repos_dir = global_dir.join("repos");
    let canonical = repos_dir.join(repo_slug(worktree));

    let raw_basename = worktree
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let legacy = repos_dir.join(&raw_basename);

    if legacy == canonical || raw_basename.is_empty() {
        return Ok((canonical, None));
    }

    match (canonical.exists(), legacy.exists()) {
        (false, true) => {
            std::fs::create_dir_all(&repos_dir)?;
            std::fs::rename(&legacy, &canonical)?;
            info!(
                from = %legacy.display(),
                to = %canonical.display(),
                "migrated legacy repo store"
            );
            Ok((canonical, None))
        }
        (true, true) => Ok((canonical, Some(legacy))),
        _ => Ok((canonical, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry_with_repo() -> (TempDir, StoreRegistry) {
        let tmp = TempDir::new().unwrap();
        let global = Arc::new(
            Manager::open(tmp.path().join("memory"), StoreOptions::default())
                .await
                .unwrap(),
        );
        let repo = Arc::new(
            Manager::open(
                tmp.path().join("memory/repos/acme-api"),
                StoreOptions::default(),
            )
            .await
            .unwrap(),
        );
        let registry =
            StoreRegistry::from_managers(global, Some(("acme-api".to_string(), repo)));
        (tmp, registry)
    }

    #[test]
    fn test_repo_slug() {
        assert_eq!(repo_slug(Path::new("/home/u/src/Acme API")), "acme-api");
        assert_eq!(repo_slug(Path::new("/x/my_repo")), "my-repo");
        assert_eq!(repo_slug(Path::new("/x/simple")), "simple");
    }

    #[tokio::test]
    async fn test_explicit_scopes() {
        let (_tmp, registry) = registry_with_repo().await;

        assert_eq!(registry.resolve(Scope::Global, "a.md").label, "global");
        assert_eq!(registry.resolve(Scope::Repo, "a.md").label, "repo");
    }

    #[tokio::test]
    async fn test_repo_scope_falls_back_to_global_without_repo() {
        let tmp = TempDir::new().unwrap();
        let global = Arc::new(
            Manager::open(tmp.path().join("memory"), StoreOptions::default())
                .await
                .unwrap(),
        );
        let registry = StoreRegistry::from_managers(global, None);
        assert_eq!(registry.resolve(Scope::Repo, "a.md").label, "global");
    }

    #[tokio::test]
    async fn test_auto_routes_dated_to_repo_and_named_to_global() {
        let (_tmp, registry) = registry_with_repo().await;

        let dated = registry.resolve(Scope::Auto, "2026-02-26.md");
        assert_eq!(dated.label, "repo");

        let empty = registry.resolve(Scope::Auto, "");
        assert_eq!(empty.label, "repo");

        let named = registry.resolve(Scope::Auto, "prefs.md");
        assert_eq!(named.label, "global");
    }

    #[tokio::test]
    async fn test_repos_prefix_rebases_path() {
        let (_tmp, registry) = registry_with_repo().await;

        let resolved = registry.resolve(Scope::Auto, "repos/acme-api/notes.md");
        assert_eq!(resolved.label, "repo");
        assert_eq!(resolved.path, "notes.md");

        // Unknown slug falls through to the global store with the full path.
        let other = registry.resolve(Scope::Auto, "repos/unknown/notes.md");
        assert_eq!(other.label, "global");
        assert_eq!(other.path, "repos/unknown/notes.md");
    }

    #[tokio::test]
    async fn test_read_candidates_fan_out_on_bare_paths() {
        let (_tmp, registry) = registry_with_repo().await;

        let candidates = registry.read_candidates(Scope::Auto, "smoke.md");
        let labels: Vec<&str> = candidates.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec!["global", "repo"]);

        let explicit = registry.read_candidates(Scope::Global, "smoke.md");
        assert_eq!(explicit.len(), 1);

        let prefixed = registry.read_candidates(Scope::Auto, "repos/acme-api/a.md");
        assert_eq!(prefixed.len(), 1);
    }

    #[test]
    fn test_legacy_migration_moves_directory() {
        let tmp = TempDir::new().unwrap();
        let global_dir = tmp.path().join("memory");
        let worktree = tmp.path().join("src/Acme API");
        std::fs::create_dir_all(&worktree).unwrap();

        // Legacy store under the raw basename.
        let legacy_dir = global_dir.join("repos/Acme API");
        std::fs::create_dir_all(&legacy_dir).unwrap();
        std::fs::write(legacy_dir.join("old.md"), "legacy note").unwrap();

        let (canonical, legacy) = resolve_repo_store_paths(&global_dir, &worktree).unwrap();
        assert_eq!(canonical, global_dir.join("repos/acme-api"));
        assert!(legacy.is_none());
        assert!(canonical.join("old.md").exists());
        assert!(!legacy_dir.exists());
    }

    #[test]
    fn test_legacy_retained_when_both_exist() {
        let tmp = TempDir::new().unwrap();
        let global_dir = tmp.path().join("memory");
        let worktree = tmp.path().join("src/Acme API");
        std::fs::create_dir_all(&worktree).unwrap();

        let legacy_dir = global_dir.join("repos/Acme API");
        let canonical_dir = global_dir.join("repos/acme-api");
        std::fs::create_dir_all(&legacy_dir).unwrap();
        std::fs::create_dir_all(&canonical_dir).unwrap();

        let (canonical, legacy) = resolve_repo_store_paths(&global_dir, &worktree).unwrap();
        assert_eq!(canonical, canonical_dir);
        assert_eq!(legacy, Some(legacy_dir));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(Scope::parse("global").unwrap(), Scope::Global);
        assert_eq!(Scope::parse("repo").unwrap(), Scope::Repo);
        assert_eq!(Scope::parse("").unwrap(), Scope::Auto);
        assert!(Scope::parse("solar").is_err());
    }
}
