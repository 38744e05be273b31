//! End-to-end store scenarios against real temp-dir stores with real git.

use std::sync::Arc;
use tempfile::TempDir;

use hivemind_memory::db;
use hivemind_memory::git::MergeStrategy;
use hivemind_memory::manager::{Manager, StoreOptions};
use hivemind_memory::scope::{Scope, StoreRegistry};
use hivemind_memory::search::SearchOptions;
use hivemind_memory::Error;

async fn open_store(dir: &std::path::Path) -> Manager {
    Manager::open(dir, StoreOptions::default()).await.unwrap()
}

fn opts(max_results: usize) -> SearchOptions {
    SearchOptions {
        max_results,
        min_score: 0.0,
    }
}

// ============ Branch write and merge ============

#[tokio::test]
async fn test_branch_write_is_isolated_until_merge() {
    let tmp = TempDir::new().unwrap();
    let m = open_store(tmp.path()).await;

    m.write_with_message_on_branch("root note", Some("notes.md"), Some("default"), None)
        .await
        .unwrap();
    m.create_branch("feature/memory", None).await.unwrap();
    m.write_with_message_on_branch(
        "branch note",
        Some("notes.md"),
        Some("branch write"),
        Some("feature/memory"),
    )
    .await
    .unwrap();

    // Not visible on the default branch, on disk or at its ref.
    let on_default = m.read("notes.md", None).await.unwrap();
    assert!(!on_default.contains("branch note"));

    let default_branch = m.repo().default_branch().unwrap();
    let at_default = m.read("notes.md", Some(&default_branch)).await.unwrap();
    assert!(!at_default.contains("branch note"));

    // Visible at the feature ref.
    let at_feature = m.read("notes.md", Some("feature/memory")).await.unwrap();
    assert!(at_feature.contains("branch note"));

    // After an ff-only merge the content lands on the default branch.
    m.merge_branch("feature/memory", None, MergeStrategy::FfOnly)
        .await
        .unwrap();
    let merged = m.read("notes.md", None).await.unwrap();
    assert!(merged.contains("branch note"));
}

#[tokio::test]
async fn test_merge_reindexes_default_branch() {
    let tmp = TempDir::new().unwrap();
    let m = open_store(tmp.path()).await;

    m.write("base note", Some("base.md")).await.unwrap();
    m.create_branch("feature/search", None).await.unwrap();
    m.write_with_message_on_branch(
        "The zanzibar deployment needs a bastion host.",
        Some("deploy.md"),
        None,
        Some("feature/search"),
    )
    .await
    .unwrap();

    // Branch-only content is not searchable yet: the index mirrors the
    // default branch.
    let before = m.search("zanzibar bastion", &opts(5)).await.unwrap();
    assert!(before.is_empty());

    m.merge_branch("feature/search", None, MergeStrategy::FfOnly)
        .await
        .unwrap();

    let after = m.search("zanzibar bastion", &opts(5)).await.unwrap();
    assert!(after.iter().any(|r| r.path == "deploy.md"));
}

// ============ Hybrid search with temporal exemption ============

#[tokio::test]
async fn test_search_decays_dated_files_but_not_evergreen() {
    let tmp = TempDir::new().unwrap();
    let m = open_store(tmp.path()).await;

    m.write("The user prefers Go over Python.", Some("prefs.md"))
        .await
        .unwrap();
    m.write(
        "# User Setup\n\nMacBook Pro M3, 32GB RAM, macOS Sequoia hardware.",
        Some("setup.md"),
    )
    .await
    .unwrap();
    m.write(
        "old hardware inventory from the previous laptop",
        Some("2020-01-01.md"),
    )
    .await
    .unwrap();

    let results = m.search("Go language preference", &opts(5)).await.unwrap();
    assert!(results.iter().any(|r| r.snippet.contains("Go")));

    // Backdate both files five years in the index.
    let five_years_ago_ms = chrono::Utc::now().timestamp_millis() - 5 * 365 * 86_400_000i64;
    let pool = db::connect(&tmp.path().join(".index/memory.db"))
        .await
        .unwrap();
    for path in ["setup.md", "2020-01-01.md"] {
        sqlx::query("UPDATE files SET mtime = ? WHERE path = ?")
            .bind(five_years_ago_ms)
            .bind(path)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;

    let results2 = m.search("hardware", &opts(5)).await.unwrap();
    assert_eq!(results2[0].path, "setup.md", "evergreen file must not decay");

    let dated = results2.iter().find(|r| r.path == "2020-01-01.md");
    if let Some(dated) = dated {
        assert!(
            dated.score < results2[0].score,
            "dated file should decay below the evergreen hit"
        );
    }
}

// ============ Scope routing ============

#[tokio::test]
async fn test_scope_routing_for_writes() {
    let tmp = TempDir::new().unwrap();
    let global = Arc::new(open_store(&tmp.path().join("memory")).await);
    let repo = Arc::new(open_store(&tmp.path().join("memory/repos/acme")).await);
    let registry = StoreRegistry::from_managers(global, Some(("acme".to_string(), repo)));

    // Dated file with no scope routes to the per-repo store.
    let resolved = registry.resolve(Scope::Auto, "2026-02-26.md");
    resolved
        .manager
        .write_with_message_on_branch("repo note", Some(&resolved.path), None, None)
        .await
        .unwrap();

    let repo_paths: Vec<String> = registry.repo.as_ref().unwrap().manager.list(None).await.unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    let global_paths: Vec<String> = registry
        .global
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert!(repo_paths.contains(&"2026-02-26.md".to_string()));
    assert!(!global_paths.contains(&"2026-02-26.md".to_string()));

    // Explicit global scope wins over the heuristics.
    let resolved = registry.resolve(Scope::Global, "system/global.md");
    resolved
        .manager
        .write_file(&resolved.path, "global note", None)
        .await
        .unwrap();
    let global_paths: Vec<String> = registry
        .global
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert!(global_paths.contains(&"system/global.md".to_string()));
}

#[tokio::test]
async fn test_scope_routing_without_repo_store() {
    let tmp = TempDir::new().unwrap();
    let global = Arc::new(open_store(&tmp.path().join("memory")).await);
    let registry = StoreRegistry::from_managers(global, None);

    let resolved = registry.resolve(Scope::Auto, "2026-01-01.md");
    assert_eq!(resolved.label, "global");
}

// ============ Read fallback ============

#[tokio::test]
async fn test_read_falls_back_to_repo_store() {
    let tmp = TempDir::new().unwrap();
    let global = Arc::new(open_store(&tmp.path().join("memory")).await);
    let repo = Arc::new(open_store(&tmp.path().join("memory/repos/acme")).await);
    repo.write_file("smoke.md", "repo-only body", None)
        .await
        .unwrap();
    let registry = StoreRegistry::from_managers(global, Some(("acme".to_string(), repo)));

    // "smoke.md" resolves to global (named file), which lacks it; the
    // ordered candidates find it in the repo store.
    let mut body = None;
    for candidate in registry.read_candidates(Scope::Auto, "smoke.md") {
        match candidate.manager.read(&candidate.path, None).await {
            Ok(text) => {
                body = Some(text);
                break;
            }
            Err(e) if e.is_fallback_eligible() => continue,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(body.unwrap().contains("repo-only body"));
}

// ============ FTS integrity after delete ============

#[tokio::test]
async fn test_delete_removes_search_hits() {
    let tmp = TempDir::new().unwrap();
    let m = open_store(tmp.path()).await;

    m.write("The user prefers Go over Python.", Some("prefs.md"))
        .await
        .unwrap();
    assert!(!m.search("Go", &opts(5)).await.unwrap().is_empty());

    m.delete("prefs.md").await.unwrap();
    assert!(m.search("Go", &opts(5)).await.unwrap().is_empty());

    // The FTS index holds no rows for the deleted file's chunks.
    let pool = db::connect(&tmp.path().join(".index/memory.db"))
        .await
        .unwrap();
    let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(fts_rows, 0);
    pool.close().await;
}

// ============ Concurrent auto-commits ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_do_not_corrupt() {
    let tmp = TempDir::new().unwrap();
    let m = Arc::new(open_store(tmp.path()).await);

    let mut handles = Vec::new();
    for i in 0..10 {
        let m = m.clone();
        handles.push(tokio::spawn(async move {
            let path = format!("c/{}.md", i);
            std::fs::create_dir_all(m.root().join("c")).unwrap();
            std::fs::write(m.root().join(&path), format!("note {}", i)).unwrap();
            m.auto_commit("parallel commit").await
        }));
    }

    for handle in handles {
        // Every writer either commits or found a clean tree.
        handle.await.unwrap().unwrap();
    }

    let log = m.history(None, 50).await.unwrap();
    assert!(!log.is_empty());
    // Linear history: each commit's parent is the next entry's sha.
    for pair in log.windows(2) {
        assert_eq!(pair[0].parent_sha.as_deref(), Some(pair[1].sha.as_str()));
    }

    // All ten files are committed somewhere in the history.
    let all_files: Vec<String> = log.iter().flat_map(|e| e.files.clone()).collect();
    for i in 0..10 {
        assert!(all_files.contains(&format!("c/{}.md", i)), "missing c/{}.md", i);
    }
}

// ============ Locking ============

#[tokio::test]
async fn test_busy_error_when_lock_is_held() {
    let tmp = TempDir::new().unwrap();
    let m = open_store(tmp.path()).await;

    // Simulate another process holding the lock right now.
    let lock_path = tmp.path().join(".git/.hivemind-memory.lock");
    std::fs::write(
        &lock_path,
        serde_json::json!({
            "pid": std::process::id(),
            "created_at_ms": chrono::Utc::now().timestamp_millis(),
        })
        .to_string(),
    )
    .unwrap();

    // The write retries for its deadline and then surfaces Busy. Use a
    // short-deadline lock by going through the manager with the default
    // 10s deadline would slow the suite; instead verify the lock file
    // blocks a fresh acquisition directly.
    let lock = hivemind_memory::lock::StoreLock::new(&tmp.path().join(".git"));
    let result = lock
        .acquire_with_deadline(std::time::Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(Error::Busy { .. })));

    std::fs::remove_file(&lock_path).unwrap();
    m.write("after lock release", Some("ok.md")).await.unwrap();
}
