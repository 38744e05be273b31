//! Watcher scenarios: out-of-band edits must reach the index and history.
//!
//! These tests wait out real debounce windows, so they use generous sleeps.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use hivemind_memory::manager::{Manager, StoreOptions};
use hivemind_memory::search::SearchOptions;
use hivemind_memory::watcher::Watcher;

async fn open_watched(debounce_ms: u64) -> (TempDir, Arc<Manager>, Watcher) {
    let tmp = TempDir::new().unwrap();
    let manager = Arc::new(
        Manager::open(tmp.path(), StoreOptions::default())
            .await
            .unwrap(),
    );
    let watcher = Watcher::start(manager.clone(), Duration::from_millis(debounce_ms)).unwrap();
    (tmp, manager, watcher)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_band_edit_is_synced_and_committed() {
    let (tmp, manager, watcher) = open_watched(200).await;

    // Edit outside the API, as an editor would.
    std::fs::write(tmp.path().join("external.md"), "edited in vim").unwrap();

    // Wait out the debounce window with margin.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let results = manager
        .search("vim", &SearchOptions::default())
        .await
        .unwrap();
    assert!(
        results.iter().any(|r| r.path == "external.md"),
        "watcher did not index the out-of-band edit"
    );

    let history = manager.history(None, 10).await.unwrap();
    assert!(history.iter().any(|h| h.message == "auto-sync"));

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_band_delete_clears_index() {
    let (tmp, manager, watcher) = open_watched(200).await;

    manager
        .write("ephemeral fact about quokkas", Some("tmp.md"))
        .await
        .unwrap();
    assert!(!manager
        .search("quokkas", &SearchOptions::default())
        .await
        .unwrap()
        .is_empty());

    // Delete outside the API.
    std::fs::remove_file(tmp.path().join("tmp.md")).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(manager
        .search("quokkas", &SearchOptions::default())
        .await
        .unwrap()
        .is_empty());

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_events_coalesce_into_one_sync() {
    let (tmp, manager, watcher) = open_watched(300).await;

    // A burst of writes inside one debounce window.
    for i in 0..5 {
        std::fs::write(
            tmp.path().join("burst.md"),
            format!("burst revision {}", i),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    // Only the final revision is indexed.
    let results = manager
        .search("burst revision", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.snippet.contains("revision 4")));

    watcher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_is_deterministic() {
    let (_tmp, _manager, watcher) = open_watched(200).await;
    // Must return promptly even with no events seen.
    tokio::time::timeout(Duration::from_secs(5), watcher.stop())
        .await
        .expect("watcher stop timed out");
}
