//! Index database schema.
//!
//! Applied idempotently every time a store is opened. The full-text table is
//! an FTS5 *external content* index over `chunks`: it stores no text of its
//! own, so every chunk mutation must be mirrored with an FTS insert or a
//! delete sentinel (see `Manager::sync`).

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            mtime INTEGER NOT NULL,
            content_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table creation is not idempotent natively, check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                text,
                content='chunks',
                content_rowid='id'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks_vec (
            chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Keyed by chunk text hash; deliberately not foreign-keyed so cached
    // embeddings survive file deletions.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            text_hash TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            created INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_id ON chunks(file_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join(".index/memory.db"))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name IN \
             ('files','chunks','chunks_fts','chunks_vec','embedding_cache') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "chunks",
                "chunks_fts",
                "chunks_vec",
                "embedding_cache",
                "files"
            ]
        );
        pool.close().await;
    }

    #[tokio::test]
    async fn test_cascade_delete_chunks_with_file() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join(".index/memory.db"))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        sqlx::query("INSERT INTO files (path, mtime, content_hash) VALUES ('a.md', 0, 'h')")
            .execute(&pool)
            .await
            .unwrap();
        let file_id: i64 = sqlx::query_scalar("SELECT id FROM files WHERE path = 'a.md'")
            .fetch_one(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO chunks (file_id, start_line, end_line, text) VALUES (?, 1, 1, 't')")
            .bind(file_id)
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&pool)
            .await
            .unwrap();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
        pool.close().await;
    }
}
