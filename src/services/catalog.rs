//! File entries: the per-owner rows that reference shared blob objects.

use super::{StoreError, StoreResult};
use crate::models::{FileEntry, NewFileEntry};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Where the engine records user-visible files. Folder trees and renames
/// belong to the caller; the engine creates, lists and removes entries.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    async fn create_entry(&self, entry: NewFileEntry) -> StoreResult<FileEntry>;

    /// Delete an entry owned by `owner_id` and return it.
    async fn delete_entry(&self, owner_id: Uuid, entry_id: Uuid) -> StoreResult<FileEntry>;

    /// Entries directly under `parent_id` (`None` is the root), oldest first.
    async fn list_entries(&self, owner_id: Uuid, parent_id: Option<Uuid>)
    -> StoreResult<Vec<FileEntry>>;
}

#[derive(Clone)]
pub struct SqlCatalog {
    db: SqlitePool,
}

impl SqlCatalog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FileCatalog for SqlCatalog {
    async fn create_entry(&self, entry: NewFileEntry) -> StoreResult<FileEntry> {
        let name = entry.name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("file name must not be empty".into()));
        }

        let row = sqlx::query_as::<_, FileEntry>(
            "INSERT INTO file_entries (id, owner_id, parent_id, name, object_id, size_bytes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id, owner_id, parent_id, name, object_id, size_bytes, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(entry.owner_id)
        .bind(entry.parent_id)
        .bind(name)
        .bind(entry.object_id)
        .bind(entry.size_bytes)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await?;
        Ok(row)
    }

    async fn delete_entry(&self, owner_id: Uuid, entry_id: Uuid) -> StoreResult<FileEntry> {
        sqlx::query_as::<_, FileEntry>(
            "DELETE FROM file_entries WHERE id = ? AND owner_id = ?
             RETURNING id, owner_id, parent_id, name, object_id, size_bytes, created_at",
        )
        .bind(entry_id)
        .bind(owner_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("file entry {entry_id}")))
    }

    async fn list_entries(
        &self,
        owner_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Vec<FileEntry>> {
        let rows = sqlx::query_as::<_, FileEntry>(
            "SELECT id, owner_id, parent_id, name, object_id, size_bytes, created_at
             FROM file_entries WHERE owner_id = ? AND parent_id IS ?
             ORDER BY created_at, rowid",
        )
        .bind(owner_id)
        .bind(parent_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn entries_for_object(pool: &SqlitePool, object_id: Uuid) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM file_entries WHERE object_id = ?")
            .bind(object_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_delete_respects_owner() {
        let pool = db::connect_in_memory().await.unwrap();
        let catalog = SqlCatalog::new(pool.clone());
        let owner = Uuid::new_v4();
        let object_id = Uuid::new_v4();

        let entry = catalog
            .create_entry(NewFileEntry {
                owner_id: owner,
                parent_id: None,
                name: " report.pdf ".into(),
                object_id,
                size_bytes: 10,
            })
            .await
            .unwrap();
        assert_eq!(entry.name, "report.pdf");
        assert_eq!(entries_for_object(&pool, object_id).await, 1);

        let err = catalog
            .delete_entry(Uuid::new_v4(), entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let deleted = catalog.delete_entry(owner, entry.id).await.unwrap();
        assert_eq!(deleted, entry);
        assert_eq!(entries_for_object(&pool, object_id).await, 0);
    }

    #[tokio::test]
    async fn listing_is_scoped_to_owner_and_folder() {
        let pool = db::connect_in_memory().await.unwrap();
        let catalog = SqlCatalog::new(pool);
        let owner = Uuid::new_v4();
        let folder = Uuid::new_v4();
        let entry = |owner_id, parent_id, name: &str| NewFileEntry {
            owner_id,
            parent_id,
            name: name.into(),
            object_id: Uuid::new_v4(),
            size_bytes: 1,
        };

        catalog.create_entry(entry(owner, None, "a.txt")).await.unwrap();
        catalog.create_entry(entry(owner, None, "b.txt")).await.unwrap();
        catalog.create_entry(entry(owner, Some(folder), "nested.txt")).await.unwrap();
        catalog.create_entry(entry(Uuid::new_v4(), None, "other.txt")).await.unwrap();

        let root: Vec<String> = catalog
            .list_entries(owner, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(root, vec!["a.txt", "b.txt"]);
        let nested = catalog.list_entries(owner, Some(folder)).await.unwrap();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].name, "nested.txt");
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let pool = db::connect_in_memory().await.unwrap();
        let catalog = SqlCatalog::new(pool);
        let err = catalog
            .create_entry(NewFileEntry {
                owner_id: Uuid::new_v4(),
                parent_id: None,
                name: "   ".into(),
                object_id: Uuid::new_v4(),
                size_bytes: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
