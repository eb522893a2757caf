//! Inventory of per-instance working directories.
//!
//! The subprocess backend keeps one directory per runtime instance under a
//! shared base directory. Directories left behind by crashed runtimes are
//! collected like any other remote resource.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::PathBuf;

use super::inventory::{DeleteOutcome, InventoryPage, ResourceInventory};
use super::{ResourceKind, ResourceRecord};
use crate::types::{Error, Result};

/// Lists the subdirectories of a base directory as function resources.
#[derive(Debug, Clone)]
pub struct DirectoryInventory {
    base: PathBuf,
}

impl DirectoryInventory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl ResourceInventory for DirectoryInventory {
    async fn list_page(&self, _page_token: Option<String>) -> Result<InventoryPage> {
        let mut entries = match tokio::fs::read_dir(&self.base).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(InventoryPage::default());
            }
            Err(err) => return Err(err.into()),
        };

        let mut resources = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let created_at: DateTime<Utc> = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            resources.push(ResourceRecord {
                resource_id: name,
                kind: ResourceKind::Function,
                created_at,
                stored_bytes: None,
            });
        }
        Ok(InventoryPage {
            resources,
            next_token: None,
        })
    }

    async fn delete(&self, resource: &ResourceRecord) -> Result<DeleteOutcome> {
        if resource.resource_id.contains(['/', '\\']) || resource.resource_id.starts_with('.') {
            return Err(Error::validation(format!(
                "refusing to delete {} outside the inventory",
                resource.resource_id
            )));
        }
        match tokio::fs::remove_dir_all(self.base.join(&resource.resource_id)).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::AlreadyGone),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lists_directories_only() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("faast-a")).unwrap();
        std::fs::write(base.path().join("note.txt"), b"x").unwrap();

        let inventory = DirectoryInventory::new(base.path());
        let page = inventory.list_page(None).await.unwrap();
        assert_eq!(page.resources.len(), 1);
        assert_eq!(page.resources[0].resource_id, "faast-a");
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn test_delete_twice_is_already_gone() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("faast-b")).unwrap();
        let inventory = DirectoryInventory::new(base.path());
        let record = inventory.list_page(None).await.unwrap().resources.remove(0);

        assert_eq!(inventory.delete(&record).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(
            inventory.delete(&record).await.unwrap(),
            DeleteOutcome::AlreadyGone
        );
    }

    #[tokio::test]
    async fn test_missing_base_lists_nothing() {
        let base = tempfile::tempdir().unwrap();
        let inventory = DirectoryInventory::new(base.path().join("absent"));
        assert!(inventory.list_page(None).await.unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn test_refuses_path_traversal() {
        let base = tempfile::tempdir().unwrap();
        let inventory = DirectoryInventory::new(base.path());
        let record = ResourceRecord {
            resource_id: "../etc".to_string(),
            kind: ResourceKind::Function,
            created_at: Utc::now(),
            stored_bytes: None,
        };
        assert!(inventory.delete(&record).await.is_err());
    }
}
