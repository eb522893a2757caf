//! Listing and deleting remote resources.

use async_trait::async_trait;

use super::ResourceRecord;
use crate::types::Result;

/// One page of a resource listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryPage {
    pub resources: Vec<ResourceRecord>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Result of deleting one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// Backend-specific access to the resources a sweep may collect.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceInventory: Send + Sync {
    /// List one page of resources, starting after `page_token`.
    async fn list_page(&self, page_token: Option<String>) -> Result<InventoryPage>;

    /// Delete a resource. Deleting something that no longer exists must
    /// succeed with [`DeleteOutcome::AlreadyGone`] or a not-found error.
    async fn delete(&self, resource: &ResourceRecord) -> Result<DeleteOutcome>;
}
