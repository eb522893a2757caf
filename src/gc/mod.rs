//! Garbage collection of orphaned remote resources.
//!
//! Every resource a runtime creates is named after its instance id
//! (`faast-{uuid}...`). A sweep lists what exists, keeps resources whose
//! owner is not the caller, that are older than the retention period and
//! show no recent use, and deletes them group by group in dependency order.
//! Deleting something that is already gone counts as success, so sweeps are
//! idempotent.

mod coordinator;
mod directory;
mod inventory;

pub use coordinator::{GcCoordinator, SweepReport};
pub use directory::DirectoryInventory;
pub use inventory::{DeleteOutcome, InventoryPage, ResourceInventory};

#[cfg(test)]
pub use inventory::MockResourceInventory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::RESOURCE_PREFIX;
use crate::types::InstanceId;

/// Kind of a remote resource, in the order resources are torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Subscription,
    ResponseQueue,
    RequestTopic,
    LogGroup,
    Role,
    Function,
}

impl ResourceKind {
    /// Position in a group's deletion sequence. Dependents go first, the
    /// function itself last.
    pub fn delete_order(self) -> u8 {
        match self {
            ResourceKind::Subscription => 0,
            ResourceKind::ResponseQueue => 1,
            ResourceKind::RequestTopic => 2,
            ResourceKind::LogGroup => 3,
            ResourceKind::Role => 4,
            ResourceKind::Function => 5,
        }
    }
}

/// One listed resource. Rebuilt on every sweep, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub created_at: DateTime<Utc>,
    /// Bytes still stored (e.g. logs); non-zero means recently used.
    #[serde(default)]
    pub stored_bytes: Option<u64>,
}

/// Maps resource names to the runtime instance that owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNaming {
    prefix: String,
}

impl Default for ResourceNaming {
    fn default() -> Self {
        Self::new(RESOURCE_PREFIX)
    }
}

impl ResourceNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Name of a resource owned by `instance_id`, with an optional suffix.
    pub fn name_for(&self, instance_id: &InstanceId, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}{}-{}", self.prefix, instance_id, suffix),
            None => format!("{}{}", self.prefix, instance_id),
        }
    }

    /// Owning instance of a resource, if the name follows the pattern.
    ///
    /// The prefix starts the name or follows a `/` (log group names), and
    /// is followed by a UUID that ends the name or a `-` suffix.
    pub fn owner_of(&self, resource_id: &str) -> Option<InstanceId> {
        std::iter::once(resource_id)
            .chain(resource_id.match_indices('/').map(|(i, _)| &resource_id[i + 1..]))
            .find_map(|tail| self.parse_owned(tail))
    }

    fn parse_owned(&self, name: &str) -> Option<InstanceId> {
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let candidate = rest.get(..36)?;
        if !matches!(rest.as_bytes().get(36), None | Some(b'-')) {
            return None;
        }
        let uuid = uuid::Uuid::parse_str(candidate).ok()?;
        Some(InstanceId::from_uuid(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_of_parses_instance() {
        let naming = ResourceNaming::default();
        let id = InstanceId::from_uuid(uuid::Uuid::new_v4());
        assert_eq!(naming.owner_of(&naming.name_for(&id, None)), Some(id.clone()));
        assert_eq!(
            naming.owner_of(&naming.name_for(&id, Some("Responses"))),
            Some(id.clone())
        );
        assert_eq!(
            naming.owner_of(&format!("/aws/lambda/faast-{}", id)),
            Some(id)
        );
    }

    #[test]
    fn test_owner_of_rejects_foreign_names() {
        let naming = ResourceNaming::default();
        assert_eq!(naming.owner_of("my-function"), None);
        assert_eq!(naming.owner_of("faast-not-a-uuid-at-all-000000000000000"), None);
        assert_eq!(naming.owner_of("faast-1234"), None);
    }

    #[test]
    fn test_owner_of_requires_prefix_at_segment_start() {
        let naming = ResourceNaming::default();
        let id = InstanceId::from_uuid(uuid::Uuid::new_v4());
        assert_eq!(naming.owner_of(&format!("notfaast-{}", id)), None);
        assert_eq!(naming.owner_of(&format!("x-faast-{}", id)), None);
        assert_eq!(naming.owner_of(&format!("/logs/notfaast-{}", id)), None);
        assert_eq!(naming.owner_of(&format!("faast-{}0", id)), None);
        assert_eq!(
            naming.owner_of(&format!("/aws/lambda/faast-{}-Responses", id)),
            Some(id)
        );
    }

    #[test]
    fn test_delete_order_puts_function_last() {
        let mut kinds = vec![
            ResourceKind::Function,
            ResourceKind::LogGroup,
            ResourceKind::Subscription,
            ResourceKind::Role,
            ResourceKind::RequestTopic,
            ResourceKind::ResponseQueue,
        ];
        kinds.sort_by_key(|kind| kind.delete_order());
        assert_eq!(kinds.first(), Some(&ResourceKind::Subscription));
        assert_eq!(kinds.last(), Some(&ResourceKind::Function));
    }
}
