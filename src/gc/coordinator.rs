//! Sweep scheduling and execution.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::inventory::{DeleteOutcome, ResourceInventory};
use super::{ResourceNaming, ResourceRecord};
use crate::throttle::{Funnel, RateLimitConfig, RateLimiter};
use crate::types::{ErrorKind, GcConfig, GcMode, InstanceId, Result};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Resources returned by the listing.
    pub listed: usize,
    /// Resources selected for deletion.
    pub candidates: usize,
    /// Owning instances the candidates belong to.
    pub groups: usize,
    pub deleted: usize,
    pub already_gone: usize,
    /// Deletes (or listing pages) that failed; retried by a later sweep.
    pub failed: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct GroupOutcome {
    deleted: usize,
    already_gone: usize,
    failed: usize,
}

/// Persisted timestamp of the last sweep.
#[derive(Debug, Serialize, Deserialize)]
struct GcState {
    last_gc: DateTime<Utc>,
}

/// Process-wide garbage collection coordinator. Share it by `Arc`.
///
/// Owns the sweep-in-progress flag, the last-run timestamp, and the funnel
/// and rate limiter that pace deletes.
#[derive(Debug)]
pub struct GcCoordinator {
    config: GcConfig,
    naming: ResourceNaming,
    running: AtomicBool,
    last_run: Mutex<Option<DateTime<Utc>>>,
    funnel: Funnel,
    limiter: RateLimiter,
}

/// Clears the running flag when a sweep ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl GcCoordinator {
    pub fn new(config: GcConfig) -> Self {
        Self::with_naming(config, ResourceNaming::default())
    }

    pub fn with_naming(config: GcConfig, naming: ResourceNaming) -> Self {
        let funnel = Funnel::new(config.concurrency.max(1));
        let limiter = RateLimiter::new(RateLimitConfig {
            rate_per_second: config.rate_per_second,
            burst: config.burst,
        });
        Self {
            config,
            naming,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            funnel,
            limiter,
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sweep if the mode and schedule allow it.
    ///
    /// Returns `None` when GC is off, not yet due, or another sweep is in
    /// progress. Never fails.
    pub async fn maybe_sweep(
        &self,
        inventory: &dyn ResourceInventory,
        exclude: Option<&InstanceId>,
    ) -> Option<SweepReport> {
        if self.config.mode == GcMode::Off {
            tracing::debug!("gc_skipped: reason=off");
            return None;
        }
        let _guard = self.claim()?;

        if self.config.mode == GcMode::Auto {
            let now = Utc::now();
            if !self.is_due(now).await {
                tracing::debug!("gc_skipped: reason=not_due");
                return None;
            }
            self.record_run(now).await;
        }
        Some(self.run_sweep(inventory, exclude).await)
    }

    /// Sweep now regardless of mode. `None` if another sweep is running.
    pub async fn sweep(
        &self,
        inventory: &dyn ResourceInventory,
        exclude: Option<&InstanceId>,
    ) -> Option<SweepReport> {
        let _guard = self.claim()?;
        Some(self.run_sweep(inventory, exclude).await)
    }

    fn claim(&self) -> Option<RunningGuard<'_>> {
        match self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Some(RunningGuard(&self.running)),
            Err(_) => {
                tracing::debug!("gc_skipped: reason=in_progress");
                None
            }
        }
    }

    /// Whether the last recorded sweep is older than the auto interval.
    /// A missing or unreadable timestamp means due.
    async fn is_due(&self, now: DateTime<Utc>) -> bool {
        let last = match &self.config.state_file {
            Some(path) => read_state(path).await,
            None => self.last_recorded(),
        };
        let Some(last) = last else {
            return true;
        };
        let interval = chrono::Duration::from_std(self.config.auto_interval)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        now - last >= interval
    }

    fn last_recorded(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock()
    }

    async fn record_run(&self, at: DateTime<Utc>) {
        *self.last_run.lock() = Some(at);
        if let Some(path) = &self.config.state_file {
            if let Err(err) = write_state(path, at).await {
                tracing::warn!("gc_state_write_failed: path={}, error={}", path.display(), err);
            }
        }
    }

    async fn run_sweep(
        &self,
        inventory: &dyn ResourceInventory,
        exclude: Option<&InstanceId>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        let mut resources = Vec::new();
        let mut token = None;
        loop {
            match inventory.list_page(token.take()).await {
                Ok(page) => {
                    resources.extend(page.resources);
                    match page.next_token {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
                Err(err) => {
                    tracing::warn!("gc_list_failed: error={}", err);
                    report.failed += 1;
                    break;
                }
            }
        }
        report.listed = resources.len();

        let groups = self.select_candidates(resources, exclude, Utc::now());
        report.groups = groups.len();
        report.candidates = groups.values().map(Vec::len).sum();
        tracing::info!(
            "gc_sweep_started: listed={}, candidates={}, groups={}",
            report.listed,
            report.candidates,
            report.groups
        );

        let work = groups.into_iter().map(|(owner, group)| {
            let limiter = &self.limiter;
            async move {
                let outcome = self
                    .funnel
                    .push(|| limiter.push(|| async { Ok(delete_group(inventory, &owner, group).await) }))
                    .await;
                outcome.unwrap_or_else(|err| {
                    tracing::warn!("gc_group_skipped: owner={}, error={}", owner, err);
                    GroupOutcome {
                        failed: 1,
                        ..Default::default()
                    }
                })
            }
        });
        for outcome in join_all(work).await {
            report.deleted += outcome.deleted;
            report.already_gone += outcome.already_gone;
            report.failed += outcome.failed;
        }

        report.completed_at = Some(Utc::now());
        tracing::info!(
            "gc_sweep_completed: deleted={}, already_gone={}, failed={}",
            report.deleted,
            report.already_gone,
            report.failed
        );
        report
    }

    /// Stale resources of other instances, grouped by owner and sorted into
    /// deletion order.
    fn select_candidates(
        &self,
        resources: Vec<ResourceRecord>,
        exclude: Option<&InstanceId>,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, Vec<ResourceRecord>> {
        let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
        let mut groups: BTreeMap<String, Vec<ResourceRecord>> = BTreeMap::new();
        for resource in resources {
            let Some(owner) = self.naming.owner_of(&resource.resource_id) else {
                continue;
            };
            if exclude == Some(&owner) {
                continue;
            }
            if resource.created_at > cutoff || resource.stored_bytes.unwrap_or(0) > 0 {
                continue;
            }
            groups.entry(owner.to_string()).or_default().push(resource);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|resource| resource.kind.delete_order());
        }
        groups
    }
}

/// Delete one owner's resources in order. A failure leaves the rest of the
/// group for a later sweep.
async fn delete_group(
    inventory: &dyn ResourceInventory,
    owner: &str,
    group: Vec<ResourceRecord>,
) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();
    for resource in &group {
        match inventory.delete(resource).await {
            Ok(DeleteOutcome::Deleted) => {
                tracing::debug!("gc_deleted: resource={}", resource.resource_id);
                outcome.deleted += 1;
            }
            Ok(DeleteOutcome::AlreadyGone) => outcome.already_gone += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => outcome.already_gone += 1,
            Err(err) => {
                tracing::warn!(
                    "gc_delete_failed: owner={}, resource={}, error={}",
                    owner,
                    resource.resource_id,
                    err
                );
                outcome.failed += 1;
                break;
            }
        }
    }
    outcome
}

async fn read_state(path: &Path) -> Option<DateTime<Utc>> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice::<GcState>(&raw) {
        Ok(state) => Some(state.last_gc),
        Err(err) => {
            tracing::debug!("gc_state_unreadable: path={}, error={}", path.display(), err);
            None
        }
    }
}

async fn write_state(path: &Path, at: DateTime<Utc>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec(&GcState { last_gc: at })?;
    tokio::fs::write(path, body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{InventoryPage, MockResourceInventory, ResourceKind};
    use crate::types::Error;
    use mockall::Sequence;

    fn stale(owner: &InstanceId, suffix: &str, kind: ResourceKind) -> ResourceRecord {
        ResourceRecord {
            resource_id: format!("faast-{}-{}", owner, suffix),
            kind,
            created_at: Utc::now() - chrono::Duration::days(3),
            stored_bytes: None,
        }
    }

    fn coordinator(mode: GcMode) -> GcCoordinator {
        GcCoordinator::new(GcConfig {
            mode,
            rate_per_second: 1000.0,
            ..GcConfig::default()
        })
    }

    #[tokio::test]
    async fn test_deletes_group_in_order() {
        let owner = InstanceId::new();
        let resources = vec![
            stale(&owner, "fn", ResourceKind::Function),
            stale(&owner, "responses", ResourceKind::ResponseQueue),
            stale(&owner, "sub", ResourceKind::Subscription),
        ];

        let mut inventory = MockResourceInventory::new();
        inventory.expect_list_page().times(1).returning(move |_| {
            Ok(InventoryPage {
                resources: resources.clone(),
                next_token: None,
            })
        });
        let mut seq = Sequence::new();
        for kind in [
            ResourceKind::Subscription,
            ResourceKind::ResponseQueue,
            ResourceKind::Function,
        ] {
            inventory
                .expect_delete()
                .withf(move |resource| resource.kind == kind)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(DeleteOutcome::Deleted));
        }

        let report = coordinator(GcMode::On)
            .sweep(&inventory, None)
            .await
            .unwrap();
        assert_eq!(report.candidates, 3);
        assert_eq!(report.groups, 1);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_skips_fresh_used_foreign_and_own_resources() {
        let own = InstanceId::new();
        let other = InstanceId::new();
        let mut fresh = stale(&other, "fresh", ResourceKind::Function);
        fresh.created_at = Utc::now();
        let mut used = stale(&other, "logs", ResourceKind::LogGroup);
        used.stored_bytes = Some(512);
        let foreign = ResourceRecord {
            resource_id: "someone-elses-function".to_string(),
            ..stale(&other, "x", ResourceKind::Function)
        };
        let mine = stale(&own, "fn", ResourceKind::Function);
        let listing = vec![fresh, used, foreign, mine];

        let mut inventory = MockResourceInventory::new();
        inventory.expect_list_page().returning(move |_| {
            Ok(InventoryPage {
                resources: listing.clone(),
                next_token: None,
            })
        });
        inventory.expect_delete().never();

        let report = coordinator(GcMode::On)
            .sweep(&inventory, Some(&own))
            .await
            .unwrap();
        assert_eq!(report.listed, 4);
        assert_eq!(report.candidates, 0);
    }

    #[tokio::test]
    async fn test_failure_skips_rest_of_group_only() {
        let broken = InstanceId::new();
        let healthy = InstanceId::new();
        let listing = vec![
            stale(&broken, "sub", ResourceKind::Subscription),
            stale(&broken, "fn", ResourceKind::Function),
            stale(&healthy, "fn", ResourceKind::Function),
        ];
        let broken_prefix = format!("faast-{}", broken);

        let mut inventory = MockResourceInventory::new();
        inventory.expect_list_page().returning(move |_| {
            Ok(InventoryPage {
                resources: listing.clone(),
                next_token: None,
            })
        });
        inventory
            .expect_delete()
            .times(2)
            .returning(move |resource| {
                if resource.resource_id.starts_with(&broken_prefix) {
                    Err(Error::infrastructure("throttled by control plane"))
                } else {
                    Err(Error::not_found("already deleted"))
                }
            });

        let report = coordinator(GcMode::On)
            .sweep(&inventory, None)
            .await
            .unwrap();
        assert_eq!(report.groups, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.already_gone, 1);
        assert_eq!(report.deleted, 0);
    }

    #[tokio::test]
    async fn test_follows_pagination_and_survives_list_errors() {
        let owner = InstanceId::new();
        let first = stale(&owner, "a", ResourceKind::Function);
        let mut inventory = MockResourceInventory::new();
        inventory
            .expect_list_page()
            .withf(|token| token.is_none())
            .returning(move |_| {
                Ok(InventoryPage {
                    resources: vec![first.clone()],
                    next_token: Some("page-2".to_string()),
                })
            });
        inventory
            .expect_list_page()
            .withf(|token| token.as_deref() == Some("page-2"))
            .returning(|_| Err(Error::delivery("listing throttled")));
        inventory
            .expect_delete()
            .times(1)
            .returning(|_| Ok(DeleteOutcome::Deleted));

        let report = coordinator(GcMode::On)
            .sweep(&inventory, None)
            .await
            .unwrap();
        assert_eq!(report.listed, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_off_mode_never_lists() {
        let mut inventory = MockResourceInventory::new();
        inventory.expect_list_page().never();
        assert!(coordinator(GcMode::Off)
            .maybe_sweep(&inventory, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_auto_mode_runs_once_per_interval() {
        let mut inventory = MockResourceInventory::new();
        inventory.expect_list_page().times(1).returning(|_| Ok(InventoryPage::default()));
        let gc = coordinator(GcMode::Auto);
        assert!(gc.maybe_sweep(&inventory, None).await.is_some());
        assert!(gc.maybe_sweep(&inventory, None).await.is_none());
    }
}
